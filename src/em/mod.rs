//! Expectation-Maximization tissue classification
//!
//! - `gaussian`: per-class multivariate Gaussian in log-intensity space
//! - `bias`: polynomial bias field and its weighted regressor
//! - `prior`: atlas priors sampled at the foreground
//! - `warp`: prior warping checkpoints and the registration collaborator
//! - `segmenter`: the EM iterator tying everything together

pub mod bias;
pub mod gaussian;
pub mod prior;
pub mod segmenter;
pub mod warp;

use serde::Serialize;

pub use bias::{BiasField, BiasRegressor, BiasSolve, PolynomialBasis};
pub use gaussian::ClassModel;
pub use prior::PriorSet;
pub use segmenter::{ClassificationInputs, ClassificationResult, Segmenter};
pub use warp::{DeformationField, PriorWarper, WarpOutcome, WarpRequest};

/// Posterior probabilities never drop below this before renormalization
pub const POSTERIOR_FLOOR: f64 = 1e-10;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// Relative log-likelihood change fell below the tolerance
    Converged,
    /// Iteration limit reached; outputs are still valid
    MaxIterationsReached,
    /// The progress callback asked to stop
    Stopped,
}

/// A numerical problem that was recovered from without aborting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Degeneracy {
    /// Covariance was not positive-definite and was reset to the floor
    CovarianceReset { iteration: usize, class: usize },
    /// Bias normal equations were ill-conditioned and solved with a ridge
    BiasRidge { iteration: usize, channel: usize, condition: f64 },
    /// Bias regression had no weight; the previous field was kept
    BiasSkipped { iteration: usize, channel: usize },
    /// A class has had too little posterior mass for several iterations
    ClassLostSupport { iteration: usize, class: usize, mass: f64 },
}

/// Progress of one EM iteration, passed to the progress callback
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    /// Total log-likelihood of this E-step
    pub log_likelihood: f64,
    /// Relative change from the previous E-step, `None` right after a reset
    pub relative_change: Option<f64>,
    /// The priors were warped just before this E-step
    pub warped: bool,
}
