//! ABC-core: atlas-based tissue classification
//!
//! Classifies multi-channel 3D volumes into tissue classes with an
//! Expectation-Maximization mixture of Gaussians in log-intensity space,
//! guided by spatial atlas priors and corrected for a smooth polynomial
//! bias field per channel.
//!
//! # Modules
//! - `em`: EM iterator, class models, bias regressor, priors, prior warping
//! - `kmeans`: k-means initial estimator (brute force or k-d tree)
//! - `samples`: foreground sample matrix
//! - `output`: label volume, posterior export, corrected images
//! - `config`: run parameters
//! - `volume`: dense volumes and voxel-grid geometry
//! - `utils`: intensity rescaling, masks
//! - `nifti_io`: NIfTI-1 reading and writing

// Core modules
pub mod config;
pub mod error;
pub mod parallel;
pub mod volume;

// Algorithm modules
pub mod em;
pub mod kmeans;
pub mod output;
pub mod samples;
pub mod utils;

// I/O modules
pub mod nifti_io;

pub use config::{ClassificationParams, InitialEstimator, KMeansParams, WarpParams};
pub use em::{
    ClassificationInputs, ClassificationResult, Degeneracy, IterationReport, PriorWarper, RunStatus, Segmenter,
};
pub use error::{AbcError, Result};
pub use output::PosteriorSelection;
pub use volume::{Geometry, Mask, Volume};
