//! Classification parameters
//!
//! A single immutable record, validated once before a run starts.

use serde::{Deserialize, Serialize};

use crate::error::{AbcError, Result};

/// Default seed of the run's random generator
pub const DEFAULT_SEED: u64 = 87584359;

/// How the class Gaussians are seeded before the first E-step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitialEstimator {
    /// Cluster the uncorrected log-intensities with k-means
    #[serde(alias = "kmeans")]
    KMeans,
    /// Prior-weighted moments of the log-intensities
    PriorWeightedMoments,
}

/// K-means initialization parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KMeansParams {
    /// Number of random restarts (default 5)
    pub num_starts: usize,
    /// Lloyd iterations per restart (default 100)
    pub max_iterations: usize,
    /// Use a k-d tree over the centers for nearest-center queries
    pub use_kd_tree: bool,
    /// Maximum number of foreground samples clustered (default 50000)
    pub max_samples: usize,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            num_starts: 5,
            max_iterations: 100,
            use_kd_tree: false,
            max_samples: 50_000,
        }
    }
}

/// Atlas warping parameters, forwarded to the registration collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpParams {
    pub enabled: bool,
    /// Warp every `interval` EM iterations (default 10)
    pub interval: usize,
    /// Fluid registration iterations per checkpoint (default 10)
    pub fluid_iterations: usize,
    /// Maximum fluid displacement per step in voxels (default 0.5)
    pub fluid_max_step: f64,
    /// Fluid kernel width (default 1.0)
    pub kernel_width: f64,
}

impl Default for WarpParams {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 10,
            fluid_iterations: 10,
            fluid_max_step: 0.5,
            kernel_width: 1.0,
        }
    }
}

/// Parameters of an EM classification run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationParams {
    /// Maximum number of EM iterations (default 40)
    pub max_iterations: usize,
    /// Relative log-likelihood change below which the run has converged
    pub convergence_tolerance: f64,
    /// Maximum total degree of the bias polynomial (default 4)
    pub max_bias_degree: usize,
    /// Per-class prior scale factors; empty means all 1.0
    pub prior_weights: Vec<f64>,
    pub initial_estimator: InitialEstimator,
    pub kmeans: KMeansParams,
    pub warp: WarpParams,
    /// Worker threads, fixed for the whole run
    pub num_threads: usize,
    pub seed: u64,
    /// Smallest allowed covariance eigenvalue (log-intensity units squared)
    pub variance_floor: f64,
    /// Posterior mass below which a class counts as having lost support
    pub min_class_support: f64,
    /// Consecutive unsupported iterations before a warning is raised
    pub support_patience: usize,
    /// Condition number above which the bias system is ridge-regularized
    pub bias_condition_limit: f64,
    /// Linear rescale of each input channel before classification
    pub intensity_rescale: Option<[f64; 2]>,
}

impl Default for ClassificationParams {
    fn default() -> Self {
        Self {
            max_iterations: 40,
            convergence_tolerance: 1e-5,
            max_bias_degree: 4,
            prior_weights: Vec::new(),
            initial_estimator: InitialEstimator::PriorWeightedMoments,
            kmeans: KMeansParams::default(),
            warp: WarpParams::default(),
            num_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            seed: DEFAULT_SEED,
            variance_floor: 1e-6,
            min_class_support: 1.0,
            support_patience: 3,
            bias_condition_limit: 1e10,
            intensity_rescale: Some([1.0, 4096.0]),
        }
    }
}

impl ClassificationParams {
    /// Check parameter values for a run with `num_classes` classes
    pub fn validate(&self, num_classes: usize) -> Result<()> {
        if num_classes < 2 {
            return Err(AbcError::config(format!(
                "at least 2 classes (prior volumes) are required, got {}",
                num_classes
            )));
        }
        if num_classes > u8::MAX as usize {
            return Err(AbcError::config(format!(
                "at most {} classes are supported, got {}",
                u8::MAX,
                num_classes
            )));
        }
        if self.max_iterations == 0 {
            return Err(AbcError::config("max_iterations must be at least 1"));
        }
        if !(self.convergence_tolerance.is_finite() && self.convergence_tolerance >= 0.0) {
            return Err(AbcError::config("convergence_tolerance must be finite and non-negative"));
        }
        if self.max_bias_degree > 10 {
            return Err(AbcError::config(format!(
                "max_bias_degree {} is too large (maximum 10)",
                self.max_bias_degree
            )));
        }
        if !self.prior_weights.is_empty() {
            if self.prior_weights.len() != num_classes {
                return Err(AbcError::config(format!(
                    "{} prior weights given for {} classes",
                    self.prior_weights.len(),
                    num_classes
                )));
            }
            if self.prior_weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(AbcError::config("prior weights must be finite and non-negative"));
            }
            if self.prior_weights.iter().all(|&w| w == 0.0) {
                return Err(AbcError::config("at least one prior weight must be positive"));
            }
        }
        if self.num_threads == 0 {
            return Err(AbcError::config("num_threads must be at least 1"));
        }
        if self.kmeans.num_starts == 0 || self.kmeans.max_iterations == 0 {
            return Err(AbcError::config("k-means needs at least one start and one iteration"));
        }
        if self.kmeans.max_samples < num_classes {
            return Err(AbcError::config("kmeans.max_samples must be at least the class count"));
        }
        if !(self.variance_floor.is_finite() && self.variance_floor > 0.0) {
            return Err(AbcError::config("variance_floor must be positive"));
        }
        if !(self.min_class_support.is_finite() && self.min_class_support >= 0.0) {
            return Err(AbcError::config("min_class_support must be non-negative"));
        }
        if !(self.bias_condition_limit.is_finite() && self.bias_condition_limit > 1.0) {
            return Err(AbcError::config("bias_condition_limit must be greater than 1"));
        }
        if let Some([lo, hi]) = self.intensity_rescale {
            if !(lo.is_finite() && hi.is_finite() && lo > 0.0 && hi > lo) {
                return Err(AbcError::config(format!(
                    "intensity_rescale range [{}, {}] must be positive and increasing",
                    lo, hi
                )));
            }
        }
        if self.warp.enabled {
            if self.warp.interval == 0 {
                return Err(AbcError::config("warp.interval must be at least 1"));
            }
            if !(self.warp.fluid_max_step > 0.0 && self.warp.kernel_width > 0.0) {
                return Err(AbcError::config("warp step and kernel width must be positive"));
            }
        }
        Ok(())
    }

    /// Prior weight of class `k`
    pub fn prior_weight(&self, k: usize) -> f64 {
        self.prior_weights.get(k).copied().unwrap_or(1.0)
    }

    /// Parse parameters from JSON, missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| AbcError::config(format!("invalid parameter JSON: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| AbcError::config(format!("cannot serialize parameters: {}", e)))
    }
}
