//! Spatial class priors sampled at the foreground voxels

use tracing::debug;

use crate::error::{AbcError, Result};
use crate::samples::SampleMatrix;
use crate::volume::Volume;

/// Priors that vary less than this over the foreground count as constant
const CONSTANT_PRIOR_TOLERANCE: f64 = 1e-6;

/// Normalized atlas priors at every foreground sample
///
/// Per sample the probabilities sum to 1. Voxels where every prior is zero
/// (or non-finite) fall back to a uniform distribution. The per-class weights
/// scale the priors inside the E-step and are not renormalized.
#[derive(Debug, Clone)]
pub struct PriorSet {
    num_classes: usize,
    /// Normalized probabilities, sample-major (`num_samples * num_classes`)
    probabilities: Vec<f64>,
    /// `ln(w_k * pi_k)`, sample-major
    log_weighted: Vec<f64>,
    weights: Vec<f64>,
}

impl PriorSet {
    /// Sample and normalize `priors` at the foreground of `samples`
    pub fn from_volumes(priors: &[Volume<f64>], samples: &SampleMatrix, weights: &[f64]) -> Result<Self> {
        let k = priors.len();
        if weights.len() != k {
            return Err(AbcError::config(format!("{} prior weights for {} priors", weights.len(), k)));
        }
        for (c, prior) in priors.iter().enumerate() {
            samples.geometry.ensure_matches(&prior.geometry, &format!("prior {}", c))?;
        }

        let n = samples.num_samples();
        let mut probabilities = vec![0.0; n * k];
        let mut fallback = 0usize;
        for (s, &index) in samples.indices.iter().enumerate() {
            let row = &mut probabilities[s * k..(s + 1) * k];
            let mut sum = 0.0;
            for (p, prior) in row.iter_mut().zip(priors) {
                let v = prior.data[index];
                *p = if v.is_finite() && v > 0.0 { v } else { 0.0 };
                sum += *p;
            }
            if sum > 0.0 {
                row.iter_mut().for_each(|p| *p /= sum);
            } else {
                row.iter_mut().for_each(|p| *p = 1.0 / k as f64);
                fallback += 1;
            }
        }
        if fallback > 0 {
            debug!(voxels = fallback, "foreground voxels without prior support use a uniform prior");
        }

        let mut set = Self { num_classes: k, probabilities, log_weighted: Vec::new(), weights: weights.to_vec() };
        set.refresh_log_weighted();
        Ok(set)
    }

    fn refresh_log_weighted(&mut self) {
        let k = self.num_classes;
        self.log_weighted = self
            .probabilities
            .iter()
            .enumerate()
            .map(|(i, &p)| (self.weights[i % k] * p).ln())
            .collect();
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_samples(&self) -> usize {
        if self.num_classes == 0 {
            0
        } else {
            self.probabilities.len() / self.num_classes
        }
    }

    /// Normalized priors of sample `s`
    #[inline]
    pub fn probabilities(&self, s: usize) -> &[f64] {
        &self.probabilities[s * self.num_classes..(s + 1) * self.num_classes]
    }

    /// All normalized priors, sample-major
    pub fn as_slice(&self) -> &[f64] {
        &self.probabilities
    }

    /// `ln(w_k * pi_k(x))` of sample `s`; `-inf` where the prior is zero
    #[inline]
    pub fn log_weighted(&self, s: usize) -> &[f64] {
        &self.log_weighted[s * self.num_classes..(s + 1) * self.num_classes]
    }

    /// False when every class prior is constant over the foreground
    pub fn is_informative(&self) -> bool {
        let k = self.num_classes;
        (0..k).any(|c| {
            let (lo, hi) = self
                .probabilities
                .iter()
                .skip(c)
                .step_by(k)
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &p| (lo.min(p), hi.max(p)));
            hi - lo > CONSTANT_PRIOR_TOLERANCE
        })
    }
}
