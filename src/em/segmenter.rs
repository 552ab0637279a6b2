//! EM iterator
//!
//! Runs the classification as a fixed-point iteration:
//!
//! 1. Initialize class Gaussians from prior-weighted moments, or from k-means
//!    when asked to or when the priors do not vary over the foreground.
//! 2. E-step: posteriors `p_k ∝ w_k pi_k(x) N(y - b(x) | mu_k, S_k)` in the
//!    log domain, floored and renormalized. The log-sum-exp of every voxel is
//!    its log-likelihood.
//! 3. Stop when the relative log-likelihood change is below the tolerance.
//! 4. M-step: class means, covariances and mixing weights, then the bias
//!    field of every channel.
//! 5. Every `warp.interval` iterations the priors are re-registered by the
//!    external warper before the E-step.
//!
//! All per-sample work runs on a dedicated rayon pool in fixed chunks, so
//! results do not depend on the thread count.

use std::ops::ControlFlow;

use nalgebra::DMatrix;
use ndarray::Axis;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::{ClassificationParams, InitialEstimator};
use crate::em::bias::{BiasField, BiasRegressor, BiasSolve, PolynomialBasis};
use crate::em::gaussian::{ClassModel, CovarianceRepair};
use crate::em::prior::PriorSet;
use crate::em::warp::{DeformationField, PriorWarper, WarpController};
use crate::em::{Degeneracy, IterationReport, RunStatus, POSTERIOR_FLOOR};
use crate::error::{AbcError, Result};
use crate::kmeans::KMeansEstimator;
use crate::output::{self, PosteriorSelection};
use crate::parallel::{self, add_assign};
use crate::samples::SampleMatrix;
use crate::utils::intensity::rescale_intensity;
use crate::volume::{Mask, Volume};

/// Volumes handed to a run; all must share the mask's grid
#[derive(Debug, Clone)]
pub struct ClassificationInputs {
    /// One co-registered intensity volume per channel
    pub images: Vec<Volume<f64>>,
    pub mask: Mask,
    /// One prior probability volume per class
    pub priors: Vec<Volume<f64>>,
    /// Atlas template, required when warping is enabled
    pub template: Option<Volume<f64>>,
}

/// Everything a finished run produces
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub status: RunStatus,
    /// Number of E-steps performed
    pub iterations: usize,
    /// Total log-likelihood of every E-step
    pub log_likelihoods: Vec<f64>,
    /// Iterations whose E-step ran on freshly warped priors
    pub warp_iterations: Vec<usize>,
    pub classes: Vec<ClassModel>,
    pub bias: BiasField,
    pub degeneracies: Vec<Degeneracy>,
    pub deformation: Option<DeformationField>,
    pub warped_template: Option<Volume<f64>>,
    samples: SampleMatrix,
    posteriors: Vec<f64>,
    channels: Vec<Volume<f64>>,
}

impl ClassificationResult {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn samples(&self) -> &SampleMatrix {
        &self.samples
    }

    /// Posteriors of every foreground sample, sample-major
    pub fn posteriors(&self) -> &[f64] {
        &self.posteriors
    }

    /// Discrete labels: 0 outside the mask, class index + 1 inside
    pub fn labels(&self) -> Volume<u8> {
        output::label_volume(&self.samples, &self.posteriors, self.num_classes())
    }

    /// Dense posterior volumes
    pub fn posterior_volumes(&self, selection: PosteriorSelection) -> Vec<Volume<f64>> {
        output::posterior_volumes(&self.samples, &self.posteriors, self.num_classes(), selection)
    }

    /// Input channels (after intensity rescaling) with the bias removed
    pub fn corrected_images(&self) -> Vec<Volume<f64>> {
        output::corrected_images(&self.channels, &self.bias)
    }
}

/// Atlas-based EM tissue classifier
///
/// # Example
/// ```ignore
/// let mut segmenter = Segmenter::new(params);
/// let result = segmenter.run(inputs)?;
/// let labels = result.labels();
/// ```
pub struct Segmenter<'w> {
    params: ClassificationParams,
    warper: Option<&'w mut dyn PriorWarper>,
}

impl<'w> Segmenter<'w> {
    pub fn new(params: ClassificationParams) -> Self {
        Self { params, warper: None }
    }

    /// Registration collaborator used at warp checkpoints
    pub fn with_warper(mut self, warper: &'w mut dyn PriorWarper) -> Self {
        self.warper = Some(warper);
        self
    }

    /// Run to convergence or the iteration limit
    pub fn run(&mut self, inputs: ClassificationInputs) -> Result<ClassificationResult> {
        self.run_with_progress(inputs, |_| ControlFlow::Continue(()))
    }

    /// Run, calling `progress` after every E-step
    ///
    /// Returning `ControlFlow::Break(())` stops the run before the next
    /// M-step; the result then has status [`RunStatus::Stopped`].
    pub fn run_with_progress<F>(&mut self, inputs: ClassificationInputs, mut progress: F) -> Result<ClassificationResult>
    where
        F: FnMut(&IterationReport) -> ControlFlow<()>,
    {
        let params = &self.params;
        let num_classes = inputs.priors.len();
        params.validate(num_classes)?;

        if params.warp.enabled {
            if self.warper.is_none() {
                return Err(AbcError::config("warping is enabled but no prior warper was given"));
            }
            match &inputs.template {
                Some(t) => inputs.mask.geometry.ensure_matches(&t.geometry, "template")?,
                None => return Err(AbcError::config("warping is enabled but no template was given")),
            }
        }

        let ClassificationInputs { images, mask, priors, template } = inputs;
        let channels: Vec<Volume<f64>> = match params.intensity_rescale {
            Some([lo, hi]) => images.iter().map(|img| rescale_intensity(img, lo, hi)).collect(),
            None => images,
        };
        let samples = SampleMatrix::build(&channels, &mask, None)?;
        if samples.num_samples() < num_classes {
            return Err(AbcError::InsufficientData(format!(
                "{} foreground voxels for {} classes",
                samples.num_samples(),
                num_classes
            )));
        }

        let weights: Vec<f64> = (0..num_classes).map(|k| params.prior_weight(k)).collect();
        let prior_set = PriorSet::from_volumes(&priors, &samples, &weights)?;
        drop(priors);

        info!(
            classes = num_classes,
            channels = samples.num_channels(),
            samples = samples.num_samples(),
            threads = params.num_threads,
            bias_degree = params.max_bias_degree,
            "starting EM classification"
        );

        let mut engine = Engine::new(params, samples, channels, prior_set, weights)?;
        let mut rng = StdRng::seed_from_u64(params.seed);
        engine.initialize(&mut rng)?;

        let warper = self.warper.as_deref_mut();
        engine.iterate(warper, template.as_ref(), &mut progress)
    }
}

/// Posterior-weighted class statistics
struct Moments {
    mass: Vec<f64>,
    means: Vec<Vec<f64>>,
    covariances: Vec<DMatrix<f64>>,
}

/// Bias-corrected log-intensities of sample `s`
#[inline]
fn corrected_row(samples: &SampleMatrix, bias: &BiasField, s: usize, phi: &mut [f64], out: &mut [f64]) {
    bias.evaluate_into(&samples.coords[s], phi, out);
    for (d, y) in out.iter_mut().enumerate() {
        *y = samples.values[[s, d]] - *y;
    }
}

/// Weighted means and covariances of the corrected samples
///
/// `weights` is sample-major with `num_classes` values per sample. Means
/// and covariances of a class with no mass are zero.
fn accumulate_moments(samples: &SampleMatrix, bias: &BiasField, weights: &[f64], num_classes: usize) -> Moments {
    let n = samples.num_samples();
    let c = samples.num_channels();
    let m = bias.basis().len();
    let k = num_classes;

    let first = parallel::map_reduce(
        n,
        vec![0.0; k * (c + 1)],
        |range| {
            let mut acc = vec![0.0; k * (c + 1)];
            let mut phi = vec![0.0; m];
            let mut y = vec![0.0; c];
            for s in range {
                corrected_row(samples, bias, s, &mut phi, &mut y);
                for j in 0..k {
                    let p = weights[s * k + j];
                    let base = j * (c + 1);
                    acc[base] += p;
                    for d in 0..c {
                        acc[base + 1 + d] += p * y[d];
                    }
                }
            }
            acc
        },
        add_assign,
    );

    let mass: Vec<f64> = (0..k).map(|j| first[j * (c + 1)]).collect();
    let means: Vec<Vec<f64>> = (0..k)
        .map(|j| {
            let base = j * (c + 1);
            (0..c)
                .map(|d| if mass[j] > 0.0 { first[base + 1 + d] / mass[j] } else { 0.0 })
                .collect()
        })
        .collect();

    let second = parallel::map_reduce(
        n,
        vec![0.0; k * c * c],
        |range| {
            let mut acc = vec![0.0; k * c * c];
            let mut phi = vec![0.0; m];
            let mut y = vec![0.0; c];
            for s in range {
                corrected_row(samples, bias, s, &mut phi, &mut y);
                for (j, mean) in means.iter().enumerate() {
                    let p = weights[s * k + j];
                    let base = j * c * c;
                    for r in 0..c {
                        let zr = p * (y[r] - mean[r]);
                        for col in r..c {
                            acc[base + r * c + col] += zr * (y[col] - mean[col]);
                        }
                    }
                }
            }
            acc
        },
        add_assign,
    );

    let covariances = (0..k)
        .map(|j| {
            let base = j * c * c;
            let mut cov = DMatrix::<f64>::zeros(c, c);
            if mass[j] > 0.0 {
                for r in 0..c {
                    for col in r..c {
                        let v = second[base + r * c + col] / mass[j];
                        cov[(r, col)] = v;
                        cov[(col, r)] = v;
                    }
                }
            }
            cov
        })
        .collect();

    Moments { mass, means, covariances }
}

/// E-step over all samples; returns the total log-likelihood
fn expectation(
    samples: &SampleMatrix,
    priors: &PriorSet,
    classes: &[ClassModel],
    bias: &BiasField,
    posteriors: &mut [f64],
) -> f64 {
    let k = classes.len();
    let c = samples.num_channels();
    let m = bias.basis().len();

    parallel::for_each_chunk_mut(
        posteriors,
        k,
        0.0,
        |range, out| {
            let mut phi = vec![0.0; m];
            let mut y = vec![0.0; c];
            let mut lq = vec![0.0; k];
            let mut ll = 0.0;

            for (local, s) in range.enumerate() {
                corrected_row(samples, bias, s, &mut phi, &mut y);
                let log_prior = priors.log_weighted(s);
                for (j, class) in classes.iter().enumerate() {
                    lq[j] = log_prior[j] + class.log_density(&y);
                }
                let mut max = lq.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                if max == f64::NEG_INFINITY {
                    // every weighted prior is zero here: likelihood only
                    for (j, class) in classes.iter().enumerate() {
                        lq[j] = class.log_density(&y);
                    }
                    max = lq.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                }
                let lse = max + lq.iter().map(|&v| (v - max).exp()).sum::<f64>().ln();
                ll += lse;

                let row = &mut out[local * k..(local + 1) * k];
                let mut total = 0.0;
                for (p, &v) in row.iter_mut().zip(&lq) {
                    *p = (v - lse).exp().max(POSTERIOR_FLOOR);
                    total += *p;
                }
                row.iter_mut().for_each(|p| *p /= total);
            }
            ll
        },
        |a, b| a + b,
    )
}

/// Match k-means clusters to classes
///
/// Returns the class of every cluster. Clusters are assigned greedily by
/// their average prior of each class; when the priors look the same in
/// every cluster, clusters are ordered by ascending first-channel mean.
fn match_clusters_to_classes(labels: &[usize], cluster_means: &ndarray::Array2<f64>, priors: &PriorSet) -> Vec<usize> {
    let k = priors.num_classes();
    let mut profile = vec![vec![0.0; k]; k];
    let mut counts = vec![0usize; k];
    for (s, &l) in labels.iter().enumerate() {
        for (acc, &p) in profile[l].iter_mut().zip(priors.probabilities(s)) {
            *acc += p;
        }
        counts[l] += 1;
    }
    for (row, &count) in profile.iter_mut().zip(&counts) {
        if count > 0 {
            row.iter_mut().for_each(|v| *v /= count as f64);
        }
    }

    let occupied: Vec<usize> = (0..k).filter(|&l| counts[l] > 0).collect();
    let distinguishable = (0..k).any(|class| {
        let (lo, hi) = occupied
            .iter()
            .map(|&l| profile[l][class])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        hi - lo > 1e-6
    });

    let mut mapping = vec![0usize; k];
    if !distinguishable {
        let mut order: Vec<usize> = (0..k).collect();
        order.sort_by(|&a, &b| cluster_means[[a, 0]].total_cmp(&cluster_means[[b, 0]]).then(a.cmp(&b)));
        for (class, &cluster) in order.iter().enumerate() {
            mapping[cluster] = class;
        }
        debug!(?mapping, "clusters matched to classes by intensity order");
        return mapping;
    }

    let mut pairs: Vec<(usize, usize)> = (0..k).flat_map(|l| (0..k).map(move |c| (l, c))).collect();
    pairs.sort_by(|a, b| profile[b.0][b.1].total_cmp(&profile[a.0][a.1]).then(a.cmp(b)));
    let mut cluster_done = vec![false; k];
    let mut class_done = vec![false; k];
    for (l, c) in pairs {
        if !cluster_done[l] && !class_done[c] {
            mapping[l] = c;
            cluster_done[l] = true;
            class_done[c] = true;
        }
    }
    debug!(?mapping, "clusters matched to classes by prior overlap");
    mapping
}

/// Mutable state of one run
struct Engine<'p> {
    params: &'p ClassificationParams,
    pool: rayon::ThreadPool,
    samples: SampleMatrix,
    channels: Vec<Volume<f64>>,
    priors: PriorSet,
    weights: Vec<f64>,
    classes: Vec<ClassModel>,
    bias: BiasField,
    regressor: BiasRegressor,
    posteriors: Vec<f64>,
    lost_support: Vec<usize>,
    degeneracies: Vec<Degeneracy>,
}

impl<'p> Engine<'p> {
    fn new(
        params: &'p ClassificationParams,
        samples: SampleMatrix,
        channels: Vec<Volume<f64>>,
        priors: PriorSet,
        weights: Vec<f64>,
    ) -> Result<Self> {
        let k = priors.num_classes();
        let n = samples.num_samples();
        let basis = PolynomialBasis::for_grid(params.max_bias_degree, samples.geometry.dims);
        let bias = BiasField::zeros(basis, samples.num_channels());
        Ok(Self {
            params,
            pool: parallel::build_pool(params.num_threads)?,
            samples,
            channels,
            priors,
            weights,
            classes: Vec::with_capacity(k),
            bias,
            regressor: BiasRegressor::new(params.bias_condition_limit),
            posteriors: vec![0.0; n * k],
            lost_support: vec![0; k],
            degeneracies: Vec::new(),
        })
    }

    fn num_classes(&self) -> usize {
        self.priors.num_classes()
    }

    /// Seed the class Gaussians
    fn initialize(&mut self, rng: &mut StdRng) -> Result<()> {
        let k = self.num_classes();
        let use_kmeans = match self.params.initial_estimator {
            InitialEstimator::KMeans => true,
            InitialEstimator::PriorWeightedMoments => {
                let informative = self.priors.is_informative();
                if !informative {
                    info!("priors are constant over the foreground, initializing with k-means");
                }
                !informative
            }
        };

        let weights = if use_kmeans {
            self.kmeans_responsibilities(rng)?
        } else {
            info!("initializing classes from prior-weighted moments");
            self.priors.as_slice().to_vec()
        };

        let (samples, bias) = (&self.samples, &self.bias);
        let moments = self.pool.install(|| accumulate_moments(samples, bias, &weights, k));

        let n = self.samples.num_samples() as f64;
        let mut global: Option<Moments> = None;
        let mut classes = Vec::with_capacity(k);
        for j in 0..k {
            let (mean, covariance) = if moments.mass[j] >= self.params.min_class_support && moments.mass[j] > 0.0 {
                (moments.means[j].clone(), moments.covariances[j].clone())
            } else {
                debug!(class = j, mass = moments.mass[j], "class has no initial support, using global statistics");
                let g = global.get_or_insert_with(|| {
                    let ones = vec![1.0; self.samples.num_samples()];
                    self.pool.install(|| accumulate_moments(samples, bias, &ones, 1))
                });
                (g.means[0].clone(), g.covariances[0].clone())
            };
            let (model, repair) = ClassModel::new(mean, covariance, moments.mass[j] / n, self.params.variance_floor);
            if repair == Some(CovarianceRepair::Reset) {
                warn!(class = j, "initial covariance not positive definite, reset to variance floor");
                self.degeneracies.push(Degeneracy::CovarianceReset { iteration: 0, class: j });
            }
            debug!(class = j, mean = ?model.intensity_mean(), weight = model.mixing_weight, "initial class");
            classes.push(model);
        }
        self.classes = classes;
        Ok(())
    }

    /// One-hot responsibilities from k-means on (a subset of) the samples
    fn kmeans_responsibilities(&self, rng: &mut StdRng) -> Result<Vec<f64>> {
        let k = self.num_classes();
        let n = self.samples.num_samples();
        let estimator = KMeansEstimator::from_params(k, &self.params.kmeans);
        let values = &self.samples.values;

        let max_samples = self.params.kmeans.max_samples;
        let subset = if n > max_samples {
            let mut rows = rand::seq::index::sample(rng, n, max_samples).into_vec();
            rows.sort_unstable();
            values.select(Axis(0), &rows)
        } else {
            values.clone()
        };
        info!(rows = subset.nrows(), starts = self.params.kmeans.num_starts, "initializing classes with k-means");

        let clusters = self.pool.install(|| estimator.estimate(subset.view(), rng))?;
        let labels = self.pool.install(|| estimator.assign(values.view(), &clusters.means));
        let mapping = match_clusters_to_classes(&labels, &clusters.means, &self.priors);

        let mut weights = vec![0.0; n * k];
        for (s, &l) in labels.iter().enumerate() {
            weights[s * k + mapping[l]] = 1.0;
        }
        Ok(weights)
    }

    fn e_step(&mut self) -> f64 {
        let Self { pool, samples, priors, classes, bias, posteriors, .. } = self;
        pool.install(|| expectation(samples, priors, classes, bias, posteriors))
    }

    fn m_step(&mut self, iteration: usize) {
        let k = self.num_classes();
        let n = self.samples.num_samples() as f64;
        let (samples, bias, posteriors) = (&self.samples, &self.bias, &self.posteriors);
        let moments = self.pool.install(|| accumulate_moments(samples, bias, posteriors, k));

        for j in 0..k {
            let mass = moments.mass[j];
            if mass < self.params.min_class_support || mass <= 0.0 {
                self.lost_support[j] += 1;
                self.classes[j].mixing_weight = mass / n;
                if self.lost_support[j] == self.params.support_patience.max(1) {
                    warn!(class = j, mass, iteration, "class lost posterior support, keeping previous parameters");
                    self.degeneracies.push(Degeneracy::ClassLostSupport { iteration, class: j, mass });
                }
                continue;
            }
            self.lost_support[j] = 0;

            let (model, repair) = ClassModel::new(
                moments.means[j].clone(),
                moments.covariances[j].clone(),
                mass / n,
                self.params.variance_floor,
            );
            match repair {
                Some(CovarianceRepair::Reset) => {
                    warn!(class = j, iteration, "covariance not positive definite, reset to variance floor");
                    self.degeneracies.push(Degeneracy::CovarianceReset { iteration, class: j });
                }
                Some(CovarianceRepair::Clamped) => {
                    debug!(class = j, iteration, "covariance eigenvalues clamped to variance floor");
                }
                None => {}
            }
            self.classes[j] = model;
        }

        let Self { pool, samples, posteriors, classes, bias, regressor, .. } = self;
        let solves = pool.install(|| regressor.fit(samples, posteriors, classes, bias));
        for (channel, solve) in solves.into_iter().enumerate() {
            match solve {
                BiasSolve::Ridge { condition } => {
                    self.degeneracies.push(Degeneracy::BiasRidge { iteration, channel, condition })
                }
                BiasSolve::Skipped => self.degeneracies.push(Degeneracy::BiasSkipped { iteration, channel }),
                BiasSolve::Cholesky => {}
            }
        }
    }

    fn replace_priors(&mut self, volumes: &[Volume<f64>]) -> Result<()> {
        self.priors = PriorSet::from_volumes(volumes, &self.samples, &self.weights)
            .map_err(|e| AbcError::ExternalCollaborator(format!("warped priors rejected: {}", e)))?;
        Ok(())
    }

    fn iterate<'w>(
        mut self,
        mut warper: Option<&mut (dyn PriorWarper + 'w)>,
        template: Option<&Volume<f64>>,
        progress: &mut dyn FnMut(&IterationReport) -> ControlFlow<()>,
    ) -> Result<ClassificationResult> {
        let params = self.params;
        let k = self.num_classes();
        let mut controller = WarpController::new(&params.warp);
        let can_warp = controller.enabled() && warper.is_some() && template.is_some();

        let mut status = RunStatus::MaxIterationsReached;
        let mut log_likelihoods = Vec::with_capacity(params.max_iterations);
        let mut warp_iterations = Vec::new();
        let mut previous: Option<f64> = None;
        let mut pending_warp = false;
        let mut deformation: Option<DeformationField> = None;
        let mut warped_template: Option<Volume<f64>> = None;

        for iteration in 0..params.max_iterations {
            let mut warped = false;
            if can_warp && (pending_warp || controller.is_checkpoint(iteration)) {
                if let (Some(warper), Some(template)) = (warper.as_deref_mut(), template) {
                    let corrected = output::corrected_images(&self.channels, &self.bias);
                    let labels = output::label_volume(&self.samples, &self.posteriors, k);
                    let outcome = controller.run(
                        warper,
                        iteration,
                        template,
                        &corrected,
                        &labels,
                        deformation.as_ref(),
                        k,
                    )?;
                    self.replace_priors(&outcome.priors)?;
                    if outcome.deformation.is_some() {
                        deformation = outcome.deformation;
                    }
                    if outcome.warped_template.is_some() {
                        warped_template = outcome.warped_template;
                    }
                    previous = None;
                    pending_warp = false;
                    warped = true;
                    warp_iterations.push(iteration);
                }
            }

            let ll = self.e_step();
            log_likelihoods.push(ll);
            let relative_change = previous.map(|p| (ll - p).abs() / p.abs().max(f64::MIN_POSITIVE));
            debug!(iteration, log_likelihood = ll, ?relative_change, warped, "EM iteration");

            let report = IterationReport { iteration, log_likelihood: ll, relative_change, warped };
            if progress(&report).is_break() {
                info!(iteration, "classification stopped by caller");
                status = RunStatus::Stopped;
                break;
            }

            if relative_change.is_some_and(|r| r < params.convergence_tolerance) {
                // Converging on the unwarped atlas only moves the first warp forward
                if can_warp && controller.warps() == 0 && iteration + 1 < params.max_iterations {
                    debug!(iteration, "converged before the first warp, warping next iteration");
                    pending_warp = true;
                } else {
                    status = RunStatus::Converged;
                    break;
                }
            }
            if iteration + 1 == params.max_iterations {
                break;
            }

            self.m_step(iteration);
            previous = Some(ll);
        }

        let iterations = log_likelihoods.len();
        info!(
            ?status,
            iterations,
            log_likelihood = log_likelihoods.last().copied().unwrap_or(f64::NAN),
            degeneracies = self.degeneracies.len(),
            "EM classification finished"
        );

        Ok(ClassificationResult {
            status,
            iterations,
            log_likelihoods,
            warp_iterations,
            classes: self.classes,
            bias: self.bias,
            degeneracies: self.degeneracies,
            deformation,
            warped_template,
            samples: self.samples,
            posteriors: self.posteriors,
            channels: self.channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Geometry;
    use approx::assert_relative_eq;
    use rand::Rng;

    /// Two tissues split along x, single channel
    fn two_tissue_inputs() -> ClassificationInputs {
        let g = Geometry::new((16, 8, 4), (1.0, 1.0, 1.0));
        let mut rng = StdRng::seed_from_u64(11);
        let image = Volume::from_vec(
            (0..g.len())
                .map(|i| {
                    let (x, _, _) = g.coords(i);
                    let base = if x < 8 { 100.0 } else { 400.0 };
                    base * (1.0 + rng.gen_range(-0.05..0.05))
                })
                .collect(),
            g.clone(),
        )
        .unwrap();
        let left = Volume::from_vec(
            (0..g.len()).map(|i| if g.coords(i).0 < 8 { 0.8 } else { 0.2 }).collect(),
            g.clone(),
        )
        .unwrap();
        let right = left.map(|p| 1.0 - p);
        ClassificationInputs { images: vec![image], mask: Volume::filled(g, 1u8), priors: vec![left, right], template: None }
    }

    fn params() -> ClassificationParams {
        ClassificationParams {
            max_bias_degree: 1,
            num_threads: 2,
            intensity_rescale: None,
            ..ClassificationParams::default()
        }
    }

    #[test]
    fn test_two_tissues_from_prior_moments() {
        let result = Segmenter::new(params()).run(two_tissue_inputs()).unwrap();
        let means: Vec<f64> = result.classes.iter().map(|c| c.intensity_mean()[0]).collect();
        assert_relative_eq!(means[0], 100.0, max_relative = 0.01);
        assert_relative_eq!(means[1], 400.0, max_relative = 0.01);

        let labels = result.labels();
        for (i, &l) in labels.data.iter().enumerate() {
            let expected = if labels.geometry.coords(i).0 < 8 { 1 } else { 2 };
            assert_eq!(l, expected);
        }
    }

    #[test]
    fn test_stop_from_progress_callback() {
        let mut calls = 0;
        let result = Segmenter::new(params())
            .run_with_progress(two_tissue_inputs(), |report| {
                calls += 1;
                assert_eq!(report.iteration, calls - 1);
                if report.iteration == 1 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(result.status, RunStatus::Stopped);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.log_likelihoods.len(), 2);
        assert_eq!(calls, 2);
        assert_eq!(result.posteriors().len(), 2 * result.samples().num_samples());
    }

    #[test]
    fn test_max_iterations_is_not_an_error() {
        let p = ClassificationParams { max_iterations: 2, convergence_tolerance: 0.0, ..params() };
        let result = Segmenter::new(p).run(two_tissue_inputs()).unwrap();
        assert_eq!(result.status, RunStatus::MaxIterationsReached);
        assert_eq!(result.iterations, 2);
    }

    #[test]
    fn test_configuration_errors() {
        let mut inputs = two_tissue_inputs();
        inputs.priors.truncate(1);
        let err = Segmenter::new(params()).run(inputs).unwrap_err();
        assert!(matches!(err, AbcError::Configuration(_)));

        let warping = ClassificationParams {
            warp: crate::config::WarpParams { enabled: true, ..Default::default() },
            ..params()
        };
        let err = Segmenter::new(warping).run(two_tissue_inputs()).unwrap_err();
        assert!(matches!(err, AbcError::Configuration(_)));
    }

    #[test]
    fn test_single_slice_bias_is_well_posed() {
        let mut inputs = two_tissue_inputs();
        let (nx, ny, _) = inputs.mask.dims();
        let slice = Geometry::new((nx, ny, 1), (1.0, 1.0, 1.0));
        let keep = nx * ny;
        for volume in inputs.images.iter_mut().chain(inputs.priors.iter_mut()) {
            volume.data.truncate(keep);
            volume.geometry = slice.clone();
        }
        inputs.mask = Volume::filled(slice, 1u8);

        let p = ClassificationParams { max_iterations: 6, convergence_tolerance: 0.0, ..params() };
        let result = Segmenter::new(p).run(inputs).unwrap();
        assert_eq!(result.bias.basis().len(), 3);
        assert!(result.degeneracies.iter().all(|d| !matches!(d, Degeneracy::BiasRidge { .. })));
        assert_eq!(result.labels().data[0], 1);
    }

    #[test]
    fn test_too_few_foreground_voxels() {
        let mut inputs = two_tissue_inputs();
        inputs.mask.data.iter_mut().for_each(|m| *m = 0);
        inputs.mask.data[0] = 1;
        let err = Segmenter::new(params()).run(inputs).unwrap_err();
        assert!(matches!(err, AbcError::InsufficientData(_)));
    }

    #[test]
    fn test_cluster_matching_by_intensity_when_priors_flat() {
        let g = Geometry::new((4, 1, 1), (1.0, 1.0, 1.0));
        let image = Volume::filled(g.clone(), 1.0);
        let mask = Volume::filled(g.clone(), 1u8);
        let samples = SampleMatrix::build(&[image], &mask, None).unwrap();
        let flat = vec![Volume::filled(g.clone(), 0.5), Volume::filled(g, 0.5)];
        let priors = PriorSet::from_volumes(&flat, &samples, &[1.0, 1.0]).unwrap();

        let means = ndarray::array![[5.0], [2.0]];
        let mapping = match_clusters_to_classes(&[0, 0, 1, 1], &means, &priors);
        assert_eq!(mapping, vec![1, 0]);
    }

    #[test]
    fn test_cluster_matching_by_prior_overlap() {
        let g = Geometry::new((4, 1, 1), (1.0, 1.0, 1.0));
        let image = Volume::filled(g.clone(), 1.0);
        let mask = Volume::filled(g.clone(), 1u8);
        let samples = SampleMatrix::build(&[image], &mask, None).unwrap();
        let a = Volume::from_vec(vec![0.9, 0.9, 0.1, 0.1], g.clone()).unwrap();
        let b = a.map(|p| 1.0 - p);
        let priors = PriorSet::from_volumes(&[a, b], &samples, &[1.0, 1.0]).unwrap();

        // cluster 0 sits where class 1 is likely, despite its lower mean
        let means = ndarray::array![[1.0], [9.0]];
        let mapping = match_clusters_to_classes(&[1, 1, 0, 0], &means, &priors);
        assert_eq!(mapping, vec![1, 0]);
    }
}
