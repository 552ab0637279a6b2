//! K-means estimator
//!
//! Partitions a sample matrix (rows = observations, columns = channels) into
//! K clusters with Lloyd's iteration. Several random restarts are run, each
//! seeded from K distinct rows drawn without replacement; the restart with
//! the lowest within-cluster sum of squares is kept.
//!
//! Nearest-center queries are either a brute-force scan or a k-d tree over
//! the centers; both break ties toward the lowest center index and return
//! identical assignments.

pub mod kdtree;

use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::Rng;
use rayon::prelude::*;
use tracing::debug;

use crate::config::KMeansParams;
use crate::error::{AbcError, Result};
use kdtree::KdTree;

/// Result of a k-means run
#[derive(Debug, Clone)]
pub struct KMeansResult {
    /// Cluster index of every sample
    pub labels: Vec<usize>,
    /// Cluster means, K x channels
    pub means: Array2<f64>,
    /// Total within-cluster squared distance
    pub inertia: f64,
    /// Index of the restart that produced this result
    pub best_start: usize,
}

impl KMeansResult {
    /// Number of samples per cluster
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.means.nrows()];
        for &l in &self.labels {
            sizes[l] += 1;
        }
        sizes
    }
}

/// K-means with multiple random restarts
#[derive(Debug, Clone)]
pub struct KMeansEstimator {
    num_clusters: usize,
    num_starts: usize,
    max_iterations: usize,
    use_kd_tree: bool,
}

#[inline]
fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Closest mean by linear scan, lowest index on ties
fn nearest_brute(sample: ArrayView1<f64>, means: &Array2<f64>) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (c, mean) in means.rows().into_iter().enumerate() {
        let d = squared_distance(sample, mean);
        if d < best_d {
            best_d = d;
            best = c;
        }
    }
    best
}

impl KMeansEstimator {
    pub fn new(num_clusters: usize) -> Self {
        let defaults = KMeansParams::default();
        Self {
            num_clusters,
            num_starts: defaults.num_starts,
            max_iterations: defaults.max_iterations,
            use_kd_tree: defaults.use_kd_tree,
        }
    }

    pub fn from_params(num_clusters: usize, params: &KMeansParams) -> Self {
        Self {
            num_clusters,
            num_starts: params.num_starts.max(1),
            max_iterations: params.max_iterations.max(1),
            use_kd_tree: params.use_kd_tree,
        }
    }

    pub fn with_starts(mut self, num_starts: usize) -> Self {
        self.num_starts = num_starts.max(1);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_kd_tree(mut self, use_kd_tree: bool) -> Self {
        self.use_kd_tree = use_kd_tree;
        self
    }

    pub fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    /// Cluster the rows of `samples`
    ///
    /// Fails with `InsufficientData` when there are fewer rows than clusters.
    pub fn estimate<R: Rng + ?Sized>(&self, samples: ArrayView2<f64>, rng: &mut R) -> Result<KMeansResult> {
        let n = samples.nrows();
        let k = self.num_clusters;
        if k == 0 {
            return Err(AbcError::config("k-means needs at least one cluster"));
        }
        if n < k {
            return Err(AbcError::InsufficientData(format!(
                "k-means needs at least {} samples, got {}",
                k, n
            )));
        }

        let mut best: Option<KMeansResult> = None;
        for start in 0..self.num_starts {
            let seeds = rand::seq::index::sample(rng, n, k).into_vec();
            let mut means = Array2::<f64>::zeros((k, samples.ncols()));
            for (c, &s) in seeds.iter().enumerate() {
                means.row_mut(c).assign(&samples.row(s));
            }

            let (labels, means, iterations) = self.lloyd(samples, means);
            let inertia = within_cluster_sum(samples, &labels, &means);
            debug!(start, iterations, inertia, "k-means restart finished");

            if best.as_ref().map_or(true, |b| inertia < b.inertia) {
                best = Some(KMeansResult { labels, means, inertia, best_start: start });
            }
        }

        best.ok_or_else(|| AbcError::config("k-means ran no restarts"))
    }

    /// Lloyd iteration from the given centers
    fn lloyd(&self, samples: ArrayView2<f64>, mut means: Array2<f64>) -> (Vec<usize>, Array2<f64>, usize) {
        let k = self.num_clusters;
        let mut labels: Vec<usize> = Vec::new();
        let mut iterations = 0;
        let mut settled = false;

        for iter in 0..self.max_iterations {
            iterations = iter + 1;
            let new_labels = self.assign(samples, &means);
            if iter > 0 && new_labels == labels {
                settled = true;
                break;
            }
            labels = new_labels;

            let (updated, counts) = update_means(samples, &labels, k);
            means = updated;
            reseed_empty_clusters(samples, &mut means, &counts);
        }

        if !settled {
            labels = self.assign(samples, &means);
        }
        (labels, means, iterations)
    }

    /// Nearest-center label of every sample
    pub fn assign(&self, samples: ArrayView2<f64>, means: &Array2<f64>) -> Vec<usize> {
        if self.use_kd_tree {
            let tree = KdTree::build(means.view());
            (0..samples.nrows())
                .into_par_iter()
                .map(|i| tree.nearest(samples.row(i)).map_or(0, |(c, _)| c))
                .collect()
        } else {
            (0..samples.nrows())
                .into_par_iter()
                .map(|i| nearest_brute(samples.row(i), means))
                .collect()
        }
    }
}

/// Cluster means from labels; empty clusters keep a zero row
fn update_means(samples: ArrayView2<f64>, labels: &[usize], k: usize) -> (Array2<f64>, Vec<usize>) {
    let mut sums = Array2::<f64>::zeros((k, samples.ncols()));
    let mut counts = vec![0usize; k];
    for (row, &l) in samples.rows().into_iter().zip(labels.iter()) {
        let mut target = sums.row_mut(l);
        target += &row;
        counts[l] += 1;
    }
    for (c, &count) in counts.iter().enumerate() {
        if count > 0 {
            sums.row_mut(c).mapv_inplace(|v| v / count as f64);
        }
    }
    (sums, counts)
}

/// Move every empty cluster onto the sample farthest from all non-empty means
///
/// Distance is the sum of squared distances to the non-empty means. Returns
/// the number of clusters re-seeded.
fn reseed_empty_clusters(samples: ArrayView2<f64>, means: &mut Array2<f64>, counts: &[usize]) -> usize {
    let mut occupied: Vec<bool> = counts.iter().map(|&c| c > 0).collect();
    let mut taken: Vec<usize> = Vec::new();
    let mut reseeded = 0;

    for c in 0..counts.len() {
        if occupied[c] {
            continue;
        }
        let mut far = None;
        let mut far_d = f64::NEG_INFINITY;
        for (i, row) in samples.rows().into_iter().enumerate() {
            if taken.contains(&i) {
                continue;
            }
            let d: f64 = (0..means.nrows())
                .filter(|&m| occupied[m])
                .map(|m| squared_distance(row, means.row(m)))
                .sum();
            if d > far_d {
                far_d = d;
                far = Some(i);
            }
        }
        if let Some(i) = far {
            means.row_mut(c).assign(&samples.row(i));
            occupied[c] = true;
            taken.push(i);
            reseeded += 1;
        }
    }

    if reseeded > 0 {
        debug!(reseeded, "re-seeded empty k-means clusters");
    }
    reseeded
}

fn within_cluster_sum(samples: ArrayView2<f64>, labels: &[usize], means: &Array2<f64>) -> f64 {
    samples.rows().into_iter()
        .zip(labels.iter())
        .map(|(row, &l)| squared_distance(row, means.row(l)))
        .sum()
}
