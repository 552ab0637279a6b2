//! Common test utilities for abc-core integration tests

#![allow(dead_code)]

use abc_core::samples::normalized_coord;
use abc_core::{ClassificationInputs, ClassificationParams, Geometry, Mask, Volume};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Synthetic subject with known tissue labels
pub struct Phantom {
    pub inputs: ClassificationInputs,
    /// Ground-truth label (1-based) of every voxel, 0 outside the mask
    pub truth: Vec<u8>,
    /// Noise-free intensity of each class, per channel
    pub class_means: Vec<Vec<f64>>,
    /// Injected log-space bias of each channel at every voxel
    pub bias: Vec<Vec<f64>>,
}

/// Fraction of foreground voxels whose label equals the truth
pub fn label_agreement(labels: &[u8], truth: &[u8], mask: &[u8]) -> f64 {
    let mut agree = 0usize;
    let mut count = 0usize;
    for i in 0..labels.len() {
        if mask[i] > 0 {
            count += 1;
            if labels[i] == truth[i] {
                agree += 1;
            }
        }
    }
    if count == 0 {
        return 0.0;
    }
    agree as f64 / count as f64
}

/// Compute Pearson correlation coefficient within mask
pub fn correlation(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let (mut sum_a, mut sum_b, mut sum_ab, mut sum_a2, mut sum_b2) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let mut n = 0usize;
    for i in 0..a.len() {
        if mask[i] > 0 {
            sum_a += a[i];
            sum_b += b[i];
            sum_ab += a[i] * b[i];
            sum_a2 += a[i] * a[i];
            sum_b2 += b[i] * b[i];
            n += 1;
        }
    }
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    let numerator = n * sum_ab - sum_a * sum_b;
    let denominator = ((n * sum_a2 - sum_a * sum_a) * (n * sum_b2 - sum_b * sum_b)).sqrt();
    if denominator == 0.0 {
        return 0.0;
    }
    numerator / denominator
}

/// Largest deviation of a posterior row sum from 1
pub fn max_row_sum_error(posteriors: &[f64], num_classes: usize) -> f64 {
    posteriors
        .chunks_exact(num_classes)
        .map(|row| (row.iter().sum::<f64>() - 1.0).abs())
        .fold(0.0, f64::max)
}

/// Parameters shared by the integration tests: fixed threads, no rescale
pub fn test_params() -> ClassificationParams {
    ClassificationParams {
        num_threads: 2,
        intensity_rescale: None,
        max_bias_degree: 1,
        ..ClassificationParams::default()
    }
}

fn sphere_labels(geometry: &Geometry, radius: f64) -> Vec<u8> {
    let (nx, ny, nz) = geometry.dims;
    let c = ((nx as f64 - 1.0) / 2.0, (ny as f64 - 1.0) / 2.0, (nz as f64 - 1.0) / 2.0);
    (0..geometry.len())
        .map(|index| {
            let (i, j, k) = geometry.coords(index);
            let d2 = (i as f64 - c.0).powi(2) + (j as f64 - c.1).powi(2) + (k as f64 - c.2).powi(2);
            if d2 <= radius * radius {
                1
            } else {
                2
            }
        })
        .collect()
}

/// Prior volumes that give the true class `confidence` and share the rest
pub fn soft_priors(truth: &[u8], geometry: &Geometry, num_classes: usize, confidence: f64) -> Vec<Volume<f64>> {
    let rest = (1.0 - confidence) / (num_classes - 1) as f64;
    (0..num_classes)
        .map(|k| {
            let data = truth.iter().map(|&t| if t as usize == k + 1 { confidence } else { rest }).collect();
            Volume { data, geometry: geometry.clone() }
        })
        .collect()
}

/// Flat 1/K priors
pub fn flat_priors(geometry: &Geometry, num_classes: usize) -> Vec<Volume<f64>> {
    (0..num_classes).map(|_| Volume::filled(geometry.clone(), 1.0 / num_classes as f64)).collect()
}

fn noisy_channels(truth: &[u8], geometry: &Geometry, class_means: &[Vec<f64>], bias: &[Vec<f64>], noise: f64, seed: u64) -> Vec<Volume<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let channels = class_means[0].len();
    (0..channels)
        .map(|c| {
            let data = truth
                .iter()
                .enumerate()
                .map(|(i, &t)| {
                    let base = class_means[t as usize - 1][c];
                    base * bias[c][i].exp() * (1.0 + rng.gen_range(-noise..noise))
                })
                .collect();
            Volume { data, geometry: geometry.clone() }
        })
        .collect()
}

/// Two channels, two classes: a sphere of class 1 inside class 2, flat priors
///
/// Class 1 is darker in channel 0 and brighter in channel 1.
pub fn two_channel_phantom() -> Phantom {
    let geometry = Geometry::new((20, 20, 10), (1.0, 1.0, 2.0));
    let truth = sphere_labels(&geometry, 6.0);
    let class_means = vec![vec![100.0, 200.0], vec![300.0, 80.0]];
    let bias = vec![vec![0.0; geometry.len()]; 2];
    let images = noisy_channels(&truth, &geometry, &class_means, &bias, 0.05, 1234);
    let mask: Mask = Volume::filled(geometry.clone(), 1u8);

    Phantom {
        inputs: ClassificationInputs { images, mask, priors: flat_priors(&geometry, 2), template: None },
        truth,
        class_means,
        bias,
    }
}

/// One channel, three classes in a block pattern, with a smooth bias
///
/// The bias is a quadratic polynomial in normalized coordinates with
/// amplitude around 0.2 in log space; priors give the true class 0.6.
pub fn biased_phantom() -> Phantom {
    let geometry = Geometry::new((24, 24, 12), (1.0, 1.0, 1.0));
    let (nx, ny, nz) = geometry.dims;
    let truth: Vec<u8> = (0..geometry.len())
        .map(|index| {
            let (i, j, k) = geometry.coords(index);
            ((i / 3 + j / 3 + k / 3) % 3 + 1) as u8
        })
        .collect();
    let bias_field: Vec<f64> = (0..geometry.len())
        .map(|index| {
            let (i, j, k) = geometry.coords(index);
            let (x, y, z) = (normalized_coord(i, nx), normalized_coord(j, ny), normalized_coord(k, nz));
            0.12 * x - 0.08 * y + 0.05 * z + 0.06 * x * y - 0.05 * x * x
        })
        .collect();
    let class_means = vec![vec![50.0], vec![150.0], vec![400.0]];
    let bias = vec![bias_field];
    let images = noisy_channels(&truth, &geometry, &class_means, &bias, 0.03, 99);
    let mask: Mask = Volume::filled(geometry.clone(), 1u8);
    let priors = soft_priors(&truth, &geometry, 3, 0.6);

    Phantom {
        inputs: ClassificationInputs { images, mask, priors, template: None },
        truth,
        class_means,
        bias,
    }
}
