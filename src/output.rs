//! Output assembly: label volume, posterior volumes, corrected images

use serde::{Deserialize, Serialize};

use crate::em::bias::BiasField;
use crate::error::{AbcError, Result};
use crate::samples::SampleMatrix;
use crate::utils::intensity::{to_i16, to_u8};
use crate::volume::{Mask, Volume};

/// Full-scale value of a fixed-point int16 posterior
pub const POSTERIOR_I16_SCALE: f64 = 32767.0;
/// Full-scale value of a fixed-point uint8 posterior
pub const POSTERIOR_U8_SCALE: f64 = 255.0;

/// Which posterior volumes to export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PosteriorSelection {
    #[default]
    All,
    /// All classes except the last `n` (e.g. non-brain atlas classes)
    DropTrailing(usize),
}

impl PosteriorSelection {
    /// Number of classes kept out of `num_classes`
    pub fn count(&self, num_classes: usize) -> usize {
        match *self {
            PosteriorSelection::All => num_classes,
            PosteriorSelection::DropTrailing(n) => num_classes.saturating_sub(n),
        }
    }
}

/// Index of the largest value, lowest index on ties
#[inline]
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (k, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = k;
        }
    }
    best
}

/// `argmax + 1` of every sample's posterior row
pub fn sample_labels(posteriors: &[f64], num_classes: usize) -> Vec<u8> {
    posteriors.chunks_exact(num_classes).map(|row| (argmax(row) + 1) as u8).collect()
}

/// Label volume: 0 outside the foreground, `argmax + 1` inside
pub fn label_volume(samples: &SampleMatrix, posteriors: &[f64], num_classes: usize) -> Volume<u8> {
    let mut labels = Volume::filled(samples.geometry.clone(), 0u8);
    for (&index, label) in samples.indices.iter().zip(sample_labels(posteriors, num_classes)) {
        labels.data[index] = label;
    }
    labels
}

/// Label volume from dense posterior volumes restricted to `mask`
pub fn labels_from_posterior_volumes(posteriors: &[Volume<f64>], mask: &Mask) -> Result<Volume<u8>> {
    if posteriors.is_empty() || posteriors.len() > u8::MAX as usize {
        return Err(AbcError::config(format!("cannot label {} posterior volumes", posteriors.len())));
    }
    for (k, p) in posteriors.iter().enumerate() {
        mask.geometry.ensure_matches(&p.geometry, &format!("posterior {}", k))?;
    }
    let mut labels = Volume::filled(mask.geometry.clone(), 0u8);
    let mut row = vec![0.0; posteriors.len()];
    for (index, label) in labels.data.iter_mut().enumerate() {
        if mask.data[index] == 0 {
            continue;
        }
        for (r, p) in row.iter_mut().zip(posteriors) {
            *r = p.data[index];
        }
        *label = (argmax(&row) + 1) as u8;
    }
    Ok(labels)
}

/// Dense posterior volumes (0 outside the foreground)
pub fn posterior_volumes(
    samples: &SampleMatrix,
    posteriors: &[f64],
    num_classes: usize,
    selection: PosteriorSelection,
) -> Vec<Volume<f64>> {
    (0..selection.count(num_classes))
        .map(|k| samples.scatter(posteriors.iter().skip(k).step_by(num_classes).copied(), 0.0))
        .collect()
}

/// Fixed-point posteriors, `round(p * 32767)`
pub fn posteriors_to_i16(posteriors: &[Volume<f64>]) -> Vec<Volume<i16>> {
    posteriors.iter().map(|p| to_i16(&p.map(|v| v * POSTERIOR_I16_SCALE))).collect()
}

/// Fixed-point posteriors, `round(p * 255)`
pub fn posteriors_to_u8(posteriors: &[Volume<f64>]) -> Vec<Volume<u8>> {
    posteriors.iter().map(|p| to_u8(&p.map(|v| v * POSTERIOR_U8_SCALE))).collect()
}

/// Every channel divided by its multiplicative bias
pub fn corrected_images(channels: &[Volume<f64>], bias: &BiasField) -> Vec<Volume<f64>> {
    channels.iter().enumerate().map(|(c, image)| bias.correct(c, image)).collect()
}
