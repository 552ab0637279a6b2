//! Sample matrix builder
//!
//! Collects, for every foreground voxel, the log-intensity of each input
//! channel together with the voxel's coordinates normalized to [-1, 1].
//! Both the k-means initialization and the EM loop work on this matrix.

use ndarray::Array2;

use crate::error::{AbcError, Result};
use crate::utils::intensity::rescale_intensity;
use crate::volume::{Geometry, Mask, Volume};

/// Foreground samples of a multi-channel volume set
#[derive(Debug, Clone)]
pub struct SampleMatrix {
    /// Linear voxel index of each sample, ascending
    pub indices: Vec<usize>,
    /// Voxel coordinates normalized to [-1, 1] per axis
    pub coords: Vec<[f64; 3]>,
    /// Log-intensities, one row per sample and one column per channel
    pub values: Array2<f64>,
    pub geometry: Geometry,
}

/// Map a voxel index on an axis of length `n` to [-1, 1]
#[inline]
pub fn normalized_coord(i: usize, n: usize) -> f64 {
    if n <= 1 {
        0.0
    } else {
        2.0 * i as f64 / (n - 1) as f64 - 1.0
    }
}

impl SampleMatrix {
    /// Build the matrix from co-registered channels and a foreground mask
    ///
    /// Channels are optionally rescaled to `rescale = [lo, hi]` over the
    /// whole volume first. Every foreground value must be finite and
    /// positive after rescaling.
    pub fn build(images: &[Volume<f64>], mask: &Mask, rescale: Option<[f64; 2]>) -> Result<Self> {
        if images.is_empty() {
            return Err(AbcError::config("at least one input channel is required"));
        }
        let geometry = mask.geometry.clone();
        for (c, image) in images.iter().enumerate() {
            geometry.ensure_matches(&image.geometry, &format!("input channel {}", c))?;
        }

        let indices = mask.foreground_indices();
        if indices.is_empty() {
            return Err(AbcError::InsufficientData("foreground mask is empty".into()));
        }

        let rescaled: Vec<Volume<f64>>;
        let channels: &[Volume<f64>] = match rescale {
            Some([lo, hi]) => {
                rescaled = images.iter().map(|img| rescale_intensity(img, lo, hi)).collect();
                &rescaled
            }
            None => images,
        };

        let (nx, ny, nz) = geometry.dims;
        let n_channels = channels.len();
        let mut values = Array2::<f64>::zeros((indices.len(), n_channels));
        let mut coords = Vec::with_capacity(indices.len());

        for (row, &index) in indices.iter().enumerate() {
            for (c, channel) in channels.iter().enumerate() {
                let v = channel.data[index];
                if !(v.is_finite() && v > 0.0) {
                    return Err(AbcError::config(format!(
                        "channel {} has non-positive intensity {} inside the mask at voxel {}",
                        c, v, index
                    )));
                }
                values[[row, c]] = v.ln();
            }
            let (i, j, k) = geometry.coords(index);
            coords.push([normalized_coord(i, nx), normalized_coord(j, ny), normalized_coord(k, nz)]);
        }

        Ok(Self { indices, coords, values, geometry })
    }

    pub fn num_samples(&self) -> usize {
        self.indices.len()
    }

    pub fn num_channels(&self) -> usize {
        self.values.ncols()
    }

    /// Spread one value per sample into a full volume, `fill` elsewhere
    pub fn scatter(&self, per_sample: impl IntoIterator<Item = f64>, fill: f64) -> Volume<f64> {
        let mut volume = Volume::filled(self.geometry.clone(), fill);
        for (&index, v) in self.indices.iter().zip(per_sample) {
            volume.data[index] = v;
        }
        volume
    }
}
