//! Foreground mask generation utilities
//!
//! Field-of-view masks derived from the input channels.

use crate::volume::{Mask, Volume};

/// Field of view: voxels where every channel holds a finite positive value
///
/// Returns `None` when no image is given.
pub fn field_of_view_mask(images: &[Volume<f64>]) -> Option<Mask> {
    let first = images.first()?;
    let mut mask = first.map(|_| 1u8);
    for image in images {
        for (m, &v) in mask.data.iter_mut().zip(image.data.iter()) {
            if !(v.is_finite() && v > 0.0) {
                *m = 0;
            }
        }
    }
    Some(mask)
}

/// Voxel-wise intersection of two masks on the same grid
pub fn intersect(a: &Mask, b: &Mask) -> Mask {
    Volume {
        data: a.data.iter().zip(b.data.iter()).map(|(&x, &y)| u8::from(x != 0 && y != 0)).collect(),
        geometry: a.geometry.clone(),
    }
}
