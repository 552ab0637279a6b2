//! Intensity rescaling and fixed-point conversion
//!
//! Linear min/max rescaling matching ITK's RescaleIntensityImageFilter,
//! used to bring inputs into a positive range before classification and to
//! export corrected images and posteriors as integers.

use crate::volume::Volume;

/// Linearly map the volume's [min, max] onto [lo, hi]
///
/// Non-finite voxels are ignored for the range and mapped to `lo`.
/// A constant volume maps to `lo` everywhere.
pub fn rescale_intensity(volume: &Volume<f64>, lo: f64, hi: f64) -> Volume<f64> {
    let min_val = volume.data.iter().filter(|v| v.is_finite()).fold(f64::INFINITY, |a, &b| a.min(b));
    let max_val = volume.data.iter().filter(|v| v.is_finite()).fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    let range = max_val - min_val;
    if !range.is_finite() || range < 1e-12 {
        return volume.map(|_| lo);
    }

    let scale = (hi - lo) / range;
    volume.map(|&v| if v.is_finite() { lo + (v - min_val) * scale } else { lo })
}

/// Round and saturate to i16
pub fn to_i16(volume: &Volume<f64>) -> Volume<i16> {
    volume.map(|&v| {
        if v.is_nan() {
            0
        } else {
            v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
        }
    })
}

/// Round and saturate to u8
pub fn to_u8(volume: &Volume<f64>) -> Volume<u8> {
    volume.map(|&v| if v.is_nan() { 0 } else { v.round().clamp(0.0, 255.0) as u8 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Geometry;

    fn vol(data: Vec<f64>) -> Volume<f64> {
        let n = data.len();
        Volume::from_vec(data, Geometry::new((n, 1, 1), (1.0, 1.0, 1.0))).unwrap()
    }

    #[test]
    fn test_rescale_range() {
        let v = vol(vec![-2.0, 0.0, 2.0, 6.0]);
        let r = rescale_intensity(&v, 1.0, 4096.0);
        assert!((r.data[0] - 1.0).abs() < 1e-12);
        assert!((r.data[3] - 4096.0).abs() < 1e-9);
        assert!(r.data.windows(2).all(|w| w[0] < w[1]), "ordering must be preserved");
    }

    #[test]
    fn test_rescale_constant_and_nan() {
        let r = rescale_intensity(&vol(vec![3.0; 4]), 1.0, 10.0);
        assert!(r.data.iter().all(|&x| x == 1.0));

        let r = rescale_intensity(&vol(vec![0.0, f64::NAN, 1.0]), 0.0, 10.0);
        assert_eq!(r.data, vec![0.0, 0.0, 10.0]);
    }

    #[test]
    fn test_integer_conversion_saturates() {
        let v = vol(vec![-1e6, 12.4, 12.6, 1e6]);
        assert_eq!(to_i16(&v).data, vec![i16::MIN, 12, 13, i16::MAX]);
        assert_eq!(to_u8(&v).data, vec![0, 12, 13, 255]);
    }
}
