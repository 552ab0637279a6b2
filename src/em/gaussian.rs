//! Multivariate Gaussian class model
//!
//! Each tissue class is a Gaussian over the bias-corrected log-intensities of
//! all channels. The covariance is kept symmetric positive-definite: a matrix
//! that fails its Cholesky factorization is reset to an isotropic floor, and
//! eigenvalues below the floor are raised to it.

use nalgebra::{DMatrix, SymmetricEigen};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// What had to be done to make a covariance usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovarianceRepair {
    /// Not positive-definite (or not finite): replaced by `floor * I`
    Reset,
    /// Small eigenvalues raised to the floor
    Clamped,
}

/// Gaussian parameters of one class
#[derive(Debug, Clone)]
pub struct ClassModel {
    /// Mean log-intensity per channel
    pub mean: Vec<f64>,
    /// Channel x channel covariance
    pub covariance: DMatrix<f64>,
    /// Fraction of foreground posterior mass owned by the class
    pub mixing_weight: f64,
    /// Row-major inverse covariance
    precision: Vec<f64>,
    /// -0.5 * (C ln 2pi + ln det)
    log_norm: f64,
}

/// Make `covariance` symmetric positive-definite with eigenvalues >= floor
pub fn regularize_covariance(covariance: &DMatrix<f64>, floor: f64) -> (DMatrix<f64>, Option<CovarianceRepair>) {
    let n = covariance.nrows();
    let isotropic = DMatrix::<f64>::identity(n, n) * floor;

    if covariance.iter().any(|v| !v.is_finite()) {
        return (isotropic, Some(CovarianceRepair::Reset));
    }
    let symmetric = (covariance + covariance.transpose()) * 0.5;
    if symmetric.clone().cholesky().is_none() {
        return (isotropic, Some(CovarianceRepair::Reset));
    }

    let eigen = SymmetricEigen::new(symmetric.clone());
    if eigen.eigenvalues.iter().all(|&l| l >= floor) {
        return (symmetric, None);
    }
    let clamped = eigen.eigenvalues.map(|l| l.max(floor));
    let rebuilt = &eigen.eigenvectors * DMatrix::from_diagonal(&clamped) * eigen.eigenvectors.transpose();
    ((&rebuilt + rebuilt.transpose()) * 0.5, Some(CovarianceRepair::Clamped))
}

impl ClassModel {
    /// Build a class, regularizing the covariance against `floor`
    pub fn new(
        mean: Vec<f64>,
        covariance: DMatrix<f64>,
        mixing_weight: f64,
        floor: f64,
    ) -> (Self, Option<CovarianceRepair>) {
        let (covariance, repair) = regularize_covariance(&covariance, floor);
        let n = covariance.nrows();

        // regularize_covariance guarantees a successful factorization
        let (precision, log_det) = match covariance.clone().cholesky() {
            Some(chol) => {
                let log_det = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
                let inv = chol.inverse();
                let mut flat = vec![0.0; n * n];
                for r in 0..n {
                    for c in 0..n {
                        flat[r * n + c] = inv[(r, c)];
                    }
                }
                (flat, log_det)
            }
            None => {
                let mut flat = vec![0.0; n * n];
                for d in 0..n {
                    flat[d * n + d] = 1.0 / floor;
                }
                (flat, n as f64 * floor.ln())
            }
        };

        let model = Self {
            mean,
            covariance,
            mixing_weight,
            precision,
            log_norm: -0.5 * (n as f64 * LN_2PI + log_det),
        };
        (model, repair)
    }

    pub fn num_channels(&self) -> usize {
        self.mean.len()
    }

    /// Entry (r, c) of the inverse covariance
    #[inline]
    pub fn precision(&self, r: usize, c: usize) -> f64 {
        self.precision[r * self.mean.len() + c]
    }

    /// Log of the Gaussian density at `x`
    #[inline]
    pub fn log_density(&self, x: &[f64]) -> f64 {
        let n = self.mean.len();
        let mut quad = 0.0;
        for r in 0..n {
            let zr = x[r] - self.mean[r];
            let mut acc = 0.0;
            for c in 0..n {
                acc += self.precision[r * n + c] * (x[c] - self.mean[c]);
            }
            quad += zr * acc;
        }
        self.log_norm - 0.5 * quad
    }

    /// Mean intensity per channel (geometric mean, back from log space)
    pub fn intensity_mean(&self) -> Vec<f64> {
        self.mean.iter().map(|m| m.exp()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    #[test]
    fn test_univariate_density() {
        let (model, repair) = ClassModel::new(vec![1.0], DMatrix::from_element(1, 1, 4.0), 1.0, 1e-6);
        assert!(repair.is_none());
        // N(3 | 1, 4) = exp(-0.5) / sqrt(2 pi 4)
        let expected = -0.5 - 0.5 * (2.0 * std::f64::consts::PI * 4.0).ln();
        assert_relative_eq!(model.log_density(&[3.0]), expected, epsilon = 1e-12);
        assert_relative_eq!(model.precision(0, 0), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_bivariate_matches_closed_form() {
        let cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        let (model, _) = ClassModel::new(vec![0.0, 0.0], cov.clone(), 0.5, 1e-6);
        let x = [1.0, -1.0];
        let inv = cov.clone().try_inverse().unwrap();
        let z = DVector::from_column_slice(&x);
        let quad = (z.transpose() * &inv * &z)[(0, 0)];
        let expected = -0.5 * (2.0 * LN_2PI + cov.determinant().ln() + quad);
        assert_relative_eq!(model.log_density(&x), expected, epsilon = 1e-10);
    }

    #[test]
    fn test_non_positive_definite_is_reset() {
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let (fixed, repair) = regularize_covariance(&cov, 1e-3);
        assert_eq!(repair, Some(CovarianceRepair::Reset));
        assert_eq!(fixed, DMatrix::identity(2, 2) * 1e-3);

        let nan = DMatrix::from_element(1, 1, f64::NAN);
        assert_eq!(regularize_covariance(&nan, 1e-3).1, Some(CovarianceRepair::Reset));
    }

    #[test]
    fn test_small_eigenvalues_are_clamped() {
        // Rank-deficient but PSD after a tiny ridge: eigenvalues 2 and 1e-9
        let cov = DMatrix::from_row_slice(2, 2, &[1.0 + 5e-10, 1.0 - 5e-10, 1.0 - 5e-10, 1.0 + 5e-10]);
        let (fixed, repair) = regularize_covariance(&cov, 1e-4);
        assert_eq!(repair, Some(CovarianceRepair::Clamped));
        let eig = SymmetricEigen::new(fixed);
        let min = eig.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
        assert_relative_eq!(min, 1e-4, epsilon = 1e-10);
    }

    #[test]
    fn test_intensity_mean() {
        let (model, _) = ClassModel::new(vec![100f64.ln()], DMatrix::from_element(1, 1, 0.01), 1.0, 1e-6);
        assert_relative_eq!(model.intensity_mean()[0], 100.0, epsilon = 1e-9);
    }
}
