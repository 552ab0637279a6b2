//! Polynomial bias field regressor
//!
//! The bias of each channel is an additive polynomial in log-intensity space,
//! expanded over the monomials `x^a y^b z^c` with `a + b + c <= degree` in
//! coordinates normalized to [-1, 1]. Only the coefficients are stored; the
//! field is evaluated per sample when needed.
//!
//! Fitting is one Gauss-Seidel sweep over channels. For channel `c` and
//! sample `i` the EM objective is quadratic in the bias value `b_c(x_i)`:
//!
//! ```text
//! w_i   = sum_k p_ik L_k[c,c]
//! r_i   = sum_k p_ik ( L_k[c,c] (y_ic - mu_kc) + sum_{d != c} L_k[c,d] (y_id - b_d(x_i) - mu_kd) )
//! Q(b)  = sum_i ( r_i b_c(x_i) - 0.5 w_i b_c(x_i)^2 )
//! ```
//!
//! so the coefficients solve `(sum_i w_i phi_i phi_i^T) beta = sum_i r_i phi_i`.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use tracing::{debug, warn};

use crate::em::gaussian::ClassModel;
use crate::parallel::{self, add_assign};
use crate::samples::{normalized_coord, SampleMatrix};
use crate::volume::Volume;

/// Monomial basis up to a total degree
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialBasis {
    degree: usize,
    exponents: Vec<[usize; 3]>,
}

impl PolynomialBasis {
    /// All monomials with total degree `<= degree`, constant term first
    ///
    /// `degree` is at most 10.
    pub fn new(degree: usize) -> Self {
        let mut exponents = Vec::new();
        for total in 0..=degree {
            for a in (0..=total).rev() {
                for b in (0..=total - a).rev() {
                    exponents.push([a, b, total - a - b]);
                }
            }
        }
        Self { degree, exponents }
    }

    /// Basis for a voxel grid of `dims`
    ///
    /// Axes with a single voxel have a constant normalized coordinate, so
    /// monomials using them are dropped.
    pub fn for_grid(degree: usize, dims: (usize, usize, usize)) -> Self {
        let flat = [dims.0 <= 1, dims.1 <= 1, dims.2 <= 1];
        let mut basis = Self::new(degree);
        basis.exponents.retain(|e| (0..3).all(|axis| !flat[axis] || e[axis] == 0));
        basis
    }

    /// Number of monomials: (d+1)(d+2)(d+3)/6
    pub fn len(&self) -> usize {
        self.exponents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exponents.is_empty()
    }

    pub fn exponents(&self) -> &[[usize; 3]] {
        &self.exponents
    }

    /// Write every monomial evaluated at `coord` into `out`
    #[inline]
    pub fn evaluate_into(&self, coord: &[f64; 3], out: &mut [f64]) {
        let mut powers = [[1.0f64; 11]; 3];
        for axis in 0..3 {
            for p in 1..=self.degree {
                powers[axis][p] = powers[axis][p - 1] * coord[axis];
            }
        }
        for (o, e) in out.iter_mut().zip(&self.exponents) {
            *o = powers[0][e[0]] * powers[1][e[1]] * powers[2][e[2]];
        }
    }

    pub fn evaluate(&self, coord: &[f64; 3]) -> Vec<f64> {
        let mut out = vec![0.0; self.len()];
        self.evaluate_into(coord, &mut out);
        out
    }
}

/// Per-channel polynomial bias in log-intensity space
#[derive(Debug, Clone)]
pub struct BiasField {
    basis: PolynomialBasis,
    /// One coefficient vector per channel, in basis order
    pub coefficients: Vec<Vec<f64>>,
}

impl BiasField {
    /// A zero field over `basis` for `num_channels` channels
    pub fn zeros(basis: PolynomialBasis, num_channels: usize) -> Self {
        let coefficients = vec![vec![0.0; basis.len()]; num_channels];
        Self { basis, coefficients }
    }

    pub fn basis(&self) -> &PolynomialBasis {
        &self.basis
    }

    pub fn num_channels(&self) -> usize {
        self.coefficients.len()
    }

    /// Bias of every channel at a normalized coordinate
    #[inline]
    pub fn evaluate_into(&self, coord: &[f64; 3], phi: &mut [f64], out: &mut [f64]) {
        self.basis.evaluate_into(coord, phi);
        for (o, coeffs) in out.iter_mut().zip(&self.coefficients) {
            *o = coeffs.iter().zip(phi.iter()).map(|(c, p)| c * p).sum();
        }
    }

    /// Bias of one channel at a normalized coordinate
    pub fn evaluate(&self, channel: usize, coord: &[f64; 3]) -> f64 {
        let phi = self.basis.evaluate(coord);
        self.coefficients[channel].iter().zip(&phi).map(|(c, p)| c * p).sum()
    }

    /// Divide `image` by the multiplicative bias `exp(b)` at every voxel
    pub fn correct(&self, channel: usize, image: &Volume<f64>) -> Volume<f64> {
        let (nx, ny, nz) = image.dims();
        let mut phi = vec![0.0; self.basis.len()];
        let coeffs = &self.coefficients[channel];
        let mut out = image.clone();
        for (index, v) in out.data.iter_mut().enumerate() {
            let (i, j, k) = image.geometry.coords(index);
            let coord = [normalized_coord(i, nx), normalized_coord(j, ny), normalized_coord(k, nz)];
            self.basis.evaluate_into(&coord, &mut phi);
            let b: f64 = coeffs.iter().zip(&phi).map(|(c, p)| c * p).sum();
            *v *= (-b).exp();
        }
        out
    }
}

/// How a channel's normal equations were solved
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BiasSolve {
    Cholesky,
    /// Ill-conditioned system, solved with a ridge term
    Ridge { condition: f64 },
    /// No posterior weight at all; coefficients left unchanged
    Skipped,
}

/// Fits [`BiasField`] coefficients from posteriors and class parameters
#[derive(Debug, Clone)]
pub struct BiasRegressor {
    condition_limit: f64,
}

impl BiasRegressor {
    pub fn new(condition_limit: f64) -> Self {
        Self { condition_limit }
    }

    /// Update every channel of `bias` in place, one channel at a time
    ///
    /// `posteriors` holds `num_samples * classes.len()` values, sample-major.
    /// Returns how each channel was solved.
    pub fn fit(
        &self,
        samples: &SampleMatrix,
        posteriors: &[f64],
        classes: &[ClassModel],
        bias: &mut BiasField,
    ) -> Vec<BiasSolve> {
        (0..bias.num_channels())
            .map(|c| self.fit_channel(samples, posteriors, classes, bias, c))
            .collect()
    }

    fn fit_channel(
        &self,
        samples: &SampleMatrix,
        posteriors: &[f64],
        classes: &[ClassModel],
        bias: &mut BiasField,
        channel: usize,
    ) -> BiasSolve {
        let m = bias.basis.len();
        let n_classes = classes.len();
        let n_channels = samples.num_channels();
        let field: &BiasField = bias;

        // Upper triangle of A (row-major m x m) followed by the right-hand side
        let acc = parallel::map_reduce(
            samples.num_samples(),
            vec![0.0; m * m + m],
            |range| {
                let mut acc = vec![0.0; m * m + m];
                let mut phi = vec![0.0; m];
                let mut b = vec![0.0; n_channels];
                for s in range {
                    field.evaluate_into(&samples.coords[s], &mut phi, &mut b);
                    let p = &posteriors[s * n_classes..(s + 1) * n_classes];

                    let mut w = 0.0;
                    let mut r = 0.0;
                    for (k, class) in classes.iter().enumerate() {
                        if p[k] == 0.0 {
                            continue;
                        }
                        let lcc = class.precision(channel, channel);
                        let mut resid = lcc * (samples.values[[s, channel]] - class.mean[channel]);
                        for d in 0..n_channels {
                            if d != channel {
                                let z = samples.values[[s, d]] - b[d] - class.mean[d];
                                resid += class.precision(channel, d) * z;
                            }
                        }
                        w += p[k] * lcc;
                        r += p[k] * resid;
                    }

                    for row in 0..m {
                        let wr = w * phi[row];
                        for col in row..m {
                            acc[row * m + col] += wr * phi[col];
                        }
                        acc[m * m + row] += r * phi[row];
                    }
                }
                acc
            },
            add_assign,
        );

        let mut a = DMatrix::<f64>::zeros(m, m);
        for row in 0..m {
            for col in row..m {
                a[(row, col)] = acc[row * m + col];
                a[(col, row)] = acc[row * m + col];
            }
        }
        let rhs = DVector::from_column_slice(&acc[m * m..]);

        match solve_normal_equations(a, rhs, self.condition_limit) {
            Some((beta, solve)) => {
                bias.coefficients[channel] = beta.iter().copied().collect();
                if let BiasSolve::Ridge { condition } = solve {
                    warn!(channel, condition, "bias normal equations ill-conditioned, using ridge solve");
                } else {
                    debug!(channel, "bias coefficients updated");
                }
                solve
            }
            None => {
                warn!(channel, "no posterior weight for bias regression, keeping previous field");
                BiasSolve::Skipped
            }
        }
    }
}

/// Solve `a x = rhs` for symmetric PSD `a`
///
/// Uses Cholesky when the condition number is within `limit`, otherwise adds
/// the ridge `lambda_max / limit` to the diagonal. Returns `None` when `a`
/// carries no information (largest eigenvalue not positive).
pub fn solve_normal_equations(
    a: DMatrix<f64>,
    rhs: DVector<f64>,
    limit: f64,
) -> Option<(DVector<f64>, BiasSolve)> {
    if a.iter().any(|v| !v.is_finite()) || rhs.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let eigen = SymmetricEigen::new(a.clone());
    let max = eigen.eigenvalues.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = eigen.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    if max.is_nan() || max <= 0.0 {
        return None;
    }

    if min > 0.0 && max / min <= limit {
        if let Some(chol) = a.clone().cholesky() {
            return Some((chol.solve(&rhs), BiasSolve::Cholesky));
        }
    }

    let condition = if min > 0.0 { max / min } else { f64::INFINITY };
    let n = a.nrows();
    let ridged = a + DMatrix::<f64>::identity(n, n) * (max / limit);
    match ridged.cholesky() {
        Some(chol) => Some((chol.solve(&rhs), BiasSolve::Ridge { condition })),
        None => {
            // Fall back to the spectral solve on the clamped eigenvalues
            let floor = max / limit;
            let inv = eigen.eigenvalues.map(|l| 1.0 / l.max(floor));
            let x = &eigen.eigenvectors * DMatrix::from_diagonal(&inv) * eigen.eigenvectors.transpose() * rhs;
            Some((x, BiasSolve::Ridge { condition }))
        }
    }
}
