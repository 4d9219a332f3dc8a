//! Euclidean metrics (mass matrices) for the momentum distribution.

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::math::{multiply, vector_dot};

#[derive(Error, Debug)]
pub enum MetricError {
    #[error("Diagonal inverse mass matrix entries must be finite and strictly positive")]
    BadDiagonal,
    #[error("Dense inverse mass matrix must be square and symmetric")]
    NotSymmetric,
    #[error("Dense inverse mass matrix is not positive definite")]
    NotPositiveDefinite,
}

/// The metric of the phase space, i.e. the covariance M of the momentum
/// distribution N(0, M).
///
/// The metric is stored through its inverse M⁻¹, which is what the kinetic
/// energy `r·M⁻¹·r / 2` needs. The dense variant additionally keeps the
/// lower Cholesky factor of M⁻¹ for momentum sampling.
#[derive(Debug, Clone)]
pub enum Metric {
    Unit {
        dim: usize,
    },
    Diag {
        /// Diagonal of M⁻¹.
        inv: Box<[f64]>,
        /// sqrt(M) diagonal, the scale of fresh momentum draws.
        inv_stds: Box<[f64]>,
    },
    Dense {
        /// M⁻¹.
        inv: DMatrix<f64>,
        /// Lower Cholesky factor L with L·Lᵀ = M⁻¹.
        chol: DMatrix<f64>,
    },
}

impl Metric {
    pub fn unit(dim: usize) -> Metric {
        Metric::Unit { dim }
    }

    /// A diagonal metric from the diagonal of M⁻¹.
    pub fn diag(inv: Box<[f64]>) -> Result<Metric, MetricError> {
        if inv.is_empty() || inv.iter().any(|&v| !v.is_finite() || v <= 0.) {
            return Err(MetricError::BadDiagonal);
        }
        let inv_stds = inv.iter().map(|&v| v.recip().sqrt()).collect();
        Ok(Metric::Diag { inv, inv_stds })
    }

    /// A dense metric from a symmetric positive-definite M⁻¹.
    pub fn dense(inv: DMatrix<f64>) -> Result<Metric, MetricError> {
        if !inv.is_square() || inv.is_empty() {
            return Err(MetricError::NotSymmetric);
        }
        let n = inv.nrows();
        for i in 0..n {
            for j in 0..i {
                let a = inv[(i, j)];
                let b = inv[(j, i)];
                if !a.is_finite() || (a - b).abs() > 1e-10 * a.abs().max(b.abs()).max(1.) {
                    return Err(MetricError::NotSymmetric);
                }
            }
            if !inv[(i, i)].is_finite() {
                return Err(MetricError::NotSymmetric);
            }
        }
        let chol = Cholesky::new(inv.clone())
            .ok_or(MetricError::NotPositiveDefinite)?
            .unpack();
        Ok(Metric::Dense { inv, chol })
    }

    pub fn dim(&self) -> usize {
        match self {
            Metric::Unit { dim } => *dim,
            Metric::Diag { inv, .. } => inv.len(),
            Metric::Dense { inv, .. } => inv.nrows(),
        }
    }

    /// The same kind of metric, reset to identity scale with a new dimension.
    pub(crate) fn resized(&self, dim: usize) -> Metric {
        match self {
            Metric::Unit { .. } => Metric::unit(dim),
            Metric::Diag { .. } => {
                Metric::diag(vec![1f64; dim].into()).expect("identity diagonal is valid")
            }
            Metric::Dense { .. } => {
                Metric::dense(DMatrix::identity(dim, dim)).expect("identity matrix is spd")
            }
        }
    }

    /// Draw a fresh momentum r ~ N(0, M) into `out`.
    pub(crate) fn randomize_momentum<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
        out.iter_mut().for_each(|r| *r = rng.sample(StandardNormal));
        match self {
            Metric::Unit { .. } => {}
            Metric::Diag { inv_stds, .. } => {
                out.iter_mut().zip(inv_stds.iter()).for_each(|(r, s)| *r *= s);
            }
            Metric::Dense { chol, .. } => {
                // With L·Lᵀ = M⁻¹, solving Lᵀ·r = z gives cov(r) = M.
                let z = DVector::from_column_slice(out);
                let r = chol
                    .tr_solve_lower_triangular(&z)
                    .expect("cholesky factor has nonzero diagonal");
                out.copy_from_slice(r.as_slice());
            }
        }
    }

    /// v = M⁻¹ r
    pub(crate) fn velocity(&self, momentum: &[f64], out: &mut [f64]) {
        match self {
            Metric::Unit { .. } => out.copy_from_slice(momentum),
            Metric::Diag { inv, .. } => multiply(inv, momentum, out),
            Metric::Dense { inv, .. } => {
                let n = inv.nrows();
                for (i, out) in out.iter_mut().enumerate() {
                    let mut acc = 0f64;
                    for (j, r) in momentum.iter().enumerate().take(n) {
                        acc += inv[(i, j)] * r;
                    }
                    *out = acc;
                }
            }
        }
    }

    /// Kinetic energy r·M⁻¹·r / 2 given the cached velocity M⁻¹ r.
    pub(crate) fn kinetic_energy(&self, momentum: &[f64], velocity: &[f64]) -> f64 {
        0.5 * vector_dot(momentum, velocity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn diag_rejects_bad_entries() {
        assert!(Metric::diag(vec![1., 0.5].into()).is_ok());
        assert!(Metric::diag(vec![1., 0.].into()).is_err());
        assert!(Metric::diag(vec![1., -2.].into()).is_err());
        assert!(Metric::diag(vec![1., f64::NAN].into()).is_err());
        assert!(Metric::diag(vec![].into()).is_err());
    }

    #[test]
    fn dense_rejects_non_spd() {
        let asym = DMatrix::from_row_slice(2, 2, &[1., 0.5, 0.2, 1.]);
        assert!(matches!(Metric::dense(asym), Err(MetricError::NotSymmetric)));

        let indef = DMatrix::from_row_slice(2, 2, &[1., 2., 2., 1.]);
        assert!(matches!(
            Metric::dense(indef),
            Err(MetricError::NotPositiveDefinite)
        ));
    }

    #[test]
    fn dense_momentum_velocity_consistent() {
        // M⁻¹ = [[2, 0.3], [0.3, 1]]
        let inv = DMatrix::from_row_slice(2, 2, &[2., 0.3, 0.3, 1.]);
        let metric = Metric::dense(inv).unwrap();
        let r = [1., -2.];
        let mut v = [0f64; 2];
        metric.velocity(&r, &mut v);
        assert_relative_eq!(v[0], 2. - 0.6, epsilon = 1e-12);
        assert_relative_eq!(v[1], 0.3 - 2., epsilon = 1e-12);
        let ke = metric.kinetic_energy(&r, &v);
        assert!(ke > 0.);
    }

    #[test]
    fn momentum_scale_follows_metric() {
        // With M⁻¹ diagonal v, momentum draws have variance 1/v.
        let mut rng = StdRng::seed_from_u64(17);
        let metric = Metric::diag(vec![4., 0.25].into()).unwrap();
        let n = 20_000;
        let mut sums = [0f64; 2];
        let mut out = [0f64; 2];
        for _ in 0..n {
            metric.randomize_momentum(&mut rng, &mut out);
            sums[0] += out[0] * out[0];
            sums[1] += out[1] * out[1];
        }
        let var0 = sums[0] / n as f64;
        let var1 = sums[1] / n as f64;
        assert!((var0 - 0.25).abs() < 0.02, "{var0}");
        assert!((var1 - 4.).abs() < 0.2, "{var1}");
    }

    #[test]
    fn dense_momentum_covariance_matches() {
        // M⁻¹ with correlation, so M = (M⁻¹)⁻¹.
        let inv = DMatrix::from_row_slice(2, 2, &[2., 0.5, 0.5, 1.5]);
        let mass = inv.clone().try_inverse().unwrap();
        let metric = Metric::dense(inv).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let n = 50_000;
        let mut acc = [0f64; 3];
        let mut out = [0f64; 2];
        for _ in 0..n {
            metric.randomize_momentum(&mut rng, &mut out);
            acc[0] += out[0] * out[0];
            acc[1] += out[0] * out[1];
            acc[2] += out[1] * out[1];
        }
        let n = n as f64;
        assert!((acc[0] / n - mass[(0, 0)]).abs() < 0.05 * mass[(0, 0)].abs().max(1.));
        assert!((acc[1] / n - mass[(0, 1)]).abs() < 0.05);
        assert!((acc[2] / n - mass[(1, 1)]).abs() < 0.05 * mass[(1, 1)].abs().max(1.));
    }
}
