//! Online variance and covariance estimation for mass matrix adaptation.

use nalgebra::DMatrix;

/// The Stan regularization weight: shrink toward 1e-3·I with weight
/// 5/(n+5).
fn shrinkage(count: u64) -> (f64, f64) {
    let n = count as f64;
    let w = n / (n + 5.);
    (w, (1. - w) * 1e-3)
}

/// Welford's online variance estimator.
///
/// The estimate is regularized the way Stan does it; without that shrinkage
/// short adaptation windows produce badly conditioned mass matrices.
#[derive(Debug, Clone)]
pub struct RunningVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }

    pub fn push(&mut self, value: &[f64]) {
        assert!(value.len() == self.mean.len());
        self.count += 1;
        let n = self.count as f64;
        for ((mean, m2), x) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(value) {
            let delta = x - *mean;
            *mean += delta / n;
            *m2 += delta * (x - *mean);
        }
    }

    /// The regularized variance estimate, or all ones while fewer than two
    /// samples have been seen.
    pub fn estimate(&self) -> Box<[f64]> {
        if self.count < 2 {
            return vec![1f64; self.mean.len()].into();
        }
        let scale = ((self.count - 1) as f64).recip();
        let (w, reg) = shrinkage(self.count);
        self.m2.iter().map(|m2| w * m2 * scale + reg).collect()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.mean.iter_mut().for_each(|v| *v = 0.);
        self.m2.iter_mut().for_each(|v| *v = 0.);
        self.count = 0;
    }
}

/// Welford's online covariance estimator, with the same regularization as
/// [`RunningVariance`].
#[derive(Debug, Clone)]
pub struct RunningCovariance {
    mean: Box<[f64]>,
    delta: Box<[f64]>,
    m2: DMatrix<f64>,
    count: u64,
}

impl RunningCovariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            delta: vec![0f64; dim].into(),
            m2: DMatrix::zeros(dim, dim),
            count: 0,
        }
    }

    pub fn push(&mut self, value: &[f64]) {
        let dim = self.mean.len();
        assert!(value.len() == dim);
        self.count += 1;
        let n = self.count as f64;
        for ((mean, delta), x) in self.mean.iter_mut().zip(self.delta.iter_mut()).zip(value) {
            *delta = x - *mean;
            *mean += *delta / n;
        }
        // Rank-one update with δ ⊗ (x - new mean).
        for j in 0..dim {
            let after = value[j] - self.mean[j];
            for i in 0..dim {
                self.m2[(i, j)] += self.delta[i] * after;
            }
        }
    }

    /// The regularized covariance estimate, or the identity while fewer
    /// than two samples have been seen.
    pub fn estimate(&self) -> DMatrix<f64> {
        let dim = self.mean.len();
        if self.count < 2 {
            return DMatrix::identity(dim, dim);
        }
        let scale = ((self.count - 1) as f64).recip();
        let (w, reg) = shrinkage(self.count);
        let mut out = &self.m2 * (w * scale);
        // Symmetrize against the asymmetric rank-one updates.
        for i in 0..dim {
            for j in 0..i {
                let avg = 0.5 * (out[(i, j)] + out[(j, i)]);
                out[(i, j)] = avg;
                out[(j, i)] = avg;
            }
            out[(i, i)] += reg;
        }
        out
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.mean.iter_mut().for_each(|v| *v = 0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}
