//! Mass matrix adaptation from posterior draws.

use crate::metric::Metric;
use crate::welford::{RunningCovariance, RunningVariance};

/// Estimates a replacement metric from the draws of an adaptation window.
///
/// The variant mirrors the metric being adapted: unit metrics stay fixed,
/// diagonal metrics are estimated from marginal variances, dense metrics
/// from the full covariance.
#[derive(Debug, Clone)]
pub enum MassMatrixAdaptor {
    Unit,
    Diag(RunningVariance),
    Dense(RunningCovariance),
}

impl MassMatrixAdaptor {
    /// An adaptor matching the kind of `metric`.
    pub fn for_metric(metric: &Metric) -> MassMatrixAdaptor {
        match metric {
            Metric::Unit { .. } => MassMatrixAdaptor::Unit,
            Metric::Diag { inv, .. } => MassMatrixAdaptor::Diag(RunningVariance::new(inv.len())),
            Metric::Dense { inv, .. } => {
                MassMatrixAdaptor::Dense(RunningCovariance::new(inv.nrows()))
            }
        }
    }

    pub fn push(&mut self, position: &[f64]) {
        match self {
            MassMatrixAdaptor::Unit => {}
            MassMatrixAdaptor::Diag(est) => est.push(position),
            MassMatrixAdaptor::Dense(est) => est.push(position),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            MassMatrixAdaptor::Unit => 0,
            MassMatrixAdaptor::Diag(est) => est.count(),
            MassMatrixAdaptor::Dense(est) => est.count(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            MassMatrixAdaptor::Unit => {}
            MassMatrixAdaptor::Diag(est) => est.reset(),
            MassMatrixAdaptor::Dense(est) => est.reset(),
        }
    }

    /// The metric estimated from the window, or `None` when there is
    /// nothing to update (unit metric, or a singular estimate, which keeps
    /// the previous metric in place).
    pub fn finalize(&self) -> Option<Metric> {
        match self {
            MassMatrixAdaptor::Unit => None,
            MassMatrixAdaptor::Diag(est) => match Metric::diag(est.estimate()) {
                Ok(metric) => Some(metric),
                Err(err) => {
                    log::warn!("keeping previous mass matrix: {err}");
                    None
                }
            },
            MassMatrixAdaptor::Dense(est) => match Metric::dense(est.estimate()) {
                Ok(metric) => Some(metric),
                Err(err) => {
                    log::warn!("keeping previous mass matrix: {err}");
                    None
                }
            },
        }
    }
}
