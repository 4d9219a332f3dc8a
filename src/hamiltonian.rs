//! The Hamiltonian and points of its phase space.

use thiserror::Error;

use crate::math::all_finite;
use crate::metric::{Metric, MetricError};
use crate::target::{LogpError, LogpFunc};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Logp function returned an unrecoverable error: {0}")]
    LogpFailure(Box<dyn std::error::Error + Send + Sync>),

    #[error("Could not initialize state because of bad initial gradient.")]
    BadInitGrad(),

    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error("Invalid sampler configuration: {0}")]
    BadConfig(&'static str),
}

pub type Result<T> = std::result::Result<T, SamplerError>;

/// Details about a divergence that might have occured during sampling.
///
/// There are two reasons why we might observe a divergence:
/// - The integration error of the Hamiltonian is larger than
///   a cutoff value or nan.
/// - The logp function caused a recoverable error (eg if an ODE solver
///   failed)
#[derive(Debug, Clone, Default)]
pub struct DivergenceInfo {
    pub start_location: Option<Box<[f64]>>,
    pub start_momentum: Option<Box<[f64]>>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
}

/// A point in phase space with its cached energies.
///
/// The log-density value and gradient always correspond to `position`, and
/// velocity and kinetic energy to `momentum` under the metric that created
/// the point. Points flow through the trajectory machinery as immutable
/// values.
#[derive(Debug, Clone)]
pub struct PhasePoint {
    pub position: Box<[f64]>,
    pub momentum: Box<[f64]>,
    /// Gradient of the log-density at `position`.
    pub gradient: Box<[f64]>,
    /// M⁻¹ r, the gradient of the kinetic energy with respect to `momentum`.
    pub velocity: Box<[f64]>,
    /// Log-density at `position`.
    pub logp: f64,
    pub kinetic_energy: f64,
}

impl PhasePoint {
    /// The total energy (potential + kinetic).
    pub fn energy(&self) -> f64 {
        self.kinetic_energy - self.logp
    }

    /// Whether every component of the point is finite.
    ///
    /// Divergent points may still flow through the pipeline; their energy
    /// compares as if it were +∞.
    pub fn is_valid(&self) -> bool {
        self.logp.is_finite()
            && self.kinetic_energy.is_finite()
            && all_finite(&self.position)
            && all_finite(&self.momentum)
    }

    pub fn dim(&self) -> usize {
        self.position.len()
    }
}

/// A Hamiltonian: the target's potential energy plus the kinetic energy
/// defined by a [`Metric`].
#[derive(Debug)]
pub struct Hamiltonian<F: LogpFunc> {
    metric: Metric,
    target: F,
}

impl<F: LogpFunc> Hamiltonian<F> {
    pub fn new(metric: Metric, target: F) -> Hamiltonian<F> {
        Hamiltonian { metric, target }
    }

    /// A new Hamiltonian with a replacement metric, sharing the target.
    pub fn update(self, metric: Metric) -> Hamiltonian<F> {
        Hamiltonian {
            metric,
            target: self.target,
        }
    }

    pub(crate) fn set_metric(&mut self, metric: Metric) {
        self.metric = metric;
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn dim(&self) -> usize {
        self.target.dim()
    }

    /// Evaluate the log-density and gradient.
    ///
    /// Recoverable failures of the target are reported as `Ok(None)` and
    /// treated as divergences by the callers; unrecoverable failures abort.
    pub(crate) fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<Option<f64>> {
        match self.target.logp(position, gradient) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_recoverable() => Ok(None),
            Err(err) => Err(SamplerError::LogpFailure(Box::new(err))),
        }
    }

    /// Construct a phase point at `position` with the given momentum,
    /// caching the log-density, gradient, velocity and kinetic energy.
    pub fn phasepoint(&mut self, position: Box<[f64]>, momentum: Box<[f64]>) -> Result<PhasePoint> {
        let dim = position.len();
        let mut gradient = vec![0f64; dim].into_boxed_slice();
        let logp = self.logp(&position, &mut gradient)?.unwrap_or(f64::NAN);
        let mut velocity = vec![0f64; dim].into_boxed_slice();
        self.metric.velocity(&momentum, &mut velocity);
        let kinetic_energy = self.metric.kinetic_energy(&momentum, &velocity);
        Ok(PhasePoint {
            position,
            momentum,
            gradient,
            velocity,
            logp,
            kinetic_energy,
        })
    }

    /// The initial phase point of a chain. Fails if the log-density or its
    /// gradient are not finite at `position`.
    pub fn init_phasepoint<R: rand::Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        position: &[f64],
    ) -> Result<PhasePoint> {
        let mut momentum = vec![0f64; position.len()].into_boxed_slice();
        self.metric.randomize_momentum(rng, &mut momentum);
        let point = self.phasepoint(position.into(), momentum)?;
        if !point.logp.is_finite() || !all_finite(&point.gradient) {
            return Err(SamplerError::BadInitGrad());
        }
        Ok(point)
    }

    /// Redraw the momentum r ~ N(0, M), keeping the position and its cached
    /// log-density. No log-density evaluation happens here.
    pub fn refresh_momentum<R: rand::Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        point: &PhasePoint,
    ) -> PhasePoint {
        let mut out = point.clone();
        self.metric.randomize_momentum(rng, &mut out.momentum);
        self.metric.velocity(&out.momentum, &mut out.velocity);
        out.kinetic_energy = self.metric.kinetic_energy(&out.momentum, &out.velocity);
        out
    }

    /// Recompute the velocity and kinetic caches after a momentum change.
    pub(crate) fn update_kinetic(&self, point: &mut PhasePoint) {
        self.metric.velocity(&point.momentum, &mut point.velocity);
        point.kinetic_energy = self.metric.kinetic_energy(&point.momentum, &point.velocity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::test_logps::NormalLogp;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn phasepoint_caches_are_consistent() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut h = Hamiltonian::new(Metric::unit(3), NormalLogp::new(3, 0.));
        let z = h.init_phasepoint(&mut rng, &[0.5, -0.5, 1.]).unwrap();

        // Standard normal: logp = -Σx²/2, gradient = -x.
        assert!((z.logp - (-(0.25 + 0.25 + 1.) / 2.)).abs() < 1e-12);
        assert!((z.gradient[0] + 0.5).abs() < 1e-12);
        // Unit metric: velocity equals momentum.
        assert_eq!(&*z.velocity, &*z.momentum);
        assert!(z.is_valid());
    }

    #[test]
    fn refresh_keeps_position_and_logp() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut h = Hamiltonian::new(Metric::unit(2), NormalLogp::new(2, 1.));
        let z = h.init_phasepoint(&mut rng, &[0.1, 0.2]).unwrap();
        let z2 = h.refresh_momentum(&mut rng, &z);
        assert_eq!(z.position, z2.position);
        assert_eq!(z.logp, z2.logp);
        assert_ne!(z.momentum, z2.momentum);
    }
}
