//! Symplectic leapfrog integration of Hamiltonian trajectories.

use rand::Rng;
use serde::Serialize;

use crate::hamiltonian::{DivergenceInfo, Hamiltonian, PhasePoint, Result, SamplerError};
use crate::math::{axpy, scale};
use crate::target::LogpFunc;

/// Outcome of integrating a trajectory.
#[derive(Debug)]
pub enum IntegrationResult {
    Ok(PhasePoint),
    /// Integration broke down. Carries the last valid point that was
    /// reached before the failure.
    Divergent(PhasePoint, DivergenceInfo),
    Err(SamplerError),
}

/// The leapfrog integrator and its variants.
///
/// All variants share the same half-kick / drift / half-kick update; they
/// differ in how the step size is drawn per trajectory and whether the
/// momentum is tempered along the way.
#[derive(Debug, Clone, Copy, Serialize)]
pub enum Integrator {
    /// Constant step size.
    Leapfrog { step_size: f64 },
    /// Step size multiplied by `1 + jitter·U(-1, 1)`, drawn once per
    /// trajectory.
    JitteredLeapfrog { step_size: f64, jitter: f64 },
    /// Momentum scaled by √α on the first half of the trajectory and by
    /// 1/√α on the second.
    TemperedLeapfrog { step_size: f64, alpha: f64 },
}

impl Integrator {
    pub fn leapfrog(step_size: f64) -> Result<Integrator> {
        if !step_size.is_finite() || step_size <= 0. {
            return Err(SamplerError::BadConfig("step size must be positive"));
        }
        Ok(Integrator::Leapfrog { step_size })
    }

    pub fn jittered(step_size: f64, jitter: f64) -> Result<Integrator> {
        if !step_size.is_finite() || step_size <= 0. {
            return Err(SamplerError::BadConfig("step size must be positive"));
        }
        if !jitter.is_finite() || !(0. ..1.).contains(&jitter) {
            return Err(SamplerError::BadConfig("jitter must be in [0, 1)"));
        }
        Ok(Integrator::JitteredLeapfrog { step_size, jitter })
    }

    pub fn tempered(step_size: f64, alpha: f64) -> Result<Integrator> {
        if !step_size.is_finite() || step_size <= 0. {
            return Err(SamplerError::BadConfig("step size must be positive"));
        }
        if !alpha.is_finite() || alpha <= 0. {
            return Err(SamplerError::BadConfig("tempering factor must be positive"));
        }
        Ok(Integrator::TemperedLeapfrog { step_size, alpha })
    }

    /// The nominal (pre-jitter) step size.
    pub fn nominal_step_size(&self) -> f64 {
        match self {
            Integrator::Leapfrog { step_size }
            | Integrator::JitteredLeapfrog { step_size, .. }
            | Integrator::TemperedLeapfrog { step_size, .. } => *step_size,
        }
    }

    /// The same variant with a new nominal step size.
    pub(crate) fn with_step_size(&self, new: f64) -> Integrator {
        let mut out = *self;
        match &mut out {
            Integrator::Leapfrog { step_size }
            | Integrator::JitteredLeapfrog { step_size, .. }
            | Integrator::TemperedLeapfrog { step_size, .. } => *step_size = new,
        }
        out
    }

    /// Draw the step size used for one trajectory.
    pub(crate) fn sample_step_size<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            Integrator::JitteredLeapfrog { step_size, jitter } => {
                step_size * (1. + jitter * rng.gen_range(-1f64..1f64))
            }
            _ => self.nominal_step_size(),
        }
    }

    /// A copy with the per-trajectory step size fixed, so that repeated
    /// single steps within one trajectory all use the same value.
    pub(crate) fn frozen(&self, step_size: f64) -> Integrator {
        match self {
            Integrator::Leapfrog { .. } | Integrator::JitteredLeapfrog { .. } => {
                Integrator::Leapfrog { step_size }
            }
            Integrator::TemperedLeapfrog { alpha, .. } => Integrator::TemperedLeapfrog {
                step_size,
                alpha: *alpha,
            },
        }
    }

    /// Integrate `|n_steps|` leapfrog steps from `start`. The sign of the
    /// step size follows the sign of `n_steps`, so negative counts
    /// integrate backwards in time.
    pub fn step<F: LogpFunc, R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        hamiltonian: &mut Hamiltonian<F>,
        start: &PhasePoint,
        n_steps: i64,
    ) -> IntegrationResult {
        if n_steps == 0 {
            return IntegrationResult::Ok(start.clone());
        }
        let sign = if n_steps < 0 { -1f64 } else { 1f64 };
        let epsilon = sign * self.sample_step_size(rng);
        self.integrate_fixed(hamiltonian, start, epsilon, n_steps.unsigned_abs())
    }

    /// The integration loop with a pre-drawn signed step size.
    pub(crate) fn integrate_fixed<F: LogpFunc>(
        &self,
        hamiltonian: &mut Hamiltonian<F>,
        start: &PhasePoint,
        epsilon: f64,
        n_steps: u64,
    ) -> IntegrationResult {
        let sqrt_alpha = match self {
            Integrator::TemperedLeapfrog { alpha, .. } => alpha.sqrt(),
            _ => 1f64,
        };

        let mut current = start.clone();
        for step in 1..=n_steps {
            let pre = if step <= (n_steps + 1) / 2 {
                sqrt_alpha
            } else {
                sqrt_alpha.recip()
            };
            let post = if step <= n_steps / 2 {
                sqrt_alpha
            } else {
                sqrt_alpha.recip()
            };

            match leapfrog(hamiltonian, &current, epsilon, pre, post) {
                Err(err) => return IntegrationResult::Err(err),
                Ok(None) => {
                    let info = DivergenceInfo {
                        start_location: Some(current.position.clone()),
                        start_momentum: Some(current.momentum.clone()),
                        end_location: None,
                        energy_error: None,
                    };
                    return IntegrationResult::Divergent(current, info);
                }
                Ok(Some(next)) => {
                    if !next.is_valid() {
                        let info = DivergenceInfo {
                            start_location: Some(current.position.clone()),
                            start_momentum: Some(current.momentum.clone()),
                            end_location: Some(next.position.clone()),
                            energy_error: None,
                        };
                        return IntegrationResult::Divergent(current, info);
                    }
                    current = next;
                }
            }
        }
        IntegrationResult::Ok(current)
    }
}

/// One half-kick / drift / half-kick update, with optional momentum
/// tempering before and after the kicks.
///
/// `Ok(None)` signals a recoverable log-density failure, which callers
/// treat as a divergence.
fn leapfrog<F: LogpFunc>(
    hamiltonian: &mut Hamiltonian<F>,
    start: &PhasePoint,
    epsilon: f64,
    pre_scale: f64,
    post_scale: f64,
) -> Result<Option<PhasePoint>> {
    let mut out = start.clone();

    if pre_scale != 1. {
        scale(&mut out.momentum, pre_scale);
    }

    axpy(&out.gradient, &mut out.momentum, epsilon / 2.);
    hamiltonian
        .metric()
        .velocity(&out.momentum, &mut out.velocity);

    axpy(&out.velocity, &mut out.position, epsilon);
    match hamiltonian.logp(&out.position, &mut out.gradient)? {
        Some(logp) => out.logp = logp,
        None => return Ok(None),
    }

    axpy(&out.gradient, &mut out.momentum, epsilon / 2.);
    if post_scale != 1. {
        scale(&mut out.momentum, post_scale);
    }
    hamiltonian.update_kinetic(&mut out);

    Ok(Some(out))
}
