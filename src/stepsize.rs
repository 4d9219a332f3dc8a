//! Dual-averaging step size adaptation.

use rand::Rng;
use serde::Serialize;

use crate::hamiltonian::{Hamiltonian, PhasePoint, Result, SamplerError};
use crate::integrator::{IntegrationResult, Integrator};
use crate::target::LogpFunc;

/// Parameters of the dual-averaging scheme (Hoffman & Gelman §3.2.1).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

/// Nesterov dual averaging of the log step size toward a target acceptance
/// rate.
#[derive(Debug, Clone)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    target: f64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub fn new(settings: DualAverageOptions, target: f64, initial_step: f64) -> Result<DualAverage> {
        if !target.is_finite() || target <= 0. || target >= 1. {
            return Err(SamplerError::BadConfig(
                "target acceptance rate must be in (0, 1)",
            ));
        }
        if !initial_step.is_finite() || initial_step <= 0. {
            return Err(SamplerError::BadConfig("step size must be positive"));
        }
        Ok(DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            target,
            settings,
        })
    }

    /// Advance the estimate with the acceptance statistic of one
    /// transition. Non-finite statistics count as zero acceptance.
    pub fn advance(&mut self, accept_stat: f64) {
        let accept_stat = if accept_stat.is_finite() {
            accept_stat
        } else {
            0.
        };
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (self.target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    /// The noisy step size used while adaptation is running.
    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    /// The smoothed step size to commit after adaptation.
    pub fn adapted_step_size(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    /// Restart the scheme around the current step size, as done at the end
    /// of each mass matrix window.
    pub fn restart(&mut self, current_step: f64) {
        self.mu = (10. * current_step).ln();
        self.log_step = current_step.ln();
        self.log_step_adapted = 0.;
        self.hbar = 0.;
        self.count = 1;
    }
}

/// Find an initial step size for which the one-step acceptance probability
/// crosses 0.5 by repeated doubling or halving (Hoffman & Gelman,
/// Algorithm 4).
pub(crate) fn find_initial_step_size<F, R>(
    rng: &mut R,
    hamiltonian: &mut Hamiltonian<F>,
    start: &PhasePoint,
    initial_step: f64,
) -> Result<f64>
where
    F: LogpFunc,
    R: Rng + ?Sized,
{
    let start = hamiltonian.refresh_momentum(rng, start);
    let initial_energy = start.energy();

    let accept_prob = |hamiltonian: &mut Hamiltonian<F>, epsilon: f64| -> Result<Option<f64>> {
        let lf = Integrator::Leapfrog { step_size: epsilon };
        match lf.integrate_fixed(hamiltonian, &start, epsilon, 1) {
            IntegrationResult::Ok(end) => {
                let prob = (initial_energy - end.energy()).exp();
                Ok(prob.is_finite().then_some(prob))
            }
            IntegrationResult::Divergent(..) => Ok(None),
            IntegrationResult::Err(err) => Err(err),
        }
    };

    let mut epsilon = initial_step;
    let first_prob = loop {
        match accept_prob(hamiltonian, epsilon)? {
            Some(prob) => break prob,
            None => {
                // Diverged right away; shrink until the first step survives.
                epsilon /= 2.;
                if epsilon < 1e-10 {
                    return Ok(initial_step);
                }
            }
        }
    };

    let doubling = first_prob > 0.5;
    for _ in 0..100 {
        let next = if doubling { epsilon * 2. } else { epsilon / 2. };
        if !(1e-10..=1e5).contains(&next) {
            break;
        }
        let Some(prob) = accept_prob(hamiltonian, next)? else {
            break;
        };
        if doubling && prob < 0.5 {
            break;
        }
        epsilon = next;
        if !doubling && prob > 0.5 {
            break;
        }
    }
    Ok(epsilon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;
    use crate::sampler::test_logps::NormalLogp;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn rejects_bad_config() {
        let opts = DualAverageOptions::default();
        assert!(DualAverage::new(opts, 0., 0.1).is_err());
        assert!(DualAverage::new(opts, 1., 0.1).is_err());
        assert!(DualAverage::new(opts, 0.8, 0.).is_err());
        assert!(DualAverage::new(opts, 0.8, -1.).is_err());
    }

    #[test]
    fn constant_feedback_stabilizes() {
        let mut da = DualAverage::new(DualAverageOptions::default(), 0.8, 0.5).unwrap();
        for _ in 0..200 {
            da.advance(0.8);
        }
        let eps = da.adapted_step_size();
        assert!(eps.is_finite() && eps > 0.);
        // With the statistic pinned at the target the step size stays put.
        assert!((eps - 0.5).abs() < 0.2, "{eps}");
    }

    #[test]
    fn adapts_in_the_right_direction() {
        let mut high = DualAverage::new(DualAverageOptions::default(), 0.8, 0.1).unwrap();
        for _ in 0..200 {
            high.advance(0.99);
        }
        let mut low = DualAverage::new(DualAverageOptions::default(), 0.8, 0.1).unwrap();
        for _ in 0..200 {
            low.advance(0.2);
        }
        assert!(high.adapted_step_size() > low.adapted_step_size());
    }

    #[test]
    fn nonfinite_statistic_counts_as_rejection() {
        let mut with_nan = DualAverage::new(DualAverageOptions::default(), 0.8, 0.1).unwrap();
        let mut with_zero = DualAverage::new(DualAverageOptions::default(), 0.8, 0.1).unwrap();
        for _ in 0..10 {
            with_nan.advance(f64::NAN);
            with_zero.advance(0.);
        }
        assert_eq!(with_nan.current_step_size(), with_zero.current_step_size());
    }

    #[test]
    fn restart_recenters_mu() {
        let mut da = DualAverage::new(DualAverageOptions::default(), 0.8, 0.1).unwrap();
        for _ in 0..50 {
            da.advance(0.3);
        }
        da.restart(0.05);
        assert!((da.current_step_size() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn finds_reasonable_step_size() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut h = Hamiltonian::new(Metric::unit(10), NormalLogp::new(10, 0.));
        let z = h.init_phasepoint(&mut rng, &[0.5; 10]).unwrap();
        let eps = find_initial_step_size(&mut rng, &mut h, &z, 1.).unwrap();
        // For a standard normal a reasonable step size is order one.
        assert!(eps > 0.01 && eps < 10., "{eps}");
    }
}
