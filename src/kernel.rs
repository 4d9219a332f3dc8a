//! Transition kernels: static HMC, fixed-time HMC and NUTS.

use rand::Rng;
use serde::Serialize;

use crate::hamiltonian::{DivergenceInfo, Hamiltonian, PhasePoint, Result, SamplerError};
use crate::integrator::{IntegrationResult, Integrator};
use crate::target::LogpFunc;
use crate::termination::Criterion;
use crate::trajectory::{nuts_transition, TrajectorySampler};

/// Divergence threshold on the energy error, relative to the energy at the
/// start of the trajectory.
pub const MAX_ENERGY_ERROR: f64 = 1000.;

/// The default maximum NUTS tree depth.
pub const DEFAULT_MAX_DEPTH: u64 = 10;

/// A Markov transition kernel over phase points.
#[derive(Debug, Clone, Copy, Serialize)]
pub enum Kernel {
    /// A fixed number of leapfrog steps with Metropolis-Hastings acceptance
    /// of the endpoint.
    Static { n_leapfrog: u64 },
    /// A fixed integration time λ: the number of steps adapts to the
    /// current step size as `max(1, round(λ/ϵ))`.
    FixedTime { length: f64 },
    /// Tree doubling with a no-U-turn termination criterion.
    Nuts {
        max_depth: u64,
        sampler: TrajectorySampler,
        criterion: Criterion,
    },
}

impl Kernel {
    pub fn static_trajectory(n_leapfrog: u64) -> Result<Kernel> {
        if n_leapfrog == 0 {
            return Err(SamplerError::BadConfig(
                "static trajectories need at least one leapfrog step",
            ));
        }
        Ok(Kernel::Static { n_leapfrog })
    }

    /// The HMCDA kernel of Hoffman & Gelman: a trajectory of fixed
    /// integration time.
    pub fn hmc_da(length: f64) -> Result<Kernel> {
        if !length.is_finite() || length <= 0. {
            return Err(SamplerError::BadConfig(
                "trajectory length must be positive",
            ));
        }
        Ok(Kernel::FixedTime { length })
    }

    pub fn nuts(max_depth: u64, sampler: TrajectorySampler, criterion: Criterion) -> Result<Kernel> {
        if max_depth == 0 {
            return Err(SamplerError::BadConfig("max_depth must be at least 1"));
        }
        if matches!(sampler, TrajectorySampler::EndPoint) {
            return Err(SamplerError::BadConfig(
                "NUTS requires a slice or multinomial trajectory sampler",
            ));
        }
        Ok(Kernel::Nuts {
            max_depth,
            sampler,
            criterion,
        })
    }

    /// Multinomial NUTS with the generalized no-U-turn criterion.
    pub fn default_nuts() -> Kernel {
        Kernel::Nuts {
            max_depth: DEFAULT_MAX_DEPTH,
            sampler: TrajectorySampler::Multinomial,
            criterion: Criterion::GeneralizedNoUTurn,
        }
    }

    /// Run one transition from `start`, whose momentum must already be
    /// refreshed.
    pub(crate) fn transition<F, R>(
        &self,
        rng: &mut R,
        hamiltonian: &mut Hamiltonian<F>,
        integrator: &Integrator,
        start: &PhasePoint,
        max_energy_error: f64,
    ) -> Result<Transition>
    where
        F: LogpFunc,
        R: Rng + ?Sized,
    {
        match self {
            Kernel::Static { n_leapfrog } => static_transition(
                rng,
                hamiltonian,
                integrator,
                start,
                *n_leapfrog,
                max_energy_error,
            ),
            Kernel::FixedTime { length } => {
                let epsilon = integrator.sample_step_size(rng);
                let n_leapfrog = ((length / epsilon).round() as i64).max(1) as u64;
                static_transition_fixed(
                    rng,
                    hamiltonian,
                    integrator,
                    epsilon,
                    start,
                    n_leapfrog,
                    max_energy_error,
                )
            }
            Kernel::Nuts {
                max_depth,
                sampler,
                criterion,
            } => {
                let (draw, info, epsilon) = nuts_transition(
                    rng,
                    hamiltonian,
                    integrator,
                    start,
                    *sampler,
                    *criterion,
                    *max_depth,
                    max_energy_error,
                )?;
                let is_accept = draw.position != start.position;
                let stats = TransitionStats {
                    n_steps: info.n_steps,
                    is_accept,
                    acceptance_rate: info.mean_accept,
                    log_density: draw.logp,
                    hamiltonian_energy: draw.energy(),
                    numerical_error: info.divergence_info.is_some(),
                    step_size: epsilon,
                    nom_step_size: integrator.nominal_step_size(),
                    tree_depth: info.depth,
                    reached_max_depth: info.reached_max_depth,
                    divergence_info: info.divergence_info,
                };
                Ok(Transition { z: draw, stats })
            }
        }
    }
}

/// The result of one kernel transition: the new phase point and its
/// diagnostics.
#[derive(Debug, Clone)]
pub struct Transition {
    pub z: PhasePoint,
    pub stats: TransitionStats,
}

/// Diagnostic information about one transition.
#[derive(Debug, Clone)]
pub struct TransitionStats {
    /// Number of leapfrog steps computed for this transition.
    pub n_steps: u64,
    /// Whether the returned point differs from the starting point.
    pub is_accept: bool,
    /// The acceptance probability (static kernels) or the mean leaf
    /// acceptance statistic (NUTS). Feeds dual averaging.
    pub acceptance_rate: f64,
    /// Log-density at the returned point.
    pub log_density: f64,
    /// Total energy at the returned point.
    pub hamiltonian_energy: f64,
    /// Whether the trajectory diverged.
    pub numerical_error: bool,
    /// The step size used for this trajectory (after jitter).
    pub step_size: f64,
    /// The nominal step size of the integrator.
    pub nom_step_size: f64,
    /// Depth of the NUTS tree; zero for static kernels.
    pub tree_depth: u64,
    /// Whether NUTS stopped because it hit the depth limit.
    pub reached_max_depth: bool,
    /// Details of the divergence, if one occurred.
    pub divergence_info: Option<DivergenceInfo>,
}

fn static_transition<F, R>(
    rng: &mut R,
    hamiltonian: &mut Hamiltonian<F>,
    integrator: &Integrator,
    start: &PhasePoint,
    n_leapfrog: u64,
    max_energy_error: f64,
) -> Result<Transition>
where
    F: LogpFunc,
    R: Rng + ?Sized,
{
    let epsilon = integrator.sample_step_size(rng);
    static_transition_fixed(
        rng,
        hamiltonian,
        integrator,
        epsilon,
        start,
        n_leapfrog,
        max_energy_error,
    )
}

fn static_transition_fixed<F, R>(
    rng: &mut R,
    hamiltonian: &mut Hamiltonian<F>,
    integrator: &Integrator,
    epsilon: f64,
    start: &PhasePoint,
    n_leapfrog: u64,
    max_energy_error: f64,
) -> Result<Transition>
where
    F: LogpFunc,
    R: Rng + ?Sized,
{
    let initial_energy = start.energy();
    let frozen = integrator.frozen(epsilon);

    let mut stats = TransitionStats {
        n_steps: n_leapfrog,
        is_accept: false,
        acceptance_rate: 0.,
        log_density: start.logp,
        hamiltonian_energy: initial_energy,
        numerical_error: false,
        step_size: epsilon,
        nom_step_size: integrator.nominal_step_size(),
        tree_depth: 0,
        reached_max_depth: false,
        divergence_info: None,
    };

    match frozen.integrate_fixed(hamiltonian, start, epsilon, n_leapfrog) {
        IntegrationResult::Err(err) => Err(err),
        IntegrationResult::Divergent(_, info) => {
            stats.numerical_error = true;
            stats.divergence_info = Some(info);
            Ok(Transition {
                z: start.clone(),
                stats,
            })
        }
        IntegrationResult::Ok(end) => {
            let energy_error = end.energy() - initial_energy;
            if !(energy_error < max_energy_error) {
                stats.numerical_error = true;
                stats.divergence_info = Some(DivergenceInfo {
                    start_location: Some(start.position.clone()),
                    start_momentum: Some(start.momentum.clone()),
                    end_location: Some(end.position.clone()),
                    energy_error: Some(energy_error),
                });
                return Ok(Transition {
                    z: start.clone(),
                    stats,
                });
            }

            let accept_prob = (-energy_error).exp().min(1.);
            stats.acceptance_rate = accept_prob;
            let accept = accept_prob >= 1. || rng.gen_bool(accept_prob);
            let z = if accept {
                stats.is_accept = true;
                stats.log_density = end.logp;
                stats.hamiltonian_energy = end.energy();
                end
            } else {
                start.clone()
            };
            Ok(Transition { z, stats })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;
    use crate::sampler::test_logps::NormalLogp;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup() -> (StdRng, Hamiltonian<NormalLogp>, PhasePoint) {
        let mut rng = StdRng::seed_from_u64(11);
        let mut h = Hamiltonian::new(Metric::unit(4), NormalLogp::new(4, 0.));
        let z = h.init_phasepoint(&mut rng, &[0.3; 4]).unwrap();
        let z = h.refresh_momentum(&mut rng, &z);
        (rng, h, z)
    }

    #[test]
    fn rejects_bad_config() {
        assert!(Kernel::static_trajectory(0).is_err());
        assert!(Kernel::hmc_da(0.).is_err());
        assert!(Kernel::hmc_da(-1.).is_err());
        assert!(Kernel::nuts(
            0,
            TrajectorySampler::Multinomial,
            Criterion::GeneralizedNoUTurn
        )
        .is_err());
        assert!(Kernel::nuts(
            10,
            TrajectorySampler::EndPoint,
            Criterion::GeneralizedNoUTurn
        )
        .is_err());
    }

    #[test]
    fn static_kernel_transitions() {
        let (mut rng, mut h, z) = setup();
        let kernel = Kernel::static_trajectory(16).unwrap();
        let lf = Integrator::leapfrog(0.1).unwrap();
        let t = kernel
            .transition(&mut rng, &mut h, &lf, &z, MAX_ENERGY_ERROR)
            .unwrap();
        assert_eq!(t.stats.n_steps, 16);
        assert_eq!(t.stats.tree_depth, 0);
        assert!(t.stats.acceptance_rate > 0.5);
        assert!(!t.stats.numerical_error);
    }

    #[test]
    fn hmcda_step_count_follows_length() {
        let (mut rng, mut h, z) = setup();
        let kernel = Kernel::hmc_da(1.).unwrap();
        let lf = Integrator::leapfrog(0.1).unwrap();
        let t = kernel
            .transition(&mut rng, &mut h, &lf, &z, MAX_ENERGY_ERROR)
            .unwrap();
        assert_eq!(t.stats.n_steps, 10);
    }

    #[test]
    fn divergent_static_trajectory_keeps_start() {
        let (mut rng, mut h, z) = setup();
        let kernel = Kernel::static_trajectory(4).unwrap();
        let lf = Integrator::leapfrog(1e200).unwrap();
        let t = kernel
            .transition(&mut rng, &mut h, &lf, &z, MAX_ENERGY_ERROR)
            .unwrap();
        assert!(t.stats.numerical_error);
        assert!(!t.stats.is_accept);
        assert_eq!(t.stats.acceptance_rate, 0.);
        assert_eq!(t.z.position, z.position);
    }

    #[test]
    fn nuts_kernel_transitions() {
        let (mut rng, mut h, z) = setup();
        let kernel = Kernel::default_nuts();
        let lf = Integrator::leapfrog(0.25).unwrap();
        let t = kernel
            .transition(&mut rng, &mut h, &lf, &z, MAX_ENERGY_ERROR)
            .unwrap();
        assert!(t.stats.tree_depth >= 1);
        assert!(t.z.is_valid());
        assert_eq!(t.stats.nom_step_size, 0.25);
        assert_eq!(t.stats.step_size, 0.25);
    }
}
