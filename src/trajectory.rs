//! Dynamic trajectories: NUTS tree doubling and trajectory sampling.

use rand::Rng;
use serde::Serialize;

use crate::hamiltonian::{DivergenceInfo, Hamiltonian, PhasePoint, Result, SamplerError};
use crate::integrator::{IntegrationResult, Integrator};
use crate::math::{axpy, logaddexp};
use crate::target::LogpFunc;
use crate::termination::Criterion;

/// How a candidate is selected from the points of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrajectorySampler {
    /// Metropolis-Hastings acceptance of the trajectory endpoint. Used by
    /// the static kernels.
    EndPoint,
    /// Uniform selection among the points falling inside a slice drawn at
    /// the initial energy.
    Slice,
    /// Selection proportional to exp(-H), accumulated in log space.
    Multinomial,
}

#[derive(Debug, Copy, Clone)]
pub(crate) enum Direction {
    Forward,
    Backward,
}

impl rand::distributions::Distribution<Direction> for rand::distributions::Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.gen::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Per-trajectory constants of one NUTS transition.
pub(crate) struct TreeConfig<'a> {
    pub integrator: &'a Integrator,
    pub sampler: TrajectorySampler,
    pub criterion: Criterion,
    pub initial_energy: f64,
    /// ln(u) of the slice variable, relative to the initial energy.
    pub log_slice: f64,
    pub max_energy_error: f64,
}

/// A part of the trajectory tree during NUTS sampling.
struct NutsTree {
    /// The leftmost point of the trajectory covered by this tree.
    /// Leapfrogs in backward direction replace it.
    left: PhasePoint,
    right: PhasePoint,

    /// A draw from the trajectory between `left` and `right`.
    draw: PhasePoint,

    /// logsumexp of -(H - H₀) over all points (multinomial weighting).
    log_size: f64,
    /// Number of points inside the slice (slice weighting).
    n_accepted: u64,
    /// Σ r over all points of the tree.
    rho: Box<[f64]>,

    depth: u64,
    /// Number of leapfrog steps taken for this tree.
    n_leaves: u64,
    /// Σ min(1, exp(-(H - H₀))) over the leaves, for dual averaging.
    sum_accept: f64,

    /// A tree is the main tree if it contains the initial point of the
    /// trajectory. Candidate selection is biased only at that level.
    is_main: bool,
}

enum ExtendResult {
    /// The tree extension succeeded and the termination criterion was not
    /// reached.
    Ok(NutsTree),
    /// Tree extension succeeded and the termination criterion was reached.
    Turning(NutsTree),
    /// A divergence happened during tree extension.
    Diverging(NutsTree, DivergenceInfo),
    /// An unrecoverable error happened during a leapfrog step.
    Err(SamplerError),
}

impl NutsTree {
    fn new(state: PhasePoint) -> NutsTree {
        let rho = state.momentum.clone();
        NutsTree {
            left: state.clone(),
            right: state.clone(),
            draw: state,
            log_size: 0.,
            n_accepted: 1,
            rho,
            depth: 0,
            n_leaves: 0,
            sum_accept: 0.,
            is_main: true,
        }
    }

    /// Double the tree once in `direction`, consuming it.
    fn extend<F, R>(
        mut self,
        rng: &mut R,
        hamiltonian: &mut Hamiltonian<F>,
        config: &TreeConfig,
        direction: Direction,
    ) -> ExtendResult
    where
        F: LogpFunc,
        R: Rng + ?Sized,
    {
        let mut other = match self.single_step(hamiltonian, config, direction) {
            Ok(Ok(tree)) => tree,
            Ok(Err(info)) => {
                // The divergent leaf still counts toward the acceptance
                // statistic, with probability zero.
                self.n_leaves += 1;
                return ExtendResult::Diverging(self, info);
            }
            Err(err) => return ExtendResult::Err(err),
        };

        while other.depth < self.depth {
            other = match other.extend(rng, hamiltonian, config, direction) {
                ExtendResult::Ok(tree) => tree,
                ExtendResult::Turning(tree) => {
                    self.absorb_stats(&tree);
                    return ExtendResult::Turning(self);
                }
                ExtendResult::Diverging(tree, info) => {
                    self.absorb_stats(&tree);
                    return ExtendResult::Diverging(self, info);
                }
                ExtendResult::Err(err) => return ExtendResult::Err(err),
            };
        }

        let turning = self.check_turning(&other, config, direction);
        self.merge_into(other, rng, direction, config.sampler);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    /// The termination test over the tree combined with `other`, including
    /// the generalized criterion's checks across the join.
    fn check_turning(&self, other: &NutsTree, config: &TreeConfig, direction: Direction) -> bool {
        let (tree_left, tree_right) = match direction {
            Direction::Forward => (self, other),
            Direction::Backward => (other, self),
        };

        let dim = self.rho.len();
        let mut scratch = vec![0f64; dim];

        let mut rho = tree_left.rho.clone();
        axpy(&tree_right.rho, &mut rho, 1.);
        let mut turning = config.criterion.is_turning(
            &tree_left.left,
            &tree_right.right,
            &rho,
            &mut scratch,
        );

        if config.criterion.checks_subtrees() && self.depth > 0 {
            if !turning {
                // Left half: the left tree plus the first point of the
                // right tree.
                let mut rho_half = tree_left.rho.clone();
                axpy(&tree_right.left.momentum, &mut rho_half, 1.);
                turning = config.criterion.is_turning(
                    &tree_left.left,
                    &tree_right.left,
                    &rho_half,
                    &mut scratch,
                );
            }
            if !turning {
                // Right half, mirrored.
                let mut rho_half = tree_right.rho.clone();
                axpy(&tree_left.right.momentum, &mut rho_half, 1.);
                turning = config.criterion.is_turning(
                    &tree_left.right,
                    &tree_right.right,
                    &rho_half,
                    &mut scratch,
                );
            }
        }

        turning
    }

    /// Progressive sampling: merge `other` into the tree, possibly taking
    /// over its candidate. At the main level the swap is biased toward the
    /// new half; inside subtrees it keeps the selection unbiased.
    fn merge_into<R: Rng + ?Sized>(
        &mut self,
        other: NutsTree,
        rng: &mut R,
        direction: Direction,
        sampler: TrajectorySampler,
    ) {
        debug_assert!(self.depth == other.depth);

        let log_size = logaddexp(self.log_size, other.log_size);
        let n_accepted = self.n_accepted + other.n_accepted;

        let swap_prob = match sampler {
            TrajectorySampler::Multinomial => {
                let reference = if self.is_main { self.log_size } else { log_size };
                (other.log_size - reference).exp()
            }
            TrajectorySampler::Slice | TrajectorySampler::EndPoint => {
                let reference = if self.is_main {
                    self.n_accepted
                } else {
                    n_accepted
                };
                if reference == 0 {
                    if other.n_accepted > 0 {
                        1.
                    } else {
                        0.
                    }
                } else {
                    other.n_accepted as f64 / reference as f64
                }
            }
        };
        if swap_prob >= 1. {
            self.draw = other.draw;
        } else if swap_prob > 0. && rng.gen_bool(swap_prob) {
            self.draw = other.draw;
        }

        match direction {
            Direction::Forward => self.right = other.right,
            Direction::Backward => self.left = other.left,
        }
        axpy(&other.rho, &mut self.rho, 1.);
        self.n_leaves += other.n_leaves;
        self.sum_accept += other.sum_accept;
        self.depth += 1;
        self.log_size = log_size;
        self.n_accepted = n_accepted;
    }

    /// Fold a discarded subtree's leapfrog counters into this tree so the
    /// acceptance statistic still covers every computed leaf.
    fn absorb_stats(&mut self, other: &NutsTree) {
        self.n_leaves += other.n_leaves;
        self.sum_accept += other.sum_accept;
    }

    /// One leapfrog step off the tip of the tree: the base case of the
    /// doubling recursion.
    fn single_step<F: LogpFunc>(
        &self,
        hamiltonian: &mut Hamiltonian<F>,
        config: &TreeConfig,
        direction: Direction,
    ) -> Result<std::result::Result<NutsTree, DivergenceInfo>> {
        let (start, sign) = match direction {
            Direction::Forward => (&self.right, 1.),
            Direction::Backward => (&self.left, -1.),
        };
        let epsilon = sign * config.integrator.nominal_step_size();

        let end = match config.integrator.integrate_fixed(hamiltonian, start, epsilon, 1) {
            IntegrationResult::Ok(end) => end,
            IntegrationResult::Divergent(_, info) => return Ok(Err(info)),
            IntegrationResult::Err(err) => return Err(err),
        };

        let energy_error = end.energy() - config.initial_energy;
        if !(energy_error < config.max_energy_error) {
            let info = DivergenceInfo {
                start_location: Some(start.position.clone()),
                start_momentum: Some(start.momentum.clone()),
                end_location: Some(end.position.clone()),
                energy_error: Some(energy_error),
            };
            return Ok(Err(info));
        }

        let log_size = -energy_error;
        let n_accepted = u64::from(config.log_slice <= -energy_error);
        let accept_prob = (-energy_error).exp().min(1.);
        let rho = end.momentum.clone();

        Ok(Ok(NutsTree {
            left: end.clone(),
            right: end.clone(),
            draw: end,
            log_size,
            n_accepted,
            rho,
            depth: 0,
            n_leaves: 1,
            sum_accept: accept_prob,
            is_main: false,
        }))
    }
}

/// Diagnostics of one NUTS transition.
#[derive(Debug)]
pub(crate) struct NutsInfo {
    pub depth: u64,
    pub n_steps: u64,
    pub mean_accept: f64,
    pub reached_max_depth: bool,
    pub divergence_info: Option<DivergenceInfo>,
}

/// Run one NUTS transition: repeated doubling from `start` until a U-turn,
/// a divergence or the depth limit.
///
/// The momentum of `start` must already be refreshed. Returns the new phase
/// point, diagnostics, and the step size that was used for the trajectory.
pub(crate) fn nuts_transition<F, R>(
    rng: &mut R,
    hamiltonian: &mut Hamiltonian<F>,
    integrator: &Integrator,
    start: &PhasePoint,
    sampler: TrajectorySampler,
    criterion: Criterion,
    max_depth: u64,
    max_energy_error: f64,
) -> Result<(PhasePoint, NutsInfo, f64)>
where
    F: LogpFunc,
    R: Rng + ?Sized,
{
    debug_assert!(!matches!(sampler, TrajectorySampler::EndPoint));

    let epsilon = integrator.sample_step_size(rng);
    let frozen = integrator.frozen(epsilon);

    let log_slice = match sampler {
        TrajectorySampler::Slice => rng.gen::<f64>().ln(),
        _ => 0.,
    };

    let config = TreeConfig {
        integrator: &frozen,
        sampler,
        criterion,
        initial_energy: start.energy(),
        log_slice,
        max_energy_error,
    };

    let mut tree = NutsTree::new(start.clone());
    let mut divergence_info = None;
    let mut reached_max_depth = true;

    while tree.depth < max_depth {
        let direction: Direction = rng.gen();
        tree = match tree.extend(rng, hamiltonian, &config, direction) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                reached_max_depth = false;
                divergence_info = None;
                tree
            }
            ExtendResult::Diverging(tree, info) => {
                reached_max_depth = false;
                divergence_info = Some(info);
                tree
            }
            ExtendResult::Err(err) => return Err(err),
        };
        if !reached_max_depth || divergence_info.is_some() {
            break;
        }
    }

    let info = NutsInfo {
        depth: tree.depth,
        n_steps: tree.n_leaves,
        mean_accept: tree.sum_accept / (tree.n_leaves.max(1) as f64),
        reached_max_depth: reached_max_depth && tree.depth == max_depth,
        divergence_info,
    };
    Ok((tree.draw, info, epsilon))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;
    use crate::sampler::test_logps::NormalLogp;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn run_transition(
        sampler: TrajectorySampler,
        criterion: Criterion,
    ) -> (PhasePoint, NutsInfo) {
        let mut rng = StdRng::seed_from_u64(7);
        let mut h = Hamiltonian::new(Metric::unit(5), NormalLogp::new(5, 0.));
        let z = h.init_phasepoint(&mut rng, &[0.5; 5]).unwrap();
        let z = h.refresh_momentum(&mut rng, &z);
        let lf = Integrator::leapfrog(0.2).unwrap();
        let (draw, info, eps) =
            nuts_transition(&mut rng, &mut h, &lf, &z, sampler, criterion, 10, 1000.).unwrap();
        assert_eq!(eps, 0.2);
        (draw, info)
    }

    #[test]
    fn trajectory_terminates_below_max_depth() {
        for sampler in [TrajectorySampler::Multinomial, TrajectorySampler::Slice] {
            for criterion in [Criterion::GeneralizedNoUTurn, Criterion::ClassicNoUTurn] {
                let (draw, info) = run_transition(sampler, criterion);
                assert!(draw.is_valid());
                assert!(info.depth >= 1);
                assert!(info.depth < 10, "unexpected depth {}", info.depth);
                assert!(!info.reached_max_depth);
                assert!(info.divergence_info.is_none());
                assert!(info.n_steps > 0);
                assert!(info.mean_accept > 0. && info.mean_accept <= 1.);
            }
        }
    }

    #[test]
    fn max_depth_is_respected() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut h = Hamiltonian::new(Metric::unit(3), NormalLogp::new(3, 0.));
        let z = h.init_phasepoint(&mut rng, &[0.1; 3]).unwrap();
        let z = h.refresh_momentum(&mut rng, &z);
        // A tiny step size cannot make a U-turn within depth 3.
        let lf = Integrator::leapfrog(1e-4).unwrap();
        let (_, info, _) = nuts_transition(
            &mut rng,
            &mut h,
            &lf,
            &z,
            TrajectorySampler::Multinomial,
            Criterion::GeneralizedNoUTurn,
            3,
            1000.,
        )
        .unwrap();
        assert_eq!(info.depth, 3);
        assert!(info.reached_max_depth);
        assert_eq!(info.n_steps, 7);
    }

    #[test]
    fn divergent_trajectory_reports_info() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut h = Hamiltonian::new(Metric::unit(3), NormalLogp::new(3, 0.));
        let z = h.init_phasepoint(&mut rng, &[50., 50., 50.]).unwrap();
        let z = h.refresh_momentum(&mut rng, &z);
        // Far in the tails with a large step the energy error explodes.
        let lf = Integrator::leapfrog(30.).unwrap();
        let (draw, info, _) = nuts_transition(
            &mut rng,
            &mut h,
            &lf,
            &z,
            TrajectorySampler::Multinomial,
            Criterion::GeneralizedNoUTurn,
            10,
            1000.,
        )
        .unwrap();
        assert!(draw.is_valid());
        assert!(info.divergence_info.is_some());
    }
}
