//! No-U-turn termination criteria for dynamic trajectories.

use serde::Serialize;

use crate::hamiltonian::PhasePoint;
use crate::math::{sub_out, vector_dot};

/// When to stop doubling a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Criterion {
    /// The original Hoffman & Gelman test on the endpoints:
    /// `(θ⁺-θ⁻)·r⁻ < 0 ∨ (θ⁺-θ⁻)·r⁺ < 0`.
    ClassicNoUTurn,
    /// The generalized test using the integrated momentum ρ:
    /// `ρ·M⁻¹r⁻ < 0 ∨ ρ·M⁻¹r⁺ < 0`.
    GeneralizedNoUTurn,
}

impl Criterion {
    /// Whether the trajectory spanned by `left` and `right` with momentum
    /// sum `rho` has turned back on itself.
    ///
    /// `left` and `right` are in trajectory order. The generalized variant
    /// reads the velocities cached on the endpoints, so no metric product
    /// is recomputed here.
    pub(crate) fn is_turning(
        &self,
        left: &PhasePoint,
        right: &PhasePoint,
        rho: &[f64],
        scratch: &mut [f64],
    ) -> bool {
        match self {
            Criterion::ClassicNoUTurn => {
                sub_out(&right.position, &left.position, scratch);
                (vector_dot(scratch, &left.momentum) < 0.)
                    | (vector_dot(scratch, &right.momentum) < 0.)
            }
            Criterion::GeneralizedNoUTurn => {
                (vector_dot(rho, &left.velocity) < 0.) | (vector_dot(rho, &right.velocity) < 0.)
            }
        }
    }

    /// Whether this criterion also checks the half-trees around a merge.
    pub(crate) fn checks_subtrees(&self) -> bool {
        matches!(self, Criterion::GeneralizedNoUTurn)
    }
}
