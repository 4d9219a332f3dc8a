//! Sample from continuous distributions on ℝᴰ using Hamiltonian Monte
//! Carlo and the No U-turn Sampler (NUTS). For details see the original
//! [NUTS paper](https://arxiv.org/abs/1111.4246) and the more recent
//! [introduction](https://arxiv.org/abs/1701.02434).
//!
//! The crate provides the building blocks of adaptive HMC as closed sets
//! of variants: metrics (unit, diagonal, dense), leapfrog integrators
//! (plain, jittered, tempered), transition kernels (static, fixed-time,
//! NUTS with slice or multinomial sampling and classic or generalized
//! U-turn checks), and the Stan-style warmup that tunes step size and mass
//! matrix. The caller provides a log-density with gradient and an RNG.
//!
//! ## Usage
//!
//! ```
//! use hmc_rs::{sample, Integrator, Kernel, LogpError, LogpFunc, Metric, SamplerArgs};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use thiserror::Error;
//!
//! // Define a function that computes the unnormalized posterior density
//! // and its gradient.
//! #[derive(Debug)]
//! struct PosteriorDensity {}
//!
//! // The density might fail in a recoverable or non-recoverable manner...
//! #[derive(Debug, Error)]
//! enum PosteriorLogpError {}
//! impl LogpError for PosteriorLogpError {
//!     fn is_recoverable(&self) -> bool { false }
//! }
//!
//! impl LogpFunc for PosteriorDensity {
//!     type LogpError = PosteriorLogpError;
//!
//!     // We define a 10 dimensional normal distribution
//!     fn dim(&self) -> usize { 10 }
//!
//!     // The normal likelihood with mean 3 and its gradient.
//!     fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
//!         let mu = 3f64;
//!         let logp = position
//!             .iter()
//!             .copied()
//!             .zip(grad.iter_mut())
//!             .map(|(x, grad)| {
//!                 let diff = x - mu;
//!                 *grad = -diff;
//!                 -diff * diff / 2f64
//!             })
//!             .sum();
//!         Ok(logp)
//!     }
//! }
//!
//! // Tune for 200 iterations, then keep the 200 draws that follow.
//! let mut args = SamplerArgs::default();
//! args.n_adapts = 200;
//!
//! let rng = StdRng::seed_from_u64(42);
//! let draws = sample(
//!     PosteriorDensity {},
//!     Metric::diag(vec![1f64; 10].into())?,
//!     Kernel::default_nuts(),
//!     Integrator::leapfrog(0.1)?,
//!     args,
//!     &vec![0f64; 10],
//!     rng,
//!     400,
//! )?;
//!
//! assert_eq!(draws.len(), 200);
//! for (draw, stats) in &draws {
//!     assert_eq!(draw.len(), 10);
//!     // Divergences are data, not errors.
//!     if stats.numerical_error {
//!         println!("divergence at energy {}", stats.hamiltonian_energy);
//!     }
//! }
//! # Ok::<(), hmc_rs::SamplerError>(())
//! ```
//!
//! ## Implementation details
//!
//! This crate mostly follows the implementation of NUTS in
//! [Stan](https://mc-stan.org): multinomial sampling over the trajectory,
//! a generalized no-U-turn criterion checked across subtrees, dual
//! averaging of the step size, and the three-phase windowed warmup with
//! regularized Welford estimators for the mass matrix.

pub(crate) mod hamiltonian;
pub(crate) mod integrator;
pub(crate) mod kernel;
pub(crate) mod mass_adapt;
pub(crate) mod math;
pub(crate) mod metric;
pub(crate) mod sampler;
pub(crate) mod stepsize;
pub(crate) mod target;
pub(crate) mod termination;
pub(crate) mod trajectory;
pub(crate) mod warmup;
pub(crate) mod welford;

pub use hamiltonian::{DivergenceInfo, Hamiltonian, PhasePoint, SamplerError};
pub use integrator::{IntegrationResult, Integrator};
pub use kernel::{Kernel, Transition, TransitionStats, DEFAULT_MAX_DEPTH, MAX_ENERGY_ERROR};
pub use mass_adapt::MassMatrixAdaptor;
pub use metric::{Metric, MetricError};
pub use sampler::test_logps;
pub use sampler::{
    sample, sample_sequentially, sample_with, CancelToken, InitPointFunc, JitterInitFunc, Progress,
    ProgressCallback, Sampler, SamplerArgs,
};
pub use stepsize::{DualAverage, DualAverageOptions};
pub use target::{LogpError, LogpFunc};
pub use termination::Criterion;
pub use trajectory::TrajectorySampler;
pub use warmup::{StanWarmup, WarmupOptions, WarmupSchedule};
pub use welford::{RunningCovariance, RunningVariance};
