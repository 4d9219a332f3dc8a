//! The sampling driver: the refresh → transition → adapt loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;

use crate::hamiltonian::{Hamiltonian, PhasePoint, Result, SamplerError};
use crate::integrator::Integrator;
use crate::kernel::{Kernel, Transition, TransitionStats, MAX_ENERGY_ERROR};
use crate::metric::Metric;
use crate::stepsize::find_initial_step_size;
use crate::target::LogpFunc;
use crate::warmup::{StanWarmup, WarmupOptions};

/// Settings of a sampling run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SamplerArgs {
    /// The number of adaptation steps at the start of the chain.
    pub n_adapts: u64,
    /// Energy error above which a trajectory counts as divergent.
    pub max_energy_error: f64,
    /// Step size to start adaptation from. `None` runs the doubling search
    /// for a reasonable value.
    pub initial_step_size: Option<f64>,
    /// Whether [`sample`] drops the adaptation draws from its output.
    pub drop_warmup: bool,
    /// The warmup schedule and its targets.
    pub warmup: WarmupOptions,
}

impl Default for SamplerArgs {
    fn default() -> Self {
        Self {
            n_adapts: 1000,
            max_energy_error: MAX_ENERGY_ERROR,
            initial_step_size: None,
            drop_warmup: true,
            warmup: WarmupOptions::default(),
        }
    }
}

/// A cooperative cancellation flag, checked between iterations only —
/// never mid-trajectory.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// A per-draw summary for progress reporting.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub draw: u64,
    pub tuning: bool,
    pub step_size: f64,
    pub num_steps: u64,
    pub divergent: bool,
}

/// Invoked at the end of each iteration. Callbacks may inspect the draw
/// but not mutate the sampler.
pub trait ProgressCallback {
    fn on_step(&mut self, progress: &Progress, position: &[f64], stats: &TransitionStats);
}

impl<T: FnMut(&Progress, &[f64], &TransitionStats)> ProgressCallback for T {
    fn on_step(&mut self, progress: &Progress, position: &[f64], stats: &TransitionStats) {
        self(progress, position, stats)
    }
}

fn no_progress() -> impl ProgressCallback {
    |_: &Progress, _: &[f64], _: &TransitionStats| {}
}

/// Propose new initial points for a sampler.
///
/// This trait can be implemented by users to control how different chains
/// should be initialized.
pub trait InitPointFunc {
    fn new_init_point<R: Rng + ?Sized>(&mut self, rng: &mut R, out: &mut [f64]);
}

/// Initialize chains using uniform jitter around zero or some other
/// provided value.
pub struct JitterInitFunc {
    mu: Option<Box<[f64]>>,
}

impl JitterInitFunc {
    /// Initialize new chains with jitter in [-1, 1] around zero.
    pub fn new() -> JitterInitFunc {
        JitterInitFunc { mu: None }
    }

    /// Initialize new chains with jitter in [mu - 1, mu + 1].
    pub fn new_with_mean(mu: Box<[f64]>) -> Self {
        Self { mu: Some(mu) }
    }
}

impl Default for JitterInitFunc {
    fn default() -> Self {
        JitterInitFunc::new()
    }
}

impl InitPointFunc for JitterInitFunc {
    fn new_init_point<R: Rng + ?Sized>(&mut self, rng: &mut R, out: &mut [f64]) {
        rng.fill(out);
        match self.mu.as_deref() {
            None => out.iter_mut().for_each(|val| *val = 2. * *val - 1.),
            Some(mu) => out
                .iter_mut()
                .zip(mu.iter().copied())
                .for_each(|(val, mu)| *val = 2. * *val - 1. + mu),
        }
    }
}

/// A single chain: owns the Hamiltonian, kernel, integrator, adaptation
/// state and RNG, and produces one draw at a time.
pub struct Sampler<F: LogpFunc, R: Rng> {
    hamiltonian: Hamiltonian<F>,
    kernel: Kernel,
    integrator: Integrator,
    warmup: Option<StanWarmup>,
    args: SamplerArgs,
    state: PhasePoint,
    rng: R,
    draw_count: u64,
}

impl<F: LogpFunc, R: Rng> Sampler<F, R> {
    /// Set up a chain at `init_position`.
    ///
    /// The metric is rebuilt to the target's dimension if it does not
    /// match; this is the only point where a dimension mismatch is
    /// tolerated.
    pub fn new(
        target: F,
        metric: Metric,
        kernel: Kernel,
        integrator: Integrator,
        args: SamplerArgs,
        init_position: &[f64],
        mut rng: R,
    ) -> Result<Sampler<F, R>> {
        let dim = target.dim();
        if init_position.len() != dim {
            return Err(SamplerError::BadConfig(
                "initial position does not match the target dimension",
            ));
        }
        let metric = if metric.dim() == dim {
            metric
        } else {
            metric.resized(dim)
        };

        let mut hamiltonian = Hamiltonian::new(metric, target);
        let state = hamiltonian.init_phasepoint(&mut rng, init_position)?;

        let mut integrator = integrator;
        let warmup = if args.n_adapts > 0 {
            let initial_step = match args.initial_step_size {
                Some(step) => step,
                None => find_initial_step_size(
                    &mut rng,
                    &mut hamiltonian,
                    &state,
                    integrator.nominal_step_size(),
                )?,
            };
            integrator = integrator.with_step_size(initial_step);
            Some(StanWarmup::new(
                &args.warmup,
                args.n_adapts,
                initial_step,
                hamiltonian.metric(),
            )?)
        } else {
            None
        };

        Ok(Sampler {
            hamiltonian,
            kernel,
            integrator,
            warmup,
            args,
            state,
            rng,
            draw_count: 0,
        })
    }

    pub fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    pub fn metric(&self) -> &Metric {
        self.hamiltonian.metric()
    }

    /// The integrator's current nominal step size.
    pub fn step_size(&self) -> f64 {
        self.integrator.nominal_step_size()
    }

    pub fn is_tuning(&self) -> bool {
        self.draw_count < self.args.n_adapts
    }

    /// Produce one draw: refresh the momentum, run the kernel, and feed
    /// the adaptors while tuning.
    pub fn draw(&mut self) -> Result<(Box<[f64]>, TransitionStats)> {
        let start = self
            .hamiltonian
            .refresh_momentum(&mut self.rng, &self.state);
        let Transition { z, stats } = self.kernel.transition(
            &mut self.rng,
            &mut self.hamiltonian,
            &self.integrator,
            &start,
            self.args.max_energy_error,
        )?;

        self.draw_count += 1;
        if self.draw_count <= self.args.n_adapts {
            if let Some(warmup) = self.warmup.as_mut() {
                let new_metric = warmup.adapt(self.draw_count, &z.position, stats.acceptance_rate);
                self.integrator = self.integrator.with_step_size(warmup.step_size());
                if let Some(metric) = new_metric {
                    self.hamiltonian.set_metric(metric);
                }
            }
        }

        self.state = z;
        Ok((self.state.position.clone(), stats))
    }
}

/// Run a chain for `n_samples` iterations and collect the draws.
///
/// The first `n_adapts` iterations adapt step size and mass matrix; they
/// are dropped from the output when `args.drop_warmup` is set.
#[allow(clippy::too_many_arguments)]
pub fn sample<F: LogpFunc, R: Rng>(
    target: F,
    metric: Metric,
    kernel: Kernel,
    integrator: Integrator,
    args: SamplerArgs,
    init_position: &[f64],
    rng: R,
    n_samples: u64,
) -> Result<Vec<(Box<[f64]>, TransitionStats)>> {
    sample_with(
        target,
        metric,
        kernel,
        integrator,
        args,
        init_position,
        rng,
        n_samples,
        &mut no_progress(),
        None,
    )
}

/// [`sample`] with a progress callback and a cancellation token.
///
/// Cancellation is honored between iterations; the draws gathered so far
/// are returned.
#[allow(clippy::too_many_arguments)]
pub fn sample_with<F: LogpFunc, R: Rng, C: ProgressCallback>(
    target: F,
    metric: Metric,
    kernel: Kernel,
    integrator: Integrator,
    args: SamplerArgs,
    init_position: &[f64],
    rng: R,
    n_samples: u64,
    callback: &mut C,
    cancel: Option<&CancelToken>,
) -> Result<Vec<(Box<[f64]>, TransitionStats)>> {
    let n_adapts = args.n_adapts;
    let drop_warmup = args.drop_warmup;
    let mut sampler = Sampler::new(target, metric, kernel, integrator, args, init_position, rng)?;

    let capacity = if drop_warmup {
        n_samples.saturating_sub(n_adapts)
    } else {
        n_samples
    };
    let mut draws = Vec::with_capacity(capacity as usize);

    for i in 1..=n_samples {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                break;
            }
        }
        let (position, stats) = sampler.draw()?;
        let progress = Progress {
            draw: i,
            tuning: i <= n_adapts,
            step_size: stats.step_size,
            num_steps: stats.n_steps,
            divergent: stats.numerical_error,
        };
        callback.on_step(&progress, &position, &stats);
        if !drop_warmup || i > n_adapts {
            draws.push((position, stats));
        }
    }
    Ok(draws)
}

/// Run a chain lazily, yielding one draw per iteration.
#[allow(clippy::too_many_arguments)]
pub fn sample_sequentially<F: LogpFunc, R: Rng>(
    target: F,
    metric: Metric,
    kernel: Kernel,
    integrator: Integrator,
    args: SamplerArgs,
    init_position: &[f64],
    rng: R,
    draws: u64,
) -> Result<impl Iterator<Item = Result<(Box<[f64]>, TransitionStats)>>> {
    let mut sampler = Sampler::new(target, metric, kernel, integrator, args, init_position, rng)?;
    Ok((0..draws).map(move |_| sampler.draw()))
}

pub mod test_logps {
    //! Analytic targets used by the test suites.

    use crate::target::{LogpError, LogpFunc};
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum NormalLogpError {}

    impl LogpError for NormalLogpError {
        fn is_recoverable(&self) -> bool {
            false
        }
    }

    /// Independent unit-variance normals centered at `mu`.
    #[derive(Clone, Debug)]
    pub struct NormalLogp {
        dim: usize,
        mu: f64,
    }

    impl NormalLogp {
        pub fn new(dim: usize, mu: f64) -> NormalLogp {
            NormalLogp { dim, mu }
        }
    }

    impl LogpFunc for NormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            let n = position.len();
            assert!(gradient.len() == n);

            let mut logp = 0f64;
            for (p, g) in position.iter().zip(gradient.iter_mut()) {
                let val = *p - self.mu;
                logp -= val * val / 2.;
                *g = -val;
            }
            Ok(logp)
        }
    }

    /// Independent zero-mean normals with per-dimension variances.
    #[derive(Clone, Debug)]
    pub struct DiagNormalLogp {
        sigma2: Box<[f64]>,
    }

    impl DiagNormalLogp {
        pub fn new(sigma2: Box<[f64]>) -> DiagNormalLogp {
            assert!(sigma2.iter().all(|&v| v > 0.));
            DiagNormalLogp { sigma2 }
        }
    }

    impl LogpFunc for DiagNormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.sigma2.len()
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            let mut logp = 0f64;
            for ((p, g), s2) in position
                .iter()
                .zip(gradient.iter_mut())
                .zip(self.sigma2.iter())
            {
                logp -= p * p / (2. * s2);
                *g = -p / s2;
            }
            Ok(logp)
        }
    }

    /// A zero-mean normal with AR(1) correlation: cov(xᵢ, xⱼ) = ρ^|i-j|.
    ///
    /// The precision matrix is tridiagonal, so the gradient is cheap.
    #[derive(Clone, Debug)]
    pub struct Ar1NormalLogp {
        dim: usize,
        rho: f64,
    }

    impl Ar1NormalLogp {
        pub fn new(dim: usize, rho: f64) -> Ar1NormalLogp {
            assert!(dim >= 2);
            assert!(rho.abs() < 1.);
            Ar1NormalLogp { dim, rho }
        }

        pub fn covariance(&self, i: usize, j: usize) -> f64 {
            self.rho.powi((i as i32 - j as i32).abs())
        }
    }

    impl LogpFunc for Ar1NormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            let n = position.len();
            let rho = self.rho;
            let scale = (1. - rho * rho).recip();

            let mut logp = 0f64;
            for i in 0..n {
                let prec_x = if i == 0 {
                    scale * (position[0] - rho * position[1])
                } else if i == n - 1 {
                    scale * (position[n - 1] - rho * position[n - 2])
                } else {
                    scale * ((1. + rho * rho) * position[i]
                        - rho * (position[i - 1] + position[i + 1]))
                };
                gradient[i] = -prec_x;
                logp -= 0.5 * position[i] * prec_x;
            }
            Ok(logp)
        }
    }
}
