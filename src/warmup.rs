//! The Stan-style three-phase warmup scheduler.
//!
//! Adaptation runs in three phases: a fast initial buffer where only the
//! step size adapts, a series of doubling windows that additionally
//! estimate the mass matrix, and a terminal buffer that lets the step size
//! settle against the final metric.

use serde::Serialize;

use crate::mass_adapt::MassMatrixAdaptor;
use crate::metric::Metric;
use crate::stepsize::{DualAverage, DualAverageOptions};

/// Settings of the warmup schedule.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WarmupOptions {
    pub init_buffer: u64,
    pub term_buffer: u64,
    pub window_size: u64,
    pub target_accept: f64,
    pub dual_average: DualAverageOptions,
}

impl Default for WarmupOptions {
    fn default() -> Self {
        Self {
            init_buffer: 75,
            term_buffer: 50,
            window_size: 25,
            target_accept: 0.8,
            dual_average: DualAverageOptions::default(),
        }
    }
}

/// The window layout of one warmup run, computed once up front.
///
/// Sample indices are 1-based. Mass matrix samples are collected for
/// `window_start <= i <= window_end`; at each split the metric is rebuilt
/// and the estimator reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupSchedule {
    pub window_start: u64,
    pub window_end: u64,
    pub splits: Vec<u64>,
}

impl WarmupSchedule {
    pub fn new(n_adapts: u64, options: &WarmupOptions) -> WarmupSchedule {
        let mut init_buffer = options.init_buffer;
        let mut term_buffer = options.term_buffer;
        let mut window_size = options.window_size;

        if init_buffer + term_buffer + window_size > n_adapts {
            // Not enough room for the standard layout; shrink the buffers
            // and use a single window in between.
            init_buffer = (0.15 * n_adapts as f64) as u64;
            term_buffer = (0.1 * n_adapts as f64) as u64;
            window_size = n_adapts - init_buffer - term_buffer;
        }

        let window_start = init_buffer + 1;
        let window_end = n_adapts - term_buffer;

        let mut splits = Vec::new();
        let mut width = window_size;
        let mut next = init_buffer + width;
        while next < window_end {
            // The final window is extended instead of leaving a remainder
            // shorter than the next doubling.
            let split = if next + 2 * width >= window_end {
                window_end
            } else {
                next
            };
            splits.push(split);
            if split == window_end {
                break;
            }
            width *= 2;
            next = split + width;
        }
        if splits.is_empty() && window_end >= window_start {
            splits.push(window_end);
        }

        WarmupSchedule {
            window_start,
            window_end,
            splits,
        }
    }

    /// Whether sample `i` (1-based) falls in a mass matrix window.
    pub fn in_window(&self, i: u64) -> bool {
        i >= self.window_start && i <= self.window_end
    }

    /// Whether sample `i` closes a mass matrix window.
    pub fn is_split(&self, i: u64) -> bool {
        self.splits.binary_search(&i).is_ok()
    }
}

/// The composite warmup adaptor: dual-averaging step size plus windowed
/// mass matrix estimation.
#[derive(Debug)]
pub struct StanWarmup {
    step_size: DualAverage,
    mass_matrix: MassMatrixAdaptor,
    schedule: WarmupSchedule,
    n_adapts: u64,
    finalized: bool,
}

impl StanWarmup {
    pub fn new(
        options: &WarmupOptions,
        n_adapts: u64,
        initial_step: f64,
        metric: &Metric,
    ) -> crate::hamiltonian::Result<StanWarmup> {
        let step_size = DualAverage::new(options.dual_average, options.target_accept, initial_step)?;
        Ok(StanWarmup {
            step_size,
            mass_matrix: MassMatrixAdaptor::for_metric(metric),
            schedule: WarmupSchedule::new(n_adapts, options),
            n_adapts,
            finalized: false,
        })
    }

    pub fn schedule(&self) -> &WarmupSchedule {
        &self.schedule
    }

    /// The step size the integrator should use right now: the noisy
    /// dual-averaging iterate during warmup, the smoothed estimate once
    /// adaptation has finalized.
    pub fn step_size(&self) -> f64 {
        if self.finalized {
            self.step_size.adapted_step_size()
        } else {
            self.step_size.current_step_size()
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Process sample `i` (1-based, `i <= n_adapts`). Returns a
    /// replacement metric when a window closed and produced one.
    pub fn adapt(&mut self, i: u64, position: &[f64], accept_stat: f64) -> Option<Metric> {
        debug_assert!(i >= 1 && i <= self.n_adapts);

        self.step_size.advance(accept_stat);

        let mut new_metric = None;
        if self.schedule.in_window(i) {
            self.mass_matrix.push(position);
            if self.schedule.is_split(i) {
                new_metric = self.mass_matrix.finalize();
                self.mass_matrix.reset();
                // A restart right before the commit below would throw the
                // accumulated estimate away.
                if i < self.n_adapts {
                    let current = self.step_size.current_step_size();
                    self.step_size.restart(current);
                    log::debug!(
                        "mass matrix window closed at sample {i}, step size restarted at {current:.3e}"
                    );
                }
            }
        }

        if i == self.n_adapts {
            self.finalized = true;
            log::debug!(
                "warmup finished, committing step size {:.3e}",
                self.step_size.adapted_step_size()
            );
        }
        new_metric
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_schedule_for_1000_adapts() {
        let schedule = WarmupSchedule::new(1000, &WarmupOptions::default());
        assert_eq!(schedule.splits, vec![100, 150, 250, 450, 950]);
        assert_eq!(schedule.window_start, 76);
        assert_eq!(schedule.window_end, 950);
    }

    #[test]
    fn degenerate_schedule_collapses_to_one_window() {
        let schedule = WarmupSchedule::new(100, &WarmupOptions::default());
        assert_eq!(schedule.window_start, 16);
        assert_eq!(schedule.window_end, 90);
        assert_eq!(schedule.splits, vec![90]);
    }

    #[test]
    fn schedule_is_consistent_across_sizes() {
        for n_adapts in [20, 50, 100, 150, 151, 500, 1000, 5000, 10_000] {
            let schedule = WarmupSchedule::new(n_adapts, &WarmupOptions::default());
            assert!(!schedule.splits.is_empty(), "n_adapts = {n_adapts}");
            assert!(schedule.window_start <= schedule.window_end);
            let mut previous = 0;
            for &split in &schedule.splits {
                assert!(split > previous, "splits not increasing: {schedule:?}");
                assert!(split >= schedule.window_start);
                assert!(split <= schedule.window_end);
                previous = split;
            }
            assert_eq!(*schedule.splits.last().unwrap(), schedule.window_end);
        }
    }

    #[test]
    fn phases_drive_mass_matrix_updates() {
        let metric = Metric::diag(vec![1.; 2].into()).unwrap();
        let mut warmup = StanWarmup::new(&WarmupOptions::default(), 1000, 0.1, &metric).unwrap();

        let mut updates = vec![];
        for i in 1..=1000u64 {
            let x = (i as f64 * 0.37).sin();
            if warmup.adapt(i, &[x, 2. * x], 0.8).is_some() {
                updates.push(i);
            }
        }
        assert_eq!(updates, vec![100, 150, 250, 450, 950]);
        assert!(warmup.is_finalized());
        assert!(warmup.step_size() > 0.);
    }

    #[test]
    fn split_on_last_sample_still_commits_the_step_size() {
        // With n_adapts = 8 the terminal buffer is empty and the single
        // mass matrix window closes on the final sample.
        let schedule = WarmupSchedule::new(8, &WarmupOptions::default());
        assert_eq!(schedule.splits, vec![8]);

        let metric = Metric::diag(vec![1.; 2].into()).unwrap();
        let mut warmup = StanWarmup::new(&WarmupOptions::default(), 8, 0.1, &metric).unwrap();
        for i in 1..=8u64 {
            let x = (i as f64 * 0.37).sin();
            warmup.adapt(i, &[x, 2. * x], 0.1);
        }
        assert!(warmup.is_finalized());
        // Acceptance far below target shrinks the step size; the committed
        // value must reflect that instead of a freshly reset estimate.
        assert!(warmup.step_size() < 0.1, "{}", warmup.step_size());
    }

    #[test]
    fn unit_metric_only_adapts_step_size() {
        let metric = Metric::unit(2);
        let mut warmup = StanWarmup::new(&WarmupOptions::default(), 200, 0.1, &metric).unwrap();
        for i in 1..=200u64 {
            assert!(warmup.adapt(i, &[1., 2.], 0.5).is_none());
        }
        assert!(warmup.is_finalized());
    }
}
