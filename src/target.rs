//! The target distribution interface.
//!
//! The sampler only ever sees the target through [`LogpFunc`]: a callable
//! that evaluates the un-normalized log-density and its gradient at a
//! position. Automatic differentiation, marginalization and any model
//! structure live on the caller's side of this boundary.

/// Errors that happen when we evaluate the log-density and gradient function.
pub trait LogpError: std::error::Error + Send + Sync + 'static {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// An un-normalized log-density on ℝᴰ with gradient.
///
/// The function must be deterministic for a given position. It takes
/// `&mut self` so that implementations can reuse internal buffers, but it
/// is pure from the sampler's perspective.
pub trait LogpFunc {
    type LogpError: LogpError;

    /// The number of dimensions of the distribution.
    fn dim(&self) -> usize;

    /// Compute the log-density at `position` and store the gradient in
    /// `gradient`.
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;
}
