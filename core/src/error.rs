//! Error types for the particle filter

use thiserror::Error;

/// Errors reported by [`ParticleFilter`](crate::particle::ParticleFilter) operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    /// An operation that needs a particle population ran before `initialize`.
    ///
    /// Returned by `predict`, `update_weights`, `resample`, `set_weights`, `estimate`, and `covariance`.
    #[error("particle filter used before initialization")]
    NotInitialized,

    /// A configuration value or per-call parameter was out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Every particle weight is zero (or the weight total is not finite), so the population can no
    /// longer be resampled.
    #[error("particle filter diverged: weight total {total_weight:e} over {num_particles} particles")]
    Divergence {
        total_weight: f64,
        num_particles: usize,
    },
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// Reject standard deviations that are negative or not finite.
pub(crate) fn check_non_negative(name: &str, values: &[f64]) -> Result<()> {
    match values.iter().find(|v| !v.is_finite() || **v < 0.0) {
        Some(bad) => Err(FilterError::InvalidConfig(format!(
            "{name} must be finite and non-negative, got {bad}"
        ))),
        None => Ok(()),
    }
}

/// Reject values that are zero, negative, or not finite.
pub(crate) fn check_positive(name: &str, values: &[f64]) -> Result<()> {
    match values.iter().find(|v| !v.is_finite() || **v <= 0.0) {
        Some(bad) => Err(FilterError::InvalidConfig(format!(
            "{name} must be finite and strictly positive, got {bad}"
        ))),
        None => Ok(()),
    }
}
