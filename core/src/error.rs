//! Error conditions surfaced by the filter.
//!
//! None of these are fatal: every variant describes a cycle (or a call) that was rejected and
//! left the filter's belief untouched.

use thiserror::Error;

/// Reasons a resampling pass could not produce a new generation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResampleError {
    #[error("cannot resample an empty particle set")]
    EmptySet,
    #[error("cannot resample to zero particles")]
    ZeroTarget,
    /// The weights sum to zero or to a non-finite value, typically because every particle
    /// disagrees badly with the scan. The caller should treat this as "localization lost".
    #[error("degenerate particle weights (total = {total})")]
    DegenerateWeights { total: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("invalid seeding region: {0}")]
    InvalidRegion(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The scan itself is malformed: non-finite bearings or a range interval that does not
    /// overlap the configured one.
    #[error("invalid observation: {0}")]
    InvalidObservation(String),
    /// Even the best particle explains the scan no better than random returns would.
    #[error("no particle explains the observation (best match ratio {match_ratio:.3})")]
    UnexplainedObservation { match_ratio: f64 },
    #[error(transparent)]
    Resample(#[from] ResampleError),
}

impl FilterError {
    /// True if the error signals that the particle weights collapsed, either numerically or
    /// because no particle is supported by the scan.
    pub fn is_degenerate(&self) -> bool {
        matches!(
            self,
            FilterError::Resample(ResampleError::DegenerateWeights { .. })
                | FilterError::UnexplainedObservation { .. }
        )
    }
}
