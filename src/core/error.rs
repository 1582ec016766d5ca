use thiserror::Error;

/// Failure modes of the simulation chain.
///
/// Core errors (builder, engine) are deterministic given the same inputs and
/// seed, so callers should not retry them unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    /// Coupling vector or initial state has the wrong length.
    #[error("dimension mismatch: expected {expected} values, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Input resolution is not one the reconstruction model knows.
    #[error("unknown parcellation: {0}")]
    UnknownParcellation(String),

    /// A required upstream model was not loaded at request time.
    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),

    /// Solver could not converge or produced NaN/Inf.
    #[error("integration failure at t={t:.4}: {reason}")]
    IntegrationFailure { t: f64, reason: String },

    /// Solver exceeded its step or wall-clock budget.
    #[error("integration timeout after {steps} steps ({elapsed_ms} ms)")]
    IntegrationTimeout { steps: u64, elapsed_ms: u64 },

    /// Parameter outside its admissible range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Uploaded array could not be decoded.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl SimError {
    /// Stable snake_case tag used in response payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            SimError::DimensionMismatch { .. } => "dimension_mismatch",
            SimError::UnknownParcellation(_) => "unknown_parcellation",
            SimError::ModelNotLoaded(_) => "model_not_loaded",
            SimError::IntegrationFailure { .. } => "integration_failure",
            SimError::IntegrationTimeout { .. } => "integration_timeout",
            SimError::InvalidParameter(_) => "invalid_parameter",
            SimError::InvalidPayload(_) => "invalid_payload",
        }
    }
}

pub type SimResult<T> = Result<T, SimError>;
