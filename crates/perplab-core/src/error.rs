//! Error types for PerpLab.

use thiserror::Error;

/// Core error type for PerpLab operations.
///
/// The taxonomy follows the engine's propagation contract: configuration and
/// preflight errors abort before any artifact is written; evaluation and
/// exchange errors abort the run after writing `logs/error.json`; risk
/// rejections are not errors at all (they are recorded on the run, see
/// [`crate::exchange::RejectReason`]).
#[derive(Error, Debug)]
pub enum PerpLabError {
    /// Invalid Play or engine configuration. Raised at parse/compile time,
    /// before any bar is processed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data coverage or warmup feasibility failure, raised before the run.
    #[error("Preflight error: {0}")]
    Preflight(String),

    /// Fail-loud runtime evaluation failure (unresolved dynamic metadata,
    /// NaN reaching a NaN-intolerant operation).
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Run invariant violation inside the simulated exchange
    /// (impossible liquidation path, negative equity without liquidation).
    #[error("Exchange invariant violated: {0}")]
    Exchange(String),

    /// Determinism gate failure: two runs of the same Play produced
    /// differing artifacts.
    #[error("Determinism violation: {0}")]
    Determinism(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for PerpLab operations.
pub type Result<T> = std::result::Result<T, PerpLabError>;

impl PerpLabError {
    /// Process exit code for the CLI layer.
    ///
    /// 0 success, 2 preflight failure, 3 configuration error,
    /// 4 determinism violation, 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            PerpLabError::Preflight(_) => 2,
            PerpLabError::Config(_) => 3,
            PerpLabError::Determinism(_) => 4,
            _ => 1,
        }
    }
}
