use crate::reducer::PassPhase;
use crate::types::{DataType, ParamId, Rank};

pub type Result<T> = std::result::Result<T, GradSyncError>;

#[derive(Debug, thiserror::Error)]
pub enum GradSyncError {
    #[error("parameter {param} marked ready twice in pass {pass}")]
    DuplicateReady { param: ParamId, pass: u64 },

    #[error("parameter {param} is not assigned to any bucket")]
    UnassignedParameter { param: ParamId },

    #[error("pass {pass} finalized with {} unready parameter(s): {params:?}", params.len())]
    ReadinessTimeout { pass: u64, params: Vec<ParamId> },

    #[error("{operation} failed at rank {rank}: {reason}")]
    BackendFailure {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("gradient for {param} does not match its descriptor: {reason}")]
    GradientMismatch { param: ParamId, reason: String },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("invalid bucket plan: {0}")]
    InvalidPlan(String),

    #[error("invalid gradient: {0}")]
    InvalidGradient(String),

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("{operation} not allowed while pass is {phase}")]
    InvalidState {
        operation: &'static str,
        phase: PassPhase,
    },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GradSyncError {
    /// Create a `BackendFailure` for `operation` on `rank`.
    pub fn backend(operation: &'static str, rank: Rank, reason: impl Into<String>) -> Self {
        Self::BackendFailure {
            operation,
            rank,
            reason: reason.into(),
        }
    }

    /// Create a `GradientMismatch` for `param`.
    pub fn mismatch(param: ParamId, reason: impl Into<String>) -> Self {
        Self::GradientMismatch {
            param,
            reason: reason.into(),
        }
    }

    /// Whether the error originates from the communication layer and must be
    /// handled consistently across the whole group.
    pub fn is_collective(&self) -> bool {
        matches!(self, Self::BackendFailure { .. } | Self::Cancelled)
    }
}
