//! Error taxonomy shared across the cluster surface.
//!
//! Every error maps to a stable wire code carried in HTTP responses and in
//! rejected transaction receipts.

use thiserror::Error;

/// Typed errors raised by transaction validation, the state machine, and the
/// consensus wrapper.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("bad signature: {0}")]
    BadSignature(String),

    /// Write attempted on a follower. Carries the leader address when known.
    #[error("not the leader")]
    NotLeader { leader: Option<String> },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable wire code for the `error` field of HTTP responses.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidParam(_) => "INVALID_PARAM",
            CoreError::BadSignature(_) => "BAD_SIGNATURE",
            CoreError::NotLeader { .. } => "NOT_LEADER",
            CoreError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            CoreError::Internal(_) => "INTERNAL",
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
