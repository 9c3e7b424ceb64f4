use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type SegmentationResult<T> = Result<T, SegmentationError>;

#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Segment too small ({size} customers). Minimum: {minimum}")]
    SegmentTooSmall { size: usize, minimum: usize },

    #[error("Computation error: {0}")]
    Computation(String),

    #[error("Segment not found: {0}")]
    SegmentNotFound(Uuid),

    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("Pipeline timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Closed classification of [`SegmentationError`] for callers that branch on
/// the failure category rather than the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InsufficientData,
    SegmentTooSmall,
    Computation,
    NotFound,
    Cancelled,
    Timeout,
    Config,
    Internal,
}

impl SegmentationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn computation(msg: impl Into<String>) -> Self {
        Self::Computation(msg.into())
    }

    pub fn insufficient(msg: impl Into<String>) -> Self {
        Self::InsufficientData(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Serialization(_) => ErrorKind::Validation,
            Self::InsufficientData(_) => ErrorKind::InsufficientData,
            Self::SegmentTooSmall { .. } => ErrorKind::SegmentTooSmall,
            Self::Computation(_) => ErrorKind::Computation,
            Self::SegmentNotFound(_) => ErrorKind::NotFound,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Config(_) => ErrorKind::Config,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same request may succeed if simply retried. Everything
    /// else needs a different request (more data, looser criteria, ...).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Cancelled | ErrorKind::Timeout | ErrorKind::Internal
        )
    }
}

/// Serializable failure result handed to whatever layer reports pipeline
/// outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&SegmentationError> for FailureReport {
    fn from(err: &SegmentationError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}
