//! Shared error taxonomy for the upload and conversion pipeline.
//!
//! Every failure that crosses the scheduler/executor/store seams is mapped
//! into one of these categories. Schedulers never propagate errors out of
//! their poll loops: the category decides whether a run is retried, released
//! for another worker, or written to the dataset record as a failure.

use std::time::Duration;

use crate::sessions::SessionError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Bad input shape. Surfaced synchronously to the caller, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Declared upload size exceeds the configured cap. Distinct from
    /// `Validation` so the HTTP surface can answer 413.
    #[error("payload too large: {0}")]
    TooLarge(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate unique key or a lost claim race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Third-party credential needs user action before any retry can help.
    #[error("credential expired: {0}")]
    CredentialExpired(String),

    #[error("credential invalid: {0}")]
    CredentialInvalid(String),

    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Network blip, connection reset, store unavailable. Worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// User intent, not an error. Written as `cancelled`, never as a failure.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether another attempt could plausibly succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::RateLimited(_) | Self::Timeout(_) | Self::Internal(_)
        )
    }

    /// Whether a failed run counts against the per-phase retry budget.
    /// Credential problems are excluded: the user can renew the grant and
    /// manually retry without having burned any attempts.
    pub fn consumes_retry_budget(&self) -> bool {
        self.is_retryable()
    }

    /// Failures where retrying cannot help; the record is failed directly.
    pub fn is_terminal_for_run(&self) -> bool {
        matches!(
            self,
            Self::CredentialExpired(_)
                | Self::CredentialInvalid(_)
                | Self::SourceNotFound(_)
                | Self::PermissionDenied(_)
                | Self::Validation(_)
                | Self::TooLarge(_)
        )
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(key) => Self::Conflict(format!("duplicate key: {key}")),
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Stale => Self::Conflict("concurrent status transition lost".to_string()),
            StoreError::Unavailable(e) => Self::Transient(format!("dataset store unavailable: {e}")),
        }
    }
}

impl From<SessionError> for PipelineError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::UnknownSession(id) => Self::NotFound(format!("upload session {id}")),
            SessionError::TooLarge { size, max } => {
                Self::TooLarge(format!("file size {size} exceeds maximum {max}"))
            }
            SessionError::EmptyFile => Self::Validation("total_size must be positive".into()),
            SessionError::InvalidChunkIndex { index, total } => {
                Self::Validation(format!("chunk index {index} out of range 0..{total}"))
            }
            SessionError::SizeMismatch { index, expected, actual } => Self::Validation(format!(
                "chunk {index} has {actual} bytes, expected {expected}"
            )),
            SessionError::HashMismatch(detail) => Self::Validation(detail),
            SessionError::MissingChunks(indices) => {
                Self::Validation(format!("missing chunks: {indices:?}"))
            }
            SessionError::Io(e) => Self::Internal(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_failures_do_not_consume_budget() {
        let err = PipelineError::CredentialExpired("refresh token revoked".into());
        assert!(!err.consumes_retry_budget());
        assert!(err.is_terminal_for_run());
    }

    #[test]
    fn transient_failures_are_retryable() {
        for err in [
            PipelineError::Transient("connection reset".into()),
            PipelineError::RateLimited("429".into()),
            PipelineError::Timeout(Duration::from_secs(7200)),
        ] {
            assert!(err.is_retryable(), "{err} should be retryable");
            assert!(err.consumes_retry_budget());
            assert!(!err.is_terminal_for_run());
        }
    }

    #[test]
    fn oversized_uploads_map_to_too_large_not_validation() {
        use crate::sessions::SessionError;
        let err: PipelineError =
            SessionError::TooLarge { size: 11, max: 10 }.into();
        assert!(matches!(err, PipelineError::TooLarge(_)));
        assert!(!err.is_retryable());
        assert!(err.is_terminal_for_run());
    }

    #[test]
    fn source_failures_are_terminal() {
        assert!(PipelineError::SourceNotFound("gone".into()).is_terminal_for_run());
        assert!(PipelineError::PermissionDenied("403".into()).is_terminal_for_run());
        assert!(!PipelineError::SourceNotFound("gone".into()).is_retryable());
    }

    #[test]
    fn cancellation_is_neither_retryable_nor_terminal_failure() {
        let err = PipelineError::Cancelled;
        assert!(!err.is_retryable());
        assert!(!err.is_terminal_for_run());
    }
}
