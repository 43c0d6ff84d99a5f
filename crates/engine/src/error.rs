use partway_resume::StoreError;
use partway_staging::StagingError;

/// Errors surfaced by the upload engine.
///
/// Variants are grouped by how the orchestrator reacts to them: transient
/// failures are retried with backoff, expired authorizations trigger a
/// presign refresh without consuming the retry budget, and everything else
/// parks the session in an error state for the caller to resume or cancel.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level failure: timeout, connection reset, 5xx.
    #[error("network error: {0}")]
    Network(String),

    /// The presigned URL for a part was rejected or is past its expiry.
    #[error("part authorization expired")]
    AuthorizationExpired,

    /// The backend answered but refused the request.
    #[error("backend error: {0}")]
    Backend(String),

    /// The backend no longer knows this upload session.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The backend refused to finalize the upload.
    #[error("completion rejected: {0}")]
    CompletionRejected(String),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A part kept failing after its retry budget was spent.
    #[error("part {part} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        part: u32,
        attempts: u32,
        message: String,
    },

    /// The session descriptor itself is unusable.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// The orchestrator task has shut down and accepts no more commands.
    #[error("orchestrator stopped")]
    Stopped,
}

impl UploadError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(UploadError::Network("connection reset".into()).is_retryable());
        assert!(!UploadError::AuthorizationExpired.is_retryable());
        assert!(!UploadError::SessionNotFound("abc".into()).is_retryable());
        assert!(!UploadError::CompletionRejected("bad part list".into()).is_retryable());
    }

    #[test]
    fn staging_error_converts() {
        let err: UploadError = StagingError::OutOfRange {
            start: 10,
            end: 5,
            len: 100,
        }
        .into();
        assert!(matches!(err, UploadError::Staging(_)));
    }
}
