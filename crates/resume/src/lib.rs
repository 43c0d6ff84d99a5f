//! Persisted upload sessions and the resume scan.
//!
//! Every meaningful change to an active upload is written as one JSON
//! record per session. After a restart, [`SessionStore::scan`] returns the
//! sessions that are still worth offering for resume and quietly purges the
//! rest (expired, orphaned from their staged bytes, or unreadable).

mod store;

pub use store::{SessionStore, StoredSession};

/// Records older than this are dropped by the scan: 7 days.
pub const DEFAULT_RETENTION: std::time::Duration =
    std::time::Duration::from_secs(7 * 24 * 60 * 60);

/// Errors from the session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid session id: {0}")]
    InvalidId(String),
}
