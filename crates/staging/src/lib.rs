//! Staged byte sources for in-flight uploads.
//!
//! Parts are read from a [`StagedSource`]: either bytes pinned in memory or
//! a spool file managed by a [`SpoolDir`]. Only spooled sources survive a
//! restart, so a session that should be resumable must be staged to disk
//! before the upload starts.

mod source;
mod spool;

pub use source::StagedSource;
pub use spool::{SpoolDir, validate_session_id};

use std::path::PathBuf;

/// Errors produced by the staging crate.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("staged file missing: {}", .0.display())]
    Missing(PathBuf),

    #[error("range {start}..{end} outside staged length {len}")]
    OutOfRange { start: u64, end: u64, len: u64 },

    #[error("invalid session id: {0}")]
    InvalidId(String),
}
