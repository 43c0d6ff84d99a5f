//! Wire types for Partway multipart uploads.
//!
//! Everything here serializes to the JSON shapes the upload backend speaks:
//! camelCase field names, epoch-millisecond timestamps, and the object-store
//! casing (`ETag`, `PartNumber`) on completed parts.

mod messages;
mod types;

pub use messages::{
    CompleteUploadRequest, CompletedUpload, CreateSessionRequest, PresignPartsRequest, RemotePart,
    SessionStatus, UploadEvent,
};
pub use types::{
    PartAuthorization, PartOutcome, UploadProgress, UploadSession, UploadState, normalize_etag,
};

/// Default part size: 8 MiB.
///
/// The backend decides the actual size (it clamps a requested size up to its
/// own minimum); this is the value it falls back to.
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;
