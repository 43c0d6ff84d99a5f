use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use partway_protocol::{
    CompletedUpload, CreateSessionRequest, PartAuthorization, PartOutcome, SessionStatus,
    UploadSession,
};

use crate::error::UploadError;

/// Operations against the session-issuing backend.
///
/// The orchestrator only ever talks to the backend through this trait, so
/// tests can substitute a scripted implementation and the HTTP client stays
/// in its own crate.
pub trait SessionBackend: Send + Sync {
    /// Register a new multipart upload and receive its session descriptor.
    fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UploadSession, UploadError>> + Send + '_>>;

    /// Request fresh part authorizations for `part_numbers`.
    fn presign_parts(
        &self,
        session_id: String,
        part_numbers: Vec<u32>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PartAuthorization>, UploadError>> + Send + '_>>;

    /// Finalize the upload from the recorded part outcomes.
    fn complete(
        &self,
        session_id: String,
        parts: Vec<PartOutcome>,
    ) -> Pin<Box<dyn Future<Output = Result<CompletedUpload, UploadError>> + Send + '_>>;

    /// Ask the backend which parts it has confirmed for a session.
    fn status(
        &self,
        session_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<SessionStatus, UploadError>> + Send + '_>>;
}

/// Moves one part's bytes to presigned storage.
pub trait PartTransport: Send + Sync {
    /// PUT `body` to the presigned `url`, returning the entity tag the
    /// store assigned, already stripped of surrounding quotes.
    fn put_part(
        &self,
        url: String,
        body: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<String, UploadError>> + Send + '_>>;
}
