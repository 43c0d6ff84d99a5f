//! JSON client for the upload session backend.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use partway_engine::{SessionBackend, UploadError};
use partway_protocol::{
    CompleteUploadRequest, CompletedUpload, CreateSessionRequest, PartAuthorization, PartOutcome,
    PresignPartsRequest, SessionStatus, UploadSession,
};
use reqwest::StatusCode;
use tracing::debug;

use crate::{http_error, status_error};

/// Control-plane calls are small; anything slower than this is wedged.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the session backend's JSON API.
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    /// Creates a client rooted at `base_url`, for example
    /// `https://uploads.example.com`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(http_error)?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self { http, base_url })
    }

    /// Registers a new multipart upload and returns its session descriptor,
    /// seeded with the first batch of presigned part URLs.
    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<UploadSession, UploadError> {
        debug!(filename = %request.filename, size = request.size, "creating upload session");
        let resp = self
            .http
            .post(format!("{}/api/upload-sessions", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(http_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }
        resp.json().await.map_err(http_error)
    }

    /// Requests fresh presigned URLs for `part_numbers`.
    pub async fn presign_parts(
        &self,
        session_id: &str,
        part_numbers: Vec<u32>,
    ) -> Result<Vec<PartAuthorization>, UploadError> {
        let request = PresignPartsRequest { part_numbers };
        let resp = self
            .http
            .post(format!(
                "{}/api/upload-sessions/{session_id}/parts",
                self.base_url
            ))
            .json(&request)
            .send()
            .await
            .map_err(http_error)?;
        decode_session_scoped(session_id, resp).await
    }

    /// Finalizes the upload from its confirmed parts.
    pub async fn complete(
        &self,
        session_id: &str,
        parts: Vec<PartOutcome>,
    ) -> Result<CompletedUpload, UploadError> {
        let request = CompleteUploadRequest { parts };
        let resp = self
            .http
            .post(format!(
                "{}/api/upload-sessions/{session_id}/complete",
                self.base_url
            ))
            .json(&request)
            .send()
            .await
            .map_err(http_error)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(UploadError::SessionNotFound(session_id.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // A refused part list will be refused again; don't retry it.
            if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
                return Err(UploadError::CompletionRejected(body));
            }
            return Err(status_error(status, body));
        }
        resp.json().await.map_err(http_error)
    }

    /// Fetches the backend's view of a session, including the parts the
    /// object store has already confirmed.
    pub async fn status(&self, session_id: &str) -> Result<SessionStatus, UploadError> {
        let resp = self
            .http
            .get(format!(
                "{}/api/upload-sessions/{session_id}/status",
                self.base_url
            ))
            .send()
            .await
            .map_err(http_error)?;
        decode_session_scoped(session_id, resp).await
    }
}

async fn decode_session_scoped<R: serde::de::DeserializeOwned>(
    session_id: &str,
    resp: reqwest::Response,
) -> Result<R, UploadError> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(UploadError::SessionNotFound(session_id.to_string()));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(status_error(status, body));
    }
    resp.json().await.map_err(http_error)
}

impl SessionBackend for BackendClient {
    fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UploadSession, UploadError>> + Send + '_>> {
        Box::pin(async move { BackendClient::create_session(self, &request).await })
    }

    fn presign_parts(
        &self,
        session_id: String,
        part_numbers: Vec<u32>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PartAuthorization>, UploadError>> + Send + '_>>
    {
        Box::pin(async move { BackendClient::presign_parts(self, &session_id, part_numbers).await })
    }

    fn complete(
        &self,
        session_id: String,
        parts: Vec<PartOutcome>,
    ) -> Pin<Box<dyn Future<Output = Result<CompletedUpload, UploadError>> + Send + '_>> {
        Box::pin(async move { BackendClient::complete(self, &session_id, parts).await })
    }

    fn status(
        &self,
        session_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<SessionStatus, UploadError>> + Send + '_>> {
        Box::pin(async move { BackendClient::status(self, &session_id).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slashes_are_trimmed() {
        let client = BackendClient::new("http://localhost:3001///").unwrap();
        assert_eq!(client.base_url, "http://localhost:3001");
    }
}
