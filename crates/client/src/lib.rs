//! HTTP implementations of the upload engine's backend traits.
//!
//! [`BackendClient`] speaks to the session-issuing backend over JSON and
//! [`HttpPartTransport`] PUTs part bodies to presigned object-store URLs.
//! Both translate HTTP failures into the engine's error classes: timeouts,
//! connection failures and 5xx responses are retryable, a rejected
//! presigned URL triggers an authorization refresh, and everything else is
//! surfaced as a backend refusal.

pub mod client;
pub mod transport;

pub use client::BackendClient;
pub use transport::HttpPartTransport;

use partway_engine::UploadError;
use reqwest::StatusCode;

pub(crate) fn http_error(err: reqwest::Error) -> UploadError {
    UploadError::Network(err.to_string())
}

pub(crate) fn status_error(status: StatusCode, body: String) -> UploadError {
    let body = if body.is_empty() {
        "no response body".to_string()
    } else {
        body
    };
    if status.is_server_error() {
        UploadError::Network(format!("{status}: {body}"))
    } else {
        UploadError::Backend(format!("{status}: {body}"))
    }
}
