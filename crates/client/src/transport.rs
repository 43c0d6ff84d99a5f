//! Presigned-URL part transport.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use partway_engine::{PartTransport, UploadError};
use partway_protocol::normalize_etag;
use reqwest::header::ETAG;
use reqwest::StatusCode;

use crate::{http_error, status_error};

/// A part PUT that hasn't finished inside this window counts as failed.
const PART_TIMEOUT: Duration = Duration::from_secs(60);

/// Ships part bodies to the object store with plain HTTP PUTs against
/// presigned URLs.
pub struct HttpPartTransport {
    http: reqwest::Client,
}

impl HttpPartTransport {
    pub fn new() -> Result<Self, UploadError> {
        Self::with_timeout(PART_TIMEOUT)
    }

    /// Overrides the per-part timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(http_error)?;
        Ok(Self { http })
    }

    async fn put(&self, url: String, body: Bytes) -> Result<String, UploadError> {
        let resp = self
            .http
            .put(&url)
            .body(body)
            .send()
            .await
            .map_err(http_error)?;
        let status = resp.status();
        // Object stores answer 403 once a presigned URL has expired.
        if status == StatusCode::FORBIDDEN {
            return Err(UploadError::AuthorizationExpired);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }
        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(normalize_etag)
            .unwrap_or_default();
        if etag.is_empty() {
            return Err(UploadError::Backend(
                "store response carried no usable ETag".into(),
            ));
        }
        Ok(etag)
    }
}

impl PartTransport for HttpPartTransport {
    fn put_part(
        &self,
        url: String,
        body: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<String, UploadError>> + Send + '_>> {
        Box::pin(self.put(url, body))
    }
}
