use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A multipart upload session issued by the backend.
///
/// `presigned_parts` carries the initial authorization batch the backend
/// returns on creation; it goes stale and is refreshed out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub size: u64,
    pub part_size: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presigned_parts: Vec<PartAuthorization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl UploadSession {
    /// Number of parts the session splits into. Never zero, so an empty file
    /// still uploads as a single empty part.
    pub fn total_parts(&self) -> u32 {
        if self.part_size == 0 {
            return 1;
        }
        (self.size.div_ceil(self.part_size)).max(1) as u32
    }

    /// Byte span `[start, end)` of a 1-based part number.
    pub fn part_range(&self, part_number: u32) -> (u64, u64) {
        let index = u64::from(part_number.saturating_sub(1));
        let start = index.saturating_mul(self.part_size).min(self.size);
        let end = start.saturating_add(self.part_size).min(self.size);
        (start, end)
    }

    /// Length in bytes of a 1-based part number.
    pub fn part_len(&self, part_number: u32) -> u64 {
        let (start, end) = self.part_range(part_number);
        end - start
    }

    pub fn display_filename(&self) -> &str {
        self.filename.as_deref().unwrap_or("Unknown")
    }
}

/// A presigned URL for one part, valid until `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartAuthorization {
    pub part_number: u32,
    pub url: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl PartAuthorization {
    /// True while the URL can still be trusted for a transfer starting now.
    /// `margin` guards against expiry mid-transfer.
    pub fn usable_within(&self, margin: std::time::Duration) -> bool {
        let margin =
            chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + margin < self.expires_at
    }
}

/// A part the object store has confirmed. Field casing matches what the
/// store expects back on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartOutcome {
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    pub size: u64,
}

/// Strips the quotes object stores wrap ETag values in.
pub fn normalize_etag(raw: &str) -> String {
    raw.replace('"', "")
}

/// Current state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Preparing,
    Uploading,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl UploadState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Cancelled)
    }
}

/// Progress snapshot for one upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub session_id: String,
    pub filename: String,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub speed_bps: f64,
    pub eta_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_part_completed: Option<PartOutcome>,
    pub state: UploadState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
}

impl UploadProgress {
    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.bytes_uploaded)
    }
}
