use serde::{Deserialize, Serialize};

use crate::types::{PartOutcome, UploadProgress, normalize_etag};

// ---------------------------------------------------------------------------
// Backend request payloads
// ---------------------------------------------------------------------------

/// Asks the backend to open a multipart upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_part_size: Option<u64>,
}

/// Asks for fresh presigned URLs for a batch of part numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignPartsRequest {
    pub part_numbers: Vec<u32>,
}

/// Finalizes the upload with every confirmed part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteUploadRequest {
    pub parts: Vec<PartOutcome>,
}

// ---------------------------------------------------------------------------
// Backend response payloads
// ---------------------------------------------------------------------------

/// Result of a completed multipart upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUpload {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
}

/// Remote view of a session, from the object store's part listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub id: String,
    pub key: String,
    pub upload_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<RemotePart>,
}

/// One entry of the store's part listing. Fields come back in the store's
/// casing and may individually be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePart {
    #[serde(rename = "ETag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(
        rename = "PartNumber",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub part_number: Option<u32>,
    #[serde(rename = "Size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl RemotePart {
    /// Converts a complete listing entry into a local outcome, normalizing
    /// the ETag. Entries missing a field are unusable and map to `None`.
    pub fn to_outcome(&self) -> Option<PartOutcome> {
        Some(PartOutcome {
            etag: normalize_etag(self.etag.as_deref()?),
            part_number: self.part_number?,
            size: self.size?,
        })
    }
}

// ---------------------------------------------------------------------------
// Subscriber events
// ---------------------------------------------------------------------------

/// Events fanned out to upload subscribers. The `type` tag and payload keys
/// match the browser uploader's message format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UploadEvent {
    #[serde(rename = "upload-progress")]
    Progress { progress: UploadProgress },
    #[serde(rename = "upload-error", rename_all = "camelCase")]
    Error { session_id: String, error: String },
    #[serde(rename = "upload-complete")]
    Complete { progress: UploadProgress },
}

impl UploadEvent {
    /// Session the event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            UploadEvent::Progress { progress } | UploadEvent::Complete { progress } => {
                &progress.session_id
            }
            UploadEvent::Error { session_id, .. } => session_id,
        }
    }
}
