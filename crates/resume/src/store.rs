use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use partway_protocol::{PartOutcome, UploadProgress, UploadSession};
use partway_staging::SpoolDir;

use crate::{DEFAULT_RETENTION, StoreError};

/// A session snapshot that survives restarts.
///
/// `parts` carries every confirmed part outcome so a resumed session can
/// still finalize without re-uploading anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub session: UploadSession,
    pub progress: UploadProgress,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<PartOutcome>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
}

impl StoredSession {
    /// Builds a record stamped with the current time.
    pub fn new(session: UploadSession, progress: UploadProgress, parts: Vec<PartOutcome>) -> Self {
        let filename = progress.filename.clone();
        Self {
            session,
            progress,
            filename,
            parts,
            last_updated: Utc::now(),
        }
    }
}

/// Persistent store of upload session records, one JSON file per session.
pub struct SessionStore {
    dir: PathBuf,
    retention: Duration,
}

impl SessionStore {
    /// Creates a store rooted at `dir` with the default retention window.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_retention(dir, DEFAULT_RETENTION)
    }

    pub fn with_retention(dir: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        partway_staging::validate_session_id(session_id)
            .map_err(|_| StoreError::InvalidId(session_id.to_string()))?;
        Ok(self.dir.join(format!("{session_id}.json")))
    }

    /// Writes (or overwrites) the record for its session id.
    pub async fn save(&self, record: &StoredSession) -> Result<(), StoreError> {
        let path = self.path_for(&record.session.id)?;
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, json).await?;
        debug!(session = %record.session.id, "persisted session record");
        Ok(())
    }

    /// Loads the record for a session, if one exists.
    pub async fn load(&self, session_id: &str) -> Result<Option<StoredSession>, StoreError> {
        let path = self.path_for(session_id)?;
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Removes the record for a session. Missing records are fine.
    pub async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(session = %session_id, "removed session record");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the sessions still worth resuming, newest first.
    ///
    /// Purges along the way: records past the retention window, records
    /// whose staged bytes are gone from `spool`, and records that no longer
    /// parse.
    pub async fn scan(&self, spool: &SpoolDir) -> Result<Vec<StoredSession>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let now = Utc::now();
        let mut survivors = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let record: StoredSession = match tokio::fs::read_to_string(&path)
                .await
                .map_err(StoreError::from)
                .and_then(|data| serde_json::from_str(&data).map_err(StoreError::from))
            {
                Ok(record) => record,
                Err(err) => {
                    warn!(?path, %err, "dropping unreadable session record");
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
            };

            let age = (now - record.last_updated).to_std().unwrap_or_default();
            if age >= self.retention {
                debug!(session = %record.session.id, "dropping expired session record");
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }

            if !spool.contains(&record.session.id).await {
                debug!(session = %record.session.id, "dropping orphaned session record");
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }

            survivors.push(record);
        }

        survivors.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(survivors)
    }
}
