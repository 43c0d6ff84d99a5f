use std::path::{Path, PathBuf};

use crate::{StagedSource, StagingError};

/// Directory of staged upload payloads, one `<session-id>.bin` per session.
///
/// Session ids become file names, so ids that would escape the spool root
/// are rejected up front.
#[derive(Debug, Clone)]
pub struct SpoolDir {
    root: PathBuf,
}

impl SpoolDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Spool file path for a session id.
    pub fn path_for(&self, session_id: &str) -> Result<PathBuf, StagingError> {
        validate_session_id(session_id)?;
        Ok(self.root.join(format!("{session_id}.bin")))
    }

    /// Copies `src` into the spool and returns a durable source for it.
    pub async fn stage_file(
        &self,
        session_id: &str,
        src: &Path,
    ) -> Result<StagedSource, StagingError> {
        let dest = self.path_for(session_id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::copy(src, &dest).await?;
        Ok(StagedSource::Spool(dest))
    }

    /// Writes `bytes` into the spool and returns a durable source for them.
    pub async fn stage_bytes(
        &self,
        session_id: &str,
        bytes: &[u8],
    ) -> Result<StagedSource, StagingError> {
        let dest = self.path_for(session_id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&dest, bytes).await?;
        Ok(StagedSource::Spool(dest))
    }

    /// Whether a spool file exists for the session.
    pub async fn contains(&self, session_id: &str) -> bool {
        match self.path_for(session_id) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Source backed by the session's spool file. The file may or may not
    /// exist yet; reads fail with [`StagingError::Missing`] if it is gone.
    pub fn source_for(&self, session_id: &str) -> Result<StagedSource, StagingError> {
        Ok(StagedSource::Spool(self.path_for(session_id)?))
    }

    /// Deletes the session's spool file. Missing files are fine.
    pub async fn remove(&self, session_id: &str) -> Result<(), StagingError> {
        let path = self.path_for(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Session ids become file names in the spool and the session store; reject
/// anything that could leave the root directory.
pub fn validate_session_id(session_id: &str) -> Result<(), StagingError> {
    if session_id.is_empty() {
        return Err(StagingError::InvalidId("empty id".into()));
    }
    if session_id == "." || session_id == ".." {
        return Err(StagingError::InvalidId(session_id.into()));
    }
    if session_id
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0')
    {
        return Err(StagingError::InvalidId(session_id.into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn stage_bytes_then_read_back() {
        let dir = TempDir::new().unwrap();
        let spool = SpoolDir::new(dir.path().join("spool"));

        let src = spool.stage_bytes("abc123", b"0123456789").await.unwrap();
        assert!(src.is_durable());
        assert!(spool.contains("abc123").await);

        let chunk = src.read_range(3, 7).await.unwrap();
        assert_eq!(&chunk[..], b"3456");
    }

    #[tokio::test]
    async fn stage_file_copies_source() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("upload.dat");
        tokio::fs::write(&original, b"file contents").await.unwrap();

        let spool = SpoolDir::new(dir.path().join("spool"));
        let src = spool.stage_file("s1", &original).await.unwrap();

        // The spool copy is independent of the original.
        tokio::fs::remove_file(&original).await.unwrap();
        let all = src.read_range(0, 13).await.unwrap();
        assert_eq!(&all[..], b"file contents");
    }

    #[tokio::test]
    async fn source_for_resolves_existing_spool() {
        let dir = TempDir::new().unwrap();
        let spool = SpoolDir::new(dir.path());
        spool.stage_bytes("s1", b"payload").await.unwrap();

        let src = spool.source_for("s1").unwrap();
        assert_eq!(src.len().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn remove_clears_spool_entry() {
        let dir = TempDir::new().unwrap();
        let spool = SpoolDir::new(dir.path());
        spool.stage_bytes("s1", b"payload").await.unwrap();
        assert!(spool.contains("s1").await);

        spool.remove("s1").await.unwrap();
        assert!(!spool.contains("s1").await);

        // Second remove is a no-op.
        spool.remove("s1").await.unwrap();
    }

    #[tokio::test]
    async fn hostile_session_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let spool = SpoolDir::new(dir.path());

        for id in ["", ".", "..", "a/b", "a\\b", "../../etc/passwd"] {
            assert!(
                spool.stage_bytes(id, b"x").await.is_err(),
                "id {id:?} should be rejected"
            );
        }
        assert!(!spool.contains("../../etc/passwd").await);
    }
}
