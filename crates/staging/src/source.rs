use std::io::SeekFrom;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::StagingError;

/// Where a session's bytes live while the upload is in flight.
#[derive(Debug, Clone)]
pub enum StagedSource {
    /// Bytes held in memory. Cheap, but gone after a restart.
    Memory(Bytes),
    /// A spool file on disk. Backs resume-after-restart.
    Spool(PathBuf),
}

impl StagedSource {
    /// Total staged length in bytes.
    pub async fn len(&self) -> Result<u64, StagingError> {
        match self {
            StagedSource::Memory(bytes) => Ok(bytes.len() as u64),
            StagedSource::Spool(path) => match tokio::fs::metadata(path).await {
                Ok(meta) => Ok(meta.len()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Err(StagingError::Missing(path.clone()))
                }
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Reads the byte span `[start, end)`. The whole span must exist; a
    /// staged file shorter than `end` means the session no longer matches
    /// its source and the caller must treat it as invalid.
    pub async fn read_range(&self, start: u64, end: u64) -> Result<Bytes, StagingError> {
        if end < start {
            return Err(StagingError::OutOfRange {
                start,
                end,
                len: self.len().await?,
            });
        }
        match self {
            StagedSource::Memory(bytes) => {
                let len = bytes.len() as u64;
                if end > len {
                    return Err(StagingError::OutOfRange { start, end, len });
                }
                Ok(bytes.slice(start as usize..end as usize))
            }
            StagedSource::Spool(path) => {
                let mut file = match tokio::fs::File::open(path).await {
                    Ok(file) => file,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        return Err(StagingError::Missing(path.clone()));
                    }
                    Err(err) => return Err(err.into()),
                };
                let len = file.metadata().await?.len();
                if end > len {
                    return Err(StagingError::OutOfRange { start, end, len });
                }
                file.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; (end - start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Whether the source survives a process restart.
    pub fn is_durable(&self) -> bool {
        matches!(self, StagedSource::Spool(_))
    }

    /// Releases the staged bytes. Removes the spool file; already-gone files
    /// are fine. Memory sources just drop.
    pub async fn remove(&self) -> Result<(), StagingError> {
        match self {
            StagedSource::Memory(_) => Ok(()),
            StagedSource::Spool(path) => match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            },
        }
    }
}
