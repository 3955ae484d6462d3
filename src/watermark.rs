//! Per-entity incremental sync watermarks.
//!
//! One plain text file per entity holding the start time of the last run that
//! fully processed it. Files are read at batch start and overwritten at the end;
//! there is no locking between concurrent runs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct WatermarkStore {
    dir: PathBuf,
}

impl WatermarkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, entity: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", entity.to_lowercase()))
    }

    /// Last recorded watermark; `None` when the entity was never synced.
    ///
    /// An unparseable file is treated as absent so the next run refetches
    /// everything instead of failing the entity forever.
    pub async fn read(&self, entity: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        let path = self.path_for(entity);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SyncError::Watermark {
                    entity: entity.to_string(),
                    source,
                });
            }
        };

        match DateTime::parse_from_rfc3339(contents.trim()) {
            Ok(timestamp) => Ok(Some(timestamp.with_timezone(&Utc))),
            Err(err) => {
                warn!(entity, path = %path.display(), error = %err, "Ignoring unreadable watermark");
                Ok(None)
            }
        }
    }

    pub async fn write(&self, entity: &str, at: DateTime<Utc>) -> Result<(), SyncError> {
        let io_err = |source| SyncError::Watermark {
            entity: entity.to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        tokio::fs::write(self.path_for(entity), at.to_rfc3339())
            .await
            .map_err(io_err)?;

        info!(entity, watermark = %at.to_rfc3339(), "Advanced incremental watermark");
        Ok(())
    }
}
