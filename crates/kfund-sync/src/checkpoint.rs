use std::path::{Path, PathBuf};

use kfund_core::{Checkpoint, DateRange};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint {path} is not valid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One JSON snapshot per source and date range.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, source_id: &str, range: &DateRange) -> PathBuf {
        self.dir.join(format!("{source_id}_{}.json", range.folder_name()))
    }

    pub async fn load(&self, source_id: &str, range: &DateRange) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(source_id, range);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CheckpointError::Json { path, source })
    }

    /// Temp file + rename, so a crash never leaves a half-written snapshot.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.source_id, &checkpoint.date_range);
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CheckpointError::Io { path, source }
        };

        fs::create_dir_all(&self.dir).await.map_err(io(&self.dir))?;
        let json = serde_json::to_vec_pretty(checkpoint).map_err(|source| CheckpointError::Json {
            path: path.clone(),
            source,
        })?;
        let temp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp, json).await.map_err(io(&temp))?;
        fs::rename(&temp, &path).await.map_err(io(&path))?;
        Ok(())
    }

    pub async fn clear(&self, source_id: &str, range: &DateRange) -> Result<(), CheckpointError> {
        let path = self.path_for(source_id, range);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[tokio::test]
    async fn save_load_clear_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        )
        .unwrap();

        assert!(store.load("bizinfo", &range).await.unwrap().is_none());

        let mut checkpoint = Checkpoint::new("bizinfo", range, Uuid::new_v4());
        checkpoint.last_processed_page = 4;
        checkpoint.total_processed = 60;
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load("bizinfo", &range).await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.next_page(), 5);
        assert!(store
            .path_for("bizinfo", &range)
            .ends_with("bizinfo_20260101_20260131.json"));

        store.clear("bizinfo", &range).await.unwrap();
        assert!(store.load("bizinfo", &range).await.unwrap().is_none());
        store.clear("bizinfo", &range).await.unwrap();
    }
}
