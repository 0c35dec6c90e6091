//! Local JSON file backend.

use super::{PersistenceBackend, decode_blob, encode_blob};
use crate::error::{Result, SyncError};
use crate::task::Task;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Stores the collection as a pretty-printed JSON array at `path`.
///
/// Saves go through a sibling temp file and a rename, so a crash mid-write
/// leaves the previous state readable.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "tasks.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PersistenceBackend for FileBackend {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<Vec<Task>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SyncError::Storage(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };
        decode_blob(&bytes)
    }

    async fn save(&self, tasks: &[Task]) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::Storage(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let json = encode_blob(tasks)?;
        let tmp_path = self.temp_path();
        tokio::fs::write(&tmp_path, &json)
            .await
            .map_err(|e| SyncError::Storage(format!("cannot write {}: {e}", tmp_path.display())))?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            SyncError::Storage(format!("cannot replace {}: {e}", self.path.display()))
        })?;
        Ok(())
    }
}
