//! Durable storage of the full task collection.
//!
//! The collection is stored as one opaque blob: a JSON array of task records.
//! Backends only load and save whole collections; ordering of saves is the
//! job of [`writer::PersistHandle`].

pub mod file;
pub mod http;
pub mod memory;
pub mod writer;

pub use file::FileBackend;
pub use http::HttpObjectBackend;
pub use memory::MemoryBackend;
pub use writer::PersistHandle;

use crate::config::{StorageConfig, StorageKind};
use crate::error::{Result, SyncError};
use crate::task::Task;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Pluggable durable store for the task collection.
#[async_trait]
pub trait PersistenceBackend: Send + Sync + 'static {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Read the stored collection. A missing blob is an empty collection.
    async fn load(&self) -> Result<Vec<Task>>;

    /// Replace the stored collection with `tasks`.
    async fn save(&self, tasks: &[Task]) -> Result<()>;
}

/// Load the stored collection, degrading to empty on any failure.
pub async fn load_or_empty(backend: &dyn PersistenceBackend) -> Vec<Task> {
    match backend.load().await {
        Ok(tasks) => {
            info!(
                tasks = tasks.len(),
                location = %backend.describe(),
                "loaded persisted tasks"
            );
            tasks
        }
        Err(e) => {
            warn!(
                error = %e,
                location = %backend.describe(),
                "cannot load persisted tasks; starting empty"
            );
            Vec::new()
        }
    }
}

/// Build the backend selected by configuration.
pub fn backend_from_config(config: &StorageConfig) -> Result<Arc<dyn PersistenceBackend>> {
    match config.backend {
        StorageKind::File => Ok(Arc::new(FileBackend::new(config.path.clone()))),
        StorageKind::Http => {
            let url = config.url.as_deref().ok_or_else(|| {
                SyncError::Config("http storage requires `storage.url`".to_owned())
            })?;
            let backend = HttpObjectBackend::new(
                url,
                config.token.clone(),
                Duration::from_secs(config.timeout_secs.max(1)),
            )?;
            Ok(Arc::new(backend))
        }
        StorageKind::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}

/// Decode a stored blob. Empty or whitespace-only blobs are an empty collection.
pub(crate) fn decode_blob(bytes: &[u8]) -> Result<Vec<Task>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| SyncError::Storage(format!("cannot parse stored tasks: {e}")))
}

/// Encode a collection for storage.
pub(crate) fn encode_blob(tasks: &[Task]) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(tasks)
        .map_err(|e| SyncError::Storage(format!("cannot serialize tasks: {e}")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn blank_blob_is_empty_collection() {
        assert!(decode_blob(b"").unwrap().is_empty());
        assert!(decode_blob(b"  \n").unwrap().is_empty());
    }

    #[test]
    fn corrupt_blob_is_a_storage_error() {
        let err = decode_blob(b"{\"not\": \"an array\"}").unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }

    #[test]
    fn http_backend_requires_a_url() {
        let config = StorageConfig {
            backend: StorageKind::Http,
            ..StorageConfig::default()
        };
        let err = backend_from_config(&config).err().expect("missing url is rejected");
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn load_failure_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, "[{\"id\": ").unwrap();
        let backend = FileBackend::new(path);
        assert!(load_or_empty(&backend).await.is_empty());
    }
}
