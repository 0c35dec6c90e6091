//! In-process backend: no durability, used for tests and ephemeral servers.

use super::PersistenceBackend;
use crate::error::{Result, SyncError};
use crate::task::Task;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Inner {
    tasks: Mutex<Vec<Task>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

/// Keeps the last saved collection in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-seeded with `tasks`, as if a previous process saved them.
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let backend = Self::new();
        *backend.lock() = tasks;
        backend
    }

    /// Last saved collection.
    pub fn stored(&self) -> Vec<Task> {
        self.lock().clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.inner.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.inner.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Task>> {
        match self.inner.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    fn describe(&self) -> String {
        "memory".to_owned()
    }

    async fn load(&self) -> Result<Vec<Task>> {
        Ok(self.stored())
    }

    async fn save(&self, tasks: &[Task]) -> Result<()> {
        if self.inner.fail_saves.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("memory backend set to fail".to_owned()));
        }
        *self.lock() = tasks.to_vec();
        self.inner.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
