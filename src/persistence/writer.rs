//! Background save writer.
//!
//! The router never awaits storage. It hands each post-mutation snapshot to
//! [`PersistHandle::submit`], which overwrites the pending slot of a `watch`
//! channel. A single writer task saves whatever is newest when it wakes, so
//! saves never run concurrently, never go backwards, and a burst of
//! mutations collapses into one write of the final state.

use super::PersistenceBackend;
use crate::error::{Result, SyncError};
use crate::store::Snapshot;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Pending = Option<(u64, Snapshot)>;

#[derive(Debug)]
struct Inner {
    pending: watch::Sender<Pending>,
    saved: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

/// Cheap, cloneable handle to the save writer task.
#[derive(Debug, Clone)]
pub struct PersistHandle {
    inner: Arc<Inner>,
}

impl PersistHandle {
    /// Spawn the writer task for `backend`. `initial_version` is the store
    /// version already reflected in storage.
    pub fn spawn(backend: Arc<dyn PersistenceBackend>, initial_version: u64) -> Self {
        let (pending_tx, pending_rx) = watch::channel(None);
        let (saved_tx, saved_rx) = watch::channel(initial_version);
        let task = tokio::spawn(write_loop(backend, pending_rx, saved_tx));
        Self {
            inner: Arc::new(Inner {
                pending: pending_tx,
                saved: saved_rx,
                task,
            }),
        }
    }

    /// Queue `snapshot` for saving, replacing any older unsaved snapshot.
    pub fn submit(&self, version: u64, snapshot: Snapshot) {
        self.inner.pending.send_replace(Some((version, snapshot)));
    }

    /// Highest version the writer has attempted to save.
    pub fn saved_version(&self) -> u64 {
        *self.inner.saved.borrow()
    }

    /// Whether the writer task is still running.
    pub fn is_running(&self) -> bool {
        !self.inner.task.is_finished()
    }

    /// Wait until everything submitted so far has been attempted.
    ///
    /// A failed save still counts as attempted; failures are logged by the
    /// writer, not returned here.
    pub async fn flush(&self) -> Result<()> {
        let target = match self.inner.pending.borrow().as_ref() {
            Some((version, _)) => *version,
            None => return Ok(()),
        };
        let mut saved = self.inner.saved.clone();
        saved
            .wait_for(|version| *version >= target)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::Channel("persist writer stopped before flush".to_owned()))
    }
}

async fn write_loop(
    backend: Arc<dyn PersistenceBackend>,
    mut pending: watch::Receiver<Pending>,
    saved: watch::Sender<u64>,
) {
    // `changed` still reports a final unseen value after the sender closes.
    while pending.changed().await.is_ok() {
        let next = pending.borrow_and_update().clone();
        let Some((version, snapshot)) = next else {
            continue;
        };
        if version <= *saved.borrow() {
            continue;
        }

        match backend.save(&snapshot).await {
            Ok(()) => debug!(version, tasks = snapshot.len(), "saved tasks"),
            Err(e) => error!(
                error = %e,
                version,
                location = %backend.describe(),
                "failed to save tasks"
            ),
        }
        saved.send_replace(version);
    }
    debug!("persist writer stopped");
}
