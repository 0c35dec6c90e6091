//! Operation router: the single serialization point of the sync server.
//!
//! Connections talk to the router through a cloneable [`SyncHandle`]. The
//! [`SyncRouter`] owns the canonical store and the connection registry and
//! processes one request at a time, so every store operation, persistence
//! submission and fan-out for a message completes before the next message is
//! looked at.

use crate::broadcast::{ConnectionId, ConnectionRegistry};
use crate::config::RouterConfig;
use crate::error::{Result, SyncError};
use crate::persistence::PersistHandle;
use crate::protocol::{ClientMessage, Frame, SnapshotKind, encode_pong, encode_snapshot};
use crate::store::{Applied, Snapshot, TaskStore};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Point-in-time counters, served by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub tasks: usize,
    pub connections: usize,
    pub version: u64,
}

enum RouterRequest {
    Connect {
        outbound: mpsc::Sender<Frame>,
        reply: oneshot::Sender<ConnectionId>,
    },
    Inbound {
        conn: ConnectionId,
        text: String,
    },
    Disconnect {
        conn: ConnectionId,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Stats {
        reply: oneshot::Sender<RouterStats>,
    },
    Shutdown,
}

/// Cloneable front end of the router task.
#[derive(Clone)]
pub struct SyncHandle {
    request_tx: mpsc::Sender<RouterRequest>,
}

impl SyncHandle {
    /// Register a connection. Its queue receives the `init` snapshot before
    /// any other frame.
    pub async fn connect(&self, outbound: mpsc::Sender<Frame>) -> Result<ConnectionId> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(RouterRequest::Connect { outbound, reply })
            .await?;
        reply_rx
            .await
            .map_err(|e| SyncError::Channel(format!("connect reply dropped: {e}")))
    }

    /// Hand an inbound text frame to the router.
    pub async fn submit(&self, conn: ConnectionId, text: String) -> Result<()> {
        self.request(RouterRequest::Inbound { conn, text }).await
    }

    /// Unregister a connection.
    pub async fn disconnect(&self, conn: ConnectionId) -> Result<()> {
        self.request(RouterRequest::Disconnect { conn }).await
    }

    /// Current canonical collection.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(RouterRequest::Snapshot { reply }).await?;
        reply_rx
            .await
            .map_err(|e| SyncError::Channel(format!("snapshot reply dropped: {e}")))
    }

    pub async fn stats(&self) -> Result<RouterStats> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(RouterRequest::Stats { reply }).await?;
        reply_rx
            .await
            .map_err(|e| SyncError::Channel(format!("stats reply dropped: {e}")))
    }

    /// Stop taking requests. Requests already queued are still processed,
    /// then [`SyncRouter::run`] returns and every connection queue closes.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(RouterRequest::Shutdown).await
    }

    async fn request(&self, request: RouterRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| SyncError::Channel("sync router stopped".to_owned()))
    }
}

/// Owner of the canonical store and the connection registry.
pub struct SyncRouter {
    request_rx: mpsc::Receiver<RouterRequest>,
    store: TaskStore,
    registry: ConnectionRegistry,
    persist: PersistHandle,
    broadcast_kind: SnapshotKind,
}

/// Create a router and its handle. Spawn [`SyncRouter::run`] to start it.
#[must_use]
pub fn sync_channel(
    config: &RouterConfig,
    store: TaskStore,
    persist: PersistHandle,
) -> (SyncHandle, SyncRouter) {
    let (request_tx, request_rx) = mpsc::channel(config.request_capacity.max(1));
    let broadcast_kind = match config.broadcast_kind {
        SnapshotKind::Init => SnapshotKind::Update,
        kind => kind,
    };
    (
        SyncHandle { request_tx },
        SyncRouter {
            request_rx,
            store,
            registry: ConnectionRegistry::new(),
            persist,
            broadcast_kind,
        },
    )
}

impl SyncRouter {
    /// Process requests until every [`SyncHandle`] is dropped or a shutdown
    /// request has been handled.
    pub async fn run(mut self) {
        while let Some(request) = self.request_rx.recv().await {
            match request {
                RouterRequest::Connect { outbound, reply } => {
                    let conn = self.connect(outbound);
                    let _ = reply.send(conn);
                }
                RouterRequest::Inbound { conn, text } => self.handle_text(conn, &text),
                RouterRequest::Disconnect { conn } => {
                    if self.registry.unregister(conn) {
                        debug!(conn, connections = self.registry.len(), "unregistered");
                    }
                }
                RouterRequest::Snapshot { reply } => {
                    let _ = reply.send(self.store.snapshot());
                }
                RouterRequest::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                RouterRequest::Shutdown => {
                    info!(connections = self.registry.len(), "sync router draining");
                    self.request_rx.close();
                }
            }
        }
        debug!(version = self.store.version(), "sync router stopped");
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            tasks: self.store.len(),
            connections: self.registry.len(),
            version: self.store.version(),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Register `outbound` and queue its `init` frame.
    pub fn connect(&mut self, outbound: mpsc::Sender<Frame>) -> ConnectionId {
        let conn = self.registry.register(outbound);
        match encode_snapshot(SnapshotKind::Init, &self.store.snapshot()) {
            Ok(frame) => {
                self.registry.send_to(conn, &frame);
            }
            Err(e) => error!(conn, error = %e, "cannot encode init snapshot"),
        }
        info!(
            conn,
            connections = self.registry.len(),
            tasks = self.store.len(),
            "client registered"
        );
        conn
    }

    /// Parse and route one inbound text frame.
    pub fn handle_text(&mut self, conn: ConnectionId, text: &str) {
        match ClientMessage::parse(text) {
            Ok(Some(message)) => self.route(conn, message),
            Ok(None) => debug!(conn, "ignoring message with unknown type"),
            Err(e) => warn!(conn, error = %e, "discarding malformed message"),
        }
    }

    /// Apply one validated message.
    pub fn route(&mut self, conn: ConnectionId, message: ClientMessage) {
        let op = message.op_name();
        let before = self.store.version();

        match message {
            ClientMessage::Ping => {
                self.registry.send_to(conn, &encode_pong());
                return;
            }
            ClientMessage::Resync => {
                match encode_snapshot(SnapshotKind::Sync, &self.store.snapshot()) {
                    Ok(frame) => {
                        self.registry.send_to(conn, &frame);
                    }
                    Err(e) => error!(conn, error = %e, "cannot encode sync snapshot"),
                }
                return;
            }
            ClientMessage::Add { task } => {
                let (id, applied) = self.store.add(task);
                debug!(conn, id = %id, inserted = applied == Applied::Inserted, "add");
            }
            ClientMessage::Update { task } => {
                let id = task.id.clone();
                match self.store.update(task) {
                    Ok(applied) => {
                        debug!(conn, id = %id, inserted = applied == Applied::Inserted, "update");
                    }
                    Err(e) => {
                        warn!(conn, error = %e, "discarding update");
                        return;
                    }
                }
            }
            ClientMessage::Remove { id } => {
                let removed = self.store.remove(&id);
                debug!(conn, id = %id, removed, "remove");
            }
            ClientMessage::Replace { tasks } => {
                let count = self.store.replace_all(tasks);
                debug!(conn, tasks = count, "replace");
            }
        }

        self.commit(conn, op, before);
    }

    fn commit(&mut self, origin: ConnectionId, op: &'static str, before: u64) {
        let snapshot = self.store.snapshot();
        let version = self.store.version();
        if version != before {
            self.persist.submit(version, Snapshot::clone(&snapshot));
        }

        let frame = match encode_snapshot(self.broadcast_kind, &snapshot) {
            Ok(frame) => frame,
            Err(e) => {
                error!(op, error = %e, "cannot encode broadcast snapshot");
                return;
            }
        };
        let report = self.registry.fan_out(&frame, Some(origin));
        debug!(
            op,
            version,
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "broadcast"
        );
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::persistence::MemoryBackend;
    use crate::protocol::ServerMessage;
    use crate::store::AddCollisionPolicy;
    use crate::task::Task;
    use std::sync::Arc;

    const ADD_T1: &str = r#"{"type":"add","task":{"id":"t1","content":"X","start":"2024-01-01T00:00:00Z","end":"2024-01-01T01:00:00Z","group":"P1"}}"#;

    fn router(backend: &MemoryBackend) -> SyncRouter {
        router_with(backend, RouterConfig::default(), Vec::new())
    }

    fn router_with(backend: &MemoryBackend, config: RouterConfig, tasks: Vec<Task>) -> SyncRouter {
        let persist = PersistHandle::spawn(Arc::new(backend.clone()), 0);
        let store = TaskStore::from_tasks(tasks, config.add_collision);
        sync_channel(&config, store, persist).1
    }

    fn client(router: &mut SyncRouter) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        (router.connect(tx), rx)
    }

    fn recv(rx: &mut mpsc::Receiver<Frame>) -> ServerMessage {
        let frame = rx.try_recv().expect("a queued frame");
        ServerMessage::parse(&frame).unwrap()
    }

    #[tokio::test]
    async fn add_reaches_others_but_not_the_originator() {
        let backend = MemoryBackend::new();
        let mut router = router(&backend);
        let (a, mut rx_a) = client(&mut router);
        let (_b, mut rx_b) = client(&mut router);
        assert!(matches!(recv(&mut rx_a), ServerMessage::Init { tasks } if tasks.is_empty()));
        assert!(matches!(recv(&mut rx_b), ServerMessage::Init { .. }));

        router.handle_text(a, ADD_T1);

        assert_eq!(router.store().len(), 1);
        let ServerMessage::Update { tasks } = recv(&mut rx_b) else {
            panic!("expected update");
        };
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "t1");
        assert_eq!(tasks[0].group, "P1");
        assert!(rx_a.try_recv().is_err());

        router.persist.flush().await.unwrap();
        assert_eq!(backend.stored().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_removes_of_same_id_leave_it_absent() {
        let backend = MemoryBackend::new();
        let mut router = router(&backend);
        let (a, _rx_a) = client(&mut router);
        let (b, mut rx_b) = client(&mut router);
        router.handle_text(a, ADD_T1);
        let _ = recv(&mut rx_b);
        let _ = recv(&mut rx_b);

        router.handle_text(a, r#"{"type":"remove","id":"t1"}"#);
        router.handle_text(b, r#"{"type":"remove","id":"t1"}"#);

        assert!(router.store().get("t1").is_none());
        assert!(matches!(recv(&mut rx_b), ServerMessage::Update { tasks } if tasks.is_empty()));
    }

    #[tokio::test]
    async fn init_precedes_updates_for_new_connections() {
        let backend = MemoryBackend::new();
        let mut router = router(&backend);
        let (a, _rx_a) = client(&mut router);
        router.handle_text(a, ADD_T1);

        let (_c, mut rx_c) = client(&mut router);
        router.handle_text(a, r#"{"type":"remove","id":"t1"}"#);

        let ServerMessage::Init { tasks } = recv(&mut rx_c) else {
            panic!("first frame must be init");
        };
        assert_eq!(tasks.len(), 1);
        assert!(matches!(recv(&mut rx_c), ServerMessage::Update { tasks } if tasks.is_empty()));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn ping_and_resync_answer_only_the_sender() {
        let backend = MemoryBackend::new();
        let mut router = router(&backend);
        let (a, mut rx_a) = client(&mut router);
        let (_b, mut rx_b) = client(&mut router);
        let _ = recv(&mut rx_a);
        let _ = recv(&mut rx_b);

        router.handle_text(a, r#"{"type":"ping"}"#);
        router.handle_text(a, r#"{"type":"sync"}"#);

        assert_eq!(recv(&mut rx_a), ServerMessage::Pong);
        assert!(matches!(recv(&mut rx_a), ServerMessage::Sync { .. }));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(router.store().version(), 0);
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_change_nothing() {
        let backend = MemoryBackend::new();
        let mut router = router(&backend);
        let (a, _rx_a) = client(&mut router);
        let (_b, mut rx_b) = client(&mut router);
        let _ = recv(&mut rx_b);

        for text in [
            "not json",
            "[1,2,3]",
            r#"{"task":{}}"#,
            r#"{"type":"add"}"#,
            r#"{"type":"update","task":{"content":"no id"}}"#,
            r#"{"type":"update","task":{"id":"new","content":"no dates"}}"#,
            r#"{"type":"remove"}"#,
            r#"{"type":"explode"}"#,
        ] {
            router.handle_text(a, text);
        }

        assert!(router.store().is_empty());
        assert_eq!(router.store().version(), 0);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_state_update_replaces_the_collection() {
        let backend = MemoryBackend::new();
        let mut router = router(&backend);
        let (a, _rx_a) = client(&mut router);
        router.handle_text(a, ADD_T1);

        router.handle_text(
            a,
            r#"{"type":"update","tasks":[{"id":"t2","content":"Y","start":"2024-02-01","end":"2024-02-02"}]}"#,
        );

        let snapshot = router.store().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "t2");
        assert_eq!(snapshot[0].group, crate::task::UNASSIGNED_GROUP);
    }

    #[tokio::test]
    async fn save_failure_does_not_abort_the_operation() {
        let backend = MemoryBackend::new();
        backend.set_fail_saves(true);
        let mut router = router(&backend);
        let (a, _rx_a) = client(&mut router);
        let (_b, mut rx_b) = client(&mut router);
        let _ = recv(&mut rx_b);

        router.handle_text(a, ADD_T1);
        router.persist.flush().await.unwrap();

        assert_eq!(router.store().len(), 1);
        assert!(matches!(recv(&mut rx_b), ServerMessage::Update { .. }));
        assert!(backend.stored().is_empty());
    }

    #[tokio::test]
    async fn removing_an_absent_id_broadcasts_without_saving() {
        let backend = MemoryBackend::new();
        let mut router = router(&backend);
        let (a, _rx_a) = client(&mut router);
        let (_b, mut rx_b) = client(&mut router);
        let _ = recv(&mut rx_b);

        router.handle_text(a, r#"{"type":"remove","id":"ghost"}"#);
        router.persist.flush().await.unwrap();

        assert!(matches!(recv(&mut rx_b), ServerMessage::Update { .. }));
        assert_eq!(backend.save_count(), 0);
    }

    #[tokio::test]
    async fn slow_connection_is_dropped_without_affecting_others() {
        let backend = MemoryBackend::new();
        let mut router = router(&backend);
        let (a, _rx_a) = client(&mut router);
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let slow = router.connect(slow_tx);
        let (_b, mut rx_b) = client(&mut router);
        let _ = recv(&mut rx_b);

        router.handle_text(a, ADD_T1);
        router.handle_text(a, r#"{"type":"remove","id":"t1"}"#);

        assert!(!router.registry.contains(slow));
        assert_eq!(router.stats().connections, 2);
        assert!(matches!(recv(&mut rx_b), ServerMessage::Update { .. }));
        assert!(matches!(recv(&mut rx_b), ServerMessage::Update { .. }));
    }

    #[tokio::test]
    async fn sync_broadcast_kind_tags_fan_out_frames() {
        let backend = MemoryBackend::new();
        let config = RouterConfig {
            broadcast_kind: SnapshotKind::Sync,
            add_collision: AddCollisionPolicy::Overwrite,
            ..RouterConfig::default()
        };
        let seeded = vec![Task::new("t1", "old", "2024-01-01", "2024-01-02", "P0").with_subgroup("A")];
        let mut router = router_with(&backend, config, seeded);
        let (a, _rx_a) = client(&mut router);
        let (_b, mut rx_b) = client(&mut router);
        let _ = recv(&mut rx_b);

        router.handle_text(a, ADD_T1);

        let ServerMessage::Sync { tasks } = recv(&mut rx_b) else {
            panic!("expected sync");
        };
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].content, "X");
        assert_eq!(tasks[0].subgroup, None);
    }

    #[tokio::test]
    async fn handle_drives_the_actor() {
        let backend = MemoryBackend::new();
        let persist = PersistHandle::spawn(Arc::new(backend.clone()), 0);
        let store = TaskStore::new(AddCollisionPolicy::Merge);
        let (handle, router) = sync_channel(&RouterConfig::default(), store, persist.clone());
        let task = tokio::spawn(router.run());

        let (tx, mut rx) = mpsc::channel(8);
        let conn = handle.connect(tx).await.unwrap();
        assert!(rx.recv().await.is_some());

        handle.submit(conn, ADD_T1.to_owned()).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.tasks, 1);
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.version, 1);

        handle.disconnect(conn).await.unwrap();
        assert_eq!(handle.stats().await.unwrap().connections, 0);

        persist.flush().await.unwrap();
        assert_eq!(backend.stored().len(), 1);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_queued_requests_then_refuses_more() {
        let backend = MemoryBackend::new();
        let persist = PersistHandle::spawn(Arc::new(backend.clone()), 0);
        let store = TaskStore::new(AddCollisionPolicy::Merge);
        let (handle, router) = sync_channel(&RouterConfig::default(), store, persist.clone());

        let (tx, mut rx) = mpsc::channel(8);
        let (reply, _reply_rx) = oneshot::channel();
        handle
            .request(RouterRequest::Connect { outbound: tx, reply })
            .await
            .unwrap();
        handle.submit(1, ADD_T1.to_owned()).await.unwrap();
        handle.shutdown().await.unwrap();

        router.run().await;

        assert!(handle.submit(1, ADD_T1.to_owned()).await.is_err());
        persist.flush().await.unwrap();
        assert_eq!(backend.stored().len(), 1);

        // Init, then the queue closes with the router.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
