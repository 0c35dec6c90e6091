//! Timeline sync: a shared, ordered list of scheduling tasks kept consistent
//! across every connected timeline viewer.
//!
//! # Architecture
//!
//! One server process holds the authoritative collection:
//! - **Store**: ordered task collection with unique ids, mutated only by
//!   `add`, `update`, `remove` and `replace`
//! - **Router**: a single actor task that parses inbound frames, applies them
//!   to the store, hands snapshots to persistence and fans them out
//! - **Broadcast**: per-connection bounded queues; the originator is skipped
//! - **Persistence**: pluggable backends (file, HTTP object, memory) behind a
//!   coalescing single-writer save task
//! - **Server**: axum WebSocket endpoint plus small HTTP read endpoints
//!
//! Clients keep a local rendered copy and [`reconcile()`] each snapshot into it
//! with the fewest item changes. [`client::TimelineClient`] is a ready-made
//! WebSocket client built on that engine.

pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod reconcile;
pub mod router;
pub mod server;
pub mod store;
pub mod task;

pub use client::{ConnectionStatus, TimelineClient};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use persistence::{PersistHandle, PersistenceBackend};
pub use protocol::{ClientMessage, ServerMessage, SnapshotKind};
pub use reconcile::{ClientState, LocalTimeline, RenderedItems, TimelineItem, reconcile};
pub use router::{SyncHandle, SyncRouter, sync_channel};
pub use server::{SyncServer, SyncService};
pub use store::{AddCollisionPolicy, TaskStore};
pub use task::{Task, TaskPatch, UNASSIGNED_GROUP};
