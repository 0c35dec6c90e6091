//! WebSocket client that keeps a reconciled local timeline.
//!
//! [`TimelineClient`] connects to a sync server, applies every snapshot it
//! receives through [`ClientState`], and sends local edits after applying
//! them optimistically. A background task owns the socket and reconnects
//! with exponential backoff. Edits made while disconnected are held until
//! the next `init` has been applied and are then replayed over it before
//! being sent.

use crate::error::{Result, SyncError};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::reconcile::{ClientState, LocalTimeline, TimelineItem};
use crate::task::{Task, TaskPatch};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Connection state of a [`TimelineClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected and not trying.
    Disconnected,
    /// Establishing the first connection.
    Connecting,
    /// Socket open.
    Connected,
    /// Waiting to retry after a failure.
    Reconnecting {
        /// Consecutive failed attempts.
        attempt: u32,
    },
}

struct SharedState {
    status: ConnectionStatus,
    state: ClientState<LocalTimeline>,
}

fn lock(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Client for the real-time task protocol.
pub struct TimelineClient {
    shared: Arc<Mutex<SharedState>>,
    tx: Option<mpsc::UnboundedSender<ClientMessage>>,
    generation: watch::Receiver<u64>,
    handle: Option<JoinHandle<()>>,
}

impl TimelineClient {
    /// Start connecting to `url` (`ws://` or `wss://`).
    ///
    /// Returns immediately; the connection is made by a background task.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if `url` is not a WebSocket URL.
    pub fn connect(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| SyncError::Config(format!("invalid url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SyncError::Config(format!(
                "expected ws:// or wss:// url, got {url}"
            )));
        }

        let shared = Arc::new(Mutex::new(SharedState {
            status: ConnectionStatus::Connecting,
            state: ClientState::new(LocalTimeline::new()),
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        let (generation_tx, generation_rx) = watch::channel(0);

        let handle = tokio::spawn(connection_loop(
            url.to_string(),
            Arc::clone(&shared),
            rx,
            generation_tx,
        ));

        Ok(Self {
            shared,
            tx: Some(tx),
            generation: generation_rx,
            handle: Some(handle),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.shared).status
    }

    /// Rendered items, in display order.
    pub fn items(&self) -> Vec<TimelineItem> {
        lock(&self.shared).state.view().items().to_vec()
    }

    /// Derived group list.
    pub fn groups(&self) -> Vec<String> {
        lock(&self.shared).state.view().groups().to_vec()
    }

    /// Local state as wire records.
    pub fn tasks(&self) -> Vec<Task> {
        lock(&self.shared).state.tasks()
    }

    /// Number of server snapshots applied so far.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Wait until `predicate` holds for the local timeline, re-checking
    /// after every applied snapshot. Returns `false` on timeout.
    pub async fn wait_until<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&LocalTimeline) -> bool,
    {
        let mut generation = self.generation.clone();
        let check = |shared: &Mutex<SharedState>| predicate(lock(shared).state.view());
        tokio::time::timeout(timeout, async {
            loop {
                if check(&self.shared) {
                    return;
                }
                if generation.changed().await.is_err() {
                    // Connection task gone; nothing more will arrive.
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Render `task` locally and send `add`. Returns the id used.
    pub fn add_task(&self, task: Task) -> Result<String> {
        let message = lock(&self.shared).state.add_local(task);
        let id = match &message {
            ClientMessage::Add { task } => task.id.clone(),
            _ => String::new(),
        };
        self.send(message)?;
        Ok(id)
    }

    /// Merge `patch` locally and send `update`.
    pub fn update_task(&self, patch: TaskPatch) -> Result<()> {
        let message = lock(&self.shared).state.update_local(patch);
        self.send(message)
    }

    /// Remove locally and send `remove`.
    pub fn remove_task(&self, id: &str) -> Result<()> {
        let message = lock(&self.shared).state.remove_local(id);
        self.send(message)
    }

    /// Send the entire local state as `replace`.
    pub fn push_full_state(&self) -> Result<()> {
        let message = lock(&self.shared).state.full_state();
        self.send(message)
    }

    /// Ask the server for a fresh `sync` snapshot.
    pub fn request_resync(&self) -> Result<()> {
        self.send(ClientMessage::Resync)
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| SyncError::Channel("client is closed".to_owned()))?
            .send(message)
            .map_err(|_| SyncError::Channel("connection task stopped".to_owned()))
    }

    /// Close the socket after flushing queued messages.
    pub async fn close(&mut self) {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TimelineClient {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

async fn connection_loop(
    url: String,
    shared: Arc<Mutex<SharedState>>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    generation: watch::Sender<u64>,
) {
    let mut attempt: u32 = 0;
    // Edits taken off the queue but not yet written to a socket.
    let mut pending: Vec<ClientMessage> = Vec::new();

    loop {
        lock(&shared).status = if attempt == 0 {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Reconnecting { attempt }
        };

        match try_connect(
            &url,
            &shared,
            &mut outbound_rx,
            &mut pending,
            &generation,
            &mut attempt,
        )
        .await
        {
            Ok(()) => {
                lock(&shared).status = ConnectionStatus::Disconnected;
                break;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "timeline connection failed");
                attempt += 1;

                let delay = BASE_RECONNECT_DELAY
                    .saturating_mul(2u32.saturating_pow(attempt.min(5)))
                    .min(MAX_RECONNECT_DELAY);

                lock(&shared).status = ConnectionStatus::Reconnecting { attempt };
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// One connection. `Ok(())` when the client closed it, `Err` otherwise.
async fn try_connect(
    url: &str,
    shared: &Arc<Mutex<SharedState>>,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    pending: &mut Vec<ClientMessage>,
    generation: &watch::Sender<u64>,
    attempt: &mut u32,
) -> std::result::Result<(), String> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| format!("connect: {e}"))?;
    let (mut write, mut read) = ws_stream.split();

    lock(shared).status = ConnectionStatus::Connected;
    *attempt = 0;
    tracing::info!(url, "timeline connected");

    // Outbound edits stay queued until the init snapshot is in.
    let init = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match ServerMessage::parse(text.as_str()) {
                Ok(message @ ServerMessage::Init { .. }) => break message,
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "ignoring unparseable server message"),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err("connection closed before init".into());
            }
            Some(Err(e)) => return Err(format!("read error: {e}")),
            _ => {}
        }
    };

    while let Ok(message) = outbound_rx.try_recv() {
        pending.push(message);
    }
    {
        let mut guard = lock(shared);
        guard.state.apply(init);
        for message in pending.iter() {
            guard.state.replay(message);
        }
    }
    generation.send_modify(|g| *g += 1);

    if !pending.is_empty() {
        tracing::debug!(pending = pending.len(), "sending edits made while offline");
        for message in pending.iter() {
            send_message(&mut write, message).await?;
        }
        pending.clear();
        // The sync reply carries the server's view of those edits.
        send_message(&mut write, &ClientMessage::Resync).await?;
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // Skip the first immediate tick.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_server_message(text.as_str(), shared, generation);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err("connection closed by server".into());
                    }
                    Some(Err(e)) => {
                        return Err(format!("read error: {e}"));
                    }
                    _ => {}
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    let _ = write.close().await;
                    return Ok(());
                };
                send_message(&mut write, &message).await?;
            }
            _ = ping_interval.tick() => {
                send_message(&mut write, &ClientMessage::Ping)
                    .await
                    .map_err(|e| format!("ping {e}"))?;
            }
        }
    }
}

async fn send_message<S>(write: &mut S, message: &ClientMessage) -> std::result::Result<(), String>
where
    S: futures_util::Sink<tokio_tungstenite::tungstenite::Message> + Unpin,
    S::Error: std::fmt::Display,
{
    use futures_util::SinkExt;

    let json = match message.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(op = message.op_name(), error = %e, "cannot encode outgoing message");
            return Ok(());
        }
    };
    write
        .send(tokio_tungstenite::tungstenite::Message::Text(json.into()))
        .await
        .map_err(|e| format!("send error: {e}"))
}

fn handle_server_message(text: &str, shared: &Mutex<SharedState>, generation: &watch::Sender<u64>) {
    let message = match ServerMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable server message");
            return;
        }
    };

    let report = lock(shared).state.apply(message);
    if let Some(report) = report {
        tracing::debug!(
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            "applied snapshot"
        );
        generation.send_modify(|g| *g += 1);
    }
}
