//! HTTP + WebSocket transport for the sync router.
//!
//! Routes:
//! - `GET /` and `GET /ws`: WebSocket upgrade into the real-time protocol.
//! - `GET /api/tasks`: current collection as a JSON array.
//! - `GET /health`: liveness plus task and connection counts.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::persistence::{self, PersistHandle, PersistenceBackend};
use crate::protocol::Frame;
use crate::router::{SyncHandle, sync_channel};
use crate::store::TaskStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct AppState {
    sync: SyncHandle,
    outbound_capacity: usize,
}

/// Build the axum application for a running router.
pub fn app(sync: SyncHandle, outbound_capacity: usize) -> Router {
    let state = AppState {
        sync,
        outbound_capacity: outbound_capacity.max(1),
    };
    Router::new()
        .route("/", get(handle_ws))
        .route("/ws", get(handle_ws))
        .route("/api/tasks", get(handle_tasks))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Listening HTTP/WebSocket server.
pub struct SyncServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncServer {
    /// Bind `bind_addr` (port `0` picks a free port) and serve in a
    /// background task.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot bind.
    pub async fn start(
        bind_addr: &str,
        sync: SyncHandle,
        outbound_capacity: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| SyncError::Server(format!("bind {bind_addr} failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| SyncError::Server(format!("failed to get local addr: {e}")))?;

        let app = app(sync, outbound_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        info!("timeline sync listening on http://{addr} (ws on / and /ws)");

        let handle = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!("sync server error: {e}");
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Returns the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and wait for the accept loop to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// A fully wired sync service: persistence writer, router task and server.
pub struct SyncService {
    server: SyncServer,
    sync: SyncHandle,
    persist: PersistHandle,
    router: JoinHandle<()>,
}

impl SyncService {
    /// Start a service using the backend selected by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration or a failed bind.
    pub async fn start(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let backend = persistence::backend_from_config(&config.storage)?;
        Self::start_with_backend(config, backend).await
    }

    /// Start a service over an explicit backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn start_with_backend(
        config: &SyncConfig,
        backend: Arc<dyn PersistenceBackend>,
    ) -> Result<Self> {
        let tasks = persistence::load_or_empty(backend.as_ref()).await;
        let store = TaskStore::from_tasks(tasks, config.sync.add_collision);
        let persist = PersistHandle::spawn(backend, 0);
        if store.version() > 0 {
            info!(tasks = store.len(), "writing back normalized task ids");
            persist.submit(store.version(), store.snapshot());
        }

        let outbound_capacity = config.sync.outbound_capacity;
        let (sync, router) = sync_channel(&config.sync, store, persist.clone());
        let router = tokio::spawn(router.run());

        let bind_addr = config.bind_addr();
        let server = match SyncServer::start(&bind_addr, sync.clone(), outbound_capacity).await {
            Ok(server) => server,
            Err(e) => {
                router.abort();
                return Err(e);
            }
        };

        Ok(Self {
            server,
            sync,
            persist,
            router,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.addr()
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn handle(&self) -> &SyncHandle {
        &self.sync
    }

    pub fn persist(&self) -> &PersistHandle {
        &self.persist
    }

    /// Stop accepting connections, let the router finish what is queued,
    /// then flush pending saves.
    ///
    /// Open sockets are closed when the router stops; anything they send
    /// afterwards is refused rather than applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the save writer stopped before the flush.
    pub async fn shutdown(mut self) -> Result<()> {
        self.server.shutdown().await;
        if self.sync.shutdown().await.is_ok()
            && let Err(e) = (&mut self.router).await
        {
            warn!(error = %e, "sync router task failed");
        }
        self.persist.flush().await
    }
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, peer, state))
}

async fn handle_tasks(State(state): State<AppState>) -> Response {
    match state.sync.snapshot().await {
        Ok(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        Err(e) => unavailable(e),
    }
}

async fn handle_health(State(state): State<AppState>) -> Response {
    match state.sync.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "status": "ok",
            "tasks": stats.tasks,
            "connections": stats.connections,
        }))
        .into_response(),
        Err(e) => unavailable(e),
    }
}

fn unavailable(e: SyncError) -> Response {
    warn!(error = %e, "router unavailable");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({"status": "unavailable"})),
    )
        .into_response()
}

/// Drive one WebSocket until either side hangs up.
///
/// The socket writer drains the connection's bounded queue; when the router
/// drops the queue (slow or failed delivery) the writer ends and the
/// connection is closed so the client reconnects and gets a fresh `init`.
async fn serve_socket(socket: WebSocket, peer: SocketAddr, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(state.outbound_capacity);

    let conn = match state.sync.connect(outbound_tx).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(peer = %peer, error = %e, "rejecting connection");
            let _ = sink.close().await;
            return;
        }
    };
    info!(conn, peer = %peer, "client connected");

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(frame.to_string().into())).await {
                debug!(conn, error = %e, "websocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if state.sync.submit(conn, text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => debug!(conn, "ignoring binary frame"),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn, error = %e, "websocket read failed");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    writer.abort();
    let _ = state.sync.disconnect(conn).await;
    info!(conn, peer = %peer, "client disconnected");
}
