//! Error types for the timeline sync engine.

/// Top-level error type for the sync server and client.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Persistence backend error (load or save).
    #[error("storage error: {0}")]
    Storage(String),

    /// Inbound message rejected at the protocol boundary.
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    /// Channel send/receive error between tasks.
    #[error("channel error: {0}")]
    Channel(String),

    /// HTTP/WebSocket server error.
    #[error("server error: {0}")]
    Server(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SyncError>;
