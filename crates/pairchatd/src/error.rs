use thiserror::Error;

/// Errors that can occur while serving a chat connection.
#[derive(Error, Debug)]
pub enum PairchatError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Event encoding or decoding error.
    #[error("event error: {0}")]
    Event(#[from] pairchat_common::EventError),
    /// The client offered subprotocols but not ours.
    #[error("unsupported subprotocol: {0}")]
    UnsupportedProtocol(String),
    /// The client's address already holds the maximum number of connections.
    #[error("per-ip connection limit reached")]
    IpLimit,
    /// The client did not finish the WebSocket upgrade in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// The server stopped accepting new handshakes.
    #[error("server shutting down")]
    ShuttingDown,
}
