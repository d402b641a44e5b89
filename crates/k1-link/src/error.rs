use k1_core::WireError;

/// Failures of the underlying message channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    #[error("invalid device url {0:?}: expected ws:// or wss:// with a host")]
    InvalidUrl(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("fps must be a positive number, got {0}")]
    InvalidFps(f64),

    #[error("link session has shut down")]
    SessionClosed,
}
