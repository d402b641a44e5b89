//! Transport seam. The session only sees [`Transport`] and [`Connector`];
//! production uses the WebSocket implementation below, tests script their own.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;
use crate::url::DeviceUrl;

/// One inbound message from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
}

/// A bidirectional, message-oriented link.
///
/// `recv` must be cancel-safe: the session drops in-flight `recv` futures
/// whenever another event wins a `select!`.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Next message; `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>>;

    /// Idle keepalive the peer ignores.
    async fn ping(&mut self) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &DeviceUrl) -> Result<Box<dyn Transport>, TransportError>;
}

// ── WebSocket ─────────────────────────────────────────────────────────────────

pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &DeviceUrl) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| TransportError::Connect("timed out".to_string()))?
                .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(url = %url, "websocket open");
        Ok(Box::new(WsTransport { stream }))
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.stream
            .send(Message::binary(frame))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(b)) => return Some(Ok(Inbound::Binary(b))),
                Ok(Message::Text(t)) => return Some(Ok(Inbound::Text(t.as_str().to_owned()))),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "websocket closed by peer");
                    return None;
                }
                // Control frames are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::WebSocket(e.to_string()))),
            }
        }
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.stream
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}
