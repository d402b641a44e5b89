//! k1-link — the device link session: WebSocket transport, reply parsing,
//! reconnect backoff, and the session actor that uploads frames, retries on
//! transient failures, streams sequences, and queries device inventory.

pub mod backoff;
pub mod error;
pub mod reply;
pub mod session;
pub mod transport;
pub mod url;

pub use backoff::Backoff;
pub use error::{LinkError, TransportError};
pub use reply::{AckCode, AckReply, DeviceStatus, PatternEntry};
pub use session::{AckReport, CancelFlag, LinkHandle, LinkSession, LinkState, StreamReport};
pub use transport::{Connector, Inbound, Transport, WsConnector, WsTransport};
pub use url::DeviceUrl;
