use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

pub mod authed;
pub mod websocket;

pub use authed::{AuthError, AuthedTransport};
pub use websocket::WebSocketConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket connect timed out")]
    ConnectTimeout,
    #[error("setup error: {0}")]
    Setup(String),
    #[error("channel closed")]
    ChannelClosed,
}

/// Event delivered by a socket connection.
#[derive(Debug)]
pub enum SocketEvent {
    /// One complete inbound text frame.
    Message(String),
    /// The connection is gone; no further events follow.
    Closed,
}

/// Both ends of an open duplex connection: a sender for outbound text
/// frames, a receiver for inbound events, and the pump tasks that keep
/// them moving. Dropping the sender closes the connection; the tasks are
/// aborted on session teardown.
pub struct SocketPair {
    pub outbound: mpsc::UnboundedSender<String>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Factory for duplex connections to the signaling relay. The session
/// never constructs sockets itself, so tests inject channel-backed
/// connectors and production injects [`WebSocketConnector`].
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<SocketPair, TransportError>;
}
