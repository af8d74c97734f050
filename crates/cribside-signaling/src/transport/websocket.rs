use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::{SocketConnector, SocketEvent, SocketPair, TransportError};

/// Production [`SocketConnector`] over tokio-tungstenite. Splits the
/// stream into a writer task fed by an unbounded channel and a reader
/// task that forwards text frames as [`SocketEvent`]s.
#[derive(Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<SocketPair, TransportError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target: "signaling", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SocketEvent>();

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if event_tx.send(SocketEvent::Message(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            if event_tx.send(SocketEvent::Message(text)).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target: "signaling",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target: "signaling",
                                    "signaling websocket error: {err}"
                                );
                            }
                        }
                        break;
                    }
                }
            }
            let _ = event_tx.send(SocketEvent::Closed);
        });

        Ok(SocketPair {
            outbound: out_tx,
            events: event_rx,
            tasks: vec![writer, reader],
        })
    }
}
