use std::time::Duration;

use crate::transport::TransportError;
use url::Url;

/// Default STUN server, same as the hosted monitor pages use.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// An ICE server entry. `username`/`credential` stay empty for plain STUN.
#[derive(Debug, Clone, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

/// Configuration for one signaling session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Signaling relay endpoint, e.g. `wss://relay.example.com/ws`.
    pub endpoint: String,
    /// Room the session joins; also selects the shared key.
    pub room: String,
    pub ice_servers: Vec<IceServer>,
    /// Liveness ping period while the socket is open.
    pub keepalive: Duration,
    /// Reconnect backoff bounds; the delay doubles up to the max and
    /// resets to the min after a successful open.
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// How long to wait for the socket to open before closing it and
    /// scheduling a reconnect.
    pub connect_timeout: Duration,
    /// How long ICE may sit in `disconnected` before a forced
    /// renegotiation.
    pub ice_disconnect_grace: Duration,
    /// Period of the offer-resend loop while no answer is applied.
    pub offer_resend: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            room: "Baby".to_string(),
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            keepalive: Duration::from_secs(25),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            ice_disconnect_grace: Duration::from_secs(9),
            offer_resend: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            room: room.into(),
            ..Default::default()
        }
    }

    /// Full socket URL including the room query parameter.
    pub fn socket_url(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.endpoint).map_err(|err| {
            TransportError::Setup(format!("invalid endpoint {}: {err}", self.endpoint))
        })?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::Setup(format!(
                    "unsupported endpoint scheme: {other}"
                )));
            }
        }
        url.query_pairs_mut().append_pair("room", &self.room);
        Ok(url)
    }
}

/// Builder for [`SessionConfig`].
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new(endpoint: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            config: SessionConfig::new(endpoint, room),
        }
    }

    pub fn ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.config.ice_servers = servers;
        self
    }

    pub fn keepalive(mut self, period: Duration) -> Self {
        self.config.keepalive = period;
        self
    }

    pub fn reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.config.reconnect_min = min;
        self.config.reconnect_max = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn ice_disconnect_grace(mut self, grace: Duration) -> Self {
        self.config.ice_disconnect_grace = grace;
        self
    }

    pub fn offer_resend(mut self, period: Duration) -> Self {
        self.config.offer_resend = period;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_appends_room() {
        let config = SessionConfig::new("wss://relay.example.com/ws", "Baby");
        let url = config.socket_url().unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws?room=Baby");
    }

    #[test]
    fn rejects_non_websocket_scheme() {
        let config = SessionConfig::new("https://relay.example.com/ws", "Baby");
        assert!(config.socket_url().is_err());
    }
}
