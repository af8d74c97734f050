use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use webrtc::api::APIBuilder;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::config::SessionConfig;
use crate::protocol::IceCandidateBlob;
use crate::session::events::TrackEvent;

/// SDP create/commit/apply and peer construction failures. These never
/// cross the session boundary; the session converts them into status
/// callbacks and a forced retry.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer setup failed: {0}")]
    Setup(String),
    #[error("sdp error: {0}")]
    Sdp(String),
}

/// Coarse ICE connectivity state surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for IceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            IceState::New => "new",
            IceState::Checking => "checking",
            IceState::Connected => "connected",
            IceState::Completed => "completed",
            IceState::Disconnected => "disconnected",
            IceState::Failed => "failed",
            IceState::Closed => "closed",
        };
        f.write_str(text)
    }
}

impl From<RTCIceConnectionState> for IceState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => IceState::Checking,
            RTCIceConnectionState::Connected => IceState::Connected,
            RTCIceConnectionState::Completed => IceState::Completed,
            RTCIceConnectionState::Disconnected => IceState::Disconnected,
            RTCIceConnectionState::Failed => IceState::Failed,
            RTCIceConnectionState::Closed => IceState::Closed,
            _ => IceState::New,
        }
    }
}

/// Callbacks a peer connection feeds back into the session.
#[derive(Clone)]
pub struct PeerHooks {
    pub on_local_candidate: Arc<dyn Fn(IceCandidateBlob) + Send + Sync>,
    pub on_ice_state: Arc<dyn Fn(IceState) + Send + Sync>,
    pub on_track: Arc<dyn Fn(TrackEvent) + Send + Sync>,
    pub on_data_channel: Arc<dyn Fn(Arc<RTCDataChannel>) + Send + Sync>,
}

/// The slice of a peer connection the session drives. Production wraps
/// webrtc-rs; tests substitute a scripted fake.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, NegotiationError>;
    async fn set_local_offer(&self, sdp: &str) -> Result<(), NegotiationError>;
    async fn apply_answer(&self, sdp: &str) -> Result<(), NegotiationError>;
    async fn add_remote_candidate(&self, candidate: IceCandidateBlob)
    -> Result<(), NegotiationError>;
    /// The committed local offer, if negotiation reached that point.
    fn local_offer(&self) -> Option<String>;
    async fn close(&self);
}

/// Injected factory for peer connections, the seam both for tests and
/// for callers that need custom construction (extra data channels,
/// simulcast tweaks).
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        config: &SessionConfig,
        hooks: PeerHooks,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

/// Hook invoked on every freshly constructed `RTCPeerConnection`, e.g.
/// to register application data channels before the offer is created.
pub type ConfigureFn = Arc<dyn Fn(&Arc<RTCPeerConnection>) + Send + Sync>;

/// Production factory over webrtc-rs. Builds receive-only audio/video
/// transceivers, matching the monitor pages.
pub struct WebRtcPeerFactory {
    configure: Option<ConfigureFn>,
}

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self { configure: None }
    }

    pub fn with_configure(mut self, configure: ConfigureFn) -> Self {
        self.configure = Some(configure);
        self
    }
}

impl Default for WebRtcPeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        config: &SessionConfig,
        hooks: PeerHooks,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|err| NegotiationError::Setup(err.to_string()))?;
        let api = APIBuilder::new().with_media_engine(media).build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| NegotiationError::Setup(err.to_string()))?,
        );

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map_err(|err| NegotiationError::Setup(err.to_string()))?;
        }

        if let Some(configure) = &self.configure {
            configure(&pc);
        }

        let on_data_channel = Arc::clone(&hooks.on_data_channel);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            on_data_channel(dc);
            Box::pin(async {})
        }));

        let on_local_candidate = Arc::clone(&hooks.on_local_candidate);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(json) => on_local_candidate(IceCandidateBlob {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                    }),
                    Err(err) => {
                        tracing::warn!(target: "signaling", error = %err, "ice candidate to_json failed");
                    }
                }
            }
            Box::pin(async {})
        }));

        let on_ice_state = Arc::clone(&hooks.on_ice_state);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            on_ice_state(IceState::from(state));
            Box::pin(async {})
        }));

        let on_track = Arc::clone(&hooks.on_track);
        pc.on_track(Box::new(move |track, receiver, _transceiver| {
            on_track(TrackEvent { track, receiver });
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeer {
            pc,
            local_offer: Mutex::new(None),
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    local_offer: Mutex<Option<String>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| NegotiationError::Sdp(err.to_string()))?;
        Ok(offer.sdp)
    }

    async fn set_local_offer(&self, sdp: &str) -> Result<(), NegotiationError> {
        let description = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|err| NegotiationError::Sdp(err.to_string()))?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| NegotiationError::Sdp(err.to_string()))?;
        *self.local_offer.lock().unwrap() = Some(sdp.to_string());
        Ok(())
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), NegotiationError> {
        let description = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|err| NegotiationError::Sdp(err.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| NegotiationError::Sdp(err.to_string()))
    }

    async fn add_remote_candidate(
        &self,
        candidate: IceCandidateBlob,
    ) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|err| NegotiationError::Sdp(err.to_string()))
    }

    fn local_offer(&self) -> Option<String> {
        self.local_offer.lock().unwrap().clone()
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target: "signaling", error = %err, "peer close failed");
        }
    }
}
