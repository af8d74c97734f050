use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::mpsc;

use super::TransportError;
use crate::protocol::{PskTag, SignalMessage};
use crate::psk::SharedKey;

type HmacSha256 = Hmac<Sha256>;

/// Replay high-water marks for unaddressed messages fall back to this
/// shared per-room key.
const ROOM_WIDE_PEER: &str = "room";

/// Why an inbound message was dropped. Never propagated; delivered to the
/// optional diagnostic callback only.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed signaling message: {0}")]
    Malformed(String),
    #[error("{kind} message missing auth tag")]
    MissingTag { kind: &'static str },
    #[error("bad signature on {kind} message")]
    BadSignature { kind: &'static str },
    #[error("replayed {kind} from {peer}: ctr {ctr} <= {last}")]
    Replay {
        kind: &'static str,
        peer: String,
        ctr: u64,
        last: u64,
    },
}

pub type DiagnosticFn = Arc<dyn Fn(&AuthError) + Send + Sync>;

/// Fixed-order projection of a message that the MAC covers. Everything
/// outside these fields rides along unauthenticated; in particular `from`
/// is trusted only for routing, never for acceptance.
#[derive(Serialize)]
struct CanonicalView<'a> {
    t: &'a str,
    to: Option<&'a str>,
    sdp: Option<&'a str>,
    cand: Option<&'a str>,
    mid: Option<&'a str>,
    idx: Option<u16>,
    ctr: u64,
}

impl<'a> CanonicalView<'a> {
    fn of(msg: &'a SignalMessage, ctr: u64) -> Self {
        let blob = msg.candidate();
        Self {
            t: msg.kind(),
            to: msg.to_peer(),
            sdp: msg.sdp(),
            cand: blob.map(|b| b.candidate.as_str()),
            mid: blob.and_then(|b| b.sdp_mid.as_deref()),
            idx: blob.and_then(|b| b.sdp_mline_index),
            ctr,
        }
    }
}

/// Signs outbound and verifies/deduplicates inbound signaling messages
/// with a per-room shared key. Counter state lives for the lifetime of
/// one session instance and survives relay reconnects; the socket sender
/// is swapped in and out as connections come and go.
pub struct AuthedTransport {
    key: Option<Arc<SharedKey>>,
    send_ctr: AtomicU64,
    accepted: Mutex<HashMap<String, u64>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    diagnostic: Option<DiagnosticFn>,
}

impl AuthedTransport {
    pub fn new(key: Option<Arc<SharedKey>>) -> Self {
        Self {
            key,
            send_ctr: AtomicU64::new(0),
            accepted: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: DiagnosticFn) -> Self {
        self.diagnostic = Some(diagnostic);
        self
    }

    /// Point the transport at a freshly opened socket.
    pub fn attach(&self, outbound: mpsc::UnboundedSender<String>) {
        *self.outbound.lock().unwrap() = Some(outbound);
    }

    /// Forget the socket after it closed; sends fail until re-attached.
    pub fn detach(&self) {
        *self.outbound.lock().unwrap() = None;
    }

    /// Sign (unless passthrough) and transmit one message.
    pub fn send(&self, mut msg: SignalMessage) -> Result<(), TransportError> {
        if let Some(key) = &self.key {
            if !msg.is_passthrough() {
                let ctr = self.send_ctr.fetch_add(1, Ordering::SeqCst) + 1;
                let mac = compute_mac(key.bytes(), &msg, ctr)?;
                msg.set_psk(PskTag { mac, ctr });
            }
        }
        let text = serde_json::to_string(&msg)
            .map_err(|err| TransportError::Setup(format!("serialize failed: {err}")))?;
        let guard = self.outbound.lock().unwrap();
        guard
            .as_ref()
            .ok_or(TransportError::ChannelClosed)?
            .send(text)
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Parse and verify one inbound frame. `None` means the frame was
    /// dropped; the reason went to the diagnostic callback.
    pub fn accept(&self, raw: &str) -> Option<SignalMessage> {
        let msg: SignalMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(err) => {
                self.report(&AuthError::Malformed(err.to_string()));
                return None;
            }
        };
        if msg.is_passthrough() {
            return Some(msg);
        }
        let Some(key) = &self.key else {
            return Some(msg);
        };

        let kind = msg.kind();
        let Some(tag) = msg.psk().cloned() else {
            self.report(&AuthError::MissingTag { kind });
            return None;
        };
        if !verify_mac(key.bytes(), &msg, &tag) {
            self.report(&AuthError::BadSignature { kind });
            return None;
        }

        let peer = msg.from_peer().unwrap_or(ROOM_WIDE_PEER).to_string();
        let mut accepted = self.accepted.lock().unwrap();
        let last = accepted.get(&peer).copied().unwrap_or(0);
        if tag.ctr <= last {
            drop(accepted);
            self.report(&AuthError::Replay {
                kind,
                peer,
                ctr: tag.ctr,
                last,
            });
            return None;
        }
        accepted.insert(peer, tag.ctr);
        Some(msg)
    }

    fn report(&self, err: &AuthError) {
        tracing::debug!(target: "signaling", error = %err, "dropped inbound frame");
        if let Some(diagnostic) = &self.diagnostic {
            diagnostic(err);
        }
    }
}

fn compute_mac(key: &[u8], msg: &SignalMessage, ctr: u64) -> Result<String, TransportError> {
    let view = CanonicalView::of(msg, ctr);
    let payload = serde_json::to_vec(&view)
        .map_err(|err| TransportError::Setup(format!("canonical view failed: {err}")))?;
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| TransportError::Setup(format!("invalid key: {err}")))?;
    mac.update(&payload);
    Ok(BASE64_URL.encode(mac.finalize().into_bytes()))
}

fn verify_mac(key: &[u8], msg: &SignalMessage, tag: &PskTag) -> bool {
    let view = CanonicalView::of(msg, tag.ctr);
    let Ok(payload) = serde_json::to_vec(&view) else {
        return false;
    };
    let Ok(claimed) = BASE64_URL.decode(tag.mac.as_bytes()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(&payload);
    // Mac::verify_slice is a constant-time comparison.
    mac.verify_slice(&claimed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IceCandidateBlob;

    fn key(bytes: &[u8]) -> Arc<SharedKey> {
        Arc::new(SharedKey::from_bytes("Baby", bytes.to_vec()))
    }

    fn offer(to: Option<&str>) -> SignalMessage {
        SignalMessage::Offer {
            sdp: "v=0 test-offer".into(),
            to: to.map(str::to_string),
            from: None,
            psk: None,
        }
    }

    #[test]
    fn canonical_view_has_fixed_field_order() {
        let msg = SignalMessage::Candidate {
            candidate: IceCandidateBlob {
                candidate: "candidate:1".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
            to: Some("cam-1".into()),
            from: None,
            psk: None,
        };
        let view = CanonicalView::of(&msg, 7);
        let text = serde_json::to_string(&view).unwrap();
        assert_eq!(
            text,
            r#"{"t":"candidate","to":"cam-1","sdp":null,"cand":"candidate:1","mid":"0","idx":0,"ctr":7}"#
        );
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let k = key(b"0123456789abcdef");
        let ctr = 1;
        let mac = compute_mac(k.bytes(), &offer(Some("cam-1")), ctr).unwrap();
        let tag = PskTag { mac, ctr };
        assert!(verify_mac(k.bytes(), &offer(Some("cam-1")), &tag));
    }

    #[test]
    fn verification_rejects_key_mismatch() {
        let signing = key(b"0123456789abcdef");
        let other = key(b"fedcba9876543210");
        let mac = compute_mac(signing.bytes(), &offer(None), 1).unwrap();
        let tag = PskTag { mac, ctr: 1 };
        assert!(!verify_mac(other.bytes(), &offer(None), &tag));
    }

    #[test]
    fn tampered_field_invalidates_mac() {
        let k = key(b"0123456789abcdef");
        let mac = compute_mac(k.bytes(), &offer(Some("cam-1")), 1).unwrap();
        let tag = PskTag { mac, ctr: 1 };
        assert!(!verify_mac(k.bytes(), &offer(Some("cam-2")), &tag));
    }
}
