//! End-to-end properties of the signed transport: a camera-side
//! transport produces wire frames, a viewer-side transport accepts or
//! drops them.

use std::sync::{Arc, Mutex};

use cribside_signaling::protocol::{IceCandidateBlob, SignalMessage};
use cribside_signaling::psk::SharedKey;
use cribside_signaling::transport::{AuthError, AuthedTransport};
use tokio::sync::mpsc;

const KEY: &[u8] = b"0123456789abcdef";

fn shared_key(bytes: &[u8]) -> Arc<SharedKey> {
    Arc::new(SharedKey::from_bytes("Baby", bytes.to_vec()))
}

/// A signing peer plus the channel its frames land on.
struct WireEnd {
    transport: AuthedTransport,
    frames: mpsc::UnboundedReceiver<String>,
}

impl WireEnd {
    fn new(key: Option<Arc<SharedKey>>) -> Self {
        let transport = AuthedTransport::new(key);
        let (tx, frames) = mpsc::unbounded_channel();
        transport.attach(tx);
        Self { transport, frames }
    }

    fn frame(&mut self, msg: SignalMessage) -> String {
        self.transport.send(msg).expect("send");
        self.frames.try_recv().expect("frame on the wire")
    }
}

fn viewer_with_log() -> (AuthedTransport, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let transport =
        AuthedTransport::new(Some(shared_key(KEY))).with_diagnostic(Arc::new(move |err| {
            let label = match err {
                AuthError::Malformed(_) => "malformed",
                AuthError::MissingTag { .. } => "missing-tag",
                AuthError::BadSignature { .. } => "bad-signature",
                AuthError::Replay { .. } => "replay",
            };
            sink.lock().unwrap().push(label.to_string());
        }));
    (transport, log)
}

fn answer_from(peer: &str, sdp: &str) -> SignalMessage {
    SignalMessage::Answer {
        sdp: sdp.to_string(),
        to: None,
        from: Some(peer.to_string()),
        psk: None,
    }
}

#[test]
fn signed_answer_is_delivered() {
    let mut camera = WireEnd::new(Some(shared_key(KEY)));
    let (viewer, log) = viewer_with_log();

    let frame = camera.frame(answer_from("cam-1", "v=0 answer"));
    let msg = viewer.accept(&frame).expect("delivered");
    assert_eq!(msg.kind(), "answer");
    assert_eq!(msg.from_peer(), Some("cam-1"));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn replayed_frame_is_dropped() {
    let mut camera = WireEnd::new(Some(shared_key(KEY)));
    let (viewer, log) = viewer_with_log();

    let frame = camera.frame(answer_from("cam-1", "v=0 answer"));
    assert!(viewer.accept(&frame).is_some());
    assert!(viewer.accept(&frame).is_none());
    assert_eq!(*log.lock().unwrap(), vec!["replay"]);
}

#[test]
fn stale_counter_is_dropped_even_unreplayed() {
    let mut camera = WireEnd::new(Some(shared_key(KEY)));
    let (viewer, log) = viewer_with_log();

    let first = camera.frame(answer_from("cam-1", "v=0 one"));
    let second = camera.frame(answer_from("cam-1", "v=0 two"));

    // Deliver out of order: the newer counter wins, the older is stale.
    assert!(viewer.accept(&second).is_some());
    assert!(viewer.accept(&first).is_none());
    assert_eq!(*log.lock().unwrap(), vec!["replay"]);
}

#[test]
fn counters_are_tracked_per_sender() {
    let mut cam_a = WireEnd::new(Some(shared_key(KEY)));
    let mut cam_b = WireEnd::new(Some(shared_key(KEY)));
    let (viewer, _log) = viewer_with_log();

    // Both cameras start at ctr 1; neither shadows the other.
    assert!(viewer.accept(&cam_a.frame(answer_from("cam-a", "v=0 a"))).is_some());
    assert!(viewer.accept(&cam_b.frame(answer_from("cam-b", "v=0 b"))).is_some());
}

#[test]
fn anonymous_senders_share_a_room_wide_highwater() {
    let mut camera = WireEnd::new(Some(shared_key(KEY)));
    let (viewer, log) = viewer_with_log();

    let anon = |sdp: &str| SignalMessage::Answer {
        sdp: sdp.to_string(),
        to: None,
        from: None,
        psk: None,
    };
    let first = camera.frame(anon("v=0 one"));
    let second = camera.frame(anon("v=0 two"));
    assert!(viewer.accept(&first).is_some());
    assert!(viewer.accept(&second).is_some());
    assert!(viewer.accept(&second).is_none());
    assert_eq!(*log.lock().unwrap(), vec!["replay"]);
}

#[test]
fn passthrough_types_skip_verification() {
    let (viewer, log) = viewer_with_log();

    // No tag at all.
    assert!(viewer
        .accept(r#"{"type":"hello","from":"cam-1"}"#)
        .is_some());
    assert!(viewer.accept(r#"{"type":"keepalive","ts":12}"#).is_some());
    // Garbage where a tag would sit is ignored on passthrough types.
    assert!(viewer
        .accept(r#"{"type":"hello","from":"cam-1","psk":"garbage"}"#)
        .is_some());
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn untagged_negotiation_messages_are_dropped() {
    let (viewer, log) = viewer_with_log();

    assert!(viewer
        .accept(r#"{"type":"answer","sdp":"v=0 answer","from":"cam-1"}"#)
        .is_none());
    assert!(viewer
        .accept(r#"{"type":"need-offer","from":"cam-1"}"#)
        .is_none());
    assert_eq!(*log.lock().unwrap(), vec!["missing-tag", "missing-tag"]);
}

#[test]
fn unrecognized_type_is_dropped_before_inspection() {
    let (viewer, log) = viewer_with_log();
    assert!(viewer.accept(r#"{"type":"frobnicate","sdp":"x"}"#).is_none());
    assert!(viewer.accept("not even json").is_none());
    assert_eq!(*log.lock().unwrap(), vec!["malformed", "malformed"]);
}

#[test]
fn tampered_payload_fails_verification() {
    let mut camera = WireEnd::new(Some(shared_key(KEY)));
    let (viewer, log) = viewer_with_log();

    let frame = camera.frame(answer_from("cam-1", "v=0 answer"));
    let mut value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    value["sdp"] = serde_json::Value::String("v=0 evil".into());
    let tampered = serde_json::to_string(&value).unwrap();

    assert!(viewer.accept(&tampered).is_none());
    assert_eq!(*log.lock().unwrap(), vec!["bad-signature"]);
}

#[test]
fn from_is_outside_the_signed_payload() {
    // `from` is routing metadata the relay may stamp; rewriting it must
    // not invalidate the signature.
    let mut camera = WireEnd::new(Some(shared_key(KEY)));
    let (viewer, _log) = viewer_with_log();

    let frame = camera.frame(answer_from("cam-1", "v=0 answer"));
    let mut value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    value["from"] = serde_json::Value::String("relay-rewritten".into());
    let rewritten = serde_json::to_string(&value).unwrap();

    let msg = viewer.accept(&rewritten).expect("still verifies");
    assert_eq!(msg.from_peer(), Some("relay-rewritten"));
}

#[test]
fn wrong_key_fails_verification() {
    let mut camera = WireEnd::new(Some(shared_key(b"another-room-key!")));
    let (viewer, log) = viewer_with_log();

    let frame = camera.frame(answer_from("cam-1", "v=0 answer"));
    assert!(viewer.accept(&frame).is_none());
    assert_eq!(*log.lock().unwrap(), vec!["bad-signature"]);
}

#[test]
fn keyless_transport_neither_signs_nor_verifies() {
    let mut plain = WireEnd::new(None);
    let frame = plain.frame(answer_from("cam-1", "v=0 answer"));
    assert!(!frame.contains("psk"));

    let viewer = AuthedTransport::new(None);
    assert!(viewer.accept(&frame).is_some());
}

#[test]
fn outbound_counter_survives_reattach() {
    let mut camera = WireEnd::new(Some(shared_key(KEY)));
    let one = camera.frame(answer_from("cam-1", "v=0 one"));
    let two = camera.frame(answer_from("cam-1", "v=0 two"));

    // Simulate a relay reconnect: new socket, same transport.
    camera.transport.detach();
    let (tx, frames) = mpsc::unbounded_channel();
    camera.transport.attach(tx);
    camera.frames = frames;
    let three = camera.frame(answer_from("cam-1", "v=0 three"));

    let ctr = |frame: &str| {
        serde_json::from_str::<SignalMessage>(frame)
            .unwrap()
            .psk()
            .unwrap()
            .ctr
    };
    assert_eq!(ctr(&one), 1);
    assert_eq!(ctr(&two), 2);
    assert_eq!(ctr(&three), 3);
}

#[test]
fn send_without_socket_fails() {
    let transport = AuthedTransport::new(Some(shared_key(KEY)));
    assert!(transport.send(answer_from("cam-1", "v=0 answer")).is_err());
}

#[test]
fn candidate_fields_are_covered_by_the_mac() {
    let mut camera = WireEnd::new(Some(shared_key(KEY)));
    let (viewer, log) = viewer_with_log();

    let frame = camera.frame(SignalMessage::Candidate {
        candidate: IceCandidateBlob {
            candidate: "candidate:1 1 udp 1 1.2.3.4 5 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        },
        to: Some("cam-1".into()),
        from: None,
        psk: None,
    });
    let mut value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    value["candidate"]["sdpMid"] = serde_json::Value::String("1".into());
    let tampered = serde_json::to_string(&value).unwrap();

    assert!(viewer.accept(&frame).is_some());
    assert!(viewer.accept(&tampered).is_none());
    assert_eq!(*log.lock().unwrap(), vec!["bad-signature"]);
}
