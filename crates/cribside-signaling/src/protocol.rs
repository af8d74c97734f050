use serde::{Deserialize, Serialize};

/// Role a peer announces on the signaling relay. The camera side is the
/// `Sender`; monitor pages join as `Receiver` and create the offer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Sender,
    Receiver,
    #[serde(other)]
    Unknown,
}

/// ICE candidate payload as carried on the wire. Field names follow the
/// relay's JSON contract, not Rust conventions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidateBlob {
    pub candidate: String,
    #[serde(
        rename = "sdpMid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Authentication tag attached to signed messages: HMAC-SHA256 over the
/// canonical view (base64url, no padding) plus the sender's counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PskTag {
    pub mac: String,
    pub ctr: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterPeer {
    pub id: String,
    pub role: PeerRole,
}

/// Every message exchanged with the signaling relay. Unrecognized types
/// fail deserialization and are dropped at the transport boundary before
/// any field is trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Join {
        room: String,
    },
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Roster {
        peers: Vec<RosterPeer>,
    },
    PeerJoined {
        id: String,
        role: PeerRole,
    },
    PeerLeft {
        id: String,
    },
    Keepalive {
        #[serde(default)]
        ts: i64,
    },
    NeedOffer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        psk: Option<PskTag>,
    },
    Bye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        psk: Option<PskTag>,
    },
    Offer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        psk: Option<PskTag>,
    },
    Answer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        psk: Option<PskTag>,
    },
    Candidate {
        candidate: IceCandidateBlob,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        psk: Option<PskTag>,
    },
}

impl SignalMessage {
    /// Wire tag for logging and the canonical view.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::Hello { .. } => "hello",
            SignalMessage::Roster { .. } => "roster",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::Keepalive { .. } => "keepalive",
            SignalMessage::NeedOffer { .. } => "need-offer",
            SignalMessage::Bye { .. } => "bye",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
        }
    }

    /// Types that never require nor carry a signature.
    pub fn is_passthrough(&self) -> bool {
        matches!(
            self,
            SignalMessage::Join { .. }
                | SignalMessage::Hello { .. }
                | SignalMessage::Roster { .. }
                | SignalMessage::PeerJoined { .. }
                | SignalMessage::PeerLeft { .. }
                | SignalMessage::Keepalive { .. }
        )
    }

    pub fn psk(&self) -> Option<&PskTag> {
        match self {
            SignalMessage::Offer { psk, .. }
            | SignalMessage::Answer { psk, .. }
            | SignalMessage::Candidate { psk, .. }
            | SignalMessage::NeedOffer { psk, .. }
            | SignalMessage::Bye { psk, .. } => psk.as_ref(),
            _ => None,
        }
    }

    pub fn set_psk(&mut self, tag: PskTag) {
        match self {
            SignalMessage::Offer { psk, .. }
            | SignalMessage::Answer { psk, .. }
            | SignalMessage::Candidate { psk, .. }
            | SignalMessage::NeedOffer { psk, .. }
            | SignalMessage::Bye { psk, .. } => *psk = Some(tag),
            _ => {}
        }
    }

    pub fn to_peer(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::Candidate { to, .. } => to.as_deref(),
            _ => None,
        }
    }

    pub fn from_peer(&self) -> Option<&str> {
        match self {
            SignalMessage::Hello { from }
            | SignalMessage::NeedOffer { from, .. }
            | SignalMessage::Bye { from, .. }
            | SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::Candidate { from, .. } => from.as_deref(),
            _ => None,
        }
    }

    pub fn sdp(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { sdp, .. } | SignalMessage::Answer { sdp, .. } => Some(sdp),
            _ => None,
        }
    }

    pub fn candidate(&self) -> Option<&IceCandidateBlob> {
        match self {
            SignalMessage::Candidate { candidate, .. } => Some(candidate),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_case_type_tags() {
        let msg = SignalMessage::PeerJoined {
            id: "abc".into(),
            role: PeerRole::Sender,
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"type\":\"peer-joined\""));
        assert!(text.contains("\"role\":\"sender\""));
    }

    #[test]
    fn unrecognized_type_is_rejected() {
        let err = serde_json::from_str::<SignalMessage>(r#"{"type":"frobnicate"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn unknown_fields_are_tolerated_on_known_types() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"type":"hello","from":"cam-1","psk":"garbage"}"#).unwrap();
        assert_eq!(msg.from_peer(), Some("cam-1"));
    }

    #[test]
    fn candidate_round_trips_wire_field_names() {
        let raw = r#"{"type":"candidate","candidate":{"candidate":"candidate:1 1 udp 1 1.2.3.4 5 typ host","sdpMid":"0","sdpMLineIndex":0},"from":"cam-1"}"#;
        let msg: SignalMessage = serde_json::from_str(raw).unwrap();
        let blob = msg.candidate().unwrap();
        assert_eq!(blob.sdp_mid.as_deref(), Some("0"));
        assert_eq!(blob.sdp_mline_index, Some(0));
        let back = serde_json::to_string(&msg).unwrap();
        assert!(back.contains("\"sdpMid\":\"0\""));
        assert!(back.contains("\"sdpMLineIndex\":0"));
    }

    #[test]
    fn unknown_roster_role_parses_as_unknown() {
        let msg: SignalMessage = serde_json::from_str(
            r#"{"type":"roster","peers":[{"id":"x","role":"dashboard"}]}"#,
        )
        .unwrap();
        match msg {
            SignalMessage::Roster { peers } => assert_eq!(peers[0].role, PeerRole::Unknown),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
