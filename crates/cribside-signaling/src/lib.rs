//! Authenticated WebRTC signaling for cribside monitors.
//!
//! Viewers and cameras meet in a named room on a dumb relay that fans
//! frames out to everyone else in the room. Negotiation-bearing
//! messages are signed with a per-room pre-shared key and carry a
//! monotonic counter, so the relay can route but never forge or replay
//! them. [`session::SignalingSession`] drives the whole exchange and
//! self-heals across relay drops and ICE path failures.

pub mod config;
pub mod protocol;
pub mod psk;
pub mod session;
pub mod transport;

pub use config::{IceServer, SessionConfig, SessionConfigBuilder};
pub use protocol::{IceCandidateBlob, PeerRole, SignalMessage};
pub use psk::{KeyDecision, KeyError, KeyRole, KeyStore, SharedKey};
pub use session::events::{SessionCallbacks, SubscriptionId};
pub use session::peer::{IceState, PeerFactory, WebRtcPeerFactory};
pub use session::{SessionPhase, SignalingSession, SignalingSessionBuilder};
pub use transport::{AuthError, AuthedTransport, SocketConnector, TransportError};
