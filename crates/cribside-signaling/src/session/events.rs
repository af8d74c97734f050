use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use webrtc::data_channel::RTCDataChannel;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::protocol::SignalMessage;
use crate::session::peer::IceState;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// A set of typed callbacks for one event. Emission runs each callback
/// synchronously in the delivering task's turn, in subscription order.
pub struct CallbackSet<T> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>,
}

impl<T> CallbackSet<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id.0);
        subscribers.len() < before
    }

    pub fn emit(&self, event: &T) {
        let snapshot: Vec<_> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }
}

impl<T> Default for CallbackSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A remote media track surfaced by the peer connection.
pub struct TrackEvent {
    pub track: Arc<TrackRemote>,
    pub receiver: Arc<RTCRtpReceiver>,
}

/// Everything a session reports outward. Raw protocol and cryptographic
/// failure detail never appears here; callers get status text, the ICE
/// state, and delivered control messages.
pub struct SessionCallbacks {
    pub status: CallbackSet<String>,
    pub ice_state: CallbackSet<IceState>,
    pub track: CallbackSet<TrackEvent>,
    pub data_channel: CallbackSet<Arc<RTCDataChannel>>,
    pub roster: CallbackSet<SignalMessage>,
    pub hello: CallbackSet<SignalMessage>,
    pub bye: CallbackSet<SignalMessage>,
    pub signal: CallbackSet<SignalMessage>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self {
            status: CallbackSet::new(),
            ice_state: CallbackSet::new(),
            track: CallbackSet::new(),
            data_channel: CallbackSet::new(),
            roster: CallbackSet::new(),
            hello: CallbackSet::new(),
            bye: CallbackSet::new(),
            signal: CallbackSet::new(),
        }
    }
}

impl Default for SessionCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn unsubscribed_callback_stops_firing() {
        let set: CallbackSet<u32> = CallbackSet::new();
        let count = Arc::new(AtomicU32::new(0));

        let counter = count.clone();
        let id = set.subscribe(move |value| {
            counter.fetch_add(*value, Ordering::SeqCst);
        });

        set.emit(&1);
        assert!(set.unsubscribe(id));
        set.emit(&10);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!set.unsubscribe(id));
    }

    #[test]
    fn emit_runs_subscribers_in_order() {
        let set: CallbackSet<()> = CallbackSet::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let log = log.clone();
            set.subscribe(move |_| log.lock().unwrap().push(tag));
        }
        set.emit(&());
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }
}
