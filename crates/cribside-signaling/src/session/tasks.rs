use std::sync::Mutex;

use tokio::task::JoinHandle;

/// A named slot holding at most one scheduled task. Arming the slot
/// aborts whatever was in it; cancelling empties it. Each timer purpose
/// in the session owns exactly one slot so teardown is a fixed set of
/// cancels rather than a hunt for stray intervals.
pub struct TaskSlot {
    name: &'static str,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            handle: Mutex::new(None),
        }
    }

    /// Replace the slot's task, aborting any previous one.
    pub fn arm(&self, handle: JoinHandle<()>) {
        let mut guard = self.handle.lock().unwrap();
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
            tracing::trace!(target: "signaling", slot = self.name, "timer re-armed");
        }
    }

    pub fn cancel(&self) {
        let mut guard = self.handle.lock().unwrap();
        if let Some(handle) = guard.take() {
            handle.abort();
            tracing::trace!(target: "signaling", slot = self.name, "timer cancelled");
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The timers a session owns, one slot per purpose, torn down together
/// on close. Socket reconnect and forced negotiation retry are distinct
/// purposes; sharing a slot would let one abort the other's pending
/// timer.
pub struct SessionTimers {
    pub keepalive: TaskSlot,
    pub offer_resend: TaskSlot,
    pub reconnect: TaskSlot,
    pub retry: TaskSlot,
    pub ice_grace: TaskSlot,
}

impl SessionTimers {
    pub fn new() -> Self {
        Self {
            keepalive: TaskSlot::new("keepalive"),
            offer_resend: TaskSlot::new("offer-resend"),
            reconnect: TaskSlot::new("reconnect"),
            retry: TaskSlot::new("forced-retry"),
            ice_grace: TaskSlot::new("ice-grace"),
        }
    }

    pub fn cancel_all(&self) {
        self.keepalive.cancel();
        self.offer_resend.cancel();
        self.reconnect.cancel();
        self.retry.cancel();
        self.ice_grace.cancel();
    }
}

impl Default for SessionTimers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn arming_aborts_the_previous_task() {
        let fired = Arc::new(AtomicU32::new(0));
        let slot = TaskSlot::new("test");

        let first = fired.clone();
        slot.arm(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            first.fetch_add(1, Ordering::SeqCst);
        }));
        let second = fired.clone();
        slot.arm(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            second.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        slot.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicU32::new(0));
        let slot = TaskSlot::new("test");
        let counter = fired.clone();
        slot.arm(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        slot.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
