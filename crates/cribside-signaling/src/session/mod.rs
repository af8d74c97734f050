use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

pub mod events;
pub mod peer;
pub mod tasks;

use crate::config::SessionConfig;
use crate::protocol::{IceCandidateBlob, PeerRole, SignalMessage};
use crate::psk::SharedKey;
use crate::transport::authed::DiagnosticFn;
use crate::transport::{
    AuthedTransport, SocketConnector, SocketEvent, TransportError, WebSocketConnector,
};
use events::SessionCallbacks;
use peer::{IceState, PeerConnection, PeerFactory, PeerHooks, WebRtcPeerFactory};
use tasks::SessionTimers;

/// Where the session is in its combined socket/negotiation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    ConnectingSocket,
    SocketOpen,
    OfferSent,
    Connected,
}

/// Negotiation-side state, reset whenever the peer connection is
/// recreated. The candidate queue only fills while no answer is applied.
struct Negotiation {
    phase: SessionPhase,
    remote_applied: bool,
    last_answer_sdp: Option<String>,
    candidate_queue: Vec<IceCandidateBlob>,
    ice_disconnected: bool,
}

impl Negotiation {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            remote_applied: false,
            last_answer_sdp: None,
            candidate_queue: Vec::new(),
            ice_disconnected: false,
        }
    }
}

/// One monitoring session: owns the relay socket and the peer-connection
/// negotiation, sending and receiving through an [`AuthedTransport`].
/// Survives relay reconnects with bounded backoff and self-heals after
/// ICE path failures. All failures inside the session surface only as
/// status text and ICE-state callbacks.
pub struct SignalingSession {
    config: SessionConfig,
    session_id: String,
    connector: Arc<dyn SocketConnector>,
    peer_factory: Arc<dyn PeerFactory>,
    transport: Arc<AuthedTransport>,
    callbacks: SessionCallbacks,
    negotiation: AsyncMutex<Negotiation>,
    /// Identity of the camera peer we negotiate with, once learned.
    /// Read from synchronous hook contexts, hence its own lock.
    target: StdMutex<Option<String>>,
    peer: AsyncMutex<Option<Arc<dyn PeerConnection>>>,
    peer_epoch: AtomicU64,
    /// Single-flight guard; a second answer racing the one being
    /// applied is dropped, not queued.
    answer_gate: AsyncMutex<()>,
    timers: SessionTimers,
    retry_ms: AtomicU64,
    socket_open: AtomicBool,
    closed: AtomicBool,
    socket_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

pub struct SignalingSessionBuilder {
    config: SessionConfig,
    key: Option<Arc<SharedKey>>,
    connector: Option<Arc<dyn SocketConnector>>,
    peer_factory: Option<Arc<dyn PeerFactory>>,
    diagnostic: Option<DiagnosticFn>,
}

impl SignalingSessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            key: None,
            connector: None,
            peer_factory: None,
            diagnostic: None,
        }
    }

    /// The room's shared key. Without one the transport neither signs
    /// nor verifies.
    pub fn key(mut self, key: Arc<SharedKey>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn peer_factory(mut self, factory: Arc<dyn PeerFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    /// Callback for dropped inbound frames (bad signature, replay, …).
    pub fn auth_diagnostic(mut self, diagnostic: DiagnosticFn) -> Self {
        self.diagnostic = Some(diagnostic);
        self
    }

    pub fn build(self) -> Arc<SignalingSession> {
        let mut transport = AuthedTransport::new(self.key);
        if let Some(diagnostic) = self.diagnostic {
            transport = transport.with_diagnostic(diagnostic);
        }
        let retry_ms = self.config.reconnect_min.as_millis() as u64;
        Arc::new(SignalingSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(WebSocketConnector::new())),
            peer_factory: self
                .peer_factory
                .unwrap_or_else(|| Arc::new(WebRtcPeerFactory::new())),
            transport: Arc::new(transport),
            callbacks: SessionCallbacks::new(),
            negotiation: AsyncMutex::new(Negotiation::new()),
            target: StdMutex::new(None),
            peer: AsyncMutex::new(None),
            peer_epoch: AtomicU64::new(0),
            answer_gate: AsyncMutex::new(()),
            timers: SessionTimers::new(),
            retry_ms: AtomicU64::new(retry_ms),
            socket_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            socket_tasks: StdMutex::new(Vec::new()),
            config: self.config,
        })
    }
}

impl SignalingSession {
    pub fn builder(config: SessionConfig) -> SignalingSessionBuilder {
        SignalingSessionBuilder::new(config)
    }

    pub fn callbacks(&self) -> &SessionCallbacks {
        &self.callbacks
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn phase(&self) -> SessionPhase {
        self.negotiation.lock().await.phase
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bring the session up: open the socket, ensure a peer connection,
    /// negotiate. The returned error reports only the initial socket
    /// failure; every later failure self-heals through reconnect and
    /// forced renegotiation.
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Setup("session closed".into()));
        }
        self.ensure_socket().await?;
        self.ensure_peer(false).await;
        self.negotiate().await;
        Ok(())
    }

    /// Tear everything down: all timers, the socket pumps, the socket
    /// and the peer connection. Late async completions notice the
    /// closed flag and discard their results.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timers.cancel_all();
        for handle in self.socket_tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.transport.detach();
        self.socket_open.store(false, Ordering::SeqCst);
        let peer = self.peer.lock().await.take();
        if let Some(peer) = peer {
            peer.close().await;
        }
        self.negotiation.lock().await.phase = SessionPhase::Disconnected;
        tracing::debug!(target: "signaling", session = %self.session_id, "session closed");
    }

    async fn ensure_socket(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.socket_open.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.set_phase(SessionPhase::ConnectingSocket).await;
        self.status("Connecting to signaling…");
        let url = self.config.socket_url()?;

        let pair = match timeout(self.config.connect_timeout, self.connector.connect(&url)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                self.status("Signaling: connect failed");
                self.schedule_reconnect();
                return Err(err);
            }
            Err(_) => {
                self.status("Signaling: connect timed out");
                self.schedule_reconnect();
                return Err(TransportError::ConnectTimeout);
            }
        };
        if self.is_closed() {
            return Err(TransportError::Setup("session closed".into()));
        }

        let mut events = pair.events;
        {
            let mut tasks = self.socket_tasks.lock().unwrap();
            for stale in tasks.drain(..) {
                stale.abort();
            }
            tasks.extend(pair.tasks);
        }
        self.transport.attach(pair.outbound);
        self.socket_open.store(true, Ordering::SeqCst);
        self.retry_ms.store(
            self.config.reconnect_min.as_millis() as u64,
            Ordering::SeqCst,
        );
        self.set_phase(SessionPhase::SocketOpen).await;
        self.status("Signaling: connected");

        let _ = self.transport.send(SignalMessage::Join {
            room: self.config.room.clone(),
        });

        self.start_keepalive();

        let weak = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Some(SocketEvent::Message(text)) => {
                        let Some(session) = weak.upgrade() else { return };
                        session.handle_raw(&text).await;
                    }
                    Some(SocketEvent::Closed) | None => {
                        if let Some(session) = weak.upgrade() {
                            session.on_socket_closed().await;
                        }
                        return;
                    }
                }
            }
        });
        self.socket_tasks.lock().unwrap().push(pump);
        Ok(())
    }

    fn start_keepalive(self: &Arc<Self>) {
        let period = self.config.keepalive;
        let weak = Arc::downgrade(self);
        self.timers.keepalive.arm(tokio::spawn(async move {
            loop {
                sleep(period).await;
                let Some(session) = weak.upgrade() else { return };
                if !session.socket_open.load(Ordering::SeqCst) {
                    return;
                }
                let _ = session
                    .transport
                    .send(SignalMessage::Keepalive { ts: now_ms() });
            }
        }));
    }

    async fn on_socket_closed(self: &Arc<Self>) {
        if !self.socket_open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.transport.detach();
        self.timers.keepalive.cancel();
        self.status("Signaling: closed");
        if !self.is_closed() {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let delay = Duration::from_millis(self.retry_ms.load(Ordering::SeqCst));
        let max_ms = self.config.reconnect_max.as_millis() as u64;
        let weak = Arc::downgrade(self);
        self.timers.reconnect.arm(tokio::spawn(async move {
            sleep(delay).await;
            let Some(session) = weak.upgrade() else { return };
            let doubled = (delay.as_millis() as u64).saturating_mul(2).min(max_ms);
            session.retry_ms.store(doubled, Ordering::SeqCst);
            if let Err(err) = session.start().await {
                tracing::debug!(
                    target: "signaling",
                    session = %session.session_id,
                    error = %err,
                    "reconnect attempt failed"
                );
            }
        }));
    }

    /// Make sure a peer connection exists. `force` tears down the old
    /// one and resets negotiation state; the learned target peer is
    /// kept, routing knowledge outlives the connection.
    async fn ensure_peer(self: &Arc<Self>, force: bool) {
        let mut peer_guard = self.peer.lock().await;
        if peer_guard.is_some() && !force {
            return;
        }
        if let Some(old) = peer_guard.take() {
            old.close().await;
        }
        self.timers.offer_resend.cancel();
        self.timers.ice_grace.cancel();
        let epoch = self.peer_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut negotiation = self.negotiation.lock().await;
            negotiation.remote_applied = false;
            negotiation.last_answer_sdp = None;
            negotiation.candidate_queue.clear();
            negotiation.ice_disconnected = false;
        }

        let hooks = self.peer_hooks(epoch);
        match self.peer_factory.create(&self.config, hooks).await {
            Ok(peer) => {
                if self.is_closed() {
                    peer.close().await;
                    return;
                }
                *peer_guard = Some(peer);
            }
            Err(err) => {
                drop(peer_guard);
                tracing::warn!(
                    target: "signaling",
                    session = %self.session_id,
                    error = %err,
                    "peer connection setup failed"
                );
                self.status("Peer setup failed, retrying");
                self.schedule_forced_retry();
            }
        }
    }

    fn peer_hooks(self: &Arc<Self>, epoch: u64) -> PeerHooks {
        let weak = Arc::downgrade(self);
        let on_local_candidate = {
            let weak = weak.clone();
            Arc::new(move |candidate: IceCandidateBlob| {
                let Some(session) = weak.upgrade() else { return };
                if !session.live(epoch) {
                    return;
                }
                let _ = session.transport.send(SignalMessage::Candidate {
                    candidate,
                    to: session.current_target(),
                    from: None,
                    psk: None,
                });
            })
        };
        let on_ice_state = {
            let weak = weak.clone();
            Arc::new(move |state: IceState| {
                let Some(session) = weak.upgrade() else { return };
                tokio::spawn(session.ice_state_task(state, epoch));
            })
        };
        let on_track = {
            let weak = weak.clone();
            Arc::new(move |event: events::TrackEvent| {
                let Some(session) = weak.upgrade() else { return };
                if session.live(epoch) {
                    session.callbacks.track.emit(&event);
                }
            })
        };
        let on_data_channel = {
            let weak = weak.clone();
            Arc::new(move |channel: Arc<webrtc::data_channel::RTCDataChannel>| {
                let Some(session) = weak.upgrade() else { return };
                if session.live(epoch) {
                    session.callbacks.data_channel.emit(&channel);
                }
            })
        };
        PeerHooks {
            on_local_candidate,
            on_ice_state,
            on_track,
            on_data_channel,
        }
    }

    /// Create and commit an offer, transmit it, and begin the resend
    /// loop. Failures surface as status text and a forced retry.
    async fn negotiate(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let Some(peer) = self.peer.lock().await.clone() else {
            return;
        };
        let epoch = self.peer_epoch.load(Ordering::SeqCst);
        let committed = async {
            let offer = peer.create_offer().await?;
            peer.set_local_offer(&offer).await
        }
        .await;
        if let Err(err) = committed {
            tracing::warn!(
                target: "signaling",
                session = %self.session_id,
                error = %err,
                "offer negotiation failed"
            );
            self.status("Negotiation failed, retrying");
            self.schedule_forced_retry();
            return;
        }
        if !self.live(epoch) {
            return;
        }
        self.set_phase(SessionPhase::OfferSent).await;
        self.send_current_offer().await;
        self.start_offer_resend();
    }

    /// Retransmit the committed local offer, unmodified, addressed to
    /// the target peer when one is known.
    async fn send_current_offer(self: &Arc<Self>) {
        let Some(peer) = self.peer.lock().await.clone() else {
            return;
        };
        if let Some(sdp) = peer.local_offer() {
            let _ = self.transport.send(SignalMessage::Offer {
                sdp,
                to: self.current_target(),
                from: None,
                psk: None,
            });
        }
    }

    fn start_offer_resend(self: &Arc<Self>) {
        let period = self.config.offer_resend;
        let weak = Arc::downgrade(self);
        self.timers.offer_resend.arm(tokio::spawn(async move {
            loop {
                sleep(period).await;
                let Some(session) = weak.upgrade() else { return };
                if session.is_closed() {
                    return;
                }
                if session.negotiation.lock().await.remote_applied {
                    return;
                }
                session.send_current_offer().await;
            }
        }));
    }

    async fn handle_raw(self: &Arc<Self>, raw: &str) {
        let Some(msg) = self.transport.accept(raw) else {
            return;
        };
        self.callbacks.signal.emit(&msg);
        self.handle_message(msg).await;
    }

    async fn handle_message(self: &Arc<Self>, msg: SignalMessage) {
        match &msg {
            SignalMessage::Roster { peers } => {
                let sender = peers
                    .iter()
                    .find(|peer| peer.role == PeerRole::Sender)
                    .map(|peer| peer.id.clone());
                if let Some(id) = sender {
                    if self.adopt_target(&id) {
                        self.send_current_offer().await;
                    }
                }
                self.callbacks.roster.emit(&msg);
            }
            SignalMessage::Hello { from } => {
                if let Some(from) = from {
                    self.adopt_target_if_unset(from);
                }
                self.send_current_offer().await;
                self.callbacks.hello.emit(&msg);
            }
            SignalMessage::NeedOffer { .. } => {
                self.send_current_offer().await;
            }
            SignalMessage::PeerJoined { id, role } => {
                if *role == PeerRole::Sender {
                    self.adopt_target(id);
                    self.send_current_offer().await;
                }
            }
            SignalMessage::Bye { .. } => {
                self.negotiation.lock().await.remote_applied = false;
                self.timers.offer_resend.cancel();
                self.callbacks.bye.emit(&msg);
            }
            SignalMessage::Answer { sdp, from, .. } => {
                self.handle_answer(from.clone(), sdp.clone()).await;
            }
            SignalMessage::Candidate {
                candidate, from, ..
            } => {
                self.handle_candidate(from.clone(), candidate.clone())
                    .await;
            }
            SignalMessage::PeerLeft { .. }
            | SignalMessage::Join { .. }
            | SignalMessage::Keepalive { .. }
            | SignalMessage::Offer { .. } => {}
        }
    }

    async fn handle_answer(self: &Arc<Self>, from: Option<String>, sdp: String) {
        if !self.routes_from(from.as_deref()) {
            tracing::debug!(
                target: "signaling",
                session = %self.session_id,
                from = from.as_deref().unwrap_or(""),
                "answer from non-target peer ignored"
            );
            return;
        }

        // Single flight: an answer racing the one being applied is
        // dropped, not queued.
        let Ok(_gate) = self.answer_gate.try_lock() else {
            tracing::debug!(target: "signaling", "concurrent answer dropped");
            return;
        };

        // Phase may have moved while earlier answers were in flight;
        // check now, under the gate.
        {
            let negotiation = self.negotiation.lock().await;
            match negotiation.phase {
                SessionPhase::OfferSent => {}
                SessionPhase::Connected => {
                    drop(negotiation);
                    self.timers.offer_resend.cancel();
                    return;
                }
                _ => return,
            }
            if negotiation.last_answer_sdp.as_deref() == Some(sdp.as_str()) {
                return;
            }
        }

        let Some(peer) = self.peer.lock().await.clone() else {
            return;
        };
        let epoch = self.peer_epoch.load(Ordering::SeqCst);
        self.status("Applying answer…");
        match peer.apply_answer(&sdp).await {
            Ok(()) => {
                if !self.live(epoch) {
                    return;
                }
                let queued = {
                    let mut negotiation = self.negotiation.lock().await;
                    negotiation.remote_applied = true;
                    negotiation.last_answer_sdp = Some(sdp);
                    negotiation.phase = SessionPhase::Connected;
                    std::mem::take(&mut negotiation.candidate_queue)
                };
                self.timers.offer_resend.cancel();
                for candidate in queued {
                    if let Err(err) = peer.add_remote_candidate(candidate).await {
                        tracing::warn!(
                            target: "signaling",
                            error = %err,
                            "queued ice candidate failed"
                        );
                    }
                }
                self.status("Answer applied");
            }
            Err(err) => {
                tracing::warn!(
                    target: "signaling",
                    session = %self.session_id,
                    error = %err,
                    "answer apply failed"
                );
                self.status("Negotiation failed, retrying");
                self.schedule_forced_retry();
            }
        }
    }

    async fn handle_candidate(self: &Arc<Self>, from: Option<String>, blob: IceCandidateBlob) {
        if !self.routes_from(from.as_deref()) {
            return;
        }
        let apply_now = {
            let mut negotiation = self.negotiation.lock().await;
            if negotiation.remote_applied {
                true
            } else {
                negotiation.candidate_queue.push(blob.clone());
                false
            }
        };
        if apply_now {
            let Some(peer) = self.peer.lock().await.clone() else {
                return;
            };
            if let Err(err) = peer.add_remote_candidate(blob).await {
                tracing::warn!(target: "signaling", error = %err, "ice candidate failed");
            }
        }
    }

    async fn ice_state_task(self: Arc<Self>, state: IceState, epoch: u64) {
        if !self.live(epoch) {
            return;
        }
        self.callbacks.ice_state.emit(&state);
        match state {
            IceState::Connected => {
                self.negotiation.lock().await.ice_disconnected = false;
                self.timers.ice_grace.cancel();
            }
            IceState::Failed => {
                self.status("ICE: failed");
                self.force_renegotiate().await;
            }
            IceState::Disconnected => {
                self.status("ICE: disconnected");
                self.negotiation.lock().await.ice_disconnected = true;
                let grace = self.config.ice_disconnect_grace;
                let weak = Arc::downgrade(&self);
                self.timers.ice_grace.arm(tokio::spawn(async move {
                    sleep(grace).await;
                    let Some(session) = weak.upgrade() else { return };
                    if !session.live(epoch) {
                        return;
                    }
                    if session.negotiation.lock().await.ice_disconnected {
                        session.status(&format!(
                            "ICE: disconnected >{}s (renegotiating)",
                            grace.as_secs()
                        ));
                        session.force_renegotiate().await;
                    }
                }));
            }
            IceState::Closed => self.status("ICE: closed"),
            _ => {}
        }
    }

    /// Tear down and rebuild the peer connection, then renegotiate. The
    /// socket may have dropped in the meantime; re-ensure it so the new
    /// offer has somewhere to go. A failed re-open already scheduled a
    /// reconnect, and the reconnecting `start()` picks up the fresh
    /// peer.
    async fn force_renegotiate(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        self.ensure_peer(true).await;
        if !self.socket_open.load(Ordering::SeqCst) && self.ensure_socket().await.is_err() {
            return;
        }
        self.negotiate().await;
    }

    fn schedule_forced_retry(self: &Arc<Self>) {
        let delay = self.config.reconnect_min;
        let weak = Arc::downgrade(self);
        self.timers.retry.arm(tokio::spawn(async move {
            sleep(delay).await;
            let Some(session) = weak.upgrade() else { return };
            session.force_renegotiate().await;
        }));
    }

    fn current_target(&self) -> Option<String> {
        self.target.lock().unwrap().clone()
    }

    /// Record the target peer; true when it changed.
    fn adopt_target(&self, id: &str) -> bool {
        let mut target = self.target.lock().unwrap();
        if target.as_deref() == Some(id) {
            return false;
        }
        tracing::info!(
            target: "signaling",
            session = %self.session_id,
            peer = id,
            previous = target.as_deref().unwrap_or(""),
            "target peer selected"
        );
        *target = Some(id.to_string());
        true
    }

    fn adopt_target_if_unset(&self, id: &str) {
        let mut target = self.target.lock().unwrap();
        if target.is_none() {
            *target = Some(id.to_string());
        }
    }

    /// Anti-cross-talk: accept answers/candidates only from the target
    /// peer. An unknown sender is adopted when no target is known yet.
    fn routes_from(&self, from: Option<&str>) -> bool {
        let Some(from) = from else { return true };
        let mut target = self.target.lock().unwrap();
        match target.as_deref() {
            None => {
                *target = Some(from.to_string());
                true
            }
            Some(current) => current == from,
        }
    }

    fn live(&self, epoch: u64) -> bool {
        !self.is_closed() && self.peer_epoch.load(Ordering::SeqCst) == epoch
    }

    async fn set_phase(&self, phase: SessionPhase) {
        self.negotiation.lock().await.phase = phase;
    }

    fn status(&self, text: &str) {
        tracing::debug!(target: "signaling", session = %self.session_id, status = text);
        self.callbacks.status.emit(&text.to_string());
    }
}

fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
