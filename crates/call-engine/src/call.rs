//! Room-level orchestration: owns the local media session, subscribes to the
//! room's broadcast topic, and turns the unordered at-least-once signal
//! stream into join/leave/media-state bookkeeping plus per-peer negotiation.
//!
//! Inbound signals are demultiplexed into one mailbox task per remote peer:
//! signals from a single peer are handled in arrival order, while distinct
//! peers negotiate concurrently, so a stuck peer cannot stall the room.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use call_proto::{
    MediaStatePayload, PeerId, RoomId, SdpKind, SessionDescription, SignalEnvelope, SignalKind,
    initiates,
};
use parking_lot::{Mutex, RwLock};
use signal_bus::{Bus, BusMessage};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::CallConfig;
use crate::error::{CallError, CallResult};
use crate::media::{LinkFactory, LinkState, LocalMediaStream, MediaDevices, RemoteStream, TrackKind};
use crate::peer::{PeerEvent, PeerManager};

/// Stable local identity handed in by the external identity provider. The
/// engine never mints or regenerates peer ids.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub peer_id: PeerId,
    pub display_name: String,
}

impl LocalIdentity {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Joining,
    Connected,
    Disconnected,
    Error,
}

/// Externally observable participant record. The referenced remote stream
/// lives in the orchestrator's registry, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub peer_id: PeerId,
    pub display_name: String,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub connection: LinkState,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    StatusChanged(CallStatus),
    ParticipantJoined(PeerId),
    ParticipantUpdated(PeerId),
    ParticipantLeft(PeerId),
    RemoteStreamAdded(PeerId),
}

struct Inner {
    identity: LocalIdentity,
    room: RoomId,
    config: CallConfig,
    bus: Arc<dyn Bus>,
    devices: Arc<dyn MediaDevices>,
    links: Arc<dyn LinkFactory>,
    status: RwLock<CallStatus>,
    /// Set for the whole joined window; every state transition checks it so
    /// `leave()` is safe concurrently with inbound delivery.
    active: AtomicBool,
    is_muted: AtomicBool,
    is_video_off: AtomicBool,
    participants: RwLock<HashMap<PeerId, Participant>>,
    remote_streams: RwLock<HashMap<PeerId, RemoteStream>>,
    local_stream: RwLock<Option<Arc<LocalMediaStream>>>,
    manager: RwLock<Option<Arc<PeerManager>>>,
    mailboxes: Mutex<HashMap<PeerId, mpsc::UnboundedSender<SignalEnvelope>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<CallEvent>,
}

/// One instance owns one active call.
#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<Inner>,
}

impl CallOrchestrator {
    pub fn new(
        identity: LocalIdentity,
        room: RoomId,
        config: CallConfig,
        bus: Arc<dyn Bus>,
        devices: Arc<dyn MediaDevices>,
        links: Arc<dyn LinkFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                identity,
                room,
                config,
                bus,
                devices,
                links,
                status: RwLock::new(CallStatus::Idle),
                active: AtomicBool::new(false),
                is_muted: AtomicBool::new(false),
                is_video_off: AtomicBool::new(false),
                participants: RwLock::new(HashMap::new()),
                remote_streams: RwLock::new(HashMap::new()),
                local_stream: RwLock::new(None),
                manager: RwLock::new(None),
                mailboxes: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                events,
            }),
        }
    }

    pub fn status(&self) -> CallStatus {
        *self.inner.status.read()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the participant map, keyed by peer id.
    pub fn participants(&self) -> HashMap<PeerId, Participant> {
        self.inner.participants.read().clone()
    }

    pub fn remote_stream(&self, peer: &PeerId) -> Option<RemoteStream> {
        self.inner.remote_streams.read().get(peer).cloned()
    }

    pub fn local_stream(&self) -> Option<Arc<LocalMediaStream>> {
        self.inner.local_stream.read().clone()
    }

    pub fn is_muted(&self) -> bool {
        self.inner.is_muted.load(Ordering::SeqCst)
    }

    pub fn is_video_off(&self) -> bool {
        self.inner.is_video_off.load(Ordering::SeqCst)
    }

    /// Joins the room: acquires local media, subscribes, announces. No-op if
    /// already joining or joined.
    pub async fn join(&self) -> CallResult<()> {
        let inner = &self.inner;
        {
            let mut status = inner.status.write();
            if matches!(*status, CallStatus::Joining | CallStatus::Connected) {
                return Ok(());
            }
            *status = CallStatus::Joining;
        }
        inner.emit(CallEvent::StatusChanged(CallStatus::Joining));

        let stream = match inner.devices.open_local(&inner.config.media).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "local media acquisition failed");
                inner.set_status(CallStatus::Error);
                return Err(CallError::PermissionDenied(err.to_string()));
            }
        };
        // Mute flags survive a rejoin.
        stream.set_enabled(TrackKind::Audio, !inner.is_muted.load(Ordering::SeqCst));
        stream.set_enabled(TrackKind::Video, !inner.is_video_off.load(Ordering::SeqCst));
        *inner.local_stream.write() = Some(stream.clone());

        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(PeerManager::new(
            inner.identity.peer_id.clone(),
            stream,
            inner.links.clone(),
            peer_events_tx,
        ));
        *inner.manager.write() = Some(manager);
        inner.active.store(true, Ordering::SeqCst);

        let subscription = inner.bus.subscribe(&inner.room.topic());
        let router = tokio::spawn(run_router(self.inner.clone(), subscription));
        let pump = tokio::spawn(run_peer_events(self.inner.clone(), peer_events_rx));
        inner.tasks.lock().extend([router, pump]);

        let me = inner.identity.peer_id.clone();
        let announce = SignalEnvelope::join(me.clone(), &inner.identity.display_name);
        let media_state = SignalEnvelope::media_state(me, None, inner.media_state());
        for envelope in [announce, media_state] {
            if let Err(err) = inner.publish(&envelope) {
                tracing::warn!(error = %err, "join announcement failed");
                inner.active.store(false, Ordering::SeqCst);
                teardown(inner).await;
                inner.set_status(CallStatus::Disconnected);
                return Err(err);
            }
        }

        inner.set_status(CallStatus::Connected);
        tracing::info!(room = %inner.room, peer = %inner.identity.peer_id, "joined call");
        Ok(())
    }

    /// Leaves the room and releases every resource. Idempotent, and safe to
    /// call while negotiation and inbound delivery are in flight.
    pub async fn leave(&self) -> CallResult<()> {
        let inner = &self.inner;
        if !inner.active.swap(false, Ordering::SeqCst) {
            // A failed join can leave status at Error without ever becoming
            // active; reset so the session can retry.
            let mut status = inner.status.write();
            if *status != CallStatus::Idle {
                *status = CallStatus::Idle;
            }
            return Ok(());
        }
        inner.publish_best_effort(&SignalEnvelope::leave(inner.identity.peer_id.clone()));
        teardown(inner).await;
        inner.set_status(CallStatus::Idle);
        tracing::info!(room = %inner.room, peer = %inner.identity.peer_id, "left call");
        Ok(())
    }

    /// Flips the local mute flag, applies it to outgoing audio, and gossips
    /// the new media state. Returns the new muted flag.
    pub fn toggle_audio(&self) -> bool {
        let inner = &self.inner;
        let muted = !inner.is_muted.load(Ordering::SeqCst);
        inner.is_muted.store(muted, Ordering::SeqCst);
        if let Some(manager) = inner.manager_handle() {
            manager.set_audio_enabled(!muted);
        }
        inner.publish_best_effort(&SignalEnvelope::media_state(
            inner.identity.peer_id.clone(),
            None,
            inner.media_state(),
        ));
        muted
    }

    /// Returns the new video-off flag.
    pub fn toggle_video(&self) -> bool {
        let inner = &self.inner;
        let video_off = !inner.is_video_off.load(Ordering::SeqCst);
        inner.is_video_off.store(video_off, Ordering::SeqCst);
        if let Some(manager) = inner.manager_handle() {
            manager.set_video_enabled(!video_off);
        }
        inner.publish_best_effort(&SignalEnvelope::media_state(
            inner.identity.peer_id.clone(),
            None,
            inner.media_state(),
        ));
        video_off
    }
}

impl Inner {
    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: CallStatus) {
        *self.status.write() = status;
        self.emit(CallEvent::StatusChanged(status));
    }

    fn media_state(&self) -> MediaStatePayload {
        MediaStatePayload {
            is_muted: self.is_muted.load(Ordering::SeqCst),
            is_video_off: self.is_video_off.load(Ordering::SeqCst),
        }
    }

    fn manager_handle(&self) -> Option<Arc<PeerManager>> {
        self.manager.read().clone()
    }

    fn publish(&self, envelope: &SignalEnvelope) -> CallResult<()> {
        let payload = envelope.encode().map_err(|source| CallError::InvalidSignal {
            peer: envelope.from.clone(),
            source,
        })?;
        self.bus.publish(&self.room.topic(), payload)?;
        Ok(())
    }

    fn publish_best_effort(&self, envelope: &SignalEnvelope) {
        if let Err(err) = self.publish(envelope) {
            tracing::warn!(kind = ?envelope.kind, error = %err, "signal publish failed");
        }
    }

    fn unicast_media_state(&self, peer: &PeerId) {
        self.publish_best_effort(&SignalEnvelope::media_state(
            self.identity.peer_id.clone(),
            Some(peer.clone()),
            self.media_state(),
        ));
    }

    /// Registers a participant on first sight; refreshes the display name on
    /// a later sighting that carries one.
    fn register_participant(&self, peer: &PeerId, display_name: Option<String>) {
        let event = {
            let mut participants = self.participants.write();
            match participants.get_mut(peer) {
                Some(existing) => {
                    match display_name {
                        Some(name) if name != existing.display_name => {
                            existing.display_name = name;
                            Some(CallEvent::ParticipantUpdated(peer.clone()))
                        }
                        _ => None,
                    }
                }
                None => {
                    participants.insert(
                        peer.clone(),
                        Participant {
                            peer_id: peer.clone(),
                            display_name: display_name.unwrap_or_else(|| peer.to_string()),
                            is_muted: false,
                            is_video_off: false,
                            connection: LinkState::Connecting,
                        },
                    );
                    Some(CallEvent::ParticipantJoined(peer.clone()))
                }
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn update_participant(&self, peer: &PeerId, apply: impl FnOnce(&mut Participant)) {
        let updated = {
            let mut participants = self.participants.write();
            match participants.get_mut(peer) {
                Some(participant) => {
                    apply(participant);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.emit(CallEvent::ParticipantUpdated(peer.clone()));
        }
    }

    /// Removes every trace of `peer`: participant record, remote stream,
    /// connection, mailbox.
    async fn depart(&self, peer: &PeerId) {
        let was_present = self.participants.write().remove(peer).is_some();
        self.remote_streams.write().remove(peer);
        if let Some(manager) = self.manager_handle() {
            manager.remove_peer(peer).await;
        }
        // Dropping the sender lets the mailbox task drain and finish; a
        // returning peer gets a fresh mailbox.
        self.mailboxes.lock().remove(peer);
        if was_present {
            tracing::debug!(peer = %peer, "participant departed");
            self.emit(CallEvent::ParticipantLeft(peer.clone()));
        }
    }

    async fn handle_signal(&self, envelope: SignalEnvelope) -> CallResult<()> {
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        let peer = envelope.from.clone();
        match envelope.kind {
            SignalKind::UserJoined => {
                let name = envelope.display_name().map(str::to_string);
                self.register_participant(&peer, name);
                self.unicast_media_state(&peer);
                if initiates(&self.identity.peer_id, &peer) {
                    let Some(manager) = self.manager_handle() else {
                        return Ok(());
                    };
                    if let Some(offer) = manager.create_offer(&peer).await? {
                        self.publish(&SignalEnvelope::offer(
                            self.identity.peer_id.clone(),
                            peer.clone(),
                            &offer,
                            &self.identity.display_name,
                        ))?;
                    }
                }
            }
            SignalKind::Offer => {
                let description = SessionDescription::from_wire(&envelope.data, SdpKind::Offer)
                    .map_err(|source| CallError::InvalidSignal {
                        peer: peer.clone(),
                        source,
                    })?;
                self.register_participant(&peer, envelope.display_name().map(str::to_string));
                self.unicast_media_state(&peer);
                let Some(manager) = self.manager_handle() else {
                    return Ok(());
                };
                if let Some(answer) = manager.handle_offer(&peer, &description).await? {
                    self.publish(&SignalEnvelope::answer(
                        self.identity.peer_id.clone(),
                        peer.clone(),
                        &answer,
                    ))?;
                }
            }
            SignalKind::Answer => {
                let description = SessionDescription::from_wire(&envelope.data, SdpKind::Answer)
                    .map_err(|source| CallError::InvalidSignal {
                        peer: peer.clone(),
                        source,
                    })?;
                let Some(manager) = self.manager_handle() else {
                    return Ok(());
                };
                manager.handle_answer(&peer, &description).await?;
            }
            SignalKind::IceCandidate => {
                let candidate =
                    envelope
                        .ice_candidate_payload()
                        .map_err(|source| CallError::InvalidSignal {
                            peer: peer.clone(),
                            source,
                        })?;
                let Some(manager) = self.manager_handle() else {
                    return Ok(());
                };
                manager.handle_ice_candidate(&peer, &candidate).await?;
            }
            SignalKind::MediaState => {
                let state =
                    envelope
                        .media_state_payload()
                        .map_err(|source| CallError::InvalidSignal {
                            peer: peer.clone(),
                            source,
                        })?;
                self.update_participant(&peer, |participant| {
                    participant.is_muted = state.is_muted;
                    participant.is_video_off = state.is_video_off;
                });
            }
            SignalKind::UserLeft => {
                self.depart(&peer).await;
            }
        }
        Ok(())
    }
}

/// Tears down tasks, mailboxes, connections, registries, and the local
/// stream. Callers flip `active` off first.
async fn teardown(inner: &Arc<Inner>) {
    for task in inner.tasks.lock().drain(..) {
        task.abort();
    }
    // Dropping the senders lets the mailbox tasks drain and exit on their
    // own; with `active` off every drained signal is a no-op.
    inner.mailboxes.lock().clear();
    let manager = inner.manager.write().take();
    if let Some(manager) = manager {
        manager.destroy().await;
    }
    if let Some(stream) = inner.local_stream.write().take() {
        stream.stop();
    }
    inner.remote_streams.write().clear();
    inner.participants.write().clear();
}

/// Reads the room subscription, filters self-echo and signals addressed to
/// other peers, and hands each envelope to its sender's mailbox.
async fn run_router(inner: Arc<Inner>, mut subscription: broadcast::Receiver<BusMessage>) {
    loop {
        match subscription.recv().await {
            Ok(message) => {
                let envelope = match SignalEnvelope::decode(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::warn!(error = %err, "undecodable signal dropped");
                        continue;
                    }
                };
                if envelope.from == inner.identity.peer_id {
                    continue;
                }
                if let Some(target) = &envelope.target {
                    if target != &inner.identity.peer_id {
                        continue;
                    }
                }
                if !inner.active.load(Ordering::SeqCst) {
                    break;
                }
                dispatch_to_mailbox(&inner, envelope);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "signal subscription lagging");
            }
            Err(broadcast::error::RecvError::Closed) => {
                if inner.active.load(Ordering::SeqCst) {
                    tracing::warn!(room = %inner.room, "signal transport closed");
                    inner.set_status(CallStatus::Disconnected);
                }
                break;
            }
        }
    }
}

fn dispatch_to_mailbox(inner: &Arc<Inner>, envelope: SignalEnvelope) {
    let peer = envelope.from.clone();
    let mut mailboxes = inner.mailboxes.lock();
    // Checked under the lock so teardown cannot race a fresh mailbox in.
    if !inner.active.load(Ordering::SeqCst) {
        return;
    }
    let tx = mailboxes.entry(peer.clone()).or_insert_with(|| {
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let task_inner = Arc::clone(inner);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let kind = envelope.kind;
                if let Err(err) = task_inner.handle_signal(envelope).await {
                    // Peer-scoped failure: drop this signal, keep the call.
                    tracing::warn!(peer = %peer, ?kind, error = %err, "signal dropped");
                }
            }
        });
        tx
    });
    if tx.send(envelope).is_err() {
        tracing::debug!("mailbox closed, signal dropped");
    }
}

/// Forwards peer-layer events: local candidates out to the wire, remote
/// streams into the registry, terminal connection states into departures.
async fn run_peer_events(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Candidate { peer, candidate } => {
                inner.publish_best_effort(&SignalEnvelope::ice_candidate(
                    inner.identity.peer_id.clone(),
                    peer,
                    &candidate,
                ));
            }
            PeerEvent::Stream { peer, stream } => {
                let changed = {
                    let mut streams = inner.remote_streams.write();
                    match streams.get(&peer) {
                        Some(existing) if existing == &stream => false,
                        _ => {
                            streams.insert(peer.clone(), stream);
                            true
                        }
                    }
                };
                if changed {
                    inner.update_participant(&peer, |participant| {
                        participant.connection = LinkState::Connected;
                    });
                    inner.emit(CallEvent::RemoteStreamAdded(peer));
                }
            }
            PeerEvent::State { peer, state } => {
                inner.update_participant(&peer, |participant| {
                    participant.connection = state;
                });
                if state.is_terminal() {
                    inner.depart(&peer).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockMedia;
    use crate::peer::Negotiation;
    use signal_bus::LocalBus;

    fn orchestrator(
        id: &str,
        bus: &Arc<LocalBus>,
        media: &Arc<MockMedia>,
    ) -> CallOrchestrator {
        CallOrchestrator::new(
            LocalIdentity::new(PeerId::from(id), format!("{id} display")),
            RoomId::new("test-room"),
            CallConfig::localhost(),
            bus.clone(),
            media.clone(),
            media.clone(),
        )
    }

    /// Lets the spawned router/mailbox/pump tasks drain their queues on the
    /// current-thread runtime.
    async fn settle() {
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }
    }

    async fn manager_of(call: &CallOrchestrator) -> Arc<PeerManager> {
        call.inner.manager_handle().expect("manager present")
    }

    #[tokio::test]
    async fn join_twice_acquires_media_and_announces_once() {
        let bus = Arc::new(LocalBus::new());
        let media = MockMedia::new();
        let call = orchestrator("alice", &bus, &media);
        let mut tap = bus.subscribe(&RoomId::new("test-room").topic());

        call.join().await.expect("first join");
        call.join().await.expect("second join is a no-op");
        settle().await;

        assert_eq!(media.media_opens(), 1);
        assert_eq!(call.status(), CallStatus::Connected);

        let mut announces = 0;
        while let Ok(message) = tap.try_recv() {
            let envelope = SignalEnvelope::decode(&message.payload).unwrap();
            if envelope.kind == SignalKind::UserJoined {
                announces += 1;
            }
        }
        assert_eq!(announces, 1);
    }

    #[tokio::test]
    async fn permission_denied_aborts_the_call() {
        let bus = Arc::new(LocalBus::new());
        let media = MockMedia::new();
        media.deny_media();
        let call = orchestrator("alice", &bus, &media);

        let err = call.join().await.expect_err("media denied");
        assert!(matches!(err, CallError::PermissionDenied(_)));
        assert_eq!(call.status(), CallStatus::Error);

        // leave() resets the failed session.
        call.leave().await.unwrap();
        assert_eq!(call.status(), CallStatus::Idle);
    }

    #[tokio::test]
    async fn two_peers_negotiate_to_stable() {
        let bus = Arc::new(LocalBus::new());
        let media_a = MockMedia::new();
        let media_b = MockMedia::new();
        let alice = orchestrator("alice", &bus, &media_a);
        let bob = orchestrator("bob", &bus, &media_b);

        alice.join().await.unwrap();
        bob.join().await.unwrap();
        settle().await;

        let alice_id = PeerId::from("alice");
        let bob_id = PeerId::from("bob");
        assert_eq!(
            manager_of(&alice).await.negotiation_state(&bob_id).await,
            Some(Negotiation::Stable)
        );
        assert_eq!(
            manager_of(&bob).await.negotiation_state(&alice_id).await,
            Some(Negotiation::Stable)
        );
        // "alice" < "bob", so exactly alice offered.
        assert_eq!(media_a.link(&bob_id).unwrap().offers_created(), 1);
        assert_eq!(media_b.link(&alice_id).unwrap().offers_created(), 0);

        // Each registered the other, with the display name carried over.
        assert_eq!(
            alice.participants().get(&bob_id).unwrap().display_name,
            "bob display"
        );
        assert_eq!(
            bob.participants().get(&alice_id).unwrap().display_name,
            "alice display"
        );
    }

    #[tokio::test]
    async fn three_way_mesh_is_pairwise_stable() {
        let bus = Arc::new(LocalBus::new());
        let medias = [MockMedia::new(), MockMedia::new(), MockMedia::new()];
        let calls = [
            orchestrator("alice", &bus, &medias[0]),
            orchestrator("bob", &bus, &medias[1]),
            orchestrator("carol", &bus, &medias[2]),
        ];
        for call in &calls {
            call.join().await.unwrap();
            settle().await;
        }
        settle().await;

        let ids = [
            PeerId::from("alice"),
            PeerId::from("bob"),
            PeerId::from("carol"),
        ];
        for (i, call) in calls.iter().enumerate() {
            let participants = call.participants();
            assert_eq!(participants.len(), 2, "peer {} map", ids[i]);
            let manager = manager_of(call).await;
            assert_eq!(manager.peer_count(), 2, "peer {} connections", ids[i]);
            for (j, other) in ids.iter().enumerate() {
                if i == j {
                    continue;
                }
                assert_eq!(
                    manager.negotiation_state(other).await,
                    Some(Negotiation::Stable),
                    "{} <-> {}",
                    ids[i],
                    other
                );
            }
            // No duplicate connection per pair.
            assert_eq!(medias[i].open_link_count(), 2);
        }
    }

    #[tokio::test]
    async fn media_state_gossip_updates_participants() {
        let bus = Arc::new(LocalBus::new());
        let media_a = MockMedia::new();
        let media_b = MockMedia::new();
        let alice = orchestrator("alice", &bus, &media_a);
        let bob = orchestrator("bob", &bus, &media_b);
        alice.join().await.unwrap();
        bob.join().await.unwrap();
        settle().await;

        assert!(bob.toggle_audio());
        settle().await;

        let seen = alice.participants();
        let bob_entry = seen.get(&PeerId::from("bob")).unwrap();
        assert!(bob_entry.is_muted);
        assert!(!bob_entry.is_video_off);

        // The local outgoing track went quiet without renegotiation.
        let stream = bob.local_stream().unwrap();
        let audio = stream
            .tracks()
            .iter()
            .find(|track| track.kind() == TrackKind::Audio)
            .unwrap();
        assert!(!audio.is_enabled());
        assert_eq!(media_b.link(&PeerId::from("alice")).unwrap().offers_created(), 0);
    }

    #[tokio::test]
    async fn remote_stream_registered_once_and_cleared_on_departure() {
        let bus = Arc::new(LocalBus::new());
        let media_a = MockMedia::new();
        let media_b = MockMedia::new();
        let alice = orchestrator("alice", &bus, &media_a);
        let bob = orchestrator("bob", &bus, &media_b);
        alice.join().await.unwrap();
        bob.join().await.unwrap();
        settle().await;

        let bob_id = PeerId::from("bob");
        let mut events = alice.events();
        let link = media_a.link(&bob_id).unwrap();
        link.emit_remote_stream("stream-1");
        link.emit_remote_stream("stream-1");
        settle().await;

        assert_eq!(alice.remote_stream(&bob_id).unwrap().id, "stream-1");
        assert_eq!(
            alice.participants().get(&bob_id).unwrap().connection,
            LinkState::Connected
        );
        let mut stream_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CallEvent::RemoteStreamAdded(_)) {
                stream_events += 1;
            }
        }
        assert_eq!(stream_events, 1);

        // A failed connection is a departure: stream registry, participant
        // map, and connection all cleaned up.
        link.emit_state(LinkState::Failed);
        settle().await;
        assert!(alice.remote_stream(&bob_id).is_none());
        assert!(alice.participants().is_empty());
        assert!(link.is_closed());
        assert_eq!(manager_of(&alice).await.peer_count(), 0);
    }

    #[tokio::test]
    async fn peer_leave_signal_cleans_up() {
        let bus = Arc::new(LocalBus::new());
        let media_a = MockMedia::new();
        let media_b = MockMedia::new();
        let alice = orchestrator("alice", &bus, &media_a);
        let bob = orchestrator("bob", &bus, &media_b);
        alice.join().await.unwrap();
        bob.join().await.unwrap();
        settle().await;

        bob.leave().await.unwrap();
        settle().await;

        assert!(alice.participants().is_empty());
        assert_eq!(manager_of(&alice).await.peer_count(), 0);
        assert!(media_a.link(&PeerId::from("bob")).unwrap().is_closed());

        // Bob released everything on his side too.
        assert_eq!(bob.status(), CallStatus::Idle);
        assert_eq!(media_b.open_link_count(), 0);
    }

    #[tokio::test]
    async fn leave_mid_negotiation_releases_every_connection() {
        let bus = Arc::new(LocalBus::new());
        let media_a = MockMedia::new();
        let media_b = MockMedia::new();
        let alice = orchestrator("alice", &bus, &media_a);
        let bob = orchestrator("bob", &bus, &media_b);

        alice.join().await.unwrap();
        bob.join().await.unwrap();
        // No settle: negotiation is still in flight.
        alice.leave().await.unwrap();
        alice.leave().await.unwrap();
        settle().await;

        assert_eq!(alice.status(), CallStatus::Idle);
        assert!(alice.participants().is_empty());
        assert!(alice.local_stream().is_none());
        assert_eq!(media_a.open_link_count(), 0);

        // A late signal toward the departed side mutates nothing.
        bob.toggle_audio();
        settle().await;
        assert_eq!(media_a.open_link_count(), 0);
        assert!(alice.participants().is_empty());
    }

    #[tokio::test]
    async fn malformed_offer_is_dropped_without_an_answer() {
        let bus = Arc::new(LocalBus::new());
        let media = MockMedia::new();
        let alice = orchestrator("alice", &bus, &media);
        alice.join().await.unwrap();
        settle().await;

        let topic = RoomId::new("test-room").topic();
        let mut tap = bus.subscribe(&topic);
        let bad = SignalEnvelope {
            kind: SignalKind::Offer,
            from: PeerId::from("mallory"),
            target: Some(PeerId::from("alice")),
            data: serde_json::json!({ "offer": { "sdp": "" } }),
        };
        bus.publish(&topic, bad.encode().unwrap()).unwrap();
        settle().await;

        let mut answers = 0;
        while let Ok(message) = tap.try_recv() {
            let envelope = SignalEnvelope::decode(&message.payload).unwrap();
            if envelope.kind == SignalKind::Answer {
                answers += 1;
            }
        }
        assert_eq!(answers, 0);
        // The malformed offer never created a connection.
        assert_eq!(manager_of(&alice).await.peer_count(), 0);
        // The call itself is unharmed.
        assert_eq!(alice.status(), CallStatus::Connected);
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_to_the_peer() {
        let bus = Arc::new(LocalBus::new());
        let media_a = MockMedia::new();
        let media_b = MockMedia::new();
        let alice = orchestrator("alice", &bus, &media_a);
        let bob = orchestrator("bob", &bus, &media_b);
        alice.join().await.unwrap();
        bob.join().await.unwrap();
        settle().await;

        // Bob's link discovers a path; Alice must apply it.
        media_b
            .link(&PeerId::from("alice"))
            .unwrap()
            .emit_candidate("candidate:7 1 UDP 1 198.51.100.7 4444 typ host");
        settle().await;

        let applied = media_a
            .link(&PeerId::from("bob"))
            .unwrap()
            .applied_candidates();
        assert_eq!(applied.len(), 1);
        assert!(applied[0].candidate.contains("198.51.100.7"));
    }
}
