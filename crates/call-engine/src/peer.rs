//! Per-peer negotiation: one connection object, one state machine, and one
//! FIFO candidate buffer per remote peer, all in a single map so the pieces
//! cannot drift apart. Each entry is guarded by its own async mutex, so
//! negotiation is serialized per peer while distinct peers proceed
//! concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use call_proto::{IceCandidatePayload, PeerId, SessionDescription, SignalError, is_polite};
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::{CallError, CallResult};
use crate::media::{
    LinkEvent, LinkFactory, LinkState, LocalMediaStream, PeerLink, RemoteStream, TrackKind,
};

/// Where a peer's session negotiation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Idle,
    /// Offer sent, awaiting the answer.
    HaveLocalOffer,
    /// Offer received, answer being produced.
    HaveRemoteOffer,
    Stable,
}

/// Notifications from the peer layer up to the orchestrator.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Candidate {
        peer: PeerId,
        candidate: IceCandidatePayload,
    },
    /// At most one per peer-connection lifetime.
    Stream { peer: PeerId, stream: RemoteStream },
    State { peer: PeerId, state: LinkState },
}

struct PeerEntry {
    link: Arc<dyn PeerLink>,
    negotiation: Negotiation,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidatePayload>,
    pump: JoinHandle<()>,
}

pub struct PeerManager {
    local: PeerId,
    stream: Arc<LocalMediaStream>,
    links: Arc<dyn LinkFactory>,
    events: mpsc::UnboundedSender<PeerEvent>,
    entries: RwLock<HashMap<PeerId, Arc<AsyncMutex<PeerEntry>>>>,
    closed: AtomicBool,
}

impl PeerManager {
    pub fn new(
        local: PeerId,
        stream: Arc<LocalMediaStream>,
        links: Arc<dyn LinkFactory>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            local,
            stream,
            links,
            events,
            entries: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn link_error(&self, peer: &PeerId, reason: impl ToString) -> CallError {
        CallError::Link {
            peer: peer.clone(),
            reason: reason.to_string(),
        }
    }

    fn entry_of(&self, peer: &PeerId) -> Option<Arc<AsyncMutex<PeerEntry>>> {
        self.entries.read().get(peer).cloned()
    }

    /// Looks up or lazily creates the entry for `peer`: fresh connection
    /// object, local tracks attached, link-event pump running.
    async fn ensure_entry(&self, peer: &PeerId) -> CallResult<Arc<AsyncMutex<PeerEntry>>> {
        if let Some(entry) = self.entry_of(peer) {
            return Ok(entry);
        }
        let (link, link_events) = self
            .links
            .open_link(peer)
            .await
            .map_err(|err| self.link_error(peer, err))?;
        link.attach_local_stream(&self.stream)
            .await
            .map_err(|err| self.link_error(peer, err))?;
        let pump = self.spawn_link_pump(peer.clone(), link_events);
        let entry = Arc::new(AsyncMutex::new(PeerEntry {
            link,
            negotiation: Negotiation::Idle,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            pump,
        }));
        let raced = {
            let mut guard = self.entries.write();
            match guard.get(peer) {
                Some(existing) => Some(existing.clone()),
                None => {
                    guard.insert(peer.clone(), entry.clone());
                    None
                }
            }
        };
        if let Some(existing) = raced {
            let spare = entry.lock().await;
            spare.pump.abort();
            spare.link.close().await;
            return Ok(existing);
        }
        if self.is_closed() {
            // destroy() ran while the link was being opened
            self.remove_peer(peer).await;
            return Err(self.link_error(peer, "call closed"));
        }
        tracing::debug!(peer = %peer, "peer connection created");
        Ok(entry)
    }

    fn spawn_link_pump(
        &self,
        peer: PeerId,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut stream_reported = false;
            while let Some(event) = link_events.recv().await {
                match event {
                    LinkEvent::LocalCandidate(candidate) => {
                        let _ = events.send(PeerEvent::Candidate {
                            peer: peer.clone(),
                            candidate,
                        });
                    }
                    LinkEvent::RemoteStream(stream) => {
                        if stream_reported {
                            tracing::debug!(peer = %peer, "duplicate remote stream ignored");
                            continue;
                        }
                        stream_reported = true;
                        let _ = events.send(PeerEvent::Stream {
                            peer: peer.clone(),
                            stream,
                        });
                    }
                    LinkEvent::StateChanged(state) => {
                        let _ = events.send(PeerEvent::State {
                            peer: peer.clone(),
                            state,
                        });
                    }
                }
            }
        })
    }

    /// Starts negotiation toward `peer`. Returns `None` when negotiation is
    /// already in flight (duplicate join broadcasts are expected and benign).
    pub async fn create_offer(&self, peer: &PeerId) -> CallResult<Option<SessionDescription>> {
        if self.is_closed() {
            return Ok(None);
        }
        let entry = self.ensure_entry(peer).await?;
        let mut guard = entry.lock().await;
        if guard.negotiation != Negotiation::Idle {
            tracing::debug!(peer = %peer, state = ?guard.negotiation, "offer skipped, negotiation in flight");
            return Ok(None);
        }
        let offer = match guard.link.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return Err(self.link_error(peer, err)),
        };
        if let Err(err) = guard.link.set_local_description(&offer).await {
            return Err(self.link_error(peer, err));
        }
        guard.negotiation = Negotiation::HaveLocalOffer;
        Ok(Some(offer))
    }

    /// Applies a remote offer and produces the answer. `None` means the
    /// glare rule decided the incoming offer must be ignored (impolite side)
    /// and no answer is owed.
    pub async fn handle_offer(
        &self,
        peer: &PeerId,
        offer: &SessionDescription,
    ) -> CallResult<Option<SessionDescription>> {
        if self.is_closed() {
            return Ok(None);
        }
        if offer.sdp.trim().is_empty() {
            return Err(CallError::InvalidSignal {
                peer: peer.clone(),
                source: SignalError::EmptyDescription,
            });
        }
        let entry = self.ensure_entry(peer).await?;
        let mut guard = entry.lock().await;
        if guard.negotiation != Negotiation::Idle {
            if !is_polite(&self.local, peer) {
                tracing::debug!(peer = %peer, "glare: impolite side ignoring incoming offer");
                return Ok(None);
            }
            tracing::debug!(peer = %peer, "glare: polite side rolling back local offer");
            if let Err(err) = guard.link.rollback_local().await {
                let failure = self.link_error(peer, err);
                drop(guard);
                self.remove_peer(peer).await;
                return Err(failure);
            }
            guard.negotiation = Negotiation::Idle;
            guard.remote_description_set = false;
        }
        if let Err(err) = guard.link.set_remote_description(offer).await {
            tracing::warn!(peer = %peer, error = %err, "remote offer rejected by link, tearing peer down");
            let failure = self.link_error(peer, err);
            drop(guard);
            self.remove_peer(peer).await;
            return Err(failure);
        }
        guard.remote_description_set = true;
        guard.negotiation = Negotiation::HaveRemoteOffer;
        flush_candidates(&mut guard, peer).await;
        let answer = match guard.link.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                let failure = self.link_error(peer, err);
                drop(guard);
                self.remove_peer(peer).await;
                return Err(failure);
            }
        };
        if let Err(err) = guard.link.set_local_description(&answer).await {
            let failure = self.link_error(peer, err);
            drop(guard);
            self.remove_peer(peer).await;
            return Err(failure);
        }
        guard.negotiation = Negotiation::Stable;
        Ok(Some(answer))
    }

    /// Applies a remote answer. Late or duplicate answers are ignored; only
    /// a malformed body or a link failure is an error.
    pub async fn handle_answer(
        &self,
        peer: &PeerId,
        answer: &SessionDescription,
    ) -> CallResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        if answer.sdp.trim().is_empty() {
            return Err(CallError::InvalidSignal {
                peer: peer.clone(),
                source: SignalError::EmptyDescription,
            });
        }
        let Some(entry) = self.entry_of(peer) else {
            tracing::debug!(peer = %peer, "answer for unknown peer ignored");
            return Ok(());
        };
        let mut guard = entry.lock().await;
        match guard.negotiation {
            Negotiation::HaveLocalOffer => {}
            Negotiation::Stable => {
                tracing::debug!(peer = %peer, "duplicate answer ignored");
                return Ok(());
            }
            state => {
                tracing::debug!(peer = %peer, ?state, "answer out of turn ignored");
                return Ok(());
            }
        }
        if let Err(err) = guard.link.set_remote_description(answer).await {
            tracing::warn!(peer = %peer, error = %err, "remote answer rejected by link, tearing peer down");
            let failure = self.link_error(peer, err);
            drop(guard);
            self.remove_peer(peer).await;
            return Err(failure);
        }
        guard.remote_description_set = true;
        guard.negotiation = Negotiation::Stable;
        flush_candidates(&mut guard, peer).await;
        Ok(())
    }

    /// Buffers the candidate until the remote description is in place, then
    /// applies directly. Stray and late candidates are expected; failures are
    /// logged and swallowed.
    pub async fn handle_ice_candidate(
        &self,
        peer: &PeerId,
        candidate: &IceCandidatePayload,
    ) -> CallResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let Some(entry) = self.entry_of(peer) else {
            tracing::trace!(peer = %peer, "candidate for unknown peer dropped");
            return Ok(());
        };
        let mut guard = entry.lock().await;
        if !guard.remote_description_set {
            guard.pending_candidates.push_back(candidate.clone());
            return Ok(());
        }
        if let Err(err) = guard.link.add_ice_candidate(candidate).await {
            tracing::warn!(peer = %peer, error = %err, "stray candidate rejected");
        }
        Ok(())
    }

    /// Closes `peer`'s connection and discards all of its state. Idempotent.
    pub async fn remove_peer(&self, peer: &PeerId) {
        let removed = self.entries.write().remove(peer);
        if let Some(entry) = removed {
            let guard = entry.lock().await;
            guard.pump.abort();
            guard.link.close().await;
            tracing::debug!(peer = %peer, "peer connection removed");
        }
    }

    /// Live mute of outgoing audio across every connection; no renegotiation.
    pub fn set_audio_enabled(&self, enabled: bool) {
        self.stream.set_enabled(TrackKind::Audio, enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.stream.set_enabled(TrackKind::Video, enabled);
    }

    pub fn peer_count(&self) -> usize {
        self.entries.read().len()
    }

    pub async fn negotiation_state(&self, peer: &PeerId) -> Option<Negotiation> {
        let entry = self.entry_of(peer)?;
        let guard = entry.lock().await;
        Some(guard.negotiation)
    }

    /// Closes every connection and stops the shared local stream. Idempotent;
    /// all later operations no-op.
    pub async fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<_> = {
            let mut guard = self.entries.write();
            guard.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let guard = entry.lock().await;
            guard.pump.abort();
            guard.link.close().await;
        }
        self.stream.stop();
        tracing::debug!(local = %self.local, "peer manager destroyed");
    }
}

async fn flush_candidates(entry: &mut PeerEntry, peer: &PeerId) {
    while let Some(candidate) = entry.pending_candidates.pop_front() {
        if let Err(err) = entry.link.add_ice_candidate(&candidate).await {
            tracing::warn!(peer = %peer, error = %err, "buffered candidate rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConstraints;
    use crate::media::MediaDevices;
    use crate::mock::MockMedia;

    async fn manager_for(
        local: &str,
        media: &Arc<MockMedia>,
    ) -> (PeerManager, mpsc::UnboundedReceiver<PeerEvent>) {
        let stream = media
            .open_local(&MediaConstraints::default())
            .await
            .expect("local media");
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = PeerManager::new(PeerId::from(local), stream, media.clone(), tx);
        (manager, rx)
    }

    fn candidate(n: usize) -> IceCandidatePayload {
        IceCandidatePayload {
            candidate: format!("candidate:{n} 1 UDP 2122252543 192.0.2.{n} 54400 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn create_offer_is_noop_while_negotiating() {
        let media = MockMedia::new();
        let (manager, _events) = manager_for("alice", &media).await;
        let bob = PeerId::from("bob");

        let first = manager.create_offer(&bob).await.expect("offer");
        assert!(first.is_some());
        assert_eq!(
            manager.negotiation_state(&bob).await,
            Some(Negotiation::HaveLocalOffer)
        );

        // A duplicate join broadcast triggers a second createOffer; it must
        // not restart negotiation.
        let second = manager.create_offer(&bob).await.expect("offer");
        assert!(second.is_none());
        assert_eq!(media.link(&bob).unwrap().offers_created(), 1);
    }

    #[tokio::test]
    async fn offer_answer_reaches_stable_and_attaches_local_stream() {
        let media = MockMedia::new();
        let (manager, _events) = manager_for("bob", &media).await;
        let alice = PeerId::from("alice");

        let offer = SessionDescription::new(call_proto::SdpKind::Offer, "v=0 from alice");
        let answer = manager
            .handle_offer(&alice, &offer)
            .await
            .expect("handled")
            .expect("answer produced");
        assert_eq!(answer.kind, call_proto::SdpKind::Answer);
        assert_eq!(
            manager.negotiation_state(&alice).await,
            Some(Negotiation::Stable)
        );
        let link = media.link(&alice).unwrap();
        assert!(link.has_attached_stream());
        assert_eq!(link.remote_description().unwrap().sdp, "v=0 from alice");
    }

    #[tokio::test]
    async fn empty_offer_is_a_hard_error() {
        let media = MockMedia::new();
        let (manager, _events) = manager_for("bob", &media).await;
        let err = manager
            .handle_offer(
                &PeerId::from("alice"),
                &SessionDescription::new(call_proto::SdpKind::Offer, "   "),
            )
            .await
            .expect_err("must reject");
        assert!(matches!(err, CallError::InvalidSignal { .. }));
    }

    #[tokio::test]
    async fn early_candidates_flush_in_fifo_order_after_answer() {
        let media = MockMedia::new();
        let (manager, _events) = manager_for("alice", &media).await;
        let bob = PeerId::from("bob");

        manager.create_offer(&bob).await.expect("offer");
        for n in 0..5 {
            manager
                .handle_ice_candidate(&bob, &candidate(n))
                .await
                .expect("buffered");
        }
        let link = media.link(&bob).unwrap();
        assert!(link.applied_candidates().is_empty());

        let answer = SessionDescription::new(call_proto::SdpKind::Answer, "v=0 from bob");
        manager.handle_answer(&bob, &answer).await.expect("answer");

        let applied = link.applied_candidates();
        assert_eq!(applied.len(), 5);
        for (n, cand) in applied.iter().enumerate() {
            assert_eq!(cand, &candidate(n));
        }

        // Later candidates apply immediately.
        manager
            .handle_ice_candidate(&bob, &candidate(9))
            .await
            .expect("direct");
        assert_eq!(link.applied_candidates().len(), 6);
    }

    #[tokio::test]
    async fn glare_polite_side_rolls_back_impolite_side_ignores() {
        // "alice" < "bob": alice initiates and is impolite, bob is polite.
        let media_a = MockMedia::new();
        let media_b = MockMedia::new();
        let (alice, _ev_a) = manager_for("alice", &media_a).await;
        let (bob, _ev_b) = manager_for("bob", &media_b).await;
        let alice_id = PeerId::from("alice");
        let bob_id = PeerId::from("bob");

        let offer_a = alice.create_offer(&bob_id).await.unwrap().unwrap();
        let offer_b = bob.create_offer(&alice_id).await.unwrap().unwrap();

        // Alice receives Bob's colliding offer: impolite, ignores it.
        assert!(alice.handle_offer(&bob_id, &offer_b).await.unwrap().is_none());
        assert_eq!(media_a.link(&bob_id).unwrap().rollbacks(), 0);
        assert_eq!(
            alice.negotiation_state(&bob_id).await,
            Some(Negotiation::HaveLocalOffer)
        );

        // Bob receives Alice's offer: polite, rolls back and answers.
        let answer_b = bob
            .handle_offer(&alice_id, &offer_a)
            .await
            .unwrap()
            .expect("polite side answers");
        assert_eq!(media_b.link(&alice_id).unwrap().rollbacks(), 1);
        assert_eq!(
            bob.negotiation_state(&alice_id).await,
            Some(Negotiation::Stable)
        );

        // The answer completes Alice's original negotiation.
        alice.handle_answer(&bob_id, &answer_b).await.unwrap();
        assert_eq!(
            alice.negotiation_state(&bob_id).await,
            Some(Negotiation::Stable)
        );
        // One agreed session: Bob answered Alice's offer.
        assert_eq!(
            media_b.link(&alice_id).unwrap().remote_description().unwrap().sdp,
            offer_a.sdp
        );
        assert_eq!(
            media_a.link(&bob_id).unwrap().remote_description().unwrap().sdp,
            answer_b.sdp
        );
    }

    #[tokio::test]
    async fn late_and_unknown_answers_are_ignored() {
        let media = MockMedia::new();
        let (manager, _events) = manager_for("alice", &media).await;
        let bob = PeerId::from("bob");
        let answer = SessionDescription::new(call_proto::SdpKind::Answer, "v=0 late");

        // Unknown peer: no entry is created.
        manager.handle_answer(&bob, &answer).await.expect("ignored");
        assert_eq!(manager.peer_count(), 0);

        manager.create_offer(&bob).await.unwrap();
        manager.handle_answer(&bob, &answer).await.expect("applied");
        // Duplicate after Stable is not an error and applies nothing new.
        manager.handle_answer(&bob, &answer).await.expect("ignored");
        assert_eq!(
            manager.negotiation_state(&bob).await,
            Some(Negotiation::Stable)
        );
    }

    #[tokio::test]
    async fn remote_stream_reported_once_per_link() {
        let media = MockMedia::new();
        let (manager, mut events) = manager_for("alice", &media).await;
        let bob = PeerId::from("bob");
        manager.create_offer(&bob).await.unwrap();

        let link = media.link(&bob).unwrap();
        link.emit_remote_stream("stream-1");
        link.emit_remote_stream("stream-1");
        link.emit_remote_stream("stream-2");
        link.emit_state(LinkState::Connected);

        let mut streams = 0;
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::Stream { .. } => streams += 1,
                PeerEvent::State { state, .. } => {
                    assert_eq!(state, LinkState::Connected);
                    break;
                }
                PeerEvent::Candidate { .. } => {}
            }
        }
        assert_eq!(streams, 1);
    }

    #[tokio::test]
    async fn signals_after_remove_peer_mutate_nothing() {
        let media = MockMedia::new();
        let (manager, _events) = manager_for("alice", &media).await;
        let bob = PeerId::from("bob");
        manager.create_offer(&bob).await.unwrap();
        let link = media.link(&bob).unwrap();

        manager.remove_peer(&bob).await;
        assert!(link.is_closed());
        assert_eq!(manager.peer_count(), 0);
        manager.remove_peer(&bob).await; // idempotent

        let answer = SessionDescription::new(call_proto::SdpKind::Answer, "v=0 stale");
        manager.handle_answer(&bob, &answer).await.expect("ignored");
        manager
            .handle_ice_candidate(&bob, &candidate(1))
            .await
            .expect("ignored");
        assert_eq!(manager.peer_count(), 0);
        assert!(link.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn link_failure_tears_down_only_that_peer() {
        let media = MockMedia::new();
        let (manager, _events) = manager_for("carol", &media).await;
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");

        manager.create_offer(&alice).await.unwrap();
        manager.create_offer(&bob).await.unwrap();
        let link = media.link(&bob).unwrap();
        link.fail_next_set_remote();

        let answer = SessionDescription::new(call_proto::SdpKind::Answer, "v=0 from bob");
        let err = manager
            .handle_answer(&bob, &answer)
            .await
            .expect_err("link failure surfaces");
        assert!(matches!(err, CallError::Link { .. }));
        assert!(link.is_closed());
        assert_eq!(manager.negotiation_state(&bob).await, None);

        // Alice's negotiation was never touched.
        assert_eq!(
            manager.negotiation_state(&alice).await,
            Some(Negotiation::HaveLocalOffer)
        );

        // The torn-down peer is lazily recreated on its next inbound signal.
        let offer = SessionDescription::new(call_proto::SdpKind::Offer, "v=0 from bob");
        let again = manager.handle_offer(&bob, &offer).await.unwrap();
        assert!(again.is_some());
        assert_eq!(
            manager.negotiation_state(&bob).await,
            Some(Negotiation::Stable)
        );
        assert!(!media.link(&bob).unwrap().is_closed());
    }

    #[tokio::test]
    async fn destroy_closes_everything_and_is_idempotent() {
        let media = MockMedia::new();
        let (manager, _events) = manager_for("alice", &media).await;
        manager.create_offer(&PeerId::from("bob")).await.unwrap();
        manager.create_offer(&PeerId::from("carol")).await.unwrap();

        manager.destroy().await;
        manager.destroy().await;
        assert_eq!(manager.peer_count(), 0);
        assert_eq!(media.open_link_count(), 0);

        // Everything after destroy is a no-op.
        let offer = SessionDescription::new(call_proto::SdpKind::Offer, "v=0 late");
        assert!(manager.handle_offer(&PeerId::from("dave"), &offer).await.unwrap().is_none());
        assert!(manager.create_offer(&PeerId::from("dave")).await.unwrap().is_none());
        assert_eq!(manager.peer_count(), 0);
    }
}
