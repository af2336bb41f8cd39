//! In-memory media backend for tests: scripted SDP, recorded candidates,
//! injectable link events, close/stop accounting. No sockets, no devices.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use call_proto::{IceCandidatePayload, PeerId, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::MediaConstraints;
use crate::media::{
    LinkEvent, LinkFactory, LinkState, LocalMediaStream, LocalTrack, MediaDevices, MediaError,
    PeerLink, RemoteStream, TrackKind,
};

pub struct MockTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockTrack {
    fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }
}

impl LocalTrack for MockTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// One scripted connection object. Tests reach it through
/// [`MockMedia::link`] to inject track/state events or assert on what the
/// negotiation core applied.
pub struct MockLink {
    pub peer: PeerId,
    serial: usize,
    offers_created: AtomicUsize,
    answers_created: AtomicUsize,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    rollbacks: AtomicUsize,
    applied_candidates: Mutex<Vec<IceCandidatePayload>>,
    attached_stream: Mutex<Option<Arc<LocalMediaStream>>>,
    closed: AtomicBool,
    fail_next_set_remote: AtomicBool,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl MockLink {
    pub fn emit_remote_stream(&self, stream_id: &str) {
        let _ = self.events.send(LinkEvent::RemoteStream(RemoteStream {
            id: stream_id.to_string(),
            peer: self.peer.clone(),
        }));
    }

    pub fn emit_state(&self, state: LinkState) {
        let _ = self.events.send(LinkEvent::StateChanged(state));
    }

    pub fn emit_candidate(&self, candidate: &str) {
        let _ = self
            .events
            .send(LinkEvent::LocalCandidate(IceCandidatePayload {
                candidate: candidate.to_string(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }));
    }

    /// Makes the next `set_remote_description` fail, exercising the
    /// single-peer teardown path.
    pub fn fail_next_set_remote(&self) {
        self.fail_next_set_remote.store(true, Ordering::SeqCst);
    }

    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidatePayload> {
        self.applied_candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn has_attached_stream(&self) -> bool {
        self.attached_stream.lock().is_some()
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let n = self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::new(
            SdpKind::Offer,
            format!("v=0 mock offer to={} link={} n={n}", self.peer, self.serial),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let n = self.answers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::new(
            SdpKind::Answer,
            format!("v=0 mock answer to={} link={} n={n}", self.peer, self.serial),
        ))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), MediaError> {
        *self.local_description.lock() = Some(desc.clone());
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), MediaError> {
        if self.fail_next_set_remote.swap(false, Ordering::SeqCst) {
            return Err(MediaError::Link("scripted set_remote failure".into()));
        }
        *self.remote_description.lock() = Some(desc.clone());
        Ok(())
    }

    async fn rollback_local(&self) -> Result<(), MediaError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        *self.local_description.lock() = None;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidatePayload) -> Result<(), MediaError> {
        if self.remote_description.lock().is_none() {
            return Err(MediaError::Link("no remote description".into()));
        }
        self.applied_candidates.lock().push(candidate.clone());
        Ok(())
    }

    async fn attach_local_stream(&self, stream: &Arc<LocalMediaStream>) -> Result<(), MediaError> {
        *self.attached_stream.lock() = Some(stream.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// In-memory devices + link factory.
#[derive(Default)]
pub struct MockMedia {
    deny_media: AtomicBool,
    opens: AtomicUsize,
    link_serial: AtomicUsize,
    current: Mutex<HashMap<PeerId, Arc<MockLink>>>,
    history: Mutex<Vec<Arc<MockLink>>>,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every subsequent `open_local` rejects with `PermissionDenied`.
    pub fn deny_media(&self) {
        self.deny_media.store(true, Ordering::SeqCst);
    }

    pub fn media_opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Latest link created for `peer`, if any.
    pub fn link(&self, peer: &PeerId) -> Option<Arc<MockLink>> {
        self.current.lock().get(peer).cloned()
    }

    /// Every link ever created, in creation order. Used for leak checks.
    pub fn all_links(&self) -> Vec<Arc<MockLink>> {
        self.history.lock().clone()
    }

    pub fn open_link_count(&self) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|link| !link.is_closed())
            .count()
    }
}

#[async_trait]
impl MediaDevices for MockMedia {
    async fn open_local(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<LocalMediaStream>, MediaError> {
        if self.deny_media.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("denied by test".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(MockTrack::new(TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(MockTrack::new(TrackKind::Video));
        }
        Ok(Arc::new(LocalMediaStream::new(tracks)))
    }
}

#[async_trait]
impl LinkFactory for MockMedia {
    async fn open_link(
        &self,
        peer: &PeerId,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>), MediaError> {
        let (events, rx) = mpsc::unbounded_channel();
        let link = Arc::new(MockLink {
            peer: peer.clone(),
            serial: self.link_serial.fetch_add(1, Ordering::SeqCst),
            offers_created: AtomicUsize::new(0),
            answers_created: AtomicUsize::new(0),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            rollbacks: AtomicUsize::new(0),
            applied_candidates: Mutex::new(Vec::new()),
            attached_stream: Mutex::new(None),
            closed: AtomicBool::new(false),
            fail_next_set_remote: AtomicBool::new(false),
            events,
        });
        self.current.lock().insert(peer.clone(), link.clone());
        self.history.lock().push(link.clone());
        Ok((link, rx))
    }
}
