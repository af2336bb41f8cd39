//! Seams over the external media and connection-object primitives.
//!
//! The negotiation core never touches a concrete WebRTC stack; it drives a
//! [`PeerLink`] per remote peer and a [`MediaDevices`] for local capture.
//! The production backend lives in [`crate::webrtc`], the in-memory one in
//! [`crate::mock`].

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use call_proto::{IceCandidatePayload, PeerId, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::MediaConstraints;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Error)]
pub enum MediaError {
    /// The user (or platform) refused device access.
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("media device failure: {0}")]
    Device(String),
    #[error("peer link failure: {0}")]
    Link(String),
}

/// One outgoing track handle. Disabling is a live mute: it must not trigger
/// renegotiation on any backend.
pub trait LocalTrack: Send + Sync {
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
    /// Lets a backend recover its concrete track type when attaching.
    fn as_any(&self) -> &dyn Any;
}

/// The local capture stream. Created at most once per call session, owned by
/// the orchestrator, and shared by reference with every peer link.
pub struct LocalMediaStream {
    tracks: Vec<Arc<dyn LocalTrack>>,
    stopped: AtomicBool,
}

impl LocalMediaStream {
    pub fn new(tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self {
            tracks,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in &self.tracks {
            if track.kind() == kind {
                track.set_enabled(enabled);
            }
        }
    }

    /// Stops every track. Runs the underlying stop exactly once no matter
    /// how many of the orchestrator teardown paths race into it.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Handle to a remote peer's incoming stream. Lifecycle belongs to the peer
/// manager; the participant record only references it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub peer: PeerId,
}

/// Connection state of one peer link, mirroring the external
/// connection-object state enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Terminal states are treated as a peer departure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        }
    }
}

/// Asynchronous notifications from one peer link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A locally discovered network path to forward to the remote side.
    LocalCandidate(IceCandidatePayload),
    /// Remote media arrived. Backends may report this more than once; the
    /// peer manager deduplicates per link lifetime.
    RemoteStream(RemoteStream),
    StateChanged(LinkState),
}

/// One underlying connection object. All methods are driven from the peer
/// manager under that peer's serialization lock.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), MediaError>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), MediaError>;
    /// Discards a pending local offer during polite glare recovery.
    async fn rollback_local(&self) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidatePayload) -> Result<(), MediaError>;
    /// Attaches the shared local stream's tracks for sending. Borrowed, not
    /// owned: only the orchestrator stops the stream.
    async fn attach_local_stream(&self, stream: &Arc<LocalMediaStream>) -> Result<(), MediaError>;
    /// Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Opens the local capture stream. May suspend indefinitely waiting for
    /// a permission decision and may reject with `PermissionDenied`.
    async fn open_local(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<LocalMediaStream>, MediaError>;
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Creates a fresh connection object for `peer` together with its event
    /// feed. Called once per peer-connection lifetime.
    async fn open_link(
        &self,
        peer: &PeerId,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>), MediaError>;
}
