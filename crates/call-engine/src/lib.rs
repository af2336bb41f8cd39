//! Multi-party mesh call engine.
//!
//! One [`CallOrchestrator`] per joined room drives the whole lifecycle:
//! local media acquisition, join/leave announcements over the broadcast
//! signaling relay, one perfectly-negotiated peer connection per remote
//! participant, media-state gossip, and teardown. The media stack sits
//! behind the seams in [`media`], with a production WebRTC backend in
//! [`webrtc`] and an in-memory one in [`mock`].

pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod mock;
pub mod peer;
pub mod webrtc;

pub use call::{CallEvent, CallOrchestrator, CallStatus, LocalIdentity, Participant};
pub use config::{CallConfig, CallConfigBuilder, IceServerConfig, MediaConstraints};
pub use crate::webrtc::{WebRtcLocalTrack, WebRtcMedia};
pub use error::{CallError, CallResult};
pub use media::{
    LinkEvent, LinkFactory, LinkState, LocalMediaStream, LocalTrack, MediaDevices, MediaError,
    PeerLink, RemoteStream, TrackKind,
};
pub use peer::{Negotiation, PeerEvent, PeerManager};
