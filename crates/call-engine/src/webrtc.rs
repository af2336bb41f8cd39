//! Production media backend over the pure-Rust WebRTC stack.
//!
//! [`WebRtcMedia`] is both the device layer and the link factory: local
//! tracks are sample-fed [`TrackLocalStaticSample`]s that an external
//! capture pipeline pushes into, and each [`WebRtcLink`] wraps one
//! `RTCPeerConnection` whose callbacks feed the link-event channel the
//! negotiation core consumes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use call_proto::{IceCandidatePayload, PeerId, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::{CallConfig, MediaConstraints};
use crate::media::{
    LinkEvent, LinkFactory, LinkState, LocalMediaStream, LocalTrack, MediaDevices, MediaError,
    PeerLink, RemoteStream, TrackKind,
};

const LOCAL_STREAM_ID: &str = "call-local";

fn to_link_error(err: webrtc::Error) -> MediaError {
    MediaError::Link(err.to_string())
}

fn build_api(setting: SettingEngine) -> Result<API, MediaError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| MediaError::Device(err.to_string()))?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|err| MediaError::Device(err.to_string()))?;
    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// One outgoing sample-fed track. Mute is a gate in [`write_sample`]: a
/// disabled track swallows samples so nothing flows, with no renegotiation.
///
/// [`write_sample`]: WebRtcLocalTrack::write_sample
pub struct WebRtcLocalTrack {
    kind: TrackKind,
    sample_track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcLocalTrack {
    fn new(kind: TrackKind, codec: RTCRtpCodecCapability, id: &str) -> Self {
        Self {
            kind,
            sample_track: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_string(),
                LOCAL_STREAM_ID.to_string(),
            )),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    fn audio() -> Self {
        Self::new(
            TrackKind::Audio,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio",
        )
    }

    fn video() -> Self {
        Self::new(
            TrackKind::Video,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video",
        )
    }

    fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.sample_track) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Entry point for the capture pipeline. Samples written while the track
    /// is muted or stopped are dropped silently.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError> {
        if self.stopped.load(Ordering::SeqCst) || !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.sample_track
            .write_sample(sample)
            .await
            .map_err(|err| MediaError::Device(err.to_string()))
    }
}

impl LocalTrack for WebRtcLocalTrack {
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

/// One `RTCPeerConnection` and the callback plumbing around it.
pub struct WebRtcLink {
    peer: PeerId,
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()).map_err(to_link_error),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()).map_err(to_link_error),
    }
}

fn from_rtc_description(
    desc: RTCSessionDescription,
    kind: SdpKind,
) -> Result<SessionDescription, MediaError> {
    if desc.sdp.trim().is_empty() {
        return Err(MediaError::Link("produced an empty description".into()));
    }
    Ok(SessionDescription::new(kind, desc.sdp))
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await.map_err(to_link_error)?;
        from_rtc_description(offer, SdpKind::Offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await.map_err(to_link_error)?;
        from_rtc_description(answer, SdpKind::Answer)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(to_link_error)
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(to_link_error)
    }

    async fn rollback_local(&self) -> Result<(), MediaError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(to_link_error)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidatePayload) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(to_link_error)
    }

    async fn attach_local_stream(&self, stream: &Arc<LocalMediaStream>) -> Result<(), MediaError> {
        for track in stream.tracks() {
            let Some(local) = track.as_any().downcast_ref::<WebRtcLocalTrack>() else {
                return Err(MediaError::Link(
                    "local stream holds a foreign track implementation".into(),
                ));
            };
            self.pc
                .add_track(local.rtp_track())
                .await
                .map_err(to_link_error)?;
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(peer = %self.peer, error = %err, "peer connection close failed");
        }
    }
}

/// Device layer and link factory over one shared WebRTC API instance.
pub struct WebRtcMedia {
    api: API,
    config: CallConfig,
}

impl WebRtcMedia {
    pub fn new(config: CallConfig) -> Result<Arc<Self>, MediaError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let api = build_api(setting)?;
        Ok(Arc::new(Self { api, config }))
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaDevices for WebRtcMedia {
    async fn open_local(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<LocalMediaStream>, MediaError> {
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(WebRtcLocalTrack::audio()));
        }
        if constraints.video {
            tracks.push(Arc::new(WebRtcLocalTrack::video()));
        }
        Ok(Arc::new(LocalMediaStream::new(tracks)))
    }
}

#[async_trait]
impl LinkFactory for WebRtcMedia {
    async fn open_link(
        &self,
        peer: &PeerId,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>), MediaError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_link_error)?,
        );
        let (events, events_rx) = mpsc::unbounded_channel();

        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        // End of gathering.
                        return;
                    };
                    match candidate.to_json() {
                        Ok(json) => {
                            let _ = events.send(LinkEvent::LocalCandidate(IceCandidatePayload {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            }));
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "candidate serialization failed");
                        }
                    }
                })
            }));
        }

        {
            let events = events.clone();
            let peer = peer.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let _ = events.send(LinkEvent::RemoteStream(RemoteStream {
                        id: track.stream_id(),
                        peer,
                    }));
                })
            }));
        }

        {
            let peer = peer.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    tracing::debug!(peer = %peer, ?state, "peer connection state changed");
                    let mapped = match state {
                        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                            LinkState::Connecting
                        }
                        RTCPeerConnectionState::Connected => LinkState::Connected,
                        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                        RTCPeerConnectionState::Failed => LinkState::Failed,
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                        RTCPeerConnectionState::Unspecified => return,
                    };
                    let _ = events.send(LinkEvent::StateChanged(mapped));
                })
            }));
        }

        let link = Arc::new(WebRtcLink {
            peer: peer.clone(),
            pc,
            closed: AtomicBool::new(false),
        });
        Ok((link, events_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_local_honors_constraints() {
        let media = WebRtcMedia::new(CallConfig::localhost()).expect("api builds");
        let stream = media
            .open_local(&MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .expect("stream opens");
        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(stream.tracks()[0].kind(), TrackKind::Audio);
    }

    #[test]
    fn ice_servers_map_through_with_credentials() {
        let config = CallConfig::builder()
            .add_ice_server_with_credentials(
                vec!["turn:turn.example.net:3478".into()],
                "user".into(),
                "secret".into(),
            )
            .build();
        let media = WebRtcMedia::new(config).expect("api builds");
        let rtc = media.rtc_configuration();
        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(rtc.ice_servers[0].urls, vec!["turn:turn.example.net:3478"]);
        assert_eq!(rtc.ice_servers[0].username, "user");
    }

    #[tokio::test]
    async fn muted_track_swallows_samples() {
        let track = WebRtcLocalTrack::audio();
        track.set_enabled(false);
        let sample = Sample {
            data: bytes::Bytes::from_static(&[0u8; 4]),
            duration: Duration::from_millis(20),
            ..Default::default()
        };
        track.write_sample(&sample).await.expect("dropped silently");

        track.set_enabled(true);
        track.stop();
        track.write_sample(&sample).await.expect("stopped drops too");
    }
}
