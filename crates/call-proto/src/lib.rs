//! Wire schema for call signaling.
//!
//! Everything that crosses the broadcast relay is a [`SignalEnvelope`]:
//! `{ type, from, target?, data }` with kebab-case type tags and camelCase
//! payload fields. Inbound session descriptions are normalized defensively
//! (several producers disagree on the payload shape) while everything this
//! engine emits uses one canonical shape.
//!
//! This crate also owns the deterministic peer ordering that assigns both
//! the offer role and the glare politeness role; both ends of a connection
//! evaluate the same pure comparator, never timing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

/// Opaque stable participant identifier, one per process lifetime. Supplied
/// by the external identity provider; this crate only orders and compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifies one call session / broadcast topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Topic name on the broadcast relay.
    pub fn topic(&self) -> String {
        format!("room:{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("empty session description")]
    EmptyDescription,
    #[error("malformed signal envelope: {0}")]
    MalformedEnvelope(String),
    #[error("unexpected signal payload: {0}")]
    UnexpectedPayload(String),
}

/// True iff the local side opens the connection (sends the first offer) to
/// `remote`. Pure bytewise order over the ids, so both ends agree without
/// exchanging anything.
pub fn initiates(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

/// Glare role: the non-initiating side is polite and rolls back on a
/// simultaneous offer; the initiating side ignores the colliding offer.
pub fn is_polite(local: &PeerId, remote: &PeerId) -> bool {
    !initiates(local, remote)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    UserJoined,
    UserLeft,
    MediaState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// A session description with its negotiation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// Wrapper nesting allowed on inbound descriptions before giving up.
const MAX_WIRE_NESTING: u8 = 3;

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    /// Normalizes an inbound description payload. Tolerated shapes: a direct
    /// `{type, sdp}` object, the same nested under `offer` / `answer` /
    /// `description` / `sdp`, or a JSON-string encoding of either. The wire
    /// `type` field is unreliable in transit and is never trusted: the result
    /// is always tagged `expected`. An empty body is a hard error.
    pub fn from_wire(value: &Value, expected: SdpKind) -> Result<Self, SignalError> {
        let sdp = extract_sdp(value, 0)?;
        if sdp.trim().is_empty() {
            return Err(SignalError::EmptyDescription);
        }
        Ok(Self::new(expected, sdp))
    }
}

fn extract_sdp(value: &Value, depth: u8) -> Result<String, SignalError> {
    if depth >= MAX_WIRE_NESTING {
        return Err(SignalError::UnexpectedPayload(
            "session description nested too deeply".into(),
        ));
    }
    match value {
        Value::String(encoded) => {
            let parsed: Value = serde_json::from_str(encoded).map_err(|err| {
                SignalError::MalformedEnvelope(format!("string-encoded description: {err}"))
            })?;
            extract_sdp(&parsed, depth + 1)
        }
        Value::Object(map) => {
            if let Some(sdp) = map.get("sdp") {
                if let Some(body) = sdp.as_str() {
                    return Ok(body.to_string());
                }
                // Some producers nest the whole description under "sdp".
                return extract_sdp(sdp, depth + 1);
            }
            for key in ["offer", "answer", "description"] {
                if let Some(inner) = map.get(key) {
                    return extract_sdp(inner, depth + 1);
                }
            }
            Err(SignalError::EmptyDescription)
        }
        Value::Null => Err(SignalError::EmptyDescription),
        other => Err(SignalError::UnexpectedPayload(format!(
            "description is {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatePayload {
    pub is_muted: bool,
    pub is_video_off: bool,
}

/// A discovered network path, forwarded verbatim between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// `{ type, from, target?, data }` as carried on the broadcast relay.
/// Untargeted envelopes address the whole room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
    #[serde(default)]
    pub data: Value,
}

impl SignalEnvelope {
    pub fn join(from: PeerId, display_name: &str) -> Self {
        Self {
            kind: SignalKind::UserJoined,
            from,
            target: None,
            data: json!({ "displayName": display_name }),
        }
    }

    pub fn offer(
        from: PeerId,
        target: PeerId,
        description: &SessionDescription,
        display_name: &str,
    ) -> Self {
        Self {
            kind: SignalKind::Offer,
            from,
            target: Some(target),
            data: json!({ "description": description, "displayName": display_name }),
        }
    }

    pub fn answer(from: PeerId, target: PeerId, description: &SessionDescription) -> Self {
        Self {
            kind: SignalKind::Answer,
            from,
            target: Some(target),
            data: json!(description),
        }
    }

    pub fn ice_candidate(from: PeerId, target: PeerId, candidate: &IceCandidatePayload) -> Self {
        Self {
            kind: SignalKind::IceCandidate,
            from,
            target: Some(target),
            data: json!(candidate),
        }
    }

    pub fn media_state(from: PeerId, target: Option<PeerId>, state: MediaStatePayload) -> Self {
        Self {
            kind: SignalKind::MediaState,
            from,
            target,
            data: json!(state),
        }
    }

    pub fn leave(from: PeerId) -> Self {
        Self {
            kind: SignalKind::UserLeft,
            from,
            target: None,
            data: Value::Null,
        }
    }

    pub fn encode(&self) -> Result<Bytes, SignalError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| SignalError::MalformedEnvelope(err.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, SignalError> {
        serde_json::from_slice(payload)
            .map_err(|err| SignalError::MalformedEnvelope(err.to_string()))
    }

    /// Display name riding along with `user-joined` and `offer` payloads.
    pub fn display_name(&self) -> Option<&str> {
        self.data.get("displayName").and_then(Value::as_str)
    }

    pub fn media_state_payload(&self) -> Result<MediaStatePayload, SignalError> {
        serde_json::from_value(self.data.clone())
            .map_err(|err| SignalError::UnexpectedPayload(format!("media state: {err}")))
    }

    pub fn ice_candidate_payload(&self) -> Result<IceCandidatePayload, SignalError> {
        serde_json::from_value(self.data.clone())
            .map_err(|err| SignalError::UnexpectedPayload(format!("ice candidate: {err}")))
    }
}
