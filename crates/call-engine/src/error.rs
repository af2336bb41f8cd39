use call_proto::{PeerId, SignalError};
use signal_bus::BusError;
use thiserror::Error;

/// Errors crossing the engine boundary. Peer-scoped variants abandon one
/// peer's negotiation; only `PermissionDenied` (and an explicit `leave`)
/// ends the call. Negotiation collisions are resolved by the politeness
/// rule and never surface here.
#[derive(Debug, Error)]
pub enum CallError {
    /// Local media was refused or unavailable. Call-fatal.
    #[error("local media unavailable: {0}")]
    PermissionDenied(String),

    /// A malformed offer/answer from one peer. That signal is dropped.
    #[error("invalid signal from {peer}: {source}")]
    InvalidSignal {
        peer: PeerId,
        #[source]
        source: SignalError,
    },

    /// The broadcast relay failed; surfaced as a disconnected call. Retry
    /// policy belongs to the transport.
    #[error(transparent)]
    Transport(#[from] BusError),

    /// A single peer's connection object failed. That peer is torn down and
    /// lazily recreated on its next inbound signal.
    #[error("peer link failure for {peer}: {reason}")]
    Link { peer: PeerId, reason: String },
}

pub type CallResult<T> = Result<T, CallError>;
