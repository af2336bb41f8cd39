//! Room-scoped broadcast seam for call signaling.
//!
//! The production transport is an external publish/subscribe relay: delivery
//! is best-effort and unordered across senders, and the relay suppresses the
//! publisher's own messages. `LocalBus` is the in-memory stand-in used by
//! tests and non-networked contexts; it does *not* suppress self-echo, so
//! consumers must filter on the envelope's `from` field either way.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// Per-room fanout capacity. A slow subscriber past this many undelivered
/// messages observes `Lagged` rather than blocking publishers.
pub const ROOM_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub room: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Signaling relay seam. One topic per room; no ordering guarantee across
/// senders, at-least-once delivery.
pub trait Bus: Send + Sync {
    fn subscribe(&self, room: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, room: &str, payload: Bytes) -> BusResult<()>;
}

/// In-memory bus backed by one broadcast channel per room.
#[derive(Debug, Default)]
pub struct LocalBus {
    rooms: parking_lot::RwLock<std::collections::HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, room: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.rooms.write();
        guard
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, room: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(room).subscribe()
    }

    fn publish(&self, room: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(room);
        sender
            .send(BusMessage {
                room: room.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::Closed)
    }
}
