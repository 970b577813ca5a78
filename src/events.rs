//! The event bus carrying everything the I/O tasks observe to a single consumer.
//!
//! Publishing never blocks: when the bus is full the event is dropped and counted.
//! Events from one TCP connection are published in decode order by the one task
//! that reads it; nothing is promised across channels or connections.

use deadqueue::limited::Queue;
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    ids::PeerId,
    models::{ChatMessage, GroupInvite, PeerRecord},
};

/// Something one of the services observed on the network.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatEvent {
    /// A heartbeat was received.
    PeerDiscovered { peer: PeerRecord, sender: SocketAddr },

    /// A peer announced its departure.
    PeerDeparted { peer_id: PeerId, sender: SocketAddr },

    /// A discovery record that is neither a heartbeat nor a bye.
    Broadcast {
        payload: serde_json::Value,
        sender: SocketAddr,
    },

    /// A direct message was decoded from a TCP connection.
    MessageReceived { message: ChatMessage, sender: SocketAddr },

    /// A message was received on a joined group channel.
    GroupMessage { message: ChatMessage, sender: SocketAddr },

    /// An invite was received on a joined group channel.
    GroupInvite { invite: GroupInvite, sender: SocketAddr },
}

impl ChatEvent {
    /// A short name of the event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PeerDiscovered { .. } => "PeerDiscovered",
            Self::PeerDeparted { .. } => "PeerDeparted",
            Self::Broadcast { .. } => "Broadcast",
            Self::MessageReceived { .. } => "MessageReceived",
            Self::GroupMessage { .. } => "GroupMessage",
            Self::GroupInvite { .. } => "GroupInvite",
        }
    }
}

/// A bounded multi-producer queue of [`ChatEvent`]s.
pub struct EventBus {
    queue: Queue<ChatEvent>,
    dropped: AtomicUsize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("len", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl EventBus {
    /// Create a bus holding at most `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Queue::new(capacity.max(1)),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Publish an event without waiting.
    ///
    /// Returns `false` if the bus was full and the event was dropped.
    pub fn publish(&self, event: ChatEvent) -> bool {
        match self.queue.try_push(event) {
            Ok(()) => true,
            Err(event) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                logger::warn!(
                    "Event bus is full; dropped a {} event ({} dropped so far).",
                    event.kind(),
                    dropped
                );
                false
            }
        }
    }

    /// Wait for the next event.
    pub async fn next(&self) -> ChatEvent {
        self.queue.pop().await
    }

    /// Take the next event if there is one.
    pub fn try_next(&self) -> Option<ChatEvent> {
        self.queue.try_pop()
    }

    /// Number of events waiting.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events dropped because the bus was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
