//! Liveness metadata of a known peer.
//!

use tokio::time::{Duration, Instant};

use crate::models::PeerRecord;

/// A peer as tracked by the registry.
///
/// `last_heard` is a monotonic instant of the last heartbeat, independent of the
/// wall-clock timestamp the peer put in it.
#[derive(Clone, Debug)]
pub struct PeerEntry {
    record: PeerRecord,
    last_heard: Instant,
    online: bool,
}

impl PeerEntry {
    /// Create an online entry heard from just now.
    pub fn new(record: PeerRecord) -> Self {
        Self::with_last_heard(record, Instant::now())
    }

    /// Create an online entry heard from at a specific time.
    pub fn with_last_heard(record: PeerRecord, last_heard: Instant) -> Self {
        Self {
            record,
            last_heard,
            online: true,
        }
    }

    pub fn record(&self) -> &PeerRecord {
        &self.record
    }

    pub fn last_heard(&self) -> Instant {
        self.last_heard
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Time since the last heartbeat.
    pub fn silence(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_heard)
    }

    /// Replace the record with a fresher one; the peer is online again.
    pub fn refresh(&mut self, record: PeerRecord) {
        self.record = record;
        self.last_heard = Instant::now();
        self.online = true;
    }

    /// Returns if the peer was online.
    pub fn set_offline(&mut self) -> bool {
        std::mem::replace(&mut self.online, false)
    }
}
