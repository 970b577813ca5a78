//! The registry of peers known through discovery.
//!
//! The discovery service only reports what it hears; deciding that a silent peer is
//! offline, and eventually forgetting it, happens here through [`PeerRegistry::sweep`].

use fxhash::FxHashMap;
use tokio::{sync::RwLock, time::Duration};

use crate::{ids::PeerId, models::PeerRecord};

mod metadata;
pub use metadata::*;

/// What a heartbeat changed in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// The peer was not known.
    New,

    /// The peer was known and online.
    Refreshed,

    /// The peer was known but offline.
    Returned,

    /// The heartbeat was our own.
    Ignored,
}

/// The peers whose state a [`PeerRegistry::sweep`] changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub offline: Vec<PeerRecord>,
    pub removed: Vec<PeerRecord>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.offline.is_empty() && self.removed.is_empty()
    }
}

/// Peers keyed by their identifier.
///
/// The [`RwLock`] allows concurrent lookups while heartbeats are being recorded.
#[derive(Debug)]
pub struct PeerRegistry {
    local_peer_id: PeerId,
    peers: RwLock<FxHashMap<PeerId, PeerEntry>>,
}

impl PeerRegistry {
    /// Create an empty registry; heartbeats carrying `local_peer_id` are ignored.
    pub fn new(local_peer_id: impl ToString) -> Self {
        Self {
            local_peer_id: local_peer_id.to_string(),
            peers: RwLock::new(FxHashMap::default()),
        }
    }

    /// Record a heartbeat.
    pub async fn observe(&self, record: PeerRecord) -> Observation {
        if record.peer_id == self.local_peer_id {
            return Observation::Ignored;
        }

        let mut peers = self.peers.write().await;
        match peers.get_mut(&record.peer_id) {
            Some(entry) => {
                let was_online = entry.is_online();
                entry.refresh(record);
                if was_online {
                    Observation::Refreshed
                } else {
                    Observation::Returned
                }
            }
            None => {
                peers.insert(record.peer_id.clone(), PeerEntry::new(record));
                Observation::New
            }
        }
    }

    /// Mark a peer offline, as on a bye.
    ///
    /// Returns the record if the peer was online.
    pub async fn mark_offline(&self, peer_id: &str) -> Option<PeerRecord> {
        let mut peers = self.peers.write().await;
        let entry = peers.get_mut(peer_id)?;
        entry.set_offline().then(|| entry.record().clone())
    }

    /// Mark peers unheard for `offline_after` as offline, and forget peers unheard
    /// for `remove_after`.
    pub async fn sweep(&self, offline_after: Duration, remove_after: Duration) -> SweepReport {
        let mut peers = self.peers.write().await;
        let mut report = SweepReport::default();

        peers.retain(|_, entry| {
            let silence = entry.silence();
            if silence >= remove_after {
                report.removed.push(entry.record().clone());
                false
            } else {
                if silence >= offline_after && entry.set_offline() {
                    report.offline.push(entry.record().clone());
                }
                true
            }
        });

        report
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .map(|entry| entry.record().clone())
    }

    /// Find a peer by identifier, or failing that by display name.
    pub async fn resolve(&self, key: &str) -> Option<PeerRecord> {
        let peers = self.peers.read().await;
        peers
            .get(key)
            .or_else(|| {
                peers
                    .values()
                    .find(|entry| entry.record().display_name == key)
            })
            .map(|entry| entry.record().clone())
    }

    pub async fn is_online(&self, peer_id: &str) -> bool {
        self.peers
            .read()
            .await
            .get(peer_id)
            .is_some_and(PeerEntry::is_online)
    }

    /// Every online peer, ordered by display name.
    pub async fn online_peers(&self) -> Vec<PeerRecord> {
        let mut online: Vec<_> = self
            .peers
            .read()
            .await
            .values()
            .filter(|entry| entry.is_online())
            .map(|entry| entry.record().clone())
            .collect();

        online.sort_by(|lhs, rhs| {
            lhs.display_name
                .cmp(&rhs.display_name)
                .then_with(|| lhs.peer_id.cmp(&rhs.peer_id))
        });
        online
    }

    /// Get the number of known peers, online or not.
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
