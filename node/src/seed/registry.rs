use std::collections::HashMap;

use crate::network::message::PeerEntry;
use crate::network::Endpoint;
use crate::utilities::time::WallClock;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PeerRecord {
    pub degree: u32,
    pub registered_at: f64,
}

/// Authoritative membership map.
///
/// Kept convergent across seeds because every peer registers with every seed
/// and removals fan out as `DEAD_CONFIRMED`.
#[derive(Debug, Default)]
pub(crate) struct PeerRegistry {
    peers: HashMap<Endpoint, PeerRecord>,
}

impl PeerRegistry {
    pub(crate) fn contains(&self, peer: &Endpoint) -> bool {
        self.peers.contains_key(peer)
    }

    /// Admit a freshly committed peer with degree zero.
    pub(crate) fn insert(&mut self, peer: Endpoint) {
        self.peers.insert(
            peer,
            PeerRecord {
                degree: 0,
                registered_at: WallClock::unix_now(),
            },
        );
    }

    /// Returns whether the peer was present. Removing an absent peer is a
    /// no-op, which makes duplicate `DEAD_CONFIRMED` deliveries harmless.
    pub(crate) fn remove(&mut self, peer: &Endpoint) -> bool {
        self.peers.remove(peer).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    /// Membership snapshot without `exclude`, as sent to a joining peer.
    pub(crate) fn snapshot_excluding(&self, exclude: &Endpoint) -> Vec<PeerEntry> {
        self.peers
            .iter()
            .filter(|(endpoint, _)| *endpoint != exclude)
            .map(|(endpoint, record)| PeerEntry {
                ip: endpoint.ip.clone(),
                port: endpoint.port,
                degree: record.degree,
            })
            .collect()
    }
}
