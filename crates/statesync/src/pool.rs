//! Registry of peer-advertised snapshots.

use crate::network::NodeId;
use emberbft_types::Hash;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// An application snapshot advertised by a peer or listed locally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Height the snapshot was taken at.
    pub height: u64,
    /// Application-defined snapshot format.
    pub format: u32,
    /// Number of chunks.
    pub chunks: u32,
    /// Application-defined snapshot hash.
    pub hash: Hash,
    /// Opaque application metadata.
    pub metadata: Vec<u8>,
}

/// Snapshot identity: two advertisements with the same key describe the same
/// snapshot regardless of metadata.
pub type SnapshotKey = (u64, u32, Hash);

impl Snapshot {
    /// Identity key of the snapshot.
    pub fn key(&self) -> SnapshotKey {
        (self.height, self.format, self.hash)
    }
}

#[derive(Default)]
struct Inner {
    snapshots: HashMap<SnapshotKey, Snapshot>,
    peers: HashMap<SnapshotKey, BTreeSet<NodeId>>,
    rotation: HashMap<SnapshotKey, usize>,
    rejected_snapshots: HashSet<SnapshotKey>,
    rejected_formats: HashSet<u32>,
    rejected_peers: HashSet<NodeId>,
}

/// Pool of candidate snapshots ordered by desirability, with per-snapshot
/// peer sets and sticky rejection flags.
#[derive(Default)]
pub struct SnapshotPool {
    inner: Mutex<Inner>,
}

impl SnapshotPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a snapshot advertised by `peer`.
    ///
    /// Returns true if the snapshot was previously unknown. Re-advertisements
    /// of a known snapshot only extend its peer set (first advertisement wins
    /// on metadata); a conflicting chunk count marks the snapshot rejected
    /// for the rest of the sync.
    pub fn add(&self, peer: NodeId, snapshot: Snapshot) -> bool {
        let key = snapshot.key();
        let mut inner = self.inner.lock();

        if inner.rejected_snapshots.contains(&key)
            || inner.rejected_formats.contains(&snapshot.format)
            || inner.rejected_peers.contains(&peer)
        {
            return false;
        }

        if let Some(known) = inner.snapshots.get(&key) {
            if known.chunks != snapshot.chunks {
                debug!(
                    height = snapshot.height,
                    format = snapshot.format,
                    "conflicting chunk counts advertised, rejecting snapshot"
                );
                inner.snapshots.remove(&key);
                inner.peers.remove(&key);
                inner.rejected_snapshots.insert(key);
                return false;
            }
            inner.peers.entry(key).or_default().insert(peer);
            return false;
        }

        inner.snapshots.insert(key, snapshot);
        inner.peers.entry(key).or_default().insert(peer);
        true
    }

    /// The most desirable eligible snapshot: highest height, then highest
    /// format, with a non-zero chunk count and at least one advertising peer.
    pub fn best(&self) -> Option<Snapshot> {
        let inner = self.inner.lock();
        inner
            .snapshots
            .values()
            .filter(|s| s.chunks > 0)
            .filter(|s| inner.peers.get(&s.key()).is_some_and(|p| !p.is_empty()))
            .max_by_key(|s| (s.height, s.format))
            .cloned()
    }

    /// Next peer advertising the snapshot, rotating round-robin.
    pub fn get_peer(&self, key: &SnapshotKey) -> Option<NodeId> {
        let mut inner = self.inner.lock();
        let peers: Vec<NodeId> = inner.peers.get(key)?.iter().cloned().collect();
        if peers.is_empty() {
            return None;
        }
        let cursor = inner.rotation.entry(*key).or_insert(0);
        let peer = peers[*cursor % peers.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(peer)
    }

    /// All peers advertising the snapshot.
    pub fn peers_of(&self, key: &SnapshotKey) -> Vec<NodeId> {
        self.inner
            .lock()
            .peers
            .get(key)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Reject a snapshot. It is never offered again, even if re-advertised.
    pub fn reject(&self, key: &SnapshotKey) {
        let mut inner = self.inner.lock();
        inner.snapshots.remove(key);
        inner.peers.remove(key);
        inner.rejected_snapshots.insert(*key);
    }

    /// Reject every snapshot of the given format, current and future.
    pub fn reject_format(&self, format: u32) {
        let mut inner = self.inner.lock();
        inner.rejected_formats.insert(format);
        let keys: Vec<SnapshotKey> = inner
            .snapshots
            .keys()
            .filter(|(_, f, _)| *f == format)
            .copied()
            .collect();
        for key in keys {
            inner.snapshots.remove(&key);
            inner.peers.remove(&key);
            inner.rejected_snapshots.insert(key);
        }
    }

    /// Blacklist a peer and drop its advertisements. Snapshots advertised by
    /// nobody else become ineligible.
    pub fn reject_peer(&self, peer: &str) {
        let mut inner = self.inner.lock();
        inner.rejected_peers.insert(peer.to_string());
        for peers in inner.peers.values_mut() {
            peers.remove(peer);
        }
    }

    /// Remove a disconnected peer from all advertisement sets without
    /// blacklisting it.
    pub fn remove_peer(&self, peer: &str) {
        let mut inner = self.inner.lock();
        for peers in inner.peers.values_mut() {
            peers.remove(peer);
        }
    }

    /// Number of eligible snapshots.
    pub fn len(&self) -> usize {
        self.inner.lock().snapshots.len()
    }

    /// True if no snapshots are known.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().snapshots.is_empty()
    }
}
