//! Rotating peer list.

use crate::network::NodeId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A FIFO multiset of connected peer ids.
///
/// Fetch workers `pop` the oldest peer, send it a request, and `append` it
/// back once the request resolves; together this yields round-robin rotation
/// without any worker starving the others of peers.
#[derive(Default)]
pub struct PeerList {
    peers: Mutex<VecDeque<NodeId>>,
    notify: Notify,
}

impl PeerList {
    /// Create an empty peer list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Duplicates are kept.
    pub fn append(&self, peer: NodeId) {
        self.peers.lock().push_back(peer);
        self.notify.notify_one();
    }

    /// Remove every occurrence of a peer.
    pub fn remove(&self, peer: &str) {
        self.peers.lock().retain(|p| p != peer);
    }

    /// Pop the oldest peer, waiting until one is available.
    ///
    /// Returns `None` once `token` is cancelled.
    pub async fn pop(&self, token: &CancellationToken) -> Option<NodeId> {
        loop {
            {
                let mut peers = self.peers.lock();
                if let Some(peer) = peers.pop_front() {
                    // wake another waiter if there is still work for it
                    if !peers.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(peer);
                }
            }

            tokio::select! {
                _ = token.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Number of peers currently in the list.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// True if no peers are connected.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Snapshot of all peers in rotation order.
    pub fn all(&self) -> Vec<NodeId> {
        self.peers.lock().iter().cloned().collect()
    }
}
