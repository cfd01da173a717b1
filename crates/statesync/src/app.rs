//! Application snapshot connection.
//!
//! The state sync reactor talks to the local application through this
//! contract: listing and serving snapshots on the serve side, offering a
//! snapshot and streaming its chunks on the restore side.

use crate::error::Result;
use crate::network::NodeId;
use crate::pool::Snapshot;
use async_trait::async_trait;
use emberbft_types::Hash;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Application verdict on an offered snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResult {
    /// Restore from this snapshot.
    Accept,
    /// Abort the whole state sync.
    Abort,
    /// Never offer this snapshot again.
    Reject,
    /// Never offer any snapshot of this format again.
    RejectFormat,
    /// Blacklist the peers that advertised this snapshot.
    RejectSender,
    /// Application returned something unrecognized.
    Unknown,
}

/// Application verdict on an applied chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// Chunk accepted, continue with the next one.
    Accept,
    /// Abort the whole state sync.
    Abort,
    /// Re-apply this chunk (possibly after refetching others).
    Retry,
    /// Restart the restore of this snapshot from the beginning.
    RetrySnapshot,
    /// Reject this snapshot and pick another.
    RejectSnapshot,
    /// Application returned something unrecognized.
    Unknown,
}

/// Full application response to an applied chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyChunkResponse {
    /// The verdict.
    pub result: ApplyResult,
    /// Chunk indexes to refetch from the network and re-apply.
    pub refetch_chunks: Vec<u32>,
    /// Peers whose chunks should be dropped and never used again.
    pub reject_senders: Vec<NodeId>,
}

impl ApplyChunkResponse {
    /// A plain verdict with no refetches or sender rejections.
    pub fn plain(result: ApplyResult) -> Self {
        Self {
            result,
            refetch_chunks: Vec::new(),
            reject_senders: Vec::new(),
        }
    }
}

/// Snapshot connection to the local application.
#[async_trait]
pub trait SnapshotConn: Send + Sync {
    /// List the snapshots the application can serve.
    async fn list_snapshots(&self) -> Result<Vec<Snapshot>>;

    /// Load a chunk of a locally held snapshot, `None` if absent.
    async fn load_snapshot_chunk(
        &self,
        height: u64,
        format: u32,
        index: u32,
    ) -> Result<Option<Vec<u8>>>;

    /// Offer a snapshot for restore, with the trusted app hash at its height.
    async fn offer_snapshot(&self, snapshot: &Snapshot, app_hash: &Hash) -> Result<OfferResult>;

    /// Apply the next chunk of the accepted snapshot.
    async fn apply_snapshot_chunk(
        &self,
        index: u32,
        chunk: &[u8],
        sender: &str,
    ) -> Result<ApplyChunkResponse>;
}

#[derive(Default)]
struct MockInner {
    snapshots: Vec<Snapshot>,
    chunks: HashMap<(u64, u32, u32), Vec<u8>>,
    offer_verdicts: VecDeque<OfferResult>,
    apply_responses: VecDeque<ApplyChunkResponse>,
    offered: Vec<Snapshot>,
    applied: Vec<u32>,
}

/// Scriptable in-memory application for tests and local tooling.
///
/// Offer and apply verdicts are consumed from queues seeded with
/// [`queue_offer`](Self::queue_offer) / [`queue_apply`](Self::queue_apply);
/// when a queue runs dry the verdict defaults to accept.
#[derive(Default)]
pub struct MockSnapshotApp {
    inner: Mutex<MockInner>,
}

impl MockSnapshotApp {
    /// Create an empty mock application.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a snapshot (and its chunk bodies) to the serve side.
    pub fn add_local_snapshot(&self, snapshot: Snapshot, chunks: Vec<Vec<u8>>) {
        let mut inner = self.inner.lock();
        for (index, body) in chunks.into_iter().enumerate() {
            inner
                .chunks
                .insert((snapshot.height, snapshot.format, index as u32), body);
        }
        inner.snapshots.push(snapshot);
    }

    /// Queue the verdict for the next `offer_snapshot` call.
    pub fn queue_offer(&self, verdict: OfferResult) {
        self.inner.lock().offer_verdicts.push_back(verdict);
    }

    /// Queue the response for the next `apply_snapshot_chunk` call.
    pub fn queue_apply(&self, response: ApplyChunkResponse) {
        self.inner.lock().apply_responses.push_back(response);
    }

    /// Snapshots offered so far, in call order.
    pub fn offered(&self) -> Vec<Snapshot> {
        self.inner.lock().offered.clone()
    }

    /// Chunk indexes applied so far, in call order.
    pub fn applied_indexes(&self) -> Vec<u32> {
        self.inner.lock().applied.clone()
    }
}

#[async_trait]
impl SnapshotConn for MockSnapshotApp {
    async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        Ok(self.inner.lock().snapshots.clone())
    }

    async fn load_snapshot_chunk(
        &self,
        height: u64,
        format: u32,
        index: u32,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().chunks.get(&(height, format, index)).cloned())
    }

    async fn offer_snapshot(&self, snapshot: &Snapshot, _app_hash: &Hash) -> Result<OfferResult> {
        let mut inner = self.inner.lock();
        inner.offered.push(snapshot.clone());
        Ok(inner
            .offer_verdicts
            .pop_front()
            .unwrap_or(OfferResult::Accept))
    }

    async fn apply_snapshot_chunk(
        &self,
        index: u32,
        _chunk: &[u8],
        _sender: &str,
    ) -> Result<ApplyChunkResponse> {
        let mut inner = self.inner.lock();
        inner.applied.push(index);
        Ok(inner
            .apply_responses
            .pop_front()
            .unwrap_or_else(|| ApplyChunkResponse::plain(ApplyResult::Accept)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Snapshot {
        Snapshot {
            height: 100,
            format: 1,
            chunks: 2,
            hash: Hash::repeat_byte(0x01),
            metadata: vec![],
        }
    }

    #[tokio::test]
    async fn test_mock_serves_chunks() {
        let app = MockSnapshotApp::new();
        app.add_local_snapshot(snapshot(), vec![vec![0], vec![1]]);

        assert_eq!(app.list_snapshots().await.expect("list").len(), 1);
        assert_eq!(
            app.load_snapshot_chunk(100, 1, 1).await.expect("load"),
            Some(vec![1])
        );
        assert_eq!(app.load_snapshot_chunk(100, 1, 9).await.expect("load"), None);
    }

    #[tokio::test]
    async fn test_mock_scripts_verdicts() {
        let app = MockSnapshotApp::new();
        app.queue_offer(OfferResult::RejectFormat);

        let snap = snapshot();
        let verdict = app
            .offer_snapshot(&snap, &Hash::ZERO)
            .await
            .expect("offer");
        assert_eq!(verdict, OfferResult::RejectFormat);

        // queue exhausted: defaults to accept
        let verdict = app
            .offer_snapshot(&snap, &Hash::ZERO)
            .await
            .expect("offer");
        assert_eq!(verdict, OfferResult::Accept);
        assert_eq!(app.offered().len(), 2);
    }
}
