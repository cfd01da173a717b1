//! Snapshot restore orchestration.
//!
//! The syncer picks the best advertised snapshot, drives the offer/apply
//! protocol with the local application, and streams chunks from advertising
//! peers — applying them strictly in index order however they arrive.

use crate::app::{ApplyResult, OfferResult, SnapshotConn};
use crate::chunks::{Chunk, ChunkQueue};
use crate::config::StateSyncConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::network::{Envelope, NodeId};
use crate::pool::{Snapshot, SnapshotPool};
use crate::protocol::Message;
use crate::provider::StateProvider;
use emberbft_types::{Commit, State};
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long an idle chunk fetcher waits before re-checking for work.
const FETCH_IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// How long a fetcher waits when no peer advertises the snapshot.
const NO_PEER_INTERVAL: Duration = Duration::from_secs(1);

/// Drives snapshot discovery, selection and restore.
pub struct Syncer {
    conn: Arc<dyn SnapshotConn>,
    state_provider: Arc<dyn StateProvider>,
    snapshots: SnapshotPool,
    snapshot_out: mpsc::Sender<Envelope>,
    chunk_out: mpsc::Sender<Envelope>,
    temp_dir: Option<PathBuf>,
    chunk_fetchers: u32,
    chunk_timeout: Duration,
    /// Chunk queue of the restore in progress, for routing inbound chunks.
    active: Mutex<Option<Arc<ChunkQueue>>>,
}

impl Syncer {
    /// Create a syncer.
    pub fn new(
        cfg: &StateSyncConfig,
        conn: Arc<dyn SnapshotConn>,
        state_provider: Arc<dyn StateProvider>,
        snapshot_out: mpsc::Sender<Envelope>,
        chunk_out: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            conn,
            state_provider,
            snapshots: SnapshotPool::new(),
            snapshot_out,
            chunk_out,
            temp_dir: cfg.temp_dir.clone(),
            chunk_fetchers: cfg.chunk_fetchers,
            chunk_timeout: cfg.chunk_request_timeout,
            active: Mutex::new(None),
        }
    }

    /// Record a snapshot advertised by a peer. Returns true if previously
    /// unknown.
    pub fn add_snapshot(&self, peer: NodeId, snapshot: Snapshot) -> bool {
        let added = self.snapshots.add(peer, snapshot);
        if added {
            metrics::set_discovered_snapshots(self.snapshots.len());
        }
        added
    }

    /// Route an inbound chunk into the restore in progress. Chunks arriving
    /// with no restore active are dropped.
    pub fn add_chunk(&self, chunk: Chunk) -> Result<bool> {
        let Some(queue) = self.active.lock().clone() else {
            debug!(index = chunk.index, "received chunk with no restore in progress");
            return Ok(false);
        };
        queue.add(chunk)
    }

    /// Solicit snapshots from a newly connected peer.
    pub async fn add_peer(&self, peer: NodeId) {
        debug!(peer = %peer, "requesting snapshots from new peer");
        let _ = self
            .snapshot_out
            .send(Envelope::addressed(peer, Message::SnapshotsRequest))
            .await;
    }

    /// Forget a disconnected peer's advertisements.
    pub fn remove_peer(&self, peer: &str) {
        self.snapshots.remove_peer(peer);
    }

    /// Discover and restore a snapshot, retrying until one restores
    /// successfully or the context is cancelled.
    ///
    /// `request_hook` broadcasts a snapshot solicitation; it is invoked at
    /// the start of each discovery round, followed by a `discovery_time`
    /// wait. A zero `discovery_time` makes discovery a single-shot attempt.
    pub async fn sync_any<F, Fut>(
        &self,
        token: &CancellationToken,
        discovery_time: Duration,
        request_hook: F,
    ) -> Result<(State, Commit)>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ()> + Send,
    {
        loop {
            if token.is_cancelled() {
                return Err(SyncError::Canceled);
            }

            tokio::select! {
                _ = token.cancelled() => return Err(SyncError::Canceled),
                _ = request_hook() => {}
            }
            if !discovery_time.is_zero() {
                debug!(?discovery_time, "discovering snapshots");
                tokio::select! {
                    _ = token.cancelled() => return Err(SyncError::Canceled),
                    _ = tokio::time::sleep(discovery_time) => {}
                }
            }

            let Some(snapshot) = self.snapshots.best() else {
                if discovery_time.is_zero() {
                    return Err(SyncError::NoSnapshots);
                }
                continue;
            };

            let mut result = self.sync_one(token, &snapshot).await;
            while matches!(result, Err(SyncError::SnapshotRetry)) {
                info!(height = snapshot.height, "restarting snapshot restore");
                result = self.sync_one(token, &snapshot).await;
            }

            match result {
                Ok(found) => return Ok(found),
                Err(
                    err @ (SyncError::AppAbort
                    | SyncError::App(_)
                    | SyncError::Canceled
                    | SyncError::StateProviderUnreachable(_)
                    | SyncError::Transport(_)),
                ) => return Err(err),
                Err(SyncError::SnapshotRejected) => {
                    warn!(
                        height = snapshot.height,
                        format = snapshot.format,
                        "snapshot rejected, trying another"
                    );
                    self.snapshots.reject(&snapshot.key());
                }
                Err(SyncError::FormatRejected) => {
                    warn!(format = snapshot.format, "snapshot format rejected");
                    self.snapshots.reject_format(snapshot.format);
                }
                Err(SyncError::SenderRejected) => {
                    warn!(height = snapshot.height, "snapshot senders rejected");
                    for peer in self.snapshots.peers_of(&snapshot.key()) {
                        self.snapshots.reject_peer(&peer);
                    }
                    self.snapshots.reject(&snapshot.key());
                }
                Err(err) => {
                    warn!(height = snapshot.height, %err, "snapshot restore failed, trying another");
                    self.snapshots.reject(&snapshot.key());
                }
            }
        }
    }

    /// Restore a single snapshot end to end.
    async fn sync_one(
        &self,
        token: &CancellationToken,
        snapshot: &Snapshot,
    ) -> Result<(State, Commit)> {
        let app_hash = match self.state_provider.app_hash(snapshot.height).await {
            Ok(hash) => hash,
            Err(err) => return Err(provider_failure(err, snapshot.height)),
        };

        info!(
            height = snapshot.height,
            format = snapshot.format,
            "offering snapshot to application"
        );
        match self.conn.offer_snapshot(snapshot, &app_hash).await? {
            OfferResult::Accept => {}
            OfferResult::Abort => return Err(SyncError::AppAbort),
            OfferResult::Reject => return Err(SyncError::SnapshotRejected),
            OfferResult::RejectFormat => return Err(SyncError::FormatRejected),
            OfferResult::RejectSender => return Err(SyncError::SenderRejected),
            OfferResult::Unknown => {
                return Err(SyncError::App("unknown offer result".into()));
            }
        }

        info!(
            height = snapshot.height,
            chunks = snapshot.chunks,
            "snapshot accepted, fetching chunks"
        );
        metrics::set_snapshot_height(snapshot.height);
        metrics::set_snapshot_chunks(snapshot.chunks);

        let queue = Arc::new(ChunkQueue::new(snapshot.clone(), self.temp_dir.as_deref())?);
        *self.active.lock() = Some(queue.clone());
        let result = self.run_restore(token, snapshot, &queue).await;
        *self.active.lock() = None;
        queue.close();
        result
    }

    async fn run_restore(
        &self,
        token: &CancellationToken,
        snapshot: &Snapshot,
        queue: &Arc<ChunkQueue>,
    ) -> Result<(State, Commit)> {
        let fetchers = futures::future::join_all(
            (0..self.chunk_fetchers).map(|_| self.fetch_chunks(token, snapshot, queue)),
        );

        let restore = async {
            // Build the trusted state while chunks stream in, so light client
            // failures surface before the application finishes restoring.
            let state = self
                .state_provider
                .state(snapshot.height)
                .await
                .map_err(|e| provider_failure(e, snapshot.height))?;
            let commit = self
                .state_provider
                .commit(snapshot.height)
                .await
                .map_err(|e| provider_failure(e, snapshot.height))?;

            self.apply_chunks(queue).await?;
            Ok((state, commit))
        };

        tokio::select! {
            // restore completion outranks the fetcher pool draining: both
            // become ready together when the final chunk is applied
            biased;
            _ = token.cancelled() => Err(SyncError::Canceled),
            res = restore => res,
            _ = fetchers => Err(SyncError::Canceled),
        }
    }

    /// One chunk fetch worker: claim the lowest pending index, request it
    /// from a peer advertising the snapshot, and wait for delivery.
    async fn fetch_chunks(
        &self,
        token: &CancellationToken,
        snapshot: &Snapshot,
        queue: &Arc<ChunkQueue>,
    ) {
        loop {
            if token.is_cancelled() {
                return;
            }
            let Some(index) = queue.allocate() else {
                if queue.is_complete() {
                    return;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(FETCH_IDLE_INTERVAL) => continue,
                }
            };

            let Some(peer) = self.snapshots.get_peer(&snapshot.key()) else {
                debug!(index, "no peers advertising snapshot, waiting");
                queue.unallocate(index);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(NO_PEER_INTERVAL) => continue,
                }
            };

            debug!(index, peer = %peer, "requesting chunk");
            let request = Envelope::addressed(
                peer.clone(),
                Message::ChunkRequest {
                    height: snapshot.height,
                    format: snapshot.format,
                    index,
                },
            );
            if self.chunk_out.send(request).await.is_err() {
                queue.unallocate(index);
                return;
            }

            match timeout(self.chunk_timeout, queue.wait_received(index)).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(_) => {
                    warn!(index, peer = %peer, "timed out waiting for chunk");
                    queue.unallocate(index);
                }
            }
        }
    }

    /// Feed received chunks to the application in strict index order and
    /// act on its verdicts.
    async fn apply_chunks(&self, queue: &Arc<ChunkQueue>) -> Result<()> {
        while let Some(chunk) = queue.next().await? {
            let resp = self
                .conn
                .apply_snapshot_chunk(chunk.index, &chunk.chunk, &chunk.sender)
                .await?;

            for peer in &resp.reject_senders {
                warn!(peer = %peer, "application rejected chunk sender");
                self.snapshots.reject_peer(peer);
                queue.discard_sender(peer);
            }
            for index in &resp.refetch_chunks {
                queue.discard(*index);
            }

            match resp.result {
                ApplyResult::Accept => {
                    metrics::inc_chunks_applied();
                    queue.mark_applied(chunk.index);
                }
                ApplyResult::Abort => return Err(SyncError::AppAbort),
                ApplyResult::Retry => {
                    warn!(index = chunk.index, "application asked to retry chunk");
                }
                ApplyResult::RetrySnapshot => return Err(SyncError::SnapshotRetry),
                ApplyResult::RejectSnapshot => return Err(SyncError::SnapshotRejected),
                ApplyResult::Unknown => {
                    return Err(SyncError::App("unknown apply result".into()));
                }
            }
        }
        info!("snapshot restore complete");
        Ok(())
    }
}

/// Classify a state provider failure: transport-level trouble is fatal to
/// the sync, verification trouble rejects the snapshot at hand.
fn provider_failure(err: SyncError, height: u64) -> SyncError {
    match err {
        SyncError::Transport(_)
        | SyncError::Timeout(_)
        | SyncError::NoConnectedPeers
        | SyncError::StateProviderUnreachable(_) => {
            SyncError::StateProviderUnreachable(err.to_string())
        }
        SyncError::Canceled => SyncError::Canceled,
        other => {
            warn!(height, %other, "could not verify snapshot height, rejecting snapshot");
            SyncError::SnapshotRejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{ApplyChunkResponse, MockSnapshotApp};
    use crate::network::{Channel, ChannelHandle, CHUNK_CHANNEL, SNAPSHOT_CHANNEL};
    use crate::provider::StaticStateProvider;
    use chrono::Utc;
    use emberbft_types::{
        BlockId, CommitSig, ConsensusParams, Hash, Validator, ValidatorSet,
    };

    fn test_state() -> (State, Commit) {
        let vals = ValidatorSet::new(vec![Validator::new(vec![1; 20], vec![1; 32], 10)]);
        let commit = Commit {
            height: 1000,
            block_id: BlockId::new(Hash::repeat_byte(0x10)),
            signatures: vec![CommitSig {
                validator_address: vec![1; 20],
                timestamp: Utc::now(),
                signature: vec![1; 64],
            }],
        };
        let state = State {
            chain_id: "test-chain".to_string(),
            initial_height: 1,
            last_block_height: 1000,
            last_block_id: commit.block_id,
            last_block_time: Utc::now(),
            validators: vals.clone(),
            next_validators: vals,
            last_height_validators_changed: 1,
            consensus_params: ConsensusParams::default(),
            last_height_consensus_params_changed: 1,
            app_hash: Hash::repeat_byte(0x42),
        };
        (state, commit)
    }

    fn snapshot(height: u64, format: u32, chunks: u32) -> Snapshot {
        Snapshot {
            height,
            format,
            chunks,
            hash: Hash::repeat_byte((height % 251) as u8),
            metadata: vec![],
        }
    }

    struct Harness {
        syncer: Arc<Syncer>,
        app: Arc<MockSnapshotApp>,
        chunk_handle: ChannelHandle,
        _snapshot_handle: ChannelHandle,
        token: CancellationToken,
    }

    fn harness(app: MockSnapshotApp) -> Harness {
        let (snapshot_ch, snapshot_handle) = Channel::new(SNAPSHOT_CHANNEL);
        let (chunk_ch, chunk_handle) = Channel::new(CHUNK_CHANNEL);
        let (state, commit) = test_state();
        let app = Arc::new(app);
        let cfg = StateSyncConfig {
            chunk_fetchers: 2,
            chunk_request_timeout: Duration::from_secs(5),
            ..StateSyncConfig::default()
        };
        let syncer = Arc::new(Syncer::new(
            &cfg,
            app.clone(),
            Arc::new(StaticStateProvider::new(state, commit)),
            snapshot_ch.tx,
            chunk_ch.tx,
        ));
        Harness {
            syncer,
            app,
            chunk_handle,
            _snapshot_handle: snapshot_handle,
            token: CancellationToken::new(),
        }
    }

    /// Serve chunk requests like a remote peer would, routing bodies back
    /// through the syncer.
    fn serve_chunks(syncer: Arc<Syncer>, mut handle: ChannelHandle) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = handle.rx.recv().await {
                if let Message::ChunkRequest {
                    height,
                    format,
                    index,
                } = envelope.message
                {
                    let sender = envelope.to.unwrap_or_default();
                    let _ = syncer.add_chunk(Chunk {
                        height,
                        format,
                        index,
                        chunk: vec![index as u8; 4],
                        sender,
                    });
                }
            }
        })
    }

    #[tokio::test]
    async fn test_restores_best_snapshot() {
        let h = harness(MockSnapshotApp::new());
        h.syncer.add_snapshot("peer1".into(), snapshot(900, 1, 2));
        h.syncer.add_snapshot("peer1".into(), snapshot(1000, 1, 3));
        let server = serve_chunks(h.syncer.clone(), h.chunk_handle);

        let (state, _commit) = h
            .syncer
            .sync_any(&h.token, Duration::ZERO, || async {})
            .await
            .expect("restore");

        assert_eq!(state.last_block_height, 1000);
        // the best (highest) snapshot was offered and fully applied in order
        assert_eq!(h.app.offered().len(), 1);
        assert_eq!(h.app.offered()[0].height, 1000);
        assert_eq!(h.app.applied_indexes(), vec![0, 1, 2]);
        server.abort();
    }

    #[tokio::test]
    async fn test_format_rejection_blacklists_sibling_snapshots() {
        let app = MockSnapshotApp::new();
        app.queue_offer(OfferResult::RejectFormat);
        let h = harness(app);

        h.syncer.add_snapshot("peer1".into(), snapshot(1000, 1, 2));
        h.syncer.add_snapshot("peer1".into(), snapshot(900, 1, 2));

        let err = h
            .syncer
            .sync_any(&h.token, Duration::ZERO, || async {})
            .await
            .expect_err("nothing restorable");
        assert!(matches!(err, SyncError::NoSnapshots));

        // only the first snapshot was ever offered; the second shares its
        // rejected format
        let offered = h.app.offered();
        assert_eq!(offered.len(), 1);
        assert_eq!(offered[0].height, 1000);
    }

    #[tokio::test]
    async fn test_offer_abort_fails_sync() {
        let app = MockSnapshotApp::new();
        app.queue_offer(OfferResult::Abort);
        let h = harness(app);
        h.syncer.add_snapshot("peer1".into(), snapshot(1000, 1, 2));

        let err = h
            .syncer
            .sync_any(&h.token, Duration::ZERO, || async {})
            .await
            .expect_err("aborted");
        assert!(matches!(err, SyncError::AppAbort));
    }

    #[tokio::test]
    async fn test_rejected_snapshot_falls_back_to_next_best() {
        let app = MockSnapshotApp::new();
        app.queue_offer(OfferResult::Reject);
        let h = harness(app);
        h.syncer.add_snapshot("peer1".into(), snapshot(1000, 1, 2));
        h.syncer.add_snapshot("peer1".into(), snapshot(900, 1, 2));
        let server = serve_chunks(h.syncer.clone(), h.chunk_handle);

        let (_state, _commit) = h
            .syncer
            .sync_any(&h.token, Duration::ZERO, || async {})
            .await
            .expect("second snapshot restores");

        let offered = h.app.offered();
        assert_eq!(offered.len(), 2);
        assert_eq!(offered[0].height, 1000);
        assert_eq!(offered[1].height, 900);
        server.abort();
    }

    #[tokio::test]
    async fn test_chunk_refetch_reapplies_in_order() {
        let app = MockSnapshotApp::new();
        // chunks 0..3 accepted; chunk 4 asks for a retry after refetching
        // chunk 2; everything accepted from there
        for _ in 0..4 {
            app.queue_apply(ApplyChunkResponse::plain(ApplyResult::Accept));
        }
        app.queue_apply(ApplyChunkResponse {
            result: ApplyResult::Retry,
            refetch_chunks: vec![2],
            reject_senders: vec![],
        });
        let h = harness(app);
        h.syncer.add_snapshot("peer1".into(), snapshot(1000, 1, 5));
        let server = serve_chunks(h.syncer.clone(), h.chunk_handle);

        h.syncer
            .sync_any(&h.token, Duration::ZERO, || async {})
            .await
            .expect("restore");

        assert_eq!(h.app.applied_indexes(), vec![0, 1, 2, 3, 4, 2, 4]);
        server.abort();
    }

    #[tokio::test]
    async fn test_cancellation_stops_sync() {
        let h = harness(MockSnapshotApp::new());
        h.token.cancel();
        let err = h
            .syncer
            .sync_any(&h.token, Duration::from_secs(60), || async {})
            .await
            .expect_err("cancelled");
        assert!(matches!(err, SyncError::Canceled));
    }
}
