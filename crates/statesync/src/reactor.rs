//! The state sync reactor.
//!
//! Handles both sides of state sync: restoring a snapshot for the local node
//! (with light-block backfill behind the restored height) and serving
//! snapshots, chunks, light blocks and consensus params to remote peers.

use crate::app::SnapshotConn;
use crate::chunks::Chunk;
use crate::config::StateSyncConfig;
use crate::dispatcher::{Dispatcher, LIGHT_BLOCK_RESPONSE_TIMEOUT};
use crate::error::{Result, SyncError};
use crate::light::SkippingVerifier;
use crate::metrics;
use crate::network::{Channel, Envelope, NodeId, PeerError, PeerStatus, PeerUpdate};
use crate::peers::PeerList;
use crate::pool::Snapshot;
use crate::protocol::Message;
use crate::provider::{P2pStateProvider, RpcStateProvider, StateProvider};
use crate::queue::{BlockQueue, FetchedBlock};
use crate::store::{BlockStore, StateStore};
use crate::syncer::Syncer;
use emberbft_types::{BlockId, LightBlock, SignedHeader, State, ValidatorSet};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Number of recent snapshots to advertise per snapshots request.
const RECENT_SNAPSHOTS: usize = 10;

/// Fetch retries before backfill gives up on a height.
const MAX_LIGHT_BLOCK_RETRIES: u32 = 20;

/// Sleep when no peers are connected to fetch from.
const NO_PEERS_SLEEP: Duration = Duration::from_secs(1);

/// Back-off when another fetcher holds the dispatcher slot.
const DISPATCHER_BUSY_SLEEP: Duration = Duration::from_millis(50);

/// Poll interval while waiting for the peer quorum.
const PEER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Peers required before a sync can start: the light client needs a second
/// peer to cross-reference against.
const MIN_SYNC_PEERS: usize = 2;

/// The active state provider, kept as a tagged variant so inbound params
/// responses can be routed into the P2P flavor.
enum Provider {
    P2p(Arc<P2pStateProvider>),
    Rpc(Arc<RpcStateProvider>),
}

impl Provider {
    fn as_dyn(&self) -> Arc<dyn StateProvider> {
        match self {
            Provider::P2p(p) => p.clone(),
            Provider::Rpc(p) => p.clone(),
        }
    }
}

/// Per-sync objects, present only while a sync is in progress.
#[derive(Default)]
struct SyncState {
    syncer: Option<Arc<Syncer>>,
    provider: Option<Provider>,
}

/// The four wire channels the reactor listens on.
pub struct ReactorChannels {
    /// Snapshot metadata channel (0x60).
    pub snapshot: Channel,
    /// Chunk channel (0x61).
    pub chunk: Channel,
    /// Light block channel (0x62).
    pub light_block: Channel,
    /// Consensus params channel (0x63).
    pub params: Channel,
}

struct Inner {
    chain_id: String,
    initial_height: u64,
    cfg: StateSyncConfig,
    conn: Arc<dyn SnapshotConn>,
    state_store: Arc<dyn StateStore>,
    block_store: Arc<dyn BlockStore>,

    peers: PeerList,
    dispatcher: Arc<Dispatcher>,
    close: CancellationToken,

    snapshot_out: mpsc::Sender<Envelope>,
    chunk_out: mpsc::Sender<Envelope>,
    block_out: mpsc::Sender<Envelope>,
    params_out: mpsc::Sender<Envelope>,
    block_err: mpsc::Sender<PeerError>,

    sync: RwLock<SyncState>,
}

/// State sync reactor: restores snapshots for the local node and serves them
/// to remote peers.
pub struct Reactor {
    inner: Arc<Inner>,
    channels: Option<ReactorChannels>,
    peer_updates: Option<mpsc::Receiver<PeerUpdate>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Reactor {
    /// Create a reactor over the given channels and collaborators. Call
    /// [`start`](Self::start) to begin processing envelopes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: impl Into<String>,
        initial_height: u64,
        cfg: StateSyncConfig,
        conn: Arc<dyn SnapshotConn>,
        state_store: Arc<dyn StateStore>,
        block_store: Arc<dyn BlockStore>,
        channels: ReactorChannels,
        peer_updates: mpsc::Receiver<PeerUpdate>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(channels.light_block.tx.clone()));
        let inner = Arc::new(Inner {
            chain_id: chain_id.into(),
            initial_height,
            cfg,
            conn,
            state_store,
            block_store,
            peers: PeerList::new(),
            dispatcher,
            close: CancellationToken::new(),
            snapshot_out: channels.snapshot.tx.clone(),
            chunk_out: channels.chunk.tx.clone(),
            block_out: channels.light_block.tx.clone(),
            params_out: channels.params.tx.clone(),
            block_err: channels.light_block.errors.clone(),
            sync: RwLock::new(SyncState::default()),
        });
        Self {
            inner,
            channels: Some(channels),
            peer_updates: Some(peer_updates),
            tasks: Vec::new(),
        }
    }

    /// Spawn one task per inbound channel plus the peer-update task.
    pub fn start(&mut self) {
        let Some(channels) = self.channels.take() else {
            return;
        };
        for (channel, name) in [
            (channels.snapshot, "snapshot"),
            (channels.chunk, "chunk"),
            (channels.light_block, "light block"),
            (channels.params, "consensus params"),
        ] {
            let inner = self.inner.clone();
            self.tasks
                .push(tokio::spawn(process_channel(inner, channel, name)));
        }
        if let Some(peer_updates) = self.peer_updates.take() {
            let inner = self.inner.clone();
            self.tasks
                .push(tokio::spawn(process_peer_updates(inner, peer_updates)));
        }
    }

    /// Stop the reactor: shut the dispatcher down, signal all tasks and wait
    /// for them to exit.
    pub async fn stop(&mut self) {
        self.inner.dispatcher.close();
        self.inner.close.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Run a state sync: discover and restore a snapshot, bootstrap the
    /// stores from it, then backfill historical light blocks.
    ///
    /// Backfill failure is non-fatal; the node proceeds optimistically.
    pub async fn sync(&self, token: &CancellationToken) -> Result<State> {
        let (run, guard) = self.linked_token(token);
        let result = self.run_sync(&run).await;
        guard.abort();
        result
    }

    async fn run_sync(&self, run: &CancellationToken) -> Result<State> {
        self.wait_for_peers(run, MIN_SYNC_PEERS).await?;

        let syncer = {
            let mut sync = self.inner.sync.write().await;
            if sync.syncer.is_some() {
                return Err(SyncError::SyncInProgress);
            }
            let provider = self.init_state_provider()?;
            let syncer = Arc::new(Syncer::new(
                &self.inner.cfg,
                self.inner.conn.clone(),
                provider.as_dyn(),
                self.inner.snapshot_out.clone(),
                self.inner.chunk_out.clone(),
            ));
            sync.provider = Some(provider);
            sync.syncer = Some(syncer.clone());
            syncer
        };
        metrics::set_syncing(true);

        let snapshot_out = self.inner.snapshot_out.clone();
        let request_hook = move || {
            let snapshot_out = snapshot_out.clone();
            async move {
                let _ = snapshot_out
                    .send(Envelope::broadcast(Message::SnapshotsRequest))
                    .await;
            }
        };
        let result = syncer
            .sync_any(run, self.inner.cfg.discovery_time, request_hook)
            .await;

        {
            let mut sync = self.inner.sync.write().await;
            sync.syncer = None;
            sync.provider = None;
        }
        metrics::set_syncing(false);
        let (state, commit) = result?;

        self.inner.state_store.bootstrap(&state).await?;
        self.inner
            .block_store
            .save_seen_commit(state.last_block_height, &commit)
            .await?;

        if let Err(err) = self.backfill(run, &state).await {
            error!(%err, "backfill failed. Proceeding optimistically...");
            metrics::record_error("backfill");
        }

        Ok(state)
    }

    /// Fetch, verify and store light blocks in reverse order behind the
    /// synced height, far enough back that evidence and validator lookups
    /// stay sound.
    pub async fn backfill(&self, token: &CancellationToken, state: &State) -> Result<()> {
        let evidence = &state.consensus_params.evidence;
        let mut stop_height = state
            .last_block_height
            .saturating_sub(evidence.max_age_num_blocks);
        let max_age = chrono::Duration::from_std(evidence.max_age_duration)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let mut stop_time = state.last_block_time - max_age;
        if stop_height < state.initial_height {
            stop_height = state.initial_height;
            // voids the time criterion: every earlier block predates this
            stop_time = state.last_block_time;
        }
        self.backfill_range(
            token,
            state.last_block_height,
            stop_height,
            state.initial_height,
            state.last_block_id,
            stop_time,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn backfill_range(
        &self,
        token: &CancellationToken,
        start_height: u64,
        stop_height: u64,
        initial_height: u64,
        mut trusted_block_id: BlockId,
        stop_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        info!(
            start_height,
            stop_height,
            %stop_time,
            "starting backfill process..."
        );

        let queue = Arc::new(BlockQueue::new(
            start_height,
            stop_height,
            initial_height,
            stop_time,
            MAX_LIGHT_BLOCK_RETRIES,
        ));
        let (run, guard) = self.linked_token(token);

        let mut workers = Vec::new();
        for _ in 0..self.inner.cfg.fetchers {
            workers.push(tokio::spawn(backfill_fetcher(
                self.inner.clone(),
                queue.clone(),
                run.clone(),
            )));
        }

        let mut last_validator_set: Option<ValidatorSet> = None;
        let mut last_change_height = start_height;

        let result = loop {
            let resp = tokio::select! {
                _ = run.cancelled() => {
                    queue.close();
                    break Ok(());
                }
                resp = queue.verify_next() => resp,
            };

            let Some(resp) = resp else {
                if let Some(err) = queue.error() {
                    break Err(err);
                }
                let Some(terminal) = queue.terminal() else {
                    break Ok(());
                };
                if let Some(vals) = &last_validator_set {
                    if let Err(err) = self
                        .inner
                        .state_store
                        .save_validator_sets(terminal.height, last_change_height, vals)
                        .await
                    {
                        break Err(err);
                    }
                }
                info!(end_height = terminal.height, "successfully completed backfill process");
                break Ok(());
            };

            let height = resp.block.height();
            // The last block id of the previously verified header (one
            // height above) is the trusted hash this block must match.
            let got = resp.block.hash();
            if got != trusted_block_id.hash {
                warn!(
                    height,
                    expected = %trusted_block_id.hash,
                    got = %got,
                    "received invalid light block, header hash does not match trusted last block id"
                );
                self.report_block_peer_error(
                    resp.peer.clone(),
                    SyncError::invalid_block(format!(
                        "expected header hash {}, got {got}",
                        trusted_block_id.hash
                    )),
                );
                queue.retry(height);
                continue;
            }

            if let Err(err) = self
                .inner
                .block_store
                .save_signed_header(&resp.block.signed_header, &trusted_block_id)
                .await
            {
                break Err(err);
            }

            let header = &resp.block.signed_header.header;
            if let Some(vals) = &last_validator_set {
                if header.validators_hash != header.next_validators_hash {
                    // the validator set changed at this height: store the
                    // run of heights the previous set was valid for
                    if let Err(err) = self
                        .inner
                        .state_store
                        .save_validator_sets(height + 1, last_change_height, vals)
                        .await
                    {
                        break Err(err);
                    }
                    last_change_height = height;
                }
            }

            trusted_block_id = header.last_block_id;
            last_validator_set = Some(resp.block.validator_set.clone());
            queue.success(height);
            metrics::inc_backfilled_blocks();
            debug!(height, "backfill: verified and stored light block");
        };

        queue.close();
        run.cancel();
        for worker in workers {
            let _ = worker.await;
        }
        guard.abort();
        result
    }

    /// Wait until at least `min_peers` peers are connected.
    async fn wait_for_peers(&self, token: &CancellationToken, min_peers: usize) -> Result<()> {
        loop {
            if self.inner.peers.len() >= min_peers {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(SyncError::Canceled),
                _ = tokio::time::sleep(PEER_POLL_INTERVAL) => {}
            }
        }
    }

    fn init_state_provider(&self) -> Result<Provider> {
        let cfg = &self.inner.cfg;
        let trust = cfg.trust_options()?;
        let verifier = Arc::new(SkippingVerifier::new(trust.period));
        info!(
            trust_height = trust.height,
            use_p2p = cfg.use_p2p,
            "initializing state provider"
        );

        if cfg.use_p2p {
            Ok(Provider::P2p(Arc::new(P2pStateProvider::new(
                self.inner.chain_id.clone(),
                self.inner.initial_height,
                trust,
                verifier,
                self.inner.peers.all(),
                self.inner.dispatcher.clone(),
                self.inner.params_out.clone(),
            ))))
        } else {
            let provider = RpcStateProvider::new(
                self.inner.chain_id.clone(),
                self.inner.initial_height,
                trust,
                verifier,
                &cfg.rpc_servers,
            )?;
            Ok(Provider::Rpc(Arc::new(provider)))
        }
    }

    /// A token cancelled when either the caller's token fires or the reactor
    /// shuts down.
    fn linked_token(&self, token: &CancellationToken) -> (CancellationToken, JoinHandle<()>) {
        let run = token.child_token();
        let close = self.inner.close.clone();
        let guard = {
            let run = run.clone();
            tokio::spawn(async move {
                close.cancelled().await;
                run.cancel();
            })
        };
        (run, guard)
    }

    fn report_block_peer_error(&self, peer: NodeId, error: SyncError) {
        metrics::record_error("invalid_block");
        if self
            .inner
            .block_err
            .try_send(PeerError { peer, error })
            .is_err()
        {
            debug!("peer error queue full, dropping report");
        }
    }
}

/// One backfill fetch worker: pull the next height, pick a peer, request the
/// light block and hand it to the queue.
async fn backfill_fetcher(inner: Arc<Inner>, queue: Arc<BlockQueue>, run: CancellationToken) {
    while let Some(height) = queue.next_height().await {
        loop {
            let peer = match timeout(NO_PEERS_SLEEP, inner.peers.pop(&run)).await {
                Ok(Some(peer)) => peer,
                Ok(None) => return,
                Err(_) => {
                    debug!(height, "backfill: no connected peers, sleeping...");
                    queue.retry(height);
                    tokio::select! {
                        _ = run.cancelled() => return,
                        _ = tokio::time::sleep(NO_PEERS_SLEEP) => {}
                    }
                    break;
                }
            };

            debug!(height, peer = %peer, "backfill: fetching light block");
            let result = timeout(
                LIGHT_BLOCK_RESPONSE_TIMEOUT,
                inner.dispatcher.light_block(&run, height, peer.clone()),
            )
            .await
            .unwrap_or(Err(SyncError::Timeout(LIGHT_BLOCK_RESPONSE_TIMEOUT)));
            // the peer goes straight back into rotation whatever the outcome
            inner.peers.append(peer.clone());

            match result {
                Err(SyncError::Canceled) => return,
                Err(SyncError::Pending) => {
                    // another fetcher holds the dispatcher slot; this is
                    // contention, not a fetch failure, so it does not count
                    // against the height's retries
                    tokio::select! {
                        _ = run.cancelled() => return,
                        _ = tokio::time::sleep(DISPATCHER_BUSY_SLEEP) => {}
                    }
                    continue;
                }
                Err(err) => {
                    debug!(height, %err, "backfill: error fetching light block");
                    queue.retry(height);
                    break;
                }
                Ok(None) => {
                    // fetching backwards: a peer without this block will not
                    // have any earlier ones either
                    info!(height, peer = %peer, "backfill: peer does not have block, removing peer");
                    inner.peers.remove(&peer);
                    queue.retry(height);
                    break;
                }
                Ok(Some(block)) => {
                    let valid = block
                        .validate_basic(&inner.chain_id)
                        .map_err(|e| SyncError::invalid_block(e.to_string()))
                        .and_then(|()| {
                            if block.height() == height {
                                Ok(())
                            } else {
                                Err(SyncError::invalid_block(format!(
                                    "requested height {height}, got {}",
                                    block.height()
                                )))
                            }
                        });
                    if let Err(err) = valid {
                        warn!(height, %err, "backfill: fetched light block failed validate basic");
                        if inner
                            .block_err
                            .try_send(PeerError {
                                peer: peer.clone(),
                                error: err,
                            })
                            .is_err()
                        {
                            debug!("peer error queue full, dropping report");
                        }
                        queue.retry(height);
                        break;
                    }
                    queue.add(FetchedBlock { block, peer });
                    break;
                }
            }
        }
    }
}

/// Read envelopes off one channel and dispatch them to the typed handler,
/// reporting handler failures as peer errors.
async fn process_channel(inner: Arc<Inner>, mut channel: Channel, name: &'static str) {
    loop {
        tokio::select! {
            maybe = channel.rx.recv() => {
                let Some(envelope) = maybe else { break };
                let peer = envelope.from.clone();
                if let Err(err) = handle_message(&inner, channel.id, envelope).await {
                    warn!(channel = name, peer = %peer, %err, "failed to process message");
                    metrics::record_error("handler");
                    if channel.errors.try_send(PeerError { peer, error: err }).is_err() {
                        debug!(channel = name, "peer error queue full, dropping report");
                    }
                }
            }
            _ = inner.close.cancelled() => {
                debug!(channel = name, "stopped listening on channel; closing...");
                break;
            }
        }
    }
}

/// Handle one envelope behind a panic boundary: a panicking handler is
/// converted into an error for the sender instead of tearing the loop down.
async fn handle_message(inner: &Arc<Inner>, channel_id: u8, envelope: Envelope) -> Result<()> {
    debug!(
        message = envelope.message.message_type(),
        peer = %envelope.from,
        "received message"
    );
    match AssertUnwindSafe(route_message(inner, channel_id, envelope))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload);
            error!(%message, "recovering from panic while processing message");
            Err(SyncError::Panic(message))
        }
    }
}

async fn route_message(inner: &Arc<Inner>, channel_id: u8, envelope: Envelope) -> Result<()> {
    use crate::network::{CHUNK_CHANNEL, LIGHT_BLOCK_CHANNEL, PARAMS_CHANNEL, SNAPSHOT_CHANNEL};

    match channel_id {
        SNAPSHOT_CHANNEL => handle_snapshot_message(inner, envelope).await,
        CHUNK_CHANNEL => handle_chunk_message(inner, envelope).await,
        LIGHT_BLOCK_CHANNEL => handle_light_block_message(inner, envelope).await,
        PARAMS_CHANNEL => handle_params_message(inner, envelope).await,
        other => Err(SyncError::invalid_message(
            envelope.from,
            format!("unknown channel id {other:#x}"),
        )),
    }
}

async fn handle_snapshot_message(inner: &Arc<Inner>, envelope: Envelope) -> Result<()> {
    match envelope.message {
        Message::SnapshotsRequest => {
            let snapshots = match recent_snapshots(inner, RECENT_SNAPSHOTS).await {
                Ok(snapshots) => snapshots,
                Err(err) => {
                    error!(%err, "failed to fetch snapshots");
                    return Ok(());
                }
            };
            for snapshot in snapshots {
                info!(
                    height = snapshot.height,
                    format = snapshot.format,
                    peer = %envelope.from,
                    "advertising snapshot"
                );
                let response = Envelope::addressed(
                    envelope.from.clone(),
                    Message::SnapshotsResponse {
                        height: snapshot.height,
                        format: snapshot.format,
                        chunks: snapshot.chunks,
                        hash: snapshot.hash,
                        metadata: snapshot.metadata,
                    },
                );
                if inner.snapshot_out.send(response).await.is_err() {
                    return Ok(());
                }
            }
            Ok(())
        }

        Message::SnapshotsResponse {
            height,
            format,
            chunks,
            hash,
            metadata,
        } => {
            let sync = inner.sync.read().await;
            let Some(syncer) = &sync.syncer else {
                debug!(peer = %envelope.from, "received unexpected snapshot; no state sync in progress");
                return Ok(());
            };
            info!(height, format, peer = %envelope.from, "received snapshot");
            syncer.add_snapshot(
                envelope.from,
                Snapshot {
                    height,
                    format,
                    chunks,
                    hash,
                    metadata,
                },
            );
            Ok(())
        }

        other => Err(SyncError::invalid_message(
            envelope.from,
            format!("unexpected {} on snapshot channel", other.message_type()),
        )),
    }
}

async fn handle_chunk_message(inner: &Arc<Inner>, envelope: Envelope) -> Result<()> {
    match envelope.message {
        Message::ChunkRequest {
            height,
            format,
            index,
        } => {
            debug!(height, format, index, peer = %envelope.from, "received chunk request");
            let chunk = match inner.conn.load_snapshot_chunk(height, format, index).await {
                Ok(chunk) => chunk,
                Err(err) => {
                    error!(height, format, index, %err, "failed to load chunk");
                    return Ok(());
                }
            };
            let missing = chunk.is_none();
            let response = Envelope::addressed(
                envelope.from,
                Message::ChunkResponse {
                    height,
                    format,
                    index,
                    chunk: chunk.unwrap_or_default(),
                    missing,
                },
            );
            let _ = inner.chunk_out.send(response).await;
            Ok(())
        }

        Message::ChunkResponse {
            height,
            format,
            index,
            chunk,
            missing,
        } => {
            let sync = inner.sync.read().await;
            let Some(syncer) = &sync.syncer else {
                debug!(peer = %envelope.from, "received unexpected chunk; no state sync in progress");
                return Ok(());
            };
            if missing {
                debug!(height, index, peer = %envelope.from, "peer does not have chunk");
                return Ok(());
            }
            debug!(height, format, index, peer = %envelope.from, "received chunk; adding to sync");
            syncer.add_chunk(Chunk {
                height,
                format,
                index,
                chunk,
                sender: envelope.from,
            })?;
            Ok(())
        }

        other => Err(SyncError::invalid_message(
            envelope.from,
            format!("unexpected {} on chunk channel", other.message_type()),
        )),
    }
}

async fn handle_light_block_message(inner: &Arc<Inner>, envelope: Envelope) -> Result<()> {
    match envelope.message {
        Message::LightBlockRequest { height } => {
            debug!(height, "received light block request");
            let light_block = fetch_light_block(inner, height).await?;
            if light_block.is_none() {
                debug!(height, "don't have light block, sending empty response");
            }
            let response = Envelope::addressed(
                envelope.from,
                Message::LightBlockResponse { light_block },
            );
            let _ = inner.block_out.send(response).await;
            Ok(())
        }

        Message::LightBlockResponse { light_block } => {
            let height = light_block.as_ref().map(|lb| lb.height()).unwrap_or(0);
            debug!(height, peer = %envelope.from, "received light block response");
            inner.dispatcher.respond(light_block, envelope.from);
            Ok(())
        }

        other => Err(SyncError::invalid_message(
            envelope.from,
            format!("unexpected {} on light block channel", other.message_type()),
        )),
    }
}

async fn handle_params_message(inner: &Arc<Inner>, envelope: Envelope) -> Result<()> {
    match envelope.message {
        Message::ParamsRequest { height } => {
            debug!(height, "received consensus params request");
            let params = match inner.state_store.load_consensus_params(height).await {
                Ok(Some(params)) => params,
                Ok(None) => {
                    debug!(height, "no consensus params stored at height");
                    return Ok(());
                }
                Err(err) => {
                    error!(height, %err, "failed to fetch requested consensus params");
                    return Ok(());
                }
            };
            let response = Envelope::addressed(
                envelope.from,
                Message::ParamsResponse {
                    height,
                    consensus_params: params,
                },
            );
            let _ = inner.params_out.send(response).await;
            Ok(())
        }

        Message::ParamsResponse {
            height,
            consensus_params,
        } => {
            let sync = inner.sync.read().await;
            debug!(height, "received consensus params response");
            match &sync.provider {
                Some(Provider::P2p(provider)) => {
                    provider.deposit_params(height, consensus_params);
                }
                _ => {
                    debug!(
                        peer = %envelope.from,
                        "received unexpected params response; not using the p2p state provider"
                    );
                }
            }
            Ok(())
        }

        other => Err(SyncError::invalid_message(
            envelope.from,
            format!("unexpected {} on params channel", other.message_type()),
        )),
    }
}

async fn process_peer_updates(inner: Arc<Inner>, mut updates: mpsc::Receiver<PeerUpdate>) {
    loop {
        tokio::select! {
            maybe = updates.recv() => {
                let Some(update) = maybe else { break };
                process_peer_update(&inner, update).await;
            }
            _ = inner.close.cancelled() => {
                debug!("stopped listening on peer updates channel; closing...");
                break;
            }
        }
    }
}

async fn process_peer_update(inner: &Arc<Inner>, update: PeerUpdate) {
    info!(peer = %update.peer, status = ?update.status, "received peer update");

    match update.status {
        PeerStatus::Up => inner.peers.append(update.peer.clone()),
        PeerStatus::Down => inner.peers.remove(&update.peer),
    }

    let sync = inner.sync.read().await;
    let Some(syncer) = &sync.syncer else {
        return;
    };
    match update.status {
        PeerStatus::Up => {
            syncer.add_peer(update.peer.clone()).await;
            if let Some(Provider::P2p(provider)) = &sync.provider {
                provider.add_peer(update.peer);
            }
        }
        PeerStatus::Down => {
            syncer.remove_peer(&update.peer);
            if let Some(Provider::P2p(provider)) = &sync.provider {
                provider.remove_peer(&update.peer);
            }
        }
    }
}

/// The `n` most recent snapshots the application can serve, sorted by
/// height then format, both descending.
async fn recent_snapshots(inner: &Arc<Inner>, n: usize) -> Result<Vec<Snapshot>> {
    let mut snapshots = inner.conn.list_snapshots().await?;
    snapshots.sort_by(|a, b| (b.height, b.format).cmp(&(a.height, a.format)));
    snapshots.truncate(n);
    Ok(snapshots)
}

/// Assemble the light block at `height` from the local stores, `None` when
/// any piece is missing.
async fn fetch_light_block(inner: &Arc<Inner>, height: u64) -> Result<Option<LightBlock>> {
    let Some(meta) = inner.block_store.load_block_meta(height).await? else {
        return Ok(None);
    };
    let Some(commit) = inner.block_store.load_block_commit(height).await? else {
        return Ok(None);
    };
    let Some(validator_set) = inner.state_store.load_validators(height).await? else {
        return Ok(None);
    };
    Ok(Some(LightBlock {
        signed_header: SignedHeader {
            header: meta.header,
            commit,
        },
        validator_set,
    }))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
