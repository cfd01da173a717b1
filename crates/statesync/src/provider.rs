//! State providers.
//!
//! A state provider produces a consensus-verified header, commit and app
//! hash at a chosen height, plus the consensus params in effect there. Two
//! interchangeable implementations exist behind one contract: a P2P variant
//! fed by the light-block dispatcher and the params gossip channel, and an
//! RPC variant backed by external JSON-RPC endpoints.

use crate::dispatcher::{Dispatcher, LIGHT_BLOCK_RESPONSE_TIMEOUT};
use crate::error::{Result, SyncError};
use crate::light::{LightBlockSource, TrustOptions, Verifier};
use crate::network::{Envelope, NodeId};
use crate::protocol::Message;
use async_trait::async_trait;
use chrono::Utc;
use emberbft_types::{Commit, ConsensusParams, Hash, LightBlock, State};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long the P2P provider waits for a params response from one peer
/// before asking the next one.
pub const CONSENSUS_PARAMS_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer of the params side-channel; the inbound handler deposits
/// non-blocking and drops on overflow.
const PARAMS_RECV_BUFFER: usize = 4;

/// Provider of trusted state at a chosen height.
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Application hash expected at `height`.
    async fn app_hash(&self, height: u64) -> Result<Hash>;

    /// Verified commit at `height`.
    async fn commit(&self, height: u64) -> Result<Commit>;

    /// Verified bootstrap state with `height` as the last block height.
    async fn state(&self, height: u64) -> Result<State>;
}

/// Fetch `height` from the first source that produces a block verifying
/// against the trust anchor.
async fn verify_from_sources(
    sources: &[Arc<dyn LightBlockSource>],
    trust: &TrustOptions,
    verifier: &dyn Verifier,
    height: u64,
) -> Result<LightBlock> {
    if sources.is_empty() {
        return Err(SyncError::NoConnectedPeers);
    }

    let mut last_err = None;
    for source in sources {
        match verify_from_source(source.as_ref(), trust, verifier, height).await {
            Ok(block) => return Ok(block),
            Err(err) => {
                debug!(source = source.id(), height, %err, "light block source failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or(SyncError::NoConnectedPeers))
}

async fn verify_from_source(
    source: &dyn LightBlockSource,
    trust: &TrustOptions,
    verifier: &dyn Verifier,
    height: u64,
) -> Result<LightBlock> {
    let anchor = source.light_block(trust.height).await?;
    if anchor.hash() != trust.hash {
        return Err(SyncError::Light(format!(
            "header at trust height {} does not match the configured trust hash",
            trust.height
        )));
    }
    let candidate = source.light_block(height).await?;
    verifier.verify(&anchor, &candidate, Utc::now())?;
    Ok(candidate)
}

/// Assemble the bootstrap state from the verified light blocks at the sync
/// height and one above it. The app hash and next validators come from
/// `next`: a header carries the application hash of its predecessor.
fn assemble_state(
    chain_id: &str,
    initial_height: u64,
    current: &LightBlock,
    next: &LightBlock,
    consensus_params: ConsensusParams,
) -> State {
    State {
        chain_id: chain_id.to_string(),
        initial_height,
        last_block_height: current.height(),
        last_block_id: current.signed_header.commit.block_id,
        last_block_time: current.time(),
        validators: current.validator_set.clone(),
        next_validators: next.validator_set.clone(),
        last_height_validators_changed: next.height(),
        consensus_params,
        last_height_consensus_params_changed: next.height(),
        app_hash: next.signed_header.header.app_hash,
    }
}

/// Light block source backed by one peer, speaking through the dispatcher.
pub struct BlockProvider {
    peer: NodeId,
    chain_id: String,
    dispatcher: Arc<Dispatcher>,
}

impl BlockProvider {
    /// Create a source for `peer`.
    pub fn new(peer: NodeId, chain_id: String, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            peer,
            chain_id,
            dispatcher,
        }
    }
}

#[async_trait]
impl LightBlockSource for BlockProvider {
    fn id(&self) -> &str {
        &self.peer
    }

    async fn light_block(&self, height: u64) -> Result<LightBlock> {
        let token = CancellationToken::new();
        let block = timeout(
            LIGHT_BLOCK_RESPONSE_TIMEOUT,
            self.dispatcher.light_block(&token, height, self.peer.clone()),
        )
        .await
        .map_err(|_| SyncError::Timeout(LIGHT_BLOCK_RESPONSE_TIMEOUT))??;

        let block = block.ok_or_else(|| SyncError::PeerMissingData {
            peer: self.peer.clone(),
            height,
        })?;
        block
            .validate_basic(&self.chain_id)
            .map_err(|e| SyncError::invalid_block(e.to_string()))?;
        if block.height() != height {
            return Err(SyncError::invalid_block(format!(
                "expected height {height}, peer sent {}",
                block.height()
            )));
        }
        Ok(block)
    }
}

/// State provider fed by connected peers over the gossip channels.
pub struct P2pStateProvider {
    chain_id: String,
    initial_height: u64,
    trust: TrustOptions,
    verifier: Arc<dyn Verifier>,
    dispatcher: Arc<Dispatcher>,
    sources: RwLock<Vec<Arc<dyn LightBlockSource>>>,
    params_out: mpsc::Sender<Envelope>,
    params_tx: mpsc::Sender<(u64, ConsensusParams)>,
    params_rx: tokio::sync::Mutex<mpsc::Receiver<(u64, ConsensusParams)>>,
}

impl P2pStateProvider {
    /// Create a provider over the currently connected `peers`.
    pub fn new(
        chain_id: String,
        initial_height: u64,
        trust: TrustOptions,
        verifier: Arc<dyn Verifier>,
        peers: Vec<NodeId>,
        dispatcher: Arc<Dispatcher>,
        params_out: mpsc::Sender<Envelope>,
    ) -> Self {
        let sources = peers
            .into_iter()
            .map(|peer| {
                Arc::new(BlockProvider::new(
                    peer,
                    chain_id.clone(),
                    dispatcher.clone(),
                )) as Arc<dyn LightBlockSource>
            })
            .collect();
        let (params_tx, params_rx) = mpsc::channel(PARAMS_RECV_BUFFER);
        Self {
            chain_id,
            initial_height,
            trust,
            verifier,
            dispatcher,
            sources: RwLock::new(sources),
            params_out,
            params_tx,
            params_rx: tokio::sync::Mutex::new(params_rx),
        }
    }

    /// Register a newly connected peer as a light block source.
    pub fn add_peer(&self, peer: NodeId) {
        let source = Arc::new(BlockProvider::new(
            peer,
            self.chain_id.clone(),
            self.dispatcher.clone(),
        ));
        self.sources.write().push(source);
    }

    /// Drop a disconnected peer's source.
    pub fn remove_peer(&self, peer: &str) {
        self.sources.write().retain(|s| s.id() != peer);
    }

    /// Deposit an inbound params response, non-blocking. Responses arriving
    /// while the buffer is full are dropped; the provider will re-request.
    pub fn deposit_params(&self, height: u64, params: ConsensusParams) {
        if self.params_tx.try_send((height, params)).is_err() {
            debug!(height, "params buffer full, dropping response");
        }
    }

    async fn verified_light_block(&self, height: u64) -> Result<LightBlock> {
        let sources = self.sources.read().clone();
        verify_from_sources(&sources, &self.trust, self.verifier.as_ref(), height).await
    }

    /// Ask each registered peer in turn for the consensus params at
    /// `height`, waiting up to the params timeout per peer.
    async fn consensus_params(&self, height: u64) -> Result<ConsensusParams> {
        let peers: Vec<NodeId> = self
            .sources
            .read()
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        if peers.is_empty() {
            return Err(SyncError::NoConnectedPeers);
        }

        let mut rx = self.params_rx.lock().await;
        // flush responses left over from earlier requests
        while rx.try_recv().is_ok() {}

        for peer in peers {
            self.params_out
                .send(Envelope::addressed(
                    peer.clone(),
                    Message::ParamsRequest { height },
                ))
                .await
                .map_err(|_| SyncError::Transport("params channel closed".into()))?;

            let deadline = tokio::time::Instant::now() + CONSENSUS_PARAMS_RESPONSE_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    warn!(peer = %peer, height, "timed out waiting for consensus params");
                    break;
                }
                match timeout(remaining, rx.recv()).await {
                    Ok(Some((h, params))) if h == height => return Ok(params),
                    Ok(Some((h, _))) => {
                        debug!(height, got = h, "dropping params response for wrong height");
                    }
                    Ok(None) => {
                        return Err(SyncError::Transport("params receiver closed".into()))
                    }
                    Err(_) => break,
                }
            }
        }
        Err(SyncError::StateProviderUnreachable(format!(
            "no peer returned consensus params for height {height}"
        )))
    }
}

#[async_trait]
impl StateProvider for P2pStateProvider {
    async fn app_hash(&self, height: u64) -> Result<Hash> {
        let next = self.verified_light_block(height + 1).await?;
        Ok(next.signed_header.header.app_hash)
    }

    async fn commit(&self, height: u64) -> Result<Commit> {
        let block = self.verified_light_block(height).await?;
        Ok(block.signed_header.commit)
    }

    async fn state(&self, height: u64) -> Result<State> {
        let current = self.verified_light_block(height).await?;
        let next = self.verified_light_block(height + 1).await?;
        let params = self.consensus_params(height + 1).await?;
        Ok(assemble_state(
            &self.chain_id,
            self.initial_height,
            &current,
            &next,
            params,
        ))
    }
}

/// Light block source backed by one JSON-RPC endpoint.
struct RpcSource {
    url: String,
    chain_id: String,
    client: HttpClient,
}

#[async_trait]
impl LightBlockSource for RpcSource {
    fn id(&self) -> &str {
        &self.url
    }

    async fn light_block(&self, height: u64) -> Result<LightBlock> {
        let block: Option<LightBlock> = self
            .client
            .request("statesync_lightBlock", rpc_params![height])
            .await
            .map_err(|e| SyncError::StateProviderUnreachable(format!("{}: {e}", self.url)))?;
        let block = block.ok_or_else(|| SyncError::PeerMissingData {
            peer: self.url.clone(),
            height,
        })?;
        block
            .validate_basic(&self.chain_id)
            .map_err(|e| SyncError::invalid_block(e.to_string()))?;
        if block.height() != height {
            return Err(SyncError::invalid_block(format!(
                "expected height {height}, endpoint sent {}",
                block.height()
            )));
        }
        Ok(block)
    }
}

/// State provider backed by external JSON-RPC endpoints.
pub struct RpcStateProvider {
    chain_id: String,
    initial_height: u64,
    trust: TrustOptions,
    verifier: Arc<dyn Verifier>,
    sources: Vec<Arc<dyn LightBlockSource>>,
    clients: Vec<(String, HttpClient)>,
}

impl RpcStateProvider {
    /// Create a provider over the configured RPC `servers`.
    pub fn new(
        chain_id: String,
        initial_height: u64,
        trust: TrustOptions,
        verifier: Arc<dyn Verifier>,
        servers: &[String],
    ) -> Result<Self> {
        let mut sources: Vec<Arc<dyn LightBlockSource>> = Vec::with_capacity(servers.len());
        let mut clients = Vec::with_capacity(servers.len());
        for url in servers {
            let client = HttpClientBuilder::default()
                .request_timeout(LIGHT_BLOCK_RESPONSE_TIMEOUT)
                .build(url)
                .map_err(|e| SyncError::Config(format!("rpc server {url}: {e}")))?;
            clients.push((url.clone(), client.clone()));
            sources.push(Arc::new(RpcSource {
                url: url.clone(),
                chain_id: chain_id.clone(),
                client,
            }));
        }
        Ok(Self {
            chain_id,
            initial_height,
            trust,
            verifier,
            sources,
            clients,
        })
    }

    async fn verified_light_block(&self, height: u64) -> Result<LightBlock> {
        verify_from_sources(&self.sources, &self.trust, self.verifier.as_ref(), height).await
    }

    async fn consensus_params(&self, height: u64) -> Result<ConsensusParams> {
        let mut last_err = None;
        for (url, client) in &self.clients {
            match client
                .request::<ConsensusParams, _>("statesync_consensusParams", rpc_params![height])
                .await
            {
                Ok(params) => return Ok(params),
                Err(e) => {
                    debug!(endpoint = %url, height, error = %e, "params request failed");
                    last_err = Some(SyncError::StateProviderUnreachable(format!("{url}: {e}")));
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| SyncError::StateProviderUnreachable("no rpc servers".into())))
    }
}

#[async_trait]
impl StateProvider for RpcStateProvider {
    async fn app_hash(&self, height: u64) -> Result<Hash> {
        let next = self.verified_light_block(height + 1).await?;
        Ok(next.signed_header.header.app_hash)
    }

    async fn commit(&self, height: u64) -> Result<Commit> {
        let block = self.verified_light_block(height).await?;
        Ok(block.signed_header.commit)
    }

    async fn state(&self, height: u64) -> Result<State> {
        let current = self.verified_light_block(height).await?;
        let next = self.verified_light_block(height + 1).await?;
        let params = self.consensus_params(height + 1).await?;
        Ok(assemble_state(
            &self.chain_id,
            self.initial_height,
            &current,
            &next,
            params,
        ))
    }
}

/// Fixture provider serving one pre-verified state, for tests and local
/// tooling.
pub struct StaticStateProvider {
    state: State,
    commit: Commit,
}

impl StaticStateProvider {
    /// Create a provider that always serves `state` and `commit`.
    pub fn new(state: State, commit: Commit) -> Self {
        Self { state, commit }
    }
}

#[async_trait]
impl StateProvider for StaticStateProvider {
    async fn app_hash(&self, _height: u64) -> Result<Hash> {
        Ok(self.state.app_hash)
    }

    async fn commit(&self, _height: u64) -> Result<Commit> {
        Ok(self.commit.clone())
    }

    async fn state(&self, _height: u64) -> Result<State> {
        Ok(self.state.clone())
    }
}
