//! Shared harness for reactor integration tests: a deterministic hash-linked
//! chain and simulated peers behind the channel handles.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use emberbft_statesync::network::{
    CHUNK_CHANNEL, LIGHT_BLOCK_CHANNEL, PARAMS_CHANNEL, SNAPSHOT_CHANNEL,
};
use emberbft_statesync::{
    Channel, ChannelHandle, Envelope, Message, MockSnapshotApp, NodeId, PeerError, PeerUpdate,
    Reactor, ReactorChannels, MemoryBlockStore, MemoryStateStore, StateSyncConfig,
};
use emberbft_types::{
    BlockId, Commit, CommitSig, ConsensusParams, Hash, Header, LightBlock, SignedHeader, State,
    Validator, ValidatorSet,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const CHAIN_ID: &str = "test-chain";

pub fn validators() -> ValidatorSet {
    ValidatorSet::new(vec![
        Validator::new(vec![1; 20], vec![1; 32], 10),
        Validator::new(vec![2; 20], vec![2; 32], 10),
        Validator::new(vec![3; 20], vec![3; 32], 10),
    ])
}

pub fn genesis_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("time")
}

pub fn block_time(height: u64) -> DateTime<Utc> {
    genesis_time() + chrono::Duration::seconds(height as i64)
}

/// Build a hash-linked, fully signed chain `1..=length` with a constant
/// validator set.
pub fn build_chain(length: u64) -> HashMap<u64, LightBlock> {
    let vals = validators();
    let mut chain = HashMap::new();
    let mut prev_hash = Hash::ZERO;
    for height in 1..=length {
        let time = block_time(height);
        let header = Header {
            chain_id: CHAIN_ID.to_string(),
            height,
            time,
            last_block_id: BlockId::new(prev_hash),
            last_commit_hash: Hash::ZERO,
            data_hash: Hash::ZERO,
            validators_hash: vals.hash(),
            next_validators_hash: vals.hash(),
            app_hash: Hash::compute(&height.to_be_bytes()),
            proposer_address: vec![1; 20],
        };
        prev_hash = header.hash();
        let commit = Commit {
            height,
            block_id: BlockId::new(prev_hash),
            signatures: vals
                .validators
                .iter()
                .map(|v| CommitSig {
                    validator_address: v.address.clone(),
                    timestamp: time,
                    signature: vec![1; 64],
                })
                .collect(),
        };
        chain.insert(
            height,
            LightBlock {
                signed_header: SignedHeader { header, commit },
                validator_set: vals.clone(),
            },
        );
    }
    chain
}

/// A structurally valid light block that does not hash-link into the chain.
pub fn corrupt(block: &LightBlock) -> LightBlock {
    let mut forged = block.clone();
    forged.signed_header.header.app_hash = Hash::repeat_byte(0xde);
    forged.signed_header.commit.block_id = BlockId::new(forged.signed_header.header.hash());
    forged
}

/// Bootstrap state sitting at `height` of `chain`, with the given evidence
/// window driving the backfill stop conditions.
pub fn state_at(
    chain: &HashMap<u64, LightBlock>,
    height: u64,
    max_age_blocks: u64,
    max_age: std::time::Duration,
) -> State {
    let block = &chain[&height];
    let mut params = ConsensusParams::default();
    params.evidence.max_age_num_blocks = max_age_blocks;
    params.evidence.max_age_duration = max_age;
    State {
        chain_id: CHAIN_ID.to_string(),
        initial_height: 1,
        last_block_height: height,
        last_block_id: block.signed_header.commit.block_id,
        last_block_time: block.time(),
        validators: block.validator_set.clone(),
        next_validators: block.validator_set.clone(),
        last_height_validators_changed: 1,
        consensus_params: params,
        last_height_consensus_params_changed: 1,
        app_hash: Hash::ZERO,
    }
}

pub fn test_config() -> StateSyncConfig {
    StateSyncConfig {
        use_p2p: true,
        trust_height: 10,
        trust_hash: Hash::repeat_byte(0xaa).to_string(),
        discovery_time: std::time::Duration::from_millis(200),
        fetchers: 2,
        chunk_fetchers: 2,
        ..StateSyncConfig::default()
    }
}

/// A reactor wired to in-memory collaborators, with the transport-side
/// channel handles exposed for simulation.
pub struct TestNet {
    pub reactor: Reactor,
    pub state_store: Arc<MemoryStateStore>,
    pub block_store: Arc<MemoryBlockStore>,
    pub snapshot: ChannelHandle,
    pub chunk: ChannelHandle,
    pub light_block: ChannelHandle,
    pub params: ChannelHandle,
    pub peer_updates: mpsc::Sender<PeerUpdate>,
}

pub fn testnet(cfg: StateSyncConfig) -> (TestNet, Arc<MockSnapshotApp>) {
    let app = Arc::new(MockSnapshotApp::new());
    (testnet_with(cfg, app.clone()), app)
}

pub fn testnet_with(
    cfg: StateSyncConfig,
    conn: Arc<dyn emberbft_statesync::SnapshotConn>,
) -> TestNet {
    let (snapshot_ch, snapshot) = Channel::new(SNAPSHOT_CHANNEL);
    let (chunk_ch, chunk) = Channel::new(CHUNK_CHANNEL);
    let (light_ch, light_block) = Channel::new(LIGHT_BLOCK_CHANNEL);
    let (params_ch, params) = Channel::new(PARAMS_CHANNEL);
    let (pu_tx, pu_rx) = mpsc::channel(16);

    let state_store = Arc::new(MemoryStateStore::new());
    let block_store = Arc::new(MemoryBlockStore::new());

    let mut reactor = Reactor::new(
        CHAIN_ID,
        1,
        cfg,
        conn,
        state_store.clone(),
        block_store.clone(),
        ReactorChannels {
            snapshot: snapshot_ch,
            chunk: chunk_ch,
            light_block: light_ch,
            params: params_ch,
        },
        pu_rx,
    );
    reactor.start();

    TestNet {
        reactor,
        state_store,
        block_store,
        snapshot,
        chunk,
        light_block,
        params,
        peer_updates: pu_tx,
    }
}

impl TestNet {
    /// Take the light block channel's transport ends for a simulator task.
    pub fn take_light_block(&mut self) -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        let tx = self.light_block.tx.clone();
        let rx = std::mem::replace(&mut self.light_block.rx, mpsc::channel(1).1);
        (tx, rx)
    }

    /// Take the snapshot channel's transport ends for a simulator task.
    pub fn take_snapshot(&mut self) -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        let tx = self.snapshot.tx.clone();
        let rx = std::mem::replace(&mut self.snapshot.rx, mpsc::channel(1).1);
        (tx, rx)
    }

    /// Take the chunk channel's transport ends for a simulator task.
    pub fn take_chunk(&mut self) -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        let tx = self.chunk.tx.clone();
        let rx = std::mem::replace(&mut self.chunk.rx, mpsc::channel(1).1);
        (tx, rx)
    }

    /// Take the params channel's transport ends for a simulator task.
    pub fn take_params(&mut self) -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        let tx = self.params.tx.clone();
        let rx = std::mem::replace(&mut self.params.rx, mpsc::channel(1).1);
        (tx, rx)
    }

    /// Connect `peers` and wait until the reactor has registered them.
    pub async fn connect_peers(&self, peers: &[&str]) {
        for peer in peers {
            self.peer_updates
                .send(PeerUpdate {
                    peer: peer.to_string(),
                    status: emberbft_statesync::PeerStatus::Up,
                })
                .await
                .expect("peer update");
        }
        while self.reactor.peer_count() < peers.len() {
            tokio::task::yield_now().await;
        }
    }
}

/// How a simulated peer answers light block requests.
#[derive(Clone)]
pub enum LightBlockBehavior {
    /// Serve every height the chain has.
    Honest,
    /// Pretend not to have blocks below the given height.
    MissingBelow(u64),
    /// Always serve a forged block at the given height, honest elsewhere.
    InvalidAt(u64),
    /// Serve a forged block the first time the given height is requested
    /// from this peer, honest afterwards.
    InvalidOnceAt(u64),
}

/// Serve light block requests from the given per-peer behaviors. The error
/// stream stays with the caller for assertions.
pub fn serve_light_blocks(
    tx: mpsc::Sender<Envelope>,
    mut rx: mpsc::Receiver<Envelope>,
    chain: Arc<HashMap<u64, LightBlock>>,
    behaviors: HashMap<NodeId, LightBlockBehavior>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut already_forged: HashSet<NodeId> = HashSet::new();
        while let Some(envelope) = rx.recv().await {
            let Message::LightBlockRequest { height } = envelope.message else {
                continue;
            };
            let peer = envelope.to.unwrap_or_default();
            let behavior = behaviors
                .get(&peer)
                .cloned()
                .unwrap_or(LightBlockBehavior::Honest);
            let light_block = match behavior {
                LightBlockBehavior::Honest => chain.get(&height).cloned(),
                LightBlockBehavior::MissingBelow(floor) if height < floor => None,
                LightBlockBehavior::MissingBelow(_) => chain.get(&height).cloned(),
                LightBlockBehavior::InvalidAt(h) if height == h => {
                    chain.get(&height).map(corrupt)
                }
                LightBlockBehavior::InvalidAt(_) => chain.get(&height).cloned(),
                LightBlockBehavior::InvalidOnceAt(h)
                    if height == h && already_forged.insert(peer.clone()) =>
                {
                    chain.get(&height).map(corrupt)
                }
                LightBlockBehavior::InvalidOnceAt(_) => chain.get(&height).cloned(),
            };
            let _ = tx
                .send(Envelope::received(
                    peer,
                    Message::LightBlockResponse { light_block },
                ))
                .await;
        }
    })
}

/// Drain every queued peer error without waiting.
pub fn drain_errors(rx: &mut mpsc::Receiver<PeerError>) -> Vec<PeerError> {
    let mut errors = Vec::new();
    while let Ok(err) = rx.try_recv() {
        errors.push(err);
    }
    errors
}
