//! State and block store contracts.
//!
//! Persistence lives elsewhere in the node; state sync only needs the
//! operations below. In-memory implementations are provided for tests and
//! local tooling.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use emberbft_types::{BlockId, BlockMeta, Commit, ConsensusParams, SignedHeader, State, ValidatorSet};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Store of consensus state: bootstrap state, validator sets and params.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist the bootstrap state produced by a snapshot restore.
    async fn bootstrap(&self, state: &State) -> Result<()>;

    /// Persist `set` as the validator set for every height in
    /// `[low_height, high_height]`.
    async fn save_validator_sets(
        &self,
        low_height: u64,
        high_height: u64,
        set: &ValidatorSet,
    ) -> Result<()>;

    /// Validator set at `height`, if known.
    async fn load_validators(&self, height: u64) -> Result<Option<ValidatorSet>>;

    /// Consensus params at `height`, if known.
    async fn load_consensus_params(&self, height: u64) -> Result<Option<ConsensusParams>>;
}

/// Store of block headers and commits.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Persist a backfilled signed header verified against `trusted_id`.
    async fn save_signed_header(&self, header: &SignedHeader, trusted_id: &BlockId) -> Result<()>;

    /// Persist the commit observed for the sync height.
    async fn save_seen_commit(&self, height: u64, commit: &Commit) -> Result<()>;

    /// Block metadata at `height`, if stored.
    async fn load_block_meta(&self, height: u64) -> Result<Option<BlockMeta>>;

    /// Block commit at `height`, if stored.
    async fn load_block_commit(&self, height: u64) -> Result<Option<Commit>>;
}

#[derive(Default)]
struct MemoryStateInner {
    bootstrap: Option<State>,
    validator_ranges: Vec<(u64, u64, ValidatorSet)>,
    params: HashMap<u64, ConsensusParams>,
}

/// In-memory state store.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryStateInner>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the consensus params served at `height`.
    pub fn set_consensus_params(&self, height: u64, params: ConsensusParams) {
        self.inner.lock().params.insert(height, params);
    }

    /// The bootstrapped state, if any.
    pub fn bootstrap_state(&self) -> Option<State> {
        self.inner.lock().bootstrap.clone()
    }

    /// Validator ranges saved so far, as `(low, high, set)` tuples.
    pub fn validator_ranges(&self) -> Vec<(u64, u64, ValidatorSet)> {
        self.inner.lock().validator_ranges.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn bootstrap(&self, state: &State) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.bootstrap.is_some() {
            return Err(SyncError::Store("state already bootstrapped".into()));
        }
        inner.bootstrap = Some(state.clone());
        Ok(())
    }

    async fn save_validator_sets(
        &self,
        low_height: u64,
        high_height: u64,
        set: &ValidatorSet,
    ) -> Result<()> {
        if low_height > high_height {
            return Err(SyncError::Store(format!(
                "invalid validator range [{low_height}, {high_height}]"
            )));
        }
        self.inner
            .lock()
            .validator_ranges
            .push((low_height, high_height, set.clone()));
        Ok(())
    }

    async fn load_validators(&self, height: u64) -> Result<Option<ValidatorSet>> {
        let inner = self.inner.lock();
        for (low, high, set) in inner.validator_ranges.iter().rev() {
            if (*low..=*high).contains(&height) {
                return Ok(Some(set.clone()));
            }
        }
        if let Some(state) = &inner.bootstrap {
            if state.last_block_height == height {
                return Ok(Some(state.validators.clone()));
            }
        }
        Ok(None)
    }

    async fn load_consensus_params(&self, height: u64) -> Result<Option<ConsensusParams>> {
        Ok(self.inner.lock().params.get(&height).cloned())
    }
}

#[derive(Default)]
struct MemoryBlockInner {
    headers: HashMap<u64, SignedHeader>,
    seen_commits: HashMap<u64, Commit>,
}

/// In-memory block store.
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: Mutex<MemoryBlockInner>,
}

impl MemoryBlockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a block for the serve side.
    pub fn put_block(&self, header: SignedHeader) {
        let mut inner = self.inner.lock();
        let height = header.header.height;
        inner.seen_commits.insert(height, header.commit.clone());
        inner.headers.insert(height, header);
    }

    /// Heights with a stored signed header, unsorted.
    pub fn stored_heights(&self) -> Vec<u64> {
        self.inner.lock().headers.keys().copied().collect()
    }

    /// The commit saved as seen at `height`, if any.
    pub fn seen_commit(&self, height: u64) -> Option<Commit> {
        self.inner.lock().seen_commits.get(&height).cloned()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn save_signed_header(&self, header: &SignedHeader, _trusted_id: &BlockId) -> Result<()> {
        self.inner
            .lock()
            .headers
            .insert(header.header.height, header.clone());
        Ok(())
    }

    async fn save_seen_commit(&self, height: u64, commit: &Commit) -> Result<()> {
        self.inner.lock().seen_commits.insert(height, commit.clone());
        Ok(())
    }

    async fn load_block_meta(&self, height: u64) -> Result<Option<BlockMeta>> {
        Ok(self.inner.lock().headers.get(&height).map(|sh| BlockMeta {
            block_id: BlockId::new(sh.header.hash()),
            header: sh.header.clone(),
        }))
    }

    async fn load_block_commit(&self, height: u64) -> Result<Option<Commit>> {
        Ok(self.inner.lock().seen_commits.get(&height).cloned())
    }
}
