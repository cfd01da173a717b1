//! Bootstrap chain state.

use crate::{BlockId, ConsensusParams, Hash, ValidatorSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A snapshot of the chain state sufficient to bootstrap a node.
///
/// Produced by the state providers after verifying a header at the sync
/// height, persisted via the state store so that consensus or block sync can
/// commence on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Chain identifier.
    pub chain_id: String,
    /// First height of the chain (usually 1).
    pub initial_height: u64,
    /// Height of the last agreed block.
    pub last_block_height: u64,
    /// Id of the last agreed block.
    pub last_block_id: BlockId,
    /// Timestamp of the last agreed block.
    pub last_block_time: DateTime<Utc>,
    /// Validator set for the last agreed block.
    pub validators: ValidatorSet,
    /// Validator set for the next block.
    pub next_validators: ValidatorSet,
    /// Height at which `validators` last changed.
    pub last_height_validators_changed: u64,
    /// Consensus parameters in effect.
    pub consensus_params: ConsensusParams,
    /// Height at which `consensus_params` last changed.
    pub last_height_consensus_params_changed: u64,
    /// Application state hash after the last agreed block.
    pub app_hash: Hash,
}
