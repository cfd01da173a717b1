//! Consensus parameters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Consensus-critical parameters, agreed on by all nodes at a height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Block size limits.
    pub block: BlockParams,
    /// Evidence validity window.
    pub evidence: EvidenceParams,
    /// Validator key constraints.
    pub validator: ValidatorParams,
}

/// Block size limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParams {
    /// Maximum block size in bytes.
    pub max_bytes: u64,
    /// Maximum gas per block (u64::MAX for unlimited).
    pub max_gas: u64,
}

/// Evidence validity window: evidence older than both bounds is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceParams {
    /// Maximum age of evidence in blocks.
    pub max_age_num_blocks: u64,
    /// Maximum age of evidence in time.
    pub max_age_duration: Duration,
    /// Maximum total evidence size per block in bytes.
    pub max_bytes: u64,
}

/// Validator key constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorParams {
    /// Accepted public key types.
    pub pub_key_types: Vec<String>,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            block: BlockParams {
                max_bytes: 4 * 1024 * 1024,
                max_gas: u64::MAX,
            },
            evidence: EvidenceParams {
                max_age_num_blocks: 100_000,
                max_age_duration: Duration::from_secs(48 * 60 * 60),
                max_bytes: 1024 * 1024,
            },
            validator: ValidatorParams {
                pub_key_types: vec!["ed25519".to_string()],
            },
        }
    }
}
