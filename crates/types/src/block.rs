//! Block headers, commits and light blocks.

use crate::{Hash, ValidatorSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier of a block: the hash of its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockId {
    /// Header hash.
    pub hash: Hash,
}

impl BlockId {
    /// Create a block id from a header hash.
    pub fn new(hash: Hash) -> Self {
        Self { hash }
    }
}

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Chain identifier.
    pub chain_id: String,
    /// Block height.
    pub height: u64,
    /// Block timestamp.
    pub time: DateTime<Utc>,
    /// Id of the previous block.
    pub last_block_id: BlockId,
    /// Hash of the previous block's commit.
    pub last_commit_hash: Hash,
    /// Merkle root of the block data.
    pub data_hash: Hash,
    /// Hash of the validator set signing this block.
    pub validators_hash: Hash,
    /// Hash of the validator set for the next block.
    pub next_validators_hash: Hash,
    /// Application state hash after the previous block.
    pub app_hash: Hash,
    /// Address of the block proposer.
    pub proposer_address: Vec<u8>,
}

impl Header {
    /// Deterministic hash of the header.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update((self.chain_id.len() as u64).to_be_bytes());
        hasher.update(self.chain_id.as_bytes());
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.time.timestamp_micros().to_be_bytes());
        hasher.update(self.last_block_id.hash.as_bytes());
        hasher.update(self.last_commit_hash.as_bytes());
        hasher.update(self.data_hash.as_bytes());
        hasher.update(self.validators_hash.as_bytes());
        hasher.update(self.next_validators_hash.as_bytes());
        hasher.update(self.app_hash.as_bytes());
        hasher.update(&self.proposer_address);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Hash::from_bytes(bytes)
    }
}

/// A single validator signature within a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSig {
    /// Address of the signing validator.
    pub validator_address: Vec<u8>,
    /// Time the vote was cast.
    pub timestamp: DateTime<Utc>,
    /// Signature bytes (empty for absent votes).
    pub signature: Vec<u8>,
}

/// Commit: the set of precommits that finalized a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Height the commit is for.
    pub height: u64,
    /// Id of the committed block.
    pub block_id: BlockId,
    /// Precommit signatures.
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    /// Addresses of validators that signed this commit.
    pub fn signer_addresses(&self) -> Vec<&[u8]> {
        self.signatures
            .iter()
            .filter(|s| !s.signature.is_empty())
            .map(|s| s.validator_address.as_slice())
            .collect()
    }
}

/// A header together with the commit that finalized it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHeader {
    /// The block header.
    pub header: Header,
    /// Commit for the header.
    pub commit: Commit,
}

impl SignedHeader {
    /// Structural self-consistency check.
    pub fn validate_basic(&self, chain_id: &str) -> Result<(), ValidationError> {
        if self.header.chain_id != chain_id {
            return Err(ValidationError::ChainIdMismatch {
                expected: chain_id.to_string(),
                got: self.header.chain_id.clone(),
            });
        }
        if self.header.height == 0 {
            return Err(ValidationError::ZeroHeight);
        }
        if self.commit.height != self.header.height {
            return Err(ValidationError::CommitHeightMismatch {
                header: self.header.height,
                commit: self.commit.height,
            });
        }
        if self.commit.block_id.hash != self.header.hash() {
            return Err(ValidationError::CommitHashMismatch);
        }
        if self.commit.signatures.is_empty() {
            return Err(ValidationError::EmptyCommit);
        }
        Ok(())
    }
}

/// A signed header plus its validator set, sufficient for light verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightBlock {
    /// The signed header.
    pub signed_header: SignedHeader,
    /// Validator set whose hash appears in the header.
    pub validator_set: ValidatorSet,
}

impl LightBlock {
    /// Height of the block.
    pub fn height(&self) -> u64 {
        self.signed_header.header.height
    }

    /// Timestamp of the block.
    pub fn time(&self) -> DateTime<Utc> {
        self.signed_header.header.time
    }

    /// Hash of the block header.
    pub fn hash(&self) -> Hash {
        self.signed_header.header.hash()
    }

    /// Structural self-consistency check: the signed header checks out and
    /// the attached validator set matches the header's validators hash.
    pub fn validate_basic(&self, chain_id: &str) -> Result<(), ValidationError> {
        self.signed_header.validate_basic(chain_id)?;
        if self.validator_set.is_empty() {
            return Err(ValidationError::EmptyValidatorSet);
        }
        if self.validator_set.validators.iter().any(|v| v.voting_power == 0) {
            return Err(ValidationError::ZeroVotingPower);
        }
        if self.validator_set.hash() != self.signed_header.header.validators_hash {
            return Err(ValidationError::ValidatorSetHashMismatch);
        }
        Ok(())
    }
}

/// Compact block metadata held by the block store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Id of the block.
    pub block_id: BlockId,
    /// The block header.
    pub header: Header,
}

/// Structural validation failure for headers and light blocks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Header carries the wrong chain id.
    #[error("wrong chain id: expected {expected}, got {got}")]
    ChainIdMismatch {
        /// Expected chain id.
        expected: String,
        /// Chain id found in the header.
        got: String,
    },
    /// Heights start at 1.
    #[error("height must be >= 1")]
    ZeroHeight,
    /// Commit height differs from the header height.
    #[error("commit height {commit} does not match header height {header}")]
    CommitHeightMismatch {
        /// Header height.
        header: u64,
        /// Commit height.
        commit: u64,
    },
    /// Commit block id differs from the header hash.
    #[error("commit block id does not match header hash")]
    CommitHashMismatch,
    /// Commit carries no signatures.
    #[error("commit has no signatures")]
    EmptyCommit,
    /// Light block carries no validators.
    #[error("validator set is empty")]
    EmptyValidatorSet,
    /// Validators must have non-zero power.
    #[error("validator with zero voting power")]
    ZeroVotingPower,
    /// Validator set hash differs from the header's validators hash.
    #[error("validator set does not match header validators hash")]
    ValidatorSetHashMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Validator;

    fn test_validators() -> ValidatorSet {
        ValidatorSet::new(vec![
            Validator::new(vec![1; 20], vec![1; 32], 10),
            Validator::new(vec![2; 20], vec![2; 32], 10),
        ])
    }

    fn test_light_block(chain_id: &str, height: u64) -> LightBlock {
        let vals = test_validators();
        let header = Header {
            chain_id: chain_id.to_string(),
            height,
            time: Utc::now(),
            last_block_id: BlockId::new(Hash::repeat_byte(0xaa)),
            last_commit_hash: Hash::ZERO,
            data_hash: Hash::ZERO,
            validators_hash: vals.hash(),
            next_validators_hash: vals.hash(),
            app_hash: Hash::repeat_byte(0x01),
            proposer_address: vec![1; 20],
        };
        let commit = Commit {
            height,
            block_id: BlockId::new(header.hash()),
            signatures: vec![CommitSig {
                validator_address: vec![1; 20],
                timestamp: Utc::now(),
                signature: vec![0; 64],
            }],
        };
        LightBlock {
            signed_header: SignedHeader { header, commit },
            validator_set: vals,
        }
    }

    #[test]
    fn test_header_hash_is_deterministic() {
        let lb = test_light_block("test-chain", 5);
        assert_eq!(lb.hash(), lb.signed_header.header.hash());
    }

    #[test]
    fn test_header_hash_covers_fields() {
        let lb = test_light_block("test-chain", 5);
        let mut other = lb.signed_header.header.clone();
        other.app_hash = Hash::repeat_byte(0x02);
        assert_ne!(lb.hash(), other.hash());
    }

    #[test]
    fn test_validate_basic_accepts_consistent_block() {
        let lb = test_light_block("test-chain", 5);
        assert!(lb.validate_basic("test-chain").is_ok());
    }

    #[test]
    fn test_validate_basic_rejects_wrong_chain_id() {
        let lb = test_light_block("test-chain", 5);
        assert!(matches!(
            lb.validate_basic("other-chain"),
            Err(ValidationError::ChainIdMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_basic_rejects_commit_mismatch() {
        let mut lb = test_light_block("test-chain", 5);
        lb.signed_header.commit.block_id = BlockId::new(Hash::repeat_byte(0xff));
        assert_eq!(
            lb.validate_basic("test-chain"),
            Err(ValidationError::CommitHashMismatch)
        );
    }

    #[test]
    fn test_validate_basic_rejects_foreign_validator_set() {
        let mut lb = test_light_block("test-chain", 5);
        lb.validator_set = ValidatorSet::new(vec![Validator::new(vec![9; 20], vec![9; 32], 1)]);
        assert_eq!(
            lb.validate_basic("test-chain"),
            Err(ValidationError::ValidatorSetHashMismatch)
        );
    }

    #[test]
    fn test_bincode_roundtrip() {
        let lb = test_light_block("test-chain", 7);
        let encoded = bincode::serialize(&lb).expect("serialize");
        let decoded: LightBlock = bincode::deserialize(&encoded).expect("deserialize");
        assert_eq!(lb, decoded);
    }
}
