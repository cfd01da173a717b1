//! Validator types.

use crate::Hash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A validator in the consensus network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Validator address (20 bytes).
    pub address: Vec<u8>,
    /// Public key bytes.
    pub pub_key: Vec<u8>,
    /// Voting power.
    pub voting_power: u64,
}

impl Validator {
    /// Create a new validator.
    pub fn new(address: Vec<u8>, pub_key: Vec<u8>, voting_power: u64) -> Self {
        Self {
            address,
            pub_key,
            voting_power,
        }
    }
}

/// Set of validators active at some height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    /// Validators, ordered by address.
    pub validators: Vec<Validator>,
}

impl ValidatorSet {
    /// Create a new validator set, sorting validators by address.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        Self { validators }
    }

    /// Total voting power of the set.
    pub fn total_voting_power(&self) -> u64 {
        self.validators.iter().map(|v| v.voting_power).sum()
    }

    /// Quorum threshold (2f+1 out of the total power).
    pub fn quorum_power(&self) -> u64 {
        let total = self.total_voting_power();
        if total == 0 {
            return 0;
        }
        let f = (total - 1) / 3;
        2 * f + 1
    }

    /// Deterministic hash over the ordered validator entries.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        for v in &self.validators {
            hasher.update((v.address.len() as u64).to_be_bytes());
            hasher.update(&v.address);
            hasher.update((v.pub_key.len() as u64).to_be_bytes());
            hasher.update(&v.pub_key);
            hasher.update(v.voting_power.to_be_bytes());
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Hash::from_bytes(bytes)
    }

    /// Voting power of the given addresses within this set.
    pub fn power_of(&self, addresses: &[&[u8]]) -> u64 {
        self.validators
            .iter()
            .filter(|v| addresses.iter().any(|a| *a == v.address.as_slice()))
            .map(|v| v.voting_power)
            .sum()
    }

    /// Check if the address belongs to the set.
    pub fn contains(&self, address: &[u8]) -> bool {
        self.validators.iter().any(|v| v.address == address)
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// True if the set has no validators.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}
