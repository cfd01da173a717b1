//! Light-client verification seam.
//!
//! State providers need a trusted header at arbitrary heights. Block sources
//! supply candidate light blocks; the [`Verifier`] decides whether a
//! candidate extends trust from an already-trusted block. The bundled
//! [`SkippingVerifier`] performs the structural half of skipping
//! verification (trust period, validator-set linkage, commit quorum and
//! trusted-set overlap); signature checking belongs to the crypto layer
//! behind this trait.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use emberbft_types::{Hash, LightBlock};
use std::time::Duration;

/// Operator-supplied trust anchor for light verification.
#[derive(Debug, Clone)]
pub struct TrustOptions {
    /// Height of the trusted header.
    pub height: u64,
    /// Hash of the trusted header.
    pub hash: Hash,
    /// How long a trusted header remains usable.
    pub period: Duration,
}

/// A source of light blocks, typically one peer or one RPC endpoint.
#[async_trait]
pub trait LightBlockSource: Send + Sync {
    /// Identifier of the source, for logging and rotation.
    fn id(&self) -> &str;

    /// Fetch the light block at `height`.
    async fn light_block(&self, height: u64) -> Result<LightBlock>;
}

/// Decides whether an untrusted light block extends trust from a trusted one.
pub trait Verifier: Send + Sync {
    /// Verify `untrusted` against `trusted` as of `now`.
    fn verify(&self, trusted: &LightBlock, untrusted: &LightBlock, now: DateTime<Utc>) -> Result<()>;
}

/// Structural skipping verification.
pub struct SkippingVerifier {
    trust_period: Duration,
}

impl SkippingVerifier {
    /// Create a verifier with the given trust period.
    pub fn new(trust_period: Duration) -> Self {
        Self { trust_period }
    }
}

impl Verifier for SkippingVerifier {
    fn verify(&self, trusted: &LightBlock, untrusted: &LightBlock, now: DateTime<Utc>) -> Result<()> {
        let age = now.signed_duration_since(trusted.time());
        if age.to_std().map_or(false, |age| age > self.trust_period) {
            return Err(SyncError::Light(format!(
                "trusted header at height {} is outside the trust period",
                trusted.height()
            )));
        }

        if untrusted.height() == trusted.height() {
            if untrusted.hash() != trusted.hash() {
                return Err(SyncError::Light(format!(
                    "conflicting header at trusted height {}",
                    trusted.height()
                )));
            }
            return Ok(());
        }
        if untrusted.height() < trusted.height() {
            return Err(SyncError::Light(format!(
                "target height {} is below the trusted height {}",
                untrusted.height(),
                trusted.height()
            )));
        }
        if untrusted.time() <= trusted.time() {
            return Err(SyncError::Light(
                "header time does not advance past the trusted header".into(),
            ));
        }

        // the untrusted block's own validator set must have committed it
        let untrusted_header = &untrusted.signed_header.header;
        let signers = untrusted.signed_header.commit.signer_addresses();
        let signed_power = untrusted.validator_set.power_of(&signers);
        if signed_power < untrusted.validator_set.quorum_power() {
            return Err(SyncError::Light(format!(
                "commit at height {} signed by {signed_power} power, quorum is {}",
                untrusted.height(),
                untrusted.validator_set.quorum_power()
            )));
        }

        if untrusted.height() == trusted.height() + 1 {
            // sequential case: the next validator set was committed to by the
            // trusted header
            if untrusted_header.validators_hash
                != trusted.signed_header.header.next_validators_hash
            {
                return Err(SyncError::Light(format!(
                    "validator set at height {} does not match the trusted next validators hash",
                    untrusted.height()
                )));
            }
            return Ok(());
        }

        // skipping case: more than a third of the trusted validator set must
        // have signed the untrusted commit
        let trusted_overlap = trusted.validator_set.power_of(&signers);
        let trust_threshold = trusted.validator_set.total_voting_power() / 3 + 1;
        if trusted_overlap < trust_threshold {
            return Err(SyncError::Light(format!(
                "only {trusted_overlap} trusted power signed height {}, need {trust_threshold}",
                untrusted.height()
            )));
        }
        Ok(())
    }
}
