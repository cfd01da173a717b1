//! State sync configuration.

use crate::error::{Result, SyncError};
use crate::light::TrustOptions;
use emberbft_types::Hash;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the state sync reactor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSyncConfig {
    /// Discover state and light blocks via the P2P network instead of RPC.
    #[serde(default)]
    pub use_p2p: bool,
    /// RPC endpoints used by the RPC state provider when `use_p2p` is off.
    #[serde(default)]
    pub rpc_servers: Vec<String>,
    /// Height of the trusted header.
    pub trust_height: u64,
    /// Hex-encoded hash of the trusted header.
    pub trust_hash: String,
    /// How long the trusted header remains usable.
    #[serde(default = "defaults::trust_period")]
    pub trust_period: Duration,
    /// How long to wait for snapshot advertisements per discovery attempt.
    #[serde(default = "defaults::discovery_time")]
    pub discovery_time: Duration,
    /// Scratch directory for in-progress snapshot restores. Falls back to
    /// the system temp directory when unset.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Number of concurrent backfill fetchers.
    #[serde(default = "defaults::fetchers")]
    pub fetchers: u32,
    /// Number of concurrent chunk fetchers.
    #[serde(default = "defaults::fetchers")]
    pub chunk_fetchers: u32,
    /// How long to wait for a requested chunk before re-requesting it.
    #[serde(default = "defaults::chunk_request_timeout")]
    pub chunk_request_timeout: Duration,
}

mod defaults {
    use std::time::Duration;

    pub fn trust_period() -> Duration {
        Duration::from_secs(7 * 24 * 60 * 60)
    }

    pub fn discovery_time() -> Duration {
        Duration::from_secs(15)
    }

    pub fn fetchers() -> u32 {
        4
    }

    pub fn chunk_request_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            use_p2p: false,
            rpc_servers: Vec::new(),
            trust_height: 0,
            trust_hash: String::new(),
            trust_period: defaults::trust_period(),
            discovery_time: defaults::discovery_time(),
            temp_dir: None,
            fetchers: defaults::fetchers(),
            chunk_fetchers: defaults::fetchers(),
            chunk_request_timeout: defaults::chunk_request_timeout(),
        }
    }
}

impl StateSyncConfig {
    /// The trust hash as raw bytes.
    pub fn trust_hash_bytes(&self) -> Result<Hash> {
        self.trust_hash
            .parse()
            .map_err(|e| SyncError::Config(format!("trust_hash: {e}")))
    }

    /// Assemble the light-client trust anchor.
    pub fn trust_options(&self) -> Result<TrustOptions> {
        Ok(TrustOptions {
            height: self.trust_height,
            hash: self.trust_hash_bytes()?,
            period: self.trust_period,
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.trust_height == 0 {
            return Err(SyncError::Config("trust_height is required".into()));
        }
        self.trust_hash_bytes()?;
        if !self.use_p2p && self.rpc_servers.len() < 2 {
            return Err(SyncError::Config(
                "at least two rpc_servers are required when use_p2p is off".into(),
            ));
        }
        if self.fetchers == 0 || self.chunk_fetchers == 0 {
            return Err(SyncError::Config("fetchers must be at least 1".into()));
        }
        if self.chunk_request_timeout < Duration::from_secs(5) {
            return Err(SyncError::Config(
                "chunk_request_timeout must be at least 5s".into(),
            ));
        }
        Ok(())
    }
}
