//! State sync error types.

use crate::network::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for state sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// State sync error categories.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    // === Network Errors ===
    /// Transport-level failure (channel closed, send failed).
    #[error("transport error: {0}")]
    Transport(String),

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Peer sent a message we could not make sense of.
    #[error("invalid message from peer {peer}: {reason}")]
    InvalidMessage {
        /// Peer that sent the message.
        peer: NodeId,
        /// Why the message was rejected.
        reason: String,
    },

    /// No peers are currently connected.
    #[error("no connected peers")]
    NoConnectedPeers,

    /// Peer does not have the requested data.
    #[error("peer {peer} does not have a light block at height {height}")]
    PeerMissingData {
        /// Peer that was asked.
        peer: NodeId,
        /// Requested height.
        height: u64,
    },

    /// A light block request is already outstanding.
    #[error("a light block request is already pending")]
    Pending,

    // === Verification Errors ===
    /// Light block failed structural validation or hash linkage.
    #[error("invalid light block: {0}")]
    InvalidBlock(String),

    /// Light-client verification failure.
    #[error("light client verification failed: {0}")]
    Light(String),

    // === Application Verdicts ===
    /// Application aborted the snapshot sync.
    #[error("snapshot sync aborted by application")]
    AppAbort,

    /// Application returned an unexpected response.
    #[error("unexpected application response: {0}")]
    App(String),

    /// Application rejected the offered snapshot.
    #[error("snapshot rejected by application")]
    SnapshotRejected,

    /// Application rejected the snapshot format.
    #[error("snapshot format rejected by application")]
    FormatRejected,

    /// Application rejected the peers that advertised the snapshot.
    #[error("snapshot senders rejected by application")]
    SenderRejected,

    /// Application asked for the snapshot to be restarted.
    #[error("snapshot restore must be restarted")]
    SnapshotRetry,

    /// No eligible snapshot is currently known.
    #[error("no eligible snapshots advertised")]
    NoSnapshots,

    // === Backfill ===
    /// A height ran out of fetch retries.
    #[error("height {height} exhausted {attempts} fetch retries")]
    RetriesExhausted {
        /// Height that could not be fetched.
        height: u64,
        /// Number of attempts made.
        attempts: u32,
    },

    // === Lifecycle ===
    /// Another state sync is already running.
    #[error("a state sync is already in progress")]
    SyncInProgress,

    /// The state provider could not be reached.
    #[error("state provider unreachable: {0}")]
    StateProviderUnreachable(String),

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Canceled,

    /// A message handler panicked.
    #[error("panic in message handler: {0}")]
    Panic(String),

    // === Local Failures ===
    /// Store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Create an invalid-message error.
    pub fn invalid_message(peer: impl Into<NodeId>, reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-block error.
    pub fn invalid_block(reason: impl Into<String>) -> Self {
        Self::InvalidBlock(reason.into())
    }

    /// Fetch-level errors feed retry logic and never fail the sync.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Timeout(_)
                | Self::NoConnectedPeers
                | Self::PeerMissingData { .. }
                | Self::Pending
        )
    }

    /// Errors that warrant reporting the peer on the channel's error side.
    pub fn is_peer_fault(&self) -> bool {
        matches!(self, Self::InvalidBlock(_) | Self::InvalidMessage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = SyncError::Timeout(Duration::from_secs(10));
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn test_invalid_message_constructor() {
        let err = SyncError::invalid_message("peer1", "unknown variant");
        match err {
            SyncError::InvalidMessage { peer, reason } => {
                assert_eq!(peer, "peer1");
                assert_eq!(reason, "unknown variant");
            }
            other => panic!("expected InvalidMessage, got {other:?}"),
        }
    }

    #[test]
    fn test_retriable_classification() {
        assert!(SyncError::Timeout(Duration::from_secs(1)).is_retriable());
        assert!(SyncError::NoConnectedPeers.is_retriable());
        assert!(SyncError::PeerMissingData {
            peer: "p".to_string(),
            height: 10,
        }
        .is_retriable());

        assert!(!SyncError::AppAbort.is_retriable());
        assert!(!SyncError::invalid_block("bad hash").is_retriable());
        assert!(!SyncError::RetriesExhausted {
            height: 10,
            attempts: 20,
        }
        .is_retriable());
    }

    #[test]
    fn test_peer_fault_classification() {
        assert!(SyncError::invalid_block("hash mismatch").is_peer_fault());
        assert!(SyncError::invalid_message("p", "r").is_peer_fault());
        assert!(!SyncError::Timeout(Duration::from_secs(1)).is_peer_fault());
        assert!(!SyncError::SyncInProgress.is_peer_fault());
    }
}
