//! State sync wire messages.
//!
//! One message enum covers the four state sync channels; each variant is
//! only valid on its own channel (see [`Message::channel`]).

use crate::error::{Result, SyncError};
use crate::network::{CHUNK_CHANNEL, LIGHT_BLOCK_CHANNEL, PARAMS_CHANNEL, SNAPSHOT_CHANNEL};
use emberbft_types::{ConsensusParams, Hash, LightBlock};
use serde::{Deserialize, Serialize};

/// Messages exchanged on the state sync channels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // === Snapshot channel (0x60) ===
    /// Ask a peer to advertise its recent snapshots.
    SnapshotsRequest,

    /// Advertise a single snapshot.
    SnapshotsResponse {
        /// Snapshot height.
        height: u64,
        /// Application-defined snapshot format.
        format: u32,
        /// Number of chunks the snapshot is divided into.
        chunks: u32,
        /// Application-defined snapshot hash.
        hash: Hash,
        /// Opaque application metadata.
        metadata: Vec<u8>,
    },

    // === Chunk channel (0x61) ===
    /// Request a single snapshot chunk.
    ChunkRequest {
        /// Snapshot height.
        height: u64,
        /// Snapshot format.
        format: u32,
        /// Chunk index.
        index: u32,
    },

    /// A snapshot chunk, or a marker that the peer does not have it.
    ChunkResponse {
        /// Snapshot height.
        height: u64,
        /// Snapshot format.
        format: u32,
        /// Chunk index.
        index: u32,
        /// Chunk payload (empty when missing).
        chunk: Vec<u8>,
        /// True if the peer does not have the chunk.
        missing: bool,
    },

    // === Light block channel (0x62) ===
    /// Request the light block at a height.
    LightBlockRequest {
        /// Requested height.
        height: u64,
    },

    /// The light block at a height, or `None` if the peer lacks it.
    LightBlockResponse {
        /// The light block, if the peer has it.
        light_block: Option<LightBlock>,
    },

    // === Params channel (0x63) ===
    /// Request the consensus params at a height.
    ParamsRequest {
        /// Requested height.
        height: u64,
    },

    /// Consensus params at a height.
    ParamsResponse {
        /// Height the params are for.
        height: u64,
        /// The consensus params.
        consensus_params: ConsensusParams,
    },
}

impl Message {
    /// Message type name for logging.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::SnapshotsRequest => "SnapshotsRequest",
            Self::SnapshotsResponse { .. } => "SnapshotsResponse",
            Self::ChunkRequest { .. } => "ChunkRequest",
            Self::ChunkResponse { .. } => "ChunkResponse",
            Self::LightBlockRequest { .. } => "LightBlockRequest",
            Self::LightBlockResponse { .. } => "LightBlockResponse",
            Self::ParamsRequest { .. } => "ParamsRequest",
            Self::ParamsResponse { .. } => "ParamsResponse",
        }
    }

    /// The channel this message belongs on.
    pub fn channel(&self) -> u8 {
        match self {
            Self::SnapshotsRequest | Self::SnapshotsResponse { .. } => SNAPSHOT_CHANNEL,
            Self::ChunkRequest { .. } | Self::ChunkResponse { .. } => CHUNK_CHANNEL,
            Self::LightBlockRequest { .. } | Self::LightBlockResponse { .. } => {
                LIGHT_BLOCK_CHANNEL
            }
            Self::ParamsRequest { .. } | Self::ParamsResponse { .. } => PARAMS_CHANNEL,
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SyncError::Transport(format!("encode: {e}")))
    }

    /// Decode from the wire.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| SyncError::Transport(format!("decode: {e}")))
    }
}
