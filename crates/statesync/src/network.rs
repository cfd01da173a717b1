//! Channel plumbing between the reactor and the peer-to-peer transport.
//!
//! The transport itself lives elsewhere; this module provides the
//! channel-pair abstraction it plugs into. Each wire channel is a bounded
//! pair of mpsc queues (inbound envelopes, outbound envelopes) plus an error
//! stream on which the reactor reports misbehaving peers.

use crate::error::SyncError;
use crate::protocol::Message;
use tokio::sync::mpsc;

/// Identifier of a connected peer.
pub type NodeId = String;

/// Capacity of each channel's inbound buffer.
pub const RECV_BUFFER_CAPACITY: usize = 128;

/// Capacity of the peer-error stream.
pub const ERROR_QUEUE_CAPACITY: usize = 16;

/// Capacity of the peer-update stream.
pub const PEER_UPDATE_CAPACITY: usize = 64;

/// Snapshot metadata channel.
pub const SNAPSHOT_CHANNEL: u8 = 0x60;

/// Snapshot chunk channel.
pub const CHUNK_CHANNEL: u8 = 0x61;

/// Light block channel.
pub const LIGHT_BLOCK_CHANNEL: u8 = 0x62;

/// Consensus params channel.
pub const PARAMS_CHANNEL: u8 = 0x63;

/// Static description of a wire channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDescriptor {
    /// Channel byte id.
    pub id: u8,
    /// Relative send priority.
    pub priority: u8,
    /// Outbound queue capacity.
    pub send_queue_capacity: usize,
    /// Inbound buffer capacity.
    pub recv_buffer_capacity: usize,
    /// Maximum message size in bytes.
    pub max_msg_size: usize,
}

/// Descriptor for a state sync channel id.
///
/// Returns `None` for ids outside `0x60..=0x63`.
pub fn channel_descriptor(id: u8) -> Option<ChannelDescriptor> {
    let desc = match id {
        SNAPSHOT_CHANNEL => ChannelDescriptor {
            id,
            priority: 6,
            send_queue_capacity: 10,
            recv_buffer_capacity: RECV_BUFFER_CAPACITY,
            max_msg_size: 4_000_000,
        },
        CHUNK_CHANNEL => ChannelDescriptor {
            id,
            priority: 3,
            send_queue_capacity: 4,
            recv_buffer_capacity: RECV_BUFFER_CAPACITY,
            max_msg_size: 16_000_000,
        },
        LIGHT_BLOCK_CHANNEL => ChannelDescriptor {
            id,
            priority: 5,
            send_queue_capacity: 10,
            recv_buffer_capacity: RECV_BUFFER_CAPACITY,
            max_msg_size: 10_000_000,
        },
        PARAMS_CHANNEL => ChannelDescriptor {
            id,
            priority: 2,
            send_queue_capacity: 10,
            recv_buffer_capacity: RECV_BUFFER_CAPACITY,
            max_msg_size: 100_000,
        },
        _ => return None,
    };
    Some(desc)
}

/// A message together with its routing information.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Peer the message came from (empty on outbound envelopes).
    pub from: NodeId,
    /// Recipient; `None` means broadcast to all connected peers.
    pub to: Option<NodeId>,
    /// The wire message.
    pub message: Message,
}

impl Envelope {
    /// Outbound envelope addressed to a specific peer.
    pub fn addressed(to: impl Into<NodeId>, message: Message) -> Self {
        Self {
            from: NodeId::new(),
            to: Some(to.into()),
            message,
        }
    }

    /// Outbound broadcast envelope.
    pub fn broadcast(message: Message) -> Self {
        Self {
            from: NodeId::new(),
            to: None,
            message,
        }
    }

    /// Inbound envelope received from a peer.
    pub fn received(from: impl Into<NodeId>, message: Message) -> Self {
        Self {
            from: from.into(),
            to: None,
            message,
        }
    }
}

/// Report of a misbehaving peer, emitted on a channel's error stream.
#[derive(Debug, Clone)]
pub struct PeerError {
    /// The offending peer.
    pub peer: NodeId,
    /// What went wrong.
    pub error: SyncError,
}

/// Connection status change for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Peer connected.
    Up,
    /// Peer disconnected.
    Down,
}

/// A peer status change delivered to the reactor.
#[derive(Debug, Clone)]
pub struct PeerUpdate {
    /// The peer whose status changed.
    pub peer: NodeId,
    /// New status.
    pub status: PeerStatus,
}

/// Reactor-side end of a wire channel.
pub struct Channel {
    /// Channel byte id.
    pub id: u8,
    /// Inbound envelopes from peers.
    pub rx: mpsc::Receiver<Envelope>,
    /// Outbound envelopes to peers.
    pub tx: mpsc::Sender<Envelope>,
    /// Peer error reports.
    pub errors: mpsc::Sender<PeerError>,
}

/// Transport-side end of a wire channel, used by the network layer (and by
/// tests standing in for it).
pub struct ChannelHandle {
    /// Feed inbound envelopes to the reactor.
    pub tx: mpsc::Sender<Envelope>,
    /// Drain outbound envelopes from the reactor.
    pub rx: mpsc::Receiver<Envelope>,
    /// Drain peer error reports.
    pub errors: mpsc::Receiver<PeerError>,
}

impl Channel {
    /// Create a connected channel pair for the given channel id.
    ///
    /// Buffer sizes follow the channel descriptor; unknown ids fall back to
    /// the default capacities.
    pub fn new(id: u8) -> (Channel, ChannelHandle) {
        let desc = channel_descriptor(id);
        let recv_cap = desc.map_or(RECV_BUFFER_CAPACITY, |d| d.recv_buffer_capacity);
        let send_cap = desc.map_or(10, |d| d.send_queue_capacity);

        let (in_tx, in_rx) = mpsc::channel(recv_cap);
        let (out_tx, out_rx) = mpsc::channel(send_cap);
        let (err_tx, err_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);

        (
            Channel {
                id,
                rx: in_rx,
                tx: out_tx,
                errors: err_tx,
            },
            ChannelHandle {
                tx: in_tx,
                rx: out_rx,
                errors: err_rx,
            },
        )
    }
}
