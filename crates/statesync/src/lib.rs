//! State sync for EmberBFT.
//!
//! Brings a freshly started node up to a recent height by discovering and
//! restoring a consensus-verified application snapshot from peers, then
//! backfilling a bounded window of historical light blocks behind the
//! snapshot height. The same reactor also serves snapshots, chunks, light
//! blocks and consensus params to syncing peers.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod chunks;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod light;
pub mod metrics;
pub mod network;
pub mod peers;
pub mod pool;
pub mod protocol;
pub mod provider;
pub mod queue;
pub mod store;

mod reactor;
mod syncer;

pub use app::{ApplyChunkResponse, ApplyResult, MockSnapshotApp, OfferResult, SnapshotConn};
pub use config::StateSyncConfig;
pub use dispatcher::Dispatcher;
pub use error::{Result, SyncError};
pub use network::{Channel, ChannelHandle, Envelope, NodeId, PeerError, PeerStatus, PeerUpdate};
pub use pool::Snapshot;
pub use protocol::Message;
pub use provider::{P2pStateProvider, RpcStateProvider, StateProvider, StaticStateProvider};
pub use reactor::{Reactor, ReactorChannels};
pub use store::{BlockStore, MemoryBlockStore, MemoryStateStore, StateStore};
pub use syncer::Syncer;
