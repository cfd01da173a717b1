//! Light block request/response dispatcher.
//!
//! Turns "give me the light block at height H from peer P" into a single
//! awaitable call, multiplexed over the light block gossip channel. One
//! request is in flight dispatcher-wide; callers that lose the race get
//! [`SyncError::Pending`] and decide for themselves whether to back off.

use crate::error::{Result, SyncError};
use crate::network::{Envelope, NodeId};
use crate::protocol::Message;
use emberbft_types::LightBlock;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long callers should wait for a peer to return a light block.
pub const LIGHT_BLOCK_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingRequest {
    id: u64,
    height: u64,
    peer: NodeId,
    reply: oneshot::Sender<Option<LightBlock>>,
}

/// Multiplexer for light block requests over the gossip channel.
pub struct Dispatcher {
    out: mpsc::Sender<Envelope>,
    pending: Mutex<Option<PendingRequest>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher writing requests to the light block channel's
    /// outbound queue.
    pub fn new(out: mpsc::Sender<Envelope>) -> Self {
        Self {
            out,
            pending: Mutex::new(None),
            next_id: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Request the light block at `height` from `peer` and wait for the
    /// response.
    ///
    /// Returns `Ok(None)` when the peer answered that it does not have the
    /// block. Fails with [`SyncError::NoConnectedPeers`] for the empty-peer
    /// sentinel, [`SyncError::Pending`] when another request is outstanding,
    /// and [`SyncError::Canceled`] when `token` fires or the dispatcher is
    /// closed. The request slot is released on every exit path, including
    /// the caller dropping the future.
    pub async fn light_block(
        &self,
        token: &CancellationToken,
        height: u64,
        peer: NodeId,
    ) -> Result<Option<LightBlock>> {
        if peer.is_empty() {
            return Err(SyncError::NoConnectedPeers);
        }
        if self.closed.is_cancelled() {
            return Err(SyncError::Canceled);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut slot = self.pending.lock();
            if slot.is_some() {
                return Err(SyncError::Pending);
            }
            *slot = Some(PendingRequest {
                id,
                height,
                peer: peer.clone(),
                reply: reply_tx,
            });
        }
        let _guard = SlotGuard {
            pending: &self.pending,
            id,
        };

        if self
            .out
            .send(Envelope::addressed(
                peer,
                Message::LightBlockRequest { height },
            ))
            .await
            .is_err()
        {
            return Err(SyncError::Transport("light block channel closed".into()));
        }

        tokio::select! {
            res = reply_rx => res.map_err(|_| SyncError::Canceled),
            _ = self.closed.cancelled() => Err(SyncError::Canceled),
            _ = token.cancelled() => Err(SyncError::Canceled),
        }
    }

    /// Deliver an inbound light block response to the outstanding request.
    ///
    /// Responses arriving with no request outstanding are dropped. The
    /// response's sender is deliberately not matched against the requested
    /// peer: the consumers re-validate every block, so a forged response
    /// costs wasted cycles only.
    pub fn respond(&self, block: Option<LightBlock>, from: NodeId) {
        let Some(req) = self.pending.lock().take() else {
            debug!(peer = %from, "dropping unsolicited light block response");
            return;
        };
        debug!(
            peer = %req.peer,
            from = %from,
            height = req.height,
            "delivering light block response"
        );
        let _ = req.reply.send(block);
    }

    /// Shut the dispatcher down, unblocking any outstanding call with a
    /// cancellation error.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Clears the request slot when the owning call exits, but only if the slot
/// still holds that call's request (a response may already have consumed it,
/// and a subsequent caller may have installed a fresh one).
struct SlotGuard<'a> {
    pending: &'a Mutex<Option<PendingRequest>>,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.pending.lock();
        if slot.as_ref().map(|r| r.id) == Some(self.id) {
            *slot = None;
        }
    }
}
