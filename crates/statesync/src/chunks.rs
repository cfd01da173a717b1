//! Chunk queue for an in-progress snapshot restore.
//!
//! Received chunk bodies are spooled to files in a scratch directory rather
//! than held in memory; the queue owns the directory and removes it when
//! dropped. Fetchers `allocate` the lowest pending index, peers deliver via
//! `add`, and the apply loop drains `next` which yields chunks in strictly
//! increasing index order regardless of arrival order.

use crate::error::{Result, SyncError};
use crate::network::NodeId;
use crate::pool::Snapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::sync::Notify;
use tracing::debug;

/// A single snapshot chunk in transit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Snapshot height.
    pub height: u64,
    /// Snapshot format.
    pub format: u32,
    /// Chunk index within the snapshot.
    pub index: u32,
    /// Chunk payload.
    pub chunk: Vec<u8>,
    /// Peer the chunk came from.
    pub sender: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkStatus {
    /// Not yet requested (or discarded for refetch).
    Pending,
    /// Requested from a peer, awaiting delivery.
    InFlight,
    /// On disk, awaiting application.
    Received,
    /// Accepted by the application.
    Applied,
}

struct Inner {
    status: Vec<ChunkStatus>,
    senders: HashMap<u32, NodeId>,
    closed: bool,
}

/// Queue of chunks for one snapshot restore.
pub struct ChunkQueue {
    snapshot: Snapshot,
    dir: TempDir,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl ChunkQueue {
    /// Create a queue for `snapshot`, spooling chunk bodies under
    /// `temp_dir` (the system temp directory when `None`).
    pub fn new(snapshot: Snapshot, temp_dir: Option<&Path>) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("emberbft-statesync-");
            b
        };
        let dir = match temp_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| SyncError::Store(format!("chunk scratch dir: {e}")))?;

        let chunks = snapshot.chunks as usize;
        Ok(Self {
            snapshot,
            dir,
            inner: Mutex::new(Inner {
                status: vec![ChunkStatus::Pending; chunks],
                senders: HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// The snapshot this queue belongs to.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Number of chunks in the snapshot.
    pub fn chunk_count(&self) -> u32 {
        self.snapshot.chunks
    }

    fn chunk_path(&self, index: u32) -> PathBuf {
        self.dir.path().join(format!("chunk-{index:06}"))
    }

    /// Claim the lowest pending chunk index for fetching.
    pub fn allocate(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        let index = inner
            .status
            .iter()
            .position(|s| *s == ChunkStatus::Pending)?;
        inner.status[index] = ChunkStatus::InFlight;
        Some(index as u32)
    }

    /// Return an in-flight chunk to pending after a failed or timed-out
    /// request.
    pub fn unallocate(&self, index: u32) {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.status.get_mut(index as usize) {
            if *status == ChunkStatus::InFlight {
                *status = ChunkStatus::Pending;
            }
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Store a delivered chunk.
    ///
    /// Returns false for duplicates of already stored chunks. Chunks for the
    /// wrong snapshot or with an out-of-range index are rejected as invalid
    /// messages.
    pub fn add(&self, chunk: Chunk) -> Result<bool> {
        if chunk.height != self.snapshot.height || chunk.format != self.snapshot.format {
            return Err(SyncError::invalid_message(
                chunk.sender,
                "chunk does not belong to the snapshot under restore",
            ));
        }
        if chunk.index >= self.snapshot.chunks {
            return Err(SyncError::invalid_message(
                chunk.sender,
                format!(
                    "chunk index {} out of range (snapshot has {} chunks)",
                    chunk.index, self.snapshot.chunks
                ),
            ));
        }

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(false);
            }
            match inner.status[chunk.index as usize] {
                ChunkStatus::Received | ChunkStatus::Applied => return Ok(false),
                ChunkStatus::Pending | ChunkStatus::InFlight => {}
            }
            fs::write(self.chunk_path(chunk.index), &chunk.chunk)
                .map_err(|e| SyncError::Store(format!("spool chunk {}: {e}", chunk.index)))?;
            inner.status[chunk.index as usize] = ChunkStatus::Received;
            inner.senders.insert(chunk.index, chunk.sender);
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    /// Wait until the chunk at `index` has been delivered.
    ///
    /// Returns false if the queue is closed first.
    pub async fn wait_received(&self, index: u32) -> bool {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock();
                if inner.closed {
                    return false;
                }
                match inner.status.get(index as usize) {
                    Some(ChunkStatus::Received) | Some(ChunkStatus::Applied) => return true,
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Next chunk for the application, in strictly increasing index order.
    ///
    /// Waits until the lowest unapplied index has been delivered. Returns
    /// `Ok(None)` once every chunk has been applied and `Err(Canceled)` if
    /// the queue is closed mid-restore.
    pub async fn next(&self) -> Result<Option<Chunk>> {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock();
                if inner.closed {
                    return Err(SyncError::Canceled);
                }
                let lowest = inner
                    .status
                    .iter()
                    .position(|s| *s != ChunkStatus::Applied);
                match lowest {
                    None => return Ok(None),
                    Some(index) if inner.status[index] == ChunkStatus::Received => {
                        let index = index as u32;
                        let sender = inner.senders.get(&index).cloned().unwrap_or_default();
                        drop(inner);
                        let body = fs::read(self.chunk_path(index)).map_err(|e| {
                            SyncError::Store(format!("read chunk {index}: {e}"))
                        })?;
                        return Ok(Some(Chunk {
                            height: self.snapshot.height,
                            format: self.snapshot.format,
                            index,
                            chunk: body,
                            sender,
                        }));
                    }
                    Some(_) => {}
                }
            }
            notified.await;
        }
    }

    /// Record that the application accepted the chunk at `index`.
    pub fn mark_applied(&self, index: u32) {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.status.get_mut(index as usize) {
            *status = ChunkStatus::Applied;
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Drop the chunk at `index` so it is fetched and applied again.
    pub fn discard(&self, index: u32) {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.status.get_mut(index as usize) {
            debug!(index, "discarding chunk for refetch");
            *status = ChunkStatus::Pending;
            inner.senders.remove(&index);
            let _ = fs::remove_file(self.chunk_path(index));
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Discard every unapplied chunk delivered by `sender`.
    pub fn discard_sender(&self, sender: &str) {
        let indexes: Vec<u32> = {
            let inner = self.inner.lock();
            inner
                .senders
                .iter()
                .filter(|(index, peer)| {
                    peer.as_str() == sender
                        && inner.status[**index as usize] == ChunkStatus::Received
                })
                .map(|(index, _)| *index)
                .collect()
        };
        for index in indexes {
            self.discard(index);
        }
    }

    /// Peer that delivered the chunk at `index`, if any.
    pub fn sender_of(&self, index: u32) -> Option<NodeId> {
        self.inner.lock().senders.get(&index).cloned()
    }

    /// True once every chunk has been applied.
    pub fn is_complete(&self) -> bool {
        self.inner
            .lock()
            .status
            .iter()
            .all(|s| *s == ChunkStatus::Applied)
    }

    /// Close the queue, waking all waiters with a cancellation.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberbft_types::Hash;
    use std::sync::Arc;
    use std::time::Duration;

    fn snapshot(chunks: u32) -> Snapshot {
        Snapshot {
            height: 100,
            format: 1,
            chunks,
            hash: Hash::repeat_byte(0xab),
            metadata: vec![],
        }
    }

    fn chunk(index: u32, sender: &str) -> Chunk {
        Chunk {
            height: 100,
            format: 1,
            index,
            chunk: vec![index as u8; 8],
            sender: sender.to_string(),
        }
    }

    #[tokio::test]
    async fn test_allocate_lowest_pending_first() {
        let q = ChunkQueue::new(snapshot(3), None).expect("queue");
        assert_eq!(q.allocate(), Some(0));
        assert_eq!(q.allocate(), Some(1));
        assert_eq!(q.allocate(), Some(2));
        assert_eq!(q.allocate(), None);

        q.unallocate(1);
        assert_eq!(q.allocate(), Some(1));
    }

    #[tokio::test]
    async fn test_next_delivers_in_index_order() {
        let q = ChunkQueue::new(snapshot(3), None).expect("queue");

        // arrive out of order
        q.add(chunk(2, "a")).expect("add");
        q.add(chunk(0, "b")).expect("add");
        q.add(chunk(1, "c")).expect("add");

        for expected in 0..3u32 {
            let c = q.next().await.expect("next").expect("chunk");
            assert_eq!(c.index, expected);
            assert_eq!(c.chunk, vec![expected as u8; 8]);
            q.mark_applied(expected);
        }
        assert!(q.next().await.expect("next").is_none());
        assert!(q.is_complete());
    }

    #[tokio::test]
    async fn test_next_waits_for_lowest_unapplied() {
        let q = Arc::new(ChunkQueue::new(snapshot(2), None).expect("queue"));
        q.add(chunk(1, "a")).expect("add");

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        q.add(chunk(0, "b")).expect("add");
        let c = waiter.await.expect("join").expect("next").expect("chunk");
        assert_eq!(c.index, 0);
    }

    #[tokio::test]
    async fn test_discard_triggers_redelivery_after_later_chunks() {
        let q = ChunkQueue::new(snapshot(5), None).expect("queue");
        for i in 0..5 {
            q.add(chunk(i, "a")).expect("add");
        }
        for i in 0..5u32 {
            let c = q.next().await.expect("next").expect("chunk");
            assert_eq!(c.index, i);
            if i < 4 {
                q.mark_applied(i);
            }
        }

        // index 4 not applied; app asked to refetch index 2
        q.discard(2);
        q.add(chunk(2, "b")).expect("add");

        let c = q.next().await.expect("next").expect("chunk");
        assert_eq!(c.index, 2);
        q.mark_applied(2);

        let c = q.next().await.expect("next").expect("chunk");
        assert_eq!(c.index, 4);
        q.mark_applied(4);
        assert!(q.next().await.expect("next").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_add_is_ignored() {
        let q = ChunkQueue::new(snapshot(2), None).expect("queue");
        assert!(q.add(chunk(0, "a")).expect("add"));
        assert!(!q.add(chunk(0, "b")).expect("add"));
        assert_eq!(q.sender_of(0).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_foreign_chunks_are_rejected() {
        let q = ChunkQueue::new(snapshot(2), None).expect("queue");

        let mut wrong_height = chunk(0, "a");
        wrong_height.height = 99;
        assert!(q.add(wrong_height).is_err());

        assert!(q.add(chunk(7, "a")).is_err());
    }

    #[tokio::test]
    async fn test_discard_sender_drops_unapplied_chunks() {
        let q = ChunkQueue::new(snapshot(3), None).expect("queue");
        q.add(chunk(0, "bad")).expect("add");
        q.add(chunk(1, "bad")).expect("add");
        q.add(chunk(2, "good")).expect("add");

        let c = q.next().await.expect("next").expect("chunk");
        assert_eq!(c.index, 0);
        q.mark_applied(0);

        q.discard_sender("bad");
        // chunk 0 stays applied, chunk 1 is pending again
        assert_eq!(q.allocate(), Some(1));
        assert_eq!(q.sender_of(1), None);
        assert_eq!(q.sender_of(2).as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn test_close_cancels_waiters() {
        let q = Arc::new(ChunkQueue::new(snapshot(1), None).expect("queue"));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert!(matches!(
            waiter.await.expect("join"),
            Err(SyncError::Canceled)
        ));
        assert!(!q.wait_received(0).await);
    }
}
