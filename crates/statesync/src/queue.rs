//! Height-ordered work queue for the backfill engine.
//!
//! Backfill walks a range `[stop_height, start_height]` in reverse. Fetchers
//! pull heights from [`BlockQueue::next_height`] in strictly decreasing
//! order (failed heights are re-issued first), deposit fetched blocks with
//! [`BlockQueue::add`], and the verifier drains [`BlockQueue::verify_next`]
//! which hands blocks over in strictly decreasing, consecutive height order
//! no matter the order they arrived in.

use crate::error::SyncError;
use crate::network::NodeId;
use chrono::{DateTime, Utc};
use emberbft_types::LightBlock;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A fetched light block together with the peer that supplied it.
#[derive(Debug, Clone)]
pub struct FetchedBlock {
    /// The light block.
    pub block: LightBlock,
    /// Peer the block came from.
    pub peer: NodeId,
}

/// Descriptor of the block the backfill run terminated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminal {
    /// Height of the terminal block.
    pub height: u64,
    /// Timestamp of the terminal block.
    pub time: DateTime<Utc>,
}

struct Inner {
    initial_height: u64,
    stop_height: u64,
    stop_time: DateTime<Utc>,
    max_retries: u32,

    /// Next fresh height to hand to a fetcher, counting down from the start.
    fetch_height: u64,
    /// Heights whose fetch failed, re-issued highest first.
    failed: BTreeSet<u64>,
    retries: HashMap<u64, u32>,
    /// Fetched blocks awaiting verification, keyed by height.
    fetched: HashMap<u64, FetchedBlock>,
    /// Next height to hand to the verifier.
    verify_height: u64,
    terminal: Option<Terminal>,
    error: Option<SyncError>,
}

/// Work queue for a reverse backfill range.
pub struct BlockQueue {
    inner: Mutex<Inner>,
    fetch_notify: Notify,
    verify_notify: Notify,
    done: CancellationToken,
}

impl BlockQueue {
    /// Create a queue for the range `[stop_height, start_height]`.
    ///
    /// Fetching never goes below `initial_height`. The queue is done once a
    /// block at or below `stop_height` with a timestamp at or before
    /// `stop_time` has been verified, or once any height exhausts
    /// `max_retries`.
    pub fn new(
        start_height: u64,
        stop_height: u64,
        initial_height: u64,
        stop_time: DateTime<Utc>,
        max_retries: u32,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                initial_height,
                stop_height,
                stop_time,
                max_retries,
                fetch_height: start_height,
                failed: BTreeSet::new(),
                retries: HashMap::new(),
                fetched: HashMap::new(),
                verify_height: start_height,
                terminal: None,
                error: None,
            }),
            fetch_notify: Notify::new(),
            verify_notify: Notify::new(),
            done: CancellationToken::new(),
        }
    }

    /// Next height to fetch, in strictly decreasing order with failed
    /// heights re-issued first. Blocks while no height is available and
    /// returns `None` once the queue is done.
    pub async fn next_height(&self) -> Option<u64> {
        loop {
            {
                let mut inner = self.inner.lock();
                if self.done.is_cancelled() {
                    return None;
                }
                if let Some(&height) = inner.failed.iter().next_back() {
                    inner.failed.remove(&height);
                    if !inner.failed.is_empty() {
                        self.fetch_notify.notify_one();
                    }
                    return Some(height);
                }
                if inner.terminal.is_none() && inner.fetch_height >= inner.initial_height {
                    let height = inner.fetch_height;
                    inner.fetch_height = inner.fetch_height.saturating_sub(1);
                    return Some(height);
                }
            }

            tokio::select! {
                _ = self.done.cancelled() => return None,
                _ = self.fetch_notify.notified() => {}
            }
        }
    }

    /// Re-enter a height into the fetch queue after a failed attempt.
    ///
    /// Exhausting `max_retries` terminates the queue with
    /// [`SyncError::RetriesExhausted`].
    pub fn retry(&self, height: u64) {
        let exhausted = {
            let mut inner = self.inner.lock();
            if self.done.is_cancelled() {
                return;
            }
            let max_retries = inner.max_retries;
            let attempts = inner.retries.entry(height).or_insert(0);
            *attempts += 1;
            let attempts = *attempts;
            if attempts >= max_retries {
                inner.error = Some(SyncError::RetriesExhausted { height, attempts });
                true
            } else {
                inner.failed.insert(height);
                false
            }
        };
        if exhausted {
            debug!(height, "height exhausted fetch retries, closing queue");
            self.done.cancel();
        } else {
            self.fetch_notify.notify_one();
        }
    }

    /// Store a fetched block for verification.
    ///
    /// Duplicate heights and blocks below an already known terminal are
    /// dropped. The first block satisfying both stop criteria becomes the
    /// terminal block (the highest such block wins if several are seen).
    pub fn add(&self, resp: FetchedBlock) {
        let height = resp.block.height();
        let time = resp.block.time();

        let mut inner = self.inner.lock();
        if self.done.is_cancelled() || inner.fetched.contains_key(&height) {
            return;
        }
        if let Some(terminal) = inner.terminal {
            if height < terminal.height {
                return;
            }
        }

        if height <= inner.stop_height
            && time <= inner.stop_time
            && inner.terminal.map_or(true, |t| height > t.height)
        {
            inner.terminal = Some(Terminal { height, time });
        }

        let notify = height == inner.verify_height;
        inner.fetched.insert(height, resp);
        drop(inner);

        if notify {
            self.verify_notify.notify_one();
        }
    }

    /// Next in-order block for the verifier. Blocks until the block at the
    /// current verify height has been fetched; returns `None` once the
    /// queue is done.
    pub async fn verify_next(&self) -> Option<FetchedBlock> {
        loop {
            {
                let mut inner = self.inner.lock();
                if self.done.is_cancelled() {
                    return None;
                }
                let height = inner.verify_height;
                if let Some(block) = inner.fetched.remove(&height) {
                    return Some(block);
                }
            }

            tokio::select! {
                _ = self.done.cancelled() => return None,
                _ = self.verify_notify.notified() => {}
            }
        }
    }

    /// Record that `height` verified successfully, advancing the verifier
    /// cursor. Verifying the terminal block completes the queue.
    pub fn success(&self, height: u64) {
        let finished = {
            let mut inner = self.inner.lock();
            let finished = inner.terminal.is_some_and(|t| t.height == height);
            inner.verify_height = height.saturating_sub(1);
            finished
        };
        if finished {
            self.done.cancel();
        }
    }

    /// Close the queue, waking all waiters.
    pub fn close(&self) {
        self.done.cancel();
    }

    /// True once the queue has terminated, successfully or not.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Terminal error, if the queue failed.
    pub fn error(&self) -> Option<SyncError> {
        self.inner.lock().error.clone()
    }

    /// The block the run terminated on, once known.
    pub fn terminal(&self) -> Option<Terminal> {
        self.inner.lock().terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use emberbft_types::{BlockId, Commit, Hash, Header, SignedHeader, Validator, ValidatorSet};
    use std::sync::Arc;
    use std::time::Duration;

    fn block_at(height: u64, time: DateTime<Utc>) -> FetchedBlock {
        let vals = ValidatorSet::new(vec![Validator::new(vec![1; 20], vec![1; 32], 10)]);
        let header = Header {
            chain_id: "test-chain".to_string(),
            height,
            time,
            last_block_id: BlockId::new(Hash::repeat_byte((height % 251) as u8)),
            last_commit_hash: Hash::ZERO,
            data_hash: Hash::ZERO,
            validators_hash: vals.hash(),
            next_validators_hash: vals.hash(),
            app_hash: Hash::ZERO,
            proposer_address: vec![1; 20],
        };
        let commit = Commit {
            height,
            block_id: BlockId::new(header.hash()),
            signatures: vec![],
        };
        FetchedBlock {
            block: LightBlock {
                signed_header: SignedHeader { header, commit },
                validator_set: vals,
            },
            peer: "peer1".to_string(),
        }
    }

    fn old_time(height: u64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().expect("time")
            + chrono::Duration::seconds(height as i64)
    }

    fn queue(start: u64, stop: u64) -> BlockQueue {
        // stop_time in the future relative to the fixture times, so height
        // governs termination
        BlockQueue::new(start, stop, 1, Utc::now(), 3)
    }

    #[tokio::test]
    async fn test_next_height_counts_down() {
        let q = queue(10, 5);
        for expected in (6..=10).rev() {
            assert_eq!(q.next_height().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_failed_heights_are_reissued_first() {
        let q = queue(10, 5);
        assert_eq!(q.next_height().await, Some(10));
        assert_eq!(q.next_height().await, Some(9));
        q.retry(10);
        assert_eq!(q.next_height().await, Some(10));
        assert_eq!(q.next_height().await, Some(8));
    }

    #[tokio::test]
    async fn test_verify_order_is_decreasing_and_consecutive() {
        let q = queue(10, 8);

        // arrive out of order
        q.add(block_at(8, old_time(8)));
        q.add(block_at(10, old_time(10)));
        q.add(block_at(9, old_time(9)));

        for expected in [10, 9, 8] {
            let resp = q.verify_next().await.expect("block");
            assert_eq!(resp.block.height(), expected);
            q.success(expected);
        }
        assert!(q.is_done());
        assert!(q.error().is_none());
        assert_eq!(q.terminal().expect("terminal").height, 8);
    }

    #[tokio::test]
    async fn test_duplicate_add_is_ignored() {
        let q = queue(10, 9);
        q.add(block_at(10, old_time(10)));
        q.add(block_at(10, old_time(10)));

        let first = q.verify_next().await.expect("block");
        assert_eq!(first.block.height(), 10);
        q.success(10);

        // only height 9 remains; a second 10 must never surface
        q.add(block_at(9, old_time(9)));
        let second = q.verify_next().await.expect("block");
        assert_eq!(second.block.height(), 9);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_terminates_with_error() {
        let q = queue(10, 5);
        let _ = q.next_height().await;

        q.retry(10);
        q.retry(10);
        assert!(!q.is_done());
        q.retry(10);
        assert!(q.is_done());
        assert!(matches!(
            q.error(),
            Some(SyncError::RetriesExhausted {
                height: 10,
                attempts: 3,
            })
        ));
        assert!(q.next_height().await.is_none());
        assert!(q.verify_next().await.is_none());
    }

    #[tokio::test]
    async fn test_time_criterion_delays_termination() {
        // stop_height 8, but only the block at height 6 is old enough
        let stop_time = old_time(6);
        let q = BlockQueue::new(10, 8, 1, stop_time, 3);

        for h in (6..=10).rev() {
            q.add(block_at(h, old_time(h)));
        }

        for expected in [10, 9, 8, 7, 6] {
            let resp = q.verify_next().await.expect("block");
            assert_eq!(resp.block.height(), expected);
            q.success(expected);
        }
        assert!(q.is_done());
        assert_eq!(q.terminal().expect("terminal").height, 6);
    }

    #[tokio::test]
    async fn test_terminal_stops_fresh_heights() {
        let q = queue(10, 9);
        assert_eq!(q.next_height().await, Some(10));

        // the block at stop height satisfies both criteria: terminal found,
        // no fresh heights are issued below it
        q.add(block_at(9, old_time(9)));
        assert_eq!(q.terminal().expect("terminal").height, 9);
        q.add(block_at(10, old_time(10)));

        let verifier = async {
            while let Some(resp) = q.verify_next().await {
                let h = resp.block.height();
                q.success(h);
            }
        };
        tokio::time::timeout(Duration::from_secs(1), verifier)
            .await
            .expect("verifier finished");
        assert!(q.is_done());
    }

    #[tokio::test]
    async fn test_close_unblocks_waiters() {
        let q = Arc::new(queue(10, 5));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.verify_next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert!(waiter.await.expect("join").is_none());
    }
}
