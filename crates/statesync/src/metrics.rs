//! State sync metrics.

use once_cell::sync::Lazy;
use prometheus::{register_counter_vec, register_gauge, register_int_counter, CounterVec, Gauge, IntCounter};

/// Whether a state sync is in progress (0 or 1).
pub static SYNCING: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("statesync_syncing", "Whether a state sync is in progress")
        .expect("Failed to register statesync_syncing metric")
});

/// Height of the snapshot being restored.
pub static SNAPSHOT_HEIGHT: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "statesync_snapshot_height",
        "Height of the snapshot being restored"
    )
    .expect("Failed to register statesync_snapshot_height metric")
});

/// Total chunks in the snapshot being restored.
pub static SNAPSHOT_CHUNKS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "statesync_snapshot_chunks",
        "Total chunks in the snapshot being restored"
    )
    .expect("Failed to register statesync_snapshot_chunks metric")
});

/// Snapshots discovered from peers this sync.
pub static DISCOVERED_SNAPSHOTS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "statesync_discovered_snapshots",
        "Snapshots discovered from peers"
    )
    .expect("Failed to register statesync_discovered_snapshots metric")
});

/// Chunks accepted by the application.
pub static CHUNKS_APPLIED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "statesync_chunks_applied_total",
        "Chunks accepted by the application"
    )
    .expect("Failed to register statesync_chunks_applied_total metric")
});

/// Light blocks verified and stored by backfill.
pub static BACKFILLED_BLOCKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "statesync_backfilled_blocks_total",
        "Light blocks verified and stored by backfill"
    )
    .expect("Failed to register statesync_backfilled_blocks_total metric")
});

/// Errors by kind.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "statesync_errors_total",
        "State sync errors by kind",
        &["kind"]
    )
    .expect("Failed to register statesync_errors_total metric")
});

/// Flag a sync as started or finished.
pub fn set_syncing(active: bool) {
    SYNCING.set(if active { 1.0 } else { 0.0 });
}

/// Record the snapshot height under restore.
pub fn set_snapshot_height(height: u64) {
    SNAPSHOT_HEIGHT.set(height as f64);
}

/// Record the chunk count of the snapshot under restore.
pub fn set_snapshot_chunks(chunks: u32) {
    SNAPSHOT_CHUNKS.set(chunks as f64);
}

/// Record how many snapshots discovery has surfaced.
pub fn set_discovered_snapshots(count: usize) {
    DISCOVERED_SNAPSHOTS.set(count as f64);
}

/// Count an applied chunk.
pub fn inc_chunks_applied() {
    CHUNKS_APPLIED.inc();
}

/// Count a backfilled block.
pub fn inc_backfilled_blocks() {
    BACKFILLED_BLOCKS.inc();
}

/// Count an error by kind.
pub fn record_error(kind: &str) {
    ERRORS.with_label_values(&[kind]).inc();
}
