//! Aggregated stat counters.
//!
//! The data path increments per-context counters (per-CPU slots in XDP
//! mode, per-worker shards in userspace mode) and never reads them back.
//! Aggregation is this side's job: sum the shards into one snapshot for
//! logging and the metrics endpoint.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::engine::SteerStats;

/// Point-in-time sum of the stat counters across all execution contexts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub redirected: u64,
    /// Reserved slot; stays 0 until a drop policy exists.
    pub dropped: u64,
    pub passed: u64,
    pub aborted: u64,
}

impl StatsSnapshot {
    /// Sum userspace worker shards.
    pub fn from_shards(shards: &[Arc<SteerStats>]) -> Self {
        let mut snap = Self::default();
        for shard in shards {
            snap.processed += shard.processed.load(Ordering::Relaxed);
            snap.redirected += shard.redirected.load(Ordering::Relaxed);
            snap.dropped += shard.dropped.load(Ordering::Relaxed);
            snap.passed += shard.passed.load(Ordering::Relaxed);
            snap.aborted += shard.aborted.load(Ordering::Relaxed);
        }
        snap
    }
}
