//! Allocator counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::RoundStats;

/// Cumulative counters for one allocator.
///
/// Shared through an `Arc`; the driver updates them after every round.
#[derive(Debug, Default)]
pub struct AllocatorMetrics {
    rounds: AtomicU64,
    idle_rounds: AtomicU64,
    conflicts: AtomicU64,
    added: AtomicU64,
    removed: AtomicU64,
    packed: AtomicU64,
    flagged: AtomicU64,
    repaired: AtomicU64,
}

impl AllocatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_round(&self, idle: bool) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        if idle {
            self.idle_rounds.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the changes of a committed proposal.
    pub(crate) fn record_commit(&self, stats: &RoundStats) {
        self.added.fetch_add(stats.added, Ordering::Relaxed);
        self.removed.fetch_add(stats.removed, Ordering::Relaxed);
        self.packed.fetch_add(stats.packed, Ordering::Relaxed);
        self.flagged.fetch_add(stats.flagged, Ordering::Relaxed);
        self.repaired.fetch_add(stats.repaired, Ordering::Relaxed);
    }

    /// Get a point-in-time copy of the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rounds: self.rounds.load(Ordering::Relaxed),
            idle_rounds: self.idle_rounds.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            added: self.added.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            packed: self.packed.load(Ordering::Relaxed),
            flagged: self.flagged.load(Ordering::Relaxed),
            repaired: self.repaired.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rounds: u64,
    pub idle_rounds: u64,
    pub conflicts: u64,
    pub added: u64,
    pub removed: u64,
    pub packed: u64,
    pub flagged: u64,
    pub repaired: u64,
}

impl MetricsSnapshot {
    /// Sum counters across allocators.
    pub fn merge(&mut self, other: &MetricsSnapshot) {
        self.rounds += other.rounds;
        self.idle_rounds += other.idle_rounds;
        self.conflicts += other.conflicts;
        self.added += other.added;
        self.removed += other.removed;
        self.packed += other.packed;
        self.flagged += other.flagged;
        self.repaired += other.repaired;
    }
}
