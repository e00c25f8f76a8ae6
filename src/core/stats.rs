// Relaxed counters describing recorder activity; snapshots are serializable.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) buffers_allocated: AtomicU64,
    pub(crate) buffers_reused: AtomicU64,
    pub(crate) buffers_deallocated: AtomicU64,
    pub(crate) renewals: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) checkpoints_written: AtomicU64,
    pub(crate) checkpoints_dropped: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) bytes_discarded: AtomicU64,
    pub(crate) rotations: AtomicU64,
    pub(crate) type_entries_purged: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub buffers_allocated: u64,
    pub buffers_reused: u64,
    pub buffers_deallocated: u64,
    pub renewals: u64,
    pub flushes: u64,
    pub checkpoints_written: u64,
    pub checkpoints_dropped: u64,
    pub bytes_written: u64,
    pub bytes_discarded: u64,
    pub rotations: u64,
    pub type_entries_purged: u64,
}

impl Stats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: usize) {
        counter.fetch_add(value as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            buffers_allocated: load(&self.buffers_allocated),
            buffers_reused: load(&self.buffers_reused),
            buffers_deallocated: load(&self.buffers_deallocated),
            renewals: load(&self.renewals),
            flushes: load(&self.flushes),
            checkpoints_written: load(&self.checkpoints_written),
            checkpoints_dropped: load(&self.checkpoints_dropped),
            bytes_written: load(&self.bytes_written),
            bytes_discarded: load(&self.bytes_discarded),
            rotations: load(&self.rotations),
            type_entries_purged: load(&self.type_entries_purged),
        }
    }
}
