//! Per-volume I/O counters.
//!
//! Always compiled; recording is gated by a runtime flag so that one code
//! path serves both instrumented and uninstrumented deployments.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// I/O counters for one pooled volume, aggregated across cores.
#[derive(Debug, Default)]
pub struct IoStats {
    enabled: bool,
    reads: AtomicU64,
    writes: AtomicU64,
    read_blocks: AtomicU64,
    write_blocks: AtomicU64,
    child_failures: AtomicU64,
    exhaustions: AtomicU64,
}

/// Point-in-time copy of [`IoStats`], for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IoStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub read_blocks: u64,
    pub write_blocks: u64,
    pub child_failures: u64,
    pub exhaustions: u64,
}

impl IoStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_read(&self, num_blocks: u64) {
        if self.enabled {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.read_blocks.fetch_add(num_blocks, Ordering::Relaxed);
        }
    }

    pub fn record_write(&self, num_blocks: u64) {
        if self.enabled {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.write_blocks.fetch_add(num_blocks, Ordering::Relaxed);
        }
    }

    pub fn record_child_failure(&self) {
        if self.enabled {
            self.child_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_exhaustion(&self) {
        if self.enabled {
            self.exhaustions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            read_blocks: self.read_blocks.load(Ordering::Relaxed),
            write_blocks: self.write_blocks.load(Ordering::Relaxed),
            child_failures: self.child_failures.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_records() {
        let stats = IoStats::new(true);
        stats.record_read(8);
        stats.record_read(4);
        stats.record_write(16);
        stats.record_child_failure();
        stats.record_exhaustion();

        let snap = stats.snapshot();
        assert_eq!(snap.reads, 2);
        assert_eq!(snap.read_blocks, 12);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.write_blocks, 16);
        assert_eq!(snap.child_failures, 1);
        assert_eq!(snap.exhaustions, 1);
    }

    #[test]
    fn test_disabled_is_noop() {
        let stats = IoStats::new(false);
        stats.record_read(8);
        stats.record_write(8);
        stats.record_exhaustion();

        let snap = stats.snapshot();
        assert_eq!(snap.reads, 0);
        assert_eq!(snap.writes, 0);
        assert_eq!(snap.exhaustions, 0);
    }
}
