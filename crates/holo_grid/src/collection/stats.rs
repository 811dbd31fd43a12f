//! Per-container operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of `OperationsCounter` for logging/monitoring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperationsSnapshot {
    pub adds: u64,
    pub adds_total_ms: u64,
    pub removes: u64,
    pub removes_total_ms: u64,
    pub gets: u64,
    pub gets_total_ms: u64,
    pub others: u64,
    pub others_total_ms: u64,
    pub max_latency_ms: u64,
}

/// Side-effecting accumulator; increments never influence control flow.
#[derive(Debug, Default)]
pub struct OperationsCounter {
    adds: AtomicU64,
    adds_total_ms: AtomicU64,
    removes: AtomicU64,
    removes_total_ms: AtomicU64,
    gets: AtomicU64,
    gets_total_ms: AtomicU64,
    others: AtomicU64,
    others_total_ms: AtomicU64,
    max_latency_ms: AtomicU64,
}

impl OperationsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_adds(&self, elapsed_ms: u64) {
        self.record(&self.adds, &self.adds_total_ms, elapsed_ms);
    }

    pub fn increment_removes(&self, elapsed_ms: u64) {
        self.record(&self.removes, &self.removes_total_ms, elapsed_ms);
    }

    pub fn increment_gets(&self, elapsed_ms: u64) {
        self.record(&self.gets, &self.gets_total_ms, elapsed_ms);
    }

    pub fn increment_others(&self, elapsed_ms: u64) {
        self.record(&self.others, &self.others_total_ms, elapsed_ms);
    }

    fn record(&self, count: &AtomicU64, total: &AtomicU64, elapsed_ms: u64) {
        count.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(elapsed_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OperationsSnapshot {
        OperationsSnapshot {
            adds: self.adds.load(Ordering::Relaxed),
            adds_total_ms: self.adds_total_ms.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            removes_total_ms: self.removes_total_ms.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            gets_total_ms: self.gets_total_ms.load(Ordering::Relaxed),
            others: self.others.load(Ordering::Relaxed),
            others_total_ms: self.others_total_ms.load(Ordering::Relaxed),
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
        }
    }

    /// Return the current snapshot and reset counters.
    pub fn snapshot_and_reset(&self) -> OperationsSnapshot {
        OperationsSnapshot {
            adds: self.adds.swap(0, Ordering::Relaxed),
            adds_total_ms: self.adds_total_ms.swap(0, Ordering::Relaxed),
            removes: self.removes.swap(0, Ordering::Relaxed),
            removes_total_ms: self.removes_total_ms.swap(0, Ordering::Relaxed),
            gets: self.gets.swap(0, Ordering::Relaxed),
            gets_total_ms: self.gets_total_ms.swap(0, Ordering::Relaxed),
            others: self.others.swap(0, Ordering::Relaxed),
            others_total_ms: self.others_total_ms.swap(0, Ordering::Relaxed),
            max_latency_ms: self.max_latency_ms.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_latencies_and_resets() {
        let counter = OperationsCounter::new();
        counter.increment_removes(3);
        counter.increment_removes(5);
        counter.increment_gets(1);

        let snap = counter.snapshot_and_reset();
        assert_eq!(snap.removes, 2);
        assert_eq!(snap.removes_total_ms, 8);
        assert_eq!(snap.gets, 1);
        assert_eq!(snap.max_latency_ms, 5);
        assert_eq!(counter.snapshot(), OperationsSnapshot::default());
    }
}
