//! Lock manager metrics
//!
//! Counters for lock requests and their outcomes, plus a histogram of the
//! time spent waiting for blocked requests.  All updates are relaxed atomic
//! operations so recording never contends with locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::request::LockConflictType;

/// Metrics collected by one lock manager
#[derive(Debug)]
pub struct LockMetrics {
    /// Lock requests made with `lock` or `lock_no_wait`
    requests: AtomicU64,
    /// Requests granted, or already satisfied, without blocking
    immediate_grants: AtomicU64,
    /// Requests that blocked
    blocks: AtomicU64,
    /// Blocked requests granted after waiting
    waits_granted: AtomicU64,
    timeouts: AtomicU64,
    interrupts: AtomicU64,
    denials: AtomicU64,
    deadlocks: AtomicU64,
    releases: AtomicU64,
    downgrades: AtomicU64,
    /// Lockers woken after a release or a withdrawn waiter
    notifications: AtomicU64,
    wait_latency: WaitHistogram,
    start_time: Instant,
}

/// Histogram of wait times
#[derive(Debug)]
struct WaitHistogram {
    /// Bucket boundaries in microseconds
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    total_sum: AtomicU64,
    max_wait: AtomicU64,
}

/// Snapshot of lock manager metrics at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockMetricsSnapshot {
    /// Timestamp when snapshot was taken
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub requests: u64,
    pub immediate_grants: u64,
    pub blocks: u64,
    pub waits_granted: u64,
    pub timeouts: u64,
    pub interrupts: u64,
    pub denials: u64,
    pub deadlocks: u64,
    pub releases: u64,
    pub downgrades: u64,
    pub notifications: u64,
    /// Fraction of requests that blocked
    pub contention_rate: f64,
    pub wait_p50_us: f64,
    pub wait_p99_us: f64,
    pub wait_avg_us: f64,
    pub wait_max_us: u64,
}

impl LockMetrics {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            immediate_grants: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            waits_granted: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            interrupts: AtomicU64::new(0),
            denials: AtomicU64::new(0),
            deadlocks: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            downgrades: AtomicU64::new(0),
            notifications: AtomicU64::new(0),
            wait_latency: WaitHistogram::new(),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_immediate_grant(&self) {
        self.immediate_grants.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a conflict returned to a caller
    pub(crate) fn record_conflict(&self, conflict_type: LockConflictType) {
        let counter = match conflict_type {
            LockConflictType::Blocked => &self.blocks,
            LockConflictType::Timeout => &self.timeouts,
            LockConflictType::Denied => &self.denials,
            LockConflictType::Interrupted => &self.interrupts,
            LockConflictType::Deadlock => &self.deadlocks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a wait for a blocked request
    pub(crate) fn record_wait(&self, waited: Duration, granted: bool) {
        if granted {
            self.waits_granted.fetch_add(1, Ordering::Relaxed);
        }
        self.wait_latency.record(waited);
    }

    pub(crate) fn record_release(&self, downgrade: bool) {
        if downgrade {
            self.downgrades.fetch_add(1, Ordering::Relaxed);
        } else {
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_notifications(&self, count: usize) {
        if count > 0 {
            self.notifications
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let blocks = self.blocks.load(Ordering::Relaxed);
        let contention_rate = if requests > 0 {
            blocks as f64 / requests as f64
        } else {
            0.0
        };

        LockMetricsSnapshot {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            requests,
            immediate_grants: self.immediate_grants.load(Ordering::Relaxed),
            blocks,
            waits_granted: self.waits_granted.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            downgrades: self.downgrades.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            contention_rate,
            wait_p50_us: self.wait_latency.percentile(50.0),
            wait_p99_us: self.wait_latency.percentile(99.0),
            wait_avg_us: self.wait_latency.average(),
            wait_max_us: self.wait_latency.max_wait.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.immediate_grants,
            &self.blocks,
            &self.waits_granted,
            &self.timeouts,
            &self.interrupts,
            &self.denials,
            &self.deadlocks,
            &self.releases,
            &self.downgrades,
            &self.notifications,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.wait_latency.reset();
    }
}

impl Default for LockMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitHistogram {
    fn new() -> Self {
        // Bucket boundaries: 10us, 100us, 1ms, 5ms, 10ms, 50ms, 100ms, 500ms, 1s, 10s
        let buckets = vec![
            10, 100, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 10_000_000,
        ];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            total_sum: AtomicU64::new(0),
            max_wait: AtomicU64::new(0),
        }
    }

    fn record(&self, waited: Duration) {
        let waited_us = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        self.max_wait.fetch_max(waited_us, Ordering::Relaxed);

        // Waits longer than the last boundary land in the last bucket
        let index = self
            .buckets
            .iter()
            .position(|&limit| waited_us <= limit)
            .unwrap_or(self.buckets.len() - 1);
        self.counts[index].fetch_add(1, Ordering::Relaxed);

        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.total_sum.fetch_add(waited_us, Ordering::Relaxed);
    }

    fn percentile(&self, p: f64) -> f64 {
        let total = self.total_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }

        let target_count = ((total as f64 * p / 100.0) as u64).max(1);
        let mut cumulative = 0;

        for (i, count) in self.counts.iter().enumerate() {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= target_count {
                return self.buckets[i] as f64;
            }
        }

        *self.buckets.last().unwrap_or(&0) as f64
    }

    fn average(&self) -> f64 {
        let total = self.total_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.total_sum.load(Ordering::Relaxed) as f64 / total as f64
    }

    fn reset(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
        self.total_count.store(0, Ordering::Relaxed);
        self.total_sum.store(0, Ordering::Relaxed);
        self.max_wait.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collection() {
        let metrics = LockMetrics::new();

        metrics.record_request();
        metrics.record_immediate_grant();
        metrics.record_request();
        metrics.record_conflict(LockConflictType::Blocked);
        metrics.record_wait(Duration::from_micros(750), true);
        metrics.record_conflict(LockConflictType::Deadlock);
        metrics.record_release(false);
        metrics.record_release(true);
        metrics.record_notifications(2);
        metrics.record_notifications(0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.immediate_grants, 1);
        assert_eq!(snapshot.blocks, 1);
        assert_eq!(snapshot.waits_granted, 1);
        assert_eq!(snapshot.deadlocks, 1);
        assert_eq!(snapshot.releases, 1);
        assert_eq!(snapshot.downgrades, 1);
        assert_eq!(snapshot.notifications, 2);
        assert_eq!(snapshot.contention_rate, 0.5);
        assert_eq!(snapshot.wait_p50_us, 1_000.0);
        assert_eq!(snapshot.wait_max_us, 750);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.wait_p99_us, 0.0);
    }

    #[test]
    fn test_wait_histogram() {
        let histogram = WaitHistogram::new();

        histogram.record(Duration::from_micros(5)); // 10us bucket
        histogram.record(Duration::from_micros(75)); // 100us bucket
        histogram.record(Duration::from_secs(60)); // overflow, last bucket

        assert_eq!(histogram.total_count.load(Ordering::Relaxed), 3);
        assert_eq!(histogram.percentile(10.0), 10.0);
        assert_eq!(histogram.percentile(100.0), 10_000_000.0);
        assert!(histogram.average() > 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = LockMetrics::new();
        metrics.record_request();
        let snapshot = metrics.snapshot();
        let bytes = bincode::serialize(&snapshot).unwrap();
        let decoded: LockMetricsSnapshot = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
    }
}
