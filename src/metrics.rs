use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Performance counters of the job system.
#[derive(Debug)]
pub struct Metrics {
    /// Jobs accepted into a priority queue, chained jobs included.
    pub jobs_scheduled: AtomicU64,
    /// Jobs that ran to completion (panicked ones included).
    pub jobs_completed: AtomicU64,
    /// Completed jobs whose closure panicked.
    pub jobs_panicked: AtomicU64,
    /// Jobs dequeued after being canceled.
    pub jobs_canceled: AtomicU64,
    /// Schedule attempts rejected because a queue was full.
    pub queue_full: AtomicU64,
    /// Fibers suspended on a counter.
    pub fibers_parked: AtomicU64,
    /// Fibers resumed from a ready list.
    pub fibers_resumed: AtomicU64,
    /// Retired jobs not kept because the finished queue was full.
    pub finished_dropped: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_scheduled: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_panicked: AtomicU64::new(0),
            jobs_canceled: AtomicU64::new(0),
            queue_full: AtomicU64::new(0),
            fibers_parked: AtomicU64::new(0),
            fibers_resumed: AtomicU64::new(0),
            finished_dropped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current metrics values.
    ///
    /// `fiber_spin_overflows` comes from the fiber pool, which keeps its own
    /// count.
    pub fn snapshot(&self, fiber_spin_overflows: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_scheduled: self.jobs_scheduled.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_panicked: self.jobs_panicked.load(Ordering::Relaxed),
            jobs_canceled: self.jobs_canceled.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            fibers_parked: self.fibers_parked.load(Ordering::Relaxed),
            fibers_resumed: self.fibers_resumed.load(Ordering::Relaxed),
            finished_dropped: self.finished_dropped.load(Ordering::Relaxed),
            fiber_spin_overflows,
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_scheduled: u64,
    pub jobs_completed: u64,
    pub jobs_panicked: u64,
    pub jobs_canceled: u64,
    pub queue_full: u64,
    pub fibers_parked: u64,
    pub fibers_resumed: u64,
    pub finished_dropped: u64,
    pub fiber_spin_overflows: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Calculates jobs per second throughput.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Approximates the number of jobs still queued or running.
    pub fn pending(&self) -> i64 {
        self.jobs_scheduled as i64 - self.jobs_completed as i64 - self.jobs_canceled as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot(0);
        assert_eq!(snapshot.jobs_scheduled, 0);
        assert_eq!(snapshot.jobs_completed, 0);
        assert_eq!(snapshot.fibers_parked, 0);
        assert_eq!(snapshot.finished_dropped, 0);
        assert_eq!(snapshot.fiber_spin_overflows, 0);
        assert!(snapshot.elapsed_seconds >= 0.0);
    }

    #[test]
    fn test_metrics_updates() {
        let metrics = Metrics::new();

        metrics.jobs_scheduled.fetch_add(10, Ordering::Relaxed);
        metrics.jobs_completed.fetch_add(6, Ordering::Relaxed);
        metrics.jobs_canceled.fetch_add(1, Ordering::Relaxed);

        let snapshot = metrics.snapshot(3);
        assert_eq!(snapshot.jobs_completed, 6);
        assert_eq!(snapshot.fiber_spin_overflows, 3);
        assert_eq!(snapshot.pending(), 3);
    }

    #[test]
    fn test_throughput_calculation() {
        let metrics = Metrics::new();
        metrics.jobs_completed.fetch_add(100, Ordering::Relaxed);

        thread::sleep(Duration::from_millis(10));
        let snapshot = metrics.snapshot(0);

        assert!(snapshot.jobs_per_second() > 0.0);
    }
}
