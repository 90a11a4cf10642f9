//! Metrics and observability.
//!
//! The store emits lock latencies and transfer counters into a
//! [`MetricsObserver`]; wiring them to an exporter is the embedder's
//! concern. [`StoreMetrics`] is an in-memory collector for embedders and
//! tests; [`NullMetrics`] discards everything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Which side of the store lock an observation covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// Sink for the events and latencies the store emits.
pub trait MetricsObserver: Send + Sync {
    /// Time spent acquiring and holding the store lock.
    fn observe_lock_latency(&self, kind: LockKind, elapsed: Duration);

    /// A manifest was stored in the repository.
    fn inc_upload_counter(&self, repo: &str);

    /// A manifest was served from the repository.
    fn inc_download_counter(&self, repo: &str);

    /// Bytes currently consumed by the repository.
    fn set_storage_usage(&self, repo: &str, bytes: u64);
}

/// Observer that drops every observation.
#[derive(Default)]
pub struct NullMetrics;

impl MetricsObserver for NullMetrics {
    fn observe_lock_latency(&self, _kind: LockKind, _elapsed: Duration) {}
    fn inc_upload_counter(&self, _repo: &str) {}
    fn inc_download_counter(&self, _repo: &str) {}
    fn set_storage_usage(&self, _repo: &str, _bytes: u64) {}
}

/// In-memory metrics collector.
#[derive(Default)]
pub struct StoreMetrics {
    uploads: AtomicU64,
    downloads: AtomicU64,
    read_lock_observations: AtomicU64,
    write_lock_observations: AtomicU64,
    lock_nanos: AtomicU64,
    storage_usage: Mutex<HashMap<String, u64>>,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn lock_observations(&self, kind: LockKind) -> u64 {
        match kind {
            LockKind::Read => self.read_lock_observations.load(Ordering::Relaxed),
            LockKind::Write => self.write_lock_observations.load(Ordering::Relaxed),
        }
    }

    /// Total time observed under either lock.
    pub fn lock_time(&self) -> Duration {
        Duration::from_nanos(self.lock_nanos.load(Ordering::Relaxed))
    }

    pub fn storage_usage(&self, repo: &str) -> Option<u64> {
        self.storage_usage
            .lock()
            .expect("metrics lock poisoned")
            .get(repo)
            .copied()
    }
}

impl MetricsObserver for StoreMetrics {
    fn observe_lock_latency(&self, kind: LockKind, elapsed: Duration) {
        match kind {
            LockKind::Read => self.read_lock_observations.fetch_add(1, Ordering::Relaxed),
            LockKind::Write => self.write_lock_observations.fetch_add(1, Ordering::Relaxed),
        };
        self.lock_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    fn inc_upload_counter(&self, _repo: &str) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_download_counter(&self, _repo: &str) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    fn set_storage_usage(&self, repo: &str, bytes: u64) {
        self.storage_usage
            .lock()
            .expect("metrics lock poisoned")
            .insert(repo.to_string(), bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = StoreMetrics::new();

        metrics.inc_upload_counter("repo");
        metrics.inc_upload_counter("repo");
        metrics.inc_download_counter("repo");

        assert_eq!(metrics.uploads(), 2);
        assert_eq!(metrics.downloads(), 1);
    }

    #[test]
    fn test_lock_observations() {
        let metrics = StoreMetrics::new();

        metrics.observe_lock_latency(LockKind::Read, Duration::from_millis(2));
        metrics.observe_lock_latency(LockKind::Write, Duration::from_millis(3));

        assert_eq!(metrics.lock_observations(LockKind::Read), 1);
        assert_eq!(metrics.lock_observations(LockKind::Write), 1);
        assert_eq!(metrics.lock_time(), Duration::from_millis(5));
    }

    #[test]
    fn test_storage_usage() {
        let metrics = StoreMetrics::new();

        assert_eq!(metrics.storage_usage("repo"), None);
        metrics.set_storage_usage("repo", 1024);
        assert_eq!(metrics.storage_usage("repo"), Some(1024));
    }
}
