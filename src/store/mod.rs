//! Content-addressed image store.
//!
//! An [`ImageStore`] owns a root directory of per-repository OCI layouts:
//!
//! ```text
//! <root>/
//!   <repo>/
//!     oci-layout                 {"imageLayoutVersion":"1.0.0"}
//!     index.json                 OCI image index of tagged/untagged manifests
//!     blobs/sha256/<hex>         content-addressed blobs
//!     .uploads/<uuid>            in-progress uploads
//! ```
//!
//! All persistence goes through a [`StorageDriver`]; blob dedupe state goes
//! through an optional [`BlobCache`]. One reader/writer lock serializes
//! mutations per store; every public operation acquires it on the side the
//! operation needs and the acquisition latency is reported to the
//! [`MetricsObserver`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cache::BlobCache;
use crate::digest::Digest;
use crate::driver::StorageDriver;
use crate::error::Result;
use crate::linter::{Lint, ManifestValidator};
use crate::metrics::{LockKind, MetricsObserver};

mod blob;
mod common;
mod dedupe;
mod gc;
mod layout;
mod manifest;
mod upload;

/// Directory holding in-progress uploads inside a repository.
pub const BLOB_UPLOAD_DIR: &str = ".uploads";

/// Directory holding content-addressed blobs inside a repository.
pub const BLOBS_DIR: &str = "blobs";

/// Per-repository index file name.
pub const INDEX_JSON: &str = "index.json";

/// Construction options for an [`ImageStore`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Root directory owned by the store.
    pub root_dir: PathBuf,
    /// Gate for registering the periodic garbage collector.
    pub gc: bool,
    /// Enables the referrer sweep (phase one of GC).
    pub gc_referrers: bool,
    /// Minimum age before an orphan blob or dangling referrer is reclaimed.
    pub gc_delay: Duration,
    /// Minimum age before an untagged manifest is reclaimed.
    pub retention_delay: Duration,
    /// Share identical blob content across paths at finalize time.
    pub dedupe: bool,
}

/// A content-addressed store of per-repository OCI layouts.
pub struct ImageStore {
    root_dir: PathBuf,
    driver: Arc<dyn StorageDriver>,
    cache: Option<Arc<dyn BlobCache>>,
    linter: Option<Arc<dyn Lint>>,
    validator: Option<Arc<dyn ManifestValidator>>,
    metrics: Arc<dyn MetricsObserver>,
    lock: RwLock<()>,
    dedupe: bool,
    gc: bool,
    gc_referrers: bool,
    gc_delay: Duration,
    retention_delay: Duration,
}

impl ImageStore {
    /// Create a store over `driver`, ensuring the root directory exists.
    pub async fn new(
        options: StoreOptions,
        driver: Arc<dyn StorageDriver>,
        cache: Option<Arc<dyn BlobCache>>,
        linter: Option<Arc<dyn Lint>>,
        validator: Option<Arc<dyn ManifestValidator>>,
        metrics: Arc<dyn MetricsObserver>,
    ) -> Result<Arc<Self>> {
        driver.ensure_dir(&options.root_dir).await?;

        Ok(Arc::new(Self {
            root_dir: options.root_dir,
            driver,
            cache,
            linter,
            validator,
            metrics,
            lock: RwLock::new(()),
            dedupe: options.dedupe,
            gc: options.gc,
            gc_referrers: options.gc_referrers,
            gc_delay: options.gc_delay,
            retention_delay: options.retention_delay,
        }))
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub async fn dir_exists(&self, path: &Path) -> bool {
        self.driver.dir_exists(path).await
    }

    /// True when finalize-time dedupe is in effect: the flag is set and a
    /// cache is configured to back it.
    pub(crate) fn dedupe_enabled(&self) -> bool {
        self.dedupe && self.cache.is_some()
    }

    pub(crate) fn repo_dir(&self, repo: &str) -> PathBuf {
        self.root_dir.join(repo)
    }

    /// Canonical path of a blob within a repository.
    pub fn blob_path(&self, repo: &str, digest: &Digest) -> PathBuf {
        self.repo_dir(repo)
            .join(BLOBS_DIR)
            .join(digest.algorithm().as_str())
            .join(digest.encoded())
    }

    /// Path of an in-progress upload within a repository.
    pub fn blob_upload_path(&self, repo: &str, uuid: &str) -> PathBuf {
        self.repo_dir(repo).join(BLOB_UPLOAD_DIR).join(uuid)
    }

    /// Acquire the store read lock.
    pub(crate) async fn rlock(&self) -> StoreGuard<'_> {
        let start = Instant::now();
        let guard = self.lock.read().await;

        StoreGuard {
            _read: Some(guard),
            _write: None,
            kind: LockKind::Read,
            start,
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Acquire the store write lock.
    pub(crate) async fn wlock(&self) -> StoreGuard<'_> {
        let start = Instant::now();
        let guard = self.lock.write().await;

        StoreGuard {
            _read: None,
            _write: Some(guard),
            kind: LockKind::Write,
            start,
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Recompute and publish the repository's storage usage. Best effort.
    pub(crate) async fn update_storage_usage(&self, repo: &str) {
        if let Ok(entries) = self.driver.walk(&self.repo_dir(repo)).await {
            let bytes = entries.iter().filter(|e| !e.is_dir).map(|e| e.size).sum();
            self.metrics.set_storage_usage(repo, bytes);
        }
    }
}

/// Lock guard that reports acquisition-plus-hold latency on release.
pub(crate) struct StoreGuard<'a> {
    _read: Option<RwLockReadGuard<'a, ()>>,
    _write: Option<RwLockWriteGuard<'a, ()>>,
    kind: LockKind,
    start: Instant,
    metrics: Arc<dyn MetricsObserver>,
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        // includes time spent acquiring, matching the latency histogram's intent
        self.metrics
            .observe_lock_latency(self.kind, self.start.elapsed());
    }
}
