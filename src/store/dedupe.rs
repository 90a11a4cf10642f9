//! Blob dedupe: the finalize-time protocol, rebuilds between dedupe modes,
//! and the periodic dedupe task generator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{ImageStore, BLOB_UPLOAD_DIR};
use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{Result, StoreError};
use crate::scheduler::{Scheduler, Task, TaskGenerator, TaskPriority};

impl ImageStore {
    /// Finalize an upload at `src` into the canonical `dst`, sharing content
    /// with an existing copy when the cache knows one.
    ///
    /// The cache and the disk may disagree (GC, crashes, version upgrades);
    /// a record pointing at a vanished file is dropped and the attempt
    /// retried until the two converge.
    pub(crate) async fn dedupe_blob(&self, src: &Path, digest: &Digest, dst: &Path) -> Result<()> {
        let Some(cache) = &self.cache else {
            return self.driver.move_file(src, dst).await;
        };

        loop {
            tracing::debug!(src = %src.display(), dst = %dst.display(), digest = %digest, "dedupe: enter");

            let record = match cache.get_blob(digest) {
                Ok(record) => Some(record),
                Err(StoreError::CacheMiss) => None,
                Err(err) => {
                    tracing::error!(%err, digest = %digest, "dedupe: cache lookup failed");
                    return Err(err);
                }
            };

            let Some(record) = record else {
                // first copy of this digest: it owns the content
                cache.put_blob(digest, &dst.to_string_lossy())?;
                self.driver.move_file(src, dst).await?;
                tracing::debug!(dst = %dst.display(), "dedupe: rename");
                return Ok(());
            };

            let record_path = self.resolve_cache_record(&record);
            if self.driver.stat(&record_path).await.is_err() {
                // drift: the recorded copy is gone from disk
                tracing::debug!(record = %record_path.display(), "dedupe: healing stale cache record");
                cache.delete_blob(digest, &record_path.to_string_lossy())?;
                continue;
            }

            if !self.driver.same_file(dst, &record_path).await {
                self.driver.link(&record_path, dst).await?;
                cache.put_blob(digest, &dst.to_string_lossy())?;
            }

            self.driver.delete(src).await?;
            tracing::debug!(src = %src.display(), "dedupe: discarded upload");
            return Ok(());
        }
    }

    /// Look up the digest's primary copy and verify it still exists,
    /// healing the cache when it does not. Returns the absolute path.
    pub(crate) async fn check_cache_blob(&self, digest: &Digest) -> Result<PathBuf> {
        let Some(cache) = &self.cache else {
            return Err(StoreError::BlobNotFound(digest.to_string()));
        };

        let record = cache.get_blob(digest)?;
        let path = self.resolve_cache_record(&record);

        if self.driver.stat(&path).await.is_err() {
            cache.delete_blob(digest, &path.to_string_lossy())?;
            return Err(StoreError::BlobNotFound(digest.to_string()));
        }

        tracing::debug!(digest = %digest, record = %path.display(), "cache: found dedupe record");

        Ok(path)
    }

    /// Materialize `blob_path` as a link to the content at `record`,
    /// initializing the repository if needed. Returns the content size.
    pub(crate) async fn copy_blob(
        &self,
        repo: &str,
        blob_path: &Path,
        record: &Path,
    ) -> Result<u64> {
        self.init_repo_unlocked(repo).await?;

        if let Some(parent) = blob_path.parent() {
            self.driver.ensure_dir(parent).await?;
        }
        self.driver
            .link(record, blob_path)
            .await
            .map_err(|_| StoreError::BlobNotFound(record.display().to_string()))?;

        let info = self
            .driver
            .stat(record)
            .await
            .map_err(|_| StoreError::BlobNotFound(record.display().to_string()))?;

        Ok(info.size)
    }

    /// Walk the store for the next digest not in `seen`, returning every
    /// path that carries it. `None` when the walk is exhausted.
    pub async fn get_next_digest_with_blob_paths(
        &self,
        seen: &[Digest],
    ) -> Result<Option<(Digest, Vec<PathBuf>)>> {
        let _lock = self.rlock().await;

        let entries = match self.driver.walk(&self.root_dir).await {
            Ok(entries) => entries,
            Err(err) if err.is_path_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        let mut digest: Option<Digest> = None;
        let mut paths = Vec::new();

        for info in entries {
            if info.is_dir {
                continue;
            }
            // in-progress uploads are not blobs
            if info
                .path
                .components()
                .any(|c| c.as_os_str() == BLOB_UPLOAD_DIR)
            {
                continue;
            }
            let Some(name) = info.path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(blob_digest) = Digest::from_encoded(DigestAlgorithm::Sha256, name) else {
                continue;
            };

            if digest.is_none() && !seen.contains(&blob_digest) {
                digest = Some(blob_digest.clone());
            }
            if digest.as_ref() == Some(&blob_digest) {
                paths.push(info.path);
            }
        }

        Ok(digest.map(|d| (d, paths)))
    }

    /// Rebuild one digest group: share content when `dedupe` is on, restore
    /// full copies when it is off.
    pub async fn run_dedupe_for_digest(
        &self,
        digest: &Digest,
        dedupe: bool,
        paths: &[PathBuf],
    ) -> Result<()> {
        let _lock = self.wlock().await;

        if dedupe {
            self.dedupe_existing_blobs(digest, paths).await
        } else {
            self.restore_deduped_blobs(digest, paths).await
        }
    }

    /// Register the periodic dedupe/restore sweep with the scheduler.
    pub fn run_dedupe_blobs(self: &Arc<Self>, interval: std::time::Duration, scheduler: &dyn Scheduler) {
        let generator = DedupeTaskGenerator {
            store: Arc::clone(self),
            dedupe: self.dedupe,
            seen: Vec::new(),
        };

        scheduler.submit_generator(Box::new(generator), interval, TaskPriority::Medium);
    }

    /// Turn a group of same-digest paths into one content-holding original
    /// plus links, recording all of them in the cache.
    async fn dedupe_existing_blobs(&self, digest: &Digest, paths: &[PathBuf]) -> Result<()> {
        let Some(cache) = &self.cache else {
            tracing::error!("no cache configured, cannot dedupe blobs");
            return Err(StoreError::DedupeRebuild);
        };

        tracing::info!(digest = %digest, "rebuild dedupe: deduping blobs");

        let mut original: Option<PathBuf> = None;

        for blob_path in paths {
            let info = self.driver.stat(blob_path).await?;

            if info.size == 0 {
                // already an alias from an earlier rebuild; make sure the
                // original is known and both ends are recorded
                if original.is_none() {
                    let found = self.find_original_blob(digest, paths).await?;
                    if !cache.has_blob(digest, &found.to_string_lossy()) {
                        cache.put_blob(digest, &found.to_string_lossy())?;
                    }
                    original = Some(found);
                }
                if !cache.has_blob(digest, &blob_path.to_string_lossy()) {
                    cache.put_blob(digest, &blob_path.to_string_lossy())?;
                }
            } else {
                if let Some(original) = &original {
                    self.driver.link(original, blob_path).await?;
                }
                if !cache.has_blob(digest, &blob_path.to_string_lossy()) {
                    cache.put_blob(digest, &blob_path.to_string_lossy())?;
                }
                original = Some(blob_path.clone());
            }
        }

        tracing::info!(digest = %digest, "rebuild dedupe: done");

        Ok(())
    }

    /// Give every alias in the group its own full copy of the content.
    async fn restore_deduped_blobs(&self, digest: &Digest, paths: &[PathBuf]) -> Result<()> {
        tracing::info!(digest = %digest, "rebuild dedupe: restoring deduped blobs");

        let original = self.find_original_blob(digest, paths).await?;

        for blob_path in paths {
            let info = self.driver.stat(blob_path).await?;
            if info.size == 0 {
                let buf = self.driver.read_file(&original).await?;
                self.driver.write_file(blob_path, &buf).await?;
            }
        }

        tracing::info!(digest = %digest, "rebuild dedupe: restore done");

        Ok(())
    }

    /// Locate the copy that actually holds content: the cache primary when
    /// it is live, otherwise the first non-empty path in the group.
    async fn find_original_blob(&self, digest: &Digest, paths: &[PathBuf]) -> Result<PathBuf> {
        match self.check_cache_blob(digest).await {
            Ok(path) => return Ok(path),
            Err(StoreError::BlobNotFound(_)) | Err(StoreError::CacheMiss) => {
                tracing::warn!(digest = %digest, "rebuild dedupe: no cached original, searching storage");
            }
            Err(err) => return Err(err),
        }

        for blob_path in paths {
            let info = self.driver.stat(blob_path).await?;
            if info.size > 0 {
                return Ok(blob_path.clone());
            }
        }

        Err(StoreError::DedupeRebuild)
    }
}

/// Yields one dedupe/restore task per digest group found on disk.
struct DedupeTaskGenerator {
    store: Arc<ImageStore>,
    dedupe: bool,
    seen: Vec<Digest>,
}

#[async_trait]
impl TaskGenerator for DedupeTaskGenerator {
    async fn next_task(&mut self) -> Result<Option<Box<dyn Task>>> {
        match self.store.get_next_digest_with_blob_paths(&self.seen).await? {
            Some((digest, paths)) => {
                self.seen.push(digest.clone());
                Ok(Some(Box::new(DedupeTask {
                    store: Arc::clone(&self.store),
                    digest,
                    paths,
                    dedupe: self.dedupe,
                })))
            }
            None => {
                // sweep finished; start over on the next interval
                self.seen.clear();
                Ok(None)
            }
        }
    }
}

struct DedupeTask {
    store: Arc<ImageStore>,
    digest: Digest,
    paths: Vec<PathBuf>,
    dedupe: bool,
}

#[async_trait]
impl Task for DedupeTask {
    async fn run(&self) -> Result<()> {
        self.store
            .run_dedupe_for_digest(&self.digest, self.dedupe, &self.paths)
            .await
    }

    fn name(&self) -> &str {
        "dedupe-blobs"
    }
}
