//! Garbage collection.
//!
//! Three phases per repository, all under the store write lock:
//!
//! 1. referrer sweep — manifests and indexes whose `subject` (or cosign
//!    sibling tag) no longer resolves are removed, looping to a fixed point
//!    since removing one referrer can orphan another;
//! 2. untagged retention — manifests with no tag and no index membership
//!    older than the retention delay are removed;
//! 3. orphan blob sweep — blob files unreachable from `index.json` and
//!    older than the GC delay are deleted, and a fully-reaped repository is
//!    removed outright.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use super::ImageStore;
use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{Result, StoreError};
use crate::oci::{
    is_manifest_media_type, Descriptor, ImageIndex, MEDIA_TYPE_ARTIFACT_MANIFEST,
    MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST,
};
use crate::scheduler::{Scheduler, Task, TaskGenerator, TaskPriority};

const COSIGN_SIGNATURE_TAG_SUFFIX: &str = "sig";
const SBOM_TAG_SUFFIX: &str = "sbom";

impl ImageStore {
    /// Garbage-collect one repository under the write lock.
    pub async fn gc_repo(&self, repo: &str) -> Result<()> {
        let _lock = self.wlock().await;
        self.garbage_collect(repo).await
    }

    /// Garbage-collect one repository, logging the outcome.
    pub async fn run_gc_repo(&self, repo: &str) -> Result<()> {
        tracing::info!(repository = repo, "executing GC of orphaned blobs");

        if let Err(err) = self.gc_repo(repo).await {
            tracing::error!(repository = repo, %err, "GC failed");
            return Err(err);
        }

        tracing::info!(repository = repo, "GC completed");

        Ok(())
    }

    /// Register the periodic round-robin GC sweep with the scheduler.
    ///
    /// A no-op unless the store was built with `gc` enabled.
    pub fn run_gc_periodically(
        self: &Arc<Self>,
        interval: Duration,
        scheduler: &dyn Scheduler,
    ) {
        if !self.gc {
            return;
        }

        let generator = GcTaskGenerator {
            store: Arc::clone(self),
            last: None,
        };

        scheduler.submit_generator(Box::new(generator), interval, TaskPriority::Medium);
    }

    async fn garbage_collect(&self, repo: &str) -> Result<()> {
        if self.gc_referrers {
            tracing::info!(repository = repo, "gc: manifests with missing referrers");

            // removing a referrer can orphan the next one, so sweep until a
            // full pass deletes nothing
            loop {
                let index = self.get_index(repo).await?;
                let collected = self
                    .garbage_collect_index_referrers(repo, &index, index.clone())
                    .await?;
                if !collected {
                    break;
                }
            }
        }

        let index = self.get_index(repo).await?;

        tracing::info!(repository = repo, "gc: manifests without tags");
        self.garbage_collect_untagged_manifests(repo, &index).await?;

        tracing::info!(repository = repo, "gc: blobs");
        self.garbage_collect_blobs(repo, self.gc_delay).await?;

        Ok(())
    }

    /// Sweep `index` for referrers whose subject is gone from `root_index`,
    /// descending into image indexes. Returns whether anything was removed.
    ///
    /// Removing an image index returns immediately: its members stay listed
    /// in `index.json` and are revisited by the next pass.
    fn garbage_collect_index_referrers<'a>(
        &'a self,
        repo: &'a str,
        root_index: &'a ImageIndex,
        index: ImageIndex,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let mut collected = 0usize;

            for desc in &index.manifests {
                match desc.media_type.as_str() {
                    MEDIA_TYPE_IMAGE_INDEX => {
                        let child = match self.parse_image_index(repo, &desc.digest).await {
                            Ok(child) => child,
                            Err(err) => {
                                tracing::error!(
                                    repository = repo,
                                    digest = %desc.digest,
                                    %err,
                                    "gc: failed to read image index"
                                );
                                return Err(err);
                            }
                        };

                        if self
                            .garbage_collect_referrer(repo, root_index, desc, child.subject.as_ref())
                            .await?
                        {
                            return Ok(true);
                        }

                        if self
                            .garbage_collect_index_referrers(repo, root_index, child)
                            .await?
                        {
                            collected += 1;
                        }
                    }
                    MEDIA_TYPE_IMAGE_MANIFEST => {
                        let manifest = match self.parse_image_manifest(repo, &desc.digest).await {
                            Ok(manifest) => manifest,
                            Err(err) => {
                                tracing::error!(
                                    repository = repo,
                                    digest = %desc.digest,
                                    %err,
                                    "gc: failed to read manifest"
                                );
                                return Err(err);
                            }
                        };

                        if self
                            .garbage_collect_referrer(
                                repo,
                                root_index,
                                desc,
                                manifest.subject.as_ref(),
                            )
                            .await?
                        {
                            collected += 1;
                        }
                    }
                    MEDIA_TYPE_ARTIFACT_MANIFEST => {
                        let artifact = self.parse_artifact_manifest(repo, &desc.digest).await?;

                        if self
                            .garbage_collect_referrer(
                                repo,
                                root_index,
                                desc,
                                artifact.subject.as_ref(),
                            )
                            .await?
                        {
                            collected += 1;
                        }
                    }
                    _ => {}
                }
            }

            Ok(collected > 0)
        })
    }

    /// Remove one referrer when its subject no longer resolves in the root
    /// index. Cosign-style sibling tags (`sha256-<hex>.sig` / `.sbom`)
    /// reference their subject through the tag itself.
    async fn garbage_collect_referrer(
        &self,
        repo: &str,
        root_index: &ImageIndex,
        desc: &Descriptor,
        subject: Option<&Descriptor>,
    ) -> Result<bool> {
        let mut collected = false;

        if let Some(subject) = subject {
            if !root_index.contains_digest(&subject.digest) {
                collected = self
                    .garbage_collect_manifest(repo, &desc.digest, self.gc_delay)
                    .await?;
            }
        }

        if let Some(tag) = desc.tag() {
            if let Some(subject_digest) = subject_digest_from_sibling_tag(tag) {
                if !root_index.contains_digest(&subject_digest) {
                    collected = self
                        .garbage_collect_manifest(repo, &desc.digest, self.gc_delay)
                        .await?;
                }
            }
        }

        Ok(collected)
    }

    /// Delete one manifest once its blob is older than `delay`. A digest
    /// shared by several tags is skipped, not an error.
    async fn garbage_collect_manifest(
        &self,
        repo: &str,
        digest: &Digest,
        delay: Duration,
    ) -> Result<bool> {
        if !self.is_blob_older_than(repo, digest, delay).await? {
            return Ok(false);
        }

        tracing::info!(repository = repo, digest = %digest, "gc: removing unreferenced manifest");

        match self
            .delete_image_manifest_unlocked(repo, &digest.to_string(), true)
            .await
        {
            Ok(()) => Ok(true),
            Err(StoreError::ManifestConflict) => {
                tracing::info!(repository = repo, digest = %digest, "gc: skipping manifest, tag collision");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Phase two: untagged manifests past the retention delay.
    async fn garbage_collect_untagged_manifests(
        &self,
        repo: &str,
        index: &ImageIndex,
    ) -> Result<()> {
        // members of image indexes and referrers are not retention fodder
        let referenced = self.manifests_referenced_in_index(repo, index).await?;

        for desc in &index.manifests {
            if referenced.contains(&desc.digest) {
                continue;
            }
            let sweepable = desc.media_type == MEDIA_TYPE_IMAGE_INDEX
                || is_manifest_media_type(&desc.media_type);
            if sweepable && desc.tag().is_none() {
                self.garbage_collect_manifest(repo, &desc.digest, self.retention_delay)
                    .await?;
            }
        }

        Ok(())
    }

    /// Phase three: blob files unreachable from the index.
    async fn garbage_collect_blobs(&self, repo: &str, delay: Duration) -> Result<()> {
        let referenced = self.reachable_blobs(repo).await?;

        let all_blobs = match self.get_all_blobs_unlocked(repo).await {
            Ok(blobs) => blobs,
            // blobs/sha256/ may not exist at all on object storage
            Err(err) if err.is_path_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let mut reaped = 0usize;

        for blob in &all_blobs {
            let digest = Digest::from_encoded(DigestAlgorithm::Sha256, blob).map_err(|err| {
                tracing::error!(repository = repo, blob, "gc: blob file is not a digest");
                err
            })?;

            if referenced.contains(&digest) {
                continue;
            }
            if !self.is_blob_older_than(repo, &digest, delay).await? {
                continue;
            }

            match self.delete_blob_unlocked(repo, &digest).await {
                Ok(()) => {}
                // raced a concurrent put that referenced the blob meanwhile
                Err(StoreError::BlobReferenced) => {
                    match self
                        .delete_image_manifest_unlocked(repo, &digest.to_string(), true)
                        .await
                    {
                        Ok(()) => {}
                        Err(StoreError::ManifestConflict) => continue,
                        Err(err) => {
                            tracing::error!(repository = repo, blob, %err, "gc: unable to delete blob");
                            return Err(err);
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(repository = repo, blob, %err, "gc: unable to delete blob");
                    return Err(err);
                }
            }

            tracing::info!(repository = repo, blob, "garbage collected blob");
            reaped += 1;
        }

        // a repo with nothing left is removed so the catalog stops listing it
        if reaped == all_blobs.len() {
            tracing::info!(repository = repo, "garbage collected all blobs, cleaning repo");
            self.driver.delete(&self.repo_dir(repo)).await?;
        }

        tracing::info!(repository = repo, count = reaped, "garbage collected blobs");

        Ok(())
    }

    async fn is_blob_older_than(
        &self,
        repo: &str,
        digest: &Digest,
        delay: Duration,
    ) -> Result<bool> {
        let (_, _, modified) = self.stat_blob_unlocked(repo, digest).await.map_err(|err| {
            tracing::error!(repository = repo, digest = %digest, %err, "gc: failed to stat blob");
            err
        })?;

        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);

        Ok(age >= delay)
    }
}

/// Recover the subject digest encoded in a cosign/SBOM sibling tag of the
/// form `sha256-<hex>.sig` or `sha256-<hex>.sbom`.
fn subject_digest_from_sibling_tag(tag: &str) -> Option<Digest> {
    let (algorithm, rest) = tag.split_once('-')?;
    if algorithm != DigestAlgorithm::Sha256.as_str() {
        return None;
    }

    let encoded = rest
        .strip_suffix(&format!(".{COSIGN_SIGNATURE_TAG_SUFFIX}"))
        .or_else(|| rest.strip_suffix(&format!(".{SBOM_TAG_SUFFIX}")))?;

    Digest::from_encoded(DigestAlgorithm::Sha256, encoded).ok()
}

/// Yields one repository GC task per tick, walking repos round-robin.
struct GcTaskGenerator {
    store: Arc<ImageStore>,
    last: Option<String>,
}

#[async_trait]
impl TaskGenerator for GcTaskGenerator {
    async fn next_task(&mut self) -> Result<Option<Box<dyn Task>>> {
        match self.store.get_next_repository(self.last.as_deref()).await? {
            Some(repo) => {
                self.last = Some(repo.clone());
                Ok(Some(Box::new(GcTask {
                    store: Arc::clone(&self.store),
                    repo,
                })))
            }
            None => {
                // walked every repo; restart on the next interval
                self.last = None;
                Ok(None)
            }
        }
    }
}

struct GcTask {
    store: Arc<ImageStore>,
    repo: String,
}

#[async_trait]
impl Task for GcTask {
    async fn run(&self) -> Result<()> {
        self.store.run_gc_repo(&self.repo).await
    }

    fn name(&self) -> &str {
        "garbage-collect"
    }
}
