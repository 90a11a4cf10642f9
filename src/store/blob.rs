//! Blob access: existence checks, stat, streaming reads, and deletion.

use std::path::PathBuf;
use std::time::SystemTime;

use tokio::io::AsyncReadExt;

use super::{ImageStore, BLOBS_DIR};
use crate::digest::{Digest, DigestAlgorithm};
use crate::driver::BlobReader;
use crate::error::{Result, StoreError};

impl ImageStore {
    /// Verify a blob is available in the repository, returning its size.
    ///
    /// With dedupe enabled this takes the write lock: a blob missing from
    /// the repository but recorded in the cache is materialized here as a
    /// new link, which is a mutation.
    pub async fn check_blob(&self, repo: &str, digest: &Digest) -> Result<(bool, u64)> {
        let blob_path = self.blob_path(repo, digest);

        let _lock = if self.dedupe_enabled() {
            self.wlock().await
        } else {
            self.rlock().await
        };

        if let Ok(info) = self.driver.stat(&blob_path).await {
            if info.size > 0 {
                tracing::debug!(blob = %blob_path.display(), "blob found");
                return Ok((true, info.size));
            }
        }
        // missing or a zero-byte dedupe alias: resolve through the cache

        let record = match self.check_cache_blob(digest).await {
            Ok(record) => record,
            Err(err) => {
                tracing::debug!(digest = %digest, %err, "blob not found in cache");
                return Err(StoreError::BlobNotFound(digest.to_string()));
            }
        };

        let size = self
            .copy_blob(repo, &blob_path, &record)
            .await
            .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;

        if let Some(cache) = &self.cache {
            cache.put_blob(digest, &blob_path.to_string_lossy())?;
        }

        Ok((true, size))
    }

    /// Whether the blob is present, with its size and modification time.
    pub async fn stat_blob(&self, repo: &str, digest: &Digest) -> Result<(bool, u64, SystemTime)> {
        let _lock = self.rlock().await;
        self.stat_blob_unlocked(repo, digest).await
    }

    pub(crate) async fn stat_blob_unlocked(
        &self,
        repo: &str,
        digest: &Digest,
    ) -> Result<(bool, u64, SystemTime)> {
        let blob_path = self.blob_path(repo, digest);

        let info = self
            .driver
            .stat(&blob_path)
            .await
            .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;
        if info.size > 0 {
            return Ok((true, info.size, info.modified));
        }

        // zero bytes on disk: the content lives at the cache's primary path
        let record = self
            .check_cache_blob(digest)
            .await
            .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;
        let info = self
            .driver
            .stat(&record)
            .await
            .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;

        Ok((true, info.size, info.modified))
    }

    /// Open a stream over the blob's full content.
    pub async fn get_blob(
        &self,
        repo: &str,
        digest: &Digest,
        media_type: &str,
    ) -> Result<(BlobReader, u64)> {
        let blob_path = self.blob_path(repo, digest);

        let _lock = self.rlock().await;

        let info = self
            .driver
            .stat(&blob_path)
            .await
            .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;

        tracing::debug!(blob = %blob_path.display(), media_type, "serving blob");

        let source = if info.size == 0 {
            self.check_cache_blob(digest)
                .await
                .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?
        } else {
            blob_path
        };

        let info = self
            .driver
            .stat(&source)
            .await
            .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;
        let reader = self.driver.reader(&source, 0).await?;

        Ok((reader, info.size))
    }

    /// Open a stream over bytes `from..=to` of the blob. `to = None` reads
    /// to the end. Returns the stream, its length, and the blob's total
    /// size.
    pub async fn get_blob_partial(
        &self,
        repo: &str,
        digest: &Digest,
        media_type: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<(BlobReader, u64, u64)> {
        if let Some(to) = to {
            if to < from {
                return Err(StoreError::BadRange);
            }
        }

        let blob_path = self.blob_path(repo, digest);

        let _lock = self.rlock().await;

        let mut source = blob_path;
        let mut info = self
            .driver
            .stat(&source)
            .await
            .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;

        if info.size == 0 {
            source = self
                .check_cache_blob(digest)
                .await
                .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;
            info = self
                .driver
                .stat(&source)
                .await
                .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;
        }

        tracing::debug!(blob = %source.display(), media_type, from, "serving blob range");

        let end = match to {
            Some(to) if to < info.size => to,
            _ => info.size.saturating_sub(1),
        };
        if from >= info.size {
            return Err(StoreError::BadRange);
        }

        let length = end - from + 1;
        let reader = self.driver.reader(&source, from).await?;

        Ok((Box::new(reader.take(length)), length, info.size))
    }

    /// The blob's full content as bytes.
    pub async fn get_blob_content(&self, repo: &str, digest: &Digest) -> Result<Vec<u8>> {
        let _lock = self.rlock().await;
        self.get_blob_content_unlocked(repo, digest).await
    }

    pub(crate) async fn get_blob_content_unlocked(
        &self,
        repo: &str,
        digest: &Digest,
    ) -> Result<Vec<u8>> {
        let blob_path = self.blob_path(repo, digest);

        let info = self
            .driver
            .stat(&blob_path)
            .await
            .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;

        if info.size == 0 {
            let record = self
                .check_cache_blob(digest)
                .await
                .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;
            return self.driver.read_file(&record).await;
        }

        self.driver.read_file(&blob_path).await
    }

    /// Remove a blob from the repository.
    ///
    /// Fails with `BlobReferenced` when the blob is still reachable from
    /// `index.json`. When the deleted path held the deduped content and
    /// other repositories still alias it, the content migrates to the next
    /// cache candidate before the path goes away.
    pub async fn delete_blob(&self, repo: &str, digest: &Digest) -> Result<()> {
        let _lock = self.wlock().await;
        self.delete_blob_unlocked(repo, digest).await
    }

    pub(crate) async fn delete_blob_unlocked(&self, repo: &str, digest: &Digest) -> Result<()> {
        let blob_path = self.blob_path(repo, digest);

        self.driver
            .stat(&blob_path)
            .await
            .map_err(|_| StoreError::BlobNotFound(digest.to_string()))?;

        if self.is_blob_referenced(repo, digest).await.unwrap_or(false) {
            return Err(StoreError::BlobReferenced);
        }

        if let Some(cache) = &self.cache {
            let blob_path_str = blob_path.to_string_lossy();

            let primary = match cache.get_blob(digest) {
                Ok(record) => Some(self.resolve_cache_record(&record)),
                Err(StoreError::CacheMiss) => None,
                Err(err) => return Err(err),
            };

            if cache.has_blob(digest, &blob_path_str) {
                cache.delete_blob(digest, &blob_path_str)?;
            }

            // deleting the copy that holds the content: migrate it to the
            // next candidate when that candidate is a zero-byte alias
            if primary.as_deref() == Some(blob_path.as_path()) {
                match cache.get_blob(digest) {
                    Ok(next) => {
                        let next = self.resolve_cache_record(&next);
                        let info = self.driver.stat(&next).await?;
                        if info.size == 0 {
                            self.driver.move_file(&blob_path, &next).await?;
                            return Ok(());
                        }
                    }
                    Err(StoreError::CacheMiss) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        self.driver.delete(&blob_path).await?;

        Ok(())
    }

    /// Hex digests of every blob file in the repository.
    pub async fn get_all_blobs(&self, repo: &str) -> Result<Vec<String>> {
        let _lock = self.rlock().await;
        self.get_all_blobs_unlocked(repo).await
    }

    pub(crate) async fn get_all_blobs_unlocked(&self, repo: &str) -> Result<Vec<String>> {
        let dir = self
            .repo_dir(repo)
            .join(BLOBS_DIR)
            .join(DigestAlgorithm::Sha256.as_str());

        let files = self.driver.list(&dir).await?;

        Ok(files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .map(str::to_string)
            .collect())
    }

    /// Resolve a cache record to an absolute path.
    pub(crate) fn resolve_cache_record(&self, record: &str) -> PathBuf {
        match &self.cache {
            Some(cache) if cache.uses_relative_paths() => self.root_dir.join(record),
            _ => PathBuf::from(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempfile::TempDir;

    use super::super::testing::new_store;
    use super::*;

    async fn push_blob(store: &ImageStore, repo: &str, content: &[u8]) -> Digest {
        let digest = Digest::sha256_from_bytes(content);
        let mut body = Cursor::new(content.to_vec());
        store.full_blob_upload(repo, &mut body, &digest).await.unwrap();
        digest
    }

    #[tokio::test]
    async fn test_get_blob_streams_content() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;
        let digest = push_blob(&store, "repo", b"0123456789").await;

        let (mut reader, size) = store
            .get_blob("repo", &digest, "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(size, 10);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123456789");
    }

    #[tokio::test]
    async fn test_get_blob_missing() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;
        store.init_repo("repo").await.unwrap();

        let digest = Digest::sha256_from_bytes(b"ghost");
        let err = store
            .get_blob("repo", &digest, "application/octet-stream")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::BlobNotFound(_)));
    }

    #[tokio::test]
    async fn test_get_blob_partial_ranges() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;
        let digest = push_blob(&store, "repo", b"0123456789").await;

        let (mut reader, length, total) = store
            .get_blob_partial("repo", &digest, "application/octet-stream", 2, Some(5))
            .await
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"2345");
        assert_eq!(length, 4);
        assert_eq!(total, 10);

        // open-ended range reads to the end
        let (mut reader, length, _) = store
            .get_blob_partial("repo", &digest, "application/octet-stream", 7, None)
            .await
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"789");
        assert_eq!(length, 3);

        // a range past the end is clamped
        let (_, length, _) = store
            .get_blob_partial("repo", &digest, "application/octet-stream", 8, Some(100))
            .await
            .unwrap();
        assert_eq!(length, 2);

        let err = store
            .get_blob_partial("repo", &digest, "application/octet-stream", 5, Some(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::BadRange));
    }

    #[tokio::test]
    async fn test_stat_blob() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;
        let digest = push_blob(&store, "repo", b"content").await;

        let (found, size, _mtime) = store.stat_blob("repo", &digest).await.unwrap();
        assert!(found);
        assert_eq!(size, 7);

        let missing = Digest::sha256_from_bytes(b"missing");
        let err = store.stat_blob("repo", &missing).await.unwrap_err();
        assert!(matches!(err, StoreError::BlobNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_blob() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;
        let digest = push_blob(&store, "repo", b"content").await;

        store.delete_blob("repo", &digest).await.unwrap();

        let err = store.check_blob("repo", &digest).await.unwrap_err();
        assert!(matches!(err, StoreError::BlobNotFound(_)));

        let err = store.delete_blob("repo", &digest).await.unwrap_err();
        assert!(matches!(err, StoreError::BlobNotFound(_)));
    }

    #[tokio::test]
    async fn test_get_all_blobs() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;

        let d1 = push_blob(&store, "repo", b"one").await;
        let d2 = push_blob(&store, "repo", b"two").await;

        let mut blobs = store.get_all_blobs("repo").await.unwrap();
        blobs.sort();

        let mut expected = vec![d1.encoded().to_string(), d2.encoded().to_string()];
        expected.sort();
        assert_eq!(blobs, expected);
    }

    #[tokio::test]
    async fn test_check_blob_dedupe_materializes_cross_repo_link() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, true, false).await;
        let digest = push_blob(&store, "a", b"shared layer").await;

        // repo b never saw the blob, but the cache knows the content
        store.init_repo("b").await.unwrap();
        let (found, size) = store.check_blob("b", &digest).await.unwrap();
        assert!(found);
        assert_eq!(size, 12);

        assert_eq!(
            store.get_blob_content("b", &digest).await.unwrap(),
            b"shared layer"
        );
    }
}
