//! Blob upload engine: resumable chunked uploads and single-shot uploads,
//! finalized into content-addressed paths.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use super::ImageStore;
use crate::digest::Digest;
use crate::error::{Result, StoreError};

impl ImageStore {
    /// Open a new upload session, returning its id.
    pub async fn new_blob_upload(&self, repo: &str) -> Result<String> {
        self.init_repo(repo).await?;

        let uuid = Uuid::new_v4().to_string();
        let upload_path = self.blob_upload_path(repo, &uuid);

        // an upload starts as an empty multipart writer
        match self.driver.writer(&upload_path, false).await {
            Ok(_writer) => Ok(uuid),
            Err(err) => {
                tracing::debug!(upload = %upload_path.display(), %err, "failed to start upload");
                Err(StoreError::RepoNotFound(repo.to_string()))
            }
        }
    }

    /// Current size of an in-progress upload.
    pub async fn blob_upload_info(&self, repo: &str, uuid: &str) -> Result<u64> {
        let upload_path = self.blob_upload_path(repo, uuid);

        let writer = match self.driver.writer(&upload_path, true).await {
            Ok(writer) => writer,
            Err(err) if err.is_path_not_found() => {
                return Err(StoreError::UploadNotFound(uuid.to_string()))
            }
            Err(err) => return Err(err),
        };

        Ok(writer.size())
    }

    /// Current size of an in-progress upload.
    pub async fn get_blob_upload(&self, repo: &str, uuid: &str) -> Result<u64> {
        self.blob_upload_info(repo, uuid).await
    }

    /// Append a chunk without range bookkeeping. Returns bytes copied.
    pub async fn put_blob_chunk_streamed<R>(
        &self,
        repo: &str,
        uuid: &str,
        body: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.init_repo(repo).await?;

        let upload_path = self.blob_upload_path(repo, uuid);
        let mut writer = match self.driver.writer(&upload_path, true).await {
            Ok(writer) => writer,
            Err(err) if err.is_path_not_found() => {
                return Err(StoreError::UploadNotFound(uuid.to_string()))
            }
            Err(err) => {
                tracing::error!(%err, "failed to continue upload");
                return Err(err);
            }
        };

        let copied = tokio::io::copy(body, &mut writer).await?;
        writer.flush().await?;

        Ok(copied)
    }

    /// Append a chunk covering bytes `from..=to`. The chunk must start
    /// exactly where the upload currently ends. Returns bytes copied.
    pub async fn put_blob_chunk<R>(
        &self,
        repo: &str,
        uuid: &str,
        from: u64,
        to: u64,
        body: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        if to < from {
            return Err(StoreError::BadUploadRange);
        }

        self.init_repo(repo).await?;

        let upload_path = self.blob_upload_path(repo, uuid);
        let mut writer = match self.driver.writer(&upload_path, true).await {
            Ok(writer) => writer,
            Err(err) if err.is_path_not_found() => {
                return Err(StoreError::UploadNotFound(uuid.to_string()))
            }
            Err(err) => {
                tracing::error!(%err, "failed to continue upload");
                return Err(err);
            }
        };

        if from != writer.size() {
            tracing::error!(
                expected = from,
                actual = writer.size(),
                "invalid range start for blob upload"
            );
            return Err(StoreError::BadUploadRange);
        }

        let copied = tokio::io::copy(body, &mut writer).await?;
        writer.flush().await?;

        Ok(copied)
    }

    /// Finalize an upload: verify the digest and move the content into the
    /// blob store, deduping against existing copies when enabled.
    pub async fn finish_blob_upload(
        &self,
        repo: &str,
        uuid: &str,
        expected: &Digest,
    ) -> Result<()> {
        let src = self.blob_upload_path(repo, uuid);

        let mut writer = match self.driver.writer(&src, true).await {
            Ok(writer) => writer,
            Err(_) => return Err(StoreError::UploadNotFound(uuid.to_string())),
        };
        writer.commit().await?;
        drop(writer);

        let mut reader = match self.driver.reader(&src, 0).await {
            Ok(reader) => reader,
            Err(_) => return Err(StoreError::UploadNotFound(uuid.to_string())),
        };
        let (actual, _) = Digest::sha256_from_reader(reader.as_mut()).await?;
        drop(reader);

        if actual != *expected {
            tracing::error!(
                expected = %expected,
                actual = %actual,
                "upload digest does not match expected digest"
            );
            return Err(StoreError::BadBlobDigest);
        }

        let dst = self.blob_path(repo, expected);
        if let Some(parent) = dst.parent() {
            self.driver.ensure_dir(parent).await?;
        }

        let _lock = self.wlock().await;

        if self.dedupe_enabled() {
            self.dedupe_blob(&src, expected, &dst).await?;
        } else {
            self.driver.move_file(&src, &dst).await?;
        }

        Ok(())
    }

    /// Single-shot upload: buffer the body, verify its digest, and finalize
    /// it in one call. Returns the session id and the byte count.
    ///
    /// The body is buffered because the digest must be known before the
    /// write completes on backends without rename.
    pub async fn full_blob_upload<R>(
        &self,
        repo: &str,
        body: &mut R,
        expected: &Digest,
    ) -> Result<(String, u64)>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.init_repo(repo).await?;

        let uuid = Uuid::new_v4().to_string();
        let src = self.blob_upload_path(repo, &uuid);

        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await?;

        let written = self.driver.write_file(&src, &buf).await?;

        let actual = Digest::sha256_from_bytes(&buf);
        if actual != *expected {
            tracing::error!(
                expected = %expected,
                actual = %actual,
                "upload digest does not match expected digest"
            );
            return Err(StoreError::BadBlobDigest);
        }

        let dst = self.blob_path(repo, expected);
        if let Some(parent) = dst.parent() {
            self.driver.ensure_dir(parent).await?;
        }

        let _lock = self.wlock().await;

        if self.dedupe_enabled() {
            self.dedupe_blob(&src, expected, &dst).await?;
        } else {
            self.driver.move_file(&src, &dst).await?;
        }

        Ok((uuid, written as u64))
    }

    /// Abort an in-progress upload and discard its partial content.
    pub async fn delete_blob_upload(&self, repo: &str, uuid: &str) -> Result<()> {
        let upload_path = self.blob_upload_path(repo, uuid);

        let mut writer = match self.driver.writer(&upload_path, true).await {
            Ok(writer) => writer,
            Err(err) if err.is_path_not_found() => {
                return Err(StoreError::UploadNotFound(uuid.to_string()))
            }
            Err(err) => return Err(err),
        };

        writer.cancel().await?;

        Ok(())
    }
}
