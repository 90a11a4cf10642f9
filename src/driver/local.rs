//! POSIX filesystem storage driver.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};
use uuid::Uuid;

use super::{BlobReader, FileInfo, FileWriter, StorageDriver, LOCAL_DRIVER_NAME};
use crate::error::{Result, StoreError};

/// Storage driver backed by a local filesystem.
///
/// `move_file` is a POSIX rename and `link` is a hardlink, so finalized
/// blobs never exist half-written and deduped paths share one inode. With
/// `commit` enabled every completed write is fsynced before it becomes
/// visible.
pub struct LocalDriver {
    commit: bool,
}

impl LocalDriver {
    pub fn new(commit: bool) -> Self {
        Self { commit }
    }
}

fn not_found(path: &Path) -> StoreError {
    StoreError::PathNotFound(path.display().to_string())
}

fn map_io(err: io::Error, path: &Path) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        not_found(path)
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    fn name(&self) -> &'static str {
        LOCAL_DRIVER_NAME
    }

    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn dir_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| map_io(e, path))?;

        Ok(FileInfo {
            path: path.to_path_buf(),
            size: meta.len(),
            modified: meta.modified()?,
            is_dir: meta.is_dir(),
        })
    }

    async fn list(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| map_io(e, path))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.path());
        }
        entries.sort();

        Ok(entries)
    }

    async fn walk(&self, root: &Path) -> Result<Vec<FileInfo>> {
        // surface a missing root as PathNotFound before descending
        self.stat(root).await?;

        let mut out = Vec::new();
        // pre-order depth-first: a directory's entries come right after it,
        // before its later siblings; reversed pushes make the stack pop in
        // lexical order
        let mut stack: Vec<_> = self.list(root).await?.into_iter().rev().collect();

        while let Some(path) = stack.pop() {
            let info = self.stat(&path).await?;
            let is_dir = info.is_dir;
            out.push(info);

            if is_dir {
                for child in self.list(&path).await?.into_iter().rev() {
                    stack.push(child);
                }
            }
        }

        Ok(out)
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|e| map_io(e, path))
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<usize> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // stage in the same directory so the final rename is atomic
        let staging = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&staging).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        if self.commit {
            file.sync_all().await?;
        }
        drop(file);

        tokio::fs::rename(&staging, path).await?;

        Ok(contents.len())
    }

    async fn move_file(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(src, dst).await.map_err(|e| map_io(e, src))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| map_io(e, path))?;

        if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }

        Ok(())
    }

    async fn link(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // link to a staging name first so an existing dst is replaced atomically
        let staging = dst.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::hard_link(src, &staging)
            .await
            .map_err(|e| map_io(e, src))?;

        if let Err(err) = tokio::fs::rename(&staging, dst).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err.into());
        }

        Ok(())
    }

    async fn same_file(&self, a: &Path, b: &Path) -> bool {
        use std::os::unix::fs::MetadataExt;

        let (Ok(ma), Ok(mb)) = (tokio::fs::metadata(a).await, tokio::fs::metadata(b).await)
        else {
            return false;
        };

        ma.dev() == mb.dev() && ma.ino() == mb.ino()
    }

    async fn reader(&self, path: &Path, offset: u64) -> Result<BlobReader> {
        let mut file = File::open(path).await.map_err(|e| map_io(e, path))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        Ok(Box::new(file))
    }

    async fn writer(&self, path: &Path, append: bool) -> Result<Box<dyn FileWriter>> {
        let (file, size) = if append {
            let file = OpenOptions::new()
                .append(true)
                .open(path)
                .await
                .map_err(|e| map_io(e, path))?;
            let size = file.metadata().await?.len();
            (file, size)
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .await
                .map_err(|e| map_io(e, path))?;
            (file, 0)
        };

        Ok(Box::new(LocalFileWriter {
            file,
            path: path.to_path_buf(),
            size,
            sync: self.commit,
        }))
    }
}

/// Upload writer over a plain file.
struct LocalFileWriter {
    file: File,
    path: PathBuf,
    size: u64,
    sync: bool,
}

impl AsyncWrite for LocalFileWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.size += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

#[async_trait]
impl FileWriter for LocalFileWriter {
    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(&mut self) -> Result<()> {
        self.file.flush().await?;
        if self.sync {
            self.file.sync_all().await?;
        }
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        tokio::fs::remove_file(&self.path)
            .await
            .map_err(|e| map_io(e, &self.path))?;
        self.size = 0;
        Ok(())
    }
}
