//! Storage driver abstraction.
//!
//! The store talks to its backing storage exclusively through
//! [`StorageDriver`], which narrows the backend to the primitives a
//! content-addressed layout needs. The in-tree implementation is the POSIX
//! [`LocalDriver`]; object-store backends implement the same trait out of
//! tree, with `link` simulated by a server-side copy (after which
//! `same_file` must report true for the pair) and missing prefixes reported
//! as [`StoreError::PathNotFound`](crate::StoreError::PathNotFound).

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

mod local;

pub use local::LocalDriver;

/// Driver name reported by the local filesystem implementation.
///
/// Layout validation relaxes the empty-directory checks for any other driver,
/// since object stores cannot represent empty prefixes.
pub const LOCAL_DRIVER_NAME: &str = "local";

/// Metadata for a stored file or directory.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
}

/// Streaming reader handed out by [`StorageDriver::reader`].
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// A handle to an in-progress upload file.
///
/// Bytes written through the `AsyncWrite` impl append to the upload.
/// `commit` finishes the multipart write and makes the contents readable;
/// `cancel` aborts the upload and removes the partial file.
#[async_trait]
pub trait FileWriter: AsyncWrite + Send + Unpin {
    /// Number of bytes accumulated so far.
    fn size(&self) -> u64;

    async fn commit(&mut self) -> Result<()>;

    async fn cancel(&mut self) -> Result<()>;
}

/// Capability set the image store requires from a storage backend.
///
/// All paths are absolute within the backend's namespace. Missing paths
/// surface as `StoreError::PathNotFound` so callers can translate them
/// contextually.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Backend name; [`LOCAL_DRIVER_NAME`] for the filesystem driver.
    fn name(&self) -> &'static str;

    /// Create the directory and any missing parents. Idempotent.
    async fn ensure_dir(&self, path: &Path) -> Result<()>;

    async fn dir_exists(&self, path: &Path) -> bool;

    async fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Immediate children of a directory, lexically sorted.
    async fn list(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Every entry under `root`, depth-first with each directory's children
    /// visited in lexical order. A missing root is `PathNotFound`, which
    /// store-level callers treat as an empty store.
    async fn walk(&self, root: &Path) -> Result<Vec<FileInfo>>;

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Write a whole file atomically, creating parent directories. Returns
    /// the number of bytes written.
    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<usize>;

    /// Move `src` over `dst`, atomically where the backend allows.
    async fn move_file(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Remove a file, or a directory and everything under it.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Make `dst` reference the content of `src`, atomically replacing any
    /// existing `dst`.
    async fn link(&self, src: &Path, dst: &Path) -> Result<()>;

    /// True when both paths resolve to the same stored content.
    async fn same_file(&self, a: &Path, b: &Path) -> bool;

    /// Open a streaming reader positioned at `offset`.
    async fn reader(&self, path: &Path, offset: u64) -> Result<BlobReader>;

    /// Open an upload writer. With `append` the file must already exist;
    /// without it a fresh empty upload is created.
    async fn writer(&self, path: &Path, append: bool) -> Result<Box<dyn FileWriter>>;
}
