//! Blob dedupe cache.
//!
//! A persistent multimap from blob digest to the set of paths sharing that
//! content. The first recorded path is the *primary* — the copy that holds
//! the bytes; later paths are aliases created by dedupe. The cache is
//! deliberately allowed to drift from disk (GC and crashes both leave stale
//! records); store operations self-heal by deleting dead entries and
//! re-inserting live ones.

use crate::digest::Digest;
use crate::error::Result;

mod fscache;

pub use fscache::FsBlobCache;

/// Cache interface consumed by the store.
///
/// Implementations must be safe for concurrent readers; mutating calls are
/// serialized by the store's write lock.
pub trait BlobCache: Send + Sync {
    /// Primary path recorded for the digest.
    ///
    /// Fails with [`StoreError::CacheMiss`](crate::StoreError::CacheMiss)
    /// when the digest has no record.
    fn get_blob(&self, digest: &Digest) -> Result<String>;

    /// Record a path for the digest. Idempotent: an already-recorded path is
    /// not duplicated.
    fn put_blob(&self, digest: &Digest, path: &str) -> Result<()>;

    /// True when the exact (digest, path) pair is recorded.
    fn has_blob(&self, digest: &Digest, path: &str) -> bool;

    /// Remove one (digest, path) pair. Removing the primary promotes the
    /// next recorded path.
    fn delete_blob(&self, digest: &Digest, path: &str) -> Result<()>;

    /// True when recorded paths are relative to the store root rather than
    /// absolute.
    fn uses_relative_paths(&self) -> bool;
}
