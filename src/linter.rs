//! External validation hooks.
//!
//! Both hooks are collaborators owned by the embedding registry: the store
//! only calls them at the points `put_image_manifest` defines and aborts the
//! put when they object.

use async_trait::async_trait;

use crate::digest::Digest;
use crate::error::Result;

/// Media-type-specific manifest validation.
///
/// Invoked before a manifest body is accepted, outside the store lock. The
/// store itself only checks what it needs (parseable JSON where it reads
/// subjects, digest agreement); media-type acceptance and schema-level
/// validation live behind this hook.
#[async_trait]
pub trait ManifestValidator: Send + Sync {
    async fn validate(&self, repo: &str, media_type: &str, body: &[u8]) -> Result<()>;
}

/// Descriptor linter applied after the manifest blob is written and before
/// `index.json` is updated. Returning `Ok(false)` aborts the put without
/// mutating the index.
///
/// Runs under the store write lock, so implementations work from the
/// manifest bytes they are handed rather than calling back into the store.
#[async_trait]
pub trait Lint: Send + Sync {
    async fn lint(&self, repo: &str, manifest_digest: &Digest, manifest: &[u8]) -> Result<bool>;
}
