//! Content-addressed OCI image store.
//!
//! This crate is the storage core of an OCI-compliant container registry:
//! per-repository image layouts with an append-only `index.json`, a pool of
//! content-addressed blobs, resumable chunked uploads with digest
//! verification, cross-repository blob dedupe backed by a persistent cache,
//! and a retention-aware garbage collector for orphan blobs, untagged
//! manifests, and dangling referrers.
//!
//! The HTTP surface, authentication, configuration loading, and the
//! scheduler that drives periodic maintenance all live outside this crate;
//! they reach the store through [`ImageStore`]'s public operations and the
//! [`Scheduler`]/[`MetricsObserver`]/[`Lint`] seams.

pub mod cache;
pub mod digest;
pub mod driver;
pub mod error;
pub mod linter;
pub mod metrics;
pub mod oci;
pub mod scheduler;
pub mod store;

pub use cache::{BlobCache, FsBlobCache};
pub use digest::{Digest, DigestAlgorithm};
pub use driver::{BlobReader, FileInfo, FileWriter, LocalDriver, StorageDriver};
pub use error::{Result, StoreError};
pub use linter::{Lint, ManifestValidator};
pub use metrics::{LockKind, MetricsObserver, NullMetrics, StoreMetrics};
pub use scheduler::{Scheduler, Task, TaskGenerator, TaskPriority};
pub use store::{ImageStore, StoreOptions};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
