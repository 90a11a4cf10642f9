use thiserror::Error;

/// Image store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Repository name is not a valid distribution-spec name
    #[error("invalid repository name: {0}")]
    InvalidRepositoryName(String),

    /// Repository does not exist under the store root
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// Repository layout exists but is incomplete or carries a bad version
    #[error("repository has invalid OCI layout version")]
    RepoBadVersion,

    /// No manifest matches the given tag or digest
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Manifest body or reference is invalid
    #[error("bad manifest")]
    BadManifest,

    /// Manifest is still referenced through an image index
    #[error("manifest is referenced by an image index")]
    ManifestReferenced,

    /// A digest reference matches more than one descriptor
    #[error("manifest digest matches multiple descriptors")]
    ManifestConflict,

    /// Blob is not present in the repository
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Uploaded content does not hash to the expected digest
    #[error("blob digest mismatch")]
    BadBlobDigest,

    /// Blob is referenced by a manifest and cannot be deleted
    #[error("blob is referenced by a manifest")]
    BlobReferenced,

    /// Requested byte range is not satisfiable
    #[error("unsatisfiable blob range")]
    BadRange,

    /// No in-progress upload with the given session id
    #[error("upload not found: {0}")]
    UploadNotFound(String),

    /// Chunk offset does not match the current upload size
    #[error("invalid upload range")]
    BadUploadRange,

    /// Digest string failed to parse or validate
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Dedupe cache has no record for the digest
    #[error("cache: digest record not found")]
    CacheMiss,

    /// Dedupe rebuild could not locate an original blob
    #[error("dedupe rebuild failed")]
    DedupeRebuild,

    /// Storage driver could not find the path
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// I/O error from the storage driver
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the error is the driver's missing-path kind.
    ///
    /// Callers translate this contextually: a missing repository directory
    /// becomes `RepoNotFound`, a missing upload becomes `UploadNotFound`, and
    /// a missing store root is treated as an empty store.
    pub fn is_path_not_found(&self) -> bool {
        matches!(self, StoreError::PathNotFound(_))
    }
}

/// Result type alias for image store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
