//! File-backed dedupe cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::cache::BlobCache;
use crate::digest::Digest;
use crate::error::{Result, StoreError};

const CACHE_FILE: &str = "cache.json";

/// Dedupe cache persisted as a JSON file under the cache directory.
///
/// The full multimap lives in memory behind a `RwLock` and is written
/// through on every mutation, so a restarted store sees the same records.
/// Paths are stored relative to the store root when `use_relative_paths` is
/// set, which keeps the cache valid if the root directory moves.
pub struct FsBlobCache {
    file: PathBuf,
    root_dir: PathBuf,
    use_relative_paths: bool,
    entries: RwLock<HashMap<String, Vec<String>>>,
}

impl FsBlobCache {
    /// Open or create a cache under `cache_dir` for a store rooted at
    /// `root_dir`.
    pub fn new(cache_dir: &Path, root_dir: &Path, use_relative_paths: bool) -> Result<Self> {
        std::fs::create_dir_all(cache_dir)?;
        let file = cache_dir.join(CACHE_FILE);

        let entries = match std::fs::read(&file) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            file,
            root_dir: root_dir.to_path_buf(),
            use_relative_paths,
            entries: RwLock::new(entries),
        })
    }

    /// Strip the store root from absolute paths when running in relative
    /// mode, so records stay stable across root relocations.
    fn normalize(&self, path: &str) -> String {
        if !self.use_relative_paths {
            return path.to_string();
        }

        Path::new(path)
            .strip_prefix(&self.root_dir)
            .map(|rel| rel.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string())
    }

    fn persist(&self, entries: &HashMap<String, Vec<String>>) -> Result<()> {
        let data = serde_json::to_vec(entries)?;
        std::fs::write(&self.file, data)?;
        Ok(())
    }
}

impl BlobCache for FsBlobCache {
    fn get_blob(&self, digest: &Digest) -> Result<String> {
        let entries = self.entries.read().expect("cache lock poisoned");

        entries
            .get(&digest.to_string())
            .and_then(|paths| paths.first())
            .cloned()
            .ok_or(StoreError::CacheMiss)
    }

    fn put_blob(&self, digest: &Digest, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(StoreError::BlobNotFound(digest.to_string()));
        }
        let path = self.normalize(path);

        let mut entries = self.entries.write().expect("cache lock poisoned");
        let paths = entries.entry(digest.to_string()).or_default();
        if !paths.iter().any(|p| *p == path) {
            paths.push(path);
            self.persist(&entries)?;
        }

        Ok(())
    }

    fn has_blob(&self, digest: &Digest, path: &str) -> bool {
        let path = self.normalize(path);
        let entries = self.entries.read().expect("cache lock poisoned");

        entries
            .get(&digest.to_string())
            .map(|paths| paths.iter().any(|p| *p == path))
            .unwrap_or(false)
    }

    fn delete_blob(&self, digest: &Digest, path: &str) -> Result<()> {
        let path = self.normalize(path);
        let mut entries = self.entries.write().expect("cache lock poisoned");

        let key = digest.to_string();
        let mut changed = false;
        if let Some(paths) = entries.get_mut(&key) {
            let before = paths.len();
            paths.retain(|p| *p != path);
            changed = paths.len() != before;
            if paths.is_empty() {
                entries.remove(&key);
            }
        }

        if changed {
            self.persist(&entries)?;
        }

        Ok(())
    }

    fn uses_relative_paths(&self) -> bool {
        self.use_relative_paths
    }
}
