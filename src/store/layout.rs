//! Repository layout management.
//!
//! Creates and validates the per-repository OCI layout and enumerates the
//! repositories under the store root.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ImageStore, BLOBS_DIR, BLOB_UPLOAD_DIR, INDEX_JSON};
use crate::driver::LOCAL_DRIVER_NAME;
use crate::error::{Result, StoreError};
use crate::oci::{ImageIndex, OciLayout, IMAGE_LAYOUT_FILE, IMAGE_LAYOUT_VERSION};

// distribution-spec repository names: path components separated by "/"
static REPO_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
        .expect("valid repository name pattern")
});

pub(crate) fn valid_repo_name(name: &str) -> bool {
    REPO_NAME_RE.is_match(name)
}

impl ImageStore {
    /// Create an image repository under this store. Idempotent.
    pub async fn init_repo(&self, name: &str) -> Result<()> {
        let _lock = self.wlock().await;
        self.init_repo_unlocked(name).await
    }

    pub(crate) async fn init_repo_unlocked(&self, name: &str) -> Result<()> {
        if !valid_repo_name(name) {
            tracing::error!(repository = name, "invalid repository name");
            return Err(StoreError::InvalidRepositoryName(name.to_string()));
        }

        let repo_dir = self.repo_dir(name);

        self.driver.ensure_dir(&repo_dir.join(BLOBS_DIR)).await?;
        self.driver.ensure_dir(&repo_dir.join(BLOB_UPLOAD_DIR)).await?;

        let layout_path = repo_dir.join(IMAGE_LAYOUT_FILE);
        if self.driver.stat(&layout_path).await.is_err() {
            let buf = serde_json::to_vec(&OciLayout::default())?;
            self.driver.write_file(&layout_path, &buf).await?;
        }

        let index_path = repo_dir.join(INDEX_JSON);
        if self.driver.stat(&index_path).await.is_err() {
            let buf = serde_json::to_vec(&ImageIndex::new())?;
            self.driver.write_file(&index_path, &buf).await?;
        }

        Ok(())
    }

    /// Check that the repository directory is a complete OCI layout.
    ///
    /// May be called with the store lock held, so it never locks itself.
    pub async fn validate_repo(&self, name: &str) -> Result<bool> {
        if !valid_repo_name(name) {
            return Err(StoreError::InvalidRepositoryName(name.to_string()));
        }

        let dir = self.repo_dir(name);
        match self.driver.stat(&dir).await {
            Ok(info) if info.is_dir => {}
            _ => return Err(StoreError::RepoNotFound(name.to_string())),
        }

        let files = self
            .driver
            .list(&dir)
            .await
            .map_err(|_| StoreError::RepoNotFound(name.to_string()))?;

        // at a minimum: "oci-layout" and "index.json"; "blobs" only shows up
        // on drivers that can represent empty directories
        if files.len() < 2 {
            return Err(StoreError::RepoBadVersion);
        }

        let mut found_layout = false;
        let mut found_index = false;
        for file in &files {
            let info = self.driver.stat(file).await?;
            match file.file_name().and_then(|n| n.to_str()) {
                Some(BLOBS_DIR) if !info.is_dir => return Ok(false),
                Some(IMAGE_LAYOUT_FILE) => found_layout = true,
                Some(INDEX_JSON) => found_index = true,
                _ => {}
            }
        }

        if self.driver.name() == LOCAL_DRIVER_NAME && !self.driver.dir_exists(&dir.join(BLOBS_DIR)).await
        {
            return Ok(false);
        }

        if !found_layout || !found_index {
            return Ok(false);
        }

        let buf = self.driver.read_file(&dir.join(IMAGE_LAYOUT_FILE)).await?;
        let layout: OciLayout = serde_json::from_slice(&buf)?;
        if layout.version != IMAGE_LAYOUT_VERSION {
            return Err(StoreError::RepoBadVersion);
        }

        Ok(true)
    }

    /// All valid repositories under the store root, in walk order.
    pub async fn get_repositories(&self) -> Result<Vec<String>> {
        let _lock = self.rlock().await;

        let entries = match self.driver.walk(&self.root_dir).await {
            Ok(entries) => entries,
            // root not created yet means no repositories, not an error
            Err(err) if err.is_path_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut repos = Vec::new();
        for info in entries {
            if !info.is_dir {
                continue;
            }
            let Ok(rel) = info.path.strip_prefix(&self.root_dir) else {
                continue;
            };
            let name = rel.to_string_lossy();
            if matches!(self.validate_repo(&name).await, Ok(true)) {
                repos.push(name.into_owned());
            }
        }

        Ok(repos)
    }

    /// The repository sorted after `prev` in walk order, used for
    /// round-robin sweeps. `None` starts from the beginning; `Ok(None)`
    /// means the walk is exhausted.
    pub async fn get_next_repository(&self, prev: Option<&str>) -> Result<Option<String>> {
        let _lock = self.rlock().await;

        self.driver.list(&self.root_dir).await?;

        let entries = self.driver.walk(&self.root_dir).await?;
        let mut found = prev.is_none();
        for info in entries {
            if !info.is_dir {
                continue;
            }
            let Ok(rel) = info.path.strip_prefix(&self.root_dir) else {
                continue;
            };
            let name = rel.to_string_lossy();
            if !matches!(self.validate_repo(&name).await, Ok(true)) {
                continue;
            }

            if found {
                return Ok(Some(name.into_owned()));
            }
            if Some(name.as_ref()) == prev {
                found = true;
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::super::testing::new_store;
    use super::*;

    #[test]
    fn test_repo_name_regex() {
        for name in ["alpine", "library/alpine", "a1/b-2/c.3", "foo_bar"] {
            assert!(valid_repo_name(name), "{name} should be valid");
        }
        for name in ["", "Alpine", "foo//bar", "/foo", "foo/", "-foo", "foo..bar", "foo bar"] {
            assert!(!valid_repo_name(name), "{name} should be invalid");
        }
    }

    #[tokio::test]
    async fn test_init_repo_creates_layout() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;

        store.init_repo("alpine").await.unwrap();

        let dir = store.repo_dir("alpine");
        assert!(store.dir_exists(&dir.join(BLOBS_DIR)).await);
        assert!(store.dir_exists(&dir.join(BLOB_UPLOAD_DIR)).await);

        let layout = std::fs::read_to_string(dir.join(IMAGE_LAYOUT_FILE)).unwrap();
        assert_eq!(layout, r#"{"imageLayoutVersion":"1.0.0"}"#);

        let index = std::fs::read_to_string(dir.join(INDEX_JSON)).unwrap();
        assert!(index.contains("\"schemaVersion\":2"));

        assert!(store.validate_repo("alpine").await.unwrap());
    }

    #[tokio::test]
    async fn test_init_repo_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;

        store.init_repo("alpine").await.unwrap();
        store.init_repo("alpine").await.unwrap();

        assert_eq!(store.get_repositories().await.unwrap(), ["alpine"]);
    }

    #[tokio::test]
    async fn test_init_repo_rejects_invalid_name() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;

        let err = store.init_repo("NOT-VALID").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRepositoryName(_)));
    }

    #[tokio::test]
    async fn test_validate_repo_missing() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;

        let err = store.validate_repo("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::RepoNotFound(_)));
    }

    #[tokio::test]
    async fn test_validate_repo_incomplete_layout() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;

        store.init_repo("broken").await.unwrap();
        std::fs::remove_file(store.repo_dir("broken").join(IMAGE_LAYOUT_FILE)).unwrap();

        assert!(!store.validate_repo("broken").await.unwrap());
    }

    #[tokio::test]
    async fn test_validate_repo_bad_layout_version() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;

        store.init_repo("old").await.unwrap();
        std::fs::write(
            store.repo_dir("old").join(IMAGE_LAYOUT_FILE),
            r#"{"imageLayoutVersion":"0.9.0"}"#,
        )
        .unwrap();

        let err = store.validate_repo("old").await.unwrap_err();
        assert!(matches!(err, StoreError::RepoBadVersion));
    }

    #[tokio::test]
    async fn test_get_repositories_ignores_invalid_dirs() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;

        store.init_repo("beta").await.unwrap();
        store.init_repo("alpha/nested").await.unwrap();
        std::fs::create_dir_all(store.root_dir().join("not-a-repo")).unwrap();

        let repos = store.get_repositories().await.unwrap();
        assert_eq!(repos, ["alpha/nested", "beta"]);
    }

    #[tokio::test]
    async fn test_get_repositories_empty_store() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;

        assert!(store.get_repositories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_next_repository_round_robin() {
        let tmp = TempDir::new().unwrap();
        let store = new_store(&tmp, false, false).await;

        for repo in ["one", "three", "two"] {
            store.init_repo(repo).await.unwrap();
        }

        let first = store.get_next_repository(None).await.unwrap();
        assert_eq!(first.as_deref(), Some("one"));

        let second = store.get_next_repository(first.as_deref()).await.unwrap();
        assert_eq!(second.as_deref(), Some("three"));

        let third = store.get_next_repository(second.as_deref()).await.unwrap();
        assert_eq!(third.as_deref(), Some("two"));

        assert_eq!(store.get_next_repository(third.as_deref()).await.unwrap(), None);
    }
}
