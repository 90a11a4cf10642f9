//! Index bookkeeping shared by the manifest engine and the garbage
//! collector.
//!
//! Every helper here assumes the caller already holds the store lock on the
//! side its operation needs; none of them lock.

use std::collections::HashSet;

use super::{ImageStore, INDEX_JSON};
use crate::digest::Digest;
use crate::error::{Result, StoreError};
use crate::oci::{
    ArtifactManifest, Descriptor, ImageIndex, ImageManifest, MEDIA_TYPE_ARTIFACT_MANIFEST,
    MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST,
};

impl ImageStore {
    /// Raw bytes of the repository's `index.json`.
    pub(crate) async fn get_index_content_unlocked(&self, repo: &str) -> Result<Vec<u8>> {
        match self
            .driver
            .read_file(&self.repo_dir(repo).join(INDEX_JSON))
            .await
        {
            Ok(buf) => Ok(buf),
            Err(err) if err.is_path_not_found() => {
                Err(StoreError::RepoNotFound(repo.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// The repository's `index.json`, parsed.
    pub(crate) async fn get_index(&self, repo: &str) -> Result<ImageIndex> {
        let buf = self.get_index_content_unlocked(repo).await?;
        Ok(serde_json::from_slice(&buf)?)
    }

    pub(crate) async fn write_index(&self, repo: &str, index: &ImageIndex) -> Result<()> {
        let buf = serde_json::to_vec(index)?;
        self.driver
            .write_file(&self.repo_dir(repo).join(INDEX_JSON), &buf)
            .await?;
        Ok(())
    }

    pub(crate) async fn parse_image_manifest(
        &self,
        repo: &str,
        digest: &Digest,
    ) -> Result<ImageManifest> {
        let buf = self.get_blob_content_unlocked(repo, digest).await?;
        Ok(serde_json::from_slice(&buf)?)
    }

    pub(crate) async fn parse_image_index(
        &self,
        repo: &str,
        digest: &Digest,
    ) -> Result<ImageIndex> {
        let buf = self.get_blob_content_unlocked(repo, digest).await?;
        Ok(serde_json::from_slice(&buf)?)
    }

    pub(crate) async fn parse_artifact_manifest(
        &self,
        repo: &str,
        digest: &Digest,
    ) -> Result<ArtifactManifest> {
        let buf = self.get_blob_content_unlocked(repo, digest).await?;
        Ok(serde_json::from_slice(&buf)?)
    }

    /// True when `target` is reachable through any of the image indexes in
    /// `roots`, descending into nested indexes.
    pub(crate) async fn is_digest_in_index_tree(
        &self,
        repo: &str,
        roots: &[Digest],
        target: &Digest,
    ) -> bool {
        let mut queue: Vec<Digest> = roots.to_vec();
        let mut seen: HashSet<Digest> = HashSet::new();

        while let Some(digest) = queue.pop() {
            if !seen.insert(digest.clone()) {
                continue;
            }
            let Ok(index) = self.parse_image_index(repo, &digest).await else {
                continue;
            };
            for desc in index.manifests {
                if &desc.digest == target {
                    return true;
                }
                if desc.media_type == MEDIA_TYPE_IMAGE_INDEX {
                    queue.push(desc.digest);
                }
            }
        }

        false
    }

    /// Every digest reachable from the repository index: manifest digests
    /// themselves, config and layer blobs, and everything below nested image
    /// indexes.
    pub(crate) async fn reachable_blobs(&self, repo: &str) -> Result<HashSet<Digest>> {
        let index = self.get_index(repo).await?;

        let mut refs: HashSet<Digest> = HashSet::new();
        let mut queue: Vec<Descriptor> = index.manifests;

        while let Some(desc) = queue.pop() {
            if !refs.insert(desc.digest.clone()) {
                continue;
            }
            match desc.media_type.as_str() {
                MEDIA_TYPE_IMAGE_INDEX => {
                    let child = self.parse_image_index(repo, &desc.digest).await?;
                    queue.extend(child.manifests);
                }
                MEDIA_TYPE_IMAGE_MANIFEST => {
                    let manifest = self.parse_image_manifest(repo, &desc.digest).await?;
                    if let Some(config) = manifest.config {
                        refs.insert(config.digest);
                    }
                    for layer in manifest.layers {
                        refs.insert(layer.digest);
                    }
                }
                MEDIA_TYPE_ARTIFACT_MANIFEST => {
                    let artifact = self.parse_artifact_manifest(repo, &desc.digest).await?;
                    for blob in artifact.blobs {
                        refs.insert(blob.digest);
                    }
                }
                _ => {}
            }
        }

        Ok(refs)
    }

    /// True when the digest is referenced by anything in `index.json`,
    /// transitively.
    pub(crate) async fn is_blob_referenced(&self, repo: &str, digest: &Digest) -> Result<bool> {
        Ok(self.reachable_blobs(repo).await?.contains(digest))
    }

    /// Digests that untagged-manifest retention must skip: members of image
    /// indexes and manifests acting as referrers (those carry a `subject`
    /// and belong to the referrer sweep instead).
    pub(crate) async fn manifests_referenced_in_index(
        &self,
        repo: &str,
        index: &ImageIndex,
    ) -> Result<HashSet<Digest>> {
        let mut referenced: HashSet<Digest> = HashSet::new();
        let mut queue: Vec<Descriptor> = index.manifests.clone();
        let mut visited: HashSet<Digest> = HashSet::new();

        while let Some(desc) = queue.pop() {
            if !visited.insert(desc.digest.clone()) {
                continue;
            }
            match desc.media_type.as_str() {
                MEDIA_TYPE_IMAGE_INDEX => {
                    let child = self.parse_image_index(repo, &desc.digest).await?;
                    if child.subject.is_some() {
                        referenced.insert(desc.digest.clone());
                    }
                    for member in &child.manifests {
                        referenced.insert(member.digest.clone());
                    }
                    queue.extend(child.manifests);
                }
                MEDIA_TYPE_IMAGE_MANIFEST => {
                    let manifest = self.parse_image_manifest(repo, &desc.digest).await?;
                    if manifest.subject.is_some() {
                        referenced.insert(desc.digest.clone());
                    }
                }
                MEDIA_TYPE_ARTIFACT_MANIFEST => {
                    let artifact = self.parse_artifact_manifest(repo, &desc.digest).await?;
                    if artifact.subject.is_some() {
                        referenced.insert(desc.digest.clone());
                    }
                }
                _ => {}
            }
        }

        Ok(referenced)
    }

    /// Drop descriptors orphaned by removing the image index `old`: untagged
    /// members listed in `index.json` that no other image index still
    /// references. Their blobs are reclaimed later by the orphan sweep.
    pub(crate) async fn prune_replaced_index_members(
        &self,
        repo: &str,
        index: &mut ImageIndex,
        removed: &Descriptor,
        old: &Digest,
    ) -> Result<()> {
        if removed.media_type != MEDIA_TYPE_IMAGE_INDEX {
            return Ok(());
        }

        let buf = self.get_blob_content_unlocked(repo, old).await?;
        let Ok(old_index) = serde_json::from_slice::<ImageIndex>(&buf) else {
            return Ok(());
        };

        let members: HashSet<Digest> = old_index
            .manifests
            .into_iter()
            .map(|m| m.digest)
            .collect();
        if members.is_empty() {
            return Ok(());
        }

        let other_roots: Vec<Digest> = index
            .manifests
            .iter()
            .filter(|d| d.media_type == MEDIA_TYPE_IMAGE_INDEX && &d.digest != old)
            .map(|d| d.digest.clone())
            .collect();

        let mut kept = Vec::with_capacity(index.manifests.len());
        for desc in index.manifests.drain(..) {
            let orphaned = desc.media_type == MEDIA_TYPE_IMAGE_MANIFEST
                && desc.tag().is_none()
                && members.contains(&desc.digest)
                && !self
                    .is_digest_in_index_tree(repo, &other_roots, &desc.digest)
                    .await;
            if !orphaned {
                kept.push(desc);
            }
        }
        index.manifests = kept;

        Ok(())
    }
}

/// Find the descriptor a tag or digest reference resolves to.
pub(crate) fn manifest_desc_by_reference<'a>(
    index: &'a ImageIndex,
    reference: &str,
) -> Option<&'a Descriptor> {
    let as_digest = reference.parse::<Digest>().ok();

    index.manifests.iter().find(|m| {
        m.tag() == Some(reference) || as_digest.as_ref() == Some(&m.digest)
    })
}

/// Decide how a freshly built descriptor lands in the index.
///
/// Returns `(false, None)` when the exact content is already present under
/// the same reference (idempotent put). When the descriptor's tag currently
/// points at different content, the stale descriptor is removed and its
/// digest returned so the caller can prune what it orphaned. In every other
/// case the caller appends.
pub(crate) fn check_if_index_needs_update(
    index: &mut ImageIndex,
    desc: &Descriptor,
) -> (bool, Option<Digest>) {
    let new_tag = desc.tag();

    let mut replaced: Option<Digest> = None;
    let mut remove_at: Option<usize> = None;

    for (i, existing) in index.manifests.iter().enumerate() {
        if existing.digest == desc.digest {
            match new_tag {
                // digest push of content the index already lists
                None => return (false, None),
                Some(tag) if existing.tag() == Some(tag) => return (false, None),
                Some(_) => {}
            }
        } else if let (Some(old_tag), Some(tag)) = (existing.tag(), new_tag) {
            if old_tag == tag {
                replaced = Some(existing.digest.clone());
                remove_at = Some(i);
            }
        }
    }

    if let Some(i) = remove_at {
        index.manifests.remove(i);
    }

    (true, replaced)
}

/// Remove the descriptor(s) a reference resolves to, returning the removed
/// descriptor.
///
/// With `detect_collisions`, a reference matching more than one descriptor
/// fails with `ManifestConflict` and leaves the index untouched.
pub(crate) fn remove_manifest_desc_by_reference(
    index: &mut ImageIndex,
    reference: &str,
    detect_collisions: bool,
) -> Result<Descriptor> {
    let as_digest = reference.parse::<Digest>().ok();
    let matches = |m: &Descriptor| {
        m.tag() == Some(reference) || as_digest.as_ref() == Some(&m.digest)
    };

    let matched: Vec<&Descriptor> = index.manifests.iter().filter(|m| matches(m)).collect();

    let Some(last) = matched.last() else {
        return Err(StoreError::ManifestNotFound(reference.to_string()));
    };
    if detect_collisions && matched.len() > 1 {
        return Err(StoreError::ManifestConflict);
    }

    let removed = (*last).clone();
    index.manifests.retain(|m| !matches(m));

    Ok(removed)
}

/// Tags present in the index, in descriptor order.
pub(crate) fn tags_from_index(index: &ImageIndex) -> Vec<String> {
    index
        .manifests
        .iter()
        .filter_map(|m| m.tag().map(str::to_string))
        .collect()
}
