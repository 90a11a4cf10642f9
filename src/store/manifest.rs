//! Manifest engine: put/get/delete manifests and image indexes, tag and
//! referrer listings.

use serde::de::IgnoredAny;

use super::common::{
    check_if_index_needs_update, manifest_desc_by_reference, remove_manifest_desc_by_reference,
    tags_from_index,
};
use super::ImageStore;
use crate::digest::Digest;
use crate::error::{Result, StoreError};
use crate::oci::{
    Descriptor, ImageIndex, MEDIA_TYPE_ARTIFACT_MANIFEST, MEDIA_TYPE_IMAGE_INDEX,
    MEDIA_TYPE_IMAGE_MANIFEST,
};

impl ImageStore {
    /// Store a manifest under a tag or digest reference.
    ///
    /// Returns the manifest digest and, for referrers, the digest of the
    /// subject the manifest points at.
    pub async fn put_image_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        body: &[u8],
    ) -> Result<(Digest, Option<Digest>)> {
        self.init_repo(repo).await?;

        let digest = Digest::sha256_from_bytes(body);

        // a digest reference must name the content it carries
        let tag = match reference.parse::<Digest>() {
            Ok(ref_digest) => {
                if ref_digest != digest {
                    tracing::error!(
                        reference,
                        actual = %digest,
                        "digest reference does not match manifest content"
                    );
                    return Err(StoreError::BadManifest);
                }
                None
            }
            Err(_) => Some(reference),
        };

        let (subject, artifact_type) = extract_subject_and_artifact(media_type, body)?;

        if let Some(validator) = &self.validator {
            validator.validate(repo, media_type, body).await?;
        }

        let _lock = self.wlock().await;

        let mut index = self.get_index(repo).await?;

        let mut desc = Descriptor {
            media_type: media_type.to_string(),
            digest: digest.clone(),
            size: body.len() as u64,
            annotations: None,
            artifact_type: None,
        };
        if let Some(tag) = tag {
            desc.set_tag(tag);
        }

        let (update, replaced) = check_if_index_needs_update(&mut index, &desc);
        if !update {
            self.metrics.inc_upload_counter(repo);
            return Ok((digest, subject));
        }

        // the manifest blob lands before the index references it
        self.driver
            .write_file(&self.blob_path(repo, &digest), body)
            .await?;

        if let Some(old) = &replaced {
            self.prune_replaced_index_members(repo, &mut index, &desc, old)
                .await?;
        }

        index.manifests.push(desc.clone());

        // the linter sees the artifact type; the stored descriptor does not
        // carry it
        desc.artifact_type = artifact_type;
        if !self.apply_linter(repo, &desc, body).await? {
            tracing::error!(repository = repo, reference, "linter rejected manifest");
            return Err(StoreError::BadManifest);
        }

        self.write_index(repo, &index).await?;

        self.update_storage_usage(repo).await;
        self.metrics.inc_upload_counter(repo);

        Ok((digest, subject))
    }

    /// Fetch a manifest by tag or digest.
    pub async fn get_image_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<(Vec<u8>, Digest, String)> {
        self.require_repo(repo).await?;

        let _lock = self.rlock().await;

        let index = self.get_index(repo).await?;
        let desc = manifest_desc_by_reference(&index, reference)
            .ok_or_else(|| StoreError::ManifestNotFound(reference.to_string()))?
            .clone();

        let buf = match self.get_blob_content_unlocked(repo, &desc.digest).await {
            Ok(buf) => buf,
            Err(StoreError::BlobNotFound(_)) => {
                return Err(StoreError::ManifestNotFound(reference.to_string()))
            }
            Err(err) => return Err(err),
        };

        serde_json::from_slice::<IgnoredAny>(&buf)?;

        self.metrics.inc_download_counter(repo);

        Ok((buf, desc.digest, desc.media_type))
    }

    /// Delete a manifest by tag or digest.
    ///
    /// With `detect_collisions`, a digest reference matched by several
    /// descriptors fails with `ManifestConflict` instead of removing them
    /// all.
    pub async fn delete_image_manifest(
        &self,
        repo: &str,
        reference: &str,
        detect_collisions: bool,
    ) -> Result<()> {
        self.require_repo(repo).await?;

        let _lock = self.wlock().await;
        self.delete_image_manifest_unlocked(repo, reference, detect_collisions)
            .await?;
        self.update_storage_usage(repo).await;

        Ok(())
    }

    pub(crate) async fn delete_image_manifest_unlocked(
        &self,
        repo: &str,
        reference: &str,
        detect_collisions: bool,
    ) -> Result<()> {
        let mut index = self.get_index(repo).await?;
        let removed = remove_manifest_desc_by_reference(&mut index, reference, detect_collisions)?;

        // manifests woven into an image index cannot be removed on their own
        if removed.media_type == MEDIA_TYPE_IMAGE_MANIFEST {
            let roots: Vec<Digest> = index
                .manifests
                .iter()
                .filter(|d| d.media_type == MEDIA_TYPE_IMAGE_INDEX)
                .map(|d| d.digest.clone())
                .collect();
            if self
                .is_digest_in_index_tree(repo, &roots, &removed.digest)
                .await
            {
                return Err(StoreError::ManifestReferenced);
            }
        }

        self.prune_replaced_index_members(repo, &mut index, &removed, &removed.digest)
            .await?;

        self.write_index(repo, &index).await?;

        // other tags may still carry the same content
        if !index.contains_digest(&removed.digest) {
            self.driver
                .delete(&self.blob_path(repo, &removed.digest))
                .await?;
        }

        tracing::debug!(repository = repo, reference, "deleted manifest");

        Ok(())
    }

    /// Tags available in the repository, in index order.
    pub async fn get_image_tags(&self, repo: &str) -> Result<Vec<String>> {
        self.require_repo(repo).await?;

        let _lock = self.rlock().await;
        let index = self.get_index(repo).await?;

        Ok(tags_from_index(&index))
    }

    /// Raw `index.json` bytes of the repository.
    pub async fn get_index_content(&self, repo: &str) -> Result<Vec<u8>> {
        let _lock = self.rlock().await;
        self.get_index_content_unlocked(repo).await
    }

    /// Manifests and indexes whose `subject` is `digest`, assembled into an
    /// image index, optionally filtered by artifact type.
    pub async fn get_referrers(
        &self,
        repo: &str,
        digest: &Digest,
        artifact_types: &[String],
    ) -> Result<ImageIndex> {
        self.require_repo(repo).await?;

        let _lock = self.rlock().await;

        let index = self.get_index(repo).await?;
        let mut referrers = Vec::new();

        for desc in &index.manifests {
            if &desc.digest == digest {
                continue;
            }

            let (subject, artifact_type, annotations) = match desc.media_type.as_str() {
                MEDIA_TYPE_IMAGE_MANIFEST => {
                    let Ok(manifest) = self.parse_image_manifest(repo, &desc.digest).await else {
                        continue;
                    };
                    (
                        manifest.subject.clone(),
                        manifest.artifact_type().map(str::to_string),
                        manifest.annotations,
                    )
                }
                MEDIA_TYPE_IMAGE_INDEX => {
                    let Ok(child) = self.parse_image_index(repo, &desc.digest).await else {
                        continue;
                    };
                    (
                        child.subject.clone(),
                        child.artifact_type().map(str::to_string),
                        child.annotations,
                    )
                }
                MEDIA_TYPE_ARTIFACT_MANIFEST => {
                    let Ok(artifact) = self.parse_artifact_manifest(repo, &desc.digest).await
                    else {
                        continue;
                    };
                    (
                        artifact.subject.clone(),
                        artifact.artifact_type.clone(),
                        artifact.annotations,
                    )
                }
                _ => continue,
            };

            if subject.map(|s| s.digest) != Some(digest.clone()) {
                continue;
            }
            if !artifact_types.is_empty()
                && !artifact_type
                    .as_deref()
                    .is_some_and(|at| artifact_types.iter().any(|want| want == at))
            {
                continue;
            }

            referrers.push(Descriptor {
                media_type: desc.media_type.clone(),
                digest: desc.digest.clone(),
                size: desc.size,
                annotations,
                artifact_type,
            });
        }

        Ok(ImageIndex {
            media_type: Some(MEDIA_TYPE_IMAGE_INDEX.to_string()),
            manifests: referrers,
            ..ImageIndex::new()
        })
    }

    /// Error with `RepoNotFound` unless the repository directory exists.
    pub(crate) async fn require_repo(&self, repo: &str) -> Result<()> {
        match self.driver.stat(&self.repo_dir(repo)).await {
            Ok(info) if info.is_dir => Ok(()),
            _ => Err(StoreError::RepoNotFound(repo.to_string())),
        }
    }

    async fn apply_linter(&self, repo: &str, desc: &Descriptor, body: &[u8]) -> Result<bool> {
        let Some(linter) = &self.linter else {
            return Ok(true);
        };
        // only images are linted, never signatures or SBOMs
        if desc.media_type != MEDIA_TYPE_IMAGE_MANIFEST {
            return Ok(true);
        }
        if let Some(tag) = desc.tag() {
            if tag.starts_with("sha256-") && (tag.ends_with(".sig") || tag.ends_with(".sbom")) {
                return Ok(true);
            }
        }

        linter.lint(repo, &desc.digest, body).await
    }
}

/// Pull the referrer subject and artifact type out of an image manifest or
/// image index body; other media types are not inspected here.
///
/// An unparseable body is a `BadManifest`: the store cannot track referrers
/// it cannot read.
fn extract_subject_and_artifact(
    media_type: &str,
    body: &[u8],
) -> Result<(Option<Digest>, Option<String>)> {
    match media_type {
        MEDIA_TYPE_IMAGE_MANIFEST => {
            let manifest: crate::oci::ImageManifest =
                serde_json::from_slice(body).map_err(|_| StoreError::BadManifest)?;
            Ok((
                manifest.subject.as_ref().map(|s| s.digest.clone()),
                manifest.artifact_type().map(str::to_string),
            ))
        }
        MEDIA_TYPE_IMAGE_INDEX => {
            let index: ImageIndex =
                serde_json::from_slice(body).map_err(|_| StoreError::BadManifest)?;
            Ok((
                index.subject.as_ref().map(|s| s.digest.clone()),
                index.artifact_type().map(str::to_string),
            ))
        }
        _ => Ok((None, None)),
    }
}
