//! OCI image-spec data model.
//!
//! Serde types for the pieces of the image spec the store reads and writes:
//! the per-repository `index.json`, image manifests, image indexes, and the
//! `oci-layout` marker file. Descriptors reference blobs by digest only, so
//! the whole model serializes without indirection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Media type of an OCI image manifest.
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of an OCI image index.
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Media type of an ORAS artifact manifest.
pub const MEDIA_TYPE_ARTIFACT_MANIFEST: &str =
    "application/vnd.cncf.oras.artifact.manifest.v1+json";

/// Annotation key carrying the tag of a descriptor.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Name of the layout marker file at the root of a repository.
pub const IMAGE_LAYOUT_FILE: &str = "oci-layout";

/// The only supported image layout version.
pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

/// `schemaVersion` written into every index.
pub const SCHEMA_VERSION: u32 = 2;

/// True when the media type names a manifest the store sweeps and traverses.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_IMAGE_MANIFEST || media_type == MEDIA_TYPE_ARTIFACT_MANIFEST
}

/// A typed reference to a blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl Descriptor {
    /// The descriptor's tag, when the ref-name annotation is present.
    pub fn tag(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME))
            .map(String::as_str)
    }

    /// Set the ref-name annotation.
    pub fn set_tag(&mut self, tag: &str) {
        self.annotations
            .get_or_insert_with(HashMap::new)
            .insert(ANNOTATION_REF_NAME.to_string(), tag.to_string());
    }
}

/// An OCI image index: an ordered list of manifest descriptors.
///
/// This is both the wire form of multi-arch indexes pushed by clients and the
/// shape of the per-repository `index.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl ImageIndex {
    /// An empty index with the current schema version.
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            ..Self::default()
        }
    }

    /// True when a descriptor with the given digest is listed.
    pub fn contains_digest(&self, digest: &Digest) -> bool {
        self.manifests.iter().any(|m| &m.digest == digest)
    }

    /// The artifact type advertised by this index.
    pub fn artifact_type(&self) -> Option<&str> {
        self.artifact_type.as_deref()
    }
}

/// An OCI image manifest: config plus layers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl ImageManifest {
    /// The artifact type of the manifest: the explicit field when present,
    /// otherwise the config media type.
    pub fn artifact_type(&self) -> Option<&str> {
        self.artifact_type
            .as_deref()
            .or_else(|| self.config.as_ref().map(|c| c.media_type.as_str()))
    }
}

/// An ORAS artifact manifest: a blob list with an optional subject.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default)]
    pub blobs: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Contents of the `oci-layout` marker file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    pub version: String,
}

impl Default for OciLayout {
    fn default() -> Self {
        Self {
            version: IMAGE_LAYOUT_VERSION.to_string(),
        }
    }
}
