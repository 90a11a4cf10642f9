//! End-to-end tests driving the store through its public API only.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use ocistore::oci::{MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST};
use ocistore::{
    Digest, FsBlobCache, ImageStore, LocalDriver, NullMetrics, Scheduler, StorageDriver,
    StoreError, StoreOptions, TaskGenerator, TaskPriority,
};

struct StoreConfig {
    dedupe: bool,
    gc_referrers: bool,
    gc_delay: Duration,
    retention_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dedupe: false,
            gc_referrers: false,
            gc_delay: Duration::ZERO,
            retention_delay: Duration::ZERO,
        }
    }
}

async fn new_store(tmp: &TempDir, config: StoreConfig) -> Arc<ImageStore> {
    let root = tmp.path().join("root");
    let cache = if config.dedupe {
        let cache = FsBlobCache::new(&tmp.path().join("cache"), &root, true).unwrap();
        Some(Arc::new(cache) as Arc<dyn ocistore::BlobCache>)
    } else {
        None
    };

    ImageStore::new(
        StoreOptions {
            root_dir: root,
            gc: true,
            gc_referrers: config.gc_referrers,
            gc_delay: config.gc_delay,
            retention_delay: config.retention_delay,
            dedupe: config.dedupe,
        },
        Arc::new(LocalDriver::new(false)),
        cache,
        None,
        None,
        Arc::new(NullMetrics),
    )
    .await
    .unwrap()
}

async fn push_blob(store: &ImageStore, repo: &str, content: &[u8]) -> Digest {
    let digest = Digest::sha256_from_bytes(content);
    let mut body = Cursor::new(content.to_vec());
    store.full_blob_upload(repo, &mut body, &digest).await.unwrap();
    digest
}

/// Push config and layer blobs plus a manifest referencing them. `subject`
/// turns the manifest into a referrer.
async fn push_image(
    store: &ImageStore,
    repo: &str,
    reference: Option<&str>,
    seed: u8,
    subject: Option<&Digest>,
) -> Digest {
    let config = format!("{{\"architecture\":\"amd64\",\"os\":\"linux\",\"seed\":{seed}}}");
    let config_digest = push_blob(store, repo, config.as_bytes()).await;

    let layer = vec![seed; 32];
    let layer_digest = push_blob(store, repo, &layer).await;

    let mut manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest.to_string(),
            "size": config.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": layer_digest.to_string(),
            "size": layer.len(),
        }],
    });
    if let Some(subject) = subject {
        manifest["subject"] = serde_json::json!({
            "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
            "digest": subject.to_string(),
            "size": 1,
        });
        manifest["artifactType"] = serde_json::json!("application/vnd.example.signature");
    }

    let body = serde_json::to_vec(&manifest).unwrap();
    let digest = Digest::sha256_from_bytes(&body);
    let reference = reference
        .map(str::to_string)
        .unwrap_or_else(|| digest.to_string());

    let (stored, stored_subject) = store
        .put_image_manifest(repo, &reference, MEDIA_TYPE_IMAGE_MANIFEST, &body)
        .await
        .unwrap();
    assert_eq!(stored, digest);
    assert_eq!(stored_subject.as_ref(), subject);

    digest
}

#[tokio::test]
async fn test_round_trip_small_blob() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp, StoreConfig::default()).await;

    let uuid = store.new_blob_upload("alpine").await.unwrap();

    let mut body = Cursor::new(b"test".to_vec());
    let copied = store
        .put_blob_chunk_streamed("alpine", &uuid, &mut body)
        .await
        .unwrap();
    assert_eq!(copied, 4);

    let expected: Digest =
        "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
            .parse()
            .unwrap();
    store
        .finish_blob_upload("alpine", &uuid, &expected)
        .await
        .unwrap();

    assert_eq!(store.check_blob("alpine", &expected).await.unwrap(), (true, 4));
    assert_eq!(store.get_blob_content("alpine", &expected).await.unwrap(), b"test");
}

#[tokio::test]
async fn test_tag_replacement_prunes_old_manifest() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp, StoreConfig::default()).await;

    let m1 = push_image(&store, "repo", Some("v1"), 1, None).await;
    let m2 = push_image(&store, "repo", Some("v1"), 2, None).await;
    assert_ne!(m1, m2);

    assert_eq!(store.get_image_tags("repo").await.unwrap(), ["v1"]);

    // v1 resolves to the new content
    let (_, digest, _) = store.get_image_manifest("repo", "v1").await.unwrap();
    assert_eq!(digest, m2);

    store.run_gc_repo("repo").await.unwrap();

    let err = store.check_blob("repo", &m1).await.unwrap_err();
    assert!(matches!(err, StoreError::BlobNotFound(_)));
    assert!(store.check_blob("repo", &m2).await.unwrap().0);
}

#[tokio::test]
async fn test_dedupe_across_repos() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(
        &tmp,
        StoreConfig {
            dedupe: true,
            ..StoreConfig::default()
        },
    )
    .await;

    let content = b"layer shared between repos";
    let digest = push_blob(&store, "a", content).await;
    push_blob(&store, "b", content).await;

    let driver = LocalDriver::new(false);
    assert!(
        driver
            .same_file(&store.blob_path("a", &digest), &store.blob_path("b", &digest))
            .await
    );

    assert_eq!(store.get_blob_content("a", &digest).await.unwrap(), content);
    assert_eq!(store.get_blob_content("b", &digest).await.unwrap(), content);
}

#[tokio::test]
async fn test_rebuild_dedupe_existing_digests() {
    let tmp = TempDir::new().unwrap();

    {
        let plain = new_store(&tmp, StoreConfig::default()).await;
        push_blob(&plain, "a", b"duplicated content").await;
        push_blob(&plain, "b", b"duplicated content").await;
    }

    let store = new_store(
        &tmp,
        StoreConfig {
            dedupe: true,
            ..StoreConfig::default()
        },
    )
    .await;

    let mut seen = Vec::new();
    while let Some((digest, paths)) = store.get_next_digest_with_blob_paths(&seen).await.unwrap() {
        store
            .run_dedupe_for_digest(&digest, true, &paths)
            .await
            .unwrap();
        seen.push(digest);
    }

    let digest = Digest::sha256_from_bytes(b"duplicated content");
    let driver = LocalDriver::new(false);
    assert!(
        driver
            .same_file(&store.blob_path("a", &digest), &store.blob_path("b", &digest))
            .await
    );
}

// deleting a subject cascades through chained referrers in a single GC
// invocation
#[tokio::test]
async fn test_referrer_gc_cascade() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(
        &tmp,
        StoreConfig {
            gc_referrers: true,
            ..StoreConfig::default()
        },
    )
    .await;

    let image = push_image(&store, "repo", Some("latest"), 1, None).await;
    let referrer = push_image(&store, "repo", None, 2, Some(&image)).await;
    let nested = push_image(&store, "repo", None, 3, Some(&referrer)).await;

    // both referrers resolve while the subject chain is intact
    let listed = store.get_referrers("repo", &image, &[]).await.unwrap();
    assert_eq!(listed.manifests.len(), 1);
    assert_eq!(listed.manifests[0].digest, referrer);

    store.delete_image_manifest("repo", "latest", false).await.unwrap();
    store.run_gc_repo("repo").await.unwrap();

    // the whole chain is gone; with it went every blob, so the repo itself
    // was cleaned up
    let err = store.get_image_manifest("repo", &nested.to_string()).await.unwrap_err();
    assert!(matches!(err, StoreError::RepoNotFound(_) | StoreError::ManifestNotFound(_)));
    let err = store.validate_repo("repo").await.unwrap_err();
    assert!(matches!(err, StoreError::RepoNotFound(_)));
}

#[tokio::test]
async fn test_untagged_manifest_retention() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp, StoreConfig::default()).await;

    let tagged = push_image(&store, "repo", Some("keep"), 1, None).await;
    let untagged = push_image(&store, "repo", None, 2, None).await;

    store.run_gc_repo("repo").await.unwrap();

    let err = store
        .get_image_manifest("repo", &untagged.to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ManifestNotFound(_)));

    let (_, digest, _) = store.get_image_manifest("repo", "keep").await.unwrap();
    assert_eq!(digest, tagged);
}

#[tokio::test]
async fn test_gc_respects_delays() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(
        &tmp,
        StoreConfig {
            gc_delay: Duration::from_secs(3600),
            retention_delay: Duration::from_secs(3600),
            ..StoreConfig::default()
        },
    )
    .await;

    push_image(&store, "repo", Some("v1"), 1, None).await;
    let untagged = push_image(&store, "repo", None, 2, None).await;
    let orphan = push_blob(&store, "repo", b"orphan blob").await;

    store.run_gc_repo("repo").await.unwrap();

    // everything is younger than the delays and survives
    assert!(store.check_blob("repo", &orphan).await.unwrap().0);
    assert!(store
        .get_image_manifest("repo", &untagged.to_string())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_gc_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(
        &tmp,
        StoreConfig {
            gc_referrers: true,
            ..StoreConfig::default()
        },
    )
    .await;

    push_image(&store, "repo", Some("v1"), 1, None).await;
    push_image(&store, "repo", None, 2, None).await;
    push_blob(&store, "repo", b"stray").await;

    store.run_gc_repo("repo").await.unwrap();

    let tags_after_first = store.get_image_tags("repo").await.unwrap();
    let blobs_after_first = store.get_all_blobs("repo").await.unwrap();

    store.run_gc_repo("repo").await.unwrap();

    assert_eq!(store.get_image_tags("repo").await.unwrap(), tags_after_first);
    assert_eq!(store.get_all_blobs("repo").await.unwrap(), blobs_after_first);
}

#[tokio::test]
async fn test_manifest_digest_reference_must_match() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp, StoreConfig::default()).await;

    let body = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": Digest::sha256_from_bytes(b"cfg").to_string(),
            "size": 3,
        },
        "layers": [],
    }))
    .unwrap();

    let wrong = Digest::sha256_from_bytes(b"not the body");
    let err = store
        .put_image_manifest("repo", &wrong.to_string(), MEDIA_TYPE_IMAGE_MANIFEST, &body)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::BadManifest));
}

#[tokio::test]
async fn test_delete_manifest_collision_detection() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp, StoreConfig::default()).await;

    let digest = push_image(&store, "repo", Some("v1"), 1, None).await;
    // same content under a second tag
    let (_, _, media_type) = store.get_image_manifest("repo", "v1").await.unwrap();
    let (body, _, _) = store.get_image_manifest("repo", "v1").await.unwrap();
    store
        .put_image_manifest("repo", "v2", &media_type, &body)
        .await
        .unwrap();

    let err = store
        .delete_image_manifest("repo", &digest.to_string(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ManifestConflict));

    // deleting one tag keeps the shared content alive
    store.delete_image_manifest("repo", "v1", false).await.unwrap();
    assert!(store.get_image_manifest("repo", "v2").await.is_ok());
    assert!(store.check_blob("repo", &digest).await.unwrap().0);
}

#[tokio::test]
async fn test_delete_manifest_referenced_by_index() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp, StoreConfig::default()).await;

    let member = push_image(&store, "repo", None, 1, None).await;
    let (member_body, _, _) = store
        .get_image_manifest("repo", &member.to_string())
        .await
        .unwrap();

    let index_body = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_IMAGE_INDEX,
        "manifests": [{
            "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
            "digest": member.to_string(),
            "size": member_body.len(),
        }],
    }))
    .unwrap();

    store
        .put_image_manifest("repo", "multiarch", MEDIA_TYPE_IMAGE_INDEX, &index_body)
        .await
        .unwrap();

    let err = store
        .delete_image_manifest("repo", &member.to_string(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ManifestReferenced));

    // deleting the index prunes its now-orphaned untagged member from the
    // repository index
    store
        .delete_image_manifest("repo", "multiarch", false)
        .await
        .unwrap();
    let err = store
        .get_image_manifest("repo", &member.to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ManifestNotFound(_)));
}

#[tokio::test]
async fn test_get_referrers_filters_by_artifact_type() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp, StoreConfig::default()).await;

    let image = push_image(&store, "repo", Some("latest"), 1, None).await;
    push_image(&store, "repo", None, 2, Some(&image)).await;

    let all = store.get_referrers("repo", &image, &[]).await.unwrap();
    assert_eq!(all.manifests.len(), 1);
    assert_eq!(
        all.manifests[0].artifact_type.as_deref(),
        Some("application/vnd.example.signature")
    );

    let filtered = store
        .get_referrers(
            "repo",
            &image,
            &["application/vnd.example.signature".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(filtered.manifests.len(), 1);

    let none = store
        .get_referrers("repo", &image, &["application/vnd.other".to_string()])
        .await
        .unwrap();
    assert!(none.manifests.is_empty());
}

#[tokio::test]
async fn test_get_index_content_and_tags() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp, StoreConfig::default()).await;

    push_image(&store, "repo", Some("v1"), 1, None).await;
    push_image(&store, "repo", Some("v2"), 2, None).await;

    assert_eq!(store.get_image_tags("repo").await.unwrap(), ["v1", "v2"]);

    let raw = store.get_index_content("repo").await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(parsed["schemaVersion"], 2);
    assert_eq!(parsed["manifests"].as_array().unwrap().len(), 2);

    let err = store.get_index_content("ghost").await.unwrap_err();
    assert!(matches!(err, StoreError::RepoNotFound(_)));
}

struct InlineScheduler {
    generators: Mutex<Vec<(Box<dyn TaskGenerator>, Duration, TaskPriority)>>,
}

impl Scheduler for InlineScheduler {
    fn submit_generator(
        &self,
        generator: Box<dyn TaskGenerator>,
        interval: Duration,
        priority: TaskPriority,
    ) {
        self.generators
            .lock()
            .unwrap()
            .push((generator, interval, priority));
    }
}

#[tokio::test]
async fn test_periodic_gc_via_scheduler() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp, StoreConfig::default()).await;

    push_image(&store, "one", Some("v1"), 1, None).await;
    let untagged = push_image(&store, "two", None, 2, None).await;

    let scheduler = InlineScheduler {
        generators: Mutex::new(Vec::new()),
    };
    store.run_gc_periodically(Duration::from_secs(3600), &scheduler);
    store.run_dedupe_blobs(Duration::from_secs(3600), &scheduler);

    let mut generators = scheduler.generators.into_inner().unwrap();
    assert_eq!(generators.len(), 2);
    assert!(generators
        .iter()
        .all(|(_, _, priority)| *priority == TaskPriority::Medium));

    // drive the GC generator by hand, one task per repo
    let (gc_generator, _, _) = &mut generators[0];
    let mut ran = 0;
    while let Some(task) = gc_generator.next_task().await.unwrap() {
        task.run().await.unwrap();
        ran += 1;
    }
    assert_eq!(ran, 2);

    // "two" held only the untagged manifest, so the sweep retired the
    // manifest and then the emptied repository itself
    let err = store
        .get_image_manifest("two", &untagged.to_string())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::ManifestNotFound(_) | StoreError::RepoNotFound(_)
    ));
    assert!(store.get_image_manifest("one", "v1").await.is_ok());
}

#[tokio::test]
async fn test_repositories_listing_and_next() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp, StoreConfig::default()).await;

    push_image(&store, "library/alpine", Some("v1"), 1, None).await;
    push_image(&store, "library/debian", Some("v1"), 2, None).await;
    push_image(&store, "tools", Some("v1"), 3, None).await;

    let repos = store.get_repositories().await.unwrap();
    assert_eq!(repos, ["library/alpine", "library/debian", "tools"]);

    let first = store.get_next_repository(None).await.unwrap();
    assert_eq!(first.as_deref(), Some("library/alpine"));
    let last = store.get_next_repository(Some("library/debian")).await.unwrap();
    assert_eq!(last.as_deref(), Some("tools"));
    assert_eq!(store.get_next_repository(Some("tools")).await.unwrap(), None);
}
