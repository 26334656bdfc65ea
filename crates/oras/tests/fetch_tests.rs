//! End-to-end fetch tests against a mock registry.
//!
//! Every test checks that no temporary file store survives: either the
//! fetch failed and removed it, or the handle was closed.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{
    IMAGE_CONFIG, IMAGE_LAYER, IMAGE_MANIFEST, METADATA, TestRegistry, digest, entries,
};
use seeder_artifacts::Provider;
use seeder_oras::{Error, FetchError, OrasProvider};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

async fn read_all(handle: &mut seeder_oras::ArtifactHandle) -> Vec<u8> {
    let mut payload = Vec::new();
    handle.read_to_end(&mut payload).await.unwrap();
    payload
}

// ==========================================================================
// Payload selection
// ==========================================================================

#[tokio::test]
async fn test_fetch_single_layer_image() {
    let registry = TestRegistry::start().await;
    registry
        .image("hedgehog/stage0", "latest", &[(IMAGE_LAYER, b"installer")])
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    let mut handle = provider.fetch("stage0").await.unwrap();
    // Config and layer are two successors: the image layer wins
    assert_eq!(handle.descriptor().media_type, IMAGE_LAYER);
    assert_eq!(handle.descriptor().digest, digest(b"installer"));
    assert!(handle.store_path().unwrap().starts_with(temp.path()));
    assert_eq!(read_all(&mut handle).await, b"installer");

    handle.close().await.unwrap();
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test]
async fn test_fetch_selects_first_image_layer() {
    let registry = TestRegistry::start().await;
    registry
        .image(
            "hedgehog/stage0",
            "latest",
            &[
                (METADATA, b"{\"note\":1}"),
                (IMAGE_LAYER, b"first"),
                (IMAGE_LAYER, b"second"),
            ],
        )
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    let mut handle = provider.fetch("stage0").await.unwrap();
    assert_eq!(read_all(&mut handle).await, b"first");
    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_fetch_single_successor_regardless_of_media_type() {
    let registry = TestRegistry::start().await;
    let blob = registry.blob("hedgehog/stage0", METADATA, b"only").await;
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.artifact.manifest.v1+json",
        "blobs": [blob],
    });
    registry
        .manifest(
            "hedgehog/stage0",
            "latest",
            "application/vnd.oci.artifact.manifest.v1+json",
            &manifest,
        )
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    let mut handle = provider.fetch("stage0").await.unwrap();
    assert_eq!(handle.descriptor().media_type, METADATA);
    assert_eq!(read_all(&mut handle).await, b"only");

    // The single-successor path is released on close as well
    handle.close().await.unwrap();
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test]
async fn test_fetch_without_payload_layer_is_not_found() {
    let registry = TestRegistry::start().await;
    registry
        .image(
            "hedgehog/stage0",
            "latest",
            &[
                ("application/vnd.oci.image.layer.v1.tar+gzip", b"gz"),
                (METADATA, b"{}"),
            ],
        )
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    let err = provider.fetch("stage0").await.unwrap_err();
    assert!(matches!(err, FetchError::NotFound(Error::NoPayload(_))));
    assert!(provider.get("stage0").await.is_none());
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test]
async fn test_repeated_fetch_yields_identical_bytes() {
    let registry = TestRegistry::start().await;
    registry
        .image("hedgehog/stage0", "latest", &[(IMAGE_LAYER, b"same bytes")])
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    let mut first = provider.fetch("stage0").await.unwrap();
    let mut second = provider.fetch("stage0").await.unwrap();
    assert_ne!(first.store_path(), second.store_path());
    assert_eq!(read_all(&mut first).await, read_all(&mut second).await);

    first.close().await.unwrap();
    second.close().await.unwrap();
    assert_eq!(entries(temp.path()), 0);
}

// ==========================================================================
// Repository names
// ==========================================================================

#[tokio::test]
async fn test_leading_separator_resolves_to_same_repository() {
    let registry = TestRegistry::start().await;
    registry
        .image("hedgehog/foo", "latest", &[(IMAGE_LAYER, b"foo")])
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    for name in ["foo", "/foo", "//foo", "./foo"] {
        let mut handle = provider.fetch(name).await.unwrap();
        assert_eq!(read_all(&mut handle).await, b"foo", "artifact name {name:?}");
        handle.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_configured_tag_is_fetched() {
    let registry = TestRegistry::start().await;
    registry
        .image("hedgehog/stage0", "stable", &[(IMAGE_LAYER, b"stable")])
        .await;
    let temp = TempDir::new().unwrap();
    let provider =
        OrasProvider::new(registry.config(temp.path()).with_tag("stable")).unwrap();

    let mut handle = provider.fetch("stage0").await.unwrap();
    assert_eq!(read_all(&mut handle).await, b"stable");
    handle.close().await.unwrap();
}

// ==========================================================================
// Failure paths
// ==========================================================================

#[tokio::test]
async fn test_missing_repository_is_not_found() {
    let registry = TestRegistry::start().await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    let err = provider.fetch("missing").await.unwrap_err();
    assert!(matches!(err, FetchError::NotFound(Error::NotFound(_))));
    assert!(!err.is_retryable());
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test]
async fn test_registry_error_is_transient() {
    let registry = TestRegistry::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .respond_with(wiremock::ResponseTemplate::new(503))
        .mount(&registry.server)
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    let err = provider.fetch("stage0").await.unwrap_err();
    assert!(matches!(
        err,
        FetchError::Transient(Error::RegistryStatus { status: 503, .. })
    ));
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test]
async fn test_missing_blob_removes_store() {
    let registry = TestRegistry::start().await;
    let config = registry.blob("hedgehog/stage0", IMAGE_CONFIG, b"{}").await;
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": IMAGE_MANIFEST,
        "config": config,
        "layers": [{ "mediaType": IMAGE_LAYER, "digest": digest(b"gone"), "size": 4 }],
    });
    registry
        .manifest("hedgehog/stage0", "latest", IMAGE_MANIFEST, &manifest)
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    assert!(provider.fetch("stage0").await.is_err());
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test]
async fn test_manifest_digest_mismatch_is_rejected() {
    let registry = TestRegistry::start().await;
    let config = registry.blob("hedgehog/stage0", IMAGE_CONFIG, b"{}").await;
    let layer = registry.blob("hedgehog/stage0", IMAGE_LAYER, b"x").await;
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": IMAGE_MANIFEST,
        "config": config,
        "layers": [layer],
    });
    registry
        .manifest_with("hedgehog/stage0", "latest", IMAGE_MANIFEST, &manifest, |response| {
            response.insert_header("Docker-Content-Digest", digest(b"other").as_str())
        })
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    let err = provider.fetch("stage0").await.unwrap_err();
    assert!(matches!(err, FetchError::Transient(Error::DigestMismatch { .. })));
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test]
async fn test_oversized_tag_manifest_is_rejected() {
    let registry = TestRegistry::start().await;
    let layer = registry.blob("hedgehog/stage0", IMAGE_LAYER, b"x").await;
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": IMAGE_MANIFEST,
        "config": layer,
        "layers": [layer],
        "annotations": { "padding": "a".repeat(16 * 1024 * 1024) },
    });
    registry
        .manifest("hedgehog/stage0", "latest", IMAGE_MANIFEST, &manifest)
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    let err = provider.fetch("stage0").await.unwrap_err();
    assert!(matches!(
        err,
        FetchError::Transient(Error::ManifestTooLarge { limit, .. })
            if limit == seeder_oras::MAX_MANIFEST_BYTES
    ));
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test]
async fn test_slow_copy_times_out_and_removes_store() {
    let registry = TestRegistry::start().await;
    registry
        .slow_image("hedgehog/stage0", "latest", Duration::from_secs(5))
        .await;
    let temp = TempDir::new().unwrap();
    let provider = OrasProvider::new(
        registry
            .config(temp.path())
            .with_fetch_timeout(Duration::from_millis(200)),
    )
    .unwrap();

    let err = provider.fetch("stage0").await.unwrap_err();
    assert!(matches!(err, FetchError::Transient(Error::Timeout { .. })));
    assert!(err.is_retryable());
    assert_eq!(entries(temp.path()), 0);
}

// ==========================================================================
// Lifecycle and concurrency
// ==========================================================================

#[tokio::test]
async fn test_double_close_is_safe() {
    let registry = TestRegistry::start().await;
    registry
        .image("hedgehog/stage0", "latest", &[(IMAGE_LAYER, b"installer")])
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    let mut artifact = provider.get("stage0").await.unwrap();
    let mut payload = Vec::new();
    artifact.read_to_end(&mut payload).await.unwrap();
    assert_eq!(payload, b"installer");

    artifact.close().await.unwrap();
    artifact.close().await.unwrap();
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test]
async fn test_dropped_handle_removes_store() {
    let registry = TestRegistry::start().await;
    registry
        .image("hedgehog/stage0", "latest", &[(IMAGE_LAYER, b"installer")])
        .await;
    let temp = TempDir::new().unwrap();
    let provider = registry.provider(temp.path());

    let handle = provider.fetch("stage0").await.unwrap();
    assert_eq!(entries(temp.path()), 1);
    drop(handle);
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetches_use_distinct_stores() {
    let registry = TestRegistry::start().await;
    registry
        .image("hedgehog/stage0", "latest", &[(IMAGE_LAYER, b"stage0")])
        .await;
    registry
        .image("hedgehog/stage1", "latest", &[(IMAGE_LAYER, b"stage1")])
        .await;
    let temp = TempDir::new().unwrap();
    let provider = Arc::new(registry.provider(temp.path()));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let provider = Arc::clone(&provider);
        tasks.push(tokio::spawn(async move {
            let name = format!("stage{}", i % 2);
            let handle = provider.fetch(&name).await.unwrap();
            (name, handle)
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }

    let mut paths: Vec<_> = handles
        .iter()
        .map(|(_, handle)| handle.store_path().unwrap().to_path_buf())
        .collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 8);
    assert_eq!(entries(temp.path()), 8);

    for (name, mut handle) in handles {
        assert_eq!(read_all(&mut handle).await, name.as_bytes());
        handle.close().await.unwrap();
    }
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test]
async fn test_provider_works_behind_trait_object() {
    let registry = TestRegistry::start().await;
    registry
        .image("hedgehog/stage0", "latest", &[(IMAGE_LAYER, b"installer")])
        .await;
    let temp = TempDir::new().unwrap();
    let provider: Arc<dyn Provider> = Arc::new(registry.provider(temp.path()));

    let mut artifact = provider.get("stage0").await.unwrap();
    artifact.close().await.unwrap();
    assert!(provider.get("missing").await.is_none());
    assert_eq!(entries(temp.path()), 0);
}
