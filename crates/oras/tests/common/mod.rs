//! Mock OCI registry shared by the integration tests.

#![allow(dead_code)]

use seeder_oras::{OrasProvider, ProviderConfig};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockBuilder, MockServer, ResponseTemplate};

pub const PREFIX: &str = "/hedgehog";
pub const IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const IMAGE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const METADATA: &str = "application/vnd.hedgehog.metadata.v1+json";

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("seeder_oras=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Number of entries directly under `base`.
pub fn entries(base: &Path) -> usize {
    std::fs::read_dir(base).map(Iterator::count).unwrap_or(0)
}

/// A wiremock server speaking just enough of the distribution API.
pub struct TestRegistry {
    pub server: MockServer,
    authorization: Option<String>,
}

impl TestRegistry {
    pub async fn start() -> Self {
        init_tracing();
        Self {
            server: MockServer::start().await,
            authorization: None,
        }
    }

    /// Serve content only to requests carrying `authorization`.
    ///
    /// Every other `/v2/` request is answered `401` with the challenge built
    /// from the registry's `host:port`.
    pub async fn protected(authorization: &str, challenge: impl FnOnce(&str) -> String) -> Self {
        let registry = Self {
            authorization: Some(authorization.to_string()),
            ..Self::start().await
        };
        let challenge = challenge(&registry.host());
        Mock::given(method("GET"))
            .and(path_regex("^/v2/"))
            .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge))
            .with_priority(10)
            .mount(&registry.server)
            .await;
        registry
    }

    fn get(&self, route: String) -> MockBuilder {
        let builder = Mock::given(method("GET")).and(path(route));
        match &self.authorization {
            Some(value) => builder.and(header("Authorization", value.as_str())),
            None => builder,
        }
    }

    /// `oci://` URL of this registry with the test prefix.
    pub fn url(&self) -> String {
        format!("oci://{}{}", self.server.address(), PREFIX)
    }

    /// `host:port` of this registry.
    pub fn host(&self) -> String {
        self.server.address().to_string()
    }

    /// Provider config pointed at this registry.
    pub fn config(&self, base: &Path) -> ProviderConfig {
        ProviderConfig::new(self.url(), base).with_plain_http(true)
    }

    pub fn provider(&self, base: &Path) -> OrasProvider {
        OrasProvider::new(self.config(base)).unwrap()
    }

    /// Serve `body` as a blob of `repo`; returns its descriptor.
    pub async fn blob(&self, repo: &str, media_type: &str, body: &[u8]) -> Value {
        let digest = digest(body);
        let response =
            ResponseTemplate::new(200).set_body_raw(body.to_vec(), "application/octet-stream");
        self.get(format!("/v2/{repo}/blobs/{digest}"))
            .respond_with(response)
            .mount(&self.server)
            .await;
        json!({ "mediaType": media_type, "digest": digest, "size": body.len() })
    }

    /// Serve `manifest` for `repo` under `tag` and under its digest.
    pub async fn manifest(
        &self,
        repo: &str,
        tag: &str,
        media_type: &str,
        manifest: &Value,
    ) -> String {
        self.manifest_with(repo, tag, media_type, manifest, |response| response)
            .await
    }

    /// Like [`manifest`](Self::manifest), with a hook to adjust the tag response.
    pub async fn manifest_with(
        &self,
        repo: &str,
        tag: &str,
        media_type: &str,
        manifest: &Value,
        adjust: impl FnOnce(ResponseTemplate) -> ResponseTemplate,
    ) -> String {
        let body = manifest.to_string().into_bytes();
        let digest = digest(&body);

        let response = ResponseTemplate::new(200)
            .set_body_raw(body.clone(), media_type)
            .insert_header("Docker-Content-Digest", digest.as_str());
        self.get(format!("/v2/{repo}/manifests/{tag}"))
            .respond_with(adjust(response))
            .mount(&self.server)
            .await;
        self.get(format!("/v2/{repo}/manifests/{digest}"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, media_type))
            .mount(&self.server)
            .await;
        digest
    }

    /// Push an image whose layers are `(media type, content)` pairs.
    pub async fn image(&self, repo: &str, tag: &str, layers: &[(&str, &[u8])]) -> String {
        let config = self.blob(repo, IMAGE_CONFIG, b"{}").await;
        let mut descriptors = Vec::new();
        for (media_type, content) in layers {
            descriptors.push(self.blob(repo, media_type, content).await);
        }
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": IMAGE_MANIFEST,
            "config": config,
            "layers": descriptors,
        });
        self.manifest(repo, tag, IMAGE_MANIFEST, &manifest).await
    }

    /// Delay every tag response by `delay`.
    pub async fn slow_image(&self, repo: &str, tag: &str, delay: Duration) {
        let config = self.blob(repo, IMAGE_CONFIG, b"{}").await;
        let layer = self.blob(repo, IMAGE_LAYER, b"slow").await;
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": IMAGE_MANIFEST,
            "config": config,
            "layers": [layer],
        });
        self.manifest_with(repo, tag, IMAGE_MANIFEST, &manifest, |response| {
            response.set_delay(delay)
        })
        .await;
    }
}
