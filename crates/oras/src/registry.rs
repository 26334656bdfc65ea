//! Registry references and repository access.
//!
//! A [`RegistryRef`] is the parsed `oci://host[:port]/prefix` URL the provider
//! is configured with. Artifact names are joined onto its prefix to form
//! repository names, and a `Repository` speaks the distribution API for one
//! of them.

use bytes::{Bytes, BytesMut};
use oci_distribution::Reference;
use oci_distribution::manifest::{
    IMAGE_MANIFEST_LIST_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_INDEX_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use tracing::{debug, trace};
use url::Url;

use crate::auth::{AuthClient, RegistryResponse};
use crate::graph::{ARTIFACT_MANIFEST_MEDIA_TYPE, ContentDescriptor, is_manifest};
use crate::store::sha256_digest;
use crate::{Error, MAX_MANIFEST_BYTES, Result};

/// URL scheme accepted for registry URLs.
pub const OCI_SCHEME: &str = "oci";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// OCI distribution repository name grammar.
static REPOSITORY_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*)*$")
        .ok()
});

/// A parsed registry URL: the registry host and the repository prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRef {
    host: String,
    prefix: String,
}

impl RegistryRef {
    /// Parse an `oci://host[:port][/prefix]` URL.
    ///
    /// # Errors
    ///
    /// Fails if the URL does not parse, has no host, or uses another scheme.
    pub fn parse(registry_url: &str) -> Result<Self> {
        let url = Url::parse(registry_url)
            .map_err(|e| Error::invalid_registry_url(registry_url, e.to_string()))?;
        if url.scheme() != OCI_SCHEME {
            return Err(Error::UnsupportedScheme(url.scheme().to_string()));
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::invalid_registry_url(registry_url, "missing host"))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(Self {
            host,
            prefix: url.path().to_string(),
        })
    }

    /// Registry host, with the port if one was given.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path prefix prepended to every artifact name.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Repository name for `artifact` under this registry's prefix.
    ///
    /// # Errors
    ///
    /// See [`repository_name`].
    pub fn repository_name(&self, artifact: &str) -> Result<String> {
        repository_name(&self.prefix, artifact)
    }
}

/// Join `prefix` and `artifact` into a repository name.
///
/// Paths are cleaned lexically: empty and `.` segments are dropped and `..`
/// removes the previous segment. The result never starts with `/`.
///
/// # Errors
///
/// Fails if the joined name is empty or is not a valid OCI repository name.
pub fn repository_name(prefix: &str, artifact: &str) -> Result<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in prefix.split('/').chain(artifact.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    let name = segments.join("/");

    if name.is_empty() {
        return Err(Error::invalid_repository(name, "repository name is empty"));
    }
    let valid = REPOSITORY_NAME
        .as_ref()
        .is_some_and(|grammar| grammar.is_match(&name));
    if !valid {
        return Err(Error::invalid_repository(
            name,
            "must be lowercase path components separated by '/'",
        ));
    }
    Ok(name)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaTypeField {
    #[serde(default)]
    media_type: Option<String>,
}

/// One repository on the registry.
#[derive(Debug, Clone)]
pub(crate) struct Repository {
    client: Arc<AuthClient>,
    host: String,
    name: String,
    scheme: &'static str,
    scope: String,
}

impl Repository {
    pub(crate) fn new(
        client: Arc<AuthClient>,
        registry: &RegistryRef,
        name: String,
        plain_http: bool,
    ) -> Self {
        let scope = format!("repository:{name}:pull");
        Self {
            client,
            host: registry.host.clone(),
            name,
            scheme: if plain_http { "http" } else { "https" },
            scope,
        }
    }

    /// Repository name on the registry.
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Full reference for `tag`, for logging.
    pub(crate) fn reference(&self, tag: &str) -> Reference {
        Reference::with_tag(self.host.clone(), self.name.clone(), tag.to_string())
    }

    /// Resolve `tag` to its manifest descriptor and body.
    ///
    /// The digest is taken from `Docker-Content-Digest` when present and is
    /// always checked against the body.
    pub(crate) async fn resolve(&self, tag: &str) -> Result<(ContentDescriptor, Bytes)> {
        let url = self.url("manifests", tag)?;
        debug!(reference = %self.reference(tag), "Resolving tag");

        let mut response = self
            .client
            .get(&self.host, &url, Some(manifest_accept().as_str()), &self.scope)
            .await?;
        self.check_status(&response, &url, &format!("tag '{tag}'"))?;

        let header_digest = header_str(&response, DIGEST_HEADER);
        let content_type = header_str(&response, CONTENT_TYPE.as_str())
            .map(|value| media_type_essence(&value).to_string())
            .filter(|media_type| is_manifest(media_type));
        let body = read_manifest(&mut response, &self.reference(tag).to_string()).await?;

        let computed = sha256_digest(&body);
        let digest = match header_digest {
            Some(digest) if digest != computed => {
                return Err(Error::digest_mismatch(digest, computed));
            }
            Some(digest) => digest,
            None => computed,
        };

        let media_type = match content_type {
            Some(media_type) => media_type,
            None => serde_json::from_slice::<MediaTypeField>(&body)
                .ok()
                .and_then(|field| field.media_type)
                .unwrap_or_else(|| OCI_IMAGE_MEDIA_TYPE.to_string()),
        };

        let descriptor = ContentDescriptor::new(media_type, digest, body.len() as u64);
        debug!(
            reference = %self.reference(tag),
            digest = %descriptor.digest,
            media_type = %descriptor.media_type,
            "Resolved tag"
        );
        Ok((descriptor, body))
    }

    /// Start downloading the manifest for `descriptor`.
    ///
    /// Manifests declaring more than [`MAX_MANIFEST_BYTES`] are refused
    /// without a request.
    pub(crate) async fn fetch_manifest(
        &self,
        descriptor: &ContentDescriptor,
    ) -> Result<RegistryResponse> {
        if descriptor.size > MAX_MANIFEST_BYTES {
            return Err(Error::manifest_too_large(&descriptor.digest, descriptor.size));
        }
        let url = self.url("manifests", &descriptor.digest)?;
        trace!(repo = %self.name, digest = %descriptor.digest, "Fetching manifest");

        let response = self
            .client
            .get(&self.host, &url, Some(descriptor.media_type.as_str()), &self.scope)
            .await?;
        self.check_status(&response, &url, &format!("manifest {}", descriptor.digest))?;
        Ok(response)
    }

    /// Start downloading the blob for `descriptor`.
    pub(crate) async fn fetch_blob(&self, descriptor: &ContentDescriptor) -> Result<RegistryResponse> {
        let url = self.url("blobs", &descriptor.digest)?;
        trace!(repo = %self.name, digest = %descriptor.digest, "Fetching blob");

        let response = self.client.get(&self.host, &url, None, &self.scope).await?;
        self.check_status(&response, &url, &format!("blob {}", descriptor.digest))?;
        Ok(response)
    }

    fn url(&self, kind: &str, reference: &str) -> Result<Url> {
        let url = format!(
            "{}://{}/v2/{}/{}/{}",
            self.scheme, self.host, self.name, kind, reference
        );
        Url::parse(&url).map_err(|e| Error::invalid_registry_url(url.clone(), e.to_string()))
    }

    fn check_status(&self, response: &RegistryResponse, url: &Url, what: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::authentication_failed(
                &self.host,
                format!("access to {what} in '{}' denied (HTTP {})", self.name, status.as_u16()),
            )),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("{what} in '{}'", self.name))),
            _ => Err(Error::RegistryStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }
}

/// Read a whole manifest body, failing as soon as it passes
/// [`MAX_MANIFEST_BYTES`].
async fn read_manifest(response: &mut RegistryResponse, reference: &str) -> Result<Bytes> {
    if let Some(length) = response
        .content_length()
        .filter(|length| *length > MAX_MANIFEST_BYTES)
    {
        return Err(Error::manifest_too_large(reference, length));
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        let size = (body.len() + chunk.len()) as u64;
        if size > MAX_MANIFEST_BYTES {
            return Err(Error::manifest_too_large(reference, size));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

/// `Accept` header listing every manifest type we can walk.
fn manifest_accept() -> String {
    [
        OCI_IMAGE_MEDIA_TYPE,
        OCI_IMAGE_INDEX_MEDIA_TYPE,
        IMAGE_MANIFEST_MEDIA_TYPE,
        IMAGE_MANIFEST_LIST_MEDIA_TYPE,
        ARTIFACT_MANIFEST_MEDIA_TYPE,
    ]
    .join(", ")
}

fn header_str(response: &RegistryResponse, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Media type without parameters (`; charset=...`).
fn media_type_essence(value: &str) -> &str {
    value.split(';').next().unwrap_or(value).trim()
}
