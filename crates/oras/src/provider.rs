//! The OCI artifact provider.
//!
//! [`OrasProvider::fetch`] runs the whole retrieval for one artifact name:
//!
//! 1. Join the registry prefix and the artifact name into a repository name
//! 2. Create a fresh file store under the configured base path
//! 3. Copy the tag's content graph into the store
//! 4. Select the payload node and open it
//! 5. Hand the stream and the store to an [`ArtifactHandle`]
//!
//! Steps 2 to 5 are bounded by the fetch timeout. Every failure after step 2
//! removes the store before returning, and a cancelled or timed out fetch
//! removes it when the in-flight future is dropped.

use async_trait::async_trait;
use seeder_artifacts::{Artifact, Provider};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::auth::AuthClient;
use crate::config::ProviderConfig;
use crate::copy::copy_graph;
use crate::credentials::{CredentialResolver, TokenCache};
use crate::graph;
use crate::handle::ArtifactHandle;
use crate::registry::{RegistryRef, Repository};
use crate::store::FileStore;
use crate::transport::{TlsSettings, Transport};
use crate::{Error, FetchError, Result};

/// Retrieves artifacts from an OCI registry.
///
/// Cheap to share: wrap it in an `Arc` and call [`fetch`](Self::fetch) or
/// [`Provider::get`] from as many tasks as needed. Each fetch works in its
/// own file store.
#[derive(Debug)]
pub struct OrasProvider {
    registry: RegistryRef,
    client: Arc<AuthClient>,
    tokens: Arc<TokenCache>,
    base_path: PathBuf,
    plain_http: bool,
    tag: String,
    fetch_timeout: Duration,
}

impl OrasProvider {
    /// Create a provider.
    ///
    /// # Errors
    ///
    /// Fails if the base path is empty, the registry URL is invalid or not
    /// `oci://`, or the TLS material cannot be loaded.
    pub fn new(mut config: ProviderConfig) -> Result<Self> {
        if config.file_store_base_path.as_os_str().is_empty() {
            return Err(Error::EmptyBasePath);
        }
        let registry = RegistryRef::parse(&config.registry_url)?;

        let transport = Arc::new(Transport::new(&TlsSettings {
            server_ca_path: config.server_ca_path.take(),
            client_cert_path: config.client_cert_path.take(),
            client_key_path: config.client_key_path.take(),
        })?);
        let credentials = Arc::new(CredentialResolver::new(
            registry.host(),
            config.take_credential(),
        ));
        let tokens = Arc::new(TokenCache::new());
        let client = Arc::new(AuthClient::new(
            transport,
            credentials,
            Arc::clone(&tokens),
        ));

        info!(
            registry = %registry.host(),
            prefix = %registry.prefix(),
            tag = %config.tag,
            "Created OCI artifact provider"
        );

        Ok(Self {
            registry,
            client,
            tokens,
            base_path: config.file_store_base_path,
            plain_http: config.plain_http,
            tag: config.tag,
            fetch_timeout: config.fetch_timeout,
        })
    }

    /// The registry this provider reads from.
    #[must_use]
    pub fn registry(&self) -> &RegistryRef {
        &self.registry
    }

    /// Authorization negotiated so far, shared by every fetch.
    #[must_use]
    pub fn token_cache(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    /// Fetch the payload of `artifact`.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] classifying the failure. No file store is
    /// left behind for any error.
    pub async fn fetch(&self, artifact: &str) -> std::result::Result<ArtifactHandle, FetchError> {
        let name = match self.registry.repository_name(artifact) {
            Ok(name) => name,
            Err(e) => {
                error!(artifact, prefix = %self.registry.prefix(), error = %e, "Getting repository reference failed");
                return Err(e.into());
            }
        };
        let repository = Repository::new(
            Arc::clone(&self.client),
            &self.registry,
            name.clone(),
            self.plain_http,
        );

        match tokio::time::timeout(self.fetch_timeout, self.fetch_repository(&repository)).await {
            Ok(result) => result.map_err(FetchError::from),
            Err(_) => {
                error!(repo = %name, timeout = ?self.fetch_timeout, "Fetching artifact timed out");
                Err(Error::Timeout {
                    repository: name,
                    timeout: self.fetch_timeout,
                }
                .into())
            }
        }
    }

    async fn fetch_repository(&self, repository: &Repository) -> Result<ArtifactHandle> {
        let repo = repository.name();

        let store = match FileStore::create(&self.base_path).await {
            Ok(store) => store,
            Err(e) => {
                error!(repo, path = %self.base_path.display(), error = %e, "Creating temporary file store failed");
                return Err(e);
            }
        };

        let root = match copy_graph(repository, &self.tag, &store).await {
            Ok(root) => root,
            Err(e) => {
                error!(repo, reference = %repository.reference(&self.tag), error = %e, "Copying artifact into file store failed");
                store.remove().await;
                return Err(e);
            }
        };

        let payload = match graph::select(&root, &store).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                error!(repo, root = %root.digest, "No image layers in artifact");
                store.remove().await;
                return Err(Error::NoPayload(repo.to_string()));
            }
            Err(e) => {
                error!(repo, root = %root.digest, error = %e, "Enumerating content graph failed");
                store.remove().await;
                return Err(e);
            }
        };

        let reader = match store.open(&payload.digest).await {
            Ok(reader) => reader,
            Err(e) => {
                error!(repo, digest = %payload.digest, error = %e, "Opening payload failed");
                store.remove().await;
                return Err(e);
            }
        };

        debug!(repo, digest = %payload.digest, size = payload.size, "Fetched artifact");
        Ok(ArtifactHandle::new(reader, store, payload))
    }
}

#[async_trait]
impl Provider for OrasProvider {
    async fn get(&self, artifact: &str) -> Option<Box<dyn Artifact>> {
        match self.fetch(artifact).await {
            Ok(handle) => Some(Box::new(handle)),
            Err(e) => {
                debug!(artifact, error = %e, "Artifact unavailable");
                None
            }
        }
    }
}
