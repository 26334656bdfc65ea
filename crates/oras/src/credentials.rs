//! Registry credentials and the token cache.
//!
//! The [`CredentialResolver`] only ever hands the configured credential to
//! the registry's own host. Any other host (a token realm, a blob redirect
//! target) gets [`Credential::EMPTY`], so secrets never leak to third
//! parties.
//!
//! Negotiated `Authorization` values are kept in a [`TokenCache`] keyed by
//! host and scope. The cache is owned by the provider and shared by every
//! concurrent fetch.

use reqwest::header::HeaderValue;
use secrecy::SecretString;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::trace;

/// Credential tuple for a registry.
#[derive(Debug, Default)]
pub struct Credential {
    /// Username for basic auth and token requests.
    pub username: Option<String>,
    /// Password for basic auth and token requests.
    pub password: Option<SecretString>,
    /// Bearer token used directly.
    pub access_token: Option<SecretString>,
    /// OAuth2 refresh token.
    pub refresh_token: Option<SecretString>,
}

impl Credential {
    /// The empty credential: anonymous access.
    pub const EMPTY: Self = Self {
        username: None,
        password: None,
        access_token: None,
        refresh_token: None,
    };

    /// Whether no credential field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.password.is_none()
            && self.access_token.is_none()
            && self.refresh_token.is_none()
    }

    /// Username and password, if both are configured.
    #[must_use]
    pub fn basic(&self) -> Option<(&str, &SecretString)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username.as_str(), password)),
            _ => None,
        }
    }
}

static EMPTY_CREDENTIAL: Credential = Credential::EMPTY;

/// Maps a target host to the credential to use for it.
#[derive(Debug)]
pub struct CredentialResolver {
    registry_host: String,
    credential: Credential,
}

impl CredentialResolver {
    /// Bind a credential to the registry host it belongs to.
    #[must_use]
    pub fn new(registry_host: impl Into<String>, credential: Credential) -> Self {
        Self {
            registry_host: registry_host.into(),
            credential,
        }
    }

    /// The credential for `target`.
    ///
    /// Returns the configured credential only when one is configured and
    /// `target` is exactly the registry host; the empty credential otherwise.
    #[must_use]
    pub fn resolve(&self, target: &str) -> &Credential {
        if !self.credential.is_empty() && target == self.registry_host {
            &self.credential
        } else {
            &EMPTY_CREDENTIAL
        }
    }
}

/// Cache key for negotiated authorization: one entry per host and scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    host: String,
    scope: String,
}

impl CacheKey {
    /// Create a key.
    #[must_use]
    pub fn new(host: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            scope: scope.into(),
        }
    }
}

/// Concurrency-safe cache of negotiated `Authorization` header values.
///
/// Values are marked sensitive so they never show up in `Debug` output.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: RwLock<HashMap<CacheKey, HeaderValue>>,
}

impl TokenCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached authorization for `key`.
    pub async fn get(&self, key: &CacheKey) -> Option<HeaderValue> {
        self.entries.read().await.get(key).cloned()
    }

    /// Store authorization for `key`, replacing any previous value.
    pub async fn insert(&self, key: CacheKey, mut value: HeaderValue) {
        value.set_sensitive(true);
        trace!(host = %key.host, scope = %key.scope, "Caching registry authorization");
        self.entries.write().await.insert(key, value);
    }

    /// Drop the authorization for `key`.
    pub async fn remove(&self, key: &CacheKey) {
        self.entries.write().await.remove(key);
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
