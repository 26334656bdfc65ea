//! Provider configuration.
//!
//! [`ProviderConfig`] is the construction bundle for
//! [`OrasProvider`](crate::OrasProvider). It can be deserialized from the
//! seeder's YAML configuration or assembled in code with the `with_*`
//! builder methods.
//!
//! ```yaml
//! registry_url: oci://registry.example.com:5000/hedgehog/artifacts
//! file_store_base_path: /var/lib/seeder/artifacts
//! server_ca: /etc/hedgehog/seeder/registry-ca.pem
//! client_cert: /etc/hedgehog/seeder/registry-cert.pem
//! client_key: /etc/hedgehog/seeder/registry-key.pem
//! username: seeder
//! password: hunter2
//! ```

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::Credential;
use crate::{DEFAULT_FETCH_TIMEOUT, DEFAULT_TAG, Error, Result};

/// Configuration for an OCI artifact provider.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Registry URL, e.g. `oci://registry.example.com/hedgehog`.
    pub registry_url: String,

    /// Directory under which per-fetch temporary file stores are created.
    pub file_store_base_path: PathBuf,

    /// PEM bundle with the CA certificates trusted for the registry.
    #[serde(default, rename = "server_ca")]
    pub server_ca_path: Option<PathBuf>,

    /// PEM client certificate presented to the registry.
    #[serde(default, rename = "client_cert")]
    pub client_cert_path: Option<PathBuf>,

    /// PEM private key matching `client_cert`.
    #[serde(default, rename = "client_key")]
    pub client_key_path: Option<PathBuf>,

    /// Username for basic auth and token negotiation.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for basic auth and token negotiation.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,

    /// Pre-issued bearer token, used as-is.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub access_token: Option<SecretString>,

    /// OAuth2 refresh token exchanged for bearer tokens.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub refresh_token: Option<SecretString>,

    /// Talk plain HTTP to the registry instead of HTTPS.
    #[serde(default)]
    pub plain_http: bool,

    /// Tag fetched for every artifact.
    #[serde(default = "default_tag")]
    pub tag: String,

    /// Upper bound for a single fetch, in seconds.
    #[serde(
        default = "default_fetch_timeout",
        rename = "fetch_timeout_secs",
        deserialize_with = "deserialize_secs"
    )]
    pub fetch_timeout: Duration,
}

fn default_tag() -> String {
    DEFAULT_TAG.to_string()
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(|value| value.map(SecretString::from))
}

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

impl ProviderConfig {
    /// Create a configuration with defaults for everything but the registry
    /// URL and the store base path.
    #[must_use]
    pub fn new(registry_url: impl Into<String>, file_store_base_path: impl Into<PathBuf>) -> Self {
        Self {
            registry_url: registry_url.into(),
            file_store_base_path: file_store_base_path.into(),
            server_ca_path: None,
            client_cert_path: None,
            client_key_path: None,
            username: None,
            password: None,
            access_token: None,
            refresh_token: None,
            plain_http: false,
            tag: default_tag(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Parse a configuration from YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a configuration from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("open '{}': {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    /// Trust the CA certificates in this PEM bundle instead of the bundled roots.
    #[must_use]
    pub fn with_server_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_ca_path = Some(path.into());
        self
    }

    /// Present this client certificate and key to the registry.
    #[must_use]
    pub fn with_client_identity(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    /// Authenticate with a username and password.
    #[must_use]
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// Authenticate with pre-issued tokens.
    #[must_use]
    pub fn with_tokens(
        mut self,
        access_token: Option<String>,
        refresh_token: Option<String>,
    ) -> Self {
        self.access_token = access_token.map(SecretString::from);
        self.refresh_token = refresh_token.map(SecretString::from);
        self
    }

    /// Use plain HTTP instead of HTTPS.
    #[must_use]
    pub fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    /// Split off the credential fields.
    pub(crate) fn take_credential(&mut self) -> Credential {
        Credential {
            username: self.username.take(),
            password: self.password.take(),
            access_token: self.access_token.take(),
            refresh_token: self.refresh_token.take(),
        }
    }

    /// Fetch this tag instead of `latest`.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Bound every fetch by this duration.
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}
