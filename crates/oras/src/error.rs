//! Error types for OCI artifact retrieval.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for OCI provider operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring the provider or fetching an artifact.
#[derive(Error, Debug)]
pub enum Error {
    /// The base path for temporary file stores is empty.
    #[error("File store base path must not be empty")]
    EmptyBasePath,

    /// The registry URL could not be parsed.
    #[error("Invalid registry URL '{url}': {message}")]
    InvalidRegistryUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        message: String,
    },

    /// The registry URL does not use the `oci` scheme.
    #[error("Registry URL must have OCI scheme, got '{0}'")]
    UnsupportedScheme(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS material could not be loaded or assembled.
    #[error("TLS error for '{}': {message}", .path.display())]
    Tls {
        /// The file being loaded.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// The repository name is not valid for an OCI registry.
    #[error("Invalid repository name '{name}': {message}")]
    InvalidRepository {
        /// The joined repository name.
        name: String,
        /// Why it was rejected.
        message: String,
    },

    /// Registry authentication failed.
    #[error("Authentication failed for registry '{0}': {1}")]
    AuthenticationFailed(String, String),

    /// Manifest, tag or blob does not exist on the registry.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The registry answered with an unexpected status.
    #[error("Registry returned HTTP {status} for {url}")]
    RegistryStatus {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// The copied graph contains no payload layer.
    #[error("No image layers in artifact '{0}'")]
    NoPayload(String),

    /// A manifest could not be interpreted.
    #[error("Invalid manifest {digest}: {message}")]
    InvalidManifest {
        /// The manifest digest.
        digest: String,
        /// Error message.
        message: String,
    },

    /// A manifest is larger than the provider accepts.
    #[error("Manifest {reference} is {size} bytes, larger than the {limit} byte limit")]
    ManifestTooLarge {
        /// Tag reference or digest of the manifest.
        reference: String,
        /// Declared or received size so far.
        size: u64,
        /// The limit.
        limit: u64,
    },

    /// A digest string is malformed or uses an unsupported algorithm.
    #[error("Invalid digest '{0}'")]
    InvalidDigest(String),

    /// Digest mismatch after download.
    #[error("Digest mismatch for blob: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The expected digest.
        expected: String,
        /// The computed digest.
        actual: String,
    },

    /// Size mismatch after download.
    #[error("Size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// The blob digest.
        digest: String,
        /// Size declared by the descriptor.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },

    /// The fetch did not finish within its deadline.
    #[error("Fetching '{repository}' timed out after {timeout:?}")]
    Timeout {
        /// The repository being fetched.
        repository: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an invalid registry URL error.
    #[must_use]
    pub fn invalid_registry_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRegistryUrl {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a TLS material error.
    #[must_use]
    pub fn tls(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Tls {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid repository error.
    #[must_use]
    pub fn invalid_repository(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRepository {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an authentication failed error.
    #[must_use]
    pub fn authentication_failed(registry: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthenticationFailed(registry.into(), message.into())
    }

    /// Create an invalid manifest error.
    #[must_use]
    pub fn invalid_manifest(digest: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            digest: digest.into(),
            message: message.into(),
        }
    }

    /// Create a manifest size limit error.
    #[must_use]
    pub fn manifest_too_large(reference: impl Into<String>, size: u64) -> Self {
        Self::ManifestTooLarge {
            reference: reference.into(),
            size,
            limit: crate::MAX_MANIFEST_BYTES,
        }
    }

    /// Create a digest mismatch error.
    #[must_use]
    pub fn digest_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::DigestMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether this error is a configuration problem rather than a
    /// per-request failure.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::EmptyBasePath
                | Self::InvalidRegistryUrl { .. }
                | Self::UnsupportedScheme(_)
                | Self::Config(_)
                | Self::Tls { .. }
        )
    }
}

/// Typed outcome of a failed fetch.
///
/// The provider's `get` collapses all of these into absence; `fetch`
/// exposes the distinction. No variant ever leaves a temporary file store
/// behind.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The artifact does not exist, or its graph holds no payload layer.
    #[error("artifact not found: {0}")]
    NotFound(#[source] Error),

    /// The registry refused our credentials.
    #[error("permission denied: {0}")]
    Permission(#[source] Error),

    /// Network, registry-side, integrity or local I/O failure. Retrying is safe.
    #[error("transient fetch failure: {0}")]
    Transient(#[source] Error),
}

impl FetchError {
    /// The underlying error.
    #[must_use]
    pub fn inner(&self) -> &Error {
        match self {
            Self::NotFound(e) | Self::Permission(e) | Self::Transient(e) => e,
        }
    }

    /// Whether retrying the fetch could succeed without a change on the registry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<Error> for FetchError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(_) | Error::NoPayload(_) | Error::InvalidRepository { .. } => {
                Self::NotFound(err)
            }
            Error::AuthenticationFailed(..) => Self::Permission(err),
            Error::RegistryStatus { status, .. } if status == 401 || status == 403 => {
                Self::Permission(err)
            }
            _ => Self::Transient(err),
        }
    }
}
