//! OCI registry artifact provider for the seeder.
//!
//! This crate provides functionality to:
//! - Resolve an artifact name against an `oci://` registry URL
//! - Copy the tag's content graph into a private temporary file store
//! - Select the single payload layer out of the copied graph
//! - Stream the payload to the caller and delete the store on close
//!
//! # Example
//!
//! ```ignore
//! use seeder_oras::{OrasProvider, ProviderConfig};
//! use tokio::io::AsyncReadExt;
//!
//! let config = ProviderConfig::new("oci://registry.local:5000/hedgehog", "/var/lib/seeder")
//!     .with_server_ca("/etc/hedgehog/seeder/registry-ca.pem");
//! let provider = OrasProvider::new(config)?;
//!
//! let mut handle = provider.fetch("stage0/installer").await?;
//! let mut payload = Vec::new();
//! handle.read_to_end(&mut payload).await?;
//! handle.close().await?;
//! ```

#![warn(missing_docs)]

mod auth;
mod config;
mod copy;
mod credentials;
mod error;
mod graph;
mod handle;
mod provider;
mod registry;
mod store;
mod transport;

use std::time::Duration;

pub use config::ProviderConfig;
pub use credentials::{CacheKey, Credential, CredentialResolver, TokenCache};
pub use error::{Error, FetchError, Result};
pub use graph::{ContentDescriptor, ContentGraph};
pub use handle::ArtifactHandle;
pub use provider::OrasProvider;
pub use registry::{RegistryRef, repository_name};
pub use store::{BlobWriter, FileStore};
pub use transport::{TlsSettings, Transport};

/// Media type of the payload layer (uncompressed tar).
pub use oci_distribution::manifest::IMAGE_LAYER_MEDIA_TYPE;

/// Tag fetched when none is configured.
pub const DEFAULT_TAG: &str = "latest";

/// Upper bound for a single fetch when none is configured.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest manifest accepted from a registry (4 MiB).
pub const MAX_MANIFEST_BYTES: u64 = 4 * 1024 * 1024;
