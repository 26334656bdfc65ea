//! Temporary content-addressed file store.
//!
//! Every fetch copies its content graph into a private [`FileStore`]
//! directory, created fresh under the configured base path and removed
//! when the fetch fails or when the handle streaming from it is closed.
//!
//! Structure:
//! ```text
//! <base>/oras-provider-file-store-<uuid>/
//! ├── blobs/
//! │   └── sha256/
//! │       └── abc123...  # Verified manifests and layers
//! └── ingest/
//!     └── <uuid>         # Downloads in progress
//! ```
//!
//! Content only appears under `blobs/` after its size and digest have been
//! checked against the descriptor it was fetched for.

use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::graph::ContentDescriptor;
use crate::{Error, Result};

/// Name prefix of every store directory.
pub const STORE_PREFIX: &str = "oras-provider-file-store-";

const SHA256: &str = "sha256";

/// A per-fetch content-addressed store on local disk.
///
/// The directory is deleted by [`FileStore::remove`] or, failing that, when
/// the store is dropped.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    removed: bool,
}

impl FileStore {
    /// Create a new, uniquely named store under `base`.
    ///
    /// `base` is created if it does not exist.
    pub async fn create(base: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(base).await?;
        let root = base.join(format!("{STORE_PREFIX}{}", Uuid::new_v4().simple()));
        // Fails instead of reusing an existing directory
        tokio::fs::create_dir(&root).await?;

        let store = Self {
            root,
            removed: false,
        };
        tokio::fs::create_dir_all(store.root.join("blobs").join(SHA256)).await?;
        tokio::fs::create_dir_all(store.root.join("ingest")).await?;

        debug!(path = %store.root.display(), "Created temporary file store");
        Ok(store)
    }

    /// The store directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob with `digest`.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = parse_digest(digest)?;
        Ok(self.root.join("blobs").join(SHA256).join(hex))
    }

    /// Whether the blob with `digest` is present.
    #[must_use]
    pub fn contains(&self, digest: &str) -> bool {
        self.blob_path(digest).is_ok_and(|path| path.exists())
    }

    /// Store `bytes` as the content of `descriptor`.
    pub async fn put_bytes(&self, descriptor: &ContentDescriptor, bytes: &[u8]) -> Result<PathBuf> {
        let mut writer = self.writer(descriptor).await?;
        writer.write(bytes).await?;
        writer.commit().await
    }

    /// Start writing the content of `descriptor`.
    pub async fn writer(&self, descriptor: &ContentDescriptor) -> Result<BlobWriter> {
        let target = self.blob_path(&descriptor.digest)?;
        let partial = self
            .root
            .join("ingest")
            .join(Uuid::new_v4().simple().to_string());
        let file = tokio::fs::File::create(&partial).await?;

        Ok(BlobWriter {
            file,
            partial,
            target,
            expected: descriptor.clone(),
            hasher: Sha256::new(),
            written: 0,
            committed: false,
        })
    }

    /// Read the whole blob with `digest`.
    pub async fn read(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        tokio::fs::read(&path).await.map_err(|e| not_found_or_io(e, digest))
    }

    /// Open the blob with `digest` for streaming.
    pub async fn open(&self, digest: &str) -> Result<tokio::fs::File> {
        let path = self.blob_path(digest)?;
        tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(e, digest))
    }

    /// Delete the store directory.
    ///
    /// Failures are logged, never returned. If the returned future is
    /// dropped early, the store falls back to removing itself on drop.
    pub async fn remove(mut self) {
        let result = tokio::fs::remove_dir_all(&self.root).await;
        self.removed = true;
        log_removal(&self.root, result);
    }

    fn remove_dir(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        log_removal(&self.root, std::fs::remove_dir_all(&self.root));
    }
}

fn log_removal(root: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => debug!(path = %root.display(), "Removed temporary file store"),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %root.display(), "Temporary file store already gone");
        }
        Err(e) => warn!(
            path = %root.display(),
            error = %e,
            "Failed to remove temporary file store"
        ),
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        self.remove_dir();
    }
}

/// Streams one blob into the store, verifying it on commit.
pub struct BlobWriter {
    file: tokio::fs::File,
    partial: PathBuf,
    target: PathBuf,
    expected: ContentDescriptor,
    hasher: Sha256,
    written: u64,
    committed: bool,
}

impl BlobWriter {
    /// Append `chunk`.
    ///
    /// Fails as soon as more bytes arrive than the descriptor declares.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let written = self.written + chunk.len() as u64;
        if written > self.expected.size {
            return Err(Error::SizeMismatch {
                digest: self.expected.digest.clone(),
                expected: self.expected.size,
                actual: written,
            });
        }
        self.hasher.update(chunk);
        self.file.write_all(chunk).await?;
        self.written = written;
        Ok(())
    }

    /// Verify size and digest, then move the blob into place.
    pub async fn commit(mut self) -> Result<PathBuf> {
        self.file.flush().await?;

        if self.written != self.expected.size {
            return Err(Error::SizeMismatch {
                digest: self.expected.digest.clone(),
                expected: self.expected.size,
                actual: self.written,
            });
        }
        let actual = format!("{SHA256}:{}", hex::encode(self.hasher.clone().finalize()));
        if actual != self.expected.digest {
            return Err(Error::digest_mismatch(&self.expected.digest, actual));
        }

        tokio::fs::rename(&self.partial, &self.target).await?;
        self.committed = true;
        trace!(digest = %self.expected.digest, path = %self.target.display(), "Committed blob");
        Ok(self.target.clone())
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.partial);
        }
    }
}

/// The `sha256:<hex>` digest of `bytes`.
#[must_use]
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("{SHA256}:{}", hex::encode(Sha256::digest(bytes)))
}

/// Hex part of a `sha256:` digest.
///
/// Only lowercase 64 character hex digests are accepted, so a digest can
/// never name a path outside the store.
fn parse_digest(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| Error::InvalidDigest(digest.to_string()))?;
    let valid = hex.len() == 64
        && hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if valid {
        Ok(hex)
    } else {
        Err(Error::InvalidDigest(digest.to_string()))
    }
}

fn not_found_or_io(err: std::io::Error, digest: &str) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::NotFound(format!("blob {digest} in file store"))
    } else {
        Error::Io(err)
    }
}
