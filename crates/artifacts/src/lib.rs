//! Artifact provider seam for the seeder.
//!
//! The seeder serves installer artifacts to clients. Where those bytes come
//! from is hidden behind [`Provider`]: a provider turns an artifact name into
//! an [`Artifact`] stream, or reports that it has nothing to offer.
//!
//! Every per-request failure is collapsed into `None`. Providers log the
//! reason themselves; callers only decide whether to serve or to answer
//! "not found".
//!
//! # Example
//!
//! ```ignore
//! use seeder_artifacts::Provider;
//! use tokio::io::AsyncReadExt;
//!
//! async fn serve(provider: &dyn Provider) -> std::io::Result<Vec<u8>> {
//!     let Some(mut artifact) = provider.get("stage0/installer").await else {
//!         return Ok(Vec::new());
//!     };
//!     let mut bytes = Vec::new();
//!     artifact.read_to_end(&mut bytes).await?;
//!     artifact.close().await?;
//!     Ok(bytes)
//! }
//! ```

#![warn(missing_docs)]

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// A retrieved artifact: a byte stream that must be closed exactly once.
///
/// Closing releases every resource backing the stream (open files,
/// temporary directories). Implementations must make a second `close` a
/// no-op rather than an error.
#[async_trait]
pub trait Artifact: AsyncRead + Send + Unpin {
    /// Release the stream and any storage that backs it.
    ///
    /// Only errors from closing the stream itself are returned. Failures
    /// to release auxiliary storage are logged by the implementation.
    async fn close(&mut self) -> io::Result<()>;
}

/// A source of installer artifacts.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Retrieve the artifact with the given name.
    ///
    /// Returns `None` when the artifact is unavailable for any reason.
    async fn get(&self, artifact: &str) -> Option<Box<dyn Artifact>>;
}

#[async_trait]
impl<P> Provider for Arc<P>
where
    P: Provider + ?Sized,
{
    async fn get(&self, artifact: &str) -> Option<Box<dyn Artifact>> {
        (**self).get(artifact).await
    }
}
