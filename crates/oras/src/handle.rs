//! Streaming handle over a fetched payload.

use async_trait::async_trait;
use seeder_artifacts::Artifact;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

use crate::graph::ContentDescriptor;
use crate::store::FileStore;

/// A payload stream that owns the file store it reads from.
///
/// [`close`](ArtifactHandle::close) closes the stream and then deletes the
/// store. Dropping an unclosed handle deletes the store as well.
#[derive(Debug)]
pub struct ArtifactHandle {
    // Declared before `store` so the file is closed before the directory
    // is removed on drop.
    reader: Option<File>,
    store: Option<FileStore>,
    descriptor: ContentDescriptor,
}

impl ArtifactHandle {
    pub(crate) fn new(reader: File, store: FileStore, descriptor: ContentDescriptor) -> Self {
        Self {
            reader: Some(reader),
            store: Some(store),
            descriptor,
        }
    }

    /// Descriptor of the payload being streamed.
    #[must_use]
    pub fn descriptor(&self) -> &ContentDescriptor {
        &self.descriptor
    }

    /// Directory of the backing store, `None` once closed.
    #[must_use]
    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_ref().map(FileStore::root)
    }

    /// Whether the handle has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.reader.is_none() && self.store.is_none()
    }

    /// Close the stream, then delete the backing store.
    ///
    /// The store is removed unconditionally; failures to remove it are
    /// logged. Closing twice is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        if let Some(reader) = self.reader.take() {
            // Waits for in-flight operations before the descriptor is released
            drop(reader.into_std().await);
        }

        if let Some(store) = self.store.take() {
            debug!(digest = %self.descriptor.digest, "Closing artifact handle");
            store.remove().await;
        }
        Ok(())
    }
}

impl AsyncRead for ArtifactHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.reader.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::other("artifact handle is closed"))),
        }
    }
}

#[async_trait]
impl Artifact for ArtifactHandle {
    async fn close(&mut self) -> io::Result<()> {
        Self::close(self).await
    }
}
