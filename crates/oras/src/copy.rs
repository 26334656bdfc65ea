//! Copy a remote content graph into a local file store.

use std::collections::{HashSet, VecDeque};
use tracing::{debug, trace};

use crate::auth::RegistryResponse;
use crate::graph::{ContentDescriptor, successors};
use crate::registry::Repository;
use crate::store::FileStore;
use crate::Result;

/// Copy everything reachable from `tag` in `repository` into `store`.
///
/// Nested manifests and indexes are walked breadth-first. Each node is
/// verified before it becomes visible in the store; the first failure
/// aborts the copy. Returns the root descriptor.
pub(crate) async fn copy_graph(
    repository: &Repository,
    tag: &str,
    store: &FileStore,
) -> Result<ContentDescriptor> {
    let (root, body) = repository.resolve(tag).await?;
    store.put_bytes(&root, &body).await?;

    let mut seen = HashSet::from([root.digest.clone()]);
    let mut pending: VecDeque<ContentDescriptor> = successors(&root, &body)?.into();
    let mut copied = 1_usize;

    while let Some(node) = pending.pop_front() {
        if !seen.insert(node.digest.clone()) {
            continue;
        }
        if store.contains(&node.digest) {
            trace!(digest = %node.digest, "Node already in store");
            continue;
        }

        if node.is_manifest() {
            let response = repository.fetch_manifest(&node).await?;
            write_node(response, &node, store).await?;
            let body = store.read(&node.digest).await?;
            pending.extend(successors(&node, &body)?);
        } else {
            let response = repository.fetch_blob(&node).await?;
            write_node(response, &node, store).await?;
        }
        copied += 1;
    }

    debug!(
        repo = %repository.name(),
        tag,
        root = %root.digest,
        nodes = copied,
        "Copied content graph"
    );
    Ok(root)
}

/// Stream one node into the store.
///
/// The writer fails as soon as more bytes arrive than `descriptor` declares.
async fn write_node(
    mut response: RegistryResponse,
    descriptor: &ContentDescriptor,
    store: &FileStore,
) -> Result<()> {
    let mut writer = store.writer(descriptor).await?;
    while let Some(chunk) = response.chunk().await? {
        writer.write(&chunk).await?;
    }
    writer.commit().await?;
    trace!(digest = %descriptor.digest, size = descriptor.size, "Copied node");
    Ok(())
}
