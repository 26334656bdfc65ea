//! Content graphs and payload selection.
//!
//! A content graph is a root descriptor plus the ordered list of
//! descriptors it points at. Successors are enumerated in a fixed order so
//! that selection is reproducible:
//!
//! | Root media type                       | Successors                      |
//! |---------------------------------------|---------------------------------|
//! | Image manifest (OCI or Docker v2)     | `subject?`, `config`, `layers…` |
//! | Image index (OCI or Docker list)      | `subject?`, `manifests…`        |
//! | Artifact manifest                     | `subject?`, `blobs…`            |
//! | Anything else                         | none                            |

use oci_distribution::manifest::{
    IMAGE_MANIFEST_LIST_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_INDEX_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE, OciDescriptor,
};
use serde::Deserialize;
use std::fmt;
use tracing::{debug, trace};

use crate::store::FileStore;
use crate::{Error, IMAGE_LAYER_MEDIA_TYPE, Result};

/// Media type of an OCI artifact manifest.
pub const ARTIFACT_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.artifact.manifest.v1+json";

/// Identifies one node of a content graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDescriptor {
    /// Media type of the content.
    pub media_type: String,
    /// `sha256:` digest of the content.
    pub digest: String,
    /// Size of the content in bytes.
    pub size: u64,
}

impl ContentDescriptor {
    /// Create a descriptor.
    #[must_use]
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
        }
    }

    /// Whether this node is a manifest with successors of its own.
    #[must_use]
    pub fn is_manifest(&self) -> bool {
        is_manifest(&self.media_type)
    }
}

impl fmt::Display for ContentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {} bytes)", self.digest, self.media_type, self.size)
    }
}

impl TryFrom<OciDescriptor> for ContentDescriptor {
    type Error = Error;

    fn try_from(descriptor: OciDescriptor) -> Result<Self> {
        let size = u64::try_from(descriptor.size).map_err(|_| {
            Error::invalid_manifest(
                &descriptor.digest,
                format!("negative size {}", descriptor.size),
            )
        })?;
        Ok(Self {
            media_type: descriptor.media_type,
            digest: descriptor.digest,
            size,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManifestKind {
    Image,
    Index,
    Artifact,
}

impl ManifestKind {
    fn of(media_type: &str) -> Option<Self> {
        match media_type {
            OCI_IMAGE_MEDIA_TYPE | IMAGE_MANIFEST_MEDIA_TYPE => Some(Self::Image),
            OCI_IMAGE_INDEX_MEDIA_TYPE | IMAGE_MANIFEST_LIST_MEDIA_TYPE => Some(Self::Index),
            ARTIFACT_MANIFEST_MEDIA_TYPE => Some(Self::Artifact),
            _ => None,
        }
    }
}

/// Whether `media_type` names a manifest or index.
pub(crate) fn is_manifest(media_type: &str) -> bool {
    ManifestKind::of(media_type).is_some()
}

/// Every descriptor-valued field a manifest, index or artifact manifest
/// can carry.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestNodes {
    #[serde(default)]
    subject: Option<OciDescriptor>,
    #[serde(default)]
    config: Option<OciDescriptor>,
    #[serde(default)]
    layers: Vec<OciDescriptor>,
    #[serde(default)]
    manifests: Vec<OciDescriptor>,
    #[serde(default)]
    blobs: Vec<OciDescriptor>,
}

/// Successors of the node `descriptor` whose content is `content`.
///
/// # Errors
///
/// Fails if a manifest does not parse or carries an invalid descriptor.
pub(crate) fn successors(
    descriptor: &ContentDescriptor,
    content: &[u8],
) -> Result<Vec<ContentDescriptor>> {
    let Some(kind) = ManifestKind::of(&descriptor.media_type) else {
        return Ok(Vec::new());
    };
    let nodes: ManifestNodes = serde_json::from_slice(content)
        .map_err(|e| Error::invalid_manifest(&descriptor.digest, e.to_string()))?;

    let mut ordered = Vec::new();
    ordered.extend(nodes.subject);
    match kind {
        ManifestKind::Image => {
            let config = nodes
                .config
                .ok_or_else(|| Error::invalid_manifest(&descriptor.digest, "missing config"))?;
            ordered.push(config);
            ordered.extend(nodes.layers);
        }
        ManifestKind::Index => ordered.extend(nodes.manifests),
        ManifestKind::Artifact => ordered.extend(nodes.blobs),
    }

    ordered.into_iter().map(ContentDescriptor::try_from).collect()
}

/// A root node and its ordered successors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentGraph {
    root: ContentDescriptor,
    successors: Vec<ContentDescriptor>,
}

impl ContentGraph {
    /// Build a graph from an explicit successor list.
    #[must_use]
    pub fn new(root: ContentDescriptor, successors: Vec<ContentDescriptor>) -> Self {
        Self { root, successors }
    }

    /// Load the graph rooted at `root` from `store`.
    pub async fn load(root: &ContentDescriptor, store: &FileStore) -> Result<Self> {
        let successors = if root.is_manifest() {
            let content = store.read(&root.digest).await?;
            successors(root, &content)?
        } else {
            Vec::new()
        };
        trace!(root = %root.digest, count = successors.len(), "Loaded content graph");
        Ok(Self::new(root.clone(), successors))
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> &ContentDescriptor {
        &self.root
    }

    /// Successors of the root, in enumeration order.
    #[must_use]
    pub fn successors(&self) -> &[ContentDescriptor] {
        &self.successors
    }

    /// The node holding the payload.
    ///
    /// A lone successor is the payload whatever its media type. Among
    /// several, the first image layer wins. `None` if there is no match.
    #[must_use]
    pub fn select_payload(&self) -> Option<&ContentDescriptor> {
        match self.successors.as_slice() {
            [] => None,
            [only] => Some(only),
            many => many
                .iter()
                .find(|node| node.media_type == IMAGE_LAYER_MEDIA_TYPE),
        }
    }
}

/// Select the payload node of the graph rooted at `root` in `store`.
pub async fn select(root: &ContentDescriptor, store: &FileStore) -> Result<Option<ContentDescriptor>> {
    let graph = ContentGraph::load(root, store).await?;
    let selected = graph.select_payload().cloned();
    match &selected {
        Some(node) => debug!(root = %root.digest, payload = %node, "Selected payload"),
        None => debug!(
            root = %root.digest,
            successors = graph.successors().len(),
            "No payload layer in content graph"
        ),
    }
    Ok(selected)
}
