//! Registry access.
//!
//! The engine talks to registries only through the [`RegistryAccess`] trait, which covers the
//! handful of read operations of the OCI distribution API that verification needs.  Two
//! implementations are provided: [`client::OciRegistry`] for real registries and
//! [`memory::MemoryRegistry`] for tests and dry runs.
//!
//! [`Registry`] binds an implementation to one registry host and root path, and builds the
//! higher-level operations (image info, index resolution, uncompressed layer streams) on top of
//! the trait primitives so that every implementation behaves the same way.

pub mod client;
pub mod memory;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncRead};

use crate::{
    config::RegistryConfig,
    digest::Digest,
    error::{Error, Result},
    layers::decompress_async,
    reference::{ImageReference, NormalizedRef},
};

/// A raw (possibly compressed) blob byte stream.
pub type BlobReader = Box<dyn AsyncRead + Unpin + Send>;

/// An uncompressed layer byte stream.
pub type LayerReader = Box<dyn AsyncBufRead + Unpin + Send>;

/// A blob as referenced from a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
}

/// A manifest as served by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// A single-platform image manifest.
    Image {
        digest: Digest,
        config: Option<BlobDescriptor>,
        layers: Vec<BlobDescriptor>,
    },
    /// A multi-platform index.
    Index {
        digest: Digest,
        manifests: Vec<Digest>,
    },
}

impl Manifest {
    pub fn digest(&self) -> &Digest {
        match self {
            Manifest::Image { digest, .. } | Manifest::Index { digest, .. } => digest,
        }
    }
}

/// The content identity of an image: what the structural comparator compares.
///
/// For an index, `config` is `None` and `layers` holds the child manifest digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub digest: Digest,
    pub config: Option<Digest>,
    pub layers: Vec<Digest>,
}

impl From<Manifest> for ImageInfo {
    fn from(manifest: Manifest) -> Self {
        match manifest {
            Manifest::Image {
                digest,
                config,
                layers,
            } => ImageInfo {
                digest,
                config: config.map(|c| c.digest),
                layers: layers.into_iter().map(|l| l.digest).collect(),
            },
            Manifest::Index { digest, manifests } => ImageInfo {
                digest,
                config: None,
                layers: manifests,
            },
        }
    }
}

/// Read access to an OCI registry.
///
/// Implementations must report absent repositories, tags, manifests and blobs as
/// [`Error::NotFound`] and everything else as some other error: the engine relies on that
/// distinction to tell mirror gaps from infrastructure failures.  Implementations don't retry.
#[async_trait]
pub trait RegistryAccess: Send + Sync {
    /// Lists every tag of a repository.
    async fn list_tags(&self, registry: &str, repository: &str) -> Result<Vec<String>>;

    /// Fetches and parses the manifest a reference points at.
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<Manifest>;

    /// Resolves a reference to its manifest digest without fetching the manifest body.
    async fn head_digest(&self, reference: &ImageReference) -> Result<Digest>;

    /// Opens the raw byte stream of a blob.
    async fn open_blob(&self, reference: &ImageReference, blob: &BlobDescriptor)
        -> Result<BlobReader>;
}

/// One registry: a host, a root repository path and a way to talk to it.
///
/// Cheap to clone; clones share the underlying access implementation.
#[derive(Clone)]
pub struct Registry {
    host: String,
    root: String,
    access: Arc<dyn RegistryAccess>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("host", &self.host)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(host: &str, root: &str, access: Arc<dyn RegistryAccess>) -> Self {
        Registry {
            host: host.to_string(),
            root: root.trim_matches('/').to_string(),
            access,
        }
    }

    /// Connects to a real registry over the OCI distribution API.
    pub fn connect(config: &RegistryConfig) -> Result<Self> {
        let (host, root, transport) = config.endpoint()?;
        let access = client::OciRegistry::new(&config.auth, transport);
        Ok(Registry::new(&host, &root, Arc::new(access)))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `host/root`, for display.
    pub fn url(&self) -> String {
        self.repository_url("")
    }

    fn repository_url(&self, segment: &str) -> String {
        let repository = self.repository(segment);
        if repository.is_empty() {
            self.host.clone()
        } else {
            format!("{}/{repository}", self.host)
        }
    }

    /// Full repository path (without host) of a segment below the root.
    pub fn repository(&self, segment: &str) -> String {
        let segment = segment.trim_matches('/');
        match (self.root.is_empty(), segment.is_empty()) {
            (_, true) => self.root.clone(),
            (true, false) => segment.to_string(),
            (false, false) => format!("{}/{segment}", self.root),
        }
    }

    pub fn tag_ref(&self, segment: &str, tag: &str) -> ImageReference {
        ImageReference::with_tag(&self.host, &self.repository(segment), tag)
    }

    pub fn digest_ref(&self, segment: &str, digest: &Digest) -> ImageReference {
        ImageReference::with_digest(&self.host, &self.repository(segment), digest)
    }

    /// Report key of a reference in this registry: host and root stripped, so that the same
    /// artifact has the same key in a source and its mirror.
    pub fn key(&self, reference: &ImageReference) -> NormalizedRef {
        reference.relative_to(&self.root)
    }

    /// Lists the tags of a segment, sorted.
    pub async fn list_tags(&self, segment: &str) -> Result<Vec<String>> {
        let mut tags = self
            .access
            .list_tags(&self.host, &self.repository(segment))
            .await?;
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    /// Resolves a reference to its manifest digest.
    pub async fn resolve_digest(&self, reference: &ImageReference) -> Result<Digest> {
        self.access.head_digest(reference).await
    }

    /// Manifest digest, config digest and layer digests of an image.
    pub async fn image_info(&self, reference: &ImageReference) -> Result<ImageInfo> {
        Ok(self.access.fetch_manifest(reference).await?.into())
    }

    /// The layers of an image.  For an index, the first child manifest is used.
    pub async fn layers(&self, reference: &ImageReference) -> Result<Vec<BlobDescriptor>> {
        match self.access.fetch_manifest(reference).await? {
            Manifest::Image { layers, .. } => Ok(layers),
            Manifest::Index { manifests, .. } => {
                let Some(first) = manifests.first() else {
                    return Err(Error::registry(reference, "image index has no manifests"));
                };
                match self.access.fetch_manifest(&reference.pinned(first)).await? {
                    Manifest::Image { layers, .. } => Ok(layers),
                    Manifest::Index { .. } => {
                        Err(Error::registry(reference, "nested image index"))
                    }
                }
            }
        }
    }

    /// Opens an uncompressed stream of one layer.
    pub async fn open_layer(
        &self,
        reference: &ImageReference,
        layer: &BlobDescriptor,
    ) -> Result<LayerReader> {
        let blob = self.access.open_blob(reference, layer).await?;
        decompress_async(blob, &layer.media_type)
    }
}
