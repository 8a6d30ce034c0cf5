//! An in-memory registry.
//!
//! Content addressed like the real thing: manifests and blobs are stored under the sha256 of
//! their bytes, so two registries populated with the same content end up with the same digests.
//! Repositories are keyed by `host/path`.  Failures can be injected per repository to exercise
//! the engine's degraded paths.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io::Cursor,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde_json::json;

use crate::{
    digest::Digest,
    error::{Error, Result},
    reference::{ImageReference, Selector},
    registry::{BlobDescriptor, BlobReader, Manifest, RegistryAccess},
};

/// Media type used for layers pushed through this registry.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    /// Every request against the repository fails.
    Everything,
    /// Only manifest fetches fail; tag listing and digest resolution still work.
    Manifests,
}

#[derive(Debug, Default, Clone)]
struct Repository {
    tags: BTreeMap<String, Digest>,
    manifests: HashMap<Digest, Manifest>,
}

#[derive(Debug, Default)]
struct State {
    repositories: BTreeMap<String, Repository>,
    blobs: HashMap<Digest, Vec<u8>>,
    failures: HashMap<String, Failure>,
}

/// A registry that lives entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

fn descriptor_json(blob: &BlobDescriptor) -> serde_json::Value {
    json!({
        "mediaType": blob.media_type,
        "digest": blob.digest.to_string(),
        "size": blob.size,
    })
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_blob(state: &mut State, data: &[u8], media_type: &str) -> BlobDescriptor {
        let digest = Digest::sha256(data);
        state.blobs.insert(digest.clone(), data.to_vec());
        BlobDescriptor {
            digest,
            media_type: media_type.to_string(),
            size: data.len() as u64,
        }
    }

    fn store_manifest(
        state: &mut State,
        repository: &str,
        tag: Option<&str>,
        body: serde_json::Value,
        manifest: impl FnOnce(Digest) -> Manifest,
    ) -> Digest {
        let digest = Digest::sha256(body.to_string().as_bytes());
        let repo = state
            .repositories
            .entry(repository.to_string())
            .or_default();
        repo.manifests.insert(digest.clone(), manifest(digest.clone()));
        if let Some(tag) = tag {
            repo.tags.insert(tag.to_string(), digest.clone());
        }
        digest
    }

    /// Pushes an image whose layers are the given (uncompressed tar) blobs.  The config is
    /// derived from the layers.
    pub fn push_image(&self, repository: &str, tag: Option<&str>, layers: &[Vec<u8>]) -> Digest {
        self.push_layers(repository, tag, layers, LAYER_MEDIA_TYPE)
    }

    /// Pushes an image whose layers are blobs of `media_type`, such as gzip compressed tars.
    pub fn push_layers(
        &self,
        repository: &str,
        tag: Option<&str>,
        layers: &[Vec<u8>],
        media_type: &str,
    ) -> Digest {
        let diff_ids: Vec<String> = layers
            .iter()
            .map(|layer| Digest::sha256(layer).to_string())
            .collect();
        let config = json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        });
        self.store_image(repository, tag, config.to_string().as_bytes(), layers, media_type)
    }

    fn store_image(
        &self,
        repository: &str,
        tag: Option<&str>,
        config: &[u8],
        layers: &[Vec<u8>],
        media_type: &str,
    ) -> Digest {
        let mut state = self.state();
        let config = Self::store_blob(&mut state, config, CONFIG_MEDIA_TYPE);
        let layers: Vec<BlobDescriptor> = layers
            .iter()
            .map(|layer| Self::store_blob(&mut state, layer, media_type))
            .collect();

        let body = json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": descriptor_json(&config),
            "layers": layers.iter().map(descriptor_json).collect::<Vec<_>>(),
        });
        Self::store_manifest(&mut state, repository, tag, body, |digest| {
            Manifest::Image {
                digest,
                config: Some(config),
                layers,
            }
        })
    }

    /// Pushes an index over manifests that already exist in the repository.
    pub fn push_index(&self, repository: &str, tag: Option<&str>, manifests: &[Digest]) -> Digest {
        let mut state = self.state();
        let body = json!({
            "schemaVersion": 2,
            "mediaType": INDEX_MEDIA_TYPE,
            "manifests": manifests
                .iter()
                .map(|m| json!({ "mediaType": MANIFEST_MEDIA_TYPE, "digest": m.to_string() }))
                .collect::<Vec<_>>(),
        });
        let manifests = manifests.to_vec();
        Self::store_manifest(&mut state, repository, tag, body, |digest| {
            Manifest::Index { digest, manifests }
        })
    }

    /// Points a tag at a manifest that already exists in the repository.
    pub fn tag(&self, repository: &str, tag: &str, digest: &Digest) -> Result<()> {
        let mut state = self.state();
        let repo = state
            .repositories
            .get_mut(repository)
            .ok_or_else(|| Error::NotFound(repository.to_string()))?;
        if !repo.manifests.contains_key(digest) {
            return Err(Error::NotFound(format!("{repository}@{digest}")));
        }
        repo.tags.insert(tag.to_string(), digest.clone());
        Ok(())
    }

    /// Removes a tag; the manifest stays reachable by digest.
    pub fn remove_tag(&self, repository: &str, tag: &str) {
        if let Some(repo) = self.state().repositories.get_mut(repository) {
            repo.tags.remove(tag);
        }
    }

    /// Removes a manifest and every tag pointing at it.
    pub fn remove_manifest(&self, repository: &str, digest: &Digest) {
        if let Some(repo) = self.state().repositories.get_mut(repository) {
            repo.manifests.remove(digest);
            repo.tags.retain(|_, d| d != digest);
        }
    }

    /// Removes a whole repository.
    pub fn remove_repository(&self, repository: &str) {
        self.state().repositories.remove(repository);
    }

    /// Makes every request against a repository fail with a transport error.
    pub fn fail_repository(&self, repository: &str) {
        self.state()
            .failures
            .insert(repository.to_string(), Failure::Everything);
    }

    /// Makes manifest fetches against a repository fail, leaving digest resolution working.
    pub fn fail_manifest_fetches(&self, repository: &str) {
        self.state()
            .failures
            .insert(repository.to_string(), Failure::Manifests);
    }

    /// Copies every repository under `from_prefix` into `target`, re-rooted at `to_prefix`.
    /// This is what a successful pull/push cycle would produce.
    pub fn copy_to(&self, target: &MemoryRegistry, from_prefix: &str, to_prefix: &str) {
        let source = self.state();
        let mut target = target.state();
        for (name, repo) in &source.repositories {
            let Some(rest) = name.strip_prefix(from_prefix) else {
                continue;
            };
            if !(rest.is_empty() || rest.starts_with('/')) {
                continue;
            }
            target
                .repositories
                .insert(format!("{to_prefix}{rest}"), repo.clone());
        }
        for (digest, data) in &source.blobs {
            target.blobs.insert(digest.clone(), data.clone());
        }
    }

    fn check(&self, repository: &str, manifest_fetch: bool) -> Result<()> {
        match self.state().failures.get(repository) {
            Some(Failure::Everything) => {
                Err(Error::registry(repository, "injected failure"))
            }
            Some(Failure::Manifests) if manifest_fetch => {
                Err(Error::registry(repository, "injected manifest failure"))
            }
            _ => Ok(()),
        }
    }

    fn lookup(&self, reference: &ImageReference) -> Result<Manifest> {
        let key = format!("{}/{}", reference.registry(), reference.repository());
        let state = self.state();
        let not_found = || Error::NotFound(reference.to_string());
        let repo = state.repositories.get(&key).ok_or_else(not_found)?;
        let digest = match reference.selector() {
            Selector::Tag(tag) => repo.tags.get(tag).ok_or_else(not_found)?,
            Selector::Digest(digest) => digest,
        };
        repo.manifests.get(digest).cloned().ok_or_else(not_found)
    }
}

#[async_trait]
impl RegistryAccess for MemoryRegistry {
    async fn list_tags(&self, registry: &str, repository: &str) -> Result<Vec<String>> {
        let key = format!("{registry}/{repository}");
        self.check(&key, false)?;
        let state = self.state();
        let repo = state
            .repositories
            .get(&key)
            .ok_or_else(|| Error::NotFound(key.clone()))?;
        Ok(repo.tags.keys().cloned().collect())
    }

    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<Manifest> {
        self.check(
            &format!("{}/{}", reference.registry(), reference.repository()),
            true,
        )?;
        self.lookup(reference)
    }

    async fn head_digest(&self, reference: &ImageReference) -> Result<Digest> {
        self.check(
            &format!("{}/{}", reference.registry(), reference.repository()),
            false,
        )?;
        Ok(self.lookup(reference)?.digest().clone())
    }

    async fn open_blob(
        &self,
        reference: &ImageReference,
        blob: &BlobDescriptor,
    ) -> Result<BlobReader> {
        self.check(
            &format!("{}/{}", reference.registry(), reference.repository()),
            false,
        )?;
        let data = self
            .state()
            .blobs
            .get(&blob.digest)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{reference} blob {}", blob.digest)))?;
        Ok(Box::new(Cursor::new(data)))
    }
}
