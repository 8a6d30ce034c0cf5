//! [`RegistryAccess`] over the OCI distribution API, via `oci-client`.

use std::future::Future;

use async_trait::async_trait;
use log::debug;
use oci_client::{
    client::{ClientConfig, ClientProtocol},
    errors::{OciDistributionError, OciErrorCode},
    manifest::{OciDescriptor, OciManifest},
    secrets::RegistryAuth,
    Client, Reference,
};
use tokio_util::io::StreamReader;

use crate::{
    config::{Auth, Transport},
    digest::Digest,
    error::{Error, Result},
    reference::{ImageReference, Selector},
    registry::{BlobDescriptor, BlobReader, Manifest, RegistryAccess},
};

/// Tags requested per page when listing.  Registries may return fewer.
const TAG_PAGE_SIZE: usize = 1000;

/// A registry reached over HTTP(S).
pub struct OciRegistry {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistry {
    pub fn new(auth: &Auth, transport: Transport) -> Self {
        let client = Client::new(ClientConfig {
            protocol: if transport.insecure {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: transport.skip_tls_verify,
            ..Default::default()
        });

        let auth = match auth {
            Auth::Anonymous => RegistryAuth::Anonymous,
            Auth::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
        };

        OciRegistry { client, auth }
    }
}

fn oci_reference(reference: &ImageReference) -> Reference {
    match reference.selector() {
        Selector::Tag(tag) => Reference::with_tag(
            reference.registry().to_string(),
            reference.repository().to_string(),
            tag.clone(),
        ),
        Selector::Digest(digest) => Reference::with_digest(
            reference.registry().to_string(),
            reference.repository().to_string(),
            digest.to_string(),
        ),
    }
}

/// Maps "unknown" registry errors and 404s to [`Error::NotFound`], anything else to
/// [`Error::Registry`].
fn classify(what: impl ToString, err: OciDistributionError) -> Error {
    let not_found = match &err {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code == 404,
        OciDistributionError::RegistryError { envelope, .. } => {
            envelope.errors.iter().any(|e| {
                matches!(
                    e.code,
                    OciErrorCode::ManifestUnknown
                        | OciErrorCode::NameUnknown
                        | OciErrorCode::BlobUnknown
                )
            })
        }
        _ => false,
    };

    if not_found {
        Error::NotFound(what.to_string())
    } else {
        Error::registry(what, err)
    }
}

/// Follows `last` pagination of a tag listing until a page comes back empty or stops advancing.
///
/// Registries cap page sizes as they see fit, so a page shorter than requested doesn't end the
/// listing.  Pages are in lexical order; one whose final tag isn't past the previous page's is a
/// registry ignoring `last`, and ends it.
async fn paginate<F, Fut>(mut fetch_page: F) -> Result<Vec<String>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Vec<String>>>,
{
    let mut tags = vec![];
    let mut last: Option<String> = None;
    loop {
        let page = fetch_page(last.clone()).await?;
        let next = page.last().cloned();
        if next.is_none() || next <= last {
            break;
        }
        tags.extend(page);
        debug!("fetched {} tags so far", tags.len());
        last = next;
    }
    Ok(tags)
}

fn blob(reference: &ImageReference, descriptor: &OciDescriptor) -> Result<BlobDescriptor> {
    Ok(BlobDescriptor {
        digest: descriptor.digest.parse()?,
        media_type: descriptor.media_type.clone(),
        size: u64::try_from(descriptor.size)
            .map_err(|_| Error::registry(reference, "negative blob size"))?,
    })
}

#[async_trait]
impl RegistryAccess for OciRegistry {
    async fn list_tags(&self, registry: &str, repository: &str) -> Result<Vec<String>> {
        let what = format!("{registry}/{repository}");
        let image = Reference::with_tag(
            registry.to_string(),
            repository.to_string(),
            "latest".to_string(),
        );

        let (client, auth, image, what) = (&self.client, &self.auth, &image, &what);
        paginate(|last| async move {
            client
                .list_tags(image, auth, Some(TAG_PAGE_SIZE), last.as_deref())
                .await
                .map(|page| page.tags)
                .map_err(|err| classify(what, err))
        })
        .await
    }

    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<Manifest> {
        let (manifest, digest) = self
            .client
            .pull_manifest(&oci_reference(reference), &self.auth)
            .await
            .map_err(|err| classify(reference, err))?;
        let digest: Digest = digest.parse()?;

        Ok(match manifest {
            OciManifest::Image(image) => Manifest::Image {
                digest,
                config: Some(blob(reference, &image.config)?),
                layers: image
                    .layers
                    .iter()
                    .map(|layer| blob(reference, layer))
                    .collect::<Result<_>>()?,
            },
            OciManifest::ImageIndex(index) => Manifest::Index {
                digest,
                manifests: index
                    .manifests
                    .iter()
                    .map(|entry| entry.digest.parse())
                    .collect::<Result<_>>()?,
            },
        })
    }

    async fn head_digest(&self, reference: &ImageReference) -> Result<Digest> {
        self.client
            .fetch_manifest_digest(&oci_reference(reference), &self.auth)
            .await
            .map_err(|err| classify(reference, err))?
            .parse()
    }

    async fn open_blob(
        &self,
        reference: &ImageReference,
        blob: &BlobDescriptor,
    ) -> Result<BlobReader> {
        let image = oci_reference(reference);
        self.client
            .store_auth_if_needed(image.resolve_registry(), &self.auth)
            .await;

        let descriptor = OciDescriptor {
            media_type: blob.media_type.clone(),
            digest: blob.digest.to_string(),
            size: i64::try_from(blob.size)
                .map_err(|_| Error::registry(reference, "blob too large"))?,
            ..Default::default()
        };

        let sized = self
            .client
            .pull_blob_stream(&image, &descriptor)
            .await
            .map_err(|err| classify(format!("{reference} blob {}", blob.digest), err))?;

        Ok(Box::new(StreamReader::new(sized.stream)))
    }
}
