//! Streaming access to files embedded in image layers.
//!
//! Metadata such as release channel versions and image digest lists lives inside image layers.
//! Layers are streamed, decompressed on the fly and walked as tar archives until the wanted file
//! turns up; nothing is ever written to disk and the rest of a layer is never downloaded once the
//! file has been found.

use std::io::Read;

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use log::{debug, warn};
use oci_spec::image::MediaType;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncRead, BufReader};
use tokio_util::io::SyncIoBridge;

use crate::{
    error::{Error, Result},
    reference::ImageReference,
    registry::{BlobDescriptor, Registry},
};

const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
const DOCKER_FOREIGN_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Zstd,
}

fn compression(media_type: &str) -> Result<Compression> {
    match MediaType::from(media_type) {
        MediaType::ImageLayer => Ok(Compression::None),
        MediaType::ImageLayerGzip => Ok(Compression::Gzip),
        MediaType::ImageLayerZstd => Ok(Compression::Zstd),
        MediaType::Other(other) => match other.as_str() {
            DOCKER_LAYER => Ok(Compression::None),
            DOCKER_LAYER_GZIP | DOCKER_FOREIGN_LAYER_GZIP => Ok(Compression::Gzip),
            _ => Err(Error::UnsupportedMediaType(other)),
        },
        other => Err(Error::UnsupportedMediaType(other.to_string())),
    }
}

/// Wrap an async reader with the appropriate decompressor for the media type.
pub fn decompress_async<'a, R>(
    reader: R,
    media_type: &str,
) -> Result<Box<dyn AsyncBufRead + Unpin + Send + 'a>>
where
    R: AsyncRead + Unpin + Send + 'a,
{
    let buf = BufReader::new(reader);
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match compression(media_type)? {
        Compression::None => Box::new(buf),
        Compression::Gzip => Box::new(BufReader::new(GzipDecoder::new(buf))),
        Compression::Zstd => Box::new(BufReader::new(ZstdDecoder::new(buf))),
    };
    Ok(reader)
}

/// Walks a tar stream and returns the content of the first regular file whose path ends with
/// `suffix` (compared component-wise).
fn scan_tar(reader: impl Read, suffix: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let matches = entry.path()?.ends_with(suffix);
        if matches {
            let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
            entry.read_to_end(&mut data)?;
            return Ok(Some(data));
        }
    }
    Ok(None)
}

async fn find_in_layer(
    registry: &Registry,
    reference: &ImageReference,
    layer: &BlobDescriptor,
    suffix: &str,
) -> Result<Option<Vec<u8>>> {
    let reader = registry.open_layer(reference, layer).await?;
    let bridge = SyncIoBridge::new(reader);
    let suffix = suffix.to_string();
    tokio::task::spawn_blocking(move || scan_tar(bridge, &suffix)).await?
}

/// Finds `file` in the layers of an image and decodes it as JSON.
///
/// Layers are probed in order and the first decodable hit wins.  A layer without the file is not
/// an error; a layer with a malformed copy is logged and skipped.  Only running out of layers is
/// an error: [`Error::Decode`] if a malformed copy was seen, [`Error::FileNotFound`] otherwise.
pub async fn find_json<T: DeserializeOwned>(
    registry: &Registry,
    reference: &ImageReference,
    file: &str,
) -> Result<T> {
    let layers = registry.layers(reference).await?;
    let mut decode_error = None;

    for layer in &layers {
        let Some(data) = find_in_layer(registry, reference, layer, file).await? else {
            continue;
        };
        debug!("{reference}: found {file} in layer {}", layer.digest);
        match serde_json::from_slice(&data) {
            Ok(value) => return Ok(value),
            Err(error) => {
                warn!("{reference}: malformed {file} in layer {}: {error}", layer.digest);
                decode_error = Some(error);
            }
        }
    }

    Err(match decode_error {
        Some(error) => Error::Decode {
            file: file.to_string(),
            reference: reference.to_string(),
            error,
        },
        None => Error::FileNotFound {
            file: file.to_string(),
            reference: reference.to_string(),
        },
    })
}
