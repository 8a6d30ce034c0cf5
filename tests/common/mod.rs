// Not every test binary uses every helper
#![allow(dead_code)]

use std::sync::Arc;

use async_compression::tokio::bufread::GzipEncoder;
use serde_json::json;
use tokio::io::AsyncReadExt;

use mirror_verify::{
    digest::Digest,
    layout::{MODULE_DIGESTS_FILE, PLATFORM_DIGESTS_FILE, SECURITY_DATABASES, VERSION_FILE},
    registry::{memory::MemoryRegistry, Registry},
};

pub const SOURCE_HOST: &str = "registry.example.com";
pub const SOURCE_ROOT: &str = "deckhouse/ee";
pub const TARGET_HOST: &str = "mirror.local:5000";
pub const TARGET_ROOT: &str = "sys/deckhouse";
pub const VERSION: &str = "v1.65.0";
pub const MODULE: &str = "console";
pub const MODULE_VERSION: &str = "v1.2.0";
pub const GZIP_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

pub fn source_repo(segment: &str) -> String {
    repo(SOURCE_HOST, SOURCE_ROOT, segment)
}

pub fn target_repo(segment: &str) -> String {
    repo(TARGET_HOST, TARGET_ROOT, segment)
}

fn repo(host: &str, root: &str, segment: &str) -> String {
    if segment.is_empty() {
        format!("{host}/{root}")
    } else {
        format!("{host}/{root}/{segment}")
    }
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_ustar();
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, name, data).unwrap();
}

/// An uncompressed tar layer holding the given files.
pub fn layer(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(vec![]);
    for (name, data) in files {
        append_file(&mut builder, name, data);
    }
    builder.into_inner().unwrap()
}

/// Gzip compresses a layer, as registries usually serve them.
pub async fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzipEncoder::new(data);
    let mut out = vec![];
    encoder.read_to_end(&mut out).await.unwrap();
    out
}

pub fn version_image(version: &str) -> Vec<Vec<u8>> {
    let contents = json!({ "version": version }).to_string();
    vec![layer(&[(VERSION_FILE, contents.as_bytes())])]
}

/// Digests of the interesting content pushed into the source.
#[derive(Debug, Clone)]
pub struct Contents {
    pub platform: Vec<Digest>,
    /// The `.att` tag of the first platform image.
    pub attestation_tag: String,
    pub module_image: Digest,
}

/// A source registry laid out like a real release: two channels pointing at one version, an
/// installer carrying the platform digest list, one module and all security databases.
pub fn populate_source(access: &MemoryRegistry) -> Contents {
    let root = source_repo("");
    let a = access.push_image(&root, None, &[b"platform-a".to_vec()]);
    let b = access.push_image(&root, None, &[b"platform-b".to_vec()]);
    access.tag(&root, VERSION, &a).unwrap();

    // attestation for a, and one for something not in the digest list
    access.push_image(&root, Some(&a.attestation_tag()), &[b"attestation-a".to_vec()]);
    let unrelated = Digest::sha256(b"unrelated");
    access.push_image(&root, Some(&unrelated.attestation_tag()), &[b"attestation-x".to_vec()]);

    let digests = json!({
        "common": { "pause": a.to_string() },
        "controlPlaneManager": { "kubeApiserver": b.to_string() },
    })
    .to_string();
    access.push_image(
        &source_repo("install"),
        Some(VERSION),
        &[
            layer(&[("bin/installer", b"#!/bin/sh")]),
            layer(&[(PLATFORM_DIGESTS_FILE, digests.as_bytes())]),
        ],
    );
    access.push_image(&source_repo("install-standalone"), Some(VERSION), &[b"bundle".to_vec()]);

    for channel in ["alpha", "stable"] {
        access.push_image(
            &source_repo("release-channel"),
            Some(channel),
            &version_image(VERSION),
        );
    }

    // modules are listed as tags of the modules repository
    access.push_image(&source_repo("modules"), Some(MODULE), &[b"console-module".to_vec()]);
    let module_root = source_repo(&format!("modules/{MODULE}"));
    let module_image = access.push_image(&module_root, None, &[b"console-frontend".to_vec()]);
    let module_digests = json!({ "console": { "frontend": module_image.to_string() } }).to_string();
    access.push_image(
        &module_root,
        Some(MODULE_VERSION),
        &[layer(&[(MODULE_DIGESTS_FILE, module_digests.as_bytes())])],
    );
    for channel in ["alpha", "stable"] {
        access.push_image(
            &source_repo(&format!("modules/{MODULE}/release")),
            Some(channel),
            &version_image(MODULE_VERSION),
        );
    }

    for (database, tag) in SECURITY_DATABASES {
        access.push_image(
            &source_repo(&format!("security/{database}")),
            Some(tag),
            &[format!("{database} data").into_bytes()],
        );
    }

    Contents {
        attestation_tag: a.attestation_tag(),
        platform: vec![a, b],
        module_image,
    }
}

pub struct Mirror {
    pub source_access: Arc<MemoryRegistry>,
    pub target_access: Arc<MemoryRegistry>,
    pub source: Registry,
    pub target: Registry,
    pub contents: Contents,
}

/// A populated source and a faithful copy of it in the target.
pub fn mirror() -> Mirror {
    let source_access = Arc::new(MemoryRegistry::new());
    let contents = populate_source(&source_access);

    let target_access = Arc::new(MemoryRegistry::new());
    source_access.copy_to(&target_access, &source_repo(""), &target_repo(""));

    Mirror {
        source: Registry::new(SOURCE_HOST, SOURCE_ROOT, source_access.clone()),
        target: Registry::new(TARGET_HOST, TARGET_ROOT, target_access.clone()),
        source_access,
        target_access,
        contents,
    }
}
