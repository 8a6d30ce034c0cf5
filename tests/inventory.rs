mod common;

use std::collections::{BTreeMap, BTreeSet};

use similar_asserts::assert_eq;

use mirror_verify::{
    digest::Digest,
    inventory::SourceInventory,
    reference::{classify_tag, should_skip_tag, TagClass},
};

use common::{
    gzip, layer, mirror, source_repo, GZIP_LAYER_MEDIA_TYPE, MODULE, MODULE_VERSION, VERSION,
};

#[tokio::test]
async fn collects_expected_artifacts() {
    let mirror = mirror();
    let inventory = SourceInventory::new(mirror.source);
    let expected = inventory.collect(None).await.unwrap();

    assert!(expected.errors.is_empty(), "{:?}", expected.errors);
    assert!(expected.platform.errors.is_empty(), "{:?}", expected.platform.errors);
    assert_eq!(
        expected.platform.release_channels,
        BTreeMap::from([
            ("alpha".to_string(), VERSION.to_string()),
            ("stable".to_string(), VERSION.to_string()),
        ])
    );
    assert_eq!(
        expected.platform.installers,
        BTreeSet::from([VERSION.to_string()])
    );
    assert_eq!(
        expected.platform.digests,
        mirror.contents.platform.iter().cloned().collect::<BTreeSet<_>>()
    );
    // only the attestation of an expected digest is picked up
    assert_eq!(
        expected.platform.attestation_tags,
        BTreeSet::from([mirror.contents.attestation_tag.clone()])
    );

    let module = &expected.modules[MODULE];
    assert_eq!(module.channels.len(), 2);
    assert_eq!(
        module.versions[MODULE_VERSION],
        BTreeSet::from([mirror.contents.module_image.clone()])
    );
    assert_eq!(expected.security_databases.len(), 4);

    let json = serde_json::to_value(&expected).unwrap();
    assert_eq!(
        json["platform"]["attestation_tags"][0],
        serde_json::Value::String(mirror.contents.attestation_tag.clone())
    );
}

#[tokio::test]
async fn malformed_digest_list_falls_through_to_later_layers() {
    let mirror = mirror();
    let digest = &mirror.contents.platform[0];
    let good = serde_json::json!({ "common": { "pause": digest.to_string() } }).to_string();
    mirror.source_access.push_image(
        &source_repo("install"),
        Some("v2.0.0"),
        &[
            layer(&[("deckhouse/candi/images_digests.json", b"{\"common\": {\"x\": \"md5\"}}")]),
            layer(&[("deckhouse/candi/images_digests.json", good.as_bytes())]),
        ],
    );

    let inventory = SourceInventory::new(mirror.source);
    let result = inventory.read_platform_digests(["2.0.0"]).await;
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(result.value.digests, BTreeSet::from([digest.clone()]));
    assert_eq!(result.value.installers, BTreeSet::from(["v2.0.0".to_string()]));
}

#[tokio::test]
async fn reads_digest_lists_from_gzip_layers() {
    let mirror = mirror();
    let digest = &mirror.contents.platform[1];
    let list = serde_json::json!({ "controlPlaneManager": { "etcd": digest.to_string() } }).to_string();
    let layers = vec![
        gzip(&layer(&[("bin/installer", b"#!/bin/sh")])).await,
        gzip(&layer(&[("deckhouse/candi/images_digests.json", list.as_bytes())])).await,
    ];
    mirror.source_access.push_layers(
        &source_repo("install"),
        Some("v2.1.0"),
        &layers,
        GZIP_LAYER_MEDIA_TYPE,
    );

    let inventory = SourceInventory::new(mirror.source);
    let result = inventory.read_platform_digests(["v2.1.0"]).await;
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(result.value.digests, BTreeSet::from([digest.clone()]));
}

#[tokio::test]
async fn module_without_digest_list() {
    let mirror = mirror();
    let name = "empty-module";
    mirror
        .source_access
        .push_image(&source_repo(&format!("modules/{name}")), Some("v0.1.0"), &[layer(&[])]);
    mirror.source_access.push_image(
        &source_repo(&format!("modules/{name}/release")),
        Some("stable"),
        &common::version_image("v0.1.0"),
    );

    let inventory = SourceInventory::new(mirror.source);
    let module = inventory.read_module(name).await;
    assert!(module.errors.is_empty(), "{:?}", module.errors);
    assert_eq!(module.value.channels["stable"].as_str(), "v0.1.0");
    assert!(module.value.digests().is_empty());

    let digests = inventory.read_module_digests(MODULE).await;
    assert_eq!(
        digests.value,
        BTreeSet::from([mirror.contents.module_image.clone()])
    );
}

#[tokio::test]
async fn attestation_tags_match_the_structurally_skipped_ones() {
    let mirror = mirror();
    let root = source_repo("");
    let [a, b] = [&mirror.contents.platform[0], &mirror.contents.platform[1]];
    // an attestation that names no image, and a signature that does
    mirror
        .source_access
        .push_image(&root, Some("latest.att"), &[b"attestation-latest".to_vec()]);
    mirror
        .source_access
        .push_image(&root, Some(&format!("sha256-{}.sig", b.encoded())), &[b"signature-b".to_vec()]);

    let tags = mirror.source.list_tags("").await.unwrap();
    let attestations: BTreeSet<String> = tags
        .iter()
        .filter(|t| classify_tag(t) == TagClass::Attestation)
        .cloned()
        .collect();
    assert_eq!(attestations.len(), 3);

    let inventory = SourceInventory::new(mirror.source.clone());
    let unrelated = Digest::sha256(b"unrelated");
    let everything = BTreeSet::from([a.clone(), b.clone(), unrelated.clone()]);
    let included = inventory.read_attestation_tags(&everything).await.unwrap();
    assert_eq!(
        included,
        BTreeSet::from([a.attestation_tag(), unrelated.attestation_tag()])
    );
    for tag in &included {
        assert!(attestations.contains(tag), "{tag}");
        assert!(should_skip_tag(tag), "{tag}");
    }

    let expected = BTreeSet::from([a.clone(), b.clone()]);
    assert_eq!(
        inventory.read_attestation_tags(&expected).await.unwrap(),
        BTreeSet::from([mirror.contents.attestation_tag.clone()])
    );
}
