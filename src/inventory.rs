//! Reading the expected artifact set out of the source registry.
//!
//! The source registry is the only thing consulted here.  Release channel images carry a
//! `version.json` naming the version they point at, installer images carry a digest list of every
//! platform image belonging to their version, and module repositories repeat the same layout one
//! level down.  Reads are tolerant: a channel, module or database that can't be read is logged,
//! noted in the `errors` of the returned value and left out of the expected set.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    digest::Digest,
    error::{Error, Result},
    layers::find_json,
    layout::{
        installer_tag, module_release_segment, module_segment, security_segment,
        INSTALL_SEGMENT, MODULES_SEGMENT, MODULE_DIGESTS_FILE, PLATFORM_DIGESTS_FILE,
        RELEASE_CHANNELS, RELEASE_CHANNEL_SEGMENT, ROOT_SEGMENT, SECURITY_DATABASES,
        VERSION_FILE,
    },
    reference::{attested_digest, should_skip_tag},
    registry::Registry,
};

/// The embedded digest list: component name → image name → digest.
pub type ImagesDigests = BTreeMap<String, BTreeMap<String, Digest>>;

#[derive(Debug, Deserialize)]
struct VersionFile {
    version: String,
}

/// A value read on a best-effort basis, together with what couldn't be read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Partial<T> {
    pub value: T,
    pub errors: Vec<String>,
}

impl<T> Partial<T> {
    fn new(value: T) -> Self {
        Partial {
            value,
            errors: vec![],
        }
    }

    fn record(&mut self, what: impl std::fmt::Display, error: &Error) {
        warn!("{what}: {error}");
        self.errors.push(format!("{what}: {error}"));
    }
}

/// Digests reachable from a set of installer images.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlatformDigests {
    /// Installer tags whose digest list was read.
    pub installers: BTreeSet<String>,
    pub digests: BTreeSet<Digest>,
}

/// What one module's repositories say about it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleInventory {
    /// Release channel → version.
    pub channels: BTreeMap<String, String>,
    /// Version → digests of the images it uses.
    pub versions: BTreeMap<String, BTreeSet<Digest>>,
}

impl ModuleInventory {
    pub fn digests(&self) -> BTreeSet<Digest> {
        self.versions.values().flatten().cloned().collect()
    }
}

/// The platform part of an [`ExpectedArtifactSet`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlatformArtifacts {
    /// Release channel → version.  Empty when a specific tag was requested.
    pub release_channels: BTreeMap<String, String>,
    pub versions: BTreeSet<String>,
    pub installers: BTreeSet<String>,
    pub digests: BTreeSet<Digest>,
    /// `.att` tags of the source root repository whose digest is in `digests`.
    pub attestation_tags: BTreeSet<String>,
    pub errors: Vec<String>,
}

/// Everything the target is expected to hold, as read from the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpectedArtifactSet {
    pub source: String,
    pub platform: PlatformArtifacts,
    pub modules: BTreeMap<String, ModuleInventory>,
    /// Database → tags present in the source.
    pub security_databases: BTreeMap<String, Vec<String>>,
    pub errors: Vec<String>,
}

/// Read-only view of the source registry's domain metadata.
#[derive(Debug, Clone)]
pub struct SourceInventory {
    source: Registry,
}

impl SourceInventory {
    pub fn new(source: Registry) -> Self {
        SourceInventory { source }
    }

    pub fn registry(&self) -> &Registry {
        &self.source
    }

    /// Reads the version a release channel image in `segment` points at.
    pub async fn read_channel_version(&self, segment: &str, channel: &str) -> Result<String> {
        let reference = self.source.tag_ref(segment, channel);
        let file: VersionFile = find_json(&self.source, &reference, VERSION_FILE).await?;
        Ok(file.version)
    }

    async fn read_channels(&self, segment: &str) -> Partial<BTreeMap<String, String>> {
        let mut result = Partial::new(BTreeMap::new());
        for channel in RELEASE_CHANNELS {
            match self.read_channel_version(segment, channel).await {
                Ok(version) => {
                    debug!("{segment}:{channel} -> {version}");
                    result.value.insert(channel.to_string(), version);
                }
                Err(err) if err.is_not_found() => {
                    debug!("release channel {segment}:{channel} not present in source");
                }
                Err(err) => result.record(format!("release channel {segment}:{channel}"), &err),
            }
        }
        result
    }

    /// Release channel → version for the platform.
    pub async fn read_release_channels(&self) -> Partial<BTreeMap<String, String>> {
        self.read_channels(RELEASE_CHANNEL_SEGMENT).await
    }

    /// Reads the digest lists of the installers of `versions` and merges them.
    pub async fn read_platform_digests<'a>(
        &self,
        versions: impl IntoIterator<Item = &'a str>,
    ) -> Partial<PlatformDigests> {
        let tags: BTreeSet<String> = versions.into_iter().map(installer_tag).collect();
        let mut result = Partial::new(PlatformDigests::default());

        for tag in tags {
            let reference = self.source.tag_ref(INSTALL_SEGMENT, &tag);
            match find_json::<ImagesDigests>(&self.source, &reference, PLATFORM_DIGESTS_FILE).await
            {
                Ok(components) => {
                    let before = result.value.digests.len();
                    result
                        .value
                        .digests
                        .extend(components.into_values().flat_map(BTreeMap::into_values));
                    info!(
                        "{reference}: {} new platform digests",
                        result.value.digests.len() - before
                    );
                    result.value.installers.insert(tag);
                }
                Err(err) => result.record(format!("installer {reference}"), &err),
            }
        }
        result
    }

    /// Module names.  Modules are stored as the tags of the modules repository.
    pub async fn read_modules_list(&self) -> Result<Vec<String>> {
        let tags = match self.source.list_tags(MODULES_SEGMENT).await {
            Err(err) if err.is_not_found() => vec![],
            other => other?,
        };
        Ok(tags.into_iter().filter(|t| !should_skip_tag(t)).collect())
    }

    /// Reads a module's release channels and the digest lists of the versions they point at.
    pub async fn read_module(&self, name: &str) -> Partial<ModuleInventory> {
        let channels = self.read_channels(&module_release_segment(name)).await;
        let mut result = Partial {
            value: ModuleInventory {
                channels: channels.value,
                versions: BTreeMap::new(),
            },
            errors: channels.errors,
        };

        let versions: BTreeSet<String> = result.value.channels.values().cloned().collect();
        for version in versions {
            let reference = self.source.tag_ref(&module_segment(name), &version);
            match find_json::<ImagesDigests>(&self.source, &reference, MODULE_DIGESTS_FILE).await {
                Ok(components) => {
                    let digests = components
                        .into_values()
                        .flat_map(BTreeMap::into_values)
                        .collect();
                    result.value.versions.insert(version, digests);
                }
                // Modules without images of their own ship no digest list
                Err(Error::FileNotFound { .. }) => {
                    debug!("{reference}: no {MODULE_DIGESTS_FILE}");
                    result.value.versions.insert(version, BTreeSet::new());
                }
                Err(err) => result.record(format!("module {name} version {version}"), &err),
            }
        }
        result
    }

    /// All digests used by the versions a module's release channels point at.
    pub async fn read_module_digests(&self, name: &str) -> Partial<BTreeSet<Digest>> {
        let module = self.read_module(name).await;
        Partial {
            value: module.value.digests(),
            errors: module.errors,
        }
    }

    /// Tags of each known security database.  Absent databases are simply left out.
    pub async fn read_security_databases(&self) -> Partial<BTreeMap<String, Vec<String>>> {
        let mut result = Partial::new(BTreeMap::new());
        for (database, _) in SECURITY_DATABASES {
            match self.source.list_tags(&security_segment(database)).await {
                Ok(tags) if !tags.is_empty() => {
                    result.value.insert(database.to_string(), tags);
                }
                Ok(_) => debug!("security database {database} has no tags"),
                Err(err) if err.is_not_found() => {
                    debug!("security database {database} not present in source");
                }
                Err(err) => result.record(format!("security database {database}"), &err),
            }
        }
        result
    }

    /// Source root attestation tags that attest one of `digests`.
    ///
    /// These are the tags the structural diff skips as [`TagClass::Attestation`], brought back in
    /// for the expected images only.
    ///
    /// [`TagClass::Attestation`]: crate::reference::TagClass::Attestation
    pub async fn read_attestation_tags(
        &self,
        digests: &BTreeSet<Digest>,
    ) -> Result<BTreeSet<String>> {
        let tags = self.source.list_tags(ROOT_SEGMENT).await?;
        Ok(tags
            .into_iter()
            .filter(|tag| attested_digest(tag).is_some_and(|d| digests.contains(&d)))
            .collect())
    }

    /// Reads the platform part of the expected set.
    ///
    /// With `tag`, channel discovery is skipped and the tag is the only version.  Fails with
    /// [`Error::NoPlatformDigests`] if no digest at all could be read, since that means the
    /// source is unreadable rather than the target being incomplete.
    pub async fn collect_platform(&self, tag: Option<&str>) -> Result<PlatformArtifacts> {
        let mut platform = PlatformArtifacts::default();

        match tag {
            Some(tag) => {
                platform.versions.insert(tag.to_string());
            }
            None => {
                let channels = self.read_release_channels().await;
                platform.versions = channels.value.values().cloned().collect();
                platform.release_channels = channels.value;
                platform.errors.extend(channels.errors);
            }
        }

        let digests = self
            .read_platform_digests(platform.versions.iter().map(String::as_str))
            .await;
        platform.installers = digests.value.installers;
        platform.digests = digests.value.digests;
        platform.errors.extend(digests.errors);

        if platform.digests.is_empty() {
            return Err(Error::NoPlatformDigests {
                registry: self.source.url(),
            });
        }

        match self.read_attestation_tags(&platform.digests).await {
            Ok(tags) => platform.attestation_tags = tags,
            Err(err) => {
                warn!("listing attestation tags: {err}");
                platform.errors.push(format!("attestation tags: {err}"));
            }
        }

        info!(
            "source {}: {} versions, {} platform digests, {} attestation tags",
            self.source.url(),
            platform.versions.len(),
            platform.digests.len(),
            platform.attestation_tags.len()
        );
        Ok(platform)
    }

    /// Reads the complete expected artifact set.
    pub async fn collect(&self, tag: Option<&str>) -> Result<ExpectedArtifactSet> {
        let platform = self.collect_platform(tag).await?;
        let mut errors = vec![];

        let mut modules = BTreeMap::new();
        match self.read_modules_list().await {
            Ok(names) => {
                for name in names {
                    let module = self.read_module(&name).await;
                    errors.extend(module.errors);
                    modules.insert(name, module.value);
                }
            }
            Err(err) => {
                warn!("listing modules: {err}");
                errors.push(format!("modules: {err}"));
            }
        }

        let security = self.read_security_databases().await;
        errors.extend(security.errors);

        Ok(ExpectedArtifactSet {
            source: self.source.url(),
            platform,
            modules,
            security_databases: security.value,
            errors,
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{layers::test::layer, registry::memory::MemoryRegistry};

    fn version_layer(version: &str) -> Vec<u8> {
        layer(&[(VERSION_FILE, json!({ "version": version }).to_string().as_bytes())])
    }

    #[tokio::test]
    async fn test_release_channels_are_best_effort() {
        let access = Arc::new(MemoryRegistry::new());
        let inventory = SourceInventory::new(Registry::new("src", "d8", access.clone()));

        access.push_image("src/d8/release-channel", Some("stable"), &[version_layer("v1.2.3")]);
        access.push_image("src/d8/release-channel", Some("alpha"), &[version_layer("v1.3.0")]);
        // no version.json anywhere
        access.push_image("src/d8/release-channel", Some("beta"), &[layer(&[("x", b"")])]);

        let channels = inventory.read_release_channels().await;
        assert_eq!(
            channels.value,
            BTreeMap::from([
                ("alpha".to_string(), "v1.3.0".to_string()),
                ("stable".to_string(), "v1.2.3".to_string()),
            ])
        );
        assert_eq!(channels.errors.len(), 1);
        assert!(channels.errors[0].contains("release-channel:beta"));
    }

    #[tokio::test]
    async fn test_platform_digests_deduplicate_versions() {
        let access = Arc::new(MemoryRegistry::new());
        let inventory = SourceInventory::new(Registry::new("src", "d8", access.clone()));

        let a = Digest::sha256(b"a");
        let b = Digest::sha256(b"b");
        let digests = json!({
            "common": { "pause": a.to_string() },
            "controlPlane": { "apiserver": b.to_string() },
        });
        access.push_image(
            "src/d8/install",
            Some("v1.2.3"),
            &[
                layer(&[("etc/hostname", b"x")]),
                layer(&[(PLATFORM_DIGESTS_FILE, digests.to_string().as_bytes())]),
            ],
        );

        let result = inventory
            .read_platform_digests(["v1.2.3", "1.2.3", "v9.9.9"])
            .await;
        assert_eq!(result.value.digests, BTreeSet::from([a, b]));
        assert_eq!(result.value.installers, BTreeSet::from(["v1.2.3".to_string()]));
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("install:v9.9.9"));
    }

    #[tokio::test]
    async fn test_no_platform_digests_is_fatal() {
        let access = Arc::new(MemoryRegistry::new());
        let inventory = SourceInventory::new(Registry::new("src", "d8", access.clone()));
        access.push_image("src/d8/release-channel", Some("stable"), &[version_layer("v1.0.0")]);

        let err = inventory.collect_platform(None).await.unwrap_err();
        assert!(matches!(err, Error::NoPlatformDigests { .. }));
    }

    #[tokio::test]
    async fn test_modules_list_skips_artifact_tags() {
        let access = Arc::new(MemoryRegistry::new());
        let inventory = SourceInventory::new(Registry::new("src", "d8", access.clone()));
        assert!(inventory.read_modules_list().await.unwrap().is_empty());

        access.push_image("src/d8/modules", Some("console"), &[]);
        access.push_image("src/d8/modules", Some("sds-node"), &[]);
        let digest = access.push_image("src/d8/modules", None, &[b"sig".to_vec()]);
        access
            .tag("src/d8/modules", &digest.attestation_tag(), &digest)
            .unwrap();

        assert_eq!(
            inventory.read_modules_list().await.unwrap(),
            vec!["console".to_string(), "sds-node".to_string()]
        );
    }
}
