//! Targeted verification.
//!
//! Instead of walking the target, the expected artifact set is read from the source and each
//! expected artifact is looked up in the target directly.  Lookups run on a bounded pool; the
//! shared result is locked only while a finished lookup is recorded, never across a request.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
};

use log::{debug, info, warn};

use crate::{
    digest::Digest,
    error::Result,
    inventory::{PlatformArtifacts, SourceInventory},
    layout::{
        module_release_segment, module_segment, security_segment, INSTALL_SEGMENT,
        PRESENCE_CHECK_POOL, RELEASE_CHANNELS, RELEASE_CHANNEL_SEGMENT, ROOT_SEGMENT,
        SECURITY_DATABASES,
    },
    pool::TaskPool,
    reference::ImageReference,
    registry::Registry,
    report::{DigestComparison, MismatchKind, Tally, VerificationResult},
};

/// Picks the category a check counts towards.
type Category = fn(&mut VerificationResult) -> &mut Tally;

/// One artifact to look up in the target.
struct Check {
    reference: ImageReference,
    /// Name recorded when the artifact is missing.
    label: String,
    /// Digest the target must resolve to; `None` checks presence only.
    expected: Option<Digest>,
    category: Category,
}

impl Check {
    fn found(&self, result: &mut VerificationResult) {
        (self.category)(result).found += 1;
    }

    fn missing(&self, result: &mut VerificationResult) {
        (self.category)(result).missing.push(self.label.clone());
    }

    /// Unexpected failures count as missing too, so an unreachable target never passes.
    fn error(&self, result: &mut VerificationResult, message: String) {
        self.missing(result);
        result.errors.push(message);
    }
}

/// Runs checks on a pool of [`PRESENCE_CHECK_POOL`] tasks, recording into `result`.
async fn run_checks(
    target: &Registry,
    checks: Vec<Check>,
    result: &Arc<Mutex<VerificationResult>>,
) -> Result<()> {
    {
        let mut result = result.lock().unwrap_or_else(PoisonError::into_inner);
        for check in &checks {
            (check.category)(&mut result).expected += 1;
        }
    }

    let mut pool = TaskPool::new(PRESENCE_CHECK_POOL);
    for check in checks {
        let target = target.clone();
        let result = Arc::clone(result);
        pool.spawn(async move {
            let outcome = target.resolve_digest(&check.reference).await;

            let mut result = result.lock().unwrap_or_else(PoisonError::into_inner);
            match (outcome, &check.expected) {
                (Ok(actual), Some(expected)) if actual != *expected => check.error(
                    &mut result,
                    format!(
                        "{}: digest mismatch, expected {expected}, target has {actual}",
                        check.label
                    ),
                ),
                (Ok(_), _) => check.found(&mut result),
                (Err(err), _) if err.is_not_found() => {
                    debug!("{}: missing in target", check.reference);
                    check.missing(&mut result);
                }
                (Err(err), _) => {
                    warn!("{}: {err}", check.reference);
                    check.error(&mut result, format!("{}: {err}", check.label));
                }
            }
        })
        .await?;
    }

    pool.join().await
}

fn take(result: Arc<Mutex<VerificationResult>>) -> VerificationResult {
    let mut result = match Arc::try_unwrap(result) {
        Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
        Err(shared) => shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone(),
    };
    result.finish();
    result
}

/// Verifies the artifacts the source says should exist against the target.
#[derive(Debug, Clone)]
pub struct TargetedVerifier {
    inventory: SourceInventory,
    target: Registry,
}

impl TargetedVerifier {
    pub fn new(source: Registry, target: Registry) -> Self {
        TargetedVerifier {
            inventory: SourceInventory::new(source),
            target,
        }
    }

    fn source(&self) -> &Registry {
        self.inventory.registry()
    }

    fn new_result(&self) -> VerificationResult {
        VerificationResult::new(self.source().url(), self.target.url())
    }

    /// Resolves a source tag for comparison, recording failures in `errors`.
    async fn source_digest(
        &self,
        segment: &str,
        tag: &str,
        errors: &mut Vec<String>,
    ) -> Option<Digest> {
        let reference = self.source().tag_ref(segment, tag);
        match self.source().resolve_digest(&reference).await {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!("{reference}: {err}");
                let key = self.source().key(&reference);
                errors.push(format!("{key}: unreadable in source: {err}"));
                None
            }
        }
    }

    /// Verifies release channels, installers, platform images and their attestations.
    ///
    /// With `tag`, only that release is verified.  Fails if the source yields no platform digest.
    pub async fn verify_platform(&self, tag: Option<&str>) -> Result<VerificationResult> {
        let PlatformArtifacts {
            release_channels,
            installers,
            digests,
            attestation_tags,
            errors,
            ..
        } = self.inventory.collect_platform(tag).await?;

        let mut result = self.new_result();
        result.errors = errors;

        let mut checks = vec![];
        for channel in release_channels.keys() {
            if let Some(expected) = self
                .source_digest(RELEASE_CHANNEL_SEGMENT, channel, &mut result.errors)
                .await
            {
                let reference = self.target.tag_ref(RELEASE_CHANNEL_SEGMENT, channel);
                checks.push(Check {
                    label: self.target.key(&reference).into_string(),
                    reference,
                    expected: Some(expected),
                    category: |r| &mut r.release_channels,
                });
            }
        }
        for installer in &installers {
            if let Some(expected) = self
                .source_digest(INSTALL_SEGMENT, installer, &mut result.errors)
                .await
            {
                let reference = self.target.tag_ref(INSTALL_SEGMENT, installer);
                checks.push(Check {
                    label: self.target.key(&reference).into_string(),
                    reference,
                    expected: Some(expected),
                    category: |r| &mut r.installers,
                });
            }
        }
        for digest in &digests {
            checks.push(Check {
                reference: self.target.digest_ref(ROOT_SEGMENT, digest),
                label: digest.to_string(),
                expected: Some(digest.clone()),
                category: |r| &mut r.platform_digests,
            });
        }
        for tag in &attestation_tags {
            checks.push(Check {
                reference: self.target.tag_ref(ROOT_SEGMENT, tag),
                label: tag.clone(),
                expected: None,
                category: |r| &mut r.attestation_tags,
            });
        }

        info!(
            "verifying {} platform digests and {} attestation tags in {}",
            digests.len(),
            attestation_tags.len(),
            self.target.url()
        );
        let result = Arc::new(Mutex::new(result));
        run_checks(&self.target, checks, &result).await?;
        Ok(take(result))
    }

    /// Compares one module's release channels between source and target.
    ///
    /// Returns the channels whose digests match.
    async fn compare_module_channels(
        &self,
        name: &str,
        result: &mut VerificationResult,
    ) -> Option<BTreeSet<String>> {
        let segment = module_release_segment(name);
        let target_tags = match self.target.list_tags(&segment).await {
            Ok(tags) => tags,
            Err(err) if err.is_not_found() => return None,
            Err(err) => {
                warn!("module {name}: {err}");
                result.errors.push(format!("module {name}: {err}"));
                return None;
            }
        };
        let channels: Vec<&str> = RELEASE_CHANNELS
            .into_iter()
            .filter(|c| target_tags.iter().any(|t| t == c))
            .collect();

        let mut expected = BTreeMap::new();
        let mut actual = BTreeMap::new();
        for channel in channels {
            let source_ref = self.source().tag_ref(&segment, channel);
            match self.source().resolve_digest(&source_ref).await {
                Ok(digest) => {
                    expected.insert(channel.to_string(), digest.to_string());
                }
                Err(err) if err.is_not_found() => {
                    info!("module {name}: channel {channel} exists only in target");
                    continue;
                }
                Err(err) => {
                    warn!("{source_ref}: {err}");
                    result
                        .errors
                        .push(format!("module {name} channel {channel}: unreadable in source: {err}"));
                    continue;
                }
            }

            match self.target.resolve_digest(&self.target.tag_ref(&segment, channel)).await {
                Ok(digest) => {
                    actual.insert(channel.to_string(), digest.to_string());
                }
                Err(err) => {
                    result.errors.push(format!("module {name} channel {channel}: {err}"));
                }
            }
        }

        let comparison = DigestComparison::compare(&expected, &actual);
        for mismatch in &comparison.mismatches {
            if mismatch.kind == MismatchKind::DigestDifferent {
                warn!("module {name}: {mismatch}");
                result.errors.push(format!("module {name} channel {mismatch}"));
            }
        }

        let matched: BTreeSet<String> = expected
            .iter()
            .filter(|(channel, digest)| actual.get(*channel) == Some(*digest))
            .map(|(channel, _)| channel.clone())
            .collect();
        (!matched.is_empty()).then_some(matched)
    }

    /// Verifies modules; with no names, every module the source lists.
    ///
    /// A module is found when at least one of its release channels matches the source digest.
    /// The images used by the versions of matching channels must then exist in the target.
    pub async fn verify_modules(&self, names: &[String]) -> Result<VerificationResult> {
        let mut result = self.new_result();
        let names = if names.is_empty() {
            match self.inventory.read_modules_list().await {
                Ok(names) => names,
                Err(err) => {
                    warn!("listing source modules: {err}");
                    result.errors.push(format!("listing source modules: {err}"));
                    vec![]
                }
            }
        } else {
            names.to_vec()
        };

        result.modules.expected = names.len();
        let mut checks = vec![];
        for name in &names {
            let Some(channels) = self.compare_module_channels(name, &mut result).await else {
                result.modules.missing.push(name.clone());
                continue;
            };
            result.modules.found += 1;

            let module = self.inventory.read_module(name).await;
            result.errors.extend(module.errors);
            let digests: BTreeSet<&Digest> = channels
                .iter()
                .filter_map(|c| module.value.channels.get(c))
                .filter_map(|version| module.value.versions.get(version))
                .flatten()
                .collect();
            debug!("module {name}: {} images to check", digests.len());

            for digest in digests {
                checks.push(Check {
                    reference: self.target.digest_ref(&module_segment(name), digest),
                    label: format!("{name}@{digest}"),
                    expected: Some(digest.clone()),
                    category: |r| &mut r.module_digests,
                });
            }
        }

        let result = Arc::new(Mutex::new(result));
        run_checks(&self.target, checks, &result).await?;
        Ok(take(result))
    }

    /// Verifies the security databases at their fixed tags.
    ///
    /// A database the source can't provide is left out of the expected count.
    pub async fn verify_security(&self) -> Result<VerificationResult> {
        let mut result = self.new_result();
        let mut expected = BTreeMap::new();
        let mut actual = BTreeMap::new();

        for (database, tag) in SECURITY_DATABASES {
            let segment = security_segment(database);
            let source_ref = self.source().tag_ref(&segment, tag);
            let key = self.source().key(&source_ref).into_string();

            match self.source().resolve_digest(&source_ref).await {
                Ok(digest) => {
                    expected.insert(key.clone(), digest.to_string());
                }
                Err(err) => {
                    if err.is_not_found() {
                        info!("{key}: not in source, skipping");
                    } else {
                        warn!("{key}: unreadable in source: {err}");
                        result.errors.push(format!("{key}: unreadable in source: {err}"));
                    }
                    continue;
                }
            }

            match self.target.resolve_digest(&self.target.tag_ref(&segment, tag)).await {
                Ok(digest) => {
                    actual.insert(key, digest.to_string());
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => result.errors.push(format!("{key}: {err}")),
            }
        }

        let comparison = DigestComparison::compare(&expected, &actual);
        result.security = Tally {
            expected: comparison.expected_count,
            found: comparison.matched_count,
            missing: comparison
                .mismatches
                .iter()
                .map(|m| m.reference.clone())
                .collect(),
        };
        result.errors.extend(
            comparison
                .mismatches
                .iter()
                .filter(|m| m.kind == MismatchKind::DigestDifferent)
                .map(|m| m.to_string()),
        );
        result.finish();
        Ok(result)
    }

    /// Platform, modules and security databases, one after the other, merged into one result.
    pub async fn verify_full(
        &self,
        tag: Option<&str>,
        modules: &[String],
    ) -> Result<VerificationResult> {
        let mut result = self.verify_platform(tag).await?;
        result.merge(self.verify_modules(modules).await?);
        result.merge(self.verify_security().await?);
        Ok(result)
    }
}
