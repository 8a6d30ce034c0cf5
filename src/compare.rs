//! Structural diff of two registries.
//!
//! Both registries are walked independently: well-known repositories are probed, modules are
//! discovered from the tags of the modules repository, and every repository that exists on both
//! sides has its tags diffed.  Tags present on both sides are then compared image by image on a
//! small task pool, falling back to a manifest digest comparison when the full manifests can't be
//! fetched.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use indicatif::ProgressBar;
use log::{debug, info, warn};

use crate::{
    error::Result,
    layout::{
        module_release_segment, module_segment, well_known_segments, DEEP_COMPARE_POOL,
        MODULES_SEGMENT,
    },
    pool::TaskPool,
    reference::should_skip_tag,
    registry::{ImageInfo, Registry},
    report::{ComparisonReport, ImageDifference, RepositoryComparison},
};

/// The repositories found in one registry, with their tags.
#[derive(Debug, Default)]
struct Topology {
    repositories: BTreeMap<String, Vec<String>>,
    errors: Vec<String>,
}

impl Topology {
    async fn probe(&mut self, registry: &Registry, segment: &str) {
        match registry.list_tags(segment).await {
            Ok(tags) if !tags.is_empty() => {
                debug!("{}: {segment:?} has {} tags", registry.url(), tags.len());
                self.repositories.insert(segment.to_string(), tags);
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!("{}: listing {segment:?}: {err}", registry.url());
                self.errors
                    .push(format!("{}: listing {segment:?}: {err}", registry.url()));
            }
        }
    }

    /// Probes the well-known repositories and every module's repositories.
    async fn discover(registry: &Registry) -> Self {
        let mut topology = Topology::default();
        for segment in well_known_segments() {
            topology.probe(registry, &segment).await;
        }

        topology.probe(registry, MODULES_SEGMENT).await;
        let modules: Vec<String> = topology
            .repositories
            .get(MODULES_SEGMENT)
            .map(|tags| tags.iter().filter(|t| !should_skip_tag(t)).cloned().collect())
            .unwrap_or_default();
        for module in modules {
            topology.probe(registry, &module_segment(&module)).await;
            topology.probe(registry, &module_release_segment(&module)).await;
        }

        info!(
            "{}: discovered {} repositories",
            registry.url(),
            topology.repositories.len()
        );
        topology
    }
}

/// Outcome of comparing one tag present on both sides.
#[derive(Debug)]
enum TagOutcome {
    Matched { shallow: bool },
    Different(ImageDifference),
    Unverified(String),
}

fn diff_images(reference: String, source: ImageInfo, target: ImageInfo) -> Option<ImageDifference> {
    let source_layers: BTreeSet<_> = source.layers.iter().collect();
    let target_layers: BTreeSet<_> = target.layers.iter().collect();

    // A side without config (an index) can't disagree about it
    let config = match (&source.config, &target.config) {
        (Some(s), Some(t)) if s != t => Some((s.to_string(), t.to_string())),
        _ => None,
    };

    if source.digest == target.digest && config.is_none() && source_layers == target_layers {
        return None;
    }

    Some(ImageDifference {
        reference,
        source_digest: source.digest.to_string(),
        target_digest: target.digest.to_string(),
        config,
        missing_layers: source_layers
            .difference(&target_layers)
            .map(|d| d.to_string())
            .collect(),
        extra_layers: target_layers
            .difference(&source_layers)
            .map(|d| d.to_string())
            .collect(),
        shallow: false,
    })
}

async fn compare_tag(source: &Registry, target: &Registry, segment: &str, tag: &str) -> TagOutcome {
    let source_ref = source.tag_ref(segment, tag);
    let target_ref = target.tag_ref(segment, tag);
    let reference = source.key(&source_ref).into_string();

    let deep = tokio::try_join!(source.image_info(&source_ref), target.image_info(&target_ref));
    let err = match deep {
        Ok((s, t)) => {
            return match diff_images(reference, s, t) {
                Some(difference) => TagOutcome::Different(difference),
                None => TagOutcome::Matched { shallow: false },
            }
        }
        Err(err) => err,
    };

    debug!("{reference}: deep comparison failed ({err}), comparing manifest digests");
    let shallow = tokio::try_join!(
        source.resolve_digest(&source_ref),
        target.resolve_digest(&target_ref)
    );
    match shallow {
        Ok((s, t)) if s == t => TagOutcome::Matched { shallow: true },
        Ok((s, t)) => TagOutcome::Different(ImageDifference {
            reference,
            source_digest: s.to_string(),
            target_digest: t.to_string(),
            config: None,
            missing_layers: vec![],
            extra_layers: vec![],
            shallow: true,
        }),
        Err(shallow_err) => TagOutcome::Unverified(format!("{reference}: {shallow_err}")),
    }
}

/// Compares every repository and tag of two registries.
pub struct StructuralComparator {
    source: Registry,
    target: Registry,
    progress: ProgressBar,
}

impl StructuralComparator {
    pub fn new(source: Registry, target: Registry) -> Self {
        StructuralComparator {
            source,
            target,
            progress: ProgressBar::hidden(),
        }
    }

    /// Reports deep comparison progress, one step per tag.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub async fn compare(&self) -> Result<ComparisonReport> {
        let start = Instant::now();
        let source = Topology::discover(&self.source).await;
        let target = Topology::discover(&self.target).await;

        let source_paths: BTreeSet<&String> = source.repositories.keys().collect();
        let target_paths: BTreeSet<&String> = target.repositories.keys().collect();

        let mut report = ComparisonReport {
            source: self.source.url(),
            target: self.target.url(),
            source_repositories: source_paths.len(),
            target_repositories: target_paths.len(),
            missing_repositories: source_paths
                .difference(&target_paths)
                .map(|p| p.to_string())
                .collect(),
            extra_repositories: target_paths
                .difference(&source_paths)
                .map(|p| p.to_string())
                .collect(),
            errors: source.errors.into_iter().chain(target.errors).collect(),
            ..Default::default()
        };

        let mut repositories = BTreeMap::new();
        let mut work = vec![];
        for path in source_paths.intersection(&target_paths) {
            let source_tags = &source.repositories[*path];
            let target_tags = &target.repositories[*path];
            let wanted: BTreeSet<&String> =
                source_tags.iter().filter(|t| !should_skip_tag(t)).collect();
            let present: BTreeSet<&String> =
                target_tags.iter().filter(|t| !should_skip_tag(t)).collect();

            let comparison = RepositoryComparison {
                path: path.to_string(),
                source_tags: source_tags.len(),
                target_tags: target_tags.len(),
                skipped_tags: source_tags.len() - wanted.len(),
                missing_tags: wanted.difference(&present).map(|t| t.to_string()).collect(),
                extra_tags: present.difference(&wanted).map(|t| t.to_string()).collect(),
                ..Default::default()
            };
            work.extend(
                wanted
                    .intersection(&present)
                    .map(|tag| (path.to_string(), tag.to_string())),
            );
            repositories.insert(path.to_string(), comparison);
        }

        info!("deep comparing {} tags", work.len());
        self.progress.set_length(work.len() as u64);

        let repositories = Arc::new(Mutex::new(repositories));
        let mut pool = TaskPool::new(DEEP_COMPARE_POOL);
        for (path, tag) in work {
            let source = self.source.clone();
            let target = self.target.clone();
            let progress = self.progress.clone();
            let repositories = Arc::clone(&repositories);
            pool.spawn(async move {
                let outcome = compare_tag(&source, &target, &path, &tag).await;
                progress.inc(1);

                let mut repositories = repositories.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(repo) = repositories.get_mut(&path) else {
                    return;
                };
                match outcome {
                    TagOutcome::Matched { shallow } => {
                        repo.matched_tags += 1;
                        if shallow {
                            repo.shallow_checks += 1;
                        }
                    }
                    TagOutcome::Different(difference) => repo.image_differences.push(difference),
                    TagOutcome::Unverified(error) => {
                        warn!("{error}");
                        repo.unverified_tags.push(tag);
                        repo.errors.push(error);
                    }
                }
            })
            .await?;
        }

        pool.join().await?;
        self.progress.finish_and_clear();

        let repositories = std::mem::take(
            &mut *repositories.lock().unwrap_or_else(PoisonError::into_inner),
        );
        report.repositories = repositories
            .into_values()
            .map(|mut repo| {
                repo.finish();
                repo
            })
            .collect();
        report.errors.sort();

        info!(
            "compared {} with {} in {:.1?}",
            report.source,
            report.target,
            start.elapsed()
        );
        Ok(report)
    }
}
