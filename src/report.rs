//! Comparison and verification reports.
//!
//! Reports are built up while a run progresses and handed to the caller once complete.  Every
//! list in them is sorted, and their rendered text carries no timestamps, so that two runs over
//! the same registries produce byte-identical output.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use serde::Serialize;

use crate::{
    layout::{COMPARISON_DETAIL_LIMIT, VERIFICATION_DETAIL_LIMIT},
    reference::{segment_name, segment_reference, Selector},
};

/// How an expected item differs in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// Expected, but absent from the target.
    Missing,
    /// Present on both sides with different content.
    DigestDifferent,
    /// Present in the target only.
    Extra,
}

impl Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MismatchKind::Missing => "missing",
            MismatchKind::DigestDifferent => "digest different",
            MismatchKind::Extra => "extra",
        })
    }
}

/// One discrepancy, keyed by normalized reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub reference: String,
    pub kind: MismatchKind,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reference, self.kind)?;
        match (&self.expected, &self.actual) {
            (Some(expected), Some(actual)) => write!(f, " (expected {expected}, got {actual})"),
            (Some(expected), None) => write!(f, " (expected {expected})"),
            (None, Some(actual)) => write!(f, " (got {actual})"),
            (None, None) => Ok(()),
        }
    }
}

/// Result of comparing two reference → digest maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DigestComparison {
    pub expected_count: usize,
    pub actual_count: usize,
    pub matched_count: usize,
    /// Sorted by reference.
    pub mismatches: Vec<Mismatch>,
}

impl DigestComparison {
    /// Reports every expected reference that is absent from or different in `actual`.
    pub fn compare(expected: &BTreeMap<String, String>, actual: &BTreeMap<String, String>) -> Self {
        let mut result = DigestComparison {
            expected_count: expected.len(),
            actual_count: actual.len(),
            ..Default::default()
        };

        for (reference, digest) in expected {
            match actual.get(reference) {
                Some(found) if found == digest => result.matched_count += 1,
                found => result.mismatches.push(Mismatch {
                    reference: reference.clone(),
                    kind: match found {
                        Some(_) => MismatchKind::DigestDifferent,
                        None => MismatchKind::Missing,
                    },
                    expected: Some(digest.clone()),
                    actual: found.cloned(),
                }),
            }
        }
        result
    }

    /// Like [`compare`](Self::compare), and also reports references only present in `actual`.
    pub fn compare_strict(
        expected: &BTreeMap<String, String>,
        actual: &BTreeMap<String, String>,
    ) -> Self {
        let mut result = Self::compare(expected, actual);
        result.mismatches.extend(
            actual
                .iter()
                .filter(|(reference, _)| !expected.contains_key(*reference))
                .map(|(reference, digest)| Mismatch {
                    reference: reference.clone(),
                    kind: MismatchKind::Extra,
                    expected: None,
                    actual: Some(digest.clone()),
                }),
        );
        result
            .mismatches
            .sort_by(|a, b| a.reference.cmp(&b.reference));
        result
    }

    pub fn is_identical(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Writes a titled list truncated to `limit` entries.
fn write_section<T: Display>(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    items: &[T],
    limit: usize,
) -> fmt::Result {
    if items.is_empty() {
        return Ok(());
    }
    writeln!(f)?;
    writeln!(f, "{title} ({}):", items.len())?;
    for item in items.iter().take(limit) {
        writeln!(f, "  {item}")?;
    }
    if items.len() > limit {
        writeln!(f, "  ... and {} more", items.len() - limit)?;
    }
    Ok(())
}

/// A tag present on both sides whose images differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageDifference {
    /// `segment:tag`, see [`segment_reference`]
    pub reference: String,
    pub source_digest: String,
    pub target_digest: String,
    /// Source and target config digests, when both are known and differ.
    pub config: Option<(String, String)>,
    /// Layers of the source image absent from the target image.
    pub missing_layers: Vec<String>,
    /// Layers of the target image absent from the source image.
    pub extra_layers: Vec<String>,
    /// Only manifest digests could be compared.
    pub shallow: bool,
}

impl Display for ImageDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {}",
            self.reference, self.source_digest, self.target_digest
        )?;
        if self.shallow {
            write!(f, " (manifest digest only)")?;
        }
        if let Some((source, target)) = &self.config {
            write!(f, "\n    config: {source} -> {target}")?;
        }
        for layer in &self.missing_layers {
            write!(f, "\n    layer missing in target: {layer}")?;
        }
        for layer in &self.extra_layers {
            write!(f, "\n    extra layer in target: {layer}")?;
        }
        Ok(())
    }
}

/// Comparison of one repository present on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepositoryComparison {
    /// Repository path relative to the registry root.
    pub path: String,
    pub source_tags: usize,
    pub target_tags: usize,
    /// Source tags excluded as registry-internal noise.
    pub skipped_tags: usize,
    pub missing_tags: Vec<String>,
    pub extra_tags: Vec<String>,
    pub matched_tags: usize,
    /// Matched tags that could only be compared by manifest digest.
    pub shallow_checks: usize,
    pub image_differences: Vec<ImageDifference>,
    /// Tags that could not be compared at all.
    pub unverified_tags: Vec<String>,
    pub errors: Vec<String>,
}

impl RepositoryComparison {
    pub fn is_identical(&self) -> bool {
        self.missing_tags.is_empty()
            && self.extra_tags.is_empty()
            && self.image_differences.is_empty()
            && self.unverified_tags.is_empty()
    }

    pub(crate) fn finish(&mut self) {
        self.missing_tags.sort();
        self.extra_tags.sort();
        self.unverified_tags.sort();
        self.errors.sort();
        self.image_differences
            .sort_by(|a, b| a.reference.cmp(&b.reference));
    }
}

/// Result of a structural diff of two registries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComparisonReport {
    pub source: String,
    pub target: String,
    pub source_repositories: usize,
    pub target_repositories: usize,
    pub missing_repositories: Vec<String>,
    pub extra_repositories: Vec<String>,
    /// Repositories present on both sides, sorted by path.
    pub repositories: Vec<RepositoryComparison>,
    pub errors: Vec<String>,
}

impl ComparisonReport {
    pub fn is_identical(&self) -> bool {
        self.missing_repositories.is_empty()
            && self.extra_repositories.is_empty()
            && self.repositories.iter().all(RepositoryComparison::is_identical)
    }

    /// Every discrepancy as a typed mismatch, sorted by reference.
    pub fn mismatches(&self) -> Vec<Mismatch> {
        let plain = |reference: String, kind| Mismatch {
            reference,
            kind,
            expected: None,
            actual: None,
        };

        let mut result: Vec<Mismatch> = self
            .missing_repositories
            .iter()
            .map(|r| plain(segment_name(r).to_string(), MismatchKind::Missing))
            .chain(
                self.extra_repositories
                    .iter()
                    .map(|r| plain(segment_name(r).to_string(), MismatchKind::Extra)),
            )
            .collect();

        for repo in &self.repositories {
            let reference = |tag: &String| {
                segment_reference(&repo.path, &Selector::Tag(tag.clone())).into_string()
            };
            result.extend(
                repo.missing_tags
                    .iter()
                    .map(|t| plain(reference(t), MismatchKind::Missing)),
            );
            result.extend(
                repo.extra_tags
                    .iter()
                    .map(|t| plain(reference(t), MismatchKind::Extra)),
            );
            result.extend(repo.image_differences.iter().map(|d| Mismatch {
                reference: d.reference.clone(),
                kind: MismatchKind::DigestDifferent,
                expected: Some(d.source_digest.clone()),
                actual: Some(d.target_digest.clone()),
            }));
        }

        result.sort_by(|a, b| a.reference.cmp(&b.reference).then(a.kind.cmp(&b.kind)));
        result
    }

    fn total(&self, count: impl Fn(&RepositoryComparison) -> usize) -> usize {
        self.repositories.iter().map(count).sum()
    }

    /// A few lines for the console.
    pub fn summary(&self) -> String {
        self.to_string()
    }

    /// Full report, suitable for writing to a file.
    pub fn detailed(&self) -> String {
        DetailedComparison(self).to_string()
    }
}

impl Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Registry comparison: {} -> {}", self.source, self.target)?;
        writeln!(
            f,
            "Result: {}",
            if self.is_identical() {
                "IDENTICAL"
            } else {
                "DIFFERENT"
            }
        )?;
        writeln!(
            f,
            "Repositories: {} in source, {} in target, {} missing, {} extra",
            self.source_repositories,
            self.target_repositories,
            self.missing_repositories.len(),
            self.extra_repositories.len()
        )?;
        writeln!(
            f,
            "Tags: {} matched ({} by digest only), {} missing, {} extra, {} different, {} unverified, {} skipped",
            self.total(|r| r.matched_tags),
            self.total(|r| r.shallow_checks),
            self.total(|r| r.missing_tags.len()),
            self.total(|r| r.extra_tags.len()),
            self.total(|r| r.image_differences.len()),
            self.total(|r| r.unverified_tags.len()),
            self.total(|r| r.skipped_tags)
        )?;
        if !self.errors.is_empty() {
            writeln!(f, "Errors: {}", self.errors.len())?;
        }
        Ok(())
    }
}

struct DetailedComparison<'a>(&'a ComparisonReport);

impl Display for DetailedComparison<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        let limit = COMPARISON_DETAIL_LIMIT;
        write!(f, "{report}")?;

        let names = |paths: &[String]| -> Vec<String> {
            paths.iter().map(|p| segment_name(p).to_string()).collect()
        };
        write_section(
            f,
            "Repositories missing in target",
            &names(&report.missing_repositories),
            limit,
        )?;
        write_section(
            f,
            "Repositories only in target",
            &names(&report.extra_repositories),
            limit,
        )?;

        for repo in report.repositories.iter().filter(|r| !r.is_identical()) {
            writeln!(f)?;
            writeln!(
                f,
                "== {}: {} source tags, {} target tags, {} matched",
                segment_name(&repo.path),
                repo.source_tags,
                repo.target_tags,
                repo.matched_tags
            )?;
            write_section(f, "Tags missing in target", &repo.missing_tags, limit)?;
            write_section(f, "Tags only in target", &repo.extra_tags, limit)?;
            write_section(f, "Different images", &repo.image_differences, limit)?;
            write_section(f, "Unverified tags", &repo.unverified_tags, limit)?;
        }

        let mut errors = report.errors.clone();
        errors.extend(report.repositories.iter().flat_map(|r| r.errors.clone()));
        write_section(f, "Errors", &errors, limit)
    }
}

/// Expected, found and missing counts of one category of artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub expected: usize,
    pub found: usize,
    /// Sorted after a run completes.
    pub missing: Vec<String>,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.expected += other.expected;
        self.found += other.found;
        self.missing.extend(other.missing);
    }

    fn finish(&mut self) {
        self.missing.sort();
        self.missing.dedup();
    }
}

/// Result of a targeted verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub source: String,
    pub target: String,
    pub release_channels: Tally,
    pub installers: Tally,
    pub platform_digests: Tally,
    pub attestation_tags: Tally,
    pub modules: Tally,
    pub module_digests: Tally,
    pub security: Tally,
    pub errors: Vec<String>,
}

impl VerificationResult {
    pub fn new(source: String, target: String) -> Self {
        VerificationResult {
            source,
            target,
            ..Default::default()
        }
    }

    fn categories(&self) -> [(&'static str, &Tally); 7] {
        [
            ("Release channels", &self.release_channels),
            ("Installers", &self.installers),
            ("Platform images", &self.platform_digests),
            ("Attestations", &self.attestation_tags),
            ("Modules", &self.modules),
            ("Module images", &self.module_digests),
            ("Security databases", &self.security),
        ]
    }

    fn categories_mut(&mut self) -> [&mut Tally; 7] {
        [
            &mut self.release_channels,
            &mut self.installers,
            &mut self.platform_digests,
            &mut self.attestation_tags,
            &mut self.modules,
            &mut self.module_digests,
            &mut self.security,
        ]
    }

    /// True when nothing expected is missing from the target.
    pub fn is_success(&self) -> bool {
        self.categories()
            .iter()
            .all(|(_, tally)| tally.missing.is_empty())
    }

    /// Adds up another result, category by category.
    pub fn merge(&mut self, other: VerificationResult) {
        let VerificationResult {
            release_channels,
            installers,
            platform_digests,
            attestation_tags,
            modules,
            module_digests,
            security,
            errors,
            ..
        } = other;
        let others = [
            release_channels,
            installers,
            platform_digests,
            attestation_tags,
            modules,
            module_digests,
            security,
        ];
        for (mine, theirs) in self.categories_mut().into_iter().zip(others) {
            mine.merge(theirs);
        }
        self.errors.extend(errors);
        self.finish();
    }

    /// Sorts all lists.  Called once a run is complete.
    pub(crate) fn finish(&mut self) {
        for tally in self.categories_mut() {
            tally.finish();
        }
        self.errors.sort();
        self.errors.dedup();
    }

    pub fn summary(&self) -> String {
        self.to_string()
    }

    pub fn detailed(&self) -> String {
        DetailedVerification(self).to_string()
    }
}

impl Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Mirror verification: {} -> {}", self.source, self.target)?;
        writeln!(
            f,
            "Result: {}",
            if self.is_success() { "PASSED" } else { "FAILED" }
        )?;
        for (name, tally) in self.categories() {
            if tally.expected == 0 && tally.missing.is_empty() {
                continue;
            }
            writeln!(
                f,
                "{name}: {}/{} found, {} missing",
                tally.found,
                tally.expected,
                tally.missing.len()
            )?;
        }
        if !self.errors.is_empty() {
            writeln!(f, "Errors: {}", self.errors.len())?;
        }
        Ok(())
    }
}

struct DetailedVerification<'a>(&'a VerificationResult);

impl Display for DetailedVerification<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = self.0;
        write!(f, "{result}")?;
        for (name, tally) in result.categories() {
            write_section(
                f,
                &format!("{name} missing in target"),
                &tally.missing,
                VERIFICATION_DETAIL_LIMIT,
            )?;
        }
        write_section(f, "Errors", &result.errors, VERIFICATION_DETAIL_LIMIT)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_compare_example() {
        let expected = map(&[("a/b:v1", "sha256:11"), ("a/b:v2", "sha256:22")]);
        let actual = map(&[("a/b:v1", "sha256:11"), ("a/b:v2", "sha256:33")]);

        let result = DigestComparison::compare(&expected, &actual);
        assert_eq!(result.matched_count, 1);
        assert_eq!(
            result.mismatches,
            vec![Mismatch {
                reference: "a/b:v2".into(),
                kind: MismatchKind::DigestDifferent,
                expected: Some("sha256:22".into()),
                actual: Some("sha256:33".into()),
            }]
        );
        assert!(!result.is_identical());

        let same = DigestComparison::compare(&expected, &expected);
        assert!(same.is_identical());
        assert_eq!(same.matched_count, 2);
    }

    #[test]
    fn test_compare_counts_one_mismatch_per_expected_key() {
        let expected = map(&[("x:1", "sha256:1"), ("x:2", "sha256:2"), ("x:3", "sha256:3")]);
        let actual = map(&[("x:2", "sha256:9"), ("x:4", "sha256:4")]);

        let result = DigestComparison::compare(&expected, &actual);
        let kinds: Vec<_> = result
            .mismatches
            .iter()
            .map(|m| (m.reference.as_str(), m.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("x:1", MismatchKind::Missing),
                ("x:2", MismatchKind::DigestDifferent),
                ("x:3", MismatchKind::Missing),
            ]
        );
        assert_eq!(result.expected_count, 3);
        assert_eq!(result.actual_count, 2);
    }

    #[test]
    fn test_compare_strict_is_superset() {
        let expected = map(&[("x:1", "sha256:1"), ("x:3", "sha256:3")]);
        let actual = map(&[("x:0", "sha256:0"), ("x:1", "sha256:1"), ("x:2", "sha256:2")]);

        let loose = DigestComparison::compare(&expected, &actual);
        let strict = DigestComparison::compare_strict(&expected, &actual);
        for mismatch in &loose.mismatches {
            assert!(strict.mismatches.contains(mismatch));
        }

        let references: Vec<_> = strict
            .mismatches
            .iter()
            .map(|m| (m.reference.as_str(), m.kind))
            .collect();
        assert_eq!(
            references,
            vec![
                ("x:0", MismatchKind::Extra),
                ("x:2", MismatchKind::Extra),
                ("x:3", MismatchKind::Missing),
            ]
        );
    }

    fn comparison_with_gaps(missing: usize) -> ComparisonReport {
        ComparisonReport {
            source: "src/d8".into(),
            target: "dst/d8".into(),
            source_repositories: 2,
            target_repositories: 2,
            repositories: vec![RepositoryComparison {
                path: "install".into(),
                source_tags: missing + 1,
                target_tags: 1,
                missing_tags: (0..missing).map(|i| format!("v1.{i:03}")).collect(),
                matched_tags: 1,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_detailed_report_is_bounded() {
        let report = comparison_with_gaps(COMPARISON_DETAIL_LIMIT + 7);
        assert!(!report.is_identical());
        let text = report.detailed();
        assert!(text.contains("Tags missing in target (57):"));
        assert!(text.contains("  v1.049\n"));
        assert!(!text.contains("  v1.050\n"));
        assert!(text.contains("  ... and 7 more\n"));
        assert_eq!(text, comparison_with_gaps(COMPARISON_DETAIL_LIMIT + 7).detailed());
    }

    #[test]
    fn test_comparison_mismatches() {
        let mut report = comparison_with_gaps(1);
        report.missing_repositories = vec!["modules/foo".into()];
        report.repositories[0].extra_tags = vec!["v0".into()];
        report.repositories[0].image_differences = vec![ImageDifference {
            reference: "install:v2".into(),
            source_digest: "sha256:aa".into(),
            target_digest: "sha256:bb".into(),
            config: None,
            missing_layers: vec![],
            extra_layers: vec![],
            shallow: true,
        }];

        let mismatches: Vec<_> = report
            .mismatches()
            .into_iter()
            .map(|m| (m.reference, m.kind))
            .collect();
        assert_eq!(
            mismatches,
            vec![
                ("install:v0".to_string(), MismatchKind::Extra),
                ("install:v1.000".to_string(), MismatchKind::Missing),
                ("install:v2".to_string(), MismatchKind::DigestDifferent),
                ("modules/foo".to_string(), MismatchKind::Missing),
            ]
        );
    }

    #[test]
    fn test_root_repository_mismatches_are_named() {
        let mut report = comparison_with_gaps(0);
        report.extra_repositories = vec!["".into()];
        report.repositories[0].path = "".into();
        report.repositories[0].missing_tags = vec!["v1.65.0".into()];

        let references: Vec<String> = report.mismatches().into_iter().map(|m| m.reference).collect();
        assert_eq!(references, vec!["(root)".to_string(), "(root):v1.65.0".to_string()]);
    }

    #[test]
    fn test_unverified_tags_are_not_identical() {
        let mut report = comparison_with_gaps(0);
        assert!(report.is_identical());
        report.repositories[0].unverified_tags.push("v1".into());
        assert!(!report.is_identical());
    }

    #[test]
    fn test_verification_merge() {
        let mut platform = VerificationResult::new("src".into(), "dst".into());
        platform.platform_digests = Tally {
            expected: 3,
            found: 2,
            missing: vec!["sha256:bb".into()],
        };
        platform.errors.push("b".into());

        let mut security = VerificationResult::new("src".into(), "dst".into());
        security.security = Tally {
            expected: 4,
            found: 4,
            missing: vec![],
        };
        security.platform_digests.missing.push("sha256:aa".into());
        security.errors.push("a".into());

        platform.merge(security);
        assert_eq!(platform.platform_digests.expected, 3);
        assert_eq!(
            platform.platform_digests.missing,
            vec!["sha256:aa".to_string(), "sha256:bb".to_string()]
        );
        assert_eq!(platform.security.found, 4);
        assert_eq!(platform.errors, vec!["a".to_string(), "b".to_string()]);
        assert!(!platform.is_success());

        let summary = platform.summary();
        assert!(summary.contains("Result: FAILED"));
        assert!(summary.contains("Platform images: 2/3 found, 2 missing"));
        assert!(summary.contains("Security databases: 4/4 found, 0 missing"));
        assert!(!summary.contains("Modules"));
    }
}
