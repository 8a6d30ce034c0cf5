//! Image references, normalization and tag classification.
//!
//! Source and target registries hold the same repository paths under different hosts (and often
//! different root paths), so everything the comparators match on is host-free.  [`normalize`]
//! produces that form from a full reference string, and [`classify_tag`] is the single place that
//! decides which tags are registry-internal noise.  Reports key every artifact by
//! [`NormalizedRef`], built either by [`normalize`] or from a reference relative to its registry
//! root with [`ImageReference::relative_to`].  The structural comparator skips every
//! non-[`Regular`](TagClass::Regular) tag, while targeted verification deliberately brings
//! attestation tags back in; both go through the same classification so that the two policies
//! can't drift apart.

use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::{
    digest::Digest,
    error::{Error, Result},
    layout::{ROOT_NAME, SERVICE_TAGS},
};

/// What a reference points at: a mutable tag or an immutable digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    Tag(String),
    Digest(Digest),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Tag(tag) => write!(f, ":{tag}"),
            Selector::Digest(digest) => write!(f, "@{digest}"),
        }
    }
}

/// A fully qualified image reference: registry host, repository path and selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    selector: Selector,
}

fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

impl ImageReference {
    pub fn with_tag(registry: &str, repository: &str, tag: &str) -> Self {
        ImageReference {
            registry: registry.to_string(),
            repository: repository.to_string(),
            selector: Selector::Tag(tag.to_string()),
        }
    }

    pub fn with_digest(registry: &str, repository: &str, digest: &Digest) -> Self {
        ImageReference {
            registry: registry.to_string(),
            repository: repository.to_string(),
            selector: Selector::Digest(digest.clone()),
        }
    }

    /// Same repository, pinned to a digest instead.
    pub fn pinned(&self, digest: &Digest) -> Self {
        Self::with_digest(&self.registry, &self.repository, digest)
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.selector {
            Selector::Tag(tag) => Some(tag),
            Selector::Digest(_) => None,
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match &self.selector {
            Selector::Tag(_) => None,
            Selector::Digest(digest) => Some(digest),
        }
    }

    /// `repository:tag` or `repository@digest`, without the registry host.
    pub fn normalized(&self) -> NormalizedRef {
        NormalizedRef(format!("{}{}", self.repository, self.selector))
    }

    /// The reference with the registry host and `root` stripped: `segment:tag`, the same for a
    /// source and its mirror.  The root repository itself is named [`ROOT_NAME`].
    pub fn relative_to(&self, root: &str) -> NormalizedRef {
        let root = root.trim_matches('/');
        let segment = if root.is_empty() {
            self.repository.as_str()
        } else {
            match self.repository.strip_prefix(root) {
                Some("") => "",
                Some(rest) => rest.strip_prefix('/').unwrap_or(self.repository.as_str()),
                None => self.repository.as_str(),
            }
        };
        segment_reference(segment, &self.selector)
    }
}

/// A reference without registry host: `repository-path:tag` or `repository-path@digest`.
///
/// Only [`normalize`] and [`ImageReference`] build these, and normalizing one again returns it
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NormalizedRef(String);

impl NormalizedRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<NormalizedRef> for String {
    fn from(reference: NormalizedRef) -> Self {
        reference.0
    }
}

impl PartialEq<str> for NormalizedRef {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for NormalizedRef {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Display name of a repository segment; the root repository has an empty segment.
pub fn segment_name(segment: &str) -> &str {
    if segment.is_empty() {
        ROOT_NAME
    } else {
        segment
    }
}

/// Key of an artifact in a repository segment below the registry root.
pub fn segment_reference(segment: &str, selector: &Selector) -> NormalizedRef {
    NormalizedRef(format!("{}{selector}", segment_name(segment)))
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(reference: &str) -> Result<Self> {
        let fail = |reason: &str| Error::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let Some((registry, rest)) = reference.split_once('/') else {
            return Err(fail("missing registry host"));
        };
        if !looks_like_host(registry) {
            return Err(fail("missing registry host"));
        }

        let (repository, selector) = if let Some((repository, digest)) = rest.rsplit_once('@') {
            (repository, Selector::Digest(digest.parse()?))
        } else {
            // a ':' after the last '/' separates the tag
            let name_start = rest.rfind('/').map_or(0, |i| i + 1);
            match rest[name_start..].rfind(':') {
                Some(i) => (
                    &rest[..name_start + i],
                    Selector::Tag(rest[name_start + i + 1..].to_string()),
                ),
                None => (rest, Selector::Tag("latest".to_string())),
            }
        };

        if repository.is_empty() {
            return Err(fail("empty repository"));
        }
        if matches!(&selector, Selector::Tag(tag) if tag.is_empty()) {
            return Err(fail("empty tag"));
        }

        Ok(ImageReference {
            registry: registry.to_string(),
            repository: repository.to_string(),
            selector,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.normalized())
    }
}

/// Anything that can be reduced to a host-free reference.
pub trait Normalize {
    fn normalize(&self) -> NormalizedRef;
}

impl Normalize for str {
    /// Strips an optional scheme and the registry host.
    ///
    /// The first path component counts as a host when it contains a `.` or `:` or is
    /// `localhost`, which is the rule container tooling uses everywhere else.
    fn normalize(&self) -> NormalizedRef {
        let trimmed = self
            .strip_prefix("https://")
            .or_else(|| self.strip_prefix("http://"))
            .unwrap_or(self);

        match trimmed.split_once('/') {
            Some((first, rest)) if looks_like_host(first) => NormalizedRef(rest.to_string()),
            _ => NormalizedRef(trimmed.to_string()),
        }
    }
}

impl Normalize for String {
    fn normalize(&self) -> NormalizedRef {
        self.as_str().normalize()
    }
}

impl Normalize for ImageReference {
    fn normalize(&self) -> NormalizedRef {
        self.normalized()
    }
}

impl Normalize for NormalizedRef {
    fn normalize(&self) -> NormalizedRef {
        self.clone()
    }
}

/// Reduces a reference to `repository-path:selector`.  Idempotent: the host of a reference is
/// stripped once, and a [`NormalizedRef`] normalizes to itself.
pub fn normalize<R: Normalize + ?Sized>(reference: &R) -> NormalizedRef {
    reference.normalize()
}

/// The kind of a tag, as far as mirroring is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// An ordinary, independently mirrored tag.
    Regular,
    /// A 64 character hex string: a digest used as a tag.
    DigestTag,
    /// `sha256-<hex>` OCI referrers fallback tags.
    Referrer,
    /// `*.sig` signatures.
    Signature,
    /// `*.att` attestations.
    Attestation,
    /// `*.sbom` software bills of materials.
    Sbom,
    /// Tags left behind by write-access probes.
    Service,
}

/// Classify a tag.  Pure: no I/O, same input always gives the same class.
pub fn classify_tag(tag: &str) -> TagClass {
    if SERVICE_TAGS.contains(&tag) {
        TagClass::Service
    } else if tag.ends_with(".sig") {
        TagClass::Signature
    } else if tag.ends_with(".att") {
        TagClass::Attestation
    } else if tag.ends_with(".sbom") {
        TagClass::Sbom
    } else if tag.starts_with("sha256-") {
        TagClass::Referrer
    } else if tag.len() == 64 && tag.bytes().all(|b| b.is_ascii_hexdigit()) {
        TagClass::DigestTag
    } else {
        TagClass::Regular
    }
}

/// Whether the structural comparator should leave a tag out of its tag sets.
pub fn should_skip_tag(tag: &str) -> bool {
    classify_tag(tag) != TagClass::Regular
}

/// The image an attestation tag belongs to.  `None` for any tag [`classify_tag`] doesn't call an
/// attestation, so targeted verification re-includes exactly the tags the structural diff skips
/// as attestations.
pub fn attested_digest(tag: &str) -> Option<Digest> {
    match classify_tag(tag) {
        TagClass::Attestation => Digest::from_attestation_tag(tag),
        _ => None,
    }
}
