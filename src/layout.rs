//! Well-known repository layout of a platform registry.
//!
//! All paths are relative to the registry root (`host/root/path`).  The empty segment is the
//! root repository itself, which holds the platform images by digest and their attestations.

/// Release channels, in order of increasing stability.
pub const RELEASE_CHANNELS: [&str; 5] = ["alpha", "beta", "early-access", "stable", "rock-solid"];

/// The root repository.
pub const ROOT_SEGMENT: &str = "";
/// How the root repository is named in reports.
pub const ROOT_NAME: &str = "(root)";
/// Installer images, tagged by platform version.
pub const INSTALL_SEGMENT: &str = "install";
/// Standalone installer images, tagged by platform version.
pub const INSTALL_STANDALONE_SEGMENT: &str = "install-standalone";
/// Platform release channel images, tagged by channel name.
pub const RELEASE_CHANNEL_SEGMENT: &str = "release-channel";
/// Module catalogue.  Module names are stored as the *tags* of this repository.
pub const MODULES_SEGMENT: &str = "modules";
/// Sub-repository of a module that holds its release channel images.
pub const MODULE_RELEASE_SEGMENT: &str = "release";
/// Parent of the security database repositories.
pub const SECURITY_SEGMENT: &str = "security";

/// Security databases and the tag each one is published under.
pub const SECURITY_DATABASES: [(&str, &str); 4] = [
    ("trivy-db", "2"),
    ("trivy-bdu", "1"),
    ("trivy-java-db", "1"),
    ("trivy-checks", "0"),
];

/// Tags written by write-access probes of the mirroring tooling.
pub const SERVICE_TAGS: [&str; 2] = ["mirror-write-probe", "d8-write-check"];

/// File inside a release channel image naming the version the channel points at.
pub const VERSION_FILE: &str = "version.json";
/// File inside an installer image listing every platform image digest.
pub const PLATFORM_DIGESTS_FILE: &str = "deckhouse/candi/images_digests.json";
/// File inside a module image listing every module image digest.
pub const MODULE_DIGESTS_FILE: &str = "images_digests.json";

/// Concurrent deep image comparisons.
pub const DEEP_COMPARE_POOL: usize = 5;
/// Concurrent presence/digest checks.
pub const PRESENCE_CHECK_POOL: usize = 10;

/// Entries listed per category in the detailed structural report.
pub const COMPARISON_DETAIL_LIMIT: usize = 50;
/// Entries listed per category in the detailed verification report.
pub const VERIFICATION_DETAIL_LIMIT: usize = 100;

/// Segment of one security database.
pub fn security_segment(database: &str) -> String {
    format!("{SECURITY_SEGMENT}/{database}")
}

/// Segment holding the images of one module.
pub fn module_segment(module: &str) -> String {
    format!("{MODULES_SEGMENT}/{module}")
}

/// Segment holding the release channel images of one module.
pub fn module_release_segment(module: &str) -> String {
    format!("{MODULES_SEGMENT}/{module}/{MODULE_RELEASE_SEGMENT}")
}

/// Fixed segments probed during discovery, before modules are expanded.
pub fn well_known_segments() -> Vec<String> {
    let mut segments = vec![
        ROOT_SEGMENT.to_string(),
        INSTALL_SEGMENT.to_string(),
        INSTALL_STANDALONE_SEGMENT.to_string(),
        RELEASE_CHANNEL_SEGMENT.to_string(),
    ];
    segments.extend(SECURITY_DATABASES.iter().map(|(db, _)| security_segment(db)));
    segments
}

/// Map a channel version to the tag of the matching installer image.
///
/// Versions that parse as semver (with or without a leading `v`) are tagged `v<semver>`; anything
/// else is used verbatim.
pub fn installer_tag(version: &str) -> String {
    let trimmed = version.trim();
    match semver::Version::parse(trimmed.strip_prefix('v').unwrap_or(trimmed)) {
        Ok(parsed) => format!("v{parsed}"),
        Err(_) => trimmed.to_string(),
    }
}
