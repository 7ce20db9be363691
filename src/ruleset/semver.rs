use std::cmp::Ordering;

use semver::Version;

/// Parse a version string into a semver::Version, normalizing partial versions.
///
/// Handles partial versions like "1" or "1.2" by padding with zeros.
/// Does NOT strip 'v' prefix (use `parse_tag` for tags).
///
/// Examples:
/// - "1" -> Version(1, 0, 0)
/// - "1.2" -> Version(1, 2, 0)
/// - "1.2.3" -> Version(1, 2, 3)
pub fn parse_version(version: &str) -> Option<Version> {
    let parts: Vec<&str> = version.split('.').collect();
    let normalized = match parts.len() {
        1 => format!("{}.0.0", parts[0]),
        2 => format!("{}.{}.0", parts[0], parts[1]),
        _ => version.to_string(),
    };
    Version::parse(&normalized).ok()
}

/// Parse a full `x.y.z` tag, with or without a leading `v`
pub fn parse_tag(tag: &str) -> Option<Version> {
    let stripped = tag
        .strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag);
    Version::parse(stripped).ok()
}

/// True for strings such as `1.2.3`, `v1.2.3` or `1.2.3-rc.1`
pub fn is_semver_like(value: &str) -> bool {
    parse_tag(value).is_some()
}

/// Total order used for picking versions.
///
/// Numeric components compare numerically. When they are equal a release
/// ranks above any prerelease, and two prereleases compare lexically by their
/// full prerelease string. Build metadata is ignored.
pub fn compare_versions(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch)
        .cmp(&(b.major, b.minor, b.patch))
        .then_with(|| match (a.pre.is_empty(), b.pre.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => a.pre.as_str().cmp(b.pre.as_str()),
        })
}

/// Find the semantically maximum version from a list
///
/// Handles both `v`-prefixed (e.g., "v1.0.0") and non-prefixed versions.
/// Invalid versions are skipped.
pub fn find_semantic_max(versions: &[String]) -> Option<String> {
    versions
        .iter()
        .filter_map(|v| parse_tag(v).map(|parsed| (v, parsed)))
        .max_by(|(_, a), (_, b)| compare_versions(a, b))
        .map(|(original, _)| original.clone())
}
