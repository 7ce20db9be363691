//! Common types shared by registries, the cache and the downloader

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ruleset::pattern::matches_any_pattern;
use crate::ruleset::semver::{compare_versions, parse_tag};

/// Specifier that always means "whatever the remote considers current"
pub const LATEST: &str = "latest";

/// Pattern that selects every file
pub const MATCH_ALL: &str = "**";

/// Repository-relative path to file contents
pub type RulesetFiles = BTreeMap<String, Vec<u8>>;

/// Concrete identifier a specifier resolved to (tag, package version or commit hash)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedVersion(String);

impl ResolvedVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for identifiers that must never be used as a cache key
    pub fn is_unresolved(&self) -> bool {
        self.0.is_empty() || self.0.eq_ignore_ascii_case(LATEST)
    }
}

impl fmt::Display for ResolvedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which files of a ruleset to fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSelector {
    pub patterns: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl ContentSelector {
    pub fn new<S: Into<String>>(patterns: impl IntoIterator<Item = S>) -> Self {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            excludes: Vec::new(),
        }
    }

    pub fn with_excludes<S: Into<String>>(mut self, excludes: impl IntoIterator<Item = S>) -> Self {
        self.excludes = excludes.into_iter().map(Into::into).collect();
        self
    }

    /// Patterns used for fetching and cache lookups; an empty list means everything
    pub fn effective_patterns(&self) -> Vec<String> {
        if self.patterns.is_empty() {
            vec![MATCH_ALL.to_string()]
        } else {
            self.patterns.clone()
        }
    }

    /// True if `path` matches the patterns and none of the excludes
    pub fn selects(&self, path: &str) -> bool {
        matches_any_pattern(path, &self.patterns) && !self.is_excluded(path)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        !self.excludes.is_empty() && matches_any_pattern(path, &self.excludes)
    }

    /// Drop excluded paths from an already pattern-filtered file map
    pub fn apply_excludes(&self, files: RulesetFiles) -> RulesetFiles {
        if self.excludes.is_empty() {
            return files;
        }
        files
            .into_iter()
            .filter(|(path, _)| !self.is_excluded(path))
            .collect()
    }
}

/// Everything a registry knows about the refs or versions of one ruleset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefSnapshot {
    /// Name of the remote's default branch (git registries only)
    pub default_branch: Option<String>,
    /// Commit the default branch points at (git registries only)
    pub head: Option<String>,
    /// Tag names or published package versions
    pub tags: Vec<String>,
    /// Branch name to commit hash
    pub branches: BTreeMap<String, String>,
}

impl RefSnapshot {
    /// Snapshot for a package registry that only publishes version strings
    pub fn from_versions(versions: Vec<String>) -> Self {
        Self {
            tags: versions,
            ..Default::default()
        }
    }

    pub fn is_git(&self) -> bool {
        self.head.is_some() || !self.branches.is_empty()
    }

    /// Identifiers for display: `latest` first, then semver tags newest first,
    /// then other tags alphabetically, then branches.
    pub fn listing(&self) -> Vec<String> {
        let mut semver_tags: Vec<_> = self
            .tags
            .iter()
            .filter_map(|tag| parse_tag(tag).map(|parsed| (tag, parsed)))
            .collect();
        semver_tags.sort_by(|(_, a), (_, b)| compare_versions(b, a));

        let mut other_tags: Vec<&String> = self
            .tags
            .iter()
            .filter(|tag| parse_tag(tag).is_none())
            .collect();
        other_tags.sort();

        let mut listing = vec![LATEST.to_string()];
        listing.extend(semver_tags.into_iter().map(|(tag, _)| tag.clone()));
        listing.extend(other_tags.into_iter().cloned());
        listing.extend(
            self.branches
                .keys()
                .filter(|branch| !self.tags.contains(branch))
                .cloned(),
        );
        listing
    }
}

/// What an installer records in the lock file after a successful download
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledRuleset {
    pub name: String,
    pub registry: String,
    pub resolved_version: ResolvedVersion,
    pub checksum: String,
    pub files: Vec<String>,
}

/// `sha256:<hex>` over every path and its bytes, in path order
pub fn content_checksum(files: &RulesetFiles) -> String {
    let mut hasher = Sha256::new();
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_be_bytes());
        hasher.update(content);
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn files(entries: &[(&str, &str)]) -> RulesetFiles {
        entries
            .iter()
            .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
            .collect()
    }

    #[rstest]
    #[case("latest", true)]
    #[case("LATEST", true)]
    #[case("", true)]
    #[case("v1.0.0", false)]
    #[case("abc1234", false)]
    fn resolved_version_is_unresolved(#[case] version: &str, #[case] expected: bool) {
        assert_eq!(ResolvedVersion::new(version).is_unresolved(), expected);
    }

    #[test]
    fn selector_without_patterns_selects_everything_but_excludes() {
        let selector = ContentSelector::default().with_excludes(["**/*.txt"]);

        assert_eq!(selector.effective_patterns(), vec!["**".to_string()]);
        assert!(selector.selects("rules/a.md"));
        assert!(!selector.selects("notes/b.txt"));
    }

    #[test]
    fn apply_excludes_drops_matching_paths() {
        let selector = ContentSelector::new(["**"]).with_excludes(["drafts/**"]);
        let filtered = selector.apply_excludes(files(&[
            ("rules/a.md", "a"),
            ("drafts/b.md", "b"),
        ]));

        assert_eq!(filtered, files(&[("rules/a.md", "a")]));
    }

    #[test]
    fn listing_orders_latest_then_semver_then_other_tags_then_branches() {
        let snapshot = RefSnapshot {
            default_branch: Some("main".to_string()),
            head: Some("a".repeat(40)),
            tags: vec![
                "v1.0.0".to_string(),
                "nightly".to_string(),
                "v2.0.0".to_string(),
                "v2.0.0-rc.1".to_string(),
            ],
            branches: BTreeMap::from([
                ("main".to_string(), "a".repeat(40)),
                ("dev".to_string(), "b".repeat(40)),
            ]),
        };

        assert_eq!(
            snapshot.listing(),
            vec!["latest", "v2.0.0", "v2.0.0-rc.1", "v1.0.0", "nightly", "dev", "main"]
        );
    }

    #[test]
    fn content_checksum_depends_on_paths_and_bytes() {
        let a = content_checksum(&files(&[("a.md", "x")]));
        let b = content_checksum(&files(&[("b.md", "x")]));
        let c = content_checksum(&files(&[("a.md", "y")]));

        assert!(a.starts_with("sha256:"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, content_checksum(&files(&[("a.md", "x")])));
    }
}
