//! Version specifier resolution
//!
//! Turns a user supplied specifier into one concrete identifier, given a
//! snapshot of what the registry knows about the ruleset.

use std::fmt;

use crate::ruleset::constraint::VersionConstraint;
use crate::ruleset::error::ResolveError;
use crate::ruleset::semver::{compare_versions, find_semantic_max, is_semver_like, parse_tag};
use crate::ruleset::types::{LATEST, RefSnapshot, ResolvedVersion};

/// What the user asked for
#[derive(Debug, Clone)]
pub enum VersionSpecifier {
    /// `latest` (or an empty specifier)
    Latest,
    /// `1.2.3` or `v1.2.3`
    Exact(String),
    /// `^1.2.0`, `~1.2`, `>=1.0.0 <2.0.0`, `1.x`, ...
    Range(VersionConstraint),
    /// 7 to 40 hex characters
    Commit(String),
    /// Anything else
    Branch(String),
}

impl VersionSpecifier {
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();

        if spec.is_empty() || spec.eq_ignore_ascii_case(LATEST) {
            return VersionSpecifier::Latest;
        }
        if is_semver_like(spec) {
            return VersionSpecifier::Exact(spec.to_string());
        }
        if starts_with_operator(spec)
            && let Some(constraint) = VersionConstraint::parse(spec)
        {
            return VersionSpecifier::Range(constraint);
        }
        if is_commit_hash(spec) {
            return VersionSpecifier::Commit(spec.to_string());
        }
        if let Some(constraint) = VersionConstraint::parse(spec) {
            return VersionSpecifier::Range(constraint);
        }
        VersionSpecifier::Branch(spec.to_string())
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, VersionSpecifier::Latest)
    }

    /// Canonical text used as the key in the versions index
    pub fn key(&self) -> String {
        match self {
            VersionSpecifier::Latest => LATEST.to_string(),
            VersionSpecifier::Exact(v) | VersionSpecifier::Commit(v) | VersionSpecifier::Branch(v) => {
                v.clone()
            }
            VersionSpecifier::Range(constraint) => constraint.as_str().to_string(),
        }
    }
}

impl fmt::Display for VersionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

fn starts_with_operator(spec: &str) -> bool {
    spec.starts_with(['^', '~', '>', '<', '=', '*'])
        || spec.contains("||")
        || spec.contains(' ')
        || spec.contains(',')
}

/// True for 7 to 40 hexadecimal characters
pub fn is_commit_hash(value: &str) -> bool {
    (7..=40).contains(&value.len()) && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Stateless resolver over a [`RefSnapshot`]
pub struct VersionResolver;

impl VersionResolver {
    /// Resolve `spec` against `snapshot`.
    ///
    /// - `latest`: the default branch HEAD for git snapshots, never the
    ///   highest tag. Snapshots without git refs (package registries) use
    ///   the highest semver version instead.
    /// - exact semver: the tag as published, trying with and without `v`
    /// - range: the highest tag satisfying the constraint
    /// - commit hash: returned as-is
    /// - branch: the commit the branch points at
    pub fn resolve(
        spec: &VersionSpecifier,
        snapshot: &RefSnapshot,
    ) -> Result<ResolvedVersion, ResolveError> {
        match spec {
            VersionSpecifier::Latest => Self::resolve_latest(snapshot),
            VersionSpecifier::Exact(version) => Self::resolve_exact(version, snapshot),
            VersionSpecifier::Range(constraint) => Self::resolve_range(constraint, snapshot),
            VersionSpecifier::Commit(hash) => Ok(ResolvedVersion::new(hash.clone())),
            VersionSpecifier::Branch(branch) => snapshot
                .branches
                .get(branch)
                .map(|commit| ResolvedVersion::new(commit.clone()))
                .ok_or_else(|| ResolveError::RefNotFound(branch.clone())),
        }
    }

    fn resolve_latest(snapshot: &RefSnapshot) -> Result<ResolvedVersion, ResolveError> {
        if snapshot.is_git() {
            return snapshot
                .head
                .clone()
                .map(ResolvedVersion::new)
                .ok_or(ResolveError::NoDefaultBranch);
        }
        find_semantic_max(&snapshot.tags)
            .map(ResolvedVersion::new)
            .ok_or(ResolveError::NoVersions)
    }

    fn resolve_exact(version: &str, snapshot: &RefSnapshot) -> Result<ResolvedVersion, ResolveError> {
        let alternate = match version.strip_prefix('v') {
            Some(stripped) => stripped.to_string(),
            None => format!("v{version}"),
        };

        [version, alternate.as_str()]
            .into_iter()
            .find(|candidate| snapshot.tags.iter().any(|tag| tag == candidate))
            .map(ResolvedVersion::new)
            .ok_or_else(|| ResolveError::VersionNotFound(version.to_string()))
    }

    fn resolve_range(
        constraint: &VersionConstraint,
        snapshot: &RefSnapshot,
    ) -> Result<ResolvedVersion, ResolveError> {
        let mut candidates: Vec<_> = snapshot
            .tags
            .iter()
            .filter_map(|tag| parse_tag(tag).map(|parsed| (tag, parsed)))
            .filter(|(_, parsed)| constraint.satisfies(parsed))
            .collect();

        candidates.sort_by(|(_, a), (_, b)| compare_versions(b, a));

        candidates
            .into_iter()
            .next()
            .map(|(tag, _)| ResolvedVersion::new(tag.clone()))
            .ok_or_else(|| ResolveError::NoMatchingVersion {
                constraint: constraint.to_string(),
            })
    }
}
