//! Semver range constraints
//!
//! Supports the range syntax accepted in version specifiers:
//! - `1.2.3` / `=1.2.3` - exact match
//! - `^1.2.3` - compatible with version (>=1.2.3 <2.0.0)
//! - `~1.2.3` - approximately equivalent (>=1.2.3 <1.3.0)
//! - `>=1.2.3`, `>1.2.3`, `<=1.2.3`, `<1.2.3` - comparison operators
//! - `1.2.x`, `1.x`, `1.2`, `1`, `*` - wildcards and partial versions
//! - `>=1.0.0 <2.0.0` or `>=1.0.0, <2.0.0` - all must hold
//! - `^1.0.0 || ^2.0.0` - any may hold
//!
//! A leading `v` on any version (`^v1.2.0`) is ignored.

use std::cmp::Ordering;
use std::fmt;

use semver::Version;

use crate::ruleset::semver::{compare_versions, parse_version};

/// A parsed range constraint
#[derive(Debug, Clone)]
pub struct VersionConstraint {
    source: String,
    spec: VersionSpec,
}

impl VersionConstraint {
    pub fn parse(spec: &str) -> Option<Self> {
        VersionSpec::parse(spec).map(|parsed| Self {
            source: spec.trim().to_string(),
            spec: parsed,
        })
    }

    /// Check if a version satisfies this constraint.
    ///
    /// Prerelease versions only satisfy a constraint that itself names a
    /// prerelease of the same major.minor.patch.
    pub fn satisfies(&self, version: &Version) -> bool {
        if !version.pre.is_empty() && !self.spec.allows_prerelease_of(version) {
            return false;
        }
        self.spec.satisfies(version)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Top-level version specification parser
/// Handles compound ranges (AND, OR) as well as simple ranges
#[derive(Debug, Clone)]
enum VersionSpec {
    /// Single range (^1.0.0, >=1.0.0, etc.)
    Single(VersionRange),
    /// AND of ranges (>=1.0.0 <2.0.0) - space-separated, all must satisfy
    And(Vec<VersionSpec>),
    /// OR of specs (^1.0.0 || ^2.0.0) - any must satisfy
    Or(Vec<VersionSpec>),
}

impl VersionSpec {
    fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }

        // OR has the lowest precedence
        if spec.contains("||") {
            let specs: Option<Vec<VersionSpec>> =
                spec.split("||").map(Self::parse_and_or_single).collect();
            return specs.map(VersionSpec::Or);
        }

        Self::parse_and_or_single(spec)
    }

    fn parse_and_or_single(spec: &str) -> Option<Self> {
        let normalized = Self::attach_operators(&spec.replace(',', " "));
        let parts: Vec<&str> = normalized.split_whitespace().collect();

        match parts.as_slice() {
            [] => None,
            [single] => VersionRange::parse(single).map(VersionSpec::Single),
            many => {
                let ranges: Option<Vec<VersionSpec>> = many
                    .iter()
                    .map(|p| VersionRange::parse(p).map(VersionSpec::Single))
                    .collect();
                ranges.map(VersionSpec::And)
            }
        }
    }

    /// Join operators separated from their version by whitespace (`>= 1.0.0`)
    fn attach_operators(spec: &str) -> String {
        let mut joined = String::new();
        let mut pending_operator = false;
        for token in spec.split_whitespace() {
            if !joined.is_empty() && !pending_operator {
                joined.push(' ');
            }
            joined.push_str(token);
            pending_operator = matches!(token, ">=" | "<=" | ">" | "<" | "=" | "^" | "~");
        }
        joined
    }

    fn satisfies(&self, version: &Version) -> bool {
        match self {
            VersionSpec::Single(range) => range.satisfies(version),
            VersionSpec::And(specs) => specs.iter().all(|s| s.satisfies(version)),
            VersionSpec::Or(specs) => specs.iter().any(|s| s.satisfies(version)),
        }
    }

    fn allows_prerelease_of(&self, version: &Version) -> bool {
        match self {
            VersionSpec::Single(range) => range.base_version().is_some_and(|base| {
                !base.pre.is_empty()
                    && (base.major, base.minor, base.patch)
                        == (version.major, version.minor, version.patch)
            }),
            VersionSpec::And(specs) | VersionSpec::Or(specs) => {
                specs.iter().any(|s| s.allows_prerelease_of(version))
            }
        }
    }
}

/// Represents a single parsed range
#[derive(Debug, Clone)]
enum VersionRange {
    /// Exact version match
    Exact(Version),
    /// Caret range: ^1.2.3 means >=1.2.3 <2.0.0 (or special cases for 0.x)
    Caret(Version),
    /// Tilde range: ~1.2.3 means >=1.2.3 <1.3.0
    Tilde(Version),
    /// Greater than or equal
    Gte(Version),
    /// Greater than
    Gt(Version),
    /// Less than or equal
    Lte(Version),
    /// Less than
    Lt(Version),
    /// Any version: * matches all versions
    Any,
    /// Wildcard major: 1.x means >=1.0.0 <2.0.0
    WildcardMajor(u64),
    /// Wildcard minor: 1.2.x means >=1.2.0 <1.3.0
    WildcardMinor(u64, u64),
}

impl VersionRange {
    fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();

        if let Some(rest) = spec.strip_prefix(">=") {
            parse_bound(rest).map(VersionRange::Gte)
        } else if let Some(rest) = spec.strip_prefix('>') {
            parse_bound(rest).map(VersionRange::Gt)
        } else if let Some(rest) = spec.strip_prefix("<=") {
            parse_bound(rest).map(VersionRange::Lte)
        } else if let Some(rest) = spec.strip_prefix('<') {
            parse_bound(rest).map(VersionRange::Lt)
        } else if let Some(rest) = spec.strip_prefix('^') {
            parse_bound(rest).map(VersionRange::Caret)
        } else if let Some(rest) = spec.strip_prefix('~') {
            parse_bound(rest).map(VersionRange::Tilde)
        } else if let Some(rest) = spec.strip_prefix('=') {
            parse_bound(rest).map(VersionRange::Exact)
        } else if spec == "*" || spec.eq_ignore_ascii_case("x") {
            Some(VersionRange::Any)
        } else {
            Self::parse_wildcard(strip_v(spec))
                .or_else(|| parse_bound(spec).map(VersionRange::Exact))
        }
    }

    /// Parse wildcard and partial patterns like "1.x", "1.2.x", "1" or "1.2"
    fn parse_wildcard(spec: &str) -> Option<Self> {
        let parts: Vec<&str> = spec.split('.').collect();
        let is_wild = |part: &str| part.eq_ignore_ascii_case("x") || part == "*";
        let number = |part: &str| part.parse::<u64>().ok();

        match parts.as_slice() {
            [major] => number(major).map(VersionRange::WildcardMajor),
            [major, x] if is_wild(x) => number(major).map(VersionRange::WildcardMajor),
            [major, x, y] if is_wild(x) && is_wild(y) => {
                number(major).map(VersionRange::WildcardMajor)
            }
            [major, minor] => Some(VersionRange::WildcardMinor(number(major)?, number(minor)?)),
            [major, minor, x] if is_wild(x) => {
                Some(VersionRange::WildcardMinor(number(major)?, number(minor)?))
            }
            _ => None,
        }
    }

    fn satisfies(&self, version: &Version) -> bool {
        let cmp = |bound: &Version| compare_versions(version, bound);
        match self {
            VersionRange::Exact(v) => cmp(v) == Ordering::Equal,
            VersionRange::Caret(v) => {
                if cmp(v) == Ordering::Less {
                    return false;
                }
                // ^1.2.3 -> >=1.2.3 <2.0.0
                // ^0.2.3 -> >=0.2.3 <0.3.0
                // ^0.0.3 -> >=0.0.3 <0.0.4
                if v.major == 0 {
                    if v.minor == 0 {
                        version.major == 0 && version.minor == 0 && version.patch == v.patch
                    } else {
                        version.major == 0 && version.minor == v.minor
                    }
                } else {
                    version.major == v.major
                }
            }
            VersionRange::Tilde(v) => {
                cmp(v) != Ordering::Less && version.major == v.major && version.minor == v.minor
            }
            VersionRange::Gte(v) => cmp(v) != Ordering::Less,
            VersionRange::Gt(v) => cmp(v) == Ordering::Greater,
            VersionRange::Lte(v) => cmp(v) != Ordering::Greater,
            VersionRange::Lt(v) => cmp(v) == Ordering::Less,
            VersionRange::Any => true,
            VersionRange::WildcardMajor(major) => version.major == *major,
            VersionRange::WildcardMinor(major, minor) => {
                version.major == *major && version.minor == *minor
            }
        }
    }

    fn base_version(&self) -> Option<&Version> {
        match self {
            VersionRange::Exact(v)
            | VersionRange::Caret(v)
            | VersionRange::Tilde(v)
            | VersionRange::Gte(v)
            | VersionRange::Gt(v)
            | VersionRange::Lte(v)
            | VersionRange::Lt(v) => Some(v),
            VersionRange::Any | VersionRange::WildcardMajor(_) | VersionRange::WildcardMinor(..) => {
                None
            }
        }
    }
}

fn strip_v(version: &str) -> &str {
    version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version)
}

fn parse_bound(version: &str) -> Option<Version> {
    parse_version(strip_v(version.trim()))
}
