//! Glob-style selection of repository-relative paths
//!
//! Supported syntax:
//! - `**` - zero or more path segments, `/` included
//! - `*` - zero or more characters within one segment
//! - `?` - exactly one character within one segment
//!
//! A pattern without wildcards and without `/` (e.g. `README.md`) also matches
//! that file name in any directory.

use std::path::{Component, Path};

use regex::Regex;
use walkdir::WalkDir;

/// A set of compiled glob patterns
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    patterns: Vec<CompiledPattern>,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    regex: Regex,
    /// Literal file name that may also match the base name of a path
    base_name: Option<String>,
}

impl CompiledPattern {
    fn new(pattern: &str) -> Self {
        let pattern = pattern.trim().trim_start_matches("./");
        let base_name = (!pattern.contains(['/', '*', '?'])).then(|| pattern.to_string());
        Self {
            regex: glob_to_regex(pattern),
            base_name,
        }
    }

    fn matches(&self, path: &str) -> bool {
        if self.regex.is_match(path) {
            return true;
        }
        match &self.base_name {
            Some(name) => path.rsplit('/').next() == Some(name.as_str()),
            None => false,
        }
    }
}

impl PatternMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|p| CompiledPattern::new(p.as_ref()))
                .collect(),
        }
    }

    /// True if there are no patterns or any pattern matches `path`
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(path))
    }
}

/// True if `patterns` is empty or any of them matches `path`
pub fn matches_any_pattern<S: AsRef<str>>(path: &str, patterns: &[S]) -> bool {
    PatternMatcher::new(patterns).matches(path)
}

/// True for relative paths that may be selected at all: no `..`, no absolute
/// roots and no dot-file or dot-directory components.
pub fn is_selectable_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return false;
    }
    path.split('/')
        .all(|segment| !segment.is_empty() && !segment.starts_with('.'))
}

/// Walk `root` and return the repository-relative paths of files matching
/// `patterns`, in walk order.
///
/// Dot-files and dot-directories (`.git` included) are skipped entirely and
/// symlinks are not followed.
pub fn find_matching_files<S: AsRef<str>>(
    root: &Path,
    patterns: &[S],
) -> std::io::Result<Vec<String>> {
    let matcher = PatternMatcher::new(patterns);
    let mut matches = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(relative) = to_slash_path(relative) else {
            continue;
        };
        if is_selectable_path(&relative) && matcher.matches(&relative) {
            matches.push(relative);
        }
    }

    Ok(matches)
}

fn to_slash_path(path: &Path) -> Option<String> {
    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_str()?),
            _ => return None,
        }
    }
    Some(segments.join("/"))
}

fn glob_to_regex(pattern: &str) -> Regex {
    let mut regex = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                let at_segment_start = i == 0 || chars[i - 1] == '/';
                let followed_by_slash = chars.get(i + 2) == Some(&'/');
                if at_segment_start && followed_by_slash {
                    // `**/` - zero or more leading directories
                    regex.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    regex.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                regex.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex.push_str("[^/]");
                i += 1;
            }
            c => {
                regex.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }

    regex.push('$');
    // Every literal is escaped, so the expression is always valid
    Regex::new(&regex).unwrap_or_else(|_| Regex::new("$^").expect("static regex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;
    use tempfile::TempDir;

    #[rstest]
    #[case("rules/x/y.md", &["rules/*.md"], false)]
    #[case("rules/x/y.md", &["rules/**/*.md"], true)]
    #[case("rules/y.md", &["rules/**/*.md"], true)] // ** matches zero segments
    #[case("rules/y.md", &["rules/*.md"], true)]
    #[case("a.md", &["*.md"], true)]
    #[case("sub/c.md", &["*.md"], false)]
    #[case("sub/c.md", &["**/*.md"], true)]
    #[case("b.txt", &["**/*.md"], false)]
    #[case("anything/at/all", &[], true)] // empty patterns select everything
    #[case("docs/README.md", &["README.md"], true)] // literal file name matches base name
    #[case("docs/README.md", &["READ*.md"], false)]
    #[case("rules/a.md", &["rules/?.md"], true)]
    #[case("rules/ab.md", &["rules/?.md"], false)]
    #[case("rules/a.md", &["*.txt", "rules/*"], true)]
    #[case("rules/deep/a.md", &["rules/**"], true)]
    #[case("rules.md", &["rules/**"], false)]
    #[case("a+b.md", &["a+b.md"], true)] // regex metacharacters are literal
    fn matches_any_pattern_returns_expected(
        #[case] path: &str,
        #[case] patterns: &[&str],
        #[case] expected: bool,
    ) {
        assert_eq!(matches_any_pattern(path, patterns), expected);
    }

    #[rstest]
    #[case("rules/a.md", true)]
    #[case("../escape.md", false)]
    #[case("rules/../../escape.md", false)]
    #[case("/etc/passwd", false)]
    #[case(".git/config", false)]
    #[case("rules/.hidden.md", false)]
    #[case("", false)]
    fn is_selectable_path_returns_expected(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_selectable_path(path), expected);
    }

    fn write(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, relative).unwrap();
    }

    #[test]
    fn find_matching_files_selects_top_level_markdown_only() {
        let temp_dir = TempDir::new().unwrap();
        for file in ["a.md", "b.txt", "sub/c.md"] {
            write(temp_dir.path(), file);
        }

        let found = find_matching_files(temp_dir.path(), &["*.md"]).unwrap();

        assert_eq!(found, vec!["a.md".to_string()]);
    }

    #[test]
    fn find_matching_files_with_double_star_selects_nested_markdown() {
        let temp_dir = TempDir::new().unwrap();
        for file in ["a.md", "b.txt", "sub/c.md"] {
            write(temp_dir.path(), file);
        }

        let mut found = find_matching_files(temp_dir.path(), &["**/*.md"]).unwrap();
        found.sort();

        assert_eq!(found, vec!["a.md".to_string(), "sub/c.md".to_string()]);
    }

    #[test]
    fn find_matching_files_skips_dot_files_and_directories() {
        let temp_dir = TempDir::new().unwrap();
        for file in [".git/HEAD", ".github/rules.md", "rules/.draft.md", "rules/ok.md"] {
            write(temp_dir.path(), file);
        }

        let found = find_matching_files(temp_dir.path(), &["**"]).unwrap();

        assert_eq!(found, vec!["rules/ok.md".to_string()]);
    }
}
