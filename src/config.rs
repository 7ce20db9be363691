use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::ruleset::error::ConfigError;

// =============================================================================
// Time-related constants
// =============================================================================

/// Freshness window for ref metadata in the versions index (5 minutes)
pub const DEFAULT_VERSIONS_TTL_SECS: u64 = 5 * 60;

/// Default per-request timeout for registries that do not set one (60 seconds)
pub const DEFAULT_REGISTRY_TIMEOUT_SECS: u64 = 60;

/// Upper bound for a single git subprocess (5 minutes)
pub const GIT_OPERATION_TIMEOUT_SECS: u64 = 300;

/// Page size used when walking paginated REST listings
pub const API_PAGE_SIZE: usize = 100;

/// Hard stop for paginated listings so a misbehaving server cannot loop forever
pub const API_MAX_PAGES: usize = 50;

/// Kind of backend a registry talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryKind {
    /// Remote git repository (GitHub/GitLab API or full clone)
    Git,
    /// GitLab generic package registry
    Gitlab,
    /// S3 bucket, fixed object keys
    S3,
    /// Generic HTTP server, fixed object keys
    Http,
    /// HTTPS server publishing a `manifest.json`
    Https,
    /// Plain local directory
    Local,
    /// Local git checkout
    LocalGit,
}

impl RegistryKind {
    /// Returns the string representation used in cache paths and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryKind::Git => "git",
            RegistryKind::Gitlab => "gitlab",
            RegistryKind::S3 => "s3",
            RegistryKind::Http => "http",
            RegistryKind::Https => "https",
            RegistryKind::Local => "local",
            RegistryKind::LocalGit => "local-git",
        }
    }

    /// Concurrency used when neither the source nor the config sets one
    pub fn fallback_concurrency(&self) -> usize {
        match self {
            RegistryKind::Gitlab => 2,
            RegistryKind::S3 => 8,
            RegistryKind::Http | RegistryKind::Https => 4,
            RegistryKind::Local | RegistryKind::LocalGit => 10,
            RegistryKind::Git => 3,
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(RegistryKind::Git),
            "gitlab" => Ok(RegistryKind::Gitlab),
            "s3" => Ok(RegistryKind::S3),
            "http" => Ok(RegistryKind::Http),
            "https" => Ok(RegistryKind::Https),
            "local" => Ok(RegistryKind::Local),
            "local-git" => Ok(RegistryKind::LocalGit),
            _ => Err(()),
        }
    }
}

/// How a git registry talks to its remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitMode {
    /// REST API first, full clone as fallback
    Api,
    /// Full clone only
    Clone,
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ArmConfig {
    pub registries: IndexMap<String, RegistrySpec>,
    pub default_registry: Option<String>,
    pub concurrency: ConcurrencyConfig,
    pub cache: CacheConfig,
}

impl ArmConfig {
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: ArmConfig = serde_json::from_str(content)?;
        for (name, spec) in config.registries.iter_mut() {
            spec.name = name.clone();
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Name of the registry used for dependency names without a `registry/` prefix
    ///
    /// Falls back to the only configured registry when exactly one exists.
    pub fn default_registry_name(&self) -> Option<&str> {
        if let Some(name) = &self.default_registry {
            return Some(name.as_str());
        }
        if self.registries.len() == 1 {
            return self.registries.keys().next().map(String::as_str);
        }
        None
    }
}

/// One named source of rulesets
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    /// Filled from the key in `registries`
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RegistryKind,
    pub url: String,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub mode: Option<GitMode>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl RegistrySpec {
    pub fn new(name: &str, kind: RegistryKind, url: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            url: url.to_string(),
            auth: None,
            timeout_secs: None,
            concurrency: None,
            mode: None,
            api_url: None,
            region: None,
            project_id: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_REGISTRY_TIMEOUT_SECS))
    }

    pub fn token(&self) -> Option<String> {
        self.auth.as_ref().and_then(AuthConfig::resolve_token)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingUrl {
                registry: self.name.clone(),
            });
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidTimeout {
                registry: self.name.clone(),
            });
        }
        if self.concurrency == Some(0) {
            return Err(ConfigError::InvalidConcurrency {
                registry: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Credentials for a registry
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    pub token: Option<String>,
    /// Name of an environment variable holding the token
    pub token_env: Option<String>,
}

impl AuthConfig {
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| {
                self.token_env
                    .as_ref()
                    .and_then(|var| std::env::var(var).ok())
            })
            .filter(|token| !token.is_empty())
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    /// Applies to every registry type without its own entry
    pub default: Option<usize>,
    /// Per registry type defaults, keyed by type name
    pub per_type: HashMap<RegistryKind, usize>,
}

impl ConcurrencyConfig {
    /// Pool size for a registry: source override, then type default, then
    /// global default, then the built-in per-type fallback. A zero at any
    /// layer counts as unset.
    pub fn limit_for(&self, spec: &RegistrySpec) -> usize {
        self.limit_for_kind(spec.kind, spec.concurrency)
    }

    pub fn limit_for_kind(&self, kind: RegistryKind, source_override: Option<usize>) -> usize {
        let set = |limit: &usize| *limit > 0;
        source_override
            .filter(set)
            .or_else(|| self.per_type.get(&kind).copied().filter(set))
            .or(self.default.filter(set))
            .unwrap_or_else(|| kind.fallback_concurrency())
    }
}

/// Cache-related configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub dir: Option<PathBuf>,
    pub versions_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            versions_ttl_secs: DEFAULT_VERSIONS_TTL_SECS,
        }
    }
}

impl CacheConfig {
    pub fn root(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(cache_dir)
    }

    pub fn versions_ttl(&self) -> Duration {
        Duration::from_secs(self.versions_ttl_secs)
    }
}

/// Returns the path to the cache directory for arm.
/// Uses $XDG_CACHE_HOME/arm if XDG_CACHE_HOME is set,
/// otherwise falls back to ~/.cache/arm,
/// or ./arm if neither is available.
pub fn cache_dir() -> PathBuf {
    cache_dir_with_env(std::env::var("XDG_CACHE_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the log file.
pub fn log_path() -> PathBuf {
    cache_dir().join("arm.log")
}

fn cache_dir_with_env(xdg_cache_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let cache_dir = xdg_cache_home
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".cache")))
        .unwrap_or_else(|| PathBuf::from("."));

    cache_dir.join("arm")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serial_test::serial;

    #[test]
    fn arm_config_from_partial_object_uses_defaults_for_missing_fields() {
        let config = ArmConfig::from_json_str(
            r#"{
                "registries": {
                    "main": { "type": "git", "url": "https://github.com/acme/rules" }
                }
            }"#,
        )
        .unwrap();

        let main = &config.registries["main"];
        assert_eq!(main.name, "main");
        assert_eq!(main.kind, RegistryKind::Git);
        assert_eq!(main.timeout(), Duration::from_secs(DEFAULT_REGISTRY_TIMEOUT_SECS));
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.default_registry_name(), Some("main"));
    }

    #[test]
    fn arm_config_from_full_object_parses_all_fields() {
        let config = ArmConfig::from_json_str(
            r#"{
                "defaultRegistry": "pkgs",
                "registries": {
                    "pkgs": {
                        "type": "gitlab",
                        "url": "https://gitlab.example.com",
                        "projectId": "42",
                        "auth": { "token": "secret" },
                        "timeoutSecs": 10,
                        "concurrency": 1
                    },
                    "bucket": { "type": "s3", "url": "s3://rules/prefix", "region": "eu-west-1" }
                },
                "concurrency": { "default": 6, "perType": { "s3": 12 } },
                "cache": { "dir": "/tmp/arm-cache", "versionsTtlSecs": 30 }
            }"#,
        )
        .unwrap();

        let pkgs = &config.registries["pkgs"];
        assert_eq!(pkgs.kind, RegistryKind::Gitlab);
        assert_eq!(pkgs.project_id.as_deref(), Some("42"));
        assert_eq!(pkgs.token().as_deref(), Some("secret"));
        assert_eq!(pkgs.timeout(), Duration::from_secs(10));
        assert_eq!(config.registries["bucket"].region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.concurrency.per_type[&RegistryKind::S3], 12);
        assert_eq!(config.cache.root(), PathBuf::from("/tmp/arm-cache"));
        assert_eq!(config.cache.versions_ttl(), Duration::from_secs(30));
        assert_eq!(config.default_registry_name(), Some("pkgs"));
    }

    #[test]
    fn arm_config_rejects_unknown_registry_type() {
        let result = ArmConfig::from_json_str(
            r#"{ "registries": { "x": { "type": "ftp", "url": "ftp://example.com" } } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[rstest]
    #[case(Some(5), Some(7), Some(9), 5)] // source override wins
    #[case(None, Some(7), Some(9), 7)] // then per-type default
    #[case(None, None, Some(9), 9)] // then global default
    #[case(None, None, None, 2)] // then hardcoded gitlab fallback
    #[case(Some(0), Some(7), Some(9), 7)]
    #[case(None, Some(0), Some(9), 9)]
    #[case(Some(0), Some(0), Some(0), 2)]
    fn limit_for_follows_precedence(
        #[case] source: Option<usize>,
        #[case] per_type: Option<usize>,
        #[case] global: Option<usize>,
        #[case] expected: usize,
    ) {
        let mut spec = RegistrySpec::new("pkgs", RegistryKind::Gitlab, "https://gitlab.com");
        spec.concurrency = source;
        let mut config = ConcurrencyConfig {
            default: global,
            ..Default::default()
        };
        if let Some(limit) = per_type {
            config.per_type.insert(RegistryKind::Gitlab, limit);
        }

        assert_eq!(config.limit_for(&spec), expected);
    }

    #[rstest]
    #[case(RegistryKind::Gitlab, 2)]
    #[case(RegistryKind::S3, 8)]
    #[case(RegistryKind::Http, 4)]
    #[case(RegistryKind::Local, 10)]
    #[case(RegistryKind::Git, 3)]
    fn fallback_concurrency_matches_registry_kind(#[case] kind: RegistryKind, #[case] expected: usize) {
        assert_eq!(kind.fallback_concurrency(), expected);
    }

    #[rstest]
    #[case("", true)]
    #[case("https://example.com", false)]
    fn validate_requires_url(#[case] url: &str, #[case] fails: bool) {
        let spec = RegistrySpec::new("r", RegistryKind::Https, url);
        assert_eq!(spec.validate().is_err(), fails);
    }

    #[test]
    #[serial]
    fn auth_token_is_read_from_named_environment_variable() {
        // SAFETY: serialized with other environment-touching tests
        unsafe { std::env::set_var("ARM_TEST_TOKEN", "from-env") };
        let auth = AuthConfig {
            token: None,
            token_env: Some("ARM_TEST_TOKEN".to_string()),
        };
        assert_eq!(auth.resolve_token().as_deref(), Some("from-env"));
        unsafe { std::env::remove_var("ARM_TEST_TOKEN") };
        assert_eq!(auth.resolve_token(), None);
    }

    #[test]
    fn cache_dir_with_env_uses_xdg_cache_home_when_set() {
        let path = cache_dir_with_env(
            Some("/tmp/test-cache".to_string()),
            Some(PathBuf::from("/home/user")),
        );

        assert_eq!(path, PathBuf::from("/tmp/test-cache/arm"));
    }

    #[test]
    fn cache_dir_with_env_falls_back_to_home_cache() {
        let path = cache_dir_with_env(None, Some(PathBuf::from("/home/user")));

        assert_eq!(path, PathBuf::from("/home/user/.cache/arm"));
    }

    #[test]
    fn cache_dir_with_env_falls_back_to_current_dir_when_no_dirs_available() {
        let path = cache_dir_with_env(None, None);
        assert_eq!(path, PathBuf::from("./arm"));
    }
}
