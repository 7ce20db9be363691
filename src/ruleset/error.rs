use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::config::RegistryKind;

const NOT_FOUND_HINT: &str = "check the path in the registry configuration";
const INVALID_HINT: &str = "point the registry at the root of a git repository";
const MOVED_HINT: &str = "the directory was moved or deleted; update the registry path";
const CORRUPTED_HINT: &str = "run `git fsck` or re-clone the repository";
const PERMISSION_HINT: &str = "grant read access to the directory or run as a different user";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Registry '{registry}' has no url")]
    MissingUrl { registry: String },

    #[error("Registry '{registry}' has an invalid url '{url}': {reason}")]
    InvalidUrl {
        registry: String,
        url: String,
        reason: String,
    },

    #[error("Registry '{registry}' timeout must be greater than zero")]
    InvalidTimeout { registry: String },

    #[error("Registry '{registry}' concurrency must be greater than zero")]
    InvalidConcurrency { registry: String },

    #[error("Unknown registry: {0}")]
    UnknownRegistry(String),

    #[error("No default registry configured for '{0}'; use <registry>/<ruleset>")]
    NoDefaultRegistry(String),

    #[error("Failed to create HTTP client for registry '{registry}': {source}")]
    HttpClient {
        registry: String,
        #[source]
        source: reqwest::Error,
    },

    #[error(transparent)]
    LocalRepository(#[from] LocalRepositoryError),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No versions satisfy constraint '{constraint}'")]
    NoMatchingVersion { constraint: String },

    #[error("Version '{0}' not found")]
    VersionNotFound(String),

    #[error("Branch or ref '{0}' not found")]
    RefNotFound(String),

    #[error("Remote has no default branch")]
    NoDefaultBranch,

    #[error("No versions available")]
    NoVersions,

    #[error("Invalid version specifier '{0}'")]
    InvalidSpecifier(String),

    #[error("Specifier '{spec}' is not supported by {kind} registries")]
    Unsupported { spec: String, kind: RegistryKind },
}

/// Problems with a registry that lives on the local filesystem
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocalRepositoryError {
    #[error("Repository not found at {}: {}", .path.display(), NOT_FOUND_HINT)]
    NotFound { path: PathBuf },

    #[error("Invalid repository at {} ({reason}): {}", .path.display(), INVALID_HINT)]
    Invalid { path: PathBuf, reason: String },

    #[error("Repository moved from {}: {}", .path.display(), MOVED_HINT)]
    Moved { path: PathBuf },

    #[error("Corrupted repository at {} ({message}): {}", .path.display(), CORRUPTED_HINT)]
    Corrupted { path: PathBuf, message: String },

    #[error("Permission denied for {}: {}", .path.display(), PERMISSION_HINT)]
    PermissionDenied { path: PathBuf },
}

impl LocalRepositoryError {
    /// What the user can do about it
    pub fn remediation(&self) -> &'static str {
        match self {
            LocalRepositoryError::NotFound { .. } => NOT_FOUND_HINT,
            LocalRepositoryError::Invalid { .. } => INVALID_HINT,
            LocalRepositoryError::Moved { .. } => MOVED_HINT,
            LocalRepositoryError::Corrupted { .. } => CORRUPTED_HINT,
            LocalRepositoryError::PermissionDenied { .. } => PERMISSION_HINT,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt cache index {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Refusing to cache content for unresolved version '{0}'")]
    UnresolvedVersion(String),

    #[error("Unsafe cache path component '{0}'")]
    UnsafePath(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Rate limited: retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("git {operation} failed: {message}")]
    Git {
        operation: &'static str,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    LocalRepository(#[from] LocalRepositoryError),

    #[error("Registry '{registry}' cannot list versions; specify an exact version")]
    ExactVersionRequired { registry: String },

    #[error("Registry '{registry}' is unavailable: {reason}")]
    Unavailable { registry: String, reason: String },

    /// The registry could not be built from its configuration
    #[error("Registry '{registry}' is unavailable: {source}")]
    Misconfigured {
        registry: String,
        #[source]
        source: Arc<ConfigError>,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),
}

/// A failure while installing one ruleset, with the context it happened in
#[derive(Debug, Error)]
#[error("{registry}/{ruleset}@{version}: {source}")]
pub struct DownloadError {
    pub registry: String,
    pub ruleset: String,
    pub version: String,
    #[source]
    pub source: RegistryError,
}

/// Every job in a batch failed
#[derive(Debug, Error)]
#[error("All {total} downloads failed")]
pub struct BatchError {
    pub total: usize,
}
