//! On-disk content cache shared by every registry
//!
//! Layout:
//!
//! ```text
//! <root>/<registryType>/<registryID>/
//! ├── repository/                      # git clone (git registries only)
//! ├── rulesets/<name>/<resolvedVersion>/<files...>
//! ├── versions.json                    # ruleset -> VersionsIndex
//! └── metadata.json                    # registry info + per-entry bookkeeping
//! ```
//!
//! File content is addressed by resolved version and never expires. Ref
//! metadata in `versions.json` is fresh for a TTL since branches and tags can
//! move upstream.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::RegistryKind;
use crate::ruleset::error::CacheError;
use crate::ruleset::pattern::{is_selectable_path, matches_any_pattern};
use crate::ruleset::types::{MATCH_ALL, RefSnapshot, ResolvedVersion, RulesetFiles};

const VERSIONS_FILE: &str = "versions.json";
const METADATA_FILE: &str = "metadata.json";
const RULESETS_DIR: &str = "rulesets";
const REPOSITORY_DIR: &str = "repository";

/// Identifies one registry inside the cache
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub kind: RegistryKind,
    pub url: String,
}

impl RegistryKey {
    pub fn new(kind: RegistryKind, url: &str) -> Self {
        Self {
            kind,
            url: url.to_string(),
        }
    }

    /// First 16 hex characters of the SHA-256 of the registry URL
    pub fn registry_id(&self) -> String {
        let digest = Sha256::digest(self.url.trim_end_matches('/').as_bytes());
        hex::encode(digest)[..16].to_string()
    }
}

/// Known refs of one ruleset and the specifiers already resolved against them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionsIndex {
    pub snapshot: RefSnapshot,
    /// Specifier text to resolved version; never contains `latest`
    pub resolutions: BTreeMap<String, ResolvedVersion>,
    /// Milliseconds since the UNIX epoch
    pub fetched_at: i64,
}

/// Bookkeeping for one (ruleset, resolved version) entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Patterns whose matches are fully present in the entry
    pub patterns: BTreeSet<String>,
    pub file_count: usize,
    pub size_bytes: u64,
    pub fetched_at: i64,
    pub accessed_at: i64,
    pub access_count: u64,
}

impl EntryMetadata {
    fn satisfies(&self, patterns: &[String]) -> bool {
        self.patterns.contains(MATCH_ALL) || patterns.iter().all(|p| self.patterns.contains(p))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryMetadata {
    registry_type: String,
    registry_url: String,
    created_at: i64,
    updated_at: i64,
    /// ruleset -> resolved version -> entry
    rulesets: BTreeMap<String, BTreeMap<String, EntryMetadata>>,
}

/// One cached entry, for inspection tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesetStats {
    pub registry_type: String,
    pub registry_url: String,
    pub ruleset: String,
    pub version: String,
    #[serde(flatten)]
    pub entry: EntryMetadata,
}

type IndexLocks = HashMap<(RegistryKey, String), Arc<tokio::sync::Mutex<()>>>;

pub struct ContentCache {
    root: PathBuf,
    versions_ttl: Duration,
    /// Serializes resolution per (registry type, registry URL, ruleset)
    index_locks: Mutex<IndexLocks>,
    /// Serializes rewrites of one registry's JSON files
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>, versions_ttl: Duration) -> Self {
        Self {
            root: root.into(),
            versions_ttl,
            index_locks: Mutex::new(HashMap::new()),
            file_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get current timestamp in milliseconds since UNIX epoch
    fn current_timestamp_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Create the storage root if it does not exist yet
    pub fn ensure_cache_dir(&self) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.root).map_err(|source| CacheError::Io {
            path: self.root.clone(),
            source,
        })?;
        debug!("Cache directory ready at {:?}", self.root);
        Ok(())
    }

    pub fn registry_dir(&self, key: &RegistryKey) -> PathBuf {
        self.root.join(key.kind.as_str()).join(key.registry_id())
    }

    /// Where git registries keep their clone
    pub fn repository_dir(&self, key: &RegistryKey) -> PathBuf {
        self.registry_dir(key).join(REPOSITORY_DIR)
    }

    fn version_dir(
        &self,
        key: &RegistryKey,
        ruleset: &str,
        version: &ResolvedVersion,
    ) -> Result<PathBuf, CacheError> {
        if version.is_unresolved() {
            return Err(CacheError::UnresolvedVersion(version.to_string()));
        }
        Ok(self
            .registry_dir(key)
            .join(RULESETS_DIR)
            .join(path_component(ruleset)?)
            .join(path_component(version.as_str())?))
    }

    /// Whether ref metadata fetched at `index.fetched_at` may still be used
    pub fn is_fresh(&self, index: &VersionsIndex) -> bool {
        let age_ms = Self::current_timestamp_ms().saturating_sub(index.fetched_at);
        age_ms >= 0 && (age_ms as u128) < self.versions_ttl.as_millis()
    }

    /// Hold this while resolving a ruleset so concurrent jobs do not race on
    /// the same versions index entry.
    pub async fn lock_ruleset(
        &self,
        key: &RegistryKey,
        ruleset: &str,
    ) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .index_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry((key.clone(), ruleset.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    fn registry_file_lock(&self, dir: &Path) -> Result<Arc<Mutex<()>>, CacheError> {
        let mut locks = self.file_locks.lock().map_err(|_| CacheError::LockPoisoned)?;
        Ok(locks.entry(dir.to_path_buf()).or_default().clone())
    }

    fn lock<'a>(lock: &'a Mutex<()>) -> Result<MutexGuard<'a, ()>, CacheError> {
        lock.lock().map_err(|_| CacheError::LockPoisoned)
    }

    pub fn get_versions(
        &self,
        key: &RegistryKey,
        ruleset: &str,
    ) -> Result<Option<VersionsIndex>, CacheError> {
        let dir = self.registry_dir(key);
        let lock = self.registry_file_lock(&dir)?;
        let _guard = Self::lock(&lock)?;

        let mut all: BTreeMap<String, VersionsIndex> = read_json(&dir.join(VERSIONS_FILE))?;
        Ok(all.remove(ruleset))
    }

    /// Read-modify-write one ruleset's versions index.
    ///
    /// The whole file is re-read under the registry lock, so updates to other
    /// rulesets made concurrently are preserved.
    pub fn update_versions<F>(
        &self,
        key: &RegistryKey,
        ruleset: &str,
        update: F,
    ) -> Result<VersionsIndex, CacheError>
    where
        F: FnOnce(&mut VersionsIndex),
    {
        let dir = self.registry_dir(key);
        let lock = self.registry_file_lock(&dir)?;
        let _guard = Self::lock(&lock)?;

        let path = dir.join(VERSIONS_FILE);
        let mut all: BTreeMap<String, VersionsIndex> = read_json(&path)?;
        let index = all.entry(ruleset.to_string()).or_default();
        update(index);
        index.resolutions.retain(|spec, _| !spec.eq_ignore_ascii_case("latest"));
        let updated = index.clone();

        write_json(&path, &all)?;
        self.touch_registry_metadata(key, &dir, |_| {})?;
        debug!(
            "Updated versions index for {}:{}/{}",
            key.kind, key.url, ruleset
        );
        Ok(updated)
    }

    /// Returns the stored files matching `patterns`, or `None` unless every
    /// pattern was satisfied by an earlier store for this exact version.
    pub fn get_ruleset_files(
        &self,
        key: &RegistryKey,
        ruleset: &str,
        version: &ResolvedVersion,
        patterns: &[String],
    ) -> Result<Option<RulesetFiles>, CacheError> {
        let version_dir = self.version_dir(key, ruleset, version)?;
        let dir = self.registry_dir(key);

        let entry = {
            let lock = self.registry_file_lock(&dir)?;
            let _guard = Self::lock(&lock)?;
            let metadata: RegistryMetadata = read_json(&dir.join(METADATA_FILE))?;
            metadata
                .rulesets
                .get(ruleset)
                .and_then(|versions| versions.get(version.as_str()))
                .cloned()
        };

        let Some(entry) = entry else {
            return Ok(None);
        };
        if !entry.satisfies(patterns) {
            debug!(
                "Cache entry {}@{} does not cover {:?}",
                ruleset, version, patterns
            );
            return Ok(None);
        }
        if !version_dir.is_dir() {
            warn!("Cache entry {}@{} lost its files", ruleset, version);
            return Ok(None);
        }

        let files = read_tree(&version_dir, patterns)?;

        if let Err(e) = self.record_access(key, ruleset, version) {
            warn!("Failed to record cache access for {}@{}: {}", ruleset, version, e);
        }

        Ok(Some(files))
    }

    /// Persist `files` fetched with `patterns` under the resolved version.
    ///
    /// Content accumulates: storing a different selector for the same version
    /// adds its files and patterns to what is already there.
    pub fn store_ruleset_files(
        &self,
        key: &RegistryKey,
        ruleset: &str,
        version: &ResolvedVersion,
        patterns: &[String],
        files: &RulesetFiles,
    ) -> Result<(), CacheError> {
        let version_dir = self.version_dir(key, ruleset, version)?;
        create_dir_all(&version_dir)?;

        for (relative, content) in files {
            if !is_selectable_path(relative) {
                warn!("Not caching unsafe path {:?} for {}@{}", relative, ruleset, version);
                continue;
            }
            write_atomic(&version_dir.join(relative), content)?;
        }

        let dir = self.registry_dir(key);
        let lock = self.registry_file_lock(&dir)?;
        let _guard = Self::lock(&lock)?;
        let (file_count, size_bytes) = tree_stats(&version_dir)?;

        let now = Self::current_timestamp_ms();
        self.touch_registry_metadata(key, &dir, |metadata| {
            let entry = metadata
                .rulesets
                .entry(ruleset.to_string())
                .or_default()
                .entry(version.to_string())
                .or_default();
            entry.patterns.extend(patterns.iter().cloned());
            entry.file_count = file_count;
            entry.size_bytes = size_bytes;
            entry.fetched_at = now;
            if entry.accessed_at == 0 {
                entry.accessed_at = now;
            }
        })?;

        info!(
            "Cached {} files ({} bytes) for {}@{}",
            file_count, size_bytes, ruleset, version
        );
        Ok(())
    }

    fn record_access(
        &self,
        key: &RegistryKey,
        ruleset: &str,
        version: &ResolvedVersion,
    ) -> Result<(), CacheError> {
        let dir = self.registry_dir(key);
        let lock = self.registry_file_lock(&dir)?;
        let _guard = Self::lock(&lock)?;

        let now = Self::current_timestamp_ms();
        self.touch_registry_metadata(key, &dir, |metadata| {
            if let Some(entry) = metadata
                .rulesets
                .get_mut(ruleset)
                .and_then(|versions| versions.get_mut(version.as_str()))
            {
                entry.accessed_at = now;
                entry.access_count += 1;
            }
        })
    }

    /// Caller must hold the registry file lock
    fn touch_registry_metadata<F>(&self, key: &RegistryKey, dir: &Path, update: F) -> Result<(), CacheError>
    where
        F: FnOnce(&mut RegistryMetadata),
    {
        let path = dir.join(METADATA_FILE);
        let mut metadata: RegistryMetadata = read_json(&path)?;
        let now = Self::current_timestamp_ms();
        if metadata.created_at == 0 {
            metadata.created_at = now;
        }
        metadata.registry_type = key.kind.as_str().to_string();
        metadata.registry_url = key.url.clone();
        metadata.updated_at = now;
        update(&mut metadata);
        write_json(&path, &metadata)
    }

    /// Every cached entry across all registries, ordered by registry then ruleset
    pub fn list_entries(&self) -> Result<Vec<RulesetStats>, CacheError> {
        let mut stats = Vec::new();
        if !self.root.is_dir() {
            return Ok(stats);
        }

        let metadata_files = WalkDir::new(&self.root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name() == METADATA_FILE);

        for file in metadata_files {
            let metadata: RegistryMetadata = read_json(file.path())?;
            for (ruleset, versions) in metadata.rulesets {
                for (version, entry) in versions {
                    stats.push(RulesetStats {
                        registry_type: metadata.registry_type.clone(),
                        registry_url: metadata.registry_url.clone(),
                        ruleset: ruleset.clone(),
                        version,
                        entry,
                    });
                }
            }
        }

        stats.sort_by(|a, b| {
            (&a.registry_type, &a.registry_url, &a.ruleset, &a.version)
                .cmp(&(&b.registry_type, &b.registry_url, &b.ruleset, &b.version))
        });
        Ok(stats)
    }
}

/// Encode a ruleset name or version as a single safe directory name
fn path_component(value: &str) -> Result<String, CacheError> {
    if value.is_empty() || value == "." || value == ".." {
        return Err(CacheError::UnsafePath(value.to_string()));
    }
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' | b'+' | b'@' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    if encoded.starts_with('.') {
        encoded.replace_range(0..1, "%2E");
    }
    Ok(encoded)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn create_dir_all(path: &Path) -> Result<(), CacheError> {
    std::fs::create_dir_all(path).map_err(io_error(path))
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, CacheError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| CacheError::Json {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(io_error(path)(e)),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| CacheError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)
}

/// Write to a temporary sibling and rename over the target, so readers never
/// observe a partial file and concurrent identical writes are harmless.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), CacheError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(io_error(parent))?;
    temp.write_all(content).map_err(io_error(path))?;
    temp.persist(path).map_err(|e| io_error(path)(e.error))?;
    Ok(())
}

fn read_tree(dir: &Path, patterns: &[String]) -> Result<RulesetFiles, CacheError> {
    let mut files = RulesetFiles::new();
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| io_error(dir)(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative) = relative_slash_path(dir, entry.path()) else {
            continue;
        };
        if !is_selectable_path(&relative) || !matches_any_pattern(&relative, patterns) {
            continue;
        }
        let content = std::fs::read(entry.path()).map_err(io_error(entry.path()))?;
        files.insert(relative, content);
    }
    Ok(files)
}

fn tree_stats(dir: &Path) -> Result<(usize, u64), CacheError> {
    let mut count = 0;
    let mut size = 0;
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| io_error(dir)(std::io::Error::other(e)))?;
        if entry.file_type().is_file()
            && relative_slash_path(dir, entry.path()).is_some_and(|p| is_selectable_path(&p))
        {
            count += 1;
            size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok((count, size))
}

fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Option<Vec<&str>> = relative.iter().map(|s| s.to_str()).collect();
    Some(segments?.join("/"))
}
