//! Registry test utilities

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use arm::config::{ConcurrencyConfig, RegistryKind};
use arm::ruleset::cache::ContentCache;
use arm::ruleset::error::RegistryError;
use arm::ruleset::manager::RegistryManager;
use arm::ruleset::pattern::matches_any_pattern;
use arm::ruleset::registry::{CachedRegistry, RulesetSource, Versioning, WritePolicy};
use arm::ruleset::types::{RefSnapshot, ResolvedVersion, RulesetFiles};

/// Package-style source holding every version's files in memory
pub struct InMemorySource {
    url: String,
    versions: HashMap<String, Vec<String>>,
    files: HashMap<(String, String), RulesetFiles>,
    fetches: Arc<AtomicUsize>,
}

impl InMemorySource {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            versions: HashMap::new(),
            files: HashMap::new(),
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_version(mut self, ruleset: &str, version: &str, files: &[(&str, &str)]) -> Self {
        self.versions
            .entry(ruleset.to_string())
            .or_default()
            .push(version.to_string());
        self.files.insert(
            (ruleset.to_string(), version.to_string()),
            files
                .iter()
                .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
                .collect::<BTreeMap<_, _>>(),
        );
        self
    }

    /// Shared counter of `fetch` calls that reached this source
    pub fn fetch_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetches)
    }
}

#[async_trait]
impl RulesetSource for InMemorySource {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Https
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn versioning(&self) -> Versioning {
        Versioning::Packages
    }

    fn write_policy(&self) -> WritePolicy {
        WritePolicy::Sync
    }

    async fn snapshot(&self, ruleset: &str) -> Result<RefSnapshot, RegistryError> {
        match self.versions.get(ruleset) {
            Some(versions) => Ok(RefSnapshot::from_versions(versions.clone())),
            None => Err(RegistryError::NotFound(ruleset.to_string())),
        }
    }

    async fn fetch(
        &self,
        ruleset: &str,
        version: &ResolvedVersion,
        patterns: &[String],
    ) -> Result<RulesetFiles, RegistryError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let files = self
            .files
            .get(&(ruleset.to_string(), version.to_string()))
            .ok_or_else(|| RegistryError::NotFound(format!("{}@{}", ruleset, version)))?;
        Ok(files
            .iter()
            .filter(|(path, _)| matches_any_pattern(path, patterns))
            .map(|(path, content)| (path.clone(), content.clone()))
            .collect())
    }
}

/// Create a content cache in a fresh temporary directory
pub fn create_test_cache() -> (TempDir, Arc<ContentCache>) {
    let temp_dir = TempDir::new().unwrap();
    let cache = ContentCache::new(temp_dir.path().join("cache"), Duration::from_secs(300));
    (temp_dir, Arc::new(cache))
}

/// Manager with one cached registry per `(name, source)`; the first is the default
pub fn create_test_manager(
    cache: Arc<ContentCache>,
    sources: Vec<(&str, InMemorySource)>,
) -> RegistryManager {
    let mut manager = RegistryManager::new(Arc::clone(&cache), ConcurrencyConfig::default());
    for (index, (name, source)) in sources.into_iter().enumerate() {
        let registry = CachedRegistry::new(name, source, Arc::clone(&cache));
        manager.insert(Arc::new(registry), None);
        if index == 0 {
            manager.set_default_registry(name);
        }
    }
    manager
}
