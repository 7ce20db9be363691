//! Named registries built from configuration, behind the operations the
//! installer needs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::config::{ArmConfig, ConcurrencyConfig};
use crate::ruleset::cache::ContentCache;
use crate::ruleset::error::{ConfigError, DownloadError, RegistryError};
use crate::ruleset::pattern::is_selectable_path;
use crate::ruleset::registries::build_registry;
use crate::ruleset::registry::Registry;
use crate::ruleset::types::{
    ContentSelector, InstalledRuleset, ResolvedVersion, RulesetFiles, content_checksum,
};

enum RegistryEntry {
    Ready {
        registry: Arc<dyn Registry>,
        concurrency: usize,
    },
    /// Construction failed; only dependencies on this registry fail
    Unavailable { error: Arc<ConfigError> },
}

pub struct RegistryManager {
    registries: IndexMap<String, RegistryEntry>,
    default_registry: Option<String>,
    concurrency: ConcurrencyConfig,
    cache: Arc<ContentCache>,
}

impl RegistryManager {
    /// Empty manager; add registries with [`RegistryManager::insert`]
    pub fn new(cache: Arc<ContentCache>, concurrency: ConcurrencyConfig) -> Self {
        Self {
            registries: IndexMap::new(),
            default_registry: None,
            concurrency,
            cache,
        }
    }

    /// Build every configured registry.
    ///
    /// A registry that fails to build is recorded as unavailable and logged;
    /// the others are still usable.
    pub fn from_config(config: &ArmConfig) -> Self {
        let cache = Arc::new(ContentCache::new(
            config.cache.root(),
            config.cache.versions_ttl(),
        ));
        Self::from_config_with_cache(config, cache)
    }

    pub fn from_config_with_cache(config: &ArmConfig, cache: Arc<ContentCache>) -> Self {
        if let Err(e) = cache.ensure_cache_dir() {
            warn!("Cache unavailable, continuing without it: {}", e);
        }

        let mut manager = Self::new(Arc::clone(&cache), config.concurrency.clone());
        manager.default_registry = config.default_registry_name().map(str::to_string);

        for (name, spec) in &config.registries {
            let mut spec = spec.clone();
            spec.name = name.clone();
            let entry = match build_registry(&spec, Arc::clone(&cache)) {
                Ok(registry) => RegistryEntry::Ready {
                    registry,
                    concurrency: config.concurrency.limit_for(&spec),
                },
                Err(e) => {
                    error!("Registry '{}' is unavailable: {}", name, e);
                    RegistryEntry::Unavailable { error: Arc::new(e) }
                }
            };
            manager.registries.insert(name.clone(), entry);
        }

        info!(
            "Loaded {} registries (default: {:?})",
            manager.registries.len(),
            manager.default_registry
        );
        manager
    }

    /// Register `registry` under its own name
    pub fn insert(&mut self, registry: Arc<dyn Registry>, concurrency_override: Option<usize>) {
        let concurrency = self
            .concurrency
            .limit_for_kind(registry.kind(), concurrency_override);
        self.registries.insert(
            registry.name(),
            RegistryEntry::Ready {
                registry,
                concurrency,
            },
        );
    }

    pub fn set_default_registry(&mut self, name: &str) {
        self.default_registry = Some(name.to_string());
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn registry_names(&self) -> Vec<String> {
        self.registries.keys().cloned().collect()
    }

    pub fn registry(&self, name: &str) -> Result<Arc<dyn Registry>, RegistryError> {
        match self.registries.get(name) {
            Some(RegistryEntry::Ready { registry, .. }) => Ok(Arc::clone(registry)),
            Some(RegistryEntry::Unavailable { error }) => Err(RegistryError::Misconfigured {
                registry: name.to_string(),
                source: Arc::clone(error),
            }),
            None => Err(ConfigError::UnknownRegistry(name.to_string()).into()),
        }
    }

    /// Worker pool size for a registry
    pub fn concurrency_limit(&self, registry: &str) -> usize {
        match self.registries.get(registry) {
            Some(RegistryEntry::Ready { concurrency, .. }) => *concurrency,
            _ => self.concurrency.default.unwrap_or(1).max(1),
        }
    }

    /// Split `registry/ruleset`; names without a known registry prefix go to
    /// the default registry.
    pub fn split_name<'a>(&self, name: &'a str) -> Result<(String, &'a str), ConfigError> {
        if let Some((prefix, ruleset)) = name.split_once('/')
            && self.registries.contains_key(prefix)
            && !ruleset.is_empty()
        {
            return Ok((prefix.to_string(), ruleset));
        }
        match &self.default_registry {
            Some(default) => Ok((default.clone(), name)),
            None => Err(ConfigError::NoDefaultRegistry(name.to_string())),
        }
    }

    fn split_with_context<'a>(
        &self,
        name: &'a str,
        spec: &str,
    ) -> Result<(String, &'a str), DownloadError> {
        self.split_name(name).map_err(|e| DownloadError {
            registry: String::new(),
            ruleset: name.to_string(),
            version: spec.to_string(),
            source: e.into(),
        })
    }

    fn locate(
        &self,
        name: &str,
        spec: &str,
    ) -> Result<(Arc<dyn Registry>, String, String), DownloadError> {
        let (registry_name, ruleset) = self.split_with_context(name, spec)?;
        let registry = self.registry(&registry_name).map_err(|source| DownloadError {
            registry: registry_name.clone(),
            ruleset: ruleset.to_string(),
            version: spec.to_string(),
            source,
        })?;
        Ok((registry, registry_name, ruleset.to_string()))
    }

    pub async fn list_versions(&self, name: &str) -> Result<Vec<String>, DownloadError> {
        let (registry, registry_name, ruleset) = self.locate(name, "")?;
        registry
            .list_versions(&ruleset)
            .await
            .map_err(|source| DownloadError {
                registry: registry_name,
                ruleset,
                version: String::new(),
                source,
            })
    }

    pub async fn resolve_version(
        &self,
        name: &str,
        spec: &str,
    ) -> Result<ResolvedVersion, DownloadError> {
        let (registry, registry_name, ruleset) = self.locate(name, spec)?;
        registry
            .resolve_version(&ruleset, spec)
            .await
            .map_err(|source| DownloadError {
                registry: registry_name,
                ruleset,
                version: spec.to_string(),
                source,
            })
    }

    /// Resolve, fetch (through the cache) and write one ruleset into `dest_dir`
    pub async fn download_ruleset(
        &self,
        name: &str,
        spec: &str,
        dest_dir: &Path,
        selector: &ContentSelector,
    ) -> Result<InstalledRuleset, DownloadError> {
        let (registry_name, ruleset) = self.split_with_context(name, spec)?;
        self.download(&registry_name, ruleset, spec, dest_dir, selector)
            .await
    }

    /// [`RegistryManager::download_ruleset`] with the registry already known
    pub async fn download(
        &self,
        registry_name: &str,
        ruleset: &str,
        spec: &str,
        dest_dir: &Path,
        selector: &ContentSelector,
    ) -> Result<InstalledRuleset, DownloadError> {
        let context = |source: RegistryError| DownloadError {
            registry: registry_name.to_string(),
            ruleset: ruleset.to_string(),
            version: spec.to_string(),
            source,
        };

        let registry = self.registry(registry_name).map_err(context)?;
        let resolved = registry
            .resolve_version(ruleset, spec)
            .await
            .map_err(context)?;
        debug!("{}/{}@{} resolved to {}", registry_name, ruleset, spec, resolved);

        let files = registry
            .get_files(ruleset, &resolved, selector)
            .await
            .map_err(context)?;

        write_files(dest_dir, &files).await.map_err(context)?;

        info!(
            "Installed {} files of {}/{}@{} into {}",
            files.len(),
            registry_name,
            ruleset,
            resolved,
            dest_dir.display()
        );

        Ok(InstalledRuleset {
            name: ruleset.to_string(),
            registry: registry_name.to_string(),
            resolved_version: resolved,
            checksum: content_checksum(&files),
            files: files.into_keys().collect(),
        })
    }

    /// Close every registry, logging failures
    pub async fn close(&self) {
        for (name, entry) in &self.registries {
            if let RegistryEntry::Ready { registry, .. } = entry
                && let Err(e) = registry.close().await
            {
                warn!("Failed to close registry '{}': {}", name, e);
            }
        }
    }
}

async fn write_files(dest_dir: &Path, files: &RulesetFiles) -> Result<(), RegistryError> {
    for (relative, content) in files {
        if !is_selectable_path(relative) {
            warn!("Skipping unsafe path {:?}", relative);
            continue;
        }
        let target: PathBuf = dest_dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RegistryKind, RegistrySpec};
    use crate::ruleset::error::LocalRepositoryError;
    use crate::ruleset::registry::MockRegistry;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(temp_dir: &TempDir) -> RegistryManager {
        let cache = Arc::new(ContentCache::new(
            temp_dir.path().join("cache"),
            Duration::from_secs(300),
        ));
        RegistryManager::new(cache, ConcurrencyConfig::default())
    }

    fn mock_registry(name: &'static str) -> MockRegistry {
        let mut registry = MockRegistry::new();
        registry.expect_name().return_const(name.to_string());
        registry.expect_kind().return_const(RegistryKind::Git);
        registry
    }

    #[test]
    fn split_name_uses_prefix_or_default_registry() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = manager(&temp_dir);
        manager.insert(Arc::new(mock_registry("main")), None);
        manager.insert(Arc::new(mock_registry("team")), None);

        assert!(matches!(
            manager.split_name("python"),
            Err(ConfigError::NoDefaultRegistry(_))
        ));

        manager.set_default_registry("main");
        assert_eq!(manager.split_name("team/python").unwrap(), ("team".to_string(), "python"));
        assert_eq!(manager.split_name("python").unwrap(), ("main".to_string(), "python"));
        assert_eq!(
            manager.split_name("group/python").unwrap(),
            ("main".to_string(), "group/python")
        );
    }

    #[tokio::test]
    async fn download_ruleset_writes_files_and_reports_checksum() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("dest");
        let mut registry = mock_registry("main");
        registry
            .expect_resolve_version()
            .withf(|ruleset, spec| ruleset == "python" && spec == "^1.0.0")
            .times(1)
            .returning(|_, _| Ok(ResolvedVersion::new("v1.2.0")));
        registry
            .expect_get_files()
            .times(1)
            .returning(|_, _, _| {
                Ok(BTreeMap::from([
                    ("rules/a.md".to_string(), b"alpha".to_vec()),
                    ("rules/nested/b.md".to_string(), b"beta".to_vec()),
                ]))
            });
        let mut manager = manager(&temp_dir);
        manager.insert(Arc::new(registry), None);

        let installed = manager
            .download_ruleset("main/python", "^1.0.0", &dest, &ContentSelector::default())
            .await
            .unwrap();

        assert_eq!(installed.name, "python");
        assert_eq!(installed.registry, "main");
        assert_eq!(installed.resolved_version, ResolvedVersion::new("v1.2.0"));
        assert!(installed.checksum.starts_with("sha256:"));
        assert_eq!(installed.files, vec!["rules/a.md", "rules/nested/b.md"]);
        assert_eq!(std::fs::read(dest.join("rules/nested/b.md")).unwrap(), b"beta");
    }

    #[tokio::test]
    async fn download_ruleset_wraps_errors_with_context() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = mock_registry("main");
        registry
            .expect_resolve_version()
            .returning(|_, spec| {
                Err(crate::ruleset::error::ResolveError::NoMatchingVersion {
                    constraint: spec.to_string(),
                }
                .into())
            });
        let mut manager = manager(&temp_dir);
        manager.insert(Arc::new(registry), None);

        let error = manager
            .download_ruleset("main/python", "^9.0.0", temp_dir.path(), &ContentSelector::default())
            .await
            .unwrap_err();

        assert_eq!(
            error.to_string(),
            "main/python@^9.0.0: No versions satisfy constraint '^9.0.0'"
        );
    }

    #[tokio::test]
    async fn unavailable_registry_only_fails_its_own_dependencies() {
        let temp_dir = TempDir::new().unwrap();
        let good = TempDir::new().unwrap();
        let config = ArmConfig {
            registries: IndexMap::from([
                (
                    "broken".to_string(),
                    RegistrySpec::new(
                        "broken",
                        RegistryKind::LocalGit,
                        &temp_dir.path().join("missing").to_string_lossy(),
                    ),
                ),
                (
                    "local".to_string(),
                    RegistrySpec::new("local", RegistryKind::Local, &good.path().to_string_lossy()),
                ),
            ]),
            default_registry: Some("local".to_string()),
            ..Default::default()
        };
        let cache = Arc::new(ContentCache::new(
            temp_dir.path().join("cache"),
            Duration::from_secs(300),
        ));
        let manager = RegistryManager::from_config_with_cache(&config, cache);

        let broken = manager.list_versions("broken/python").await.unwrap_err();
        let RegistryError::Misconfigured { registry, source } = &broken.source else {
            panic!("expected misconfigured registry, got {broken}");
        };
        assert_eq!(registry, "broken");
        assert!(matches!(
            source.as_ref(),
            ConfigError::LocalRepository(LocalRepositoryError::Moved { .. })
        ));

        let versions = manager.list_versions("python").await.unwrap();
        assert_eq!(versions, vec!["latest"]);
    }

    #[test]
    fn concurrency_limit_uses_override_then_type_fallback() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = manager(&temp_dir);
        manager.insert(Arc::new(mock_registry("main")), Some(7));

        assert_eq!(manager.concurrency_limit("main"), 7);

        manager.insert(Arc::new(mock_registry("other")), None);
        assert_eq!(
            manager.concurrency_limit("other"),
            RegistryKind::Git.fallback_concurrency()
        );
    }
}
