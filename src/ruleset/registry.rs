//! Registry trait and the caching layer every backend sits behind

use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use crate::config::RegistryKind;
use crate::ruleset::cache::{ContentCache, RegistryKey, VersionsIndex};
use crate::ruleset::error::{RegistryError, ResolveError};
use crate::ruleset::resolver::{VersionResolver, VersionSpecifier};
use crate::ruleset::types::{ContentSelector, LATEST, RefSnapshot, ResolvedVersion, RulesetFiles};

/// Identifier returned for unversioned local directories
pub const WORKING_TREE: &str = "working-tree";

/// Trait for listing, resolving and fetching rulesets from one named source
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Configured name of this registry
    fn name(&self) -> String;

    fn kind(&self) -> RegistryKind;

    /// Identifiers available for `ruleset`, `latest` first
    async fn list_versions(&self, ruleset: &str) -> Result<Vec<String>, RegistryError>;

    /// Resolve a version specifier to one concrete identifier
    async fn resolve_version(
        &self,
        ruleset: &str,
        spec: &str,
    ) -> Result<ResolvedVersion, RegistryError>;

    /// Files of `ruleset` at `version` selected by `selector`
    async fn get_files(
        &self,
        ruleset: &str,
        version: &ResolvedVersion,
        selector: &ContentSelector,
    ) -> Result<RulesetFiles, RegistryError>;

    /// Release backend resources
    async fn close(&self) -> Result<(), RegistryError>;
}

/// How a source names its versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Versioning {
    /// Tags, branches and a default branch HEAD
    GitRefs,
    /// Published version strings only
    Packages,
    /// Objects addressed by exact version; nothing can be listed
    ExactOnly,
    /// A plain directory with a single implicit version
    Unversioned,
}

/// When fetched content is written to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Store before returning
    Sync,
    /// Return the in-memory copy and store on a blocking task
    Background,
    /// Never cache
    Bypass,
}

/// A backend protocol, without resolution or caching concerns
#[async_trait::async_trait]
pub trait RulesetSource: Send + Sync {
    fn kind(&self) -> RegistryKind;

    /// URL (or path) the cache entries of this source are keyed by
    fn url(&self) -> &str;

    fn versioning(&self) -> Versioning;

    fn write_policy(&self) -> WritePolicy;

    /// Current refs or published versions of `ruleset`
    async fn snapshot(&self, ruleset: &str) -> Result<RefSnapshot, RegistryError>;

    /// Files of `ruleset` at `version` matching any of `patterns`
    async fn fetch(
        &self,
        ruleset: &str,
        version: &ResolvedVersion,
        patterns: &[String],
    ) -> Result<RulesetFiles, RegistryError>;

    async fn close(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}

/// Adds version resolution, the versions index and the content cache to a
/// [`RulesetSource`].
pub struct CachedRegistry<S> {
    name: String,
    source: S,
    cache: Arc<ContentCache>,
    key: RegistryKey,
}

impl<S: RulesetSource> CachedRegistry<S> {
    pub fn new(name: &str, source: S, cache: Arc<ContentCache>) -> Self {
        let key = RegistryKey::new(source.kind(), source.url());
        Self {
            name: name.to_string(),
            source,
            cache,
            key,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn cached_index(&self, ruleset: &str) -> Option<VersionsIndex> {
        match self.cache.get_versions(&self.key, ruleset) {
            Ok(index) => index.filter(|index| self.cache.is_fresh(index)),
            Err(e) => {
                warn!("Ignoring unreadable versions index for {}: {}", ruleset, e);
                None
            }
        }
    }

    /// Fetch a new snapshot and replace the stored one, dropping resolutions
    /// made against the old refs.
    async fn refresh_snapshot(&self, ruleset: &str) -> Result<RefSnapshot, RegistryError> {
        let snapshot = self.source.snapshot(ruleset).await?;
        let now = chrono::Utc::now().timestamp_millis();
        let stored = snapshot.clone();
        if let Err(e) = self.cache.update_versions(&self.key, ruleset, move |index| {
            index.snapshot = stored;
            index.resolutions.clear();
            index.fetched_at = now;
        }) {
            warn!("Failed to store versions index for {}: {}", ruleset, e);
        }
        Ok(snapshot)
    }

    async fn current_snapshot(&self, ruleset: &str) -> Result<RefSnapshot, RegistryError> {
        match self.cached_index(ruleset) {
            Some(index) => Ok(index.snapshot),
            None => self.refresh_snapshot(ruleset).await,
        }
    }

    fn check_supported(&self, spec: &VersionSpecifier) -> Result<(), RegistryError> {
        let supported = match self.source.versioning() {
            Versioning::GitRefs => true,
            Versioning::Packages => !matches!(
                spec,
                VersionSpecifier::Commit(_) | VersionSpecifier::Branch(_)
            ),
            Versioning::ExactOnly => {
                if !matches!(spec, VersionSpecifier::Exact(_)) {
                    return Err(RegistryError::ExactVersionRequired {
                        registry: self.name.clone(),
                    });
                }
                true
            }
            Versioning::Unversioned => spec.is_latest(),
        };
        if supported {
            Ok(())
        } else {
            Err(ResolveError::Unsupported {
                spec: spec.key(),
                kind: self.source.kind(),
            }
            .into())
        }
    }

    async fn resolve_specifier(
        &self,
        ruleset: &str,
        spec: &VersionSpecifier,
    ) -> Result<ResolvedVersion, RegistryError> {
        self.check_supported(spec)?;

        match (self.source.versioning(), spec) {
            (Versioning::Unversioned, _) => return Ok(ResolvedVersion::new(WORKING_TREE)),
            (Versioning::ExactOnly, VersionSpecifier::Exact(version))
            | (Versioning::GitRefs, VersionSpecifier::Commit(version)) => {
                return Ok(ResolvedVersion::new(version.clone()));
            }
            _ => {}
        }

        // `latest` moves, so it is resolved against fresh refs every time
        if spec.is_latest() {
            let snapshot = self.refresh_snapshot(ruleset).await?;
            return Ok(VersionResolver::resolve(spec, &snapshot)?);
        }

        let _guard = self.cache.lock_ruleset(&self.key, ruleset).await;
        let key = spec.key();

        if let Some(index) = self.cached_index(ruleset) {
            if let Some(resolved) = index.resolutions.get(&key) {
                debug!("Resolved {}@{} from versions index", ruleset, key);
                return Ok(resolved.clone());
            }
            let resolved = VersionResolver::resolve(spec, &index.snapshot)?;
            self.remember(ruleset, key, resolved.clone());
            return Ok(resolved);
        }

        let snapshot = self.refresh_snapshot(ruleset).await?;
        let resolved = VersionResolver::resolve(spec, &snapshot)?;
        self.remember(ruleset, key, resolved.clone());
        Ok(resolved)
    }

    fn remember(&self, ruleset: &str, key: String, resolved: ResolvedVersion) {
        if let Err(e) = self.cache.update_versions(&self.key, ruleset, |index| {
            index.resolutions.insert(key, resolved);
        }) {
            warn!("Failed to record resolution for {}: {}", ruleset, e);
        }
    }

    fn store(&self, ruleset: &str, version: &ResolvedVersion, patterns: &[String], files: &RulesetFiles) {
        match self.source.write_policy() {
            WritePolicy::Bypass => {}
            WritePolicy::Sync => {
                if let Err(e) =
                    self.cache
                        .store_ruleset_files(&self.key, ruleset, version, patterns, files)
                {
                    warn!("Failed to cache {}@{}: {}", ruleset, version, e);
                }
            }
            WritePolicy::Background => {
                let cache = Arc::clone(&self.cache);
                let key = self.key.clone();
                let ruleset = ruleset.to_string();
                let version = version.clone();
                let patterns = patterns.to_vec();
                let files = files.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(e) =
                        cache.store_ruleset_files(&key, &ruleset, &version, &patterns, &files)
                    {
                        warn!("Failed to cache {}@{}: {}", ruleset, version, e);
                    }
                });
            }
        }
    }
}

#[async_trait::async_trait]
impl<S: RulesetSource> Registry for CachedRegistry<S> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> RegistryKind {
        self.source.kind()
    }

    async fn list_versions(&self, ruleset: &str) -> Result<Vec<String>, RegistryError> {
        match self.source.versioning() {
            Versioning::Unversioned => Ok(vec![LATEST.to_string()]),
            Versioning::ExactOnly => Err(RegistryError::ExactVersionRequired {
                registry: self.name.clone(),
            }),
            Versioning::GitRefs | Versioning::Packages => {
                Ok(self.current_snapshot(ruleset).await?.listing())
            }
        }
    }

    async fn resolve_version(
        &self,
        ruleset: &str,
        spec: &str,
    ) -> Result<ResolvedVersion, RegistryError> {
        let spec = VersionSpecifier::parse(spec);
        self.resolve_specifier(ruleset, &spec).await
    }

    async fn get_files(
        &self,
        ruleset: &str,
        version: &ResolvedVersion,
        selector: &ContentSelector,
    ) -> Result<RulesetFiles, RegistryError> {
        let version = if version.is_unresolved() {
            self.resolve_specifier(ruleset, &VersionSpecifier::Latest).await?
        } else {
            version.clone()
        };
        let patterns = selector.effective_patterns();
        let cacheable = self.source.write_policy() != WritePolicy::Bypass;

        if cacheable {
            match self
                .cache
                .get_ruleset_files(&self.key, ruleset, &version, &patterns)
            {
                Ok(Some(files)) => {
                    debug!("Cache hit for {}@{}", ruleset, version);
                    return Ok(selector.apply_excludes(files));
                }
                Ok(None) => debug!("Cache miss for {}@{}", ruleset, version),
                Err(e) => warn!("Cache read failed for {}@{}: {}", ruleset, version, e),
            }
        }

        let files = self.source.fetch(ruleset, &version, &patterns).await?;
        self.store(ruleset, &version, &patterns, &files);

        Ok(selector.apply_excludes(files))
    }

    async fn close(&self) -> Result<(), RegistryError> {
        self.source.close().await
    }
}
