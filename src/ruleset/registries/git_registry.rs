//! Git-backed rulesets
//!
//! A git registry tries an ordered list of strategies, chosen once at
//! construction. The first strategy that succeeds wins; the clone strategy
//! is always last.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config::RegistryKind;
use crate::ruleset::error::RegistryError;
use crate::ruleset::registries::archive;
use crate::ruleset::registries::git::GitCli;
use crate::ruleset::registries::local;
use crate::ruleset::registry::{RulesetSource, Versioning, WritePolicy};
use crate::ruleset::types::{RefSnapshot, ResolvedVersion, RulesetFiles};

/// One way of reading refs and files from a git remote
#[async_trait::async_trait]
pub trait GitStrategy: Send + Sync {
    fn label(&self) -> &'static str;

    async fn snapshot(&self) -> Result<RefSnapshot, RegistryError>;

    async fn fetch(
        &self,
        version: &ResolvedVersion,
        patterns: &[String],
    ) -> Result<RulesetFiles, RegistryError>;
}

/// Where the clone strategy reads objects from
#[derive(Debug, Clone)]
pub enum Checkout {
    /// Bare clone kept in the cache
    Bare(PathBuf),
    /// Existing repository on the local filesystem
    Local(PathBuf),
}

/// `git ls-remote` for refs, `git archive` for content
pub struct CliStrategy {
    git: GitCli,
    remote: String,
    checkout: Checkout,
    clone_lock: tokio::sync::Mutex<()>,
}

impl CliStrategy {
    pub fn new(git: GitCli, remote: &str, checkout: Checkout) -> Self {
        Self {
            git,
            remote: remote.to_string(),
            checkout,
            clone_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// A local checkout can be moved or deleted after the registry was built
    async fn check_local(&self) -> Result<(), RegistryError> {
        let Checkout::Local(path) = &self.checkout else {
            return Ok(());
        };
        let path = path.clone();
        tokio::task::spawn_blocking(move || local::validate_git_repository(&path))
            .await
            .map_err(|e| RegistryError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// Make sure `rev` is readable locally and return the repository to read it from
    async fn prepare(&self, rev: &str) -> Result<PathBuf, RegistryError> {
        let dir = match &self.checkout {
            Checkout::Local(path) => {
                self.check_local().await?;
                return Ok(path.clone());
            }
            Checkout::Bare(dir) => dir,
        };

        let _guard = self.clone_lock.lock().await;
        if !dir.join("HEAD").is_file() {
            debug!("Cloning {} into {}", self.remote, dir.display());
            if dir.exists() {
                tokio::fs::remove_dir_all(dir).await?;
            }
            self.git.clone_bare(&self.remote, dir).await?;
        } else if !self.git.has_commit(dir, rev).await {
            debug!("Fetching {} to find {}", self.remote, rev);
            self.git.fetch_all(dir).await?;
        }
        Ok(dir.clone())
    }
}

#[async_trait::async_trait]
impl GitStrategy for CliStrategy {
    fn label(&self) -> &'static str {
        "clone"
    }

    async fn snapshot(&self) -> Result<RefSnapshot, RegistryError> {
        self.check_local().await?;
        self.git.ls_remote(&self.remote).await
    }

    async fn fetch(
        &self,
        version: &ResolvedVersion,
        patterns: &[String],
    ) -> Result<RulesetFiles, RegistryError> {
        let repo = self.prepare(version.as_str()).await?;
        let tar = self.git.archive(&repo, version.as_str()).await?;
        let patterns = patterns.to_vec();
        tokio::task::spawn_blocking(move || archive::extract_tar(&tar, &patterns))
            .await
            .map_err(|e| RegistryError::Archive(format!("Extraction task failed: {}", e)))?
    }
}

/// A git repository as a ruleset source
pub struct GitSource {
    kind: RegistryKind,
    url: String,
    strategies: Vec<Box<dyn GitStrategy>>,
}

impl GitSource {
    pub fn new(kind: RegistryKind, url: &str, strategies: Vec<Box<dyn GitStrategy>>) -> Self {
        Self {
            kind,
            url: url.to_string(),
            strategies,
        }
    }

    pub fn strategy_labels(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.label()).collect()
    }
}

#[async_trait::async_trait]
impl RulesetSource for GitSource {
    fn kind(&self) -> RegistryKind {
        self.kind
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn versioning(&self) -> Versioning {
        Versioning::GitRefs
    }

    fn write_policy(&self) -> WritePolicy {
        WritePolicy::Sync
    }

    async fn snapshot(&self, _ruleset: &str) -> Result<RefSnapshot, RegistryError> {
        let mut last_error = None;
        for strategy in &self.strategies {
            match strategy.snapshot().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    warn!("{} refs via {} failed: {}", self.url, strategy.label(), e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| no_strategy(&self.url)))
    }

    async fn fetch(
        &self,
        _ruleset: &str,
        version: &ResolvedVersion,
        patterns: &[String],
    ) -> Result<RulesetFiles, RegistryError> {
        let mut last_error = None;
        for strategy in &self.strategies {
            match strategy.fetch(version, patterns).await {
                Ok(files) => return Ok(files),
                Err(e) => {
                    warn!(
                        "{}@{} via {} failed: {}",
                        self.url,
                        version,
                        strategy.label(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| no_strategy(&self.url)))
    }
}

fn no_strategy(url: &str) -> RegistryError {
    RegistryError::Unavailable {
        registry: url.to_string(),
        reason: "no access strategy configured".to_string(),
    }
}
