//! Registry backends and the factory that picks one per configured source

pub mod archive;
pub mod client;
pub mod git;
pub mod git_registry;
pub mod github;
pub mod gitlab;
pub mod https;
pub mod local;
pub mod object_store;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use url::Url;

use crate::config::{GIT_OPERATION_TIMEOUT_SECS, GitMode, RegistryKind, RegistrySpec};
use crate::ruleset::cache::{ContentCache, RegistryKey};
use crate::ruleset::error::ConfigError;
use crate::ruleset::registry::{CachedRegistry, Registry};

pub use git_registry::{Checkout, CliStrategy, GitSource, GitStrategy};
pub use github::GitHubStrategy;
pub use gitlab::{GitLabPackagesSource, GitLabProject, GitLabRepoStrategy};
pub use https::ManifestSource;
pub use local::LocalDirSource;
pub use object_store::{ObjectStoreSource, TarballStore};

/// Build the registry described by `spec`, sharing `cache` with every other
/// registry.
pub fn build_registry(
    spec: &RegistrySpec,
    cache: Arc<ContentCache>,
) -> Result<Arc<dyn Registry>, ConfigError> {
    spec.validate()?;

    let registry: Arc<dyn Registry> = match spec.kind {
        RegistryKind::Git => {
            let strategies = git_strategies(spec, &cache)?;
            let source = GitSource::new(RegistryKind::Git, &spec.url, strategies);
            Arc::new(CachedRegistry::new(&spec.name, source, cache))
        }
        RegistryKind::LocalGit => {
            let path = local::local_path(&spec.url);
            local::validate_git_repository(&path)?;
            let strategy = CliStrategy::new(
                git_cli(spec),
                &path.to_string_lossy(),
                Checkout::Local(path.clone()),
            );
            let source = GitSource::new(RegistryKind::LocalGit, &spec.url, vec![Box::new(strategy)]);
            Arc::new(CachedRegistry::new(&spec.name, source, cache))
        }
        RegistryKind::Local => {
            let source = LocalDirSource::open(&spec.url, local::local_path(&spec.url))?;
            Arc::new(CachedRegistry::new(&spec.name, source, cache))
        }
        RegistryKind::Gitlab => {
            let url = parse_http_url(spec)?;
            let project = spec
                .project_id
                .clone()
                .unwrap_or_else(|| repository_path(&url));
            let api_base = spec
                .api_url
                .clone()
                .unwrap_or_else(|| format!("{}/api/v4", url.origin().ascii_serialization()));
            let project = GitLabProject::new(client::build_client(spec)?, &api_base, &project, spec.token());
            let source = GitLabPackagesSource::new(&spec.url, project);
            Arc::new(CachedRegistry::new(&spec.name, source, cache))
        }
        RegistryKind::Https => {
            parse_http_url(spec)?;
            let store = TarballStore::new(client::build_client(spec)?, &spec.url, spec.token());
            let source = ManifestSource::new(&spec.url, store);
            Arc::new(CachedRegistry::new(&spec.name, source, cache))
        }
        RegistryKind::Http => {
            parse_http_url(spec)?;
            let store = TarballStore::new(client::build_client(spec)?, &spec.url, spec.token());
            let source = ObjectStoreSource::new(RegistryKind::Http, &spec.url, store);
            Arc::new(CachedRegistry::new(&spec.name, source, cache))
        }
        RegistryKind::S3 => {
            let base = object_store::s3_base_url(
                &spec.name,
                &spec.url,
                spec.region.as_deref(),
                spec.api_url.as_deref(),
            )?;
            let store = TarballStore::new(client::build_client(spec)?, &base, spec.token());
            let source = ObjectStoreSource::new(RegistryKind::S3, &spec.url, store);
            Arc::new(CachedRegistry::new(&spec.name, source, cache))
        }
    };

    info!("Registry '{}' ready ({} {})", spec.name, spec.kind, spec.url);
    Ok(registry)
}

/// Strategies for a remote git registry, most preferred first
pub fn git_strategies(
    spec: &RegistrySpec,
    cache: &ContentCache,
) -> Result<Vec<Box<dyn GitStrategy>>, ConfigError> {
    let mut strategies: Vec<Box<dyn GitStrategy>> = Vec::new();

    let api_host = Url::parse(&spec.url).ok().and_then(|url| {
        let host = url.host_str()?.to_ascii_lowercase();
        Some((url, host))
    });
    let mode = spec.mode.unwrap_or(match &api_host {
        Some((_, host)) if host == "github.com" || host == "gitlab.com" => GitMode::Api,
        _ if spec.api_url.is_some() => GitMode::Api,
        _ => GitMode::Clone,
    });

    if mode == GitMode::Api
        && let Some((url, host)) = &api_host
    {
        let path = repository_path(url);
        if host.contains("github") {
            if let Some((owner, repo)) = path.split_once('/') {
                let api_base = spec.api_url.clone().unwrap_or_else(|| {
                    if host == "github.com" {
                        github::DEFAULT_BASE_URL.to_string()
                    } else {
                        format!("{}/api/v3", url.origin().ascii_serialization())
                    }
                });
                strategies.push(Box::new(GitHubStrategy::new(
                    client::build_client(spec)?,
                    &api_base,
                    owner,
                    repo,
                    spec.token(),
                )));
            }
        } else if host.contains("gitlab") {
            let api_base = spec
                .api_url
                .clone()
                .unwrap_or_else(|| format!("{}/api/v4", url.origin().ascii_serialization()));
            let project = spec.project_id.clone().unwrap_or(path);
            strategies.push(Box::new(GitLabRepoStrategy::new(GitLabProject::new(
                client::build_client(spec)?,
                &api_base,
                &project,
                spec.token(),
            ))));
        }
    }

    let key = RegistryKey::new(spec.kind, &spec.url);
    strategies.push(Box::new(CliStrategy::new(
        git_cli(spec),
        &spec.url,
        Checkout::Bare(cache.repository_dir(&key)),
    )));
    Ok(strategies)
}

fn git_cli(spec: &RegistrySpec) -> git::GitCli {
    let timeout = Duration::from_secs(spec.timeout_secs.unwrap_or(GIT_OPERATION_TIMEOUT_SECS));
    git::GitCli::new(timeout, spec.token())
}

fn parse_http_url(spec: &RegistrySpec) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        registry: spec.name.clone(),
        url: spec.url.clone(),
        reason,
    };
    let url = Url::parse(&spec.url).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme '{}'", other))),
    }
}

/// `owner/repo` part of a hosted repository URL
fn repository_path(url: &Url) -> String {
    let path = url.path().trim_matches('/');
    path.strip_suffix(".git").unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruleset::error::LocalRepositoryError;
    use rstest::rstest;
    use tempfile::TempDir;

    fn cache(temp_dir: &TempDir) -> Arc<ContentCache> {
        Arc::new(ContentCache::new(
            temp_dir.path().join("cache"),
            Duration::from_secs(300),
        ))
    }

    fn labels(strategies: &[Box<dyn GitStrategy>]) -> Vec<&'static str> {
        strategies.iter().map(|s| s.label()).collect()
    }

    #[rstest]
    #[case("https://github.com/acme/rules", None, vec!["github-api", "clone"])]
    #[case("https://github.com/acme/rules.git", Some(GitMode::Clone), vec!["clone"])]
    #[case("https://gitlab.com/group/rules", None, vec!["gitlab-api", "clone"])]
    #[case("https://git.example.com/rules.git", None, vec!["clone"])]
    #[case("git@github.com:acme/rules.git", None, vec!["clone"])]
    fn git_strategies_follow_host_and_mode(
        #[case] url: &str,
        #[case] mode: Option<GitMode>,
        #[case] expected: Vec<&str>,
    ) {
        let temp_dir = TempDir::new().unwrap();
        let mut spec = RegistrySpec::new("main", RegistryKind::Git, url);
        spec.mode = mode;

        let strategies = git_strategies(&spec, &cache(&temp_dir)).unwrap();

        assert_eq!(labels(&strategies), expected);
    }

    #[rstest]
    #[case(RegistryKind::Git, "https://github.com/acme/rules")]
    #[case(RegistryKind::Gitlab, "https://gitlab.com/group/rules")]
    #[case(RegistryKind::Https, "https://rules.example.com")]
    #[case(RegistryKind::Http, "http://rules.example.com/bucket")]
    #[case(RegistryKind::S3, "s3://rules-bucket/prefix")]
    fn build_registry_returns_registry_of_requested_kind(
        #[case] kind: RegistryKind,
        #[case] url: &str,
    ) {
        let temp_dir = TempDir::new().unwrap();
        let spec = RegistrySpec::new("main", kind, url);

        let registry = build_registry(&spec, cache(&temp_dir)).unwrap();

        assert_eq!(registry.kind(), kind);
        assert_eq!(registry.name(), "main");
    }

    #[test]
    fn build_registry_for_local_directory() {
        let temp_dir = TempDir::new().unwrap();
        let spec = RegistrySpec::new(
            "local",
            RegistryKind::Local,
            &temp_dir.path().to_string_lossy(),
        );

        let registry = build_registry(&spec, cache(&temp_dir)).unwrap();

        assert_eq!(registry.kind(), RegistryKind::Local);
    }

    #[test]
    fn build_registry_reports_moved_local_repository() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("moved-away");
        let spec = RegistrySpec::new("local", RegistryKind::LocalGit, &path.to_string_lossy());

        let result = build_registry(&spec, cache(&temp_dir));

        assert!(matches!(
            result,
            Err(ConfigError::LocalRepository(LocalRepositoryError::Moved { .. }))
        ));
    }

    #[rstest]
    #[case(RegistryKind::Https, "ftp://rules.example.com")]
    #[case(RegistryKind::S3, "https://bucket")]
    #[case(RegistryKind::Gitlab, "not a url")]
    fn build_registry_rejects_invalid_urls(#[case] kind: RegistryKind, #[case] url: &str) {
        let temp_dir = TempDir::new().unwrap();
        let spec = RegistrySpec::new("bad", kind, url);

        let result = build_registry(&spec, cache(&temp_dir));

        assert!(matches!(result, Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn build_registry_rejects_missing_url() {
        let temp_dir = TempDir::new().unwrap();
        let spec = RegistrySpec::new("bad", RegistryKind::Git, "");

        let result = build_registry(&spec, cache(&temp_dir));

        assert!(matches!(result, Err(ConfigError::MissingUrl { .. })));
    }
}
