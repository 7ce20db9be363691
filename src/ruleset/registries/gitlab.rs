//! GitLab REST v4: repository access for git registries and the generic
//! package registry for `gitlab` registries

use std::collections::BTreeMap;

use futures::{StreamExt, TryStreamExt};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use tracing::debug;

use crate::config::{API_MAX_PAGES, API_PAGE_SIZE, RegistryKind};
use crate::ruleset::error::RegistryError;
use crate::ruleset::pattern::{PatternMatcher, is_selectable_path};
use crate::ruleset::registries::archive;
use crate::ruleset::registries::client::{check_response, json};
use crate::ruleset::registries::git_registry::GitStrategy;
use crate::ruleset::registry::{RulesetSource, Versioning, WritePolicy};
use crate::ruleset::types::{RefSnapshot, ResolvedVersion, RulesetFiles};

/// Shared request plumbing for one GitLab project
#[derive(Clone)]
pub struct GitLabProject {
    client: reqwest::Client,
    api_base: String,
    /// Numeric id or URL-encoded `group/project` path
    project: String,
    token: Option<String>,
}

impl GitLabProject {
    /// `api_base` is e.g. `https://gitlab.com/api/v4`
    pub fn new(client: reqwest::Client, api_base: &str, project: &str, token: Option<String>) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            project: encode_component(project),
            token,
        }
    }

    fn project_url(&self) -> String {
        format!("{}/projects/{}", self.api_base, self.project)
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.header("PRIVATE-TOKEN", token),
            None => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RegistryError> {
        let response = check_response(self.get(url).send().await?, url).await?;
        json(response, url).await
    }

    async fn get_bytes(&self, url: &str, what: &str) -> Result<Vec<u8>, RegistryError> {
        let response = check_response(self.get(url).send().await?, what).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Every page of a list endpoint; `path` may already carry a query
    async fn get_paginated<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Vec<T>, RegistryError> {
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut items = Vec::new();
        for page in 1..=API_MAX_PAGES {
            let url = format!(
                "{}{}{}per_page={}&page={}",
                self.project_url(),
                path,
                separator,
                API_PAGE_SIZE,
                page
            );
            let batch: Vec<T> = self.get_json(&url).await?;
            let last_page = batch.len() < API_PAGE_SIZE;
            items.extend(batch);
            if last_page {
                break;
            }
        }
        Ok(items)
    }
}

/// RFC 3986 unreserved characters stay literal
const PATH_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode a path segment (GitLab wants `group%2Fproject`)
fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, PATH_COMPONENT).to_string()
}

#[derive(Debug, Deserialize)]
struct Project {
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
    commit: CommitRef,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Repository API strategy for git registries hosted on GitLab
pub struct GitLabRepoStrategy {
    project: GitLabProject,
}

impl GitLabRepoStrategy {
    pub fn new(project: GitLabProject) -> Self {
        Self { project }
    }

    async fn fetch_raw(&self, path: String, version: &str) -> Result<(String, Vec<u8>), RegistryError> {
        let url = format!(
            "{}/repository/files/{}/raw?ref={}",
            self.project.project_url(),
            encode_component(&path),
            encode_component(version)
        );
        let content = self.project.get_bytes(&url, &path).await?;
        Ok((path, content))
    }
}

#[async_trait::async_trait]
impl GitStrategy for GitLabRepoStrategy {
    fn label(&self) -> &'static str {
        "gitlab-api"
    }

    async fn snapshot(&self) -> Result<RefSnapshot, RegistryError> {
        let project: Project = self.project.get_json(&self.project.project_url()).await?;
        let branches: Vec<NamedRef> = self.project.get_paginated("/repository/branches").await?;
        let tags: Vec<NamedRef> = self.project.get_paginated("/repository/tags").await?;

        let branches: BTreeMap<String, String> = branches
            .into_iter()
            .map(|branch| (branch.name, branch.commit.id))
            .collect();
        let head = project
            .default_branch
            .as_ref()
            .and_then(|name| branches.get(name).cloned());

        Ok(RefSnapshot {
            default_branch: project.default_branch,
            head,
            tags: tags.into_iter().map(|tag| tag.name).collect(),
            branches,
        })
    }

    async fn fetch(
        &self,
        version: &ResolvedVersion,
        patterns: &[String],
    ) -> Result<RulesetFiles, RegistryError> {
        let tree: Vec<TreeEntry> = self
            .project
            .get_paginated(&format!(
                "/repository/tree?recursive=true&ref={}",
                encode_component(version.as_str())
            ))
            .await?;

        let matcher = PatternMatcher::new(patterns);
        let selected: Vec<String> = tree
            .into_iter()
            .filter(|entry| entry.kind == "blob")
            .map(|entry| entry.path)
            .filter(|path| is_selectable_path(path) && matcher.matches(path))
            .collect();

        debug!("Fetching {} files from GitLab @{}", selected.len(), version);

        futures::stream::iter(selected)
            .then(|path| self.fetch_raw(path, version.as_str()))
            .try_collect()
            .await
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Package {
    id: u64,
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct PackageFile {
    file_name: String,
}

/// Rulesets published as generic packages of one GitLab project
pub struct GitLabPackagesSource {
    url: String,
    project: GitLabProject,
}

impl GitLabPackagesSource {
    pub fn new(url: &str, project: GitLabProject) -> Self {
        Self {
            url: url.to_string(),
            project,
        }
    }

    async fn packages(&self, ruleset: &str) -> Result<Vec<Package>, RegistryError> {
        let packages: Vec<Package> = self
            .project
            .get_paginated(&format!(
                "/packages?package_type=generic&package_name={}",
                encode_component(ruleset)
            ))
            .await?;
        // package_name is a fuzzy match on the server side
        Ok(packages
            .into_iter()
            .filter(|package| package.name == ruleset)
            .collect())
    }
}

#[async_trait::async_trait]
impl RulesetSource for GitLabPackagesSource {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Gitlab
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn versioning(&self) -> Versioning {
        Versioning::Packages
    }

    fn write_policy(&self) -> WritePolicy {
        WritePolicy::Background
    }

    async fn snapshot(&self, ruleset: &str) -> Result<RefSnapshot, RegistryError> {
        let versions = self
            .packages(ruleset)
            .await?
            .into_iter()
            .map(|package| package.version)
            .collect();
        Ok(RefSnapshot::from_versions(versions))
    }

    async fn fetch(
        &self,
        ruleset: &str,
        version: &ResolvedVersion,
        patterns: &[String],
    ) -> Result<RulesetFiles, RegistryError> {
        let package = self
            .packages(ruleset)
            .await?
            .into_iter()
            .find(|package| package.version == version.as_str())
            .ok_or_else(|| RegistryError::NotFound(format!("{}@{}", ruleset, version)))?;

        let package_files: Vec<PackageFile> = self
            .project
            .get_paginated(&format!("/packages/{}/package_files", package.id))
            .await?;

        let matcher = PatternMatcher::new(patterns);
        let mut files = RulesetFiles::new();
        for package_file in package_files {
            let url = format!(
                "{}/packages/generic/{}/{}/{}",
                self.project.project_url(),
                encode_component(ruleset),
                encode_component(version.as_str()),
                encode_component(&package_file.file_name)
            );
            let content = self.project.get_bytes(&url, &package_file.file_name).await?;

            if archive::is_tar_gz(&package_file.file_name) {
                let patterns = patterns.to_vec();
                let extracted = tokio::task::spawn_blocking(move || {
                    archive::extract_tar_gz(&content, &patterns)
                })
                .await
                .map_err(|e| RegistryError::Archive(format!("Extraction task failed: {}", e)))??;
                files.extend(extracted);
            } else if is_selectable_path(&package_file.file_name)
                && matcher.matches(&package_file.file_name)
            {
                files.insert(package_file.file_name, content);
            }
        }

        Ok(files)
    }
}
