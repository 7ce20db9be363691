//! GitHub REST v3 access to a repository's refs and blobs

use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::config::{API_MAX_PAGES, API_PAGE_SIZE};
use crate::ruleset::error::RegistryError;
use crate::ruleset::pattern::{PatternMatcher, is_selectable_path};
use crate::ruleset::registries::client::{check_response, json};
use crate::ruleset::registries::git_registry::GitStrategy;
use crate::ruleset::types::{RefSnapshot, ResolvedVersion, RulesetFiles};

/// Default base URL for GitHub API
pub const DEFAULT_BASE_URL: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct Repository {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
    commit: CommitRef,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct Tree {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
}

pub struct GitHubStrategy {
    client: reqwest::Client,
    base_url: String,
    owner: String,
    repo: String,
    token: Option<String>,
}

impl GitHubStrategy {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        owner: &str,
        repo: &str,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token,
        }
    }

    fn repo_url(&self) -> String {
        format!("{}/repos/{}/{}", self.base_url, self.owner, self.repo)
    }

    fn get(&self, url: &str, accept: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(url)
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RegistryError> {
        let response = self.get(url, "application/vnd.github+json").send().await?;
        let response = check_response(response, url).await?;
        json(response, url).await
    }

    async fn list_refs(&self, kind: &str) -> Result<Vec<NamedRef>, RegistryError> {
        let mut refs = Vec::new();
        for page in 1..=API_MAX_PAGES {
            let url = format!(
                "{}/{}?per_page={}&page={}",
                self.repo_url(),
                kind,
                API_PAGE_SIZE,
                page
            );
            let batch: Vec<NamedRef> = self.get_json(&url).await?;
            let last_page = batch.len() < API_PAGE_SIZE;
            refs.extend(batch);
            if last_page {
                break;
            }
        }
        Ok(refs)
    }

    async fn fetch_blob(&self, path: String, sha: String) -> Result<(String, Vec<u8>), RegistryError> {
        let url = format!("{}/git/blobs/{}", self.repo_url(), sha);
        let response = self.get(&url, "application/vnd.github.raw+json").send().await?;
        let response = check_response(response, &path).await?;
        let bytes = response.bytes().await?;
        Ok((path, bytes.to_vec()))
    }
}

#[async_trait::async_trait]
impl GitStrategy for GitHubStrategy {
    fn label(&self) -> &'static str {
        "github-api"
    }

    async fn snapshot(&self) -> Result<RefSnapshot, RegistryError> {
        let repository: Repository = self.get_json(&self.repo_url()).await?;
        let branches = self.list_refs("branches").await?;
        let tags = self.list_refs("tags").await?;

        let branches: std::collections::BTreeMap<String, String> = branches
            .into_iter()
            .map(|branch| (branch.name, branch.commit.sha))
            .collect();
        let head = branches.get(&repository.default_branch).cloned();

        Ok(RefSnapshot {
            default_branch: Some(repository.default_branch),
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
        let url = format!("{}/git/trees/{}?recursive=1", self.repo_url(), version);
        let tree: Tree = self.get_json(&url).await?;
        if tree.truncated {
            return Err(RegistryError::InvalidResponse(format!(
                "tree for {} is truncated",
                version
            )));
        }

        let matcher = PatternMatcher::new(patterns);
        let selected: Vec<(String, String)> = tree
            .tree
            .into_iter()
            .filter(|entry| entry.kind == "blob")
            .filter(|entry| is_selectable_path(&entry.path) && matcher.matches(&entry.path))
            .map(|entry| (entry.path, entry.sha))
            .collect();

        debug!(
            "Fetching {} blobs from {}/{}@{}",
            selected.len(),
            self.owner,
            self.repo,
            version
        );

        futures::stream::iter(selected)
            .then(|(path, sha)| self.fetch_blob(path, sha))
            .try_collect()
            .await
    }
}
