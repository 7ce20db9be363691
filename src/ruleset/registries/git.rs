//! Thin wrapper around the `git` binary
//!
//! Only what ref resolution and content reads need: `ls-remote`, bare clones,
//! fetches and `archive`. Every invocation is bounded by a timeout and the
//! child is killed when the future is dropped.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::ruleset::error::RegistryError;
use crate::ruleset::types::RefSnapshot;

const HEADS_PREFIX: &str = "refs/heads/";
const TAGS_PREFIX: &str = "refs/tags/";
const PEELED_SUFFIX: &str = "^{}";

/// Runs git commands against one remote
#[derive(Debug, Clone)]
pub struct GitCli {
    timeout: Duration,
    token: Option<String>,
}

impl GitCli {
    pub fn new(timeout: Duration, token: Option<String>) -> Self {
        Self { timeout, token }
    }

    /// Refs of `remote` (a URL or a local path)
    pub async fn ls_remote(&self, remote: &str) -> Result<RefSnapshot, RegistryError> {
        let output = self
            .run(&["ls-remote", "--symref", remote], None, "ls-remote")
            .await?;
        Ok(parse_ls_remote(&String::from_utf8_lossy(&output)))
    }

    pub async fn clone_bare(&self, remote: &str, dest: &Path) -> Result<(), RegistryError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dest = dest.to_string_lossy();
        self.run(&["clone", "--bare", "--quiet", remote, &dest], None, "clone")
            .await?;
        Ok(())
    }

    /// Update every branch and tag of a bare clone
    pub async fn fetch_all(&self, repo: &Path) -> Result<(), RegistryError> {
        self.run(
            &[
                "fetch",
                "--quiet",
                "--prune",
                "--force",
                "origin",
                "+refs/heads/*:refs/heads/*",
                "+refs/tags/*:refs/tags/*",
            ],
            Some(repo),
            "fetch",
        )
        .await?;
        Ok(())
    }

    /// Whether `rev` names a commit already present in `repo`
    pub async fn has_commit(&self, repo: &Path, rev: &str) -> bool {
        let object = format!("{}^{{commit}}", rev);
        self.run(&["cat-file", "-e", &object], Some(repo), "cat-file")
            .await
            .is_ok()
    }

    /// Tar stream of the tree at `rev`
    pub async fn archive(&self, repo: &Path, rev: &str) -> Result<Vec<u8>, RegistryError> {
        self.run(&["archive", "--format=tar", rev], Some(repo), "archive")
            .await
    }

    async fn run(
        &self,
        args: &[&str],
        working_dir: Option<&Path>,
        operation: &'static str,
    ) -> Result<Vec<u8>, RegistryError> {
        let mut cmd = Command::new("git");
        if let Some(token) = &self.token {
            cmd.arg("-c")
                .arg(format!("http.extraHeader=Authorization: Bearer {}", token));
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            if !tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
                return Err(RegistryError::Git {
                    operation,
                    message: format!("working directory {} does not exist", dir.display()),
                });
            }
            cmd.current_dir(dir);
        }

        debug!("Running git {}", args.join(" "));

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| spawn_error(operation, e))?,
            Err(_) => return Err(RegistryError::Timeout(self.timeout.as_secs())),
        };

        check_status(output, operation)
    }
}

fn spawn_error(operation: &'static str, error: std::io::Error) -> RegistryError {
    let message = if error.kind() == std::io::ErrorKind::NotFound {
        "git executable not found in PATH".to_string()
    } else {
        error.to_string()
    };
    RegistryError::Git { operation, message }
}

fn check_status(output: Output, operation: &'static str) -> Result<Vec<u8>, RegistryError> {
    if output.status.success() {
        return Ok(output.stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(RegistryError::Git {
        operation,
        message: stderr.trim().to_owned(),
    })
}

/// Parse `git ls-remote --symref` output.
///
/// Annotated tags appear twice (`refs/tags/v1` and `refs/tags/v1^{}`); only
/// the unpeeled name is kept since tags resolve by name.
pub fn parse_ls_remote(output: &str) -> RefSnapshot {
    let mut snapshot = RefSnapshot::default();
    let mut branches = BTreeMap::new();

    for line in output.lines() {
        let Some((left, name)) = line.split_once('\t') else {
            continue;
        };
        let name = name.trim();

        if let Some(target) = left.strip_prefix("ref:") {
            if name == "HEAD" {
                snapshot.default_branch = target
                    .trim()
                    .strip_prefix(HEADS_PREFIX)
                    .map(str::to_string);
            }
            continue;
        }

        let hash = left.trim();
        if name == "HEAD" {
            snapshot.head = Some(hash.to_string());
        } else if let Some(branch) = name.strip_prefix(HEADS_PREFIX) {
            branches.insert(branch.to_string(), hash.to_string());
        } else if let Some(tag) = name.strip_prefix(TAGS_PREFIX)
            && !tag.ends_with(PEELED_SUFFIX)
        {
            snapshot.tags.push(tag.to_string());
        }
    }

    if snapshot.head.is_none()
        && let Some(default_branch) = &snapshot.default_branch
    {
        snapshot.head = branches.get(default_branch).cloned();
    }
    snapshot.branches = branches;
    snapshot
}

/// True when a `git` binary can be executed
pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}
