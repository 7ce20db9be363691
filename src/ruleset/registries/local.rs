//! Registries on the local filesystem
//!
//! Paths are validated eagerly so configuration mistakes surface when the
//! registry is built, with a typed error that says what to do about them.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::config::RegistryKind;
use crate::ruleset::error::{LocalRepositoryError, RegistryError};
use crate::ruleset::registries::archive;
use crate::ruleset::registry::{RulesetSource, Versioning, WritePolicy};
use crate::ruleset::types::{RefSnapshot, ResolvedVersion, RulesetFiles};

/// Check that `path` is a readable directory
pub fn validate_directory(path: &Path) -> Result<(), LocalRepositoryError> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(LocalRepositoryError::Invalid {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(LocalRepositoryError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Err(_) => return Err(missing(path)),
    }

    match std::fs::read_dir(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            Err(LocalRepositoryError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
        Err(e) => Err(LocalRepositoryError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Check that `path` is a usable git repository, working tree or bare
pub fn validate_git_repository(path: &Path) -> Result<(), LocalRepositoryError> {
    validate_directory(path)?;

    let has_dot_git = path.join(".git").exists();
    let is_bare = path.join("HEAD").is_file() && path.join("objects").is_dir();
    if !has_dot_git && !is_bare {
        return Err(LocalRepositoryError::Invalid {
            path: path.to_path_buf(),
            reason: "no .git directory or bare repository layout".to_string(),
        });
    }

    let mut cmd = Command::new("git");
    cmd.arg("rev-parse")
        .arg("--git-dir")
        .current_dir(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    if let Some(parent) = path.parent() {
        cmd.env("GIT_CEILING_DIRECTORIES", parent);
    }

    match cmd.output() {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("permission denied") {
                return Err(LocalRepositoryError::PermissionDenied {
                    path: path.to_path_buf(),
                });
            }
            Err(LocalRepositoryError::Corrupted {
                path: path.to_path_buf(),
                message: stderr.trim().to_string(),
            })
        }
        Err(e) => {
            // Without git there is nothing more to check here; later git
            // operations report the missing binary.
            debug!("Skipping git validation of {}: {}", path.display(), e);
            Ok(())
        }
    }
}

/// A path that does not exist: moved if its parent is still there
fn missing(path: &Path) -> LocalRepositoryError {
    let parent_exists = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .is_some_and(Path::is_dir);
    if parent_exists {
        LocalRepositoryError::Moved {
            path: path.to_path_buf(),
        }
    } else {
        LocalRepositoryError::NotFound {
            path: path.to_path_buf(),
        }
    }
}

/// Expand a leading `~/` and strip a `file://` scheme
pub fn local_path(url: &str) -> PathBuf {
    let url = url.strip_prefix("file://").unwrap_or(url);
    match url.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(url)),
        None => PathBuf::from(url),
    }
}

/// A plain directory whose current contents are the one version
pub struct LocalDirSource {
    url: String,
    root: PathBuf,
}

impl LocalDirSource {
    /// Fails if `root` is not a readable directory
    pub fn open(url: &str, root: PathBuf) -> Result<Self, LocalRepositoryError> {
        validate_directory(&root)?;
        Ok(Self {
            url: url.to_string(),
            root,
        })
    }
}

#[async_trait::async_trait]
impl RulesetSource for LocalDirSource {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Local
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn versioning(&self) -> Versioning {
        Versioning::Unversioned
    }

    fn write_policy(&self) -> WritePolicy {
        WritePolicy::Bypass
    }

    async fn snapshot(&self, _ruleset: &str) -> Result<RefSnapshot, RegistryError> {
        Ok(RefSnapshot::default())
    }

    async fn fetch(
        &self,
        _ruleset: &str,
        _version: &ResolvedVersion,
        patterns: &[String],
    ) -> Result<RulesetFiles, RegistryError> {
        validate_directory(&self.root)?;
        let root = self.root.clone();
        let patterns = patterns.to_vec();
        tokio::task::spawn_blocking(move || archive::read_selected(&root, &patterns))
            .await
            .map_err(|e| RegistryError::Io(std::io::Error::other(e)))?
    }
}
