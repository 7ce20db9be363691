//! Tar archive extraction shared by git and package backends

use std::io::{Cursor, Read};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use tracing::debug;

use crate::ruleset::error::RegistryError;
use crate::ruleset::pattern::find_matching_files;
use crate::ruleset::types::RulesetFiles;

/// Unpack a plain tar stream into `dest`.
///
/// Only regular files and directories are written; links and special entries
/// are skipped. Entries that would escape `dest` are rejected.
pub fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<usize, RegistryError> {
    let mut archive = tar::Archive::new(reader);
    let mut unpacked = 0;

    let entries = archive
        .entries()
        .map_err(|e| RegistryError::Archive(format!("Failed to read tar entries: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| RegistryError::Archive(format!("Failed to read entry: {}", e)))?;
        let entry_path = entry
            .path()
            .map_err(|e| RegistryError::Archive(format!("Invalid entry path: {}", e)))?
            .into_owned();

        validate_entry_path(&entry_path)?;

        let dest_path = dest.join(&entry_path);
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            std::fs::create_dir_all(&dest_path)?;
        } else if entry_type.is_file() {
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest_path).map_err(|e| {
                RegistryError::Archive(format!("Failed to extract {}: {}", dest_path.display(), e))
            })?;
            unpacked += 1;
        }
    }

    Ok(unpacked)
}

/// Unpack a gzip-compressed tar archive held in memory
pub fn unpack_tar_gz(content: &[u8], dest: &Path) -> Result<usize, RegistryError> {
    unpack_tar(GzDecoder::new(Cursor::new(content)), dest)
}

/// Read every file under `root` that matches `patterns`
pub fn read_selected(root: &Path, patterns: &[String]) -> Result<RulesetFiles, RegistryError> {
    let mut files = RulesetFiles::new();
    for relative in find_matching_files(root, patterns)? {
        let content = std::fs::read(root.join(&relative))?;
        files.insert(relative, content);
    }
    debug!("Selected {} files under {}", files.len(), root.display());
    Ok(files)
}

/// Extract a tar stream to a scratch directory and return the selected files
pub fn extract_tar(content: &[u8], patterns: &[String]) -> Result<RulesetFiles, RegistryError> {
    let scratch = tempfile::tempdir()?;
    unpack_tar(Cursor::new(content), scratch.path())?;
    read_selected(scratch.path(), patterns)
}

/// Extract a `.tar.gz` to a scratch directory and return the selected files
pub fn extract_tar_gz(content: &[u8], patterns: &[String]) -> Result<RulesetFiles, RegistryError> {
    let scratch = tempfile::tempdir()?;
    unpack_tar_gz(content, scratch.path())?;
    read_selected(scratch.path(), patterns)
}

/// True for file names this module knows how to unpack
pub fn is_tar_gz(file_name: &str) -> bool {
    file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz")
}

fn validate_entry_path(path: &Path) -> Result<(), RegistryError> {
    if path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(RegistryError::Archive(format!(
            "path traversal detected: {}",
            path.display()
        )));
    }
    Ok(())
}
