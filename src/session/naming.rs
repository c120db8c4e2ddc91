//! Workspace identity and container naming
//!
//! A container name is `prefix + hash(workspace) + "-" + slot`. The hash is
//! the first eight hex digits of the SHA-256 of the canonical workspace
//! path, so the same directory maps to the same names in every process.

use std::path::{Path, PathBuf};

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{BerthError, Result};
use crate::runtime::ContainerRuntime;

const HASH_LEN: usize = 8;

/// A canonicalized workspace directory and its short hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceId {
    path: PathBuf,
    hash: String,
}

impl WorkspaceId {
    /// Canonicalize `path`, which must be an existing directory.
    pub fn from_path(path: &Path) -> Result<Self> {
        let canonical = path
            .canonicalize()
            .map_err(|_| BerthError::InvalidWorkspace(path.to_path_buf()))?;
        if !canonical.is_dir() {
            return Err(BerthError::InvalidWorkspace(path.to_path_buf()));
        }
        Ok(Self::from_canonical(canonical))
    }

    /// Build an identity from a path that is already canonical.
    pub fn from_canonical(path: PathBuf) -> Self {
        let hash = workspace_hash(&path);
        Self { path, hash }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

pub fn workspace_hash(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    hex
}

pub fn container_name(prefix: &str, workspace: &WorkspaceId, slot: u32) -> String {
    format!("{}{}-{}", prefix, workspace.hash(), slot)
}

/// Regex matching every slot's container name for a workspace.
pub fn workspace_pattern(prefix: &str, workspace: &WorkspaceId) -> String {
    format!("^{}{}-[0-9]+$", regex::escape(prefix), workspace.hash())
}

/// Regex matching any container created with `prefix`.
pub fn prefix_pattern(prefix: &str) -> String {
    format!("^{}[0-9a-f]{{{}}}-[0-9]+$", regex::escape(prefix), HASH_LEN)
}

/// Slot number encoded in `name`, if it belongs to `workspace`.
pub fn parse_slot(prefix: &str, workspace: &WorkspaceId, name: &str) -> Option<u32> {
    name.strip_prefix(prefix)?
        .strip_prefix(workspace.hash())?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// Containers (running or stopped) that belong to `workspace`, ordered by slot.
pub fn list_workspace_sessions(
    runtime: &dyn ContainerRuntime,
    prefix: &str,
    workspace: &WorkspaceId,
) -> Result<Vec<String>> {
    let pattern = workspace_pattern(prefix, workspace);
    // incus treats the filter loosely; re-check locally.
    let re = Regex::new(&pattern).map_err(|e| BerthError::InvalidInput(e.to_string()))?;
    let mut names: Vec<String> = runtime
        .list_containers(&pattern)?
        .into_iter()
        .filter(|n| re.is_match(n))
        .collect();
    names.sort_by_key(|n| parse_slot(prefix, workspace, n).unwrap_or(u32::MAX));
    Ok(names)
}
