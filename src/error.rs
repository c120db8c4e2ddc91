//! Error types for Berth

use std::path::PathBuf;
use thiserror::Error;

/// Remediation shown whenever the Incus binary or daemon cannot be reached.
pub const RUNTIME_REMEDIATION: &str = "\
incus is not available. To fix:
  1. Install Incus: https://linuxcontainers.org/incus/docs/main/installing/
  2. Initialise it once: sudo incus admin init --minimal
  3. Add yourself to the incus-admin group: sudo usermod -aG incus-admin $USER
  4. Log out and back in (or run: newgrp incus-admin)";

#[derive(Error, Debug)]
pub enum BerthError {
    #[error("Invalid workspace: {0} does not exist or is not a directory")]
    InvalidWorkspace(PathBuf),

    #[error("Session not found: {0} (no saved session data)")]
    SessionNotFound(String),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error(
        "Session {session} was saved for workspace {saved}, not {requested}. \
         Resume it from its original workspace or start a new session"
    )]
    WorkspaceMismatch {
        session: String,
        saved: PathBuf,
        requested: PathBuf,
    },

    #[error("No free slot between {start} and {max}. Clean up stopped sandboxes with `berth clean`")]
    ExhaustedSlots { start: u32, max: u32 },

    #[error("{reason}\n\n{remediation}")]
    RuntimeUnavailable { reason: String, remediation: String },

    #[error("incus {operation} failed for {container}: {message}")]
    RuntimeOperationFailed {
        operation: String,
        container: String,
        message: String,
    },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Snapshot '{snapshot}' not found for container '{container}'")]
    SnapshotNotFound { container: String, snapshot: String },

    #[error("Snapshot '{snapshot}' already exists for container '{container}'")]
    SnapshotExists { container: String, snapshot: String },

    #[error("Orphan detection failed: {0}")]
    OrphanDetectionFailed(String),

    #[error("`{command}` failed: {message}")]
    HostCommandFailed { command: String, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl BerthError {
    /// Runtime unreachable, with the standard remediation text attached.
    pub fn runtime_unavailable(reason: impl Into<String>) -> Self {
        BerthError::RuntimeUnavailable {
            reason: reason.into(),
            remediation: RUNTIME_REMEDIATION.to_string(),
        }
    }

    pub fn operation_failed(
        operation: impl Into<String>,
        container: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        BerthError::RuntimeOperationFailed {
            operation: operation.into(),
            container: container.into(),
            message: message.into(),
        }
    }

    /// True when the error says the container is simply not there.
    pub fn is_not_found(&self) -> bool {
        match self {
            BerthError::ContainerNotFound(_) => true,
            BerthError::RuntimeOperationFailed { message, .. } => {
                let message = message.to_lowercase();
                message.contains("not found") || message.contains("does not exist")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BerthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_unavailable_has_remediation() {
        let err = BerthError::runtime_unavailable("incus binary not found in PATH");
        let msg = err.to_string();
        assert!(msg.contains("incus binary not found"));
        assert!(msg.contains("incus-admin"));
        assert!(msg.contains("Install Incus"));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(BerthError::ContainerNotFound("x".into()).is_not_found());
        assert!(BerthError::operation_failed("stop", "x", "Error: Instance not found").is_not_found());
        assert!(!BerthError::operation_failed("stop", "x", "permission denied").is_not_found());
    }

    #[test]
    fn test_workspace_mismatch_mentions_workspace() {
        let err = BerthError::WorkspaceMismatch {
            session: "abc".into(),
            saved: PathBuf::from("/a"),
            requested: PathBuf::from("/b"),
        };
        assert!(err.to_string().contains("workspace"));
    }
}
