//! Model provider detection from the agent's `settings.json`
//!
//! Only the fields berth cares about are modelled; everything else in the
//! file is ignored.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::MountConfig;
use crate::error::{BerthError, Result};

#[derive(Debug, Default, Deserialize)]
struct AgentSettings {
    #[serde(default)]
    anthropic: Option<AnthropicSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicSettings {
    #[serde(default, rename = "apiProvider")]
    api_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    Bedrock,
    Vertex,
    Other(String),
}

impl ProviderKind {
    fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "bedrock" => ProviderKind::Bedrock,
            "vertex" => ProviderKind::Vertex,
            other => ProviderKind::Other(other.to_string()),
        }
    }

    /// Host credentials directory (relative to home) the provider needs inside the sandbox.
    pub fn credentials_dir(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Bedrock => Some(".aws"),
            ProviderKind::Vertex => Some(".config/gcloud"),
            ProviderKind::Other(_) => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Bedrock => write!(f, "bedrock"),
            ProviderKind::Vertex => write!(f, "vertex"),
            ProviderKind::Other(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderDetection {
    /// No settings file, or no provider configured in it.
    Absent,
    Present(ProviderKind),
}

/// Read `settings_path` and report which API provider it selects.
pub fn detect_provider(settings_path: &Path) -> Result<ProviderDetection> {
    if !settings_path.exists() {
        return Ok(ProviderDetection::Absent);
    }
    let content = fs::read_to_string(settings_path)?;
    let settings: AgentSettings = serde_json::from_str(&content)
        .map_err(|e| BerthError::Config(format!("{}: {}", settings_path.display(), e)))?;

    Ok(settings
        .anthropic
        .and_then(|a| a.api_provider)
        .filter(|p| !p.is_empty())
        .map(|p| ProviderDetection::Present(ProviderKind::from_name(&p)))
        .unwrap_or(ProviderDetection::Absent))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
    pub fix: Option<String>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
        };
        write!(f, "{}: {}", prefix, self.message)?;
        if let Some(fix) = &self.fix {
            write!(f, "\n  Fix: {}", fix)?;
        }
        Ok(())
    }
}

/// Flag a provider whose credentials directory is not among `mounts`.
pub fn check_credentials_mount(
    kind: &ProviderKind,
    mounts: &[MountConfig],
    home: &Path,
    container_home: &str,
) -> Option<ValidationIssue> {
    let dir = kind.credentials_dir()?;
    let host = home.join(dir);
    if mounts.iter().any(|m| m.host == host || m.host.ends_with(dir)) {
        return None;
    }
    Some(ValidationIssue {
        severity: Severity::Warning,
        message: format!("{} is configured but ~/{} is not mounted into the sandbox", kind, dir),
        fix: Some(format!(
            "add to ~/.config/berth/config.toml:\n\n  [[mounts]]\n  host = \"{}\"\n  container = \"{}/{}\"",
            host.display(),
            container_home.trim_end_matches('/'),
            dir
        )),
    })
}
