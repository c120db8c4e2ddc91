//! Configuration
//!
//! Layers, lowest precedence first: built-in defaults,
//! `~/.config/berth/config.toml`, `<workspace>/.berth.toml`, then the
//! `BERTH_SESSIONS_DIR`, `BERTH_CONTAINER_PREFIX` and `BERTH_IMAGE`
//! environment variables. Files are merged table by table, so a workspace
//! file only needs the keys it changes.

pub mod provider;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BerthError, Result};
use crate::orphan::NetworkSettings;
use crate::session::{ExtraMount, LifecycleSettings, DEFAULT_MAX_SLOT};

pub const WORKSPACE_FILE: &str = ".berth.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub image: String,
    pub privileged_image: String,
    pub persistent: bool,
    pub max_slot: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            image: "berth-sandbox".to_string(),
            privileged_image: "berth-privileged".to_string(),
            persistent: false,
            max_slot: DEFAULT_MAX_SLOT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Defaults to `~/.berth/sessions`.
    pub sessions_dir: Option<PathBuf>,
    /// Host directory mounted at `/storage` in every sandbox.
    pub storage_dir: Option<PathBuf>,
    /// Host SSH directory mounted read-only at `~/.ssh`. Off unless set.
    pub ssh_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub prefix: String,
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub state_dir: String,
    pub workspace_path: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            prefix: "berth-".to_string(),
            user: "code".to_string(),
            uid: 1000,
            gid: 1000,
            home: "/home/code".to_string(),
            state_dir: ".claude".to_string(),
            workspace_path: "/workspace".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bridge: String,
    pub firewall_chain: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let defaults = NetworkSettings::default();
        Self {
            bridge: defaults.bridge,
            firewall_chain: defaults.firewall_chain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountConfig {
    pub host: PathBuf,
    pub container: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub defaults: DefaultsConfig,
    pub paths: PathsConfig,
    pub container: ContainerConfig,
    pub network: NetworkConfig,
    pub mounts: Vec<MountConfig>,
}

/// `~/.config/berth/config.toml`, if a config directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("berth").join("config.toml"))
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn read_layer(path: &Path) -> Result<Option<toml::Table>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let table = content
        .parse::<toml::Table>()
        .map_err(|e| BerthError::Config(format!("{}: {}", path.display(), e)))?;
    Ok(Some(table))
}

fn merge(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

impl Config {
    /// Load every layer for `workspace` from the real environment.
    pub fn load(workspace: Option<&Path>) -> Result<Self> {
        Self::load_from(user_config_path().as_deref(), workspace, |key| {
            std::env::var(key).ok()
        })
    }

    pub fn load_from(
        user_file: Option<&Path>,
        workspace: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut table = toml::Table::new();
        if let Some(layer) = user_file.map(read_layer).transpose()?.flatten() {
            merge(&mut table, layer);
        }
        if let Some(dir) = workspace {
            if let Some(layer) = read_layer(&dir.join(WORKSPACE_FILE))? {
                merge(&mut table, layer);
            }
        }

        let mut config: Config = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| BerthError::Config(e.to_string()))?;

        if let Some(dir) = env("BERTH_SESSIONS_DIR").filter(|v| !v.is_empty()) {
            config.paths.sessions_dir = Some(PathBuf::from(dir));
        }
        if let Some(prefix) = env("BERTH_CONTAINER_PREFIX").filter(|v| !v.is_empty()) {
            config.container.prefix = prefix;
        }
        if let Some(image) = env("BERTH_IMAGE").filter(|v| !v.is_empty()) {
            config.defaults.image = image;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.defaults.max_slot == 0 {
            return Err(BerthError::Config("defaults.max_slot must be at least 1".to_string()));
        }
        let prefix = &self.container.prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || !prefix.starts_with(|c: char| c.is_ascii_lowercase())
        {
            return Err(BerthError::Config(format!(
                "container.prefix '{}' must start with a letter and use only a-z, 0-9 and '-'",
                prefix
            )));
        }
        if !self.container.home.starts_with('/') || !self.container.workspace_path.starts_with('/') {
            return Err(BerthError::Config(
                "container.home and container.workspace_path must be absolute".to_string(),
            ));
        }
        if self.container.state_dir.is_empty() || self.container.state_dir.contains("..") {
            return Err(BerthError::Config(format!(
                "container.state_dir '{}' must be a plain relative path",
                self.container.state_dir
            )));
        }
        Ok(())
    }

    pub fn sessions_dir(&self) -> PathBuf {
        match &self.paths.sessions_dir {
            Some(dir) => expand_home(dir),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".berth")
                .join("sessions"),
        }
    }

    pub fn storage_dir(&self) -> Option<PathBuf> {
        self.paths.storage_dir.as_deref().map(expand_home)
    }

    pub fn ssh_dir(&self) -> Option<PathBuf> {
        self.paths.ssh_dir.as_deref().map(expand_home)
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            prefix: self.container.prefix.clone(),
            image: self.defaults.image.clone(),
            privileged_image: self.defaults.privileged_image.clone(),
            sessions_dir: self.sessions_dir(),
            user: self.container.user.clone(),
            uid: self.container.uid,
            gid: self.container.gid,
            home: self.container.home.clone(),
            state_dir: self.container.state_dir.clone(),
            workspace_path: self.container.workspace_path.clone(),
            max_slot: self.defaults.max_slot,
        }
    }

    pub fn network_settings(&self) -> NetworkSettings {
        NetworkSettings {
            bridge: self.network.bridge.clone(),
            firewall_chain: self.network.firewall_chain.clone(),
        }
    }

    pub fn extra_mounts(&self) -> Vec<ExtraMount> {
        self.mounts
            .iter()
            .map(|m| ExtraMount {
                host: expand_home(&m.host),
                container: m.container.clone(),
                readonly: m.readonly,
            })
            .collect()
    }
}
