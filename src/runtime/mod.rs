//! Container runtime capability
//!
//! Everything the session layer needs from the container runtime goes
//! through [`ContainerRuntime`]. The production implementation shells out
//! to the `incus` binary ([`IncusClient`]); [`MemoryRuntime`] keeps all
//! state in memory so the lifecycle can be exercised without a daemon.

pub mod incus;
pub mod memory;

pub use incus::IncusClient;
pub use memory::MemoryRuntime;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BerthError, Result};

/// Host-to-container id mapping applied before first boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub host_uid: u32,
    pub host_gid: u32,
    pub container_uid: u32,
    pub container_gid: u32,
}

impl IdMap {
    /// Render as an Incus `raw.idmap` value.
    pub fn to_raw_idmap(&self) -> String {
        if self.host_uid == self.host_gid && self.container_uid == self.container_gid {
            format!("both {} {}", self.host_uid, self.container_uid)
        } else {
            format!(
                "uid {} {}\ngid {} {}",
                self.host_uid, self.container_uid, self.host_gid, self.container_gid
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub image: String,
    /// Ephemeral containers are destroyed by the runtime when stopped.
    pub ephemeral: bool,
    pub idmap: Option<IdMap>,
}

/// A host directory attached to a container as a disk device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskMount {
    pub device: String,
    pub source: PathBuf,
    pub path: String,
    pub shift: bool,
    pub readonly: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub user: Option<u32>,
    pub group: Option<u32>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Attach the caller's terminal instead of capturing output.
    pub interactive: bool,
}

impl ExecOptions {
    pub fn as_user(uid: u32, gid: u32) -> Self {
        Self {
            user: Some(uid),
            group: Some(gid),
            ..Self::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub stateful: bool,
    #[serde(default)]
    pub description: String,
}

/// A local image as listed by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub fingerprint: String,
    pub aliases: Vec<String>,
    pub size_bytes: u64,
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
}

/// One entry of the runtime's instance list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub image: Option<String>,
    pub ipv4: Vec<Ipv4Addr>,
    /// Host-side names of the instance's network interfaces.
    pub host_interfaces: Vec<String>,
}

impl InstanceInfo {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }

    pub fn is_stopped(&self) -> bool {
        self.status.eq_ignore_ascii_case("stopped")
    }
}

/// Narrow interface over the container runtime's CLI.
///
/// Every call is a fresh, blocking query. Nothing here caches state
/// between calls because other processes mutate the same namespace.
pub trait ContainerRuntime: Send + Sync {
    /// Whether the runtime binary and daemon are reachable.
    fn available(&self) -> Result<()>;

    fn exists(&self, name: &str) -> Result<bool>;
    fn running(&self, name: &str) -> Result<bool>;

    fn launch(&self, name: &str, options: &LaunchOptions) -> Result<()>;
    fn start(&self, name: &str) -> Result<()>;
    fn stop(&self, name: &str, force: bool) -> Result<()>;
    fn delete(&self, name: &str, force: bool) -> Result<()>;

    fn exec(&self, name: &str, command: &str, options: &ExecOptions) -> Result<ExecOutput>;
    fn create_file(&self, name: &str, path: &str, content: &str) -> Result<()>;

    /// Copy the contents of host directory `source` into `dest` inside the container.
    fn push_dir_contents(&self, name: &str, source: &Path, dest: &str) -> Result<()>;

    /// Copy container directory `source` to host path `dest`, which must not exist yet.
    fn pull_dir(&self, name: &str, source: &str, dest: &Path) -> Result<()>;

    fn mount_disk(&self, name: &str, mount: &DiskMount) -> Result<()>;

    fn create_snapshot(&self, name: &str, snapshot: &str, stateful: bool) -> Result<()>;
    fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotInfo>>;
    fn restore_snapshot(&self, name: &str, snapshot: &str, stateful: bool) -> Result<()>;
    fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()>;

    fn snapshot_exists(&self, name: &str, snapshot: &str) -> Result<bool> {
        Ok(self
            .list_snapshots(name)?
            .iter()
            .any(|s| s.name == snapshot))
    }

    fn snapshot_info(&self, name: &str, snapshot: &str) -> Result<SnapshotInfo> {
        self.list_snapshots(name)?
            .into_iter()
            .find(|s| s.name == snapshot)
            .ok_or_else(|| BerthError::SnapshotNotFound {
                container: name.to_string(),
                snapshot: snapshot.to_string(),
            })
    }

    fn image_exists(&self, alias: &str) -> Result<bool>;

    /// Every local image.
    fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Names of containers matching a regular expression.
    fn list_containers(&self, pattern: &str) -> Result<Vec<String>>;

    /// Every instance the runtime knows about, regardless of name.
    fn list_instances(&self) -> Result<Vec<InstanceInfo>>;

    /// IPv4 address of a managed bridge in CIDR form (e.g. `10.1.2.1/24`).
    fn bridge_ipv4(&self, bridge: &str) -> Result<Option<String>>;
}

/// A runtime client bound to one container.
#[derive(Clone)]
pub struct ContainerHandle {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    env: BTreeMap<String, String>,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("name", &self.name)
            .field("env", &self.env)
            .finish()
    }
}

impl ContainerHandle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, name: impl Into<String>) -> Self {
        Self {
            runtime,
            name: name.into(),
            env: BTreeMap::new(),
        }
    }

    /// Environment applied to every command run through this handle.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn exists(&self) -> Result<bool> {
        self.runtime.exists(&self.name)
    }

    pub fn running(&self) -> Result<bool> {
        self.runtime.running(&self.name)
    }

    pub fn stop(&self, force: bool) -> Result<()> {
        self.runtime.stop(&self.name, force)
    }

    pub fn delete(&self, force: bool) -> Result<()> {
        self.runtime.delete(&self.name, force)
    }

    pub fn create_file(&self, path: &str, content: &str) -> Result<()> {
        self.runtime.create_file(&self.name, path, content)
    }

    /// Run a command with the handle's environment merged under `options.env`.
    pub fn exec(&self, command: &str, options: &ExecOptions) -> Result<ExecOutput> {
        let mut options = options.clone();
        for (key, value) in &self.env {
            options.env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self.runtime.exec(&self.name, command, &options)
    }

    /// Run a command and return its stdout, failing on a non-zero exit.
    pub fn exec_capture(&self, command: &str, options: &ExecOptions) -> Result<String> {
        let output = self.exec(command, options)?;
        if !output.success() {
            return Err(BerthError::operation_failed(
                "exec",
                &self.name,
                format!(
                    "`{}` exited with status {}: {}",
                    command,
                    output.status,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(output.stdout)
    }
}

/// Quote a string for use inside a `sh -c` command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
