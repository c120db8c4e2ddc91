//! In-memory container runtime
//!
//! Behaves like Incus where the session layer can observe it: ephemeral
//! containers vanish when stopped, adding a device name twice fails,
//! stopping or deleting a missing container reports "not found". Each
//! container carries a flat file map so commands like `cat` and `echo >`
//! can be checked from tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use regex::Regex;
use walkdir::WalkDir;

use super::{
    ContainerRuntime, DiskMount, ExecOptions, ExecOutput, ImageInfo, InstanceInfo, LaunchOptions,
    SnapshotInfo,
};
use crate::error::{BerthError, Result};

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub image: String,
    pub ephemeral: bool,
    pub running: bool,
    pub idmap: Option<super::IdMap>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub mounts: Vec<DiskMount>,
    pub snapshots: Vec<(SnapshotInfo, BTreeMap<String, Vec<u8>>)>,
    pub ipv4: Option<Ipv4Addr>,
    pub host_interface: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: BTreeMap<String, MemoryContainer>,
    images: BTreeSet<String>,
    bridges: HashMap<String, String>,
    failures: HashMap<String, String>,
    calls: Vec<String>,
    unavailable: bool,
    next_host: u32,
}

#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a call and return any failure injected for it.
    fn enter(&self, operation: &str, name: &str) -> Result<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        state.calls.push(format!("{} {}", operation, name));
        if state.unavailable {
            return Err(BerthError::runtime_unavailable("memory runtime marked unavailable"));
        }
        let key = format!("{}:{}", operation, name);
        if let Some(message) = state
            .failures
            .get(&key)
            .or_else(|| state.failures.get(operation))
        {
            return Err(BerthError::operation_failed(operation, name, message.clone()));
        }
        Ok(state)
    }

    pub fn add_image(&self, alias: &str) {
        self.lock().images.insert(alias.to_string());
    }

    pub fn set_bridge(&self, bridge: &str, cidr: &str) {
        self.lock()
            .bridges
            .insert(bridge.to_string(), cidr.to_string());
    }

    /// Make `operation` fail, either for one container (`"exists:name"`) or all.
    pub fn fail_on(&self, key: &str, message: &str) {
        self.lock()
            .failures
            .insert(key.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Place a container directly, bypassing launch.
    pub fn insert_container(&self, name: &str, running: bool) {
        let mut state = self.lock();
        let host = state.next_host;
        state.next_host += 1;
        state.containers.insert(
            name.to_string(),
            new_container("preexisting", false, running, None, host),
        );
    }

    /// Simulate an out-of-band `incus delete`.
    pub fn remove_container(&self, name: &str) {
        self.lock().containers.remove(name);
    }

    pub fn container(&self, name: &str) -> Option<MemoryContainer> {
        self.lock().containers.get(name).cloned()
    }

    /// File content as text, lossily decoded.
    pub fn file(&self, name: &str, path: &str) -> Option<String> {
        self.file_bytes(name, path)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    pub fn file_bytes(&self, name: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .containers
            .get(name)
            .and_then(|c| c.files.get(path).cloned())
    }

    pub fn mounts(&self, name: &str) -> Vec<DiskMount> {
        self.lock()
            .containers
            .get(name)
            .map(|c| c.mounts.clone())
            .unwrap_or_default()
    }

    /// Every call so far, as `"<operation> <container>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{} ", operation);
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }
}

fn new_container(
    image: &str,
    ephemeral: bool,
    running: bool,
    idmap: Option<super::IdMap>,
    host: u32,
) -> MemoryContainer {
    MemoryContainer {
        image: image.to_string(),
        ephemeral,
        running,
        idmap,
        files: BTreeMap::new(),
        mounts: Vec::new(),
        snapshots: Vec::new(),
        ipv4: Some(Ipv4Addr::new(10, 99, (host / 250) as u8, (host % 250 + 2) as u8)),
        host_interface: Some(format!("vethmem{:04x}", host)),
        created_at: Utc::now(),
    }
}

fn not_found(operation: &str, name: &str) -> BerthError {
    BerthError::operation_failed(operation, name, "Error: Instance not found")
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn expand_env(text: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = text.to_string();
    // Longest names first so $HOME_DIR is not clobbered by $HOME.
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
    for key in keys {
        out = out.replace(&format!("${}", key), &env[key]);
    }
    out
}

fn unquote(text: &str) -> String {
    let text = text.trim();
    if text.len() >= 2
        && ((text.starts_with('\'') && text.ends_with('\''))
            || (text.starts_with('"') && text.ends_with('"')))
    {
        text[1..text.len() - 1].to_string()
    } else {
        text.to_string()
    }
}

/// Tiny interpreter for the commands the session layer and tests issue.
fn run_command(
    name: &str,
    container: &mut MemoryContainer,
    command: &str,
    env: &BTreeMap<String, String>,
) -> ExecOutput {
    let ok = |stdout: String| ExecOutput {
        status: 0,
        stdout,
        stderr: String::new(),
    };
    let fail = |status: i32, stderr: String| ExecOutput {
        status,
        stdout: String::new(),
        stderr,
    };

    let mut last = ok(String::new());
    for part in command.split("&&") {
        let part = expand_env(part.trim(), env);
        let (program, rest) = part.split_once(' ').unwrap_or((part.as_str(), ""));
        let rest = rest.trim();

        last = match program {
            "true" | "mkdir" | "chown" | "chmod" => ok(String::new()),
            "hostname" => ok(format!("{}\n", name)),
            "echo" => {
                if let Some((text, target)) = rest.split_once('>') {
                    let target = unquote(target.trim_start_matches('>'));
                    container
                        .files
                        .insert(target, format!("{}\n", unquote(text)).into_bytes());
                    ok(String::new())
                } else {
                    ok(format!("{}\n", unquote(rest)))
                }
            }
            "cat" => match container.files.get(&unquote(rest)) {
                Some(content) => ok(String::from_utf8_lossy(content).into_owned()),
                None => fail(1, format!("cat: {}: No such file or directory\n", rest)),
            },
            "test" => {
                let (flag, path) = rest.split_once(' ').unwrap_or((rest, ""));
                let path = normalize(&unquote(path));
                let found = match flag {
                    "-f" => container.files.contains_key(&path),
                    _ => {
                        let prefix = format!("{}/", path);
                        container.files.keys().any(|k| k.starts_with(&prefix))
                    }
                };
                if found {
                    ok(String::new())
                } else {
                    fail(1, String::new())
                }
            }
            _ => fail(127, format!("{}: command not found\n", program)),
        };

        if !last.success() {
            break;
        }
    }
    last
}

impl ContainerRuntime for MemoryRuntime {
    fn available(&self) -> Result<()> {
        self.enter("available", "-")?;
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let state = self.enter("exists", name)?;
        Ok(state.containers.contains_key(name))
    }

    fn running(&self, name: &str) -> Result<bool> {
        let state = self.enter("running", name)?;
        Ok(state.containers.get(name).is_some_and(|c| c.running))
    }

    fn launch(&self, name: &str, options: &LaunchOptions) -> Result<()> {
        let mut state = self.enter("launch", name)?;
        if state.containers.contains_key(name) {
            return Err(BerthError::operation_failed(
                "init",
                name,
                "Error: Failed creating instance record: Instance already exists",
            ));
        }
        if !state.images.contains(&options.image) {
            return Err(BerthError::operation_failed(
                "init",
                name,
                format!("Error: Image \"{}\" not found", options.image),
            ));
        }
        let host = state.next_host;
        state.next_host += 1;
        state.containers.insert(
            name.to_string(),
            new_container(&options.image, options.ephemeral, true, options.idmap, host),
        );
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        let mut state = self.enter("start", name)?;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found("start", name))?;
        container.running = true;
        Ok(())
    }

    fn stop(&self, name: &str, _force: bool) -> Result<()> {
        let mut state = self.enter("stop", name)?;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found("stop", name))?;
        if !container.running {
            return Err(BerthError::operation_failed(
                "stop",
                name,
                "Error: The instance is already stopped",
            ));
        }
        container.running = false;
        if container.ephemeral {
            state.containers.remove(name);
        }
        Ok(())
    }

    fn delete(&self, name: &str, force: bool) -> Result<()> {
        let mut state = self.enter("delete", name)?;
        match state.containers.get(name) {
            None => Err(not_found("delete", name)),
            Some(c) if c.running && !force => Err(BerthError::operation_failed(
                "delete",
                name,
                "Error: The instance is currently running, stop it first or pass --force",
            )),
            Some(_) => {
                state.containers.remove(name);
                Ok(())
            }
        }
    }

    fn exec(&self, name: &str, command: &str, options: &ExecOptions) -> Result<ExecOutput> {
        let mut state = self.enter("exec", name)?;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found("exec", name))?;
        if !container.running {
            return Err(BerthError::operation_failed(
                "exec",
                name,
                "Error: Instance is not running",
            ));
        }
        Ok(run_command(name, container, command, &options.env))
    }

    fn create_file(&self, name: &str, path: &str, content: &str) -> Result<()> {
        let mut state = self.enter("create_file", name)?;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found("file create", name))?;
        container
            .files
            .insert(normalize(path), content.as_bytes().to_vec());
        Ok(())
    }

    fn push_dir_contents(&self, name: &str, source: &Path, dest: &str) -> Result<()> {
        let mut state = self.enter("push", name)?;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found("file push", name))?;
        let dest = normalize(dest);
        for entry in WalkDir::new(source).min_depth(1) {
            let entry = entry.map_err(|e| BerthError::IoError(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| BerthError::InvalidInput(e.to_string()))?;
            let content = fs::read(entry.path())?;
            container
                .files
                .insert(format!("{}/{}", dest, relative.to_string_lossy()), content);
        }
        Ok(())
    }

    fn pull_dir(&self, name: &str, source: &str, dest: &Path) -> Result<()> {
        let state = self.enter("pull", name)?;
        let container = state
            .containers
            .get(name)
            .ok_or_else(|| not_found("file pull", name))?;
        if dest.exists() {
            return Err(BerthError::InvalidInput(format!(
                "pull destination already exists: {}",
                dest.display()
            )));
        }
        let prefix = format!("{}/", normalize(source));
        fs::create_dir_all(dest)?;
        for (path, content) in &container.files {
            if let Some(relative) = path.strip_prefix(&prefix) {
                let target = dest.join(relative);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(target, content)?;
            }
        }
        Ok(())
    }

    fn mount_disk(&self, name: &str, mount: &DiskMount) -> Result<()> {
        let mut state = self.enter("mount", name)?;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found("config device add", name))?;
        if container.mounts.iter().any(|m| m.device == mount.device) {
            return Err(BerthError::operation_failed(
                "config device add",
                name,
                format!("Error: The device already exists: {}", mount.device),
            ));
        }
        container.mounts.push(mount.clone());
        Ok(())
    }

    fn create_snapshot(&self, name: &str, snapshot: &str, stateful: bool) -> Result<()> {
        let mut state = self.enter("snapshot_create", name)?;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found("snapshot create", name))?;
        if container.snapshots.iter().any(|(s, _)| s.name == snapshot) {
            return Err(BerthError::operation_failed(
                "snapshot create",
                name,
                "Error: Snapshot already exists",
            ));
        }
        let info = SnapshotInfo {
            name: snapshot.to_string(),
            created_at: Utc::now(),
            expires_at: None,
            stateful,
            description: String::new(),
        };
        let files = container.files.clone();
        container.snapshots.push((info, files));
        Ok(())
    }

    fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotInfo>> {
        let state = self.enter("snapshot_list", name)?;
        let container = state
            .containers
            .get(name)
            .ok_or_else(|| not_found("snapshot list", name))?;
        Ok(container.snapshots.iter().map(|(s, _)| s.clone()).collect())
    }

    fn restore_snapshot(&self, name: &str, snapshot: &str, _stateful: bool) -> Result<()> {
        let mut state = self.enter("snapshot_restore", name)?;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found("snapshot restore", name))?;
        let files = container
            .snapshots
            .iter()
            .find(|(s, _)| s.name == snapshot)
            .map(|(_, f)| f.clone())
            .ok_or_else(|| {
                BerthError::operation_failed("snapshot restore", name, "Error: Snapshot not found")
            })?;
        container.files = files;
        Ok(())
    }

    fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let mut state = self.enter("snapshot_delete", name)?;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found("snapshot delete", name))?;
        let before = container.snapshots.len();
        container.snapshots.retain(|(s, _)| s.name != snapshot);
        if container.snapshots.len() == before {
            return Err(BerthError::operation_failed(
                "snapshot delete",
                name,
                "Error: Snapshot not found",
            ));
        }
        Ok(())
    }

    fn image_exists(&self, alias: &str) -> Result<bool> {
        let state = self.enter("image_exists", alias)?;
        Ok(state.images.contains(alias))
    }

    fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let state = self.enter("list_images", "-")?;
        Ok(state
            .images
            .iter()
            .enumerate()
            .map(|(i, alias)| ImageInfo {
                fingerprint: format!("{:012x}", i + 1),
                aliases: vec![alias.clone()],
                size_bytes: 0,
                uploaded_at: None,
                description: String::new(),
            })
            .collect())
    }

    fn list_containers(&self, pattern: &str) -> Result<Vec<String>> {
        let state = self.enter("list", pattern)?;
        let re = Regex::new(pattern).map_err(|e| BerthError::InvalidInput(e.to_string()))?;
        Ok(state
            .containers
            .keys()
            .filter(|n| re.is_match(n))
            .cloned()
            .collect())
    }

    fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        let state = self.enter("list_instances", "-")?;
        Ok(state
            .containers
            .iter()
            .map(|(name, c)| InstanceInfo {
                name: name.clone(),
                status: if c.running { "Running" } else { "Stopped" }.to_string(),
                created_at: Some(c.created_at),
                image: Some(c.image.clone()),
                ipv4: if c.running { c.ipv4.into_iter().collect() } else { Vec::new() },
                host_interfaces: if c.running {
                    c.host_interface.iter().cloned().collect()
                } else {
                    Vec::new()
                },
            })
            .collect())
    }

    fn bridge_ipv4(&self, bridge: &str) -> Result<Option<String>> {
        let state = self.enter("bridge_ipv4", bridge)?;
        Ok(state.bridges.get(bridge).cloned())
    }
}
