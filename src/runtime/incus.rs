//! Incus CLI client
//!
//! Each primitive is one blocking `incus` invocation. There are no
//! internal timeouts: a hung daemon hangs the caller.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;

use super::{
    shell_quote, ContainerRuntime, DiskMount, ExecOptions, ExecOutput, ImageInfo, InstanceInfo,
    LaunchOptions, SnapshotInfo,
};
use crate::error::{BerthError, Result};

/// Default binary name.
pub const INCUS_BINARY: &str = "incus";

#[derive(Debug, Clone)]
pub struct IncusClient {
    binary: String,
}

impl Default for IncusClient {
    fn default() -> Self {
        Self::new()
    }
}

impl IncusClient {
    pub fn new() -> Self {
        Self {
            binary: INCUS_BINARY.to_string(),
        }
    }

    /// Use a custom binary path.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        debug!("{} {}", self.binary, args.join(" "));
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd
    }

    /// Run to completion with captured output, mapping failures to errors.
    fn run(&self, operation: &str, container: &str, args: &[String]) -> Result<Output> {
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| self.spawn_error(operation, container, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(operation, container, &stderr));
        }

        Ok(output)
    }

    fn run_stdout(&self, operation: &str, container: &str, args: &[String]) -> Result<String> {
        let output = self.run(operation, container, args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn spawn_error(&self, operation: &str, container: &str, err: std::io::Error) -> BerthError {
        if err.kind() == ErrorKind::NotFound {
            BerthError::runtime_unavailable(format!("`{}` binary not found in PATH", self.binary))
        } else {
            BerthError::operation_failed(operation, container, err.to_string())
        }
    }

    fn instance_status(&self, name: &str) -> Result<Option<String>> {
        let args = owned(&["list", &format!("^{}$", regex::escape(name)), "--format=json"]);
        let stdout = self.run_stdout("list", name, &args)?;
        let instances: Vec<RawInstance> = serde_json::from_str(&stdout)?;
        Ok(instances
            .into_iter()
            .find(|i| i.name == name)
            .map(|i| i.status))
    }

    fn push_file(&self, name: &str, source: &Path, dest: &str, recursive: bool) -> Result<()> {
        let mut args = owned(&["file", "push"]);
        if recursive {
            args.push("-r".to_string());
        }
        args.push("-p".to_string());
        args.push(source.to_string_lossy().to_string());
        args.push(format!("{}{}", name, dest_path(dest)));
        self.run("file push", name, &args)?;
        Ok(())
    }
}

impl ContainerRuntime for IncusClient {
    fn available(&self) -> Result<()> {
        self.run("info", "-", &owned(&["info"]))?;
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.instance_status(name)?.is_some())
    }

    fn running(&self, name: &str) -> Result<bool> {
        Ok(self
            .instance_status(name)?
            .is_some_and(|status| status.eq_ignore_ascii_case("running")))
    }

    fn launch(&self, name: &str, options: &LaunchOptions) -> Result<()> {
        // init + start rather than `launch` so raw.idmap is in place before first boot
        let mut args = owned(&["init", &options.image, name]);
        if options.ephemeral {
            args.push("--ephemeral".to_string());
        }
        if let Some(idmap) = &options.idmap {
            args.push("-c".to_string());
            args.push(format!("raw.idmap={}", idmap.to_raw_idmap()));
        }
        self.run("init", name, &args)?;
        self.start(name)
    }

    fn start(&self, name: &str) -> Result<()> {
        self.run("start", name, &owned(&["start", name]))?;
        Ok(())
    }

    fn stop(&self, name: &str, force: bool) -> Result<()> {
        let mut args = owned(&["stop", name]);
        if force {
            args.push("--force".to_string());
        }
        self.run("stop", name, &args)?;
        Ok(())
    }

    fn delete(&self, name: &str, force: bool) -> Result<()> {
        let mut args = owned(&["delete", name]);
        if force {
            args.push("--force".to_string());
        }
        self.run("delete", name, &args)?;
        Ok(())
    }

    fn exec(&self, name: &str, command: &str, options: &ExecOptions) -> Result<ExecOutput> {
        let args = exec_args(name, command, options);

        if options.interactive {
            let status = self
                .command(&args)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(|e| self.spawn_error("exec", name, e))?;
            return Ok(ExecOutput {
                status: status.code().unwrap_or(-1),
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        let output = self
            .command(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| self.spawn_error("exec", name, e))?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if is_unavailable_message(&stderr) {
            return Err(classify_failure("exec", name, &stderr));
        }

        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    fn create_file(&self, name: &str, path: &str, content: &str) -> Result<()> {
        let parent = Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| "/".to_string());
        let script = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(&parent),
            shell_quote(path)
        );
        let args = owned(&["exec", name, "--", "sh", "-c", &script]);

        let mut child = self
            .command(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error("file create", name, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("file create", name, &stderr));
        }
        Ok(())
    }

    fn push_dir_contents(&self, name: &str, source: &Path, dest: &str) -> Result<()> {
        let dest = dest.trim_end_matches('/');
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                // `push -r dir name/dest/` lands at dest/<dirname>
                self.push_file(name, &path, &format!("{}/", dest), true)?;
            } else {
                let file_name = entry.file_name().to_string_lossy().to_string();
                self.push_file(name, &path, &format!("{}/{}", dest, file_name), false)?;
            }
        }
        Ok(())
    }

    fn pull_dir(&self, name: &str, source: &str, dest: &Path) -> Result<()> {
        if dest.exists() {
            return Err(BerthError::InvalidInput(format!(
                "pull destination already exists: {}",
                dest.display()
            )));
        }

        // `pull -r name/src parent/` lands at parent/<basename>; stage it in a
        // scratch dir next to dest and move it into place.
        let scratch = dest.with_extension("pull");
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }
        fs::create_dir_all(&scratch)?;

        let source = source.trim_end_matches('/');
        let args = owned(&[
            "file",
            "pull",
            "-r",
            &format!("{}{}", name, dest_path(source)),
            &scratch.to_string_lossy(),
        ]);
        let pulled = self.run("file pull", name, &args).and_then(|_| {
            let base = Path::new(source)
                .file_name()
                .ok_or_else(|| BerthError::InvalidInput(format!("cannot pull {}", source)))?;
            fs::rename(scratch.join(base), dest)?;
            Ok(())
        });

        let _ = fs::remove_dir_all(&scratch);
        pulled
    }

    fn mount_disk(&self, name: &str, mount: &DiskMount) -> Result<()> {
        let mut args = owned(&[
            "config",
            "device",
            "add",
            name,
            &mount.device,
            "disk",
            &format!("source={}", mount.source.display()),
            &format!("path={}", mount.path),
        ]);
        if mount.shift {
            args.push("shift=true".to_string());
        }
        if mount.readonly {
            args.push("readonly=true".to_string());
        }
        self.run("config device add", name, &args)?;
        Ok(())
    }

    fn create_snapshot(&self, name: &str, snapshot: &str, stateful: bool) -> Result<()> {
        let mut args = owned(&["snapshot", "create", name, snapshot]);
        if stateful {
            args.push("--stateful".to_string());
        }
        self.run("snapshot create", name, &args)?;
        Ok(())
    }

    fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotInfo>> {
        let args = owned(&["snapshot", "list", name, "--format=json"]);
        let stdout = self.run_stdout("snapshot list", name, &args)?;
        let raw: Vec<RawSnapshot> = serde_json::from_str(&stdout)?;
        Ok(raw.into_iter().map(RawSnapshot::into_info).collect())
    }

    fn restore_snapshot(&self, name: &str, snapshot: &str, stateful: bool) -> Result<()> {
        let mut args = owned(&["snapshot", "restore", name, snapshot]);
        if stateful {
            args.push("--stateful".to_string());
        }
        self.run("snapshot restore", name, &args)?;
        Ok(())
    }

    fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let args = owned(&["snapshot", "delete", name, snapshot]);
        self.run("snapshot delete", name, &args)?;
        Ok(())
    }

    fn image_exists(&self, alias: &str) -> Result<bool> {
        Ok(self
            .list_images()?
            .iter()
            .any(|i| i.aliases.iter().any(|a| a == alias)))
    }

    fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let args = owned(&["image", "list", "--format=json"]);
        let stdout = self.run_stdout("image list", "-", &args)?;
        parse_images(&stdout)
    }

    fn list_containers(&self, pattern: &str) -> Result<Vec<String>> {
        let args = owned(&["list", pattern, "--format=csv", "--columns=n"]);
        let stdout = self.run_stdout("list", pattern, &args)?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        let stdout = self.run_stdout("list", "-", &owned(&["list", "--format=json"]))?;
        parse_instances(&stdout)
    }

    fn bridge_ipv4(&self, bridge: &str) -> Result<Option<String>> {
        let args = owned(&["network", "get", bridge, "ipv4.address"]);
        let stdout = self.run_stdout("network get", bridge, &args)?;
        let value = stdout.trim();
        if value.is_empty() || value == "none" {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// `name` + `/abs/path` form used by `incus file`.
fn dest_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn exec_args(name: &str, command: &str, options: &ExecOptions) -> Vec<String> {
    let mut args = owned(&["exec", name]);
    if let Some(uid) = options.user {
        args.push("--user".to_string());
        args.push(uid.to_string());
    }
    if let Some(gid) = options.group {
        args.push("--group".to_string());
        args.push(gid.to_string());
    }
    if let Some(cwd) = &options.cwd {
        args.push("--cwd".to_string());
        args.push(cwd.clone());
    }
    for (key, value) in &options.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(if options.interactive { "-t" } else { "-T" }.to_string());
    args.push("--".to_string());
    args.push("bash".to_string());
    args.push("-c".to_string());
    args.push(command.to_string());
    args
}

fn is_unavailable_message(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    (lower.contains("unix.socket") && lower.contains("permission denied"))
        || lower.contains("is the server running")
        || lower.contains("daemon doesn't appear to be started")
}

fn classify_failure(operation: &str, container: &str, stderr: &str) -> BerthError {
    if is_unavailable_message(stderr) {
        BerthError::runtime_unavailable(format!(
            "cannot reach the incus daemon: {}",
            stderr.trim()
        ))
    } else {
        BerthError::operation_failed(operation, container, stderr.trim())
    }
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    name: String,
    status: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    config: BTreeMap<String, String>,
    #[serde(default)]
    state: Option<RawState>,
}

#[derive(Debug, Deserialize)]
struct RawState {
    #[serde(default)]
    network: Option<BTreeMap<String, RawNetwork>>,
}

#[derive(Debug, Deserialize)]
struct RawNetwork {
    #[serde(default)]
    addresses: Vec<RawAddress>,
    #[serde(default)]
    host_name: String,
}

#[derive(Debug, Deserialize)]
struct RawAddress {
    family: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    name: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    stateful: bool,
    #[serde(default)]
    description: String,
}

impl RawSnapshot {
    fn into_info(self) -> SnapshotInfo {
        // Incus reports "never expires" as the zero time.
        let expires_at = self.expires_at.filter(|t| t.timestamp() > 0);
        SnapshotInfo {
            name: self.name,
            created_at: self.created_at,
            expires_at,
            stateful: self.stateful,
            description: self.description,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawImage {
    #[serde(default)]
    fingerprint: String,
    #[serde(default)]
    aliases: Vec<RawAlias>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    uploaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawAlias {
    name: String,
}

fn parse_images(json: &str) -> Result<Vec<ImageInfo>> {
    let raw: Vec<RawImage> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|i| ImageInfo {
            fingerprint: i.fingerprint,
            aliases: i.aliases.into_iter().map(|a| a.name).collect(),
            size_bytes: i.size,
            uploaded_at: i.uploaded_at.filter(|t| t.timestamp() > 0),
            description: i.properties.get("description").cloned().unwrap_or_default(),
        })
        .collect())
}

fn parse_instances(json: &str) -> Result<Vec<InstanceInfo>> {
    let raw: Vec<RawInstance> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|i| {
            let mut ipv4 = Vec::new();
            let mut host_interfaces = Vec::new();
            if let Some(networks) = i.state.and_then(|s| s.network) {
                for (iface, net) in networks {
                    if iface == "lo" {
                        continue;
                    }
                    if !net.host_name.is_empty() {
                        host_interfaces.push(net.host_name);
                    }
                    ipv4.extend(
                        net.addresses
                            .iter()
                            .filter(|a| a.family == "inet")
                            .filter_map(|a| a.address.parse::<Ipv4Addr>().ok()),
                    );
                }
            }
            InstanceInfo {
                name: i.name,
                status: i.status,
                created_at: i
                    .created_at
                    .and_then(|c| DateTime::parse_from_rfc3339(&c).ok())
                    .map(|c| c.with_timezone(&Utc)),
                image: i.config.get("image.description").cloned(),
                ipv4,
                host_interfaces,
            }
        })
        .collect())
}
