//! Session setup and cleanup
//!
//! `setup` turns a workspace (plus optional slot and resume id) into a
//! running container:
//!
//! 1. validate the workspace and the resume request
//! 2. pick the slot and derive the container name
//! 3. reuse a running container, start a stopped one, or launch a new one
//! 4. on a fresh launch only: attach mounts, create the state dir, restore
//! 5. bind a handle carrying the sandbox environment
//!
//! `cleanup` optionally saves the state dir, stops the container, and
//! deletes it unless it is persistent. Runtime failures during setup are
//! returned as-is; a half-provisioned container is left for `berth clean`.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use super::id::validate_session_id;
use super::naming::{container_name, list_workspace_sessions, WorkspaceId};
use super::slot::{allocate_slot_from, DEFAULT_MAX_SLOT};
use super::store::{SessionMetadata, SessionStore};
use crate::error::{BerthError, Result};
use crate::runtime::{
    shell_quote, ContainerHandle, ContainerRuntime, DiskMount, ExecOptions, IdMap, LaunchOptions,
};

/// Environment variable present only inside non-privileged sandboxes.
pub const SANDBOX_MARKER: &str = "BERTH_SANDBOX";

/// Fixed knobs shared by every session; normally built from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub prefix: String,
    pub image: String,
    pub privileged_image: String,
    pub sessions_dir: PathBuf,
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    /// State directory name, relative to `home`.
    pub state_dir: String,
    pub workspace_path: String,
    pub max_slot: u32,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            prefix: "berth-".to_string(),
            image: "berth-sandbox".to_string(),
            privileged_image: "berth-privileged".to_string(),
            sessions_dir: PathBuf::from(".berth/sessions"),
            user: "code".to_string(),
            uid: 1000,
            gid: 1000,
            home: "/home/code".to_string(),
            state_dir: ".claude".to_string(),
            workspace_path: "/workspace".to_string(),
            max_slot: DEFAULT_MAX_SLOT,
        }
    }
}

impl LifecycleSettings {
    /// Absolute path of the state directory inside the container.
    pub fn state_path(&self) -> String {
        format!("{}/{}", self.home.trim_end_matches('/'), self.state_dir)
    }
}

/// An extra host path to attach to a fresh container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraMount {
    pub host: PathBuf,
    pub container: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    pub workspace: PathBuf,
    /// Overrides the configured image for either mode.
    pub image: Option<String>,
    /// `None` scans for the lowest free slot.
    pub slot: Option<u32>,
    pub privileged: bool,
    pub persistent: bool,
    pub resume_from: Option<String>,
    /// Shared scratch directory mounted at `/storage`.
    pub storage_dir: Option<PathBuf>,
    /// Host `~/.ssh`, mounted read-only.
    pub ssh_dir: Option<PathBuf>,
    /// Host `~/.gitconfig`, mounted read-only.
    pub git_config: Option<PathBuf>,
    pub mounts: Vec<ExtraMount>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupOutcome {
    /// A new container was created and provisioned.
    Launched,
    /// A stopped persistent container was started again.
    Started,
    /// The container was already running.
    Reused,
}

#[derive(Debug, Clone)]
pub struct SetupResult {
    pub container_name: String,
    pub slot: u32,
    pub image: String,
    pub home_dir: String,
    pub workspace: PathBuf,
    pub outcome: SetupOutcome,
    /// Session restored into the container, if any.
    pub resumed: Option<String>,
    pub handle: ContainerHandle,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub container_name: String,
    /// Required when `save` is set.
    pub session_id: Option<String>,
    pub save: bool,
    pub persistent: bool,
    /// Recorded in the saved metadata.
    pub workspace: Option<PathBuf>,
    pub image: Option<String>,
}

pub struct Lifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    settings: LifecycleSettings,
    store: SessionStore,
}

impl Lifecycle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: LifecycleSettings) -> Self {
        let store = SessionStore::new(settings.sessions_dir.clone());
        Self {
            runtime,
            settings,
            store,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn allocate_slot_from(&self, workspace: &WorkspaceId, start: u32) -> Result<u32> {
        allocate_slot_from(
            self.runtime.as_ref(),
            &self.settings.prefix,
            workspace,
            start,
            self.settings.max_slot,
        )
    }

    pub fn container_name(&self, workspace: &WorkspaceId, slot: u32) -> String {
        container_name(&self.settings.prefix, workspace, slot)
    }

    pub fn workspace_containers(&self, workspace: &Path) -> Result<Vec<String>> {
        let workspace = WorkspaceId::from_path(workspace)?;
        list_workspace_sessions(self.runtime.as_ref(), &self.settings.prefix, &workspace)
    }

    pub fn setup(&self, options: &SetupOptions) -> Result<SetupResult> {
        let workspace = WorkspaceId::from_path(&options.workspace)?;
        if let Some(id) = &options.resume_from {
            self.check_resumable(id, &workspace)?;
        }

        let slot = match options.slot {
            Some(0) => return Err(BerthError::InvalidInput("slots start at 1".to_string())),
            Some(slot) => slot,
            None => self.allocate_slot_from(&workspace, 1)?,
        };
        let name = self.container_name(&workspace, slot);
        let image = options.image.clone().unwrap_or_else(|| {
            if options.privileged {
                self.settings.privileged_image.clone()
            } else {
                self.settings.image.clone()
            }
        });

        let runtime = self.runtime.as_ref();
        let outcome = if runtime.running(&name)? {
            info!("reusing running container {}", name);
            SetupOutcome::Reused
        } else if runtime.exists(&name)? {
            info!("starting stopped container {}", name);
            runtime.start(&name)?;
            SetupOutcome::Started
        } else {
            self.launch(&name, &image, &workspace, options)?;
            SetupOutcome::Launched
        };

        let mut resumed = None;
        if outcome == SetupOutcome::Launched {
            self.provision(&name, &workspace, options)?;
            if let Some(id) = &options.resume_from {
                self.restore(&name, id)?;
                resumed = Some(id.clone());
            }
        } else if let Some(id) = &options.resume_from {
            info!(
                "{} already holds its state; not restoring session {}",
                name, id
            );
        }

        let home_dir = self.settings.home.clone();
        let handle = ContainerHandle::new(self.runtime.clone(), name.clone())
            .with_env(self.session_env(&home_dir, options));

        Ok(SetupResult {
            container_name: name,
            slot,
            image,
            home_dir,
            workspace: workspace.path().to_path_buf(),
            outcome,
            resumed,
            handle,
        })
    }

    /// Save (optionally), stop, then delete unless persistent.
    ///
    /// A failed save does not keep the container alive: stop and delete
    /// still run and the save error is returned afterwards.
    pub fn cleanup(&self, options: &CleanupOptions) -> Result<()> {
        let name = options.container_name.as_str();
        let runtime = self.runtime.as_ref();
        if options.save && options.session_id.is_none() {
            return Err(BerthError::InvalidInput(
                "a session id is required to save".to_string(),
            ));
        }

        let saved = if options.save {
            self.save(options)
        } else {
            Ok(())
        };
        if let Err(e) = &saved {
            warn!("could not save session from {}: {}", name, e);
        }

        match runtime.stop(name, true) {
            Ok(()) => debug!("stopped {}", name),
            Err(e) if e.is_not_found() => debug!("{} already gone", name),
            Err(e) if e.to_string().contains("already stopped") => {
                debug!("{} already stopped", name)
            }
            Err(e) => warn!("could not stop {}: {}", name, e),
        }

        let deleted = if options.persistent {
            Ok(())
        } else {
            match runtime.delete(name, true) {
                Ok(()) => {
                    debug!("deleted {}", name);
                    Ok(())
                }
                // Ephemeral containers are removed by the runtime on stop.
                Err(e) if e.is_not_found() => {
                    debug!("{} already deleted", name);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        saved.and(deleted)
    }

    fn save(&self, options: &CleanupOptions) -> Result<()> {
        let name = options.container_name.as_str();
        let runtime = self.runtime.as_ref();
        let id = options.session_id.as_deref().ok_or_else(|| {
            BerthError::InvalidInput("a session id is required to save".to_string())
        })?;
        if !runtime.exists(name)? {
            return Err(BerthError::ContainerNotFound(name.to_string()));
        }
        let metadata = SessionMetadata {
            container_name: Some(name.to_string()),
            workspace: options.workspace.clone(),
            image: options.image.clone(),
            persistent: options.persistent,
            ..SessionMetadata::new(id)
        };
        self.store
            .save_from(runtime, name, &self.settings.state_path(), &metadata)?;
        info!("saved session {}", id);
        Ok(())
    }

    /// Pick the container a command should act on.
    ///
    /// Order: explicit name, `BERTH_CONTAINER`, then the single container
    /// belonging to `workspace`.
    pub fn resolve_container(
        &self,
        explicit: Option<&str>,
        from_env: Option<&str>,
        workspace: &Path,
    ) -> Result<String> {
        if let Some(name) = explicit.or(from_env).filter(|n| !n.is_empty()) {
            if !self.runtime.exists(name)? {
                return Err(BerthError::ContainerNotFound(name.to_string()));
            }
            return Ok(name.to_string());
        }

        let mut names = self.workspace_containers(workspace)?;
        match names.len() {
            0 => Err(BerthError::ContainerNotFound(format!(
                "no berth container for workspace {}",
                workspace.display()
            ))),
            1 => Ok(names.remove(0)),
            _ => Err(BerthError::InvalidInput(format!(
                "several containers belong to this workspace ({}); pick one with --container",
                names.join(", ")
            ))),
        }
    }

    fn check_resumable(&self, id: &str, workspace: &WorkspaceId) -> Result<()> {
        validate_session_id(id)?;
        if !self.store.exists(id) {
            return Err(BerthError::SessionNotFound(id.to_string()));
        }
        if let Some(saved) = self.store.load_metadata(id)?.and_then(|m| m.workspace) {
            if saved != workspace.path() {
                return Err(BerthError::WorkspaceMismatch {
                    session: id.to_string(),
                    saved,
                    requested: workspace.path().to_path_buf(),
                });
            }
        }
        Ok(())
    }

    fn launch(
        &self,
        name: &str,
        image: &str,
        workspace: &WorkspaceId,
        options: &SetupOptions,
    ) -> Result<()> {
        let runtime = self.runtime.as_ref();
        // Remote images (`remote:alias`) are fetched by incus on demand.
        if !image.contains(':') && !runtime.image_exists(image)? {
            return Err(BerthError::operation_failed(
                "launch",
                name,
                format!("image '{}' not found; build it first", image),
            ));
        }

        let (host_uid, host_gid) = host_ids(workspace.path())?;
        let launch = LaunchOptions {
            image: image.to_string(),
            ephemeral: !options.persistent,
            idmap: Some(IdMap {
                host_uid,
                host_gid,
                container_uid: self.settings.uid,
                container_gid: self.settings.gid,
            }),
        };
        info!(
            "launching {} from {} ({})",
            name,
            image,
            if options.persistent { "persistent" } else { "ephemeral" }
        );
        runtime.launch(name, &launch)
    }

    fn provision(&self, name: &str, workspace: &WorkspaceId, options: &SetupOptions) -> Result<()> {
        let home = self.settings.home.trim_end_matches('/');
        let mut mounts = vec![DiskMount {
            device: "workspace".to_string(),
            source: workspace.path().to_path_buf(),
            path: self.settings.workspace_path.clone(),
            shift: true,
            readonly: false,
        }];
        if let Some(dir) = &options.storage_dir {
            mounts.push(disk("storage", dir, "/storage", false));
        }
        if let Some(dir) = &options.ssh_dir {
            mounts.push(disk("ssh", dir, &format!("{}/.ssh", home), true));
        }
        if let Some(file) = &options.git_config {
            mounts.push(disk("gitconfig", file, &format!("{}/.gitconfig", home), true));
        }
        for (i, extra) in options.mounts.iter().enumerate() {
            mounts.push(disk(
                &format!("mount{}", i + 1),
                &extra.host,
                &extra.container,
                extra.readonly,
            ));
        }

        for mount in &mounts {
            if !mount.source.exists() {
                return Err(BerthError::InvalidInput(format!(
                    "mount source {} does not exist",
                    mount.source.display()
                )));
            }
            debug!("mounting {} at {}", mount.source.display(), mount.path);
            self.runtime.mount_disk(name, mount)?;
        }

        let state = shell_quote(&self.settings.state_path());
        self.run_as_root(
            name,
            &format!(
                "mkdir -p {} && chown {}:{} {}",
                state, self.settings.uid, self.settings.gid, state
            ),
        )
    }

    fn restore(&self, name: &str, id: &str) -> Result<()> {
        let state_path = self.settings.state_path();
        info!("restoring session {} into {}", id, name);
        self.store
            .restore_into(self.runtime.as_ref(), name, id, &state_path)?;
        self.run_as_root(
            name,
            &format!(
                "chown -R {}:{} {}",
                self.settings.uid,
                self.settings.gid,
                shell_quote(&state_path)
            ),
        )
    }

    fn run_as_root(&self, name: &str, command: &str) -> Result<()> {
        let output = self.runtime.exec(name, command, &ExecOptions::default())?;
        if !output.success() {
            return Err(BerthError::operation_failed(
                "exec",
                name,
                format!(
                    "`{}` exited with status {}: {}",
                    command,
                    output.status,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(())
    }

    fn session_env(&self, home: &str, options: &SetupOptions) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), home.to_string());
        env.insert("USER".to_string(), self.settings.user.clone());
        if !options.privileged {
            env.insert(SANDBOX_MARKER.to_string(), "1".to_string());
        }
        for (key, value) in &options.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

fn disk(device: &str, source: &Path, path: &str, readonly: bool) -> DiskMount {
    DiskMount {
        device: device.to_string(),
        source: source.to_path_buf(),
        path: path.to_string(),
        shift: true,
        readonly,
    }
}

/// Owner of the workspace on the host; mapped onto the sandbox user.
fn host_ids(workspace: &Path) -> Result<(u32, u32)> {
    let metadata = fs::metadata(workspace)?;
    Ok((metadata.uid(), metadata.gid()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MemoryRuntime;
    use std::fs;
    use std::thread;
    use tempfile::TempDir;

    struct Fixture {
        runtime: Arc<MemoryRuntime>,
        lifecycle: Lifecycle,
        workspace: TempDir,
        _sessions: TempDir,
    }

    fn fixture() -> Fixture {
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.add_image("berth-sandbox");
        runtime.add_image("berth-privileged");
        let sessions = TempDir::new().unwrap();
        let settings = LifecycleSettings {
            sessions_dir: sessions.path().to_path_buf(),
            ..LifecycleSettings::default()
        };
        Fixture {
            lifecycle: Lifecycle::new(runtime.clone(), settings),
            runtime,
            workspace: TempDir::new().unwrap(),
            _sessions: sessions,
        }
    }

    fn options(f: &Fixture) -> SetupOptions {
        SetupOptions {
            workspace: f.workspace.path().to_path_buf(),
            ..SetupOptions::default()
        }
    }

    fn workspace_id(f: &Fixture) -> WorkspaceId {
        WorkspaceId::from_path(f.workspace.path()).unwrap()
    }

    fn cleanup_of(result: &SetupResult) -> CleanupOptions {
        CleanupOptions {
            container_name: result.container_name.clone(),
            workspace: Some(result.workspace.clone()),
            image: Some(result.image.clone()),
            ..CleanupOptions::default()
        }
    }

    #[test]
    fn test_setup_launches_and_provisions() {
        let f = fixture();
        let result = f.lifecycle.setup(&options(&f)).unwrap();

        assert_eq!(result.slot, 1);
        assert_eq!(result.outcome, SetupOutcome::Launched);
        assert_eq!(result.image, "berth-sandbox");
        assert_eq!(result.home_dir, "/home/code");
        assert!(f.runtime.running(&result.container_name).unwrap());

        let container = f.runtime.container(&result.container_name).unwrap();
        assert!(container.ephemeral);
        assert_eq!(container.idmap.map(|m| m.container_uid), Some(1000));

        let mounts = f.runtime.mounts(&result.container_name);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].path, "/workspace");
        assert!(mounts[0].shift);
        assert_eq!(
            mounts[0].source,
            f.workspace.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_setup_invalid_workspace() {
        let f = fixture();
        let opts = SetupOptions {
            workspace: f.workspace.path().join("missing"),
            ..SetupOptions::default()
        };
        assert!(matches!(
            f.lifecycle.setup(&opts),
            Err(BerthError::InvalidWorkspace(_))
        ));
        assert_eq!(f.runtime.call_count("launch"), 0);
    }

    #[test]
    fn test_setup_is_idempotent() {
        let f = fixture();
        let opts = SetupOptions {
            slot: Some(1),
            ..options(&f)
        };
        let first = f.lifecycle.setup(&opts).unwrap();
        let second = f.lifecycle.setup(&opts).unwrap();

        assert_eq!(first.container_name, second.container_name);
        assert_eq!(second.outcome, SetupOutcome::Reused);
        assert_eq!(f.runtime.call_count("launch"), 1);
        assert_eq!(f.runtime.call_count("mount"), 1);
        assert_eq!(f.runtime.mounts(&first.container_name).len(), 1);
    }

    #[test]
    fn test_auto_slot_skips_occupied() {
        let f = fixture();
        let first = f.lifecycle.setup(&options(&f)).unwrap();
        let second = f.lifecycle.setup(&options(&f)).unwrap();
        assert_eq!(first.slot, 1);
        assert_eq!(second.slot, 2);
        assert_ne!(first.container_name, second.container_name);
    }

    #[test]
    fn test_sandbox_marker_only_without_privileged() {
        let f = fixture();
        let sandbox = f.lifecycle.setup(&options(&f)).unwrap();
        let privileged = f
            .lifecycle
            .setup(&SetupOptions {
                privileged: true,
                ..options(&f)
            })
            .unwrap();

        assert_eq!(
            sandbox.handle.env().get(SANDBOX_MARKER).map(String::as_str),
            Some("1")
        );
        assert!(!privileged.handle.env().contains_key(SANDBOX_MARKER));
        assert_eq!(privileged.image, "berth-privileged");

        let out = sandbox
            .handle
            .exec_capture("echo $BERTH_SANDBOX", &ExecOptions::default())
            .unwrap();
        assert_eq!(out, "1\n");
    }

    #[test]
    fn test_missing_image_is_reported_before_launch() {
        let f = fixture();
        let opts = SetupOptions {
            image: Some("nope".to_string()),
            ..options(&f)
        };
        let err = f.lifecycle.setup(&opts).unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert_eq!(f.runtime.call_count("launch"), 0);
    }

    #[test]
    fn test_optional_mounts() {
        let f = fixture();
        let storage = TempDir::new().unwrap();
        let extra = TempDir::new().unwrap();
        let host_home = TempDir::new().unwrap();
        let ssh = host_home.path().join(".ssh");
        fs::create_dir(&ssh).unwrap();
        let gitconfig = host_home.path().join(".gitconfig");
        fs::write(&gitconfig, "[user]\n\tname = Someone\n").unwrap();

        let opts = SetupOptions {
            storage_dir: Some(storage.path().to_path_buf()),
            ssh_dir: Some(ssh.clone()),
            git_config: Some(gitconfig.clone()),
            mounts: vec![ExtraMount {
                host: extra.path().to_path_buf(),
                container: "/data".to_string(),
                readonly: true,
            }],
            ..options(&f)
        };
        let result = f.lifecycle.setup(&opts).unwrap();
        let mounts = f.runtime.mounts(&result.container_name);
        let paths: Vec<&str> = mounts.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/workspace",
                "/storage",
                "/home/code/.ssh",
                "/home/code/.gitconfig",
                "/data"
            ]
        );
        let devices: Vec<&str> = mounts.iter().map(|m| m.device.as_str()).collect();
        assert_eq!(devices, vec!["workspace", "storage", "ssh", "gitconfig", "mount1"]);
        assert!(!mounts[1].readonly);
        assert!(mounts[2].readonly);
        assert_eq!(mounts[2].source, ssh);
        assert!(mounts[3].readonly);
        assert_eq!(mounts[3].source, gitconfig);
        assert!(mounts[4].readonly);
        assert!(mounts.iter().all(|m| m.shift));
    }

    #[test]
    fn test_missing_ssh_dir_is_rejected() {
        let f = fixture();
        let opts = SetupOptions {
            ssh_dir: Some(f.workspace.path().join("no-such-ssh")),
            ..options(&f)
        };
        let err = f.lifecycle.setup(&opts).unwrap_err();
        assert!(err.to_string().contains("no-such-ssh"));
    }

    #[test]
    fn test_ephemeral_and_persistent_diverge_on_cleanup() {
        let f = fixture();
        let ephemeral = f
            .lifecycle
            .setup(&SetupOptions {
                slot: Some(1),
                ..options(&f)
            })
            .unwrap();
        let persistent = f
            .lifecycle
            .setup(&SetupOptions {
                slot: Some(2),
                persistent: true,
                ..options(&f)
            })
            .unwrap();

        f.lifecycle.cleanup(&cleanup_of(&ephemeral)).unwrap();
        f.lifecycle
            .cleanup(&CleanupOptions {
                persistent: true,
                ..cleanup_of(&persistent)
            })
            .unwrap();

        assert!(!f.runtime.exists(&ephemeral.container_name).unwrap());
        assert!(f.runtime.exists(&persistent.container_name).unwrap());
        assert!(!f.runtime.running(&persistent.container_name).unwrap());
    }

    #[test]
    fn test_persistent_restart_skips_provisioning() {
        let f = fixture();
        let opts = SetupOptions {
            slot: Some(1),
            persistent: true,
            ..options(&f)
        };
        let first = f.lifecycle.setup(&opts).unwrap();
        f.lifecycle
            .cleanup(&CleanupOptions {
                persistent: true,
                ..cleanup_of(&first)
            })
            .unwrap();

        let again = f.lifecycle.setup(&opts).unwrap();
        assert_eq!(again.outcome, SetupOutcome::Started);
        assert_eq!(again.container_name, first.container_name);
        assert_eq!(f.runtime.call_count("mount"), 1);
        assert!(f.runtime.running(&again.container_name).unwrap());
    }

    #[test]
    fn test_cleanup_is_idempotent_when_container_gone() {
        let f = fixture();
        let result = f.lifecycle.setup(&options(&f)).unwrap();
        f.runtime.remove_container(&result.container_name);
        f.lifecycle.cleanup(&cleanup_of(&result)).unwrap();
        f.lifecycle.cleanup(&cleanup_of(&result)).unwrap();
    }

    #[test]
    fn test_save_requires_session_id() {
        let f = fixture();
        let result = f.lifecycle.setup(&options(&f)).unwrap();
        let err = f
            .lifecycle
            .cleanup(&CleanupOptions {
                save: true,
                ..cleanup_of(&result)
            })
            .unwrap_err();
        assert!(matches!(err, BerthError::InvalidInput(_)));
        assert!(f.runtime.exists(&result.container_name).unwrap());
    }

    #[test]
    fn test_failed_save_still_stops_and_deletes() {
        let f = fixture();
        let result = f.lifecycle.setup(&options(&f)).unwrap();
        f.runtime.fail_on("pull", "disk full");

        let err = f
            .lifecycle
            .cleanup(&CleanupOptions {
                save: true,
                session_id: Some("lost".to_string()),
                ..cleanup_of(&result)
            })
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(!f.runtime.exists(&result.container_name).unwrap());
        assert!(!f.lifecycle.store().exists("lost"));
        assert_eq!(f.lifecycle.allocate_slot_from(&workspace_id(&f), 1).unwrap(), 1);
    }

    #[test]
    fn test_failed_save_keeps_persistent_container_stopped() {
        let f = fixture();
        let result = f
            .lifecycle
            .setup(&SetupOptions {
                persistent: true,
                ..options(&f)
            })
            .unwrap();
        f.runtime.fail_on("pull", "disk full");

        let cleanup = CleanupOptions {
            save: true,
            persistent: true,
            session_id: Some("s".to_string()),
            ..cleanup_of(&result)
        };
        assert!(f.lifecycle.cleanup(&cleanup).is_err());
        assert!(f.runtime.exists(&result.container_name).unwrap());
        assert!(!f.runtime.running(&result.container_name).unwrap());
    }

    #[test]
    fn test_idmap_maps_workspace_owner_to_sandbox_ids() {
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.add_image("berth-sandbox");
        let sessions = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let lifecycle = Lifecycle::new(
            runtime.clone(),
            LifecycleSettings {
                sessions_dir: sessions.path().to_path_buf(),
                uid: 1500,
                gid: 2500,
                ..LifecycleSettings::default()
            },
        );
        let result = lifecycle
            .setup(&SetupOptions {
                workspace: workspace.path().to_path_buf(),
                ..SetupOptions::default()
            })
            .unwrap();

        let owner = fs::metadata(workspace.path()).unwrap();
        let idmap = runtime.container(&result.container_name).unwrap().idmap.unwrap();
        assert_eq!(idmap.host_uid, owner.uid());
        assert_eq!(idmap.host_gid, owner.gid());
        assert_eq!(idmap.container_uid, 1500);
        assert_eq!(idmap.container_gid, 2500);
    }

    #[test]
    fn test_save_and_resume_round_trip() {
        let f = fixture();
        let first = f.lifecycle.setup(&options(&f)).unwrap();
        first
            .handle
            .create_file("/home/code/.claude/memory/f.txt", "content c")
            .unwrap();

        f.lifecycle
            .cleanup(&CleanupOptions {
                save: true,
                session_id: Some("session-a".to_string()),
                ..cleanup_of(&first)
            })
            .unwrap();
        assert!(!f.runtime.exists(&first.container_name).unwrap());

        let meta = f.lifecycle.store().load_metadata("session-a").unwrap().unwrap();
        assert_eq!(meta.workspace.as_deref(), Some(first.workspace.as_path()));
        assert_eq!(meta.container_name.as_deref(), Some(first.container_name.as_str()));

        let resumed = f
            .lifecycle
            .setup(&SetupOptions {
                resume_from: Some("session-a".to_string()),
                slot: Some(3),
                ..options(&f)
            })
            .unwrap();
        assert_eq!(resumed.resumed.as_deref(), Some("session-a"));
        let out = resumed
            .handle
            .exec_capture("cat /home/code/.claude/memory/f.txt", &ExecOptions::default())
            .unwrap();
        assert_eq!(out, "content c");
    }

    #[test]
    fn test_resume_unknown_session() {
        let f = fixture();
        let err = f
            .lifecycle
            .setup(&SetupOptions {
                resume_from: Some("does-not-exist".to_string()),
                ..options(&f)
            })
            .unwrap_err();
        assert!(matches!(err, BerthError::SessionNotFound(_)));
        assert_eq!(f.runtime.call_count("launch"), 0);
    }

    #[test]
    fn test_resume_into_other_workspace_fails() {
        let f = fixture();
        let first = f.lifecycle.setup(&options(&f)).unwrap();
        f.lifecycle
            .cleanup(&CleanupOptions {
                save: true,
                session_id: Some("s1".to_string()),
                ..cleanup_of(&first)
            })
            .unwrap();

        let other = TempDir::new().unwrap();
        let err = f
            .lifecycle
            .setup(&SetupOptions {
                workspace: other.path().to_path_buf(),
                resume_from: Some("s1".to_string()),
                ..SetupOptions::default()
            })
            .unwrap_err();
        assert!(matches!(err, BerthError::WorkspaceMismatch { .. }));
        assert!(err.to_string().contains("workspace"));
    }

    #[test]
    fn test_resume_empty_session_without_metadata() {
        let f = fixture();
        let state = f.lifecycle.store().state_dir("bare").unwrap();
        fs::create_dir_all(state).unwrap();

        let result = f
            .lifecycle
            .setup(&SetupOptions {
                resume_from: Some("bare".to_string()),
                ..options(&f)
            })
            .unwrap();
        assert_eq!(result.resumed.as_deref(), Some("bare"));
    }

    #[test]
    fn test_resume_into_running_container_does_not_restore() {
        let f = fixture();
        let state = f.lifecycle.store().state_dir("s2").unwrap();
        fs::create_dir_all(&state).unwrap();
        fs::write(state.join("x"), "saved").unwrap();

        let opts = SetupOptions {
            slot: Some(1),
            ..options(&f)
        };
        let first = f.lifecycle.setup(&opts).unwrap();
        let again = f
            .lifecycle
            .setup(&SetupOptions {
                resume_from: Some("s2".to_string()),
                ..opts
            })
            .unwrap();
        assert_eq!(again.outcome, SetupOutcome::Reused);
        assert_eq!(again.resumed, None);
        assert_eq!(f.runtime.file(&first.container_name, "/home/code/.claude/x"), None);
    }

    #[test]
    fn test_setup_failure_is_surfaced_without_rollback() {
        let f = fixture();
        f.runtime.fail_on("mount", "device busy");
        let err = f.lifecycle.setup(&options(&f)).unwrap_err();
        assert!(matches!(err, BerthError::RuntimeOperationFailed { .. }));
        assert!(err.to_string().contains("device busy"));
        assert_eq!(f.runtime.call_count("delete"), 0);
        assert_eq!(f.runtime.container_names().len(), 1);
    }

    #[test]
    fn test_concurrent_setups_on_distinct_slots() {
        let f = fixture();
        let lifecycle = Arc::new(f.lifecycle);
        let workspace = f.workspace.path().to_path_buf();

        let threads: Vec<_> = (1..=3)
            .map(|slot| {
                let lifecycle = lifecycle.clone();
                let workspace = workspace.clone();
                thread::spawn(move || {
                    let result = lifecycle
                        .setup(&SetupOptions {
                            workspace,
                            slot: Some(slot),
                            ..SetupOptions::default()
                        })
                        .unwrap();
                    let out = result
                        .handle
                        .exec_capture(&format!("echo slot-{}", slot), &ExecOptions::default())
                        .unwrap();
                    assert_eq!(out, format!("slot-{}\n", slot));
                    result.container_name
                })
            })
            .collect();

        let mut names: Vec<String> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
        assert_eq!(f.runtime.container_names().len(), 3);
    }

    #[test]
    fn test_resolve_container() {
        let f = fixture();
        assert!(matches!(
            f.lifecycle.resolve_container(None, None, f.workspace.path()),
            Err(BerthError::ContainerNotFound(_))
        ));

        let one = f.lifecycle.setup(&options(&f)).unwrap();
        assert_eq!(
            f.lifecycle
                .resolve_container(None, None, f.workspace.path())
                .unwrap(),
            one.container_name
        );

        let two = f.lifecycle.setup(&options(&f)).unwrap();
        assert!(f
            .lifecycle
            .resolve_container(None, None, f.workspace.path())
            .is_err());
        assert_eq!(
            f.lifecycle
                .resolve_container(None, Some(&two.container_name), f.workspace.path())
                .unwrap(),
            two.container_name
        );
        assert_eq!(
            f.lifecycle
                .resolve_container(
                    Some(&one.container_name),
                    Some(&two.container_name),
                    f.workspace.path()
                )
                .unwrap(),
            one.container_name
        );
        assert!(f
            .lifecycle
            .resolve_container(Some("ghost"), None, f.workspace.path())
            .is_err());
    }
}
