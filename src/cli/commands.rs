//! Subcommand implementations
//!
//! Each command takes a [`Context`] so it can run against any
//! [`ContainerRuntime`]; `main` wires in the Incus client.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use regex::Regex;
use walkdir::WalkDir;

use super::args::{Args, SnapshotCommand};
use crate::config::provider::{check_credentials_mount, detect_provider, ProviderDetection};
use crate::config::Config;
use crate::error::{BerthError, Result};
use crate::images;
use crate::orphan::{self, HostNetwork};
use crate::output::{CleanReport, OutputFormat, Report, SessionDetail};
use crate::runtime::{ContainerRuntime, ExecOptions, IncusClient};
use crate::session::naming::prefix_pattern;
use crate::session::{
    generate_session_id, CleanupOptions, Lifecycle, SetupOptions, SetupOutcome, SetupResult,
    WorkspaceId,
};
use crate::snapshot;

/// Environment variable naming the container for attach and snapshot commands.
pub const CONTAINER_ENV: &str = "BERTH_CONTAINER";

pub struct Context {
    pub config: Config,
    pub lifecycle: Lifecycle,
    pub workspace: PathBuf,
    pub format: OutputFormat,
}

impl Context {
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        workspace: PathBuf,
        format: OutputFormat,
    ) -> Self {
        let lifecycle = Lifecycle::new(runtime, config.lifecycle_settings());
        Self {
            config,
            lifecycle,
            workspace,
            format,
        }
    }

    /// Context for the real host: config layers for the workspace and the Incus client.
    pub fn from_args(args: &Args) -> Result<Self> {
        let workspace = match &args.workspace {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let config = Config::load(Some(&workspace))?;
        Ok(Self::new(
            config,
            Arc::new(IncusClient::new()),
            workspace,
            OutputFormat::from_json_flag(args.json),
        ))
    }

    fn runtime(&self) -> &dyn ContainerRuntime {
        self.lifecycle.runtime().as_ref()
    }

    fn resolve_container(&self, explicit: Option<&str>) -> Result<String> {
        let from_env = std::env::var(CONTAINER_ENV).ok();
        self.lifecycle
            .resolve_container(explicit, from_env.as_deref(), &self.workspace)
    }

    fn managed_containers(&self) -> Result<Vec<crate::runtime::InstanceInfo>> {
        let re = Regex::new(&prefix_pattern(&self.config.container.prefix))
            .map_err(|e| BerthError::InvalidInput(e.to_string()))?;
        Ok(self
            .runtime()
            .list_instances()?
            .into_iter()
            .filter(|i| re.is_match(&i.name))
            .collect())
    }
}

/// Ask a yes/no question on stderr; anything but `y` is no.
pub fn prompt_confirm(question: &str) -> bool {
    eprint!("{} [y/N]: ", question);
    let _ = io::stderr().flush();
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim(), "y" | "Y")
}

/// Keep Ctrl-C from killing berth while a sandbox is attached, so cleanup still runs.
pub fn install_interrupt_guard() -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| BerthError::InvalidInput(format!("Failed to set Ctrl-C handler: {}", e)))?;
    Ok(interrupted)
}

/// Exit status for a session that may have seen Ctrl-C. Cleanup has already
/// run by the time this is called; an interrupted run that would otherwise
/// report success exits with 130.
pub fn exit_code_after_interrupt(interrupted: &AtomicBool, code: i32) -> i32 {
    if !interrupted.load(Ordering::SeqCst) {
        return code;
    }
    eprintln!("Interrupted; the sandbox was cleaned up.");
    if code == 0 {
        130
    } else {
        code
    }
}

fn resolve_resume(ctx: &Context, args: &Args) -> Result<Option<String>> {
    if let Some(id) = &args.resume {
        return Ok(Some(id.clone()));
    }
    if !args.continue_session {
        return Ok(None);
    }
    let workspace = WorkspaceId::from_path(&ctx.workspace)?;
    ctx.lifecycle
        .store()
        .latest_for_workspace(workspace.path())?
        .map(Some)
        .ok_or_else(|| {
            BerthError::SessionNotFound(format!(
                "no saved session for workspace {}",
                workspace.path().display()
            ))
        })
}

fn warn_on_provider_setup(config: &Config) {
    let Some(home) = dirs::home_dir() else {
        return;
    };
    let settings = home.join(&config.container.state_dir).join("settings.json");
    match detect_provider(&settings) {
        Ok(ProviderDetection::Present(kind)) => {
            if let Some(issue) =
                check_credentials_mount(&kind, &config.mounts, &home, &config.container.home)
            {
                eprintln!("{}", issue);
            }
        }
        Ok(ProviderDetection::Absent) => {}
        Err(e) => warn!("could not read {}: {}", settings.display(), e),
    }
}

/// SSH directory to mount: the configured one, or `~/.ssh` when `--ssh` is given.
fn ssh_dir(config: &Config, requested: bool) -> Option<PathBuf> {
    config
        .ssh_dir()
        .or_else(|| requested.then(|| dirs::home_dir().map(|h| h.join(".ssh"))).flatten())
}

fn host_git_config() -> Option<PathBuf> {
    dirs::home_dir()
        .map(|h| h.join(".gitconfig"))
        .filter(|p| p.is_file())
}

/// Build setup options for `run`/`shell` from flags and config.
pub fn setup_options(ctx: &Context, args: &Args) -> Result<SetupOptions> {
    Ok(SetupOptions {
        workspace: ctx.workspace.clone(),
        image: args.image.clone(),
        slot: args.slot,
        privileged: args.privileged,
        persistent: args.persistent || ctx.config.defaults.persistent,
        resume_from: resolve_resume(ctx, args)?,
        storage_dir: ctx.config.storage_dir().filter(|p| p.is_dir()),
        ssh_dir: ssh_dir(&ctx.config, args.ssh),
        git_config: host_git_config(),
        mounts: ctx.config.extra_mounts(),
        env: BTreeMap::new(),
    })
}

/// Session id to save under when the sandbox exits.
///
/// A resumed session is saved back under its own id. When the container
/// already existed the saved state was not restored into it, so saving
/// under the requested id would replace that session with unrelated state;
/// a fresh id is used instead.
fn session_to_save(requested: Option<&str>, result: &SetupResult) -> String {
    match (requested, result.resumed.as_deref()) {
        (_, Some(resumed)) => resumed.to_string(),
        (Some(requested), None) => {
            let fresh = generate_session_id();
            eprintln!(
                "Warning: {} already existed, so session {} was not restored into it and stays unchanged. \
                 This run will be saved as {}",
                result.container_name, requested, fresh
            );
            fresh
        }
        (None, None) => generate_session_id(),
    }
}

/// Set up a sandbox, run `command` (or a login shell) in it, then clean up.
///
/// Returns the exit status of the command.
pub fn run_session(ctx: &Context, args: &Args, command: Option<&str>) -> Result<i32> {
    let options = setup_options(ctx, args)?;
    warn_on_provider_setup(&ctx.config);

    let result = ctx.lifecycle.setup(&options)?;
    let session_id = session_to_save(options.resume_from.as_deref(), &result);

    let verb = match result.outcome {
        SetupOutcome::Launched => "Launched",
        SetupOutcome::Started => "Started",
        SetupOutcome::Reused => "Reusing",
    };
    eprintln!(
        "{} {} (slot {}, session {})",
        verb, result.container_name, result.slot, session_id
    );

    let settings = ctx.lifecycle.settings();
    let exec_options = ExecOptions {
        interactive: true,
        ..ExecOptions::as_user(settings.uid, settings.gid)
    }
    .with_cwd(settings.workspace_path.clone());
    let command = command.unwrap_or("exec bash -l");

    let outcome = result.handle.exec(command, &exec_options);

    let save = args.save_session();
    let cleanup = ctx.lifecycle.cleanup(&CleanupOptions {
        container_name: result.container_name.clone(),
        session_id: Some(session_id.clone()),
        save,
        persistent: options.persistent,
        workspace: Some(result.workspace.clone()),
        image: Some(result.image.clone()),
    });

    let output = outcome?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    cleanup?;

    if save {
        eprintln!(
            "Session saved: {}\nResume with: berth shell --resume {}",
            session_id, session_id
        );
    }
    if options.persistent {
        eprintln!("Container kept (stopped): {}", result.container_name);
    }
    Ok(output.status)
}

/// Interactive shell in an existing container.
pub fn attach(ctx: &Context, name: Option<&str>) -> Result<i32> {
    let name = ctx.resolve_container(name)?;
    if !ctx.runtime().running(&name)? {
        return Err(BerthError::InvalidInput(format!(
            "container '{}' is not running (start it with: incus start {})",
            name, name
        )));
    }
    let settings = ctx.lifecycle.settings();
    let mut options = ExecOptions {
        interactive: true,
        ..ExecOptions::as_user(settings.uid, settings.gid)
    }
    .with_cwd(settings.workspace_path.clone());
    options.env.insert("HOME".to_string(), settings.home.clone());
    options.env.insert("USER".to_string(), settings.user.clone());

    let output = ctx.runtime().exec(&name, "exec bash -l", &options)?;
    Ok(output.status)
}

pub fn list(ctx: &Context, all: bool) -> Result<Report> {
    let containers = ctx.managed_containers()?;
    let sessions = if all {
        Some(ctx.lifecycle.store().list()?)
    } else {
        None
    };
    Ok(Report::Listing {
        containers,
        sessions,
    })
}

pub fn images(ctx: &Context, all: bool) -> Result<Report> {
    Ok(Report::Images(images::report(
        ctx.runtime(),
        ctx.lifecycle.settings(),
        all,
    )?))
}

pub fn session_info(ctx: &Context, id: &str) -> Result<Report> {
    let store = ctx.lifecycle.store();
    if !store.exists(id) {
        return Err(BerthError::SessionNotFound(id.to_string()));
    }
    let path = store.session_dir(id)?;
    let state = store.state_dir(id)?;
    let (size_bytes, file_count) = WalkDir::new(&state)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .fold((0u64, 0usize), |(size, count), e| {
            let len = e.metadata().map(|m| m.len()).unwrap_or(0);
            (size + len, count + 1)
        });

    Ok(Report::Session(SessionDetail {
        id: id.to_string(),
        metadata: store.load_metadata(id)?,
        path,
        size_bytes,
        file_count,
    }))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanOptions {
    pub all: bool,
    pub sessions: bool,
    pub orphans: bool,
    pub dry_run: bool,
    pub force: bool,
}

impl CleanOptions {
    /// With no selector flags only stopped containers are cleaned.
    fn containers(&self) -> bool {
        self.all || (!self.sessions && !self.orphans)
    }

    fn sessions(&self) -> bool {
        self.all || self.sessions
    }

    fn orphans(&self) -> bool {
        self.all || self.orphans
    }
}

/// Clean stopped containers, saved sessions and orphans.
///
/// Phases run independently; a failed orphan scan is recorded in the
/// report and does not stop the other phases.
pub fn clean(
    ctx: &Context,
    options: CleanOptions,
    host: &dyn HostNetwork,
    confirm: &mut dyn FnMut(&str) -> bool,
    logger: &mut dyn FnMut(&str),
) -> Result<CleanReport> {
    let mut report = CleanReport {
        dry_run: options.dry_run,
        ..CleanReport::default()
    };
    let act = |question: &str, confirm: &mut dyn FnMut(&str) -> bool| {
        !options.dry_run && (options.force || confirm(question))
    };

    if options.containers() {
        report.stopped_containers = ctx
            .managed_containers()?
            .into_iter()
            .filter(|i| i.is_stopped())
            .map(|i| i.name)
            .collect();

        if !report.stopped_containers.is_empty() {
            if act("Delete these containers?", &mut *confirm) {
                for name in &report.stopped_containers {
                    match ctx.runtime().delete(name, true) {
                        Ok(()) => {
                            logger(&format!("Deleted container {}", name));
                            report.cleaned += 1;
                        }
                        Err(e) => logger(&format!("Warning: failed to delete {}: {}", name, e)),
                    }
                }
            } else if !options.dry_run {
                report.cancelled = true;
                return Ok(report);
            }
        }
    }

    if options.sessions() {
        let store = ctx.lifecycle.store();
        report.sessions = store.list()?.into_iter().map(|s| s.id).collect();

        if !report.sessions.is_empty() {
            if act("Delete all saved session data?", &mut *confirm) {
                for id in &report.sessions {
                    match store.delete(id) {
                        Ok(()) => {
                            logger(&format!("Deleted session {}", id));
                            report.cleaned += 1;
                        }
                        Err(e) => logger(&format!("Warning: failed to delete {}: {}", id, e)),
                    }
                }
            } else if !options.dry_run {
                report.cancelled = true;
                return Ok(report);
            }
        }
    }

    if options.orphans() {
        match orphan::detect_all(ctx.runtime(), host, &ctx.config.network_settings()) {
            Ok(set) => {
                if !set.is_empty() {
                    if act("Clean up orphaned resources?", &mut *confirm) {
                        report.cleaned +=
                            orphan::cleanup_orphaned_veths(host, &set.veths, logger)?;
                        report.cleaned += orphan::cleanup_orphaned_firewall_rules(
                            host,
                            &set.firewall_rules,
                            logger,
                        )?;
                    } else if !options.dry_run {
                        report.cancelled = true;
                    }
                }
                report.orphans = Some(set);
            }
            Err(e) => {
                warn!("{}", e);
                report.orphan_error = Some(e.to_string());
            }
        }
    }

    Ok(report)
}

pub fn snapshot(
    ctx: &Context,
    container: Option<&str>,
    action: &SnapshotCommand,
    confirm: &mut dyn FnMut(&str) -> bool,
) -> Result<Report> {
    if let SnapshotCommand::List { all: true } = action {
        let mut all = Vec::new();
        for instance in ctx.managed_containers()? {
            let snapshots = snapshot::list(ctx.runtime(), &instance.name)?;
            all.push((instance.name, snapshots));
        }
        return Ok(Report::AllSnapshots(all));
    }

    let name = ctx.resolve_container(container)?;
    debug!("snapshot target: {}", name);
    let runtime = ctx.runtime();

    match action {
        SnapshotCommand::Create {
            name: snap,
            stateful,
        } => {
            let created = snapshot::create(runtime, &name, snap.as_deref(), *stateful)?;
            Ok(Report::message(format!(
                "Created snapshot '{}' for {}",
                created, name
            )))
        }
        SnapshotCommand::List { .. } => Ok(Report::Snapshots {
            snapshots: snapshot::list(runtime, &name)?,
            container: name,
        }),
        SnapshotCommand::Restore {
            name: snap,
            force,
            stateful,
        } => {
            let question = format!("Restore {} to '{}'? Current state will be lost.", name, snap);
            if !force && !confirm(&question) {
                return Ok(Report::message("Cancelled."));
            }
            snapshot::restore(runtime, &name, snap, *stateful)?;
            Ok(Report::message(format!("Restored {} to snapshot '{}'", name, snap)))
        }
        SnapshotCommand::Delete {
            name: snap,
            all,
            force,
        } => {
            if *all {
                if !force && !confirm(&format!("Delete all snapshots of {}?", name)) {
                    return Ok(Report::message("Cancelled."));
                }
                let count = snapshot::delete_all(runtime, &name)?;
                return Ok(Report::message(format!(
                    "Deleted {} snapshot(s) of {}",
                    count, name
                )));
            }
            let snap = snap.as_deref().ok_or_else(|| {
                BerthError::InvalidInput(
                    "snapshot name required (or use --all to delete all snapshots)".to_string(),
                )
            })?;
            if !force && !confirm(&format!("Delete snapshot '{}' of {}?", snap, name)) {
                return Ok(Report::message("Cancelled."));
            }
            snapshot::delete(runtime, &name, snap)?;
            Ok(Report::message(format!("Deleted snapshot '{}' of {}", snap, name)))
        }
        SnapshotCommand::Info { name: snap } => Ok(Report::Snapshot {
            snapshot: snapshot::info(runtime, &name, snap)?,
            container: name,
        }),
    }
}
