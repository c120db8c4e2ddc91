//! CLI argument parsing

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "berth")]
#[command(author, version, about = "Disposable and persistent Incus sandboxes for your workspace", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: SubCommand,

    /// Workspace directory (default: current directory)
    #[arg(long, short = 'w', global = true, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Slot number (default: lowest free slot)
    #[arg(long, global = true)]
    pub slot: Option<u32>,

    /// Resume a saved session by id
    #[arg(long, global = true, value_name = "SESSION_ID", conflicts_with = "continue_session")]
    pub resume: Option<String>,

    /// Resume the most recent session saved for this workspace
    #[arg(long = "continue", global = true)]
    pub continue_session: bool,

    /// Keep the container (stopped) after the session ends
    #[arg(long, global = true)]
    pub persistent: bool,

    /// Use the privileged image and drop the sandbox marker
    #[arg(long, global = true)]
    pub privileged: bool,

    /// Mount the host SSH directory read-only (paths.ssh_dir, else ~/.ssh)
    #[arg(long, global = true)]
    pub ssh: bool,

    /// Image alias to launch
    #[arg(long, global = true)]
    pub image: Option<String>,

    /// Save the session state on exit (default)
    #[arg(long, global = true, overrides_with = "no_save")]
    pub save: bool,

    /// Do not save the session state on exit
    #[arg(long, global = true, overrides_with = "save")]
    pub no_save: bool,

    /// Container to operate on (default: $BERTH_CONTAINER, then the workspace's container)
    #[arg(long, short = 'c', global = true)]
    pub container: Option<String>,

    /// Output format as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn save_session(&self) -> bool {
        !self.no_save
    }
}

#[derive(Subcommand, Debug)]
pub enum SubCommand {
    /// Run a command in a sandbox, then clean up
    Run {
        /// Command and arguments to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Start an interactive shell in a sandbox
    Shell,

    /// Attach a shell to an existing container
    Attach {
        /// Container name (default: the workspace's container)
        name: Option<String>,
    },

    /// List berth containers
    List {
        /// Also list saved sessions
        #[arg(long)]
        all: bool,
    },

    /// Show which berth images are available locally
    Images {
        /// Also list every local image
        #[arg(long, short)]
        all: bool,
    },

    /// Show details of a saved session
    Info {
        /// Session id
        session_id: String,
    },

    /// Remove stopped containers, saved sessions, and orphaned network resources
    Clean {
        /// Clean containers, sessions and orphans
        #[arg(long)]
        all: bool,

        /// Clean saved sessions
        #[arg(long)]
        sessions: bool,

        /// Clean orphaned veths and firewall rules
        #[arg(long)]
        orphans: bool,

        /// Show what would be cleaned without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Skip confirmation prompts
        #[arg(long, short)]
        force: bool,
    },

    /// Manage container snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// Create a snapshot (default name: snap-YYYYMMDD-HHMMSS)
    Create {
        name: Option<String>,

        /// Include process memory state
        #[arg(long)]
        stateful: bool,
    },

    /// List snapshots
    List {
        /// List snapshots of every berth container
        #[arg(long)]
        all: bool,
    },

    /// Restore a snapshot (the container must be stopped)
    Restore {
        name: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,

        /// Restore process memory state
        #[arg(long)]
        stateful: bool,
    },

    /// Delete a snapshot
    Delete {
        #[arg(required_unless_present = "all")]
        name: Option<String>,

        /// Delete every snapshot of the container
        #[arg(long, conflicts_with = "name")]
        all: bool,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Show snapshot details
    Info { name: String },
}
