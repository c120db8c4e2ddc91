//! Berth - disposable and persistent Incus sandboxes for a workspace
//!
//! Each workspace gets numbered container slots. A session's agent state
//! can be saved on exit and restored into a fresh container later, and
//! `clean` sweeps up stopped containers, saved sessions and host network
//! resources left behind by containers that no longer exist.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use berth::{Config, IncusClient, Lifecycle, SetupOptions};
//!
//! let config = Config::load(None).unwrap();
//! let lifecycle = Lifecycle::new(Arc::new(IncusClient::new()), config.lifecycle_settings());
//! let result = lifecycle
//!     .setup(&SetupOptions {
//!         workspace: "/home/me/project".into(),
//!         ..SetupOptions::default()
//!     })
//!     .unwrap();
//! println!("{} on slot {}", result.container_name, result.slot);
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod images;
pub mod orphan;
pub mod output;
pub mod runtime;
pub mod session;
pub mod snapshot;

pub use config::Config;
pub use error::{BerthError, Result};
pub use orphan::{detect_all, OrphanSet};
pub use output::{format_output, OutputFormat, Report};
pub use runtime::{ContainerHandle, ContainerRuntime, IncusClient, MemoryRuntime};
pub use session::{
    CleanupOptions, Lifecycle, SessionStore, SetupOptions, SetupOutcome, SetupResult,
};
