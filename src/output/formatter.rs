//! Output formatting

use std::path::PathBuf;

use serde::Serialize;

use crate::images::ImageReport;
use crate::orphan::OrphanSet;
use crate::output::human::format_human;
use crate::output::json::format_json;
use crate::runtime::{InstanceInfo, SnapshotInfo};
use crate::session::{SessionMetadata, SessionSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub id: String,
    pub path: PathBuf,
    pub metadata: Option<SessionMetadata>,
    pub size_bytes: u64,
    pub file_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanReport {
    pub dry_run: bool,
    pub stopped_containers: Vec<String>,
    pub sessions: Vec<String>,
    pub orphans: Option<OrphanSet>,
    pub orphan_error: Option<String>,
    pub cleaned: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub enum Report {
    Listing {
        containers: Vec<InstanceInfo>,
        sessions: Option<Vec<SessionSummary>>,
    },
    Session(SessionDetail),
    Snapshots {
        container: String,
        snapshots: Vec<SnapshotInfo>,
    },
    AllSnapshots(Vec<(String, Vec<SnapshotInfo>)>),
    Snapshot {
        container: String,
        snapshot: SnapshotInfo,
    },
    Clean(CleanReport),
    Images(ImageReport),
    Message {
        message: String,
    },
}

impl Report {
    pub fn message(message: impl Into<String>) -> Self {
        Report::Message {
            message: message.into(),
        }
    }
}

pub fn format_output(report: &Report, format: &OutputFormat) -> String {
    match format {
        OutputFormat::Human => format_human(report),
        OutputFormat::Json => format_json(report),
    }
}
