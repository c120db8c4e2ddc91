//! Container snapshots

use chrono::{DateTime, Local};
use log::info;

use crate::error::{BerthError, Result};
use crate::runtime::{ContainerRuntime, SnapshotInfo};

/// `snap-YYYYMMDD-HHMMSS` for the given time.
pub fn auto_name(now: DateTime<Local>) -> String {
    now.format("snap-%Y%m%d-%H%M%S").to_string()
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.starts_with('-')
        || name.chars().any(char::is_whitespace)
    {
        return Err(BerthError::InvalidInput(format!(
            "invalid snapshot name '{}'",
            name
        )));
    }
    Ok(())
}

fn require(runtime: &dyn ContainerRuntime, container: &str, name: &str) -> Result<()> {
    if !runtime.snapshot_exists(container, name)? {
        return Err(BerthError::SnapshotNotFound {
            container: container.to_string(),
            snapshot: name.to_string(),
        });
    }
    Ok(())
}

/// Create a snapshot, naming it after the current time when `name` is `None`.
pub fn create(
    runtime: &dyn ContainerRuntime,
    container: &str,
    name: Option<&str>,
    stateful: bool,
) -> Result<String> {
    let name = name
        .map(str::to_string)
        .unwrap_or_else(|| auto_name(Local::now()));
    validate_name(&name)?;

    if runtime.snapshot_exists(container, &name)? {
        return Err(BerthError::SnapshotExists {
            container: container.to_string(),
            snapshot: name,
        });
    }
    runtime.create_snapshot(container, &name, stateful)?;
    info!("created snapshot {} of {}", name, container);
    Ok(name)
}

/// Snapshots of `container`, oldest first.
pub fn list(runtime: &dyn ContainerRuntime, container: &str) -> Result<Vec<SnapshotInfo>> {
    let mut snapshots = runtime.list_snapshots(container)?;
    snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(snapshots)
}

/// Roll `container` back to `name`. The container must be stopped.
pub fn restore(
    runtime: &dyn ContainerRuntime,
    container: &str,
    name: &str,
    stateful: bool,
) -> Result<()> {
    require(runtime, container, name)?;
    if runtime.running(container)? {
        return Err(BerthError::InvalidInput(format!(
            "container '{}' must be stopped before restore (incus stop {})",
            container, container
        )));
    }
    runtime.restore_snapshot(container, name, stateful)?;
    info!("restored {} to snapshot {}", container, name);
    Ok(())
}

pub fn delete(runtime: &dyn ContainerRuntime, container: &str, name: &str) -> Result<()> {
    require(runtime, container, name)?;
    runtime.delete_snapshot(container, name)
}

/// Delete every snapshot of `container`, returning how many went.
pub fn delete_all(runtime: &dyn ContainerRuntime, container: &str) -> Result<usize> {
    let snapshots = runtime.list_snapshots(container)?;
    for snapshot in &snapshots {
        runtime.delete_snapshot(container, &snapshot.name)?;
    }
    Ok(snapshots.len())
}

pub fn info(runtime: &dyn ContainerRuntime, container: &str, name: &str) -> Result<SnapshotInfo> {
    runtime.snapshot_info(container, name)
}
