//! Slot allocation
//!
//! A slot is free when no container with its name exists, running or not.
//! Every check is a fresh runtime query; nothing is reserved, so two
//! processes scanning at once can pick the same slot.

use log::{debug, warn};

use super::naming::{container_name, WorkspaceId};
use crate::error::{BerthError, Result};
use crate::runtime::ContainerRuntime;

pub const DEFAULT_MAX_SLOT: u32 = 10;

/// Lowest free slot in `start..=max`.
///
/// A check that fails counts as occupied: a name whose occupancy could not
/// be confirmed is never handed out.
pub fn allocate_slot_from(
    runtime: &dyn ContainerRuntime,
    prefix: &str,
    workspace: &WorkspaceId,
    start: u32,
    max: u32,
) -> Result<u32> {
    if start == 0 {
        return Err(BerthError::InvalidInput("slots start at 1".to_string()));
    }

    for slot in start..=max {
        let name = container_name(prefix, workspace, slot);
        match runtime.exists(&name) {
            Ok(false) => {
                debug!("slot {} is free ({})", slot, name);
                return Ok(slot);
            }
            Ok(true) => debug!("slot {} is occupied by {}", slot, name),
            Err(e @ BerthError::RuntimeUnavailable { .. }) => return Err(e),
            Err(e) => warn!("could not check slot {} ({}), treating as occupied: {}", slot, name, e),
        }
    }

    Err(BerthError::ExhaustedSlots { start, max })
}

pub fn allocate_slot(
    runtime: &dyn ContainerRuntime,
    prefix: &str,
    workspace: &WorkspaceId,
    max: u32,
) -> Result<u32> {
    allocate_slot_from(runtime, prefix, workspace, 1, max)
}
