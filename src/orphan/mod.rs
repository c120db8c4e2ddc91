//! Orphaned host network resources
//!
//! A container that dies abnormally can leave a detached veth or firewall
//! rules for its old IP behind. Detection compares fresh host state with
//! the runtime's live instances and never changes anything; removal is a
//! separate step (see [`cleanup`]).

pub mod cleanup;
pub mod detect;
pub mod host;

pub use cleanup::{cleanup_orphaned_firewall_rules, cleanup_orphaned_veths};
pub use host::{FirewallRule, HostNetwork, StaticHost, SystemHost, VethLink};

use log::{debug, warn};
use serde::Serialize;

use crate::error::{BerthError, Result};
use crate::runtime::ContainerRuntime;
use detect::{orphaned_rules, orphaned_veths, Subnet};

/// Where the runtime's networking lives on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub bridge: String,
    pub firewall_chain: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bridge: "incusbr0".to_string(),
            firewall_chain: "FORWARD".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanSet {
    pub veths: Vec<VethLink>,
    pub firewall_rules: Vec<FirewallRule>,
}

impl OrphanSet {
    pub fn len(&self) -> usize {
        self.veths.len() + self.firewall_rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classify current veths and firewall rules against live instances.
///
/// Failing to list instances or veths fails the whole detection. Firewall
/// rules need root to read, so a listing failure there is logged and the
/// rule list is left empty.
pub fn detect_all(
    runtime: &dyn ContainerRuntime,
    host: &dyn HostNetwork,
    network: &NetworkSettings,
) -> Result<OrphanSet> {
    let live = runtime
        .list_instances()
        .map_err(|e| BerthError::OrphanDetectionFailed(format!("listing instances: {}", e)))?;
    let veths = host
        .list_veths()
        .map_err(|e| BerthError::OrphanDetectionFailed(format!("listing veths: {}", e)))?;

    let mut set = OrphanSet {
        veths: orphaned_veths(&veths, &live),
        firewall_rules: Vec::new(),
    };

    let bridge = runtime
        .bridge_ipv4(&network.bridge)
        .map_err(|e| BerthError::OrphanDetectionFailed(format!("reading {}: {}", network.bridge, e)))?
        .as_deref()
        .and_then(Subnet::parse);
    let Some(bridge) = bridge else {
        debug!("bridge {} has no IPv4 subnet; skipping firewall rules", network.bridge);
        return Ok(set);
    };

    match host.list_firewall_rules(&network.firewall_chain) {
        Ok(rules) => set.firewall_rules = orphaned_rules(&rules, &bridge, &live),
        Err(e) => warn!("skipping firewall rules: {}", e),
    }
    Ok(set)
}
