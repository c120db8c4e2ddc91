//! Removal of orphaned veths and firewall rules
//!
//! Each artifact is removed on its own; a failure is reported through the
//! logger and the batch carries on. The returned count is the number of
//! successful removals.

use log::warn;

use super::host::{FirewallRule, HostNetwork, VethLink};
use crate::error::Result;

pub fn cleanup_orphaned_veths(
    host: &dyn HostNetwork,
    veths: &[VethLink],
    logger: &mut dyn FnMut(&str),
) -> Result<usize> {
    let mut removed = 0;
    for veth in veths {
        match host.delete_link(&veth.name) {
            Ok(()) => {
                logger(&format!("Removed orphaned veth {}", veth.name));
                removed += 1;
            }
            Err(e) => {
                warn!("failed to remove veth {}: {}", veth.name, e);
                logger(&format!("Failed to remove veth {}: {}", veth.name, e));
            }
        }
    }
    Ok(removed)
}

pub fn cleanup_orphaned_firewall_rules(
    host: &dyn HostNetwork,
    rules: &[FirewallRule],
    logger: &mut dyn FnMut(&str),
) -> Result<usize> {
    let mut removed = 0;
    for rule in rules {
        match host.delete_rule(rule) {
            Ok(()) => {
                logger(&format!("Removed orphaned firewall rule: {}", rule));
                removed += 1;
            }
            Err(e) => {
                warn!("failed to remove firewall rule {}: {}", rule, e);
                logger(&format!("Failed to remove firewall rule {}: {}", rule, e));
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orphan::host::StaticHost;

    #[test]
    fn test_veth_failures_do_not_stop_batch() {
        let host = StaticHost::new();
        for name in ["veth1", "veth2", "veth3"] {
            host.add_veth(name, None);
        }
        host.fail_delete("veth2");
        let veths = host.veths();

        let mut lines = Vec::new();
        let removed =
            cleanup_orphaned_veths(&host, &veths, &mut |l: &str| lines.push(l.to_string())).unwrap();

        assert_eq!(removed, 2);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("Failed to remove veth veth2"));
        assert_eq!(host.veths().len(), 1);
    }

    #[test]
    fn test_rule_cleanup_counts_successes() {
        let host = StaticHost::new();
        host.add_rule("FORWARD", "-A FORWARD -s 10.1.2.5/32 -j ACCEPT");
        host.add_rule("FORWARD", "-A FORWARD -s 10.1.2.6/32 -j ACCEPT");
        host.fail_delete("-A FORWARD -s 10.1.2.6/32 -j ACCEPT");
        let rules = host.rules();

        let mut lines = Vec::new();
        let removed = cleanup_orphaned_firewall_rules(&host, &rules, &mut |l: &str| {
            lines.push(l.to_string())
        })
        .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(host.rules().len(), 1);
        assert!(lines[0].contains("10.1.2.5"));
    }

    #[test]
    fn test_empty_list() {
        let host = StaticHost::new();
        let mut calls = 0;
        let removed = cleanup_orphaned_veths(&host, &[], &mut |_: &str| calls += 1).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(calls, 0);
    }
}
