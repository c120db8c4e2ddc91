//! Classification of host network artifacts against live instances

use std::collections::HashSet;
use std::net::Ipv4Addr;

use super::host::{split_rule, FirewallRule, VethLink};
use crate::runtime::InstanceInfo;

/// An IPv4 network such as `10.1.2.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    address: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Parse `a.b.c.d/len`. Host bits may be set (`10.1.2.1/24` is the bridge address).
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = cidr.trim().split_once('/')?;
        let address: Ipv4Addr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        if prefix > 32 {
            return None;
        }
        Some(Self { address, prefix })
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.address) & self.mask()
    }

    /// The address the subnet was written with (the bridge's own IP).
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }
}

/// Single-host (`/32`) IPv4 addresses a rule matches on.
pub fn rule_host_ips(rule: &FirewallRule) -> Vec<Ipv4Addr> {
    let args = split_rule(&rule.spec);
    args.windows(2)
        .filter(|w| matches!(w[0].as_str(), "-s" | "-d" | "--source" | "--destination"))
        .filter_map(|w| w[1].strip_suffix("/32"))
        .filter_map(|ip| ip.parse().ok())
        .collect()
}

/// Veths that are attached to no bridge and belong to no live instance.
pub fn orphaned_veths(veths: &[VethLink], live: &[InstanceInfo]) -> Vec<VethLink> {
    let owned: HashSet<&str> = live
        .iter()
        .flat_map(|i| i.host_interfaces.iter().map(String::as_str))
        .collect();
    veths
        .iter()
        .filter(|v| v.master.is_none() && !owned.contains(v.name.as_str()))
        .cloned()
        .collect()
}

/// Rules for container IPs in `bridge` that no live instance holds.
///
/// Only `/32` addresses inside the bridge subnet count; the bridge's own
/// address is the host's and never makes a rule runtime-scoped.
pub fn orphaned_rules(
    rules: &[FirewallRule],
    bridge: &Subnet,
    live: &[InstanceInfo],
) -> Vec<FirewallRule> {
    let assigned: HashSet<Ipv4Addr> = live.iter().flat_map(|i| i.ipv4.iter().copied()).collect();
    rules
        .iter()
        .filter(|rule| {
            let scoped: Vec<Ipv4Addr> = rule_host_ips(rule)
                .into_iter()
                .filter(|ip| bridge.contains(*ip) && *ip != bridge.address())
                .collect();
            !scoped.is_empty() && !scoped.iter().any(|ip| assigned.contains(ip))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, ip: Option<&str>, iface: Option<&str>) -> InstanceInfo {
        InstanceInfo {
            name: name.to_string(),
            status: "Running".to_string(),
            created_at: None,
            image: None,
            ipv4: ip.map(|i| i.parse().unwrap()).into_iter().collect(),
            host_interfaces: iface.map(str::to_string).into_iter().collect(),
        }
    }

    fn veth(name: &str, master: Option<&str>) -> VethLink {
        VethLink {
            name: name.to_string(),
            master: master.map(str::to_string),
            peer_ifindex: None,
        }
    }

    #[test]
    fn test_subnet_contains() {
        let net = Subnet::parse("10.1.2.1/24").unwrap();
        assert!(net.contains("10.1.2.200".parse().unwrap()));
        assert!(!net.contains("10.1.3.1".parse().unwrap()));
        assert!(Subnet::parse("0.0.0.0/0").unwrap().contains("8.8.8.8".parse().unwrap()));
        assert!(Subnet::parse("10.0.0.0/33").is_none());
        assert!(Subnet::parse("nonsense").is_none());
    }

    #[test]
    fn test_rule_host_ips() {
        let rule = FirewallRule::new(
            "FORWARD",
            "-A FORWARD -s 10.1.2.3/32 -d 192.168.0.0/16 -j ACCEPT",
        );
        assert_eq!(rule_host_ips(&rule), vec!["10.1.2.3".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn test_bridged_veths_are_never_orphans() {
        let veths = vec![veth("vethA", Some("incusbr0")), veth("vethB", Some("docker0"))];
        assert!(orphaned_veths(&veths, &[]).is_empty());
    }

    #[test]
    fn test_detached_veth_owned_by_live_instance_is_kept() {
        let veths = vec![veth("vethLive", None), veth("vethDead", None)];
        let live = vec![instance("c1", None, Some("vethLive"))];
        let orphans = orphaned_veths(&veths, &live);
        assert_eq!(orphans, vec![veth("vethDead", None)]);
    }

    #[test]
    fn test_orphaned_rules() {
        let bridge = Subnet::parse("10.1.2.1/24").unwrap();
        let rules = vec![
            FirewallRule::new("FORWARD", "-A FORWARD -s 10.1.2.10/32 -j ACCEPT"),
            FirewallRule::new("FORWARD", "-A FORWARD -d 10.1.2.11/32 -j ACCEPT"),
            FirewallRule::new("FORWARD", "-A FORWARD -s 172.16.0.5/32 -j ACCEPT"),
            FirewallRule::new("FORWARD", "-A FORWARD -s 10.1.2.1/32 -j ACCEPT"),
            FirewallRule::new("FORWARD", "-A FORWARD -i incusbr0 -j ACCEPT"),
        ];
        let live = vec![instance("c1", Some("10.1.2.10"), None)];
        let orphans = orphaned_rules(&rules, &bridge, &live);
        assert_eq!(orphans, vec![rules[1].clone()]);
    }
}
