//! Host network state: veth links and firewall rules

use std::collections::HashSet;
use std::fmt;
use std::process::Command;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{BerthError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VethLink {
    pub name: String,
    /// Bridge the link is enslaved to, if any.
    pub master: Option<String>,
    pub peer_ifindex: Option<u32>,
}

impl fmt::Display for VethLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One rule as printed by `iptables -S`, e.g. `-A FORWARD -s 10.1.2.3/32 -j ACCEPT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FirewallRule {
    pub chain: String,
    pub spec: String,
}

impl FirewallRule {
    pub fn new(chain: impl Into<String>, spec: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            spec: spec.into(),
        }
    }

    /// Rule arguments with the leading `-A` swapped for `-D`.
    pub fn delete_args(&self) -> Vec<String> {
        let mut args = split_rule(&self.spec);
        if let Some(first) = args.first_mut() {
            if first == "-A" {
                *first = "-D".to_string();
            }
        }
        args
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec)
    }
}

/// Split an `iptables -S` line into arguments, honouring double quotes.
pub fn split_rule(spec: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;
    let mut pending = false;

    for c in spec.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending || !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => current.push(c),
        }
    }
    if pending || !current.is_empty() {
        args.push(current);
    }
    args
}

/// What orphan detection needs from the host.
pub trait HostNetwork: Send + Sync {
    fn list_veths(&self) -> Result<Vec<VethLink>>;
    fn list_firewall_rules(&self, chain: &str) -> Result<Vec<FirewallRule>>;
    fn delete_link(&self, name: &str) -> Result<()>;
    fn delete_rule(&self, rule: &FirewallRule) -> Result<()>;
}

/// Reads and changes the real host with `ip` and `iptables`.
#[derive(Debug, Clone)]
pub struct SystemHost {
    ip: String,
    iptables: String,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            ip: "ip".to_string(),
            iptables: "iptables".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    link_index: Option<u32>,
}

pub fn parse_ip_links(json: &str) -> Result<Vec<VethLink>> {
    let links: Vec<IpLink> = serde_json::from_str(json)?;
    Ok(links
        .into_iter()
        .map(|l| VethLink {
            name: l.ifname,
            master: l.master,
            peer_ifindex: l.link_index,
        })
        .collect())
}

pub fn parse_rules(chain: &str, output: &str) -> Vec<FirewallRule> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("-A "))
        .map(|l| FirewallRule::new(chain, l))
        .collect()
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let command = format!("{} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| BerthError::HostCommandFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(BerthError::HostCommandFailed {
                command,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

impl HostNetwork for SystemHost {
    fn list_veths(&self) -> Result<Vec<VethLink>> {
        let out = self.run(&self.ip, &owned(&["-j", "link", "show", "type", "veth"]))?;
        if out.trim().is_empty() {
            return Ok(Vec::new());
        }
        parse_ip_links(&out)
    }

    fn list_firewall_rules(&self, chain: &str) -> Result<Vec<FirewallRule>> {
        let out = self.run(&self.iptables, &owned(&["-S", chain]))?;
        Ok(parse_rules(chain, &out))
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.run(&self.ip, &owned(&["link", "delete", name]))?;
        Ok(())
    }

    fn delete_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.run(&self.iptables, &rule.delete_args())?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StaticState {
    veths: Vec<VethLink>,
    rules: Vec<FirewallRule>,
    failing: HashSet<String>,
    list_error: Option<String>,
}

/// Fixed host state held in memory; deletions remove entries.
#[derive(Debug, Default)]
pub struct StaticHost {
    state: Mutex<StaticState>,
}

impl StaticHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_veth(&self, name: &str, master: Option<&str>) {
        self.lock().veths.push(VethLink {
            name: name.to_string(),
            master: master.map(str::to_string),
            peer_ifindex: None,
        });
    }

    pub fn add_rule(&self, chain: &str, spec: &str) {
        self.lock().rules.push(FirewallRule::new(chain, spec));
    }

    /// Make deleting the veth or rule spec `key` fail.
    pub fn fail_delete(&self, key: &str) {
        self.lock().failing.insert(key.to_string());
    }

    /// Make every listing call fail with `message`.
    pub fn fail_listing(&self, message: &str) {
        self.lock().list_error = Some(message.to_string());
    }

    pub fn veths(&self) -> Vec<VethLink> {
        self.lock().veths.clone()
    }

    pub fn rules(&self) -> Vec<FirewallRule> {
        self.lock().rules.clone()
    }
}

impl HostNetwork for StaticHost {
    fn list_veths(&self) -> Result<Vec<VethLink>> {
        let state = self.lock();
        if let Some(message) = &state.list_error {
            return Err(BerthError::HostCommandFailed {
                command: "ip -j link show type veth".to_string(),
                message: message.clone(),
            });
        }
        Ok(state.veths.clone())
    }

    fn list_firewall_rules(&self, chain: &str) -> Result<Vec<FirewallRule>> {
        let state = self.lock();
        if let Some(message) = &state.list_error {
            return Err(BerthError::HostCommandFailed {
                command: format!("iptables -S {}", chain),
                message: message.clone(),
            });
        }
        Ok(state
            .rules
            .iter()
            .filter(|r| r.chain == chain)
            .cloned()
            .collect())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.failing.contains(name) {
            return Err(BerthError::HostCommandFailed {
                command: format!("ip link delete {}", name),
                message: "Operation not permitted".to_string(),
            });
        }
        let before = state.veths.len();
        state.veths.retain(|v| v.name != name);
        if state.veths.len() == before {
            return Err(BerthError::HostCommandFailed {
                command: format!("ip link delete {}", name),
                message: format!("Cannot find device \"{}\"", name),
            });
        }
        Ok(())
    }

    fn delete_rule(&self, rule: &FirewallRule) -> Result<()> {
        let mut state = self.lock();
        if state.failing.contains(&rule.spec) {
            return Err(BerthError::HostCommandFailed {
                command: format!("iptables {}", rule.delete_args().join(" ")),
                message: "Permission denied (you must be root)".to_string(),
            });
        }
        state.rules.retain(|r| r != rule);
        Ok(())
    }
}
