use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Agent-side configuration for the isolation firewall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// `physnet:bridge` pairs mapping physical networks to the host bridge
    /// device carrying their traffic.
    #[serde(default)]
    pub bridge_mappings: Vec<String>,
    /// Which backend family drives the host packet filter.
    #[serde(default)]
    pub firewall_driver: FirewallBackend,
    /// Seconds between agent state reports; the restore lock wait is derived
    /// from this so an apply cannot outlast a reporting deadline.
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
    /// Re-diff after every apply and fail if the result is non-empty.
    #[serde(default)]
    pub debug_rules: bool,
    /// Network namespace to run backend commands in, if any.
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    #[default]
    Ebtables,
    Iptables,
}

fn default_report_interval() -> u64 {
    30
}

impl AgentConfig {
    /// Load agent configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read agent config from {:?}", path))?;

        let config: AgentConfig =
            serde_yaml::from_str(&content).context("Failed to parse agent config YAML")?;

        Ok(config)
    }

    /// Resolve the `bridge_mappings` pairs into a physnet -> device map.
    pub fn bridge_map(&self) -> Result<HashMap<String, String>> {
        parse_bridge_mappings(&self.bridge_mappings)
    }
}

/// Parse `physnet:bridge` mapping entries. Duplicate physical networks are
/// rejected so a typo cannot silently shadow an earlier mapping.
pub fn parse_bridge_mappings(entries: &[String]) -> Result<HashMap<String, String>> {
    let mut mappings = HashMap::new();

    for entry in entries {
        let Some((physnet, bridge)) = entry.split_once(':') else {
            bail!("Invalid bridge mapping '{}', expected physnet:bridge", entry);
        };
        let physnet = physnet.trim();
        let bridge = bridge.trim();
        if physnet.is_empty() || bridge.is_empty() {
            bail!("Invalid bridge mapping '{}', expected physnet:bridge", entry);
        }
        if mappings.insert(physnet.to_string(), bridge.to_string()).is_some() {
            bail!("Physical network '{}' mapped more than once", physnet);
        }
    }

    Ok(mappings)
}
