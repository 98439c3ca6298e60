use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipnet::IpNet;
use serde::Deserialize;
use tracing::warn;

use iso_core::{
    AgentConfig, FirewallBackend, IsolationRule, RuleStore, StaticSubnetMap, SubnetLookup,
};
use iso_fw::{
    ApplyLock, EbtablesFirewall, FirewallDriver, HostExecutor, IptablesFirewall, ManagerOpts,
};

#[derive(Parser)]
#[command(name = "isoflat")]
#[command(version, about = "Per-network traffic isolation for bridged hosts", long_about = None)]
struct Cli {
    /// Agent configuration file
    #[arg(short, long, default_value = "isoflat.yaml")]
    config: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge the host firewall on the declared rule sets
    Apply {
        #[arg(short, long, default_value = "rules.yaml")]
        rules: String,
        /// Only refresh this physical network
        #[arg(long)]
        network: Option<String>,
    },
    /// Show the backend commands an apply would run, without running them
    Plan {
        #[arg(short, long, default_value = "rules.yaml")]
        rules: String,
        /// Only plan this physical network
        #[arg(long)]
        network: Option<String>,
        /// Emit the command script as a JSON array
        #[arg(long)]
        json: bool,
    },
    /// Dump the live state of the managed backend
    Status,
}

/// Declarative rule file: isolation rules keyed by physical network, plus
/// the subnets backing remote-network references.
#[derive(Debug, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    networks: HashMap<String, Vec<IsolationRule>>,
    #[serde(default)]
    subnets: HashMap<String, Vec<IpNet>>,
}

impl RulesFile {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read rules from {:?}", path))?;
        let file: RulesFile =
            serde_yaml::from_str(&content).context("Failed to parse rules YAML")?;
        Ok(file)
    }

    fn subnet_map(&self) -> StaticSubnetMap {
        let mut map = StaticSubnetMap::new();
        for (network_id, subnets) in &self.subnets {
            map.insert(network_id, subnets.clone());
        }
        map
    }
}

impl RuleStore for RulesFile {
    /// Malformed rules are skipped with a warning so one bad entry cannot
    /// take the whole network's isolation down.
    fn rules_for_network(&self, physical_network: &str) -> Result<Vec<IsolationRule>> {
        let rules = self.networks.get(physical_network).cloned().unwrap_or_default();
        Ok(rules
            .into_iter()
            .filter(|rule| {
                if !rule.is_well_formed() {
                    warn!(
                        "Skipping malformed rule for network {:?}: {:?}",
                        physical_network, rule
                    );
                    return false;
                }
                true
            })
            .collect())
    }
}

/// Everything a driver construction needs, resolved from config and the
/// rule file once per invocation.
struct DriverSetup {
    backend: FirewallBackend,
    opts: ManagerOpts,
    bridge_map: HashMap<String, String>,
    subnets: Arc<StaticSubnetMap>,
}

impl DriverSetup {
    fn new(config: &AgentConfig, rules_file: &RulesFile) -> Result<Self> {
        Ok(Self {
            backend: config.firewall_driver,
            opts: ManagerOpts {
                namespace: config.namespace.clone(),
                report_interval: config.report_interval,
                debug_rules: config.debug_rules,
                ..ManagerOpts::default()
            },
            bridge_map: config.bridge_map()?,
            subnets: Arc::new(rules_file.subnet_map()),
        })
    }

    fn ebtables(&self) -> Result<EbtablesFirewall<HostExecutor>> {
        Ok(EbtablesFirewall::new(
            Arc::new(HostExecutor),
            ApplyLock::new(),
            &self.opts,
            self.bridge_map.clone(),
            Arc::clone(&self.subnets) as Arc<dyn SubnetLookup>,
        )?)
    }

    fn iptables(&self) -> Result<IptablesFirewall<HostExecutor>> {
        Ok(IptablesFirewall::new(
            Arc::new(HostExecutor),
            ApplyLock::new(),
            &self.opts,
            self.bridge_map.clone(),
            Arc::clone(&self.subnets) as Arc<dyn SubnetLookup>,
        )?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = AgentConfig::load(Path::new(&cli.config))?;

    match cli.command {
        Commands::Apply { rules, network } => {
            let rules_file = RulesFile::load(Path::new(&rules))?;
            let setup = DriverSetup::new(&config, &rules_file)?;
            let networks = target_networks(&setup.bridge_map, network)?;
            match setup.backend {
                FirewallBackend::Ebtables => {
                    apply_networks(&mut setup.ebtables()?, &rules_file, &networks).await?
                }
                FirewallBackend::Iptables => {
                    apply_networks(&mut setup.iptables()?, &rules_file, &networks).await?
                }
            }
            println!("✅ {} network(s) converged", networks.len());
        }
        Commands::Plan {
            rules,
            network,
            json,
        } => {
            let rules_file = RulesFile::load(Path::new(&rules))?;
            let setup = DriverSetup::new(&config, &rules_file)?;
            let networks = target_networks(&setup.bridge_map, network)?;
            let commands = match setup.backend {
                FirewallBackend::Ebtables => {
                    plan_networks(&mut setup.ebtables()?, &rules_file, &networks).await?
                }
                FirewallBackend::Iptables => {
                    plan_networks(&mut setup.iptables()?, &rules_file, &networks).await?
                }
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&commands)?);
            } else if commands.is_empty() {
                println!("✅ Host already converged, nothing to do");
            } else {
                for line in &commands {
                    println!("{}", line);
                }
            }
        }
        Commands::Status => {
            let setup = DriverSetup::new(&config, &RulesFile::default())?;
            let dump = match setup.backend {
                FirewallBackend::Ebtables => setup.ebtables()?.dump_state().await?,
                FirewallBackend::Iptables => setup.iptables()?.dump_state().await?,
            };
            print!("{}", dump);
        }
    }

    Ok(())
}

/// The physical networks a command operates on: every mapped network, or
/// the one selected on the command line.
fn target_networks(
    bridge_map: &HashMap<String, String>,
    selected: Option<String>,
) -> Result<Vec<String>> {
    match selected {
        Some(network) => {
            if !bridge_map.contains_key(&network) {
                anyhow::bail!("Physical network '{}' has no bridge mapping", network);
            }
            Ok(vec![network])
        }
        None => {
            let mut networks: Vec<String> = bridge_map.keys().cloned().collect();
            networks.sort();
            Ok(networks)
        }
    }
}

/// Refresh every target network from the rule store and converge the host,
/// mirroring an agent restart.
async fn apply_networks<D: FirewallDriver>(
    driver: &mut D,
    store: &RulesFile,
    networks: &[String],
) -> Result<()> {
    driver
        .init_firewall()
        .await
        .context("Failed to initialize the firewall wiring")?;
    for network in networks {
        let rules = store.rules_for_network(network)?;
        driver
            .update_rules(network, &rules)
            .await
            .context(format!("Failed to update rules for network '{}'", network))?;
    }
    Ok(())
}

/// Accumulate the declared state for every target network, then diff it
/// against the live host. The last plan covers all of them.
async fn plan_networks<D: FirewallDriver>(
    driver: &mut D,
    store: &RulesFile,
    networks: &[String],
) -> Result<Vec<String>> {
    let mut commands = Vec::new();
    for network in networks {
        let rules = store.rules_for_network(network)?;
        commands = driver
            .plan_rules(network, &rules)
            .await
            .context(format!("Failed to plan rules for network '{}'", network))?;
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_file_parses_networks_and_subnets() {
        let yaml = r#"
networks:
  physnet1:
    - network_id: net-1
      direction: ingress
      protocol: tcp
      port_range_min: 80
      port_range_max: 80
      ethertype: IPv4
      remote_ip: "203.0.113.0/24"
subnets:
  net-2:
    - 10.0.0.0/24
"#;
        let file: RulesFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.networks["physnet1"].len(), 1);
        assert_eq!(file.subnets["net-2"].len(), 1);
    }

    #[test]
    fn malformed_rules_are_filtered_out() {
        let yaml = r#"
networks:
  physnet1:
    - network_id: net-1
      direction: ingress
      ethertype: IPv4
      remote_ip: "203.0.113.0/24"
      remote_network_id: net-2
    - network_id: net-1
      direction: egress
      ethertype: IPv4
"#;
        let file: RulesFile = serde_yaml::from_str(yaml).unwrap();
        let rules = file.rules_for_network("physnet1").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].direction, iso_core::Direction::Egress);
    }

    #[test]
    fn unknown_network_has_no_rules() {
        let file = RulesFile::default();
        assert!(file.rules_for_network("physnet1").unwrap().is_empty());
    }

    #[test]
    fn selected_network_must_be_mapped() {
        let mut bridge_map = HashMap::new();
        bridge_map.insert("physnet1".to_string(), "br-eth1".to_string());
        assert!(target_networks(&bridge_map, Some("physnet9".into())).is_err());
        assert_eq!(
            target_networks(&bridge_map, None).unwrap(),
            vec!["physnet1".to_string()]
        );
    }
}
