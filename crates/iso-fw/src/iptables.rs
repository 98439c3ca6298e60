use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use iso_core::{Direction, IsolationRule, SubnetLookup};

use crate::error::FirewallError;
use crate::exec::CommandExecutor;
use crate::firewall::{
    expand_remote_ips, ip_prefix_arg, network_chain_name, protocol_token, split_rules_by_ethertype,
    FirewallDriver,
};
use crate::manager::{ApplyLock, ManagerOpts, TableManager};
use crate::table::RuleOpts;

/// Shared dispatch chain every per-network chain hangs off.
const ISOLATION_CHAIN: &str = "iso-chain";

/// IP-level backend. IPv4 and IPv6 are two independent backend binaries, so
/// the driver runs one table manager per family; they share the apply lock
/// because both restores contend on the same xtables lock.
pub struct IptablesFirewall<E: CommandExecutor> {
    ipv4: TableManager<E>,
    ipv6: TableManager<E>,
    bridge_map: HashMap<String, String>,
    subnets: Arc<dyn SubnetLookup>,
}

impl<E: CommandExecutor> IptablesFirewall<E> {
    pub fn new(
        executor: Arc<E>,
        lock: ApplyLock,
        opts: &ManagerOpts,
        bridge_map: HashMap<String, String>,
        subnets: Arc<dyn SubnetLookup>,
    ) -> Result<Self, FirewallError> {
        let mut ipv4 = TableManager::new("iptables", Arc::clone(&executor), lock.clone(), opts);
        let mut ipv6 = TableManager::new("ip6tables", executor, lock, opts);
        ipv4.setup_filter_table()?;
        ipv6.setup_filter_table()?;

        let mut firewall = Self {
            ipv4,
            ipv6,
            bridge_map,
            subnets,
        };
        for manager in [&mut firewall.ipv4, &mut firewall.ipv6] {
            let table = manager.filter();
            table.add_chain(ISOLATION_CHAIN, true);
            table.add_chain("fallback", true);
            table.add_rule("fallback", "-j ACCEPT", true, RuleOpts::default())?;
        }
        Ok(firewall)
    }

    fn device_for(&self, physical_network: &str) -> Result<String, FirewallError> {
        self.bridge_map
            .get(physical_network)
            .cloned()
            .ok_or_else(|| FirewallError::UnmappedNetwork(physical_network.to_string()))
    }

    /// Declare the per-network chain in both families and wire its physdev
    /// dispatch: bridge traffic in FORWARD jumps to the isolation chain,
    /// which fans out to the per-network chain; egress traffic addressed to
    /// the host itself is caught in INPUT.
    fn add_chain(
        &mut self,
        chain_name: &str,
        device: &str,
        direction: Direction,
    ) -> Result<(), FirewallError> {
        let physdev_flag = match direction {
            Direction::Ingress => "physdev-out",
            Direction::Egress => "physdev-in",
        };
        let jump_to_isolation = format!(
            "-m physdev --{} {} --physdev-is-bridged -j ${}",
            physdev_flag, device, ISOLATION_CHAIN
        );
        let jump_to_chain = format!(
            "-m physdev --{} {} --physdev-is-bridged -j ${}",
            physdev_flag, device, chain_name
        );

        for manager in [&mut self.ipv4, &mut self.ipv6] {
            let table = manager.filter();
            table.add_chain(chain_name, true);
            table.add_rule(
                "FORWARD",
                &jump_to_isolation,
                true,
                RuleOpts::comment("Direct bridged traffic to the isolation pipeline."),
            )?;
            table.add_rule(
                ISOLATION_CHAIN,
                &jump_to_chain,
                true,
                RuleOpts::comment("Jump to the per-network chain."),
            )?;
            if direction == Direction::Egress {
                table.add_rule(
                    "INPUT",
                    &jump_to_chain,
                    true,
                    RuleOpts::comment("Bridged traffic addressed to the host."),
                )?;
            }
        }
        Ok(())
    }

    /// Declare and fill one direction's chain in both families. A direction
    /// with no rules gets no chain at all, so a network whose rules vanish
    /// is torn down rather than left with an empty shell.
    fn setup_chain(
        &mut self,
        device: &str,
        physical_network: &str,
        rules: &[IsolationRule],
        direction: Direction,
    ) -> Result<(), FirewallError> {
        let directed: Vec<IsolationRule> = rules
            .iter()
            .filter(|r| r.direction == direction)
            .cloned()
            .collect();
        if directed.is_empty() {
            return Ok(());
        }

        let chain_name = network_chain_name(physical_network, direction);
        self.add_chain(&chain_name, device, direction)?;

        let expanded = expand_remote_ips(&directed, &*self.subnets);
        let (ipv4_rules, ipv6_rules) = split_rules_by_ethertype(expanded);

        for (manager, group) in [
            (&mut self.ipv4, ipv4_rules),
            (&mut self.ipv6, ipv6_rules),
        ] {
            let table = manager.filter();
            table.add_rule(
                &chain_name,
                "-m state --state RELATED,ESTABLISHED -j RETURN",
                true,
                RuleOpts::comment("Return packets of a known session."),
            )?;
            let mut seen = HashSet::new();
            for rule in &group {
                let line = rule_args(rule).join(" ");
                if seen.insert(line.clone()) {
                    table.add_rule(&chain_name, &line, true, RuleOpts::default())?;
                }
            }
            table.add_rule(
                &chain_name,
                "-m state --state INVALID -j DROP",
                true,
                RuleOpts::comment("Drop packets that are not associated with a state."),
            )?;
            table.add_rule(
                &chain_name,
                "-j $fallback",
                true,
                RuleOpts::comment("Send unmatched traffic to the fallback chain."),
            )?;
        }
        Ok(())
    }

    fn remove_chain(&mut self, physical_network: &str, direction: Direction) {
        let chain_name = network_chain_name(physical_network, direction);
        self.ipv4.filter().remove_chain(&chain_name, true);
        self.ipv6.filter().remove_chain(&chain_name, true);
    }

    fn rebuild_network(
        &mut self,
        physical_network: &str,
        rules: &[IsolationRule],
    ) -> Result<String, FirewallError> {
        let device = self.device_for(physical_network)?;
        self.remove_chain(physical_network, Direction::Ingress);
        self.remove_chain(physical_network, Direction::Egress);
        self.setup_chain(&device, physical_network, rules, Direction::Ingress)?;
        self.setup_chain(&device, physical_network, rules, Direction::Egress)?;
        Ok(device)
    }
}

impl<E: CommandExecutor> FirewallDriver for IptablesFirewall<E> {
    async fn init_firewall(&mut self) -> Result<(), FirewallError> {
        self.ipv4.apply().await?;
        self.ipv6.apply().await?;
        Ok(())
    }

    async fn update_rules(
        &mut self,
        physical_network: &str,
        rules: &[IsolationRule],
    ) -> Result<(), FirewallError> {
        let device = self.rebuild_network(physical_network, rules)?;
        debug!(
            "Updating iptables rules for network {:?} on {:?} ({} rules)",
            physical_network,
            device,
            rules.len()
        );
        self.ipv4.apply().await?;
        self.ipv6.apply().await?;
        Ok(())
    }

    async fn plan_rules(
        &mut self,
        physical_network: &str,
        rules: &[IsolationRule],
    ) -> Result<Vec<String>, FirewallError> {
        self.rebuild_network(physical_network, rules)?;
        let mut commands = self.ipv4.plan().await?;
        commands.extend(self.ipv6.plan().await?);
        Ok(commands)
    }

    async fn dump_state(&mut self) -> Result<String, FirewallError> {
        let mut dump = self.ipv4.dump().await?;
        dump.push_str(&self.ipv6.dump().await?);
        Ok(dump)
    }
}

fn rule_args(rule: &IsolationRule) -> Vec<String> {
    // The matched address is the far end: source of ingress traffic,
    // destination of egress traffic.
    let addr_flag = match rule.direction {
        Direction::Ingress => "-s",
        Direction::Egress => "-d",
    };
    let mut args = ip_prefix_arg(addr_flag, rule.remote_ip.as_deref());

    let protocol = protocol_token(rule.protocol.as_deref());
    if let Some(proto) = &protocol {
        args.push("-p".to_string());
        args.push(proto.clone());
        // The port match lives in the protocol's own module.
        if rule.port_range_min.is_some()
            && matches!(proto.as_str(), "tcp" | "udp" | "dccp" | "sctp")
        {
            args.push("-m".to_string());
            args.push(proto.clone());
        }
    }

    args.extend(port_args(rule, protocol.as_deref()));
    args.push("-j".to_string());
    args.push("DROP".to_string());
    args
}

/// Port arguments. For ICMP the range fields carry type/code instead of
/// ports; code zero is significant, so it renders whenever present.
fn port_args(rule: &IsolationRule, protocol: Option<&str>) -> Vec<String> {
    let Some(min) = rule.port_range_min else {
        return Vec::new();
    };

    match protocol {
        Some("icmp") | Some("ipv6-icmp") => {
            let flag = if protocol == Some("ipv6-icmp") {
                "--icmpv6-type"
            } else {
                "--icmp-type"
            };
            let mut arg = min.to_string();
            if let Some(code) = rule.port_range_max {
                arg.push('/');
                arg.push_str(&code.to_string());
            }
            vec![flag.to_string(), arg]
        }
        _ => {
            let port_name = match rule.direction {
                Direction::Ingress => "dport",
                Direction::Egress => "sport",
            };
            let max = rule.port_range_max.unwrap_or(min);
            if min == max {
                vec![format!("--{}", port_name), min.to_string()]
            } else {
                vec![
                    "-m".to_string(),
                    "multiport".to_string(),
                    format!("--{}s", port_name),
                    format!("{}:{}", min, max),
                ]
            }
        }
    }
}
