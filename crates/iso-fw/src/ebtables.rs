use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use iso_core::{Direction, Ethertype, IsolationRule, SubnetLookup};

use crate::error::FirewallError;
use crate::exec::CommandExecutor;
use crate::firewall::{
    expand_remote_ips, ip_prefix_arg, network_chain_name, protocol_token, split_rules_by_ethertype,
    FirewallDriver,
};
use crate::manager::{ApplyLock, ManagerOpts, TableManager};
use crate::table::RuleOpts;

/// Bridge-level backend. IPv4 and IPv6 rules land in the same filter table,
/// distinguished by the `-p ipv4` / `-p ipv6` ethertype match.
pub struct EbtablesFirewall<E: CommandExecutor> {
    manager: TableManager<E>,
    bridge_map: HashMap<String, String>,
    subnets: Arc<dyn SubnetLookup>,
}

impl<E: CommandExecutor> EbtablesFirewall<E> {
    pub fn new(
        executor: Arc<E>,
        lock: ApplyLock,
        opts: &ManagerOpts,
        bridge_map: HashMap<String, String>,
        subnets: Arc<dyn SubnetLookup>,
    ) -> Result<Self, FirewallError> {
        let mut manager = TableManager::new("ebtables", executor, lock, opts);
        manager.setup_filter_table()?;

        let mut firewall = Self {
            manager,
            bridge_map,
            subnets,
        };
        firewall.add_fallback_chain()?;
        Ok(firewall)
    }

    fn add_fallback_chain(&mut self) -> Result<(), FirewallError> {
        let table = self.manager.filter();
        table.add_chain("fallback", true);
        table.add_rule("fallback", "-j ACCEPT", true, RuleOpts::default())
    }

    fn device_for(&self, physical_network: &str) -> Result<String, FirewallError> {
        self.bridge_map
            .get(physical_network)
            .cloned()
            .ok_or_else(|| FirewallError::UnmappedNetwork(physical_network.to_string()))
    }

    /// Declare the per-network chain and hang it off the built-in chains the
    /// bridge traffic traverses, keyed on the bridge device.
    fn add_chain(
        &mut self,
        chain_name: &str,
        device: &str,
        direction: Direction,
    ) -> Result<(), FirewallError> {
        let table = self.manager.filter();
        table.add_chain(chain_name, true);

        match direction {
            Direction::Egress => {
                let jump_rule = format!("-i {} -j ${}", device, chain_name);
                table.add_rule("INPUT", &jump_rule, true, RuleOpts::default())?;
                table.add_rule("FORWARD", &jump_rule, true, RuleOpts::default())?;
            }
            Direction::Ingress => {
                let jump_rule = format!("-o {} -j ${}", device, chain_name);
                table.add_rule("OUTPUT", &jump_rule, true, RuleOpts::default())?;
                table.add_rule("FORWARD", &jump_rule, true, RuleOpts::default())?;
            }
        }
        Ok(())
    }

    /// Declare and fill one direction's chain. A direction with no rules
    /// gets no chain at all, so a network whose rules vanish is torn down
    /// rather than left with an empty shell.
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

        for line in self.compile_rules(&directed) {
            self.manager
                .filter()
                .add_rule(&chain_name, &line, true, RuleOpts::default())?;
        }
        Ok(())
    }

    fn remove_chain(&mut self, physical_network: &str, direction: Direction) {
        let chain_name = network_chain_name(physical_network, direction);
        self.manager.filter().remove_chain(&chain_name, true);
    }

    /// Compile abstract rules to ebtables rule lines: dedup by rendered
    /// text with the first occurrence winning, fallback jump appended once,
    /// last.
    fn compile_rules(&self, rules: &[IsolationRule]) -> Vec<String> {
        let expanded = expand_remote_ips(rules, &*self.subnets);
        let (ipv4_rules, ipv6_rules) = split_rules_by_ethertype(expanded);

        let mut lines = Vec::new();
        let mut seen = HashSet::new();
        for (group, ethertype) in [(ipv4_rules, Ethertype::IPv4), (ipv6_rules, Ethertype::IPv6)] {
            for rule in &group {
                let line = rule_args(rule, ethertype).join(" ");
                if seen.insert(line.clone()) {
                    lines.push(line);
                }
            }
        }
        lines.push("-j $fallback".to_string());
        lines
    }
}

impl<E: CommandExecutor> FirewallDriver for EbtablesFirewall<E> {
    async fn init_firewall(&mut self) -> Result<(), FirewallError> {
        self.manager.apply().await?;
        Ok(())
    }

    async fn update_rules(
        &mut self,
        physical_network: &str,
        rules: &[IsolationRule],
    ) -> Result<(), FirewallError> {
        let device = self.device_for(physical_network)?;
        debug!(
            "Updating ebtables rules for network {:?} on {:?} ({} rules)",
            physical_network,
            device,
            rules.len()
        );

        self.remove_chain(physical_network, Direction::Ingress);
        self.remove_chain(physical_network, Direction::Egress);
        self.setup_chain(&device, physical_network, rules, Direction::Ingress)?;
        self.setup_chain(&device, physical_network, rules, Direction::Egress)?;
        self.manager.apply().await?;
        Ok(())
    }

    async fn plan_rules(
        &mut self,
        physical_network: &str,
        rules: &[IsolationRule],
    ) -> Result<Vec<String>, FirewallError> {
        let device = self.device_for(physical_network)?;
        self.remove_chain(physical_network, Direction::Ingress);
        self.remove_chain(physical_network, Direction::Egress);
        self.setup_chain(&device, physical_network, rules, Direction::Ingress)?;
        self.setup_chain(&device, physical_network, rules, Direction::Egress)?;
        self.manager.plan().await
    }

    async fn dump_state(&mut self) -> Result<String, FirewallError> {
        self.manager.dump().await
    }
}

fn rule_args(rule: &IsolationRule, ethertype: Ethertype) -> Vec<String> {
    let ip = match ethertype {
        Ethertype::IPv4 => "ip",
        Ethertype::IPv6 => "ip6",
    };

    let mut args = vec![
        "-p".to_string(),
        match ethertype {
            Ethertype::IPv4 => "ipv4".to_string(),
            Ethertype::IPv6 => "ipv6".to_string(),
        },
    ];

    // The matched address is the far end: source of ingress traffic,
    // destination of egress traffic.
    let addr_flag = match rule.direction {
        Direction::Ingress => format!("--{}-src", ip),
        Direction::Egress => format!("--{}-dst", ip),
    };
    args.extend(ip_prefix_arg(&addr_flag, rule.remote_ip.as_deref()));

    let protocol = protocol_token(rule.protocol.as_deref());
    if let Some(proto) = &protocol {
        args.push(format!("--{}-proto", ip));
        args.push(proto.clone());
    }

    args.extend(port_args(rule, ip, protocol.as_deref()));
    args.push("-j".to_string());
    args.push("DROP".to_string());
    args
}

/// Port arguments. For ICMP the range fields carry type/code instead of
/// ports; ebtables can only express that for ICMPv6, so plain ICMP degrades
/// to a protocol-only match.
fn port_args(rule: &IsolationRule, ip: &str, protocol: Option<&str>) -> Vec<String> {
    let Some(min) = rule.port_range_min else {
        return Vec::new();
    };

    match protocol {
        Some("ipv6-icmp") => {
            let mut arg = min.to_string();
            if let Some(code) = rule.port_range_max {
                arg.push('/');
                arg.push_str(&code.to_string());
            }
            vec!["--ip6-icmp-type".to_string(), arg]
        }
        Some("icmp") => {
            warn!("ebtables cannot match ICMP type/code; matching protocol only");
            Vec::new()
        }
        _ => {
            let flag = match rule.direction {
                Direction::Ingress => format!("--{}-dport", ip),
                Direction::Egress => format!("--{}-sport", ip),
            };
            let max = rule.port_range_max.unwrap_or(min);
            let value = if min == max {
                min.to_string()
            } else {
                format!("{}:{}", min, max)
            };
            vec![flag, value]
        }
    }
}
