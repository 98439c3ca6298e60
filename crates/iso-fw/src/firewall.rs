use std::future::Future;
use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;

use iso_core::{Direction, Ethertype, IsolationRule, SubnetLookup};

use crate::error::FirewallError;
use crate::table::get_chain_name;

/// Owner tag prepended to every wrapped chain so independent rule-set
/// owners can coexist in one kernel table.
pub const BINARY_NAME: &str = "isoflat";

pub fn chain_name_prefix(direction: Direction) -> &'static str {
    match direction {
        Direction::Ingress => "i-",
        Direction::Egress => "o-",
    }
}

/// Per-(network, direction) chain name, wrapped for this owner.
pub fn network_chain_name(physical_network: &str, direction: Direction) -> String {
    get_chain_name(
        &format!("{}{}", chain_name_prefix(direction), physical_network),
        true,
    )
}

/// Backend-family contract. Both families compile the same abstract rules
/// and route through the same diff/apply machinery; they differ only in
/// rule syntax and table layout.
pub trait FirewallDriver {
    /// Push the bootstrap wiring to the kernel.
    fn init_firewall(&mut self) -> impl Future<Output = Result<(), FirewallError>> + Send;

    /// Replace the declared rule set for one physical network and converge
    /// the kernel on it.
    fn update_rules(
        &mut self,
        physical_network: &str,
        rules: &[IsolationRule],
    ) -> impl Future<Output = Result<(), FirewallError>> + Send;

    /// Compute the command script `update_rules` would commit, without
    /// touching the kernel.
    fn plan_rules(
        &mut self,
        physical_network: &str,
        rules: &[IsolationRule],
    ) -> impl Future<Output = Result<Vec<String>, FirewallError>> + Send;

    /// Raw dump of the live backend state, for status reporting.
    fn dump_state(&mut self) -> impl Future<Output = Result<String, FirewallError>> + Send;
}

/// Fan a remote-network reference out into one rule per subnet. Subnets of
/// the wrong address family for the rule's ethertype match nothing and are
/// skipped; a lookup failure degrades to skipping the rule rather than
/// failing the batch.
pub(crate) fn expand_remote_ips(
    rules: &[IsolationRule],
    subnets: &dyn SubnetLookup,
) -> Vec<IsolationRule> {
    let mut expanded = Vec::new();
    for rule in rules {
        let Some(network_id) = &rule.remote_network_id else {
            expanded.push(rule.clone());
            continue;
        };
        match subnets.subnets(network_id) {
            Ok(cidrs) => {
                for cidr in cidrs {
                    let family_matches = matches!(
                        (&cidr, rule.ethertype),
                        (IpNet::V4(_), Ethertype::IPv4) | (IpNet::V6(_), Ethertype::IPv6)
                    );
                    if !family_matches {
                        continue;
                    }
                    let mut fanned = rule.clone();
                    fanned.remote_ip = Some(cidr.to_string());
                    fanned.remote_network_id = None;
                    expanded.push(fanned);
                }
            }
            Err(err) => {
                warn!("Failed to expand remote network {}: {}", network_id, err);
            }
        }
    }
    expanded
}

/// Partition rules into IPv4 and IPv6 groups; plain `icmp` in the IPv6
/// group is rewritten to the IPv6 ICMP protocol identifier.
pub(crate) fn split_rules_by_ethertype(
    rules: Vec<IsolationRule>,
) -> (Vec<IsolationRule>, Vec<IsolationRule>) {
    let mut ipv4_rules = Vec::new();
    let mut ipv6_rules = Vec::new();
    for mut rule in rules {
        match rule.ethertype {
            Ethertype::IPv4 => ipv4_rules.push(rule),
            Ethertype::IPv6 => {
                if rule.protocol.as_deref() == Some("icmp") {
                    rule.protocol = Some("ipv6-icmp".to_string());
                }
                ipv6_rules.push(rule);
            }
        }
    }
    (ipv4_rules, ipv6_rules)
}

/// Address-match argument. A bare address is normalized to a full-length
/// prefix; a zero-length prefix is no constraint at all, so it emits
/// nothing; an unparseable address degrades to no constraint.
pub(crate) fn ip_prefix_arg(flag: &str, ip_prefix: Option<&str>) -> Vec<String> {
    let Some(prefix) = ip_prefix else {
        return Vec::new();
    };

    if !prefix.contains('/') {
        return match prefix.parse::<IpAddr>() {
            Ok(addr) => {
                let net = IpNet::from(addr);
                vec![flag.to_string(), net.to_string()]
            }
            Err(_) => {
                warn!("Ignoring unparseable remote address {:?}", prefix);
                Vec::new()
            }
        };
    }

    if prefix.ends_with("/0") {
        return Vec::new();
    }

    vec![flag.to_string(), prefix.to_string()]
}

/// Map a logical protocol name to the backend token. Protocol zero (and
/// its aliases) means "any" and emits no protocol argument.
pub(crate) fn protocol_token(protocol: Option<&str>) -> Option<String> {
    let protocol = protocol?.trim().to_ascii_lowercase();
    match protocol.as_str() {
        "" | "0" | "any" => None,
        "icmpv6" => Some("ipv6-icmp".to_string()),
        _ => Some(protocol),
    }
}
