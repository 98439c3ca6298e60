use anyhow::Result;
use ipnet::IpNet;
use std::collections::HashMap;

use crate::rule::IsolationRule;

/// Expands a remote network reference into its concrete subnets.
pub trait SubnetLookup: Send + Sync {
    fn subnets(&self, network_id: &str) -> Result<Vec<IpNet>>;
}

/// Source of the declared rule set for a physical network, used to refresh
/// firewall state on agent (re)start.
pub trait RuleStore: Send + Sync {
    fn rules_for_network(&self, physical_network: &str) -> Result<Vec<IsolationRule>>;
}

/// In-memory subnet index. An unknown network resolves to no subnets, which
/// compiles to no rules rather than an error; rule delivery and network
/// deletion can race.
#[derive(Debug, Default, Clone)]
pub struct StaticSubnetMap {
    subnets: HashMap<String, Vec<IpNet>>,
}

impl StaticSubnetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, network_id: &str, subnets: Vec<IpNet>) {
        self.subnets.insert(network_id.to_string(), subnets);
    }
}

impl SubnetLookup for StaticSubnetMap {
    fn subnets(&self, network_id: &str) -> Result<Vec<IpNet>> {
        Ok(self.subnets.get(network_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_network_yields_no_subnets() {
        let map = StaticSubnetMap::new();
        assert!(map.subnets("missing").unwrap().is_empty());
    }

    #[test]
    fn returns_registered_subnets() {
        let mut map = StaticSubnetMap::new();
        map.insert(
            "net-1",
            vec!["10.0.0.0/24".parse().unwrap(), "10.0.1.0/24".parse().unwrap()],
        );
        assert_eq!(map.subnets("net-1").unwrap().len(), 2);
    }
}
