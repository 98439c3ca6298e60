use serde::{Deserialize, Serialize};

/// A declarative statement describing traffic to drop for one physical
/// network: direction, protocol/port scope, and remote scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationRule {
    pub network_id: String,
    pub direction: Direction,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub port_range_min: Option<u16>,
    #[serde(default)]
    pub port_range_max: Option<u16>,
    #[serde(default = "default_ethertype")]
    pub ethertype: Ethertype,
    /// Literal remote address or CIDR. At most one of `remote_ip` and
    /// `remote_network_id` may be set; neither means "all remotes".
    #[serde(default)]
    pub remote_ip: Option<String>,
    /// Reference to another network whose subnets are the remote scope.
    #[serde(default)]
    pub remote_network_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ethertype {
    IPv4,
    IPv6,
}

fn default_ethertype() -> Ethertype {
    Ethertype::IPv4
}

impl IsolationRule {
    /// Sanity-check the optional fields. A rule that fails this check is
    /// still compiled with whatever constraints it can express; the check
    /// exists so callers can warn before handing rules to a driver.
    pub fn is_well_formed(&self) -> bool {
        if self.remote_ip.is_some() && self.remote_network_id.is_some() {
            return false;
        }
        match (self.port_range_min, self.port_range_max) {
            (Some(min), Some(max)) => {
                // For ICMP, min is the type and max the code, so no ordering
                // constraint applies.
                self.is_icmp() || min <= max
            }
            (None, Some(_)) => false,
            _ => true,
        }
    }

    pub fn is_icmp(&self) -> bool {
        matches!(
            self.protocol.as_deref(),
            Some("icmp") | Some("icmpv6") | Some("ipv6-icmp")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> IsolationRule {
        IsolationRule {
            network_id: "net-1".into(),
            direction: Direction::Ingress,
            protocol: Some("tcp".into()),
            port_range_min: Some(80),
            port_range_max: Some(80),
            ethertype: Ethertype::IPv4,
            remote_ip: None,
            remote_network_id: None,
        }
    }

    #[test]
    fn well_formed_accepts_plain_rule() {
        assert!(rule().is_well_formed());
    }

    #[test]
    fn well_formed_rejects_both_remote_fields() {
        let mut r = rule();
        r.remote_ip = Some("10.0.0.1".into());
        r.remote_network_id = Some("net-2".into());
        assert!(!r.is_well_formed());
    }

    #[test]
    fn well_formed_rejects_inverted_port_range() {
        let mut r = rule();
        r.port_range_min = Some(443);
        r.port_range_max = Some(80);
        assert!(!r.is_well_formed());
    }

    #[test]
    fn icmp_code_may_be_lower_than_type() {
        let mut r = rule();
        r.protocol = Some("icmp".into());
        r.port_range_min = Some(8);
        r.port_range_max = Some(0);
        assert!(r.is_well_formed());
    }

    #[test]
    fn direction_serializes_lowercase() {
        assert_eq!(
            serde_yaml::to_string(&Direction::Ingress).unwrap().trim(),
            "ingress"
        );
    }
}
