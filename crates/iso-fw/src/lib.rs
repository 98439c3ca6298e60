pub mod diff;
pub mod ebtables;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod iptables;
pub mod manager;
pub mod table;

pub use ebtables::EbtablesFirewall;
pub use error::FirewallError;
pub use exec::{CommandExecutor, HostExecutor};
pub use firewall::FirewallDriver;
pub use iptables::IptablesFirewall;
pub use manager::{ApplyLock, ManagerOpts, TableManager};

// Rule engine for the isoflat traffic-isolation agent
