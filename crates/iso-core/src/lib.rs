pub mod config;
pub mod lookup;
pub mod rule;

pub use config::*;
pub use lookup::*;
pub use rule::*;

// Shared domain types for the isoflat traffic-isolation agent
