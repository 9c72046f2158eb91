#![deny(clippy::await_holding_refcell_ref)]

pub mod common;
pub mod config;
pub mod context;
pub mod fleet;
pub mod nodeconf;
pub mod provider;
pub mod scheduler;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::FleetError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

pub use common::WrappedRcRefCell;

/// Name of the instance tag that binds a cloud instance to a scheduler node.
pub const HOSTNAME_TAG: &str = "hostname";

pub const FLEET_VERSION: &str = env!("CARGO_PKG_VERSION");
