//! Host registry: parses host specifications into a stable set of monitored
//! targets, each with an integer id and an address index.
//!
//! - [`HostSpec`]: `name:address` or bare `address`
//! - [`HostRegistry`]: resolved hosts, `IpAddr -> HostId` lookup

mod registry;
mod spec;

pub use registry::{DuplicatePolicy, Host, HostId, HostRegistry, parse_specs};
pub use spec::HostSpec;
