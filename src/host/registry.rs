//! Registry of monitored hosts with stable integer ids.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::config::ConfigError;
use crate::host::HostSpec;

/// Stable host identifier, assigned sequentially from 0 at registration.
///
/// Doubles as the index into every per-host table (round table, stats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub u32);

impl HostId {
    /// Index into per-host vectors.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Policy for two specs that resolve to the same address.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DuplicatePolicy {
    /// Fail startup with [`ConfigError::AmbiguousAddress`].
    #[default]
    Reject,
    /// Keep the first host; later names become aliases.
    Merge,
}

/// A registered monitoring target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub address: IpAddr,
    /// Names merged into this host under [`DuplicatePolicy::Merge`].
    pub aliases: Vec<String>,
}

/// Fixed set of hosts, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<Host>,
    by_addr: HashMap<IpAddr, HostId>,
}

impl HostRegistry {
    /// Resolve every spec and build the registry.
    ///
    /// Resolution failures are fatal: no partial monitoring set is returned.
    pub async fn resolve(
        specs: &[HostSpec],
        policy: DuplicatePolicy,
    ) -> Result<Self, ConfigError> {
        let mut resolved = Vec::with_capacity(specs.len());
        for spec in specs {
            let addr = resolve_address(&spec.address)
                .await
                .map_err(|source| ConfigError::Resolve {
                    name: spec.name.clone(),
                    address: spec.address.clone(),
                    source,
                })?;
            tracing::debug!(host = %spec.name, address = %addr, "Resolved host");
            resolved.push((spec.clone(), addr));
        }
        Self::from_resolved(resolved, policy)
    }

    /// Build the registry from already-resolved specs.
    pub fn from_resolved(
        resolved: Vec<(HostSpec, IpAddr)>,
        policy: DuplicatePolicy,
    ) -> Result<Self, ConfigError> {
        if resolved.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one host must be configured".to_string(),
            ));
        }

        let mut registry = Self::default();
        for (spec, addr) in resolved {
            if let Some(&existing) = registry.by_addr.get(&addr) {
                let host = &mut registry.hosts[existing.index()];
                match policy {
                    DuplicatePolicy::Reject => {
                        return Err(ConfigError::AmbiguousAddress {
                            address: addr,
                            first: host.name.clone(),
                            second: spec.name,
                        });
                    }
                    DuplicatePolicy::Merge => {
                        tracing::warn!(
                            host = %host.name,
                            alias = %spec.name,
                            address = %addr,
                            "Duplicate address merged into existing host"
                        );
                        if spec.name != host.name && !host.aliases.contains(&spec.name) {
                            host.aliases.push(spec.name);
                        }
                        continue;
                    }
                }
            }

            let id = HostId(registry.hosts.len() as u32);
            registry.by_addr.insert(addr, id);
            registry.hosts.push(Host {
                id,
                name: spec.name,
                address: addr,
                aliases: Vec::new(),
            });
        }

        Ok(registry)
    }

    /// Look up the host registered for `addr`.
    pub fn lookup(&self, addr: &IpAddr) -> Option<HostId> {
        self.by_addr.get(addr).copied()
    }

    /// Get a host by id.
    pub fn get(&self, id: HostId) -> Option<&Host> {
        self.hosts.get(id.index())
    }

    /// Hosts in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter()
    }

    /// Resolved addresses in id order.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.hosts.iter().map(|h| h.address).collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Parse a list of spec strings, failing on the first invalid one.
pub fn parse_specs<S: AsRef<str>>(specs: &[S]) -> Result<Vec<HostSpec>, ConfigError> {
    specs.iter().map(|s| HostSpec::parse(s.as_ref())).collect()
}

/// Resolve hostname to IP address.
async fn resolve_address(host: &str) -> Result<IpAddr, std::io::Error> {
    // First, try to parse as an IP address directly
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    // Otherwise, resolve the hostname using tokio's DNS lookup
    let addrs = tokio::net::lookup_host(format!("{host}:0")).await?;
    addrs
        .into_iter()
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn resolved(specs: &[&str]) -> Vec<(HostSpec, IpAddr)> {
        specs
            .iter()
            .map(|s| {
                let spec = HostSpec::parse(s).unwrap();
                let addr = spec.address.parse().unwrap();
                (spec, addr)
            })
            .collect()
    }

    #[test]
    fn test_sequential_ids_and_lookup() {
        let registry = HostRegistry::from_resolved(
            resolved(&["router:192.168.1.1", "8.8.8.8", "lo6:::1"]),
            DuplicatePolicy::Reject,
        )
        .unwrap();

        assert_eq!(registry.len(), 3);
        let ids: Vec<_> = registry.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![HostId(0), HostId(1), HostId(2)]);

        let router = registry.lookup(&"192.168.1.1".parse().unwrap()).unwrap();
        assert_eq!(registry.get(router).unwrap().name, "router");
        assert_eq!(registry.get(HostId(1)).unwrap().name, "8.8.8.8");
        assert!(registry.lookup(&"10.9.9.9".parse().unwrap()).is_none());
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let result = HostRegistry::from_resolved(
            resolved(&["a:10.0.0.1", "b:10.0.0.1"]),
            DuplicatePolicy::Reject,
        );
        match result {
            Err(ConfigError::AmbiguousAddress { first, second, .. }) => {
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
            other => panic!("expected AmbiguousAddress, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_address_merged() {
        let registry = HostRegistry::from_resolved(
            resolved(&["a:10.0.0.1", "c:10.0.0.2", "b:10.0.0.1"]),
            DuplicatePolicy::Merge,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        let a = registry.get(HostId(0)).unwrap();
        assert_eq!(a.name, "a");
        assert_eq!(a.aliases, vec!["b".to_string()]);
        assert_eq!(registry.lookup(&"10.0.0.2".parse().unwrap()), Some(HostId(1)));
    }

    #[test]
    fn test_empty_registry_rejected() {
        assert!(HostRegistry::from_resolved(vec![], DuplicatePolicy::Reject).is_err());
    }

    #[test]
    fn test_duplicate_policy_from_str() {
        assert_eq!(
            DuplicatePolicy::from_str("merge").unwrap(),
            DuplicatePolicy::Merge
        );
        assert_eq!(
            DuplicatePolicy::from_str("REJECT").unwrap(),
            DuplicatePolicy::Reject
        );
        assert!(DuplicatePolicy::from_str("overwrite").is_err());
    }

    #[tokio::test]
    async fn test_resolve_literals() {
        let specs = parse_specs(&["router:127.0.0.1", "::1"]).unwrap();
        let registry = HostRegistry::resolve(&specs, DuplicatePolicy::Reject)
            .await
            .unwrap();
        assert_eq!(
            registry.addresses(),
            vec![
                IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)
            ]
        );
    }

    #[tokio::test]
    async fn test_resolve_failure_is_fatal() {
        let specs = parse_specs(&["ok:127.0.0.1", "bad:no-such-host.invalid"]).unwrap();
        let result = HostRegistry::resolve(&specs, DuplicatePolicy::Reject).await;
        match result {
            Err(ConfigError::Resolve { name, .. }) => assert_eq!(name, "bad"),
            other => panic!("expected Resolve error, got {other:?}"),
        }
    }
}
