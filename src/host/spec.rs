//! Host specification parsing.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::config::ConfigError;

/// A parsed `name:address` or bare `address` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    /// Display name (equal to the address for the bare form).
    pub name: String,
    /// Address text as written (IP literal or hostname).
    pub address: String,
}

impl HostSpec {
    /// Parse a host specification.
    ///
    /// A string that is a complete IP literal (including IPv6 such as `::1`)
    /// is the bare form. Otherwise the name ends at the first `:`, so
    /// `lo6:::1` names the IPv6 loopback.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let spec = spec.trim();
        let invalid = |reason: &str| ConfigError::InvalidHostSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        if spec.is_empty() {
            return Err(invalid("empty"));
        }

        if spec.parse::<IpAddr>().is_ok() {
            return Ok(Self {
                name: spec.to_string(),
                address: spec.to_string(),
            });
        }

        match spec.split_once(':') {
            Some((name, address)) => {
                let (name, address) = (name.trim(), address.trim());
                if name.is_empty() {
                    return Err(invalid("name is empty"));
                }
                if address.is_empty() {
                    return Err(invalid("address is empty"));
                }
                Ok(Self {
                    name: name.to_string(),
                    address: address.to_string(),
                })
            }
            None => Ok(Self {
                name: spec.to_string(),
                address: spec.to_string(),
            }),
        }
    }

    /// Whether the spec used the bare form.
    pub fn is_bare(&self) -> bool {
        self.name == self.address
    }
}

impl FromStr for HostSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bare() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{}:{}", self.name, self.address)
        }
    }
}
