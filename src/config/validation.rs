//! Configuration errors and validation utilities.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

/// Configuration error types.
///
/// Every variant is fatal at startup: the process exits before any probing
/// begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),

    /// A host specification could not be parsed.
    #[error("invalid host spec '{spec}': {reason}")]
    InvalidHostSpec { spec: String, reason: String },

    /// A host address did not resolve.
    #[error("failed to resolve '{address}' for host '{name}': {source}")]
    Resolve {
        name: String,
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Two host specifications resolved to the same address.
    #[error("hosts '{first}' and '{second}' both resolve to {address}")]
    AmbiguousAddress {
        address: IpAddr,
        first: String,
        second: String,
    },
}

/// Parse duration string using humantime.
///
/// Supports various formats: `30s`, `1m`, `5m30s`, `1h`, `2h30m`, `1d`, `100ms`, etc.
///
/// # Examples
///
/// ```
/// use pingtest::config::parse_duration;
///
/// assert_eq!(parse_duration("30s").unwrap().as_secs(), 30);
/// assert_eq!(parse_duration("1m").unwrap().as_secs(), 60);
/// assert_eq!(parse_duration("1h30m").unwrap().as_secs(), 5400);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Render a duration the way window labels and log fields show it (`5m`, `1h 30m`).
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_valid() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("30x").is_err());
        assert!(parse_duration("30").is_err());
    }

    #[test]
    fn test_parse_duration_extended_formats() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("2h 30m").unwrap(), Duration::from_secs(9000));
    }

    #[test]
    fn test_format_duration_labels() {
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(86400)), "1day");
    }

    #[test]
    fn test_ambiguous_address_message() {
        let err = ConfigError::AmbiguousAddress {
            address: "10.0.0.1".parse().unwrap(),
            first: "a".to_string(),
            second: "b".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "hosts 'a' and 'b' both resolve to 10.0.0.1"
        );
    }
}
