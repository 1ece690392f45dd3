//! Application configuration structures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatcher::CadenceTier;
use crate::host::DuplicatePolicy;

use super::validation::{ConfigError, format_duration};

// =============================================================================
// Constants
// =============================================================================

/// Default time between round starts (1 second).
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-round reply bound (1 second).
pub const DEFAULT_MAX_RTT: Duration = Duration::from_secs(1);

/// Default ICMP payload size in bytes.
pub const DEFAULT_PAYLOAD_SIZE: usize = 56;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Default prober event channel capacity.
pub const DEFAULT_PROBE_CHANNEL_CAPACITY: usize = 1_024;

/// Default dispatcher queue capacity (rounds).
pub const DEFAULT_DISPATCH_CAPACITY: usize = 256;

/// Default checkpoint interval (5 seconds).
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// Default sample retention (30 days).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 86_400);

/// Default time allowed for the final persistence write on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn default_probe_interval() -> Duration {
    DEFAULT_PROBE_INTERVAL
}

fn default_max_rtt() -> Duration {
    DEFAULT_MAX_RTT
}

fn default_payload_size() -> usize {
    DEFAULT_PAYLOAD_SIZE
}

fn default_probe_channel_capacity() -> usize {
    DEFAULT_PROBE_CHANNEL_CAPACITY
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_dispatch_capacity() -> usize {
    DEFAULT_DISPATCH_CAPACITY
}

fn default_checkpoint_interval() -> Duration {
    DEFAULT_CHECKPOINT_INTERVAL
}

fn default_retention() -> Duration {
    DEFAULT_RETENTION
}

fn default_drain_timeout() -> Duration {
    DEFAULT_DRAIN_TIMEOUT
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

fn default_tiers() -> Vec<CadenceTier> {
    CadenceTier::defaults()
}

// =============================================================================
// Probe Configuration
// =============================================================================

/// Prober settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Time between round starts (default: 1s).
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Replies slower than this count as non-responses for the round (default: 1s).
    #[serde(default = "default_max_rtt", with = "humantime_serde")]
    pub max_rtt: Duration,

    /// ICMP echo payload size in bytes (default: 56).
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,

    /// Capacity of the reply and boundary channels (default: 1024).
    #[serde(default = "default_probe_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PROBE_INTERVAL,
            max_rtt: DEFAULT_MAX_RTT,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            channel_capacity: DEFAULT_PROBE_CHANNEL_CAPACITY,
        }
    }
}

impl ProbeConfig {
    /// Set the round interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the per-round reply bound.
    pub fn with_max_rtt(mut self, max_rtt: Duration) -> Self {
        self.max_rtt = max_rtt;
        self
    }
}

// =============================================================================
// Persistence Configuration
// =============================================================================

/// Cadence tiers and snapshot output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Cadence tiers, fastest first.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<CadenceTier>,

    /// Rounds queued for the dispatcher before new ones are dropped (default: 256).
    #[serde(default = "default_dispatch_capacity")]
    pub channel_capacity: usize,

    /// Directory receiving snapshot documents (default: "snapshots").
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Samples older than this are deleted on the slowest tier (default: 30d).
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            tiers: CadenceTier::defaults(),
            channel_capacity: DEFAULT_DISPATCH_CAPACITY,
            snapshot_dir: default_snapshot_dir(),
            retention: DEFAULT_RETENTION,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path.
    pub path: String,

    /// MPSC channel capacity for write operations (default: 10000).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// WAL checkpoint interval (default: 5s).
    #[serde(default = "default_checkpoint_interval", with = "humantime_serde")]
    pub checkpoint_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "pingtest.db".to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }
}

// =============================================================================
// Shutdown Configuration
// =============================================================================

/// Shutdown behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Upper bound on waiting for the final persistence write (default: 5s).
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Host specifications (`name:address` or bare `address`).
    #[serde(default)]
    pub hosts: Vec<String>,

    /// What to do when two specs resolve to the same address (default: reject).
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// Prober settings.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Cadence tiers and snapshot output.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Shutdown behaviour.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// Host validation is deferred until hosts from the command line have
    /// been merged in; call [`AppConfig::validate`] afterwards.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one host must be configured".to_string(),
            ));
        }

        if self.probe.max_rtt.is_zero() {
            return Err(ConfigError::ValidationError(
                "probe max_rtt must be positive".to_string(),
            ));
        }

        // A round cannot start before the previous one is allowed to time out
        if self.probe.interval < self.probe.max_rtt {
            return Err(ConfigError::ValidationError(format!(
                "probe interval ({}) must not be shorter than max_rtt ({})",
                format_duration(self.probe.interval),
                format_duration(self.probe.max_rtt),
            )));
        }

        if self.probe.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "probe channel_capacity must be positive".to_string(),
            ));
        }

        if self.persistence.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "persistence channel_capacity must be positive".to_string(),
            ));
        }

        if self.database.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "database channel_capacity must be positive".to_string(),
            ));
        }

        if self.database.checkpoint_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "database checkpoint_interval must be positive".to_string(),
            ));
        }

        validate_tiers(&self.persistence.tiers)?;

        Ok(())
    }
}

/// Tiers must be non-empty, strictly ascending, and carry positive windows.
fn validate_tiers(tiers: &[CadenceTier]) -> Result<(), ConfigError> {
    if tiers.is_empty() {
        return Err(ConfigError::ValidationError(
            "at least one persistence tier is required".to_string(),
        ));
    }

    let mut previous: Option<Duration> = None;
    for tier in tiers {
        if tier.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "tier interval must be positive".to_string(),
            ));
        }
        if let Some(prev) = previous
            && tier.interval <= prev
        {
            return Err(ConfigError::ValidationError(format!(
                "tier intervals must be strictly ascending ({} after {})",
                format_duration(tier.interval),
                format_duration(prev),
            )));
        }
        if tier.windows.iter().any(Duration::is_zero) {
            return Err(ConfigError::ValidationError(format!(
                "tier {} has a zero-length window",
                format_duration(tier.interval),
            )));
        }
        previous = Some(tier.interval);
    }

    Ok(())
}
