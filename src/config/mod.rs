//! Configuration module for pingtest.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Host specifications and the duplicate-address policy
//! - Probe timing (round interval, max RTT)
//! - Persistence tiers, snapshot directory, retention
//! - Database settings (path, channel capacity, checkpoint interval)

mod app;
mod validation;

pub use app::{
    AppConfig, DatabaseConfig, PersistenceConfig, ProbeConfig, ShutdownConfig,
};
pub use validation::{ConfigError, format_duration, parse_duration};

// Re-export constants
pub use app::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_DRAIN_TIMEOUT, DEFAULT_MAX_RTT, DEFAULT_PROBE_INTERVAL,
};
