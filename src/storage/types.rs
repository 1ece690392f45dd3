//! Core data types for the storage layer.
//!
//! - [`HostRecord`]: one row per registered host
//! - [`SampleRecord`]: one row per host per round
//! - [`WindowSummary`]: per-host aggregate over a time window
//! - [`TelemetryEvent`]: the structured per-round log line

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::host::{Host, HostId};

/// A registered host as stored in the `hosts` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub host_id: HostId,
    pub name: String,
    pub address: String,
    pub aliases: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Host> for HostRecord {
    fn from(host: &Host) -> Self {
        Self {
            host_id: host.id,
            name: host.name.clone(),
            address: host.address.to_string(),
            aliases: host.aliases.clone(),
            created_at: Utc::now(),
        }
    }
}

/// One persisted round result for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub host_id: HostId,
    pub ts: DateTime<Utc>,
    /// Present on success, absent on failure.
    pub rtt: Option<Duration>,
    pub failed: bool,
}

impl SampleRecord {
    /// A reply observed within the round.
    pub fn success(host_id: HostId, ts: DateTime<Utc>, rtt: Duration) -> Self {
        Self {
            host_id,
            ts,
            rtt: Some(rtt),
            failed: false,
        }
    }

    /// No reply within the round.
    pub fn failure(host_id: HostId, ts: DateTime<Utc>) -> Self {
        Self {
            host_id,
            ts,
            rtt: None,
            failed: true,
        }
    }

    /// Render as the per-round telemetry event for `host`.
    pub fn telemetry(&self, host: &str) -> TelemetryEvent {
        TelemetryEvent {
            timestamp: self.ts,
            host: host.to_string(),
            rtt: self.rtt.map_or(0.0, |d| d.as_secs_f64()),
            fail: u8::from(self.failed),
        }
    }

    pub(crate) fn rtt_micros(&self) -> Option<i64> {
        self.rtt
            .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
    }
}

/// Structured per-host, per-round event: `{timestamp, host, rtt, fail}`.
///
/// `rtt` is in seconds and zero on failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub rtt: f64,
    pub fail: u8,
}

/// Aggregate of one host's samples over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSummary {
    pub host_id: HostId,
    pub name: String,
    pub address: String,
    pub samples: u64,
    pub failures: u64,
    #[serde(with = "humantime_serde")]
    pub avg_rtt: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub min_rtt: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub max_rtt: Option<Duration>,
}

impl WindowSummary {
    /// Fraction of samples that failed, `0.0` for an empty window.
    pub fn loss_ratio(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.failures as f64 / self.samples as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_success() {
        let ts = Utc::now();
        let sample = SampleRecord::success(HostId(0), ts, Duration::from_millis(15));
        let event = sample.telemetry("router");
        assert_eq!(event.host, "router");
        assert_eq!(event.fail, 0);
        assert!((event.rtt - 0.015).abs() < 1e-12);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["host"], "router");
        assert_eq!(json["fail"], 0);
        // chrono serializes as RFC3339
        let parsed: DateTime<Utc> = json["timestamp"].as_str().unwrap().parse().unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn test_telemetry_failure() {
        let sample = SampleRecord::failure(HostId(1), Utc::now());
        let event = sample.telemetry("modem");
        assert_eq!(event.rtt, 0.0);
        assert_eq!(event.fail, 1);
        assert_eq!(sample.rtt_micros(), None);
    }

    #[test]
    fn test_loss_ratio() {
        let summary = WindowSummary {
            host_id: HostId(0),
            name: "a".to_string(),
            address: "10.0.0.1".to_string(),
            samples: 4,
            failures: 1,
            avg_rtt: None,
            min_rtt: None,
            max_rtt: None,
        };
        assert!((summary.loss_ratio() - 0.25).abs() < f64::EPSILON);

        let empty = WindowSummary {
            samples: 0,
            failures: 0,
            ..summary
        };
        assert_eq!(empty.loss_ratio(), 0.0);
    }
}
