//! Per-host running statistics.
//!
//! [`StatsTracker`] is owned by the aggregator and mutated only while it
//! closes a round, so it needs no locking. Anything handed to other tasks is a
//! [`HostSnapshot`] copy.

use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use crate::aggregator::Outcome;
use crate::host::{HostId, HostRegistry};

/// Running statistics for one host.
///
/// The mean uses Welford's update in `f64` seconds, so after `n` successes it
/// equals the arithmetic mean of those RTTs to within float rounding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: Option<Duration>,
    max: Option<Duration>,
    fails: u64,
}

impl HostStats {
    /// Incorporate one round outcome.
    pub fn apply(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Success(rtt) => self.record_success(*rtt),
            Outcome::Failure => self.fails += 1,
        }
    }

    fn record_success(&mut self, rtt: Duration) {
        let x = rtt.as_secs_f64();
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.min = Some(self.min.map_or(rtt, |m| m.min(rtt)));
        self.max = Some(self.max.map_or(rtt, |m| m.max(rtt)));
    }

    /// Number of successful rounds.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Number of failed rounds. Never decreases.
    pub fn fails(&self) -> u64 {
        self.fails
    }

    /// Mean RTT over successes (zero before the first success).
    pub fn avg(&self) -> Duration {
        Duration::from_secs_f64(self.mean.max(0.0))
    }

    /// Sample standard deviation of RTT, if at least two successes exist.
    pub fn stddev(&self) -> Option<Duration> {
        (self.count >= 2)
            .then(|| Duration::from_secs_f64((self.m2 / (self.count - 1) as f64).max(0.0).sqrt()))
    }

    pub fn min(&self) -> Option<Duration> {
        self.min
    }

    pub fn max(&self) -> Option<Duration> {
        self.max
    }
}

/// By-value copy of a host's identity and statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSnapshot {
    pub id: HostId,
    pub name: String,
    pub address: IpAddr,
    pub count: u64,
    pub fails: u64,
    #[serde(with = "humantime_serde")]
    pub avg: Duration,
    #[serde(with = "humantime_serde")]
    pub stddev: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub min: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub max: Option<Duration>,
}

impl HostSnapshot {
    /// Total rounds observed for this host.
    pub fn rounds(&self) -> u64 {
        self.count + self.fails
    }
}

/// Statistics for every registered host, indexed by [`HostId`].
#[derive(Debug, Clone)]
pub struct StatsTracker {
    hosts: Vec<HostStats>,
}

impl StatsTracker {
    /// Create a tracker with one zeroed entry per host.
    pub fn new(host_count: usize) -> Self {
        Self {
            hosts: vec![HostStats::default(); host_count],
        }
    }

    /// Apply one outcome. Unknown ids are ignored.
    pub fn apply(&mut self, host: HostId, outcome: &Outcome) {
        if let Some(stats) = self.hosts.get_mut(host.index()) {
            stats.apply(outcome);
        }
    }

    pub fn get(&self, host: HostId) -> Option<&HostStats> {
        self.hosts.get(host.index())
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Copy the current statistics of every host, in id order.
    pub fn snapshot(&self, registry: &HostRegistry) -> Vec<HostSnapshot> {
        registry
            .iter()
            .filter_map(|host| {
                let stats = self.get(host.id)?;
                Some(HostSnapshot {
                    id: host.id,
                    name: host.name.clone(),
                    address: host.address,
                    count: stats.count(),
                    fails: stats.fails(),
                    avg: stats.avg(),
                    stddev: stats.stddev(),
                    min: stats.min(),
                    max: stats.max(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.as_secs_f64() - expected.as_secs_f64();
        assert!(
            diff.abs() < 1e-9,
            "expected {expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn test_mean_of_three_successes() {
        let mut stats = HostStats::default();
        for v in [10, 20, 30] {
            stats.apply(&Outcome::Success(ms(v)));
        }
        assert_eq!(stats.count(), 3);
        assert_eq!(stats.fails(), 0);
        assert_close(stats.avg(), ms(20));
        assert_close(stats.stddev().unwrap(), ms(10));
        assert_eq!(stats.min(), Some(ms(10)));
        assert_eq!(stats.max(), Some(ms(30)));
    }

    #[test]
    fn test_failures_do_not_move_average() {
        let mut stats = HostStats::default();
        for _ in 0..3 {
            stats.apply(&Outcome::Failure);
        }
        stats.apply(&Outcome::Success(ms(5)));
        assert_eq!(stats.fails(), 3);
        assert_eq!(stats.count(), 1);
        assert_close(stats.avg(), ms(5));
        assert!(stats.stddev().is_none());
    }

    #[test]
    fn test_sub_millisecond_precision_kept() {
        // Integer-millisecond averaging would collapse these to 0
        let mut stats = HostStats::default();
        for us in [300, 400, 500] {
            stats.apply(&Outcome::Success(Duration::from_micros(us)));
        }
        assert_close(stats.avg(), Duration::from_micros(400));
    }

    #[test]
    fn test_mean_stable_over_many_samples() {
        let mut stats = HostStats::default();
        let n = 100_000u64;
        for i in 0..n {
            stats.apply(&Outcome::Success(Duration::from_micros(1_000 + i % 7)));
        }
        let exact = (0..n).map(|i| 1_000.0 + (i % 7) as f64).sum::<f64>() / n as f64;
        let got = stats.avg().as_secs_f64() * 1e6;
        assert!((got - exact).abs() < 1e-3, "got {got}, expected {exact}");
    }

    #[test]
    fn test_fail_count_never_decreases() {
        let mut stats = HostStats::default();
        let mut last = 0;
        let pattern = [true, false, false, true, false, true, true, false];
        for success in pattern {
            let outcome = if success {
                Outcome::Success(ms(12))
            } else {
                Outcome::Failure
            };
            stats.apply(&outcome);
            assert!(stats.fails() >= last);
            last = stats.fails();
        }
        assert_eq!(stats.fails(), 4);
    }

    #[test]
    fn test_tracker_ignores_unknown_host() {
        let mut tracker = StatsTracker::new(1);
        tracker.apply(HostId(5), &Outcome::Failure);
        assert_eq!(tracker.get(HostId(0)).unwrap().fails(), 0);
        assert!(tracker.get(HostId(5)).is_none());
    }
}
