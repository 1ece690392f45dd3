//! Cadence tiers and the base-tick schedule derived from them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One persistence cadence: every `interval`, export a snapshot per window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CadenceTier {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default, with = "humantime_list")]
    pub windows: Vec<Duration>,
}

impl CadenceTier {
    pub fn new(interval: Duration, windows: Vec<Duration>) -> Self {
        Self { interval, windows }
    }

    /// 5s:[1m], 1m:[5m,15m], 10m:[1h,6h], 1h:[1d,7d].
    pub fn defaults() -> Vec<Self> {
        const MIN: u64 = 60;
        const HOUR: u64 = 60 * MIN;
        const DAY: u64 = 24 * HOUR;
        let secs = Duration::from_secs;
        vec![
            Self::new(secs(5), vec![secs(MIN)]),
            Self::new(secs(MIN), vec![secs(5 * MIN), secs(15 * MIN)]),
            Self::new(secs(10 * MIN), vec![secs(HOUR), secs(6 * HOUR)]),
            Self::new(secs(HOUR), vec![secs(DAY), secs(7 * DAY)]),
        ]
    }
}

/// `Vec<Duration>` as a list of humantime strings.
mod humantime_list {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    use crate::config::{format_duration, parse_duration};

    pub fn serialize<S: Serializer>(windows: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(windows.iter().map(|w| format_duration(*w)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|raw| parse_duration(raw).map_err(de::Error::custom))
            .collect()
    }
}

#[derive(Debug, Clone)]
struct TierClock {
    tick_target: u64,
    ticks_elapsed: u64,
}

/// Counts base ticks and reports which tiers are due.
///
/// The base tick is the fastest tier's interval; every tier fires once per
/// `interval / base` ticks, and at least once per tick.
#[derive(Debug, Clone)]
pub struct TierSchedule {
    base: Duration,
    clocks: Vec<TierClock>,
    slowest: Option<usize>,
}

impl TierSchedule {
    /// Base tick used when there are no tiers at all.
    pub const FALLBACK_BASE: Duration = Duration::from_secs(5);

    pub fn new(tiers: &[CadenceTier]) -> Self {
        let base = tiers
            .iter()
            .map(|t| t.interval)
            .min()
            .unwrap_or(Self::FALLBACK_BASE)
            .max(Duration::from_millis(1));
        let base_ms = base.as_millis().max(1);

        let clocks = tiers
            .iter()
            .map(|t| TierClock {
                tick_target: u64::try_from((t.interval.as_millis() / base_ms).max(1))
                    .unwrap_or(u64::MAX),
                ticks_elapsed: 0,
            })
            .collect();
        let slowest = tiers
            .iter()
            .enumerate()
            .max_by_key(|(_, t)| t.interval)
            .map(|(i, _)| i);

        Self {
            base,
            clocks,
            slowest,
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Ticks between firings of tier `idx`.
    pub fn tick_target(&self, idx: usize) -> Option<u64> {
        self.clocks.get(idx).map(|c| c.tick_target)
    }

    /// Index of the tier with the longest interval.
    pub fn slowest(&self) -> Option<usize> {
        self.slowest
    }

    /// Advance one base tick; returns the indices of tiers now due.
    pub fn process_tick(&mut self) -> Vec<usize> {
        let mut due = Vec::new();
        for (i, clock) in self.clocks.iter_mut().enumerate() {
            clock.ticks_elapsed = clock.ticks_elapsed.saturating_add(1);
            if clock.ticks_elapsed >= clock.tick_target {
                clock.ticks_elapsed = 0;
                due.push(i);
            }
        }
        due
    }
}
