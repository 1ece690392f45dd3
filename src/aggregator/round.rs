//! The open round's per-host reply slots.

use std::time::Duration;

use crate::host::HostId;

/// Result of one host for one closed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success(Duration),
    Failure,
}

impl Outcome {
    pub fn rtt(&self) -> Option<Duration> {
        match self {
            Self::Success(rtt) => Some(*rtt),
            Self::Failure => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }
}

/// Whether a recorded reply filled an empty slot or replaced an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Filled,
    Replaced,
}

/// Reply slots of the round currently open, indexed by [`HostId`].
///
/// Sized once for the registry and reused for every round.
#[derive(Debug, Clone)]
pub struct RoundTable {
    round: u64,
    slots: Vec<Option<Duration>>,
}

impl RoundTable {
    /// Open round 0 for `host_count` hosts.
    pub fn new(host_count: usize) -> Self {
        Self {
            round: 0,
            slots: vec![None; host_count],
        }
    }

    /// Number of the open round.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Record a reply; the last reply for a host wins.
    ///
    /// Returns `None` when `host` is outside the table.
    pub fn record(&mut self, host: HostId, rtt: Duration) -> Option<Slot> {
        let slot = self.slots.get_mut(host.index())?;
        let previous = slot.replace(rtt);
        Some(if previous.is_some() {
            Slot::Replaced
        } else {
            Slot::Filled
        })
    }

    /// Emit every host's outcome in id order and clear all slots.
    ///
    /// The round number is left unchanged; call [`RoundTable::open`] next.
    pub fn close(&mut self) -> Vec<(HostId, Outcome)> {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(i, slot)| {
                let outcome = match slot.take() {
                    Some(rtt) => Outcome::Success(rtt),
                    None => Outcome::Failure,
                };
                (HostId(i as u32), outcome)
            })
            .collect()
    }

    /// Start collecting replies for `round`.
    pub fn open(&mut self, round: u64) {
        self.round = round;
    }
}
