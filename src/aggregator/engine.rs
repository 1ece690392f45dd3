//! The aggregator task: one loop that owns the round table and statistics.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{Outcome, RoundTable, Slot};
use crate::dispatcher::{PersistAck, PersistenceDispatcher};
use crate::host::{HostId, HostRegistry};
use crate::probe::{Boundary, ProbeStreams, ProberError, Reply};
use crate::stats::{HostSnapshot, StatsTracker};
use crate::storage::SampleRecord;

/// Replies for a future round kept until that round opens, per host.
const EARLY_REPLIES_PER_HOST: usize = 4;

/// Skipped round boundaries closed one by one; a larger gap is jumped.
const MAX_SKIPPED_ROUNDS: u64 = 1024;

/// A closed round, handed to persistence by value.
#[derive(Debug, Clone)]
pub struct RoundRecord {
    pub round: u64,
    pub closed_at: DateTime<Utc>,
    /// One sample per host, in id order.
    pub samples: Vec<SampleRecord>,
    /// Lifetime statistics after this round was applied.
    pub stats: Vec<HostSnapshot>,
}

/// What happened to a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    Recorded,
    /// Replaced an earlier reply from the same host in the same round.
    Overwritten,
    /// Belongs to a round that has already closed.
    Late,
    /// Source address is not registered.
    Unknown,
    /// Belongs to a round not yet open; applied when it opens.
    Deferred,
}

/// Running totals for the aggregator loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorCounters {
    pub rounds_closed: u64,
    pub replies_recorded: u64,
    pub replies_overwritten: u64,
    pub late_replies: u64,
    pub unknown_replies: u64,
    pub dispatch_drops: u64,
    pub persist_acks: u64,
    pub persist_failures: u64,
}

/// Why the aggregator loop stopped.
#[derive(Debug)]
pub enum ExitReason {
    /// Shutdown was requested.
    Signal,
    /// The prober ended on its own without error.
    ProberFinished,
    /// The prober hit a fatal error.
    ProberFailed(ProberError),
    /// Both probe channels closed without a finish signal.
    ChannelsClosed,
}

impl ExitReason {
    /// Process exit status for this reason.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Signal | Self::ProberFinished => 0,
            Self::ProberFailed(_) | Self::ChannelsClosed => 1,
        }
    }
}

/// Collects replies into rounds and closes them in order.
///
/// Owns the round table and the statistics; nothing else mutates either.
pub struct ResultAggregator {
    registry: Arc<HostRegistry>,
    table: RoundTable,
    stats: StatsTracker,
    counters: AggregatorCounters,
    early: VecDeque<(HostId, Reply)>,
    streams: ProbeStreams,
    replies_open: bool,
    dispatcher: Option<PersistenceDispatcher>,
    acks: Option<mpsc::Receiver<PersistAck>>,
}

impl ResultAggregator {
    pub fn new(registry: Arc<HostRegistry>, streams: ProbeStreams) -> Self {
        let host_count = registry.len();
        Self {
            table: RoundTable::new(host_count),
            stats: StatsTracker::new(host_count),
            registry,
            counters: AggregatorCounters::default(),
            early: VecDeque::new(),
            streams,
            replies_open: true,
            dispatcher: None,
            acks: None,
        }
    }

    /// Hand closed rounds to `dispatcher` and consume its acknowledgements.
    pub fn with_dispatcher(
        mut self,
        dispatcher: PersistenceDispatcher,
        acks: mpsc::Receiver<PersistAck>,
    ) -> Self {
        self.dispatcher = Some(dispatcher);
        self.acks = Some(acks);
        self
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    pub fn counters(&self) -> AggregatorCounters {
        self.counters
    }

    /// Number of the round currently collecting replies.
    pub fn open_round(&self) -> u64 {
        self.table.round()
    }

    /// Run until cancelled or the prober stops.
    ///
    /// Branch priority, highest first: cancellation, round boundaries,
    /// replies, persistence acknowledgements.
    pub async fn run(&mut self, cancel: &CancellationToken) -> ExitReason {
        tracing::info!(hosts = self.registry.len(), "Aggregator started");

        let reason = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break ExitReason::Signal,

                boundary = self.streams.boundaries.recv() => match boundary {
                    Some(Boundary::Idle { round }) => {
                        self.drain_replies();
                        self.handle_idle(round);
                    }
                    Some(Boundary::Finished(Ok(()))) => {
                        self.drain_replies();
                        break ExitReason::ProberFinished;
                    }
                    Some(Boundary::Finished(Err(e))) => break ExitReason::ProberFailed(e),
                    None => break ExitReason::ChannelsClosed,
                },

                reply = self.streams.replies.recv(), if self.replies_open => match reply {
                    Some(reply) => {
                        self.handle_reply(reply);
                    }
                    None => self.replies_open = false,
                },

                ack = next_ack(&mut self.acks) => match ack {
                    Some(ack) => self.handle_ack(ack),
                    None => {
                        tracing::error!("Persistence worker stopped; acknowledgements closed");
                        self.acks = None;
                    }
                },
            }
        };

        tracing::info!(
            reason = ?reason,
            rounds = self.counters.rounds_closed,
            "Aggregator stopped"
        );
        reason
    }

    /// Attribute one reply to the open round.
    pub fn handle_reply(&mut self, reply: Reply) -> ReplyDisposition {
        let Some(host) = self.registry.lookup(&reply.addr) else {
            self.counters.unknown_replies += 1;
            tracing::debug!(address = %reply.addr, "Reply from unregistered address");
            return ReplyDisposition::Unknown;
        };

        let open = self.table.round();
        if reply.round < open {
            self.counters.late_replies += 1;
            tracing::debug!(host = %host, round = reply.round, open, "Late reply discarded");
            return ReplyDisposition::Late;
        }
        if reply.round > open {
            let held = self.early.iter().filter(|(h, _)| *h == host).count();
            if held >= EARLY_REPLIES_PER_HOST {
                self.counters.late_replies += 1;
                tracing::warn!(host = %host, round = reply.round, open, "Early reply discarded");
                return ReplyDisposition::Late;
            }
            self.early.push_back((host, reply));
            return ReplyDisposition::Deferred;
        }

        match self.table.record(host, reply.rtt) {
            Some(Slot::Filled) => {
                self.counters.replies_recorded += 1;
                ReplyDisposition::Recorded
            }
            Some(Slot::Replaced) => {
                self.counters.replies_recorded += 1;
                self.counters.replies_overwritten += 1;
                ReplyDisposition::Overwritten
            }
            None => {
                self.counters.unknown_replies += 1;
                ReplyDisposition::Unknown
            }
        }
    }

    /// Close the open round if `round` is it, then open the next one.
    ///
    /// A boundary ahead of the open round means boundaries were skipped: each
    /// missed round is closed in turn under its own number, with the replies
    /// that belong to it. Returns `false` for a stale boundary, which changes
    /// nothing.
    pub fn handle_idle(&mut self, round: u64) -> bool {
        let open = self.table.round();
        if round < open {
            tracing::debug!(round, open, "Stale round boundary ignored");
            return false;
        }
        if round > open {
            tracing::warn!(round, open, "Round boundaries skipped; closing missed rounds");
            if round - open > MAX_SKIPPED_ROUNDS {
                // Too far ahead to close one by one; the gap is not counted
                self.close_open_round(round);
            }
        }

        while self.table.round() < round {
            let next = self.table.round() + 1;
            self.close_open_round(next);
        }
        self.close_open_round(round.saturating_add(1));
        true
    }

    /// Close the open round under its own number, then open `next` and apply
    /// replies held for it.
    fn close_open_round(&mut self, next: u64) {
        let round = self.table.round();
        let closed_at = Utc::now();
        let outcomes = self.table.close();
        let mut samples = Vec::with_capacity(outcomes.len());
        for (host, outcome) in &outcomes {
            self.stats.apply(*host, outcome);
            samples.push(match outcome {
                Outcome::Success(rtt) => SampleRecord::success(*host, closed_at, *rtt),
                Outcome::Failure => SampleRecord::failure(*host, closed_at),
            });
        }
        self.counters.rounds_closed += 1;
        tracing::debug!(round, "Round closed");

        if let Some(dispatcher) = &self.dispatcher {
            let record = RoundRecord {
                round,
                closed_at,
                samples,
                stats: self.stats.snapshot(&self.registry),
            };
            if dispatcher.try_record(record).is_err() {
                self.counters.dispatch_drops += 1;
            }
        }

        self.table.open(next);
        self.replay_early();
    }

    /// Account for one persistence acknowledgement.
    pub fn handle_ack(&mut self, ack: PersistAck) {
        self.counters.persist_acks += 1;
        match &ack.result {
            Ok(count) => tracing::debug!(job = %ack.job, count, "Persistence job done"),
            Err(e) => {
                self.counters.persist_failures += 1;
                tracing::warn!(job = %ack.job, error = %e, "Persistence job failed");
            }
        }
    }

    /// Process everything already queued on the probe channels without
    /// waiting, closing any round whose boundary arrived.
    ///
    /// Used after the prober has stopped so complete rounds are not lost.
    /// Returns the prober's finish result if it was queued.
    pub fn drain_pending(&mut self) -> Option<Result<(), ProberError>> {
        let mut finished = None;
        loop {
            self.drain_replies();
            match self.streams.boundaries.try_recv() {
                Ok(Boundary::Idle { round }) => {
                    self.handle_idle(round);
                }
                Ok(Boundary::Finished(result)) => finished = Some(result),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        finished
    }

    /// Detach the dispatcher and its acknowledgement stream for shutdown.
    pub fn take_dispatcher(
        &mut self,
    ) -> Option<(PersistenceDispatcher, Option<mpsc::Receiver<PersistAck>>)> {
        let dispatcher = self.dispatcher.take()?;
        Some((dispatcher, self.acks.take()))
    }

    fn drain_replies(&mut self) {
        while let Ok(reply) = self.streams.replies.try_recv() {
            self.handle_reply(reply);
        }
    }

    fn replay_early(&mut self) {
        for _ in 0..self.early.len() {
            if let Some((_, reply)) = self.early.pop_front() {
                self.handle_reply(reply);
            }
        }
    }
}

async fn next_ack(acks: &mut Option<mpsc::Receiver<PersistAck>>) -> Option<PersistAck> {
    match acks {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DuplicatePolicy, HostId, HostSpec};
    use crate::probe::probe_channels;
    use std::net::IpAddr;
    use std::time::Duration;

    const A: &str = "10.0.0.1";
    const B: &str = "10.0.0.2";

    fn registry() -> Arc<HostRegistry> {
        let resolved = [("a", A), ("b", B)]
            .into_iter()
            .map(|(name, addr)| {
                let spec: HostSpec = format!("{name}:{addr}").parse().unwrap();
                (spec, addr.parse::<IpAddr>().unwrap())
            })
            .collect();
        Arc::new(HostRegistry::from_resolved(resolved, DuplicatePolicy::Reject).unwrap())
    }

    fn aggregator() -> ResultAggregator {
        let (_sink, streams) = probe_channels(16);
        ResultAggregator::new(registry(), streams)
    }

    fn assert_close(actual: Duration, ms: u64) {
        let expected = Duration::from_millis(ms).as_secs_f64();
        assert!(
            (actual.as_secs_f64() - expected).abs() < 1e-9,
            "{actual:?} != {ms}ms"
        );
    }

    fn reply(round: u64, addr: &str, ms: u64) -> Reply {
        Reply {
            round,
            addr: addr.parse().unwrap(),
            rtt: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_two_hosts_four_rounds() {
        let mut agg = aggregator();

        // A answers every round; B only in round 2.
        for (round, a_ms) in [10, 20, 10, 20].into_iter().enumerate() {
            let round = round as u64;
            agg.handle_reply(reply(round, A, a_ms));
            if round == 2 {
                agg.handle_reply(reply(round, B, 5));
            }
            assert!(agg.handle_idle(round));
        }

        let a = agg.stats().get(HostId(0)).unwrap();
        assert_eq!(a.count(), 4);
        assert_eq!(a.fails(), 0);
        assert_close(a.avg(), 15);

        let b = agg.stats().get(HostId(1)).unwrap();
        assert_eq!(b.count(), 1);
        assert_eq!(b.fails(), 3);
        assert_close(b.avg(), 5);

        assert_eq!(agg.counters().rounds_closed, 4);
        assert_eq!(agg.open_round(), 4);
    }

    #[test]
    fn test_late_reply_discarded() {
        let mut agg = aggregator();
        agg.handle_idle(0);

        assert_eq!(
            agg.handle_reply(reply(0, A, 30)),
            ReplyDisposition::Late
        );
        agg.handle_idle(1);

        let a = agg.stats().get(HostId(0)).unwrap();
        assert_eq!(a.count(), 0);
        assert_eq!(a.fails(), 2);
        assert_eq!(agg.counters().late_replies, 1);
    }

    #[test]
    fn test_overwrite_and_unknown() {
        let mut agg = aggregator();
        assert_eq!(agg.handle_reply(reply(0, A, 10)), ReplyDisposition::Recorded);
        assert_eq!(
            agg.handle_reply(reply(0, A, 40)),
            ReplyDisposition::Overwritten
        );
        assert_eq!(
            agg.handle_reply(reply(0, "192.168.9.9", 1)),
            ReplyDisposition::Unknown
        );
        agg.handle_idle(0);

        let a = agg.stats().get(HostId(0)).unwrap();
        assert_close(a.avg(), 40);
        let counters = agg.counters();
        assert_eq!(counters.replies_overwritten, 1);
        assert_eq!(counters.unknown_replies, 1);
    }

    #[test]
    fn test_stale_idle_ignored() {
        let mut agg = aggregator();
        assert!(agg.handle_idle(0));
        assert!(!agg.handle_idle(0));
        assert_eq!(agg.counters().rounds_closed, 1);
        assert_eq!(agg.stats().get(HostId(0)).unwrap().fails(), 1);
    }

    #[test]
    fn test_early_reply_applied_when_round_opens() {
        let mut agg = aggregator();
        assert_eq!(agg.handle_reply(reply(1, B, 7)), ReplyDisposition::Deferred);
        agg.handle_idle(0);
        agg.handle_idle(1);

        let b = agg.stats().get(HostId(1)).unwrap();
        assert_eq!(b.count(), 1);
        assert_eq!(b.fails(), 1);
        assert_close(b.avg(), 7);
    }

    #[test]
    fn test_skipped_boundary_closes_each_round() {
        let mut agg = aggregator();
        agg.handle_reply(reply(0, A, 10));
        assert_eq!(agg.handle_reply(reply(1, A, 99)), ReplyDisposition::Deferred);

        // Boundary for round 0 never arrived
        assert!(agg.handle_idle(1));

        let a = agg.stats().get(HostId(0)).unwrap();
        assert_eq!(a.count(), 2);
        assert_eq!(a.fails(), 0);
        assert_eq!(a.min(), Some(Duration::from_millis(10)));
        assert_eq!(a.max(), Some(Duration::from_millis(99)));
        assert_eq!(agg.stats().get(HostId(1)).unwrap().fails(), 2);

        let counters = agg.counters();
        assert_eq!(counters.rounds_closed, 2);
        assert_eq!(counters.late_replies, 0);
        assert_eq!(agg.open_round(), 2);
    }

    #[test]
    fn test_large_round_gap_jumped() {
        let mut agg = aggregator();
        agg.handle_reply(reply(0, A, 10));
        agg.handle_reply(reply(5000, B, 7));

        assert!(agg.handle_idle(5000));

        // Round 0 and round 5000 only
        assert_eq!(agg.counters().rounds_closed, 2);
        assert_eq!(agg.open_round(), 5001);
        let b = agg.stats().get(HostId(1)).unwrap();
        assert_eq!(b.count(), 1);
        assert_eq!(b.fails(), 1);
    }

    #[test]
    fn test_early_replies_limited_per_host() {
        let mut agg = aggregator();
        for round in 1..=EARLY_REPLIES_PER_HOST as u64 {
            assert_eq!(
                agg.handle_reply(reply(round, A, 1)),
                ReplyDisposition::Deferred
            );
        }
        assert_eq!(agg.handle_reply(reply(9, A, 1)), ReplyDisposition::Late);

        // A filling its share leaves B's untouched
        assert_eq!(agg.handle_reply(reply(1, B, 2)), ReplyDisposition::Deferred);
        assert_eq!(agg.counters().late_replies, 1);
    }

    #[tokio::test]
    async fn test_run_closes_rounds_in_order() {
        let (sink, streams) = probe_channels(16);
        let mut agg = ResultAggregator::new(registry(), streams);
        let cancel = CancellationToken::new();

        let a: IpAddr = A.parse().unwrap();
        sink.on_reply(0, a, Duration::from_millis(10)).await.unwrap();
        sink.on_idle(0).await.unwrap();
        sink.on_reply(1, a, Duration::from_millis(30)).await.unwrap();
        sink.on_idle(1).await.unwrap();
        drop(sink);

        let reason = agg.run(&cancel).await;
        assert!(matches!(reason, ExitReason::ChannelsClosed));

        let a = agg.stats().get(HostId(0)).unwrap();
        assert_eq!(a.count(), 2);
        assert_close(a.avg(), 20);
        assert_eq!(agg.stats().get(HostId(1)).unwrap().fails(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_sink, streams) = probe_channels(16);
        let mut agg = ResultAggregator::new(registry(), streams);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let reason = agg.run(&cancel).await;
        assert!(matches!(reason, ExitReason::Signal));
        assert_eq!(reason.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_drain_pending_closes_queued_rounds() {
        let (sink, streams) = probe_channels(16);
        let mut agg = ResultAggregator::new(registry(), streams);

        let b: IpAddr = B.parse().unwrap();
        sink.on_reply(0, b, Duration::from_millis(3)).await.unwrap();
        sink.on_idle(0).await.unwrap();
        // Round 1 never completes
        sink.on_reply(1, b, Duration::from_millis(4)).await.unwrap();

        assert!(agg.drain_pending().is_none());
        assert_eq!(agg.counters().rounds_closed, 1);
        assert_eq!(agg.stats().get(HostId(1)).unwrap().count(), 1);
        assert_eq!(agg.open_round(), 1);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitReason::ProberFinished.exit_code(), 0);
        assert_eq!(ExitReason::ProberFailed(ProberError::NoTargets).exit_code(), 1);
        assert_eq!(ExitReason::ChannelsClosed.exit_code(), 1);
    }
}
