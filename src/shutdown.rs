//! Ordered shutdown.
//!
//! Signals cancel one token. Afterwards [`ShutdownController::complete`] stops
//! the prober, closes rounds that were already complete, waits for the last
//! persistence write, and logs the per-host summary.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{AggregatorCounters, ExitReason, ResultAggregator};
use crate::host::HostRegistry;
use crate::probe::ProberHandle;
use crate::stats::{HostSnapshot, StatsTracker};

/// What happened during shutdown.
#[derive(Debug)]
pub struct ShutdownReport {
    pub reason: ExitReason,
    /// Whether the prober stopped within the drain timeout.
    pub prober_stopped: bool,
    /// Whether the final persistence write was acknowledged.
    pub persisted: bool,
    pub counters: AggregatorCounters,
    pub hosts: Vec<HostSnapshot>,
    /// The summary lines as logged.
    pub summary: Vec<String>,
}

impl ShutdownReport {
    pub fn exit_code(&self) -> i32 {
        self.reason.exit_code()
    }
}

/// Owns the process-wide cancellation token.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    token: CancellationToken,
    drain_timeout: Duration,
}

impl ShutdownController {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// Token cancelled when shutdown is requested.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Request shutdown programmatically.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Cancel the token on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = token.cancelled() => return,
                _ = ctrl_c => tracing::info!("Received Ctrl+C signal"),
                _ = terminate => tracing::info!("Received terminate signal"),
            }
            token.cancel();
        })
    }

    /// Run the shutdown sequence after the aggregator loop returned `reason`.
    ///
    /// Order: stop the prober, close rounds already queued, final persistence
    /// flush, drain acknowledgements, log the summary.
    pub async fn complete(
        &self,
        aggregator: &mut ResultAggregator,
        prober: ProberHandle,
        reason: ExitReason,
    ) -> ShutdownReport {
        self.token.cancel();
        tracing::info!(reason = ?reason, "Shutting down");

        let prober_stopped = prober.shutdown(self.drain_timeout).await;

        let mut reason = reason;
        if let Some(Err(e)) = aggregator.drain_pending() {
            // A fatal error queued behind the cancel still decides the exit code
            if !matches!(reason, ExitReason::ProberFailed(_)) {
                reason = ExitReason::ProberFailed(e);
            }
        }

        let persisted = match aggregator.take_dispatcher() {
            Some((dispatcher, acks)) => {
                let flushed = dispatcher.shutdown(self.drain_timeout).await;
                if let Some(mut acks) = acks {
                    while let Ok(ack) = acks.try_recv() {
                        aggregator.handle_ack(ack);
                    }
                }
                flushed
            }
            None => true,
        };

        let summary = summary_lines(aggregator.stats(), aggregator.registry());
        for line in &summary {
            tracing::info!("{line}");
        }

        let counters = aggregator.counters();
        tracing::info!(
            rounds = counters.rounds_closed,
            late = counters.late_replies,
            dispatch_drops = counters.dispatch_drops,
            persist_failures = counters.persist_failures,
            persisted,
            "Shutdown complete"
        );

        ShutdownReport {
            reason,
            prober_stopped,
            persisted,
            counters,
            hosts: aggregator.stats().snapshot(aggregator.registry()),
            summary,
        }
    }
}

/// `name : avg_rtt` for every host, then `name : fail_count` for every host.
pub fn summary_lines(stats: &StatsTracker, registry: &HostRegistry) -> Vec<String> {
    let hosts = stats.snapshot(registry);
    let averages = hosts.iter().map(|h| {
        // Round to microseconds; the mean is accumulated in f64
        let micros = (h.avg.as_nanos() + 500) / 1000;
        let avg = Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX));
        format!("{} : {:?}", h.name, avg)
    });
    let fails = hosts.iter().map(|h| format!("{} : {}", h.name, h.fails));
    averages.chain(fails).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Outcome;
    use crate::host::{DuplicatePolicy, HostId, HostSpec};
    use crate::probe::{ProbeSink, Prober, ProberError, Reply, probe_channels};
    use std::net::IpAddr;
    use std::sync::Arc;

    fn registry() -> Arc<HostRegistry> {
        let resolved = vec![
            (
                "a:10.0.0.1".parse::<HostSpec>().unwrap(),
                "10.0.0.1".parse().unwrap(),
            ),
            (
                "b:10.0.0.2".parse::<HostSpec>().unwrap(),
                "10.0.0.2".parse().unwrap(),
            ),
        ];
        Arc::new(HostRegistry::from_resolved(resolved, DuplicatePolicy::Reject).unwrap())
    }

    /// Runs until cancelled without reporting anything.
    struct Silent;

    #[async_trait::async_trait]
    impl Prober for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        async fn run(
            &self,
            _targets: Vec<IpAddr>,
            _sink: ProbeSink,
            cancel: CancellationToken,
        ) -> Result<(), ProberError> {
            cancel.cancelled().await;
            Ok(())
        }
    }

    #[test]
    fn test_summary_lines_each_host_once() {
        let registry = registry();
        let mut stats = StatsTracker::new(registry.len());
        stats.apply(HostId(0), &Outcome::Success(Duration::from_millis(10)));
        stats.apply(HostId(0), &Outcome::Success(Duration::from_millis(20)));
        stats.apply(HostId(1), &Outcome::Failure);

        let lines = summary_lines(&stats, &registry);
        assert_eq!(
            lines,
            vec![
                "a : 15ms".to_string(),
                "b : 0ns".to_string(),
                "a : 0".to_string(),
                "b : 1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_complete_after_signal() {
        let controller = ShutdownController::new(Duration::from_secs(2));
        let registry = registry();
        let (sink, streams) = probe_channels(16);
        let mut aggregator = ResultAggregator::new(Arc::clone(&registry), streams);
        let prober = ProberHandle::spawn(Silent, registry.addresses(), sink);

        let token = controller.token();
        controller.trigger();
        let reason = aggregator.run(&token).await;
        assert!(matches!(reason, ExitReason::Signal));

        let report = controller.complete(&mut aggregator, prober, reason).await;
        assert!(report.prober_stopped);
        assert!(report.persisted);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.summary.len(), 4);
        assert_eq!(report.hosts.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_with_open_round() {
        let controller = ShutdownController::new(Duration::from_secs(2));
        let registry = registry();
        let (sink, streams) = probe_channels(16);
        let mut aggregator = ResultAggregator::new(Arc::clone(&registry), streams);
        let prober = ProberHandle::spawn(Silent, registry.addresses(), sink);

        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        aggregator.handle_reply(Reply {
            round: 0,
            addr: a,
            rtt: Duration::from_millis(15),
        });
        assert!(aggregator.handle_idle(0));
        // Round 1 is still collecting when the signal arrives
        aggregator.handle_reply(Reply {
            round: 1,
            addr: b,
            rtt: Duration::from_millis(5),
        });

        controller.trigger();
        let reason = aggregator.run(&controller.token()).await;
        let report = controller.complete(&mut aggregator, prober, reason).await;

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.counters.rounds_closed, 1);
        assert_eq!(
            report.summary,
            vec![
                "a : 15ms".to_string(),
                "b : 0ns".to_string(),
                "a : 0".to_string(),
                "b : 1".to_string(),
            ]
        );

        let (averages, fails) = report.summary.split_at(2);
        for lines in [averages, fails] {
            let mut names: Vec<&str> = lines
                .iter()
                .filter_map(|line| line.split(" : ").next())
                .collect();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), registry.len());
        }
    }
}
