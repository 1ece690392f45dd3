//! Prober contract: the trait, its callback sink, and the task handle.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Errors that end a prober run.
///
/// Any of these is fatal for the whole process. A host that does not answer
/// is not an error; it is simply absent from the round.
#[derive(Debug, Error)]
pub enum ProberError {
    /// Socket creation or permission failure.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// Nothing to probe.
    #[error("no targets to probe")]
    NoTargets,

    /// Internal error (e.g., task join failure).
    #[error("internal error: {0}")]
    Internal(String),
}

/// The aggregator has gone away; the prober should stop.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("probe sink closed")]
pub struct SinkClosed;

/// One reply observed during a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Round the probe was sent in.
    pub round: u64,
    pub addr: IpAddr,
    pub rtt: Duration,
}

/// Round-boundary and lifecycle signals, delivered ahead of replies.
#[derive(Debug)]
pub enum Boundary {
    /// All replies for `round` have been handed to the sink.
    Idle { round: u64 },
    /// The prober stopped: `Ok` for a normal end, `Err` for a fatal one.
    Finished(Result<(), ProberError>),
}

/// Callback side handed to a [`Prober`].
#[derive(Debug, Clone)]
pub struct ProbeSink {
    replies: mpsc::Sender<Reply>,
    boundaries: mpsc::Sender<Boundary>,
}

/// Receiving side consumed by the aggregator.
#[derive(Debug)]
pub struct ProbeStreams {
    pub replies: mpsc::Receiver<Reply>,
    pub boundaries: mpsc::Receiver<Boundary>,
}

/// Create a connected sink/streams pair.
pub fn probe_channels(capacity: usize) -> (ProbeSink, ProbeStreams) {
    let (reply_tx, reply_rx) = mpsc::channel(capacity.max(1));
    let (boundary_tx, boundary_rx) = mpsc::channel(capacity.max(1));
    (
        ProbeSink {
            replies: reply_tx,
            boundaries: boundary_tx,
        },
        ProbeStreams {
            replies: reply_rx,
            boundaries: boundary_rx,
        },
    )
}

impl ProbeSink {
    /// Report a reply from `addr` for `round`.
    pub async fn on_reply(&self, round: u64, addr: IpAddr, rtt: Duration) -> Result<(), SinkClosed> {
        self.replies
            .send(Reply { round, addr, rtt })
            .await
            .map_err(|_| SinkClosed)
    }

    /// Report that `round` is complete.
    ///
    /// Every reply for the round must already have been passed to
    /// [`ProbeSink::on_reply`].
    pub async fn on_idle(&self, round: u64) -> Result<(), SinkClosed> {
        self.boundaries
            .send(Boundary::Idle { round })
            .await
            .map_err(|_| SinkClosed)
    }

    async fn finished(&self, result: Result<(), ProberError>) {
        if self.boundaries.send(Boundary::Finished(result)).await.is_err() {
            tracing::debug!("Aggregator gone before prober finished");
        }
    }
}

/// Source of round-structured reachability probes.
///
/// `run` drives rounds until `cancel` fires or a fatal error occurs. Within a
/// round the prober never retries; a host that misses the round bound is just
/// not reported.
#[async_trait::async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Probe `targets` round after round until cancelled.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: stopped on request, or the sink closed
    /// - `Err(ProberError)`: probing cannot continue
    async fn run(
        &self,
        targets: Vec<IpAddr>,
        sink: ProbeSink,
        cancel: CancellationToken,
    ) -> Result<(), ProberError>;
}

/// A prober running on its own task.
#[derive(Debug)]
pub struct ProberHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProberHandle {
    /// Spawn `prober` on a new task.
    ///
    /// When `run` returns, its result is delivered as [`Boundary::Finished`].
    pub fn spawn<P: Prober>(prober: P, targets: Vec<IpAddr>, sink: ProbeSink) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let name = prober.name().to_string();
            tracing::info!(prober = %name, targets = targets.len(), "Prober started");

            let result = if targets.is_empty() {
                Err(ProberError::NoTargets)
            } else {
                prober.run(targets, sink.clone(), token).await
            };

            match &result {
                Ok(()) => tracing::info!(prober = %name, "Prober stopped"),
                Err(e) => tracing::error!(prober = %name, error = %e, "Prober failed"),
            }
            sink.finished(result).await;
        });

        Self { cancel, task }
    }

    /// Ask the prober to stop after its current step.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the prober task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the prober and wait up to `timeout` for it to exit.
    ///
    /// Returns `false` if the task had to be abandoned.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.stop();
        let abort = self.task.abort_handle();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Prober task ended abnormally");
                true
            }
            Err(_) => {
                tracing::warn!(timeout = ?timeout, "Prober did not stop in time");
                abort.abort();
                false
            }
        }
    }
}
