//! Persistence dispatch.
//!
//! The aggregator hands each closed round to [`PersistenceDispatcher::try_record`],
//! which never blocks. A worker task buffers samples, writes them on the base
//! tick, exports snapshots per [`CadenceTier`], and reports every job back as a
//! [`PersistAck`].

mod tiers;
mod worker;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::aggregator::RoundRecord;
use crate::config::format_duration;
use crate::snapshot::{ExportError, SnapshotExporter};
use crate::storage::{StorageAdmin, StorageError, StorageWriter};

pub use tiers::{CadenceTier, TierSchedule};
pub use worker::TELEMETRY_TARGET;

/// A persistence job, as reported in acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum PersistJob {
    Flush,
    Snapshot { window: Duration },
    Cleanup,
}

impl fmt::Display for PersistJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot { window } => write!(f, "snapshot({})", format_duration(*window)),
            other => f.write_str(other.as_ref()),
        }
    }
}

/// Errors from a persistence job. Logged and acknowledged, never fatal.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("export error: {0}")]
    Export(#[from] ExportError),

    /// The writer refused some samples; the rest were written.
    #[error("{dropped} samples dropped before reaching storage ({written} written)")]
    SamplesDropped { dropped: usize, written: usize },

    /// The job's task panicked.
    #[error("job task failed: {0}")]
    Join(String),
}

/// Outcome of one persistence job.
///
/// `result` carries the job's count: samples written, documents exported, or
/// samples deleted.
#[derive(Debug)]
pub struct PersistAck {
    pub job: PersistJob,
    pub result: Result<usize, PersistError>,
}

/// Why a round record was not accepted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("persistence queue full")]
    Full,
    #[error("persistence worker stopped")]
    Closed,
}

/// Non-blocking front of the persistence worker.
pub struct PersistenceDispatcher {
    tx: mpsc::Sender<RoundRecord>,
    task: JoinHandle<bool>,
    dropped: AtomicU64,
}

impl fmt::Debug for PersistenceDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceDispatcher")
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl PersistenceDispatcher {
    /// Start the worker.
    ///
    /// `capacity` bounds both the record queue and the acknowledgement channel.
    pub fn spawn(
        tiers: Vec<CadenceTier>,
        writer: StorageWriter,
        admin: StorageAdmin,
        exporter: Arc<dyn SnapshotExporter>,
        capacity: usize,
        retention: Duration,
    ) -> (Self, mpsc::Receiver<PersistAck>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (ack_tx, ack_rx) = mpsc::channel(capacity);

        let worker = worker::Worker::new(tiers, writer, admin, exporter, retention, ack_tx);
        let task = tokio::spawn(worker.run(rx));

        (
            Self {
                tx,
                task,
                dropped: AtomicU64::new(0),
            },
            ack_rx,
        )
    }

    /// Queue a closed round without waiting.
    pub fn try_record(&self, record: RoundRecord) -> Result<(), DispatchError> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(round = record.round, "Persistence queue full, dropping round");
                Err(DispatchError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(round = record.round, "Persistence worker gone, dropping round");
                Err(DispatchError::Closed)
            }
        }
    }

    /// Rounds dropped because the queue was full or the worker had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue, let the worker write what it holds, and wait.
    ///
    /// Returns whether the final write was acknowledged within `timeout`.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let Self { tx, task, .. } = self;
        drop(tx);

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(flushed)) => flushed,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Persistence worker panicked");
                false
            }
            Err(_) => {
                tracing::warn!(timeout = ?timeout, "Persistence worker did not finish in time");
                false
            }
        }
    }
}
