//! Writer actor with dedicated connection and MPSC channel.
//!
//! Single-writer pattern: one thread owns the write connection and processes
//! commands in order. Samples are buffered and appended in batches, flushed
//! when the buffer fills, when it has waited too long, or on an explicit
//! `Flush`. Acknowledged commands answer over a oneshot so async callers can
//! await the write without blocking a runtime worker.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use duckdb::Connection;
use tokio::sync::oneshot;

use crate::storage::StorageError;
use crate::storage::schema::init_schema;
use crate::storage::types::{HostRecord, SampleRecord};

/// Maximum samples in buffer before flush.
const BATCH_SIZE_THRESHOLD: usize = 500;

/// Maximum time before buffer flush.
const BATCH_TIME_THRESHOLD: Duration = Duration::from_secs(1);

/// Reply slot for commands whose outcome the caller awaits.
pub type Ack<T> = oneshot::Sender<Result<T, StorageError>>;

/// Commands sent to the writer actor.
#[derive(Debug)]
pub enum Command {
    /// Insert or refresh a host row (immediate).
    UpsertHost(HostRecord),
    /// Buffer a sample for batch insert.
    InsertSample(SampleRecord),
    /// Write every buffered sample; acks with the number written since the
    /// previous `Flush`, including automatic flushes in between.
    Flush { ack: Option<Ack<usize>> },
    /// Delete samples older than `retention`; acks with the number deleted.
    Cleanup {
        retention: Duration,
        ack: Option<Ack<usize>>,
    },
    /// Force WAL checkpoint.
    Checkpoint,
    /// Graceful shutdown.
    Shutdown,
}

/// Buffer for batch inserts with time-based and size-based flushing.
struct BatchBuffer<T> {
    items: Vec<T>,
    last_flush: Instant,
}

impl<T> BatchBuffer<T> {
    fn new() -> Self {
        Self {
            items: Vec::with_capacity(BATCH_SIZE_THRESHOLD),
            last_flush: Instant::now(),
        }
    }

    fn push(&mut self, item: T) {
        // Reset flush timer on first item to avoid treating long-idle buffers as overdue
        if self.items.is_empty() {
            self.last_flush = Instant::now();
        }
        self.items.push(item);
    }

    fn should_flush(&self) -> bool {
        self.items.len() >= BATCH_SIZE_THRESHOLD
            || (!self.items.is_empty() && self.last_flush.elapsed() >= BATCH_TIME_THRESHOLD)
    }

    fn take(&mut self) -> Vec<T> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.items)
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Database writer actor.
///
/// Only samples are buffered; host rows are written immediately since there
/// is one per configured host.
pub struct DbActor {
    conn: Connection,
    rx: Receiver<Command>,
    samples: BatchBuffer<SampleRecord>,
    /// Written or lost since the last acknowledged `Flush`.
    unacked: FlushTally,
    last_checkpoint: Instant,
    checkpoint_interval: Duration,
}

/// Outcome of the batches written between two `Flush` commands.
#[derive(Debug, Default)]
struct FlushTally {
    written: usize,
    lost: usize,
    last_error: Option<String>,
}

impl FlushTally {
    fn into_result(self) -> Result<usize, StorageError> {
        match self.last_error {
            Some(reason) => Err(StorageError::BatchLost {
                lost: self.lost,
                written: self.written,
                reason,
            }),
            None => Ok(self.written),
        }
    }
}

impl DbActor {
    /// Spawn the writer actor thread.
    ///
    /// Returns the thread handle, the command sender, and a connection cloned
    /// from the writer's so readers share its database instance.
    pub fn spawn(
        db_path: &Path,
        channel_capacity: usize,
        checkpoint_interval: Duration,
    ) -> Result<(JoinHandle<()>, SyncSender<Command>, Connection), StorageError> {
        let (tx, rx) = mpsc::sync_channel(channel_capacity);
        let conn = Connection::open(db_path)?;
        init_schema(&conn)?;

        // Clones share the underlying database, so readers see writes before checkpoint.
        let reader_conn = conn.try_clone()?;

        let mut actor = DbActor {
            conn,
            rx,
            samples: BatchBuffer::new(),
            unacked: FlushTally::default(),
            last_checkpoint: Instant::now(),
            checkpoint_interval,
        };
        let handle = thread::Builder::new()
            .name("pingtest-db".to_string())
            .spawn(move || actor.run())
            .map_err(|e| StorageError::Internal(format!("failed to spawn writer thread: {e}")))?;

        Ok((handle, tx, reader_conn))
    }

    fn run(&mut self) {
        tracing::info!("DbActor started");

        loop {
            let now = Instant::now();
            let flush_deadline = if !self.samples.is_empty() {
                self.samples.last_flush + BATCH_TIME_THRESHOLD
            } else {
                now + Duration::from_secs(60)
            };
            let checkpoint_deadline = self.last_checkpoint + self.checkpoint_interval;
            let timeout = flush_deadline
                .min(checkpoint_deadline)
                .saturating_duration_since(now);

            match self.rx.recv_timeout(timeout) {
                Ok(cmd) => {
                    if self.handle_command(cmd) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Channel disconnected, shutting down");
                    self.flush_logged();
                    break;
                }
            }

            if self.samples.should_flush() {
                self.flush_logged();
            }

            if self.last_checkpoint.elapsed() >= self.checkpoint_interval {
                self.flush_logged();
                if let Err(e) = self.checkpoint() {
                    tracing::error!(error = %e, "Periodic checkpoint failed");
                }
                self.last_checkpoint = Instant::now();
            }
        }

        tracing::info!("DbActor stopped");
    }

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::UpsertHost(host) => {
                if let Err(e) = self.upsert_host(&host) {
                    tracing::error!(error = %e, host = %host.name, "Host upsert failed");
                }
            }
            Command::InsertSample(sample) => {
                self.samples.push(sample);
            }
            Command::Flush { ack } => {
                self.flush_logged();
                let result = std::mem::take(&mut self.unacked).into_result();
                reply(ack, result, "flush");
            }
            Command::Cleanup { retention, ack } => {
                let result = self.cleanup_samples(retention);
                reply(ack, result, "cleanup");
            }
            Command::Checkpoint => {
                self.flush_logged();
                if let Err(e) = self.checkpoint() {
                    tracing::error!(error = %e, "Checkpoint failed");
                }
            }
            Command::Shutdown => {
                tracing::info!("DbActor shutting down");
                self.flush_logged();
                let _ = self.checkpoint();
                return true;
            }
        }
        false
    }

    /// Write buffered samples. A failed batch is dropped, not retried, and
    /// reported by the next `Flush` acknowledgement.
    fn flush(&mut self) -> Result<usize, StorageError> {
        if self.samples.is_empty() {
            return Ok(0);
        }
        let samples = self.samples.take();
        match self.insert_samples_batch(&samples) {
            Ok(()) => {
                self.unacked.written += samples.len();
                Ok(samples.len())
            }
            Err(e) => {
                self.unacked.lost += samples.len();
                self.unacked.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn flush_logged(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(error = %e, "Samples batch insert failed");
        }
    }

    fn upsert_host(&self, h: &HostRecord) -> Result<(), StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO hosts (host_id, name, address, aliases, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (host_id) DO UPDATE SET
                name = EXCLUDED.name, address = EXCLUDED.address, aliases = EXCLUDED.aliases",
        )?;

        let aliases_json = serde_json::to_string(&h.aliases)?;
        stmt.execute(duckdb::params![
            h.host_id.0,
            &h.name,
            &h.address,
            aliases_json,
            h.created_at.timestamp_micros(),
        ])?;

        Ok(())
    }

    /// Batch insert samples using DuckDB Appender.
    fn insert_samples_batch(&mut self, samples: &[SampleRecord]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        {
            let mut appender = tx.appender("samples")?;
            for s in samples {
                appender.append_row(duckdb::params![
                    s.ts.timestamp_micros(),
                    s.host_id.0,
                    s.rtt_micros(),
                    s.failed,
                ])?;
            }
            appender.flush()?;
        }
        tx.commit()?;

        tracing::debug!(count = samples.len(), "Samples batch inserted");
        Ok(())
    }

    fn cleanup_samples(&mut self, retention: Duration) -> Result<usize, StorageError> {
        // Buffered samples may already be past the cutoff; write them first.
        self.flush_logged();
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| StorageError::InvalidData(format!("retention out of range: {e}")))?;
        let cutoff = Utc::now() - retention;
        let deleted = self
            .conn
            .execute("DELETE FROM samples WHERE ts < ?", [cutoff.timestamp_micros()])?;
        tracing::info!(deleted, "Samples cleaned up");
        Ok(deleted)
    }

    fn checkpoint(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("CHECKPOINT;")?;
        tracing::debug!("WAL checkpoint completed");
        Ok(())
    }
}

fn reply<T>(ack: Option<Ack<T>>, result: Result<T, StorageError>, op: &'static str) {
    match ack {
        Some(ack) => {
            // Caller may have given up waiting
            let _ = ack.send(result);
        }
        None => {
            if let Err(e) = result {
                tracing::error!(error = %e, op, "Storage command failed");
            }
        }
    }
}
