//! User-facing storage facades.
//!
//! - `StorageWriter`: non-blocking writes via MPSC
//! - `SampleReader`: window summaries and recent samples
//! - `StorageAdmin`: cleanup and maintenance
//!
//! Commands that need confirmation return a [`PendingAck`] the caller can
//! await; the send itself never blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::host::HostId;
use crate::storage::StorageError;
use crate::storage::actor::Command;
use crate::storage::pool::ReadPool;
use crate::storage::types::{HostRecord, SampleRecord, WindowSummary};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 10_000;

/// Acknowledgement of a command still being processed by the writer.
#[derive(Debug)]
#[must_use = "an ack reports whether the write succeeded"]
pub struct PendingAck<T> {
    rx: oneshot::Receiver<Result<T, StorageError>>,
}

impl<T> PendingAck<T> {
    /// Wait for the writer to answer.
    pub async fn wait(self) -> Result<T, StorageError> {
        self.rx.await.map_err(|_| StorageError::AckDropped)?
    }

    /// Blocking variant for use outside the runtime.
    pub fn blocking_wait(self) -> Result<T, StorageError> {
        self.rx.blocking_recv().map_err(|_| StorageError::AckDropped)?
    }
}

fn ack_pair<T>() -> (oneshot::Sender<Result<T, StorageError>>, PendingAck<T>) {
    let (tx, rx) = oneshot::channel();
    (tx, PendingAck { rx })
}

/// Non-blocking storage writer.
///
/// Uses `try_send` for samples; a sample is dropped and counted when the
/// channel is full.
#[derive(Clone)]
pub struct StorageWriter {
    tx: SyncSender<Command>,
    dropped_samples: Arc<AtomicU64>,
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter").finish_non_exhaustive()
    }
}

impl StorageWriter {
    pub(crate) fn new(tx: SyncSender<Command>) -> Self {
        Self {
            tx,
            dropped_samples: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total samples dropped because the channel was full.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }

    /// Insert or refresh a host row. Blocks while the channel is full, so
    /// call it at startup rather than from the round loop.
    pub fn upsert_host(&self, host: HostRecord) -> Result<(), StorageError> {
        self.tx
            .send(Command::UpsertHost(host))
            .map_err(|_| StorageError::ChannelSend)
    }

    /// Queue a sample. Buffered by the writer until the next flush.
    pub fn insert_sample(&self, sample: SampleRecord) -> Result<(), StorageError> {
        if self.tx.try_send(Command::InsertSample(sample)).is_err() {
            tracing::warn!("Channel full, dropping sample");
            self.dropped_samples.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::ChannelSend);
        }
        Ok(())
    }

    /// Flush buffered samples; the ack carries the number written.
    pub fn flush(&self) -> Result<PendingAck<usize>, StorageError> {
        let (ack, pending) = ack_pair();
        self.tx
            .try_send(Command::Flush { ack: Some(ack) })
            .map_err(|_| StorageError::ChannelSend)?;
        Ok(pending)
    }
}

/// Sample reader.
#[derive(Clone)]
pub struct SampleReader {
    pool: Arc<ReadPool>,
}

impl std::fmt::Debug for SampleReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleReader").finish_non_exhaustive()
    }
}

impl SampleReader {
    pub(crate) fn new(pool: Arc<ReadPool>) -> Self {
        Self { pool }
    }

    /// Per-host aggregates over the last `window`, ordered by host id.
    ///
    /// Every known host appears, with zero samples if none fell in the window.
    pub fn window_summary(&self, window: Duration) -> Result<Vec<WindowSummary>, StorageError> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| StorageError::InvalidData(format!("window out of range: {e}")))?;
        let since = Utc::now() - window;

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT h.host_id, h.name, h.address,
                    COUNT(s.host_id),
                    COUNT(s.host_id) FILTER (WHERE s.failed),
                    AVG(s.rtt_us),
                    MIN(s.rtt_us),
                    MAX(s.rtt_us)
             FROM hosts h
             LEFT JOIN samples s ON s.host_id = h.host_id AND s.ts >= ?
             GROUP BY h.host_id, h.name, h.address
             ORDER BY h.host_id",
        )?;
        let rows = stmt.query_map([since.timestamp_micros()], |row| {
            Ok(WindowSummary {
                host_id: HostId(row.get(0)?),
                name: row.get(1)?,
                address: row.get(2)?,
                samples: row.get::<_, i64>(3)?.try_into().unwrap_or(0),
                failures: row.get::<_, i64>(4)?.try_into().unwrap_or(0),
                avg_rtt: row
                    .get::<_, Option<f64>>(5)?
                    .map(|us| Duration::from_nanos((us.max(0.0) * 1000.0).round() as u64)),
                min_rtt: row.get::<_, Option<i64>>(6)?.map(micros_to_duration),
                max_rtt: row.get::<_, Option<i64>>(7)?.map(micros_to_duration),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    /// Most recent samples for one host, newest first.
    pub fn recent(
        &self,
        host: HostId,
        limit: Option<u32>,
    ) -> Result<Vec<SampleRecord>, StorageError> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT ts, host_id, rtt_us, failed FROM samples
             WHERE host_id = ? ORDER BY ts DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(duckdb::params![host.0, limit], |row| {
            Ok(SampleRecord {
                ts: DateTime::from_timestamp_micros(row.get(0)?).unwrap_or(DateTime::UNIX_EPOCH),
                host_id: HostId(row.get(1)?),
                rtt: row.get::<_, Option<i64>>(2)?.map(micros_to_duration),
                failed: row.get(3)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    /// All stored hosts, ordered by id.
    pub fn hosts(&self) -> Result<Vec<HostRecord>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn
            .prepare("SELECT host_id, name, address, aliases, created_at FROM hosts ORDER BY host_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                HostId(row.get(0)?),
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut hosts = Vec::new();
        for row in rows {
            let (host_id, name, address, aliases, created_at) = row?;
            let aliases = match aliases {
                Some(json) => serde_json::from_str(&json)?,
                None => Vec::new(),
            };
            hosts.push(HostRecord {
                host_id,
                name,
                address,
                aliases,
                created_at: DateTime::from_timestamp_micros(created_at)
                    .ok_or_else(|| StorageError::InvalidData(format!("bad created_at {created_at}")))?,
            });
        }
        Ok(hosts)
    }
}

fn micros_to_duration(us: i64) -> Duration {
    Duration::from_micros(u64::try_from(us).unwrap_or(0))
}

/// Storage administration.
#[derive(Clone)]
pub struct StorageAdmin {
    tx: SyncSender<Command>,
}

impl std::fmt::Debug for StorageAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdmin").finish_non_exhaustive()
    }
}

impl StorageAdmin {
    pub(crate) fn new(tx: SyncSender<Command>) -> Self {
        Self { tx }
    }

    /// Delete samples older than `retention`; the ack carries the number deleted.
    pub fn cleanup(&self, retention: Duration) -> Result<PendingAck<usize>, StorageError> {
        let (ack, pending) = ack_pair();
        self.tx
            .try_send(Command::Cleanup {
                retention,
                ack: Some(ack),
            })
            .map_err(|_| StorageError::ChannelSend)?;
        Ok(pending)
    }

    pub fn checkpoint(&self) -> Result<(), StorageError> {
        self.tx
            .try_send(Command::Checkpoint)
            .map_err(|_| StorageError::ChannelSend)
    }

    pub fn shutdown(&self) -> Result<(), StorageError> {
        self.tx
            .try_send(Command::Shutdown)
            .map_err(|_| StorageError::ChannelSend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::actor::DbActor;
    use tempfile::tempdir;

    fn host(id: u32, name: &str) -> HostRecord {
        HostRecord {
            host_id: HostId(id),
            name: name.to_string(),
            address: format!("10.0.0.{}", id + 1),
            aliases: vec![format!("{name}-alt")],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_window_summary() {
        let dir = tempdir().unwrap();
        let (handle, tx, reader_conn) =
            DbActor::spawn(&dir.path().join("window.db"), 100, Duration::from_secs(60)).unwrap();
        let writer = StorageWriter::new(tx.clone());
        let reader = SampleReader::new(ReadPool::new(reader_conn));

        writer.upsert_host(host(0, "a")).unwrap();
        writer.upsert_host(host(1, "b")).unwrap();
        writer.upsert_host(host(2, "idle")).unwrap();

        let now = Utc::now();
        for ms in [10, 20, 30] {
            writer
                .insert_sample(SampleRecord::success(
                    HostId(0),
                    now,
                    Duration::from_millis(ms),
                ))
                .unwrap();
        }
        writer
            .insert_sample(SampleRecord::failure(HostId(1), now))
            .unwrap();
        // Outside the window
        writer
            .insert_sample(SampleRecord::success(
                HostId(1),
                now - chrono::Duration::hours(2),
                Duration::from_millis(99),
            ))
            .unwrap();
        assert_eq!(writer.flush().unwrap().blocking_wait().unwrap(), 5);

        let summary = reader.window_summary(Duration::from_secs(3600)).unwrap();
        assert_eq!(summary.len(), 3);

        assert_eq!(summary[0].name, "a");
        assert_eq!(summary[0].samples, 3);
        assert_eq!(summary[0].failures, 0);
        assert_eq!(summary[0].avg_rtt, Some(Duration::from_millis(20)));
        assert_eq!(summary[0].min_rtt, Some(Duration::from_millis(10)));
        assert_eq!(summary[0].max_rtt, Some(Duration::from_millis(30)));

        assert_eq!(summary[1].samples, 1);
        assert_eq!(summary[1].failures, 1);
        assert_eq!(summary[1].avg_rtt, None);

        assert_eq!(summary[2].name, "idle");
        assert_eq!(summary[2].samples, 0);

        tx.send(Command::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_recent_newest_first() {
        let dir = tempdir().unwrap();
        let (handle, tx, reader_conn) =
            DbActor::spawn(&dir.path().join("recent.db"), 100, Duration::from_secs(60)).unwrap();
        let writer = StorageWriter::new(tx.clone());
        let reader = SampleReader::new(ReadPool::new(reader_conn));

        let base = Utc::now();
        for i in 0..5 {
            writer
                .insert_sample(SampleRecord::success(
                    HostId(0),
                    base + chrono::Duration::seconds(i),
                    Duration::from_millis(i as u64 + 1),
                ))
                .unwrap();
        }
        writer
            .insert_sample(SampleRecord::failure(HostId(1), base))
            .unwrap();
        writer.flush().unwrap().blocking_wait().unwrap();

        let recent = reader.recent(HostId(0), Some(2)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].rtt, Some(Duration::from_millis(5)));
        assert_eq!(recent[1].rtt, Some(Duration::from_millis(4)));
        assert!(recent.iter().all(|s| s.host_id == HostId(0)));

        tx.send(Command::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_hosts_roundtrip_aliases() {
        let dir = tempdir().unwrap();
        let (handle, tx, reader_conn) =
            DbActor::spawn(&dir.path().join("hosts.db"), 100, Duration::from_secs(60)).unwrap();
        let writer = StorageWriter::new(tx.clone());
        let reader = SampleReader::new(ReadPool::new(reader_conn));

        writer.upsert_host(host(0, "router")).unwrap();
        // Flush is processed after the upsert, so its ack orders the read
        writer.flush().unwrap().blocking_wait().unwrap();

        let hosts = reader.hosts().unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "router");
        assert_eq!(hosts[0].aliases, vec!["router-alt".to_string()]);

        tx.send(Command::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_admin_cleanup_ack() {
        let dir = tempdir().unwrap();
        let (handle, tx, _reader_conn) =
            DbActor::spawn(&dir.path().join("admin.db"), 100, Duration::from_secs(60)).unwrap();
        let admin = StorageAdmin::new(tx);

        let deleted = admin
            .cleanup(Duration::from_secs(60))
            .unwrap()
            .blocking_wait()
            .unwrap();
        assert_eq!(deleted, 0);
        admin.checkpoint().unwrap();
        admin.shutdown().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_dropped_samples_counter_shared() {
        let dir = tempdir().unwrap();
        // Capacity 1 and a stalled actor would be needed to force drops; after
        // shutdown the channel is disconnected, which try_send also rejects.
        let (handle, tx, _reader_conn) =
            DbActor::spawn(&dir.path().join("dropped.db"), 1, Duration::from_secs(60)).unwrap();
        let writer = StorageWriter::new(tx.clone());
        let writer_clone = writer.clone();
        assert_eq!(writer.dropped_samples(), 0);

        tx.send(Command::Shutdown).unwrap();
        handle.join().unwrap();
        drop(tx);

        assert!(
            writer
                .insert_sample(SampleRecord::failure(HostId(0), Utc::now()))
                .is_err()
        );
        assert_eq!(writer_clone.dropped_samples(), 1);
    }

    #[test]
    fn test_ack_dropped() {
        let (ack, pending) = ack_pair::<usize>();
        drop(ack);
        assert!(matches!(
            pending.blocking_wait(),
            Err(StorageError::AckDropped)
        ));
    }
}
