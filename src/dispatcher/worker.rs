//! The persistence worker task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::aggregator::RoundRecord;
use crate::dispatcher::{CadenceTier, PersistAck, PersistError, PersistJob, TierSchedule};
use crate::snapshot::{SnapshotExporter, SnapshotRequest};
use crate::stats::HostSnapshot;
use crate::storage::{SampleRecord, StorageAdmin, StorageWriter};

/// Target for per-sample telemetry events.
pub const TELEMETRY_TARGET: &str = "pingtest::telemetry";

pub(super) struct Worker {
    tiers: Vec<CadenceTier>,
    schedule: TierSchedule,
    writer: StorageWriter,
    admin: StorageAdmin,
    exporter: Arc<dyn SnapshotExporter>,
    retention: Duration,
    acks: mpsc::Sender<PersistAck>,
    pending: Vec<SampleRecord>,
    latest_stats: Vec<HostSnapshot>,
    jobs: JoinSet<Result<usize, PersistError>>,
    running: HashMap<task::Id, PersistJob>,
}

impl Worker {
    pub(super) fn new(
        tiers: Vec<CadenceTier>,
        writer: StorageWriter,
        admin: StorageAdmin,
        exporter: Arc<dyn SnapshotExporter>,
        retention: Duration,
        acks: mpsc::Sender<PersistAck>,
    ) -> Self {
        Self {
            schedule: TierSchedule::new(&tiers),
            tiers,
            writer,
            admin,
            exporter,
            retention,
            acks,
            pending: Vec::new(),
            latest_stats: Vec::new(),
            jobs: JoinSet::new(),
            running: HashMap::new(),
        }
    }

    /// Run until the record channel closes, then flush once more.
    ///
    /// Returns whether that final flush was acknowledged as written.
    pub(super) async fn run(mut self, mut records: mpsc::Receiver<RoundRecord>) -> bool {
        let base = self.schedule.base();
        let mut ticker = tokio::time::interval_at(Instant::now() + base, base);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(base = ?base, tiers = self.tiers.len(), "Persistence worker started");

        loop {
            tokio::select! {
                biased;

                record = records.recv() => match record {
                    Some(record) => self.absorb(record),
                    None => break,
                },

                _ = ticker.tick() => self.on_tick().await,

                Some(done) = self.jobs.join_next_with_id(), if !self.jobs.is_empty() => {
                    self.finish_job(done);
                }
            }
        }

        let flushed = self.flush().await;
        while let Some(done) = self.jobs.join_next_with_id().await {
            self.finish_job(done);
        }

        tracing::info!(flushed, "Persistence worker stopped");
        flushed
    }

    /// Buffer a closed round and emit its telemetry.
    fn absorb(&mut self, record: RoundRecord) {
        for sample in &record.samples {
            let name = record
                .stats
                .get(sample.host_id.index())
                .map_or("", |h| h.name.as_str());
            let event = sample.telemetry(name);
            if sample.failed {
                tracing::info!(
                    target: TELEMETRY_TARGET,
                    timestamp = %event.timestamp.to_rfc3339(),
                    host = %event.host,
                    rtt = event.rtt,
                    fail = event.fail,
                    round = record.round,
                    "fail"
                );
            } else {
                tracing::info!(
                    target: TELEMETRY_TARGET,
                    timestamp = %event.timestamp.to_rfc3339(),
                    host = %event.host,
                    rtt = event.rtt,
                    fail = event.fail,
                    round = record.round,
                    "success"
                );
            }
        }
        self.pending.extend(record.samples);
        self.latest_stats = record.stats;
    }

    async fn on_tick(&mut self) {
        if !self.pending.is_empty() {
            self.flush().await;
        }

        for idx in self.schedule.process_tick() {
            let Some(tier) = self.tiers.get(idx) else {
                continue;
            };
            let tier_interval = tier.interval;
            for window in tier.windows.clone() {
                self.spawn_export(tier_interval, window);
            }
            if self.schedule.slowest() == Some(idx) {
                self.spawn_cleanup();
            }
        }
    }

    /// Hand buffered samples to the writer and wait for it to commit them.
    ///
    /// Samples the writer rejected turn the acknowledgement into an error even
    /// when the rest were written.
    async fn flush(&mut self) -> bool {
        let mut rejected = 0;
        for sample in std::mem::take(&mut self.pending) {
            if self.writer.insert_sample(sample).is_err() {
                rejected += 1;
            }
        }

        let written = match self.writer.flush() {
            Ok(pending) => pending.wait().await.map_err(PersistError::from),
            Err(e) => Err(e.into()),
        };
        let result = flush_outcome(written, rejected);
        let ok = result.is_ok();
        self.report(PersistAck {
            job: PersistJob::Flush,
            result,
        });
        ok
    }

    fn spawn_export(&mut self, tier: Duration, window: Duration) {
        let job = PersistJob::Snapshot { window };
        if self.running.values().any(|running| *running == job) {
            tracing::debug!(window = ?window, "Previous export still running, skipping");
            return;
        }

        let exporter = Arc::clone(&self.exporter);
        let request = SnapshotRequest {
            tier,
            window,
            stats: self.latest_stats.clone(),
        };
        let handle = self.jobs.spawn(async move {
            exporter
                .export(request)
                .await
                .map(|_| 1)
                .map_err(PersistError::from)
        });
        self.running.insert(handle.id(), job);
    }

    fn spawn_cleanup(&mut self) {
        let pending = self.admin.cleanup(self.retention);
        let handle = self.jobs.spawn(async move {
            match pending {
                Ok(pending) => pending.wait().await.map_err(PersistError::from),
                Err(e) => Err(e.into()),
            }
        });
        self.running.insert(handle.id(), PersistJob::Cleanup);
    }

    fn finish_job(
        &mut self,
        done: Result<(task::Id, Result<usize, PersistError>), task::JoinError>,
    ) {
        let (id, result) = match done {
            Ok((id, result)) => (id, result),
            Err(e) => (e.id(), Err(PersistError::Join(e.to_string()))),
        };
        let Some(job) = self.running.remove(&id) else {
            return;
        };
        self.report(PersistAck { job, result });
    }

    fn report(&self, ack: PersistAck) {
        if let Err(e) = &ack.result {
            tracing::warn!(job = %ack.job, error = %e, "Persistence job failed");
        }
        if self.acks.try_send(ack).is_err() {
            tracing::debug!("Acknowledgement channel full or closed");
        }
    }
}

/// Combine the writer's flush result with the number of samples it refused.
fn flush_outcome(
    written: Result<usize, PersistError>,
    rejected: usize,
) -> Result<usize, PersistError> {
    match written {
        Ok(written) if rejected > 0 => Err(PersistError::SamplesDropped {
            dropped: rejected,
            written,
        }),
        other => other,
    }
}
