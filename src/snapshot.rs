//! Windowed snapshot export.
//!
//! A snapshot joins the per-window aggregates read back from storage with the
//! lifetime statistics of the latest closed round, and is written as one JSON
//! document per window: `<dir>/pingtest-<window>.json`.

use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::format_duration;
use crate::host::HostId;
use crate::stats::HostSnapshot;
use crate::storage::{SampleReader, StorageError, WindowSummary};

/// Errors from writing a snapshot document.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The blocking export task panicked or was cancelled.
    #[error("export task failed: {0}")]
    Join(String),
}

/// One export job.
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    /// Interval of the tier that asked for it.
    pub tier: Duration,
    pub window: Duration,
    /// Lifetime statistics as of the latest closed round.
    pub stats: Vec<HostSnapshot>,
}

/// Destination for snapshot documents.
#[async_trait::async_trait]
pub trait SnapshotExporter: Send + Sync + 'static {
    /// Write one snapshot and return where it went.
    async fn export(&self, request: SnapshotRequest) -> Result<PathBuf, ExportError>;
}

/// Writes snapshots as JSON files, replacing each atomically.
#[derive(Debug, Clone)]
pub struct JsonSnapshotExporter {
    dir: PathBuf,
    reader: SampleReader,
}

impl JsonSnapshotExporter {
    pub fn new(dir: impl Into<PathBuf>, reader: SampleReader) -> Self {
        Self {
            dir: dir.into(),
            reader,
        }
    }

    /// File a snapshot for `window` is written to.
    pub fn path_for(&self, window: Duration) -> PathBuf {
        snapshot_path(&self.dir, window)
    }
}

fn snapshot_path(dir: &Path, window: Duration) -> PathBuf {
    let label = format_duration(window).replace(' ', "");
    dir.join(format!("pingtest-{label}.json"))
}

#[async_trait::async_trait]
impl SnapshotExporter for JsonSnapshotExporter {
    async fn export(&self, request: SnapshotRequest) -> Result<PathBuf, ExportError> {
        let dir = self.dir.clone();
        let reader = self.reader.clone();

        tokio::task::spawn_blocking(move || {
            let summaries = reader.window_summary(request.window)?;
            let document = SnapshotDocument::build(&request, summaries);
            let path = snapshot_path(&dir, request.window);
            write_atomic(&path, &serde_json::to_vec_pretty(&document)?)?;
            tracing::debug!(path = %path.display(), hosts = document.hosts.len(), "Snapshot written");
            Ok(path)
        })
        .await
        .map_err(|e| ExportError::Join(e.to_string()))?
    }
}

/// Write to a uniquely named sibling temp file, then rename over `path`.
///
/// Concurrent writers of the same `path` never share a temp file; the last
/// rename wins with a complete document.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".pingtest-")
        .suffix(".json.tmp")
        .tempfile_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct SnapshotDocument {
    generated_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    tier: Duration,
    #[serde(with = "humantime_serde")]
    window: Duration,
    hosts: Vec<HostEntry>,
}

#[derive(Debug, Serialize)]
struct HostEntry {
    id: HostId,
    name: String,
    address: String,
    window: WindowEntry,
    lifetime: Option<LifetimeEntry>,
}

#[derive(Debug, Serialize)]
struct WindowEntry {
    samples: u64,
    failures: u64,
    loss_ratio: f64,
    #[serde(with = "humantime_serde")]
    avg_rtt: Option<Duration>,
    #[serde(with = "humantime_serde")]
    min_rtt: Option<Duration>,
    #[serde(with = "humantime_serde")]
    max_rtt: Option<Duration>,
}

#[derive(Debug, Serialize)]
struct LifetimeEntry {
    address: IpAddr,
    rounds: u64,
    fails: u64,
    #[serde(with = "humantime_serde")]
    avg_rtt: Duration,
    #[serde(with = "humantime_serde")]
    stddev: Option<Duration>,
}

impl SnapshotDocument {
    fn build(request: &SnapshotRequest, summaries: Vec<WindowSummary>) -> Self {
        let hosts = summaries
            .into_iter()
            .map(|s| {
                let lifetime = request
                    .stats
                    .iter()
                    .find(|h| h.id == s.host_id)
                    .map(|h| LifetimeEntry {
                        address: h.address,
                        rounds: h.rounds(),
                        fails: h.fails,
                        avg_rtt: h.avg,
                        stddev: h.stddev,
                    });
                HostEntry {
                    id: s.host_id,
                    window: WindowEntry {
                        samples: s.samples,
                        failures: s.failures,
                        loss_ratio: s.loss_ratio(),
                        avg_rtt: s.avg_rtt,
                        min_rtt: s.min_rtt,
                        max_rtt: s.max_rtt,
                    },
                    name: s.name,
                    address: s.address,
                    lifetime,
                }
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            tier: request.tier,
            window: request.window,
            hosts,
        }
    }
}
