//! pingtest binary entry point.
//!
//! Exit status: 2 for configuration errors at startup, 0 after a signal or a
//! normal prober end, 1 for a prober fatal error or other runtime failure.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use pingtest::{
    AppConfig, ConfigError, ExitReason, HostRegistry, IcmpProber, JsonSnapshotExporter,
    PersistenceDispatcher, ProberHandle, ResultAggregator, ShutdownController, StorageBuilder,
    config::parse_duration,
    host::parse_specs,
    probe_channels,
    storage::{HostRecord, StorageError},
};
use strum_macros::Display;
use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_CONFIG: u8 = 2;
const EXIT_RUNTIME: u8 = 1;

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Display)]
#[strum(serialize_all = "lowercase")]
enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Round-based ICMP reachability and latency monitor.
#[derive(Parser, Debug)]
#[command(name = "pingtest", version, about, long_about = None)]
struct Cli {
    /// Hosts as `name:address` or bare `address`; added to configured hosts
    hosts: Vec<String>,

    /// Path to configuration file
    #[arg(short, long, env = "PINGTEST_CONFIG")]
    config: Option<PathBuf>,

    /// Database file (overrides config file)
    #[arg(long, env = "PINGTEST_DB_PATH")]
    db_path: Option<String>,

    /// Snapshot output directory (overrides config file)
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Time between round starts, e.g. `1s`
    #[arg(long, value_parser = parse_duration)]
    interval: Option<Duration>,

    /// Longest RTT still counted as a reply, e.g. `800ms`
    #[arg(long, value_parser = parse_duration)]
    max_rtt: Option<Duration>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Cli {
    /// Apply overrides (CLI > ENV > config file).
    fn apply(&self, config: &mut AppConfig) {
        config.hosts.extend(self.hosts.iter().cloned());
        if let Some(path) = &self.db_path {
            config.database.path = path.clone();
        }
        if let Some(dir) = &self.snapshot_dir {
            config.persistence.snapshot_dir = dir.clone();
        }
        if let Some(interval) = self.interval {
            config.probe.interval = interval;
        }
        if let Some(max_rtt) = self.max_rtt {
            config.probe.max_rtt = max_rtt;
        }
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AppError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => EXIT_CONFIG,
            Self::Storage(_) => EXIT_RUNTIME,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_format, cli.log_file.as_deref()) {
        eprintln!("failed to open log file: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "pingtest failed to start");
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(format: LogFormat, log_file: Option<&Path>) -> std::io::Result<()> {
    let writer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    let ansi = log_file.is_none();

    let fmt_layer = match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,pingtest=debug".into()),
        )
        .with(fmt_layer)
        .init();
    Ok(())
}

async fn run(cli: Cli) -> Result<u8, AppError> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting pingtest");

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            AppConfig::load(path)?
        }
        None => AppConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    let specs = parse_specs(&config.hosts)?;
    let registry = Arc::new(HostRegistry::resolve(&specs, config.duplicate_policy).await?);
    for host in registry.iter() {
        tracing::info!(id = %host.id, name = %host.name, address = %host.address, "Monitoring host");
    }

    let storage = StorageBuilder::from_config(&config.database).build()?;
    for host in registry.iter() {
        storage.writer.upsert_host(HostRecord::from(host))?;
    }

    let exporter = Arc::new(JsonSnapshotExporter::new(
        config.persistence.snapshot_dir.clone(),
        storage.reader.clone(),
    ));
    let (dispatcher, acks) = PersistenceDispatcher::spawn(
        config.persistence.tiers.clone(),
        storage.writer.clone(),
        storage.admin.clone(),
        exporter,
        config.persistence.channel_capacity,
        config.persistence.retention,
    );

    let controller = ShutdownController::new(config.shutdown.drain_timeout);
    let signals = controller.listen_for_signals();

    let (sink, streams) = probe_channels(config.probe.channel_capacity);
    let prober = ProberHandle::spawn(
        IcmpProber::new(config.probe.clone()),
        registry.addresses(),
        sink,
    );
    let mut aggregator =
        ResultAggregator::new(Arc::clone(&registry), streams).with_dispatcher(dispatcher, acks);

    tracing::info!(
        interval = ?config.probe.interval,
        max_rtt = ?config.probe.max_rtt,
        "Probing; press Ctrl+C to stop"
    );

    let reason = aggregator.run(&controller.token()).await;
    let report = controller.complete(&mut aggregator, prober, reason).await;
    signals.abort();

    match tokio::task::spawn_blocking(move || storage.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Failed to shutdown storage"),
        Err(e) => tracing::error!(error = %e, "Storage shutdown task failed"),
    }

    if let ExitReason::ProberFailed(e) = &report.reason {
        tracing::error!(error = %e, "Prober failed");
    }

    Ok(u8::try_from(report.exit_code()).unwrap_or(EXIT_RUNTIME))
}
