//! pingtest - round-based reachability and latency monitor
//!
//! Probes a fixed set of hosts in rounds, closes each round into per-host
//! outcomes, keeps running statistics, and persists samples and windowed
//! snapshots without ever blocking the round loop.
//!
//! # Architecture
//!
//! - **Hosts**: [`host::HostRegistry`] resolves specs into ids and an address index
//! - **Probing**: a [`probe::Prober`] task reports replies and round boundaries
//! - **Aggregation**: [`aggregator::ResultAggregator`] owns the round table and stats
//! - **Persistence**: [`dispatcher::PersistenceDispatcher`] feeds DuckDB [`storage`]
//!   and [`snapshot`] export on cadence tiers
//! - **Shutdown**: [`shutdown::ShutdownController`] drains and summarizes
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pingtest::{IcmpProber, ProberHandle, ResultAggregator, ShutdownController, probe_channels};
//!
//! let (sink, streams) = probe_channels(1024);
//! let prober = ProberHandle::spawn(IcmpProber::new(config.probe), registry.addresses(), sink);
//! let mut aggregator = ResultAggregator::new(Arc::clone(&registry), streams);
//! let controller = ShutdownController::new(config.shutdown.drain_timeout);
//! controller.listen_for_signals();
//! let reason = aggregator.run(&controller.token()).await;
//! let report = controller.complete(&mut aggregator, prober, reason).await;
//! ```

pub mod aggregator;
pub mod config;
pub mod dispatcher;
pub mod host;
pub mod probe;
pub mod shutdown;
pub mod snapshot;
pub mod stats;
pub mod storage;

pub use aggregator::{ExitReason, ResultAggregator, RoundRecord};
pub use config::{AppConfig, ConfigError};
pub use dispatcher::{CadenceTier, PersistAck, PersistenceDispatcher};
pub use host::{HostId, HostRegistry, HostSpec};
pub use probe::{IcmpProber, Prober, ProberError, ProberHandle, probe_channels};
pub use shutdown::{ShutdownController, ShutdownReport};
pub use snapshot::{JsonSnapshotExporter, SnapshotExporter};
pub use stats::StatsTracker;
pub use storage::{StorageBuilder, StorageHandles};
