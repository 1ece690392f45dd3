//! Storage Layer
//!
//! DuckDB storage with a single writer thread and a shared reader connection:
//! - **Writer**: dedicated thread owning the write connection, fed by a
//!   bounded channel; samples are appended in batches
//! - **Reader**: connection cloned from the writer's, so reads see writes
//!   immediately
//!
//! # Components
//!
//! - [`StorageWriter`]: non-blocking host and sample writes
//! - [`SampleReader`]: window summaries and recent samples
//! - [`StorageAdmin`]: retention cleanup, checkpoint, shutdown
//! - [`StorageBuilder`] / [`StorageHandles`]: initialization and lifecycle

mod actor;
mod builder;
mod error;
mod facades;
mod pool;
mod schema;
mod types;

pub use builder::{StorageBuilder, StorageHandles};
pub use error::StorageError;
pub use facades::{PendingAck, SampleReader, StorageAdmin, StorageWriter};
pub use types::{HostRecord, SampleRecord, TelemetryEvent, WindowSummary};
