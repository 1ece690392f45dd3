//! Storage builder and handles.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::storage::StorageError;
use crate::storage::actor::DbActor;
use crate::storage::pool::ReadPool;
use crate::storage::{SampleReader, StorageAdmin, StorageWriter};

/// Default channel capacity for writer commands.
const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Default WAL checkpoint interval.
const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    db_path: PathBuf,
    channel_capacity: usize,
    checkpoint_interval: Duration,
}

impl StorageBuilder {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }

    /// Builder preloaded from the `database` config section.
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(&config.path)
            .channel_capacity(config.channel_capacity)
            .checkpoint_interval(config.checkpoint_interval)
    }

    /// Set the channel capacity for writer commands.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the WAL checkpoint interval.
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Build the storage layer and return handles.
    pub fn build(self) -> Result<StorageHandles, StorageError> {
        if let Some(parent) = self.db_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Internal(format!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let (actor_handle, tx, reader_conn) =
            DbActor::spawn(&self.db_path, self.channel_capacity, self.checkpoint_interval)?;
        tracing::info!(path = %self.db_path.display(), "Storage opened");

        Ok(StorageHandles {
            writer: StorageWriter::new(tx.clone()),
            reader: SampleReader::new(ReadPool::new(reader_conn)),
            admin: StorageAdmin::new(tx),
            actor_handle: Some(actor_handle),
        })
    }
}

/// Handles to all storage layer facades.
pub struct StorageHandles {
    pub writer: StorageWriter,
    pub reader: SampleReader,
    pub admin: StorageAdmin,
    actor_handle: Option<JoinHandle<()>>,
}

impl StorageHandles {
    /// Gracefully shutdown the storage layer.
    ///
    /// Sends shutdown to the writer actor and waits for its final flush and
    /// checkpoint. Blocks, so async callers should use `spawn_blocking`.
    pub fn shutdown(mut self) -> Result<(), StorageError> {
        self.admin.shutdown()?;

        if let Some(handle) = self.actor_handle.take() {
            handle
                .join()
                .map_err(|_| StorageError::Internal("Failed to join actor thread".to_string()))?;
        }

        Ok(())
    }
}

impl Drop for StorageHandles {
    fn drop(&mut self) {
        if self.actor_handle.is_some() {
            let _ = self.admin.shutdown();
            if let Some(handle) = self.actor_handle.take() {
                let _ = handle.join();
            }
        }
    }
}
