//! Shared reader connection.

use std::sync::{Arc, Mutex, MutexGuard};

use duckdb::Connection;

use crate::storage::StorageError;

/// Reader access to the writer's database instance.
///
/// Holds a connection cloned from the writer's, so queries see committed
/// writes without waiting for a checkpoint. Readers are rare (snapshot
/// exports and tests), so one mutex-guarded connection is enough.
pub struct ReadPool {
    conn: Mutex<Connection>,
}

impl ReadPool {
    pub fn new(conn: Connection) -> Arc<Self> {
        Arc::new(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Borrow the reader connection.
    pub fn get(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Internal("reader connection poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::init_schema;

    #[test]
    fn test_pool_shares_writer_database() {
        let writer = Connection::open_in_memory().unwrap();
        init_schema(&writer).unwrap();
        let pool = ReadPool::new(writer.try_clone().unwrap());

        writer
            .execute(
                "INSERT INTO samples (ts, host_id, rtt_us, failed) VALUES (1, 0, NULL, true)",
                [],
            )
            .unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
