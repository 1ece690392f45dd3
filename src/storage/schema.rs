//! Database schema definitions.

use duckdb::Connection;

use crate::storage::StorageError;

/// SQL statement for creating the hosts table (dimension table).
///
/// `host_id` is the registry id, so ids are stable across restarts only when
/// the host list is unchanged. Aliases are stored as a JSON array string.
pub const HOSTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
    host_id     UINTEGER PRIMARY KEY,
    name        VARCHAR NOT NULL,
    address     VARCHAR NOT NULL,
    aliases     VARCHAR DEFAULT '[]',
    created_at  BIGINT NOT NULL
);
"#;

/// SQL statement for creating the samples table (data table).
///
/// One row per host per round. `rtt_us` is NULL for failures.
pub const SAMPLES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS samples (
    ts       BIGINT NOT NULL,
    host_id  UINTEGER NOT NULL,
    rtt_us   BIGINT,
    failed   BOOLEAN NOT NULL
);
"#;

/// Initialize the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(HOSTS_TABLE_DDL)?;
    conn.execute_batch(SAMPLES_TABLE_DDL)?;

    tracing::info!("Database schema initialized");
    Ok(())
}
