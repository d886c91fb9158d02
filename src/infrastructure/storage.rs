use crate::infrastructure::error::InfraError;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Opens the state database. Writers wait on a busy lock instead of failing.
pub fn open_connection(path: &Path) -> Result<Connection, InfraError> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    open_connection(path)?.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
