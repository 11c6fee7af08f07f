//! Database cleanup: delete our rows, then compact the file

use crate::config::{is_identifier, DatabaseConfig};
use crate::error::WorkerError;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use tracing::debug;

/// Delete every row whose configured column matches the configured value,
/// then `VACUUM`. Returns the number of rows deleted.
///
/// The database must already exist; it is never created here.
pub fn clean(config: &DatabaseConfig) -> Result<usize, WorkerError> {
    if !is_identifier(&config.table) || !is_identifier(&config.column) {
        return Err(WorkerError::InvalidArgument);
    }

    let mut conn = Connection::open_with_flags(
        &config.path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(WorkerError::DbOpen)?;

    let sql = format!(
        "DELETE FROM \"{}\" WHERE \"{}\" = ?1",
        config.table, config.column
    );

    // Dropping the transaction on error rolls it back.
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(WorkerError::DbExec)?;
    let deleted = tx
        .execute(&sql, [&config.value])
        .map_err(WorkerError::DbExec)?;
    tx.commit().map_err(WorkerError::DbExec)?;

    conn.execute_batch("VACUUM;").map_err(WorkerError::DbExec)?;
    debug!(
        "Deleted {} rows from {} and vacuumed {}",
        deleted,
        config.table,
        config.path.display()
    );
    Ok(deleted)
}
