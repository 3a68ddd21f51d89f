//! SQLite Database Module
//!
//! Thin wrapper around a single `rusqlite` connection used by the
//! orchestration state store and the result store.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, TransactionBehavior};

use crate::core::{CoreError, CoreResult};

/// Busy timeout applied to every connection
const BUSY_TIMEOUT_MS: u64 = 5_000;

fn poisoned<T>(_: PoisonError<T>) -> CoreError {
    CoreError::StoreUnavailable("database connection lock poisoned".to_string())
}

/// Formats a timestamp with fixed width so stored values sort lexically
pub fn fmt_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// =============================================================================
// Database
// =============================================================================

/// SQLite database with a schema applied at open time
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Opens (or creates) the database at `path` and applies `schema`
    pub fn open<P: AsRef<Path>>(path: P, schema: &str) -> CoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(|e| {
            CoreError::StoreUnavailable(format!(
                "Failed to open database {}: {}",
                path.display(),
                e
            ))
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Self::init(conn, schema)
    }

    /// Creates an in-memory database (for testing)
    pub fn in_memory(schema: &str) -> CoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            CoreError::StoreUnavailable(format!("Failed to create in-memory database: {}", e))
        })?;

        Self::init(conn, schema)
    }

    fn init(conn: Connection, schema: &str) -> CoreResult<Self> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch(schema).map_err(|e| {
            CoreError::StoreUnavailable(format!("Failed to initialize schema: {}", e))
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `op` with exclusive access to the connection
    pub fn with_conn<T>(&self, op: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let conn = self.conn.lock().map_err(poisoned)?;
        op(&conn)
    }

    /// Runs `op` inside an immediate (write-locking) transaction, committing
    /// only if it succeeds
    pub fn with_transaction<T>(
        &self,
        op: impl FnOnce(&rusqlite::Transaction<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut conn = self.conn.lock().map_err(poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
