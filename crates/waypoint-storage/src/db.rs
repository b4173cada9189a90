//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and recommended PRAGMAs on initialization, and keeps
//! a nesting counter so the history engine can hold one long-running
//! transaction per store and checkpoint it periodically.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info};
use url::Url;

use waypoint_core::error::WaypointError;

use crate::migrations::{self, StoreSchema};

/// Thread-safe SQLite database wrapper.
pub struct Database {
    conn: Mutex<Connection>,
    schema: StoreSchema,
    transaction_nesting: AtomicU32,
}

impl Database {
    /// Open (or create) a database at the given path.
    ///
    /// Configures WAL mode, synchronous=NORMAL, foreign keys, and runs
    /// all pending migrations for `schema`.
    pub fn new(path: &Path, schema: StoreSchema) -> Result<Self, WaypointError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| WaypointError::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -16384;",
        )
        .map_err(|e| WaypointError::Storage(format!("Failed to set pragmas: {}", e)))?;

        info!(store = schema.name(), "Database opened at {}", path.display());

        let db = Self {
            conn: Mutex::new(conn),
            schema,
            transaction_nesting: AtomicU32::new(0),
        };

        db.with_conn(|conn| migrations::run_migrations(conn, schema))?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(schema: StoreSchema) -> Result<Self, WaypointError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| WaypointError::Storage(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| WaypointError::Storage(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
            schema,
            transaction_nesting: AtomicU32::new(0),
        };

        db.with_conn(|conn| migrations::run_migrations(conn, schema))?;

        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, WaypointError>
    where
        F: FnOnce(&Connection) -> Result<T, WaypointError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| WaypointError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }

    pub fn schema(&self) -> StoreSchema {
        self.schema
    }

    /// Open a transaction, or join the one already open.
    pub fn begin_transaction(&self) -> Result<(), WaypointError> {
        if self.transaction_nesting.fetch_add(1, Ordering::SeqCst) == 0 {
            self.with_conn(|conn| {
                conn.execute_batch("BEGIN TRANSACTION")
                    .map_err(storage_err("Failed to begin transaction"))
            })?;
        }
        Ok(())
    }

    /// Leave the current transaction level, committing when it was the
    /// outermost one. Unbalanced calls are ignored.
    ///
    /// A failed `COMMIT` leaves the SQLite transaction open, so the level is
    /// restored and the caller still holds it.
    pub fn commit_transaction(&self) -> Result<(), WaypointError> {
        let previous = self
            .transaction_nesting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            let committed = self.with_conn(|conn| {
                conn.execute_batch("COMMIT")
                    .map_err(storage_err("Failed to commit transaction"))
            });
            if let Err(e) = committed {
                self.transaction_nesting.fetch_add(1, Ordering::SeqCst);
                return Err(e);
            }
            debug!(store = self.schema.name(), "Transaction committed");
        }
        Ok(())
    }

    pub fn transaction_nesting(&self) -> u32 {
        self.transaction_nesting.load(Ordering::SeqCst)
    }

    /// Reclaim free pages. Must run outside of any transaction.
    pub fn vacuum(&self) -> Result<(), WaypointError> {
        if self.transaction_nesting() != 0 {
            return Err(WaypointError::Storage(
                "Cannot vacuum inside a transaction".to_string(),
            ));
        }
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM")
                .map_err(storage_err("Failed to vacuum"))
        })?;
        info!(store = self.schema.name(), "Database compacted");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("schema", &self.schema)
            .finish()
    }
}

/// Builds a `map_err` adapter that wraps a rusqlite error with context.
pub(crate) fn storage_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> WaypointError {
    move |e| WaypointError::Storage(format!("{}: {}", context, e))
}

/// Times are stored as microseconds since the Unix epoch, zero meaning unset.
pub(crate) fn to_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

pub(crate) fn opt_to_micros(time: Option<DateTime<Utc>>) -> i64 {
    time.map(to_micros).unwrap_or(0)
}

pub(crate) fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    if micros == 0 {
        None
    } else {
        DateTime::from_timestamp_micros(micros)
    }
}

pub(crate) fn time_from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// Reads a URL column, surfacing unparsable text as a conversion error.
pub(crate) fn url_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Url> {
    let text: String = row.get(idx)?;
    Url::parse(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
