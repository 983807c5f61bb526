//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex. WAL mode and the usual
//! PRAGMAs are applied on open, followed by migrations.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, ErrorCode, Transaction};
use tracing::info;

use chunkdex_core::error::{ChunkdexError, Result};

use crate::migrations;

/// Thread-safe SQLite database wrapper.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path and run pending migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| sqlite_error("Failed to open database", e))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 250;",
        )
        .map_err(|e| sqlite_error("Failed to set pragmas", e))?;

        info!("Database opened at {}", path.display());
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| sqlite_error("Failed to open in-memory db", e))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| sqlite_error("Failed to set pragmas", e))?;

        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with the underlying connection while holding the lock.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ChunkdexError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a closure inside a transaction.
    ///
    /// The transaction commits only if the closure returns `Ok`; any error
    /// rolls every statement back.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ChunkdexError::Storage(format!("Database lock poisoned: {}", e)))?;
        let tx = conn
            .transaction()
            .map_err(|e| sqlite_error("Failed to begin transaction", e))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| sqlite_error("Failed to commit transaction", e))?;
        Ok(value)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

/// Map a rusqlite error, classifying lock contention as transient.
pub fn sqlite_error(context: &str, err: rusqlite::Error) -> ChunkdexError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            ChunkdexError::StoreUnavailable(format!("{}: {}", context, err))
        }
        _ => ChunkdexError::Storage(format!("{}: {}", context, err)),
    }
}
