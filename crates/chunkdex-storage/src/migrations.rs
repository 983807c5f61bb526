//! Database schema migrations.

use rusqlite::Connection;
use tracing::info;

use chunkdex_core::error::Result;

use crate::db::sqlite_error;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| sqlite_error("Failed to create migrations table", e))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| sqlite_error("Failed to query migration version", e))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: collections_and_chunks");
    }

    Ok(())
}

/// Version 1: collection definitions and their chunk rows.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS collections (
            name            TEXT PRIMARY KEY NOT NULL,
            dimension       INTEGER NOT NULL CHECK (dimension > 0),
            metric          TEXT NOT NULL CHECK (metric IN ('cosine', 'euclidean')),
            schema_json     TEXT NOT NULL,
            next_id         INTEGER NOT NULL DEFAULT 1,
            created_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE TABLE IF NOT EXISTS chunks (
            collection      TEXT NOT NULL,
            id              INTEGER NOT NULL,
            embedding       BLOB NOT NULL,
            metadata        TEXT NOT NULL,
            created_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            PRIMARY KEY (collection, id),
            FOREIGN KEY (collection) REFERENCES collections(name) ON DELETE CASCADE
        );

        INSERT INTO schema_migrations (version, name) VALUES (1, 'collections_and_chunks');
        ",
    )
    .map_err(|e| sqlite_error("Migration v1 failed", e))?;
    Ok(())
}
