//! Versioned schema migrations.
//!
//! Each entry in `MIGRATIONS` runs at most once per database; applied
//! versions are recorded in `_migrations`.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Append only; versions strictly increase.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "versioned key-value table and commit sequence",
    sql: r#"
            CREATE TABLE kv (
                key          BLOB PRIMARY KEY,
                value        BLOB NOT NULL,
                versionstamp INTEGER NOT NULL
            ) WITHOUT ROWID;

            CREATE TABLE kv_meta (
                id                INTEGER PRIMARY KEY CHECK(id = 1),
                last_versionstamp INTEGER NOT NULL
            );
            INSERT INTO kv_meta (id, last_versionstamp) VALUES (1, 0);
        "#,
}];

// ── public API ───────────────────────────────────────────────────────

/// Bring the schema at `conn` up to the latest version.
///
/// Synchronous; [`crate::Database`] runs it on the blocking pool when a
/// connection is opened.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| failed(0, "create _migrations", e))?;

    let from = current_version(conn)?;
    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > from) {
        apply(conn, migration)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(version = from, "schema up to date");
    } else {
        info!(from, applied, to = LATEST, "schema migrated");
    }
    Ok(())
}

/// Highest applied version, `0` for a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
        row.get(0)
    })
    .map_err(|e| failed(0, "read schema version", e))
}

// ── internals ────────────────────────────────────────────────────────

const LATEST: u32 = MIGRATIONS[MIGRATIONS.len() - 1].version;

fn failed(version: u32, step: &str, err: rusqlite::Error) -> StoreError {
    StoreError::Migration {
        version,
        message: format!("{step}: {err}"),
    }
}

/// Apply one migration and record it, all or nothing.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    let version = migration.version;
    info!(version, description = migration.description, "applying migration");

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| failed(version, "begin", e))?;
    let result = tx
        .execute_batch(migration.sql)
        .map_err(|e| failed(version, "execute", e))
        .and_then(|()| {
            tx.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![version, migration.description, chrono::Utc::now().timestamp()],
            )
            .map_err(|e| failed(version, "record", e))
        });

    match result {
        Ok(_) => tx.commit().map_err(|e| failed(version, "commit", e)),
        Err(err) => {
            // Dropping `tx` rolls back.
            warn!(version, %err, "migration failed");
            Err(err)
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
