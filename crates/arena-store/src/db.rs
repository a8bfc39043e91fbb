//! The single SQLite connection behind a [`crate::Kv`].
//!
//! Every store operation borrows the connection through [`Database::read`]
//! or [`Database::write`], each of which runs one transaction on the
//! blocking pool while holding the connection mutex. Because there is only
//! one connection, holding the mutex serializes commits: a `write` observes
//! every earlier commit and no later one.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::types::ToSql;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Applied to every new connection, in order.
const PRAGMAS: &[(&str, &dyn ToSql)] = &[
    ("journal_mode", &"WAL"),
    // Safe with WAL: a power loss may drop the last commit, never corrupt.
    ("synchronous", &"NORMAL"),
    ("mmap_size", &67_108_864_i64),
    // KiB when negative.
    ("cache_size", &-16_000_i32),
    ("temp_store", &"MEMORY"),
    // Another process holding the write lock makes us wait, not fail.
    ("busy_timeout", &5_000_i32),
];

/// Cloneable handle to the store's connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path` and migrate it.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        info!(path = %path.display(), "opening database");
        let conn = tokio::task::spawn_blocking(move || Connection::open(path)).await??;
        Self::prepare(conn).await
    }

    /// A private in-memory database, migrated.
    pub async fn in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");
        Self::prepare(Connection::open_in_memory()?).await
    }

    async fn prepare(conn: Connection) -> StoreResult<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with_conn(|conn| {
            for (name, value) in PRAGMAS {
                conn.pragma_update(None, name, value)?;
            }
            migration::run_all(conn)
        })
        .await?;
        Ok(db)
    }

    /// Run `f` inside a read transaction, so every statement it issues
    /// sees the same committed state.
    ///
    /// ```ignore
    /// let rows: i64 = db
    ///     .read(|tx| Ok(tx.query_row("SELECT count(*) FROM kv", [], |row| row.get(0))?))
    ///     .await?;
    /// ```
    pub async fn read<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    /// Run `apply` inside a `BEGIN IMMEDIATE` transaction and commit it if
    /// `apply` succeeds; an error rolls everything back.
    ///
    /// `after_commit` runs once the commit is durable but before the
    /// connection is released, so anything it publishes is ordered exactly
    /// like the commits themselves.
    pub async fn write<F, C, T>(&self, apply: F, after_commit: C) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send + 'static,
        C: FnOnce(&T) + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = apply(&tx)?;
            tx.commit()?;
            after_commit(&value);
            Ok(value)
        })
        .await
    }

    async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_rows(tx: &Transaction<'_>) -> StoreResult<i64> {
        Ok(tx.query_row("SELECT count(*) FROM kv", [], |row| row.get(0))?)
    }

    #[tokio::test]
    async fn in_memory_is_migrated_and_tuned() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(db.read(count_rows).await.unwrap(), 0);

        let timeout: i64 = db
            .read(|tx| Ok(tx.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(timeout, 5_000);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_and_skips_hook() {
        let db = Database::in_memory().await.unwrap();
        let hook_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&hook_ran);

        let result: StoreResult<()> = db
            .write(
                |tx| {
                    tx.execute("INSERT INTO kv VALUES (x'01', x'02', 1)", [])?;
                    Err(StoreError::InvalidArgument("abort".into()))
                },
                move |_| flag.store(true, std::sync::atomic::Ordering::SeqCst),
            )
            .await;

        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        assert!(!hook_ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(db.read(count_rows).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn hook_sees_the_committed_value() {
        let db = Database::in_memory().await.unwrap();
        let (tx_seen, rx_seen) = std::sync::mpsc::channel();

        let written = db
            .write(
                |tx| Ok(tx.execute("INSERT INTO kv VALUES (x'01', x'02', 1)", [])?),
                move |rows| tx_seen.send(*rows).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(written, 1);
        assert_eq!(rx_seen.recv().unwrap(), 1);
        assert_eq!(db.read(count_rows).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sql_errors_surface_as_unavailable() {
        let db = Database::in_memory().await.unwrap();
        let result: StoreResult<()> = db
            .read(|tx| {
                tx.execute("SELECT * FROM missing_table", [])?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
