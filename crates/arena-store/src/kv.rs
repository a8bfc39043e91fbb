//! The versioned key-value store handle.
//!
//! [`Kv`] is constructed explicitly, cloned into every collaborator that
//! needs it, and closed once at shutdown. Clones share the same connection
//! and watch registry.

use std::path::Path;

use rusqlite::OptionalExtension;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, instrument};

use crate::atomic::AtomicWrite;
use crate::db::Database;
use crate::entry::{decode_value, Commit, KvEntry, Versionstamp};
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::list::{ListIter, ListOptions, ListSelector, DEFAULT_BATCH_SIZE};
use crate::watch::{WatchHub, WatchStream};

/// Tunables for a [`Kv`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvOptions {
    /// Rows per page for listings that do not set their own batch size.
    pub list_batch_size: usize,
}

impl Default for KvOptions {
    fn default() -> Self {
        Self {
            list_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Versioned record store.
///
/// - [`Kv::get`] returns a value with its [`Versionstamp`] or `None`
/// - [`Kv::atomic`] builds guarded multi-key writes
/// - [`Kv::list`] walks a prefix or range in key order
/// - [`Kv::watch`] streams changes to specific keys
#[derive(Clone)]
pub struct Kv {
    db: Database,
    hub: WatchHub,
    options: KvOptions,
}

impl Kv {
    /// Open (or create) the store at `path` and run migrations.
    pub async fn open(path: impl AsRef<Path>, options: KvOptions) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = Database::open(&path).await?;
        info!(path = %path.display(), "kv store ready");
        Ok(Self::from_database(db, options))
    }

    /// A fresh, migrated in-memory store.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let db = Database::in_memory().await?;
        Ok(Self::from_database(db, KvOptions::default()))
    }

    /// Wrap an already migrated database.
    pub fn from_database(db: Database, options: KvOptions) -> Self {
        Self {
            db,
            hub: WatchHub::new(),
            options,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub(crate) fn hub(&self) -> &WatchHub {
        &self.hub
    }

    pub(crate) fn ensure_open(&self) -> StoreResult<()> {
        if self.hub.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    // ── reads ────────────────────────────────────────────────────────

    /// Read one key. `Ok(None)` means the key does not exist.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get<T: DeserializeOwned>(&self, key: &Key) -> StoreResult<Option<KvEntry<T>>> {
        let mut entries = self.get_many(std::slice::from_ref(key)).await?;
        Ok(entries.pop().flatten())
    }

    /// Read several keys from one consistent state, in argument order.
    #[instrument(skip_all, fields(keys = keys.len()))]
    pub async fn get_many<T: DeserializeOwned>(
        &self,
        keys: &[Key],
    ) -> StoreResult<Vec<Option<KvEntry<T>>>> {
        self.ensure_open()?;
        let encoded = keys.iter().map(Key::encode).collect::<StoreResult<Vec<_>>>()?;

        let rows: Vec<Option<(Vec<u8>, i64)>> = self
            .db
            .read(move |tx| {
                let mut stmt =
                    tx.prepare_cached("SELECT value, versionstamp FROM kv WHERE key = ?1")?;
                let mut rows = Vec::with_capacity(encoded.len());
                for key in &encoded {
                    let row = stmt
                        .query_row(rusqlite::params![key], |row| Ok((row.get(0)?, row.get(1)?)))
                        .optional()?;
                    rows.push(row);
                }
                Ok(rows)
            })
            .await?;

        keys.iter()
            .zip(rows)
            .map(|(key, row)| match row {
                Some((value, versionstamp)) => Ok(Some(KvEntry {
                    key: key.clone(),
                    value: decode_value(&value)?,
                    versionstamp: Versionstamp::from_raw(versionstamp as u64),
                })),
                None => Ok(None),
            })
            .collect()
    }

    /// Lazily list entries selected by `selector`.
    pub fn list<T: DeserializeOwned>(
        &self,
        selector: ListSelector,
        options: ListOptions,
    ) -> StoreResult<ListIter<T>> {
        ListIter::new(self.clone(), selector, options, self.options.list_batch_size)
    }

    // ── writes ───────────────────────────────────────────────────────

    /// Start an atomic operation.
    pub fn atomic(&self) -> AtomicWrite {
        AtomicWrite::new(self.clone())
    }

    /// Unconditionally write one key.
    pub async fn set<T: Serialize + ?Sized>(&self, key: Key, value: &T) -> StoreResult<Versionstamp> {
        committed(self.atomic().set(key, value).commit().await?)
    }

    /// Unconditionally delete one key.
    pub async fn delete(&self, key: Key) -> StoreResult<Versionstamp> {
        committed(self.atomic().delete(key).commit().await?)
    }

    // ── watches ──────────────────────────────────────────────────────

    /// Watch `keys` for changes. Registration happens before this returns,
    /// so no commit after the call can be missed unless the reader lets
    /// [`crate::WATCH_QUEUE_CAPACITY`] events pile up, which
    /// [`WatchStream::take_lagged`] reports.
    pub fn watch(&self, keys: &[Key]) -> StoreResult<WatchStream> {
        self.hub.register(keys)
    }

    /// Number of live watch registrations.
    pub fn active_watches(&self) -> usize {
        self.hub.active()
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// Close the store: end every watch and reject further operations.
    ///
    /// In-flight commits finish normally.
    pub fn close(&self) {
        if !self.hub.is_closed() {
            info!("closing kv store");
            self.hub.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.hub.is_closed()
    }
}

/// An unchecked commit can only fail through an error.
fn committed(commit: Commit) -> StoreResult<Versionstamp> {
    commit.versionstamp().ok_or_else(|| {
        StoreError::InvalidArgument("unconditional write reported a conflict".into())
    })
}

// ── tests ────────────────────────────────────────────────────────────
