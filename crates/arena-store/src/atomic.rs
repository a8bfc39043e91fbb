//! Atomic, optionally guarded, multi-key writes.
//!
//! An [`AtomicWrite`] collects checks and mutations and applies them in one
//! `BEGIN IMMEDIATE` transaction:
//!
//! 1. every check is compared against the key's current versionstamp;
//!    a single mismatch rolls back and yields [`Commit::Conflict`];
//! 2. the store-wide commit sequence is bumped once;
//! 3. all mutations are written under that versionstamp;
//! 4. watchers are notified before the connection lock is released.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::entry::{Check, Commit, Mutation, MutationKind, Versionstamp, MAX_VALUE_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::kv::Kv;

/// Maximum number of mutations in one atomic operation.
pub const MAX_MUTATIONS: usize = 1000;

/// Maximum number of checks in one atomic operation.
pub const MAX_CHECKS: usize = 100;

/// Builder for an atomic operation; see [`Kv::atomic`].
///
/// Serialization failures in [`AtomicWrite::set`] are deferred and
/// reported by [`AtomicWrite::commit`], so calls can be chained.
#[must_use = "an atomic operation does nothing until committed"]
pub struct AtomicWrite {
    kv: Kv,
    checks: Vec<Check>,
    mutations: Vec<Mutation>,
    error: Option<StoreError>,
}

impl AtomicWrite {
    pub(crate) fn new(kv: Kv) -> Self {
        Self {
            kv,
            checks: Vec::new(),
            mutations: Vec::new(),
            error: None,
        }
    }

    /// Require `key` to currently have `versionstamp` (`None`: be absent).
    pub fn check(mut self, key: Key, versionstamp: Option<Versionstamp>) -> Self {
        self.checks.push(Check { key, versionstamp });
        self
    }

    /// Write `value` to `key`.
    pub fn set<T: Serialize + ?Sized>(mut self, key: Key, value: &T) -> Self {
        match Mutation::set(key, value) {
            Ok(m) => self.mutations.push(m),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Delete `key`.
    pub fn delete(mut self, key: Key) -> Self {
        self.mutations.push(Mutation::delete(key));
        self
    }

    /// Add a prepared mutation.
    pub fn mutate(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    /// Add prepared mutations, e.g. derived index entries.
    pub fn extend(mut self, mutations: impl IntoIterator<Item = Mutation>) -> Self {
        self.mutations.extend(mutations);
        self
    }

    /// Apply the operation. Checks failing is `Ok(Commit::Conflict)`.
    #[instrument(skip_all, fields(checks = self.checks.len(), mutations = self.mutations.len()))]
    pub async fn commit(self) -> StoreResult<Commit> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.mutations.len() > MAX_MUTATIONS {
            return Err(StoreError::InvalidArgument(format!(
                "too many mutations: {} (limit {MAX_MUTATIONS})",
                self.mutations.len()
            )));
        }
        if self.checks.len() > MAX_CHECKS {
            return Err(StoreError::InvalidArgument(format!(
                "too many checks: {} (limit {MAX_CHECKS})",
                self.checks.len()
            )));
        }

        let checks = self
            .checks
            .iter()
            .map(|c| Ok((c.key.encode()?, c.versionstamp)))
            .collect::<StoreResult<Vec<_>>>()?;
        let mut written = Vec::with_capacity(self.mutations.len());
        for mutation in &self.mutations {
            if let MutationKind::Set(bytes) = &mutation.kind
                && bytes.len() > MAX_VALUE_SIZE
            {
                return Err(StoreError::InvalidArgument(format!(
                    "value for {} is {} bytes (limit {MAX_VALUE_SIZE})",
                    mutation.key,
                    bytes.len()
                )));
            }
            written.push(mutation.key.encode()?);
        }

        self.kv.ensure_open()?;
        let hub = self.kv.hub().clone();
        let batch = Arc::new((self.mutations, written));
        let published = Arc::clone(&batch);

        let outcome = self
            .kv
            .database()
            .write(
                move |tx| {
                    let (mutations, written) = &*batch;
                    for (key, expected) in &checks {
                        let current: Option<i64> = tx
                            .query_row(
                                "SELECT versionstamp FROM kv WHERE key = ?1",
                                rusqlite::params![key],
                                |row| row.get(0),
                            )
                            .optional()?;
                        let current = current.map(|raw| Versionstamp::from_raw(raw as u64));
                        if current != *expected {
                            // Nothing written yet; the empty commit is a no-op.
                            return Ok(Commit::Conflict);
                        }
                    }

                    let raw: i64 = tx.query_row(
                        "UPDATE kv_meta SET last_versionstamp = last_versionstamp + 1 \
                         WHERE id = 1 RETURNING last_versionstamp",
                        [],
                        |row| row.get(0),
                    )?;

                    for (mutation, key) in mutations.iter().zip(written) {
                        match &mutation.kind {
                            MutationKind::Set(value) => {
                                tx.execute(
                                    "INSERT INTO kv (key, value, versionstamp) VALUES (?1, ?2, ?3) \
                                     ON CONFLICT(key) DO UPDATE SET \
                                     value = excluded.value, versionstamp = excluded.versionstamp",
                                    rusqlite::params![key, value, raw],
                                )?;
                            }
                            MutationKind::Delete => {
                                tx.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])?;
                            }
                        }
                    }

                    Ok(Commit::Committed {
                        versionstamp: Versionstamp::from_raw(raw as u64),
                    })
                },
                move |commit| {
                    if let Commit::Committed { versionstamp } = commit {
                        let (mutations, written) = &*published;
                        let touched: Vec<(&Mutation, Vec<u8>)> =
                            mutations.iter().zip(written.iter().cloned()).collect();
                        hub.publish(*versionstamp, &touched);
                    }
                },
            )
            .await?;

        match outcome {
            Commit::Committed { versionstamp } => debug!(%versionstamp, "atomic write committed"),
            Commit::Conflict => debug!("atomic write rejected by check"),
        }
        Ok(outcome)
    }
}
