//! Ordered, lazily paged listing.
//!
//! A [`ListIter`] walks keys in byte order (the tuple order of [`Key`]) or
//! in reverse, fetching `batch_size` rows at a time and resuming after the
//! last key it returned. Each page is read consistently; the listing as a
//! whole is not a snapshot, and it never observes writes made after the
//! iterator passed their position.

use std::collections::VecDeque;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use tracing::trace;

use crate::entry::{decode_value, KvEntry, Versionstamp};
use crate::error::{StoreError, StoreResult};
use crate::key::{prefix_end, Key};
use crate::kv::Kv;

/// Default number of rows fetched per page.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Which keys a listing covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListSelector {
    /// Every key that has `prefix` as a strict tuple prefix. The prefix
    /// key itself is not included.
    Prefix(Key),
    /// Keys in `[start, end)`.
    Range { start: Key, end: Key },
}

impl ListSelector {
    pub fn prefix(prefix: impl Into<Key>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn range(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self::Range {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// Options for [`Kv::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Stop after this many entries.
    pub limit: Option<usize>,
    /// Walk from the largest key down.
    pub reverse: bool,
    /// Rows fetched per round-trip; `None` uses the store default.
    pub batch_size: Option<usize>,
}

impl ListOptions {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }
}

/// One-shot, finite iterator over a key range.
pub struct ListIter<T> {
    kv: Kv,
    /// Lower bound and whether it is inclusive.
    lower: (Vec<u8>, bool),
    /// Exclusive upper bound.
    upper: Vec<u8>,
    reverse: bool,
    remaining: Option<usize>,
    batch_size: usize,
    buffer: VecDeque<KvEntry<T>>,
    exhausted: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ListIter<T> {
    pub(crate) fn new(
        kv: Kv,
        selector: ListSelector,
        options: ListOptions,
        default_batch: usize,
    ) -> StoreResult<Self> {
        let (lower, upper) = match selector {
            ListSelector::Prefix(prefix) => {
                let encoded = if prefix.is_empty() {
                    Vec::new()
                } else {
                    prefix.encode()?
                };
                let upper = prefix_end(&encoded);
                ((encoded, false), upper)
            }
            ListSelector::Range { start, end } => ((start.encode()?, true), end.encode()?),
        };

        let batch_size = options.batch_size.unwrap_or(default_batch);
        if batch_size == 0 {
            return Err(StoreError::InvalidArgument("batch size must be positive".into()));
        }

        Ok(Self {
            kv,
            lower,
            upper,
            reverse: options.reverse,
            remaining: options.limit,
            batch_size,
            buffer: VecDeque::new(),
            exhausted: false,
            _marker: PhantomData,
        })
    }

    /// The next entry, fetching another page when the buffer runs dry.
    pub async fn next(&mut self) -> StoreResult<Option<KvEntry<T>>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        let entry = self.buffer.pop_front();
        if entry.is_some()
            && let Some(remaining) = self.remaining.as_mut()
        {
            *remaining -= 1;
        }
        Ok(entry)
    }

    /// Drain the iterator into a vector.
    pub async fn collect(mut self) -> StoreResult<Vec<KvEntry<T>>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }

    /// Drain the iterator, keeping only the values.
    pub async fn values(self) -> StoreResult<Vec<T>> {
        Ok(self.collect().await?.into_iter().map(|e| e.value).collect())
    }

    async fn fetch_page(&mut self) -> StoreResult<()> {
        self.kv.ensure_open()?;

        let want = match self.remaining {
            Some(remaining) => remaining.min(self.batch_size),
            None => self.batch_size,
        };
        let (lower, inclusive) = self.lower.clone();
        let upper = self.upper.clone();
        let reverse = self.reverse;

        let rows: Vec<(Vec<u8>, Vec<u8>, i64)> = self
            .kv
            .database()
            .read(move |tx| {
                let sql = format!(
                    "SELECT key, value, versionstamp FROM kv \
                     WHERE key {} ?1 AND key < ?2 ORDER BY key {} LIMIT ?3",
                    if inclusive { ">=" } else { ">" },
                    if reverse { "DESC" } else { "ASC" },
                );
                let mut stmt = tx.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![lower, upper, want as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        trace!(rows = rows.len(), want, reverse, "list page fetched");
        if rows.len() < want {
            self.exhausted = true;
        }

        if let Some((last_key, _, _)) = rows.last() {
            // Resume strictly past the last key seen.
            if self.reverse {
                self.upper = last_key.clone();
            } else {
                self.lower = (last_key.clone(), false);
            }
        }

        for (key, value, versionstamp) in rows {
            self.buffer.push_back(KvEntry {
                key: Key::decode(&key)?,
                value: decode_value(&value)?,
                versionstamp: Versionstamp::from_raw(versionstamp as u64),
            });
        }
        Ok(())
    }
}
