//! # arena-store
//!
//! Versioned key-value storage for Arena.
//!
//! Records live under ordered tuple [`Key`]s. Every commit is stamped with
//! a strictly increasing [`Versionstamp`], which doubles as the optimistic
//! concurrency token: an [`AtomicWrite`] may require that keys still carry
//! the versionstamps the caller read, and applies nothing if any differ.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  CacheLayer (moka, read-through)             │
//! ├──────────────────────────────────────────────┤
//! │  Kv: get / get_many / atomic / list / watch  │
//! │  WatchHub (per-key change fan-in)            │
//! ├──────────────────────────────────────────────┤
//! │  Database (rusqlite WAL + mmap)              │
//! │  Migrations (versioned, transactional)       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use arena_store::{Key, Kv, KvOptions};
//!
//! let kv = Kv::open("data/arena.db", KvOptions::default()).await?;
//! let entry = kv.get::<Game>(&Key::from(["games", id.as_str()])).await?;
//! if let Some(entry) = entry {
//!     let commit = kv
//!         .atomic()
//!         .check(entry.key.clone(), Some(entry.versionstamp))
//!         .set(entry.key, &next)
//!         .commit()
//!         .await?;
//! }
//! ```

pub mod atomic;
pub mod cache;
pub mod db;
pub mod entry;
pub mod error;
pub mod key;
pub mod kv;
pub mod list;
pub mod migration;
pub mod watch;

// ── re-exports ───────────────────────────────────────────────────────

pub use atomic::{AtomicWrite, MAX_CHECKS, MAX_MUTATIONS};
pub use cache::{CacheLayer, CacheLayerBuilder, CacheStats};
pub use db::Database;
pub use entry::{Check, Commit, KvEntry, Mutation, MutationKind, Versionstamp, MAX_VALUE_SIZE};
pub use error::{StoreError, StoreResult};
pub use key::{Key, KeyPart, MAX_KEY_SIZE};
pub use kv::{Kv, KvOptions};
pub use list::{ListIter, ListOptions, ListSelector, DEFAULT_BATCH_SIZE};
pub use watch::{
    Change, WatchCanceller, WatchEntry, WatchEvent, WatchStream, MAX_WATCH_KEYS,
    WATCH_QUEUE_CAPACITY,
};
