//! Value-level types shared by every store operation: versionstamps,
//! entries read back from the store, mutations and commit outcomes.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{StoreError, StoreResult};
use crate::key::Key;

/// Maximum encoded value size in bytes.
pub const MAX_VALUE_SIZE: usize = 65_536;

// ── versionstamp ─────────────────────────────────────────────────────

/// Opaque revision marker assigned to every key written by a commit.
///
/// Versionstamps come from a single store-wide commit sequence, so a later
/// commit always carries a greater versionstamp. Callers should only compare
/// them for equality; the ordering is exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Versionstamp(u64);

impl Versionstamp {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020x}", self.0)
    }
}

impl FromStr for Versionstamp {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 20 {
            return Err(StoreError::InvalidArgument(format!(
                "versionstamp must be 20 hex digits, got {s:?}"
            )));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|e| StoreError::InvalidArgument(format!("invalid versionstamp {s:?}: {e}")))
    }
}

impl Serialize for Versionstamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Versionstamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ── entries ──────────────────────────────────────────────────────────

/// A value read from the store together with its current versionstamp.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry<T> {
    pub key: Key,
    pub value: T,
    pub versionstamp: Versionstamp,
}

impl<T> KvEntry<T> {
    /// Replace the value, keeping the key and versionstamp.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> KvEntry<U> {
        KvEntry {
            key: self.key,
            value: f(self.value),
            versionstamp: self.versionstamp,
        }
    }
}

/// Decode a stored JSON value.
pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

// ── mutations ────────────────────────────────────────────────────────

/// What a [`Mutation`] does to its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    /// Store the given JSON-encoded value.
    Set(Vec<u8>),
    /// Remove the key if present.
    Delete,
}

/// A single write inside an atomic operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: Key,
    pub kind: MutationKind,
}

impl Mutation {
    /// A write of `value`, serialized to JSON now.
    pub fn set<T: Serialize + ?Sized>(key: Key, value: &T) -> StoreResult<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self {
            key,
            kind: MutationKind::Set(bytes),
        })
    }

    pub fn delete(key: Key) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
        }
    }
}

/// A guard evaluated before any mutation of an atomic operation.
///
/// `versionstamp: None` requires the key to be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub key: Key,
    pub versionstamp: Option<Versionstamp>,
}

// ── commit outcome ───────────────────────────────────────────────────

/// Result of committing an atomic operation.
///
/// A failed guard is an ordinary outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Commit {
    /// Every mutation was applied under this versionstamp.
    Committed { versionstamp: Versionstamp },
    /// At least one check failed; nothing was written.
    Conflict,
}

impl Commit {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    pub fn versionstamp(&self) -> Option<Versionstamp> {
        match self {
            Self::Committed { versionstamp } => Some(*versionstamp),
            Self::Conflict => None,
        }
    }
}
