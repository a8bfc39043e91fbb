//! Hierarchical keys and their order-preserving byte encoding.
//!
//! A [`Key`] is a tuple of [`KeyPart`]s such as `["games_by_user", user_id,
//! game_id]`. Keys are stored as SQLite `BLOB`s, and SQLite compares blobs
//! with `memcmp`, so the encoding must sort exactly like the tuples do.
//!
//! Each part is written as `[type_tag][payload]`:
//!
//! - bytes / string: payload with every `0x00` escaped as `0x00 0x01`,
//!   terminated by `0x00 0x00`
//! - integer: 8 bytes big-endian with the sign bit flipped
//! - boolean: a single `0x00` / `0x01` byte
//!
//! Parts are self-delimiting, so the encoding of a key is a byte prefix of
//! the encoding of every key it is a tuple prefix of.

use std::fmt;

use crate::error::{StoreError, StoreResult};

/// Maximum encoded key size in bytes.
pub const MAX_KEY_SIZE: usize = 2048;

const TAG_BYTES: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_BOOL: u8 = 0x04;

/// Sorts after every type tag; used as the exclusive upper bound of a prefix.
const PREFIX_END: u8 = 0xFF;

/// One component of a [`Key`].
///
/// The derived ordering (variant first, then value) matches the byte
/// encoding: bytes < string < integer < boolean.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Bytes(Vec<u8>),
    String(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&String> for KeyPart {
    fn from(s: &String) -> Self {
        Self::String(s.clone())
    }
}

impl From<i64> for KeyPart {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for KeyPart {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<u8>> for KeyPart {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&[u8]> for KeyPart {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => {
                f.write_str("0x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Self::String(s) => write!(f, "{s:?}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// An ordered tuple of key parts forming a hierarchical namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Vec<KeyPart>);

impl Key {
    /// Build a key from its parts.
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Append a part, returning the extended key.
    ///
    /// ```
    /// # use arena_store::Key;
    /// let key = Key::from(["games_by_user"]).with("u1").with("g1");
    /// assert_eq!(key.len(), 3);
    /// ```
    #[must_use]
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `prefix` is a (non-strict) tuple prefix of this key.
    pub fn starts_with(&self, prefix: &Key) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Encode into the order-preserving byte form.
    ///
    /// Fails for the empty key and for keys larger than [`MAX_KEY_SIZE`].
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        if self.0.is_empty() {
            return Err(StoreError::InvalidKey("key must have at least one part".into()));
        }
        let encoded = self.encode_unchecked();
        if encoded.len() > MAX_KEY_SIZE {
            return Err(StoreError::InvalidKey(format!(
                "encoded key is {} bytes, limit is {MAX_KEY_SIZE}",
                encoded.len()
            )));
        }
        Ok(encoded)
    }

    /// Encoding without validation; the empty key encodes to no bytes.
    pub(crate) fn encode_unchecked(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.0 {
            match part {
                KeyPart::Bytes(b) => {
                    out.push(TAG_BYTES);
                    encode_escaped(b, &mut out);
                }
                KeyPart::String(s) => {
                    out.push(TAG_STRING);
                    encode_escaped(s.as_bytes(), &mut out);
                }
                KeyPart::Int(n) => {
                    out.push(TAG_INT);
                    out.extend_from_slice(&((*n as u64) ^ (1 << 63)).to_be_bytes());
                }
                KeyPart::Bool(b) => {
                    out.push(TAG_BOOL);
                    out.push(u8::from(*b));
                }
            }
        }
        out
    }

    /// Decode a key previously produced by [`Key::encode`].
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        let mut parts = Vec::new();
        let mut i = 0;
        while i < data.len() {
            let tag = data[i];
            i += 1;
            match tag {
                TAG_BYTES => {
                    let (bytes, consumed) = decode_escaped(&data[i..])?;
                    parts.push(KeyPart::Bytes(bytes));
                    i += consumed;
                }
                TAG_STRING => {
                    let (bytes, consumed) = decode_escaped(&data[i..])?;
                    let s = String::from_utf8(bytes)
                        .map_err(|e| StoreError::InvalidKey(format!("non utf-8 string part: {e}")))?;
                    parts.push(KeyPart::String(s));
                    i += consumed;
                }
                TAG_INT => {
                    let raw: [u8; 8] = data
                        .get(i..i + 8)
                        .and_then(|s| s.try_into().ok())
                        .ok_or_else(|| StoreError::InvalidKey("truncated integer part".into()))?;
                    parts.push(KeyPart::Int((u64::from_be_bytes(raw) ^ (1 << 63)) as i64));
                    i += 8;
                }
                TAG_BOOL => {
                    let b = match data.get(i) {
                        Some(0) => false,
                        Some(1) => true,
                        _ => return Err(StoreError::InvalidKey("malformed boolean part".into())),
                    };
                    parts.push(KeyPart::Bool(b));
                    i += 1;
                }
                other => {
                    return Err(StoreError::InvalidKey(format!("unknown type tag 0x{other:02x}")));
                }
            }
        }
        Ok(Self(parts))
    }
}

impl<P: Into<KeyPart>, const N: usize> From<[P; N]> for Key {
    fn from(parts: [P; N]) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }
}

impl From<Vec<KeyPart>> for Key {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{part}")?;
        }
        f.write_str("]")
    }
}

/// Exclusive upper bound for every key strictly below `encoded_prefix`.
pub(crate) fn prefix_end(encoded_prefix: &[u8]) -> Vec<u8> {
    let mut end = Vec::with_capacity(encoded_prefix.len() + 1);
    end.extend_from_slice(encoded_prefix);
    end.push(PREFIX_END);
    end
}

fn encode_escaped(data: &[u8], out: &mut Vec<u8>) {
    out.reserve(data.len() + 2);
    for &b in data {
        if b == 0x00 {
            out.push(0x00);
            out.push(0x01);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Returns `(decoded, bytes_consumed)`, the terminator included.
fn decode_escaped(data: &[u8]) -> StoreResult<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x00 {
            match data.get(i + 1) {
                Some(0x00) => return Ok((out, i + 2)),
                Some(0x01) => {
                    out.push(0x00);
                    i += 2;
                }
                _ => return Err(StoreError::InvalidKey("malformed escape sequence".into())),
            }
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    Err(StoreError::InvalidKey("missing part terminator".into()))
}
