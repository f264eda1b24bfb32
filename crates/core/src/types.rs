//! Core key-space types
//!
//! This module defines the foundational byte-string types shared by every layer:
//! - Key: ordered binary key
//! - Value: binary value
//! - KeyRange: half-open interval `[begin, end)` over keys
//! - KeyValue: a key paired with its value
//! - Versionstamp: 10-byte commit stamp (8-byte version + 2-byte batch order)
//!
//! Keys order lexicographically by their bytes. Every value handed out by the
//! transaction layer is an owned copy; nothing borrows transaction memory.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Commit / read version assigned by the cluster
///
/// Versions are monotonically increasing. A read at version `v` observes every
/// commit with version `<= v`.
pub type Version = u64;

/// Write a byte string with non-printable bytes escaped as `\xNN`
fn write_printable(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for &b in bytes {
        if (0x20..0x7f).contains(&b) && b != b'\\' {
            write!(f, "{}", b as char)?;
        } else {
            write!(f, "\\x{:02x}", b)?;
        }
    }
    Ok(())
}

/// Ordered binary key
///
/// # Ordering
///
/// Keys compare lexicographically by bytes, so `"a" < "a\x00" < "ab" < "b"`.
/// The immediate successor of any key `k` is `k + "\x00"` (see [`Key::key_after`]).
///
/// # Examples
///
/// ```
/// use rywdb_core::Key;
///
/// let k = Key::from("apple");
/// assert!(k < k.key_after());
/// assert!(Key::from("apple\x00") == k.key_after());
/// ```
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Create a key from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Key(bytes.into())
    }

    /// The empty key, which sorts before every other key
    pub fn empty() -> Self {
        Key(Vec::new())
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the key, returning its bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty key
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The smallest key strictly greater than this one (`self + "\x00"`)
    pub fn key_after(&self) -> Key {
        let mut bytes = Vec::with_capacity(self.0.len() + 1);
        bytes.extend_from_slice(&self.0);
        bytes.push(0);
        Key(bytes)
    }

    /// True if `self` is exactly `other + "\x00"`
    pub fn is_key_after(&self, other: &Key) -> bool {
        self.0.len() == other.0.len() + 1
            && self.0.last() == Some(&0)
            && self.0[..other.0.len()] == other.0[..]
    }

    /// True if this key begins with `prefix`
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    /// The first key that does not start with this key as a prefix
    ///
    /// Trailing `0xff` bytes are stripped and the last remaining byte incremented.
    /// Returns `None` when the key is empty or consists solely of `0xff` bytes.
    pub fn strinc(&self) -> Option<Key> {
        let mut bytes = self.0.clone();
        while let Some(&last) = bytes.last() {
            if last == 0xff {
                bytes.pop();
            } else {
                let idx = bytes.len() - 1;
                bytes[idx] = last + 1;
                return Some(Key(bytes));
            }
        }
        None
    }

    /// Concatenate `prefix` and this key
    pub fn with_prefix(&self, prefix: &[u8]) -> Key {
        let mut bytes = Vec::with_capacity(prefix.len() + self.0.len());
        bytes.extend_from_slice(prefix);
        bytes.extend_from_slice(&self.0);
        Key(bytes)
    }

    /// Strip `prefix` from the key, if present
    pub fn strip_prefix(&self, prefix: &[u8]) -> Option<Key> {
        self.0.strip_prefix(prefix).map(|rest| Key(rest.to_vec()))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(\"")?;
        write_printable(f, &self.0)?;
        write!(f, "\")")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_printable(f, &self.0)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for Key {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key(bytes)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Key {
    fn from(bytes: &[u8; N]) -> Self {
        Key(bytes.to_vec())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

impl From<&Key> for Key {
    fn from(k: &Key) -> Self {
        k.clone()
    }
}

/// Binary value
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Value(Vec<u8>);

impl Value {
    /// Create a value from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Value(bytes.into())
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the value, returning its bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty value
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value(\"")?;
        write_printable(f, &self.0)?;
        write!(f, "\")")
    }
}

impl AsRef<[u8]> for Value {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Value {
    fn from(bytes: &[u8; N]) -> Self {
        Value(bytes.to_vec())
    }
}

impl From<[u8; 8]> for Value {
    fn from(bytes: [u8; 8]) -> Self {
        Value(bytes.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value(s.as_bytes().to_vec())
    }
}

/// Half-open key interval `[begin, end)`
///
/// A range whose `begin >= end` is empty. Constructors never reorder the
/// endpoints; callers that accept user ranges must reject inverted input.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound
    pub begin: Key,
    /// Exclusive upper bound
    pub end: Key,
}

impl KeyRange {
    /// Create a range `[begin, end)`
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        KeyRange {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// The range containing exactly `key`: `[key, key + "\x00")`
    pub fn single_key(key: impl Into<Key>) -> Self {
        let begin = key.into();
        let end = begin.key_after();
        KeyRange { begin, end }
    }

    /// Every key starting with `prefix`
    ///
    /// For a prefix with no successor (all `0xff`), the range ends at `prefix + "\xff"`.
    pub fn prefix(prefix: impl Into<Key>) -> Self {
        let begin = prefix.into();
        let end = begin.strinc().unwrap_or_else(|| {
            let mut bytes = begin.as_bytes().to_vec();
            bytes.push(0xff);
            Key::new(bytes)
        });
        KeyRange { begin, end }
    }

    /// True if the range contains no keys
    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// True if `key` lies in `[begin, end)`
    pub fn contains(&self, key: &Key) -> bool {
        *key >= self.begin && *key < self.end
    }

    /// True if `other` lies entirely within this range
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.is_empty() || (other.begin >= self.begin && other.end <= self.end)
    }

    /// True if the two ranges share at least one key
    pub fn intersects(&self, other: &KeyRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.begin < other.end && other.begin < self.end
    }

    /// The overlap of two ranges, if non-empty
    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        let begin = std::cmp::max(&self.begin, &other.begin).clone();
        let end = std::cmp::min(&self.end, &other.end).clone();
        if begin < end {
            Some(KeyRange { begin, end })
        } else {
            None
        }
    }

    /// True if this range holds exactly one key
    pub fn is_single_key(&self) -> bool {
        self.end.is_key_after(&self.begin)
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        write_printable(f, self.begin.as_bytes())?;
        write!(f, ", ")?;
        write_printable(f, self.end.as_bytes())?;
        write!(f, ")")
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A key together with its value, as returned by range reads
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key
    pub key: Key,
    /// The value stored at `key`
    pub value: Value,
}

impl KeyValue {
    /// Create a key-value pair
    pub fn new(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Bytes counted against range-read byte limits
    pub fn expected_size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Unique 10-byte stamp assigned to a committed transaction
///
/// Layout: 8-byte big-endian commit version followed by a 2-byte big-endian
/// batch order. Stamps sort in commit order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Versionstamp([u8; 10]);

impl Versionstamp {
    /// Stamp length in bytes
    pub const LEN: usize = 10;

    /// Build a stamp from a commit version and batch order
    pub fn new(version: Version, batch_order: u16) -> Self {
        let mut bytes = [0u8; 10];
        bytes[..8].copy_from_slice(&version.to_be_bytes());
        bytes[8..].copy_from_slice(&batch_order.to_be_bytes());
        Versionstamp(bytes)
    }

    /// Commit version embedded in the stamp
    pub fn version(&self) -> Version {
        let mut v = [0u8; 8];
        v.copy_from_slice(&self.0[..8]);
        Version::from_be_bytes(v)
    }

    /// Batch order embedded in the stamp
    pub fn batch_order(&self) -> u16 {
        u16::from_be_bytes([self.0[8], self.0[9]])
    }

    /// Raw stamp bytes
    pub fn as_bytes(&self) -> &[u8; 10] {
        &self.0
    }
}

impl fmt::Debug for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Versionstamp(")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}
