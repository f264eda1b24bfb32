//! Key selectors, range limits and range results
//!
//! A [`KeySelector`] names a key relative to another key rather than literally:
//! "the first key greater than or equal to K", "the last key less than K", and
//! so on, shifted by an offset. Selectors are resolved against whatever view of
//! the database the reader has, so local writes can move where a selector lands.
//!
//! ## Resolution
//!
//! ```text
//! base   = last key <  key   (or_equal = false)
//!          last key <= key   (or_equal = true)
//! result = base moved `offset` keys forward (negative = backward)
//! ```
//!
//! Offsets past either end of the key space clamp to the empty key (start) or
//! the reader's maximum key (end).

use crate::types::{Key, KeyValue};
use serde::{Deserialize, Serialize};

/// Relative key reference resolved against the current view
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySelector {
    /// Anchor key
    pub key: Key,
    /// Whether the anchor itself counts as "at or before" the base position
    pub or_equal: bool,
    /// Number of keys to move from the base position
    pub offset: i32,
}

impl KeySelector {
    /// Create a selector from its raw parts
    pub fn new(key: impl Into<Key>, or_equal: bool, offset: i32) -> Self {
        KeySelector {
            key: key.into(),
            or_equal,
            offset,
        }
    }

    /// First key `>= key`
    pub fn first_greater_or_equal(key: impl Into<Key>) -> Self {
        KeySelector::new(key, false, 1)
    }

    /// First key `> key`
    pub fn first_greater_than(key: impl Into<Key>) -> Self {
        KeySelector::new(key, true, 1)
    }

    /// Last key `<= key`
    pub fn last_less_or_equal(key: impl Into<Key>) -> Self {
        KeySelector::new(key, true, 0)
    }

    /// Last key `< key`
    pub fn last_less_than(key: impl Into<Key>) -> Self {
        KeySelector::new(key, false, 0)
    }

    /// True if this selector always resolves to `key` itself or the next existing key
    pub fn is_first_greater_or_equal(&self) -> bool {
        !self.or_equal && self.offset == 1
    }

    /// True if resolution walks forward from the anchor
    pub fn is_forward(&self) -> bool {
        self.offset >= 1
    }

    /// Shift the selector by `delta` keys
    pub fn add_offset(mut self, delta: i32) -> Self {
        self.offset += delta;
        self
    }

    /// First key that may be the resolution when walking forward
    ///
    /// `key` when `or_equal` is false, `key + "\x00"` otherwise.
    pub fn forward_start(&self) -> Key {
        if self.or_equal {
            self.key.key_after()
        } else {
            self.key.clone()
        }
    }
}

/// Row and byte limits for a range read
///
/// `None` means unlimited. A byte limit is a soft limit: reading stops after
/// the row that crosses it, and at least one row is always returned when any
/// row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RangeLimits {
    /// Maximum rows to return
    pub rows: Option<usize>,
    /// Soft byte limit on returned key+value bytes
    pub bytes: Option<usize>,
}

impl RangeLimits {
    /// No limits
    pub fn unlimited() -> Self {
        RangeLimits::default()
    }

    /// Row limit only
    pub fn rows(rows: usize) -> Self {
        RangeLimits {
            rows: Some(rows),
            bytes: None,
        }
    }

    /// Byte limit only
    pub fn bytes(bytes: usize) -> Self {
        RangeLimits {
            rows: None,
            bytes: Some(bytes),
        }
    }

    /// Set the row limit
    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows = Some(rows);
        self
    }

    /// Set the byte limit
    pub fn with_bytes(mut self, bytes: usize) -> Self {
        self.bytes = Some(bytes);
        self
    }

    /// True when nothing more may be returned
    pub fn is_reached(&self) -> bool {
        self.rows == Some(0) || self.bytes == Some(0)
    }

    /// Account for one returned row
    pub fn decrement(&mut self, kv: &KeyValue) {
        if let Some(rows) = self.rows.as_mut() {
            *rows = rows.saturating_sub(1);
        }
        if let Some(bytes) = self.bytes.as_mut() {
            *bytes = bytes.saturating_sub(kv.expected_size());
        }
    }

    /// True if a limit is set at all
    pub fn has_limit(&self) -> bool {
        self.rows.is_some() || self.bytes.is_some()
    }
}

/// Result of a range read
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeResult {
    /// Rows in iteration order (descending keys for reverse reads)
    pub kvs: Vec<KeyValue>,
    /// True if more rows may exist in the requested range beyond `kvs`
    pub more: bool,
}

impl RangeResult {
    /// Create a range result
    pub fn new(kvs: Vec<KeyValue>, more: bool) -> Self {
        RangeResult { kvs, more }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.kvs.len()
    }

    /// True if no rows were returned
    pub fn is_empty(&self) -> bool {
        self.kvs.is_empty()
    }

    /// Iterate over the rows
    pub fn iter(&self) -> std::slice::Iter<'_, KeyValue> {
        self.kvs.iter()
    }

    /// Borrow the last row in iteration order
    pub fn last(&self) -> Option<&KeyValue> {
        self.kvs.last()
    }
}

impl IntoIterator for RangeResult {
    type Item = KeyValue;
    type IntoIter = std::vec::IntoIter<KeyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.kvs.into_iter()
    }
}
