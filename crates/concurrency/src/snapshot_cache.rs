//! Snapshot read cache
//!
//! Remembers what storage returned during this attempt so repeated reads never
//! go remote twice. The cache holds storage truth only (local writes live in
//! the write map) and is valid for a single read version; it is emptied on
//! every reset.
//!
//! A key inside a known interval either has a cached value or is confirmed
//! absent.

use std::collections::BTreeMap;
use std::ops::Bound;

use rywdb_core::{Key, KeyRange, KeyValue, Value};

use crate::conflict::RangeSet;

/// Outcome of a point lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Storage holds this value
    Present(Value),
    /// Storage holds no value
    Absent,
    /// Not observed yet
    Miss,
}

/// Known intervals plus the values of present keys inside them
#[derive(Debug, Clone, Default)]
pub struct SnapshotCache {
    known: RangeSet,
    values: BTreeMap<Key, Value>,
}

impl SnapshotCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a single key
    pub fn lookup(&self, key: &Key) -> CacheLookup {
        if !self.known.contains_key(key) {
            return CacheLookup::Miss;
        }
        match self.values.get(key) {
            Some(v) => CacheLookup::Present(v.clone()),
            None => CacheLookup::Absent,
        }
    }

    /// Known (`true`) and unknown (`false`) sub-ranges of `range`, in key order
    pub fn lookup_range(&self, range: &KeyRange) -> Vec<(KeyRange, bool)> {
        self.known.partition(range)
    }

    /// The known interval containing `key`
    pub fn known_interval(&self, key: &Key) -> Option<KeyRange> {
        self.known.find(key)
    }

    /// True if every key of `range` is known
    pub fn is_known(&self, range: &KeyRange) -> bool {
        self.known.covers(range)
    }

    /// Cached rows of `range`, ascending
    pub fn rows(&self, range: &KeyRange) -> Vec<KeyValue> {
        if range.is_empty() {
            return Vec::new();
        }
        self.values
            .range::<Key, _>((Bound::Included(&range.begin), Bound::Excluded(&range.end)))
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect()
    }

    /// Record the storage value of one key
    pub fn insert(&mut self, key: Key, value: Option<Value>) {
        self.known.insert_key(&key);
        match value {
            Some(v) => {
                self.values.insert(key, v);
            }
            None => {
                self.values.remove(&key);
            }
        }
    }

    /// Record that `rows` are every present key of `range`
    pub fn insert_range(&mut self, range: KeyRange, rows: &[KeyValue]) {
        if range.is_empty() {
            return;
        }
        let stale: Vec<Key> = self
            .values
            .range::<Key, _>((Bound::Included(&range.begin), Bound::Excluded(&range.end)))
            .map(|(k, _)| k.clone())
            .collect();
        for k in stale {
            self.values.remove(&k);
        }
        for kv in rows.iter().filter(|kv| range.contains(&kv.key)) {
            self.values.insert(kv.key.clone(), kv.value.clone());
        }
        self.known.insert(range);
    }

    /// Number of known intervals
    pub fn interval_count(&self) -> usize {
        self.known.len()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.known.clear();
        self.values.clear();
    }
}
