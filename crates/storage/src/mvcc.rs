//! Multi-version key-value store
//!
//! Every key maps to its version chain, oldest first. An entry of `None` is a
//! tombstone left by a clear. A read at version `v` sees the newest entry with
//! version `<= v`.
//!
//! # Design Notes
//!
//! - **Single write version per commit**: all mutations of one commit share a
//!   version; a later mutation in the same batch replaces the earlier entry.
//! - **Pruning keeps one floor entry**: versions older than the retained window
//!   collapse into the newest entry at or below the floor, so reads at the floor
//!   still see the right value.

use std::collections::BTreeMap;
use std::ops::Bound;

use rywdb_core::limits::ALL_KEYS_END;
use rywdb_core::{Key, KeyRange, KeySelector, KeyValue, RangeLimits, RangeResult, Value, Version};

/// Version chains for every key ever written
#[derive(Debug, Default)]
pub struct VersionedStore {
    data: BTreeMap<Key, Vec<(Version, Option<Value>)>>,
}

impl VersionedStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `key` visible at `version`
    pub fn get(&self, key: &Key, version: Version) -> Option<Value> {
        self.data
            .get(key)
            .and_then(|chain| visible(chain, version))
            .cloned()
    }

    /// Write `value` (or a tombstone) at `version`
    pub fn put(&mut self, key: Key, version: Version, value: Option<Value>) {
        let chain = self.data.entry(key).or_default();
        match chain.last_mut() {
            Some((v, slot)) if *v == version => *slot = value,
            _ => chain.push((version, value)),
        }
    }

    /// Tombstone every key in `range` that is live at `version`
    pub fn clear_range(&mut self, range: &KeyRange, version: Version) {
        if range.is_empty() {
            return;
        }
        let live: Vec<Key> = self
            .data
            .range::<Key, _>((Bound::Included(&range.begin), Bound::Excluded(&range.end)))
            .filter(|(_, chain)| visible(chain, version).is_some())
            .map(|(k, _)| k.clone())
            .collect();
        for key in live {
            self.put(key, version, None);
        }
    }

    /// Live keys in `[begin, end)` at `version`, in ascending order
    fn live_range<'a>(
        &'a self,
        begin: &'a Key,
        end: &'a Key,
        version: Version,
    ) -> impl DoubleEndedIterator<Item = (&'a Key, &'a Value)> + 'a {
        let bounds = if begin < end {
            (Bound::Included(begin), Bound::Excluded(end))
        } else {
            (Bound::Included(begin), Bound::Excluded(begin))
        };
        self.data
            .range::<Key, _>(bounds)
            .filter_map(move |(k, chain)| visible(chain, version).map(|v| (k, v)))
    }

    /// Resolve a key selector against the data visible at `version`
    ///
    /// Walking off the front clamps to the empty key; walking off the back clamps
    /// to the end of the non-special key space.
    pub fn resolve_selector(&self, selector: &KeySelector, version: Version) -> Key {
        let empty = Key::empty();
        let end = Key::from(ALL_KEYS_END);
        if selector.is_forward() {
            let start = selector.forward_start();
            let skip = (selector.offset - 1) as usize;
            let resolved = self
                .live_range(&start, &end, version)
                .nth(skip)
                .map(|(k, _)| k.clone())
                .unwrap_or(end.clone());
            resolved
        } else {
            let stop = if selector.or_equal {
                selector.key.key_after()
            } else {
                selector.key.clone()
            };
            let skip = selector.offset.unsigned_abs() as usize;
            let resolved = self
                .live_range(&empty, &stop, version)
                .rev()
                .nth(skip)
                .map(|(k, _)| k.clone())
                .unwrap_or(empty.clone());
            resolved
        }
    }

    /// Range read of `[begin, end)` at `version`
    ///
    /// The byte limit is soft: the row that crosses it is still returned.
    pub fn scan(
        &self,
        begin: &Key,
        end: &Key,
        mut limits: RangeLimits,
        version: Version,
        reverse: bool,
    ) -> RangeResult {
        let mut rows: Box<dyn Iterator<Item = (&Key, &Value)>> = if reverse {
            Box::new(self.live_range(begin, end, version).rev())
        } else {
            Box::new(self.live_range(begin, end, version))
        };

        let mut kvs = Vec::new();
        while !limits.is_reached() {
            match rows.next() {
                Some((k, v)) => {
                    let kv = KeyValue::new(k.clone(), v.clone());
                    limits.decrement(&kv);
                    kvs.push(kv);
                }
                None => return RangeResult::new(kvs, false),
            }
        }
        let more = rows.next().is_some();
        RangeResult::new(kvs, more)
    }

    /// Split `range` into chunks of roughly `chunk_size` stored bytes
    ///
    /// The result always starts with `range.begin` and ends with `range.end`.
    pub fn split_points(&self, range: &KeyRange, chunk_size: usize, version: Version) -> Vec<Key> {
        let mut points = vec![range.begin.clone()];
        let mut acc = 0usize;
        for (k, v) in self.live_range(&range.begin, &range.end, version) {
            if acc >= chunk_size.max(1) && *k != range.begin {
                points.push(k.clone());
                acc = 0;
            }
            acc += k.len() + v.len();
        }
        if range.end > range.begin {
            points.push(range.end.clone());
        }
        points
    }

    /// Stored key+value bytes in `range` at `version`
    pub fn estimated_size(&self, range: &KeyRange, version: Version) -> u64 {
        self.live_range(&range.begin, &range.end, version)
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }

    /// Drop history older than `floor`, keeping the entry visible at `floor`
    pub fn prune(&mut self, floor: Version) {
        self.data.retain(|_, chain| {
            let keep_from = chain
                .iter()
                .rposition(|(v, _)| *v <= floor)
                .unwrap_or(0);
            chain.drain(..keep_from);
            !matches!(chain.as_slice(), [(v, None)] if *v <= floor)
        });
    }

    /// Number of keys with a version chain
    pub fn chain_count(&self) -> usize {
        self.data.len()
    }
}

fn visible(chain: &[(Version, Option<Value>)], version: Version) -> Option<&Value> {
    chain
        .iter()
        .rev()
        .find(|(v, _)| *v <= version)
        .and_then(|(_, value)| value.as_ref())
}
