//! Conflict range accumulators
//!
//! A [`RangeSet`] holds a coalesced, disjoint set of key ranges.
//! Inserting a range already covered is a no-op; overlapping or touching
//! ranges merge into one. The transaction keeps one set for reads and one for
//! writes and ships both at commit; the snapshot cache tracks its known
//! intervals with the same structure.

use std::collections::BTreeMap;
use std::ops::Bound;

use rywdb_core::{Key, KeyRange};

/// Coalesced set of disjoint key ranges
///
/// Stored as `begin -> end`; for any two entries `a < b`, `a.end < b.begin`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: BTreeMap<Key, Key>,
}

impl RangeSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `range`, merging with any overlapping or touching range
    pub fn insert(&mut self, range: KeyRange) {
        if range.is_empty() {
            return;
        }
        let KeyRange {
            mut begin,
            mut end,
        } = range;

        let touching: Vec<Key> = self
            .ranges
            .range::<Key, _>((Bound::Unbounded, Bound::Included(&end)))
            .rev()
            .take_while(|(_, e)| **e >= begin)
            .map(|(b, _)| b.clone())
            .collect();

        for b in touching {
            if let Some(e) = self.ranges.remove(&b) {
                if b < begin {
                    begin = b;
                }
                if e > end {
                    end = e;
                }
            }
        }
        self.ranges.insert(begin, end);
    }

    /// Add the single-key range `[key, key + "\x00")`
    pub fn insert_key(&mut self, key: &Key) {
        self.insert(KeyRange::single_key(key.clone()));
    }

    /// True if `key` lies in some range of the set
    pub fn contains_key(&self, key: &Key) -> bool {
        self.ranges
            .range::<Key, _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .is_some_and(|(_, end)| key < end)
    }

    /// True if `range` lies entirely inside one range of the set
    pub fn covers(&self, range: &KeyRange) -> bool {
        if range.is_empty() {
            return true;
        }
        self.ranges
            .range::<Key, _>((Bound::Unbounded, Bound::Included(&range.begin)))
            .next_back()
            .is_some_and(|(_, end)| range.end <= *end)
    }

    /// The range of the set containing `key`
    pub fn find(&self, key: &Key) -> Option<KeyRange> {
        self.ranges
            .range::<Key, _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .filter(|(_, end)| key < *end)
            .map(|(b, e)| KeyRange::new(b.clone(), e.clone()))
    }

    /// Split `within` into alternating covered (`true`) and uncovered parts
    pub fn partition(&self, within: &KeyRange) -> Vec<(KeyRange, bool)> {
        let mut parts = Vec::new();
        if within.is_empty() {
            return parts;
        }
        let mut cursor = within.begin.clone();
        for covered in self.intersecting(within) {
            if cursor < covered.begin {
                parts.push((KeyRange::new(cursor, covered.begin.clone()), false));
            }
            cursor = covered.end.clone();
            parts.push((covered, true));
        }
        if cursor < within.end {
            parts.push((KeyRange::new(cursor, within.end.clone()), false));
        }
        parts
    }

    /// Ranges of the set that intersect `within`, clipped to it
    pub fn intersecting(&self, within: &KeyRange) -> Vec<KeyRange> {
        self.iter()
            .filter_map(|r| r.intersection(within))
            .collect()
    }

    /// Iterate over the ranges in key order
    pub fn iter(&self) -> impl Iterator<Item = KeyRange> + '_ {
        self.ranges
            .iter()
            .map(|(b, e)| KeyRange::new(b.clone(), e.clone()))
    }

    /// All ranges in key order
    pub fn to_vec(&self) -> Vec<KeyRange> {
        self.iter().collect()
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// True if the set is empty
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Remove every range
    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

/// Read or write conflict ranges of one transaction attempt
pub type ConflictRangeSet = RangeSet;

impl FromIterator<KeyRange> for RangeSet {
    fn from_iter<I: IntoIterator<Item = KeyRange>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}
