//! Write-intent map
//!
//! Records every uncommitted write of a transaction as an ordered boundary map.
//! Each boundary key starts a segment that runs to the next boundary; the
//! segment's [`WriteState`] says what the transaction did to the keys in it.
//!
//! ```text
//! ""      -> Unmodified
//! "a"     -> Cleared          clear_range("a", "m")
//! "f"     -> Set("x")         set("f", "x")
//! "f\0"   -> Cleared
//! "m"     -> Unmodified
//! ```
//!
//! Invariants:
//! - a boundary at `""` always exists, so every key is covered by exactly one segment
//! - a point state (`Set`, `Atomic`, `Unreadable`) at `k` is followed by a boundary at `k\0`
//! - adjacent segments never both hold `Unmodified`, nor both hold `Cleared`
//!
//! Atomic operators on a key whose value comes from storage are kept as a stack
//! and folded over the storage value at read time; the map never stores a
//! collapsed value it cannot know.

use std::collections::BTreeMap;
use std::ops::Bound;

use rywdb_core::{apply_atomic_op, Error, Key, KeyRange, MutationType, Result, Value};

/// Starting point of an atomic operator stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicBase {
    /// Base value is whatever storage holds
    Storage,
    /// Base value was written (or cleared) earlier in this transaction
    Known(Option<Value>),
}

/// Pending atomic operators on one key, oldest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicStack {
    /// Value the operators apply to
    pub base: AtomicBase,
    /// Operators in program order
    pub ops: Vec<(MutationType, Value)>,
}

impl AtomicStack {
    /// True if the result does not depend on storage
    pub fn is_independent(&self) -> bool {
        matches!(self.base, AtomicBase::Known(_))
    }

    /// Apply every operator over the base
    ///
    /// `storage` is consulted only when the base comes from storage.
    pub fn fold(&self, storage: Option<&Value>) -> Result<Option<Value>> {
        let mut current = match &self.base {
            AtomicBase::Storage => storage.cloned(),
            AtomicBase::Known(v) => v.clone(),
        };
        for (op, operand) in &self.ops {
            current = apply_atomic_op(current.as_ref().map(Value::as_bytes), *op, operand.as_bytes())?;
        }
        Ok(current)
    }
}

/// What the transaction has done to the keys of one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteState {
    /// Not written; reads go to cache or storage
    Unmodified,
    /// Cleared; every key reads as absent
    Cleared,
    /// Single key set to a value
    Set(Value),
    /// Single key with pending atomic operators
    Atomic(AtomicStack),
    /// Single key whose value holds a versionstamp placeholder
    Unreadable,
}

impl WriteState {
    /// True for single-key states
    pub fn is_point(&self) -> bool {
        matches!(
            self,
            WriteState::Set(_) | WriteState::Atomic(_) | WriteState::Unreadable
        )
    }

    /// True if reading the segment never needs storage
    pub fn is_independent(&self) -> bool {
        match self {
            WriteState::Unmodified => false,
            WriteState::Atomic(stack) => stack.is_independent(),
            WriteState::Cleared | WriteState::Set(_) | WriteState::Unreadable => true,
        }
    }

    /// Value a reader observes, given what storage holds
    pub fn resolve(&self, storage: Option<&Value>) -> Result<Option<Value>> {
        match self {
            WriteState::Unmodified => Ok(storage.cloned()),
            WriteState::Cleared => Ok(None),
            WriteState::Set(v) => Ok(Some(v.clone())),
            WriteState::Atomic(stack) => stack.fold(storage),
            WriteState::Unreadable => Err(Error::AccessedUnreadable),
        }
    }

    /// Value a reader observes when the state is independent
    pub fn resolve_local(&self) -> Result<Option<Value>> {
        self.resolve(None)
    }
}

/// One segment of the write map, clipped to a query range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSegment {
    /// Keys covered
    pub range: KeyRange,
    /// State of those keys
    pub state: WriteState,
}

/// Ordered boundary map of uncommitted writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMap {
    boundaries: BTreeMap<Key, WriteState>,
}

impl Default for WriteMap {
    fn default() -> Self {
        let mut boundaries = BTreeMap::new();
        boundaries.insert(Key::empty(), WriteState::Unmodified);
        WriteMap { boundaries }
    }
}

impl WriteMap {
    /// Create an empty write map
    pub fn new() -> Self {
        Self::default()
    }

    /// True if nothing has been written
    pub fn is_empty(&self) -> bool {
        self.boundaries.len() == 1
    }

    /// Forget every write
    pub fn clear(&mut self) {
        *self = WriteMap::default();
    }

    /// Number of boundaries (segments)
    pub fn segment_count(&self) -> usize {
        self.boundaries.len()
    }

    fn covering(&self, key: &Key) -> Option<(&Key, &WriteState)> {
        self.boundaries
            .range::<Key, _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
    }

    /// Ensure a boundary exists at `key`
    fn split_at(&mut self, key: &Key) {
        if self.boundaries.contains_key(key) {
            return;
        }
        let inherited = match self.covering(key) {
            Some((_, state)) if !state.is_point() => state.clone(),
            _ => WriteState::Unmodified,
        };
        self.boundaries.insert(key.clone(), inherited);
    }

    /// Drop the boundary at `key` if it repeats its predecessor's range state
    fn coalesce_at(&mut self, key: &Key) {
        if key.is_empty() {
            return;
        }
        let Some(state) = self.boundaries.get(key) else {
            return;
        };
        if state.is_point() {
            return;
        }
        let prev = self
            .boundaries
            .range::<Key, _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(_, s)| s);
        if prev == Some(state) {
            self.boundaries.remove(key);
        }
    }

    fn put_point(&mut self, key: &Key, state: WriteState) {
        let after = key.key_after();
        self.split_at(key);
        self.split_at(&after);
        self.boundaries.insert(key.clone(), state);
        self.coalesce_at(&after);
    }

    /// Record `set(key, value)`
    pub fn set(&mut self, key: &Key, value: Value) {
        self.put_point(key, WriteState::Set(value));
    }

    /// Record `set` of a value holding a versionstamp placeholder
    pub fn set_unreadable(&mut self, key: &Key) {
        self.put_point(key, WriteState::Unreadable);
    }

    /// Record `clear(key)`
    pub fn clear_key(&mut self, key: &Key) {
        self.clear_range(&KeyRange::single_key(key.clone()));
    }

    /// Record `clear_range(begin, end)`; empty ranges are ignored
    pub fn clear_range(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }
        self.split_at(&range.begin);
        self.split_at(&range.end);
        let inner: Vec<Key> = self
            .boundaries
            .range::<Key, _>((Bound::Excluded(&range.begin), Bound::Excluded(&range.end)))
            .map(|(k, _)| k.clone())
            .collect();
        for k in inner {
            self.boundaries.remove(&k);
        }
        self.boundaries.insert(range.begin.clone(), WriteState::Cleared);
        self.coalesce_at(&range.end);
        self.coalesce_at(&range.begin);
    }

    /// Record an atomic operator on `key`
    pub fn atomic_op(&mut self, key: &Key, op: MutationType, operand: Value) {
        let next = match self.query_point(key) {
            WriteState::Unmodified => WriteState::Atomic(AtomicStack {
                base: AtomicBase::Storage,
                ops: vec![(op, operand)],
            }),
            WriteState::Cleared => WriteState::Atomic(AtomicStack {
                base: AtomicBase::Known(None),
                ops: vec![(op, operand)],
            }),
            WriteState::Set(v) => WriteState::Atomic(AtomicStack {
                base: AtomicBase::Known(Some(v)),
                ops: vec![(op, operand)],
            }),
            WriteState::Atomic(mut stack) => {
                stack.ops.push((op, operand));
                WriteState::Atomic(stack)
            }
            WriteState::Unreadable => WriteState::Unreadable,
        };
        self.put_point(key, next);
    }

    /// State covering `key`
    pub fn query_point(&self, key: &Key) -> WriteState {
        match self.covering(key) {
            Some((boundary, state)) if !state.is_point() || boundary == key => state.clone(),
            _ => WriteState::Unmodified,
        }
    }

    /// Segments covering `range` in key order, clipped to it
    pub fn query_range<'a>(&'a self, range: &KeyRange) -> impl Iterator<Item = WriteSegment> + 'a {
        let begin = range.begin.clone();
        let end = range.end.clone();
        let start = if range.is_empty() {
            range.begin.clone()
        } else {
            self.covering(&range.begin)
                .map_or_else(Key::empty, |(k, _)| k.clone())
        };
        let upper = if range.is_empty() {
            Bound::Excluded(start.clone())
        } else {
            Bound::Excluded(end.clone())
        };

        let mut iter = self
            .boundaries
            .range::<Key, _>((Bound::Included(start), upper))
            .peekable();

        std::iter::from_fn(move || {
            let (key, state) = iter.next()?;
            let seg_end = match iter.peek() {
                Some((next, _)) => (**next).clone(),
                None => end.clone(),
            };
            let seg_begin = if *key < begin { begin.clone() } else { key.clone() };
            Some(WriteSegment {
                range: KeyRange::new(seg_begin, std::cmp::min(seg_end, end.clone())),
                state: state.clone(),
            })
        })
    }

    /// Check the structural invariants
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> std::result::Result<(), String> {
        if !self.boundaries.contains_key(&Key::empty()) {
            return Err("missing boundary at empty key".into());
        }
        let entries: Vec<_> = self.boundaries.iter().collect();
        for pair in entries.windows(2) {
            let (k0, s0) = pair[0];
            let (k1, s1) = pair[1];
            if s0.is_point() && !k1.is_key_after(k0) {
                return Err(format!("point segment at {} not followed by its successor", k0));
            }
            if !s0.is_point() && s0 == s1 {
                return Err(format!("segments at {} and {} not coalesced", k0, k1));
            }
        }
        if let Some((k, s)) = entries.last() {
            if s.is_point() {
                return Err(format!("point segment at {} is last", k));
            }
        }
        Ok(())
    }
}
