//! Special key space
//!
//! Keys under `\xff\xff` never reach the cluster. Reads are served by modules,
//! each owning a disjoint key range:
//!
//! | Module | Range | Served from |
//! |---|---|---|
//! | read conflict listing | `\xff\xff/transaction/read_conflict_range/` | the session's read conflict set |
//! | write conflict listing | `\xff\xff/transaction/write_conflict_range/` | the session's write conflict set |
//! | registered write modules | chosen at registration | [`SpecialKeyWriteModule::read_range`] overlaid with pending writes |
//!
//! A conflict range `[b, e)` is listed as two rows: `prefix + b -> "1"` and
//! `prefix + e -> "0"`.
//!
//! Writes to write modules are buffered in a [`SpecialKeyWriteMap`] (separate
//! from the regular write map, no conflict ranges) and handed to the module
//! at commit.

use std::fmt;

use rywdb_core::{Error, Key, KeyRange, KeyValue, Result, Value};

use crate::write_map::{WriteMap, WriteState};

/// Prefix of the read conflict range listing
pub const READ_CONFLICT_RANGE_PREFIX: &[u8] = b"\xff\xff/transaction/read_conflict_range/";
/// Prefix of the write conflict range listing
pub const WRITE_CONFLICT_RANGE_PREFIX: &[u8] = b"\xff\xff/transaction/write_conflict_range/";

/// Range of the read conflict range listing
pub fn read_conflict_range_keys() -> KeyRange {
    KeyRange::prefix(READ_CONFLICT_RANGE_PREFIX)
}

/// Range of the write conflict range listing
pub fn write_conflict_range_keys() -> KeyRange {
    KeyRange::prefix(WRITE_CONFLICT_RANGE_PREFIX)
}

/// One buffered change handed to a write module at commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialKeyChange {
    /// Key set to a value
    Set(Key, Value),
    /// Every key in the range cleared
    Clear(KeyRange),
}

/// Administrative state exposed through the special key space
///
/// Implementations receive every change of a committing transaction that
/// falls inside [`SpecialKeyWriteModule::range`].
pub trait SpecialKeyWriteModule: Send + Sync {
    /// Keys owned by this module; must lie inside `\xff\xff`
    fn range(&self) -> KeyRange;

    /// Current rows in `range`, ascending
    fn read_range(&self, _range: &KeyRange) -> Result<Vec<KeyValue>> {
        Ok(Vec::new())
    }

    /// Apply the changes of a committing transaction
    fn commit(&self, changes: &[SpecialKeyChange]) -> Result<()>;
}

impl fmt::Debug for dyn SpecialKeyWriteModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecialKeyWriteModule")
            .field("range", &self.range())
            .finish()
    }
}

/// Pending special key writes
///
/// Each key reads as `(present, value)`: `present` is false for keys the
/// transaction never touched, and `value` is `None` for cleared keys.
#[derive(Debug, Clone, Default)]
pub struct SpecialKeyWriteMap {
    writes: WriteMap,
}

impl SpecialKeyWriteMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// True if nothing was written
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Record a set
    pub fn set(&mut self, key: &Key, value: Value) {
        self.writes.set(key, value);
    }

    /// Record a range clear
    pub fn clear(&mut self, range: &KeyRange) {
        self.writes.clear_range(range);
    }

    /// `(present, value)` for `key`
    pub fn get(&self, key: &Key) -> (bool, Option<Value>) {
        match self.writes.query_point(key) {
            WriteState::Set(v) => (true, Some(v)),
            WriteState::Cleared => (true, None),
            _ => (false, None),
        }
    }

    /// Changes inside `range`, in key order
    pub fn changes(&self, range: &KeyRange) -> Vec<SpecialKeyChange> {
        self.writes
            .query_range(range)
            .filter_map(|segment| match segment.state {
                WriteState::Set(v) => Some(SpecialKeyChange::Set(segment.range.begin, v)),
                WriteState::Cleared => Some(SpecialKeyChange::Clear(segment.range)),
                _ => None,
            })
            .collect()
    }

    /// Overlay pending writes on `base` rows of `range`, ascending
    pub fn overlay(&self, range: &KeyRange, base: Vec<KeyValue>) -> Vec<KeyValue> {
        let mut out: Vec<KeyValue> = base
            .into_iter()
            .filter(|kv| range.contains(&kv.key) && !self.get(&kv.key).0)
            .collect();
        out.extend(self.changes(range).into_iter().filter_map(|c| match c {
            SpecialKeyChange::Set(k, v) => Some(KeyValue::new(k, v)),
            SpecialKeyChange::Clear(_) => None,
        }));
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Forget every pending write
    pub fn clear_all(&mut self) {
        self.writes.clear();
    }
}

/// Rows listing `ranges` under `prefix`, restricted to `within`
pub fn conflict_range_listing(prefix: &[u8], ranges: &[KeyRange], within: &KeyRange) -> Vec<KeyValue> {
    let mut rows = Vec::with_capacity(ranges.len() * 2);
    for range in ranges {
        rows.push(KeyValue::new(range.begin.with_prefix(prefix), "1"));
        rows.push(KeyValue::new(range.end.with_prefix(prefix), "0"));
    }
    rows.retain(|kv| within.contains(&kv.key));
    rows
}

/// Which module serves a special key range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialModule {
    /// Read conflict range listing
    ReadConflicts,
    /// Write conflict range listing
    WriteConflicts,
    /// Registered write module, by index
    Write(usize),
}

/// Module ranges known to a session
#[derive(Debug, Clone, Default)]
pub struct SpecialKeyRouter {
    modules: Vec<(KeyRange, SpecialModule)>,
}

impl SpecialKeyRouter {
    /// Router for the built-in listings plus `write_ranges` (indexed in order)
    pub fn new(write_ranges: impl IntoIterator<Item = KeyRange>) -> Self {
        let mut modules = vec![
            (read_conflict_range_keys(), SpecialModule::ReadConflicts),
            (write_conflict_range_keys(), SpecialModule::WriteConflicts),
        ];
        modules.extend(
            write_ranges
                .into_iter()
                .enumerate()
                .map(|(i, r)| (r, SpecialModule::Write(i))),
        );
        modules.sort_by(|a, b| a.0.begin.cmp(&b.0.begin));
        SpecialKeyRouter { modules }
    }

    /// Module owning `key`
    pub fn module_for_key(&self, key: &Key) -> Option<(KeyRange, SpecialModule)> {
        self.modules
            .iter()
            .find(|(range, _)| range.contains(key))
            .cloned()
    }

    /// Write module owning `key`
    pub fn write_module_for_key(&self, key: &Key) -> Result<usize> {
        match self.module_for_key(key) {
            Some((_, SpecialModule::Write(i))) => Ok(i),
            _ => Err(Error::SpecialKeysNoWriteModuleFound(key.to_string())),
        }
    }

    /// Write module owning all of `range`
    pub fn write_module_for_range(&self, range: &KeyRange) -> Result<usize> {
        match self.module_for_key(&range.begin) {
            Some((owned, SpecialModule::Write(i))) if range.end <= owned.end => Ok(i),
            _ => Err(Error::SpecialKeysNoWriteModuleFound(range.to_string())),
        }
    }

    /// Modules intersecting `range`, each with the clipped sub-range
    ///
    /// Fails with `SpecialKeysNoModuleFound` when nothing intersects and with
    /// `SpecialKeysCrossModuleRead` when more than one module does and
    /// `relaxed` is off.
    pub fn route_range(
        &self,
        range: &KeyRange,
        relaxed: bool,
    ) -> Result<Vec<(KeyRange, SpecialModule)>> {
        let hits: Vec<_> = self
            .modules
            .iter()
            .filter_map(|(owned, module)| owned.intersection(range).map(|r| (r, *module)))
            .collect();
        match hits.len() {
            0 => Err(Error::SpecialKeysNoModuleFound),
            1 => Ok(hits),
            _ if relaxed => Ok(hits),
            _ => Err(Error::SpecialKeysCrossModuleRead),
        }
    }

    /// Validate that `range` can host a new write module
    pub fn check_registration(&self, range: &KeyRange) -> Result<()> {
        if range.is_empty() || !rywdb_core::special_keys().contains_range(range) {
            return Err(Error::ClientInvalidOperation(format!(
                "special key module range {} must be a non-empty range inside the special key space",
                range
            )));
        }
        if let Some((owned, _)) = self.modules.iter().find(|(owned, _)| owned.intersects(range)) {
            return Err(Error::ClientInvalidOperation(format!(
                "special key module range {} overlaps {}",
                range, owned
            )));
        }
        Ok(())
    }
}
