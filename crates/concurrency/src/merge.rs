//! Read-merge algorithm
//!
//! Reconciles three sources into the view a transaction reads:
//!
//! ```text
//! write map   -> what this transaction wrote        (wins)
//! cache       -> what storage returned earlier      (no remote trip)
//! remote      -> what storage returns now           (fills gaps, then cached)
//! ```
//!
//! A range read walks the write map's segments in iteration order. Cleared
//! segments contribute nothing, point segments contribute their resolved
//! value, and unmodified segments alternate between known cache intervals and
//! gaps fetched from storage. Every fetch lands in the cache first and rows are
//! emitted from the cache, so a key is fetched at most once per attempt.
//!
//! # Design Notes
//!
//! - **Storage is abstract**: [`StorageView`] hides the native handle, the
//!   read version and the attempt checks, so the walk is testable in isolation.
//! - **Limits drive fetching**: gaps are fetched with the remaining row and
//!   byte budget (widened by read-ahead), and the walk stops once limits are met.
//! - **Selectors resolve on the merged view**: a forward selector is a forward
//!   read of `offset` rows, a backward selector a reverse read of `1 - offset`.

use async_trait::async_trait;
use rywdb_core::{Key, KeyRange, KeySelector, KeyValue, RangeLimits, RangeResult, Result, Value};

use crate::snapshot_cache::CacheLookup;
use crate::write_map::{WriteMap, WriteSegment, WriteState};

/// Minimum rows requested per remote fetch when read-ahead is enabled
pub const READ_AHEAD_ROWS: usize = 100;
/// Minimum bytes requested per remote fetch when read-ahead is enabled
pub const READ_AHEAD_BYTES: usize = 80_000;

/// Storage side of a merged read
///
/// Implementations own the snapshot cache. `fetch_point` and `fetch_range`
/// must record what they return in the cache before returning. A
/// `fetch_range` result that is cut short before its first row proves
/// nothing and ends the walk with `more` set.
#[async_trait]
pub trait StorageView: Send + Sync {
    /// Cached storage state of one key
    fn lookup(&self, key: &Key) -> Result<CacheLookup>;

    /// Known (`true`) and unknown (`false`) sub-ranges of `range`, ascending
    fn cached_parts(&self, range: &KeyRange) -> Result<Vec<(KeyRange, bool)>>;

    /// Cached rows of a known range, ascending
    fn cached_rows(&self, range: &KeyRange) -> Result<Vec<KeyValue>>;

    /// Fetch one key from storage and cache it
    async fn fetch_point(&self, key: &Key) -> Result<Option<Value>>;

    /// Fetch rows of a gap from storage and cache the interval they prove
    async fn fetch_range(
        &self,
        range: &KeyRange,
        limits: RangeLimits,
        reverse: bool,
    ) -> Result<RangeResult>;
}

/// Interval of `gap` that a fetch returning `result` proves complete
///
/// All of `gap` when the fetch was not cut short; otherwise the part up to
/// (forward) or down to (reverse) the last returned row, which is empty when
/// no row came back.
pub fn fetched_interval(gap: &KeyRange, result: &RangeResult, reverse: bool) -> KeyRange {
    if !result.more {
        return gap.clone();
    }
    match (result.last(), reverse) {
        (Some(last), true) => KeyRange::new(last.key.clone(), gap.end.clone()),
        (Some(last), false) => KeyRange::new(gap.begin.clone(), last.key.key_after()),
        (None, true) => KeyRange::new(gap.end.clone(), gap.end.clone()),
        (None, false) => KeyRange::new(gap.begin.clone(), gap.begin.clone()),
    }
}

/// A resolved key selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    /// Key the selector landed on
    pub key: Key,
    /// Keys examined to find it
    pub scanned: KeyRange,
}

/// Write map layered over a storage view
pub struct MergedView<'a, S> {
    source: &'a S,
    writes: &'a WriteMap,
    read_ahead: bool,
}

impl<'a, S: StorageView> MergedView<'a, S> {
    /// Merge `writes` over `source`
    pub fn new(source: &'a S, writes: &'a WriteMap) -> Self {
        MergedView {
            source,
            writes,
            read_ahead: true,
        }
    }

    /// Fetch only what each read returns
    pub fn without_read_ahead(mut self) -> Self {
        self.read_ahead = false;
        self
    }

    /// Value of `key` as this transaction sees it
    pub async fn get(&self, key: &Key) -> Result<Option<Value>> {
        let state = self.writes.query_point(key);
        if state.is_independent() {
            return state.resolve_local();
        }
        let stored = self.storage_value(key).await?;
        state.resolve(stored.as_ref())
    }

    async fn storage_value(&self, key: &Key) -> Result<Option<Value>> {
        match self.source.lookup(key)? {
            CacheLookup::Present(v) => Ok(Some(v)),
            CacheLookup::Absent => Ok(None),
            CacheLookup::Miss => self.source.fetch_point(key).await,
        }
    }

    /// Rows of the literal `range` as this transaction sees them
    pub async fn get_range(
        &self,
        range: &KeyRange,
        limits: RangeLimits,
        reverse: bool,
    ) -> Result<RangeResult> {
        let mut out = Vec::new();
        if range.is_empty() {
            return Ok(RangeResult::new(out, false));
        }
        let mut limits = limits;
        let mut segments: Vec<WriteSegment> = self.writes.query_range(range).collect();
        if reverse {
            segments.reverse();
        }

        let mut finished = true;
        for segment in segments {
            if limits.is_reached() {
                finished = false;
                break;
            }
            match segment.state {
                WriteState::Cleared => {}
                WriteState::Unmodified => {
                    if !self
                        .read_storage(segment.range, &mut limits, reverse, &mut out)
                        .await?
                    {
                        finished = false;
                        break;
                    }
                }
                state => {
                    let key = segment.range.begin;
                    let value = if state.is_independent() {
                        state.resolve_local()?
                    } else {
                        let stored = self.storage_value(&key).await?;
                        state.resolve(stored.as_ref())?
                    };
                    if let Some(value) = value {
                        let kv = KeyValue::new(key, value);
                        limits.decrement(&kv);
                        out.push(kv);
                    }
                }
            }
        }
        Ok(RangeResult::new(out, !finished))
    }

    /// Emit storage rows of an unmodified range; false if limits stopped the walk inside it
    async fn read_storage(
        &self,
        range: KeyRange,
        limits: &mut RangeLimits,
        reverse: bool,
        out: &mut Vec<KeyValue>,
    ) -> Result<bool> {
        let mut remaining = range;
        while !remaining.is_empty() {
            let parts = self.source.cached_parts(&remaining)?;
            let next = if reverse { parts.last() } else { parts.first() };
            let Some((part, known)) = next.cloned() else {
                break;
            };

            if !known {
                if limits.is_reached() {
                    return Ok(false);
                }
                let fetched = self
                    .source
                    .fetch_range(&part, self.fetch_limits(limits), reverse)
                    .await?;
                if fetched.more && fetched.is_empty() {
                    return Ok(false);
                }
                continue;
            }

            let mut rows = self.source.cached_rows(&part)?;
            if reverse {
                rows.reverse();
            }
            for kv in rows {
                if limits.is_reached() {
                    return Ok(false);
                }
                limits.decrement(&kv);
                out.push(kv);
            }
            if reverse {
                remaining.end = part.begin;
            } else {
                remaining.begin = part.end;
            }
        }
        Ok(true)
    }

    fn fetch_limits(&self, remaining: &RangeLimits) -> RangeLimits {
        if !self.read_ahead {
            return *remaining;
        }
        RangeLimits {
            rows: remaining.rows.map(|r| r.max(READ_AHEAD_ROWS)),
            bytes: remaining.bytes.map(|b| b.max(READ_AHEAD_BYTES)),
        }
    }

    /// Resolve `selector` against the merged view
    ///
    /// Resolution past the last key clamps to `max_key`; before the first key
    /// it clamps to the empty key.
    pub async fn resolve(&self, selector: &KeySelector, max_key: &Key) -> Result<ResolvedKey> {
        let anchor = std::cmp::min(selector.forward_start(), max_key.clone());

        if selector.is_forward() {
            let wanted = selector.offset as usize;
            let range = KeyRange::new(anchor.clone(), max_key.clone());
            let found = self.get_range(&range, RangeLimits::rows(wanted), false).await?;
            return Ok(match found.kvs.get(wanted - 1) {
                Some(kv) => ResolvedKey {
                    key: kv.key.clone(),
                    scanned: KeyRange::new(anchor, kv.key.key_after()),
                },
                None => ResolvedKey {
                    key: max_key.clone(),
                    scanned: range,
                },
            });
        }

        let wanted = (1 - i64::from(selector.offset)) as usize;
        let range = KeyRange::new(Key::empty(), anchor.clone());
        let found = self.get_range(&range, RangeLimits::rows(wanted), true).await?;
        Ok(match found.kvs.get(wanted - 1) {
            Some(kv) => ResolvedKey {
                key: kv.key.clone(),
                scanned: KeyRange::new(kv.key.clone(), anchor),
            },
            None => ResolvedKey {
                key: Key::empty(),
                scanned: range,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot_cache::SnapshotCache;
    use parking_lot::Mutex;
    use rywdb_core::{Error, MutationType};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeStorage {
        rows: BTreeMap<Key, Value>,
        cache: Mutex<SnapshotCache>,
        fetches: AtomicUsize,
    }

    impl FakeStorage {
        fn new(rows: &[(&str, &str)]) -> Self {
            FakeStorage {
                rows: rows
                    .iter()
                    .map(|(k, v)| (Key::from(*k), Value::from(*v)))
                    .collect(),
                cache: Mutex::new(SnapshotCache::new()),
                fetches: AtomicUsize::new(0),
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StorageView for FakeStorage {
        fn lookup(&self, key: &Key) -> Result<CacheLookup> {
            Ok(self.cache.lock().lookup(key))
        }

        fn cached_parts(&self, range: &KeyRange) -> Result<Vec<(KeyRange, bool)>> {
            Ok(self.cache.lock().lookup_range(range))
        }

        fn cached_rows(&self, range: &KeyRange) -> Result<Vec<KeyValue>> {
            Ok(self.cache.lock().rows(range))
        }

        async fn fetch_point(&self, key: &Key) -> Result<Option<Value>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let value = self.rows.get(key).cloned();
            self.cache.lock().insert(key.clone(), value.clone());
            Ok(value)
        }

        async fn fetch_range(
            &self,
            range: &KeyRange,
            limits: RangeLimits,
            reverse: bool,
        ) -> Result<RangeResult> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut rows: Vec<KeyValue> = self
                .rows
                .range(range.begin.clone()..range.end.clone())
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
                .collect();
            if reverse {
                rows.reverse();
            }
            let mut limits = limits;
            let mut out = Vec::new();
            let mut more = false;
            for kv in rows {
                if limits.is_reached() {
                    more = true;
                    break;
                }
                limits.decrement(&kv);
                out.push(kv);
            }
            let result = RangeResult::new(out, more);
            let known = fetched_interval(range, &result, reverse);
            self.cache.lock().insert_range(known, &result.kvs);
            Ok(result)
        }
    }

    fn keys(result: &RangeResult) -> Vec<String> {
        result
            .iter()
            .map(|kv| String::from_utf8_lossy(kv.key.as_bytes()).into_owned())
            .collect()
    }

    fn all() -> KeyRange {
        KeyRange::new("", "z")
    }

    #[tokio::test]
    async fn test_local_set_shadows_storage() {
        let storage = FakeStorage::new(&[("a", "remote")]);
        let mut writes = WriteMap::new();
        writes.set(&Key::from("a"), Value::from("local"));
        let view = MergedView::new(&storage, &writes);

        assert_eq!(view.get(&Key::from("a")).await.unwrap(), Some(Value::from("local")));
        assert_eq!(storage.fetches(), 0);
    }

    #[tokio::test]
    async fn test_cleared_range_hides_cached_rows() {
        let storage = FakeStorage::new(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let empty = WriteMap::new();
        let before = MergedView::new(&storage, &empty)
            .get_range(&all(), RangeLimits::unlimited(), false)
            .await
            .unwrap();
        assert_eq!(keys(&before), vec!["a", "b", "c"]);

        let mut writes = WriteMap::new();
        writes.clear_range(&KeyRange::new("a", "c"));
        let after = MergedView::new(&storage, &writes)
            .get_range(&all(), RangeLimits::unlimited(), false)
            .await
            .unwrap();
        assert_eq!(keys(&after), vec!["c"]);
        assert_eq!(storage.fetches(), 1);
    }

    #[tokio::test]
    async fn test_atomic_folds_over_storage_value() {
        let storage = FakeStorage::new(&[]);
        let mut rows = BTreeMap::new();
        rows.insert(Key::from("n"), Value::from(5u64.to_le_bytes()));
        let storage = FakeStorage { rows, ..storage };

        let mut writes = WriteMap::new();
        writes.atomic_op(&Key::from("n"), MutationType::AddValue, Value::from(1u64.to_le_bytes()));
        let view = MergedView::new(&storage, &writes);

        assert_eq!(
            view.get(&Key::from("n")).await.unwrap(),
            Some(Value::from(6u64.to_le_bytes()))
        );
        let ranged = view.get_range(&all(), RangeLimits::unlimited(), false).await.unwrap();
        assert_eq!(ranged.kvs[0].value, Value::from(6u64.to_le_bytes()));
    }

    #[tokio::test]
    async fn test_unreadable_key_fails_reads() {
        let storage = FakeStorage::new(&[]);
        let mut writes = WriteMap::new();
        writes.set_unreadable(&Key::from("v"));
        let view = MergedView::new(&storage, &writes);

        assert_eq!(view.get(&Key::from("v")).await, Err(Error::AccessedUnreadable));
        assert_eq!(
            view.get_range(&all(), RangeLimits::unlimited(), false).await,
            Err(Error::AccessedUnreadable)
        );
    }

    #[tokio::test]
    async fn test_limits_and_reverse() {
        let storage = FakeStorage::new(&[("a", "1"), ("c", "3"), ("e", "5")]);
        let mut writes = WriteMap::new();
        writes.set(&Key::from("b"), Value::from("2"));
        writes.set(&Key::from("d"), Value::from("4"));
        let view = MergedView::new(&storage, &writes).without_read_ahead();

        let forward = view.get_range(&all(), RangeLimits::rows(3), false).await.unwrap();
        assert_eq!(keys(&forward), vec!["a", "b", "c"]);
        assert!(forward.more);

        let backward = view.get_range(&all(), RangeLimits::rows(2), true).await.unwrap();
        assert_eq!(keys(&backward), vec!["e", "d"]);
        assert!(backward.more);

        let everything = view.get_range(&all(), RangeLimits::unlimited(), true).await.unwrap();
        assert_eq!(keys(&everything), vec!["e", "d", "c", "b", "a"]);
        assert!(!everything.more);
    }

    #[tokio::test]
    async fn test_repeated_reads_served_from_cache() {
        let storage = FakeStorage::new(&[("a", "1"), ("b", "2")]);
        let writes = WriteMap::new();
        let view = MergedView::new(&storage, &writes);

        view.get_range(&all(), RangeLimits::unlimited(), false).await.unwrap();
        view.get_range(&all(), RangeLimits::unlimited(), true).await.unwrap();
        view.get(&Key::from("a")).await.unwrap();
        view.get(&Key::from("missing")).await.unwrap();
        assert_eq!(storage.fetches(), 1);
    }

    #[tokio::test]
    async fn test_selectors_see_local_writes() {
        let storage = FakeStorage::new(&[("b", "1"), ("d", "2")]);
        let mut writes = WriteMap::new();
        writes.set(&Key::from("c"), Value::from("local"));
        writes.clear_key(&Key::from("d"));
        let view = MergedView::new(&storage, &writes);
        let max = Key::from(&b"\xff"[..]);

        let after_b = view
            .resolve(&KeySelector::first_greater_than("b"), &max)
            .await
            .unwrap();
        assert_eq!(after_b.key, Key::from("c"));

        let before_z = view
            .resolve(&KeySelector::last_less_than("z"), &max)
            .await
            .unwrap();
        assert_eq!(before_z.key, Key::from("c"));

        let past_end = view
            .resolve(&KeySelector::first_greater_than("c"), &max)
            .await
            .unwrap();
        assert_eq!(past_end.key, max);

        let before_start = view
            .resolve(&KeySelector::last_less_than("b"), &max)
            .await
            .unwrap();
        assert_eq!(before_start.key, Key::empty());
    }

    #[test]
    fn test_fetched_interval() {
        let gap = KeyRange::new("a", "z");
        let cut = RangeResult::new(vec![KeyValue::new("f", "1")], true);
        assert_eq!(fetched_interval(&gap, &cut, false), KeyRange::new("a", "f\x00"));
        assert_eq!(fetched_interval(&gap, &cut, true), KeyRange::new("f", "z"));
        let whole = RangeResult::new(vec![KeyValue::new("f", "1")], false);
        assert_eq!(fetched_interval(&gap, &whole, false), gap);
        let nothing = RangeResult::new(Vec::new(), true);
        assert!(fetched_interval(&gap, &nothing, false).is_empty());
        assert!(fetched_interval(&gap, &nothing, true).is_empty());
    }

    /// Storage whose range fetches come back cut short with no rows
    struct StalledStorage {
        cache: Mutex<SnapshotCache>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl StorageView for StalledStorage {
        fn lookup(&self, key: &Key) -> Result<CacheLookup> {
            Ok(self.cache.lock().lookup(key))
        }

        fn cached_parts(&self, range: &KeyRange) -> Result<Vec<(KeyRange, bool)>> {
            Ok(self.cache.lock().lookup_range(range))
        }

        fn cached_rows(&self, range: &KeyRange) -> Result<Vec<KeyValue>> {
            Ok(self.cache.lock().rows(range))
        }

        async fn fetch_point(&self, _key: &Key) -> Result<Option<Value>> {
            Ok(None)
        }

        async fn fetch_range(
            &self,
            range: &KeyRange,
            _limits: RangeLimits,
            reverse: bool,
        ) -> Result<RangeResult> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let result = RangeResult::new(Vec::new(), true);
            let known = fetched_interval(range, &result, reverse);
            self.cache.lock().insert_range(known, &result.kvs);
            Ok(result)
        }
    }

    #[tokio::test]
    async fn test_empty_partial_fetch_leaves_gap_unknown() {
        let storage = StalledStorage {
            cache: Mutex::new(SnapshotCache::new()),
            fetches: AtomicUsize::new(0),
        };
        let writes = WriteMap::new();
        let result = MergedView::new(&storage, &writes)
            .get_range(&all(), RangeLimits::unlimited(), false)
            .await
            .unwrap();

        assert!(result.is_empty());
        assert!(result.more);
        assert_eq!(storage.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(storage.cache.lock().lookup(&Key::from("m")), CacheLookup::Miss);
    }
}
