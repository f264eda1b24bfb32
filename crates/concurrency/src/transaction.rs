//! Read-your-writes transaction
//!
//! [`ReadYourWritesTransaction`] layers local write visibility, a snapshot
//! read cache and conflict tracking over a [`NativeTransaction`].
//!
//! ## Lifecycle
//!
//! ```text
//! Idle <-> Reading
//!   |
//!   v
//! Committing --> Committed
//!   |
//!   v
//! Failed(error) --reset / on_error--> Idle
//! ```
//!
//! # Design Notes
//!
//! - **Shared session state**: every method takes `&self`. Attempt state lives
//!   behind a `parking_lot::Mutex` that is never held across an await.
//! - **Attempt generations**: reset, cancel and timeout bump a generation and
//!   broadcast it on a `tokio::sync::watch` channel. In-flight operations race
//!   against that signal, and a read finishing under an older generation never
//!   touches the cache.
//! - **Copy-on-write write map**: reads capture an `Arc` of the write map at
//!   issue time; writes go through `Arc::make_mut`.
//! - **Deferred errors**: background failures (timeout, cancel, use during
//!   commit, non-retryable remote read errors) land in a slot checked first by
//!   every call.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use rywdb_core::limits::SPECIAL_KEYS_END;
use rywdb_core::mutation::{versionstamp_key_prefix, versionstamp_offset};
use rywdb_core::{
    is_special_key, CommitRequest, Error, Key, KeyRange, KeySelector, KeyValue, Limits, Mutation,
    MutationType, NativeTransaction, RangeLimits, RangeResult, Result, Value, Version,
    Versionstamp, CONFLICT_RANGE_OVERHEAD, MUTATION_OVERHEAD,
};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::conflict::RangeSet;
use crate::merge::{fetched_interval, MergedView, StorageView};
use crate::options::{TransactionOption, TransactionOptions};
use crate::retry::RetryPolicy;
use crate::snapshot_cache::{CacheLookup, SnapshotCache};
use crate::special_keys::{
    conflict_range_listing, SpecialKeyChange, SpecialKeyRouter, SpecialKeyWriteMap,
    SpecialKeyWriteModule, SpecialModule, READ_CONFLICT_RANGE_PREFIX, WRITE_CONFLICT_RANGE_PREFIX,
};
use crate::write_map::WriteMap;

/// Prefix of the keys `make_self_conflicting` claims
const SELF_CONFLICT_PREFIX: &[u8] = b"\xff/SC/";

/// Settings a session inherits from its database
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionConfig {
    pub(crate) limits: Limits,
    pub(crate) retry: RetryPolicy,
    pub(crate) base_options: TransactionOptions,
    pub(crate) modules: Vec<Arc<dyn SpecialKeyWriteModule>>,
}

/// Counter of in-flight reads
#[derive(Debug, Default)]
struct PendingReads {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingReads {
    fn start(&self) -> PendingReadGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        PendingReadGuard { reads: self }
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct PendingReadGuard<'a> {
    reads: &'a PendingReads,
}

impl Drop for PendingReadGuard<'_> {
    fn drop(&mut self) {
        if self.reads.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.reads.idle.notify_waiters();
        }
    }
}

/// A watch registered before commit
struct PendingWatch {
    key: Key,
    tx: oneshot::Sender<Result<()>>,
}

type VersionstampSlot = watch::Sender<Option<Result<Versionstamp>>>;

/// Attempt-scoped state plus the counters that survive retries
struct SessionState {
    writes: Arc<WriteMap>,
    cache: SnapshotCache,
    read_conflicts: RangeSet,
    write_conflicts: RangeSet,
    native_read_ranges: RangeSet,
    special_writes: SpecialKeyWriteMap,
    mutations: Vec<Mutation>,
    approximate_size: usize,
    read_version: Option<Version>,
    retries: u32,
    created_at: Instant,
    commit_started: bool,
    committed_version: Option<Version>,
    versionstamp: VersionstampSlot,
    deferred: Option<Error>,
    options: TransactionOptions,
    persistent: TransactionOptions,
    generation: u64,
    watches: Vec<PendingWatch>,
    touched: bool,
}

impl SessionState {
    fn new(options: TransactionOptions) -> Self {
        SessionState {
            writes: Arc::new(WriteMap::new()),
            cache: SnapshotCache::new(),
            read_conflicts: RangeSet::new(),
            write_conflicts: RangeSet::new(),
            native_read_ranges: RangeSet::new(),
            special_writes: SpecialKeyWriteMap::new(),
            mutations: Vec::new(),
            approximate_size: 0,
            read_version: None,
            retries: 0,
            created_at: Instant::now(),
            commit_started: false,
            committed_version: None,
            versionstamp: watch::channel(None).0,
            deferred: None,
            persistent: options.clone(),
            options,
            generation: 0,
            watches: Vec::new(),
            touched: false,
        }
    }

    fn abort_reason(&self) -> Error {
        self.deferred.clone().unwrap_or(Error::TransactionCancelled)
    }

    fn all_read_conflicts(&self) -> RangeSet {
        let mut all = self.read_conflicts.clone();
        for range in self.native_read_ranges.iter() {
            all.insert(range);
        }
        all
    }

    fn fail_versionstamp(&mut self, error: &Error) {
        self.versionstamp.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(Err(error.clone()));
                true
            } else {
                false
            }
        });
    }

    fn fail_watches(&mut self, error: &Error) {
        for watch in self.watches.drain(..) {
            let _ = watch.tx.send(Err(error.clone()));
        }
    }

    fn fail_pending(&mut self, error: &Error) {
        self.fail_versionstamp(error);
        self.fail_watches(error);
    }
}

/// State shared with in-flight operations and the timeout watchdog
struct Shared {
    state: Mutex<SessionState>,
    abort: watch::Sender<u64>,
    reads: PendingReads,
}

impl Shared {
    fn abort_reason(&self) -> Error {
        self.state.lock().abort_reason()
    }

    /// Abandon every operation of the current attempt
    fn bump_generation(&self, state: &mut SessionState) {
        state.generation += 1;
        self.abort.send_replace(state.generation);
    }

    fn time_out(&self, state: &mut SessionState) {
        warn!(
            timeout_ms = state.options.timeout.map_or(0, |t| t.as_millis() as u64),
            retries = state.retries,
            "Transaction timed out"
        );
        state.deferred = Some(Error::TransactionTimedOut);
        self.bump_generation(state);
    }

    /// Deferred error and deadline checks shared by every call
    fn check_usable(&self, state: &mut SessionState) -> Result<()> {
        if let Some(err) = &state.deferred {
            return Err(err.clone());
        }
        if let Some(timeout) = state.options.timeout {
            if state.created_at.elapsed() >= timeout {
                self.time_out(state);
                return Err(Error::TransactionTimedOut);
            }
        }
        Ok(())
    }

    /// Park non-retryable remote read failures in the deferred slot
    fn remote_failure(&self, generation: u64, error: Error) -> Error {
        if error.is_retryable()
            || matches!(
                error,
                Error::TransactionCancelled | Error::TransactionTimedOut
            )
        {
            return error;
        }
        let mut state = self.state.lock();
        if state.generation == generation && state.deferred.is_none() {
            debug!(error = %error, "Remote read failed");
            state.deferred = Some(error.clone());
        }
        error
    }
}

/// Storage as seen by one attempt: native reads at a fixed version, cached in the session
struct AttemptView<'a, N> {
    native: &'a N,
    shared: &'a Shared,
    generation: u64,
    version: Version,
}

impl<N> AttemptView<'_, N> {
    fn with_state<T>(&self, f: impl FnOnce(&mut SessionState) -> T) -> Result<T> {
        let mut state = self.shared.state.lock();
        if state.generation != self.generation {
            return Err(state.abort_reason());
        }
        Ok(f(&mut state))
    }
}

#[async_trait]
impl<N: NativeTransaction> StorageView for AttemptView<'_, N> {
    fn lookup(&self, key: &Key) -> Result<CacheLookup> {
        self.with_state(|s| s.cache.lookup(key))
    }

    fn cached_parts(&self, range: &KeyRange) -> Result<Vec<(KeyRange, bool)>> {
        self.with_state(|s| s.cache.lookup_range(range))
    }

    fn cached_rows(&self, range: &KeyRange) -> Result<Vec<KeyValue>> {
        self.with_state(|s| s.cache.rows(range))
    }

    async fn fetch_point(&self, key: &Key) -> Result<Option<Value>> {
        trace!(%key, version = self.version, "Fetching key");
        let value = self
            .native
            .get(key, self.version)
            .await
            .map_err(|e| self.shared.remote_failure(self.generation, e))?;
        self.with_state(|s| s.cache.insert(key.clone(), value.clone()))?;
        Ok(value)
    }

    async fn fetch_range(
        &self,
        range: &KeyRange,
        limits: RangeLimits,
        reverse: bool,
    ) -> Result<RangeResult> {
        trace!(%range, version = self.version, reverse, "Fetching range");
        let result = self
            .native
            .get_range(
                &KeySelector::first_greater_or_equal(range.begin.clone()),
                &KeySelector::first_greater_or_equal(range.end.clone()),
                limits,
                self.version,
                reverse,
            )
            .await
            .map_err(|e| self.shared.remote_failure(self.generation, e))?;
        let known = fetched_interval(range, &result, reverse);
        self.with_state(|s| s.cache.insert_range(known, &result.kvs))?;
        Ok(result)
    }
}

/// Transaction whose reads see its own uncommitted writes
///
/// # Example
/// ```ignore
/// let tr = db.create_transaction();
/// tr.set("k", "v")?;
/// assert_eq!(tr.get("k", false).await?, Some(Value::from("v")));
/// tr.commit().await?;
/// ```
pub struct ReadYourWritesTransaction<N: NativeTransaction> {
    native: Arc<N>,
    shared: Arc<Shared>,
    config: SessionConfig,
    router: SpecialKeyRouter,
    no_writes: Arc<WriteMap>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl<N: NativeTransaction + 'static> ReadYourWritesTransaction<N> {
    /// Wrap `native` with default options and no special key modules
    pub fn new(native: N) -> Self {
        Self::with_config(native, SessionConfig::default())
    }

    pub(crate) fn with_config(native: N, config: SessionConfig) -> Self {
        let router = SpecialKeyRouter::new(config.modules.iter().map(|m| m.range()));
        let shared = Shared {
            state: Mutex::new(SessionState::new(config.base_options.clone())),
            abort: watch::channel(0).0,
            reads: PendingReads::default(),
        };
        let tr = ReadYourWritesTransaction {
            native: Arc::new(native),
            shared: Arc::new(shared),
            config,
            router,
            no_writes: Arc::new(WriteMap::new()),
            watchdog: Mutex::new(None),
        };
        tr.arm_watchdog();
        tr
    }

    /// Size limits enforced by this transaction
    pub fn limits(&self) -> &Limits {
        &self.config.limits
    }

    // ------------------------------------------------------------------
    // Attempt plumbing
    // ------------------------------------------------------------------

    fn begin_read(&self, state: &mut SessionState) -> Result<()> {
        self.shared.check_usable(state)?;
        if state.commit_started {
            return Err(Error::UsedDuringCommit);
        }
        state.touched = true;
        Ok(())
    }

    /// Returns false when the write must be ignored
    fn begin_write(&self, state: &mut SessionState) -> Result<bool> {
        self.shared.check_usable(state)?;
        if state.commit_started {
            if state.options.used_during_commit_protection_disabled {
                return Ok(false);
            }
            state.deferred = Some(Error::UsedDuringCommit);
            self.shared.bump_generation(state);
            return Err(Error::UsedDuringCommit);
        }
        state.touched = true;
        Ok(true)
    }

    fn visible_writes(&self, state: &SessionState, snapshot: bool) -> Arc<WriteMap> {
        if state.options.reads_see_writes(snapshot) {
            Arc::clone(&state.writes)
        } else {
            Arc::clone(&self.no_writes)
        }
    }

    fn attempt_view(&self, generation: u64, version: Version) -> AttemptView<'_, N> {
        AttemptView {
            native: &self.native,
            shared: &self.shared,
            generation,
            version,
        }
    }

    /// Run `op` as a read of attempt `generation`
    async fn guarded<T>(&self, generation: u64, op: impl Future<Output = Result<T>>) -> Result<T> {
        let _pending = self.shared.reads.start();
        self.abortable(generation, op).await
    }

    /// Run `op` until it finishes or the attempt is abandoned
    async fn abortable<T>(&self, generation: u64, op: impl Future<Output = Result<T>>) -> Result<T> {
        let mut abort = self.shared.abort.subscribe();
        if *abort.borrow_and_update() != generation {
            return Err(self.shared.abort_reason());
        }
        tokio::select! {
            biased;
            _ = abort.changed() => Err(self.shared.abort_reason()),
            out = op => out,
        }
    }

    async fn read_version_at(&self, generation: u64) -> Result<Version> {
        {
            let state = self.shared.state.lock();
            if state.generation != generation {
                return Err(state.abort_reason());
            }
            if let Some(version) = state.read_version {
                return Ok(version);
            }
        }
        let version = self
            .native
            .get_read_version()
            .await
            .map_err(|e| self.shared.remote_failure(generation, e))?;
        let mut state = self.shared.state.lock();
        if state.generation != generation {
            return Err(state.abort_reason());
        }
        Ok(*state.read_version.get_or_insert(version))
    }

    fn add_read_conflicts(&self, generation: u64, ranges: Vec<KeyRange>, native: bool) {
        let mut state = self.shared.state.lock();
        if state.generation != generation {
            return;
        }
        for range in ranges {
            if native {
                state.native_read_ranges.insert(range);
            } else {
                state.read_conflicts.insert(range);
            }
        }
    }

    fn arm_watchdog(&self) {
        let mut slot = self.watchdog.lock();
        if let Some(old) = slot.take() {
            old.abort();
        }
        let deadline = {
            let state = self.shared.state.lock();
            state.options.timeout.map(|t| state.created_at + t)
        };
        let Some(deadline) = deadline else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = Arc::downgrade(&self.shared);
        *slot = Some(runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            if let Some(shared) = shared.upgrade() {
                let mut state = shared.state.lock();
                if state.deferred.is_none() {
                    shared.time_out(&mut state);
                }
            }
        }));
    }

    fn disarm_watchdog(&self) {
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read one key
    ///
    /// Keys past the size limit read as absent. Non-snapshot reads add the key
    /// to the read conflict set.
    pub async fn get(&self, key: impl Into<Key>, snapshot: bool) -> Result<Option<Value>> {
        let key = key.into();
        if is_special_key(&key) {
            let rows = self.special_rows(&KeyRange::single_key(key.clone()))?;
            return Ok(rows.into_iter().find(|kv| kv.key == key).map(|kv| kv.value));
        }

        let (generation, writes, ryw, read_ahead) = {
            let mut state = self.shared.state.lock();
            self.begin_read(&mut state)?;
            if key >= state.options.max_read_key() {
                return Err(Error::KeyOutsideLegalRange);
            }
            if self.config.limits.key_exceeds_limit(&key) {
                return Ok(None);
            }
            let ryw = !state.options.ryw_disabled;
            if !snapshot {
                if ryw {
                    state.read_conflicts.insert_key(&key);
                } else {
                    state.native_read_ranges.insert_key(&key);
                }
            }
            (
                state.generation,
                self.visible_writes(&state, snapshot),
                ryw,
                !state.options.read_ahead_disabled,
            )
        };

        self.guarded(generation, async {
            let version = self.read_version_at(generation).await?;
            if !ryw {
                return self
                    .native
                    .get(&key, version)
                    .await
                    .map_err(|e| self.shared.remote_failure(generation, e));
            }
            let view = self.attempt_view(generation, version);
            let merged = MergedView::new(&view, &writes);
            let merged = if read_ahead {
                merged
            } else {
                merged.without_read_ahead()
            };
            merged.get(&key).await
        })
        .await
    }

    /// Resolve a key selector
    ///
    /// Resolution past either end clamps to the empty key or the first key
    /// this transaction may not read.
    pub async fn get_key(&self, selector: &KeySelector, snapshot: bool) -> Result<Key> {
        if is_special_key(&selector.key) {
            return Err(Error::ClientInvalidOperation(
                "key selectors are not supported in the special key space".to_string(),
            ));
        }
        let (generation, writes, ryw, max_key) = {
            let mut state = self.shared.state.lock();
            self.begin_read(&mut state)?;
            let max_key = state.options.max_read_key();
            if selector.key > max_key {
                return Err(Error::KeyOutsideLegalRange);
            }
            (
                state.generation,
                self.visible_writes(&state, snapshot),
                !state.options.ryw_disabled,
                max_key,
            )
        };

        self.guarded(generation, async {
            let version = self.read_version_at(generation).await?;
            if !ryw {
                let key = self
                    .native
                    .get_key(selector, version)
                    .await
                    .map_err(|e| self.shared.remote_failure(generation, e))?;
                let key = std::cmp::min(key, max_key);
                if !snapshot {
                    let low = std::cmp::min(&selector.key, &key).clone();
                    let high = std::cmp::max(&selector.key, &key).key_after();
                    self.add_read_conflicts(generation, vec![KeyRange::new(low, high)], true);
                }
                return Ok(key);
            }
            let view = self.attempt_view(generation, version);
            let resolved = MergedView::new(&view, &writes)
                .resolve(selector, &max_key)
                .await?;
            if !snapshot {
                self.add_read_conflicts(generation, vec![resolved.scanned], false);
            }
            Ok(resolved.key)
        })
        .await
    }

    /// Read the keys between two selectors
    ///
    /// Rows come back ascending, or descending when `reverse`. When limits
    /// cut the result short, `more` is set and the read conflict range stops
    /// at the last returned key.
    pub async fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limits: RangeLimits,
        snapshot: bool,
        reverse: bool,
    ) -> Result<RangeResult> {
        if is_special_key(&begin.key) {
            return self.special_get_range(begin, end, limits, reverse);
        }

        let (generation, writes, ryw, read_ahead, max_key) = {
            let mut state = self.shared.state.lock();
            self.begin_read(&mut state)?;
            let max_key = state.options.max_read_key();
            if begin.key > max_key || end.key > max_key {
                return Err(Error::KeyOutsideLegalRange);
            }
            if begin.is_first_greater_or_equal()
                && end.is_first_greater_or_equal()
                && begin.key > end.key
            {
                return Err(Error::InvertedRange);
            }
            (
                state.generation,
                self.visible_writes(&state, snapshot),
                !state.options.ryw_disabled,
                !state.options.read_ahead_disabled,
                max_key,
            )
        };

        self.guarded(generation, async {
            let version = self.read_version_at(generation).await?;
            if !ryw {
                return self
                    .native_get_range(generation, version, begin, end, limits, snapshot, reverse, &max_key)
                    .await;
            }

            let view = self.attempt_view(generation, version);
            let merged = MergedView::new(&view, &writes);
            let merged = if read_ahead {
                merged
            } else {
                merged.without_read_ahead()
            };

            let mut scanned = Vec::new();
            let mut bounds = Vec::with_capacity(2);
            for selector in [begin, end] {
                if selector.is_first_greater_or_equal() {
                    bounds.push(selector.key.clone());
                } else {
                    let resolved = merged.resolve(selector, &max_key).await?;
                    scanned.push(resolved.scanned);
                    bounds.push(resolved.key);
                }
            }
            let range = KeyRange::new(bounds[0].clone(), bounds[1].clone());

            let result = if range.is_empty() {
                RangeResult::default()
            } else {
                merged.get_range(&range, limits, reverse).await?
            };
            if !snapshot {
                if !range.is_empty() {
                    scanned.push(fetched_interval(&range, &result, reverse));
                }
                self.add_read_conflicts(generation, scanned, false);
            }
            Ok(result)
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn native_get_range(
        &self,
        generation: u64,
        version: Version,
        begin: &KeySelector,
        end: &KeySelector,
        limits: RangeLimits,
        snapshot: bool,
        reverse: bool,
        max_key: &Key,
    ) -> Result<RangeResult> {
        let mut bounds = Vec::with_capacity(2);
        for selector in [begin, end] {
            let key = if selector.is_first_greater_or_equal() {
                selector.key.clone()
            } else {
                self.native
                    .get_key(selector, version)
                    .await
                    .map_err(|e| self.shared.remote_failure(generation, e))?
            };
            bounds.push(std::cmp::min(key, max_key.clone()));
        }
        let range = KeyRange::new(bounds[0].clone(), bounds[1].clone());
        if range.is_empty() {
            return Ok(RangeResult::default());
        }
        let result = self
            .native
            .get_range(
                &KeySelector::first_greater_or_equal(range.begin.clone()),
                &KeySelector::first_greater_or_equal(range.end.clone()),
                limits,
                version,
                reverse,
            )
            .await
            .map_err(|e| self.shared.remote_failure(generation, e))?;
        if !snapshot {
            let observed = fetched_interval(&range, &result, reverse);
            self.add_read_conflicts(generation, vec![observed], true);
        }
        Ok(result)
    }

    /// Read a literal key range
    pub async fn get_range_literal(
        &self,
        range: &KeyRange,
        limits: RangeLimits,
        snapshot: bool,
        reverse: bool,
    ) -> Result<RangeResult> {
        self.get_range(
            &KeySelector::first_greater_or_equal(range.begin.clone()),
            &KeySelector::first_greater_or_equal(range.end.clone()),
            limits,
            snapshot,
            reverse,
        )
        .await
    }

    /// Rows of the special key space in `range`, ascending
    fn special_rows(&self, range: &KeyRange) -> Result<Vec<KeyValue>> {
        let mut state = self.shared.state.lock();
        self.begin_read(&mut state)?;
        let parts = self
            .router
            .route_range(range, state.options.special_key_space_relaxed)?;

        let mut rows = Vec::new();
        for (part, module) in parts {
            match module {
                SpecialModule::ReadConflicts => rows.extend(conflict_range_listing(
                    READ_CONFLICT_RANGE_PREFIX,
                    &state.all_read_conflicts().to_vec(),
                    &part,
                )),
                SpecialModule::WriteConflicts => rows.extend(conflict_range_listing(
                    WRITE_CONFLICT_RANGE_PREFIX,
                    &state.write_conflicts.to_vec(),
                    &part,
                )),
                SpecialModule::Write(index) => {
                    let base = match self.config.modules.get(index) {
                        Some(module) => module.read_range(&part)?,
                        None => Vec::new(),
                    };
                    rows.extend(state.special_writes.overlay(&part, base));
                }
            }
        }
        Ok(rows)
    }

    fn special_get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limits: RangeLimits,
        reverse: bool,
    ) -> Result<RangeResult> {
        if !begin.is_first_greater_or_equal() || !end.is_first_greater_or_equal() {
            return Err(Error::ClientInvalidOperation(
                "key selectors are not supported in the special key space".to_string(),
            ));
        }
        if begin.key > end.key {
            return Err(Error::InvertedRange);
        }
        if end.key.as_bytes() > SPECIAL_KEYS_END {
            return Err(Error::KeyOutsideLegalRange);
        }
        let range = KeyRange::new(begin.key.clone(), end.key.clone());
        if range.is_empty() {
            return Ok(RangeResult::default());
        }

        let mut rows = self.special_rows(&range)?;
        if reverse {
            rows.reverse();
        }
        let mut limits = limits;
        let mut kvs = Vec::new();
        let mut more = false;
        for kv in rows {
            if limits.is_reached() {
                more = true;
                break;
            }
            limits.decrement(&kv);
            kvs.push(kv);
        }
        Ok(RangeResult::new(kvs, more))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn check_special_write(state: &SessionState) -> Result<()> {
        if !state.options.special_key_space_enable_writes {
            return Err(Error::SpecialKeysWriteDisabled);
        }
        Ok(())
    }

    fn record_write(state: &mut SessionState, conflict: KeyRange, mutation: Mutation) {
        if std::mem::take(&mut state.options.next_write_no_write_conflict_range) {
            trace!(range = %conflict, "Skipping write conflict range");
        } else {
            state.approximate_size +=
                conflict.begin.len() + conflict.end.len() + CONFLICT_RANGE_OVERHEAD;
            state.write_conflicts.insert(conflict);
        }
        state.approximate_size += mutation.expected_size() + MUTATION_OVERHEAD;
        state.mutations.push(mutation);
    }

    /// Set `key` to `value`
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        let mut state = self.shared.state.lock();
        if !self.begin_write(&mut state)? {
            return Ok(());
        }
        if is_special_key(&key) {
            Self::check_special_write(&state)?;
            self.router.write_module_for_key(&key)?;
            state.special_writes.set(&key, value);
            return Ok(());
        }
        if key >= state.options.max_write_key() {
            return Err(Error::KeyOutsideLegalRange);
        }
        self.config.limits.validate_key(&key)?;
        self.config.limits.validate_value(&value)?;

        if !state.options.ryw_disabled {
            Arc::make_mut(&mut state.writes).set(&key, value.clone());
        }
        Self::record_write(
            &mut state,
            KeyRange::single_key(key.clone()),
            Mutation::Set { key, value },
        );
        Ok(())
    }

    /// Clear `key`; keys past the size limit are ignored
    pub fn clear(&self, key: impl Into<Key>) -> Result<()> {
        let key = key.into();
        let mut state = self.shared.state.lock();
        if !self.begin_write(&mut state)? {
            return Ok(());
        }
        if is_special_key(&key) {
            Self::check_special_write(&state)?;
            self.router.write_module_for_key(&key)?;
            state.special_writes.clear(&KeyRange::single_key(key));
            return Ok(());
        }
        if key >= state.options.max_write_key() {
            return Err(Error::KeyOutsideLegalRange);
        }
        if self.config.limits.key_exceeds_limit(&key) {
            return Ok(());
        }

        if !state.options.ryw_disabled {
            Arc::make_mut(&mut state.writes).clear_key(&key);
        }
        let range = KeyRange::single_key(key);
        Self::record_write(
            &mut state,
            range.clone(),
            Mutation::ClearRange { range },
        );
        Ok(())
    }

    /// Clear every key in `[begin, end)`
    pub fn clear_range(&self, begin: impl Into<Key>, end: impl Into<Key>) -> Result<()> {
        let range = KeyRange::new(begin, end);
        let mut state = self.shared.state.lock();
        if !self.begin_write(&mut state)? {
            return Ok(());
        }
        if range.begin > range.end {
            return Err(Error::InvertedRange);
        }
        if is_special_key(&range.begin) {
            Self::check_special_write(&state)?;
            self.router.write_module_for_range(&range)?;
            state.special_writes.clear(&range);
            return Ok(());
        }
        if range.end > state.options.max_write_key() {
            return Err(Error::KeyOutsideLegalRange);
        }
        if range.is_empty() {
            return Ok(());
        }

        if !state.options.ryw_disabled {
            Arc::make_mut(&mut state.writes).clear_range(&range);
        }
        Self::record_write(
            &mut state,
            range.clone(),
            Mutation::ClearRange { range },
        );
        Ok(())
    }

    /// Apply an atomic operator to `key`
    ///
    /// `SetVersionstampedKey` and `SetVersionstampedValue` expect a 4-byte
    /// little-endian placeholder offset at the end of the key or operand.
    pub fn atomic_op(
        &self,
        key: impl Into<Key>,
        operand: impl Into<Value>,
        op: MutationType,
    ) -> Result<()> {
        let (key, operand) = (key.into(), operand.into());
        let mut state = self.shared.state.lock();
        if !self.begin_write(&mut state)? {
            return Ok(());
        }
        if !op.is_atomic() {
            return Err(Error::InvalidMutationType(format!(
                "{:?} is not an atomic operation",
                op
            )));
        }
        if is_special_key(&key) {
            return Err(Error::ClientInvalidOperation(
                "atomic operations are not supported in the special key space".to_string(),
            ));
        }
        let max_key = state.options.max_write_key();
        if key >= max_key {
            return Err(Error::KeyOutsideLegalRange);
        }
        self.config.limits.validate_key(&key)?;
        self.config.limits.validate_value(&operand)?;

        let ryw = !state.options.ryw_disabled;
        let conflict = match op {
            MutationType::SetVersionstampedKey => {
                let prefix = Key::from(versionstamp_key_prefix(key.as_bytes())?);
                let mut range = KeyRange::prefix(prefix);
                if range.end > max_key {
                    range.end = max_key;
                }
                range
            }
            MutationType::SetVersionstampedValue => {
                versionstamp_offset(operand.as_bytes())?;
                if ryw {
                    Arc::make_mut(&mut state.writes).set_unreadable(&key);
                }
                KeyRange::single_key(key.clone())
            }
            _ => {
                if ryw {
                    Arc::make_mut(&mut state.writes).atomic_op(&key, op, operand.clone());
                }
                KeyRange::single_key(key.clone())
            }
        };
        Self::record_write(&mut state, conflict, Mutation::Atomic { op, key, operand });
        Ok(())
    }

    /// Add `range` to the read conflict set
    pub fn add_read_conflict_range(&self, range: KeyRange) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.begin_read(&mut state)?;
        if range.begin > range.end {
            return Err(Error::InvertedRange);
        }
        if range.end > state.options.max_read_key() {
            return Err(Error::KeyOutsideLegalRange);
        }
        state.approximate_size += range.begin.len() + range.end.len() + CONFLICT_RANGE_OVERHEAD;
        state.read_conflicts.insert(range);
        Ok(())
    }

    /// Add `range` to the write conflict set
    pub fn add_write_conflict_range(&self, range: KeyRange) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !self.begin_write(&mut state)? {
            return Ok(());
        }
        if range.begin > range.end {
            return Err(Error::InvertedRange);
        }
        if range.end > state.options.max_write_key() {
            return Err(Error::KeyOutsideLegalRange);
        }
        state.approximate_size += range.begin.len() + range.end.len() + CONFLICT_RANGE_OVERHEAD;
        state.write_conflicts.insert(range);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Versions, watches, introspection
    // ------------------------------------------------------------------

    /// Read version of this attempt, fetching one if none is fixed yet
    pub async fn get_read_version(&self) -> Result<Version> {
        let generation = {
            let mut state = self.shared.state.lock();
            self.begin_read(&mut state)?;
            state.generation
        };
        self.guarded(generation, self.read_version_at(generation)).await
    }

    /// Fix the read version of this attempt
    pub fn set_read_version(&self, version: Version) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.begin_read(&mut state)?;
        if state.read_version.is_some() {
            return Err(Error::ReadVersionAlreadySet);
        }
        state.read_version = Some(version);
        Ok(())
    }

    /// Read version of this attempt if one is already fixed; never fetches
    pub fn cached_read_version(&self) -> Option<Version> {
        self.shared.state.lock().read_version
    }

    /// Make any second commit of this attempt conflict with the first
    ///
    /// Adds one fresh random key under `\xff/SC/` to both conflict sets, so a
    /// resubmitted copy of the commit fails the read check against its own
    /// write.
    pub fn make_self_conflicting(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !self.begin_write(&mut state)? {
            return Ok(());
        }
        let mut key = SELF_CONFLICT_PREFIX.to_vec();
        key.extend_from_slice(&rand::random::<u128>().to_be_bytes());
        let range = KeyRange::single_key(key);
        state.approximate_size +=
            2 * (range.begin.len() + range.end.len() + CONFLICT_RANGE_OVERHEAD);
        state.read_conflicts.insert(range.clone());
        state.write_conflicts.insert(range);
        Ok(())
    }

    /// Version the last commit became visible at; `None` for read-only commits
    pub fn committed_version(&self) -> Option<Version> {
        self.shared.state.lock().committed_version
    }

    /// Approximate bytes this attempt would send at commit
    pub fn get_approximate_size(&self) -> usize {
        self.shared.state.lock().approximate_size
    }

    /// Stamp assigned by the next successful commit
    ///
    /// Fails with `NoCommitVersion` for read-only commits, with the commit's
    /// error if it fails, and with `TransactionCancelled` if the attempt is
    /// reset first.
    pub fn get_versionstamp(&self) -> impl Future<Output = Result<Versionstamp>> + Send + 'static {
        let mut rx = self.shared.state.lock().versionstamp.subscribe();
        async move {
            let slot = rx.wait_for(Option::is_some).await.map(|slot| (*slot).clone());
            match slot {
                Ok(Some(stamp)) => stamp,
                _ => Err(Error::TransactionCancelled),
            }
        }
    }

    /// Register a watch on `key`
    ///
    /// The watch is armed by a successful commit and resolves once the
    /// committed value of `key` changes. Reset or cancel before commit fails
    /// it with `TransactionCancelled`.
    pub fn watch(
        &self,
        key: impl Into<Key>,
    ) -> Result<impl Future<Output = Result<()>> + Send + 'static> {
        let key = key.into();
        let mut state = self.shared.state.lock();
        self.begin_read(&mut state)?;
        if state.options.ryw_disabled {
            return Err(Error::ClientInvalidOperation(
                "watches are disabled when read-your-writes is disabled".to_string(),
            ));
        }
        if key >= state.options.max_read_key() {
            return Err(Error::KeyOutsideLegalRange);
        }
        let (tx, rx) = oneshot::channel();
        state.watches.push(PendingWatch { key, tx });
        Ok(async move { rx.await.unwrap_or(Err(Error::TransactionCancelled)) })
    }

    fn arm_watches(&self, watches: Vec<PendingWatch>, writes: Arc<WriteMap>, version: Option<Version>) {
        if watches.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            for watch in watches {
                let _ = watch.tx.send(Err(Error::ClientInvalidOperation(
                    "watches need a tokio runtime".to_string(),
                )));
            }
            return;
        };
        for PendingWatch { key, mut tx } in watches {
            let native = Arc::clone(&self.native);
            let point = writes.query_point(&key);
            let local = if point.is_independent() {
                point.resolve_local().ok()
            } else {
                None
            };
            runtime.spawn(async move {
                let work = async {
                    let value = match local {
                        Some(value) => value,
                        None => {
                            let version = match version {
                                Some(v) => v,
                                None => native.get_read_version().await?,
                            };
                            native.get(&key, version).await?
                        }
                    };
                    native.watch(&key, value).await
                };
                let result = tokio::select! {
                    _ = tx.closed() => None,
                    out = work => Some(out),
                };
                if let Some(result) = result {
                    let _ = tx.send(result);
                }
            });
        }
    }

    /// Coalesced read conflict ranges of this attempt
    pub fn read_conflict_ranges(&self) -> Vec<KeyRange> {
        self.shared.state.lock().all_read_conflicts().to_vec()
    }

    /// Coalesced write conflict ranges of this attempt
    pub fn write_conflict_ranges(&self) -> Vec<KeyRange> {
        self.shared.state.lock().write_conflicts.to_vec()
    }

    /// Mutation log of this attempt, with versionstamps resolved after commit
    pub fn mutations(&self) -> Vec<Mutation> {
        self.shared.state.lock().mutations.clone()
    }

    /// Retries granted so far
    pub fn retries(&self) -> u32 {
        self.shared.state.lock().retries
    }

    /// Effective options
    pub fn options(&self) -> TransactionOptions {
        self.shared.state.lock().options.clone()
    }

    /// Reads currently in flight
    pub fn outstanding_reads(&self) -> usize {
        self.shared.reads.count()
    }

    /// Wait until no read is in flight
    pub async fn pending_reads(&self) {
        self.shared.reads.wait_idle().await
    }

    /// Resolves when the current attempt ends
    ///
    /// Fires on `reset`, on a retry granted by `on_error`, on `cancel`, on
    /// timeout and when the transaction is dropped. Holds no reference to the
    /// transaction.
    pub fn reset_future(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.abort.subscribe();
        async move {
            let _ = rx.changed().await;
        }
    }

    // ------------------------------------------------------------------
    // Passthroughs
    // ------------------------------------------------------------------

    /// Addresses of the storage servers holding `key`
    pub async fn get_addresses_for_key(&self, key: impl Into<Key>) -> Result<Vec<String>> {
        let key = key.into();
        let generation = self.read_generation()?;
        self.guarded(generation, self.native.get_addresses_for_key(&key))
            .await
    }

    /// Split points dividing `range` into chunks of roughly `chunk_size` bytes
    pub async fn get_range_split_points(&self, range: &KeyRange, chunk_size: usize) -> Result<Vec<Key>> {
        let generation = self.read_generation()?;
        self.guarded(generation, self.native.get_range_split_points(range, chunk_size))
            .await
    }

    /// Estimated stored bytes in `range`
    pub async fn get_estimated_range_size_bytes(&self, range: &KeyRange) -> Result<u64> {
        let generation = self.read_generation()?;
        self.guarded(generation, self.native.get_estimated_range_size_bytes(range))
            .await
    }

    fn read_generation(&self) -> Result<u64> {
        let mut state = self.shared.state.lock();
        self.begin_read(&mut state)?;
        Ok(state.generation)
    }

    // ------------------------------------------------------------------
    // Commit / retry / reset
    // ------------------------------------------------------------------

    /// Commit the attempt
    ///
    /// Fails with `ReadsOutstanding` while reads are in flight; await
    /// [`pending_reads`](Self::pending_reads) first to wait for them.
    pub async fn commit(&self) -> Result<()> {
        let (generation, request, special, writes) = {
            let mut state = self.shared.state.lock();
            self.shared.check_usable(&mut state)?;
            if state.commit_started {
                return Err(Error::UsedDuringCommit);
            }
            let pending = self.shared.reads.count();
            if pending > 0 {
                return Err(Error::ReadsOutstanding { pending });
            }
            self.config
                .limits
                .validate_transaction_size(state.approximate_size)?;
            state.commit_started = true;

            let special: Vec<(Arc<dyn SpecialKeyWriteModule>, Vec<SpecialKeyChange>)> = self
                .config
                .modules
                .iter()
                .filter_map(|module| {
                    let changes = state.special_writes.changes(&module.range());
                    (!changes.is_empty()).then(|| (Arc::clone(module), changes))
                })
                .collect();
            let request = CommitRequest {
                read_version: state.read_version,
                mutations: state.mutations.clone(),
                read_conflicts: state.all_read_conflicts().to_vec(),
                write_conflicts: state.write_conflicts.to_vec(),
            };
            (state.generation, request, special, Arc::clone(&state.writes))
        };

        for (module, changes) in special {
            if let Err(e) = module.commit(&changes) {
                let err = match e {
                    Error::SpecialKeysApiFailure(_) => e,
                    other => Error::SpecialKeysApiFailure(other.to_string()),
                };
                self.fail_commit(generation, &err);
                return Err(err);
            }
        }

        if request.is_read_only() {
            let (watches, version) = {
                let mut state = self.shared.state.lock();
                if state.generation != generation {
                    return Err(state.abort_reason());
                }
                state.fail_versionstamp(&Error::NoCommitVersion);
                (std::mem::take(&mut state.watches), state.read_version)
            };
            debug!("Committed read-only transaction");
            self.disarm_watchdog();
            self.arm_watches(watches, writes, version);
            return Ok(());
        }

        let mutation_count = request.mutations.len();
        match self.abortable(generation, self.native.commit(request)).await {
            Ok(outcome) => {
                let watches = {
                    let mut state = self.shared.state.lock();
                    state.committed_version = Some(outcome.version);
                    let stamp = outcome.versionstamp;
                    state.mutations = state
                        .mutations
                        .iter()
                        .map(|m| m.resolve_versionstamp(&stamp).unwrap_or_else(|_| m.clone()))
                        .collect();
                    state.versionstamp.send_replace(Some(Ok(stamp)));
                    std::mem::take(&mut state.watches)
                };
                debug!(
                    version = outcome.version,
                    mutations = mutation_count,
                    "Committed transaction"
                );
                self.disarm_watchdog();
                self.arm_watches(watches, writes, Some(outcome.version));
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "Commit failed");
                self.fail_commit(generation, &e);
                Err(e)
            }
        }
    }

    fn fail_commit(&self, generation: u64, error: &Error) {
        let mut state = self.shared.state.lock();
        if state.generation == generation {
            state.fail_pending(error);
        }
    }

    /// Decide whether `error` is worth retrying
    ///
    /// Retryable errors back off, reset the attempt and return `Ok`; the
    /// caller then runs the transaction body again. Anything else, or a
    /// retryable error past the retry limit, is returned.
    pub async fn on_error(&self, error: Error) -> Result<()> {
        if !error.is_retryable() {
            return Err(error);
        }
        let (attempt, delay, name) = {
            let state = self.shared.state.lock();
            if let Some(max) = state.options.max_retries {
                if state.retries >= max {
                    return Err(error);
                }
            }
            let delay = self.config.retry.delay_for(
                &error,
                state.retries,
                state.options.max_retry_delay,
            );
            (
                state.retries,
                delay,
                state.options.debug_transaction_name.clone(),
            )
        };

        match &name {
            Some(name) => warn!(
                transaction = %name,
                error = %error,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying transaction"
            ),
            None => debug!(error = %error, attempt, "Retrying transaction"),
        }
        tokio::time::sleep(delay).await;

        let mut state = self.shared.state.lock();
        self.reset_attempt(&mut state, false);
        state.retries = attempt + 1;
        Ok(())
    }

    fn reset_attempt(&self, state: &mut SessionState, full: bool) {
        self.shared.bump_generation(state);
        state.writes = Arc::new(WriteMap::new());
        state.cache.clear();
        state.read_conflicts.clear();
        state.write_conflicts.clear();
        state.native_read_ranges.clear();
        state.special_writes.clear_all();
        state.mutations.clear();
        state.approximate_size = 0;
        state.read_version = None;
        state.commit_started = false;
        state.committed_version = None;
        state.versionstamp = watch::channel(None).0;
        state.deferred = None;
        state.watches.clear();
        state.touched = false;
        state.options = state.persistent.clone();
        if full {
            state.retries = 0;
            state.created_at = Instant::now();
        }
    }

    /// Discard the attempt and start over
    ///
    /// Options set on the transaction are kept; the retry count and the
    /// timeout clock restart.
    pub fn reset(&self) {
        {
            let mut state = self.shared.state.lock();
            self.reset_attempt(&mut state, true);
        }
        self.arm_watchdog();
        debug!("Transaction reset");
    }

    /// Abort in-flight operations; every later call fails until `reset`
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        state.deferred = Some(Error::TransactionCancelled);
        self.shared.bump_generation(&mut state);
        state.fail_pending(&Error::TransactionCancelled);
        debug!("Transaction cancelled");
    }

    /// Apply an option
    ///
    /// `ReadYourWritesDisable` is only accepted before the first read or write.
    pub fn set_option(&self, option: TransactionOption) -> Result<()> {
        let rearm = {
            let mut state = self.shared.state.lock();
            if option == TransactionOption::ReadYourWritesDisable && state.touched {
                return Err(Error::ClientInvalidOperation(
                    "read-your-writes cannot be disabled after reads or writes".to_string(),
                ));
            }
            state.options.apply(&option)?;
            if option.is_persistent() {
                state.persistent.apply(&option)?;
            }
            matches!(option, TransactionOption::Timeout(_))
        };
        if rearm {
            self.arm_watchdog();
        }
        Ok(())
    }
}

impl<N: NativeTransaction> Drop for ReadYourWritesTransaction<N> {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.get_mut().take() {
            watchdog.abort();
        }
        let mut state = self.shared.state.lock();
        self.shared.bump_generation(&mut state);
    }
}
