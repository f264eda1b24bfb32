//! MemoryCluster: in-process stand-in for the remote database
//!
//! This module implements the native transaction capability using:
//! - [`VersionedStore`] for MVCC data behind a `parking_lot::RwLock`
//! - [`ConflictResolver`] for first-committer-wins validation of read conflict ranges
//! - `tokio::sync::watch` channels for watch delivery and for pausing reads
//!
//! # Design Notes
//!
//! - **One version per commit**: the cluster version advances by one per
//!   successful commit (or by [`MemoryCluster::advance_version`] in tests).
//! - **Bounded history**: reads and conflict checks older than
//!   `history_window` versions fail with `TransactionTooOld`.
//! - **Test hooks**: one-shot fault injection per operation, a read gate that
//!   parks data reads until released, and fetch counters.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

use rywdb_core::{
    CommitOutcome, CommitRequest, Error, Key, KeyRange, KeySelector, Mutation, NativeTransaction,
    RangeLimits, RangeResult, Result, TransactionFactory, Value, Version, Versionstamp,
};

use crate::mvcc::VersionedStore;
use crate::resolver::ConflictResolver;

/// Cluster tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Versions of history kept for reads and conflict checks (default: 5,000)
    pub history_window: u64,
    /// Addresses reported by `get_addresses_for_key`
    pub addresses: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            history_window: 5_000,
            addresses: vec!["127.0.0.1:4500".to_string()],
        }
    }
}

impl ClusterConfig {
    /// Set the retained history window
    pub fn with_history_window(mut self, versions: u64) -> Self {
        self.history_window = versions;
        self
    }
}

/// Operations that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `get_read_version`
    ReadVersion,
    /// Point reads
    Get,
    /// Selector resolution
    GetKey,
    /// Range reads
    GetRange,
    /// Commits
    Commit,
}

/// Counters of remote calls served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterStats {
    /// Read versions handed out
    pub read_versions: u64,
    /// Point reads served
    pub gets: u64,
    /// Selector resolutions served
    pub get_keys: u64,
    /// Range reads served
    pub range_reads: u64,
    /// Commits attempted
    pub commits: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    read_versions: AtomicU64,
    gets: AtomicU64,
    get_keys: AtomicU64,
    range_reads: AtomicU64,
    commits: AtomicU64,
}

#[derive(Debug, Default)]
struct ClusterState {
    store: VersionedStore,
    resolver: ConflictResolver,
    version: Version,
}

impl ClusterState {
    fn floor(&self, window: u64) -> Version {
        self.version.saturating_sub(window)
    }

    fn check_read_version(&self, version: Version, window: u64) -> Result<()> {
        if version > self.version {
            return Err(Error::FutureVersion);
        }
        if version < self.floor(window) {
            return Err(Error::TransactionTooOld);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ClusterInner {
    config: ClusterConfig,
    state: RwLock<ClusterState>,
    faults: Mutex<HashMap<FaultPoint, VecDeque<Error>>>,
    read_gate: watch::Sender<bool>,
    parked_reads: AtomicUsize,
    commits: watch::Sender<Version>,
    stats: StatCounters,
}

impl ClusterInner {
    fn take_fault(&self, point: FaultPoint) -> Result<()> {
        match self.faults.lock().get_mut(&point).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(?point, error = %err, "Injected fault");
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Park until the read gate is open
    async fn pass_read_gate(&self) {
        let mut rx = self.read_gate.subscribe();
        if !*rx.borrow_and_update() {
            return;
        }
        self.parked_reads.fetch_add(1, Ordering::SeqCst);
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.parked_reads.fetch_sub(1, Ordering::SeqCst);
    }

    /// Resolve versionstamps and reject malformed mutations before anything is applied
    fn prepare(mutations: Vec<Mutation>, stamp: &Versionstamp) -> Result<Vec<Mutation>> {
        mutations
            .into_iter()
            .map(|m| {
                if let Mutation::Atomic { op, .. } = &m {
                    if !op.is_atomic() {
                        return Err(Error::InvalidMutationType(format!("{:?}", op)));
                    }
                }
                m.resolve_versionstamp(stamp)
            })
            .collect()
    }

    fn apply(state: &mut ClusterState, mutations: Vec<Mutation>, version: Version) -> Result<()> {
        for mutation in mutations {
            match mutation {
                Mutation::Set { key, value } => state.store.put(key, version, Some(value)),
                Mutation::ClearRange { range } => state.store.clear_range(&range, version),
                Mutation::Atomic { op, key, operand } => {
                    let existing = state.store.get(&key, version);
                    let out = rywdb_core::apply_atomic_op(
                        existing.as_ref().map(Value::as_bytes),
                        op,
                        operand.as_bytes(),
                    )?;
                    state.store.put(key, version, out);
                }
            }
        }
        Ok(())
    }
}

/// In-memory cluster shared by every transaction created from it
///
/// Cloning is cheap and yields another handle to the same cluster.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// Create an empty cluster with default config
    pub fn new() -> Self {
        Self::with_config(ClusterConfig::default())
    }

    /// Create an empty cluster
    pub fn with_config(config: ClusterConfig) -> Self {
        let (read_gate, _) = watch::channel(false);
        let (commits, _) = watch::channel(0);
        MemoryCluster {
            inner: Arc::new(ClusterInner {
                config,
                state: RwLock::new(ClusterState::default()),
                faults: Mutex::new(HashMap::new()),
                read_gate,
                parked_reads: AtomicUsize::new(0),
                commits,
                stats: StatCounters::default(),
            }),
        }
    }

    /// Latest committed version
    pub fn current_version(&self) -> Version {
        self.inner.state.read().version
    }

    /// Commit `rows` as one blind write, bypassing conflict checks
    pub fn load<K, V>(&self, rows: impl IntoIterator<Item = (K, V)>) -> Version
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        let version = {
            let mut state = self.inner.state.write();
            state.version += 1;
            let version = state.version;
            for (k, v) in rows {
                state.store.put(k.into(), version, Some(v.into()));
            }
            version
        };
        self.inner.commits.send_replace(version);
        version
    }

    /// Latest committed value of `key`
    pub fn read_latest(&self, key: impl Into<Key>) -> Option<Value> {
        let state = self.inner.state.read();
        state.store.get(&key.into(), state.version)
    }

    /// Move the cluster version forward without writing
    pub fn advance_version(&self, by: u64) -> Version {
        let version = {
            let mut state = self.inner.state.write();
            state.version += by;
            let floor = state.floor(self.inner.config.history_window);
            state.resolver.prune(floor);
            state.version
        };
        self.inner.commits.send_replace(version);
        version
    }

    /// Make the next call at `point` fail with `error`
    pub fn inject_fault(&self, point: FaultPoint, error: Error) {
        self.inner
            .faults
            .lock()
            .entry(point)
            .or_default()
            .push_back(error);
    }

    /// Park every data read until [`MemoryCluster::resume_reads`]
    pub fn pause_reads(&self) {
        self.inner.read_gate.send_replace(true);
    }

    /// Release parked reads
    pub fn resume_reads(&self) {
        self.inner.read_gate.send_replace(false);
    }

    /// Number of reads currently parked at the read gate
    pub fn parked_reads(&self) -> usize {
        self.inner.parked_reads.load(Ordering::SeqCst)
    }

    /// Snapshot of the call counters
    pub fn stats(&self) -> ClusterStats {
        let s = &self.inner.stats;
        ClusterStats {
            read_versions: s.read_versions.load(Ordering::Relaxed),
            gets: s.gets.load(Ordering::Relaxed),
            get_keys: s.get_keys.load(Ordering::Relaxed),
            range_reads: s.range_reads.load(Ordering::Relaxed),
            commits: s.commits.load(Ordering::Relaxed),
        }
    }

    /// Open a native transaction against this cluster
    pub fn transaction(&self) -> MemoryTransaction {
        MemoryTransaction {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl TransactionFactory for MemoryCluster {
    type Native = MemoryTransaction;

    fn create_transaction(&self) -> MemoryTransaction {
        self.transaction()
    }
}

/// Native transaction handle on a [`MemoryCluster`]
///
/// Stateless apart from the cluster reference: the read version and all
/// conflict ranges are supplied by the caller.
#[derive(Debug, Clone)]
pub struct MemoryTransaction {
    inner: Arc<ClusterInner>,
}

#[async_trait]
impl NativeTransaction for MemoryTransaction {
    async fn get_read_version(&self) -> Result<Version> {
        self.inner.take_fault(FaultPoint::ReadVersion)?;
        self.inner.stats.read_versions.fetch_add(1, Ordering::Relaxed);
        Ok(self.inner.state.read().version)
    }

    async fn get(&self, key: &Key, version: Version) -> Result<Option<Value>> {
        self.inner.pass_read_gate().await;
        self.inner.take_fault(FaultPoint::Get)?;
        self.inner.stats.gets.fetch_add(1, Ordering::Relaxed);
        trace!(%key, version, "get");

        let state = self.inner.state.read();
        state.check_read_version(version, self.inner.config.history_window)?;
        Ok(state.store.get(key, version))
    }

    async fn get_key(&self, selector: &KeySelector, version: Version) -> Result<Key> {
        self.inner.pass_read_gate().await;
        self.inner.take_fault(FaultPoint::GetKey)?;
        self.inner.stats.get_keys.fetch_add(1, Ordering::Relaxed);

        let state = self.inner.state.read();
        state.check_read_version(version, self.inner.config.history_window)?;
        Ok(state.store.resolve_selector(selector, version))
    }

    async fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limits: RangeLimits,
        version: Version,
        reverse: bool,
    ) -> Result<RangeResult> {
        self.inner.pass_read_gate().await;
        self.inner.take_fault(FaultPoint::GetRange)?;
        self.inner.stats.range_reads.fetch_add(1, Ordering::Relaxed);

        let state = self.inner.state.read();
        state.check_read_version(version, self.inner.config.history_window)?;
        let b = state.store.resolve_selector(begin, version);
        let e = state.store.resolve_selector(end, version);
        trace!(begin = %b, end = %e, version, reverse, "get_range");
        Ok(state.store.scan(&b, &e, limits, version, reverse))
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitOutcome> {
        self.inner.take_fault(FaultPoint::Commit)?;
        self.inner.stats.commits.fetch_add(1, Ordering::Relaxed);
        let window = self.inner.config.history_window;

        let outcome = {
            let mut state = self.inner.state.write();
            if let Some(read_version) = request.read_version {
                if read_version > state.version {
                    return Err(Error::FutureVersion);
                }
                if !request.read_conflicts.is_empty() && read_version < state.floor(window) {
                    return Err(Error::TransactionTooOld);
                }
                if let Some(range) = state
                    .resolver
                    .find_conflict(read_version, &request.read_conflicts)
                {
                    debug!(read_version, conflict = %range, "Commit conflicted");
                    return Err(Error::NotCommitted);
                }
            }

            let version = state.version + 1;
            let versionstamp = Versionstamp::new(version, 0);
            let mutations = ClusterInner::prepare(request.mutations, &versionstamp)?;
            let count = mutations.len();
            ClusterInner::apply(&mut state, mutations, version)?;

            state.version = version;
            state.resolver.record(version, request.write_conflicts);
            let floor = state.floor(window);
            state.resolver.prune(floor);
            state.store.prune(floor);

            debug!(version, mutations = count, "Committed");
            CommitOutcome {
                version,
                versionstamp,
            }
        };
        self.inner.commits.send_replace(outcome.version);
        Ok(outcome)
    }

    async fn watch(&self, key: &Key, value: Option<Value>) -> Result<()> {
        let mut rx = self.inner.commits.subscribe();
        loop {
            let current = {
                let state = self.inner.state.read();
                state.store.get(key, state.version)
            };
            if current != value {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(Error::TransactionCancelled);
            }
        }
    }

    async fn get_addresses_for_key(&self, _key: &Key) -> Result<Vec<String>> {
        Ok(self.inner.config.addresses.clone())
    }

    async fn get_range_split_points(
        &self,
        range: &KeyRange,
        chunk_size: usize,
    ) -> Result<Vec<Key>> {
        let state = self.inner.state.read();
        Ok(state.store.split_points(range, chunk_size, state.version))
    }

    async fn get_estimated_range_size_bytes(&self, range: &KeyRange) -> Result<u64> {
        let state = self.inner.state.read();
        Ok(state.store.estimated_size(range, state.version))
    }
}
