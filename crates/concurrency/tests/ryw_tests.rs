//! Read-your-writes integration tests
//!
//! Exercises `ReadYourWritesTransaction` and `Database` end to end against the
//! in-memory cluster from `rywdb-storage`.
//!
//! ## Test Categories
//!
//! 1. **Visibility** - local writes merged over cluster data
//! 2. **Caching** - repeated reads served without remote fetches
//! 3. **Conflicts** - conflict ranges, commit conflicts, retries
//! 4. **Lifecycle** - reset, cancel, timeout, use during commit
//! 5. **Versions** - versionstamps, watches, read versions
//! 6. **Special keys** - conflict listings and write modules
//! 7. **Options and limits** - RYW disabled, snapshot RYW, system keys, sizes
//! 8. **Model checks** - random operation mixes against an ordered-map model
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test ryw_tests
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use rywdb_concurrency::special_keys::{read_conflict_range_keys, write_conflict_range_keys};
use rywdb_concurrency::{
    Database, DatabaseConfig, ReadYourWritesTransaction, SpecialKeyChange, SpecialKeyWriteModule,
    TransactionOption,
};
use rywdb_core::{
    CommitRequest, Error, Key, KeyRange, KeySelector, KeyValue, Limits, Mutation, MutationType,
    NativeTransaction, RangeLimits, Result, Value, Versionstamp,
};
use rywdb_storage::{FaultPoint, MemoryCluster, MemoryTransaction};

// ============================================================================
// Test Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn cluster_with(rows: &[(&str, &str)]) -> MemoryCluster {
    init_tracing();
    let cluster = MemoryCluster::new();
    if !rows.is_empty() {
        cluster.load(rows.iter().copied());
    }
    cluster
}

fn session(cluster: &MemoryCluster) -> ReadYourWritesTransaction<MemoryTransaction> {
    ReadYourWritesTransaction::new(cluster.transaction())
}

fn range(begin: &str, end: &str) -> KeyRange {
    KeyRange::new(begin, end)
}

fn keys(result: &rywdb_core::RangeResult) -> Vec<String> {
    result.iter().map(|kv| kv.key.to_string()).collect()
}

fn int(v: i64) -> Value {
    Value::from(v.to_le_bytes())
}

fn special(suffix: &str) -> Key {
    Key::from(suffix).with_prefix(b"\xff\xff")
}

fn config_key(name: &str) -> Key {
    Key::from(name).with_prefix(b"\xff\xff/config/")
}

/// Write module keeping its rows in memory
#[derive(Default)]
struct ConfigModule {
    rows: Mutex<BTreeMap<Key, Value>>,
    commits: Mutex<Vec<Vec<SpecialKeyChange>>>,
}

impl SpecialKeyWriteModule for ConfigModule {
    fn range(&self) -> KeyRange {
        KeyRange::prefix(&b"\xff\xff/config/"[..])
    }

    fn read_range(&self, range: &KeyRange) -> Result<Vec<KeyValue>> {
        Ok(self
            .rows
            .lock()
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, changes: &[SpecialKeyChange]) -> Result<()> {
        let mut rows = self.rows.lock();
        for change in changes {
            match change {
                SpecialKeyChange::Set(k, v) => {
                    rows.insert(k.clone(), v.clone());
                }
                SpecialKeyChange::Clear(r) => rows.retain(|k, _| !r.contains(k)),
            }
        }
        self.commits.lock().push(changes.to_vec());
        Ok(())
    }
}

/// Write module that rejects every commit
struct RejectingModule;

impl SpecialKeyWriteModule for RejectingModule {
    fn range(&self) -> KeyRange {
        KeyRange::prefix(&b"\xff\xff/locked/"[..])
    }

    fn commit(&self, _changes: &[SpecialKeyChange]) -> Result<()> {
        Err(Error::Internal("module is read-only".to_string()))
    }
}

// ============================================================================
// SECTION 1: Visibility
// ============================================================================

#[tokio::test]
async fn test_set_then_clear_reads_absent() {
    let cluster = cluster_with(&[("a", "remote")]);
    let tr = session(&cluster);

    tr.set("a", "x").unwrap();
    tr.clear("a").unwrap();
    assert_eq!(tr.get("a", false).await.unwrap(), None);
}

#[tokio::test]
async fn test_local_sets_form_range_without_remote_data() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);

    tr.set("k1", "x").unwrap();
    tr.set("k2", "y").unwrap();
    let result = tr
        .get_range_literal(&range("k1", "k3"), RangeLimits::unlimited(), false, false)
        .await
        .unwrap();
    assert_eq!(
        result.kvs,
        vec![KeyValue::new("k1", "x"), KeyValue::new("k2", "y")]
    );
    assert!(!result.more);
}

#[tokio::test]
async fn test_atomic_add_folds_over_remote_value_and_resends_op() {
    init_tracing();
    let cluster = MemoryCluster::new();
    cluster.load([("counter", 5i64.to_le_bytes())]);
    let tr = session(&cluster);

    tr.atomic_op("counter", 1i64.to_le_bytes(), MutationType::AddValue)
        .unwrap();
    assert_eq!(tr.get("counter", false).await.unwrap(), Some(int(6)));

    tr.commit().await.unwrap();
    assert_eq!(
        tr.mutations(),
        vec![Mutation::Atomic {
            op: MutationType::AddValue,
            key: Key::from("counter"),
            operand: int(1),
        }]
    );
    assert_eq!(cluster.read_latest("counter"), Some(int(6)));
}

#[tokio::test]
async fn test_commit_rejected_while_read_outstanding() {
    let cluster = cluster_with(&[("k", "v")]);
    let tr = session(&cluster);

    cluster.pause_reads();
    let read = tr.get("k", false);
    tokio::pin!(read);
    assert!(tokio::time::timeout(Duration::from_millis(20), &mut read)
        .await
        .is_err());
    assert_eq!(tr.outstanding_reads(), 1);
    assert_eq!(
        tr.commit().await,
        Err(Error::ReadsOutstanding { pending: 1 })
    );

    cluster.resume_reads();
    assert_eq!(read.await.unwrap(), Some(Value::from("v")));
    tr.pending_reads().await;
    tr.commit().await.unwrap();
}

#[tokio::test]
async fn test_clear_range_hides_cached_rows() {
    let cluster = cluster_with(&[("a", "1"), ("b", "2"), ("c", "3")]);
    let tr = session(&cluster);

    let before = tr
        .get_range_literal(&range("a", "z"), RangeLimits::unlimited(), false, false)
        .await
        .unwrap();
    assert_eq!(keys(&before), vec!["a", "b", "c"]);

    tr.clear_range("a", "c").unwrap();
    let after = tr
        .get_range_literal(&range("a", "z"), RangeLimits::unlimited(), false, false)
        .await
        .unwrap();
    assert_eq!(after.kvs, vec![KeyValue::new("c", "3")]);
    assert_eq!(tr.get("b", false).await.unwrap(), None);
}

#[tokio::test]
async fn test_selectors_land_on_local_writes() {
    let cluster = cluster_with(&[("a", "1"), ("b", "2"), ("c", "3")]);
    let tr = session(&cluster);
    tr.set("bb", "local").unwrap();

    let key = tr
        .get_key(&KeySelector::first_greater_than("b"), false)
        .await
        .unwrap();
    assert_eq!(key, Key::from("bb"));

    let result = tr
        .get_range(
            &KeySelector::first_greater_than("a"),
            &KeySelector::first_greater_or_equal("c"),
            RangeLimits::unlimited(),
            false,
            false,
        )
        .await
        .unwrap();
    assert_eq!(keys(&result), vec!["b", "bb"]);
}

#[tokio::test]
async fn test_selectors_clamp_at_key_space_edges() {
    let cluster = cluster_with(&[("m", "1")]);
    let tr = session(&cluster);

    let before_first = tr
        .get_key(&KeySelector::last_less_than("m"), false)
        .await
        .unwrap();
    assert_eq!(before_first, Key::empty());

    let past_last = tr
        .get_key(&KeySelector::first_greater_than("m"), false)
        .await
        .unwrap();
    assert_eq!(past_last, Key::from(&b"\xff"[..]));
}

#[tokio::test]
async fn test_reverse_range_with_limit() {
    let cluster = cluster_with(&[("a", "1"), ("b", "2"), ("c", "3")]);
    let tr = session(&cluster);
    tr.set("bb", "local").unwrap();

    let result = tr
        .get_range_literal(&range("a", "z"), RangeLimits::rows(2), false, true)
        .await
        .unwrap();
    assert_eq!(keys(&result), vec!["c", "bb"]);
    assert!(result.more);
    assert_eq!(tr.read_conflict_ranges(), vec![range("bb", "z")]);
}

#[tokio::test]
async fn test_inverted_ranges_rejected() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);

    assert_eq!(tr.clear_range("b", "a"), Err(Error::InvertedRange));
    assert_eq!(
        tr.get_range_literal(&range("b", "a"), RangeLimits::unlimited(), false, false)
            .await,
        Err(Error::InvertedRange)
    );
}

// ============================================================================
// SECTION 2: Caching
// ============================================================================

#[tokio::test]
async fn test_cached_reads_do_not_refetch() {
    let cluster = cluster_with(&[("a", "1"), ("b", "2"), ("c", "3")]);
    let tr = session(&cluster);

    let first = tr
        .get_range_literal(&range("a", "z"), RangeLimits::unlimited(), false, false)
        .await
        .unwrap();
    let before = cluster.stats();

    let second = tr
        .get_range_literal(&range("a", "z"), RangeLimits::unlimited(), false, false)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(tr.get("b", false).await.unwrap(), Some(Value::from("2")));
    assert_eq!(tr.get("bzz", false).await.unwrap(), None);

    let after = cluster.stats();
    assert_eq!(after.range_reads, before.range_reads);
    assert_eq!(after.gets, before.gets);
}

#[tokio::test]
async fn test_read_version_fetched_once_per_attempt() {
    let cluster = cluster_with(&[("a", "1")]);
    let tr = session(&cluster);

    tr.get("a", false).await.unwrap();
    tr.get("b", false).await.unwrap();
    tr.get_read_version().await.unwrap();
    assert_eq!(cluster.stats().read_versions, 1);
}

// ============================================================================
// SECTION 3: Conflicts
// ============================================================================

#[tokio::test]
async fn test_read_conflicts_coalesce() {
    let cluster = cluster_with(&[("a", "1"), ("b", "2")]);
    let tr = session(&cluster);

    tr.get("a", false).await.unwrap();
    tr.get("b", false).await.unwrap();
    tr.get_range_literal(&range("a", "c"), RangeLimits::unlimited(), false, false)
        .await
        .unwrap();
    tr.get("x", true).await.unwrap();
    assert_eq!(tr.read_conflict_ranges(), vec![range("a", "c")]);
}

#[tokio::test]
async fn test_write_conflicts_follow_writes() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);

    tr.set("a", "1").unwrap();
    tr.clear_range("b", "d").unwrap();
    tr.add_write_conflict_range(range("x", "y")).unwrap();
    assert_eq!(
        tr.write_conflict_ranges(),
        vec![KeyRange::single_key("a"), range("b", "d"), range("x", "y")]
    );
}

#[tokio::test]
async fn test_conflicting_commit_then_retry() {
    let cluster = cluster_with(&[("k", "0")]);
    let db = Database::new(cluster.clone());
    let tr = db.create_transaction();
    let other = db.create_transaction();

    assert_eq!(tr.get("k", false).await.unwrap(), Some(Value::from("0")));
    other.set("k", "other").unwrap();
    other.commit().await.unwrap();

    tr.set("j", "x").unwrap();
    assert_eq!(tr.commit().await, Err(Error::NotCommitted));

    tr.on_error(Error::NotCommitted).await.unwrap();
    assert_eq!(tr.retries(), 1);
    assert!(tr.mutations().is_empty());
    assert_eq!(tr.get("k", false).await.unwrap(), Some(Value::from("other")));
    tr.set("j", "x").unwrap();
    tr.commit().await.unwrap();
    assert_eq!(cluster.read_latest("j"), Some(Value::from("x")));
}

#[tokio::test]
async fn test_snapshot_reads_do_not_conflict() {
    let cluster = cluster_with(&[("k", "0")]);
    let tr = session(&cluster);
    let other = session(&cluster);

    tr.get("k", true).await.unwrap();
    other.set("k", "other").unwrap();
    other.commit().await.unwrap();

    tr.set("j", "x").unwrap();
    tr.commit().await.unwrap();
}

#[tokio::test]
async fn test_retry_limit_and_non_retryable_errors() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);
    tr.set_option(TransactionOption::RetryLimit(1)).unwrap();
    tr.set_option(TransactionOption::MaxRetryDelay(5)).unwrap();

    tr.on_error(Error::NotCommitted).await.unwrap();
    assert_eq!(
        tr.on_error(Error::NotCommitted).await,
        Err(Error::NotCommitted)
    );
    assert_eq!(
        tr.on_error(Error::KeyOutsideLegalRange).await,
        Err(Error::KeyOutsideLegalRange)
    );
}

#[tokio::test]
async fn test_retry_backoff_capped_by_configured_policy() {
    let cluster = cluster_with(&[]);
    let config = DatabaseConfig::from_toml_str(
        "[retry]\nbase_delay_ms = 5000\nmax_delay_ms = 5\njitter = false\n",
    )
    .unwrap();
    let db = Database::with_config(cluster.clone(), config).unwrap();

    let tr = db.create_transaction();
    tokio::time::timeout(Duration::from_millis(500), tr.on_error(Error::NotCommitted))
        .await
        .expect("backoff should honour retry.max_delay_ms")
        .unwrap();

    let config = DatabaseConfig::from_toml_str(
        "[retry]\nbase_delay_ms = 60000\nmax_delay_ms = 60000\njitter = false\n",
    )
    .unwrap();
    let db = Database::with_config(cluster, config).unwrap();
    let tr = db.create_transaction();
    tr.set_option(TransactionOption::MaxRetryDelay(5)).unwrap();
    tokio::time::timeout(Duration::from_millis(500), tr.on_error(Error::NotCommitted))
        .await
        .expect("transaction option overrides the policy cap")
        .unwrap();
}

#[tokio::test]
async fn test_transact_retries_failed_commit() {
    let cluster = cluster_with(&[]);
    cluster.inject_fault(FaultPoint::Commit, Error::NotCommitted);
    let db = Database::new(cluster.clone());
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    let answer = db
        .transact(move |tr| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tr.set("answer", "42")?;
                Ok(42)
            })
        })
        .await
        .unwrap();

    assert_eq!(answer, 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(cluster.read_latest("answer"), Some(Value::from("42")));
}

#[tokio::test]
async fn test_transact_returns_body_error() {
    let cluster = cluster_with(&[]);
    let db = Database::new(cluster);

    let result = db
        .transact(|tr| {
            Box::pin(async move {
                tr.set(&b"\xffsystem"[..], "v")?;
                Ok(())
            })
        })
        .await;
    assert_eq!(result, Err(Error::KeyOutsideLegalRange));
}

// ============================================================================
// SECTION 4: Lifecycle
// ============================================================================

#[tokio::test]
async fn test_reset_clears_attempt_state() {
    let cluster = cluster_with(&[("b", "2")]);
    let tr = session(&cluster);

    tr.set("a", "1").unwrap();
    tr.get("b", false).await.unwrap();
    tr.add_write_conflict_range(range("x", "y")).unwrap();
    tr.reset();

    assert!(tr.mutations().is_empty());
    assert!(tr.read_conflict_ranges().is_empty());
    assert!(tr.write_conflict_ranges().is_empty());
    assert_eq!(tr.get_approximate_size(), 0);
    assert_eq!(tr.get("a", false).await.unwrap(), None);
}

#[tokio::test]
async fn test_cancel_aborts_in_flight_read() {
    let cluster = cluster_with(&[("k", "v")]);
    let tr = session(&cluster);

    cluster.pause_reads();
    let read = tr.get("k", false);
    tokio::pin!(read);
    assert!(tokio::time::timeout(Duration::from_millis(20), &mut read)
        .await
        .is_err());

    tr.cancel();
    assert_eq!(read.await, Err(Error::TransactionCancelled));
    assert_eq!(tr.set("k", "x"), Err(Error::TransactionCancelled));
    assert_eq!(tr.get_versionstamp().await, Err(Error::TransactionCancelled));

    cluster.resume_reads();
    tr.reset();
    tr.set("k", "x").unwrap();
    tr.commit().await.unwrap();
}

#[tokio::test]
async fn test_reset_future_fires_when_attempt_ends() {
    let cluster = cluster_with(&[("k", "v")]);
    let tr = session(&cluster);
    let within = Duration::from_millis(500);

    let quiet = tr.reset_future();
    tr.set("k", "x").unwrap();
    tr.get("k", false).await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(20), quiet)
        .await
        .is_err());

    let on_reset = tr.reset_future();
    tr.reset();
    tokio::time::timeout(within, on_reset)
        .await
        .expect("reset ends the attempt");

    let on_retry = tr.reset_future();
    tr.set_option(TransactionOption::MaxRetryDelay(1)).unwrap();
    tr.on_error(Error::NotCommitted).await.unwrap();
    tokio::time::timeout(within, on_retry)
        .await
        .expect("retry ends the attempt");

    let on_cancel = tr.reset_future();
    tr.cancel();
    tokio::time::timeout(within, on_cancel)
        .await
        .expect("cancel ends the attempt");

    tr.reset();
    let on_drop = tr.reset_future();
    drop(tr);
    tokio::time::timeout(within, on_drop)
        .await
        .expect("drop ends the attempt");
}

#[tokio::test]
async fn test_timeout_poisons_session_until_reset() {
    let cluster = cluster_with(&[("k", "v")]);
    let tr = session(&cluster);
    tr.set_option(TransactionOption::Timeout(20)).unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(tr.get("k", false).await, Err(Error::TransactionTimedOut));
    assert_eq!(tr.set("k", "x"), Err(Error::TransactionTimedOut));
    assert_eq!(
        tr.on_error(Error::TransactionTimedOut).await,
        Err(Error::TransactionTimedOut)
    );

    tr.reset();
    assert_eq!(tr.options().timeout, Some(Duration::from_millis(20)));
    assert_eq!(tr.get("k", false).await.unwrap(), Some(Value::from("v")));
}

#[tokio::test]
async fn test_timeout_aborts_in_flight_read() {
    let cluster = cluster_with(&[("k", "v")]);
    let tr = session(&cluster);
    tr.set_option(TransactionOption::Timeout(50)).unwrap();

    cluster.pause_reads();
    let outcome = tokio::time::timeout(Duration::from_secs(5), tr.get("k", false))
        .await
        .expect("watchdog should fire");
    assert_eq!(outcome, Err(Error::TransactionTimedOut));
    cluster.resume_reads();
}

#[tokio::test]
async fn test_use_after_commit_is_rejected() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);

    tr.set("a", "1").unwrap();
    tr.commit().await.unwrap();
    assert_eq!(tr.commit().await, Err(Error::UsedDuringCommit));
    assert_eq!(tr.get("a", false).await, Err(Error::UsedDuringCommit));
    assert_eq!(tr.set("b", "2"), Err(Error::UsedDuringCommit));
    assert_eq!(tr.mutations().len(), 1);
}

#[tokio::test]
async fn test_writes_after_commit_ignored_without_protection() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);
    tr.set_option(TransactionOption::UsedDuringCommitProtectionDisable)
        .unwrap();

    tr.set("a", "1").unwrap();
    tr.commit().await.unwrap();
    tr.set("b", "2").unwrap();
    tr.clear("a").unwrap();
    assert_eq!(tr.mutations().len(), 1);
    assert_eq!(cluster.read_latest("b"), None);
}

#[tokio::test]
async fn test_non_retryable_read_failure_is_deferred() {
    let cluster = cluster_with(&[("k", "v")]);
    let tr = session(&cluster);
    cluster.inject_fault(FaultPoint::Get, Error::Internal("disk".to_string()));

    assert_eq!(
        tr.get("k", false).await,
        Err(Error::Internal("disk".to_string()))
    );
    assert_eq!(tr.set("x", "1"), Err(Error::Internal("disk".to_string())));

    tr.reset();
    assert_eq!(tr.get("k", false).await.unwrap(), Some(Value::from("v")));
}

#[tokio::test]
async fn test_retryable_read_failure_is_not_deferred() {
    let cluster = cluster_with(&[("k", "v")]);
    let tr = session(&cluster);
    cluster.inject_fault(FaultPoint::Get, Error::TransactionTooOld);

    assert_eq!(tr.get("k", false).await, Err(Error::TransactionTooOld));
    tr.set("x", "1").unwrap();
}

// ============================================================================
// SECTION 5: Versions
// ============================================================================

#[tokio::test]
async fn test_versionstamp_resolves_at_commit() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);

    let stamp = tr.get_versionstamp();
    tr.set("a", "1").unwrap();
    tr.commit().await.unwrap();

    let version = tr.committed_version().unwrap();
    assert_eq!(stamp.await.unwrap(), Versionstamp::new(version, 0));
}

#[tokio::test]
async fn test_read_only_commit_has_no_versionstamp() {
    let cluster = cluster_with(&[("a", "1")]);
    let tr = session(&cluster);

    let stamp = tr.get_versionstamp();
    tr.get("a", false).await.unwrap();
    tr.commit().await.unwrap();
    assert_eq!(tr.committed_version(), None);
    assert_eq!(stamp.await, Err(Error::NoCommitVersion));
    assert_eq!(cluster.stats().commits, 0);
}

#[tokio::test]
async fn test_versionstamp_cancelled_by_reset() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);

    let stamp = tr.get_versionstamp();
    tr.set("a", "1").unwrap();
    tr.reset();
    assert_eq!(stamp.await, Err(Error::TransactionCancelled));
}

#[tokio::test]
async fn test_versionstamped_key() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);

    let mut key = b"user/".to_vec();
    key.extend_from_slice(&[0u8; 10]);
    key.extend_from_slice(&5u32.to_le_bytes());
    tr.atomic_op(key, "profile", MutationType::SetVersionstampedKey)
        .unwrap();
    assert_eq!(tr.write_conflict_ranges(), vec![KeyRange::prefix("user/")]);

    tr.commit().await.unwrap();
    let stamp = Versionstamp::new(tr.committed_version().unwrap(), 0);
    let mut stored = b"user/".to_vec();
    stored.extend_from_slice(stamp.as_bytes());
    assert_eq!(cluster.read_latest(stored.clone()), Some(Value::from("profile")));
    assert_eq!(
        tr.mutations(),
        vec![Mutation::Set {
            key: Key::from(stored),
            value: Value::from("profile"),
        }]
    );
}

#[tokio::test]
async fn test_versionstamped_value_unreadable_until_commit() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);

    let mut operand = vec![0u8; 10];
    operand.extend_from_slice(&0u32.to_le_bytes());
    tr.atomic_op("stamped", operand, MutationType::SetVersionstampedValue)
        .unwrap();
    assert_eq!(
        tr.get("stamped", false).await,
        Err(Error::AccessedUnreadable)
    );

    tr.commit().await.unwrap();
    let stamp = Versionstamp::new(tr.committed_version().unwrap(), 0);
    assert_eq!(
        cluster.read_latest("stamped"),
        Some(Value::from(stamp.as_bytes().to_vec()))
    );
}

#[tokio::test]
async fn test_bad_versionstamp_offset_rejected() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);

    let mut key = b"short".to_vec();
    key.extend_from_slice(&3u32.to_le_bytes());
    assert!(matches!(
        tr.atomic_op(key, "v", MutationType::SetVersionstampedKey),
        Err(Error::ClientInvalidOperation(_))
    ));
    assert!(matches!(
        tr.atomic_op("k", "v", MutationType::SetValue),
        Err(Error::InvalidMutationType(_))
    ));
}

#[tokio::test]
async fn test_watch_fires_after_commit_and_change() {
    let cluster = cluster_with(&[("w", "1")]);
    let tr = session(&cluster);

    assert_eq!(tr.get("w", false).await.unwrap(), Some(Value::from("1")));
    let watch = tokio::spawn(tr.watch("w").unwrap());
    tr.commit().await.unwrap();

    let writer = session(&cluster);
    writer.set("w", "2").unwrap();
    writer.commit().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), watch)
        .await
        .expect("watch should fire")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_read_only_commit_keeps_watches() {
    let cluster = cluster_with(&[("w", "1")]);
    let tr = session(&cluster);

    tr.get("w", false).await.unwrap();
    let stamp = tr.get_versionstamp();
    let watch = tokio::spawn(tr.watch("w").unwrap());
    tr.commit().await.unwrap();
    assert_eq!(stamp.await, Err(Error::NoCommitVersion));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!watch.is_finished());

    let writer = session(&cluster);
    writer.set("w", "2").unwrap();
    writer.commit().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), watch)
        .await
        .expect("watch should fire")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_watch_cancelled_by_reset() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);

    let watch = tr.watch("w").unwrap();
    tr.reset();
    assert_eq!(watch.await, Err(Error::TransactionCancelled));
}

#[tokio::test]
async fn test_watch_fails_with_commit() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);
    cluster.inject_fault(FaultPoint::Commit, Error::CommitUnknownResult);

    let watch = tr.watch("w").unwrap();
    tr.set("w", "1").unwrap();
    assert_eq!(tr.commit().await, Err(Error::CommitUnknownResult));
    assert_eq!(watch.await, Err(Error::CommitUnknownResult));
}

#[tokio::test]
async fn test_cached_read_version_is_local() {
    let cluster = cluster_with(&[("a", "1")]);
    let tr = session(&cluster);
    assert_eq!(tr.cached_read_version(), None);

    tr.get("a", false).await.unwrap();
    let version = tr.cached_read_version().expect("read version after a read");
    assert_eq!(tr.get_read_version().await.unwrap(), version);
    assert_eq!(cluster.stats().read_versions, 1);

    tr.reset();
    assert_eq!(tr.cached_read_version(), None);
    assert_eq!(cluster.stats().read_versions, 1);
}

#[tokio::test]
async fn test_self_conflicting_commit_cannot_be_replayed() {
    let cluster = cluster_with(&[("a", "1")]);

    // Without the marker a resubmitted copy of a commit goes through.
    let plain = session(&cluster);
    plain.get("a", false).await.unwrap();
    plain.set("b", "2").unwrap();
    let replay = CommitRequest {
        read_version: plain.cached_read_version(),
        mutations: plain.mutations(),
        read_conflicts: plain.read_conflict_ranges(),
        write_conflicts: plain.write_conflict_ranges(),
    };
    plain.commit().await.unwrap();
    cluster.transaction().commit(replay).await.unwrap();

    let tr = session(&cluster);
    tr.get("a", false).await.unwrap();
    tr.make_self_conflicting().unwrap();
    tr.set("b", "3").unwrap();
    let marker: Vec<KeyRange> = tr
        .read_conflict_ranges()
        .into_iter()
        .filter(|r| r.begin.as_bytes().starts_with(b"\xff/SC/"))
        .collect();
    assert_eq!(marker.len(), 1);
    assert!(tr.write_conflict_ranges().contains(&marker[0]));

    let replay = CommitRequest {
        read_version: tr.cached_read_version(),
        mutations: tr.mutations(),
        read_conflicts: tr.read_conflict_ranges(),
        write_conflicts: tr.write_conflict_ranges(),
    };
    tr.commit().await.unwrap();
    assert_eq!(
        cluster.transaction().commit(replay).await,
        Err(Error::NotCommitted)
    );

    let other = session(&cluster);
    other.make_self_conflicting().unwrap();
    assert!(!other.read_conflict_ranges().contains(&marker[0]));
}

// ============================================================================
// SECTION 6: Special keys
// ============================================================================

#[tokio::test]
async fn test_conflict_range_listings() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);

    tr.get("a", false).await.unwrap();
    tr.get_range_literal(&range("c", "e"), RangeLimits::unlimited(), false, false)
        .await
        .unwrap();
    tr.set("b", "1").unwrap();

    let prefix = b"\xff\xff/transaction/read_conflict_range/";
    let reads = tr
        .get_range_literal(&read_conflict_range_keys(), RangeLimits::unlimited(), false, false)
        .await
        .unwrap();
    assert_eq!(
        reads.kvs,
        vec![
            KeyValue::new(Key::from("a").with_prefix(prefix), "1"),
            KeyValue::new(Key::from(&b"a\x00"[..]).with_prefix(prefix), "0"),
            KeyValue::new(Key::from("c").with_prefix(prefix), "1"),
            KeyValue::new(Key::from("e").with_prefix(prefix), "0"),
        ]
    );

    let prefix = b"\xff\xff/transaction/write_conflict_range/";
    let writes = tr
        .get_range_literal(&write_conflict_range_keys(), RangeLimits::unlimited(), false, false)
        .await
        .unwrap();
    assert_eq!(
        writes.kvs,
        vec![
            KeyValue::new(Key::from("b").with_prefix(prefix), "1"),
            KeyValue::new(Key::from(&b"b\x00"[..]).with_prefix(prefix), "0"),
        ]
    );
}

#[tokio::test]
async fn test_cross_module_read_needs_relaxed_option() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);
    let across = KeyRange::new(special("/transaction/"), special("/transaction0"));

    assert_eq!(
        tr.get_range_literal(&across, RangeLimits::unlimited(), false, false)
            .await,
        Err(Error::SpecialKeysCrossModuleRead)
    );
    tr.set_option(TransactionOption::SpecialKeySpaceRelaxed)
        .unwrap();
    assert!(tr
        .get_range_literal(&across, RangeLimits::unlimited(), false, false)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_special_key_module_reads_and_commits() {
    let cluster = cluster_with(&[]);
    let db = Database::new(cluster.clone());
    let module = Arc::new(ConfigModule::default());
    module
        .rows
        .lock()
        .insert(config_key("existing"), Value::from("1"));
    db.register_special_key_module(module.clone()).unwrap();

    let tr = db.create_transaction();
    assert_eq!(
        tr.set(config_key("mode"), "fast"),
        Err(Error::SpecialKeysWriteDisabled)
    );
    tr.set_option(TransactionOption::SpecialKeySpaceEnableWrites)
        .unwrap();
    tr.set(config_key("mode"), "fast").unwrap();

    assert_eq!(
        tr.get(config_key("existing"), false).await.unwrap(),
        Some(Value::from("1"))
    );
    let rows = tr
        .get_range_literal(&module.range(), RangeLimits::unlimited(), false, false)
        .await
        .unwrap();
    assert_eq!(
        rows.kvs,
        vec![
            KeyValue::new(config_key("existing"), "1"),
            KeyValue::new(config_key("mode"), "fast"),
        ]
    );
    assert!(tr.write_conflict_ranges().is_empty());
    assert!(tr.mutations().is_empty());

    tr.commit().await.unwrap();
    assert_eq!(
        *module.commits.lock(),
        vec![vec![SpecialKeyChange::Set(
            config_key("mode"),
            Value::from("fast")
        )]]
    );
    assert_eq!(cluster.stats().commits, 0);
}

#[tokio::test]
async fn test_special_write_without_module() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);
    tr.set_option(TransactionOption::SpecialKeySpaceEnableWrites)
        .unwrap();

    assert!(matches!(
        tr.set(special("/nowhere/x"), "v"),
        Err(Error::SpecialKeysNoWriteModuleFound(_))
    ));
    assert!(matches!(
        tr.atomic_op(special("/nowhere/x"), int(1), MutationType::AddValue),
        Err(Error::ClientInvalidOperation(_))
    ));
}

#[tokio::test]
async fn test_special_module_commit_failure() {
    let cluster = cluster_with(&[]);
    let db = Database::new(cluster);
    db.register_special_key_module(Arc::new(RejectingModule))
        .unwrap();

    let tr = db.create_transaction();
    tr.set_option(TransactionOption::SpecialKeySpaceEnableWrites)
        .unwrap();
    tr.clear(Key::from("x").with_prefix(b"\xff\xff/locked/"))
        .unwrap();
    assert!(matches!(
        tr.commit().await,
        Err(Error::SpecialKeysApiFailure(_))
    ));
}

// ============================================================================
// SECTION 7: Options and limits
// ============================================================================

#[tokio::test]
async fn test_ryw_disabled_reads_bypass_writes() {
    let cluster = cluster_with(&[("k", "remote")]);
    let tr = session(&cluster);
    tr.set_option(TransactionOption::ReadYourWritesDisable)
        .unwrap();

    tr.set("k", "local").unwrap();
    assert_eq!(tr.get("k", false).await.unwrap(), Some(Value::from("remote")));
    assert_eq!(tr.read_conflict_ranges(), vec![KeyRange::single_key("k")]);
    assert!(matches!(
        tr.watch("k"),
        Err(Error::ClientInvalidOperation(_))
    ));

    tr.commit().await.unwrap();
    assert_eq!(cluster.read_latest("k"), Some(Value::from("local")));
}

#[tokio::test]
async fn test_snapshot_ryw_toggle() {
    let cluster = cluster_with(&[("k", "remote")]);
    let tr = session(&cluster);

    tr.set("k", "local").unwrap();
    assert_eq!(tr.get("k", true).await.unwrap(), Some(Value::from("local")));

    tr.set_option(TransactionOption::SnapshotRywDisable).unwrap();
    assert_eq!(tr.get("k", true).await.unwrap(), Some(Value::from("remote")));
    assert_eq!(tr.get("k", false).await.unwrap(), Some(Value::from("local")));
}

#[tokio::test]
async fn test_snapshot_ryw_disabled_by_config() {
    let cluster = cluster_with(&[("k", "remote")]);
    let config = DatabaseConfig::from_toml_str("snapshot_ryw_enabled = false").unwrap();
    let db = Database::with_config(cluster, config).unwrap();

    let tr = db.create_transaction();
    tr.set("k", "local").unwrap();
    assert_eq!(tr.get("k", true).await.unwrap(), Some(Value::from("remote")));
}

#[tokio::test]
async fn test_system_keys_need_permission() {
    let cluster = cluster_with(&[]);
    let tr = session(&cluster);
    let system = Key::from(&b"\xffconf"[..]);

    assert_eq!(tr.set(system.clone(), "v"), Err(Error::KeyOutsideLegalRange));
    assert_eq!(
        tr.get(system.clone(), false).await,
        Err(Error::KeyOutsideLegalRange)
    );

    tr.set_option(TransactionOption::AccessSystemKeys).unwrap();
    tr.set(system.clone(), "v").unwrap();
    assert_eq!(tr.get(system, false).await.unwrap(), Some(Value::from("v")));
}

#[tokio::test]
async fn test_size_limits() {
    let cluster = cluster_with(&[]);
    let config = DatabaseConfig {
        limits: Limits::with_small_limits(),
        ..DatabaseConfig::default()
    };
    let db = Database::with_config(cluster, config).unwrap();
    let tr = db.create_transaction();
    let long_key = "k".repeat(17);

    assert_eq!(tr.get(long_key.as_str(), false).await.unwrap(), None);
    assert!(matches!(
        tr.set(long_key.as_str(), "v"),
        Err(Error::KeyTooLarge { actual: 17, max: 16 })
    ));
    tr.clear(long_key.as_str()).unwrap();
    assert!(tr.mutations().is_empty());
    assert!(matches!(
        tr.set("k", "v".repeat(65).as_str()),
        Err(Error::ValueTooLarge { .. })
    ));

    for i in 0..20 {
        tr.set(format!("k{:02}", i).as_str(), "v".repeat(60).as_str())
            .unwrap();
    }
    assert!(matches!(
        tr.commit().await,
        Err(Error::TransactionTooLarge { .. })
    ));
}

#[tokio::test]
async fn test_passthrough_queries() {
    let cluster = cluster_with(&[("a", "1"), ("b", "2")]);
    let tr = session(&cluster);

    assert_eq!(
        tr.get_addresses_for_key("a").await.unwrap(),
        vec!["127.0.0.1:4500".to_string()]
    );
    assert!(
        tr.get_estimated_range_size_bytes(&range("a", "z"))
            .await
            .unwrap()
            > 0
    );
}

// ============================================================================
// SECTION 8: Model checks
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Get(u8, bool),
    GetRange(u8, u8),
    Set(u8, i64),
    ClearRange(u8, u8),
    Add(u8, i64),
}

fn step_key(k: u8) -> Key {
    Key::from(((b'a' + k) as char).to_string().as_str())
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u8..8, any::<bool>()).prop_map(|(k, snapshot)| Step::Get(k, snapshot)),
        (0u8..8, 1u8..4).prop_map(|(a, width)| Step::GetRange(a, a + width)),
        (0u8..8, -50i64..50).prop_map(|(k, v)| Step::Set(k, v)),
        (0u8..8, 1u8..4).prop_map(|(a, width)| Step::ClearRange(a, a + width)),
        (0u8..8, -50i64..50).prop_map(|(k, v)| Step::Add(k, v)),
    ]
}

fn check_coalesced(ranges: &[KeyRange]) -> std::result::Result<(), TestCaseError> {
    for r in ranges {
        prop_assert!(!r.is_empty());
    }
    for pair in ranges.windows(2) {
        prop_assert!(pair[0].end < pair[1].begin, "{:?} touches {:?}", pair[0], pair[1]);
    }
    Ok(())
}

fn covered(ranges: &[KeyRange], k: u8) -> bool {
    ranges.iter().any(|r| r.contains(&step_key(k)))
}

async fn run_steps(
    initial: BTreeMap<u8, i64>,
    steps: Vec<Step>,
) -> std::result::Result<(), TestCaseError> {
    let cluster = MemoryCluster::new();
    if !initial.is_empty() {
        cluster.load(initial.iter().map(|(k, v)| (step_key(*k), int(*v))));
    }
    let tr = session(&cluster);
    let mut model = initial;
    let mut read = BTreeSet::new();
    let mut written = BTreeSet::new();

    for step in steps {
        match step {
            Step::Get(k, snapshot) => {
                let got = tr.get(step_key(k), snapshot).await.unwrap();
                prop_assert_eq!(got, model.get(&k).map(|v| int(*v)));
                if !snapshot {
                    read.insert(k);
                }
            }
            Step::GetRange(a, b) => {
                let result = tr
                    .get_range_literal(
                        &KeyRange::new(step_key(a), step_key(b)),
                        RangeLimits::unlimited(),
                        false,
                        false,
                    )
                    .await
                    .unwrap();
                let expected: Vec<KeyValue> = model
                    .range(a..b)
                    .map(|(k, v)| KeyValue::new(step_key(*k), int(*v)))
                    .collect();
                prop_assert!(!result.more);
                prop_assert_eq!(result.iter().cloned().collect::<Vec<_>>(), expected);
                read.extend(a..b);
            }
            Step::Set(k, v) => {
                tr.set(step_key(k), int(v)).unwrap();
                model.insert(k, v);
                written.insert(k);
            }
            Step::ClearRange(a, b) => {
                tr.clear_range(step_key(a), step_key(b)).unwrap();
                model.retain(|k, _| *k < a || *k >= b);
                written.extend(a..b);
            }
            Step::Add(k, v) => {
                tr.atomic_op(step_key(k), int(v), MutationType::AddValue)
                    .unwrap();
                let slot = model.entry(k).or_insert(0);
                *slot = slot.wrapping_add(v);
                written.insert(k);
            }
        }
    }

    let reads = tr.read_conflict_ranges();
    let writes = tr.write_conflict_ranges();
    check_coalesced(&reads)?;
    check_coalesced(&writes)?;
    for k in &read {
        prop_assert!(covered(&reads, *k), "read of {} not covered", k);
    }
    for k in &written {
        prop_assert!(covered(&writes, *k), "write of {} not covered", k);
    }

    let all = tr
        .get_range_literal(&range("a", "z"), RangeLimits::unlimited(), false, false)
        .await
        .unwrap();
    let expected: Vec<KeyValue> = model
        .iter()
        .map(|(k, v)| KeyValue::new(step_key(*k), int(*v)))
        .collect();
    prop_assert_eq!(all.iter().cloned().collect::<Vec<_>>(), expected);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_session_matches_ordered_map(
        initial in prop::collection::btree_map(0u8..8, -50i64..50, 0..6),
        steps in prop::collection::vec(step(), 1..24),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_steps(initial, steps))?;
    }
}
