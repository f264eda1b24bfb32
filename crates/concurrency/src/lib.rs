//! Read-your-writes transaction layer for rywdb
//!
//! This crate wraps a native transaction with:
//! - WriteMap: uncommitted writes, visible to the transaction's own reads
//! - SnapshotCache: everything already read at the transaction's read version
//! - RangeSet: coalesced read and write conflict ranges
//! - MergedView: reads answered from the write map, the cache and the cluster
//! - Special key space: conflict-range listings and pluggable write modules
//! - ReadYourWritesTransaction: the commit / retry / reset state machine
//! - Database: config-driven transaction factory with a retry loop

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod database;
pub mod merge;
pub mod options;
pub mod retry;
pub mod snapshot_cache;
pub mod special_keys;
pub mod transaction;
pub mod write_map;

pub use conflict::{ConflictRangeSet, RangeSet};
pub use database::{Database, DatabaseConfig, TransactFuture, CONFIG_FILE_NAME};
pub use merge::{MergedView, ResolvedKey, StorageView};
pub use options::{TransactionOption, TransactionOptions};
pub use retry::RetryPolicy;
pub use snapshot_cache::{CacheLookup, SnapshotCache};
pub use special_keys::{SpecialKeyChange, SpecialKeyWriteModule};
pub use transaction::ReadYourWritesTransaction;
pub use write_map::{WriteMap, WriteState};
