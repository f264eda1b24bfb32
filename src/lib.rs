//! rywdb - read-your-writes transactions over an ordered key-value store
//!
//! rywdb wraps the native transactions of a strictly-serializable, ordered
//! key-value cluster so that a transaction's reads observe its own
//! uncommitted writes.
//!
//! # Quick Start
//!
//! ```ignore
//! use rywdb::{Database, MemoryCluster, Value};
//!
//! let db = Database::new(MemoryCluster::new());
//! db.transact(|tr| Box::pin(async move {
//!     tr.set("user:123", "Alice")?;
//!     assert_eq!(tr.get("user:123", false).await?, Some(Value::from("Alice")));
//!     Ok(())
//! })).await?;
//! ```
//!
//! # Architecture
//!
//! - `rywdb-core`: keys, selectors, mutations, limits, errors and the
//!   native transaction capability
//! - `rywdb-storage`: an in-memory cluster implementing that capability
//! - `rywdb-concurrency`: the read-your-writes transaction and database handle

pub use rywdb_concurrency::{
    Database, DatabaseConfig, ReadYourWritesTransaction, RetryPolicy, SpecialKeyChange,
    SpecialKeyWriteModule, TransactionOption, TransactionOptions,
};
pub use rywdb_core::{
    CommitOutcome, CommitRequest, Error, Key, KeyRange, KeySelector, KeyValue, Limits, Mutation,
    MutationType, NativeTransaction, RangeLimits, RangeResult, Result, TransactionFactory, Value,
    Version, Versionstamp,
};
pub use rywdb_storage::{ClusterConfig, MemoryCluster, MemoryTransaction};
