//! Core types and traits for rywdb
//!
//! This crate defines the foundational types used throughout the system:
//! - Key, Value, KeyRange, KeyValue: byte-string key space
//! - Version, Versionstamp: commit ordering
//! - KeySelector, RangeLimits, RangeResult: range-read vocabulary
//! - Mutation, MutationType: the mutation log and atomic operators
//! - Limits: key-space layout and size limits
//! - Error: error taxonomy
//! - Traits: the native transaction capability (NativeTransaction, TransactionFactory)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod limits;
pub mod mutation;
pub mod selector;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use limits::{
    all_keys, is_special_key, is_system_key, normal_keys, special_keys, Limits,
    CONFLICT_RANGE_OVERHEAD, MUTATION_OVERHEAD,
};
pub use mutation::{apply_atomic_op, Mutation, MutationType};
pub use selector::{KeySelector, RangeLimits, RangeResult};
pub use traits::{CommitOutcome, CommitRequest, NativeTransaction, TransactionFactory};
pub use types::{Key, KeyRange, KeyValue, Value, Version, Versionstamp};
