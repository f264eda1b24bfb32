//! Core traits for the native transaction capability
//!
//! The read-your-writes overlay never talks to a cluster directly. It drives a
//! [`NativeTransaction`]: a handle that reads at a fixed version, ships a
//! mutation log with conflict ranges at commit, and knows nothing of local
//! writes. A [`TransactionFactory`] produces fresh handles for each attempt.
//!
//! Thread safety: handles are shared between the overlay and its in-flight
//! reads, so every method takes `&self` and implementations must be
//! `Send + Sync`.

use async_trait::async_trait;

use crate::error::Result;
use crate::mutation::Mutation;
use crate::selector::{KeySelector, RangeLimits, RangeResult};
use crate::types::{Key, KeyRange, Value, Version, Versionstamp};

/// Everything the cluster needs to resolve and apply a commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitRequest {
    /// Version the transaction read at; `None` when it never read
    pub read_version: Option<Version>,
    /// Mutations in program order
    pub mutations: Vec<Mutation>,
    /// Coalesced read conflict ranges
    pub read_conflicts: Vec<KeyRange>,
    /// Coalesced write conflict ranges
    pub write_conflicts: Vec<KeyRange>,
}

impl CommitRequest {
    /// True if nothing would be written
    pub fn is_read_only(&self) -> bool {
        self.mutations.is_empty() && self.write_conflicts.is_empty()
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Version at which the commit became visible
    pub version: Version,
    /// Stamp assigned to the commit
    pub versionstamp: Versionstamp,
}

/// Remote transaction capability beneath the overlay
///
/// All reads name the version they read at; the overlay fetches the read
/// version once per attempt and passes it through.
#[async_trait]
pub trait NativeTransaction: Send + Sync {
    /// Obtain a read version from the cluster
    async fn get_read_version(&self) -> Result<Version>;

    /// Point read
    async fn get(&self, key: &Key, version: Version) -> Result<Option<Value>>;

    /// Resolve a key selector against committed data
    async fn get_key(&self, selector: &KeySelector, version: Version) -> Result<Key>;

    /// Range read between two selectors
    ///
    /// Rows come back in ascending key order, or descending when `reverse`.
    /// `more` is true if the limits cut the result short.
    async fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limits: RangeLimits,
        version: Version,
        reverse: bool,
    ) -> Result<RangeResult>;

    /// Submit the mutation log and conflict ranges
    async fn commit(&self, request: CommitRequest) -> Result<CommitOutcome>;

    /// Resolve once the committed value of `key` differs from `value`
    async fn watch(&self, key: &Key, value: Option<Value>) -> Result<()>;

    /// Addresses of the storage servers holding `key`
    async fn get_addresses_for_key(&self, key: &Key) -> Result<Vec<String>>;

    /// Split points dividing `range` into chunks of roughly `chunk_size` bytes
    async fn get_range_split_points(&self, range: &KeyRange, chunk_size: usize)
        -> Result<Vec<Key>>;

    /// Estimated stored bytes in `range`
    async fn get_estimated_range_size_bytes(&self, range: &KeyRange) -> Result<u64>;
}

/// Source of native transaction handles
pub trait TransactionFactory: Send + Sync + 'static {
    /// Handle type produced by this factory
    type Native: NativeTransaction + 'static;

    /// Create a fresh native transaction
    fn create_transaction(&self) -> Self::Native;
}
