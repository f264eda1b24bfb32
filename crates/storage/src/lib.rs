//! In-memory cluster for rywdb
//!
//! This crate provides the native transaction capability the read-your-writes
//! overlay runs on top of:
//! - VersionedStore: MVCC key-value data
//! - ConflictResolver: first-committer-wins checks over conflict ranges
//! - MemoryCluster / MemoryTransaction: the cluster and its native handles

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod mvcc;
pub mod resolver;

pub use cluster::{ClusterConfig, ClusterStats, FaultPoint, MemoryCluster, MemoryTransaction};
pub use mvcc::VersionedStore;
pub use resolver::ConflictResolver;
