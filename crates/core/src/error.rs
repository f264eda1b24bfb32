//! Error types for rywdb
//!
//! This module defines every error a transaction can surface.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Classes
//!
//! - **Retryable remote errors**: conflicts, stale or future read versions,
//!   unknown commit results. `on_error` backs off and resets the attempt.
//! - **Timeout / cancel**: produced locally; never retried.
//! - **Misuse errors**: illegal keys, inverted ranges, operations during
//!   commit, commit with reads outstanding. Never retried.
//!
//! Error codes follow the cluster client's numbering so logs line up with
//! server-side traces.

use thiserror::Error;

/// Result type alias for rywdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the transaction overlay and its native capability
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Commit conflicted with a concurrently committed transaction
    #[error("Transaction not committed due to conflict with another transaction")]
    NotCommitted,

    /// Read version is older than the cluster's retained history
    #[error("Transaction is too old to perform reads or be committed")]
    TransactionTooOld,

    /// Read version is newer than any version the cluster has produced
    #[error("Request for future version")]
    FutureVersion,

    /// Commit may or may not have been applied
    #[error("Cluster commit result unknown")]
    CommitUnknownResult,

    /// Remote side is temporarily unable to serve the request
    #[error("Remote process is behind: {0}")]
    ProcessBehind(String),

    /// The transaction outlived its configured timeout
    #[error("Operation aborted because the transaction timed out")]
    TransactionTimedOut,

    /// The transaction was cancelled or reset while the operation was in flight
    #[error("Operation aborted because the transaction was cancelled")]
    TransactionCancelled,

    /// Operation issued after commit started
    #[error("Operation issued while a commit was outstanding")]
    UsedDuringCommit,

    /// Commit issued while reads are still pending
    #[error("Commit issued while {pending} read(s) are still outstanding")]
    ReadsOutstanding {
        /// Number of reads in flight when commit was attempted
        pending: usize,
    },

    /// Key is outside the range this transaction may access
    #[error("Key outside legal range")]
    KeyOutsideLegalRange,

    /// Range begin is greater than range end
    #[error("Range begin key larger than end key")]
    InvertedRange,

    /// Key exceeds the size limit
    #[error("Key length exceeds limit: {actual} > {max}")]
    KeyTooLarge {
        /// Actual key length
        actual: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Value exceeds the size limit
    #[error("Value length exceeds limit: {actual} > {max}")]
    ValueTooLarge {
        /// Actual value length
        actual: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Transaction exceeds the size limit
    #[error("Transaction exceeds byte limit: {actual} > {max}")]
    TransactionTooLarge {
        /// Approximate transaction size
        actual: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Read of a key whose value depends on the commit versionstamp
    #[error("Read or wrote an unreadable key")]
    AccessedUnreadable,

    /// Versionstamp requested from a transaction that did not commit writes
    #[error("Transaction has no commit version")]
    NoCommitVersion,

    /// `set_read_version` after a read version was already fixed
    #[error("Transaction already has a read version set")]
    ReadVersionAlreadySet,

    /// Option value could not be interpreted
    #[error("Invalid option value: {0}")]
    InvalidOptionValue(String),

    /// Mutation type not valid for the requested call
    #[error("Invalid mutation type: {0}")]
    InvalidMutationType(String),

    /// Write to the special key space without enabling special key writes
    #[error("Special key space is not allowed to write by default")]
    SpecialKeysWriteDisabled,

    /// Special key write outside every registered write module
    #[error("Cannot find a write module for special key {0}")]
    SpecialKeysNoWriteModuleFound(String),

    /// Special key read not served by any module
    #[error("Special key space range read does not intersect a module")]
    SpecialKeysNoModuleFound,

    /// Special key range read spans more than one module
    #[error("Special key space range read crosses modules")]
    SpecialKeysCrossModuleRead,

    /// A special key write module rejected its changes
    #[error("Special key space api failure: {0}")]
    SpecialKeysApiFailure(String),

    /// Generic misuse of the transaction API
    #[error("Invalid API call: {0}")]
    ClientInvalidOperation(String),

    /// Configuration could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal invariant violated
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if `on_error` should back off and retry the transaction
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotCommitted
                | Error::TransactionTooOld
                | Error::FutureVersion
                | Error::CommitUnknownResult
                | Error::ProcessBehind(_)
        )
    }

    /// True if the failed commit may nevertheless have been applied
    pub fn is_maybe_committed(&self) -> bool {
        matches!(self, Error::CommitUnknownResult)
    }

    /// True if the error means the read version must be refreshed
    pub fn is_version_error(&self) -> bool {
        matches!(self, Error::TransactionTooOld | Error::FutureVersion)
    }

    /// True for conflict errors
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::NotCommitted)
    }

    /// Numeric error code matching the cluster client
    pub fn code(&self) -> i32 {
        match self {
            Error::TransactionTooOld => 1007,
            Error::FutureVersion => 1009,
            Error::NotCommitted => 1020,
            Error::CommitUnknownResult => 1021,
            Error::TransactionCancelled => 1025,
            Error::TransactionTimedOut => 1031,
            Error::AccessedUnreadable => 1036,
            Error::ProcessBehind(_) => 1037,
            Error::ClientInvalidOperation(_) => 2000,
            Error::KeyOutsideLegalRange => 2004,
            Error::InvertedRange => 2005,
            Error::InvalidOptionValue(_) => 2006,
            Error::ReadVersionAlreadySet => 2010,
            Error::UsedDuringCommit => 2017,
            Error::InvalidMutationType(_) => 2018,
            Error::NoCommitVersion => 2021,
            Error::ReadsOutstanding { .. } => 2022,
            Error::TransactionTooLarge { .. } => 2101,
            Error::KeyTooLarge { .. } => 2102,
            Error::ValueTooLarge { .. } => 2103,
            Error::SpecialKeysNoModuleFound => 2113,
            Error::SpecialKeysCrossModuleRead => 2114,
            Error::SpecialKeysWriteDisabled => 2115,
            Error::SpecialKeysNoWriteModuleFound(_) => 2116,
            Error::SpecialKeysApiFailure(_) => 2117,
            Error::Config(_) => 2200,
            Error::Internal(_) => 4100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_committed() {
        let msg = Error::NotCommitted.to_string();
        assert!(msg.contains("not committed"));
    }

    #[test]
    fn test_error_display_reads_outstanding() {
        let msg = Error::ReadsOutstanding { pending: 2 }.to_string();
        assert!(msg.contains("2 read(s)"));
    }

    #[test]
    fn test_error_display_key_too_large() {
        let err = Error::KeyTooLarge {
            actual: 10_001,
            max: 10_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("10001"));
        assert!(msg.contains("10000"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NotCommitted.is_retryable());
        assert!(Error::TransactionTooOld.is_retryable());
        assert!(Error::FutureVersion.is_retryable());
        assert!(Error::CommitUnknownResult.is_retryable());
        assert!(Error::ProcessBehind("storage lagging".to_string()).is_retryable());

        assert!(!Error::TransactionTimedOut.is_retryable());
        assert!(!Error::TransactionCancelled.is_retryable());
        assert!(!Error::UsedDuringCommit.is_retryable());
        assert!(!Error::KeyOutsideLegalRange.is_retryable());
        assert!(!Error::ReadsOutstanding { pending: 1 }.is_retryable());
    }

    #[test]
    fn test_maybe_committed() {
        assert!(Error::CommitUnknownResult.is_maybe_committed());
        assert!(!Error::NotCommitted.is_maybe_committed());
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::NotCommitted.code(), 1020);
        assert_eq!(Error::TransactionTimedOut.code(), 1031);
        assert_eq!(Error::UsedDuringCommit.code(), 2017);
        assert_eq!(Error::KeyOutsideLegalRange.code(), 2004);
    }

    #[test]
    fn test_error_pattern_matching() {
        let err = Error::ValueTooLarge {
            actual: 11,
            max: 10,
        };

        match err {
            Error::ValueTooLarge { actual, max } => {
                assert_eq!(actual, 11);
                assert_eq!(max, 10);
            }
            _ => panic!("Wrong error variant"),
        }
    }
}
