//! Transaction options
//!
//! Options arrive one at a time as [`TransactionOption`] values and are folded
//! into a [`TransactionOptions`] struct that the session consults. Every option
//! except `NextWriteNoWriteConflictRange` is persistent: the session remembers
//! it and re-applies it after `reset` and `on_error`.

use std::time::Duration;

use rywdb_core::limits::{ALL_KEYS_END, SYSTEM_KEYS_BEGIN};
use rywdb_core::{Error, Key, Result};

/// A single option applied to a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOption {
    /// Reads go straight to the cluster; writes are not visible to later reads
    ReadYourWritesDisable,
    /// Fetch only what a range read needs, without read-ahead
    ReadAheadDisable,
    /// Allow reads of system keys (`\xff` ..)
    ReadSystemKeys,
    /// Allow writes of system keys (`\xff` ..)
    WriteSystemKeys,
    /// Allow reads and writes of system keys
    AccessSystemKeys,
    /// Do not add a write conflict range for the next write
    NextWriteNoWriteConflictRange,
    /// Abort the transaction after this many milliseconds; 0 disables
    Timeout(i64),
    /// Maximum retries granted by `on_error`; -1 means unlimited
    RetryLimit(i64),
    /// Cap on the backoff between retries, in milliseconds
    MaxRetryDelay(i64),
    /// Snapshot reads see the transaction's own writes; balances one `SnapshotRywDisable`
    SnapshotRywEnable,
    /// Snapshot reads bypass the transaction's own writes; balances one `SnapshotRywEnable`
    SnapshotRywDisable,
    /// Log every retry under this transaction name
    DebugRetryLogging(String),
    /// Writes after commit started are silently ignored
    UsedDuringCommitProtectionDisable,
    /// Special key range reads may span several modules
    SpecialKeySpaceRelaxed,
    /// Allow writes to the special key space
    SpecialKeySpaceEnableWrites,
}

impl TransactionOption {
    /// True if the option survives `reset` and `on_error`
    pub fn is_persistent(&self) -> bool {
        !matches!(self, TransactionOption::NextWriteNoWriteConflictRange)
    }
}

/// Effective option state of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Reads bypass the write map and snapshot cache
    pub ryw_disabled: bool,
    /// Range reads fetch only what they return
    pub read_ahead_disabled: bool,
    /// System keys are readable
    pub read_system_keys: bool,
    /// System keys are writable
    pub write_system_keys: bool,
    /// System keys are readable and writable
    pub access_system_keys: bool,
    /// Next write skips its write conflict range
    pub next_write_no_write_conflict_range: bool,
    /// Deadline measured from the transaction's creation
    pub timeout: Option<Duration>,
    /// Retries granted by `on_error`; `None` is unlimited
    pub max_retries: Option<u32>,
    /// Backoff cap; `None` defers to the retry policy
    pub max_retry_delay: Option<Duration>,
    /// Snapshot reads consult the write map while this is positive
    pub snapshot_ryw: i32,
    /// Name used by retry logging
    pub debug_transaction_name: Option<String>,
    /// Writes after commit started are ignored without poisoning the session
    pub used_during_commit_protection_disabled: bool,
    /// Special key reads may cross modules
    pub special_key_space_relaxed: bool,
    /// Special key writes allowed
    pub special_key_space_enable_writes: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        TransactionOptions {
            ryw_disabled: false,
            read_ahead_disabled: false,
            read_system_keys: false,
            write_system_keys: false,
            access_system_keys: false,
            next_write_no_write_conflict_range: false,
            timeout: None,
            max_retries: None,
            max_retry_delay: None,
            snapshot_ryw: 1,
            debug_transaction_name: None,
            used_during_commit_protection_disabled: false,
            special_key_space_relaxed: false,
            special_key_space_enable_writes: false,
        }
    }
}

fn non_negative_millis(name: &str, ms: i64) -> Result<Duration> {
    u64::try_from(ms)
        .map(Duration::from_millis)
        .map_err(|_| Error::InvalidOptionValue(format!("{} must be >= 0, got {}", name, ms)))
}

impl TransactionOptions {
    /// Fold one option into the state
    pub fn apply(&mut self, option: &TransactionOption) -> Result<()> {
        match option {
            TransactionOption::ReadYourWritesDisable => self.ryw_disabled = true,
            TransactionOption::ReadAheadDisable => self.read_ahead_disabled = true,
            TransactionOption::ReadSystemKeys => self.read_system_keys = true,
            TransactionOption::WriteSystemKeys => self.write_system_keys = true,
            TransactionOption::AccessSystemKeys => self.access_system_keys = true,
            TransactionOption::NextWriteNoWriteConflictRange => {
                self.next_write_no_write_conflict_range = true
            }
            TransactionOption::Timeout(ms) => {
                let timeout = non_negative_millis("timeout", *ms)?;
                self.timeout = (!timeout.is_zero()).then_some(timeout);
            }
            TransactionOption::RetryLimit(n) => {
                self.max_retries = match *n {
                    -1 => None,
                    n => Some(u32::try_from(n).map_err(|_| {
                        Error::InvalidOptionValue(format!("retry limit must be >= -1, got {}", n))
                    })?),
                };
            }
            TransactionOption::MaxRetryDelay(ms) => {
                self.max_retry_delay = Some(non_negative_millis("max retry delay", *ms)?);
            }
            TransactionOption::SnapshotRywEnable => self.snapshot_ryw += 1,
            TransactionOption::SnapshotRywDisable => self.snapshot_ryw -= 1,
            TransactionOption::DebugRetryLogging(name) => {
                self.debug_transaction_name = Some(name.clone())
            }
            TransactionOption::UsedDuringCommitProtectionDisable => {
                self.used_during_commit_protection_disabled = true
            }
            TransactionOption::SpecialKeySpaceRelaxed => self.special_key_space_relaxed = true,
            TransactionOption::SpecialKeySpaceEnableWrites => {
                self.special_key_space_enable_writes = true
            }
        }
        Ok(())
    }

    /// Build options from a list, in order
    pub fn from_options<'a>(options: impl IntoIterator<Item = &'a TransactionOption>) -> Result<Self> {
        let mut out = TransactionOptions::default();
        for option in options {
            out.apply(option)?;
        }
        Ok(out)
    }

    /// First key reads may not touch
    pub fn max_read_key(&self) -> Key {
        if self.read_system_keys || self.access_system_keys {
            Key::from(ALL_KEYS_END)
        } else {
            Key::from(SYSTEM_KEYS_BEGIN)
        }
    }

    /// First key writes may not touch
    pub fn max_write_key(&self) -> Key {
        if self.write_system_keys || self.access_system_keys {
            Key::from(ALL_KEYS_END)
        } else {
            Key::from(SYSTEM_KEYS_BEGIN)
        }
    }

    /// True if reads should consult the write map
    pub fn reads_see_writes(&self, snapshot: bool) -> bool {
        !self.ryw_disabled && (!snapshot || self.snapshot_ryw > 0)
    }
}
