//! Key-space layout and size limits
//!
//! ## Key space
//!
//! ```text
//! ""          .. "\xff"        normal keys      (readable / writable by default)
//! "\xff"      .. "\xff\xff"    system keys      (need read_system_keys / access_system_keys)
//! "\xff\xff"  .. "\xff\xff\xff" special keys    (routed to the special key space)
//! ```
//!
//! ## Sizes
//!
//! Limits mirror the cluster's: writes above them are rejected at call time,
//! and the accumulated transaction size is checked at commit.

use crate::error::{Error, Result};
use crate::types::{Key, KeyRange, Value};
use serde::{Deserialize, Serialize};

/// First system key
pub const SYSTEM_KEYS_BEGIN: &[u8] = b"\xff";
/// End of the normal + system key space
pub const ALL_KEYS_END: &[u8] = b"\xff\xff";
/// First special key
pub const SPECIAL_KEYS_BEGIN: &[u8] = b"\xff\xff";
/// End of the special key space
pub const SPECIAL_KEYS_END: &[u8] = b"\xff\xff\xff";

/// Overhead charged per mutation in the approximate transaction size
pub const MUTATION_OVERHEAD: usize = 24;
/// Overhead charged per conflict range in the approximate transaction size
pub const CONFLICT_RANGE_OVERHEAD: usize = 32;

/// Range of normal keys `["", "\xff")`
pub fn normal_keys() -> KeyRange {
    KeyRange::new(Key::empty(), SYSTEM_KEYS_BEGIN)
}

/// Range of all non-special keys `["", "\xff\xff")`
pub fn all_keys() -> KeyRange {
    KeyRange::new(Key::empty(), ALL_KEYS_END)
}

/// Range of special keys `["\xff\xff", "\xff\xff\xff")`
pub fn special_keys() -> KeyRange {
    KeyRange::new(SPECIAL_KEYS_BEGIN, SPECIAL_KEYS_END)
}

/// True if `key` lies in the special key space
pub fn is_special_key(key: &Key) -> bool {
    key.starts_with(SPECIAL_KEYS_BEGIN)
}

/// True if `key` lies in the system key space (special keys included)
pub fn is_system_key(key: &Key) -> bool {
    key.starts_with(SYSTEM_KEYS_BEGIN)
}

/// Size limits for keys, values and whole transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum key length in bytes (default: 10,000)
    pub max_key_bytes: usize,

    /// Maximum system key length in bytes (default: 30,000)
    pub max_system_key_bytes: usize,

    /// Maximum value length in bytes (default: 100,000)
    pub max_value_bytes: usize,

    /// Maximum approximate transaction size in bytes (default: 10,000,000)
    pub max_transaction_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_key_bytes: 10_000,
            max_system_key_bytes: 30_000,
            max_value_bytes: 100_000,
            max_transaction_bytes: 10_000_000,
        }
    }
}

impl Limits {
    /// Create limits with small values for testing
    ///
    /// Lets unit tests exercise limit enforcement without huge buffers.
    pub fn with_small_limits() -> Self {
        Limits {
            max_key_bytes: 16,
            max_system_key_bytes: 32,
            max_value_bytes: 64,
            max_transaction_bytes: 1024,
        }
    }

    /// Key length limit that applies to `key`
    pub fn key_limit_for(&self, key: &Key) -> usize {
        if is_system_key(key) {
            self.max_system_key_bytes
        } else {
            self.max_key_bytes
        }
    }

    /// True if `key` is longer than any stored key may be
    pub fn key_exceeds_limit(&self, key: &Key) -> bool {
        key.len() > self.key_limit_for(key)
    }

    /// Validate a key about to be written
    pub fn validate_key(&self, key: &Key) -> Result<()> {
        let max = self.key_limit_for(key);
        if key.len() > max {
            return Err(Error::KeyTooLarge {
                actual: key.len(),
                max,
            });
        }
        Ok(())
    }

    /// Validate a value about to be written
    pub fn validate_value(&self, value: &Value) -> Result<()> {
        if value.len() > self.max_value_bytes {
            return Err(Error::ValueTooLarge {
                actual: value.len(),
                max: self.max_value_bytes,
            });
        }
        Ok(())
    }

    /// Validate the accumulated transaction size before commit
    pub fn validate_transaction_size(&self, approximate_size: usize) -> Result<()> {
        if approximate_size > self.max_transaction_bytes {
            return Err(Error::TransactionTooLarge {
                actual: approximate_size,
                max: self.max_transaction_bytes,
            });
        }
        Ok(())
    }
}
