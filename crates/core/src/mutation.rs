//! Mutations and atomic operators
//!
//! A transaction's writes are recorded, in program order, as a log of
//! [`Mutation`]s that is shipped to the cluster at commit. Atomic operations
//! travel as operators (not as their folded results) so the cluster applies
//! them against the value current at commit time.
//!
//! [`apply_atomic_op`] is the single definition of every operator's semantics.
//! The transaction overlay uses it to fold pending operators into read results;
//! storage uses it to apply them at commit.
//!
//! ## Absent-value rules
//!
//! | Operator | existing absent | operand empty |
//! |---|---|---|
//! | add, or, xor, max | operand | operand |
//! | and, min | treated as zeros | operand |
//! | and-v2, min-v2, byte-min, byte-max | operand | normal rule |
//! | append-if-fits | operand | existing |
//! | compare-and-clear | stays absent | normal rule |

use crate::error::{Error, Result};
use crate::types::{Key, KeyRange, Value, Versionstamp};
use serde::{Deserialize, Serialize};

/// Largest value `AppendIfFits` may produce
pub const APPEND_VALUE_LIMIT: usize = 100_000;

/// Byte length of the versionstamp placeholder offset suffix
pub const VERSIONSTAMP_OFFSET_BYTES: usize = 4;

/// Mutation kinds understood by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationType {
    /// Plain set
    SetValue,
    /// Range clear
    ClearRange,
    /// Little-endian integer addition
    AddValue,
    /// Bitwise and (absent existing value treated as zeros)
    And,
    /// Bitwise or
    Or,
    /// Bitwise xor
    Xor,
    /// Append operand if the result fits in the value limit
    AppendIfFits,
    /// Little-endian unsigned maximum
    Max,
    /// Little-endian unsigned minimum (absent existing value treated as zeros)
    Min,
    /// Key contains a versionstamp placeholder
    SetVersionstampedKey,
    /// Value contains a versionstamp placeholder
    SetVersionstampedValue,
    /// Lexicographic minimum
    ByteMin,
    /// Lexicographic maximum
    ByteMax,
    /// Little-endian unsigned minimum (absent existing value yields operand)
    MinV2,
    /// Bitwise and (absent existing value yields operand)
    AndV2,
    /// Clear the key if its value equals the operand
    CompareAndClear,
}

impl MutationType {
    /// Resolve a numeric opcode as used by the cluster client
    pub fn from_code(code: u32) -> Result<Self> {
        let op = match code {
            0 => MutationType::SetValue,
            1 => MutationType::ClearRange,
            2 => MutationType::AddValue,
            6 => MutationType::And,
            7 => MutationType::Or,
            8 => MutationType::Xor,
            9 => MutationType::AppendIfFits,
            12 => MutationType::Max,
            13 => MutationType::Min,
            14 => MutationType::SetVersionstampedKey,
            15 => MutationType::SetVersionstampedValue,
            16 => MutationType::ByteMin,
            17 => MutationType::ByteMax,
            18 => MutationType::MinV2,
            19 => MutationType::AndV2,
            20 => MutationType::CompareAndClear,
            other => {
                return Err(Error::InvalidMutationType(format!(
                    "unknown opcode {}",
                    other
                )))
            }
        };
        Ok(op)
    }

    /// Numeric opcode
    pub fn code(&self) -> u32 {
        match self {
            MutationType::SetValue => 0,
            MutationType::ClearRange => 1,
            MutationType::AddValue => 2,
            MutationType::And => 6,
            MutationType::Or => 7,
            MutationType::Xor => 8,
            MutationType::AppendIfFits => 9,
            MutationType::Max => 12,
            MutationType::Min => 13,
            MutationType::SetVersionstampedKey => 14,
            MutationType::SetVersionstampedValue => 15,
            MutationType::ByteMin => 16,
            MutationType::ByteMax => 17,
            MutationType::MinV2 => 18,
            MutationType::AndV2 => 19,
            MutationType::CompareAndClear => 20,
        }
    }

    /// True for operators accepted by `atomic_op`
    pub fn is_atomic(&self) -> bool {
        !matches!(self, MutationType::SetValue | MutationType::ClearRange)
    }

    /// True for the two versionstamp operators
    pub fn is_versionstamp(&self) -> bool {
        matches!(
            self,
            MutationType::SetVersionstampedKey | MutationType::SetVersionstampedValue
        )
    }
}

/// One entry of the mutation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Set `key` to `value`
    Set {
        /// Target key
        key: Key,
        /// New value
        value: Value,
    },
    /// Clear every key in `range`
    ClearRange {
        /// Cleared range
        range: KeyRange,
    },
    /// Apply an atomic operator to `key`
    Atomic {
        /// Operator
        op: MutationType,
        /// Target key (may hold a versionstamp placeholder)
        key: Key,
        /// Operand (may hold a versionstamp placeholder)
        operand: Value,
    },
}

impl Mutation {
    /// Bytes this mutation contributes to the approximate transaction size
    pub fn expected_size(&self) -> usize {
        match self {
            Mutation::Set { key, value } => key.len() + value.len(),
            Mutation::ClearRange { range } => range.begin.len() + range.end.len(),
            Mutation::Atomic { key, operand, .. } => key.len() + operand.len(),
        }
    }

    /// True if the mutation still carries a versionstamp placeholder
    pub fn has_versionstamp(&self) -> bool {
        matches!(self, Mutation::Atomic { op, .. } if op.is_versionstamp())
    }

    /// Replace the versionstamp placeholder with `stamp`
    ///
    /// Versionstamp operators become plain sets; every other mutation is
    /// returned unchanged.
    pub fn resolve_versionstamp(&self, stamp: &Versionstamp) -> Result<Mutation> {
        match self {
            Mutation::Atomic {
                op: MutationType::SetVersionstampedKey,
                key,
                operand,
            } => Ok(Mutation::Set {
                key: Key::new(substitute_versionstamp(key.as_bytes(), stamp)?),
                value: operand.clone(),
            }),
            Mutation::Atomic {
                op: MutationType::SetVersionstampedValue,
                key,
                operand,
            } => Ok(Mutation::Set {
                key: key.clone(),
                value: Value::new(substitute_versionstamp(operand.as_bytes(), stamp)?),
            }),
            other => Ok(other.clone()),
        }
    }
}

/// Parse and validate the 4-byte little-endian placeholder offset suffix
///
/// Returns the offset of the 10-byte placeholder within the parameter once
/// the suffix is removed.
pub fn versionstamp_offset(param: &[u8]) -> Result<usize> {
    if param.len() < VERSIONSTAMP_OFFSET_BYTES {
        return Err(Error::ClientInvalidOperation(
            "versionstamp parameter shorter than its offset suffix".to_string(),
        ));
    }
    let body_len = param.len() - VERSIONSTAMP_OFFSET_BYTES;
    let mut raw = [0u8; VERSIONSTAMP_OFFSET_BYTES];
    raw.copy_from_slice(&param[body_len..]);
    let offset = u32::from_le_bytes(raw) as usize;
    if offset + Versionstamp::LEN > body_len {
        return Err(Error::ClientInvalidOperation(format!(
            "versionstamp offset {} does not fit in {} bytes",
            offset, body_len
        )));
    }
    Ok(offset)
}

/// Write `stamp` over the placeholder and strip the offset suffix
pub fn substitute_versionstamp(param: &[u8], stamp: &Versionstamp) -> Result<Vec<u8>> {
    let offset = versionstamp_offset(param)?;
    let mut out = param[..param.len() - VERSIONSTAMP_OFFSET_BYTES].to_vec();
    out[offset..offset + Versionstamp::LEN].copy_from_slice(stamp.as_bytes());
    Ok(out)
}

/// Bytes of a versionstamped key that precede the placeholder
pub fn versionstamp_key_prefix(key: &[u8]) -> Result<&[u8]> {
    let offset = versionstamp_offset(key)?;
    Ok(&key[..offset])
}

/// Apply `op` with `operand` to `existing`
///
/// Returns `None` when the result is "key absent" (only `CompareAndClear`
/// clears). Versionstamp operators and plain set/clear are not foldable and
/// yield `InvalidMutationType`.
pub fn apply_atomic_op(
    existing: Option<&[u8]>,
    op: MutationType,
    operand: &[u8],
) -> Result<Option<Value>> {
    let out = match op {
        MutationType::AddValue => little_endian_add(existing, operand),
        MutationType::And => bitwise_and(existing.unwrap_or(&[]), operand),
        MutationType::AndV2 => match existing {
            None => operand.to_vec(),
            Some(e) => bitwise_and(e, operand),
        },
        MutationType::Or => bitwise(existing, operand, |a, b| a | b),
        MutationType::Xor => bitwise(existing, operand, |a, b| a ^ b),
        MutationType::AppendIfFits => append_if_fits(existing, operand),
        MutationType::Max => little_endian_max(existing, operand),
        MutationType::Min => little_endian_min(existing.unwrap_or(&[]), operand),
        MutationType::MinV2 => match existing {
            None => operand.to_vec(),
            Some(e) => little_endian_min(e, operand),
        },
        MutationType::ByteMin => match existing {
            Some(e) if e < operand => e.to_vec(),
            _ => operand.to_vec(),
        },
        MutationType::ByteMax => match existing {
            Some(e) if e > operand => e.to_vec(),
            _ => operand.to_vec(),
        },
        MutationType::CompareAndClear => {
            return Ok(match existing {
                Some(e) if e == operand => None,
                other => other.map(Value::from),
            })
        }
        MutationType::SetValue
        | MutationType::ClearRange
        | MutationType::SetVersionstampedKey
        | MutationType::SetVersionstampedValue => {
            return Err(Error::InvalidMutationType(format!(
                "{:?} cannot be folded over an existing value",
                op
            )))
        }
    };
    Ok(Some(Value::new(out)))
}

fn little_endian_add(existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8> {
    let existing = match existing {
        Some(e) if !e.is_empty() => e,
        _ => return operand.to_vec(),
    };
    let mut out = Vec::with_capacity(operand.len());
    let mut carry = 0u16;
    for (i, &b) in operand.iter().enumerate() {
        let e = existing.get(i).copied().unwrap_or(0) as u16;
        let sum = e + b as u16 + carry;
        out.push(sum as u8);
        carry = sum >> 8;
    }
    out
}

fn bitwise_and(existing: &[u8], operand: &[u8]) -> Vec<u8> {
    operand
        .iter()
        .enumerate()
        .map(|(i, &b)| existing.get(i).map_or(0, |&e| e & b))
        .collect()
}

fn bitwise(existing: Option<&[u8]>, operand: &[u8], f: impl Fn(u8, u8) -> u8) -> Vec<u8> {
    let existing = match existing {
        Some(e) if !e.is_empty() => e,
        _ => return operand.to_vec(),
    };
    operand
        .iter()
        .enumerate()
        .map(|(i, &b)| f(existing.get(i).copied().unwrap_or(0), b))
        .collect()
}

fn append_if_fits(existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8> {
    let existing = match existing {
        Some(e) if !e.is_empty() => e,
        _ => return operand.to_vec(),
    };
    if operand.is_empty() || existing.len() + operand.len() > APPEND_VALUE_LIMIT {
        return existing.to_vec();
    }
    let mut out = Vec::with_capacity(existing.len() + operand.len());
    out.extend_from_slice(existing);
    out.extend_from_slice(operand);
    out
}

/// Existing value truncated or zero-padded to `len` bytes
fn resized(existing: &[u8], len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| existing.get(i).copied().unwrap_or(0))
        .collect()
}

/// Compare two equal-length little-endian unsigned integers
fn cmp_little_endian(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.iter().rev().cmp(b.iter().rev())
}

fn little_endian_max(existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8> {
    let existing = match existing {
        Some(e) if !e.is_empty() => e,
        _ => return operand.to_vec(),
    };
    let existing = resized(existing, operand.len());
    if cmp_little_endian(&existing, operand).is_gt() {
        existing
    } else {
        operand.to_vec()
    }
}

fn little_endian_min(existing: &[u8], operand: &[u8]) -> Vec<u8> {
    if operand.is_empty() {
        return Vec::new();
    }
    let existing = resized(existing, operand.len());
    if cmp_little_endian(&existing, operand).is_lt() {
        existing
    } else {
        operand.to_vec()
    }
}
