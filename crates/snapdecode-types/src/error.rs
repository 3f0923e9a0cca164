//! Structural decode errors.
//!
//! A [`DecodeError`] means the snapshot could not be interpreted: memory is
//! unmapped, the type description lacks a member the decoder requires, or a
//! structure is internally inconsistent. Legitimate absence (an id that is not
//! in an index, a lock with no owner) is never an error and is reported through
//! `Option` or a dedicated enum variant instead.

use crate::Address;

/// Result alias used throughout the decoder crates.
pub type DecodeResult<T> = Result<T, DecodeError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The requested range is not backed by the snapshot.
    #[error("unreadable memory: {len} byte(s) at 0x{address:x}")]
    UnreadableMemory { address: Address, len: usize },

    /// The target's type description has no such type.
    #[error("type '{0}' is not described by the target")]
    MissingType(String),

    /// The target's type description lacks a member the decoder requires.
    #[error("type '{ty}' has no member '{member}'")]
    MissingMember { ty: String, member: String },

    /// A global symbol could not be resolved.
    #[error("symbol '{0}' not found")]
    MissingSymbol(String),

    /// A named constant (enumerator or exported value) could not be resolved.
    #[error("constant '{0}' not found")]
    MissingConstant(String),

    /// Index metadata is out of range for the host.
    #[error("malformed index at 0x{root:x}: {reason}")]
    MalformedIndex { root: Address, reason: String },

    /// A list link was NULL where a circular list was expected.
    #[error("corrupt list rooted at 0x{head:x}: NULL link at 0x{at:x}")]
    CorruptList { head: Address, at: Address },

    /// The target word width is not 4 or 8 bytes.
    #[error("unsupported word size: {0} byte(s)")]
    UnsupportedWordSize(usize),

    /// A task descriptor holds a pid no task can have.
    #[error("task at 0x{task:x} has invalid pid {pid}")]
    InvalidPid { task: Address, pid: i64 },

    /// The task table cannot produce a stack trace for this task.
    #[error("no stack trace available for pid {0}")]
    StackUnavailable(u32),
}

impl DecodeError {
    pub fn missing_member(ty: &str, member: &str) -> Self {
        DecodeError::MissingMember {
            ty: ty.to_string(),
            member: member.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_address() {
        let err = DecodeError::UnreadableMemory {
            address: 0xffff_8880_0000_1000,
            len: 8,
        };
        assert_eq!(
            err.to_string(),
            "unreadable memory: 8 byte(s) at 0xffff888000001000"
        );
    }

    #[test]
    fn test_missing_member() {
        let err = DecodeError::missing_member("struct idr", "top");
        assert_eq!(err.to_string(), "type 'struct idr' has no member 'top'");
    }

    #[test]
    fn test_invalid_pid() {
        let err = DecodeError::InvalidPid {
            task: 0x9000,
            pid: -3,
        };
        assert_eq!(err.to_string(), "task at 0x9000 has invalid pid -3");
    }
}
