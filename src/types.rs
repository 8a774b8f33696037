//! # Shared Types
//!
//! Crate-wide aliases, sentinels, and the domain error enum. Everything that
//! crosses module boundaries lives here so the record, list, index, and
//! cleaner layers agree on representations.
//!
//! ## Offsets
//!
//! Records are addressed by their byte offset inside the arena, not by
//! pointer. Offsets stay valid across process restarts (the arena is a
//! memory-mapped file remapped at an arbitrary base address), which is why
//! every persisted link field is a `MemOffset`. `NULL_OFFSET` is the "no
//! record" sentinel; it is `u64::MAX` rather than zero because offset zero
//! is a valid location inside the arena header region.
//!
//! ## Timestamps
//!
//! `Timestamp` is a monotone logical clock issued by the version controller.
//! It orders versions of a key and gates reclamation against pinned
//! snapshots. `ExpireTime` is wall-clock milliseconds since the unix epoch;
//! `PERSIST_FOREVER` marks a collection that never expires.
//!
//! ## Errors
//!
//! `KvError` carries the domain outcomes callers must dispatch on. Missing
//! keys are `Option::None`, not errors; infrastructure failures (file IO,
//! mapping) use `eyre::Result` in the storage layer.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotone logical clock value assigned by the version controller.
pub type Timestamp = u64;

/// Identifier of a collection, embedded in element keys and header values.
pub type CollectionId = u64;

/// Byte offset of a record inside the arena.
pub type MemOffset = u64;

/// Absolute expiry in unix milliseconds.
pub type ExpireTime = i64;

/// "No record" link value.
pub const NULL_OFFSET: MemOffset = u64::MAX;

/// Expiry sentinel for collections that never expire.
pub const PERSIST_FOREVER: ExpireTime = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Put,
    Delete,
}

/// Domain errors surfaced to callers.
///
/// `NotFound` is deliberately absent: point lookups return `Option`. The
/// doubly-linked list's internal retry signal never leaves the list module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvError {
    /// The allocator could not satisfy a space request.
    MemoryOverflow,
    /// Write arguments were staged for a different collection.
    InvalidArgument,
    /// A modify callback requested abort, or an index check found a
    /// mismatch.
    Abort,
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::MemoryOverflow => write!(f, "out of arena space"),
            KvError::InvalidArgument => write!(f, "invalid argument"),
            KvError::Abort => write!(f, "operation aborted"),
        }
    }
}

impl std::error::Error for KvError {}

/// Current wall clock in unix milliseconds.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Whether an absolute expiry has passed. `PERSIST_FOREVER` never expires.
pub fn is_expired(expire_time: ExpireTime) -> bool {
    expire_time != PERSIST_FOREVER && expire_time <= unix_millis()
}
