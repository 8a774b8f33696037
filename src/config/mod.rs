//! # Configuration Constants
//!
//! Central home for tunable constants, grouping interdependent values so a
//! change in one place surfaces its dependents. Import from here rather than
//! redefining locally.
//!
//! ## Dependency notes
//!
//! ```text
//! ARENA_ALIGN (8)
//!       │
//!       └─> record sizes round up to this; the record header contains
//!           u64 atomics, so allocations must stay 8-byte aligned.
//!
//! ARENA_HEADER_SIZE (64)
//!       │
//!       └─> first legal record offset; the zerocopy file header occupies
//!           the front of the arena and is never handed out by the
//!           allocator.
//!
//! INDEX_SLOT_ENTRIES (8) × DEFAULT_INDEX_SLOTS
//!       │
//!       └─> index capacity. A full slot surfaces MemoryOverflow, so
//!           engines sizing for N keys should provision
//!           DEFAULT_INDEX_SLOTS ≈ N / 4.
//!
//! MAX_ACCESS_THREADS (64)
//!       │
//!       └─> sizes the cleaner's per-thread cache vector and bounds the
//!           thread registry.
//! ```

/// Allocation granularity inside the arena. Record headers contain 8-byte
/// atomics and must not be placed at smaller alignments.
pub const ARENA_ALIGN: u64 = 8;

/// Bytes reserved at the front of the arena for the persisted file header.
pub const ARENA_HEADER_SIZE: u64 = 64;

/// Number of mutexes in the record edge-lock table. Power of two.
pub const EDGE_LOCK_TABLE_SIZE: usize = 1024;

/// Entries per hash-index slot.
pub const INDEX_SLOT_ENTRIES: usize = 8;

/// Default number of hash-index slots. Power of two.
pub const DEFAULT_INDEX_SLOTS: usize = 4096;

/// Batch size for space released during collection destruction and cleaner
/// sweeps; entries are returned to the allocator once this many accumulate.
pub const MAX_CACHED_OLD_RECORDS: usize = 1024;

/// Queue depth at which the global sweep steals a thread's tombstone queue.
/// Deliberately enormous: tombstones are expected to drain through the
/// bounded local path, which coordinates with the sweep timestamp. Lowering
/// this trades write-path latency for memory.
pub const TOMBSTONE_STEAL_THRESHOLD: usize = 10_000_000;

/// The bounded local clean refreshes the oldest-snapshot timestamp once per
/// this many invocations to amortize the refresh cost.
pub const SNAPSHOT_REFRESH_INTERVAL: u64 = 10_000;

/// Maximum concurrently registered access threads.
pub const MAX_ACCESS_THREADS: usize = 64;

/// Maximum concurrently pinned snapshots.
pub const MAX_SNAPSHOTS: usize = 64;

const _: () = assert!(EDGE_LOCK_TABLE_SIZE.is_power_of_two());
const _: () = assert!(DEFAULT_INDEX_SLOTS.is_power_of_two());
const _: () = assert!(ARENA_ALIGN.is_power_of_two());
