//! # BurrowDB - Persistent Hash-Keyed Collection Engine
//!
//! BurrowDB stores named **hash collections** of (field → value) pairs as
//! self-describing records on circular doubly-linked lists inside an
//! offset-addressed arena, indexed by a shared hash table. Writes are
//! multi-versioned and snapshot-consistent; superseded records are retired
//! through a deferred reclamation engine. The design prioritizes:
//!
//! - **Lock-free reads**: a get probes the index and copies the value
//!   without taking any lock
//! - **Single-writer-per-key**: one hash-slot lock serializes all
//!   structural mutation for a key
//! - **Restart-stable layout**: records link by arena offset, so the
//!   persisted list topology survives remapping
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │       Hash Collection (collection)        │
//! │   Put / Get / Delete / Modify / Destroy   │
//! ├─────────────────────┬────────────────────┤
//! │  Hash Index (index) │ Version Control    │
//! │  slots + entries    │ timestamps,        │
//! │                     │ snapshots, cleaner │
//! ├─────────────────────┴────────────────────┤
//! │     Doubly-Linked Record List (list)      │
//! ├──────────────────────────────────────────┤
//! │        Record Layout (record)             │
//! ├──────────────────────────────────────────┤
//! │   Arena + Allocator (storage, mmap)       │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Consistency invariants
//!
//! 1. For any key, at most one thread holds the hash-slot lock; all
//!    structural mutation for that key happens under it
//! 2. A record superseded at timestamp T is never freed while any pinned
//!    snapshot is at or before T
//! 3. Per-key timestamps strictly increase along version chains
//! 4. A collection's size equals its count of live element records
//! 5. Walking `next` from a header always returns to the header
//!
//! ## Module Overview
//!
//! - [`storage`]: memory-mapped arena and space allocator
//! - [`record`]: persistent record layout with checksummed metadata
//! - [`list`]: circular doubly-linked list, edge locks, linkage repair
//! - [`index`]: shared hash index with lock-free reader probes
//! - [`version`]: timestamp source, snapshot pins, old-records cleaner
//! - [`collection`]: the hash collection composing all of the above
//! - [`threads`]: access-thread identities for per-thread cleaner caches

pub mod collection;
pub mod config;
pub mod index;
pub mod list;
pub mod record;
pub mod storage;
pub mod threads;
pub mod types;
pub mod version;

pub use collection::{HashCollection, HashWriteArgs, ModifyOp, WriteResult};
pub use index::{HashIndex, IndexVariant};
pub use list::{DlList, LinkageRepair, LockTable};
pub use record::{DlRecord, RecordKind, RecordStatus};
pub use storage::{Allocator, Arena, SpaceEntry};
pub use threads::{ThreadHandle, ThreadRegistry};
pub use types::{CollectionId, KvError, MemOffset, Timestamp, WriteOp};
pub use version::cleaner::{OldDataRecord, OldDeleteRecord, OldRecordsCleaner};
pub use version::{SnapshotGuard, VersionController};
