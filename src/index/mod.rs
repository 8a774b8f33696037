//! # Hash Index
//!
//! The shared fast path from key fingerprint to record offset. One slot per
//! hash bucket: a mutex (the *hash-slot lock*, the lock a writer holds for
//! the whole commit of a key, and the lock that makes per-key writes
//! single-writer) plus a small fixed array of entries.
//!
//! ## Entry format
//!
//! An entry is two atomic words:
//!
//! ```text
//! meta:   [ fingerprint:32 | kind:8 | status:8 | variant:8 | state:8 ]
//! target: record offset (RawRecord) or header record offset (Collection)
//! ```
//!
//! `state` is 1 for occupied, 0 for empty; an all-zero meta word is an
//! empty entry, so fingerprint zero never aliases emptiness.
//!
//! ## Reader protocol
//!
//! Readers take no lock. A probe loads `meta`, filters on fingerprint and
//! kind, loads `target`, confirms the key against the record's own bytes,
//! then re-reads `meta`; a change in between restarts the probe of that
//! entry once. Writers mutate entries only under the slot lock and always
//! store `target` before `meta`, so a reader that observes a stable meta
//! word has read a (meta, target) pair that was current at some instant of
//! the probe.
//!
//! The index holds **non-owning offsets**. Records are owned by their
//! collection's list; the collection (or the cleaner) erases entries before
//! record space is released, and the snapshot horizon keeps probed records
//! alive through any in-flight read.
//!
//! ## Capacity
//!
//! Slots do not chain. A lookup that needs a free entry in a full slot
//! surfaces `MemoryOverflow`, mirroring an index-arena exhaustion in the
//! original system. Engines size `DEFAULT_INDEX_SLOTS` for the expected
//! key population.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::DefaultHashBuilder;
use parking_lot::{Mutex, MutexGuard};

use crate::config::INDEX_SLOT_ENTRIES;
use crate::record::{RecordKind, RecordStatus};
use crate::storage::Allocator;
use crate::types::{KvError, MemOffset};

/// What an entry's target is: a data record, or a collection anchored by
/// its header record.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexVariant {
    RawRecord = 0,
    Collection = 1,
}

impl IndexVariant {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(IndexVariant::RawRecord),
            1 => Some(IndexVariant::Collection),
            _ => None,
        }
    }
}

const STATE_OCCUPIED: u64 = 1;

fn pack_meta(fingerprint: u32, kind: RecordKind, status: RecordStatus, variant: IndexVariant) -> u64 {
    (fingerprint as u64) << 32
        | (kind as u64) << 24
        | (status as u64) << 16
        | (variant as u64) << 8
        | STATE_OCCUPIED
}

/// Decoded view of one occupied entry at a moment in time.
#[derive(Debug, Clone, Copy)]
pub struct EntrySnapshot {
    pub kind: RecordKind,
    pub status: RecordStatus,
    pub variant: IndexVariant,
    pub target: MemOffset,
}

fn unpack_meta(meta: u64, target: MemOffset) -> Option<EntrySnapshot> {
    if meta & 0xff != STATE_OCCUPIED {
        return None;
    }
    Some(EntrySnapshot {
        kind: RecordKind::from_u8((meta >> 24) as u8)?,
        status: RecordStatus::from_u8((meta >> 16) as u8)?,
        variant: IndexVariant::from_u8((meta >> 8) as u8)?,
        target,
    })
}

struct Entry {
    meta: AtomicU64,
    target: AtomicU64,
}

struct Slot {
    lock: Mutex<()>,
    entries: [Entry; INDEX_SLOT_ENTRIES],
}

/// Position of an entry, valid while the caller holds the slot lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPos {
    slot: usize,
    idx: usize,
}

/// Outcome of a lookup: the matching entry if any, and a free entry the
/// caller may insert into (populated by create-if-absent lookups).
pub struct LookupResult {
    pub existing: Option<(EntryPos, EntrySnapshot)>,
    pub free: Option<EntryPos>,
}

impl LookupResult {
    /// The position an insert will write: the existing entry, else the
    /// reserved free one.
    fn insert_pos(&self) -> EntryPos {
        self.existing
            .map(|(pos, _)| pos)
            .or(self.free)
            .expect("insert without a reserved entry")
    }
}

pub struct HashIndex {
    slots: Box<[Slot]>,
    mask: usize,
    hasher: DefaultHashBuilder,
    allocator: Arc<Allocator>,
}

impl HashIndex {
    pub fn new(slot_count: usize, allocator: Arc<Allocator>) -> Self {
        let slot_count = slot_count.next_power_of_two();
        let slots = (0..slot_count)
            .map(|_| Slot {
                lock: Mutex::new(()),
                entries: std::array::from_fn(|_| Entry {
                    meta: AtomicU64::new(0),
                    target: AtomicU64::new(0),
                }),
            })
            .collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            mask: slot_count - 1,
            hasher: DefaultHashBuilder::default(),
            allocator,
        }
    }

    fn hash(&self, key: &[u8]) -> u64 {
        self.hasher.hash_one(key)
    }

    fn slot_of(&self, key: &[u8]) -> usize {
        self.hash(key) as usize & self.mask
    }

    fn fingerprint(&self, key: &[u8]) -> u32 {
        (self.hash(key) >> 32) as u32
    }

    /// Acquire the hash-slot lock for `key`. Writers hold this for the
    /// duration of a commit; the cleaner holds it while clearing a slot.
    pub fn slot_guard(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        self.slots[self.slot_of(key)].lock.lock()
    }

    /// Probe for `key` with the given record kind.
    ///
    /// Lock-free; see the module-level reader protocol. With
    /// `create_if_absent` a free entry is reserved in the result and a full
    /// slot surfaces `MemoryOverflow`; create-if-absent lookups must run
    /// under the slot guard.
    pub fn lookup(
        &self,
        key: &[u8],
        kind: RecordKind,
        create_if_absent: bool,
    ) -> Result<LookupResult, KvError> {
        let slot_idx = self.slot_of(key);
        let fingerprint = self.fingerprint(key);
        let slot = &self.slots[slot_idx];

        let mut free = None;
        for (idx, entry) in slot.entries.iter().enumerate() {
            'probe: loop {
                let meta = entry.meta.load(Ordering::Acquire);
                let Some(snapshot) = unpack_meta(meta, entry.target.load(Ordering::Acquire))
                else {
                    if free.is_none() {
                        free = Some(EntryPos { slot: slot_idx, idx });
                    }
                    break 'probe;
                };
                if (meta >> 32) as u32 != fingerprint || snapshot.kind != kind {
                    break 'probe;
                }
                if self.entry_key(&snapshot) != key {
                    break 'probe;
                }
                // A writer may have republished the entry between the meta
                // and target loads; a stable meta word pins the pair.
                if entry.meta.load(Ordering::Acquire) != meta {
                    continue 'probe;
                }
                return Ok(LookupResult {
                    existing: Some((EntryPos { slot: slot_idx, idx }, snapshot)),
                    free: None,
                });
            }
        }

        if create_if_absent && free.is_none() {
            return Err(KvError::MemoryOverflow);
        }
        Ok(LookupResult {
            existing: None,
            free,
        })
    }

    /// Publish an entry at the position reserved by `lookup`. Must run
    /// under the slot guard for the entry's key.
    pub fn insert(
        &self,
        lookup: &LookupResult,
        key: &[u8],
        kind: RecordKind,
        status: RecordStatus,
        variant: IndexVariant,
        target: MemOffset,
    ) {
        let pos = lookup.insert_pos();
        let entry = &self.slots[pos.slot].entries[pos.idx];
        entry.target.store(target, Ordering::Release);
        entry.meta.store(
            pack_meta(self.fingerprint(key), kind, status, variant),
            Ordering::Release,
        );
    }

    /// Clear an entry. Must run under the slot guard.
    pub fn erase(&self, pos: EntryPos) {
        let entry = &self.slots[pos.slot].entries[pos.idx];
        entry.meta.store(0, Ordering::Release);
        entry.target.store(0, Ordering::Release);
    }

    /// Clear the entry for `key` if it still points at `target`. Takes the
    /// slot lock itself; used by the cleaner when retiring tombstones whose
    /// slot may have been republished since they were queued.
    pub fn clear_if_points_to(&self, key: &[u8], kind: RecordKind, target: MemOffset) -> bool {
        let _guard = self.slot_guard(key);
        match self.lookup(key, kind, false) {
            Ok(LookupResult {
                existing: Some((pos, snapshot)),
                ..
            }) if snapshot.target == target => {
                self.erase(pos);
                true
            }
            _ => false,
        }
    }

    /// The key an entry indexes, read from the record it points at. Both
    /// variants resolve through a record: elements store the internal key,
    /// collection headers store the collection name.
    fn entry_key(&self, snapshot: &EntrySnapshot) -> &[u8] {
        self.allocator.record(snapshot.target).key()
    }
}
