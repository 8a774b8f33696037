//! # Arena Allocator
//!
//! Hands out disjoint byte regions of the arena to record writers and takes
//! them back from the cleaner. Two mechanisms:
//!
//! - **Bump watermark**: a monotone tail offset; fresh space is carved from
//!   the end with a CAS loop, so allocation on the fast path takes no lock.
//! - **Free lists**: space returned by `free`/`batch_free` is binned by
//!   block size under a mutex and reused for requests the bin can satisfy.
//!
//! Freed blocks keep their original size: a reused block may be larger than
//! the request, and the returned `SpaceEntry::size` reports the real block
//! size so the record written into it can be freed exactly once with the
//! right extent.
//!
//! Free lists are volatile. On reopen the persisted watermark restores the
//! bump tail and reclaimed-but-unreused space is rediscovered by the
//! engine's recovery scan (destroyed records have kind `Empty`).
//!
//! ## Failure surface
//!
//! `allocate` returns `None` when neither a free bin nor the remaining tail
//! can satisfy the request. Callers surface this as `MemoryOverflow`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use parking_lot::Mutex;

use crate::config::{ARENA_ALIGN, ARENA_HEADER_SIZE};
use crate::record::DlRecord;
use crate::types::{MemOffset, NULL_OFFSET};

use super::arena::Arena;

/// A contiguous region of arena space: the unit of allocation and free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceEntry {
    pub offset: MemOffset,
    pub size: u64,
}

impl SpaceEntry {
    pub fn new(offset: MemOffset, size: u64) -> Self {
        Self { offset, size }
    }
}

/// Size-binned free space plus statistics, guarded by one mutex.
#[derive(Default)]
struct FreeLists {
    bins: BTreeMap<u64, Vec<MemOffset>>,
    free_bytes: u64,
}

pub struct Allocator {
    arena: Arena,
    tail: AtomicU64,
    free: Mutex<FreeLists>,
}

impl Allocator {
    pub fn new(arena: Arena) -> Self {
        let tail = arena.stored_tail().max(ARENA_HEADER_SIZE);
        Self {
            arena,
            tail: AtomicU64::new(tail),
            free: Mutex::new(FreeLists::default()),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Allocate at least `size` bytes, rounded up to the arena alignment.
    /// Returns `None` on exhaustion.
    pub fn allocate(&self, size: u64) -> Option<SpaceEntry> {
        if size == 0 {
            return None;
        }
        let size = align_up(size);

        {
            let mut free = self.free.lock();
            // Smallest bin that fits; the block keeps its recorded size.
            let bin_size = free.bins.range(size..).next().map(|(s, _)| *s);
            if let Some(bin_size) = bin_size {
                let offsets = free.bins.get_mut(&bin_size).expect("bin exists");
                let offset = offsets.pop().expect("non-empty bin");
                if offsets.is_empty() {
                    free.bins.remove(&bin_size);
                }
                free.free_bytes -= bin_size;
                return Some(SpaceEntry::new(offset, bin_size));
            }
        }

        let capacity = self.arena.capacity();
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            if capacity - tail < size {
                return None;
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail + size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(SpaceEntry::new(tail, size)),
                Err(current) => tail = current,
            }
        }
    }

    pub fn free(&self, entry: SpaceEntry) {
        debug_assert!(self.arena.contains(entry.offset));
        debug_assert!(entry.size > 0);
        let mut free = self.free.lock();
        free.bins.entry(entry.size).or_default().push(entry.offset);
        free.free_bytes += entry.size;
    }

    /// Return many entries under one lock acquisition.
    pub fn batch_free<I: IntoIterator<Item = SpaceEntry>>(&self, entries: I) {
        let mut free = self.free.lock();
        for entry in entries {
            debug_assert!(self.arena.contains(entry.offset));
            free.bins.entry(entry.size).or_default().push(entry.offset);
            free.free_bytes += entry.size;
        }
    }

    /// Bytes sitting in free bins awaiting reuse.
    pub fn free_bytes(&self) -> u64 {
        self.free.lock().free_bytes
    }

    /// Bytes carved from the bump tail so far.
    pub fn bytes_allocated(&self) -> u64 {
        self.tail.load(Ordering::Relaxed) - ARENA_HEADER_SIZE
    }

    /// Persist the bump watermark and flush the mapping.
    pub fn sync(&self) -> Result<()> {
        self.arena.store_tail(self.tail.load(Ordering::SeqCst));
        self.arena.flush()
    }

    /// Raw pointer at `offset`; panics when out of range.
    pub fn ptr_at(&self, offset: MemOffset) -> *mut u8 {
        self.arena.ptr_at(offset)
    }

    /// View the record at `offset`. Panics on out-of-range offsets; callers
    /// pass offsets taken from record links or index entries, which only
    /// ever hold valid record positions or `NULL_OFFSET`.
    pub fn record(&self, offset: MemOffset) -> &DlRecord {
        assert_ne!(offset, NULL_OFFSET, "dereferencing null record offset");
        // SAFETY: offset is bounds-checked by ptr_at; record positions come
        // from links written by record construction, which placed a valid
        // header there (module safety model in storage::arena).
        unsafe { &*(self.arena.ptr_at(offset) as *const DlRecord) }
    }

    /// View the record at `offset`, or `None` for `NULL_OFFSET`.
    pub fn try_record(&self, offset: MemOffset) -> Option<&DlRecord> {
        if offset == NULL_OFFSET || !self.arena.contains(offset) {
            return None;
        }
        Some(self.record(offset))
    }

    /// Offset of a record inside the arena.
    pub fn offset_of(&self, record: &DlRecord) -> MemOffset {
        self.arena.offset_of(record as *const DlRecord as *const u8)
    }

    /// Offset of a record inside the arena, or `None` for a record that
    /// does not live in it.
    pub fn try_offset_of(&self, record: &DlRecord) -> Option<MemOffset> {
        self.arena
            .try_offset_of(record as *const DlRecord as *const u8)
    }
}

fn align_up(size: u64) -> u64 {
    (size + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
}
