//! # Arena
//!
//! An offset-stable byte region backing all records. The arena is either a
//! memory-mapped file (persistent) or an anonymous mapping (volatile); in
//! both cases records are addressed by byte offset, never by pointer, so the
//! persisted linked-list topology survives remapping at a different base
//! address.
//!
//! ## Layout
//!
//! ```text
//! Offset 0:                  ArenaHeader (64 bytes reserved)
//! Offset ARENA_HEADER_SIZE:  record space, handed out by the allocator
//! ...
//! Offset capacity:           end of mapping
//! ```
//!
//! The header carries magic bytes, a format version, the capacity, and the
//! allocator's bump watermark. The watermark is persisted on `sync` so a
//! reopened arena resumes allocation past every record ever written. Free
//! lists are in-memory only and are reconstructed by higher layers (the
//! engine's recovery scan), matching the rule that only the record layout
//! is persisted.
//!
//! ## Safety Model
//!
//! The arena exposes its base pointer and lets callers do raw reads and
//! writes at offsets. This is sound only because of the discipline enforced
//! by the layers above:
//!
//! 1. The allocator hands out disjoint `[offset, offset+size)` regions, so
//!    record construction writes to memory nothing else references.
//! 2. After construction a record is published with release ordering and
//!    all its mutable fields are atomics; immutable fields are never
//!    written again until `destroy`, which is gated by the snapshot
//!    horizon.
//! 3. The mapping outlives every reference handed out: records are only
//!    reachable through the `Allocator`, which owns the arena.

use std::fs::OpenOptions;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{ARENA_ALIGN, ARENA_HEADER_SIZE};
use crate::types::MemOffset;

pub const ARENA_MAGIC: &[u8; 16] = b"BurrowDB Arena\x00\x00";
pub const ARENA_VERSION: u64 = 1;

/// Persisted header at offset 0 of a file-backed arena.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ArenaHeader {
    magic: [u8; 16],
    version: U64,
    capacity: U64,
    tail: U64,
}

impl ArenaHeader {
    fn new(capacity: u64, tail: u64) -> Self {
        Self {
            magic: *ARENA_MAGIC,
            version: U64::new(ARENA_VERSION),
            capacity: U64::new(capacity),
            tail: U64::new(tail),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.get()
    }

    pub fn tail(&self) -> u64 {
        self.tail.get()
    }
}

/// Offset-addressed byte region, file-backed or anonymous.
pub struct Arena {
    mmap: MmapMut,
    base: *mut u8,
    capacity: u64,
    file_backed: bool,
}

// SAFETY: the raw base pointer aliases the mapping owned by `mmap`; all
// concurrent access goes through offsets handed out by the allocator or
// through atomic record fields (see the module-level safety model).
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create a new file-backed arena of `capacity` bytes.
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            capacity > ARENA_HEADER_SIZE,
            "arena capacity {} does not fit the {}-byte header",
            capacity,
            ARENA_HEADER_SIZE
        );
        ensure!(
            capacity % ARENA_ALIGN == 0,
            "arena capacity {} is not a multiple of the allocation alignment {}",
            capacity,
            ARENA_ALIGN
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create arena file '{}'", path.display()))?;
        file.set_len(capacity)
            .wrap_err_with(|| format!("failed to size arena file to {} bytes", capacity))?;

        // SAFETY: the file was just created with exclusive access and sized
        // to `capacity`; the mapping's lifetime is tied to the Arena, and
        // all access is bounds-checked against `capacity`.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = ArenaHeader::new(capacity, ARENA_HEADER_SIZE);
        mmap[..size_of::<ArenaHeader>()].copy_from_slice(header.as_bytes());

        let base = mmap.as_mut_ptr();
        Ok(Self {
            mmap,
            base,
            capacity,
            file_backed: true,
        })
    }

    /// Open an existing file-backed arena, validating its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open arena file '{}'", path.display()))?;
        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        ensure!(
            file_size > ARENA_HEADER_SIZE,
            "arena file '{}' is too small ({} bytes)",
            path.display(),
            file_size
        );

        // SAFETY: same contract as `create`; the file is opened read+write
        // and the mapping lives as long as the Arena.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = ArenaHeader::ref_from_bytes(&mmap[..size_of::<ArenaHeader>()])
            .map_err(|e| eyre::eyre!("failed to read arena header: {:?}", e))?;
        ensure!(
            &header.magic == ARENA_MAGIC,
            "'{}' is not an arena file (bad magic)",
            path.display()
        );
        ensure!(
            header.version.get() == ARENA_VERSION,
            "unsupported arena version {} in '{}'",
            header.version.get(),
            path.display()
        );
        ensure!(
            header.capacity() == file_size,
            "arena header capacity {} does not match file size {}",
            header.capacity(),
            file_size
        );

        let capacity = header.capacity();
        let base = mmap.as_mut_ptr();
        Ok(Self {
            mmap,
            base,
            capacity,
            file_backed: true,
        })
    }

    /// Create an anonymous (non-persistent) arena, useful for tests and
    /// volatile deployments.
    pub fn anonymous(capacity: u64) -> Result<Self> {
        ensure!(
            capacity > ARENA_HEADER_SIZE && capacity % ARENA_ALIGN == 0,
            "bad anonymous arena capacity {}",
            capacity
        );
        let mut mmap = MmapMut::map_anon(capacity as usize)
            .wrap_err("failed to create anonymous mapping")?;
        let header = ArenaHeader::new(capacity, ARENA_HEADER_SIZE);
        mmap[..size_of::<ArenaHeader>()].copy_from_slice(header.as_bytes());
        let base = mmap.as_mut_ptr();
        Ok(Self {
            mmap,
            base,
            capacity,
            file_backed: false,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The allocator watermark recorded in the persisted header.
    pub fn stored_tail(&self) -> u64 {
        let header = ArenaHeader::ref_from_bytes(&self.mmap[..size_of::<ArenaHeader>()])
            .expect("arena header mapped at offset 0");
        header.tail()
    }

    /// Record the allocator watermark in the persisted header.
    pub fn store_tail(&self, tail: u64) {
        debug_assert!(tail >= ARENA_HEADER_SIZE && tail <= self.capacity);
        let header = ArenaHeader::new(self.capacity, tail);
        // SAFETY: the header region is never handed out by the allocator,
        // so this write aliases no record; callers serialize `store_tail`
        // through the allocator's sync path.
        unsafe {
            std::ptr::copy_nonoverlapping(
                header.as_bytes().as_ptr(),
                self.base,
                size_of::<ArenaHeader>(),
            );
        }
    }

    /// Flush the mapping to its backing file. No-op for anonymous arenas.
    pub fn flush(&self) -> Result<()> {
        if self.file_backed {
            self.mmap.flush().wrap_err("failed to flush arena mapping")?;
        }
        Ok(())
    }

    pub fn contains(&self, offset: MemOffset) -> bool {
        offset >= ARENA_HEADER_SIZE && offset < self.capacity
    }

    /// Raw pointer at `offset`. Panics on out-of-range offsets.
    ///
    /// The returned pointer aliases the mapping; see the module-level safety
    /// model for the rules governing reads and writes through it.
    pub fn ptr_at(&self, offset: MemOffset) -> *mut u8 {
        assert!(
            self.contains(offset),
            "arena offset {} out of range (capacity {})",
            offset,
            self.capacity
        );
        // SAFETY: offset is bounds-checked above.
        unsafe { self.base.add(offset as usize) }
    }

    /// Offset of a pointer inside the mapping. Panics if `ptr` is outside.
    pub fn offset_of(&self, ptr: *const u8) -> MemOffset {
        self.try_offset_of(ptr)
            .expect("pointer does not belong to this arena")
    }

    /// Offset of a pointer inside the mapping, or `None` for a pointer
    /// outside it.
    pub fn try_offset_of(&self, ptr: *const u8) -> Option<MemOffset> {
        let base = self.base as usize;
        let addr = ptr as usize;
        if addr >= base && (addr - base) < self.capacity as usize {
            Some((addr - base) as MemOffset)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_arena_has_requested_capacity() {
        let arena = Arena::anonymous(1 << 20).unwrap();
        assert_eq!(arena.capacity(), 1 << 20);
    }

    #[test]
    fn header_region_is_not_addressable() {
        let arena = Arena::anonymous(1 << 20).unwrap();
        assert!(!arena.contains(0));
        assert!(!arena.contains(ARENA_HEADER_SIZE - 1));
        assert!(arena.contains(ARENA_HEADER_SIZE));
    }

    #[test]
    fn tail_round_trips_through_header() {
        let arena = Arena::anonymous(1 << 20).unwrap();
        assert_eq!(arena.stored_tail(), ARENA_HEADER_SIZE);
        arena.store_tail(4096);
        assert_eq!(arena.stored_tail(), 4096);
    }

    #[test]
    fn offset_of_inverts_ptr_at() {
        let arena = Arena::anonymous(1 << 20).unwrap();
        let off = ARENA_HEADER_SIZE + 128;
        let ptr = arena.ptr_at(off);
        assert_eq!(arena.offset_of(ptr), off);
        assert_eq!(arena.try_offset_of(ptr), Some(off));
    }

    #[test]
    fn try_offset_of_rejects_foreign_pointer() {
        let arena = Arena::anonymous(1 << 20).unwrap();
        let outside = [0u8; 8];
        assert_eq!(arena.try_offset_of(outside.as_ptr()), None);
    }

    #[test]
    fn file_arena_reopens_with_stored_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.arena");
        {
            let arena = Arena::create(&path, 1 << 20).unwrap();
            arena.store_tail(8192);
            arena.flush().unwrap();
        }
        let arena = Arena::open(&path).unwrap();
        assert_eq!(arena.capacity(), 1 << 20);
        assert_eq!(arena.stored_tail(), 8192);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.arena");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        assert!(Arena::open(&path).is_err());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn ptr_at_panics_past_capacity() {
        let arena = Arena::anonymous(1 << 20).unwrap();
        arena.ptr_at(1 << 20);
    }
}
