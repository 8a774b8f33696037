//! # Persistent Records
//!
//! The self-describing, fixed-layout entry every collection is built from.
//! A record is written exactly once into pre-allocated arena space; after
//! publication only its link fields (`prev`, `next`, `old_version`) change,
//! and those are atomics. Destruction zeroes the kind and rewrites the
//! checksum so a recovery scan cannot mistake freed space for live data.
//!
//! ## Binary Layout
//!
//! ```text
//! Offset  Size  Field         Mutability
//! ------  ----  ------------  --------------------------------------
//! 0       4     checksum      rewritten by destroy()
//! 4       4     record_size   immutable
//! 8       1     kind          zeroed by destroy()
//! 9       1     status        immutable
//! 10      2     key_len       immutable
//! 12      4     value_len     immutable
//! 16      8     timestamp     immutable
//! 24      8     old_version   atomic (version chain link)
//! 32      8     prev          atomic (list edge)
//! 40      8     next          atomic (list edge)
//! 48      8     expire_time   immutable (header records)
//! 56      k+v   key ‖ value   immutable
//! ```
//!
//! The checksum covers the immutable metadata plus the key and value bytes.
//! Link fields and the expiry are excluded: edges churn on every neighbour
//! insertion and must not invalidate the record, and the expiry lives only
//! on header records which are replaced wholesale when it changes.
//!
//! ## Why offsets in the link fields
//!
//! The arena is remapped at an arbitrary base address on reopen; a stored
//! pointer would dangle. Offsets are stable, and `NULL_OFFSET` (not zero)
//! marks "no link" because offset zero is inside the arena header.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crc::{Crc, CRC_32_ISCSI};

use crate::config::ARENA_ALIGN;
use crate::types::{is_expired, ExpireTime, MemOffset, Timestamp};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Role of a record. The hash collection produces only `HashHeader` and
/// `HashElem`; the string and sorted kinds exist because the old-records
/// cleaner dispatches over every kind the wider engine stores.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Destroyed record; space awaiting (re)use.
    Empty = 0,
    StringData = 1,
    StringTombstone = 2,
    SortedHeader = 3,
    SortedData = 4,
    SortedTombstone = 5,
    HashHeader = 6,
    HashElem = 7,
}

impl RecordKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RecordKind::Empty),
            1 => Some(RecordKind::StringData),
            2 => Some(RecordKind::StringTombstone),
            3 => Some(RecordKind::SortedHeader),
            4 => Some(RecordKind::SortedData),
            5 => Some(RecordKind::SortedTombstone),
            6 => Some(RecordKind::HashHeader),
            7 => Some(RecordKind::HashElem),
            _ => None,
        }
    }

    /// Element of some doubly-linked collection (not an anchor).
    pub fn is_elem(self) -> bool {
        matches!(
            self,
            RecordKind::HashElem | RecordKind::SortedData | RecordKind::SortedTombstone
        )
    }

    /// Anchor record of a collection's circular list.
    pub fn is_header(self) -> bool {
        matches!(self, RecordKind::HashHeader | RecordKind::SortedHeader)
    }
}

/// Whether a record is the live version. A `HashElem` with status
/// `Outdated` is a tombstone or a superseded version.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Normal = 0,
    Outdated = 1,
}

impl RecordStatus {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RecordStatus::Normal),
            1 => Some(RecordStatus::Outdated),
            _ => None,
        }
    }
}

/// A doubly-linked record in the arena. Key and value bytes follow the
/// header immediately; accessors slice them out of the mapping.
#[repr(C)]
pub struct DlRecord {
    checksum: AtomicU32,
    record_size: u32,
    kind: AtomicU8,
    status: u8,
    key_len: u16,
    value_len: u32,
    timestamp: u64,
    old_version: AtomicU64,
    prev: AtomicU64,
    next: AtomicU64,
    expire_time: i64,
}

pub const RECORD_HEADER_SIZE: usize = size_of::<DlRecord>();
const _: () = assert!(RECORD_HEADER_SIZE == 56);

/// Aligned arena bytes required for a record with the given payload.
pub fn record_size(key_len: usize, value_len: usize) -> u64 {
    let raw = RECORD_HEADER_SIZE as u64 + key_len as u64 + value_len as u64;
    (raw + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
}

/// Everything needed to place a record into allocated space.
pub struct RecordInit<'a> {
    pub record_size: u32,
    pub timestamp: Timestamp,
    pub kind: RecordKind,
    pub status: RecordStatus,
    pub old_version: MemOffset,
    pub prev: MemOffset,
    pub next: MemOffset,
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub expire_time: ExpireTime,
}

impl DlRecord {
    /// Construct a record in pre-allocated space.
    ///
    /// # Safety
    ///
    /// `at` must point to at least `init.record_size` writable bytes,
    /// 8-byte aligned, that nothing else references (a freshly allocated
    /// `SpaceEntry`). `init.record_size` must be at least
    /// `record_size(key.len(), value.len())`.
    pub unsafe fn write_new(at: *mut u8, init: RecordInit<'_>) -> *mut DlRecord {
        debug_assert!(
            init.record_size as u64 >= record_size(init.key.len(), init.value.len()),
            "space too small for record payload"
        );
        debug_assert_eq!(at as usize % ARENA_ALIGN as usize, 0);
        let record = at as *mut DlRecord;
        record.write(DlRecord {
            checksum: AtomicU32::new(0),
            record_size: init.record_size,
            kind: AtomicU8::new(init.kind as u8),
            status: init.status as u8,
            key_len: init.key.len() as u16,
            value_len: init.value.len() as u32,
            timestamp: init.timestamp,
            old_version: AtomicU64::new(init.old_version),
            prev: AtomicU64::new(init.prev),
            next: AtomicU64::new(init.next),
            expire_time: init.expire_time,
        });
        let data = at.add(RECORD_HEADER_SIZE);
        std::ptr::copy_nonoverlapping(init.key.as_ptr(), data, init.key.len());
        std::ptr::copy_nonoverlapping(
            init.value.as_ptr(),
            data.add(init.key.len()),
            init.value.len(),
        );
        let rec = &*record;
        rec.checksum.store(rec.compute_checksum(), Ordering::Release);
        record
    }

    pub fn kind(&self) -> RecordKind {
        let raw = self.kind.load(Ordering::Acquire);
        RecordKind::from_u8(raw)
            .unwrap_or_else(|| panic!("corrupted record: unknown kind {}", raw))
    }

    pub fn status(&self) -> RecordStatus {
        RecordStatus::from_u8(self.status)
            .unwrap_or_else(|| panic!("corrupted record: unknown status {}", self.status))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    pub fn expire_time(&self) -> ExpireTime {
        debug_assert!(
            self.kind().is_header(),
            "expire time queried on a non-header record"
        );
        self.expire_time
    }

    pub fn has_expired(&self) -> bool {
        is_expired(self.expire_time())
    }

    pub fn key(&self) -> &[u8] {
        // SAFETY: construction copied key_len bytes directly after the
        // header, and the payload is immutable for the record's lifetime.
        unsafe {
            let data = (self as *const DlRecord as *const u8).add(RECORD_HEADER_SIZE);
            std::slice::from_raw_parts(data, self.key_len as usize)
        }
    }

    pub fn value(&self) -> &[u8] {
        // SAFETY: as for key(); the value follows the key bytes.
        unsafe {
            let data = (self as *const DlRecord as *const u8)
                .add(RECORD_HEADER_SIZE + self.key_len as usize);
            std::slice::from_raw_parts(data, self.value_len as usize)
        }
    }

    pub fn prev(&self) -> MemOffset {
        self.prev.load(Ordering::Acquire)
    }

    pub fn next(&self) -> MemOffset {
        self.next.load(Ordering::Acquire)
    }

    pub fn set_prev(&self, offset: MemOffset) {
        self.prev.store(offset, Ordering::SeqCst);
    }

    pub fn set_next(&self, offset: MemOffset) {
        self.next.store(offset, Ordering::SeqCst);
    }

    pub fn old_version(&self) -> MemOffset {
        self.old_version.load(Ordering::Acquire)
    }

    pub fn set_old_version(&self, offset: MemOffset) {
        self.old_version.store(offset, Ordering::SeqCst);
    }

    /// Mark the record invalid: zero the kind and rewrite the checksum so a
    /// scanner sees a consistent destroyed record rather than stale live
    /// metadata. Callers must guarantee no reader can still observe the
    /// record (snapshot horizon passed, slot cleared).
    pub fn destroy(&self) {
        self.kind.store(RecordKind::Empty as u8, Ordering::SeqCst);
        self.checksum
            .store(self.compute_checksum(), Ordering::SeqCst);
    }

    /// Size sanity plus checksum match over the immutable portion.
    pub fn validate(&self) -> bool {
        let payload = RECORD_HEADER_SIZE as u64 + self.key_len as u64 + self.value_len as u64;
        if payload > self.record_size as u64 {
            return false;
        }
        self.compute_checksum() == self.checksum.load(Ordering::Acquire)
    }

    fn compute_checksum(&self) -> u32 {
        let mut digest = CRC32.digest();
        digest.update(&[self.kind.load(Ordering::Relaxed), self.status]);
        digest.update(&self.key_len.to_le_bytes());
        digest.update(&self.value_len.to_le_bytes());
        digest.update(&self.timestamp.to_le_bytes());
        digest.update(self.key());
        digest.update(self.value());
        digest.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NULL_OFFSET, PERSIST_FOREVER};

    fn build(key: &[u8], value: &[u8]) -> (Vec<u8>, *mut DlRecord) {
        let size = record_size(key.len(), value.len());
        let mut space = vec![0u8; size as usize + ARENA_ALIGN as usize];
        let base = space.as_mut_ptr();
        let aligned = unsafe { base.add(base.align_offset(ARENA_ALIGN as usize)) };
        let record = unsafe {
            DlRecord::write_new(
                aligned,
                RecordInit {
                    record_size: size as u32,
                    timestamp: 42,
                    kind: RecordKind::HashElem,
                    status: RecordStatus::Normal,
                    old_version: NULL_OFFSET,
                    prev: 100,
                    next: 200,
                    key,
                    value,
                    expire_time: PERSIST_FOREVER,
                },
            )
        };
        (space, record)
    }

    #[test]
    fn record_size_is_aligned() {
        assert_eq!(record_size(0, 0), 56);
        assert_eq!(record_size(1, 0), 64);
        assert_eq!(record_size(3, 5), 64);
        assert_eq!(record_size(8, 0), 64);
        assert_eq!(record_size(9, 0), 72);
    }

    #[test]
    fn constructed_record_round_trips_fields() {
        let (_space, record) = build(b"field", b"value");
        let record = unsafe { &*record };
        assert_eq!(record.kind(), RecordKind::HashElem);
        assert_eq!(record.status(), RecordStatus::Normal);
        assert_eq!(record.timestamp(), 42);
        assert_eq!(record.key(), b"field");
        assert_eq!(record.value(), b"value");
        assert_eq!(record.prev(), 100);
        assert_eq!(record.next(), 200);
        assert_eq!(record.old_version(), NULL_OFFSET);
    }

    #[test]
    fn fresh_record_validates() {
        let (_space, record) = build(b"k", b"v");
        assert!(unsafe { &*record }.validate());
    }

    #[test]
    fn edge_updates_do_not_invalidate_checksum() {
        let (_space, record) = build(b"k", b"v");
        let record = unsafe { &*record };
        record.set_prev(7);
        record.set_next(9);
        record.set_old_version(11);
        assert!(record.validate());
    }

    #[test]
    fn destroy_zeroes_kind_and_revalidates() {
        let (_space, record) = build(b"k", b"v");
        let record = unsafe { &*record };
        record.destroy();
        assert_eq!(record.kind(), RecordKind::Empty);
        assert!(record.validate());
    }

    #[test]
    fn elem_and_header_kind_predicates() {
        assert!(RecordKind::HashElem.is_elem());
        assert!(RecordKind::SortedTombstone.is_elem());
        assert!(!RecordKind::HashHeader.is_elem());
        assert!(RecordKind::HashHeader.is_header());
        assert!(!RecordKind::StringData.is_header());
    }
}
