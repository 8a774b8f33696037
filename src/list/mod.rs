//! # Doubly-Linked Record List
//!
//! The circular, offset-linked list every collection arranges its records
//! on, anchored at a distinguished header record. All structural mutation
//! happens here; collections never touch edge fields directly.
//!
//! ## Edge-update protocol
//!
//! Mutations lock the positions they touch in the edge-lock table, re-read
//! the edges after acquisition, and bail out (returning `None`/`false`) if
//! a concurrent mutation moved a neighbour in between; callers retry.
//! Linking writes `prev.next` before `next.prev`; removal restores
//! `next.prev` before `prev.next` (the reverse), so a crash between the two
//! stores always leaves a state the one-sided repair rule in
//! [`LinkageRepair`] can fix.
//!
//! Readers never lock. A reader walking `next` from the header always
//! observes either the pre- or post-mutation edge, never a torn one, because
//! edges are single atomic words.
//!
//! ## Failure signalling
//!
//! The internal "linkage changed, retry" outcome is an `Option`/`bool`
//! here and never escapes the crate's public surface. Fairness of the
//! retry loops is guaranteed by the caller-held hash-slot lock, which
//! serializes writers of the same key.

pub mod lock_table;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::record::{DlRecord, RecordInit, RecordKind, RecordStatus};
use crate::storage::{Allocator, SpaceEntry};
use crate::types::{CollectionId, ExpireTime, MemOffset, Timestamp, NULL_OFFSET, PERSIST_FOREVER};

pub use lock_table::LockTable;

/// Inputs for writing one record onto a list.
pub struct ListWriteArgs<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub kind: RecordKind,
    pub status: RecordStatus,
    pub ts: Timestamp,
    pub space: SpaceEntry,
    pub expire_time: ExpireTime,
}

impl<'a> ListWriteArgs<'a> {
    pub fn new(
        key: &'a [u8],
        value: &'a [u8],
        kind: RecordKind,
        status: RecordStatus,
        ts: Timestamp,
        space: SpaceEntry,
    ) -> Self {
        debug_assert!(
            space.size >= crate::record::record_size(key.len(), value.len()),
            "space to write record too small"
        );
        Self {
            key,
            value,
            kind,
            status,
            ts,
            space,
            expire_time: PERSIST_FOREVER,
        }
    }
}

/// Collection-kind hooks the linkage checker dispatches through: whether a
/// record belongs to this collection type, and which collection it is in.
pub trait CollectionKind {
    fn match_kind(record: &DlRecord) -> bool;
    fn fetch_id(allocator: &Allocator, record: &DlRecord) -> CollectionId;
}

pub struct DlList {
    header: AtomicU64,
    allocator: Arc<Allocator>,
    locks: Arc<LockTable>,
}

impl DlList {
    pub fn new(header: MemOffset, allocator: Arc<Allocator>, locks: Arc<LockTable>) -> Self {
        Self {
            header: AtomicU64::new(header),
            allocator,
            locks,
        }
    }

    pub fn header_offset(&self) -> MemOffset {
        self.header.load(Ordering::Acquire)
    }

    pub fn header_record(&self) -> &DlRecord {
        self.allocator.record(self.header_offset())
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// Link a new record right after the header, retrying on neighbour
    /// movement. Returns the new record's offset.
    pub fn push_front(&self, args: &ListWriteArgs<'_>) -> MemOffset {
        loop {
            if let Some(offset) = self.insert_after(args, self.header_offset()) {
                return offset;
            }
        }
    }

    /// Link a new record right before the header (list tail).
    pub fn push_back(&self, args: &ListWriteArgs<'_>) -> MemOffset {
        loop {
            if let Some(offset) = self.insert_before(args, self.header_offset()) {
                return offset;
            }
        }
    }

    pub fn insert_after(&self, args: &ListWriteArgs<'_>, prev: MemOffset) -> Option<MemOffset> {
        let next = self.allocator.record(prev).next();
        self.insert_between(args, prev, next)
    }

    pub fn insert_before(&self, args: &ListWriteArgs<'_>, next: MemOffset) -> Option<MemOffset> {
        let prev = self.allocator.record(next).prev();
        self.insert_between(args, prev, next)
    }

    /// Place the record of `args` between two neighbours. `None` means the
    /// linkage changed before the lock was held; the caller retries.
    pub fn insert_between(
        &self,
        args: &ListWriteArgs<'_>,
        prev: MemOffset,
        next: MemOffset,
    ) -> Option<MemOffset> {
        // Insertion locks the predecessor position only.
        let _guard = self.locks.lock(prev);
        let prev_rec = self.allocator.record(prev);
        let next_rec = self.allocator.record(next);
        if prev_rec.next() != next || next_rec.prev() != prev {
            return None;
        }

        // SAFETY: args.space is a freshly allocated region sized for the
        // payload (checked at ListWriteArgs construction).
        unsafe {
            DlRecord::write_new(
                self.allocator.ptr_at(args.space.offset),
                RecordInit {
                    record_size: args.space.size as u32,
                    timestamp: args.ts,
                    kind: args.kind,
                    status: args.status,
                    old_version: NULL_OFFSET,
                    prev,
                    next,
                    key: args.key,
                    value: args.value,
                    expire_time: args.expire_time,
                },
            );
        }
        link_between(prev_rec, next_rec, args.space.offset);
        Some(args.space.offset)
    }

    /// Replace `current` with a new record carrying `args`, linking the new
    /// record's version chain to `current`. `None` means a concurrent
    /// structural change; the caller retries.
    pub fn update(&self, args: &ListWriteArgs<'_>, current: MemOffset) -> Option<MemOffset> {
        let current_rec = self.allocator.record(current);
        debug_assert_eq!(current_rec.key(), args.key, "updating a different key");
        debug_assert!(args.ts > current_rec.timestamp(), "timestamps must advance");

        let _guard = acquire_record_lock(current_rec, current, &self.locks);
        let prev = current_rec.prev();
        let next = current_rec.next();
        let prev_rec = self.allocator.record(prev);
        let next_rec = self.allocator.record(next);
        if prev_rec.next() != current || next_rec.prev() != current {
            return None;
        }

        // SAFETY: as in insert_between.
        unsafe {
            DlRecord::write_new(
                self.allocator.ptr_at(args.space.offset),
                RecordInit {
                    record_size: args.space.size as u32,
                    timestamp: args.ts,
                    kind: args.kind,
                    status: args.status,
                    old_version: current,
                    prev,
                    next,
                    key: args.key,
                    value: args.value,
                    expire_time: args.expire_time,
                },
            );
        }
        link_between(prev_rec, next_rec, args.space.offset);
        Some(args.space.offset)
    }

    /// Swap an already-constructed record into `old`'s list position,
    /// preserving neighbours. Returns false if `old` is no longer linked.
    pub fn replace(&self, old: MemOffset, new: MemOffset) -> bool {
        let replaced = replace_detached(old, new, &self.allocator, &self.locks);
        if replaced && old == self.header_offset() {
            self.header.store(new, Ordering::Release);
        }
        replaced
    }

    /// Unlink a record. Returns false if its linkage predicate already
    /// fails (another thread removed it).
    pub fn remove(&self, record: MemOffset) -> bool {
        remove_detached(record, &self.allocator, &self.locks)
    }

    /// The raw linkage predicate: both neighbours still point at the
    /// record. Kind- and id-aware verification lives in [`LinkageRepair`].
    pub fn linkage_intact(&self, record: MemOffset) -> bool {
        let rec = self.allocator.record(record);
        self.allocator.record(rec.prev()).next() == record
            && self.allocator.record(rec.next()).prev() == record
    }

    /// Unlink and return the record after the header, retrying under
    /// concurrent removal. `None` on an empty list.
    pub fn remove_front(&self) -> Option<MemOffset> {
        loop {
            let front = self.header_record().next();
            if front == self.header_offset() {
                return None;
            }
            if self.remove(front) {
                return Some(front);
            }
        }
    }

    /// Unlink and return the record before the header.
    pub fn remove_back(&self) -> Option<MemOffset> {
        loop {
            let back = self.header_record().prev();
            if back == self.header_offset() {
                return None;
            }
            if self.remove(back) {
                return Some(back);
            }
        }
    }

    pub fn iter(&self) -> RecordIter<'_> {
        RecordIter {
            list: self,
            current: self.header_offset(),
        }
    }

    pub fn snapshot_iter(&self, snapshot_ts: Timestamp) -> SnapshotIter<'_> {
        SnapshotIter {
            list: self,
            current: NULL_OFFSET,
            snapshot_ts,
        }
    }
}

/// `prev.next` is written before `next.prev`; the repair rule depends on
/// this order.
fn link_between(prev: &DlRecord, next: &DlRecord, linking: MemOffset) {
    prev.set_next(linking);
    next.set_prev(linking);
}

/// Lock the positions of a record and its predecessor, re-reading the edges
/// until they are stable under the lock.
fn acquire_record_lock<'a>(
    record: &DlRecord,
    record_offset: MemOffset,
    locks: &'a LockTable,
) -> lock_table::PairGuard<'a> {
    loop {
        let prev = record.prev();
        let next = record.next();
        let guard = locks.lock_pair(prev, record_offset);
        if record.prev() != prev || record.next() != next {
            continue;
        }
        return guard;
    }
}

/// Replace without a list handle; used by the cleaner, which holds record
/// offsets but no collection. The new record must already be constructed.
pub fn replace_detached(
    old: MemOffset,
    new: MemOffset,
    allocator: &Allocator,
    locks: &LockTable,
) -> bool {
    let old_rec = allocator.record(old);
    let _guard = acquire_record_lock(old_rec, old, locks);
    let prev = old_rec.prev();
    let next = old_rec.next();
    let on_list = allocator.record(prev).next() == old;
    if on_list {
        let new_rec = allocator.record(new);
        if prev == old && next == old {
            // The record is the self-looped header of an empty list. Point
            // the new header at itself, then aim the old one at its
            // replacement so recovery can follow the hand-off.
            assert!(
                old_rec.kind().is_header() && new_rec.kind().is_header(),
                "only a header may be the sole record of a list"
            );
            new_rec.set_prev(new);
            new_rec.set_next(new);
            old_rec.set_prev(new);
        } else {
            new_rec.set_prev(prev);
            new_rec.set_next(next);
            link_between(allocator.record(prev), allocator.record(next), new);
        }
    }
    on_list
}

/// Remove without a list handle. Unlinks `next.prev` before `prev.next`,
/// the reverse of insertion, for the benefit of crash repair.
pub fn remove_detached(record: MemOffset, allocator: &Allocator, locks: &LockTable) -> bool {
    let rec = allocator.record(record);
    let _guard = acquire_record_lock(rec, record, locks);
    let prev = rec.prev();
    let next = rec.next();
    let on_list = allocator.record(prev).next() == record;
    if on_list {
        allocator.record(next).set_prev(prev);
        allocator.record(prev).set_next(next);
    }
    on_list
}

/// Linkage verification and one-sided repair, parameterized over the
/// collection type whose records the list holds.
pub struct LinkageRepair<'a, C: CollectionKind> {
    allocator: &'a Allocator,
    _marker: PhantomData<C>,
}

impl<'a, C: CollectionKind> LinkageRepair<'a, C> {
    pub fn new(allocator: &'a Allocator) -> Self {
        Self {
            allocator,
            _marker: PhantomData,
        }
    }

    pub fn check_next_linkage(&self, record: &DlRecord) -> bool {
        let offset = self.allocator.offset_of(record);
        let next = self.allocator.record(record.next());
        next.prev() == offset
            && C::match_kind(record)
            && C::fetch_id(self.allocator, next) == C::fetch_id(self.allocator, record)
    }

    pub fn check_prev_linkage(&self, record: &DlRecord) -> bool {
        let offset = self.allocator.offset_of(record);
        let prev = self.allocator.record(record.prev());
        prev.next() == offset
            && C::match_kind(record)
            && C::fetch_id(self.allocator, prev) == C::fetch_id(self.allocator, record)
    }

    pub fn check_linkage(&self, record: &DlRecord) -> bool {
        self.check_prev_linkage(record) && self.check_next_linkage(record)
    }

    /// Recovery rule: an intact next-linkage means the record is linked
    /// (its predecessor repairs the prev side in its own pass); an intact
    /// prev-linkage with a broken next side is repaired here. Both broken
    /// means the record never fully linked.
    pub fn check_and_repair(&self, record: &DlRecord) -> bool {
        if self.check_next_linkage(record) {
            return true;
        }
        if self.check_prev_linkage(record) {
            let offset = self.allocator.offset_of(record);
            self.allocator.record(record.next()).set_prev(offset);
            return true;
        }
        false
    }
}

/// Walks every record on the list, headers excluded from `valid`.
pub struct RecordIter<'a> {
    list: &'a DlList,
    current: MemOffset,
}

impl<'a> RecordIter<'a> {
    pub fn seek_to_first(&mut self) {
        self.current = self.list.header_record().next();
    }

    pub fn seek_to_last(&mut self) {
        self.current = self.list.header_record().prev();
    }

    pub fn valid(&self) -> bool {
        self.current != NULL_OFFSET
            && self
                .list
                .allocator
                .record(self.current)
                .kind()
                .is_elem()
    }

    pub fn next(&mut self) {
        if self.valid() {
            self.current = self.list.allocator.record(self.current).next();
        }
    }

    pub fn prev(&mut self) {
        if self.valid() {
            self.current = self.list.allocator.record(self.current).prev();
        }
    }

    pub fn record_offset(&self) -> Option<MemOffset> {
        self.valid().then_some(self.current)
    }

    pub fn record(&self) -> Option<&'a DlRecord> {
        self.record_offset().map(|off| self.list.allocator.record(off))
    }
}

/// Walks the records visible at a snapshot timestamp, resolving version
/// chains and skipping tombstones.
pub struct SnapshotIter<'a> {
    list: &'a DlList,
    current: MemOffset,
    snapshot_ts: Timestamp,
}

impl<'a> SnapshotIter<'a> {
    pub fn seek_to_first(&mut self) {
        self.current = self.list.header_record().next();
        self.skip_invisible();
    }

    pub fn valid(&self) -> bool {
        self.current != NULL_OFFSET
            && self
                .list
                .allocator
                .record(self.current)
                .kind()
                .is_elem()
    }

    pub fn next(&mut self) {
        if self.valid() {
            self.current = self.list.allocator.record(self.current).next();
            self.skip_invisible();
        }
    }

    pub fn record(&self) -> Option<&'a DlRecord> {
        self.valid().then(|| self.list.allocator.record(self.current))
    }

    pub fn key(&self) -> Option<&'a [u8]> {
        self.record().map(|r| r.key())
    }

    pub fn value(&self) -> Option<&'a [u8]> {
        self.record().map(|r| r.value())
    }

    /// Oldest version of `record` still newer than the snapshot, found by
    /// walking the version chain.
    fn visible_version(&self, record: &'a DlRecord) -> Option<&'a DlRecord> {
        let mut current = Some(record);
        while let Some(rec) = current {
            if rec.timestamp() <= self.snapshot_ts {
                return Some(rec);
            }
            current = self.list.allocator.try_record(rec.old_version());
            debug_assert!(
                current.map_or(true, |older| older.key() == record.key()),
                "version chain crossed keys"
            );
        }
        None
    }

    fn skip_invisible(&mut self) {
        while self.valid() {
            let record = self.list.allocator.record(self.current);
            match self.visible_version(record) {
                Some(visible) if visible.status() == RecordStatus::Normal => {
                    self.current = self.list.allocator.offset_of(visible);
                    return;
                }
                _ => {
                    self.current = record.next();
                }
            }
        }
    }
}
