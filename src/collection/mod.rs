//! # Hash Collection
//!
//! A named group of (field → value) pairs stored as records on one circular
//! doubly-linked list and indexed by the shared hash table. Multiple
//! collections coexist over one allocator and one index; each collection
//! exclusively owns the linear arrangement of its records, while the index
//! holds non-owning offsets the collection invalidates on delete.
//!
//! ## Write pipeline
//!
//! Every mutation splits into *prepare* (lookup + space allocation, the
//! part that can fail with `MemoryOverflow`) and *commit* (list mutation +
//! slot republication, which succeeds modulo bounded retries). The staged
//! [`HashWriteArgs`] carries prepared resources between the two, letting an
//! engine batch several prepared writes before committing any.
//!
//! Callers hold the key's hash-slot lock across the whole pipeline; that
//! lock is what makes writes to one key single-writer. Reads take no lock.
//!
//! ## Key encoding
//!
//! Element records store `collection_id ‖ field` (fixed-width little-endian
//! id) so every record is self-describing: the collection a record belongs
//! to is recoverable from its key alone. Header records carry the
//! collection name as key and the encoded id as value.
//!
//! ## Size accounting
//!
//! `size` counts list records with kind `HashElem` and status `Normal`. It
//! moves only inside `write`: +1 when a put finds no live predecessor, −1
//! when a delete retires one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::index::{HashIndex, IndexVariant, LookupResult};
use crate::list::{CollectionKind, DlList, LinkageRepair, ListWriteArgs, LockTable, SnapshotIter};
use crate::record::{record_size, DlRecord, RecordInit, RecordKind, RecordStatus};
use crate::storage::{Allocator, SpaceEntry};
use crate::types::{
    CollectionId, ExpireTime, KvError, MemOffset, Timestamp, WriteOp, NULL_OFFSET, PERSIST_FOREVER,
};

pub const COLLECTION_ID_SIZE: usize = size_of::<CollectionId>();

/// Inline-buffered internal key; short fields never allocate.
pub type InternalKey = SmallVec<[u8; 64]>;

pub fn encode_id(id: CollectionId) -> [u8; COLLECTION_ID_SIZE] {
    id.to_le_bytes()
}

/// Collection id embedded in a header record's value.
pub fn decode_id(header_value: &[u8]) -> CollectionId {
    let bytes: [u8; COLLECTION_ID_SIZE] = header_value[..COLLECTION_ID_SIZE]
        .try_into()
        .expect("header value shorter than a collection id");
    CollectionId::from_le_bytes(bytes)
}

/// Collection id prefix of an element's internal key.
pub fn extract_id(internal_key: &[u8]) -> CollectionId {
    decode_id(internal_key)
}

/// User field of an element's internal key.
pub fn user_key(internal_key: &[u8]) -> &[u8] {
    &internal_key[COLLECTION_ID_SIZE..]
}

/// Staged inputs and prepared resources for one write. Bound to the
/// collection that created it; committing through another collection is an
/// `InvalidArgument`.
pub struct HashWriteArgs<'a> {
    key: &'a [u8],
    value: &'a [u8],
    op: WriteOp,
    collection_id: CollectionId,
    ts: Timestamp,
    space: Option<SpaceEntry>,
    lookup: Option<LookupResult>,
}

impl HashWriteArgs<'_> {
    pub fn space(&self) -> Option<SpaceEntry> {
        self.space
    }
}

/// Outcome of a committed write: the superseded record (for the cleaner)
/// and the newly written one.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteResult {
    pub existing: Option<MemOffset>,
    pub written: Option<MemOffset>,
}

/// Verdict of a modify callback.
pub enum ModifyOp {
    /// Replace the value.
    Write(Vec<u8>),
    /// Delete the field.
    Delete,
    /// Fail the operation with `KvError::Abort`, leaving state untouched.
    Abort,
    /// Succeed without side effects.
    Noop,
}

pub struct HashCollection {
    name: Vec<u8>,
    id: CollectionId,
    dl_list: DlList,
    size: AtomicU64,
    allocator: Arc<Allocator>,
    index: Arc<HashIndex>,
    // Serializes heavyweight background scans (destroy, index check)
    // against each other; the write path never touches it.
    cleaning_lock: Mutex<()>,
}

impl HashCollection {
    /// Materialize a new collection: allocate and self-link its header
    /// record and publish the name in the index.
    pub fn create(
        name: &[u8],
        id: CollectionId,
        allocator: Arc<Allocator>,
        index: Arc<HashIndex>,
        locks: Arc<LockTable>,
        ts: Timestamp,
    ) -> Result<Self, KvError> {
        let value = encode_id(id);
        let space = allocator
            .allocate(record_size(name.len(), value.len()))
            .ok_or(KvError::MemoryOverflow)?;
        // SAFETY: fresh space sized for the payload.
        unsafe {
            DlRecord::write_new(
                allocator.ptr_at(space.offset),
                RecordInit {
                    record_size: space.size as u32,
                    timestamp: ts,
                    kind: RecordKind::HashHeader,
                    status: RecordStatus::Normal,
                    old_version: NULL_OFFSET,
                    prev: space.offset,
                    next: space.offset,
                    key: name,
                    value: &value,
                    expire_time: PERSIST_FOREVER,
                },
            );
        }
        {
            let _guard = index.slot_guard(name);
            let lookup = index.lookup(name, RecordKind::HashHeader, true)?;
            index.insert(
                &lookup,
                name,
                RecordKind::HashHeader,
                RecordStatus::Normal,
                IndexVariant::Collection,
                space.offset,
            );
        }
        Ok(Self {
            name: name.to_vec(),
            id,
            dl_list: DlList::new(space.offset, Arc::clone(&allocator), locks),
            size: AtomicU64::new(0),
            allocator,
            index,
            cleaning_lock: Mutex::new(()),
        })
    }

    /// Rebuild a collection from its persisted header record: re-link the
    /// in-memory handle, re-publish every live record in the index, and
    /// recount the size. The index and size are volatile state
    /// reconstructed on open.
    pub fn open(
        header: MemOffset,
        allocator: Arc<Allocator>,
        index: Arc<HashIndex>,
        locks: Arc<LockTable>,
    ) -> Result<Self, KvError> {
        let header_record = allocator.record(header);
        assert_eq!(
            header_record.kind(),
            RecordKind::HashHeader,
            "opening a collection from a non-header record"
        );
        let name = header_record.key().to_vec();
        let id = decode_id(header_record.value());
        let collection = Self {
            name: name.clone(),
            id,
            dl_list: DlList::new(header, Arc::clone(&allocator), locks),
            size: AtomicU64::new(0),
            allocator,
            index,
            cleaning_lock: Mutex::new(()),
        };

        {
            let _guard = collection.index.slot_guard(&name);
            let lookup = collection
                .index
                .lookup(&name, RecordKind::HashHeader, true)?;
            collection.index.insert(
                &lookup,
                &name,
                RecordKind::HashHeader,
                RecordStatus::Normal,
                IndexVariant::Collection,
                header,
            );
        }

        let mut iter = collection.dl_list.iter();
        iter.seek_to_first();
        while let Some(record) = iter.record() {
            let offset = collection.allocator.offset_of(record);
            let key = record.key();
            let _guard = collection.index.slot_guard(key);
            let lookup = collection.index.lookup(key, RecordKind::HashElem, true)?;
            collection.index.insert(
                &lookup,
                key,
                RecordKind::HashElem,
                record.status(),
                IndexVariant::RawRecord,
                offset,
            );
            if record.status() == RecordStatus::Normal {
                collection.size.fetch_add(1, Ordering::Relaxed);
            }
            iter.next();
        }
        Ok(collection)
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    /// Number of live elements.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn update_size(&self, delta: i64) {
        if delta >= 0 {
            self.size.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            let sub = delta.unsigned_abs();
            let prev = self.size.fetch_sub(sub, Ordering::Relaxed);
            assert!(prev >= sub, "collection size went negative");
        }
    }

    pub fn header_record(&self) -> &DlRecord {
        self.dl_list.header_record()
    }

    pub fn header_offset(&self) -> MemOffset {
        self.dl_list.header_offset()
    }

    pub fn get_expire_time(&self) -> ExpireTime {
        self.header_record().expire_time()
    }

    pub fn has_expired(&self) -> bool {
        self.header_record().has_expired()
    }

    pub fn get_timestamp(&self) -> Timestamp {
        self.header_record().timestamp()
    }

    /// Advisory exclusion between background scans. `None` when another
    /// scan holds it; never blocks.
    pub fn cleaning_guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.cleaning_lock.try_lock()
    }

    /// `collection_id ‖ field`, inline-buffered.
    pub fn internal_key(&self, key: &[u8]) -> InternalKey {
        let mut ikey = InternalKey::new();
        ikey.extend_from_slice(&encode_id(self.id));
        ikey.extend_from_slice(key);
        ikey
    }

    /// Whether a record belongs to some hash collection.
    pub fn match_type(record: &DlRecord) -> bool {
        matches!(
            record.kind(),
            RecordKind::HashElem | RecordKind::HashHeader
        )
    }

    /// The collection a record belongs to, read from its key prefix
    /// (elements) or its value (headers). Any other kind is corruption.
    pub fn fetch_id(record: &DlRecord) -> CollectionId {
        match record.kind() {
            RecordKind::HashElem => extract_id(record.key()),
            RecordKind::HashHeader => decode_id(record.value()),
            kind => panic!("fetch_id on non-hash record kind {:?}", kind),
        }
    }

    /// Stage a put or delete. The returned args must be prepared and
    /// written through this same collection.
    pub fn init_write_args<'a>(
        &self,
        key: &'a [u8],
        value: &'a [u8],
        op: WriteOp,
    ) -> HashWriteArgs<'a> {
        HashWriteArgs {
            key,
            value,
            op,
            collection_id: self.id,
            ts: 0,
            space: None,
            lookup: None,
        }
    }

    /// Look up the key and allocate record space, storing both in `args`.
    /// An idempotent delete (key absent or already outdated) allocates
    /// nothing. The caller must hold the key's hash-slot lock.
    pub fn prepare_write(&self, args: &mut HashWriteArgs<'_>, ts: Timestamp) -> Result<(), KvError> {
        debug_assert!(
            args.op == WriteOp::Put || args.value.is_empty(),
            "value of a delete must be empty"
        );
        if args.collection_id != self.id {
            return Err(KvError::InvalidArgument);
        }
        args.ts = ts;
        let ikey = self.internal_key(args.key);
        let op_delete = args.op == WriteOp::Delete;
        let lookup = self
            .index
            .lookup(&ikey, RecordKind::HashElem, !op_delete)?;

        let allocate = match &lookup.existing {
            Some((_, snapshot)) => !(op_delete && snapshot.status == RecordStatus::Outdated),
            None => !op_delete,
        };
        args.lookup = Some(lookup);
        if allocate {
            let request = record_size(ikey.len(), args.value.len());
            args.space = Some(
                self.allocator
                    .allocate(request)
                    .ok_or(KvError::MemoryOverflow)?,
            );
        }
        Ok(())
    }

    /// Commit prepared args: mutate the list, republish the hash slot,
    /// adjust the size. Succeeds modulo internal retries.
    pub fn write(&self, args: &mut HashWriteArgs<'_>) -> Result<WriteResult, KvError> {
        if args.collection_id != self.id {
            return Err(KvError::InvalidArgument);
        }
        let lookup = args.lookup.take().expect("write without prepare");
        let result = match args.op {
            WriteOp::Put => {
                let space = args.space.expect("put always allocates");
                let result = self.put_prepared(&lookup, args.key, args.value, args.ts, space);
                let superseded_live = lookup
                    .existing
                    .map(|(_, snapshot)| snapshot.status == RecordStatus::Normal)
                    .unwrap_or(false);
                if !superseded_live {
                    self.update_size(1);
                }
                result
            }
            WriteOp::Delete => {
                let space = args.space.expect("idempotent delete commits nothing");
                let result = self.delete_prepared(&lookup, args.key, args.ts, space);
                self.update_size(-1);
                result
            }
        };
        Ok(result)
    }

    /// Insert or replace `key`. The caller holds the key's hash-slot lock
    /// and routes `result.existing` to the cleaner.
    pub fn put(&self, key: &[u8], value: &[u8], ts: Timestamp) -> Result<WriteResult, KvError> {
        let mut args = self.init_write_args(key, value, WriteOp::Put);
        self.prepare_write(&mut args, ts)?;
        self.write(&mut args)
    }

    /// Read `key`'s live value. Lock-free; a concurrent delete between the
    /// slot read and the value copy surfaces as `None`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let ikey = self.internal_key(key);
        let lookup = self
            .index
            .lookup(&ikey, RecordKind::HashElem, false)
            .expect("plain lookup cannot overflow");
        let (_, snapshot) = lookup.existing?;
        if snapshot.status == RecordStatus::Outdated {
            return None;
        }
        let record = self.allocator.record(snapshot.target);
        debug_assert_eq!(record.kind(), RecordKind::HashElem);
        let value = record.value().to_vec();
        // The slot may have been repointed at a tombstone between the
        // lookup and the copy; the record's own status settles it.
        if record.status() == RecordStatus::Outdated {
            return None;
        }
        Some(value)
    }

    /// Delete `key` by writing a tombstone over it. Deleting an absent or
    /// already-deleted key is a no-op success. Caller holds the slot lock.
    pub fn delete(&self, key: &[u8], ts: Timestamp) -> Result<WriteResult, KvError> {
        let mut args = self.init_write_args(key, b"", WriteOp::Delete);
        self.prepare_write(&mut args, ts)?;
        if args.space.is_some() {
            self.write(&mut args)
        } else {
            Ok(WriteResult::default())
        }
    }

    /// Read-modify-write under the caller-held slot lock. The callback sees
    /// the live value (if any) and decides the outcome.
    pub fn modify<F>(&self, key: &[u8], modify_fn: F, ts: Timestamp) -> Result<WriteResult, KvError>
    where
        F: FnOnce(Option<&[u8]>) -> ModifyOp,
    {
        let ikey = self.internal_key(key);
        let lookup = self
            .index
            .lookup(&ikey, RecordKind::HashElem, false)
            .expect("plain lookup cannot overflow");
        let current = lookup.existing.and_then(|(_, snapshot)| {
            (snapshot.status == RecordStatus::Normal)
                .then(|| self.allocator.record(snapshot.target).value().to_vec())
        });

        match modify_fn(current.as_deref()) {
            ModifyOp::Write(new_value) => {
                let mut args = self.init_write_args(key, &new_value, WriteOp::Put);
                self.prepare_write(&mut args, ts)?;
                self.write(&mut args)
            }
            ModifyOp::Delete => {
                let mut args = self.init_write_args(key, b"", WriteOp::Delete);
                self.prepare_write(&mut args, ts)?;
                if args.space.is_some() {
                    self.write(&mut args)
                } else {
                    Ok(WriteResult::default())
                }
            }
            ModifyOp::Abort => Err(KvError::Abort),
            ModifyOp::Noop => Ok(WriteResult::default()),
        }
    }

    /// Swap an already-constructed record into `old`'s list position. The
    /// hash index is not touched; callers republish or erase the slot
    /// themselves. False if `old` is no longer linked.
    pub fn replace(&self, old: MemOffset, new: MemOffset) -> bool {
        self.dl_list.replace(old, new)
    }

    /// Re-anchor the collection on a new header record carrying the given
    /// expiry. The superseded header is reported for reclamation.
    pub fn set_expire_time(
        &self,
        expire_time: ExpireTime,
        ts: Timestamp,
    ) -> Result<WriteResult, KvError> {
        let old_offset = self.dl_list.header_offset();
        let old_header = self.allocator.record(old_offset);
        let space = self
            .allocator
            .allocate(record_size(old_header.key().len(), old_header.value().len()))
            .ok_or(KvError::MemoryOverflow)?;
        // SAFETY: fresh space sized for the payload.
        unsafe {
            DlRecord::write_new(
                self.allocator.ptr_at(space.offset),
                RecordInit {
                    record_size: space.size as u32,
                    timestamp: ts,
                    kind: RecordKind::HashHeader,
                    status: RecordStatus::Normal,
                    old_version: old_offset,
                    prev: old_header.prev(),
                    next: old_header.next(),
                    key: old_header.key(),
                    value: old_header.value(),
                    expire_time,
                },
            );
        }
        let replaced = self.dl_list.replace(old_offset, space.offset);
        assert!(replaced, "existing header must be linked on its list");

        // The name entry indexes the header by offset; repoint it.
        let _guard = self.index.slot_guard(&self.name);
        let lookup = self
            .index
            .lookup(&self.name, RecordKind::HashHeader, false)
            .expect("plain lookup cannot overflow");
        if lookup.existing.is_some() {
            self.index.insert(
                &lookup,
                &self.name,
                RecordKind::HashHeader,
                RecordStatus::Normal,
                IndexVariant::Collection,
                space.offset,
            );
        }
        Ok(WriteResult {
            existing: Some(old_offset),
            written: Some(space.offset),
        })
    }

    /// Unlink and retire every record on the list (live versions only; the
    /// header included last), clearing hash slots that still point at them
    /// and batch-freeing the space. Old-version chains are not visited.
    pub fn destroy(&self) {
        self.destroy_impl(false)
    }

    /// Like `destroy`, but additionally walks each record's version chain
    /// and retires every prior version.
    pub fn destroy_all(&self) {
        self.destroy_impl(true)
    }

    fn destroy_impl(&self, visit_old_versions: bool) {
        use crate::config::MAX_CACHED_OLD_RECORDS;

        let header_offset = self.dl_list.header_offset();
        let mut to_free: Vec<SpaceEntry> = Vec::new();
        loop {
            let to_destroy = self.dl_list.header_record().next();
            let record = self.allocator.record(to_destroy);
            let key = record.key();
            let _guard = self.index.slot_guard(key);
            if self.dl_list.remove(to_destroy) {
                if let Ok(lookup) = self.index.lookup(key, record.kind(), false) {
                    if let Some((pos, snapshot)) = lookup.existing {
                        if snapshot.target == to_destroy {
                            self.index.erase(pos);
                        }
                    }
                }

                if visit_old_versions {
                    let mut old = record.old_version();
                    while let Some(old_record) = self.allocator.try_record(old) {
                        let next_old = old_record.old_version();
                        // A version already retired by the cleaner has kind
                        // Empty and its space is no longer ours to free.
                        if old_record.kind() != RecordKind::Empty {
                            old_record.destroy();
                            to_free.push(SpaceEntry::new(
                                old,
                                old_record.record_size() as u64,
                            ));
                        }
                        old = next_old;
                    }
                }

                record.destroy();
                to_free.push(SpaceEntry::new(to_destroy, record.record_size() as u64));
                if to_free.len() > MAX_CACHED_OLD_RECORDS {
                    self.allocator.batch_free(to_free.drain(..));
                }
            }
            if to_destroy == header_offset {
                break;
            }
        }
        self.allocator.batch_free(to_free);
    }

    /// Diagnostic walk: every list record must be indexed to itself and
    /// have intact linkage. `Abort` on the first mismatch.
    pub fn check_index(&self) -> Result<(), KvError> {
        let repair = LinkageRepair::<HashCollection>::new(&self.allocator);
        let header_offset = self.dl_list.header_offset();
        let mut prev = header_offset;
        loop {
            let current = self.allocator.record(prev).next();
            if current == header_offset {
                return Ok(());
            }
            let record = self.allocator.record(current);
            let lookup = self
                .index
                .lookup(record.key(), record.kind(), false)
                .expect("plain lookup cannot overflow");
            match lookup.existing {
                Some((_, snapshot)) if snapshot.target == current => {}
                _ => return Err(KvError::Abort),
            }
            if !repair.check_linkage(record) {
                return Err(KvError::Abort);
            }
            prev = current;
        }
    }

    /// Iterate the fields visible at a snapshot timestamp.
    pub fn iter(&self, snapshot_ts: Timestamp) -> HashIter<'_> {
        let mut inner = self.dl_list.snapshot_iter(snapshot_ts);
        inner.seek_to_first();
        HashIter { inner }
    }

    fn put_prepared(
        &self,
        lookup: &LookupResult,
        key: &[u8],
        value: &[u8],
        ts: Timestamp,
        space: SpaceEntry,
    ) -> WriteResult {
        let ikey = self.internal_key(key);
        let args = ListWriteArgs::new(
            &ikey,
            value,
            RecordKind::HashElem,
            RecordStatus::Normal,
            ts,
            space,
        );
        let existing = lookup.existing.map(|(_, snapshot)| snapshot.target);
        if let Some(existing) = existing {
            debug_assert!(ts > self.allocator.record(existing).timestamp());
            while self.dl_list.update(&args, existing).is_none() {}
        } else if rand::random::<bool>() {
            self.dl_list.push_back(&args);
        } else {
            self.dl_list.push_front(&args);
        }
        self.index.insert(
            lookup,
            &ikey,
            RecordKind::HashElem,
            RecordStatus::Normal,
            IndexVariant::RawRecord,
            space.offset,
        );
        WriteResult {
            existing,
            written: Some(space.offset),
        }
    }

    fn delete_prepared(
        &self,
        lookup: &LookupResult,
        key: &[u8],
        ts: Timestamp,
        space: SpaceEntry,
    ) -> WriteResult {
        let ikey = self.internal_key(key);
        let (_, snapshot) = lookup
            .existing
            .expect("delete commits only over a live record");
        debug_assert_eq!(snapshot.status, RecordStatus::Normal);
        debug_assert!(ts > self.allocator.record(snapshot.target).timestamp());
        let args = ListWriteArgs::new(
            &ikey,
            b"",
            RecordKind::HashElem,
            RecordStatus::Outdated,
            ts,
            space,
        );
        while self.dl_list.update(&args, snapshot.target).is_none() {}
        self.index.insert(
            lookup,
            &ikey,
            RecordKind::HashElem,
            RecordStatus::Outdated,
            IndexVariant::RawRecord,
            space.offset,
        );
        WriteResult {
            existing: Some(snapshot.target),
            written: Some(space.offset),
        }
    }
}

impl CollectionKind for HashCollection {
    fn match_kind(record: &DlRecord) -> bool {
        HashCollection::match_type(record)
    }

    fn fetch_id(_allocator: &Allocator, record: &DlRecord) -> CollectionId {
        HashCollection::fetch_id(record)
    }
}

/// Snapshot-filtered iterator over (field, value) pairs, with the
/// collection-id prefix stripped from keys.
pub struct HashIter<'a> {
    inner: SnapshotIter<'a>,
}

impl<'a> HashIter<'a> {
    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn next(&mut self) {
        self.inner.next()
    }

    pub fn key(&self) -> Option<&'a [u8]> {
        self.inner.key().map(user_key)
    }

    pub fn value(&self) -> Option<&'a [u8]> {
        self.inner.value()
    }
}
