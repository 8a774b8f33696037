//! # Hash Collection Behaviour Tests
//!
//! End-to-end checks of the collection contract over a full in-memory
//! stack: arena, allocator, shared index, version controller, and cleaner.
//! Covers the put/get/delete/modify laws, write staging, expiry, destroy,
//! and the index diagnostic.
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test hash_collection
//! ```

use std::sync::Arc;

use burrowdb::collection::ModifyOp;
use burrowdb::config::{DEFAULT_INDEX_SLOTS, EDGE_LOCK_TABLE_SIZE, MAX_ACCESS_THREADS};
use burrowdb::version::cleaner::{OldDataRecord, OldDeleteRecord};
use burrowdb::{
    Allocator, Arena, HashCollection, HashIndex, KvError, LockTable, OldRecordsCleaner,
    RecordKind, RecordStatus, ThreadRegistry, VersionController,
};

struct Engine {
    allocator: Arc<Allocator>,
    index: Arc<HashIndex>,
    locks: Arc<LockTable>,
    version: Arc<VersionController>,
    registry: Arc<ThreadRegistry>,
    cleaner: Arc<OldRecordsCleaner>,
}

fn engine() -> Engine {
    let allocator = Arc::new(Allocator::new(Arena::anonymous(1 << 22).unwrap()));
    let index = Arc::new(HashIndex::new(DEFAULT_INDEX_SLOTS, Arc::clone(&allocator)));
    let locks = Arc::new(LockTable::new(EDGE_LOCK_TABLE_SIZE));
    let version = Arc::new(VersionController::new());
    let cleaner = Arc::new(OldRecordsCleaner::new(
        Arc::clone(&allocator),
        Arc::clone(&index),
        Arc::clone(&locks),
        Arc::clone(&version),
        MAX_ACCESS_THREADS,
    ));
    Engine {
        allocator,
        index,
        locks,
        version,
        registry: ThreadRegistry::new(MAX_ACCESS_THREADS),
        cleaner,
    }
}

impl Engine {
    fn collection(&self, name: &[u8], id: u64) -> HashCollection {
        let ts = self.version.fetch_timestamp();
        HashCollection::create(
            name,
            id,
            Arc::clone(&self.allocator),
            Arc::clone(&self.index),
            Arc::clone(&self.locks),
            ts,
        )
        .unwrap()
    }

    /// Put under the key's slot lock, routing the superseded record to the
    /// cleaner the way the engine write path does.
    fn put(
        &self,
        thread: &burrowdb::ThreadHandle,
        hash: &HashCollection,
        key: &[u8],
        value: &[u8],
    ) -> u64 {
        let ts = self.version.fetch_timestamp();
        let ikey = hash.internal_key(key);
        let _guard = self.index.slot_guard(&ikey);
        let result = hash.put(key, value, ts).unwrap();
        if let Some(old) = result.existing {
            if self.allocator.record(old).status() == RecordStatus::Normal {
                self.cleaner.push_data(
                    thread,
                    OldDataRecord {
                        record: old,
                        newer_version_ts: ts,
                    },
                );
            }
        }
        ts
    }

    /// Delete under the slot lock, queueing the superseded record and the
    /// tombstone itself.
    fn delete(&self, thread: &burrowdb::ThreadHandle, hash: &HashCollection, key: &[u8]) -> u64 {
        let ts = self.version.fetch_timestamp();
        let ikey = hash.internal_key(key);
        let _guard = self.index.slot_guard(&ikey);
        let result = hash.delete(key, ts).unwrap();
        if let Some(old) = result.existing {
            self.cleaner.push_data(
                thread,
                OldDataRecord {
                    record: old,
                    newer_version_ts: ts,
                },
            );
        }
        if let Some(tombstone) = result.written {
            self.cleaner.push_tombstone(
                thread,
                OldDeleteRecord {
                    record: tombstone,
                    newer_version_ts: ts,
                },
            );
        }
        ts
    }
}

// ============================================================================
// BASIC OPERATION SCENARIOS
// ============================================================================

#[test]
fn insert_then_read() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 1);

    engine.put(&thread, &hash, b"a", b"1");
    assert_eq!(hash.size(), 1);
    assert_eq!(hash.get(b"a"), Some(b"1".to_vec()));

    // List order: header followed by the single element.
    let header = hash.header_record();
    let elem = engine.allocator.record(header.next());
    assert_eq!(elem.kind(), RecordKind::HashElem);
    assert_eq!(elem.value(), b"1");
    assert_eq!(elem.next(), hash.header_offset());
}

#[test]
fn overwrite_chains_versions_and_queues_one_old_record() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 1);

    engine.put(&thread, &hash, b"a", b"1");
    let ts2 = engine.put(&thread, &hash, b"a", b"2");

    assert_eq!(hash.size(), 1);
    assert_eq!(hash.get(b"a"), Some(b"2".to_vec()));

    let live = engine.allocator.record(hash.header_record().next());
    let prior = engine.allocator.record(live.old_version());
    assert_eq!(prior.value(), b"1");
    assert!(prior.timestamp() < ts2);

    let (data, tombstones) = engine.cleaner.cached_counts(&thread);
    assert_eq!((data, tombstones), (1, 0));
}

#[test]
fn delete_then_reinsert() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 1);

    engine.put(&thread, &hash, b"a", b"1");
    engine.delete(&thread, &hash, b"a");
    assert_eq!(hash.size(), 0);
    assert_eq!(hash.get(b"a"), None);

    let tombstone = engine.allocator.record(hash.header_record().next());
    assert_eq!(tombstone.status(), RecordStatus::Outdated);

    engine.put(&thread, &hash, b"a", b"3");
    assert_eq!(hash.size(), 1);
    assert_eq!(hash.get(b"a"), Some(b"3".to_vec()));
}

// ============================================================================
// ALGEBRAIC LAWS
// ============================================================================

#[test]
fn put_get_law() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 1);
    engine.put(&thread, &hash, b"k", b"v");
    assert_eq!(hash.get(b"k"), Some(b"v".to_vec()));
}

#[test]
fn put_delete_get_law() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 1);
    engine.put(&thread, &hash, b"k", b"v");
    engine.delete(&thread, &hash, b"k");
    assert_eq!(hash.get(b"k"), None);
}

#[test]
fn double_delete_is_single_delete() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 1);

    engine.put(&thread, &hash, b"k", b"v");
    engine.delete(&thread, &hash, b"k");
    let size_after_one = hash.size();
    let queued_after_one = engine.cleaner.cached_counts(&thread);
    let allocated_after_one = engine.allocator.bytes_allocated();

    engine.delete(&thread, &hash, b"k");
    assert_eq!(hash.size(), size_after_one);
    assert_eq!(engine.cleaner.cached_counts(&thread), queued_after_one);
    assert_eq!(engine.allocator.bytes_allocated(), allocated_after_one);
}

#[test]
fn second_put_wins_and_queues_exactly_one_prior() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 1);
    engine.put(&thread, &hash, b"k", b"v1");
    engine.put(&thread, &hash, b"k", b"v2");
    assert_eq!(hash.get(b"k"), Some(b"v2".to_vec()));
    assert_eq!(engine.cleaner.cached_counts(&thread).0, 1);
}

// ============================================================================
// WRITE STAGING
// ============================================================================

#[test]
fn prepared_writes_commit_separately() {
    let engine = engine();
    let hash = engine.collection(b"h", 1);

    let ts = engine.version.fetch_timestamp();
    let mut args = hash.init_write_args(b"staged", b"v", burrowdb::WriteOp::Put);
    hash.prepare_write(&mut args, ts).unwrap();
    // Space is reserved but the key is not visible yet.
    assert!(args.space().is_some());
    assert_eq!(hash.get(b"staged"), None);

    let result = hash.write(&mut args).unwrap();
    assert!(result.written.is_some());
    assert_eq!(hash.get(b"staged"), Some(b"v".to_vec()));
}

#[test]
fn memory_overflow_surfaces_from_prepare() {
    let allocator = Arc::new(Allocator::new(Arena::anonymous(4096).unwrap()));
    let index = Arc::new(HashIndex::new(16, Arc::clone(&allocator)));
    let locks = Arc::new(LockTable::new(64));
    let hash = HashCollection::create(b"h", 1, allocator, index, locks, 1).unwrap();

    // The tiny arena fits the header and little else.
    let big = vec![0u8; 8192];
    assert_eq!(hash.put(b"k", &big, 10).err(), Some(KvError::MemoryOverflow));
}

// ============================================================================
// MODIFY
// ============================================================================

#[test]
fn modify_abort_charges_nothing() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 1);
    engine.put(&thread, &hash, b"a", b"1");

    let allocated = engine.allocator.bytes_allocated();
    let ts = engine.version.fetch_timestamp();
    let err = hash.modify(b"a", |_| ModifyOp::Abort, ts);
    assert_eq!(err.err(), Some(KvError::Abort));
    assert_eq!(engine.allocator.bytes_allocated(), allocated);
    assert_eq!(hash.get(b"a"), Some(b"1".to_vec()));
    assert_eq!(hash.size(), 1);
}

#[test]
fn modify_read_modify_write_round_trip() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 1);
    engine.put(&thread, &hash, b"counter", b"10");

    let ts = engine.version.fetch_timestamp();
    hash.modify(
        b"counter",
        |current| {
            let n: i64 = std::str::from_utf8(current.unwrap())
                .unwrap()
                .parse()
                .unwrap();
            ModifyOp::Write((n + 1).to_string().into_bytes())
        },
        ts,
    )
    .unwrap();
    assert_eq!(hash.get(b"counter"), Some(b"11".to_vec()));
}

// ============================================================================
// EXPIRY AND DESTRUCTION
// ============================================================================

#[test]
fn expire_time_round_trips_through_header_replacement() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 1);
    engine.put(&thread, &hash, b"a", b"1");

    let deadline = burrowdb::types::unix_millis() + 120_000;
    let ts = engine.version.fetch_timestamp();
    let result = hash.set_expire_time(deadline, ts).unwrap();
    assert_eq!(hash.get_expire_time(), deadline);
    assert!(!hash.has_expired());
    assert!(result.existing.is_some());
    // Elements survive the header swap.
    assert_eq!(hash.get(b"a"), Some(b"1".to_vec()));
    assert_eq!(hash.check_index(), Ok(()));
}

#[test]
fn destroy_clears_list_slots_and_space() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 1);
    engine.put(&thread, &hash, b"a", b"1");
    engine.put(&thread, &hash, b"b", b"2");

    hash.destroy();
    assert_eq!(hash.get(b"a"), None);
    assert_eq!(hash.get(b"b"), None);
    assert!(engine.allocator.free_bytes() > 0);
    assert_eq!(hash.check_index(), Ok(()));
}

#[test]
fn destroy_all_reclaims_whole_version_chains() {
    let engine = engine();
    let hash = engine.collection(b"h", 1);
    // Direct puts: these versions stay on the chain, not in cleaner queues.
    for (value, ts) in [(b"1", 10u64), (b"2", 20), (b"3", 30)] {
        hash.put(b"a", value, ts).unwrap();
    }
    let total = engine.allocator.bytes_allocated();
    hash.destroy_all();
    assert_eq!(engine.allocator.free_bytes(), total);
}

// ============================================================================
// MULTIPLE COLLECTIONS
// ============================================================================

#[test]
fn collections_with_same_field_names_do_not_collide() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let first = engine.collection(b"first", 1);
    let second = engine.collection(b"second", 2);

    engine.put(&thread, &first, b"k", b"from-first");
    engine.put(&thread, &second, b"k", b"from-second");

    assert_eq!(first.get(b"k"), Some(b"from-first".to_vec()));
    assert_eq!(second.get(b"k"), Some(b"from-second".to_vec()));
    assert_eq!(first.check_index(), Ok(()));
    assert_eq!(second.check_index(), Ok(()));
}

#[test]
fn fetch_id_recovers_owning_collection() {
    let engine = engine();
    let thread = engine.registry.register().unwrap();
    let hash = engine.collection(b"h", 7);
    engine.put(&thread, &hash, b"a", b"1");
    let elem = engine.allocator.record(hash.header_record().next());
    assert_eq!(HashCollection::fetch_id(elem), 7);
    assert_eq!(HashCollection::fetch_id(hash.header_record()), 7);
}
