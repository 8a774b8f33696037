//! # Old-Records Cleaner
//!
//! Superseded versions and tombstones cannot be freed at write time: a
//! pinned snapshot may still need to walk to them. Writers instead hand
//! retired records to this cleaner, which defers each free until no live
//! snapshot can observe the record, then returns space to the allocator in
//! batches.
//!
//! ## Flow
//!
//! ```text
//!  writer thread                     background sweep
//!  ─────────────                     ────────────────
//!  push(OldDataRecord) ──┐
//!  push(OldDeleteRecord) ┤ per-thread caches
//!                        │   (mutex + two queues)
//!  try_clean_local(n) <──┤           try_clean_all()
//!   bounded drain of own │            ├─ steal caches into frozen batches
//!   queues, frees        │            ├─ data:      horizon check → purge → free now
//!   immediately          │            ├─ tombstones: horizon check → purge → pending batch
//!                        │            ├─ advance pending batches past the horizon
//!                        └───────────>└─ batch-free
//! ```
//!
//! ## Two timestamps, deliberately
//!
//! The bounded local path releases **data** records once their superseding
//! timestamp is below the snapshot horizon, but releases **tombstones**
//! only below the last global sweep's timestamp. A tombstone's hash slot is
//! cleared during purge; gating on the sweep timestamp keeps local clearing
//! ordered behind the sweep that may concurrently be retiring the same
//! slot's entries. Tests must not assume one timestamp for both.
//!
//! ## Fatal inputs
//!
//! The purge primitives panic on an impossible record kind. Queue entries
//! are produced by the engine itself; a wrong kind here means the arena or
//! a queue is corrupt, and masking that would let the corruption spread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{SNAPSHOT_REFRESH_INTERVAL, TOMBSTONE_STEAL_THRESHOLD};
use crate::index::HashIndex;
use crate::list::{remove_detached, LockTable};
use crate::record::{RecordKind, RecordStatus};
use crate::storage::{Allocator, SpaceEntry};
use crate::threads::ThreadHandle;
use crate::types::{MemOffset, Timestamp};

use super::VersionController;

/// A superseded data record whose live successor is known.
#[derive(Debug, Clone, Copy)]
pub struct OldDataRecord {
    pub record: MemOffset,
    pub newer_version_ts: Timestamp,
}

/// A tombstone whose hash slot may still point at it. The slot is
/// re-derived from the record's own key bytes at purge time.
#[derive(Debug, Clone, Copy)]
pub struct OldDeleteRecord {
    pub record: MemOffset,
    pub newer_version_ts: Timestamp,
}

/// Space whose release waits for the snapshot horizon to pass `free_at_ts`.
struct PendingFreeBatch {
    entries: Vec<SpaceEntry>,
    free_at_ts: Timestamp,
}

#[derive(Default)]
struct CacheQueues {
    data: VecDeque<OldDataRecord>,
    tombstones: VecDeque<OldDeleteRecord>,
}

/// One per access thread; contended only between the owning writer and the
/// global sweep's steal.
struct ThreadCache {
    queues: Mutex<CacheQueues>,
}

#[derive(Default)]
struct GlobalQueues {
    frozen_data: Vec<VecDeque<OldDataRecord>>,
    frozen_tombstones: Vec<VecDeque<OldDeleteRecord>>,
    pending_free: VecDeque<PendingFreeBatch>,
}

pub struct OldRecordsCleaner {
    allocator: Arc<Allocator>,
    index: Arc<HashIndex>,
    locks: Arc<LockTable>,
    version: Arc<VersionController>,
    caches: Box<[ThreadCache]>,
    global: Mutex<GlobalQueues>,
    last_clean_all_ts: AtomicU64,
    local_rounds: AtomicU64,
    tombstone_steal_threshold: usize,
}

impl OldRecordsCleaner {
    pub fn new(
        allocator: Arc<Allocator>,
        index: Arc<HashIndex>,
        locks: Arc<LockTable>,
        version: Arc<VersionController>,
        max_access_threads: usize,
    ) -> Self {
        let caches = (0..max_access_threads)
            .map(|_| ThreadCache {
                queues: Mutex::new(CacheQueues::default()),
            })
            .collect::<Vec<_>>();
        Self {
            allocator,
            index,
            locks,
            version,
            caches: caches.into_boxed_slice(),
            global: Mutex::new(GlobalQueues::default()),
            last_clean_all_ts: AtomicU64::new(0),
            local_rounds: AtomicU64::new(0),
            tombstone_steal_threshold: TOMBSTONE_STEAL_THRESHOLD,
        }
    }

    /// Override the tombstone steal threshold. The default is deliberately
    /// enormous (the bounded local path is the intended tombstone drain),
    /// but deployments that idle writer threads may want the sweep to take
    /// over sooner.
    pub fn with_tombstone_steal_threshold(mut self, threshold: usize) -> Self {
        self.tombstone_steal_threshold = threshold;
        self
    }

    /// Queue a superseded data record on the calling thread's cache.
    pub fn push_data(&self, thread: &ThreadHandle, record: OldDataRecord) {
        self.caches[thread.id()]
            .queues
            .lock()
            .data
            .push_back(record);
    }

    /// Queue a tombstone on the calling thread's cache.
    pub fn push_tombstone(&self, thread: &ThreadHandle, record: OldDeleteRecord) {
        self.caches[thread.id()]
            .queues
            .lock()
            .tombstones
            .push_back(record);
    }

    /// Records waiting in a thread's cache, `(data, tombstones)`.
    pub fn cached_counts(&self, thread: &ThreadHandle) -> (usize, usize) {
        let queues = self.caches[thread.id()].queues.lock();
        (queues.data.len(), queues.tombstones.len())
    }

    /// Coordinated sweep. Invoked by a single background thread; the global
    /// mutex makes a concurrent call harmless but serialized.
    pub fn try_clean_all(&self) {
        let sweep_ts = self.version.current_timestamp();
        self.version.update_oldest_snapshot();
        let oldest = self.version.oldest_snapshot_ts();

        let mut global = self.global.lock();

        // Steal thread caches. Data queues are taken eagerly; tombstone
        // queues only past the (enormous) threshold; the local bounded
        // path is their intended drain.
        for cache in self.caches.iter() {
            let mut queues = cache.queues.lock();
            if !queues.data.is_empty() {
                global.frozen_data.push(std::mem::take(&mut queues.data));
            }
            if queues.tombstones.len() > self.tombstone_steal_threshold {
                global
                    .frozen_tombstones
                    .push(std::mem::take(&mut queues.tombstones));
            }
        }

        // Data records below the horizon free immediately; the horizon
        // check already shielded them.
        let mut free_now = Vec::new();
        let mut delayed_data = VecDeque::new();
        for batch in global.frozen_data.drain(..) {
            for record in batch {
                if record.newer_version_ts <= oldest {
                    free_now.push(self.purge_data(record.record));
                } else {
                    delayed_data.push_back(record);
                }
            }
        }

        // Tombstone purges clear hash slots; their space joins a pending
        // batch released only once the horizon passes this sweep.
        let mut pending = Vec::new();
        let mut delayed_tombstones = VecDeque::new();
        for batch in global.frozen_tombstones.drain(..) {
            for record in batch {
                if record.newer_version_ts <= oldest {
                    pending.push(self.purge_tombstone(record.record));
                } else {
                    delayed_tombstones.push_back(record);
                }
            }
        }

        self.last_clean_all_ts.store(sweep_ts, Ordering::SeqCst);

        if !pending.is_empty() {
            let free_at_ts = self.version.current_timestamp();
            global.pending_free.push_back(PendingFreeBatch {
                entries: pending,
                free_at_ts,
            });
        }

        while let Some(front) = global.pending_free.front() {
            if front.free_at_ts < oldest {
                let batch = global.pending_free.pop_front().expect("front exists");
                self.allocator.batch_free(batch.entries);
            } else {
                break;
            }
        }

        if !free_now.is_empty() {
            self.allocator.batch_free(free_now);
        }

        if !delayed_data.is_empty() {
            global.frozen_data.push(delayed_data);
        }
        if !delayed_tombstones.is_empty() {
            global.frozen_tombstones.push(delayed_tombstones);
        }
    }

    /// Bounded cooperative trim of the calling thread's own queues, for the
    /// write path. Frees up to `limit` tombstones below the last sweep
    /// timestamp and up to `limit` data records below the snapshot horizon.
    pub fn try_clean_local(&self, thread: &ThreadHandle, limit: usize) {
        let mut queues = self.caches[thread.id()].queues.lock();
        if queues.data.is_empty() && queues.tombstones.is_empty() {
            return;
        }
        self.maybe_refresh_oldest();

        let last_sweep = self.last_clean_all_ts.load(Ordering::SeqCst);
        for _ in 0..limit {
            match queues.tombstones.front() {
                Some(t) if t.newer_version_ts < last_sweep => {
                    let t = queues.tombstones.pop_front().expect("front exists");
                    let entry = self.purge_tombstone(t.record);
                    self.allocator.free(entry);
                }
                _ => break,
            }
        }

        let oldest = self.version.oldest_snapshot_ts();
        for _ in 0..limit {
            match queues.data.front() {
                Some(d) if d.newer_version_ts < oldest => {
                    let d = queues.data.pop_front().expect("front exists");
                    let entry = self.purge_data(d.record);
                    self.allocator.free(entry);
                }
                _ => break,
            }
        }
    }

    pub fn last_clean_all_ts(&self) -> Timestamp {
        self.last_clean_all_ts.load(Ordering::SeqCst)
    }

    /// The horizon refresh is amortized over many local-clean calls.
    fn maybe_refresh_oldest(&self) {
        let round = self.local_rounds.fetch_add(1, Ordering::Relaxed) + 1;
        if round % SNAPSHOT_REFRESH_INTERVAL == 0 {
            self.version.update_oldest_snapshot();
        }
    }

    /// Destructively retire a superseded data record, yielding its space.
    fn purge_data(&self, offset: MemOffset) -> SpaceEntry {
        let record = self.allocator.record(offset);
        match record.kind() {
            RecordKind::StringData | RecordKind::SortedData | RecordKind::HashElem => {
                record.destroy();
                SpaceEntry::new(offset, record.record_size() as u64)
            }
            kind => panic!("cleaner fed non-data record kind {:?}", kind),
        }
    }

    /// Retire a tombstone: clear its hash slot if the slot still points at
    /// it, unlinking list-resident tombstones first, then yield its space.
    fn purge_tombstone(&self, offset: MemOffset) -> SpaceEntry {
        let record = self.allocator.record(offset);
        let size = record.record_size() as u64;
        match record.kind() {
            RecordKind::StringTombstone => {
                self.index
                    .clear_if_points_to(record.key(), record.kind(), offset);
            }
            kind @ (RecordKind::SortedTombstone | RecordKind::HashElem) => {
                debug_assert_eq!(
                    record.status(),
                    RecordStatus::Outdated,
                    "live record queued as tombstone"
                );
                // The slot may have been republished since this tombstone
                // was queued; re-read under its lock and only touch the
                // list when the slot still names this exact record.
                loop {
                    let _guard = self.index.slot_guard(record.key());
                    let lookup = self
                        .index
                        .lookup(record.key(), kind, false)
                        .expect("plain lookup cannot overflow");
                    match lookup.existing {
                        Some((pos, snapshot)) if snapshot.target == offset => {
                            if !remove_detached(offset, &self.allocator, &self.locks) {
                                // Structural conflict with a neighbour
                                // mutation; re-read the slot and retry.
                                continue;
                            }
                            self.index.erase(pos);
                        }
                        _ => {}
                    }
                    break;
                }
            }
            kind => panic!("cleaner fed non-tombstone record kind {:?}", kind),
        }
        record.destroy();
        SpaceEntry::new(offset, size)
    }
}
