//! # Version Control
//!
//! The engine's monotone logical clock and snapshot registry. Writers fetch
//! strictly increasing timestamps; readers pin a snapshot to hold the
//! reclamation horizon back while they run.
//!
//! ## Snapshot slots
//!
//! Pinned snapshots live in a fixed array of `AtomicU64` (0 = free slot),
//! claimed under a small mutex and released lock-free by guard drop.
//! The horizon, the oldest pinned timestamp, is computed by a lock-free
//! scan over the slots and cached in `oldest_snapshot_ts`; the cleaner
//! refreshes the cache at its own cadence rather than on every query.
//!
//! With no snapshot pinned the horizon is `current + 1`: every already
//! issued timestamp is past it, so everything superseded is reclaimable.
//!
//! ## Memory layout
//!
//! ```text
//! VersionController {
//!     current: AtomicU64,               // 8 bytes
//!     oldest_snapshot: AtomicU64,       // 8 bytes
//!     slots: [AtomicU64; 64],           // 512 bytes
//!     slot_lock: Mutex<()>,
//! }
//! ```

pub mod cleaner;

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{bail, Result};
use parking_lot::Mutex;

use crate::config::MAX_SNAPSHOTS;
use crate::types::Timestamp;

pub struct VersionController {
    current: AtomicU64,
    oldest_snapshot: AtomicU64,
    slots: [AtomicU64; MAX_SNAPSHOTS],
    slot_lock: Mutex<()>,
}

impl VersionController {
    #[allow(clippy::declare_interior_mutable_const)]
    pub fn new() -> Self {
        const FREE: AtomicU64 = AtomicU64::new(0);
        Self {
            current: AtomicU64::new(1),
            oldest_snapshot: AtomicU64::new(1),
            #[allow(clippy::borrow_interior_mutable_const)]
            slots: [FREE; MAX_SNAPSHOTS],
            slot_lock: Mutex::new(()),
        }
    }

    /// Issue the next timestamp. Strictly greater than every previously
    /// issued one.
    pub fn fetch_timestamp(&self) -> Timestamp {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently issued timestamp.
    pub fn current_timestamp(&self) -> Timestamp {
        self.current.load(Ordering::SeqCst)
    }

    /// Pin the current timestamp. The returned guard holds the reclamation
    /// horizon at or below this value until dropped.
    pub fn snapshot(&self) -> Result<SnapshotGuard<'_>> {
        let _guard = self.slot_lock.lock();
        let ts = self.current.load(Ordering::SeqCst);
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.load(Ordering::Relaxed) == 0 {
                slot.store(ts, Ordering::SeqCst);
                return Ok(SnapshotGuard {
                    controller: self,
                    slot: idx,
                    ts,
                });
            }
        }
        bail!("too many concurrent snapshots (max {})", MAX_SNAPSHOTS)
    }

    /// Recompute and cache the oldest pinned snapshot timestamp.
    pub fn update_oldest_snapshot(&self) {
        let mut min_ts = self.current.load(Ordering::SeqCst) + 1;
        for slot in &self.slots {
            let ts = slot.load(Ordering::SeqCst);
            if ts != 0 && ts < min_ts {
                min_ts = ts;
            }
        }
        self.oldest_snapshot.store(min_ts, Ordering::SeqCst);
    }

    /// The cached reclamation horizon. Only as fresh as the last
    /// `update_oldest_snapshot` call, which is exactly the staleness the
    /// cleaner tolerates: a stale (smaller) horizon only delays frees.
    pub fn oldest_snapshot_ts(&self) -> Timestamp {
        self.oldest_snapshot.load(Ordering::SeqCst)
    }
}

impl Default for VersionController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII pin on a snapshot timestamp.
pub struct SnapshotGuard<'a> {
    controller: &'a VersionController,
    slot: usize,
    ts: Timestamp,
}

impl SnapshotGuard<'_> {
    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        self.controller.slots[self.slot].store(0, Ordering::SeqCst);
    }
}
