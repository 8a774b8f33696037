//! # Edge-Lock Table
//!
//! A fixed array of mutexes keyed by hashed record offset. List edge
//! mutations lock the positions they touch here; two records hashing to the
//! same slot simply share a lock. Offsets are hashed rather than pointers so
//! the keying is stable across remaps.
//!
//! Pair acquisition orders by slot index, so two threads locking the same
//! two positions in opposite order cannot deadlock.

use std::hash::BuildHasher;

use hashbrown::DefaultHashBuilder;
use parking_lot::{Mutex, MutexGuard};

use crate::types::MemOffset;

pub struct LockTable {
    locks: Box<[Mutex<()>]>,
    hasher: DefaultHashBuilder,
}

/// Guards for one or two slots; the second is absent when both positions
/// hash to the same slot.
pub struct PairGuard<'a> {
    _first: MutexGuard<'a, ()>,
    _second: Option<MutexGuard<'a, ()>>,
}

impl LockTable {
    pub fn new(size: usize) -> Self {
        let size = size.next_power_of_two();
        let locks = (0..size).map(|_| Mutex::new(())).collect::<Vec<_>>();
        Self {
            locks: locks.into_boxed_slice(),
            hasher: DefaultHashBuilder::default(),
        }
    }

    fn slot(&self, offset: MemOffset) -> usize {
        self.hasher.hash_one(offset) as usize & (self.locks.len() - 1)
    }

    pub fn lock(&self, offset: MemOffset) -> MutexGuard<'_, ()> {
        self.locks[self.slot(offset)].lock()
    }

    /// Lock the slots of both offsets in table order.
    pub fn lock_pair(&self, a: MemOffset, b: MemOffset) -> PairGuard<'_> {
        let (sa, sb) = (self.slot(a), self.slot(b));
        if sa == sb {
            PairGuard {
                _first: self.locks[sa].lock(),
                _second: None,
            }
        } else {
            let (lo, hi) = if sa < sb { (sa, sb) } else { (sb, sa) };
            let first = self.locks[lo].lock();
            let second = self.locks[hi].lock();
            PairGuard {
                _first: first,
                _second: Some(second),
            }
        }
    }
}
