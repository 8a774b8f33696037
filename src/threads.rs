//! # Access-Thread Registry
//!
//! Writer threads carry a small integer identity used to index per-thread
//! state (the cleaner's caches). Identities are assigned at attach, released
//! at detach, and recycled. OS thread ids are deliberately not used:
//! they are neither small nor dense and a thread pool may recycle OS
//! threads across logical writers.

use std::sync::Arc;

use eyre::{bail, Result};
use parking_lot::Mutex;

pub struct ThreadRegistry {
    max_threads: usize,
    state: Mutex<RegistryState>,
}

struct RegistryState {
    next: usize,
    recycled: Vec<usize>,
}

impl ThreadRegistry {
    pub fn new(max_threads: usize) -> Arc<Self> {
        Arc::new(Self {
            max_threads,
            state: Mutex::new(RegistryState {
                next: 0,
                recycled: Vec::new(),
            }),
        })
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Attach the calling thread, yielding its identity for the duration of
    /// the returned handle.
    pub fn register(self: &Arc<Self>) -> Result<ThreadHandle> {
        let mut state = self.state.lock();
        let id = if let Some(id) = state.recycled.pop() {
            id
        } else if state.next < self.max_threads {
            let id = state.next;
            state.next += 1;
            id
        } else {
            bail!("too many access threads (max {})", self.max_threads);
        };
        Ok(ThreadHandle {
            id,
            registry: Arc::clone(self),
        })
    }
}

/// RAII access-thread identity; detaching returns the id to the registry.
pub struct ThreadHandle {
    id: usize,
    registry: Arc<ThreadRegistry>,
}

impl ThreadHandle {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.registry.state.lock().recycled.push(self.id);
    }
}
