//! # Storage Layer
//!
//! The offset-addressed foundation the rest of the engine stands on: a
//! memory-mapped [`Arena`](arena::Arena) whose offsets stay valid across
//! process restarts, and an [`Allocator`](allocator::Allocator) that carves
//! record space out of it and takes reclaimed space back.
//!
//! Only the record bytes inside the arena are persistent state. The
//! allocator's free lists, like the hash index and the cleaner queues, are
//! in-memory structures reconstructed on open.

pub mod allocator;
pub mod arena;

pub use allocator::{Allocator, SpaceEntry};
pub use arena::Arena;
