//! Synchronization primitives.
//!
//! The scheduling core only needs a spin lock: every critical section is
//! short and bounded, and blocking is expressed through thread queues
//! rather than by parking on a lock.

pub mod loom_compat;
mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
