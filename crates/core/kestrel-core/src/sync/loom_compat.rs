//! Model-checker compatibility shim.
//!
//! With `cfg(loom)` the atomics and spin hint come from loom, with
//! `cfg(shuttle)` from shuttle, and otherwise from `core`. Code that routes
//! its atomics through this module can be model-checked unchanged.

// ---------------------------------------------------------------------------
// Loom mode
// ---------------------------------------------------------------------------

#[cfg(loom)]
pub use loom::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Spin-wait hint. Under loom this yields to the model scheduler.
#[cfg(loom)]
#[inline]
pub fn spin_loop() {
    loom::thread::yield_now();
}

// ---------------------------------------------------------------------------
// Shuttle mode
// ---------------------------------------------------------------------------

#[cfg(all(shuttle, not(loom)))]
pub use shuttle::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Spin-wait hint. Under shuttle this yields to the randomized scheduler.
#[cfg(all(shuttle, not(loom)))]
#[inline]
pub fn spin_loop() {
    shuttle::thread::yield_now();
}

// ---------------------------------------------------------------------------
// Normal mode
// ---------------------------------------------------------------------------

#[cfg(not(any(loom, shuttle)))]
pub use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Spin-wait hint.
#[cfg(not(any(loom, shuttle)))]
#[inline]
pub fn spin_loop() {
    core::hint::spin_loop();
}
