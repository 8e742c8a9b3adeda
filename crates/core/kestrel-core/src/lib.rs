//! Core types and synchronization primitives for the Kestrel scheduling core.
//!
//! This crate holds the host-testable leaf abstractions shared by the
//! scheduler engine: typed identifiers, the directive status taxonomy,
//! processor masks, spin locks, and the leveled kernel logging facade.
//!
//! Nothing here knows about threads or schedulers, so it can be tested with
//! `cargo test`, loom, and shuttle on the host without a kernel target.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod cpumask;
pub mod id;
pub mod log;
pub mod status;
pub mod sync;

pub use status::{Result, Status};
