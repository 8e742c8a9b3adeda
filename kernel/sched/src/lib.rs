//! SMP scheduling and synchronization core of the Kestrel kernel.
//!
//! The crate models scheduler instances that each own a set of processors
//! and schedule the threads homed on them, plus the thread queues every
//! blocking object is built on. Mutexes with priority inheritance, a
//! priority ceiling or MrsP, counting semaphores, and barriers sit on top
//! of the thread queues.
//!
//! A thread has one scheduler node per scheduler instance it may run on.
//! Its home node follows its own priority; helping nodes appear when a
//! thread in another instance waits for a mutex it owns. Processors,
//! heirs, and dispatch are simulated per processor in [`percpu`], so the
//! whole engine runs and is tested on the host.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod barrier;
pub mod config;
pub mod mutex;
pub mod percpu;
pub mod priority;
pub mod scheduler;
pub mod semaphore;
pub mod system;
pub mod thread;
pub mod threadq;

pub use barrier::Barrier;
pub use config::{Algorithm, SchedulerConfig, SystemConfig};
pub use mutex::{CeilingMutex, MrspMutex, Mutex, Protocol, Recursion, RecursiveMutex};
pub use priority::Priority;
pub use semaphore::Semaphore;
pub use system::System;
pub use thread::{SchedState, Thread, ThreadStates};
pub use threadq::{Discipline, QueueContext, ThreadQueue, WaitOutcome};
