//! Scheduler instances.
//!
//! A scheduler instance owns a set of processors and decides which of its
//! scheduler nodes run on them. Every algorithm implements
//! [`SchedulerOps`]; the instance stores it behind its lock as a trait
//! object, so callers never know which algorithm is in effect.
//!
//! A thread has one node in its home scheduler and, while it inherits
//! priority from waiters homed elsewhere, helping nodes in their
//! schedulers. Only one node of a thread owns a processor at a time.

pub mod edf;
pub mod priority;
pub mod simple;
pub mod smp;

use alloc::boxed::Box;

use kestrel_core::cpumask::ProcessorMask;
use kestrel_core::id::{CpuId, SchedulerId, ThreadId};
use kestrel_core::sync::{SpinLock, SpinLockGuard};
use kestrel_core::{Result, Status};

use crate::config::{Algorithm, SchedulerConfig};
use crate::percpu::Processors;
use crate::priority::Priority;
use crate::thread::SchedulingCell;

pub use smp::{Insert, SmpScheduler};

/// State of a scheduler node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not eligible to run.
    Blocked,
    /// Eligible to run, but no processor assigned.
    Ready,
    /// Owns a processor.
    Scheduled,
}

/// Everything a scheduler needs to set up a node.
#[derive(Debug, Clone)]
pub struct NodeInit {
    /// Thread of the node.
    pub thread: ThreadId,
    /// Scheduling cell of the owning thread; `None` for idle threads.
    pub owner: Option<SchedulingCell>,
    /// Initial priority, mapped.
    pub priority: Priority,
    /// Processors the node may run on.
    pub affinity: ProcessorMask,
    /// The node is the home node of its thread.
    pub home: bool,
}

/// Operations every scheduling algorithm provides.
///
/// All methods run with the instance lock held. Operations that change
/// the schedule take the processor table so they can update heirs and
/// queue help requests. Node-changing operations return `true` if the
/// thread was left ready without a processor and may need help from
/// another instance.
pub trait SchedulerOps: Send {
    /// Converts a user priority into this instance's internal form.
    fn map_priority(&self, priority: Priority) -> Priority;

    /// Inverse of [`map_priority`](Self::map_priority).
    fn unmap_priority(&self, priority: Priority) -> Priority;

    /// Adds a node for `init.thread`. The node starts blocked.
    fn node_initialize(&mut self, init: NodeInit);

    /// Removes the node of `thread`. The node must be blocked.
    fn node_destroy(&mut self, thread: ThreadId);

    /// State of the node of `thread`, if it has one here.
    fn node_state(&self, thread: ThreadId) -> Option<NodeState>;

    /// Priority of the node of `thread`, mapped.
    fn node_priority(&self, thread: ThreadId) -> Option<Priority>;

    /// Re-evaluates the schedule for `thread`.
    ///
    /// SMP instances keep the schedule current in every other operation,
    /// so this defaults to doing nothing.
    fn schedule(&mut self, _cpus: &Processors, _thread: ThreadId) {}

    /// The node's thread stopped being ready.
    fn block(&mut self, cpus: &Processors, thread: ThreadId);

    /// The node's thread became ready again.
    fn unblock(&mut self, cpus: &Processors, thread: ThreadId) -> bool;

    /// The thread offers its processor to nodes of equal priority.
    fn yield_thread(&mut self, cpus: &Processors, thread: ThreadId) -> bool;

    /// The node's priority changed to `priority` (mapped).
    fn update_priority(&mut self, cpus: &Processors, thread: ThreadId, priority: Priority) -> bool;

    /// Tries to give a processor to a helping node whose thread is ready
    /// but runs nowhere. Returns `true` if no further help is needed.
    fn ask_for_help(&mut self, _cpus: &Processors, _thread: ThreadId) -> bool {
        false
    }

    /// Takes the node out of the schedule. If the node's thread was
    /// running through it, the thread moves to `next` at thread level.
    fn withdraw_node(&mut self, _cpus: &Processors, _thread: ThreadId, _next: NodeState) {}

    /// Keeps the node on `cpu` until [`unpin`](Self::unpin).
    fn pin(&mut self, _thread: ThreadId, _cpu: CpuId) {}

    /// Releases a pin.
    fn unpin(&mut self, _thread: ThreadId, _cpu: CpuId) {}

    /// Takes ownership of `cpu`, with `idle` as its idle node.
    fn add_processor(&mut self, _cpus: &Processors, _cpu: CpuId, _idle: NodeInit) {}

    /// Gives up `cpu`. Returns the idle thread of the processor.
    fn remove_processor(&mut self, _cpus: &Processors, _cpu: CpuId) -> Result<ThreadId> {
        Err(Status::NotConfigured)
    }

    /// Changes the processors the node may run on.
    fn set_affinity(
        &mut self,
        cpus: &Processors,
        thread: ThreadId,
        affinity: ProcessorMask,
    ) -> Result<()>;

    /// Processors owned by this instance.
    fn processors(&self) -> ProcessorMask;

    /// Returns `true` if any home node of a non-idle thread exists.
    fn has_home_threads(&self) -> bool;
}

/// Immutable descriptor of one scheduler instance.
pub struct Scheduler {
    id: SchedulerId,
    name: &'static str,
    algorithm: Algorithm,
    maximum_priority: Priority,
    ops: SpinLock<Box<dyn SchedulerOps>>,
}

impl Scheduler {
    /// Creates the instance described by `config`.
    pub fn new(id: SchedulerId, config: &SchedulerConfig) -> Self {
        let ops: Box<dyn SchedulerOps> = match config.algorithm {
            Algorithm::Priority => Box::new(SmpScheduler::<priority::PriorityPolicy>::new(id)),
            Algorithm::Edf => Box::new(SmpScheduler::<edf::EdfPolicy>::new(id)),
            Algorithm::Simple => Box::new(SmpScheduler::<simple::SimplePolicy>::new(id)),
        };
        Self {
            id,
            name: config.name,
            algorithm: config.algorithm,
            maximum_priority: Priority::new(config.maximum_priority),
            ops: SpinLock::named("scheduler", ops),
        }
    }

    /// Index in the scheduler table.
    pub fn id(&self) -> SchedulerId {
        self.id
    }

    /// Configured name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Algorithm of this instance.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The least urgent priority, reserved for idle threads.
    pub fn maximum_priority(&self) -> Priority {
        self.maximum_priority
    }

    /// Returns `true` if `priority` may be used by a thread.
    pub fn is_valid_priority(&self, priority: Priority) -> bool {
        priority.is_more_urgent_than(self.maximum_priority)
    }

    /// Maps a user priority.
    pub fn map_priority(&self, priority: Priority) -> Priority {
        self.ops.lock().map_priority(priority)
    }

    /// Unmaps a priority.
    pub fn unmap_priority(&self, priority: Priority) -> Priority {
        self.ops.lock().unmap_priority(priority)
    }

    /// Processors currently owned.
    pub fn processors(&self) -> ProcessorMask {
        self.ops.lock().processors()
    }

    /// Acquires the instance lock.
    pub(crate) fn lock(&self) -> SpinLockGuard<'_, Box<dyn SchedulerOps>> {
        self.ops.lock()
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
