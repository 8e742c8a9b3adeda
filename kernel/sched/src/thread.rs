//! Threads as seen by the scheduling core.
//!
//! A [`Thread`] carries three locks, acquired in this order when nested:
//!
//! 1. the *state lock* (`run`): blocking states, affinity, pinning;
//! 2. the *wait lock* (`wait`): which queue the thread waits on, its spare
//!    heads, its wait return code, and its priority aggregations;
//! 3. the *scheduling cell*: the thread-level scheduler state shared with
//!    the scheduler nodes of the thread.
//!
//! A thread-queue lock ranks between 1 and 2, and a scheduler instance lock
//! between 2 and 3. Two locks of the same rank are never held together.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use kestrel_core::cpumask::ProcessorMask;
use kestrel_core::id::{CpuId, SchedulerId, ThreadId};
use kestrel_core::sync::SpinLock;
use kestrel_core::sync::loom_compat::{AtomicU32, Ordering};
use kestrel_core::{Result, Status};

use crate::priority::{NodePriorities, Priority};
use crate::system::System;
use crate::threadq::heads::Heads;
use crate::threadq::QueueShared;

// ---------------------------------------------------------------------------
// Blocking states
// ---------------------------------------------------------------------------

bitflags! {
    /// Reasons a thread is not ready. A thread is ready iff none are set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThreadStates: u32 {
        /// Created but not started, or deleted.
        const DORMANT = 1 << 0;
        /// Explicitly suspended.
        const SUSPENDED = 1 << 1;
        /// Waiting to seize a mutex.
        const WAITING_FOR_MUTEX = 1 << 2;
        /// Waiting to obtain a semaphore unit.
        const WAITING_FOR_SEMAPHORE = 1 << 3;
        /// Waiting at a barrier.
        const WAITING_FOR_BARRIER = 1 << 4;
        /// Waiting on some other thread-queue object.
        const WAITING_FOR_OBJECT = 1 << 5;

        /// Every state that means "enqueued on a thread queue".
        const BLOCKED_ON_QUEUE = Self::WAITING_FOR_MUTEX.bits()
            | Self::WAITING_FOR_SEMAPHORE.bits()
            | Self::WAITING_FOR_BARRIER.bits()
            | Self::WAITING_FOR_OBJECT.bits();
    }
}

impl ThreadStates {
    /// Returns `true` if the thread may be scheduled.
    pub const fn is_ready(self) -> bool {
        self.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Wait flags
// ---------------------------------------------------------------------------

bitflags! {
    /// States of the blocking hand-off.
    ///
    /// `INTEND_TO_BLOCK` is set under the queue lock by the enqueuing thread.
    /// After it has blocked itself it tries to move to `BLOCKED`. A resumer
    /// that finds `INTEND_TO_BLOCK` moves straight to `READY_AGAIN` and
    /// leaves the unblock to the enqueuer; one that finds `BLOCKED` unblocks
    /// the thread itself.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitFlagBits: u32 {
        /// Enqueued, not yet blocked in the scheduler.
        const INTEND_TO_BLOCK = 1 << 0;
        /// Blocked in the scheduler.
        const BLOCKED = 1 << 1;
        /// Resolved; the wait is over.
        const READY_AGAIN = 1 << 2;
    }
}

/// Atomic wait flags of a thread.
pub struct WaitFlags(AtomicU32);

impl WaitFlags {
    /// Creates flags in the resolved state.
    pub fn new() -> Self {
        Self(AtomicU32::new(WaitFlagBits::READY_AGAIN.bits()))
    }

    /// Current flags.
    pub fn get(&self) -> WaitFlagBits {
        WaitFlagBits::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    /// Unconditionally sets the flags.
    pub fn set(&self, bits: WaitFlagBits) {
        self.0.store(bits.bits(), Ordering::Release);
    }

    /// Atomically replaces `expected` with `desired`.
    ///
    /// Returns `false` and leaves the flags alone if they were not
    /// `expected`.
    pub fn try_change(&self, expected: WaitFlagBits, desired: WaitFlagBits) -> bool {
        self.0
            .compare_exchange(
                expected.bits(),
                desired.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Resumer side of the hand-off. Returns `true` if the caller must
    /// unblock the thread.
    pub fn make_ready_again(&self) -> bool {
        if self.try_change(WaitFlagBits::INTEND_TO_BLOCK, WaitFlagBits::READY_AGAIN) {
            false
        } else {
            debug_assert_eq!(self.get(), WaitFlagBits::BLOCKED);
            self.set(WaitFlagBits::READY_AGAIN);
            true
        }
    }

    /// Enqueuer side of the hand-off, after blocking. Returns `true` if the
    /// wait was already resolved and the enqueuer must unblock itself.
    pub fn finish_blocking(&self) -> bool {
        !self.try_change(WaitFlagBits::INTEND_TO_BLOCK, WaitFlagBits::BLOCKED)
    }
}

impl Default for WaitFlags {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Scheduling cell
// ---------------------------------------------------------------------------

/// Thread-level scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedState {
    /// Not ready.
    Blocked,
    /// Ready, but no node of the thread is scheduled.
    Ready,
    /// One node of the thread owns a processor.
    Scheduled,
}

/// The part of a thread its scheduler nodes can see.
#[derive(Debug)]
pub struct Scheduling {
    /// Thread this cell belongs to.
    pub thread: ThreadId,
    /// Thread-level scheduler state.
    pub state: SchedState,
    /// Processor of the thread. Kept after blocking: last processor used.
    pub cpu: Option<CpuId>,
    /// Scheduler whose node currently owns the processor.
    pub scheduled_by: Option<SchedulerId>,
    /// Schedulers with a node of this thread, home first.
    pub nodes: Vec<SchedulerId>,
    /// Pinned threads never ask for help.
    pub pinned: bool,
}

impl Scheduling {
    /// Returns `true` if the thread has nodes besides its home node.
    pub fn has_helping_nodes(&self) -> bool {
        self.nodes.len() > 1
    }
}

/// Shared handle to a thread's scheduling cell.
pub type SchedulingCell = Arc<SpinLock<Scheduling>>;

// ---------------------------------------------------------------------------
// Wait and run state
// ---------------------------------------------------------------------------

/// Position of a waiter in one priority queue of a thread queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuePosition {
    pub scheduler: SchedulerId,
    pub priority: Priority,
    pub seq: u64,
}

/// State protected by the thread wait lock.
pub(crate) struct WaitState {
    pub queue: Option<Arc<QueueShared>>,
    pub positions: Vec<QueuePosition>,
    pub return_code: Result<()>,
    pub spare_heads: Option<Box<Heads>>,
    pub priorities: NodePriorities,
    pub timeout_armed: bool,
}

/// State protected by the thread state lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunState {
    pub states: ThreadStates,
    pub affinity: ProcessorMask,
    pub pin_level: u32,
    pub pinned: Option<(SchedulerId, CpuId)>,
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

/// A schedulable thread.
pub struct Thread {
    id: ThreadId,
    name: &'static str,
    system: Arc<System>,
    pub(crate) wait_flags: WaitFlags,
    pub(crate) run: SpinLock<RunState>,
    pub(crate) wait: SpinLock<WaitState>,
    pub(crate) scheduling: SchedulingCell,
    resource_count: AtomicU32,
}

impl Thread {
    pub(crate) fn new(
        system: Arc<System>,
        id: ThreadId,
        name: &'static str,
        home: SchedulerId,
        mapped_priority: Priority,
        affinity: ProcessorMask,
    ) -> Self {
        Self {
            id,
            name,
            system,
            wait_flags: WaitFlags::new(),
            run: SpinLock::named(
                "thread.run",
                RunState {
                    states: ThreadStates::DORMANT,
                    affinity,
                    pin_level: 0,
                    pinned: None,
                    deleted: false,
                },
            ),
            wait: SpinLock::named(
                "thread.wait",
                WaitState {
                    queue: None,
                    positions: Vec::new(),
                    return_code: Ok(()),
                    spare_heads: Some(Box::new(Heads::new())),
                    priorities: NodePriorities::new(home, mapped_priority),
                    timeout_armed: false,
                },
            ),
            scheduling: Arc::new(SpinLock::named(
                "thread.scheduling",
                Scheduling {
                    thread: id,
                    state: SchedState::Blocked,
                    cpu: None,
                    scheduled_by: None,
                    nodes: alloc::vec![home],
                    pinned: false,
                },
            )),
            resource_count: AtomicU32::new(0),
        }
    }

    /// Thread identifier.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Diagnostic name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The system this thread belongs to.
    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    /// Current blocking states.
    pub fn states(&self) -> ThreadStates {
        self.run.lock().states
    }

    /// Returns `true` if the thread is ready (possibly scheduled).
    pub fn is_ready(&self) -> bool {
        self.states().is_ready()
    }

    /// Thread-level scheduler state.
    pub fn sched_state(&self) -> SchedState {
        self.scheduling.lock().state
    }

    /// Processor the thread runs on, or last ran on.
    pub fn cpu(&self) -> Option<CpuId> {
        self.scheduling.lock().cpu
    }

    /// Home scheduler.
    pub fn home_scheduler(&self) -> SchedulerId {
        self.wait.lock().priorities.home()
    }

    /// Processor affinity.
    pub fn affinity(&self) -> ProcessorMask {
        self.run.lock().affinity
    }

    /// Real priority, in user-visible form.
    pub fn real_priority(&self) -> Priority {
        let (home, real) = {
            let wait = self.wait.lock();
            (wait.priorities.home(), wait.priorities.real())
        };
        self.system.unmap_priority(home, real)
    }

    /// Effective priority of the home node, in user-visible form.
    pub fn current_priority(&self) -> Priority {
        let (home, current) = {
            let wait = self.wait.lock();
            (wait.priorities.home(), wait.priorities.home_priority())
        };
        self.system.unmap_priority(home, current)
    }

    /// Effective priority of the node in `scheduler`, mapped form.
    pub fn node_priority(&self, scheduler: SchedulerId) -> Option<Priority> {
        self.wait.lock().priorities.effective(scheduler)
    }

    /// Number of mutexes currently owned.
    pub fn resource_count(&self) -> u32 {
        self.resource_count.load(Ordering::Acquire)
    }

    pub(crate) fn resource_count_increment(&self) {
        self.resource_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn resource_count_decrement(&self) {
        let previous = self.resource_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    /// Returns `true` while the thread is enqueued on a thread queue.
    pub fn is_waiting(&self) -> bool {
        self.wait.lock().queue.is_some()
    }

    /// Outcome of the last wait, or `None` while still enqueued.
    pub fn wait_result(&self) -> Option<Result<()>> {
        let wait = self.wait.lock();
        if wait.queue.is_some() {
            None
        } else {
            Some(wait.return_code)
        }
    }

    /// Overrides the wait return code. Used by deadlock callouts.
    pub fn set_wait_status(&self, status: Status) {
        self.wait.lock().return_code = Err(status);
    }

    /// Returns `true` if the thread still owns a spare heads structure.
    ///
    /// A thread owns one whenever it is not enqueued.
    pub fn has_spare_heads(&self) -> bool {
        self.wait.lock().spare_heads.is_some()
    }

    /// Current wait flags.
    pub fn wait_flags(&self) -> WaitFlagBits {
        self.wait_flags.get()
    }

    pub(crate) fn waiting_queue(&self) -> Option<Arc<QueueShared>> {
        self.wait.lock().queue.clone()
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom), not(shuttle)))]
mod tests {
    use super::*;

    #[test]
    fn ready_means_no_states() {
        assert!(ThreadStates::empty().is_ready());
        assert!(!ThreadStates::DORMANT.is_ready());
        assert!(ThreadStates::BLOCKED_ON_QUEUE.contains(ThreadStates::WAITING_FOR_MUTEX));
        assert!(!ThreadStates::BLOCKED_ON_QUEUE.contains(ThreadStates::SUSPENDED));
    }

    #[test]
    fn resumer_first_leaves_unblock_to_enqueuer() {
        let flags = WaitFlags::new();
        flags.set(WaitFlagBits::INTEND_TO_BLOCK);

        // Surrender arrives before the enqueuer reached the scheduler.
        assert!(!flags.make_ready_again());
        assert_eq!(flags.get(), WaitFlagBits::READY_AGAIN);

        // The enqueuer notices and unblocks itself.
        assert!(flags.finish_blocking());
    }

    #[test]
    fn enqueuer_first_leaves_unblock_to_resumer() {
        let flags = WaitFlags::new();
        flags.set(WaitFlagBits::INTEND_TO_BLOCK);

        assert!(!flags.finish_blocking());
        assert_eq!(flags.get(), WaitFlagBits::BLOCKED);

        assert!(flags.make_ready_again());
        assert_eq!(flags.get(), WaitFlagBits::READY_AGAIN);
    }

    #[test]
    fn handoff_race_unblocks_exactly_once() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize;

        for _ in 0..1000 {
            let flags = Arc::new(WaitFlags::new());
            flags.set(WaitFlagBits::INTEND_TO_BLOCK);
            let unblocks = Arc::new(AtomicUsize::new(0));

            let resumer = {
                let flags = Arc::clone(&flags);
                let unblocks = Arc::clone(&unblocks);
                std::thread::spawn(move || {
                    if flags.make_ready_again() {
                        unblocks.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
                    }
                })
            };
            if flags.finish_blocking() {
                unblocks.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            }
            resumer.join().unwrap();

            assert_eq!(unblocks.load(core::sync::atomic::Ordering::Relaxed), 1);
            assert_eq!(flags.get(), WaitFlagBits::READY_AGAIN);
        }
    }
}
