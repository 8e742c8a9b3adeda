//! Thread queues.
//!
//! A [`ThreadQueue`] is the wait set embedded in every blocking object. It
//! has a lock of its own protecting the wait set and the owner link, and it
//! talks to the waiting threads through their wait locks and wait flags.
//!
//! # Lock order
//!
//! 1. thread state lock
//! 2. thread-queue lock
//! 3. thread wait lock
//! 4. scheduler instance lock
//! 5. thread scheduling cell
//! 6. per-processor lock
//!
//! The owner link of a queue and the help-request list are leaf locks. Two
//! wait locks are never held together; neither are two state locks.
//!
//! # Blocking
//!
//! A thread enqueues itself under the queue lock and sets its wait flags to
//! `INTEND_TO_BLOCK` before the lock is released. It then blocks in the
//! scheduler and tries to move the flags to `BLOCKED`. Whoever resolves the
//! wait (surrender, timeout, flush, extract) does so under the queue lock
//! and decides from the flags whether it must unblock the thread or leave
//! that to the enqueuer. A wakeup can therefore not be lost between the
//! decision to block and the actual block.
//!
//! # Priority updates
//!
//! Priority changes caused under the queue lock (inheritance, ceilings) are
//! only recorded in the [`QueueContext`]. They are applied after every lock
//! is released, one thread at a time, and follow the owner chain through
//! nested inheritance queues.

pub mod heads;
mod ops;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_core::id::{QueueId, SchedulerId};
use kestrel_core::sync::{SpinLock, SpinLockGuard};
use kestrel_core::{Result, Status, kfatal, ktrace};

use crate::priority::{NodePriorities, Priority, PrioritySource};
use crate::thread::{Thread, ThreadStates, WaitFlagBits};
use heads::Heads;
pub use ops::Discipline;
pub(crate) use ops::ThreadQueueOps;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Callouts and filters
// ---------------------------------------------------------------------------

/// Called when a thread would wait on a queue in its own ownership chain.
/// The thread is not enqueued.
pub type DeadlockCallout = fn(&Thread);

/// Decides the wait status of a waiter released by a flush. `None` stops
/// the flush at that waiter.
pub type FlushFilter = fn(&Thread) -> Option<Result<()>>;

/// Deadlocks among kernel objects are not recoverable.
pub fn deadlock_fatal(thread: &Thread) {
    kfatal!(
        "threadq: deadlock detected, thread {} ({})",
        thread.id(),
        thread.name()
    );
    panic!("thread queue deadlock");
}

/// Resolves the attempted wait with [`Status::Deadlock`].
pub fn deadlock_status(thread: &Thread) {
    thread.set_wait_status(Status::Deadlock);
}

/// Releases every waiter with success.
pub fn flush_default(_thread: &Thread) -> Option<Result<()>> {
    Some(Ok(()))
}

/// Releases every waiter with [`Status::Unsatisfied`].
pub fn flush_unavailable(_thread: &Thread) -> Option<Result<()>> {
    Some(Err(Status::Unsatisfied))
}

/// Releases every waiter with [`Status::ObjectWasDeleted`].
pub fn flush_object_was_deleted(_thread: &Thread) -> Option<Result<()>> {
    Some(Err(Status::ObjectWasDeleted))
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Per-operation context of a thread-queue operation.
pub struct QueueContext {
    thread_state: ThreadStates,
    timeout: bool,
    deadlock_callout: DeadlockCallout,
    updates: Vec<Arc<Thread>>,
}

impl QueueContext {
    /// A context for an untimed wait with the fatal deadlock callout.
    pub fn new() -> Self {
        Self {
            thread_state: ThreadStates::WAITING_FOR_OBJECT,
            timeout: false,
            deadlock_callout: deadlock_fatal,
            updates: Vec::new(),
        }
    }

    /// Arms a timeout for the wait. The timeout fires through
    /// [`timeout`].
    #[must_use]
    pub fn with_timeout(mut self) -> Self {
        self.timeout = true;
        self
    }

    /// Replaces the deadlock callout.
    #[must_use]
    pub fn with_deadlock_callout(mut self, callout: DeadlockCallout) -> Self {
        self.deadlock_callout = callout;
        self
    }

    /// Blocking state a waiter enters.
    pub fn thread_state(&self) -> ThreadStates {
        self.thread_state
    }

    /// Returns `true` if a timeout is armed.
    pub fn has_timeout(&self) -> bool {
        self.timeout
    }

    pub(crate) fn set_thread_state(&mut self, state: ThreadStates) {
        self.thread_state = state;
    }

    /// Records a thread whose priority must be updated once the locks are
    /// released.
    pub(crate) fn add_update(&mut self, thread: &Arc<Thread>) {
        if !self.updates.iter().any(|t| Arc::ptr_eq(t, thread)) {
            self.updates.push(Arc::clone(thread));
        }
    }
}

impl Default for QueueContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Immediate result of a wait attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The request was satisfied without waiting, or the wait was already
    /// resolved successfully.
    Satisfied,
    /// The thread is enqueued and blocked. The final status is reported by
    /// [`Thread::wait_result`] once the wait resolves.
    Blocked,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub(crate) struct QueueState {
    pub heads: Option<Box<Heads>>,
    /// Set once by [`delete`]; the object refuses every later operation.
    pub deleted: bool,
}

pub(crate) struct QueueShared {
    id: QueueId,
    name: &'static str,
    ops: &'static dyn ThreadQueueOps,
    state: SpinLock<QueueState>,
    owner: SpinLock<Option<Arc<Thread>>>,
}

impl QueueShared {
    pub(crate) fn id(&self) -> QueueId {
        self.id
    }

    pub(crate) fn owner(&self) -> Option<Arc<Thread>> {
        self.owner.lock().clone()
    }
}

/// Holds the lock of a thread queue.
pub struct QueueGuard<'a> {
    shared: &'a Arc<QueueShared>,
    state: SpinLockGuard<'a, QueueState>,
}

impl<'a> QueueGuard<'a> {
    fn new(shared: &'a Arc<QueueShared>) -> Self {
        Self {
            shared,
            state: shared.state.lock(),
        }
    }

    /// Owner of the queue.
    pub fn owner(&self) -> Option<Arc<Thread>> {
        self.shared.owner()
    }

    /// Changes the owner. Only allowed with the queue lock held.
    pub fn set_owner(&mut self, owner: Option<Arc<Thread>>) {
        *self.shared.owner.lock() = owner;
    }

    /// Returns `true` if the owner is `thread`.
    pub fn is_owner(&self, thread: &Thread) -> bool {
        self.shared
            .owner
            .lock()
            .as_ref()
            .is_some_and(|o| o.id() == thread.id())
    }

    /// Returns `true` if nobody waits.
    pub fn is_empty(&self) -> bool {
        self.state.heads.is_none()
    }

    /// Number of waiters.
    pub fn len(&self) -> usize {
        self.state.heads.as_ref().map_or(0, |h| h.len())
    }

    /// The waiter a surrender would pick.
    pub fn first(&self) -> Option<Arc<Thread>> {
        let heads = self.state.heads.as_deref()?;
        self.shared.ops.first(heads)
    }

    /// Identifier of the queue.
    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    /// Returns `true` once the object owning the queue was deleted.
    pub fn is_deleted(&self) -> bool {
        self.state.deleted
    }
}

/// The wait set of a blocking object.
pub struct ThreadQueue {
    shared: Arc<QueueShared>,
}

impl ThreadQueue {
    /// Creates an empty, unowned queue.
    pub fn new(name: &'static str, discipline: Discipline) -> Self {
        let id = QueueId::new(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            shared: Arc::new(QueueShared {
                id,
                name,
                ops: discipline.ops(),
                state: SpinLock::named(
                    "threadq",
                    QueueState {
                        heads: None,
                        deleted: false,
                    },
                ),
                owner: SpinLock::named("threadq.owner", None),
            }),
        }
    }

    /// Identifier of the queue.
    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    /// Diagnostic name.
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Queueing discipline.
    pub fn discipline(&self) -> Discipline {
        self.shared.ops.discipline()
    }

    /// Acquires the queue lock.
    pub fn lock(&self) -> QueueGuard<'_> {
        QueueGuard::new(&self.shared)
    }

    /// Acquires the queue lock of an object that was not deleted.
    ///
    /// Fails with [`Status::InvalidId`] after [`delete`].
    pub fn lock_alive(&self) -> Result<QueueGuard<'_>> {
        let guard = self.lock();
        if guard.is_deleted() {
            return Err(Status::InvalidId);
        }
        Ok(guard)
    }

    /// Returns `true` once the object owning the queue was deleted.
    pub fn is_deleted(&self) -> bool {
        self.lock().is_deleted()
    }

    /// Owner of the queue.
    pub fn owner(&self) -> Option<Arc<Thread>> {
        self.shared.owner()
    }

    /// Returns `true` if nobody waits.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of waiters.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// The waiter a surrender would pick.
    pub fn first(&self) -> Option<Arc<Thread>> {
        self.lock().first()
    }

    /// Blocks `thread` on this queue.
    pub fn enqueue(&self, thread: &Arc<Thread>, ctx: &mut QueueContext) -> Result<WaitOutcome> {
        enqueue(self.lock(), thread, ctx)
    }

    /// Removes `thread` with `status` if it waits on this queue. Returns
    /// `false` if it did not.
    pub fn extract(&self, thread: &Arc<Thread>, status: Result<()>) -> bool {
        extract_waiting(thread, &self.shared, status, false)
    }

    /// Hands the queue from `previous_owner` to the first waiter.
    pub fn surrender(&self, previous_owner: &Arc<Thread>, ctx: &mut QueueContext) -> Option<Arc<Thread>> {
        surrender(self.lock(), previous_owner, ctx)
    }

    /// Releases waiters as long as `filter` decides a status for them.
    /// Returns the number of released threads.
    pub fn flush(&self, filter: FlushFilter, ctx: &mut QueueContext) -> usize {
        flush(self.lock(), filter, ctx)
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        if !self.is_empty() {
            let mut ctx = QueueContext::new();
            self.flush(flush_object_was_deleted, &mut ctx);
        }
    }
}

impl core::fmt::Debug for ThreadQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadQueue")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("discipline", &self.discipline())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

fn outcome(thread: &Thread) -> Result<WaitOutcome> {
    match thread.wait_result() {
        None => Ok(WaitOutcome::Blocked),
        Some(Ok(())) => Ok(WaitOutcome::Satisfied),
        Some(Err(status)) => Err(status),
    }
}

/// Walks the ownership chain starting at the owner of `queue`.
fn would_deadlock(queue: &Arc<QueueShared>, thread: &Thread) -> bool {
    let mut owner = queue.owner();
    while let Some(current) = owner {
        if current.id() == thread.id() {
            return true;
        }
        let Some(next) = current.waiting_queue() else {
            return false;
        };
        if Arc::ptr_eq(&next, queue) {
            return false;
        }
        owner = next.owner();
    }
    false
}

fn effective_priorities(priorities: &NodePriorities) -> Vec<(SchedulerId, Option<Priority>)> {
    priorities
        .iter()
        .map(|n| (n.scheduler, n.aggregation.effective()))
        .collect()
}

/// Replaces the contributions `queue` makes to `thread`. Returns `true` if
/// an effective priority changed.
pub(crate) fn set_inherited(thread: &Thread, queue: QueueId, boosts: &[(SchedulerId, Priority)]) -> bool {
    let source = PrioritySource::Inherited(queue);
    let mut wait = thread.wait.lock();
    let before = effective_priorities(&wait.priorities);
    wait.priorities.remove_everywhere(source);
    for &(scheduler, priority) in boosts {
        wait.priorities.insert(scheduler, source, priority);
    }
    effective_priorities(&wait.priorities) != before
}

/// Lets the owner inherit the current waiter priorities. Returns the owner
/// if its priority changed.
fn inherit_to_owner(queue: &QueueShared, heads: Option<&Heads>) -> Option<Arc<Thread>> {
    let owner = queue.owner()?;
    let boosts = heads.map(Heads::boosts).unwrap_or_default();
    set_inherited(&owner, queue.id, &boosts).then_some(owner)
}

/// Removes `thread` from the queue and resolves its wait with `status`.
/// Returns `true` if the caller must unblock the thread after releasing
/// the queue lock.
fn extract_locked(
    guard: &mut QueueGuard<'_>,
    thread: &Arc<Thread>,
    status: Result<()>,
    ctx: &mut QueueContext,
) -> bool {
    let queue = guard.shared;
    if let Some(heads) = guard.state.heads.as_deref_mut() {
        queue.ops.extract(heads, thread);
    }
    let spare = Heads::give_back(&mut guard.state.heads);
    let dropped_ceiling = {
        let mut wait = thread.wait.lock();
        wait.queue = None;
        wait.return_code = status;
        wait.positions.clear();
        wait.timeout_armed = false;
        wait.spare_heads = spare;
        // A waiter raised to a ceiling for this queue keeps it only if it
        // becomes the owner.
        status.is_err()
            && wait
                .priorities
                .remove_everywhere(PrioritySource::Ceiling(queue.id))
    };
    if dropped_ceiling {
        ctx.add_update(thread);
    }
    if queue.ops.inherits() {
        if let Some(owner) = inherit_to_owner(queue, guard.state.heads.as_deref()) {
            ctx.add_update(&owner);
        }
    }
    thread.wait_flags.make_ready_again()
}

fn unblock(thread: &Arc<Thread>) {
    thread
        .system()
        .clear_state(thread, ThreadStates::BLOCKED_ON_QUEUE);
}

/// Enqueues `thread` on the locked queue and blocks it.
pub(crate) fn enqueue(
    mut guard: QueueGuard<'_>,
    thread: &Arc<Thread>,
    ctx: &mut QueueContext,
) -> Result<WaitOutcome> {
    let queue = guard.shared;
    if guard.state.deleted {
        return Err(Status::InvalidId);
    }
    if would_deadlock(queue, thread) {
        drop(guard);
        (ctx.deadlock_callout)(thread);
        return Err(Status::Deadlock);
    }

    let spare = {
        let mut wait = thread.wait.lock();
        debug_assert!(wait.queue.is_none());
        wait.queue = Some(Arc::clone(queue));
        wait.return_code = Ok(());
        wait.timeout_armed = ctx.timeout;
        wait.spare_heads.take()
    };
    Heads::lend(&mut guard.state.heads, spare);
    if let Some(heads) = guard.state.heads.as_deref_mut() {
        queue.ops.enqueue(heads, thread);
    }
    if queue.ops.inherits() {
        if let Some(owner) = inherit_to_owner(queue, guard.state.heads.as_deref()) {
            ctx.add_update(&owner);
        }
    }
    thread.wait_flags.set(WaitFlagBits::INTEND_TO_BLOCK);
    ktrace!("threadq: {} waits on {} ({})", thread.id(), queue.id, queue.name);
    drop(guard);

    let system = thread.system();
    system.set_state(thread, ctx.thread_state);
    if thread.wait_flags.finish_blocking() {
        system.clear_state(thread, ctx.thread_state);
    }
    priority_update(ctx);
    outcome(thread)
}

/// Releases the locked queue on behalf of `previous_owner`. The first
/// waiter becomes the owner; without waiters the queue becomes unowned.
pub(crate) fn surrender(
    mut guard: QueueGuard<'_>,
    previous_owner: &Arc<Thread>,
    ctx: &mut QueueContext,
) -> Option<Arc<Thread>> {
    let queue = guard.shared;
    if queue.ops.inherits() && set_inherited(previous_owner, queue.id, &[]) {
        ctx.add_update(previous_owner);
    }

    let first = guard.first();
    guard.set_owner(first.clone());
    let mut needs_unblock = false;
    if let Some(new_owner) = &first {
        new_owner.resource_count_increment();
        needs_unblock = extract_locked(&mut guard, new_owner, Ok(()), ctx);
        if let Some(heads) = guard.state.heads.as_deref_mut() {
            queue.ops.surrendered(heads);
        }
        ktrace!(
            "threadq: {} hands {} to {}",
            previous_owner.id(),
            queue.id,
            new_owner.id()
        );
    }
    drop(guard);

    priority_update(ctx);
    if let Some(new_owner) = &first {
        if needs_unblock {
            unblock(new_owner);
        }
    }
    first
}

/// Releases the first waiter of the locked queue with success, without
/// touching the owner.
pub(crate) fn dequeue(mut guard: QueueGuard<'_>, ctx: &mut QueueContext) -> Option<Arc<Thread>> {
    let first = guard.first()?;
    let needs_unblock = extract_locked(&mut guard, &first, Ok(()), ctx);
    if let Some(heads) = guard.state.heads.as_deref_mut() {
        guard.shared.ops.surrendered(heads);
    }
    drop(guard);

    priority_update(ctx);
    if needs_unblock {
        unblock(&first);
    }
    Some(first)
}

/// Flushes the locked queue through `filter`.
pub(crate) fn flush(mut guard: QueueGuard<'_>, filter: FlushFilter, ctx: &mut QueueContext) -> usize {
    let mut released = Vec::new();
    while let Some(first) = guard.first() {
        let Some(status) = filter(&first) else {
            break;
        };
        let needs_unblock = extract_locked(&mut guard, &first, status, ctx);
        released.push((first, needs_unblock));
    }
    drop(guard);

    priority_update(ctx);
    for (thread, needs_unblock) in &released {
        if *needs_unblock {
            unblock(thread);
        }
    }
    released.len()
}

/// Marks the locked queue deleted and releases every waiter with
/// [`Status::ObjectWasDeleted`]. Returns the number of released threads.
pub(crate) fn delete(mut guard: QueueGuard<'_>, ctx: &mut QueueContext) -> usize {
    guard.state.deleted = true;
    ktrace!("threadq: {} ({}) deleted", guard.shared.id, guard.shared.name);
    flush(guard, flush_object_was_deleted, ctx)
}

/// Extracts `thread` if, under the lock of `queue`, it still waits there.
fn extract_waiting(
    thread: &Arc<Thread>,
    queue: &Arc<QueueShared>,
    status: Result<()>,
    timed_out: bool,
) -> bool {
    let mut ctx = QueueContext::new();
    let mut guard = QueueGuard::new(queue);
    {
        let wait = thread.wait.lock();
        let still_waiting = wait.queue.as_ref().is_some_and(|q| Arc::ptr_eq(q, queue));
        if !still_waiting || (timed_out && !wait.timeout_armed) {
            return false;
        }
    }
    let needs_unblock = extract_locked(&mut guard, thread, status, &mut ctx);
    drop(guard);

    priority_update(&mut ctx);
    if needs_unblock {
        unblock(thread);
    }
    true
}

/// Removes `thread` from whatever queue it waits on and resolves the wait
/// with `status`. Returns `false` if the thread was not waiting, so that
/// losing a race against a surrender is harmless.
pub fn extract(thread: &Arc<Thread>, status: Result<()>) -> bool {
    thread
        .waiting_queue()
        .is_some_and(|queue| extract_waiting(thread, &queue, status, false))
}

/// Fires the armed timeout of `thread`: like [`extract`] with
/// [`Status::Timeout`]. Does nothing if no timeout is armed or the wait
/// already resolved.
pub fn timeout(thread: &Arc<Thread>) -> bool {
    thread
        .waiting_queue()
        .is_some_and(|queue| extract_waiting(thread, &queue, Err(Status::Timeout), true))
}

/// Applies the priority changes recorded in `ctx`.
///
/// Runs without locks held. For each thread the scheduler nodes are
/// updated first; a thread that waits on a priority queue is then
/// re-positioned, and if that queue passes priorities on to its owner the
/// owner is updated next.
pub(crate) fn priority_update(ctx: &mut QueueContext) {
    let mut pending: VecDeque<Arc<Thread>> = ctx.updates.drain(..).collect();
    while let Some(thread) = pending.pop_front() {
        thread.system().update_priority(&thread);

        let Some(queue) = thread.waiting_queue() else {
            continue;
        };
        let mut guard = QueueGuard::new(&queue);
        let still_waiting = thread
            .wait
            .lock()
            .queue
            .as_ref()
            .is_some_and(|q| Arc::ptr_eq(q, &queue));
        if !still_waiting {
            continue;
        }
        if let Some(heads) = guard.state.heads.as_deref_mut() {
            queue.ops.requeue(heads, &thread);
        }
        if queue.ops.inherits() {
            if let Some(owner) = inherit_to_owner(&queue, guard.state.heads.as_deref()) {
                pending.push_back(owner);
            }
        }
    }
}
