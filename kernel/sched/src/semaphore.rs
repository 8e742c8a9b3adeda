//! Counting semaphore.
//!
//! [`Semaphore`] hands out units of a counted resource. Obtaining a unit
//! decrements the count; with the count at zero the caller waits on the
//! thread queue. A release wakes the first waiter directly, the unit never
//! becomes visible in the count. A deleted semaphore refuses every
//! operation with [`Status::InvalidId`].
//!
//! # Example
//!
//! ```ignore
//! let sem = Semaphore::new("slots", 2, u32::MAX, Discipline::Priority);
//! let mut ctx = QueueContext::new();
//! sem.obtain(&worker, true, &mut ctx)?;
//! // ... use the slot ...
//! sem.release(&mut ctx)?;
//! ```

use alloc::sync::Arc;

use kestrel_core::kdebug;
use kestrel_core::sync::loom_compat::{AtomicU32, Ordering};
use kestrel_core::{Result, Status};

use crate::thread::{Thread, ThreadStates};
use crate::threadq::{self, Discipline, QueueContext, ThreadQueue, WaitOutcome, flush_unavailable};

/// A counting semaphore without owner.
#[derive(Debug)]
pub struct Semaphore {
    queue: ThreadQueue,
    /// Changed only under the queue lock.
    count: AtomicU32,
    maximum: u32,
}

impl Semaphore {
    /// Creates a semaphore holding `count` of at most `maximum` units.
    pub fn new(name: &'static str, count: u32, maximum: u32, discipline: Discipline) -> Self {
        debug_assert!(
            discipline != Discipline::PriorityInherit,
            "semaphores have no owner to inherit"
        );
        Self {
            queue: ThreadQueue::new(name, discipline),
            count: AtomicU32::new(count.min(maximum)),
            maximum,
        }
    }

    /// Creates a semaphore with one unit.
    pub fn binary(name: &'static str, discipline: Discipline) -> Self {
        Self::new(name, 1, 1, discipline)
    }

    /// Units currently available.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Upper bound of the count.
    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    /// Waiter order.
    pub fn discipline(&self) -> Discipline {
        self.queue.discipline()
    }

    /// The wait queue of the semaphore.
    pub fn queue(&self) -> &ThreadQueue {
        &self.queue
    }

    /// Takes one unit for `thread`.
    ///
    /// With no unit available this fails with [`Status::Unsatisfied`] if
    /// `wait` is `false`, otherwise the thread waits for a release.
    pub fn obtain(
        &self,
        thread: &Arc<Thread>,
        wait: bool,
        ctx: &mut QueueContext,
    ) -> Result<WaitOutcome> {
        let guard = self.queue.lock_alive()?;
        let count = self.count.load(Ordering::Acquire);
        if count > 0 {
            self.count.store(count - 1, Ordering::Release);
            return Ok(WaitOutcome::Satisfied);
        }
        if !wait {
            return Err(Status::Unsatisfied);
        }
        ctx.set_thread_state(ThreadStates::WAITING_FOR_SEMAPHORE);
        threadq::enqueue(guard, thread, ctx)
    }

    /// Returns one unit. Returns the woken waiter, if any.
    ///
    /// Fails with [`Status::Unsatisfied`] if the count is already at its
    /// maximum.
    pub fn release(&self, ctx: &mut QueueContext) -> Result<Option<Arc<Thread>>> {
        let guard = self.queue.lock_alive()?;
        if !guard.is_empty() {
            return Ok(threadq::dequeue(guard, ctx));
        }
        let count = self.count.load(Ordering::Acquire);
        if count >= self.maximum {
            return Err(Status::Unsatisfied);
        }
        self.count.store(count + 1, Ordering::Release);
        Ok(None)
    }

    /// Releases all waiters with [`Status::Unsatisfied`]. The count is
    /// unchanged. Returns the number of released waiters.
    pub fn flush(&self) -> Result<usize> {
        let guard = self.queue.lock_alive()?;
        let released = threadq::flush(guard, flush_unavailable, &mut QueueContext::new());
        kdebug!("semaphore {}: flushed {released} waiters", self.queue.name());
        Ok(released)
    }

    /// Deletes the semaphore. Waiters are released with
    /// [`Status::ObjectWasDeleted`].
    pub fn delete(&self) -> Result<()> {
        let guard = self.queue.lock_alive()?;
        let released = threadq::delete(guard, &mut QueueContext::new());
        kdebug!("semaphore {}: deleted, {released} released", self.queue.name());
        Ok(())
    }
}
