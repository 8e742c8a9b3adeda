//! Barriers.
//!
//! An automatic barrier opens by itself once `maximum` threads arrived; the
//! last arrival is not blocked. A manual barrier holds every arrival until
//! [`Barrier::release`] is called. A deleted barrier refuses every
//! operation with [`Status::InvalidId`].

use alloc::sync::Arc;

use kestrel_core::kdebug;
use kestrel_core::{Result, Status};

use crate::thread::{Thread, ThreadStates};
use crate::threadq::{self, Discipline, QueueContext, ThreadQueue, WaitOutcome, flush_default};

/// A barrier on a FIFO thread queue.
#[derive(Debug)]
pub struct Barrier {
    queue: ThreadQueue,
    /// Arrivals that open an automatic barrier. `None` for manual release.
    maximum: Option<u32>,
}

impl Barrier {
    /// Creates a barrier that opens when `maximum` threads are waiting.
    ///
    /// Fails with [`Status::InvalidNumber`] for a maximum of zero.
    pub fn automatic(name: &'static str, maximum: u32) -> Result<Self> {
        if maximum == 0 {
            return Err(Status::InvalidNumber);
        }
        Ok(Self {
            queue: ThreadQueue::new(name, Discipline::Fifo),
            maximum: Some(maximum),
        })
    }

    /// Creates a barrier that only opens through [`Barrier::release`].
    pub fn manual(name: &'static str) -> Self {
        Self {
            queue: ThreadQueue::new(name, Discipline::Fifo),
            maximum: None,
        }
    }

    /// Arrivals that open the barrier, `None` for manual release.
    pub fn maximum(&self) -> Option<u32> {
        self.maximum
    }

    /// Threads currently waiting.
    pub fn waiting(&self) -> usize {
        self.queue.len()
    }

    /// Lets `thread` arrive at the barrier.
    ///
    /// Returns [`WaitOutcome::Satisfied`] for the arrival that opens an
    /// automatic barrier, otherwise the thread waits.
    pub fn wait(&self, thread: &Arc<Thread>, ctx: &mut QueueContext) -> Result<WaitOutcome> {
        let guard = self.queue.lock_alive()?;
        if let Some(maximum) = self.maximum {
            let arrived = guard.len().saturating_add(1);
            if arrived >= maximum as usize {
                let released = threadq::flush(guard, flush_default, ctx);
                kdebug!("barrier {}: opened, {released} released", self.queue.name());
                return Ok(WaitOutcome::Satisfied);
            }
        }
        ctx.set_thread_state(ThreadStates::WAITING_FOR_BARRIER);
        threadq::enqueue(guard, thread, ctx)
    }

    /// Releases every waiting thread. Returns how many were released.
    pub fn release(&self) -> Result<usize> {
        let guard = self.queue.lock_alive()?;
        let released = threadq::flush(guard, flush_default, &mut QueueContext::new());
        kdebug!("barrier {}: released {released}", self.queue.name());
        Ok(released)
    }

    /// Deletes the barrier. Waiters are released with
    /// [`Status::ObjectWasDeleted`].
    pub fn delete(&self) -> Result<()> {
        let guard = self.queue.lock_alive()?;
        let released = threadq::delete(guard, &mut QueueContext::new());
        kdebug!("barrier {}: deleted, {released} released", self.queue.name());
        Ok(())
    }
}
