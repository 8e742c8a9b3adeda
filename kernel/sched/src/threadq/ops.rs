//! Queueing disciplines.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_core::id::SchedulerId;

use super::heads::Heads;
use crate::priority::Priority;
use crate::thread::{QueuePosition, Thread};

/// Order in which a thread queue releases its waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Arrival order.
    Fifo,
    /// Most urgent first, arrival order among equals.
    Priority,
    /// Like `Priority`, and the queue owner inherits the priority of its
    /// most urgent waiter in every scheduler instance.
    PriorityInherit,
}

impl Discipline {
    pub(crate) fn ops(self) -> &'static dyn ThreadQueueOps {
        match self {
            Self::Fifo => &FIFO,
            Self::Priority => &PRIORITY,
            Self::PriorityInherit => &PRIORITY_INHERIT,
        }
    }
}

/// Discipline-specific wait-set operations. Called with the queue lock
/// held; they may take the wait lock of the thread they are given.
pub(crate) trait ThreadQueueOps: Sync {
    fn discipline(&self) -> Discipline;

    /// Adds `thread` to the wait set.
    fn enqueue(&self, heads: &mut Heads, thread: &Arc<Thread>);

    /// Removes `thread` from the wait set.
    fn extract(&self, heads: &mut Heads, thread: &Thread);

    /// The waiter a surrender would pick.
    fn first(&self, heads: &Heads) -> Option<Arc<Thread>>;

    /// Re-positions a waiter after its priority changed.
    fn requeue(&self, _heads: &mut Heads, _thread: &Arc<Thread>) {}

    /// Called after a surrender picked the first waiter.
    fn surrendered(&self, _heads: &mut Heads) {}

    /// The owner inherits waiter priorities.
    fn inherits(&self) -> bool {
        false
    }
}

struct FifoOps;

static FIFO: FifoOps = FifoOps;

impl ThreadQueueOps for FifoOps {
    fn discipline(&self) -> Discipline {
        Discipline::Fifo
    }

    fn enqueue(&self, heads: &mut Heads, thread: &Arc<Thread>) {
        heads.fifo.push_back(Arc::clone(thread));
        heads.count += 1;
    }

    fn extract(&self, heads: &mut Heads, thread: &Thread) {
        let before = heads.fifo.len();
        heads.fifo.retain(|t| t.id() != thread.id());
        heads.count -= before - heads.fifo.len();
    }

    fn first(&self, heads: &Heads) -> Option<Arc<Thread>> {
        heads.fifo.front().cloned()
    }
}

/// Waiters sit in one priority queue per scheduler node they have, keyed
/// by the node's effective priority and arrival sequence. Surrenders
/// take the front of the first queue and then rotate the queues.
struct PriorityOps {
    inherit: bool,
}

static PRIORITY: PriorityOps = PriorityOps { inherit: false };
static PRIORITY_INHERIT: PriorityOps = PriorityOps { inherit: true };

impl PriorityOps {
    fn insert(heads: &mut Heads, thread: &Arc<Thread>) {
        let mut wait = thread.wait.lock();
        let nodes: Vec<(SchedulerId, Priority)> = wait
            .priorities
            .iter()
            .filter_map(|n| n.aggregation.effective().map(|p| (n.scheduler, p)))
            .collect();
        wait.positions.clear();
        for (scheduler, priority) in nodes {
            let seq = heads.next_seq();
            heads
                .queue_mut(scheduler)
                .waiters
                .insert((priority, seq), Arc::clone(thread));
            wait.positions.push(QueuePosition {
                scheduler,
                priority,
                seq,
            });
        }
    }

    fn remove(heads: &mut Heads, thread: &Thread) {
        let positions = core::mem::take(&mut thread.wait.lock().positions);
        for position in positions {
            if let Some(queue) = heads
                .queues
                .iter_mut()
                .find(|q| q.scheduler == position.scheduler)
            {
                queue.waiters.remove(&(position.priority, position.seq));
            }
        }
        heads.prune();
    }
}

impl ThreadQueueOps for PriorityOps {
    fn discipline(&self) -> Discipline {
        if self.inherit {
            Discipline::PriorityInherit
        } else {
            Discipline::Priority
        }
    }

    fn enqueue(&self, heads: &mut Heads, thread: &Arc<Thread>) {
        Self::insert(heads, thread);
        heads.count += 1;
    }

    fn extract(&self, heads: &mut Heads, thread: &Thread) {
        Self::remove(heads, thread);
        heads.count -= 1;
    }

    fn first(&self, heads: &Heads) -> Option<Arc<Thread>> {
        heads
            .queues
            .first()
            .and_then(|q| q.waiters.values().next().cloned())
    }

    fn requeue(&self, heads: &mut Heads, thread: &Arc<Thread>) {
        Self::remove(heads, thread);
        Self::insert(heads, thread);
    }

    fn surrendered(&self, heads: &mut Heads) {
        heads.rotate();
    }

    fn inherits(&self) -> bool {
        self.inherit
    }
}
