//! Wait-set storage of a thread queue.
//!
//! Every thread owns one spare [`Heads`]. The first thread to block on an
//! empty queue lends its spare to the queue; later waiters park theirs on
//! the free chain of the queue's heads. Extraction hands one back: from the
//! free chain while other waiters remain, or the queue's heads itself when
//! the last waiter leaves. So a queue holds heads iff it has waiters, and
//! a thread holds a spare iff it is not enqueued.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_core::id::SchedulerId;

use crate::priority::Priority;
use crate::thread::Thread;

/// Waiters homed in (or helping through) one scheduler instance.
pub(crate) struct PriorityQueue {
    pub scheduler: SchedulerId,
    pub waiters: BTreeMap<(Priority, u64), Arc<Thread>>,
}

/// Wait set of a thread queue.
pub struct Heads {
    pub(crate) fifo: VecDeque<Arc<Thread>>,
    pub(crate) queues: Vec<PriorityQueue>,
    pub(crate) free: Vec<Box<Heads>>,
    pub(crate) count: usize,
    seq: u64,
}

impl Heads {
    /// Creates an empty heads structure.
    pub fn new() -> Self {
        Self {
            fifo: VecDeque::new(),
            queues: Vec::new(),
            free: Vec::new(),
            count: 0,
            seq: 0,
        }
    }

    /// Number of waiting threads.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if nobody waits.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Priority queue of `scheduler`, created at the end of the rotation
    /// if missing.
    pub(crate) fn queue_mut(&mut self, scheduler: SchedulerId) -> &mut PriorityQueue {
        let index = match self.queues.iter().position(|q| q.scheduler == scheduler) {
            Some(index) => index,
            None => {
                self.queues.push(PriorityQueue {
                    scheduler,
                    waiters: BTreeMap::new(),
                });
                self.queues.len() - 1
            }
        };
        &mut self.queues[index]
    }

    /// Drops empty priority queues.
    pub(crate) fn prune(&mut self) {
        self.queues.retain(|q| !q.waiters.is_empty());
    }

    /// Moves the first priority queue to the end of the rotation.
    pub(crate) fn rotate(&mut self) {
        if self.queues.len() > 1 {
            self.queues.rotate_left(1);
        }
    }

    /// Most urgent waiter priority per scheduler instance.
    pub(crate) fn boosts(&self) -> Vec<(SchedulerId, Priority)> {
        self.queues
            .iter()
            .filter_map(|q| {
                q.waiters
                    .keys()
                    .next()
                    .map(|&(priority, _)| (q.scheduler, priority))
            })
            .collect()
    }

    /// Lends a thread's spare heads to the queue currently using `slot`.
    pub(crate) fn lend(slot: &mut Option<Box<Heads>>, spare: Option<Box<Heads>>) {
        let Some(spare) = spare else {
            debug_assert!(false, "enqueued thread without spare heads");
            return;
        };
        debug_assert!(spare.is_empty() && spare.free.is_empty());
        match slot {
            Some(heads) => heads.free.push(spare),
            None => *slot = Some(spare),
        }
    }

    /// Gives a heads back to a thread leaving the queue using `slot`.
    pub(crate) fn give_back(slot: &mut Option<Box<Heads>>) -> Option<Box<Heads>> {
        let heads = slot.as_mut()?;
        match heads.free.pop() {
            Some(spare) => Some(spare),
            None => {
                debug_assert!(heads.is_empty());
                let mut last = slot.take()?;
                last.queues.clear();
                Some(last)
            }
        }
    }
}

impl Default for Heads {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lend_and_give_back() {
        let mut slot = None;
        Heads::lend(&mut slot, Some(Box::new(Heads::new())));
        assert!(slot.is_some());

        Heads::lend(&mut slot, Some(Box::new(Heads::new())));
        Heads::lend(&mut slot, Some(Box::new(Heads::new())));
        assert_eq!(slot.as_ref().map(|h| h.free.len()), Some(2));

        assert!(Heads::give_back(&mut slot).is_some());
        assert!(Heads::give_back(&mut slot).is_some());
        assert!(slot.is_some());
        assert!(Heads::give_back(&mut slot).is_some());
        assert!(slot.is_none());
        assert!(Heads::give_back(&mut slot).is_none());
    }

    #[test]
    fn rotation_moves_front_to_back() {
        let mut heads = Heads::new();
        heads.queue_mut(SchedulerId::new(0));
        heads.queue_mut(SchedulerId::new(1));
        heads.rotate();
        let order: Vec<SchedulerId> = heads.queues.iter().map(|q| q.scheduler).collect();
        assert_eq!(order, vec![SchedulerId::new(1), SchedulerId::new(0)]);
    }
}
