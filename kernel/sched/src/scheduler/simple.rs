//! Simple SMP scheduling: fixed priority over one sorted ready list.
//!
//! Helping nodes are never scheduled by a simple instance.

use alloc::vec::Vec;

use kestrel_core::id::ThreadId;

use super::smp::{Insert, Policy, ReadySet};
use crate::priority::Priority;

/// A single ready list sorted by priority.
#[derive(Debug, Default)]
pub struct SimpleReady {
    list: Vec<(Priority, ThreadId)>,
}

impl ReadySet for SimpleReady {
    fn insert(&mut self, thread: ThreadId, priority: Priority, insert: Insert) {
        let index = self
            .list
            .iter()
            .position(|&(other, _)| insert.precedes(priority, other))
            .unwrap_or(self.list.len());
        self.list.insert(index, (priority, thread));
    }

    fn remove(&mut self, thread: ThreadId, _priority: Priority) {
        self.list.retain(|&(_, t)| t != thread);
    }

    fn highest<F: FnMut(ThreadId) -> bool>(&self, mut eligible: F) -> Option<ThreadId> {
        self.list.iter().map(|&(_, t)| t).find(|&t| eligible(t))
    }

    fn len(&self) -> usize {
        self.list.len()
    }
}

/// The simple algorithm.
#[derive(Debug)]
pub struct SimplePolicy;

impl Policy for SimplePolicy {
    type Ready = SimpleReady;

    const HELPS: bool = false;

    fn map_priority(priority: Priority) -> Priority {
        priority
    }

    fn unmap_priority(priority: Priority) -> Priority {
        priority
    }
}
