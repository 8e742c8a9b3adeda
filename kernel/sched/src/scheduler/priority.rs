//! Fixed-priority SMP scheduling.
//!
//! Ready nodes are kept in one FIFO per priority level. Mapping is the
//! identity.

use alloc::collections::{BTreeMap, VecDeque};

use kestrel_core::id::ThreadId;

use super::smp::{Insert, Policy, ReadySet};
use crate::priority::Priority;

/// Ready queues indexed by priority, FIFO within a level.
#[derive(Debug, Default)]
pub struct PriorityReady {
    levels: BTreeMap<Priority, VecDeque<ThreadId>>,
    len: usize,
}

impl ReadySet for PriorityReady {
    fn insert(&mut self, thread: ThreadId, priority: Priority, insert: Insert) {
        let level = self.levels.entry(priority).or_default();
        match insert {
            Insert::Append => level.push_back(thread),
            Insert::Prepend => level.push_front(thread),
        }
        self.len += 1;
    }

    fn remove(&mut self, thread: ThreadId, priority: Priority) {
        let Some(level) = self.levels.get_mut(&priority) else {
            return;
        };
        if let Some(index) = level.iter().position(|&t| t == thread) {
            level.remove(index);
            self.len -= 1;
        }
        if level.is_empty() {
            self.levels.remove(&priority);
        }
    }

    fn highest<F: FnMut(ThreadId) -> bool>(&self, mut eligible: F) -> Option<ThreadId> {
        self.levels
            .values()
            .flat_map(|level| level.iter().copied())
            .find(|&t| eligible(t))
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// The fixed-priority algorithm.
#[derive(Debug)]
pub struct PriorityPolicy;

impl Policy for PriorityPolicy {
    type Ready = PriorityReady;

    const HELPS: bool = true;

    fn map_priority(priority: Priority) -> Priority {
        priority
    }

    fn unmap_priority(priority: Priority) -> Priority {
        priority
    }
}
