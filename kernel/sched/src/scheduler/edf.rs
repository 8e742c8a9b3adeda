//! Earliest-deadline-first SMP scheduling.
//!
//! A thread with a released job is prioritized by the absolute deadline of
//! the job. Threads without a job run in the background: their user
//! priorities are mapped above every representable deadline.

use alloc::collections::BTreeMap;

use kestrel_core::id::ThreadId;

use super::smp::{Insert, Policy, ReadySet};
use crate::priority::Priority;

/// Bit that separates background priorities from deadlines.
pub const BACKGROUND: u64 = 1 << 63;

/// Returns `true` if `deadline` can be used as a job deadline.
pub const fn is_valid_deadline(deadline: u64) -> bool {
    deadline & BACKGROUND == 0
}

/// Ready nodes ordered by `(priority, arrival)`.
///
/// Appended nodes count arrivals upward, prepended ones downward, so
/// both stay ordered among equal priorities.
#[derive(Debug, Default)]
pub struct EdfReady {
    order: BTreeMap<(Priority, i64), ThreadId>,
    index: BTreeMap<ThreadId, (Priority, i64)>,
    next_append: i64,
    next_prepend: i64,
}

impl ReadySet for EdfReady {
    fn insert(&mut self, thread: ThreadId, priority: Priority, insert: Insert) {
        let seq = match insert {
            Insert::Append => {
                self.next_append += 1;
                self.next_append
            }
            Insert::Prepend => {
                self.next_prepend -= 1;
                self.next_prepend
            }
        };
        self.order.insert((priority, seq), thread);
        self.index.insert(thread, (priority, seq));
    }

    fn remove(&mut self, thread: ThreadId, _priority: Priority) {
        if let Some(key) = self.index.remove(&thread) {
            self.order.remove(&key);
        }
    }

    fn highest<F: FnMut(ThreadId) -> bool>(&self, mut eligible: F) -> Option<ThreadId> {
        self.order.values().copied().find(|&t| eligible(t))
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// The EDF algorithm.
#[derive(Debug)]
pub struct EdfPolicy;

impl Policy for EdfPolicy {
    type Ready = EdfReady;

    const HELPS: bool = true;

    fn map_priority(priority: Priority) -> Priority {
        Priority::new(priority.value() | BACKGROUND)
    }

    fn unmap_priority(priority: Priority) -> Priority {
        Priority::new(priority.value() & !BACKGROUND)
    }
}
