//! Priority values and priority aggregation.
//!
//! A thread does not have one priority; it has a set of contributions per
//! scheduler node: its real priority, plus whatever ceiling mutexes it owns
//! and inheritance queues it owns add on top. The effective priority of a
//! node is the most urgent contribution. Lower values are more urgent.

use alloc::vec::Vec;
use core::fmt;

use kestrel_core::id::{QueueId, SchedulerId};

/// A priority value. Lower is more urgent.
///
/// Whether a value is a user-visible priority or a scheduler-internal
/// (mapped) one depends on context; see `SchedulerOps::map_priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Priority(u64);

impl Priority {
    /// The most urgent priority.
    pub const HIGHEST: Self = Self(0);

    /// Creates a new `Priority`.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns `true` if `self` is strictly more urgent than `other`.
    pub const fn is_more_urgent_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a priority contribution comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrioritySource {
    /// The thread's own (real) priority.
    Real,
    /// The ceiling of an owned ceiling mutex.
    Ceiling(QueueId),
    /// The most urgent waiter of an owned priority-inheritance queue.
    Inherited(QueueId),
    /// The absolute deadline of the current EDF job.
    Deadline,
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// A set of `(source, value)` contributions with at most one entry per
/// source. The effective priority is the minimum value.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    contributions: Vec<(PrioritySource, Priority)>,
}

impl Aggregation {
    /// Creates an empty aggregation.
    pub const fn new() -> Self {
        Self {
            contributions: Vec::new(),
        }
    }

    /// Creates an aggregation holding only a real priority.
    pub fn with_real(priority: Priority) -> Self {
        let mut agg = Self::new();
        agg.insert(PrioritySource::Real, priority);
        agg
    }

    /// Adds or replaces the contribution of `source`.
    ///
    /// Returns the previous value of that source, if any.
    pub fn insert(&mut self, source: PrioritySource, value: Priority) -> Option<Priority> {
        match self.contributions.iter_mut().find(|(s, _)| *s == source) {
            Some((_, v)) => Some(core::mem::replace(v, value)),
            None => {
                self.contributions.push((source, value));
                None
            }
        }
    }

    /// Removes the contribution of `source`.
    pub fn remove(&mut self, source: PrioritySource) -> Option<Priority> {
        let index = self.contributions.iter().position(|(s, _)| *s == source)?;
        Some(self.contributions.swap_remove(index).1)
    }

    /// Returns the value contributed by `source`.
    pub fn get(&self, source: PrioritySource) -> Option<Priority> {
        self.contributions
            .iter()
            .find(|(s, _)| *s == source)
            .map(|(_, v)| *v)
    }

    /// The most urgent contribution, or `None` if empty.
    pub fn effective(&self) -> Option<Priority> {
        self.contributions.iter().map(|(_, v)| *v).min()
    }

    /// Number of contributions.
    pub fn len(&self) -> usize {
        self.contributions.len()
    }

    /// Returns `true` if nothing contributes.
    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }

    /// Iterates the contributions in insertion order (modulo removals).
    pub fn iter(&self) -> impl Iterator<Item = (PrioritySource, Priority)> + '_ {
        self.contributions.iter().copied()
    }
}

// ---------------------------------------------------------------------------
// Per-node aggregations of one thread
// ---------------------------------------------------------------------------

/// Aggregation of one scheduler node of a thread.
#[derive(Debug, Clone)]
pub struct NodePriority {
    /// Scheduler instance of the node.
    pub scheduler: SchedulerId,
    /// Contributions in that scheduler's (mapped) priority space.
    pub aggregation: Aggregation,
}

/// The priority aggregations of all scheduler nodes of a thread.
///
/// The first entry is always the home node and always holds the real
/// priority. Further entries are helping nodes created when a waiter with
/// a different home scheduler lends its priority through inheritance.
#[derive(Debug, Clone)]
pub struct NodePriorities {
    nodes: Vec<NodePriority>,
}

impl NodePriorities {
    /// Creates the aggregation set of a thread with the given home node.
    pub fn new(home: SchedulerId, real: Priority) -> Self {
        let mut nodes = Vec::with_capacity(1);
        nodes.push(NodePriority {
            scheduler: home,
            aggregation: Aggregation::with_real(real),
        });
        Self { nodes }
    }

    /// Home scheduler.
    pub fn home(&self) -> SchedulerId {
        self.nodes[0].scheduler
    }

    /// Effective priority of the home node.
    pub fn home_priority(&self) -> Priority {
        self.nodes[0].aggregation.effective().unwrap_or_default()
    }

    /// Real priority (always present on the home node).
    pub fn real(&self) -> Priority {
        self.nodes[0]
            .aggregation
            .get(PrioritySource::Real)
            .unwrap_or_default()
    }

    /// Replaces the real priority. Returns the old value.
    pub fn set_real(&mut self, priority: Priority) -> Priority {
        self.nodes[0]
            .aggregation
            .insert(PrioritySource::Real, priority)
            .unwrap_or_default()
    }

    /// Aggregation of the node in `scheduler`, if the thread has one.
    pub fn get(&self, scheduler: SchedulerId) -> Option<&Aggregation> {
        self.nodes
            .iter()
            .find(|n| n.scheduler == scheduler)
            .map(|n| &n.aggregation)
    }

    /// Effective priority of the node in `scheduler`.
    pub fn effective(&self, scheduler: SchedulerId) -> Option<Priority> {
        self.get(scheduler).and_then(Aggregation::effective)
    }

    /// Adds or changes a contribution, creating a helping node if needed.
    ///
    /// Returns `true` if the effective priority of that node changed.
    pub fn insert(&mut self, scheduler: SchedulerId, source: PrioritySource, value: Priority) -> bool {
        let node = match self.nodes.iter_mut().position(|n| n.scheduler == scheduler) {
            Some(index) => &mut self.nodes[index],
            None => {
                self.nodes.push(NodePriority {
                    scheduler,
                    aggregation: Aggregation::new(),
                });
                let last = self.nodes.len() - 1;
                &mut self.nodes[last]
            }
        };
        let before = node.aggregation.effective();
        node.aggregation.insert(source, value);
        node.aggregation.effective() != before
    }

    /// Removes a contribution. Returns `true` if the effective priority of
    /// that node changed (including the node becoming empty).
    pub fn remove(&mut self, scheduler: SchedulerId, source: PrioritySource) -> bool {
        let Some(node) = self.nodes.iter_mut().find(|n| n.scheduler == scheduler) else {
            return false;
        };
        let before = node.aggregation.effective();
        if node.aggregation.remove(source).is_none() {
            return false;
        }
        node.aggregation.effective() != before
    }

    /// Removes `source` from every node. Returns `true` if any effective
    /// priority changed.
    pub fn remove_everywhere(&mut self, source: PrioritySource) -> bool {
        let schedulers: Vec<SchedulerId> = self.nodes.iter().map(|n| n.scheduler).collect();
        let mut changed = false;
        for scheduler in schedulers {
            changed |= self.remove(scheduler, source);
        }
        changed
    }

    /// Returns `true` if the thread carries contributions beyond its real
    /// priority on the home node.
    pub fn has_extra_contributions(&self) -> bool {
        self.nodes.len() > 1 || self.nodes[0].aggregation.len() > 1
    }

    /// Snapshot of `(scheduler, effective)` for every node, then drops
    /// helping nodes that no longer have contributions. Dropped nodes are
    /// reported with `None`.
    pub fn snapshot_and_prune(&mut self) -> Vec<(SchedulerId, Option<Priority>)> {
        let snapshot = self
            .nodes
            .iter()
            .map(|n| (n.scheduler, n.aggregation.effective()))
            .collect();
        let home = self.home();
        self.nodes
            .retain(|n| n.scheduler == home || !n.aggregation.is_empty());
        snapshot
    }

    /// Iterates the nodes, home first.
    pub fn iter(&self) -> impl Iterator<Item = &NodePriority> {
        self.nodes.iter()
    }
}
