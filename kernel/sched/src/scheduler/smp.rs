//! Generic SMP scheduling algorithm.
//!
//! [`SmpScheduler`] implements [`SchedulerOps`] once for every algorithm;
//! the algorithms differ only in their [`Policy`]: the ready set, the
//! priority mapping, and whether helping nodes may use the instance.
//!
//! The instance keeps its nodes in three places. Scheduled nodes own a
//! processor and are kept in `scheduled`, most urgent first. Ready nodes
//! live in the policy's ready set. Blocked nodes are only in `nodes`.
//! Idle nodes are ordinary nodes without an owner, pinned by affinity to
//! their processor and mapped to the maximum priority, so every owned
//! processor always has a candidate.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;

use kestrel_core::cpumask::ProcessorMask;
use kestrel_core::id::{CpuId, SchedulerId, ThreadId};
use kestrel_core::{Result, Status};

use super::{NodeInit, NodeState, SchedulerOps};
use crate::percpu::Processors;
use crate::priority::Priority;
use crate::thread::{SchedState, SchedulingCell};

/// Where a node goes among nodes of equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// Behind nodes of equal priority.
    Append,
    /// In front of nodes of equal priority.
    Prepend,
}

impl Insert {
    /// Returns `true` if a node of `priority` inserted this way goes
    /// before a node of `other`.
    pub fn precedes(self, priority: Priority, other: Priority) -> bool {
        match self {
            Self::Append => priority < other,
            Self::Prepend => priority <= other,
        }
    }
}

/// Ordered set of ready nodes.
pub trait ReadySet: Default + Send {
    /// Inserts `thread` with `priority`.
    fn insert(&mut self, thread: ThreadId, priority: Priority, insert: Insert);

    /// Removes `thread`, which was inserted with `priority`.
    fn remove(&mut self, thread: ThreadId, priority: Priority);

    /// The first node in order for which `eligible` holds.
    fn highest<F: FnMut(ThreadId) -> bool>(&self, eligible: F) -> Option<ThreadId>;

    /// Number of ready nodes.
    fn len(&self) -> usize;

    /// Returns `true` if no node is ready.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Algorithm-specific part of an SMP scheduler.
pub trait Policy: Send + 'static {
    /// Ready set of the algorithm.
    type Ready: ReadySet;

    /// Helping nodes may be scheduled by this algorithm.
    const HELPS: bool;

    /// User to internal priority.
    fn map_priority(priority: Priority) -> Priority;

    /// Internal to user priority.
    fn unmap_priority(priority: Priority) -> Priority;
}

#[derive(Debug)]
struct SmpNode {
    owner: Option<SchedulingCell>,
    priority: Priority,
    state: NodeState,
    affinity: ProcessorMask,
    pinned: Option<CpuId>,
    cpu: Option<CpuId>,
    home: bool,
}

impl SmpNode {
    fn is_eligible(&self, cpu: CpuId) -> bool {
        match self.pinned {
            Some(pinned) => pinned == cpu,
            None => self.affinity.contains(cpu),
        }
    }
}

/// An SMP scheduler instance parameterized by its policy.
pub struct SmpScheduler<P: Policy> {
    id: SchedulerId,
    owned: ProcessorMask,
    nodes: BTreeMap<ThreadId, SmpNode>,
    scheduled: Vec<ThreadId>,
    ready: P::Ready,
    _policy: PhantomData<fn() -> P>,
}

impl<P: Policy> SmpScheduler<P> {
    /// Creates an instance that owns no processors yet.
    pub fn new(id: SchedulerId) -> Self {
        Self {
            id,
            owned: ProcessorMask::empty(),
            nodes: BTreeMap::new(),
            scheduled: Vec::new(),
            ready: P::Ready::default(),
            _policy: PhantomData,
        }
    }

    /// Processor the node of `thread` is scheduled on.
    pub fn node_cpu(&self, thread: ThreadId) -> Option<CpuId> {
        self.nodes.get(&thread).and_then(|n| n.cpu)
    }

    /// Scheduled nodes, most urgent first.
    pub fn scheduled(&self) -> &[ThreadId] {
        &self.scheduled
    }

    /// Number of ready nodes.
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    fn priority_of(&self, thread: ThreadId) -> Priority {
        self.nodes.get(&thread).map_or(Priority::default(), |n| n.priority)
    }

    fn set_state(&mut self, thread: ThreadId, state: NodeState) {
        if let Some(node) = self.nodes.get_mut(&thread) {
            node.state = state;
        }
    }

    fn insert_scheduled(&mut self, thread: ThreadId, insert: Insert) {
        let priority = self.priority_of(thread);
        let nodes = &self.nodes;
        let index = self
            .scheduled
            .iter()
            .position(|other| {
                nodes
                    .get(other)
                    .is_some_and(|o| insert.precedes(priority, o.priority))
            })
            .unwrap_or(self.scheduled.len());
        self.scheduled.insert(index, thread);
    }

    fn remove_scheduled(&mut self, thread: ThreadId) {
        self.scheduled.retain(|&s| s != thread);
    }

    /// The least urgent scheduled node whose processor `node` may use.
    fn lowest_scheduled(&self, node: &SmpNode) -> Option<ThreadId> {
        self.scheduled.iter().rev().copied().find(|s| {
            self.nodes
                .get(s)
                .and_then(|n| n.cpu)
                .is_some_and(|cpu| node.is_eligible(cpu))
        })
    }

    fn highest_ready(&self, cpu: CpuId) -> Option<ThreadId> {
        let nodes = &self.nodes;
        self.ready
            .highest(|t| nodes.get(&t).is_some_and(|n| n.is_eligible(cpu)))
    }

    /// A ready node may take a processor only if its thread runs nowhere.
    fn try_to_schedule(&self, thread: ThreadId) -> bool {
        match self.nodes.get(&thread) {
            None => false,
            Some(SmpNode { owner: None, .. }) => true,
            Some(SmpNode {
                owner: Some(owner), ..
            }) => owner.lock().state == SchedState::Ready,
        }
    }

    fn allocate(&mut self, cpus: &Processors, thread: ThreadId, cpu: CpuId) {
        let id = self.id;
        let Some(node) = self.nodes.get_mut(&thread) else {
            return;
        };
        node.state = NodeState::Scheduled;
        node.cpu = Some(cpu);
        if let Some(owner) = &node.owner {
            let mut cell = owner.lock();
            cell.state = SchedState::Scheduled;
            cell.scheduled_by = Some(id);
            cell.cpu = Some(cpu);
        }
        cpus.update_heir(cpu, thread);
    }

    /// Releases the node's thread from this instance at thread level. The
    /// thread becomes `next` if this instance was running it.
    fn release_owner(&self, cpus: &Processors, thread: ThreadId, next: SchedState) {
        let Some(owner) = self.nodes.get(&thread).and_then(|n| n.owner.as_ref()) else {
            return;
        };
        let needs_help = {
            let mut cell = owner.lock();
            if cell.scheduled_by != Some(self.id) {
                return;
            }
            cell.state = next;
            cell.scheduled_by = None;
            next == SchedState::Ready && cell.has_helping_nodes() && !cell.pinned
        };
        if needs_help {
            cpus.request_help(Arc::clone(owner));
        }
    }

    /// Moves a scheduled node to the ready set. Returns its processor.
    fn move_to_ready(&mut self, cpus: &Processors, thread: ThreadId, insert: Insert) -> Option<CpuId> {
        self.remove_scheduled(thread);
        let node = self.nodes.get_mut(&thread)?;
        let cpu = node.cpu.take();
        node.state = NodeState::Ready;
        let priority = node.priority;
        self.ready.insert(thread, priority, insert);
        self.release_owner(cpus, thread, SchedState::Ready);
        cpu
    }

    fn request_help_if_needed(&self, cpus: &Processors, thread: ThreadId) {
        let Some(owner) = self.nodes.get(&thread).and_then(|n| n.owner.as_ref()) else {
            return;
        };
        let needs_help = {
            let cell = owner.lock();
            cell.state == SchedState::Ready && cell.has_helping_nodes() && !cell.pinned
        };
        if needs_help {
            cpus.request_help(Arc::clone(owner));
        }
    }

    /// Makes a non-scheduled node ready, preempting the lowest scheduled
    /// node it precedes. Returns `true` if the node was left ready.
    fn enqueue(&mut self, cpus: &Processors, thread: ThreadId, insert: Insert) -> bool {
        let Some(node) = self.nodes.get(&thread) else {
            return false;
        };
        let priority = node.priority;
        if let Some(lowest) = self.lowest_scheduled(node) {
            if insert.precedes(priority, self.priority_of(lowest)) {
                if self.try_to_schedule(thread) {
                    if let Some(cpu) = self.move_to_ready(cpus, lowest, Insert::Prepend) {
                        self.insert_scheduled(thread, insert);
                        self.allocate(cpus, thread, cpu);
                    }
                } else {
                    self.set_state(thread, NodeState::Blocked);
                }
                return false;
            }
        }
        self.set_state(thread, NodeState::Ready);
        self.ready.insert(thread, priority, insert);
        true
    }

    /// Re-places a node that keeps its processor only if no ready node
    /// eligible for that processor precedes it. The node must be out of
    /// `scheduled`. Returns `true` if the node lost its processor.
    fn enqueue_scheduled(&mut self, cpus: &Processors, thread: ThreadId, insert: Insert) -> bool {
        let Some((priority, cpu)) = self
            .nodes
            .get(&thread)
            .and_then(|n| n.cpu.map(|cpu| (n.priority, cpu)))
        else {
            return false;
        };
        while let Some(highest) = self.highest_ready(cpu) {
            let highest_priority = self.priority_of(highest);
            if insert.precedes(priority, highest_priority) {
                break;
            }
            self.ready.remove(highest, highest_priority);
            if self.try_to_schedule(highest) {
                self.move_to_ready(cpus, thread, insert);
                self.insert_scheduled(highest, Insert::Append);
                self.allocate(cpus, highest, cpu);
                return true;
            }
            self.set_state(highest, NodeState::Blocked);
        }
        self.insert_scheduled(thread, insert);
        cpus.update_heir(cpu, thread);
        false
    }

    /// Gives a free processor to the most urgent eligible ready node.
    fn schedule_highest_ready(&mut self, cpus: &Processors, cpu: CpuId) {
        while let Some(highest) = self.highest_ready(cpu) {
            let priority = self.priority_of(highest);
            self.ready.remove(highest, priority);
            if self.try_to_schedule(highest) {
                self.insert_scheduled(highest, Insert::Append);
                self.allocate(cpus, highest, cpu);
                return;
            }
            self.set_state(highest, NodeState::Blocked);
        }
        debug_assert!(false, "no ready node for processor {cpu}");
    }

    /// Removes a node from the schedule and marks it blocked. Returns the
    /// processor it was scheduled on.
    fn extract(&mut self, thread: ThreadId) -> Option<CpuId> {
        let node = self.nodes.get_mut(&thread)?;
        let state = core::mem::replace(&mut node.state, NodeState::Blocked);
        let priority = node.priority;
        let cpu = node.cpu.take();
        match state {
            NodeState::Scheduled => {
                self.remove_scheduled(thread);
                cpu
            }
            NodeState::Ready => {
                self.ready.remove(thread, priority);
                None
            }
            NodeState::Blocked => None,
        }
    }
}

impl<P: Policy> SchedulerOps for SmpScheduler<P> {
    fn map_priority(&self, priority: Priority) -> Priority {
        P::map_priority(priority)
    }

    fn unmap_priority(&self, priority: Priority) -> Priority {
        P::unmap_priority(priority)
    }

    fn node_initialize(&mut self, init: NodeInit) {
        self.nodes.insert(
            init.thread,
            SmpNode {
                owner: init.owner,
                priority: init.priority,
                state: NodeState::Blocked,
                affinity: init.affinity,
                pinned: None,
                cpu: None,
                home: init.home,
            },
        );
    }

    fn node_destroy(&mut self, thread: ThreadId) {
        debug_assert_eq!(self.node_state(thread), Some(NodeState::Blocked));
        self.extract(thread);
        self.nodes.remove(&thread);
    }

    fn node_state(&self, thread: ThreadId) -> Option<NodeState> {
        self.nodes.get(&thread).map(|n| n.state)
    }

    fn node_priority(&self, thread: ThreadId) -> Option<Priority> {
        self.nodes.get(&thread).map(|n| n.priority)
    }

    fn block(&mut self, cpus: &Processors, thread: ThreadId) {
        if let Some(cpu) = self.extract(thread) {
            self.schedule_highest_ready(cpus, cpu);
        }
    }

    fn unblock(&mut self, cpus: &Processors, thread: ThreadId) -> bool {
        match self.node_state(thread) {
            Some(NodeState::Blocked) => self.enqueue(cpus, thread, Insert::Append),
            _ => false,
        }
    }

    fn yield_thread(&mut self, cpus: &Processors, thread: ThreadId) -> bool {
        match self.node_state(thread) {
            Some(NodeState::Scheduled) => {
                self.remove_scheduled(thread);
                self.enqueue_scheduled(cpus, thread, Insert::Append)
            }
            Some(NodeState::Ready) => {
                let priority = self.priority_of(thread);
                self.ready.remove(thread, priority);
                self.enqueue(cpus, thread, Insert::Append)
            }
            _ => false,
        }
    }

    fn update_priority(&mut self, cpus: &Processors, thread: ThreadId, priority: Priority) -> bool {
        let Some(node) = self.nodes.get_mut(&thread) else {
            return false;
        };
        let old = core::mem::replace(&mut node.priority, priority);
        let state = node.state;
        if old == priority {
            return false;
        }
        match state {
            NodeState::Scheduled => {
                self.remove_scheduled(thread);
                self.enqueue_scheduled(cpus, thread, Insert::Append)
            }
            NodeState::Ready => {
                self.ready.remove(thread, old);
                self.enqueue(cpus, thread, Insert::Append)
            }
            NodeState::Blocked => false,
        }
    }

    fn ask_for_help(&mut self, cpus: &Processors, thread: ThreadId) -> bool {
        if !P::HELPS {
            return false;
        }
        match self.node_state(thread) {
            Some(NodeState::Scheduled) => true,
            Some(NodeState::Blocked) if self.try_to_schedule(thread) => {
                self.enqueue(cpus, thread, Insert::Append);
                self.node_state(thread) == Some(NodeState::Scheduled)
            }
            _ => false,
        }
    }

    fn withdraw_node(&mut self, cpus: &Processors, thread: ThreadId, next: NodeState) {
        let next = match next {
            NodeState::Blocked => SchedState::Blocked,
            NodeState::Ready | NodeState::Scheduled => SchedState::Ready,
        };
        self.release_owner(cpus, thread, next);
        if let Some(cpu) = self.extract(thread) {
            self.schedule_highest_ready(cpus, cpu);
        }
    }

    fn pin(&mut self, thread: ThreadId, cpu: CpuId) {
        if let Some(node) = self.nodes.get_mut(&thread) {
            node.pinned = Some(cpu);
        }
    }

    fn unpin(&mut self, thread: ThreadId, _cpu: CpuId) {
        if let Some(node) = self.nodes.get_mut(&thread) {
            node.pinned = None;
        }
    }

    fn add_processor(&mut self, cpus: &Processors, cpu: CpuId, idle: NodeInit) {
        self.owned.set(cpu);
        let thread = idle.thread;
        self.nodes.insert(
            thread,
            SmpNode {
                owner: None,
                priority: idle.priority,
                state: NodeState::Scheduled,
                affinity: idle.affinity,
                pinned: None,
                cpu: Some(cpu),
                home: true,
            },
        );
        cpus.update_heir(cpu, thread);
        self.enqueue_scheduled(cpus, thread, Insert::Append);
    }

    fn remove_processor(&mut self, cpus: &Processors, cpu: CpuId) -> Result<ThreadId> {
        if !self.owned.contains(cpu) {
            return Err(Status::InvalidNumber);
        }
        let idle = cpus.idle(cpu).ok_or(Status::InvalidId)?;
        let mut remaining = self.owned;
        remaining.clear(cpu);
        let stranded = self
            .nodes
            .values()
            .any(|n| n.home && n.owner.is_some() && !n.affinity.intersects(remaining));
        let victim = self
            .scheduled
            .iter()
            .copied()
            .find(|s| self.nodes.get(s).and_then(|n| n.cpu) == Some(cpu));
        let pinned = victim
            .and_then(|v| self.nodes.get(&v))
            .is_some_and(|n| n.pinned.is_some());
        if stranded || pinned {
            return Err(Status::ResourceInUse);
        }

        self.owned = remaining;
        self.extract(idle);
        self.nodes.remove(&idle);

        if let Some(victim) = victim.filter(|&v| v != idle) {
            self.release_owner(cpus, victim, SchedState::Ready);
            self.extract(victim);
            if self.enqueue(cpus, victim, Insert::Prepend) {
                self.request_help_if_needed(cpus, victim);
            }
        }
        cpus.update_heir(cpu, idle);
        Ok(idle)
    }

    fn set_affinity(
        &mut self,
        cpus: &Processors,
        thread: ThreadId,
        affinity: ProcessorMask,
    ) -> Result<()> {
        let node = self.nodes.get_mut(&thread).ok_or(Status::InvalidId)?;
        node.affinity = affinity;
        let state = node.state;
        let keeps_processor = node.cpu.is_some_and(|cpu| node.is_eligible(cpu));

        match state {
            NodeState::Blocked => {}
            NodeState::Scheduled if keeps_processor => {}
            NodeState::Scheduled => {
                self.release_owner(cpus, thread, SchedState::Ready);
                if let Some(cpu) = self.extract(thread) {
                    self.schedule_highest_ready(cpus, cpu);
                }
                if self.enqueue(cpus, thread, Insert::Append) {
                    self.request_help_if_needed(cpus, thread);
                }
            }
            NodeState::Ready => {
                self.extract(thread);
                self.enqueue(cpus, thread, Insert::Append);
            }
        }
        Ok(())
    }

    fn processors(&self) -> ProcessorMask {
        self.owned
    }

    fn has_home_threads(&self) -> bool {
        self.nodes.values().any(|n| n.home && n.owner.is_some())
    }
}

#[cfg(all(test, not(loom), not(shuttle)))]
mod tests {
    use super::*;

    use kestrel_core::sync::SpinLock;

    use crate::scheduler::priority::PriorityPolicy;
    use crate::thread::Scheduling;

    const S: SchedulerId = SchedulerId::new(0);
    const IDLE_PRIORITY: Priority = Priority::new(255);

    fn cpu(n: u32) -> CpuId {
        CpuId::new(n)
    }

    fn tid(n: u32) -> ThreadId {
        ThreadId::new(n)
    }

    struct Fixture {
        cpus: Processors,
        sched: SmpScheduler<PriorityPolicy>,
        cells: BTreeMap<ThreadId, SchedulingCell>,
    }

    /// `n` processors with idle threads 100, 101, ... all owned by `S`.
    fn fixture(n: u32) -> Fixture {
        let idle: Vec<ThreadId> = (0..n).map(|i| tid(100 + i)).collect();
        let cpus = Processors::new(ProcessorMask::all(n as usize), &idle);
        let mut sched = SmpScheduler::<PriorityPolicy>::new(S);
        for i in 0..n {
            sched.add_processor(
                &cpus,
                cpu(i),
                NodeInit {
                    thread: idle[i as usize],
                    owner: None,
                    priority: IDLE_PRIORITY,
                    affinity: ProcessorMask::single(cpu(i)),
                    home: true,
                },
            );
        }
        Fixture {
            cpus,
            sched,
            cells: BTreeMap::new(),
        }
    }

    impl Fixture {
        fn add(&mut self, n: u32, priority: u64, nodes: Vec<SchedulerId>) {
            let cell = Arc::new(SpinLock::new(Scheduling {
                thread: tid(n),
                state: SchedState::Blocked,
                cpu: None,
                scheduled_by: None,
                nodes,
                pinned: false,
            }));
            self.sched.node_initialize(NodeInit {
                thread: tid(n),
                owner: Some(Arc::clone(&cell)),
                priority: Priority::new(priority),
                affinity: ProcessorMask::all(self.cpus.count()),
                home: true,
            });
            self.cells.insert(tid(n), cell);
        }

        fn unblock(&mut self, n: u32) -> bool {
            self.cells[&tid(n)].lock().state = SchedState::Ready;
            self.sched.unblock(&self.cpus, tid(n))
        }

        fn block(&mut self, n: u32) {
            self.sched.block(&self.cpus, tid(n));
            let mut cell = self.cells[&tid(n)].lock();
            cell.state = SchedState::Blocked;
            cell.scheduled_by = None;
        }

        fn heir(&self, n: u32) -> ThreadId {
            self.cpus.heir(cpu(n)).unwrap_or(tid(0))
        }

        fn state(&self, n: u32) -> Option<NodeState> {
            self.sched.node_state(tid(n))
        }
    }

    // -----------------------------------------------------------------------
    // Insert order
    // -----------------------------------------------------------------------

    #[test]
    fn append_and_prepend_order() {
        let p = Priority::new(5);
        assert!(!Insert::Append.precedes(p, p));
        assert!(Insert::Prepend.precedes(p, p));
        assert!(Insert::Append.precedes(Priority::new(4), p));
        assert!(!Insert::Prepend.precedes(Priority::new(6), p));
    }

    // -----------------------------------------------------------------------
    // Processors and idle nodes
    // -----------------------------------------------------------------------

    #[test]
    fn idle_nodes_hold_processors() {
        let f = fixture(2);
        assert_eq!(f.sched.processors(), ProcessorMask::all(2));
        assert_eq!(f.heir(0), tid(100));
        assert_eq!(f.heir(1), tid(101));
        assert!(!f.sched.has_home_threads());
    }

    #[test]
    fn unblock_takes_idle_processor() {
        let mut f = fixture(2);
        f.add(1, 5, vec![S]);
        assert!(!f.unblock(1));
        assert_eq!(f.state(1), Some(NodeState::Scheduled));
        // The least urgent scheduled node is the idle of the last processor.
        assert_eq!(f.heir(1), tid(1));
        assert_eq!(f.cells[&tid(1)].lock().scheduled_by, Some(S));
    }

    #[test]
    fn less_urgent_thread_stays_ready() {
        let mut f = fixture(1);
        f.add(1, 5, vec![S]);
        f.add(2, 7, vec![S]);
        f.unblock(1);
        assert!(f.unblock(2));
        assert_eq!(f.state(2), Some(NodeState::Ready));
        assert_eq!(f.heir(0), tid(1));
    }

    #[test]
    fn more_urgent_thread_preempts() {
        let mut f = fixture(1);
        f.add(1, 5, vec![S]);
        f.add(2, 3, vec![S]);
        f.unblock(1);
        f.unblock(2);
        assert_eq!(f.heir(0), tid(2));
        assert_eq!(f.state(1), Some(NodeState::Ready));
        assert_eq!(f.cells[&tid(1)].lock().state, SchedState::Ready);
    }

    // -----------------------------------------------------------------------
    // Block / unblock round trip
    // -----------------------------------------------------------------------

    #[test]
    fn block_then_unblock_restores_schedule() {
        let mut f = fixture(2);
        f.add(1, 2, vec![S]);
        f.add(2, 1, vec![S]);
        f.add(3, 3, vec![S]);
        f.unblock(1);
        f.unblock(2);
        f.unblock(3);
        let before = (f.heir(0), f.heir(1), f.state(1), f.state(3));

        f.block(1);
        assert_eq!(f.state(1), Some(NodeState::Blocked));
        assert_eq!(f.state(3), Some(NodeState::Scheduled));

        f.unblock(1);
        assert_eq!((f.heir(0), f.heir(1), f.state(1), f.state(3)), before);
    }

    #[test]
    fn block_of_ready_node_keeps_heirs() {
        let mut f = fixture(1);
        f.add(1, 2, vec![S]);
        f.add(2, 4, vec![S]);
        f.unblock(1);
        f.unblock(2);
        f.block(2);
        assert_eq!(f.state(2), Some(NodeState::Blocked));
        assert_eq!(f.heir(0), tid(1));
        assert_eq!(f.sched.ready_count(), 1); // idle
    }

    // -----------------------------------------------------------------------
    // Yield
    // -----------------------------------------------------------------------

    #[test]
    fn yield_to_equal_priority() {
        let mut f = fixture(1);
        f.add(1, 4, vec![S]);
        f.add(2, 4, vec![S]);
        f.unblock(1);
        f.unblock(2);
        assert_eq!(f.heir(0), tid(1));

        assert!(f.sched.yield_thread(&f.cpus, tid(1)));
        assert_eq!(f.heir(0), tid(2));
        assert_eq!(f.state(1), Some(NodeState::Ready));
    }

    #[test]
    fn yield_keeps_processor_against_lower_priority() {
        let mut f = fixture(1);
        f.add(1, 4, vec![S]);
        f.add(2, 6, vec![S]);
        f.unblock(1);
        f.unblock(2);
        assert!(!f.sched.yield_thread(&f.cpus, tid(1)));
        assert_eq!(f.heir(0), tid(1));
        assert_eq!(f.state(1), Some(NodeState::Scheduled));
    }

    // -----------------------------------------------------------------------
    // Priority updates
    // -----------------------------------------------------------------------

    #[test]
    fn lowered_priority_gives_up_processor() {
        let mut f = fixture(1);
        f.add(1, 2, vec![S]);
        f.add(2, 4, vec![S]);
        f.unblock(1);
        f.unblock(2);
        f.sched.update_priority(&f.cpus, tid(1), Priority::new(9));
        assert_eq!(f.heir(0), tid(2));
        assert_eq!(f.sched.node_priority(tid(1)), Some(Priority::new(9)));
    }

    #[test]
    fn raised_priority_preempts() {
        let mut f = fixture(1);
        f.add(1, 2, vec![S]);
        f.add(2, 4, vec![S]);
        f.unblock(1);
        f.unblock(2);
        f.sched.update_priority(&f.cpus, tid(2), Priority::new(1));
        assert_eq!(f.heir(0), tid(2));
        assert_eq!(f.state(1), Some(NodeState::Ready));
    }

    #[test]
    fn blocked_priority_update_is_recorded() {
        let mut f = fixture(1);
        f.add(1, 2, vec![S]);
        assert!(!f.sched.update_priority(&f.cpus, tid(1), Priority::new(8)));
        assert_eq!(f.sched.node_priority(tid(1)), Some(Priority::new(8)));
        assert_eq!(f.heir(0), tid(100));
    }

    // -----------------------------------------------------------------------
    // Affinity, pinning, help
    // -----------------------------------------------------------------------

    #[test]
    fn affinity_moves_scheduled_node() {
        let mut f = fixture(2);
        f.add(1, 2, vec![S]);
        f.unblock(1);
        assert_eq!(f.heir(1), tid(1));

        f.sched
            .set_affinity(&f.cpus, tid(1), ProcessorMask::single(cpu(0)))
            .unwrap();
        assert_eq!(f.heir(0), tid(1));
        assert_eq!(f.heir(1), tid(101));
    }

    #[test]
    fn pinned_node_only_eligible_for_its_processor() {
        let mut f = fixture(2);
        f.add(1, 2, vec![S]);
        f.add(2, 1, vec![S]);
        f.add(3, 1, vec![S]);
        f.unblock(1);
        let pinned_cpu = f.sched.node_cpu(tid(1)).unwrap();
        f.sched.pin(tid(1), pinned_cpu);

        f.unblock(2);
        f.unblock(3);
        // Thread 1 lost its processor and may only come back on it.
        assert_eq!(f.state(1), Some(NodeState::Ready));
        f.block(2);
        f.block(3);
        assert_eq!(f.sched.node_cpu(tid(1)), Some(pinned_cpu));
        f.sched.unpin(tid(1), pinned_cpu);
    }

    #[test]
    fn preempted_thread_with_helping_nodes_requests_help() {
        let mut f = fixture(1);
        f.add(1, 5, vec![S, SchedulerId::new(1)]);
        f.add(2, 1, vec![S]);
        f.unblock(1);
        f.unblock(2);
        let request = f.cpus.next_help_request().map(|c| c.lock().thread);
        assert_eq!(request, Some(tid(1)));
        assert!(f.cpus.next_help_request().is_none());
    }

    #[test]
    fn helping_node_blocked_while_thread_runs_elsewhere() {
        let mut f = fixture(1);
        f.add(1, 5, vec![SchedulerId::new(1), S]);
        {
            let mut cell = f.cells[&tid(1)].lock();
            cell.state = SchedState::Scheduled;
            cell.scheduled_by = Some(SchedulerId::new(1));
        }
        assert!(!f.sched.ask_for_help(&f.cpus, tid(1)));
        assert_eq!(f.state(1), Some(NodeState::Blocked));
    }

    #[test]
    fn ask_for_help_schedules_ready_thread() {
        let mut f = fixture(1);
        f.add(1, 5, vec![SchedulerId::new(1), S]);
        f.cells[&tid(1)].lock().state = SchedState::Ready;
        assert!(f.sched.ask_for_help(&f.cpus, tid(1)));
        assert_eq!(f.heir(0), tid(1));
    }

    #[test]
    fn withdraw_releases_processor() {
        let mut f = fixture(1);
        f.add(1, 5, vec![S]);
        f.unblock(1);
        f.sched.withdraw_node(&f.cpus, tid(1), NodeState::Ready);
        assert_eq!(f.state(1), Some(NodeState::Blocked));
        assert_eq!(f.cells[&tid(1)].lock().state, SchedState::Ready);
        assert_eq!(f.heir(0), tid(100));
    }

    // -----------------------------------------------------------------------
    // Processor removal
    // -----------------------------------------------------------------------

    #[test]
    fn remove_unowned_processor() {
        let mut f = fixture(1);
        assert_eq!(
            f.sched.remove_processor(&f.cpus, cpu(3)),
            Err(Status::InvalidNumber)
        );
    }

    #[test]
    fn remove_last_processor_with_home_threads() {
        let mut f = fixture(1);
        f.add(1, 5, vec![S]);
        assert_eq!(
            f.sched.remove_processor(&f.cpus, cpu(0)),
            Err(Status::ResourceInUse)
        );
        assert_eq!(f.sched.processors(), ProcessorMask::all(1));
    }

    #[test]
    fn remove_processor_migrates_victim() {
        let mut f = fixture(2);
        f.add(1, 5, vec![S]);
        f.unblock(1);
        assert_eq!(f.heir(1), tid(1));

        assert_eq!(f.sched.remove_processor(&f.cpus, cpu(1)), Ok(tid(101)));
        assert_eq!(f.heir(0), tid(1));
        assert_eq!(f.heir(1), tid(101));
        assert_eq!(f.sched.processors(), ProcessorMask::single(cpu(0)));
        assert_eq!(f.sched.node_state(tid(101)), None);
    }

    #[test]
    fn remove_processor_refuses_pinned_victim() {
        let mut f = fixture(2);
        f.add(1, 5, vec![S]);
        f.unblock(1);
        f.sched.pin(tid(1), cpu(1));

        assert_eq!(f.sched.remove_processor(&f.cpus, cpu(1)), Err(Status::ResourceInUse));
        assert_eq!(f.sched.processors(), ProcessorMask::all(2));
        assert_eq!(f.heir(1), tid(1));

        f.sched.unpin(tid(1), cpu(1));
        assert_eq!(f.sched.remove_processor(&f.cpus, cpu(1)), Ok(tid(101)));
        assert_eq!(f.heir(0), tid(1));
    }
}
