//! The scheduling system.
//!
//! [`System`] ties the immutable scheduler table to the processors and
//! the threads. It is the only place that knows about more than one
//! scheduler instance: thread state changes fan out to every scheduler
//! node of a thread, and help requests queued by one instance are served
//! by the others.
//!
//! Help requests are processed after the state lock of the thread that
//! caused them is released, so an operation never holds two scheduler
//! instance locks at a time.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use kestrel_core::cpumask::{MAX_PROCESSORS, ProcessorMask};
use kestrel_core::id::{CpuId, SchedulerId, ThreadId};
use kestrel_core::sync::SpinLockGuard;
use kestrel_core::{Result, Status, kdebug, kinfo};

use crate::config::{Algorithm, SystemConfig};
use crate::percpu::Processors;
use crate::priority::{NodePriorities, Priority, PrioritySource};
use crate::scheduler::{NodeInit, NodeState, Scheduler, edf};
use crate::thread::{RunState, SchedState, Thread, ThreadStates};
use crate::threadq::{self, QueueContext};

/// Identifier of the idle thread of processor 0.
const IDLE_THREAD_BASE: u32 = 0x0901_0001;

/// Identifier of the first user thread.
const FIRST_THREAD_ID: u32 = 0x0a01_0001;

fn cpu_from_index(index: usize) -> Result<CpuId> {
    u32::try_from(index)
        .map(CpuId::new)
        .map_err(|_| Status::InvalidNumber)
}

/// Scheduler table, processors and thread identifiers of one system.
pub struct System {
    schedulers: Box<[Scheduler]>,
    processors: Processors,
    next_thread: AtomicU32,
}

impl System {
    /// Builds the system described by `config`.
    ///
    /// Every online processor with an assignment is handed to its scheduler
    /// and starts out executing its idle thread.
    pub fn new(config: &SystemConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let idle = (0..config.processor_count())
            .map(|index| {
                let offset = u32::try_from(index).map_err(|_| Status::InvalidNumber)?;
                Ok(ThreadId::new(IDLE_THREAD_BASE + offset))
            })
            .collect::<Result<Vec<_>>>()?;
        let schedulers = config
            .schedulers()
            .iter()
            .enumerate()
            .map(|(index, scheduler)| {
                let id = u32::try_from(index).map_err(|_| Status::InvalidId)?;
                Ok(Scheduler::new(SchedulerId::new(id), scheduler))
            })
            .collect::<Result<Box<[_]>>>()?;

        let system = Self {
            schedulers,
            processors: Processors::new(config.online_processors(), &idle),
            next_thread: AtomicU32::new(FIRST_THREAD_ID),
        };

        let online = config.online_processors();
        for (index, assignment) in config.assignments().iter().enumerate() {
            let Some(assignment) = assignment else {
                continue;
            };
            let cpu = cpu_from_index(index)?;
            if !online.contains(cpu) {
                continue;
            }
            let scheduler = system
                .schedulers
                .get(assignment.scheduler)
                .ok_or(Status::InvalidId)?;
            system.processors.claim(cpu, scheduler.id())?;
            system.attach_processor(scheduler, cpu);
            system.processors.dispatch(cpu);
            kinfo!(
                "sched: processor {} assigned to {} ({:?})",
                cpu,
                scheduler.name(),
                scheduler.algorithm()
            );
        }
        kinfo!(
            "sched: {} scheduler(s), {} processor(s), online {:#x}",
            system.schedulers.len(),
            system.processors.count(),
            online.bits()
        );
        Ok(Arc::new(system))
    }

    fn attach_processor(&self, scheduler: &Scheduler, cpu: CpuId) {
        let Some(idle) = self.processors.idle(cpu) else {
            return;
        };
        let init = NodeInit {
            thread: idle,
            owner: None,
            priority: scheduler.map_priority(scheduler.maximum_priority()),
            affinity: ProcessorMask::single(cpu),
            home: true,
        };
        scheduler.lock().add_processor(&self.processors, cpu, init);
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Scheduler instance `id`.
    pub fn scheduler(&self, id: SchedulerId) -> Result<&Scheduler> {
        self.schedulers.get(id.as_usize()).ok_or(Status::InvalidId)
    }

    /// The scheduler table.
    pub fn schedulers(&self) -> &[Scheduler] {
        &self.schedulers
    }

    /// Per-processor state.
    pub fn processors(&self) -> &Processors {
        &self.processors
    }

    /// Looks up a scheduler instance by name.
    pub fn ident(&self, name: &str) -> Result<SchedulerId> {
        self.schedulers
            .iter()
            .find(|s| s.name() == name)
            .map(Scheduler::id)
            .ok_or(Status::InvalidId)
    }

    /// Processors owned by scheduler `id`.
    pub fn scheduler_processors(&self, id: SchedulerId) -> Result<ProcessorMask> {
        Ok(self.scheduler(id)?.processors())
    }

    /// Number of processors owned by scheduler `id`.
    pub fn processor_count(&self, id: SchedulerId) -> Result<u32> {
        Ok(self.scheduler(id)?.processors().count())
    }

    /// Owner of processor `cpu`.
    pub fn scheduler_of_processor(&self, cpu: CpuId) -> Result<SchedulerId> {
        if !self.processors.is_configured(cpu) {
            return Err(Status::InvalidNumber);
        }
        self.processors
            .scheduler(cpu)
            .ok_or(Status::IncorrectState)
    }

    /// Processor `thread` runs on, or last ran on.
    pub fn get_processor(&self, thread: &Thread) -> Option<CpuId> {
        thread.cpu()
    }

    /// Maps a user priority of scheduler `id` to its internal form.
    pub fn map_priority(&self, id: SchedulerId, priority: Priority) -> Result<Priority> {
        let scheduler = self.scheduler(id)?;
        if !scheduler.is_valid_priority(priority) {
            return Err(Status::InvalidPriority);
        }
        Ok(scheduler.map_priority(priority))
    }

    /// Maps an internal priority of scheduler `id` back to user form.
    /// Unknown schedulers leave the value alone.
    pub fn unmap_priority(&self, id: SchedulerId, priority: Priority) -> Priority {
        self.scheduler(id)
            .map_or(priority, |s| s.unmap_priority(priority))
    }

    /// Heir of `cpu`.
    pub fn heir(&self, cpu: CpuId) -> Option<ThreadId> {
        self.processors.heir(cpu)
    }

    /// Thread executing on `cpu`.
    pub fn executing(&self, cpu: CpuId) -> Option<ThreadId> {
        self.processors.executing(cpu)
    }

    /// Performs a thread dispatch on `cpu`.
    pub fn dispatch(&self, cpu: CpuId) -> Option<ThreadId> {
        self.processors.dispatch(cpu)
    }

    // -----------------------------------------------------------------------
    // Thread life cycle
    // -----------------------------------------------------------------------

    /// Creates a dormant thread homed at `scheduler`.
    pub fn create_thread(
        self: &Arc<Self>,
        name: &'static str,
        scheduler: SchedulerId,
        priority: Priority,
    ) -> Result<Arc<Thread>> {
        let mapped = self.map_priority(scheduler, priority)?;
        let home = self.scheduler(scheduler)?;
        let affinity = self.processors.online_mask();
        let id = ThreadId::new(self.next_thread.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(Thread::new(
            Arc::clone(self),
            id,
            name,
            scheduler,
            mapped,
            affinity,
        ));
        home.lock().node_initialize(NodeInit {
            thread: id,
            owner: Some(Arc::clone(&thread.scheduling)),
            priority: mapped,
            affinity,
            home: true,
        });
        Ok(thread)
    }

    /// Creates and starts a thread.
    pub fn spawn(
        self: &Arc<Self>,
        name: &'static str,
        scheduler: SchedulerId,
        priority: Priority,
    ) -> Result<Arc<Thread>> {
        let thread = self.create_thread(name, scheduler, priority)?;
        self.start(&thread)?;
        Ok(thread)
    }

    /// Makes a dormant thread ready.
    pub fn start(&self, thread: &Thread) -> Result<()> {
        let mut run = thread.run.lock();
        if run.deleted {
            return Err(Status::InvalidId);
        }
        if !run.states.contains(ThreadStates::DORMANT) {
            return Err(Status::IncorrectState);
        }
        let was_ready = run.states.is_ready();
        run.states.remove(ThreadStates::DORMANT);
        self.commit_states(thread, run, was_ready);
        Ok(())
    }

    /// Suspends `thread`.
    pub fn suspend(&self, thread: &Thread) -> Result<()> {
        let mut run = thread.run.lock();
        if run.deleted {
            return Err(Status::InvalidId);
        }
        if run.states.contains(ThreadStates::SUSPENDED) {
            return Err(Status::IncorrectState);
        }
        let was_ready = run.states.is_ready();
        run.states.insert(ThreadStates::SUSPENDED);
        self.commit_states(thread, run, was_ready);
        Ok(())
    }

    /// Resumes a suspended thread.
    pub fn resume(&self, thread: &Thread) -> Result<()> {
        let mut run = thread.run.lock();
        if run.deleted {
            return Err(Status::InvalidId);
        }
        if !run.states.contains(ThreadStates::SUSPENDED) {
            return Err(Status::IncorrectState);
        }
        let was_ready = run.states.is_ready();
        run.states.remove(ThreadStates::SUSPENDED);
        self.commit_states(thread, run, was_ready);
        Ok(())
    }

    /// Deletes `thread`. Its scheduler nodes are destroyed; the thread
    /// stays dormant for good.
    pub fn delete(&self, thread: &Thread) -> Result<()> {
        if thread.resource_count() > 0 || thread.is_waiting() {
            return Err(Status::ResourceInUse);
        }
        let mut run = thread.run.lock();
        if run.deleted {
            return Err(Status::InvalidId);
        }
        if run.pin_level > 0 {
            return Err(Status::ResourceInUse);
        }
        let was_ready = run.states.is_ready();
        run.states.insert(ThreadStates::DORMANT);
        run.deleted = true;
        self.commit_states(thread, run, was_ready);

        let nodes = core::mem::take(&mut thread.scheduling.lock().nodes);
        for id in nodes {
            if let Ok(scheduler) = self.scheduler(id) {
                scheduler.lock().node_destroy(thread.id());
            }
        }
        kdebug!("sched: thread {} ({}) deleted", thread.id(), thread.name());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Blocking states
    // -----------------------------------------------------------------------

    /// Adds blocking states.
    pub(crate) fn set_state(&self, thread: &Thread, states: ThreadStates) {
        let mut run = thread.run.lock();
        let was_ready = run.states.is_ready();
        run.states.insert(states);
        self.commit_states(thread, run, was_ready);
    }

    /// Removes blocking states.
    pub(crate) fn clear_state(&self, thread: &Thread, states: ThreadStates) {
        let mut run = thread.run.lock();
        let was_ready = run.states.is_ready();
        run.states.remove(states);
        self.commit_states(thread, run, was_ready);
    }

    /// Pushes a readiness change of `thread` into its scheduler nodes, then
    /// releases the state lock and serves the help requests.
    fn commit_states(&self, thread: &Thread, run: SpinLockGuard<'_, RunState>, was_ready: bool) {
        let is_ready = run.states.is_ready();
        if was_ready && !is_ready {
            self.block_nodes(thread);
        } else if !was_ready && is_ready {
            self.unblock_home(thread);
        }
        drop(run);
        self.process_help_requests();
    }

    fn block_nodes(&self, thread: &Thread) {
        let nodes = {
            let mut cell = thread.scheduling.lock();
            cell.state = SchedState::Blocked;
            cell.scheduled_by = None;
            cell.nodes.clone()
        };
        for (index, id) in nodes.into_iter().enumerate() {
            let Ok(scheduler) = self.scheduler(id) else {
                continue;
            };
            let mut ops = scheduler.lock();
            if index == 0 {
                ops.block(&self.processors, thread.id());
            } else {
                ops.withdraw_node(&self.processors, thread.id(), NodeState::Blocked);
            }
        }
    }

    fn unblock_home(&self, thread: &Thread) {
        let home = {
            let mut cell = thread.scheduling.lock();
            cell.state = SchedState::Ready;
            cell.nodes.first().copied()
        };
        let Some(scheduler) = home.and_then(|id| self.scheduler(id).ok()) else {
            return;
        };
        if scheduler.lock().unblock(&self.processors, thread.id()) {
            self.request_help(thread);
        }
    }

    fn request_help(&self, thread: &Thread) {
        let wanted = {
            let cell = thread.scheduling.lock();
            cell.state == SchedState::Ready && cell.has_helping_nodes() && !cell.pinned
        };
        if wanted {
            self.processors
                .request_help(Arc::clone(&thread.scheduling));
        }
    }

    /// Offers every thread that asked for help to its scheduler nodes, home
    /// first, until one of them schedules it.
    fn process_help_requests(&self) {
        while let Some(cell) = self.processors.next_help_request() {
            let (thread, nodes) = {
                let cell = cell.lock();
                if cell.state != SchedState::Ready || cell.pinned {
                    continue;
                }
                (cell.thread, cell.nodes.clone())
            };
            for (index, id) in nodes.into_iter().enumerate() {
                let Ok(scheduler) = self.scheduler(id) else {
                    continue;
                };
                let scheduled = {
                    let mut ops = scheduler.lock();
                    if index == 0 {
                        if ops.node_state(thread) == Some(NodeState::Blocked) {
                            ops.unblock(&self.processors, thread);
                        }
                        ops.node_state(thread) == Some(NodeState::Scheduled)
                    } else {
                        ops.ask_for_help(&self.processors, thread)
                    }
                };
                if scheduled || cell.lock().state != SchedState::Ready {
                    break;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Priorities
    // -----------------------------------------------------------------------

    /// Brings the scheduler nodes of `thread` in line with its priority
    /// aggregations: changed nodes are updated, new helping nodes are
    /// created and emptied ones destroyed.
    pub(crate) fn update_priority(&self, thread: &Thread) {
        {
            let run = thread.run.lock();
            if run.deleted {
                return;
            }
            let ready = run.states.is_ready();
            let snapshot = thread.wait.lock().priorities.snapshot_and_prune();
            let mut removed = false;

            for (id, priority) in snapshot {
                let Ok(scheduler) = self.scheduler(id) else {
                    continue;
                };
                let known = thread.scheduling.lock().nodes.contains(&id);
                match (priority, known) {
                    (Some(priority), true) => {
                        let left_ready = scheduler.lock().update_priority(
                            &self.processors,
                            thread.id(),
                            priority,
                        );
                        if left_ready {
                            self.request_help(thread);
                        }
                    }
                    (Some(priority), false) => {
                        scheduler.lock().node_initialize(NodeInit {
                            thread: thread.id(),
                            owner: Some(Arc::clone(&thread.scheduling)),
                            priority,
                            affinity: run.affinity,
                            home: false,
                        });
                        thread.scheduling.lock().nodes.push(id);
                        if ready {
                            self.request_help(thread);
                        }
                    }
                    (None, true) => {
                        thread.scheduling.lock().nodes.retain(|&n| n != id);
                        let next = if ready {
                            NodeState::Ready
                        } else {
                            NodeState::Blocked
                        };
                        let mut ops = scheduler.lock();
                        ops.withdraw_node(&self.processors, thread.id(), next);
                        ops.node_destroy(thread.id());
                        removed = true;
                    }
                    (None, false) => {}
                }
            }

            if removed && ready {
                self.reclaim_home(thread);
            }
        }
        self.process_help_requests();
    }

    /// Gives a ready thread that lost a helping node back to its home node
    /// if that node was parked while the thread ran elsewhere.
    fn reclaim_home(&self, thread: &Thread) {
        let (home, state) = {
            let cell = thread.scheduling.lock();
            (cell.nodes.first().copied(), cell.state)
        };
        if state != SchedState::Ready {
            return;
        }
        let Some(scheduler) = home.and_then(|id| self.scheduler(id).ok()) else {
            return;
        };
        let mut ops = scheduler.lock();
        if ops.node_state(thread.id()) == Some(NodeState::Blocked) {
            ops.unblock(&self.processors, thread.id());
        }
    }

    /// Changes the real priority of `thread`. Returns the previous real
    /// priority.
    pub fn set_priority(&self, thread: &Arc<Thread>, priority: Priority) -> Result<Priority> {
        ensure_alive(thread)?;
        let home = thread.home_scheduler();
        let mapped = self.map_priority(home, priority)?;
        let old = thread.wait.lock().priorities.set_real(mapped);

        let mut ctx = QueueContext::new();
        ctx.add_update(thread);
        threadq::priority_update(&mut ctx);
        Ok(self.unmap_priority(home, old))
    }

    /// Releases an EDF job of `thread` with an absolute `deadline`.
    pub fn release_job(&self, thread: &Arc<Thread>, deadline: u64) -> Result<()> {
        ensure_alive(thread)?;
        let home = thread.home_scheduler();
        if self.scheduler(home)?.algorithm() != Algorithm::Edf {
            return Err(Status::NotDefined);
        }
        if !edf::is_valid_deadline(deadline) {
            return Err(Status::InvalidNumber);
        }
        thread
            .wait
            .lock()
            .priorities
            .insert(home, PrioritySource::Deadline, Priority::new(deadline));

        let mut ctx = QueueContext::new();
        ctx.add_update(thread);
        threadq::priority_update(&mut ctx);
        Ok(())
    }

    /// Ends the current EDF job of `thread`; it runs in the background
    /// again.
    pub fn cancel_job(&self, thread: &Arc<Thread>) -> Result<()> {
        ensure_alive(thread)?;
        let home = thread.home_scheduler();
        if self.scheduler(home)?.algorithm() != Algorithm::Edf {
            return Err(Status::NotDefined);
        }
        thread
            .wait
            .lock()
            .priorities
            .remove(home, PrioritySource::Deadline);

        let mut ctx = QueueContext::new();
        ctx.add_update(thread);
        threadq::priority_update(&mut ctx);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Yield, affinity, pinning
    // -----------------------------------------------------------------------

    /// Lets nodes of equal priority run in place of `thread`.
    pub fn yield_thread(&self, thread: &Thread) -> Result<()> {
        {
            let run = thread.run.lock();
            if run.deleted {
                return Err(Status::InvalidId);
            }
            if !run.states.is_ready() {
                return Err(Status::IncorrectState);
            }
            let target = {
                let cell = thread.scheduling.lock();
                cell.scheduled_by.or_else(|| cell.nodes.first().copied())
            };
            if let Some(scheduler) = target.and_then(|id| self.scheduler(id).ok()) {
                if scheduler.lock().yield_thread(&self.processors, thread.id()) {
                    self.request_help(thread);
                }
            }
        }
        self.process_help_requests();
        Ok(())
    }

    /// Restricts `thread` to the processors in `affinity`.
    pub fn set_affinity(&self, thread: &Thread, affinity: ProcessorMask) -> Result<()> {
        let home = self.scheduler(thread.home_scheduler())?;
        if affinity.is_empty()
            || !affinity.is_subset(self.processors.online_mask())
            || !affinity.intersects(home.processors())
        {
            return Err(Status::InvalidNumber);
        }
        {
            let mut run = thread.run.lock();
            if run.deleted {
                return Err(Status::InvalidId);
            }
            run.affinity = affinity;
            let nodes = thread.scheduling.lock().nodes.clone();
            for id in nodes {
                self.scheduler(id)?
                    .lock()
                    .set_affinity(&self.processors, thread.id(), affinity)?;
            }
        }
        kdebug!("sched: thread {} affinity {:#x}", thread.id(), affinity.bits());
        self.process_help_requests();
        Ok(())
    }

    /// Pins `thread` to the processor it is scheduled on. Pins nest.
    pub fn pin(&self, thread: &Thread) -> Result<()> {
        let mut run = thread.run.lock();
        if run.deleted {
            return Err(Status::InvalidId);
        }
        if run.pin_level == 0 {
            let (scheduler, cpu) = {
                let cell = thread.scheduling.lock();
                if cell.state != SchedState::Scheduled {
                    return Err(Status::IncorrectState);
                }
                cell.scheduled_by.zip(cell.cpu).ok_or(Status::IncorrectState)?
            };
            self.scheduler(scheduler)?.lock().pin(thread.id(), cpu);
            thread.scheduling.lock().pinned = true;
            run.pinned = Some((scheduler, cpu));
        }
        run.pin_level += 1;
        Ok(())
    }

    /// Drops one pin level of `thread`.
    pub fn unpin(&self, thread: &Thread) -> Result<()> {
        {
            let mut run = thread.run.lock();
            if run.pin_level == 0 {
                return Err(Status::IncorrectState);
            }
            run.pin_level -= 1;
            if run.pin_level == 0 {
                if let Some((scheduler, cpu)) = run.pinned.take() {
                    self.scheduler(scheduler)?.lock().unpin(thread.id(), cpu);
                }
                thread.scheduling.lock().pinned = false;
                self.request_help(thread);
            }
        }
        self.process_help_requests();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scheduler management
    // -----------------------------------------------------------------------

    /// Moves `thread` to a new home scheduler with `priority`.
    pub fn set_scheduler(
        &self,
        thread: &Thread,
        scheduler: SchedulerId,
        priority: Priority,
    ) -> Result<()> {
        let new = self.scheduler(scheduler)?;
        if !new.is_valid_priority(priority) {
            return Err(Status::InvalidPriority);
        }
        let mapped = new.map_priority(priority);
        {
            let run = thread.run.lock();
            if run.deleted {
                return Err(Status::InvalidId);
            }
            {
                let wait = thread.wait.lock();
                if wait.queue.is_some() || wait.priorities.has_extra_contributions() {
                    return Err(Status::ResourceInUse);
                }
            }
            if run.pin_level > 0 {
                return Err(Status::ResourceInUse);
            }
            let processors = new.processors();
            if processors.is_empty() || !run.affinity.intersects(processors) {
                return Err(Status::Unsatisfied);
            }

            let old = thread.scheduling.lock().nodes.first().copied();
            if let Some(old) = old.and_then(|id| self.scheduler(id).ok()) {
                let mut ops = old.lock();
                ops.withdraw_node(&self.processors, thread.id(), NodeState::Blocked);
                ops.node_destroy(thread.id());
            }
            thread.wait.lock().priorities = NodePriorities::new(scheduler, mapped);
            {
                let mut cell = thread.scheduling.lock();
                cell.state = SchedState::Blocked;
                cell.scheduled_by = None;
                cell.nodes = alloc::vec![scheduler];
            }
            new.lock().node_initialize(NodeInit {
                thread: thread.id(),
                owner: Some(Arc::clone(&thread.scheduling)),
                priority: mapped,
                affinity: run.affinity,
                home: true,
            });
            if run.states.is_ready() {
                self.unblock_home(thread);
            }
        }
        kdebug!(
            "sched: thread {} moved to {} at priority {}",
            thread.id(),
            new.name(),
            priority
        );
        self.process_help_requests();
        Ok(())
    }

    /// Hands the unowned, online processor `cpu` to `scheduler`.
    pub fn add_processor(&self, scheduler: SchedulerId, cpu: CpuId) -> Result<()> {
        let instance = self.scheduler(scheduler)?;
        if cpu.as_usize() >= MAX_PROCESSORS {
            return Err(Status::InvalidId);
        }
        self.processors.claim(cpu, scheduler)?;
        self.attach_processor(instance, cpu);
        kinfo!("sched: processor {} added to {}", cpu, instance.name());
        self.process_help_requests();
        Ok(())
    }

    /// Takes `cpu` away from `scheduler`. The processor is left unowned,
    /// running its idle thread.
    pub fn remove_processor(&self, scheduler: SchedulerId, cpu: CpuId) -> Result<()> {
        let instance = self.scheduler(scheduler)?;
        let idle = instance.lock().remove_processor(&self.processors, cpu)?;
        self.processors.set_scheduler(cpu, None);
        kinfo!(
            "sched: processor {} removed from {}, idle {}",
            cpu,
            instance.name(),
            idle
        );
        self.process_help_requests();
        Ok(())
    }
}

impl core::fmt::Debug for System {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("System")
            .field("schedulers", &self.schedulers)
            .field("processors", &self.processors.count())
            .finish_non_exhaustive()
    }
}

fn ensure_alive(thread: &Thread) -> Result<()> {
    if thread.run.lock().deleted {
        Err(Status::InvalidId)
    } else {
        Ok(())
    }
}

#[cfg(all(test, not(loom), not(shuttle)))]
mod tests {
    use super::*;

    use crate::config::SchedulerConfig;

    const A: SchedulerId = SchedulerId::new(0);
    const B: SchedulerId = SchedulerId::new(1);

    fn cpu(n: u32) -> CpuId {
        CpuId::new(n)
    }

    fn p(v: u64) -> Priority {
        Priority::new(v)
    }

    /// One scheduler owning `processors` processors.
    fn single(processors: u32) -> Arc<System> {
        let config = (0..processors).fold(
            SystemConfig::new().scheduler(SchedulerConfig::priority("A", 256)),
            |config, _| config.assign(0, true),
        );
        System::new(&config).unwrap()
    }

    fn split() -> Arc<System> {
        let config = SystemConfig::new()
            .scheduler(SchedulerConfig::priority("A", 256))
            .scheduler(SchedulerConfig::priority("B", 256))
            .assign(0, true)
            .assign(1, true);
        System::new(&config).unwrap()
    }

    // -----------------------------------------------------------------------
    // Construction and queries
    // -----------------------------------------------------------------------

    #[test]
    fn processors_start_idle() {
        let sys = split();
        assert_eq!(sys.heir(cpu(0)), Some(ThreadId::new(IDLE_THREAD_BASE)));
        assert_eq!(sys.executing(cpu(1)), Some(ThreadId::new(IDLE_THREAD_BASE + 1)));
        assert_eq!(sys.scheduler_of_processor(cpu(1)), Ok(B));
        assert_eq!(sys.scheduler_of_processor(cpu(2)), Err(Status::InvalidNumber));
        assert_eq!(sys.processor_count(A), Ok(1));
        assert_eq!(sys.ident("B"), Ok(B));
        assert_eq!(sys.ident("C"), Err(Status::InvalidId));
    }

    #[test]
    fn offline_processor_is_unowned() {
        let config = SystemConfig::new()
            .scheduler(SchedulerConfig::priority("A", 256))
            .assign(0, true)
            .assign(0, false)
            .online(ProcessorMask::single(cpu(0)));
        let sys = System::new(&config).unwrap();
        assert_eq!(sys.scheduler_of_processor(cpu(1)), Err(Status::IncorrectState));
        assert_eq!(sys.add_processor(A, cpu(1)), Err(Status::IncorrectState));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let config = SystemConfig::new()
            .scheduler(SchedulerConfig::priority("A", 256))
            .assign(3, true);
        assert_eq!(System::new(&config).err(), Some(Status::InvalidId));
    }

    #[test]
    fn priority_mapping_validates() {
        let sys = single(1);
        assert_eq!(sys.map_priority(A, p(255)), Ok(p(255)));
        assert_eq!(sys.map_priority(A, p(256)), Err(Status::InvalidPriority));
        assert_eq!(sys.map_priority(B, p(1)), Err(Status::InvalidId));
        assert_eq!(sys.unmap_priority(B, p(7)), p(7));
    }

    // -----------------------------------------------------------------------
    // Life cycle
    // -----------------------------------------------------------------------

    #[test]
    fn created_thread_is_dormant_until_started() {
        let sys = single(1);
        let t = sys.create_thread("t", A, p(5)).unwrap();
        assert_eq!(t.states(), ThreadStates::DORMANT);
        assert_eq!(sys.heir(cpu(0)), Some(ThreadId::new(IDLE_THREAD_BASE)));

        sys.start(&t).unwrap();
        assert_eq!(sys.heir(cpu(0)), Some(t.id()));
        assert_eq!(t.sched_state(), SchedState::Scheduled);
        assert_eq!(sys.start(&t), Err(Status::IncorrectState));
        assert_eq!(sys.dispatch(cpu(0)), Some(t.id()));
        assert_eq!(sys.get_processor(&t), Some(cpu(0)));
    }

    #[test]
    fn create_rejects_bad_arguments() {
        let sys = single(1);
        assert_eq!(sys.create_thread("t", B, p(5)).err(), Some(Status::InvalidId));
        assert_eq!(
            sys.create_thread("t", A, p(256)).err(),
            Some(Status::InvalidPriority)
        );
    }

    #[test]
    fn suspend_and_resume() {
        let sys = single(1);
        let t = sys.spawn("t", A, p(5)).unwrap();
        sys.suspend(&t).unwrap();
        assert_eq!(sys.suspend(&t), Err(Status::IncorrectState));
        assert_eq!(t.sched_state(), SchedState::Blocked);
        assert_eq!(sys.heir(cpu(0)), Some(ThreadId::new(IDLE_THREAD_BASE)));

        sys.resume(&t).unwrap();
        assert_eq!(sys.resume(&t), Err(Status::IncorrectState));
        assert_eq!(sys.heir(cpu(0)), Some(t.id()));
    }

    #[test]
    fn delete_destroys_nodes() {
        let sys = single(1);
        let t = sys.spawn("t", A, p(5)).unwrap();
        sys.delete(&t).unwrap();
        assert_eq!(sys.heir(cpu(0)), Some(ThreadId::new(IDLE_THREAD_BASE)));
        assert_eq!(sys.delete(&t), Err(Status::InvalidId));
        assert_eq!(sys.start(&t), Err(Status::InvalidId));
        assert_eq!(sys.set_priority(&t, p(3)), Err(Status::InvalidId));
        assert!(sys.scheduler(A).unwrap().lock().node_state(t.id()).is_none());
    }

    // -----------------------------------------------------------------------
    // Priorities and yield
    // -----------------------------------------------------------------------

    #[test]
    fn set_priority_preempts_and_returns_old() {
        let sys = single(1);
        let a = sys.spawn("a", A, p(5)).unwrap();
        let b = sys.spawn("b", A, p(7)).unwrap();
        assert_eq!(sys.heir(cpu(0)), Some(a.id()));

        assert_eq!(sys.set_priority(&b, p(2)), Ok(p(7)));
        assert_eq!(sys.heir(cpu(0)), Some(b.id()));
        assert_eq!(b.real_priority(), p(2));
        assert_eq!(sys.set_priority(&b, p(300)), Err(Status::InvalidPriority));
    }

    #[test]
    fn yield_rotates_equal_priorities() {
        let sys = single(1);
        let a = sys.spawn("a", A, p(5)).unwrap();
        let b = sys.spawn("b", A, p(5)).unwrap();
        sys.yield_thread(&a).unwrap();
        assert_eq!(sys.heir(cpu(0)), Some(b.id()));
        sys.suspend(&b).unwrap();
        assert_eq!(sys.yield_thread(&b), Err(Status::IncorrectState));
    }

    #[test]
    fn edf_jobs_order_by_deadline() {
        let config = SystemConfig::uniprocessor(SchedulerConfig::edf("E", 256));
        let sys = System::new(&config).unwrap();
        let a = sys.spawn("a", A, p(1)).unwrap();
        let b = sys.spawn("b", A, p(9)).unwrap();
        assert_eq!(sys.heir(cpu(0)), Some(a.id()));

        sys.release_job(&b, 1000).unwrap();
        assert_eq!(sys.heir(cpu(0)), Some(b.id()));
        sys.release_job(&a, 500).unwrap();
        assert_eq!(sys.heir(cpu(0)), Some(a.id()));

        sys.cancel_job(&a).unwrap();
        assert_eq!(sys.heir(cpu(0)), Some(b.id()));
        assert_eq!(a.current_priority(), p(1));
        assert_eq!(sys.release_job(&a, edf::BACKGROUND), Err(Status::InvalidNumber));
    }

    #[test]
    fn jobs_need_edf_home() {
        let sys = single(1);
        let t = sys.spawn("t", A, p(5)).unwrap();
        assert_eq!(sys.release_job(&t, 10), Err(Status::NotDefined));
        assert_eq!(sys.cancel_job(&t), Err(Status::NotDefined));
    }

    // -----------------------------------------------------------------------
    // Affinity and pinning
    // -----------------------------------------------------------------------

    #[test]
    fn affinity_must_fit_home_scheduler() {
        let sys = split();
        let t = sys.spawn("t", A, p(5)).unwrap();
        assert_eq!(
            sys.set_affinity(&t, ProcessorMask::single(cpu(1))),
            Err(Status::InvalidNumber)
        );
        assert_eq!(
            sys.set_affinity(&t, ProcessorMask::single(cpu(4))),
            Err(Status::InvalidNumber)
        );
        assert_eq!(sys.set_affinity(&t, ProcessorMask::empty()), Err(Status::InvalidNumber));
        assert_eq!(
            sys.set_affinity(&t, ProcessorMask::single(cpu(64))),
            Err(Status::InvalidNumber)
        );
        sys.set_affinity(&t, ProcessorMask::single(cpu(0))).unwrap();
        assert_eq!(t.affinity(), ProcessorMask::single(cpu(0)));
    }

    #[test]
    fn affinity_moves_thread() {
        let sys = single(2);
        let t = sys.spawn("t", A, p(5)).unwrap();
        assert_eq!(sys.get_processor(&t), Some(cpu(1)));
        sys.set_affinity(&t, ProcessorMask::single(cpu(0))).unwrap();
        assert_eq!(sys.get_processor(&t), Some(cpu(0)));
        assert_eq!(sys.heir(cpu(1)), Some(ThreadId::new(IDLE_THREAD_BASE + 1)));
    }

    #[test]
    fn pin_nests() {
        let sys = single(2);
        let t = sys.spawn("t", A, p(5)).unwrap();
        sys.pin(&t).unwrap();
        sys.pin(&t).unwrap();
        sys.unpin(&t).unwrap();
        assert_eq!(sys.remove_processor(A, cpu(1)), Err(Status::ResourceInUse));
        sys.unpin(&t).unwrap();
        assert_eq!(sys.unpin(&t), Err(Status::IncorrectState));
        sys.remove_processor(A, cpu(1)).unwrap();
        assert_eq!(sys.get_processor(&t), Some(cpu(0)));
    }

    #[test]
    fn pin_requires_scheduled_thread() {
        let sys = single(1);
        let t = sys.create_thread("t", A, p(5)).unwrap();
        assert_eq!(sys.pin(&t), Err(Status::IncorrectState));
    }

    #[test]
    fn pinned_thread_cannot_be_deleted() {
        let sys = single(1);
        let t = sys.spawn("t", A, p(5)).unwrap();
        sys.pin(&t).unwrap();
        assert_eq!(sys.delete(&t), Err(Status::ResourceInUse));
        sys.unpin(&t).unwrap();
        sys.delete(&t).unwrap();
    }

    // -----------------------------------------------------------------------
    // Scheduler management
    // -----------------------------------------------------------------------

    #[test]
    fn set_scheduler_moves_thread() {
        let sys = split();
        let t = sys.spawn("t", A, p(5)).unwrap();
        assert_eq!(sys.get_processor(&t), Some(cpu(0)));

        sys.set_scheduler(&t, B, p(3)).unwrap();
        assert_eq!(t.home_scheduler(), B);
        assert_eq!(t.real_priority(), p(3));
        assert_eq!(sys.get_processor(&t), Some(cpu(1)));
        assert_eq!(sys.heir(cpu(0)), Some(ThreadId::new(IDLE_THREAD_BASE)));
    }

    #[test]
    fn set_scheduler_errors() {
        let sys = split();
        let t = sys.spawn("t", A, p(5)).unwrap();
        assert_eq!(
            sys.set_scheduler(&t, SchedulerId::new(7), p(3)),
            Err(Status::InvalidId)
        );
        assert_eq!(sys.set_scheduler(&t, B, p(256)), Err(Status::InvalidPriority));

        sys.remove_processor(B, cpu(1)).unwrap();
        assert_eq!(sys.set_scheduler(&t, B, p(3)), Err(Status::Unsatisfied));

        sys.pin(&t).unwrap();
        assert_eq!(sys.set_scheduler(&t, A, p(3)), Err(Status::ResourceInUse));
        sys.unpin(&t).unwrap();
    }

    #[test]
    fn add_processor_errors() {
        let sys = split();
        assert_eq!(sys.add_processor(SchedulerId::new(5), cpu(0)), Err(Status::InvalidId));
        assert_eq!(sys.add_processor(A, cpu(64)), Err(Status::InvalidId));
        assert_eq!(sys.add_processor(A, cpu(7)), Err(Status::NotConfigured));
        assert_eq!(sys.add_processor(A, cpu(1)), Err(Status::ResourceInUse));
    }

    #[test]
    fn remove_processor_errors() {
        let sys = split();
        assert_eq!(sys.remove_processor(SchedulerId::new(5), cpu(0)), Err(Status::InvalidId));
        assert_eq!(sys.remove_processor(A, cpu(1)), Err(Status::InvalidNumber));
        let _t = sys.create_thread("t", A, p(5)).unwrap();
        assert_eq!(sys.remove_processor(A, cpu(0)), Err(Status::ResourceInUse));
        sys.remove_processor(B, cpu(1)).unwrap();
        assert_eq!(sys.processor_count(B), Ok(0));
    }

    #[test]
    fn processor_moves_between_schedulers() {
        let sys = split();
        sys.remove_processor(B, cpu(1)).unwrap();
        assert_eq!(sys.scheduler_of_processor(cpu(1)), Err(Status::IncorrectState));
        sys.add_processor(A, cpu(1)).unwrap();
        assert_eq!(sys.scheduler_processors(A), Ok(ProcessorMask::all(2)));
        assert_eq!(sys.scheduler_of_processor(cpu(1)), Ok(A));
    }

    // -----------------------------------------------------------------------
    // Helping
    // -----------------------------------------------------------------------

    #[test]
    fn preempted_owner_is_helped_by_waiter_scheduler() {
        use crate::threadq::{Discipline, ThreadQueue};

        let sys = split();
        let owner = sys.spawn("owner", A, p(5)).unwrap();
        let waiter = sys.spawn("waiter", B, p(3)).unwrap();
        let queue = ThreadQueue::new("q", Discipline::PriorityInherit);
        queue.lock().set_owner(Some(Arc::clone(&owner)));

        let mut ctx = QueueContext::new();
        queue.enqueue(&waiter, &mut ctx).unwrap();
        assert_eq!(owner.node_priority(B), Some(p(3)));
        assert_eq!(sys.get_processor(&owner), Some(cpu(0)));

        // The owner loses processor 0 and continues on processor 1 through
        // its helping node.
        let hog = sys.spawn("hog", A, p(1)).unwrap();
        assert_eq!(sys.heir(cpu(0)), Some(hog.id()));
        assert_eq!(sys.heir(cpu(1)), Some(owner.id()));
        assert_eq!(sys.get_processor(&owner), Some(cpu(1)));

        // Surrender drops the helping node; the waiter runs on its own
        // processor again.
        assert_eq!(queue.surrender(&owner, &mut ctx).map(|t| t.id()), Some(waiter.id()));
        assert_eq!(owner.node_priority(B), None);
        assert_eq!(sys.heir(cpu(1)), Some(waiter.id()));
        assert_eq!(owner.sched_state(), SchedState::Ready);
    }
}
