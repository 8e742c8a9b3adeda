//! Mutexes on top of thread queues.
//!
//! [`Mutex`] is the plain owner-tracking lock. [`RecursiveMutex`] adds a
//! nesting counter and a policy for self-seize. [`CeilingMutex`] raises
//! its owner to a fixed ceiling priority for as long as it is held.
//! [`MrspMutex`] has a ceiling per scheduler instance and lets waiters of
//! other instances help the owner.
//!
//! The owner of a mutex is the owner of its thread queue. Every owner
//! change happens under the queue lock, and ownership is handed directly
//! to the first waiter on surrender; a released mutex with waiters is
//! never observed unowned.
//!
//! A deleted mutex refuses every operation with [`Status::InvalidId`].

use alloc::boxed::Box;
use alloc::sync::Arc;

use kestrel_core::id::{QueueId, SchedulerId};
use kestrel_core::sync::SpinLock;
use kestrel_core::sync::loom_compat::{AtomicU32, Ordering};
use kestrel_core::{Result, Status, kdebug};

use crate::priority::{Priority, PrioritySource};
use crate::system::System;
use crate::thread::{Thread, ThreadStates};
use crate::threadq::{self, Discipline, QueueContext, QueueGuard, ThreadQueue, WaitOutcome};

/// What seizing a mutex one already owns does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recursion {
    /// Nest; every seize needs its own surrender.
    Allowed,
    /// Fail with [`Status::Unsatisfied`].
    Unavailable,
    /// Fail with [`Status::Deadlock`].
    Deadlock,
}

/// Waiter order and priority protocol of a non-ceiling mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Arrival order, no priority protocol.
    Fifo,
    /// Priority order, no priority protocol.
    Priority,
    /// Priority order, the owner inherits the priority of its waiters.
    Inherit,
}

impl Protocol {
    fn discipline(self) -> Discipline {
        match self {
            Self::Fifo => Discipline::Fifo,
            Self::Priority => Discipline::Priority,
            Self::Inherit => Discipline::PriorityInherit,
        }
    }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// A mutex without recursion.
///
/// Seizing a mutex the caller already owns runs into the deadlock
/// detection of the thread queue.
#[derive(Debug)]
pub struct Mutex {
    queue: ThreadQueue,
}

impl Mutex {
    /// Creates an unowned mutex.
    pub fn new(name: &'static str, discipline: Discipline) -> Self {
        Self {
            queue: ThreadQueue::new(name, discipline),
        }
    }

    /// Current owner.
    pub fn owner(&self) -> Option<Arc<Thread>> {
        self.queue.owner()
    }

    /// Returns `true` if the mutex is owned.
    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// The wait queue of the mutex.
    pub fn queue(&self) -> &ThreadQueue {
        &self.queue
    }

    /// Seizes the mutex for `thread`.
    ///
    /// If the mutex is owned and `wait` is `false` this fails with
    /// [`Status::Unsatisfied`]. Otherwise the thread waits; ownership is
    /// reported through [`Thread::wait_result`] once the wait resolves.
    pub fn seize(
        &self,
        thread: &Arc<Thread>,
        wait: bool,
        ctx: &mut QueueContext,
    ) -> Result<WaitOutcome> {
        let mut guard = self.queue.lock_alive()?;
        if guard.owner().is_none() {
            guard.set_owner(Some(Arc::clone(thread)));
            thread.resource_count_increment();
            return Ok(WaitOutcome::Satisfied);
        }
        Self::seize_slow(guard, thread, wait, ctx)
    }

    /// Contended path: the owner was seen non-null under the queue lock.
    fn seize_slow(
        guard: QueueGuard<'_>,
        thread: &Arc<Thread>,
        wait: bool,
        ctx: &mut QueueContext,
    ) -> Result<WaitOutcome> {
        if !wait {
            return Err(Status::Unsatisfied);
        }
        ctx.set_thread_state(ThreadStates::WAITING_FOR_MUTEX);
        threadq::enqueue(guard, thread, ctx)
    }

    /// Releases the mutex. Returns the new owner, if a waiter took over.
    pub fn surrender(
        &self,
        thread: &Arc<Thread>,
        ctx: &mut QueueContext,
    ) -> Result<Option<Arc<Thread>>> {
        let guard = self.queue.lock_alive()?;
        if !guard.is_owner(thread) {
            return Err(Status::NotOwner);
        }
        thread.resource_count_decrement();
        Ok(threadq::surrender(guard, thread, ctx))
    }

    /// Deletes the mutex. Waiters are released with
    /// [`Status::ObjectWasDeleted`].
    ///
    /// Fails with [`Status::ResourceInUse`] while the mutex is owned. The
    /// owner check and the deletion happen under one hold of the queue
    /// lock, so a concurrent seize either precedes the check or fails.
    pub fn delete(&self) -> Result<()> {
        let guard = self.queue.lock_alive()?;
        if guard.owner().is_some() {
            return Err(Status::ResourceInUse);
        }
        let released = threadq::delete(guard, &mut QueueContext::new());
        kdebug!("mutex {}: deleted, {released} released", self.queue.name());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recursive mutex
// ---------------------------------------------------------------------------

/// A mutex with a nesting level.
#[derive(Debug)]
pub struct RecursiveMutex {
    mutex: Mutex,
    /// Additional seizes of the owner. Only the owner changes it.
    nest_level: AtomicU32,
    recursion: Recursion,
    protocol: Protocol,
}

impl RecursiveMutex {
    /// Creates an unowned mutex.
    pub fn new(name: &'static str, protocol: Protocol, recursion: Recursion) -> Self {
        Self {
            mutex: Mutex::new(name, protocol.discipline()),
            nest_level: AtomicU32::new(0),
            recursion,
            protocol,
        }
    }

    /// Current owner.
    pub fn owner(&self) -> Option<Arc<Thread>> {
        self.mutex.owner()
    }

    /// Returns `true` if the mutex is owned.
    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }

    /// Seizes beyond the first one.
    pub fn nest_level(&self) -> u32 {
        self.nest_level.load(Ordering::Acquire)
    }

    /// Priority protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Self-seize policy.
    pub fn recursion(&self) -> Recursion {
        self.recursion
    }

    /// The wait queue of the mutex.
    pub fn queue(&self) -> &ThreadQueue {
        self.mutex.queue()
    }

    fn seize_recursive(&self) -> Result<WaitOutcome> {
        match self.recursion {
            Recursion::Allowed => {
                self.nest_level.fetch_add(1, Ordering::AcqRel);
                Ok(WaitOutcome::Satisfied)
            }
            Recursion::Unavailable => Err(Status::Unsatisfied),
            Recursion::Deadlock => Err(Status::Deadlock),
        }
    }

    /// Seizes the mutex for `thread`. See [`Mutex::seize`].
    pub fn seize(
        &self,
        thread: &Arc<Thread>,
        wait: bool,
        ctx: &mut QueueContext,
    ) -> Result<WaitOutcome> {
        let mut guard = self.mutex.queue.lock_alive()?;
        match guard.owner() {
            None => {
                guard.set_owner(Some(Arc::clone(thread)));
                thread.resource_count_increment();
                Ok(WaitOutcome::Satisfied)
            }
            Some(owner) if owner.id() == thread.id() => {
                drop(guard);
                self.seize_recursive()
            }
            Some(_) => Mutex::seize_slow(guard, thread, wait, ctx),
        }
    }

    /// Releases one level of the mutex. Returns the new owner, if a waiter
    /// took over.
    pub fn surrender(
        &self,
        thread: &Arc<Thread>,
        ctx: &mut QueueContext,
    ) -> Result<Option<Arc<Thread>>> {
        let guard = self.mutex.queue.lock_alive()?;
        if !guard.is_owner(thread) {
            return Err(Status::NotOwner);
        }
        if self.nest_level() > 0 {
            self.nest_level.fetch_sub(1, Ordering::AcqRel);
            return Ok(None);
        }
        thread.resource_count_decrement();
        Ok(threadq::surrender(guard, thread, ctx))
    }

    /// Deletes the mutex. See [`Mutex::delete`].
    pub fn delete(&self) -> Result<()> {
        self.mutex.delete()
    }
}

// ---------------------------------------------------------------------------
// Ceiling mutex
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Ceiling {
    /// Mapped into `scheduler`'s priority space.
    priority: Priority,
    scheduler: SchedulerId,
}

/// A mutex with the priority ceiling protocol.
///
/// The ceiling is defined for one scheduler instance; only threads homed
/// there may seize the mutex. A thread more urgent than the ceiling is
/// rejected with [`Status::MutexCeilingViolated`] and the owner does not
/// change.
pub struct CeilingMutex {
    inner: RecursiveMutex,
    system: Arc<System>,
    ceiling: SpinLock<Ceiling>,
}

impl CeilingMutex {
    /// Creates an unowned mutex with `ceiling` in `scheduler`.
    pub fn new(
        system: &Arc<System>,
        name: &'static str,
        scheduler: SchedulerId,
        ceiling: Priority,
        recursion: Recursion,
    ) -> Result<Self> {
        let priority = system.map_priority(scheduler, ceiling)?;
        Ok(Self {
            inner: RecursiveMutex::new(name, Protocol::Priority, recursion),
            system: Arc::clone(system),
            ceiling: SpinLock::named(
                "mutex.ceiling",
                Ceiling {
                    priority,
                    scheduler,
                },
            ),
        })
    }

    /// Current owner.
    pub fn owner(&self) -> Option<Arc<Thread>> {
        self.inner.owner()
    }

    /// Returns `true` if the mutex is owned.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Seizes beyond the first one.
    pub fn nest_level(&self) -> u32 {
        self.inner.nest_level()
    }

    /// The wait queue of the mutex.
    pub fn queue(&self) -> &ThreadQueue {
        self.inner.queue()
    }

    /// The ceiling priority, user form.
    pub fn priority(&self) -> Priority {
        let ceiling = *self.ceiling.lock();
        self.system
            .unmap_priority(ceiling.scheduler, ceiling.priority)
    }

    /// Scheduler instance the ceiling belongs to.
    pub fn scheduler(&self) -> SchedulerId {
        self.ceiling.lock().scheduler
    }

    /// Seizes the mutex for `thread`. See [`Mutex::seize`].
    pub fn seize(
        &self,
        thread: &Arc<Thread>,
        wait: bool,
        ctx: &mut QueueContext,
    ) -> Result<WaitOutcome> {
        let queue = &self.inner.mutex.queue;
        let mut guard = queue.lock_alive()?;
        match guard.owner() {
            None => {
                let ceiling = *self.ceiling.lock();
                {
                    let mut state = thread.wait.lock();
                    let home = state.priorities.home();
                    if home != ceiling.scheduler {
                        return Err(Status::NotDefined);
                    }
                    if state
                        .priorities
                        .home_priority()
                        .is_more_urgent_than(ceiling.priority)
                    {
                        return Err(Status::MutexCeilingViolated);
                    }
                    state.priorities.insert(
                        home,
                        PrioritySource::Ceiling(queue.id()),
                        ceiling.priority,
                    );
                }
                guard.set_owner(Some(Arc::clone(thread)));
                thread.resource_count_increment();
                ctx.add_update(thread);
                drop(guard);
                threadq::priority_update(ctx);
                Ok(WaitOutcome::Satisfied)
            }
            Some(owner) if owner.id() == thread.id() => {
                drop(guard);
                self.inner.seize_recursive()
            }
            Some(_) => Mutex::seize_slow(guard, thread, wait, ctx),
        }
    }

    /// Releases one level of the mutex. The ceiling moves from the old
    /// owner to the new one.
    pub fn surrender(
        &self,
        thread: &Arc<Thread>,
        ctx: &mut QueueContext,
    ) -> Result<Option<Arc<Thread>>> {
        let queue = &self.inner.mutex.queue;
        let guard = queue.lock_alive()?;
        if !guard.is_owner(thread) {
            return Err(Status::NotOwner);
        }
        if self.inner.nest_level() > 0 {
            self.inner.nest_level.fetch_sub(1, Ordering::AcqRel);
            return Ok(None);
        }

        let ceiling = *self.ceiling.lock();
        let source = PrioritySource::Ceiling(queue.id());
        thread.resource_count_decrement();
        thread.wait.lock().priorities.remove_everywhere(source);
        ctx.add_update(thread);
        if let Some(first) = guard.first() {
            first
                .wait
                .lock()
                .priorities
                .insert(ceiling.scheduler, source, ceiling.priority);
            ctx.add_update(&first);
        }
        Ok(threadq::surrender(guard, thread, ctx))
    }

    /// Changes the ceiling. An owner is moved to the new ceiling right
    /// away. Returns the previous ceiling.
    pub fn set_priority(&self, priority: Priority) -> Result<Priority> {
        let scheduler = self.scheduler();
        let mapped = self.system.map_priority(scheduler, priority)?;
        let queue = &self.inner.mutex.queue;

        let guard = queue.lock_alive()?;
        let old = core::mem::replace(&mut self.ceiling.lock().priority, mapped);
        let mut ctx = QueueContext::new();
        if let Some(owner) = guard.owner() {
            let changed = owner.wait.lock().priorities.insert(
                scheduler,
                PrioritySource::Ceiling(queue.id()),
                mapped,
            );
            if changed {
                ctx.add_update(&owner);
            }
        }
        drop(guard);
        threadq::priority_update(&mut ctx);
        Ok(self.system.unmap_priority(scheduler, old))
    }

    /// Deletes the mutex. See [`Mutex::delete`].
    pub fn delete(&self) -> Result<()> {
        self.inner.delete()
    }
}

impl core::fmt::Debug for CeilingMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CeilingMutex")
            .field("queue", self.queue())
            .field("ceiling", &self.priority())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// MrsP mutex
// ---------------------------------------------------------------------------

/// A mutex with the multiprocessor resource sharing protocol (MrsP).
///
/// Every scheduler instance has a ceiling of its own. A thread seizing the
/// mutex is raised to the ceiling of its home instance, as owner and as
/// waiter alike. Waiters are kept in priority order and the owner inherits
/// their raised priorities, so a waiter homed in another instance gives
/// the owner a helping node there. A preempted owner continues on the
/// processor such a waiter gave up.
///
/// The mutex does not nest: a seize by the owner fails with
/// [`Status::Unsatisfied`].
pub struct MrspMutex {
    mutex: Mutex,
    system: Arc<System>,
    /// Mapped ceilings, indexed by scheduler instance.
    ceilings: SpinLock<Box<[Priority]>>,
}

impl MrspMutex {
    /// Creates an unowned mutex with `ceiling` in `scheduler`. Every other
    /// instance starts with its most urgent priority as ceiling.
    pub fn new(
        system: &Arc<System>,
        name: &'static str,
        scheduler: SchedulerId,
        ceiling: Priority,
    ) -> Result<Self> {
        let own = system.map_priority(scheduler, ceiling)?;
        let ceilings: Box<[Priority]> = system
            .schedulers()
            .iter()
            .map(|s| {
                if s.id() == scheduler {
                    own
                } else {
                    s.map_priority(Priority::new(0))
                }
            })
            .collect();
        Ok(Self {
            mutex: Mutex::new(name, Discipline::PriorityInherit),
            system: Arc::clone(system),
            ceilings: SpinLock::named("mutex.mrsp", ceilings),
        })
    }

    /// Current owner.
    pub fn owner(&self) -> Option<Arc<Thread>> {
        self.mutex.owner()
    }

    /// Returns `true` if the mutex is owned.
    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }

    /// The wait queue of the mutex.
    pub fn queue(&self) -> &ThreadQueue {
        self.mutex.queue()
    }

    fn ceiling(&self, scheduler: SchedulerId) -> Option<Priority> {
        self.ceilings.lock().get(scheduler.as_usize()).copied()
    }

    /// The ceiling in `scheduler`, user form.
    pub fn priority(&self, scheduler: SchedulerId) -> Result<Priority> {
        let ceiling = self.ceiling(scheduler).ok_or(Status::InvalidId)?;
        Ok(self.system.unmap_priority(scheduler, ceiling))
    }

    /// Raises `thread` to the ceiling of its home instance.
    fn raise(&self, thread: &Thread, queue: QueueId) -> Result<()> {
        let mut state = thread.wait.lock();
        let home = state.priorities.home();
        let ceiling = self.ceiling(home).ok_or(Status::NotDefined)?;
        if state.priorities.home_priority().is_more_urgent_than(ceiling) {
            return Err(Status::MutexCeilingViolated);
        }
        state
            .priorities
            .insert(home, PrioritySource::Ceiling(queue), ceiling);
        Ok(())
    }

    fn lower(thread: &Thread, queue: QueueId) {
        thread
            .wait
            .lock()
            .priorities
            .remove_everywhere(PrioritySource::Ceiling(queue));
    }

    /// Seizes the mutex for `thread`.
    ///
    /// A thread more urgent than the ceiling of its home instance fails
    /// with [`Status::MutexCeilingViolated`] and does not wait. A waiter
    /// keeps its raised priority until it owns the mutex or its wait ends
    /// otherwise.
    pub fn seize(
        &self,
        thread: &Arc<Thread>,
        wait: bool,
        ctx: &mut QueueContext,
    ) -> Result<WaitOutcome> {
        let queue = &self.mutex.queue;
        let mut guard = queue.lock_alive()?;
        match guard.owner() {
            None => {
                self.raise(thread, queue.id())?;
                guard.set_owner(Some(Arc::clone(thread)));
                thread.resource_count_increment();
                ctx.add_update(thread);
                drop(guard);
                threadq::priority_update(ctx);
                Ok(WaitOutcome::Satisfied)
            }
            Some(owner) if owner.id() == thread.id() => Err(Status::Unsatisfied),
            Some(_) if !wait => Err(Status::Unsatisfied),
            Some(_) => {
                self.raise(thread, queue.id())?;
                ctx.add_update(thread);
                ctx.set_thread_state(ThreadStates::WAITING_FOR_MUTEX);
                let outcome = threadq::enqueue(guard, thread, ctx);
                if outcome.is_err() {
                    Self::lower(thread, queue.id());
                    ctx.add_update(thread);
                    threadq::priority_update(ctx);
                }
                outcome
            }
        }
    }

    /// Releases the mutex. The old owner drops its ceiling and everything
    /// it inherited through the mutex; the first waiter takes over with the
    /// ceiling it already holds.
    pub fn surrender(
        &self,
        thread: &Arc<Thread>,
        ctx: &mut QueueContext,
    ) -> Result<Option<Arc<Thread>>> {
        let queue = &self.mutex.queue;
        let guard = queue.lock_alive()?;
        if !guard.is_owner(thread) {
            return Err(Status::NotOwner);
        }
        thread.resource_count_decrement();
        Self::lower(thread, queue.id());
        ctx.add_update(thread);
        Ok(threadq::surrender(guard, thread, ctx))
    }

    /// Changes the ceiling in `scheduler`. An owner homed there is moved to
    /// the new ceiling right away. Returns the previous ceiling.
    pub fn set_priority(&self, scheduler: SchedulerId, priority: Priority) -> Result<Priority> {
        let mapped = self.system.map_priority(scheduler, priority)?;
        let queue = &self.mutex.queue;

        let guard = queue.lock_alive()?;
        let old = {
            let mut ceilings = self.ceilings.lock();
            let slot = ceilings
                .get_mut(scheduler.as_usize())
                .ok_or(Status::InvalidId)?;
            core::mem::replace(slot, mapped)
        };
        let mut ctx = QueueContext::new();
        if let Some(owner) = guard.owner() {
            let changed = {
                let mut state = owner.wait.lock();
                state.priorities.home() == scheduler
                    && state.priorities.insert(
                        scheduler,
                        PrioritySource::Ceiling(queue.id()),
                        mapped,
                    )
            };
            if changed {
                ctx.add_update(&owner);
            }
        }
        drop(guard);
        threadq::priority_update(&mut ctx);
        Ok(self.system.unmap_priority(scheduler, old))
    }

    /// Deletes the mutex. See [`Mutex::delete`].
    pub fn delete(&self) -> Result<()> {
        self.mutex.delete()
    }
}

impl core::fmt::Debug for MrspMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MrspMutex")
            .field("queue", self.queue())
            .field("ceilings", &*self.ceilings.lock())
            .finish_non_exhaustive()
    }
}
