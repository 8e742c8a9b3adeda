//! Per-processor scheduling state.
//!
//! Each processor records which scheduler instance owns it, its idle
//! thread, the thread it executes and its heir, the thread it will execute
//! at the next dispatch point. Scheduler instances only ever write the
//! heir; [`Processors::dispatch`] moves it to `executing`.

use alloc::boxed::Box;
use alloc::vec::Vec;

use kestrel_core::cpumask::ProcessorMask;
use kestrel_core::id::{CpuId, SchedulerId, ThreadId};
use kestrel_core::sync::SpinLock;
use kestrel_core::{Result, Status};

use crate::thread::SchedulingCell;

/// State of one processor.
#[derive(Debug, Clone, Copy)]
pub struct PerCpu {
    /// The processor takes part in the system.
    pub online: bool,
    /// Owning scheduler instance, if any.
    pub scheduler: Option<SchedulerId>,
    /// Idle thread of this processor.
    pub idle: ThreadId,
    /// Thread currently executing.
    pub executing: ThreadId,
    /// Thread to execute at the next dispatch.
    pub heir: ThreadId,
    /// `heir` differs from `executing`.
    pub dispatch_necessary: bool,
}

/// Table of all configured processors plus the pending help requests.
///
/// Per-processor locks rank below scheduler instance locks and scheduling
/// cells. The help list is a leaf lock.
pub struct Processors {
    cpus: Box<[SpinLock<PerCpu>]>,
    help: SpinLock<Vec<SchedulingCell>>,
}

impl Processors {
    /// Creates the table. `idle` holds one idle thread per processor.
    pub fn new(online: ProcessorMask, idle: &[ThreadId]) -> Self {
        let cpus = idle
            .iter()
            .enumerate()
            .map(|(index, &idle)| {
                let cpu = CpuId::new(u32::try_from(index).unwrap_or(u32::MAX));
                SpinLock::named(
                    "percpu",
                    PerCpu {
                        online: online.contains(cpu),
                        scheduler: None,
                        idle,
                        executing: idle,
                        heir: idle,
                        dispatch_necessary: false,
                    },
                )
            })
            .collect();
        Self {
            cpus,
            help: SpinLock::named("percpu.help", Vec::new()),
        }
    }

    /// Number of configured processors.
    pub fn count(&self) -> usize {
        self.cpus.len()
    }

    /// Returns `true` if `cpu` is a configured processor.
    pub fn is_configured(&self, cpu: CpuId) -> bool {
        cpu.as_usize() < self.cpus.len()
    }

    /// Snapshot of one processor.
    pub fn get(&self, cpu: CpuId) -> Option<PerCpu> {
        self.cpus.get(cpu.as_usize()).map(|c| *c.lock())
    }

    /// Online processors.
    pub fn online_mask(&self) -> ProcessorMask {
        let mut mask = ProcessorMask::empty();
        for (index, cpu) in self.cpus.iter().enumerate() {
            if cpu.lock().online {
                mask.set(CpuId::new(u32::try_from(index).unwrap_or(u32::MAX)));
            }
        }
        mask
    }

    /// Owning scheduler of `cpu`.
    pub fn scheduler(&self, cpu: CpuId) -> Option<SchedulerId> {
        self.get(cpu).and_then(|c| c.scheduler)
    }

    pub(crate) fn set_scheduler(&self, cpu: CpuId, scheduler: Option<SchedulerId>) {
        if let Some(c) = self.cpus.get(cpu.as_usize()) {
            c.lock().scheduler = scheduler;
        }
    }

    /// Makes `scheduler` the owner of an online, unowned processor.
    pub(crate) fn claim(&self, cpu: CpuId, scheduler: SchedulerId) -> Result<()> {
        let c = self.cpus.get(cpu.as_usize()).ok_or(Status::NotConfigured)?;
        let mut c = c.lock();
        if !c.online {
            return Err(Status::IncorrectState);
        }
        if c.scheduler.is_some() {
            return Err(Status::ResourceInUse);
        }
        c.scheduler = Some(scheduler);
        Ok(())
    }

    /// Idle thread of `cpu`.
    pub fn idle(&self, cpu: CpuId) -> Option<ThreadId> {
        self.get(cpu).map(|c| c.idle)
    }

    /// Heir of `cpu`.
    pub fn heir(&self, cpu: CpuId) -> Option<ThreadId> {
        self.get(cpu).map(|c| c.heir)
    }

    /// Thread executing on `cpu`.
    pub fn executing(&self, cpu: CpuId) -> Option<ThreadId> {
        self.get(cpu).map(|c| c.executing)
    }

    /// Makes `thread` the heir of `cpu`. Returns `true` if the heir changed.
    pub(crate) fn update_heir(&self, cpu: CpuId, thread: ThreadId) -> bool {
        let Some(c) = self.cpus.get(cpu.as_usize()) else {
            debug_assert!(false, "heir update for unknown processor {cpu}");
            return false;
        };
        let mut c = c.lock();
        if c.heir == thread {
            return false;
        }
        c.heir = thread;
        c.dispatch_necessary = c.heir != c.executing;
        true
    }

    /// Performs a thread dispatch on `cpu`: the heir becomes the executing
    /// thread. Returns the now executing thread.
    pub fn dispatch(&self, cpu: CpuId) -> Option<ThreadId> {
        let mut c = self.cpus.get(cpu.as_usize())?.lock();
        c.executing = c.heir;
        c.dispatch_necessary = false;
        Some(c.executing)
    }

    /// Queues a help request for a thread that lost its processor while it
    /// still has helping scheduler nodes.
    pub(crate) fn request_help(&self, cell: SchedulingCell) {
        self.help.lock().push(cell);
    }

    /// Takes the oldest pending help request.
    pub(crate) fn next_help_request(&self) -> Option<SchedulingCell> {
        let mut help = self.help.lock();
        if help.is_empty() {
            None
        } else {
            Some(help.remove(0))
        }
    }
}
