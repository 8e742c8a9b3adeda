//! System configuration.
//!
//! A [`SystemConfig`] describes the scheduler table and which processor
//! each scheduler instance starts with. It is consumed once by
//! [`System::new`](crate::System::new); afterward the scheduler table is
//! immutable and only processor ownership can change, through
//! `add_processor` / `remove_processor`.

use alloc::vec::Vec;

use kestrel_core::cpumask::{MAX_PROCESSORS, ProcessorMask};
use kestrel_core::id::CpuId;
use kestrel_core::{Result, Status};

/// Scheduling algorithm of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Fixed-priority, FIFO within a priority level.
    Priority,
    /// Earliest deadline first; threads without a job run in the background
    /// by fixed priority.
    Edf,
    /// Fixed-priority over a single ordered ready list. Threads scheduled by
    /// a simple instance never receive help from it.
    Simple,
}

/// One entry of the scheduler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Instance name, used by `System::ident`.
    pub name: &'static str,
    /// Algorithm of the instance.
    pub algorithm: Algorithm,
    /// The least urgent priority. Reserved for idle threads; user threads
    /// must use a more urgent value.
    pub maximum_priority: u64,
}

impl SchedulerConfig {
    /// A fixed-priority instance.
    pub const fn priority(name: &'static str, maximum_priority: u64) -> Self {
        Self {
            name,
            algorithm: Algorithm::Priority,
            maximum_priority,
        }
    }

    /// An EDF instance.
    pub const fn edf(name: &'static str, maximum_priority: u64) -> Self {
        Self {
            name,
            algorithm: Algorithm::Edf,
            maximum_priority,
        }
    }

    /// A simple instance.
    pub const fn simple(name: &'static str, maximum_priority: u64) -> Self {
        Self {
            name,
            algorithm: Algorithm::Simple,
            maximum_priority,
        }
    }
}

/// Initial owner of one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorAssignment {
    /// Index into the scheduler table.
    pub scheduler: usize,
    /// A mandatory processor must be online at system start.
    pub mandatory: bool,
}

/// Scheduler table plus processor assignments.
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    schedulers: Vec<SchedulerConfig>,
    assignments: Vec<Option<ProcessorAssignment>>,
    online: Option<ProcessorMask>,
}

impl SystemConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// A single processor owned by a single scheduler.
    pub fn uniprocessor(scheduler: SchedulerConfig) -> Self {
        Self::new().scheduler(scheduler).assign(0, true)
    }

    /// Appends a scheduler to the table.
    #[must_use]
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.schedulers.push(config);
        self
    }

    /// Adds the next processor, owned initially by `scheduler`.
    #[must_use]
    pub fn assign(mut self, scheduler: usize, mandatory: bool) -> Self {
        self.assignments.push(Some(ProcessorAssignment {
            scheduler,
            mandatory,
        }));
        self
    }

    /// Adds the next processor without an initial owner.
    #[must_use]
    pub fn unassigned(mut self) -> Self {
        self.assignments.push(None);
        self
    }

    /// Sets the online processors. Defaults to every configured processor.
    #[must_use]
    pub fn online(mut self, online: ProcessorMask) -> Self {
        self.online = Some(online);
        self
    }

    /// Configured scheduler table.
    pub fn schedulers(&self) -> &[SchedulerConfig] {
        &self.schedulers
    }

    /// Per-processor assignments.
    pub fn assignments(&self) -> &[Option<ProcessorAssignment>] {
        &self.assignments
    }

    /// Number of configured processors.
    pub fn processor_count(&self) -> usize {
        self.assignments.len()
    }

    /// Online processors, restricted to configured ones.
    pub fn online_processors(&self) -> ProcessorMask {
        let configured = ProcessorMask::all(self.processor_count());
        self.online.unwrap_or(configured).and(configured)
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.schedulers.is_empty() {
            return Err(Status::NotConfigured);
        }
        let count = self.processor_count();
        if count == 0 || count > MAX_PROCESSORS {
            return Err(Status::InvalidNumber);
        }
        if self.schedulers.iter().any(|s| s.maximum_priority == 0) {
            return Err(Status::InvalidPriority);
        }
        let online = self.online_processors();
        for (index, assignment) in self.assignments.iter().enumerate() {
            let Some(assignment) = assignment else {
                continue;
            };
            if assignment.scheduler >= self.schedulers.len() {
                return Err(Status::InvalidId);
            }
            let cpu = CpuId::new(u32::try_from(index).map_err(|_| Status::InvalidNumber)?);
            if assignment.mandatory && !online.contains(cpu) {
                return Err(Status::NotConfigured);
            }
        }
        Ok(())
    }
}
