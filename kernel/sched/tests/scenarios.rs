//! End-to-end scenarios across schedulers, thread queues, and objects.
//!
//! Every test builds its own [`System`], so they run in parallel.
//!
//! Run with: `cargo test -p kestrel-sched --test scenarios`

#![cfg(not(any(loom, shuttle)))]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kestrel_core::Status;
use kestrel_core::cpumask::ProcessorMask;
use kestrel_core::id::{CpuId, SchedulerId};
use kestrel_sched::{
    Barrier, CeilingMutex, Discipline, Mutex, Priority, Protocol, QueueContext, Recursion,
    RecursiveMutex, SchedulerConfig, System, SystemConfig, Thread, ThreadQueue, WaitOutcome,
};

const A: SchedulerId = SchedulerId::new(0);
const B: SchedulerId = SchedulerId::new(1);

fn p(value: u64) -> Priority {
    Priority::new(value)
}

fn cpu(index: u32) -> CpuId {
    CpuId::new(index)
}

fn uniprocessor() -> Arc<System> {
    System::new(&SystemConfig::uniprocessor(SchedulerConfig::priority("UPD", 256))).unwrap()
}

fn same_scheduler(processors: u32) -> Arc<System> {
    let config = (0..processors).fold(
        SystemConfig::new().scheduler(SchedulerConfig::priority("A", 256)),
        |config, _| config.assign(0, true),
    );
    System::new(&config).unwrap()
}

fn two_schedulers() -> Arc<System> {
    let config = SystemConfig::new()
        .scheduler(SchedulerConfig::priority("A", 256))
        .scheduler(SchedulerConfig::priority("B", 256))
        .assign(0, true)
        .assign(1, false);
    System::new(&config).unwrap()
}

fn heirs(system: &System) -> Vec<Option<u32>> {
    (0..system.processors().count())
        .map(|index| {
            let index = u32::try_from(index).unwrap();
            system.heir(cpu(index)).map(|t| t.as_u32())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn ceiling_mutex_raises_owner_and_rejects_urgent_seize() {
    let sys = uniprocessor();
    let mutex = CeilingMutex::new(&sys, "ceiling", A, p(1), Recursion::Deadlock).unwrap();
    let owner = sys.spawn("owner", A, p(3)).unwrap();
    let mut ctx = QueueContext::new();

    assert_eq!(mutex.seize(&owner, true, &mut ctx), Ok(WaitOutcome::Satisfied));
    assert_eq!(owner.current_priority(), p(1));

    // A less urgent contender competes for the owned mutex like any waiter.
    let contender = sys.spawn("contender", A, p(2)).unwrap();
    assert_eq!(mutex.seize(&contender, false, &mut ctx), Err(Status::Unsatisfied));
    assert_eq!(mutex.seize(&contender, true, &mut ctx), Ok(WaitOutcome::Blocked));
    assert!(mutex.owner().is_some_and(|o| o.id() == owner.id()));

    assert_eq!(mutex.surrender(&owner, &mut ctx).unwrap().map(|t| t.id()), Some(contender.id()));
    assert_eq!(owner.current_priority(), p(3));
    assert_eq!(contender.current_priority(), p(1));
    assert_eq!(mutex.surrender(&contender, &mut ctx), Ok(None));

    // More urgent than the ceiling: rejected, the mutex stays unowned.
    let urgent = sys.spawn("urgent", A, p(0)).unwrap();
    assert_eq!(mutex.seize(&urgent, true, &mut ctx), Err(Status::MutexCeilingViolated));
    assert!(mutex.owner().is_none());
    assert_eq!(urgent.current_priority(), p(0));
}

#[test]
fn processor_moves_between_schedulers() {
    let sys = two_schedulers();
    assert_eq!(sys.scheduler_of_processor(cpu(1)), Ok(B));

    sys.remove_processor(B, cpu(1)).unwrap();
    assert_eq!(sys.processor_count(B), Ok(0));
    assert_eq!(sys.add_processor(A, cpu(1)), Ok(()));
    assert_eq!(sys.add_processor(A, cpu(1)), Err(Status::ResourceInUse));
    assert_eq!(sys.scheduler_processors(A), Ok(ProcessorMask::all(2)));

    let task = sys.spawn("task", A, p(5)).unwrap();
    sys.set_affinity(&task, ProcessorMask::single(cpu(1))).unwrap();
    assert_eq!(sys.get_processor(&task), Some(cpu(1)));

    // Processor 1 is the only one the task may use.
    assert_eq!(sys.remove_processor(A, cpu(1)), Err(Status::ResourceInUse));

    sys.set_affinity(&task, ProcessorMask::all(2)).unwrap();
    assert_eq!(sys.get_processor(&task), Some(cpu(1)));
    sys.remove_processor(A, cpu(1)).unwrap();
    assert_eq!(sys.get_processor(&task), Some(cpu(0)));
    assert_eq!(sys.scheduler_processors(A), Ok(ProcessorMask::single(cpu(0))));

    sys.add_processor(B, cpu(1)).unwrap();
    assert_eq!(sys.scheduler_of_processor(cpu(1)), Ok(B));
}

#[test]
fn inheritance_tracks_waiter_until_release() {
    let sys = uniprocessor();
    let mutex = RecursiveMutex::new("inherit", Protocol::Inherit, Recursion::Deadlock);
    let low = sys.spawn("low", A, p(10)).unwrap();
    let high = sys.spawn("high", A, p(4)).unwrap();
    let mut ctx = QueueContext::new();

    mutex.seize(&low, true, &mut ctx).unwrap();
    assert_eq!(mutex.seize(&high, true, &mut ctx), Ok(WaitOutcome::Blocked));
    assert_eq!(low.current_priority(), p(4));
    assert_eq!(low.real_priority(), p(10));
    assert_eq!(sys.heir(cpu(0)), Some(low.id()));

    mutex.surrender(&low, &mut ctx).unwrap();
    assert_eq!(low.current_priority(), p(10));
    assert!(mutex.owner().is_some_and(|o| o.id() == high.id()));
    assert_eq!(sys.heir(cpu(0)), Some(high.id()));

    mutex.surrender(&high, &mut ctx).unwrap();
    assert!(!mutex.is_locked());
}

#[test]
fn manual_barrier_release_reports_count() {
    let sys = uniprocessor();
    let barrier = Barrier::manual("manual");
    assert_eq!(barrier.release(), Ok(0));

    let mut ctx = QueueContext::new();
    let waiters: Vec<Arc<Thread>> = [5, 6, 7]
        .into_iter()
        .map(|prio| sys.spawn("waiter", A, p(prio)).unwrap())
        .collect();
    for waiter in &waiters {
        assert_eq!(barrier.wait(waiter, &mut ctx), Ok(WaitOutcome::Blocked));
    }
    assert_eq!(barrier.release(), Ok(waiters.len()));
    assert!(waiters.iter().all(|w| w.is_ready() && w.wait_result() == Some(Ok(()))));
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn at_most_one_owner_under_contention() {
    let sys = same_scheduler(4);
    let mutex = Arc::new(Mutex::new("contended", Discipline::Priority));
    let inside = Arc::new(AtomicBool::new(false));
    let acquired = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4u64)
        .map(|index| {
            let thread = sys.spawn("contender", A, p(10 + index)).unwrap();
            let mutex = Arc::clone(&mutex);
            let inside = Arc::clone(&inside);
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                let mut ctx = QueueContext::new();
                for _ in 0..500 {
                    if mutex.seize(&thread, false, &mut ctx).is_err() {
                        continue;
                    }
                    assert!(!inside.swap(true, Ordering::AcqRel));
                    acquired.fetch_add(1, Ordering::Relaxed);
                    inside.store(false, Ordering::Release);
                    assert_eq!(mutex.surrender(&thread, &mut ctx), Ok(None));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(acquired.load(Ordering::Relaxed) > 0);
    assert!(!mutex.is_locked());
}

#[test]
fn equal_priorities_leave_in_arrival_order() {
    let sys = uniprocessor();
    let queue = ThreadQueue::new("fair", Discipline::Priority);
    let owner = sys.spawn("owner", A, p(1)).unwrap();
    queue.lock().set_owner(Some(Arc::clone(&owner)));

    let mut ctx = QueueContext::new();
    let first = sys.spawn("first", A, p(6)).unwrap();
    let urgent = sys.spawn("urgent", A, p(2)).unwrap();
    let second = sys.spawn("second", A, p(6)).unwrap();
    let third = sys.spawn("third", A, p(6)).unwrap();
    for thread in [&first, &urgent, &second, &third] {
        queue.enqueue(thread, &mut ctx).unwrap();
    }

    let mut order = Vec::new();
    while let Some(next) = queue.surrender(&owner, &mut ctx) {
        order.push(next.name());
        queue.lock().set_owner(Some(Arc::clone(&owner)));
    }
    assert_eq!(order, ["urgent", "first", "second", "third"]);
}

#[test]
fn owned_ceiling_mutex_keeps_owner_at_ceiling() {
    let sys = uniprocessor();
    let mutex = CeilingMutex::new(&sys, "ceiling", A, p(5), Recursion::Allowed).unwrap();
    let owner = sys.spawn("owner", A, p(9)).unwrap();
    let mut ctx = QueueContext::new();

    mutex.seize(&owner, true, &mut ctx).unwrap();
    mutex.seize(&owner, true, &mut ctx).unwrap();
    assert!(!owner.current_priority().is_more_urgent_than(mutex.priority()));

    mutex.set_priority(p(3)).unwrap();
    assert!(!owner.current_priority().is_more_urgent_than(mutex.priority()));

    // Raising the real priority above the ceiling keeps the owner.
    sys.set_priority(&owner, p(1)).unwrap();
    assert_eq!(owner.current_priority(), p(1));
    assert!(mutex.owner().is_some_and(|o| o.id() == owner.id()));

    mutex.surrender(&owner, &mut ctx).unwrap();
    mutex.surrender(&owner, &mut ctx).unwrap();
    assert_eq!(owner.current_priority(), p(1));
    assert!(!mutex.is_locked());
}

#[test]
fn block_then_unblock_restores_heirs() {
    let sys = same_scheduler(2);
    let threads: Vec<Arc<Thread>> = [3, 5, 7]
        .into_iter()
        .map(|prio| sys.spawn("worker", A, p(prio)).unwrap())
        .collect();
    let before = heirs(&sys);

    for thread in &threads {
        sys.suspend(thread).unwrap();
        sys.resume(thread).unwrap();
        assert_eq!(heirs(&sys), before, "after suspending {}", thread.id());
    }
}

#[test]
fn timeout_racing_surrender_resolves_once() {
    for _ in 0..200 {
        let sys = same_scheduler(2);
        let mutex = Arc::new(Mutex::new("race", Discipline::Fifo));
        let owner = sys.spawn("owner", A, p(5)).unwrap();
        let waiter = sys.spawn("waiter", A, p(6)).unwrap();
        mutex.seize(&owner, true, &mut QueueContext::new()).unwrap();
        let mut ctx = QueueContext::new().with_timeout();
        assert_eq!(mutex.seize(&waiter, true, &mut ctx), Ok(WaitOutcome::Blocked));

        let surrender = {
            let mutex = Arc::clone(&mutex);
            let owner = Arc::clone(&owner);
            std::thread::spawn(move || mutex.surrender(&owner, &mut QueueContext::new()))
        };
        let timed_out = kestrel_sched::threadq::timeout(&waiter);
        let handed = surrender.join().unwrap().unwrap();

        let owns = mutex.owner().is_some_and(|o| o.id() == waiter.id());
        assert_eq!(handed.is_some(), owns);
        assert!(timed_out != owns);
        let expected = if owns { Ok(()) } else { Err(Status::Timeout) };
        assert_eq!(waiter.wait_result(), Some(expected));
        assert!(waiter.is_ready());
    }
}
