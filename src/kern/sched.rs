//! Scheduler core
//!
//! Single-CPU preemptive scheduling: one run queue per priority level,
//! round-robin inside a level, highest occupied level wins. Each pass
//! drains the ISR event ring first (the only path by which interrupts
//! influence scheduling), retires threads with a stop request, rotates the
//! slot that just ran to its queue tail, then scans priorities high to low.
//!
//! A selected thread that is blocked on a mutex is not skipped: the
//! scheduler follows the ownership chain and dispatches the first runnable
//! owner in the blocked thread's place, at the blocked thread's priority.
//! That substitution is the whole of priority inheritance.
//!
//! The pass ends with the tick-reduction decision: the periodic tick stays
//! enabled only while something needs it - round-robin peers at the chosen
//! level, armed timer-wheel entries, or an equal-priority ownership chain.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex as SpinMutex;

use crate::arch;
use crate::config::MAX_THREAD_PRIORITIES;
use crate::kern::kernel_fault;
use crate::kern::list::List;
use crate::kern::sem;
use crate::kern::thread::{self, BlockedOn, Thread, ThreadState};
use crate::kern::tick;
use crate::kern::timer;
use crate::types::{Priority, ThreadId};

// ============================================================================
// Scheduler State
// ============================================================================

pub(crate) struct Scheduler {
    /// One ready list per priority level; index 0 is the highest priority.
    run_queues: [List<ThreadId>; MAX_THREAD_PRIORITIES],
    /// Thread currently executing (after substitution); IDLE when none.
    current: ThreadId,
    /// Run-queue slot being burned; differs from `current` while an owner
    /// runs in a blocked thread's place.
    current_slot: ThreadId,
    /// Mirror of the tick control latch.
    tick_active: bool,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            run_queues: core::array::from_fn(|_| List::new()),
            current: ThreadId::IDLE,
            current_slot: ThreadId::IDLE,
            tick_active: true,
        }
    }

    pub(crate) fn current(&self) -> ThreadId {
        self.current
    }

    /// Append to the ready list for `pri`.
    pub(crate) fn enqueue(&mut self, id: ThreadId, pri: Priority) {
        self.run_queues[pri as usize].push_back(id);
    }

    /// Remove from whichever ready list holds `id`.
    pub(crate) fn dequeue(&mut self, id: ThreadId) -> bool {
        for queue in self.run_queues.iter_mut() {
            if queue.remove_first_where(|&t| t == id).is_some() {
                return true;
            }
        }
        false
    }

    fn queued(&self, id: ThreadId) -> bool {
        self.run_queues.iter().any(|q| q.any(|&t| t == id))
    }

    /// Round-robin step: move a slot to the tail of its current level.
    fn rotate_to_tail(&mut self, id: ThreadId, pri: Priority) {
        if self.dequeue(id) {
            self.enqueue(id, pri);
        }
    }
}

static SCHEDULER: spin::Once<SpinMutex<Scheduler>> = spin::Once::new();

fn scheduler() -> &'static SpinMutex<Scheduler> {
    SCHEDULER.call_once(|| SpinMutex::new(Scheduler::new()))
}

/// Run a closure under the scheduler lock. This lock guards every run
/// queue and pend queue transition in the kernel; interrupts are masked for
/// its duration so the single CPU can never take an ISR that spins on it.
pub(crate) fn with_sched<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let _mask = arch::InterruptGuard::new();
    f(&mut scheduler().lock())
}

/// Initialize the scheduler
pub fn init() {
    let _ = scheduler();
}

/// Id of the thread currently executing; IDLE before the scheduler starts
/// and whenever nothing is runnable.
pub fn current_thread_id() -> ThreadId {
    with_sched(|s| s.current)
}

// ============================================================================
// Thread Lifecycle
// ============================================================================

/// Release a created thread to the scheduler.
pub fn run_thread(th: &Arc<Thread>) {
    with_sched(|s| {
        if th.state() == ThreadState::NotStarted {
            th.set_state(ThreadState::Runnable);
            s.enqueue(th.id, th.effective_priority());
        }
    });
    // A higher-priority arrival preempts at the next scheduling point.
    let running = current_thread_id();
    if thread::effective_priority(th.id) < thread::effective_priority(running) {
        arch::request_reschedule();
    }
}

/// Terminate the calling thread; its stop handler runs before it reaches
/// Stopped. Returns on the host backend only.
pub fn exit_current(code: u32) {
    let me = current_thread_id();
    if me.is_idle() {
        kernel_fault("exit from boot context");
    }
    if let Some(th) = thread::find(me) {
        th.set_stop_code(code);
        th.set_state(ThreadState::StopRequest);
    }
    yield_now();
}

/// Force a thread into StopRequest. The scheduler unhooks it from any pend
/// queue or timer entry and runs its termination handler on its next pass.
pub fn kill_thread(id: ThreadId) {
    let th = match thread::find(id) {
        Some(th) => th,
        None => return,
    };
    with_sched(|s| {
        match th.state() {
            ThreadState::Stopped => return,
            ThreadState::WaitForSem | ThreadState::WaitForSemOrTick => {
                if let Some(BlockedOn::Sem(sem)) = th.blocked_on() {
                    let _ = sem.state.lock().pend.remove_first_where(|&t| t == id);
                }
                timer::cancel_thread_timeout(id);
            }
            ThreadState::WaitForTick => {
                timer::cancel_thread_timeout(id);
            }
            ThreadState::WaitForMutex => {
                if let Some(BlockedOn::Mutex(m)) = th.blocked_on() {
                    let _ = m.state.lock().pend.remove_first_where(|&t| t == id);
                }
            }
            _ => {}
        }
        th.set_blocked_on(None);
        th.set_state(ThreadState::StopRequest);
        if !s.queued(id) {
            s.enqueue(id, th.effective_priority());
        }
    });
    arch::request_reschedule();
}

/// Entry for the fault collaborator: a thread fault (stack overflow, bus
/// error) terminates the offending thread through the kill path so its
/// termination handler still runs. Faults taken outside any thread are
/// unrecoverable.
pub fn thread_fault() {
    let me = current_thread_id();
    if me.is_idle() {
        kernel_fault("fault outside any thread");
    }
    kill_thread(me);
    yield_now();
}

/// Wait until a thread reaches Stopped; returns its stop code.
pub fn wait_for_stop(id: ThreadId) -> u32 {
    loop {
        match thread::find(id) {
            None => return 0,
            Some(th) => {
                if th.state() == ThreadState::Stopped {
                    return th.stop_code();
                }
            }
        }
        yield_now();
    }
}

/// Change a thread's priority, repositioning it in its ready list or pend
/// queue. Nominal and effective move together; inheritance never touches
/// either.
pub fn set_thread_priority(id: ThreadId, pri: Priority) {
    if (pri as usize) >= MAX_THREAD_PRIORITIES {
        kernel_fault("thread priority out of range");
    }
    let th = match thread::find(id) {
        Some(th) => th,
        None => return,
    };
    with_sched(|s| {
        th.set_priority(pri);
        if s.dequeue(id) {
            s.enqueue(id, pri);
        }
        let by_pri = |a: &ThreadId, b: &ThreadId| {
            thread::effective_priority(*a).cmp(&thread::effective_priority(*b))
        };
        match th.blocked_on() {
            Some(BlockedOn::Sem(sem)) => {
                let mut st = sem.state.lock();
                if st.pend.remove_first_where(|&t| t == id).is_some() {
                    st.pend.insert_sorted_by(id, by_pri);
                }
            }
            Some(BlockedOn::Mutex(m)) => {
                let mut st = m.state.lock();
                if st.pend.remove_first_where(|&t| t == id).is_some() {
                    st.pend.insert_sorted_by(id, by_pri);
                }
            }
            None => {}
        }
    });
    arch::request_reschedule();
}

// ============================================================================
// Blocking Entry Points
// ============================================================================

/// Give up the CPU; a scheduler pass picks the next thread.
pub fn yield_now() {
    arch::yield_to_scheduler();
}

/// Sleep for `ticks`. Zero means yield now and return.
pub fn delay(ticks: u64) {
    if ticks == 0 {
        yield_now();
        return;
    }
    let me = current_thread_id();
    if me.is_idle() {
        kernel_fault("delay from boot context");
    }
    let deadline = tick::now() + ticks;
    with_sched(|s| {
        if let Some(th) = thread::find(me) {
            th.set_state(ThreadState::WaitForTick);
            timer::arm_thread_timeout(me, deadline);
        }
        s.dequeue(me);
    });
    yield_now();
}

/// Timer-wheel expiry for a blocked thread: mark the timeout (semaphore
/// waits only) and make it runnable again.
pub(crate) fn timeout_wake(id: ThreadId) {
    with_sched(|s| {
        let th = match thread::find(id) {
            Some(th) => th,
            None => return,
        };
        match th.state() {
            ThreadState::WaitForSemOrTick => {
                if let Some(BlockedOn::Sem(sem)) = th.blocked_on() {
                    let _ = sem.state.lock().pend.remove_first_where(|&t| t == id);
                }
                th.set_blocked_on(None);
                th.mark_timed_out();
            }
            ThreadState::WaitForTick => {}
            _ => return,
        }
        th.set_state(ThreadState::Runnable);
        s.enqueue(id, th.effective_priority());
    });
}

// ============================================================================
// Stop Finalization
// ============================================================================

/// Run a closure as if `id` were the executing thread. Termination handlers
/// run this way so `Mutex::restore` sees the dying thread as the caller.
pub(crate) fn run_as<R>(id: ThreadId, f: impl FnOnce() -> R) -> R {
    let prev = with_sched(|s| core::mem::replace(&mut s.current, id));
    let result = f();
    with_sched(|s| s.current = prev);
    result
}

/// Retire every thread with a pending stop request: unhook it, run its
/// termination handler at its current effective priority, record the stop
/// code and mark it Stopped.
fn finalize_stop_requests() {
    loop {
        let victim = with_sched(|s| {
            for queue in s.run_queues.iter_mut() {
                let found = queue.remove_first_where(|&id| {
                    thread::find(id).is_some_and(|t| t.state() == ThreadState::StopRequest)
                });
                if found.is_some() {
                    return found;
                }
            }
            None
        });
        let id = match victim {
            Some(id) => id,
            None => break,
        };
        let th = match thread::find(id) {
            Some(th) => th,
            None => continue,
        };
        th.set_blocked_on(None);
        let code = match th.stop_handler() {
            Some((handler, arg)) => run_as(id, || handler(arg)),
            None => th.stop_code(),
        };
        th.set_stop_code(code);
        th.set_state(ThreadState::Stopped);
    }
}

// ============================================================================
// Scheduling Pass
// ============================================================================

enum ChainEnd {
    /// Dispatch this thread; true if any hop had an equal-priority owner.
    Run(ThreadId, bool),
    /// The chain ends in a non-runnable thread; skip the candidate.
    Blocked,
    /// The candidate id no longer names a live, schedulable thread.
    Stale,
}

/// Follow a candidate's mutex-ownership chain to the thread that should
/// execute in its place. Arbitrary depth; a cycle is a deadlock and an
/// invariant violation.
fn resolve_chain(start: ThreadId) -> ChainEnd {
    let mut cur = start;
    let mut equal_pri = false;
    for _ in 0..(u16::MAX as usize) {
        let th = match thread::find(cur) {
            Some(th) => th,
            None => {
                return if cur == start {
                    ChainEnd::Stale
                } else {
                    ChainEnd::Blocked
                }
            }
        };
        match th.state() {
            ThreadState::Runnable => return ChainEnd::Run(cur, equal_pri),
            ThreadState::WaitForMutex => match th.blocked_on() {
                Some(BlockedOn::Mutex(m)) => match m.owner() {
                    Some(owner) if owner != cur => {
                        if thread::effective_priority(owner) == thread::effective_priority(cur) {
                            equal_pri = true;
                        }
                        cur = owner;
                    }
                    // Unowned: a release already promoted someone; settle
                    // next pass.
                    _ => return ChainEnd::Blocked,
                },
                _ => return ChainEnd::Blocked,
            },
            _ => {
                return if cur == start {
                    ChainEnd::Stale
                } else {
                    ChainEnd::Blocked
                }
            }
        }
    }
    kernel_fault("mutex ownership cycle");
}

/// One scheduling pass. Returns the dispatched thread, `None` for idle.
pub fn reschedule() -> Option<ThreadId> {
    // Step 1: the event ring is the only ISR input; drain it first.
    sem::drain_events();
    // Retire stop requests before selection.
    finalize_stop_requests();

    let _mask = arch::InterruptGuard::new();
    let mut s = scheduler().lock();

    // Step 2: round-robin - the slot that just burned its turn goes to the
    // tail of its level.
    let slot = s.current_slot;
    if !slot.is_idle() {
        if let Some(th) = thread::find(slot) {
            if matches!(
                th.state(),
                ThreadState::Runnable | ThreadState::WaitForMutex
            ) {
                s.rotate_to_tail(slot, th.effective_priority());
            }
        }
    }

    // Steps 3 and 4: scan high to low; substitute through ownership chains.
    let mut chosen = ThreadId::IDLE;
    let mut dispatch = ThreadId::IDLE;
    let mut equal_pri_chain = false;
    let mut peers_at_level = 0;

    'scan: for pri in 0..MAX_THREAD_PRIORITIES {
        if s.run_queues[pri].is_empty() {
            continue;
        }
        let candidates: Vec<ThreadId> = s.run_queues[pri].iter().copied().collect();
        for id in candidates {
            match resolve_chain(id) {
                ChainEnd::Run(target, equal) => {
                    chosen = id;
                    dispatch = target;
                    equal_pri_chain = equal;
                    peers_at_level = s.run_queues[pri].len();
                    break 'scan;
                }
                ChainEnd::Stale => {
                    let _ = s.run_queues[pri].remove_first_where(|&t| t == id);
                }
                ChainEnd::Blocked => {}
            }
        }
    }

    // Step 5: tick reduction - keep the periodic tick only while someone
    // needs it.
    let tick_needed = peers_at_level >= 2 || timer::any_armed() || equal_pri_chain;
    if tick_needed != s.tick_active {
        s.tick_active = tick_needed;
        arch::set_tick_enabled(tick_needed);
    }

    // Step 6: dispatch.
    s.current = dispatch;
    s.current_slot = chosen;
    let result = if dispatch.is_idle() {
        None
    } else {
        Some(dispatch)
    };
    drop(s);

    arch::note_dispatch(result);
    result
}

/// Periodic tick entry: advance time, service the timer wheel, reschedule.
pub fn tick_handler() {
    let now = tick::advance(1);
    timer::process(now);
    let _ = reschedule();
}

/// Hand the CPU to the scheduler after boot; does not return. An initial
/// pass picks the first thread and the switch stub drops into it.
#[cfg(target_os = "none")]
pub fn start() -> ! {
    let _ = reschedule();
    arch::start_first_thread()
}

#[cfg(test)]
pub(crate) fn test_reset() {
    sem::test_drain_ring();
    timer::test_clear();
    with_sched(|s| {
        for queue in s.run_queues.iter_mut() {
            queue.clear();
        }
        s.current = ThreadId::IDLE;
        s.current_slot = ThreadId::IDLE;
        s.tick_active = true;
    });
    thread::test_clear_table();
    arch::set_tick_enabled(true);
    arch::take_resched_request();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::mutex::Mutex;
    use crate::kern::sem::Semaphore;
    use crate::kern::test_support;

    fn spin_entry(_arg: usize) -> u32 {
        0
    }

    fn make(pri: Priority) -> Arc<Thread> {
        let th = thread::create(pri, spin_entry, 0, 64);
        run_thread(&th);
        th
    }

    #[test]
    fn test_highest_priority_wins() {
        let _g = test_support::lock();
        test_reset();

        let low = make(3);
        let high = make(1);
        assert_eq!(reschedule(), Some(high.id));
        assert_eq!(current_thread_id(), high.id);
        let _ = low;
    }

    #[test]
    fn test_round_robin_alternates_within_level() {
        let _g = test_support::lock();
        test_reset();

        let a = make(2);
        let b = make(2);

        let mut runs_a = 0u32;
        let mut runs_b = 0u32;
        for _ in 0..10 {
            let picked = reschedule().unwrap();
            if picked == a.id {
                runs_a += 1;
            } else if picked == b.id {
                runs_b += 1;
            }
        }
        assert_eq!(runs_a + runs_b, 10);
        assert!(runs_a.abs_diff(runs_b) <= 1);
    }

    #[test]
    fn test_idle_when_nothing_runnable() {
        let _g = test_support::lock();
        test_reset();

        assert_eq!(reschedule(), None);
        assert!(current_thread_id().is_idle());
    }

    #[test]
    fn test_tick_reduction_single_thread() {
        let _g = test_support::lock();
        test_reset();

        let _t = make(2);
        reschedule();
        // One runnable thread, no timers: the periodic tick goes quiet.
        assert!(!arch::tick_enabled());
    }

    #[test]
    fn test_tick_stays_on_for_round_robin_peers() {
        let _g = test_support::lock();
        test_reset();

        let _a = make(2);
        let _b = make(2);
        reschedule();
        assert!(arch::tick_enabled());
    }

    #[test]
    fn test_tick_stays_on_while_timer_armed() {
        let _g = test_support::lock();
        test_reset();

        let _t = make(2);
        delay_entry_for_test();
        reschedule();
        assert!(arch::tick_enabled());
    }

    fn delay_entry_for_test() {
        // An armed wheel entry for an unrelated thread id.
        timer::arm_thread_timeout(ThreadId(999), tick::now() + 50);
    }

    #[test]
    fn test_event_drain_promotes_semaphore_waiter() {
        let _g = test_support::lock();
        test_reset();

        let waiter = make(1);
        let sem = Semaphore::new(0);

        // Dispatch the waiter, then block it on the semaphore.
        assert_eq!(reschedule(), Some(waiter.id));
        assert!(!sem.test_acquire_or_pend(None));

        assert_eq!(reschedule(), None);
        assert_eq!(waiter.state(), ThreadState::WaitForSem);

        // An interrupt raises the credit: run queues stay untouched until
        // the next pass drains the event ring.
        sem.increment();
        assert_eq!(waiter.state(), ThreadState::WaitForSem);

        assert_eq!(reschedule(), Some(waiter.id));
        assert_eq!(waiter.state(), ThreadState::Runnable);
        // The credit was handed over with the wake.
        assert_eq!(waiter.take_granted(), Some(1));
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn test_semaphore_credit_and_fifo_wake_order() {
        let _g = test_support::lock();
        test_reset();

        let sem = Semaphore::new(3);
        let t1 = make(2);
        let t2 = make(2);
        let t3 = make(2);
        let t4 = make(2);
        let t5 = make(2);

        // Three credits satisfy the first three without blocking.
        for th in [&t1, &t2, &t3] {
            run_as_thread(th.id, || assert!(sem.try_take()));
        }
        // The next two pend, equal priority, arrival order.
        run_as_thread(t4.id, || assert!(!sem.test_acquire_or_pend(None)));
        run_as_thread(t5.id, || assert!(!sem.test_acquire_or_pend(None)));
        assert_eq!(t4.state(), ThreadState::WaitForSem);
        assert_eq!(t5.state(), ThreadState::WaitForSem);

        sem.increment();
        reschedule();
        assert_eq!(t4.state(), ThreadState::Runnable);
        assert_eq!(t5.state(), ThreadState::WaitForSem);

        sem.increment();
        reschedule();
        assert_eq!(t5.state(), ThreadState::Runnable);
    }

    #[test]
    fn test_priority_inversion_resolved_by_substitution() {
        let _g = test_support::lock();
        test_reset();

        // Threads high (0), mid (1), low (2); low owns the mutex.
        let low = make(2);
        let mutex = Mutex::new();
        run_as_thread(low.id, || mutex.lock());

        let high = make(0);
        let mid = make(1);

        // High contends for the mutex and blocks.
        run_as_thread(high.id, || {
            assert!(!try_grab_for_test(&mutex));
        });
        assert_eq!(high.state(), ThreadState::WaitForMutex);

        // The scheduler selects high's slot but runs low in its place;
        // mid must not get the CPU while high is entitled to it.
        assert_eq!(reschedule(), Some(low.id));

        // Low releases; high wins the mutex slot and the CPU.
        run_as_thread(low.id, || mutex.unlock());
        assert_eq!(high.state(), ThreadState::Runnable);
        assert_eq!(reschedule(), Some(high.id));
        run_as_thread(high.id, || assert!(mutex.try_lock()));

        // Mid finally runs once high blocks or finishes its turn.
        run_as_thread(high.id, || {
            mutex.unlock();
        });
        kill_thread(high.id);
        assert_eq!(reschedule(), Some(mid.id));
    }

    #[test]
    fn test_equal_priority_contention_keeps_tick() {
        let _g = test_support::lock();
        test_reset();

        let owner = make(2);
        let mutex = Mutex::new();
        run_as_thread(owner.id, || mutex.lock());

        let waiter = make(2);
        run_as_thread(waiter.id, || {
            assert!(!try_grab_for_test(&mutex));
        });

        assert_eq!(reschedule(), Some(owner.id));
        assert!(arch::tick_enabled());
    }

    #[test]
    fn test_kill_while_blocked_on_mutex() {
        let _g = test_support::lock();
        test_reset();

        let low = make(2);
        let mutex = Mutex::new();
        run_as_thread(low.id, || mutex.lock());

        let high = make(0);
        high.set_stop_handler(stop_handler_42, 0);
        run_as_thread(high.id, || {
            assert!(!try_grab_for_test(&mutex));
        });

        kill_thread(high.id);
        reschedule();

        assert_eq!(high.state(), ThreadState::Stopped);
        assert_eq!(wait_for_stop(high.id), 42);
        // Ownership is unaffected and the pend queue no longer holds high.
        assert_eq!(mutex.owner(), Some(low.id));
        run_as_thread(low.id, || mutex.unlock());
        assert_eq!(mutex.owner(), None);
    }

    fn stop_handler_42(_arg: usize) -> u32 {
        42
    }

    #[test]
    fn test_delay_parks_until_tick() {
        let _g = test_support::lock();
        test_reset();

        let th = make(2);
        assert_eq!(reschedule(), Some(th.id));

        run_as_thread(th.id, || delay(3));
        assert_eq!(th.state(), ThreadState::WaitForTick);
        assert_eq!(reschedule(), None);

        tick_handler();
        tick_handler();
        assert_eq!(th.state(), ThreadState::WaitForTick);
        tick_handler();
        assert_eq!(th.state(), ThreadState::Runnable);
        assert_eq!(current_thread_id(), th.id);
    }

    #[test]
    fn test_timeout_wake_sets_flag_and_clears_pend() {
        let _g = test_support::lock();
        test_reset();

        let th = make(1);
        let sem = Semaphore::new(0);
        assert_eq!(reschedule(), Some(th.id));

        // Block with a 10-tick timeout; nobody increments.
        run_as_thread(th.id, || {
            assert!(!sem.test_acquire_or_pend(Some(tick::now() + 10)));
        });
        assert_eq!(th.state(), ThreadState::WaitForSemOrTick);

        for _ in 0..10 {
            tick_handler();
        }
        assert_eq!(th.state(), ThreadState::Runnable);
        assert!(th.take_timed_out());
        assert_eq!(sem.value(), 0);
        assert!(!sem.test_has_waiter(th.id));
    }

    // === test plumbing over crate-private pieces ===

    fn run_as_thread<R>(id: ThreadId, f: impl FnOnce() -> R) -> R {
        run_as(id, f)
    }

    fn try_grab_for_test(m: &Mutex) -> bool {
        // The polling lock loop would spin on the host; one acquisition
        // attempt models the block-and-yield step.
        m.test_grab_or_pend()
    }
}
