//! Counting semaphores and 32-bit signals
//!
//! Both primitives share one inner layout: a value word, a priority-ordered
//! pend queue, and an event flag. A semaphore counts credits; a signal
//! treats the word as a gang of 32 binary semaphores raised by bitwise OR
//! and consumed by an atomic read-and-clear.
//!
//! The raise side is ISR-safe and never touches run queues. It updates the
//! value under the interrupt mask and, when someone is pending, posts the
//! primitive onto the global event ring exactly once (the `queued` flag
//! makes re-posting idempotent). The scheduler drains that ring at the top
//! of every pass and performs the run-queue transitions there.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex as SpinMutex;

use crate::arch;
use crate::config::EVENT_QUEUE_DEPTH;
use crate::kern::fifo::SpscRing;
use crate::kern::kernel_fault;
use crate::kern::list::List;
use crate::kern::sched;
use crate::kern::thread::{self, BlockedOn, ThreadState};
use crate::kern::tick;
use crate::kern::timer;
use crate::types::ThreadId;

// ============================================================================
// Shared Inner Layout
// ============================================================================

/// How the value word is consumed on a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SemKind {
    /// Decrement one credit
    Counting,
    /// Read and clear the whole bitmask
    Signal,
}

pub(crate) struct SemState {
    pub(crate) value: u32,
    /// Pending threads, highest priority first, FIFO among equals.
    pub(crate) pend: List<ThreadId>,
}

pub(crate) struct SemInner {
    pub(crate) state: SpinMutex<SemState>,
    /// True while this primitive sits on the event ring.
    queued: AtomicBool,
    kind: SemKind,
}

impl SemInner {
    fn new(initial: u32, kind: SemKind) -> Arc<Self> {
        Arc::new(Self {
            state: SpinMutex::new(SemState {
                value: initial,
                pend: List::new(),
            }),
            queued: AtomicBool::new(false),
            kind,
        })
    }
}

// ============================================================================
// ISR Event Queue
// ============================================================================

/// Primitives whose value changed from interrupt context, drained by the
/// scheduler. Writers run under the interrupt mask; the scheduler is the
/// only reader.
static EVENT_QUEUE: SpscRing<Arc<SemInner>, EVENT_QUEUE_DEPTH> = SpscRing::new();

/// Post a primitive onto the event ring unless it is already there.
fn post_event(inner: &Arc<SemInner>) {
    if inner.queued.swap(true, Ordering::AcqRel) {
        return;
    }
    if EVENT_QUEUE.push(Arc::clone(inner)).is_err() {
        inner.queued.store(false, Ordering::Release);
        kernel_fault("event queue overflow");
    }
}

/// Drain the event ring, promoting pending threads to their run queues.
/// Scheduler entry only.
pub(crate) fn drain_events() {
    while let Some(inner) = EVENT_QUEUE.pop() {
        inner.queued.store(false, Ordering::Release);
        service_event(&inner);
    }
}

/// Promote pending threads, consuming the value on their behalf: one credit
/// per waiter for a counting semaphore, the whole bitmask for a signal's
/// single reader. Handing the credit over here keeps increments totally
/// ordered with their matching decrements and empties the pend queue as far
/// as the value covers.
fn service_event(inner: &Arc<SemInner>) {
    sched::with_sched(|s| {
        let mut st = inner.state.lock();
        loop {
            let granted = match inner.kind {
                SemKind::Counting => {
                    if st.value == 0 || st.pend.is_empty() {
                        break;
                    }
                    st.value -= 1;
                    1
                }
                SemKind::Signal => {
                    if st.value == 0 || st.pend.is_empty() {
                        break;
                    }
                    core::mem::take(&mut st.value)
                }
            };
            let id = match st.pend.pop_front() {
                Some(id) => id,
                None => break,
            };
            wake_waiter(s, id, granted);
        }
    });
}

/// Move a formerly pending thread back onto its run queue with its credit.
fn wake_waiter(s: &mut sched::Scheduler, id: ThreadId, granted: u32) {
    let th = match thread::find(id) {
        Some(th) => th,
        None => return,
    };
    if th.state() == ThreadState::WaitForSemOrTick {
        timer::cancel_thread_timeout(id);
    }
    th.set_blocked_on(None);
    th.grant_wake(granted);
    th.set_state(ThreadState::Runnable);
    s.enqueue(id, th.effective_priority());
}

// ============================================================================
// Blocking Wait Machinery
// ============================================================================

/// Take the value if possible, otherwise pend the current thread. Returns
/// the consumed value. All run-queue and pend-queue motion happens under
/// the scheduler lock.
fn acquire_or_pend(
    inner: &Arc<SemInner>,
    deadline: Option<u64>,
    take: fn(&mut u32) -> Option<u32>,
) -> Option<u32> {
    sched::with_sched(|s| {
        let mut st = inner.state.lock();
        if let Some(v) = take(&mut st.value) {
            return Some(v);
        }
        let me = s.current();
        if me.is_idle() {
            // Boot context cannot pend; the caller's retry loop polls.
            return None;
        }
        if !st.pend.any(|&t| t == me) {
            st.pend.insert_sorted_by(me, |a, b| {
                thread::effective_priority(*a).cmp(&thread::effective_priority(*b))
            });
        }
        if let Some(th) = thread::find(me) {
            th.set_blocked_on(Some(BlockedOn::Sem(Arc::clone(inner))));
            match deadline {
                Some(d) => {
                    th.set_state(ThreadState::WaitForSemOrTick);
                    timer::arm_thread_timeout(me, d);
                }
                None => th.set_state(ThreadState::WaitForSem),
            }
        }
        s.dequeue(me);
        None
    })
}

fn take_credit(value: &mut u32) -> Option<u32> {
    if *value > 0 {
        *value -= 1;
        Some(1)
    } else {
        None
    }
}

fn take_bits(value: &mut u32) -> Option<u32> {
    if *value != 0 {
        Some(core::mem::take(value))
    } else {
        None
    }
}

/// Common raise path: update the value under the interrupt mask, post the
/// event if anyone is pending, and ask for a scheduler pass when the head
/// waiter outranks the running thread.
fn raise_common(inner: &Arc<SemInner>, apply: impl FnOnce(&mut u32)) {
    let head = {
        let _mask = arch::InterruptGuard::new();
        let mut st = inner.state.lock();
        apply(&mut st.value);
        let head = st.pend.front().copied();
        if head.is_some() {
            post_event(inner);
        }
        head
    };
    if let Some(waiter) = head {
        let running = sched::current_thread_id();
        if thread::effective_priority(waiter) < thread::effective_priority(running) {
            arch::request_reschedule();
        }
    }
}

// ============================================================================
// Counting Semaphore
// ============================================================================

/// A counting semaphore
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemInner>,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            inner: SemInner::new(initial, SemKind::Counting),
        }
    }

    /// Snapshot of the current value.
    pub fn value(&self) -> u32 {
        self.inner.state.lock().value
    }

    /// Take one credit without blocking. ISR-safe.
    pub fn try_take(&self) -> bool {
        let _mask = arch::InterruptGuard::new();
        let mut st = self.inner.state.lock();
        take_credit(&mut st.value).is_some()
    }

    /// Post one credit. ISR-safe; never touches run queues.
    pub fn increment(&self) {
        raise_common(&self.inner, |v| *v = v.saturating_add(1));
    }

    /// Block until a credit is available.
    pub fn wait(&self) {
        let th = thread::find(sched::current_thread_id());
        loop {
            if acquire_or_pend(&self.inner, None, take_credit).is_some() {
                return;
            }
            sched::yield_now();
            // The event drain may have handed us the credit directly.
            if let Some(th) = th.as_deref() {
                if th.take_granted().is_some() {
                    return;
                }
            }
        }
    }

    /// Block until a credit is available or `ticks` elapse. Returns false on
    /// timeout. Zero ticks yields once and checks immediately.
    pub fn wait_or_timeout(&self, ticks: u64) -> bool {
        let th = thread::find(sched::current_thread_id());
        let deadline = tick::now() + ticks;
        loop {
            if acquire_or_pend(&self.inner, Some(deadline), take_credit).is_some() {
                if let Some(th) = th.as_deref() {
                    th.take_timed_out();
                }
                return true;
            }
            sched::yield_now();
            if let Some(th) = th.as_deref() {
                if th.take_granted().is_some() {
                    th.take_timed_out();
                    return true;
                }
                if th.take_timed_out() {
                    return false;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn test_acquire_or_pend(&self, deadline: Option<u64>) -> bool {
        acquire_or_pend(&self.inner, deadline, take_credit).is_some()
    }

    #[cfg(test)]
    pub(crate) fn test_has_waiter(&self, id: ThreadId) -> bool {
        self.inner.state.lock().pend.any(|&t| t == id)
    }
}

// ============================================================================
// Signal
// ============================================================================

/// A 32-bit gang of binary semaphores: many writers, one reader.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SemInner>,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            inner: SemInner::new(0, SemKind::Signal),
        }
    }

    /// OR bits into the signal. ISR-safe; never touches run queues.
    pub fn raise(&self, bits: u32) {
        raise_common(&self.inner, |v| *v |= bits);
    }

    /// Raise a single channel bit. ISR-safe.
    pub fn raise_channel(&self, channel: u32) {
        self.raise(1 << channel);
    }

    /// Atomically read and clear the pending bits. ISR-safe, non-blocking.
    pub fn poll(&self) -> u32 {
        let _mask = arch::InterruptGuard::new();
        let mut st = self.inner.state.lock();
        core::mem::take(&mut st.value)
    }

    /// Block until any bit is raised; returns the pre-clear bitmask.
    pub fn wait(&self) -> u32 {
        let th = thread::find(sched::current_thread_id());
        loop {
            if let Some(bits) = acquire_or_pend(&self.inner, None, take_bits) {
                return bits;
            }
            sched::yield_now();
            if let Some(th) = th.as_deref() {
                if let Some(bits) = th.take_granted() {
                    return bits;
                }
            }
        }
    }

    /// Block until any bit is raised or `ticks` elapse.
    pub fn wait_or_timeout(&self, ticks: u64) -> Option<u32> {
        let th = thread::find(sched::current_thread_id());
        let deadline = tick::now() + ticks;
        loop {
            if let Some(bits) = acquire_or_pend(&self.inner, Some(deadline), take_bits) {
                if let Some(th) = th.as_deref() {
                    th.take_timed_out();
                }
                return Some(bits);
            }
            sched::yield_now();
            if let Some(th) = th.as_deref() {
                if let Some(bits) = th.take_granted() {
                    th.take_timed_out();
                    return Some(bits);
                }
                if th.take_timed_out() {
                    return None;
                }
            }
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn test_drain_ring() {
    while let Some(inner) = EVENT_QUEUE.pop() {
        inner.queued.store(false, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) fn event_ring_len() -> usize {
    EVENT_QUEUE.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::test_support;

    #[test]
    fn test_increment_then_take_leaves_value_unchanged() {
        let sem = Semaphore::new(2);
        sem.increment();
        assert!(sem.try_take());
        assert_eq!(sem.value(), 2);
    }

    #[test]
    fn test_try_take_exhausts_credits() {
        let sem = Semaphore::new(2);
        assert!(sem.try_take());
        assert!(sem.try_take());
        assert!(!sem.try_take());
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn test_raise_poll_roundtrip() {
        let sig = Signal::new();
        sig.raise(0b1010);
        sig.raise_channel(0);
        assert_eq!(sig.poll(), 0b1011);
        assert_eq!(sig.poll(), 0);
    }

    #[test]
    fn test_increment_without_waiters_posts_no_event() {
        let _g = test_support::lock();
        test_support::reset();

        let sem = Semaphore::new(0);
        sem.increment();
        assert_eq!(event_ring_len(), 0);
        assert_eq!(sem.value(), 1);
    }
}
