//! Software timers and the timer wheel
//!
//! One ordered list carries every time-driven wakeup in the system, sorted
//! by absolute wake tick with ties in arrival order. Entries are tagged:
//! a user timer firing a callback, a blocked thread whose wait has a
//! timeout, or a shared-context timer posting a pre-stored message. The
//! tick handler walks the head of the list and services everything due.
//!
//! Callbacks run in tick-interrupt context and must be ISR-safe. A callback
//! returning true re-arms the timer at its interval.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex as SpinMutex;

use crate::kern::context::ContextMessage;
use crate::kern::list::List;
use crate::kern::queue::Queue;
use crate::kern::sched;
use crate::kern::tick;
use crate::types::ThreadId;

/// User timer callback; runs in tick-interrupt context. Returning true
/// re-arms the timer for another interval.
pub type TimerCallback = fn(usize) -> bool;

// ============================================================================
// Timer Cores
// ============================================================================

/// Shared state of a user software timer.
struct TimerCore {
    callback: TimerCallback,
    user: AtomicUsize,
    interval: AtomicU64,
    /// Bumped on set/reset/cancel; wheel entries carry the value they were
    /// armed with and fire only if it still matches.
    generation: AtomicU32,
}

/// Shared state of a shared-context timer.
pub(crate) struct CtxTimerCore {
    pub(crate) interval: AtomicU64,
    pub(crate) msg: SpinMutex<Option<ContextMessage>>,
    pub(crate) generation: AtomicU32,
}

impl CtxTimerCore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            interval: AtomicU64::new(0),
            msg: SpinMutex::new(None),
            generation: AtomicU32::new(0),
        })
    }
}

// ============================================================================
// Wheel Entries
// ============================================================================

/// What to do when an entry expires.
enum TimerKind {
    /// Invoke a user timer callback
    Software { core: Arc<TimerCore>, generation: u32 },
    /// Wake a thread blocked with a timeout
    ThreadTimeout(ThreadId),
    /// Post a pre-stored message into a shared context, dropping it
    /// silently when the queue is full
    ContextMessage {
        core: Arc<CtxTimerCore>,
        generation: u32,
        queue: Queue<ContextMessage>,
    },
}

struct TimerEntry {
    wake_tick: u64,
    kind: TimerKind,
}

static WHEEL: spin::Once<SpinMutex<List<TimerEntry>>> = spin::Once::new();

fn wheel() -> &'static SpinMutex<List<TimerEntry>> {
    WHEEL.call_once(|| SpinMutex::new(List::new()))
}

/// Initialize the timer subsystem
pub fn init() {
    let _ = wheel();
}

fn insert(entry: TimerEntry) {
    wheel()
        .lock()
        .insert_sorted_by(entry, |a, b| a.wake_tick.cmp(&b.wake_tick));
}

/// True while any entry is armed; feeds the tick-reduction decision.
pub(crate) fn any_armed() -> bool {
    !wheel().lock().is_empty()
}

// ============================================================================
// Wheel Service
// ============================================================================

/// Service every entry due at `now`. Tick-handler entry only. Expired
/// entries are collected first so their actions run without the wheel lock,
/// letting callbacks re-arm timers.
pub(crate) fn process(now: u64) {
    let mut due = Vec::new();
    {
        let mut wheel = wheel().lock();
        while wheel.front().is_some_and(|e| e.wake_tick <= now) {
            if let Some(entry) = wheel.pop_front() {
                due.push(entry);
            }
        }
    }

    for entry in due {
        match entry.kind {
            TimerKind::Software { core, generation } => {
                if core.generation.load(Ordering::Acquire) != generation {
                    continue; // re-set or cancelled after this entry was armed
                }
                let again = (core.callback)(core.user.load(Ordering::Relaxed));
                if again {
                    let interval = core.interval.load(Ordering::Relaxed);
                    insert(TimerEntry {
                        wake_tick: now + interval,
                        kind: TimerKind::Software { core, generation },
                    });
                }
            }
            TimerKind::ThreadTimeout(id) => sched::timeout_wake(id),
            TimerKind::ContextMessage {
                core,
                generation,
                queue,
            } => {
                if core.generation.load(Ordering::Acquire) != generation {
                    continue;
                }
                let msg = *core.msg.lock();
                if let Some(msg) = msg {
                    // Best effort: the context polls its timers' health.
                    let _ = queue.try_send(msg);
                }
            }
        }
    }
}

// ============================================================================
// Thread Timeout Entries
// ============================================================================

/// Arm a timeout entry for a blocked thread. Scheduler-side use.
pub(crate) fn arm_thread_timeout(id: ThreadId, wake_tick: u64) {
    insert(TimerEntry {
        wake_tick,
        kind: TimerKind::ThreadTimeout(id),
    });
}

/// Remove a thread's timeout entry; called on every wake path so the entry
/// never outlives the wait.
pub(crate) fn cancel_thread_timeout(id: ThreadId) {
    let _ = wheel()
        .lock()
        .remove_first_where(|e| matches!(e.kind, TimerKind::ThreadTimeout(t) if t == id));
}

// ============================================================================
// Context Timer Entries
// ============================================================================

pub(crate) fn arm_context_message(
    core: &Arc<CtxTimerCore>,
    queue: Queue<ContextMessage>,
    wake_tick: u64,
) {
    let generation = core.generation.load(Ordering::Acquire);
    insert(TimerEntry {
        wake_tick,
        kind: TimerKind::ContextMessage {
            core: Arc::clone(core),
            generation,
            queue,
        },
    });
}

pub(crate) fn cancel_context_message(core: &Arc<CtxTimerCore>) {
    let _ = wheel().lock().remove_first_where(
        |e| matches!(&e.kind, TimerKind::ContextMessage { core: c, .. } if Arc::ptr_eq(c, core)),
    );
}

// ============================================================================
// User Timer
// ============================================================================

/// A software timer driven by the system tick.
#[derive(Clone)]
pub struct Timer {
    core: Arc<TimerCore>,
}

impl Timer {
    /// Create a disarmed timer with its callback.
    pub fn new(callback: TimerCallback) -> Self {
        Self {
            core: Arc::new(TimerCore {
                callback,
                user: AtomicUsize::new(0),
                interval: AtomicU64::new(0),
                generation: AtomicU32::new(0),
            }),
        }
    }

    /// Arm the timer to fire `ticks` from now, replacing any earlier arming.
    pub fn set(&self, ticks: u64, user: usize) {
        self.core.user.store(user, Ordering::Relaxed);
        self.core.interval.store(ticks, Ordering::Relaxed);
        self.rearm(ticks);
    }

    /// Re-arm with the stored interval and user pointer.
    pub fn reset(&self) {
        let ticks = self.core.interval.load(Ordering::Relaxed);
        self.rearm(ticks);
    }

    /// Disarm the timer.
    pub fn cancel(&self) {
        self.core.generation.fetch_add(1, Ordering::AcqRel);
        self.remove_entry();
    }

    fn rearm(&self, ticks: u64) {
        let generation = self.core.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.remove_entry();
        insert(TimerEntry {
            wake_tick: tick::now() + ticks,
            kind: TimerKind::Software {
                core: Arc::clone(&self.core),
                generation,
            },
        });
    }

    fn remove_entry(&self) {
        let _ = wheel().lock().remove_first_where(
            |e| matches!(&e.kind, TimerKind::Software { core, .. } if Arc::ptr_eq(core, &self.core)),
        );
    }
}

#[cfg(test)]
pub(crate) fn test_clear() {
    wheel().lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::test_support;
    use core::sync::atomic::AtomicU32 as TestCounter;

    static FIRED: TestCounter = TestCounter::new(0);

    fn count_fire(_user: usize) -> bool {
        FIRED.fetch_add(1, Ordering::SeqCst);
        false
    }

    fn periodic_fire(_user: usize) -> bool {
        FIRED.fetch_add(1, Ordering::SeqCst);
        true
    }

    #[test]
    fn test_expiry_order_with_ties() {
        let _g = test_support::lock();
        test_support::reset();

        let base = tick::now();
        arm_thread_timeout(ThreadId(3), base + 5);
        arm_thread_timeout(ThreadId(1), base + 2);
        arm_thread_timeout(ThreadId(2), base + 5);

        let order: Vec<u64> = wheel().lock().iter().map(|e| e.wake_tick).collect();
        assert_eq!(order, [base + 2, base + 5, base + 5]);

        // Equal wake ticks keep arrival order.
        let ids: Vec<ThreadId> = wheel()
            .lock()
            .iter()
            .filter_map(|e| match e.kind {
                TimerKind::ThreadTimeout(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, [ThreadId(1), ThreadId(3), ThreadId(2)]);
    }

    #[test]
    fn test_one_shot_fires_once() {
        let _g = test_support::lock();
        test_support::reset();
        FIRED.store(0, Ordering::SeqCst);

        let t = Timer::new(count_fire);
        t.set(3, 0);
        let base = tick::now();

        process(base + 2);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        process(base + 3);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        process(base + 10);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert!(!any_armed());
    }

    #[test]
    fn test_periodic_rearms() {
        let _g = test_support::lock();
        test_support::reset();
        FIRED.store(0, Ordering::SeqCst);

        let t = Timer::new(periodic_fire);
        t.set(2, 0);
        let base = tick::now();

        process(base + 2);
        process(base + 4);
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);
        assert!(any_armed());

        t.cancel();
        process(base + 6);
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_disarms() {
        let _g = test_support::lock();
        test_support::reset();
        FIRED.store(0, Ordering::SeqCst);

        let t = Timer::new(count_fire);
        t.set(1, 0);
        t.cancel();
        assert!(!any_armed());
        process(tick::now() + 5);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
    }
}
