//! Host backend: the architecture contract over plain atomics
//!
//! Used on any target with an operating system, which in practice means the
//! unit-test build. Nothing here touches hardware; the point is that every
//! side effect the kernel would have on the machine (masking, tick control,
//! pended scheduler traps) is recorded where a test can read it back.

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::types::ThreadId;

/// Interrupt-mask nesting depth. Nonzero means masked.
static MASK_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Latched state of the periodic tick control register.
static TICK_ENABLED: AtomicBool = AtomicBool::new(true);

/// Set when an ISR-side operation asked for a scheduler pass.
static RESCHED_PENDING: AtomicBool = AtomicBool::new(false);

/// Free-running cycle counter; advances on every read so busy-waits make
/// progress without wall-clock time.
static CYCLES: AtomicU64 = AtomicU64::new(0);

/// Last thread handed to the (virtual) switch stub; -1 = idle.
static LAST_DISPATCH: AtomicI64 = AtomicI64::new(-1);

/// Mask interrupts, returning the previous nesting state.
pub fn interrupt_mask() -> u32 {
    MASK_DEPTH.fetch_add(1, Ordering::AcqRel)
}

/// Restore the masking state returned by a matching `interrupt_mask`.
pub fn interrupt_restore(_prev: u32) {
    MASK_DEPTH.fetch_sub(1, Ordering::AcqRel);
}

/// True while at least one mask is outstanding.
pub fn interrupts_masked() -> bool {
    MASK_DEPTH.load(Ordering::Acquire) != 0
}

/// Program the periodic tick source on or off.
pub fn set_tick_enabled(enabled: bool) {
    TICK_ENABLED.store(enabled, Ordering::Release);
}

/// Read back the tick control latch.
pub fn tick_enabled() -> bool {
    TICK_ENABLED.load(Ordering::Acquire)
}

/// Request a scheduler pass from interrupt context. The real port pends the
/// scheduling trap; here the request is latched for the test driver.
pub fn request_reschedule() {
    RESCHED_PENDING.store(true, Ordering::Release);
}

/// Take the pending-reschedule latch.
pub fn take_resched_request() -> bool {
    RESCHED_PENDING.swap(false, Ordering::AcqRel)
}

/// Enter the scheduler from thread context. The real port traps into the
/// switch stub; on the host the scheduler runs inline.
pub fn yield_to_scheduler() {
    let _ = crate::kern::sched::reschedule();
}

/// 64-bit free-running cycle counter.
pub fn cycle_count() -> u64 {
    // Coarse synthetic advance keeps delay loops finite in tests.
    CYCLES.fetch_add(64, Ordering::Relaxed)
}

/// Idle the CPU until the next interrupt.
pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub(crate) fn dispatch_hint(next: Option<ThreadId>) {
    let v = match next {
        Some(id) => i64::from(id.0),
        None => -1,
    };
    LAST_DISPATCH.store(v, Ordering::Release);
}

/// Last dispatch decision delivered to the switch stub; `None` = idle.
pub fn last_dispatch() -> Option<ThreadId> {
    match LAST_DISPATCH.load(Ordering::Acquire) {
        -1 => None,
        v => Some(ThreadId(v as u16)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_nesting() {
        let outer = interrupt_mask();
        assert!(interrupts_masked());
        let inner = interrupt_mask();
        interrupt_restore(inner);
        assert!(interrupts_masked());
        interrupt_restore(outer);
    }

    #[test]
    fn test_cycle_counter_advances() {
        let a = cycle_count();
        let b = cycle_count();
        assert!(b > a);
    }
}
