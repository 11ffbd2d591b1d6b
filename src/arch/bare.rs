//! Bare-metal backend: thin wrappers over the board's trap stubs
//!
//! The `kestrel_*` symbols are provided by the platform port (assembly and
//! startup code outside this crate). The contracts mirror `host.rs`; see the
//! module docs in `arch` for the semantics each symbol must implement.

use crate::types::ThreadId;

extern "C" {
    fn kestrel_interrupt_mask() -> u32;
    fn kestrel_interrupt_restore(prev: u32);
    fn kestrel_set_tick_enabled(enabled: bool);
    fn kestrel_tick_enabled() -> bool;
    fn kestrel_pend_scheduler();
    fn kestrel_yield_trap();
    fn kestrel_cycle_count() -> u64;
    fn kestrel_wait_for_interrupt();
    fn kestrel_set_next_thread(frame: usize);
    fn kestrel_start_first_thread() -> !;
}

pub fn interrupt_mask() -> u32 {
    unsafe { kestrel_interrupt_mask() }
}

pub fn interrupt_restore(prev: u32) {
    unsafe { kestrel_interrupt_restore(prev) }
}

pub fn set_tick_enabled(enabled: bool) {
    unsafe { kestrel_set_tick_enabled(enabled) }
}

pub fn tick_enabled() -> bool {
    unsafe { kestrel_tick_enabled() }
}

/// Pend the scheduling trap from interrupt context.
pub fn request_reschedule() {
    unsafe { kestrel_pend_scheduler() }
}

pub fn take_resched_request() -> bool {
    // The trap controller clears its own pend bit on entry.
    false
}

/// Trap into the switch stub from thread context.
pub fn yield_to_scheduler() {
    unsafe { kestrel_yield_trap() }
}

pub fn cycle_count() -> u64 {
    unsafe { kestrel_cycle_count() }
}

pub fn wait_for_interrupt() {
    unsafe { kestrel_wait_for_interrupt() }
}

/// Load the first dispatched thread's frame and drop into it.
pub fn start_first_thread() -> ! {
    unsafe { kestrel_start_first_thread() }
}

pub(crate) fn dispatch_hint(next: Option<ThreadId>) {
    let frame = match next {
        Some(id) => match crate::kern::thread::find(id) {
            Some(th) => th.frame_ptr() as usize,
            None => 0,
        },
        None => 0,
    };
    unsafe { kestrel_set_next_thread(frame) }
}
