//! Kernel core: scheduling, synchronization, timers, shared contexts

pub mod context;
pub mod fifo;
pub mod list;
pub mod mutex;
pub mod queue;
pub mod sched;
pub mod secure;
pub mod sem;
pub mod thread;
pub mod tick;
pub mod timer;

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::HANG_ON_EXCEPTIONS;

/// Handler for unrecoverable invariant violations.
pub type AbortHook = fn(&'static str) -> !;

static ABORT_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Install the abort hook run on invariant violations (corrupt list,
/// unowned unlock, event overflow). The default hangs or panics per
/// configuration.
pub fn set_abort_hook(hook: AbortHook) {
    ABORT_HOOK.store(hook as usize, Ordering::Release);
}

/// Report an unrecoverable invariant violation. Never returns.
pub fn kernel_fault(reason: &'static str) -> ! {
    let raw = ABORT_HOOK.load(Ordering::Acquire);
    if raw != 0 {
        // Stored by set_abort_hook from a real fn pointer.
        let hook: AbortHook = unsafe { core::mem::transmute(raw) };
        hook(reason);
    }
    crate::trace::raw_print("kernel fault: ");
    crate::trace::raw_print(reason);
    crate::trace::raw_print("\n");
    if cfg!(target_os = "none") && HANG_ON_EXCEPTIONS {
        loop {
            crate::arch::wait_for_interrupt();
        }
    }
    panic!("kernel fault: {}", reason);
}

/// Initialize the kernel core subsystems.
pub fn init() {
    thread::init();
    sched::init();
    timer::init();
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Serialization and teardown for tests that touch the kernel's
    //! process-wide singletons.

    use std::sync::{Mutex, MutexGuard};

    static GATE: Mutex<()> = Mutex::new(());

    /// Serialize global-state tests; poisoning from a should-panic test is
    /// expected and ignored.
    pub fn lock() -> MutexGuard<'static, ()> {
        GATE.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the kernel singletons to their boot state.
    pub fn reset() {
        super::sched::test_reset();
    }
}
