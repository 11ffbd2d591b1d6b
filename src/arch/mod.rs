//! Architecture contract for Kestrel
//!
//! The trap-level register save/restore, the fault dumper and the interrupt
//! controller live outside this crate; the kernel sees them only through the
//! small surface below. Two backends exist:
//!
//! - `bare`: the real microcontroller port. It forwards every call to the
//!   `kestrel_*` symbols provided by the board's trap stubs.
//! - `host`: an instrumented stand-in for any target with an operating
//!   system, so the scheduler state machine can be driven and observed from
//!   ordinary unit tests. Interrupt masking becomes a nest counter, the tick
//!   control latches its last setting, and reschedule requests are flagged
//!   instead of trapping.

use crate::types::ThreadId;

#[cfg(target_os = "none")]
mod bare;
#[cfg(not(target_os = "none"))]
mod host;

#[cfg(target_os = "none")]
pub use bare::*;
#[cfg(not(target_os = "none"))]
pub use host::*;

/// Number of machine words at the start of a thread descriptor reserved for
/// the register-save frame written by the switch stub.
pub const SAVE_FRAME_WORDS: usize = 4;

/// Register-save header of a thread descriptor.
///
/// The switch stub spills the active register state here on a scheduling
/// trap and reloads it when the thread is dispatched again. The layout is
/// ABI with that stub: this struct must stay first in the descriptor and the
/// kernel never interprets its contents.
#[repr(C, align(8))]
pub struct SaveFrame {
    words: [usize; SAVE_FRAME_WORDS],
}

impl SaveFrame {
    pub const fn zeroed() -> Self {
        Self {
            words: [0; SAVE_FRAME_WORDS],
        }
    }

    /// Frame for a thread that has never run: initial stack pointer, entry
    /// point and argument, from which the switch stub builds the first
    /// register state.
    pub fn first_dispatch(sp: usize, pc: usize, arg: usize) -> Self {
        Self {
            words: [sp, pc, arg, 0],
        }
    }
}

/// RAII interrupt mask: interrupts are masked for the guard's lifetime.
/// Nesting is supported; the previous mask state is restored on drop.
pub struct InterruptGuard {
    prev: u32,
}

impl InterruptGuard {
    pub fn new() -> Self {
        Self {
            prev: interrupt_mask(),
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        interrupt_restore(self.prev);
    }
}

/// Dispatch notification for the backend.
///
/// On bare metal this arms the switch stub with the next descriptor; the
/// host backend records it so tests can observe the scheduler's choice.
pub(crate) fn note_dispatch(next: Option<ThreadId>) {
    dispatch_hint(next);
}
