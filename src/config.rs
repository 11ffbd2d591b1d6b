//! Compile-time kernel configuration
//!
//! All tunables are plain constants so the optimizer can fold them into the
//! scheduler paths. Boards override these by patching this file; there is no
//! runtime configuration surface.

/// Number of thread priority levels; priority 0 is the highest.
pub const MAX_THREAD_PRIORITIES: usize = 8;

/// Length of the periodic scheduler tick.
pub const MICROSECONDS_PER_TICK: u32 = 1000;

/// CPU core clock, used to convert the cycle counter to wall time.
pub const CPU_CLOCK_HZ: u32 = 64_000_000;

/// Paint thread stacks and track their high-water mark.
pub const STACK_USAGE_MONITOR: bool = true;

/// Word pattern painted onto fresh stacks when monitoring is on.
pub const STACK_PAINT_PATTERN: usize = 0xA5A5_A5A5;

/// Trap on unaligned memory access. The control-register write that
/// enforces this happens in the platform startup code, next to the trap
/// stubs; the kernel only records the choice.
pub const UNALIGN_FAULTS: bool = false;

/// Hang in the abort hook instead of resetting.
pub const HANG_ON_EXCEPTIONS: bool = true;

/// Default stack size for threads created without an explicit size, in words.
pub const DEFAULT_STACK_WORDS: usize = 256;

/// Capacity of the raw print ring (bytes). Usable depth is one less.
pub const PRINT_BUFFER_SIZE: usize = 512;

/// Capacity of the ISR event ring. Each semaphore or signal occupies at most
/// one slot at a time, so this bounds the number of distinct primitives with
/// waiters, not the number of raises.
pub const EVENT_QUEUE_DEPTH: usize = 64;

/// Number of secure-world context slots available for reservation.
pub const SECURE_CONTEXT_SLOTS: u32 = 2;
