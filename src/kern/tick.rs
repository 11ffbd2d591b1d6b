//! Tick and time service
//!
//! Keeps the monotonic tick counter advanced by the periodic scheduler
//! interrupt, converts between wall time and ticks, and offers a
//! cycle-counter busy-wait for sub-tick delays.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch;
use crate::config::{CPU_CLOCK_HZ, MICROSECONDS_PER_TICK};

/// Monotonic tick counter, advanced only by the tick interrupt.
static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Current tick count.
pub fn now() -> u64 {
    TICK_COUNT.load(Ordering::SeqCst)
}

/// Advance the tick counter; returns the new count. Tick-interrupt only.
pub(crate) fn advance(ticks: u64) -> u64 {
    TICK_COUNT.fetch_add(ticks, Ordering::SeqCst) + ticks
}

/// Convert milliseconds to ticks, rounding up so short waits never round to
/// an immediate expiry.
pub const fn ticks_from_ms(ms: u64) -> u64 {
    let us_per_tick = MICROSECONDS_PER_TICK as u64;
    (ms * 1000).div_ceil(us_per_tick)
}

/// Convert ticks to milliseconds.
pub const fn ms_from_ticks(ticks: u64) -> u64 {
    ticks * MICROSECONDS_PER_TICK as u64 / 1000
}

/// Free-running 64-bit cycle counter.
pub fn cycle_count() -> u64 {
    arch::cycle_count()
}

/// Busy-wait for approximately `us` microseconds on the cycle counter.
/// Does not yield; use the scheduler's delay for anything tick-sized.
pub fn delay_us(us: u32) {
    let cycles = us as u64 * (CPU_CLOCK_HZ as u64 / 1_000_000);
    let start = arch::cycle_count();
    while arch::cycle_count().wrapping_sub(start) < cycles {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let before = now();
        let after = advance(3);
        assert_eq!(after, before + 3);
        assert!(now() >= after);
    }

    #[test]
    fn test_conversions() {
        // 1000 us per tick in the default configuration.
        assert_eq!(ticks_from_ms(10), 10);
        assert_eq!(ms_from_ticks(10), 10);
        // Sub-tick waits round up to a full tick.
        assert!(ticks_from_ms(1) >= 1);
    }

    #[test]
    fn test_delay_us_terminates() {
        delay_us(1);
    }
}
