//! Kestrel - a preemptive priority RTOS microkernel for 32-bit MCUs
//!
//! Threads with round-robin scheduling inside each priority level,
//! recursive mutexes with inheritance by scheduler substitution, counting
//! semaphores and 32-bit signals raised safely from interrupts, software
//! timers, blocking message queues, and shared contexts that multiplex
//! cooperative clients onto one thread.

#![no_std]
#![allow(dead_code)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Kernel code keeps explicit empty-check style next to len-based logic
#![allow(clippy::len_without_is_empty)]

// Standard library replacement for no_std
extern crate alloc;

#[cfg(test)]
extern crate std;

// Core types
pub mod types;

// Re-exports
pub mod arch;
pub mod config;
pub mod hal;
pub mod kern;
pub mod trace;

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Kestrel";

/// Initialize the kernel library
pub fn init() {
    // Kernel core: thread table, scheduler, timer wheel.
    kern::init();

    // Logging facade over the trace path.
    trace::init();

    // Board hardware, when a backend has been registered.
    if let Some(h) = hal::hal() {
        h.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "Kestrel");
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }
}
