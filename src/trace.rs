//! Trace output facade
//!
//! A process-wide mutex serializes formatted prints from threads. Output
//! goes to an installable raw hook (typically the board's UART path); with
//! no hook installed, bytes land in a lock-free ring that a driver or the
//! idle loop drains later. Interrupt context must bypass the trace lock and
//! use `raw_print`, which only touches the hook pointer and the ring.
//!
//! The `log` crate facade is wired through the same path, so `log::info!`
//! and friends serialize with direct prints.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{Level, LevelFilter, Metadata, Record};

use crate::config::PRINT_BUFFER_SIZE;
use crate::kern::fifo::SpscRing;
use crate::kern::mutex::Mutex;

/// Largest formatted line; longer output is truncated.
const LINE_MAX: usize = 256;

/// Raw output hook; a plain fn pointer stored as a word so interrupt
/// context can read it without taking any lock. Zero means none.
static RAW_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Fallback byte ring when no hook is installed.
static RAW_RING: SpscRing<u8, PRINT_BUFFER_SIZE> = SpscRing::new();

/// Serializes formatted prints from thread context.
static TRACE_LOCK: spin::Once<Mutex> = spin::Once::new();

fn trace_lock() -> &'static Mutex {
    TRACE_LOCK.call_once(Mutex::new)
}

/// Route raw output through `hook` instead of the ring.
pub fn install_raw_hook(hook: fn(&str)) {
    RAW_HOOK.store(hook as usize, Ordering::Release);
}

/// Remove the raw output hook.
pub fn clear_raw_hook() {
    RAW_HOOK.store(0, Ordering::Release);
}

fn hook() -> Option<fn(&str)> {
    let raw = RAW_HOOK.load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        // Stored by install_raw_hook from a real fn pointer.
        Some(unsafe { core::mem::transmute::<usize, fn(&str)>(raw) })
    }
}

/// Emit without locking or blocking. ISR-safe; bytes that do not fit in
/// the ring are dropped.
pub fn raw_print(s: &str) {
    match hook() {
        Some(h) => h(s),
        None => {
            for byte in s.bytes() {
                if RAW_RING.push(byte).is_err() {
                    break;
                }
            }
        }
    }
}

/// Emit under the trace lock. Thread context only.
pub fn print_str(s: &str) {
    let lock = trace_lock();
    lock.lock();
    raw_print(s);
    lock.unlock();
}

/// Formatted print under the trace lock.
pub fn print_args(args: fmt::Arguments<'_>) {
    let mut line: heapless::String<LINE_MAX> = heapless::String::new();
    // Truncation on overflow is acceptable for trace output.
    let _ = line.write_fmt(args);
    print_str(&line);
}

/// Drain buffered raw bytes, e.g. from the UART pump.
pub fn drain_raw(mut sink: impl FnMut(u8)) -> usize {
    let mut drained = 0;
    while let Some(byte) = RAW_RING.pop() {
        sink(byte);
        drained += 1;
    }
    drained
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::trace::print_args(core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    () => { $crate::trace::print_str("\n") };
    ($($arg:tt)*) => {
        $crate::trace::print_args(core::format_args!("{}\n", core::format_args!($($arg)*)))
    };
}

// ============================================================================
// log Facade
// ============================================================================

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            print_args(format_args!("[{}] {}\n", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger behind the `log` facade.
pub fn init() {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::test_support;
    use std::string::String;
    use std::sync::Mutex as StdMutex;

    static CAPTURED: StdMutex<String> = StdMutex::new(String::new());

    fn capture(s: &str) {
        CAPTURED
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_str(s);
    }

    fn take_captured() -> String {
        core::mem::take(&mut *CAPTURED.lock().unwrap_or_else(|e| e.into_inner()))
    }

    #[test]
    fn test_hooked_print_is_redirected() {
        let _g = test_support::lock();
        test_support::reset();
        take_captured();

        install_raw_hook(capture);
        kprintln!("tick={}", 42);
        clear_raw_hook();

        assert_eq!(take_captured(), "tick=42\n");
    }

    #[test]
    fn test_unhooked_print_lands_in_ring() {
        let _g = test_support::lock();
        test_support::reset();
        drain_raw(|_| {});

        clear_raw_hook();
        print_str("abc");

        let mut bytes = std::vec::Vec::new();
        drain_raw(|b| bytes.push(b));
        assert_eq!(bytes, b"abc");
    }

    #[test]
    fn test_logger_formats_level() {
        let _g = test_support::lock();
        test_support::reset();
        take_captured();

        init();
        install_raw_hook(capture);
        log::info!("ready");
        clear_raw_hook();

        assert_eq!(take_captured(), "[INFO] ready\n");
    }
}
