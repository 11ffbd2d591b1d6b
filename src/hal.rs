//! HAL contract
//!
//! The board support package implements this trait and registers it at
//! startup; the kernel and its self-tests reach the hardware only through
//! these five calls. Everything here must be callable from thread context;
//! `send_to_tx_uart` may additionally be called with interrupts masked.

/// Board-level hardware services.
pub trait Hal: Sync {
    /// Bring up clocks, pins and the UART.
    fn init(&self);
    /// Install the receive callback, invoked per byte in interrupt context.
    fn register_rx_uart_callback(&self, callback: fn(u8));
    /// Transmit one byte, busy-waiting on the transmitter.
    fn send_to_tx_uart(&self, byte: u8);
    /// Hardware entropy.
    fn get_random_u32(&self) -> u32;
    /// Drive a GPIO line.
    fn set_gpio(&self, line: u32, state: bool);
}

fn backend_cell() -> &'static spin::Mutex<Option<&'static dyn Hal>> {
    static CELL: spin::Once<spin::Mutex<Option<&'static dyn Hal>>> = spin::Once::new();
    CELL.call_once(|| spin::Mutex::new(None))
}

/// Register the board's HAL. Call once at startup, before any HAL use.
pub fn set_hal(hal: &'static dyn Hal) {
    *backend_cell().lock() = Some(hal);
}

/// The registered HAL, if any.
pub fn hal() -> Option<&'static dyn Hal> {
    *backend_cell().lock()
}

/// Transmit a byte through the registered backend; dropped when none.
pub fn send_to_tx_uart(byte: u8) {
    if let Some(h) = hal() {
        h.send_to_tx_uart(byte);
    }
}

/// Random word from the registered backend; zero when none.
pub fn get_random_u32() -> u32 {
    hal().map(|h| h.get_random_u32()).unwrap_or(0)
}

/// Drive a GPIO line through the registered backend.
pub fn set_gpio(line: u32, state: bool) {
    if let Some(h) = hal() {
        h.set_gpio(line, state);
    }
}
