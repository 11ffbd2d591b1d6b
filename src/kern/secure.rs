//! Secure-world context slots
//!
//! The secure-world switcher itself lives outside this crate; the kernel's
//! side of the contract is only admission control. A fixed pool of context
//! slots is modeled as a counting semaphore: reserving blocks until a slot
//! frees, and the reservation releases its slot when dropped.

use crate::config::SECURE_CONTEXT_SLOTS;
use crate::kern::sem::Semaphore;

static SLOTS: spin::Once<Semaphore> = spin::Once::new();

fn slots() -> &'static Semaphore {
    SLOTS.call_once(|| Semaphore::new(SECURE_CONTEXT_SLOTS))
}

/// A held secure-world context slot.
pub struct SecureContext(());

impl SecureContext {
    fn new() -> Self {
        Self(())
    }
}

impl Drop for SecureContext {
    fn drop(&mut self) {
        slots().increment();
    }
}

/// Block until a secure-world context slot is available.
pub fn reserve_secure_context() -> SecureContext {
    slots().wait();
    SecureContext::new()
}

/// Take a slot without blocking.
pub fn try_reserve_secure_context() -> Option<SecureContext> {
    if slots().try_take() {
        Some(SecureContext::new())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SECURE_CONTEXT_SLOTS as POOL;
    use crate::kern::test_support;
    use alloc::vec::Vec;

    #[test]
    fn test_slots_exhaust_and_recycle() {
        let _g = test_support::lock();
        test_support::reset();

        let mut held = Vec::new();
        for _ in 0..POOL {
            held.push(try_reserve_secure_context().expect("slot available"));
        }
        assert!(try_reserve_secure_context().is_none());

        held.pop();
        let again = try_reserve_secure_context();
        assert!(again.is_some());
        drop(again);
        drop(held);

        assert_eq!(slots().value(), POOL);
    }
}
