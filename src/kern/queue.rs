//! Blocking message queues
//!
//! A queue is a fixed ring plus two counting semaphores: `sem_tail` holds
//! the remaining slots (producer credit, capacity initially) and `sem_head`
//! the available items (zero initially). Senders take a slot credit, copy
//! the element into the ring under the interrupt mask, then post an item
//! credit; receivers mirror the same dance. Any number of writers and
//! readers may mix, and the non-blocking variants are ISR-safe.
//!
//! A queue can be wired to one channel bit of a shared signal, raised on
//! every producer commit, so one consumer can service several queues in
//! priority order.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex as SpinMutex;

use crate::arch;
use crate::kern::kernel_fault;
use crate::kern::sem::{Semaphore, Signal};

// ============================================================================
// Ring Storage
// ============================================================================

struct Ring<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    len: usize,
}

impl<T: Copy> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, value: T) {
        let cap = self.slots.len();
        let tail = (self.head + self.len) % cap;
        self.slots[tail] = Some(value);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<T> {
        let value = self.slots[self.head].take()?;
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        Some(value)
    }
}

// ============================================================================
// Queue
// ============================================================================

struct QueueInner<T> {
    ring: SpinMutex<Ring<T>>,
    /// Remaining slots: producer credit.
    sem_tail: Semaphore,
    /// Available items: consumer credit.
    sem_head: Semaphore,
    /// Optional signal channel raised on producer commit.
    channel: SpinMutex<Option<(Signal, u32)>>,
    capacity: usize,
}

/// Multi-writer/multi-reader blocking FIFO of fixed-size elements.
pub struct Queue<T: Copy> {
    inner: Arc<QueueInner<T>>,
}

impl<T: Copy> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Copy> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            kernel_fault("zero-capacity queue");
        }
        Self {
            inner: Arc::new(QueueInner {
                ring: SpinMutex::new(Ring::new(capacity)),
                sem_tail: Semaphore::new(capacity as u32),
                sem_head: Semaphore::new(0),
                channel: SpinMutex::new(None),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.inner.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route producer commits to `channel` on `signal`.
    pub fn attach_channel(&self, signal: &Signal, channel: u32) {
        *self.inner.channel.lock() = Some((signal.clone(), channel));
    }

    fn commit(&self, value: T) {
        {
            let _mask = arch::InterruptGuard::new();
            self.inner.ring.lock().push(value);
        }
        self.inner.sem_head.increment();
        if let Some((signal, channel)) = self.inner.channel.lock().as_ref() {
            signal.raise_channel(*channel);
        }
    }

    fn take(&self) -> T {
        let value = {
            let _mask = arch::InterruptGuard::new();
            self.inner.ring.lock().pop()
        };
        match value {
            Some(v) => {
                self.inner.sem_tail.increment();
                v
            }
            // An item credit with an empty ring means the semaphore pair
            // and the ring disagree.
            None => kernel_fault("queue credit without element"),
        }
    }

    // === Send ===

    /// Append, blocking while the queue is full.
    pub fn send(&self, value: T) {
        self.inner.sem_tail.wait();
        self.commit(value);
    }

    /// Append without blocking; false when full. ISR-safe.
    pub fn try_send(&self, value: T) -> bool {
        if !self.inner.sem_tail.try_take() {
            return false;
        }
        self.commit(value);
        true
    }

    /// Append, giving up after `ticks`.
    pub fn send_or_timeout(&self, value: T, ticks: u64) -> bool {
        if !self.inner.sem_tail.wait_or_timeout(ticks) {
            return false;
        }
        self.commit(value);
        true
    }

    // === Receive ===

    /// Remove the oldest element, blocking while the queue is empty.
    pub fn receive(&self) -> T {
        self.inner.sem_head.wait();
        self.take()
    }

    /// Remove without blocking. ISR-safe.
    pub fn try_receive(&self) -> Option<T> {
        if !self.inner.sem_head.try_take() {
            return None;
        }
        Some(self.take())
    }

    /// Remove the oldest element, giving up after `ticks`.
    pub fn receive_or_timeout(&self, ticks: u64) -> Option<T> {
        if !self.inner.sem_head.wait_or_timeout(ticks) {
            return None;
        }
        Some(self.take())
    }
}

// ============================================================================
// Multi-Queue Wait
// ============================================================================

/// Wait on several queues hanging off one signal. ORs newly raised bits
/// into `pending`, then consumes and returns the lowest set bit's index -
/// the highest-priority channel. The caller try-receives from that queue
/// and loops; a raised bit is a hint, not a guarantee of an element.
pub fn wait_on_multi_queue(signal: &Signal, pending: &mut u32) -> u32 {
    loop {
        *pending |= signal.poll();
        if *pending != 0 {
            let channel = pending.trailing_zeros();
            *pending &= !(1 << channel);
            return channel;
        }
        *pending |= signal.wait();
    }
}
