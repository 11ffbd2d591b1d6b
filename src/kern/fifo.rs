//! Lock-free single-reader/single-writer ring buffer
//!
//! Carries the ISR-to-scheduler event traffic and the raw print bytes. One
//! producer and one consumer may run concurrently without locks; the release
//! store on an index publishes the payload written before it, and the
//! acquire load on the opposite index is the matching barrier on the reader
//! side. Usable depth is capacity minus one (a full slot distinguishes full
//! from empty).
//!
//! Inter-thread message traffic does not use this type; blocking queues are
//! built from semaphores instead.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

pub struct SpscRing<T, const N: usize> {
    buf: UnsafeCell<[MaybeUninit<T>; N]>,
    /// Consumer index; owned by the reader, observed by the writer.
    head: AtomicUsize,
    /// Producer index; owned by the writer, observed by the reader.
    tail: AtomicUsize,
}

unsafe impl<T: Send, const N: usize> Sync for SpscRing<T, N> {}
unsafe impl<T: Send, const N: usize> Send for SpscRing<T, N> {}

impl<T, const N: usize> SpscRing<T, N> {
    pub const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([const { MaybeUninit::uninit() }; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Usable depth.
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    /// Producer side: append an element, or hand it back when full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % N;
        if next == self.head.load(Ordering::Acquire) {
            return Err(value);
        }
        unsafe {
            (*self.buf.get())[tail].write(value);
        }
        // Publishes the payload write above.
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer side: take the oldest element.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let value = unsafe { (*self.buf.get())[head].assume_init_read() };
        // Releases the slot only after the payload read above.
        self.head.store((head + 1) % N, Ordering::Release);
        Some(value)
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + N - head) % N
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, const N: usize> Drop for SpscRing<T, N> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let ring: SpscRing<u32, 8> = SpscRing::new();
        for i in 0..5 {
            assert!(ring.push(i).is_ok());
        }
        for i in 0..5 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_usable_depth_is_capacity_minus_one() {
        let ring: SpscRing<u8, 4> = SpscRing::new();
        assert_eq!(ring.capacity(), 3);
        assert!(ring.push(1).is_ok());
        assert!(ring.push(2).is_ok());
        assert!(ring.push(3).is_ok());
        assert_eq!(ring.push(4), Err(4));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_wraparound() {
        let ring: SpscRing<u32, 4> = SpscRing::new();
        for round in 0..10 {
            assert!(ring.push(round).is_ok());
            assert!(ring.push(round + 100).is_ok());
            assert_eq!(ring.pop(), Some(round));
            assert_eq!(ring.pop(), Some(round + 100));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_drop_releases_pending() {
        use alloc::rc::Rc;

        let marker = Rc::new(());
        {
            let ring: SpscRing<Rc<()>, 4> = SpscRing::new();
            ring.push(Rc::clone(&marker)).unwrap();
            ring.push(Rc::clone(&marker)).unwrap();
            assert_eq!(Rc::strong_count(&marker), 3);
        }
        assert_eq!(Rc::strong_count(&marker), 1);
    }
}
