//! Thread model
//!
//! Threads are the unit of scheduling. Each descriptor starts with the
//! register-save frame the switch stub spills into (layout is ABI with that
//! stub), followed by the scheduling state: nominal and effective priority,
//! the wait state, the resource the thread is blocked on, and its stack.
//!
//! Wait state lives on the descriptor itself. A blocked thread records what
//! it is waiting for and the blocking primitives re-evaluate that condition
//! when the thread is next considered; interrupts never walk wait lists.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use spin::Mutex as SpinMutex;

use crate::arch::SaveFrame;
use crate::config::{
    DEFAULT_STACK_WORDS, MAX_THREAD_PRIORITIES, STACK_PAINT_PATTERN, STACK_USAGE_MONITOR,
};
use crate::kern::kernel_fault;
use crate::kern::mutex::MutexInner;
use crate::kern::sem::SemInner;
use crate::types::{Priority, ThreadId};

// ============================================================================
// Thread State
// ============================================================================

/// Scheduling state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Created but not yet released to the scheduler
    NotStarted = 0,
    /// Ready to run (or running)
    Runnable = 1,
    /// Sleeping until a timer-wheel entry expires
    WaitForTick = 2,
    /// Blocked on a semaphore or signal
    WaitForSem = 3,
    /// Blocked on a semaphore or signal, with a timeout armed
    WaitForSemOrTick = 4,
    /// Blocked on a mutex; keeps its run-queue slot for substitution
    WaitForMutex = 5,
    /// Kill or exit requested; the scheduler will finalize it
    StopRequest = 6,
    /// Terminated; stop code is valid
    Stopped = 7,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotStarted,
            1 => Self::Runnable,
            2 => Self::WaitForTick,
            3 => Self::WaitForSem,
            4 => Self::WaitForSemOrTick,
            5 => Self::WaitForMutex,
            6 => Self::StopRequest,
            _ => Self::Stopped,
        }
    }

    /// True for the states that hold a timer-wheel entry.
    pub fn waits_on_tick(self) -> bool {
        matches!(self, Self::WaitForTick | Self::WaitForSemOrTick)
    }
}

/// Thread entry function; the return value becomes the stop code unless a
/// stop handler overrides it.
pub type ThreadEntry = fn(usize) -> u32;

/// Termination handler, run by the scheduler when a thread stops. Must be
/// bounded; may release held mutexes with `Mutex::restore`.
pub type StopHandler = fn(usize) -> u32;

/// Resource a blocked thread is waiting on. Non-owning in spirit: the
/// primitive outlives its waiters in embedded use, the cheap inner clone
/// just lets the scheduler reach it without a registry.
#[derive(Clone)]
pub(crate) enum BlockedOn {
    Mutex(Arc<MutexInner>),
    Sem(Arc<SemInner>),
}

// ============================================================================
// Stack Region
// ============================================================================

/// Owned stack memory for one thread.
///
/// Held as raw parts because the running thread writes this memory through
/// its stack pointer, outside the reference discipline.
struct StackRegion {
    base: NonNull<usize>,
    words: usize,
}

unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl StackRegion {
    fn new(words: usize) -> Self {
        if words == 0 {
            kernel_fault("zero-size thread stack");
        }
        let fill = if STACK_USAGE_MONITOR {
            STACK_PAINT_PATTERN
        } else {
            0
        };
        let boxed: Box<[usize]> = vec![fill; words].into_boxed_slice();
        let raw = Box::into_raw(boxed);
        Self {
            base: unsafe { NonNull::new_unchecked(raw as *mut usize) },
            words,
        }
    }

    fn as_slice(&self) -> &[usize] {
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.words) }
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                self.base.as_ptr(),
                self.words,
            )));
        }
    }
}

// ============================================================================
// Thread Descriptor
// ============================================================================

/// A Kestrel thread
#[repr(C)]
pub struct Thread {
    /// Register-save header; must stay the first field.
    frame: UnsafeCell<SaveFrame>,

    /// Thread identifier
    pub id: ThreadId,

    /// Priority assigned by the user
    nominal_pri: AtomicU8,

    /// Priority the thread currently runs at; equals nominal unless an
    /// explicit priority change moved it
    effective_pri: AtomicU8,

    /// Scheduling state
    state: AtomicU8,

    /// Set by a timer expiry while blocked with a timeout
    timed_out: AtomicBool,

    /// Credit handed over by the event drain while this thread was pending
    wake_granted: AtomicBool,
    wake_value: AtomicU32,

    /// Number of mutexes currently held
    mutex_count: AtomicU32,

    /// Termination handler and its argument
    stop_handler: SpinMutex<Option<(StopHandler, usize)>>,

    /// Resource this thread is blocked on, if any
    blocked_on: SpinMutex<Option<BlockedOn>>,

    /// Stop code; valid once the state is Stopped
    stop_code: AtomicU32,

    /// Stack memory
    stack: StackRegion,
}

// The frame cell is only touched by the switch stub while the thread is not
// running, and the stack region is only written by the thread that owns it.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn new(
        id: ThreadId,
        pri: Priority,
        entry: ThreadEntry,
        arg: usize,
        stack_words: usize,
    ) -> Self {
        if (pri as usize) >= MAX_THREAD_PRIORITIES {
            kernel_fault("thread priority out of range");
        }
        let stack = StackRegion::new(stack_words);
        // The stack grows down from one past its last word.
        let stack_top = stack.base.as_ptr() as usize + stack_words * core::mem::size_of::<usize>();
        Self {
            frame: UnsafeCell::new(SaveFrame::first_dispatch(stack_top, entry as usize, arg)),
            id,
            nominal_pri: AtomicU8::new(pri),
            effective_pri: AtomicU8::new(pri),
            state: AtomicU8::new(ThreadState::NotStarted as u8),
            timed_out: AtomicBool::new(false),
            wake_granted: AtomicBool::new(false),
            wake_value: AtomicU32::new(0),
            mutex_count: AtomicU32::new(0),
            stop_handler: SpinMutex::new(None),
            blocked_on: SpinMutex::new(None),
            stop_code: AtomicU32::new(0),
            stack,
        }
    }

    // === State ===

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_runnable(&self) -> bool {
        self.state() == ThreadState::Runnable
    }

    // === Priority ===

    pub fn nominal_priority(&self) -> Priority {
        self.nominal_pri.load(Ordering::Relaxed)
    }

    pub fn effective_priority(&self) -> Priority {
        self.effective_pri.load(Ordering::Relaxed)
    }

    pub(crate) fn set_priority(&self, pri: Priority) {
        self.nominal_pri.store(pri, Ordering::Relaxed);
        self.effective_pri.store(pri, Ordering::Relaxed);
    }

    // === Wait bookkeeping ===

    pub(crate) fn take_timed_out(&self) -> bool {
        self.timed_out.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    /// Hand this thread the value it was waiting for. The waker consumes
    /// the primitive's value on the waiter's behalf (FIFO credit), so the
    /// wait returns without re-polling.
    pub(crate) fn grant_wake(&self, value: u32) {
        self.wake_value.store(value, Ordering::Relaxed);
        self.wake_granted.store(true, Ordering::Release);
    }

    pub(crate) fn take_granted(&self) -> Option<u32> {
        if self.wake_granted.swap(false, Ordering::AcqRel) {
            Some(self.wake_value.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    pub(crate) fn blocked_on(&self) -> Option<BlockedOn> {
        self.blocked_on.lock().clone()
    }

    pub(crate) fn set_blocked_on(&self, on: Option<BlockedOn>) {
        *self.blocked_on.lock() = on;
    }

    // === Mutex accounting ===

    pub(crate) fn note_mutex_acquired(&self) {
        self.mutex_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_mutex_released(&self) {
        if self.mutex_count.fetch_sub(1, Ordering::AcqRel) == 0 {
            kernel_fault("mutex release with no mutex held");
        }
    }

    pub fn mutexes_held(&self) -> u32 {
        self.mutex_count.load(Ordering::Relaxed)
    }

    // === Entry and termination ===

    /// Install the termination handler run when this thread stops.
    pub fn set_stop_handler(&self, handler: StopHandler, arg: usize) {
        *self.stop_handler.lock() = Some((handler, arg));
    }

    pub(crate) fn stop_handler(&self) -> Option<(StopHandler, usize)> {
        *self.stop_handler.lock()
    }

    pub(crate) fn set_stop_code(&self, code: u32) {
        self.stop_code.store(code, Ordering::Release);
    }

    pub fn stop_code(&self) -> u32 {
        self.stop_code.load(Ordering::Acquire)
    }

    // === Stack ===

    pub fn stack_words(&self) -> usize {
        self.stack.words
    }

    /// High-water mark of stack usage in words; zero when monitoring is off.
    pub fn stack_used_words(&self) -> usize {
        if !STACK_USAGE_MONITOR {
            return 0;
        }
        // The stack grows down; untouched paint survives at the bottom.
        let untouched = self
            .stack
            .as_slice()
            .iter()
            .take_while(|&&w| w == STACK_PAINT_PATTERN)
            .count();
        self.stack.words - untouched
    }

    /// Raw pointer to the register-save header, for the switch stub.
    pub fn frame_ptr(&self) -> *mut SaveFrame {
        self.frame.get()
    }
}

// ============================================================================
// Thread Table
// ============================================================================

/// All live threads by id
struct ThreadTable {
    threads: BTreeMap<ThreadId, Arc<Thread>>,
    next_id: u16,
}

impl ThreadTable {
    fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            // Id 0 is the boot/idle pseudo-thread and never gets a descriptor.
            next_id: 1,
        }
    }

    fn create(
        &mut self,
        pri: Priority,
        entry: ThreadEntry,
        arg: usize,
        stack_words: usize,
    ) -> Arc<Thread> {
        let id = ThreadId(self.next_id);
        self.next_id += 1;

        let thread = Arc::new(Thread::new(id, pri, entry, arg, stack_words));
        self.threads.insert(id, Arc::clone(&thread));
        thread
    }
}

static THREAD_TABLE: spin::Once<SpinMutex<ThreadTable>> = spin::Once::new();

fn thread_table() -> &'static SpinMutex<ThreadTable> {
    THREAD_TABLE.call_once(|| SpinMutex::new(ThreadTable::new()))
}

/// Initialize the thread subsystem
pub fn init() {
    let _ = thread_table();
}

/// Create a thread in the NotStarted state. Stacks come from the system
/// allocator, so creation is forbidden in interrupt context.
pub fn create(pri: Priority, entry: ThreadEntry, arg: usize, stack_words: usize) -> Arc<Thread> {
    thread_table().lock().create(pri, entry, arg, stack_words)
}

/// Create a thread with the default stack size.
pub fn create_default(pri: Priority, entry: ThreadEntry, arg: usize) -> Arc<Thread> {
    create(pri, entry, arg, DEFAULT_STACK_WORDS)
}

/// Find a thread by id
pub fn find(id: ThreadId) -> Option<Arc<Thread>> {
    thread_table().lock().threads.get(&id).cloned()
}

/// Drop the table's reference to a stopped thread.
pub fn remove(id: ThreadId) -> bool {
    thread_table().lock().threads.remove(&id).is_some()
}

/// Number of live threads
pub fn count() -> usize {
    thread_table().lock().threads.len()
}

/// Effective priority of a thread; unknown ids (the boot/idle pseudo-thread)
/// rank below every real priority.
pub(crate) fn effective_priority(id: ThreadId) -> Priority {
    match find(id) {
        Some(th) => th.effective_priority(),
        None => (MAX_THREAD_PRIORITIES - 1) as Priority,
    }
}

#[cfg(test)]
pub(crate) fn test_clear_table() {
    let mut table = thread_table().lock();
    table.threads.clear();
    table.next_id = 1;
}

// ============================================================================
// Thread Info (for inspection)
// ============================================================================

/// Snapshot of a thread for diagnostics
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub state: ThreadState,
    pub nominal_priority: Priority,
    pub effective_priority: Priority,
    pub stack_words: usize,
    pub stack_used_words: usize,
}

impl From<&Thread> for ThreadInfo {
    fn from(thread: &Thread) -> Self {
        Self {
            id: thread.id,
            state: thread.state(),
            nominal_priority: thread.nominal_priority(),
            effective_priority: thread.effective_priority(),
            stack_words: thread.stack_words(),
            stack_used_words: thread.stack_used_words(),
        }
    }
}

/// Get a diagnostic snapshot of a thread
pub fn info(id: ThreadId) -> Option<ThreadInfo> {
    find(id).map(|t| ThreadInfo::from(t.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spin_entry(_arg: usize) -> u32 {
        0
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            ThreadState::NotStarted,
            ThreadState::Runnable,
            ThreadState::WaitForTick,
            ThreadState::WaitForSem,
            ThreadState::WaitForSemOrTick,
            ThreadState::WaitForMutex,
            ThreadState::StopRequest,
            ThreadState::Stopped,
        ] {
            assert_eq!(ThreadState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_descriptor_defaults() {
        let thread = Thread::new(ThreadId(7), 3, spin_entry, 0xBEEF, 64);
        assert_eq!(thread.id, ThreadId(7));
        assert_eq!(thread.state(), ThreadState::NotStarted);
        assert_eq!(thread.nominal_priority(), 3);
        assert_eq!(thread.effective_priority(), 3);
        assert_eq!(thread.mutexes_held(), 0);
        assert_eq!(thread.stack_words(), 64);
    }

    #[test]
    fn test_fresh_stack_is_untouched() {
        let thread = Thread::new(ThreadId(8), 1, spin_entry, 0, 32);
        assert_eq!(thread.stack_used_words(), 0);
    }

    #[test]
    fn test_timed_out_flag_is_taken_once() {
        let thread = Thread::new(ThreadId(9), 1, spin_entry, 0, 32);
        assert!(!thread.take_timed_out());
        thread.mark_timed_out();
        assert!(thread.take_timed_out());
        assert!(!thread.take_timed_out());
    }

    #[test]
    fn test_save_frame_is_first_field() {
        let thread = Thread::new(ThreadId(10), 1, spin_entry, 0, 32);
        let base = &thread as *const Thread as usize;
        assert_eq!(thread.frame_ptr() as usize, base);
    }
}
