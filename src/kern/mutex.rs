//! Recursive mutex with inheritance via scheduler substitution
//!
//! Ownership is recursive: the owner may re-lock, and the mutex releases
//! only when the depth returns to zero. A contending thread records the
//! mutex as its blocked-on resource, enters the priority-ordered pend queue
//! and yields, but keeps its run-queue slot; when the scheduler selects that
//! slot it runs the owner chain in its place, which is the entirety of
//! priority inheritance here. No stored priority changes hands.
//!
//! The `to_yield` bit is set when a strictly higher-priority thread starts
//! waiting, so the release path forces a scheduler pass even if the old
//! owner still has work.

use alloc::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::kern::kernel_fault;
use crate::kern::list::List;
use crate::kern::sched;
use crate::kern::thread::{self, BlockedOn, ThreadState};
use crate::types::ThreadId;

pub(crate) struct MutexState {
    pub(crate) owner: Option<ThreadId>,
    pub(crate) depth: u32,
    /// Waiters, highest priority first, FIFO among equals.
    pub(crate) pend: List<ThreadId>,
    /// Force a scheduler pass at release time.
    pub(crate) to_yield: bool,
}

pub(crate) struct MutexInner {
    pub(crate) state: SpinMutex<MutexState>,
}

impl MutexInner {
    pub(crate) fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }
}

/// A recursive blocking mutex
#[derive(Clone)]
pub struct Mutex {
    inner: Arc<MutexInner>,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MutexInner {
                state: SpinMutex::new(MutexState {
                    owner: None,
                    depth: 0,
                    pend: List::new(),
                    to_yield: false,
                }),
            }),
        }
    }

    /// Acquire, blocking while another thread owns the mutex.
    pub fn lock(&self) {
        loop {
            if self.grab_or_pend() {
                return;
            }
            sched::yield_now();
        }
    }

    /// Acquire without blocking. Recursive like `lock`.
    pub fn try_lock(&self) -> bool {
        sched::with_sched(|s| {
            let me = s.current();
            let mut st = self.inner.state.lock();
            match st.owner {
                None => {
                    self.take_ownership(&mut st, me);
                    true
                }
                Some(owner) if owner == me => {
                    st.depth += 1;
                    true
                }
                Some(_) => false,
            }
        })
    }

    /// Release one level of ownership; the mutex frees at depth zero.
    /// Releasing a mutex the caller does not own is an invariant violation.
    pub fn unlock(&self) {
        let need_yield = sched::with_sched(|s| {
            let me = s.current();
            let mut st = self.inner.state.lock();
            if st.owner != Some(me) {
                kernel_fault("unlock of mutex not owned by caller");
            }
            st.depth -= 1;
            if st.depth > 0 {
                return false;
            }
            Self::release(&mut st, me)
        });
        if need_yield {
            sched::yield_now();
        }
    }

    /// Release fully if and only if the current thread is the owner.
    /// Meant for termination handlers, which cannot know the depth.
    pub fn restore(&self) {
        let need_yield = sched::with_sched(|s| {
            let me = s.current();
            let mut st = self.inner.state.lock();
            if st.owner != Some(me) {
                return false;
            }
            st.depth = 0;
            Self::release(&mut st, me)
        });
        if need_yield {
            sched::yield_now();
        }
    }

    /// True if the current thread owns the mutex.
    pub fn is_owner(&self) -> bool {
        let me = sched::current_thread_id();
        self.inner.state.lock().owner == Some(me)
    }

    /// Current owner, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        self.inner.owner()
    }

    /// Current recursion depth.
    pub fn depth(&self) -> u32 {
        self.inner.state.lock().depth
    }

    fn take_ownership(&self, st: &mut MutexState, me: ThreadId) {
        st.owner = Some(me);
        st.depth = 1;
        if let Some(th) = thread::find(me) {
            th.note_mutex_acquired();
        }
    }

    /// One acquisition attempt; pends the caller on contention.
    fn grab_or_pend(&self) -> bool {
        sched::with_sched(|s| {
            let me = s.current();
            let mut st = self.inner.state.lock();
            match st.owner {
                None => {
                    self.take_ownership(&mut st, me);
                    true
                }
                Some(owner) if owner == me => {
                    st.depth += 1;
                    true
                }
                Some(owner) => {
                    if me.is_idle() {
                        // Boot context polls; it has no descriptor to pend.
                        return false;
                    }
                    if !st.pend.any(|&t| t == me) {
                        st.pend.insert_sorted_by(me, |a, b| {
                            thread::effective_priority(*a).cmp(&thread::effective_priority(*b))
                        });
                    }
                    if let Some(th) = thread::find(me) {
                        th.set_blocked_on(Some(BlockedOn::Mutex(Arc::clone(&self.inner))));
                        th.set_state(ThreadState::WaitForMutex);
                    }
                    if thread::effective_priority(me) < thread::effective_priority(owner) {
                        st.to_yield = true;
                    }
                    false
                }
            }
        })
    }

    /// Full release at depth zero: hand the mutex back and promote the
    /// highest-priority waiter. The waiter kept its run-queue slot, so the
    /// promotion is a pure state change.
    fn release(st: &mut MutexState, me: ThreadId) -> bool {
        st.owner = None;
        if let Some(th) = thread::find(me) {
            th.note_mutex_released();
        }
        if let Some(next) = st.pend.pop_front() {
            if let Some(th) = thread::find(next) {
                th.set_blocked_on(None);
                th.set_state(ThreadState::Runnable);
            }
        }
        core::mem::take(&mut st.to_yield)
    }

    /// One acquisition attempt, exposed so tests can model the
    /// block-and-yield step without entering the polling loop.
    #[cfg(test)]
    pub(crate) fn test_grab_or_pend(&self) -> bool {
        self.grab_or_pend()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::test_support;

    #[test]
    fn test_recursive_lock_unlock_releases() {
        let _g = test_support::lock();
        test_support::reset();

        let m = Mutex::new();
        m.lock();
        m.lock();
        assert_eq!(m.depth(), 2);
        m.unlock();
        assert!(m.is_owner());
        m.unlock();
        assert_eq!(m.owner(), None);
        assert_eq!(m.depth(), 0);
    }

    #[test]
    fn test_try_lock_uncontended() {
        let _g = test_support::lock();
        test_support::reset();

        let m = Mutex::new();
        assert!(m.try_lock());
        assert!(m.try_lock());
        m.unlock();
        m.unlock();
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn test_restore_releases_only_for_owner() {
        let _g = test_support::lock();
        test_support::reset();

        let m = Mutex::new();
        // Not owned: restore is a no-op.
        m.restore();
        assert_eq!(m.owner(), None);

        m.lock();
        m.lock();
        m.restore();
        assert_eq!(m.owner(), None);
        assert_eq!(m.depth(), 0);
    }

    #[test]
    #[should_panic]
    fn test_unowned_unlock_faults() {
        let _g = test_support::lock();
        test_support::reset();

        let m = Mutex::new();
        m.unlock();
    }
}
