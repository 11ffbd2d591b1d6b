//! Shared contexts: cooperative message dispatch on one thread
//!
//! A shared context multiplexes many clients onto a single thread, stack
//! and message queue. The runner loop receives one message at a time and
//! calls the addressed client's handler; clients therefore never preempt
//! each other and need no mutual exclusion among themselves.
//!
//! Back-pressure works through the resume protocol: a handler that cannot
//! finish (typically because a send filled the queue) returns false, the
//! runner parks the client on the resume list, and after every message it
//! tries to enqueue a resume message per parked client, stopping at the
//! first failure. The queue drains naturally, so a full queue only delays
//! the retry.
//!
//! Messages from other threads use the blocking send; handlers sending
//! into their own context must use the non-blocking variant to avoid
//! self-deadlock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use spin::Mutex as SpinMutex;

use crate::kern::list::List;
use crate::kern::mutex::Mutex;
use crate::kern::queue::Queue;
use crate::kern::sched;
use crate::kern::thread::{self, Thread};
use crate::kern::tick;
use crate::kern::timer::{self, CtxTimerCore};
use crate::types::{ClientId, Priority};

// ============================================================================
// Messages
// ============================================================================

/// Reserved message ids; the four top values belong to the runtime.
pub mod msg {
    /// Highest id available to applications.
    pub const LAST_USER: u32 = u32::MAX - 4;
    /// First message a client receives after attaching.
    pub const START_CLIENT: u32 = u32::MAX - 3;
    /// Detaches the addressed client after delivery.
    pub const STOP_CLIENT: u32 = u32::MAX - 2;
    /// Re-invokes a client that returned not-done.
    pub const RESUME_CLIENT: u32 = u32::MAX - 1;
    /// Broadcast only: stops every client, then the context.
    pub const STOP_CONTEXT: u32 = u32::MAX;
}

/// One message in a context queue. `client == None` is a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextMessage {
    pub client: Option<ClientId>,
    pub id: u32,
    pub data: usize,
}

impl ContextMessage {
    pub fn unicast(client: ClientId, id: u32, data: usize) -> Self {
        Self {
            client: Some(client),
            id,
            data,
        }
    }

    pub fn broadcast(id: u32, data: usize) -> Self {
        Self {
            client: None,
            id,
            data,
        }
    }
}

/// Client handler: called on the context thread with each message addressed
/// to the client and its private data word. Returns true when the work for
/// this message is complete; false parks the client for a resume.
pub type ClientHandler = fn(&SharedContext, &ContextMessage, usize) -> bool;

// ============================================================================
// Context State
// ============================================================================

struct ClientEntry {
    id: ClientId,
    handler: ClientHandler,
    data: usize,
    /// Last handler verdict; a parked resume is dropped once this is true.
    completed: bool,
}

struct Lists {
    clients: List<ClientEntry>,
    resume: List<ClientId>,
    next_client: u32,
}

struct ContextInner {
    /// Serializes client/resume list mutation against other threads.
    lock: Mutex,
    lists: SpinMutex<Lists>,
    queue: Queue<ContextMessage>,
}

/// Handle to a shared context; clones address the same context.
#[derive(Clone)]
pub struct SharedContext {
    inner: Arc<ContextInner>,
}

impl SharedContext {
    /// Create a context with a message queue of `depth` entries.
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                lock: Mutex::new(),
                lists: SpinMutex::new(Lists {
                    clients: List::new(),
                    resume: List::new(),
                    next_client: 1,
                }),
                queue: Queue::new(depth),
            }),
        }
    }

    /// Spawn the runner thread for this context.
    pub fn start_thread(&self, pri: Priority, stack_words: usize) -> Arc<Thread> {
        let handle = Box::into_raw(Box::new(self.clone())) as usize;
        let th = thread::create(pri, context_runner_entry, handle, stack_words);
        sched::run_thread(&th);
        th
    }

    // === Client management ===

    /// Attach a client and queue its start message. Blocking; call from
    /// outside the context.
    pub fn start_client(&self, handler: ClientHandler, data: usize) -> ClientId {
        let id = self.attach(handler, data);
        self.inner
            .queue
            .send(ContextMessage::unicast(id, msg::START_CLIENT, 0));
        id
    }

    /// Queue a stop message; the client detaches after handling it.
    pub fn stop_client(&self, client: ClientId) {
        self.inner
            .queue
            .send(ContextMessage::unicast(client, msg::STOP_CLIENT, 0));
    }

    fn attach(&self, handler: ClientHandler, data: usize) -> ClientId {
        self.inner.lock.lock();
        let id = {
            let mut lists = self.inner.lists.lock();
            let id = ClientId(lists.next_client);
            lists.next_client += 1;
            lists.clients.push_back(ClientEntry {
                id,
                handler,
                data,
                completed: false,
            });
            id
        };
        self.inner.lock.unlock();
        id
    }

    /// Number of attached clients.
    pub fn client_count(&self) -> usize {
        self.inner.lists.lock().clients.len()
    }

    // === Message entry points ===

    /// Blocking send from another thread.
    pub fn send_message(&self, message: ContextMessage) {
        self.inner.queue.send(message);
    }

    /// Non-blocking send; the right call from inside a handler. ISR-safe.
    pub fn try_send_message(&self, message: ContextMessage) -> bool {
        self.inner.queue.try_send(message)
    }

    /// Blocking broadcast to every attached client.
    pub fn broadcast(&self, id: u32, data: usize) {
        self.inner.queue.send(ContextMessage::broadcast(id, data));
    }

    /// Stop every client and then the runner.
    pub fn stop(&self) {
        self.broadcast(msg::STOP_CONTEXT, 0);
    }

    // === Runner ===

    /// The context runner loop; runs until a `StopContext` broadcast.
    pub fn run(&self) {
        loop {
            let message = self.inner.queue.receive();
            if !self.dispatch(message) {
                break;
            }
            self.pump_resume();
        }
        // Exit path: everything still queued is dropped, including resumes
        // whose targets completed during the stop sweep.
        while self.inner.queue.try_receive().is_some() {}
    }

    /// Deliver one message. Returns false when the runner must exit.
    fn dispatch(&self, message: ContextMessage) -> bool {
        match message.client {
            Some(client) => {
                self.deliver(client, &message);
                true
            }
            None => {
                let stopping = message.id == msg::STOP_CONTEXT;
                let deliver_id = if stopping {
                    msg::STOP_CLIENT
                } else {
                    message.id
                };
                // Per-client copy of the broadcast; the snapshot keeps the
                // sweep stable while handlers attach or detach clients.
                let targets: Vec<ClientId> =
                    self.inner.lists.lock().clients.iter().map(|c| c.id).collect();
                for client in targets {
                    self.deliver(
                        client,
                        &ContextMessage::unicast(client, deliver_id, message.data),
                    );
                }
                !stopping
            }
        }
    }

    fn deliver(&self, client: ClientId, message: &ContextMessage) {
        let snapshot = self.inner.lists.lock().clients.find_map_mut(|c| {
            if c.id == client {
                Some((c.handler, c.data, c.completed))
            } else {
                None
            }
        });
        let (handler, data, completed) = match snapshot {
            Some(s) => s,
            None => return, // already detached; drop silently
        };
        // A queued resume is stale once the client completed on a
        // subsequent message.
        if message.id == msg::RESUME_CLIENT && completed {
            return;
        }

        let done = handler(self, message, data);

        self.inner.lock.lock();
        {
            let mut lists = self.inner.lists.lock();
            let _ = lists.clients.find_map_mut(|c| {
                if c.id == client {
                    c.completed = done;
                    Some(())
                } else {
                    None
                }
            });
            if done {
                let _ = lists.resume.remove_first_where(|&r| r == client);
            } else if !lists.resume.any(|&r| r == client) {
                lists.resume.push_back(client);
            }
            if message.id == msg::STOP_CLIENT {
                let _ = lists.clients.remove_first_where(|c| c.id == client);
                let _ = lists.resume.remove_first_where(|&r| r == client);
            }
        }
        self.inner.lock.unlock();
    }

    /// Try to turn parked clients into queued resume messages, stopping at
    /// the first full-queue failure; the next message pumps again.
    fn pump_resume(&self) {
        loop {
            let next = {
                let mut lists = self.inner.lists.lock();
                loop {
                    match lists.resume.front().copied() {
                        None => break None,
                        Some(client) => {
                            let parked = lists
                                .clients
                                .iter()
                                .find(|c| c.id == client)
                                .map(|c| !c.completed)
                                .unwrap_or(false);
                            if parked {
                                break Some(client);
                            }
                            // Completed or detached since parking: drop it.
                            lists.resume.pop_front();
                        }
                    }
                }
            };
            let client = match next {
                Some(c) => c,
                None => return,
            };
            let resume = ContextMessage::unicast(client, msg::RESUME_CLIENT, 0);
            if !self.inner.queue.try_send(resume) {
                return;
            }
            let _ = self
                .inner
                .lists
                .lock()
                .resume
                .remove_first_where(|&r| r == client);
        }
    }

    fn queue(&self) -> &Queue<ContextMessage> {
        &self.inner.queue
    }

    #[cfg(test)]
    fn is_idle_for_test(&self) -> bool {
        self.inner.queue.is_empty() && self.inner.lists.lock().resume.is_empty()
    }

    /// One non-blocking runner step for drivers that poll instead of
    /// dedicating a thread: deliver at most one message. Returns false once
    /// a `StopContext` has been processed.
    pub fn poll_once(&self) -> bool {
        match self.inner.queue.try_receive() {
            Some(message) => {
                let alive = self.dispatch(message);
                if alive {
                    self.pump_resume();
                } else {
                    while self.inner.queue.try_receive().is_some() {}
                }
                alive
            }
            None => true,
        }
    }
}

fn context_runner_entry(arg: usize) -> u32 {
    let ctx = unsafe { Box::from_raw(arg as *mut SharedContext) };
    ctx.run();
    0
}

// ============================================================================
// Context Timer
// ============================================================================

/// A timer that posts a pre-stored message into a context's queue from the
/// tick handler, dropping it silently when the queue is full. The sender
/// re-arms with `reset` after a successful delivery.
pub struct ContextTimer {
    queue: Queue<ContextMessage>,
    core: Arc<CtxTimerCore>,
}

impl ContextTimer {
    pub fn new(context: &SharedContext) -> Self {
        Self {
            queue: context.queue().clone(),
            core: CtxTimerCore::new(),
        }
    }

    /// Arm the timer: after `ticks`, try to post `message`.
    pub fn set(&self, ticks: u64, message: ContextMessage) {
        self.core.interval.store(ticks, Ordering::Relaxed);
        *self.core.msg.lock() = Some(message);
        self.rearm(ticks);
    }

    /// Re-arm with the stored interval and message.
    pub fn reset(&self) {
        let ticks = self.core.interval.load(Ordering::Relaxed);
        self.rearm(ticks);
    }

    /// Disarm.
    pub fn cancel(&self) {
        self.core.generation.fetch_add(1, Ordering::AcqRel);
        timer::cancel_context_message(&self.core);
    }

    fn rearm(&self, ticks: u64) {
        self.core.generation.fetch_add(1, Ordering::AcqRel);
        timer::cancel_context_message(&self.core);
        timer::arm_context_message(&self.core, self.queue.clone(), tick::now() + ticks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::test_support;
    use std::string::String;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec as StdVec;

    static LOG: StdMutex<StdVec<String>> = StdMutex::new(StdVec::new());

    fn log_event(event: String) {
        LOG.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    fn take_log() -> StdVec<String> {
        core::mem::take(&mut *LOG.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn chatty_client(_ctx: &SharedContext, message: &ContextMessage, data: usize) -> bool {
        let tag = data;
        match message.id {
            msg::START_CLIENT => log_event(std::format!("start {tag}")),
            msg::STOP_CLIENT => log_event(std::format!("stop {tag}")),
            id => log_event(std::format!("msg {tag}: {id}")),
        }
        true
    }

    #[test]
    fn test_start_deliver_stop_sequence() {
        let _g = test_support::lock();
        test_support::reset();
        take_log();

        let ctx = SharedContext::new(4);
        let a = ctx.start_client(chatty_client, 1);
        let b = ctx.start_client(chatty_client, 2);
        assert_eq!(ctx.client_count(), 2);

        assert!(ctx.poll_once()); // start a
        assert!(ctx.poll_once()); // start b

        assert!(ctx.try_send_message(ContextMessage::unicast(b, 5, 0)));
        assert!(ctx.poll_once());
        let _ = a;

        ctx.stop();
        assert!(!ctx.poll_once());
        assert_eq!(ctx.client_count(), 0);

        assert_eq!(take_log(), ["start 1", "start 2", "msg 2: 5", "stop 1", "stop 2"]);
    }

    #[test]
    fn test_broadcast_copies_per_client() {
        let _g = test_support::lock();
        test_support::reset();
        take_log();

        let ctx = SharedContext::new(4);
        ctx.start_client(chatty_client, 1);
        ctx.start_client(chatty_client, 2);
        assert!(ctx.poll_once());
        assert!(ctx.poll_once());

        assert!(ctx.try_send_message(ContextMessage::broadcast(9, 0)));
        assert!(ctx.poll_once());

        assert_eq!(take_log(), ["start 1", "start 2", "msg 1: 9", "msg 2: 9"]);
    }

    // A producer that pushes a burst of pings to a peer through the shared
    // queue; send failures park it on the resume list.
    struct PingState {
        peer: ClientId,
        sent: u32,
        total: u32,
    }

    static PING_STATE: StdMutex<Option<PingState>> = StdMutex::new(None);

    fn ping_producer(ctx: &SharedContext, message: &ContextMessage, _data: usize) -> bool {
        if message.id == msg::STOP_CLIENT {
            return true;
        }
        let mut guard = PING_STATE.lock().unwrap_or_else(|e| e.into_inner());
        let state = match guard.as_mut() {
            Some(s) => s,
            None => return true,
        };
        while state.sent < state.total {
            let ping = ContextMessage::unicast(state.peer, 100, state.sent as usize);
            if !ctx.try_send_message(ping) {
                // Queue full: come back on a resume message.
                return false;
            }
            state.sent += 1;
        }
        true
    }

    fn ping_consumer(_ctx: &SharedContext, message: &ContextMessage, _data: usize) -> bool {
        if message.id == 100 {
            log_event(std::format!("ping {}", message.data));
        }
        true
    }

    #[test]
    fn test_resume_protocol_delivers_every_ping() {
        let _g = test_support::lock();
        test_support::reset();
        take_log();

        // Queue depth 3 against a 25-ping burst forces the resume path.
        let ctx = SharedContext::new(3);
        let consumer = ctx.start_client(ping_consumer, 0);
        assert!(ctx.poll_once());

        *PING_STATE.lock().unwrap_or_else(|e| e.into_inner()) = Some(PingState {
            peer: consumer,
            sent: 0,
            total: 25,
        });
        let producer = ctx.start_client(ping_producer, 0);
        assert!(ctx.poll_once());

        // Drive the runner until the queue is quiet.
        for _ in 0..500 {
            assert!(ctx.poll_once());
            if ctx.is_idle_for_test() {
                break;
            }
        }

        let log = take_log();
        let pings: StdVec<&str> = log.iter().map(|s| s.as_str()).collect();
        let expected: StdVec<String> = (0..25).map(|i| std::format!("ping {i}")).collect();
        assert_eq!(pings, expected.iter().map(|s| s.as_str()).collect::<StdVec<_>>());
        let _ = producer;
    }

    #[test]
    fn test_context_timer_posts_and_drops_when_full() {
        let _g = test_support::lock();
        test_support::reset();

        let ctx = SharedContext::new(1);
        let ct = ContextTimer::new(&ctx);
        let client = ClientId(1);

        ct.set(2, ContextMessage::unicast(client, 42, 0));
        let base = crate::kern::tick::now();
        timer::process(base + 2);
        assert_eq!(
            ctx.queue().try_receive(),
            Some(ContextMessage::unicast(client, 42, 0))
        );

        // Full queue: the posting is dropped silently.
        assert!(ctx.queue().try_send(ContextMessage::unicast(client, 1, 0)));
        ct.reset();
        timer::process(base + 4);
        assert_eq!(
            ctx.queue().try_receive(),
            Some(ContextMessage::unicast(client, 1, 0))
        );
        assert_eq!(ctx.queue().try_receive(), None);
    }
}
