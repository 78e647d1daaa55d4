// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event-thread runtime.
//!
//! An event thread is a long-lived worker driven by a per-thread loop:
//! fd watchers, wall-time timers, prepare hooks, and an async wakeup
//! watcher fed by a lock-free cross-thread message queue. Threads are
//! registered in a process-wide table by integer id (0..=255) and publish
//! their liveness through the updown manager.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        EventThread                           |
//! |  +--------------------------------------------------------+  |
//! |  |                     poll loop                          |  |
//! |  |  - io watchers        (fd readiness)                   |  |
//! |  |  - wall-time timers   (deadline heap -> poll timeout)  |  |
//! |  |  - prepare hooks      (run before each wait)           |  |
//! |  |  - waker              (async watcher, token 0)         |  |
//! |  +--------------------------------------------------------+  |
//! |        ^ waker + LFQ                        |                |
//! |        |                                    v                |
//! |  message_send(id, payload)        message / updown callbacks |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Affinity
//!
//! Watcher start/stop and updown subscription must run on the owning
//! thread. Handles are `!Send` and the operations panic when invoked
//! outside an event thread; `message_send`, `stop`, `suspend_req`, and
//! `resume_req` are callable from anywhere.

mod eloop;
mod ipc;
mod registry;
mod updown;

pub use eloop::{Events, EvTimer, Io, Prepare};
pub use ipc::{IpcFdWatcher, IpcInfra, IpcProvider, IpcTimerWatcher};
pub use registry::{Registry, MAX_THREAD_ID};

use mio::{Poll, Waker};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::error::{SdkError, SdkResult};
use crate::lfq::{Lfq, LfqMsg};

/// Advisory upper bound on callback wall-clock duration, in seconds.
/// Longer dispatches emit a diagnostic trace.
pub const MAX_CALLBACK_DURATION: f64 = 0.25;

/// Message payload handed across threads. Ownership transfers to the
/// receiver on enqueue.
pub type MsgPayload = Box<dyn Any + Send>;

/// Per-thread user context, supplied to [`EventThread::start`] and handed
/// to every callback running on the thread.
pub type UserCtx = Box<dyn Any + Send>;

pub type InitCb = Box<dyn FnMut(&mut UserCtx) + Send>;
pub type ExitCb = Box<dyn FnMut(&mut UserCtx) + Send>;
pub type MessageCb = Box<dyn FnMut(MsgPayload, &mut UserCtx) + Send>;
pub type UpdownUpCb = Box<dyn FnMut(u8, &mut UserCtx) + Send>;

// ----------------------------------------------------------------------
// thread-local current-thread context
// ----------------------------------------------------------------------

pub(crate) struct CurrentCtx {
    pub(crate) shared: Arc<ThreadShared>,
    pub(crate) eloop: Rc<RefCell<eloop::LoopInner>>,
    pub(crate) parts: Rc<RefCell<ThreadLocalParts>>,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentCtx>> = const { RefCell::new(None) };
}

pub(crate) fn with_current<R>(f: impl FnOnce(&CurrentCtx) -> R) -> R {
    CURRENT.with(|c| {
        let b = c.borrow();
        let ctx = b
            .as_ref()
            .expect("affinity violation: not called from an event thread");
        f(ctx)
    })
}

fn try_with_current<R>(f: impl FnOnce(&CurrentCtx) -> R) -> Option<R> {
    CURRENT.with(|c| c.borrow().as_ref().map(f))
}

/// Id of the event thread the caller is running on, if any.
pub fn current_thread_id() -> Option<u8> {
    try_with_current(|ctx| ctx.shared.id())
}

/// Wall-clock seconds. Inside an event thread this is the loop's cached
/// per-iteration time; elsewhere it is a fresh system clock read.
pub fn timestamp_now() -> f64 {
    try_with_current(|ctx| ctx.eloop.borrow().now_cached()).unwrap_or_else(eloop::unix_now)
}

// ----------------------------------------------------------------------
// shared state
// ----------------------------------------------------------------------

struct StopState {
    stop: bool,
    suspend: bool,
    suspend_fn: Option<Box<dyn FnOnce() + Send>>,
}

/// Cross-thread view of an event thread.
pub(crate) struct ThreadShared {
    id: u8,
    name: String,
    registry: Arc<Registry>,
    lfq: Lfq,
    waker: Waker,
    stop_state: Mutex<StopState>,
    resume_cv: Condvar,
    ready: AtomicBool,
    running: AtomicBool,
    suspended: AtomicBool,
    sync_ipc: bool,
    cores_mask: Option<u64>,
    sched: Option<(i32, i32)>,
}

impl ThreadShared {
    pub(crate) fn id(&self) -> u8 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Queue an UP notification for `target` onto this thread and wake it.
    /// Called by the updown manager; delivery happens on this thread's
    /// loop, never synchronously on the publisher.
    pub(crate) fn handle_thread_up(&self, target: u8) {
        if let Err(e) = self.lfq.enqueue(LfqMsg::Updown { thread_id: target }) {
            log::error!("[evthread] {}: updown enqueue failed: {}", self.name, e);
            return;
        }
        if let Err(e) = self.waker.wake() {
            log::error!("[evthread] {}: wake failed: {}", self.name, e);
        }
    }

    pub(crate) fn send(&self, msg: LfqMsg) -> SdkResult<()> {
        self.lfq.enqueue(msg)?;
        self.waker.wake()?;
        Ok(())
    }
}

/// State owned by the thread itself while it runs.
pub(crate) struct ThreadLocalParts {
    user_ctx: UserCtx,
    exit: Option<ExitCb>,
    message: Option<MessageCb>,
    updown_cbs: HashMap<u8, UpdownUpCb>,
}

struct Startup {
    poll: Poll,
    init: Option<InitCb>,
    exit: Option<ExitCb>,
    message: Option<MessageCb>,
    ipc: Option<Arc<dyn IpcProvider>>,
}

// ----------------------------------------------------------------------
// builder
// ----------------------------------------------------------------------

/// Builder for [`EventThread`].
pub struct EventThreadBuilder {
    name: String,
    id: u8,
    registry: Option<Arc<Registry>>,
    init: Option<InitCb>,
    exit: Option<ExitCb>,
    message: Option<MessageCb>,
    ipc: Option<Arc<dyn IpcProvider>>,
    sync_ipc: bool,
    cores_mask: Option<u64>,
    sched: Option<(i32, i32)>,
}

impl EventThreadBuilder {
    pub fn new(name: impl Into<String>, id: u8) -> Self {
        Self {
            name: name.into(),
            id,
            registry: None,
            init: None,
            exit: None,
            message: None,
            ipc: None,
            sync_ipc: false,
            cores_mask: None,
            sched: None,
        }
    }

    /// Registry to register with; defaults to the process-wide one.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Called on the thread after IPC bring-up, before it is marked ready.
    pub fn on_init(mut self, f: impl FnMut(&mut UserCtx) + Send + 'static) -> Self {
        self.init = Some(Box::new(f));
        self
    }

    /// Called on the thread after the loop exits, before DOWN is published.
    pub fn on_exit(mut self, f: impl FnMut(&mut UserCtx) + Send + 'static) -> Self {
        self.exit = Some(Box::new(f));
        self
    }

    /// Called on the thread for every user message.
    pub fn on_message(mut self, f: impl FnMut(MsgPayload, &mut UserCtx) + Send + 'static) -> Self {
        self.message = Some(Box::new(f));
        self
    }

    /// External IPC provider, handed the infra callback table at loop
    /// bring-up.
    pub fn ipc_provider(mut self, provider: Arc<dyn IpcProvider>) -> Self {
        self.ipc = Some(provider);
        self
    }

    /// Initialize IPC synchronously instead of asynchronously.
    pub fn sync_ipc(mut self, sync: bool) -> Self {
        self.sync_ipc = sync;
        self
    }

    /// Best-effort CPU affinity mask applied at thread entry.
    pub fn cores_mask(mut self, mask: u64) -> Self {
        self.cores_mask = Some(mask);
        self
    }

    /// Best-effort OS scheduling policy and priority applied at entry.
    pub fn sched_policy(mut self, policy: i32, prio: i32) -> Self {
        self.sched = Some((policy, prio));
        self
    }

    /// Register the thread in the table and prepare its loop. The OS
    /// thread itself is created by [`EventThread::start`].
    pub fn build(self) -> SdkResult<EventThread> {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::clone(Registry::global()));
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), eloop::WAKER_TOKEN)?;
        let lfq = Lfq::new(&self.name)?;

        let shared = Arc::new(ThreadShared {
            id: self.id,
            name: self.name,
            registry: Arc::clone(&registry),
            lfq,
            waker,
            stop_state: Mutex::new(StopState {
                stop: false,
                suspend: false,
                suspend_fn: None,
            }),
            resume_cv: Condvar::new(),
            ready: AtomicBool::new(false),
            running: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            sync_ipc: self.sync_ipc,
            cores_mask: self.cores_mask,
            sched: self.sched,
        });
        registry.register(Arc::clone(&shared))?;

        Ok(EventThread {
            shared,
            join: Mutex::new(None),
            startup: Mutex::new(Some(Startup {
                poll,
                init: self.init,
                exit: self.exit,
                message: self.message,
                ipc: self.ipc,
            })),
        })
    }
}

// ----------------------------------------------------------------------
// event thread
// ----------------------------------------------------------------------

/// A long-lived worker thread driven by an event loop.
pub struct EventThread {
    shared: Arc<ThreadShared>,
    join: Mutex<Option<JoinHandle<()>>>,
    startup: Mutex<Option<Startup>>,
}

impl EventThread {
    pub fn id(&self) -> u8 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// True once the thread finished its init callback.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Launch the OS thread.
    pub fn start(&self, user_ctx: UserCtx) -> SdkResult<()> {
        let mut startup_slot = self.startup.lock();
        let startup = startup_slot
            .take()
            .ok_or(SdkError::InvalidArg("event thread already started"))?;

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let spawn = std::thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || run_(shared, startup, user_ctx));
        match spawn {
            Ok(handle) => {
                *self.join.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Request termination. Callable from any thread; idempotent. The loop
    /// observes the flag at its next wakeup; a suspended thread is resumed
    /// so it can exit.
    pub fn stop(&self) {
        let mut st = self.shared.stop_state.lock();
        if st.stop {
            return;
        }
        st.stop = true;
        self.shared.running.store(false, Ordering::Release);

        if self.shared.suspended.load(Ordering::Acquire) {
            st.suspend = false;
            st.suspend_fn = None;
            self.shared.resume_cv.notify_all();
        } else if let Err(e) = self.shared.waker.wake() {
            log::error!("[evthread] {}: stop wake failed: {}", self.shared.name, e);
        }
    }

    /// Request cooperative suspension: the loop breaks out and invokes `f`
    /// on the event thread, then parks until [`EventThread::resume_req`].
    pub fn suspend_req(&self, f: impl FnOnce() + Send + 'static) -> SdkResult<()> {
        {
            let mut st = self.shared.stop_state.lock();
            if st.stop {
                return Err(SdkError::NotRunning(self.shared.id));
            }
            st.suspend = true;
            st.suspend_fn = Some(Box::new(f));
        }
        self.shared.waker.wake()?;
        Ok(())
    }

    /// Resume a suspended thread.
    pub fn resume_req(&self) {
        let mut st = self.shared.stop_state.lock();
        st.suspend = false;
        st.suspend_fn = None;
        self.shared.resume_cv.notify_all();
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    /// Wait for the OS thread to exit.
    pub fn join(&self) {
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("[evthread] {}: thread panicked", self.shared.name);
            }
        }
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.stop();
        // joining from the thread's own callbacks would deadlock
        let on_own_thread = try_with_current(|ctx| Arc::ptr_eq(&ctx.shared, &self.shared))
            .unwrap_or(false);
        if !on_own_thread {
            self.join();
        }
        self.shared.registry.deregister(self.shared.id);
    }
}

// ----------------------------------------------------------------------
// cross-thread operations
// ----------------------------------------------------------------------

impl Registry {
    /// Enqueue a message for `thread_id` and wake its loop. The payload's
    /// ownership transfers to the receiving thread.
    pub fn message_send(&self, thread_id: u8, payload: MsgPayload) -> SdkResult<()> {
        let thread = self
            .lookup(thread_id)
            .ok_or(SdkError::NotRunning(thread_id))?;
        thread.send(LfqMsg::User(payload))
    }
}

/// [`Registry::message_send`] on the process-wide registry.
pub fn message_send(thread_id: u8, payload: MsgPayload) -> SdkResult<()> {
    Registry::global().message_send(thread_id, payload)
}

/// Subscribe the calling event thread to `target`'s UP transitions. The
/// callback runs on the calling thread, delivered through its own loop.
///
/// Must be called from an event thread; subscribing to oneself or
/// registering a second callback for the same target panics.
pub fn updown_up_subscribe(target: u8, cb: impl FnMut(u8, &mut UserCtx) + Send + 'static) {
    with_current(|ctx| {
        {
            let mut parts = ctx.parts.borrow_mut();
            assert!(
                !parts.updown_cbs.contains_key(&target),
                "updown callback already registered for thread {}",
                target
            );
            parts.updown_cbs.insert(target, Box::new(cb));
        }
        ctx.shared
            .registry
            .updown
            .subscribe(&ctx.shared.registry, ctx.shared.id, target);
    });
}

// ----------------------------------------------------------------------
// thread entry and message pump
// ----------------------------------------------------------------------

fn run_(shared: Arc<ThreadShared>, mut startup: Startup, user_ctx: UserCtx) {
    if let Some(mask) = shared.cores_mask {
        apply_cores_mask(mask);
    }
    if let Some((policy, prio)) = shared.sched {
        apply_sched_policy(policy, prio);
    }

    let eloop = Rc::new(RefCell::new(eloop::LoopInner::new(startup.poll)));
    let parts = Rc::new(RefCell::new(ThreadLocalParts {
        user_ctx,
        exit: startup.exit.take(),
        message: startup.message.take(),
        updown_cbs: HashMap::new(),
    }));
    CURRENT.with(|c| {
        *c.borrow_mut() = Some(CurrentCtx {
            shared: Arc::clone(&shared),
            eloop: Rc::clone(&eloop),
            parts: Rc::clone(&parts),
        })
    });

    // hand the infra callback table to the external IPC subsystem
    if let Some(provider) = startup.ipc.take() {
        let infra = IpcInfra::new();
        if shared.sync_ipc {
            provider.init_sync(shared.id, infra);
        } else {
            provider.init_async(shared.id, infra);
        }
    }

    if let Some(mut init) = startup.init.take() {
        let mut ctx = std::mem::replace(&mut parts.borrow_mut().user_ctx, Box::new(()));
        init(&mut ctx);
        parts.borrow_mut().user_ctx = ctx;
    }

    shared.ready.store(true, Ordering::Release);
    shared.registry.updown.up(&shared.registry, shared.id);
    log::debug!("[evthread] {} entering loop", shared.name);

    loop {
        let clean = {
            let shared = Arc::clone(&shared);
            let eloop_for_wake = Rc::clone(&eloop);
            let parts = Rc::clone(&parts);
            eloop::run_loop(&eloop, move || {
                handle_async_(&shared, &eloop_for_wake, &parts)
            })
        };
        if !clean {
            log::error!("[evthread] {}: loop failed, thread terminating", shared.name);
            break;
        }
        check_and_suspend_(&shared);
        if shared.stop_state.lock().stop {
            break;
        }
    }

    let exit = parts.borrow_mut().exit.take();
    if let Some(mut exit) = exit {
        let mut ctx = std::mem::replace(&mut parts.borrow_mut().user_ctx, Box::new(()));
        exit(&mut ctx);
        parts.borrow_mut().user_ctx = ctx;
    }

    shared.registry.updown.down(shared.id);
    shared.running.store(false, Ordering::Release);
    CURRENT.with(|c| *c.borrow_mut() = None);
    log::debug!("[evthread] {} exited", shared.name);
}

/// Async-watcher handler: runs under the stop mutex. Breaks the loop when
/// stop or suspension is requested, otherwise drains the queue to empty.
fn handle_async_(
    shared: &Arc<ThreadShared>,
    eloop: &Rc<RefCell<eloop::LoopInner>>,
    parts: &Rc<RefCell<ThreadLocalParts>>,
) {
    let guard = shared.stop_state.lock();
    if guard.stop || guard.suspend {
        eloop.borrow_mut().request_break();
        return;
    }
    process_lfq_(shared, parts);
    drop(guard);
}

fn process_lfq_(shared: &Arc<ThreadShared>, parts: &Rc<RefCell<ThreadLocalParts>>) {
    while let Some(msg) = shared.lfq.dequeue() {
        match msg {
            LfqMsg::User(payload) => dispatch_user_(shared, parts, payload),
            LfqMsg::Updown { thread_id } => dispatch_updown_(shared, parts, thread_id),
        }
    }
}

fn dispatch_user_(
    shared: &Arc<ThreadShared>,
    parts: &Rc<RefCell<ThreadLocalParts>>,
    payload: MsgPayload,
) {
    // the callback and context are taken out of the parts so the callback
    // may re-enter thread-local APIs (subscribe, watcher ops)
    let (cb, mut ctx) = {
        let mut p = parts.borrow_mut();
        (
            p.message.take(),
            std::mem::replace(&mut p.user_ctx, Box::new(())),
        )
    };
    let Some(mut cb) = cb else {
        log::error!(
            "[evthread] {}: user message dropped, no message callback",
            shared.name
        );
        parts.borrow_mut().user_ctx = ctx;
        return;
    };

    let start = Instant::now();
    cb(payload, &mut ctx);
    let secs = start.elapsed().as_secs_f64();
    if secs > MAX_CALLBACK_DURATION {
        log::debug!(
            "[evthread] {}: message callback took {:.3} seconds",
            shared.name,
            secs
        );
    }

    let mut p = parts.borrow_mut();
    p.user_ctx = ctx;
    if p.message.is_none() {
        p.message = Some(cb);
    }
}

fn dispatch_updown_(
    shared: &Arc<ThreadShared>,
    parts: &Rc<RefCell<ThreadLocalParts>>,
    thread_id: u8,
) {
    let (cb, mut ctx) = {
        let mut p = parts.borrow_mut();
        (
            p.updown_cbs.remove(&thread_id),
            std::mem::replace(&mut p.user_ctx, Box::new(())),
        )
    };
    let Some(mut cb) = cb else {
        log::error!(
            "[evthread] {}: no updown callback registered for thread {}",
            shared.name,
            thread_id
        );
        parts.borrow_mut().user_ctx = ctx;
        return;
    };

    let start = Instant::now();
    cb(thread_id, &mut ctx);
    let secs = start.elapsed().as_secs_f64();
    if secs > MAX_CALLBACK_DURATION {
        log::debug!(
            "[evthread] {}: updown callback took {:.3} seconds",
            shared.name,
            secs
        );
    }

    let mut p = parts.borrow_mut();
    p.user_ctx = ctx;
    p.updown_cbs.entry(thread_id).or_insert(cb);
}

fn check_and_suspend_(shared: &Arc<ThreadShared>) {
    let mut st = shared.stop_state.lock();
    if !st.suspend {
        return;
    }
    let f = st.suspend_fn.take();
    shared.suspended.store(true, Ordering::Release);
    if let Some(f) = f {
        drop(st);
        f();
        st = shared.stop_state.lock();
    }
    while st.suspend && !st.stop {
        shared.resume_cv.wait(&mut st);
    }
    shared.suspended.store(false, Ordering::Release);
}

#[cfg(target_os = "linux")]
fn apply_cores_mask(mask: u64) {
    // SAFETY: plain libc calls on a zeroed cpu_set_t for the calling thread.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in 0..64 {
            if mask & (1u64 << cpu) != 0 {
                libc::CPU_SET(cpu as usize, &mut set);
            }
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::warn!(
                "[evthread] sched_setaffinity failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_cores_mask(_mask: u64) {}

#[cfg(target_os = "linux")]
fn apply_sched_policy(policy: i32, prio: i32) {
    // SAFETY: plain libc call for the calling thread.
    unsafe {
        let param = libc::sched_param {
            sched_priority: prio,
        };
        if libc::sched_setscheduler(0, policy, &param) != 0 {
            log::warn!(
                "[evthread] sched_setscheduler failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_sched_policy(_policy: i32, _prio: i32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = Registry::new();
        let t1 = EventThreadBuilder::new("dup-a", 9)
            .registry(Arc::clone(&registry))
            .build()
            .expect("build");
        let err = EventThreadBuilder::new("dup-b", 9)
            .registry(Arc::clone(&registry))
            .build();
        assert!(matches!(err, Err(SdkError::DuplicateId(9))));
        drop(t1);

        // slot is free again after destruction
        let t3 = EventThreadBuilder::new("dup-c", 9)
            .registry(Arc::clone(&registry))
            .build();
        assert!(t3.is_ok());
    }

    #[test]
    fn test_message_send_to_unknown_thread() {
        let registry = Registry::new();
        let err = registry.message_send(42, Box::new(1u32));
        assert!(matches!(err, Err(SdkError::NotRunning(42))));
    }

    #[test]
    fn test_double_start_rejected() {
        let registry = Registry::new();
        let t = EventThreadBuilder::new("once", 3)
            .registry(Arc::clone(&registry))
            .build()
            .expect("build");
        t.start(Box::new(())).expect("start");
        assert!(t.start(Box::new(())).is_err());
        t.stop();
        t.join();
    }

    #[test]
    fn test_timestamp_now_outside_event_thread() {
        let now = timestamp_now();
        assert!(now > 0.0);
        assert!(current_thread_id().is_none());
    }
}
