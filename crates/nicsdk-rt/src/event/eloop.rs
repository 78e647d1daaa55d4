// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-thread event loop: poll-based fd watchers, wall-time timers, and
//! prepare ("about to wait") hooks.
//!
//! The loop is single-threaded by construction: watcher handles are
//! `Rc`-backed and `!Send`, and every start/stop call asserts it runs on
//! the owning event thread. Cross-thread interaction happens exclusively
//! through the thread's waker (see the async watcher in `event::run_`).
//!
//! # Re-entrancy
//!
//! Callbacks may start and stop watchers, including their own. Dispatch
//! never holds a loop borrow across a user callback, and a callback is
//! taken out of its watcher slot for the duration of the call and restored
//! afterwards.

use mio::unix::SourceFd;
use mio::{Interest, Poll, Token};
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::{SdkError, SdkResult};
use crate::event::{with_current, MAX_CALLBACK_DURATION};

/// Token reserved for the thread's cross-thread waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// First token handed to watchers.
const FIRST_WATCHER_TOKEN: usize = 1;

/// Maximum events processed per poll.
const MAX_EVENTS: usize = 128;

/// Readiness event set for fd watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Events(u8);

impl Events {
    pub const READ: Events = Events(0x1);
    pub const WRITE: Events = Events(0x2);

    pub fn readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    fn to_interest(self) -> Option<Interest> {
        match (self.readable(), self.writable()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn from_mio(ev: &mio::event::Event) -> Events {
        let mut out = Events::default();
        if ev.is_readable() {
            out = out | Events::READ;
        }
        if ev.is_writable() {
            out = out | Events::WRITE;
        }
        out
    }
}

impl std::ops::BitOr for Events {
    type Output = Events;
    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

pub type IoCb = Box<dyn FnMut(RawFd, Events)>;
pub type TimerCb = Box<dyn FnMut()>;
pub type PrepareCb = Box<dyn FnMut()>;

pub(crate) struct IoWatcher {
    fd: RawFd,
    events: Cell<Events>,
    token: Cell<Option<Token>>,
    cb: RefCell<Option<IoCb>>,
}

pub(crate) struct TimerWatcher {
    after: Cell<f64>,
    repeat: Cell<f64>,
    deadline: Cell<Option<Instant>>,
    token: Cell<Option<Token>>,
    cb: RefCell<Option<TimerCb>>,
}

pub(crate) struct PrepareWatcher {
    active: Cell<bool>,
    cb: RefCell<Option<PrepareCb>>,
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    token: Token,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.token.0.cmp(&other.token.0))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Loop state. Lives in a thread-local `Rc<RefCell<..>>` on the owning
/// thread; no borrow is held across a user callback.
pub(crate) struct LoopInner {
    poll: Poll,
    ios: HashMap<Token, Rc<IoWatcher>>,
    timers: HashMap<Token, Rc<TimerWatcher>>,
    timer_heap: BinaryHeap<Reverse<HeapEntry>>,
    prepares: Vec<Rc<PrepareWatcher>>,
    next_token: usize,
    /// Wall-clock seconds cached at the top of each loop iteration.
    now_cached: f64,
    break_loop: bool,
}

impl LoopInner {
    pub(crate) fn new(poll: Poll) -> Self {
        Self {
            poll,
            ios: HashMap::new(),
            timers: HashMap::new(),
            timer_heap: BinaryHeap::new(),
            prepares: Vec::new(),
            next_token: FIRST_WATCHER_TOKEN,
            now_cached: unix_now(),
            break_loop: false,
        }
    }

    pub(crate) fn now_cached(&self) -> f64 {
        self.now_cached
    }

    pub(crate) fn request_break(&mut self) {
        self.break_loop = true;
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Poll timeout derived from the soonest timer deadline. Stale heap
    /// entries can only make the timeout shorter, never longer.
    fn next_timeout(&self) -> Option<Duration> {
        let Reverse(entry) = self.timer_heap.peek()?;
        Some(entry.deadline.saturating_duration_since(Instant::now()))
    }
}

pub(crate) fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Invoke a callback and trace it if it overstays its welcome.
fn timed(what: &str, f: impl FnOnce()) {
    let start = Instant::now();
    f();
    let secs = start.elapsed().as_secs_f64();
    if secs > MAX_CALLBACK_DURATION {
        log::debug!("[evthread] {} callback took {:.3} seconds", what, secs);
    }
}

// ----------------------------------------------------------------------
// Io watcher
// ----------------------------------------------------------------------

/// File-descriptor watcher.
///
/// Must be created, started, and stopped on the owning event thread; the
/// handle is `!Send`, and start/stop panic outside an event thread.
pub struct Io {
    inner: Rc<IoWatcher>,
}

impl Io {
    pub fn new(fd: RawFd, events: Events, cb: impl FnMut(RawFd, Events) + 'static) -> Self {
        Self {
            inner: Rc::new(IoWatcher {
                fd,
                events: Cell::new(events),
                token: Cell::new(None),
                cb: RefCell::new(Some(Box::new(cb))),
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn is_active(&self) -> bool {
        self.inner.token.get().is_some()
    }

    /// Register the fd with the thread's poller.
    pub fn start(&self) -> SdkResult<()> {
        let interest = self
            .inner
            .events
            .get()
            .to_interest()
            .ok_or(SdkError::InvalidArg("io watcher needs a non-empty event set"))?;
        if self.is_active() {
            return Ok(());
        }
        with_current(|ctx| {
            let mut inner = ctx.eloop.borrow_mut();
            let token = inner.alloc_token();
            inner
                .poll
                .registry()
                .register(&mut SourceFd(&self.inner.fd), token, interest)?;
            self.inner.token.set(Some(token));
            inner.ios.insert(token, Rc::clone(&self.inner));
            Ok(())
        })
    }

    /// Deregister the fd. Safe to call from the watcher's own callback.
    pub fn stop(&self) {
        let Some(token) = self.inner.token.take() else {
            return;
        };
        with_current(|ctx| {
            let mut inner = ctx.eloop.borrow_mut();
            inner.ios.remove(&token);
            if let Err(e) = inner
                .poll
                .registry()
                .deregister(&mut SourceFd(&self.inner.fd))
            {
                log::error!("[evthread] io deregister failed for fd {}: {}", self.inner.fd, e);
            }
        });
    }
}

impl Clone for Io {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

// ----------------------------------------------------------------------
// Wall-time timer watcher
// ----------------------------------------------------------------------

/// Wall-time timer, libev-style: fires once after `after` seconds, then
/// every `repeat` seconds while `repeat > 0`.
pub struct EvTimer {
    inner: Rc<TimerWatcher>,
}

impl EvTimer {
    pub fn new(after: f64, repeat: f64, cb: impl FnMut() + 'static) -> Self {
        Self {
            inner: Rc::new(TimerWatcher {
                after: Cell::new(after),
                repeat: Cell::new(repeat),
                deadline: Cell::new(None),
                token: Cell::new(None),
                cb: RefCell::new(Some(Box::new(cb))),
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.token.get().is_some()
    }

    /// Reconfigure delays. Takes effect on the next start or again.
    pub fn set(&self, after: f64, repeat: f64) {
        self.inner.after.set(after);
        self.inner.repeat.set(repeat);
    }

    /// Arm the timer to fire after its configured initial delay.
    pub fn start(&self) {
        self.arm_(self.inner.after.get());
    }

    /// Re-arm from the repeat value, the ev_timer_again idiom: active
    /// timers are pushed out by `repeat`, inactive ones started with it;
    /// a zero repeat stops the timer instead.
    pub fn again(&self) {
        let repeat = self.inner.repeat.get();
        if repeat > 0.0 {
            self.arm_(repeat);
        } else {
            self.stop();
        }
    }

    pub fn stop(&self) {
        let Some(token) = self.inner.token.take() else {
            return;
        };
        self.inner.deadline.set(None);
        with_current(|ctx| {
            ctx.eloop.borrow_mut().timers.remove(&token);
        });
    }

    fn arm_(&self, delay: f64) {
        let deadline = Instant::now() + Duration::from_secs_f64(delay.max(0.0));
        with_current(|ctx| {
            let mut inner = ctx.eloop.borrow_mut();
            let token = match self.inner.token.get() {
                Some(t) => t,
                None => {
                    let t = inner.alloc_token();
                    self.inner.token.set(Some(t));
                    inner.timers.insert(t, Rc::clone(&self.inner));
                    t
                }
            };
            self.inner.deadline.set(Some(deadline));
            inner.timer_heap.push(Reverse(HeapEntry { deadline, token }));
        });
    }
}

impl Clone for EvTimer {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

// ----------------------------------------------------------------------
// Prepare watcher
// ----------------------------------------------------------------------

/// Hook invoked each iteration just before the loop blocks in poll.
pub struct Prepare {
    inner: Rc<PrepareWatcher>,
}

impl Prepare {
    pub fn new(cb: impl FnMut() + 'static) -> Self {
        Self {
            inner: Rc::new(PrepareWatcher {
                active: Cell::new(false),
                cb: RefCell::new(Some(Box::new(cb))),
            }),
        }
    }

    pub fn start(&self) {
        if self.inner.active.replace(true) {
            return;
        }
        with_current(|ctx| {
            ctx.eloop.borrow_mut().prepares.push(Rc::clone(&self.inner));
        });
    }

    pub fn stop(&self) {
        // removed from the loop's list lazily on the next iteration
        self.inner.active.set(false);
    }
}

impl Clone for Prepare {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

// ----------------------------------------------------------------------
// Loop driver
// ----------------------------------------------------------------------

/// Run the loop until a break is requested by the async watcher.
///
/// `on_wake` handles waker events (stop/suspend checks and LFQ drain); it
/// may request a break through the loop handle. Returns `false` on an
/// unrecoverable poll failure.
pub(crate) fn run_loop(eloop: &Rc<RefCell<LoopInner>>, mut on_wake: impl FnMut()) -> bool {
    let mut events = mio::Events::with_capacity(MAX_EVENTS);

    loop {
        eloop.borrow_mut().now_cached = unix_now();

        dispatch_prepares(eloop);

        let timeout = eloop.borrow().next_timeout();
        // the borrow is held across the blocking poll; no callbacks run
        // while the thread waits, so no re-entrant borrow can occur
        let res = eloop.borrow_mut().poll.poll(&mut events, timeout);
        if let Err(e) = res {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("[evthread] poll failed: {}", e);
            return false;
        }

        for ev in events.iter() {
            match ev.token() {
                WAKER_TOKEN => on_wake(),
                token => dispatch_io(eloop, token, Events::from_mio(ev)),
            }
        }

        dispatch_timers(eloop);

        let mut inner = eloop.borrow_mut();
        if inner.break_loop {
            inner.break_loop = false;
            return true;
        }
    }
}

fn dispatch_prepares(eloop: &Rc<RefCell<LoopInner>>) {
    let prepares: Vec<Rc<PrepareWatcher>> = {
        let mut inner = eloop.borrow_mut();
        inner.prepares.retain(|p| p.active.get());
        inner.prepares.clone()
    };
    for p in prepares {
        if !p.active.get() {
            continue;
        }
        let Some(mut cb) = p.cb.borrow_mut().take() else {
            continue;
        };
        timed("prepare", || cb());
        if p.cb.borrow().is_none() {
            *p.cb.borrow_mut() = Some(cb);
        }
    }
}

fn dispatch_io(eloop: &Rc<RefCell<LoopInner>>, token: Token, events: Events) {
    let Some(w) = eloop.borrow().ios.get(&token).cloned() else {
        return; // stopped before dispatch
    };
    let Some(mut cb) = w.cb.borrow_mut().take() else {
        return;
    };
    timed("io", || cb(w.fd, events));
    if w.cb.borrow().is_none() {
        *w.cb.borrow_mut() = Some(cb);
    }
}

fn dispatch_timers(eloop: &Rc<RefCell<LoopInner>>) {
    loop {
        let now = Instant::now();
        let expired: Option<Rc<TimerWatcher>> = {
            let mut inner = eloop.borrow_mut();
            let mut found = None;
            while let Some(Reverse(top)) = inner.timer_heap.peek() {
                if top.deadline > now {
                    break;
                }
                let Reverse(entry) = inner.timer_heap.pop().expect("peeked entry");
                if let Some(w) = inner.timers.get(&entry.token) {
                    // a stale heap entry no longer matches the deadline
                    if w.deadline.get() == Some(entry.deadline) {
                        found = Some(Rc::clone(w));
                        break;
                    }
                }
            }
            found
        };
        let Some(w) = expired else {
            return;
        };

        // re-arm periodic timers before the callback so the callback can
        // stop or reconfigure the timer with the usual calls
        {
            let mut inner = eloop.borrow_mut();
            let repeat = w.repeat.get();
            if repeat > 0.0 {
                if let Some(token) = w.token.get() {
                    let deadline = now + Duration::from_secs_f64(repeat);
                    w.deadline.set(Some(deadline));
                    inner.timer_heap.push(Reverse(HeapEntry { deadline, token }));
                }
            } else {
                if let Some(token) = w.token.take() {
                    inner.timers.remove(&token);
                }
                w.deadline.set(None);
            }
        }

        let Some(mut cb) = w.cb.borrow_mut().take() else {
            continue;
        };
        timed("timer", || cb());
        if w.cb.borrow().is_none() {
            *w.cb.borrow_mut() = Some(cb);
        }
    }
}
