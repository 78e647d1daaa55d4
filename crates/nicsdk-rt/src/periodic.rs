// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The periodic (ticker) thread.
//!
//! One dedicated thread owns the process's shared timer wheel: it arms a
//! monotonic timerfd at the wheel's slice interval, blocks on it, and
//! drives [`TimerWheel::tick`] with the elapsed time. Large clock jumps are
//! ticked in `BATCH_SLICE`-sized batches to bound callback latency, with a
//! liveness heartbeat punched between batches.
//!
//! The module-level `timer_*` functions operate on the process-wide ticker;
//! they are what application threads call to schedule work.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{SdkError, SdkResult};
use crate::timerfd::TimerFd;
use crate::twheel::{
    TimerCallback, TimerCtx, TimerHandle, TimerWheel, TWHEEL_DEFAULT_DURATION,
    TWHEEL_DEFAULT_SLICE_DURATION,
};

/// Upper bound on slices ticked per batch under large clock jumps.
pub const BATCH_SLICE: u64 = 10;

static GLOBAL_PERIODIC: OnceLock<PeriodicThread> = OnceLock::new();

struct PeriodicShared {
    twheel: Arc<TimerWheel>,
    slice_ms: u64,
    running: AtomicBool,
    ready: AtomicBool,
    stop: AtomicBool,
    /// Wall-clock milliseconds of the last heartbeat punch.
    heartbeat_ms: AtomicU64,
}

impl PeriodicShared {
    fn punch_heartbeat(&self) {
        self.heartbeat_ms.store(now_ms(), Ordering::Release);
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle to a running ticker thread and its wheel.
pub struct PeriodicThread {
    shared: Arc<PeriodicShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicThread {
    /// Spawn a ticker with the default wheel geometry (250 ms slices over
    /// a 2 h rotation).
    pub fn spawn() -> SdkResult<Self> {
        Self::spawn_with(TWHEEL_DEFAULT_SLICE_DURATION, TWHEEL_DEFAULT_DURATION)
    }

    /// Spawn a ticker with an explicit slice interval and wheel duration,
    /// both in milliseconds.
    pub fn spawn_with(slice_ms: u64, wheel_duration_ms: u64) -> SdkResult<Self> {
        let twheel = Arc::new(TimerWheel::new(slice_ms, wheel_duration_ms)?);
        let tfd = TimerFd::new(Duration::from_millis(slice_ms))?;

        let shared = Arc::new(PeriodicShared {
            twheel,
            slice_ms,
            running: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            heartbeat_ms: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("nicsdk-periodic".to_string())
            .spawn(move || run_(thread_shared, tfd))?;

        Ok(Self {
            shared,
            join: Mutex::new(Some(handle)),
        })
    }

    /// The wheel driven by this ticker.
    pub fn wheel(&self) -> &Arc<TimerWheel> {
        &self.shared.twheel
    }

    /// True while the ticker loop is alive.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// True once the ticker is armed and serving the wheel.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Wall-clock milliseconds of the last liveness heartbeat.
    pub fn last_heartbeat_ms(&self) -> u64 {
        self.shared.heartbeat_ms.load(Ordering::Acquire)
    }

    /// Request termination; the ticker observes the flag at its next
    /// wakeup, at most one slice interval later.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("[periodic] ticker thread panicked");
            }
        }
    }
}

fn run_(shared: Arc<PeriodicShared>, mut tfd: TimerFd) {
    shared.ready.store(true, Ordering::Release);
    shared.punch_heartbeat();

    while !shared.stop.load(Ordering::Acquire) {
        let mut missed = match tfd.wait() {
            Ok(missed) => missed,
            Err(e) => {
                log::error!("[periodic] failed to wait on timerfd: {}", e);
                break;
            }
        };

        // drive the wheel in bounded batches
        while missed > 0 {
            let batch = missed.min(BATCH_SLICE);
            shared.twheel.tick(batch * shared.slice_ms);
            shared.punch_heartbeat();
            missed -= batch;
        }
    }

    shared.running.store(false, Ordering::Release);
    log::info!("[periodic] ticker thread exiting");
}

// ----------------------------------------------------------------------
// process-wide ticker
// ----------------------------------------------------------------------

/// Start the process-wide ticker thread with default geometry. Fails if it
/// is already running.
pub fn periodic_thread_start() -> SdkResult<()> {
    let mut started = false;
    GLOBAL_PERIODIC.get_or_init(|| {
        started = true;
        PeriodicThread::spawn().expect("failed to spawn periodic thread")
    });
    if started {
        Ok(())
    } else {
        Err(SdkError::InvalidArg("periodic thread already started"))
    }
}

/// True only while the process-wide wheel is being served.
pub fn periodic_thread_is_running() -> bool {
    GLOBAL_PERIODIC.get().is_some_and(|p| p.is_running())
}

/// True once the process-wide ticker finished initialization.
pub fn periodic_thread_is_ready() -> bool {
    GLOBAL_PERIODIC.get().is_some_and(|p| p.is_ready())
}

fn global_wheel() -> Option<&'static Arc<TimerWheel>> {
    GLOBAL_PERIODIC.get().map(|p| p.wheel())
}

/// Schedule `cb` on the process-wide wheel after `timeout` ms (plus
/// `initial_delay` ms before the first expiry). Returns `None` when the
/// ticker is not running.
pub fn timer_schedule(
    timer_id: u32,
    timeout: u64,
    ctxt: TimerCtx,
    cb: TimerCallback,
    periodic: bool,
    initial_delay: u64,
) -> Option<TimerHandle> {
    let wheel = global_wheel()?;
    Some(wheel.add(timer_id, timeout, ctxt, cb, periodic, initial_delay))
}

/// Cancel a scheduled timer, returning its context.
pub fn timer_delete(handle: TimerHandle) -> Option<TimerCtx> {
    global_wheel()?.del(handle)
}

/// Re-place a scheduled timer.
pub fn timer_update(
    handle: TimerHandle,
    timeout: u64,
    periodic: bool,
    ctxt: TimerCtx,
) -> Option<TimerHandle> {
    global_wheel()?.update(handle, timeout, periodic, ctxt)
}

/// Swap a timer's context without re-placing it.
pub fn timer_update_ctxt(handle: TimerHandle, ctxt: TimerCtx) -> Option<TimerHandle> {
    global_wheel()?.update_ctxt(handle, ctxt)
}

/// Approximate milliseconds until the timer fires; 0 when the ticker is
/// not running or the handle is stale.
pub fn timeout_remaining(handle: TimerHandle) -> u64 {
    global_wheel().map_or(0, |w| w.remaining(handle))
}
