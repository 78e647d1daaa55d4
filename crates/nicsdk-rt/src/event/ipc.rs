// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration contract between an event thread and the external IPC
//! subsystem.
//!
//! The transport itself lives outside this crate; what matters here is how
//! it installs fds and timers into a thread's loop without knowing what
//! kind of loop it is. At bring-up the thread hands the provider an
//! [`IpcInfra`] with four operations: watch/unwatch an fd, add/delete a
//! one-shot timer. The infra handle is `!Send`, pinning every operation to
//! the owning thread, and handlers run through the loop's dispatch, which
//! measures their wall-clock duration against the callback budget.

use std::marker::PhantomData;
use std::os::fd::RawFd;

use crate::error::SdkResult;
use crate::event::eloop::{Events, EvTimer, Io};

/// External IPC subsystem hook, invoked on the event thread during loop
/// bring-up, before the thread's init callback.
pub trait IpcProvider: Send + Sync {
    /// Synchronous bring-up: the transport is expected to be usable when
    /// this returns.
    fn init_sync(&self, thread_id: u8, infra: IpcInfra);

    /// Asynchronous bring-up: the transport finishes initialization from
    /// its own watcher callbacks.
    fn init_async(&self, thread_id: u8, infra: IpcInfra);
}

/// The four factory callbacks exposed to the IPC subsystem.
///
/// Usable only on the owning event thread.
pub struct IpcInfra {
    _thread_affine: PhantomData<*const ()>,
}

impl IpcInfra {
    pub(crate) fn new() -> Self {
        Self {
            _thread_affine: PhantomData,
        }
    }

    /// Install a read watcher for `fd`; the handler receives the fd.
    pub fn fd_watch(
        &self,
        fd: RawFd,
        mut handler: impl FnMut(RawFd) + 'static,
    ) -> SdkResult<IpcFdWatcher> {
        let io = Io::new(fd, Events::READ, move |fd, _events| handler(fd));
        io.start()?;
        Ok(IpcFdWatcher { io })
    }

    /// Remove a previously installed fd watcher.
    pub fn fd_unwatch(&self, watcher: IpcFdWatcher) {
        watcher.io.stop();
    }

    /// Install a one-shot timer firing after `timeout` seconds.
    pub fn timer_add(&self, timeout: f64, handler: impl FnMut() + 'static) -> IpcTimerWatcher {
        let timer = EvTimer::new(timeout, 0.0, handler);
        timer.start();
        IpcTimerWatcher { timer }
    }

    /// Remove a previously installed timer watcher.
    pub fn timer_del(&self, watcher: IpcTimerWatcher) {
        watcher.timer.stop();
    }
}

/// Opaque handle for an IPC fd watcher.
pub struct IpcFdWatcher {
    io: Io,
}

/// Opaque handle for an IPC timer watcher.
pub struct IpcTimerWatcher {
    timer: EvTimer,
}
