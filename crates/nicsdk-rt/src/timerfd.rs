// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monotonic periodic timerfd (Linux).
//!
//! Wraps `timerfd_create`/`timerfd_settime`/`read` for the ticker thread.
//! The fd could equally be handed to poll/select; the ticker blocks on it
//! directly.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// A CLOCK_MONOTONIC timerfd armed with a fixed period.
pub struct TimerFd {
    fd: RawFd,
    period: Duration,
    missed_wakeups: u64,
}

impl TimerFd {
    /// Create the fd and arm it: first expiry after one period, then every
    /// period.
    pub fn new(period: Duration) -> io::Result<Self> {
        // SAFETY: plain syscalls; the fd is owned by this struct and closed
        // on drop.
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let tspec = libc::timespec {
            tv_sec: period.as_secs() as libc::time_t,
            tv_nsec: period.subsec_nanos() as libc::c_long,
        };
        let itspec = libc::itimerspec {
            it_interval: tspec,
            it_value: tspec,
        };
        // SAFETY: fd is a valid timerfd, itspec is fully initialized.
        let rc = unsafe { libc::timerfd_settime(fd, 0, &itspec, std::ptr::null_mut()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd was returned by timerfd_create above.
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Self {
            fd,
            period,
            missed_wakeups: 0,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Cumulative number of expirations observed so far.
    pub fn missed_wakeups(&self) -> u64 {
        self.missed_wakeups
    }

    /// Block until the next expiration and return the number of periods
    /// elapsed since the previous read. Interrupted reads (EINTR) are
    /// retried transparently.
    pub fn wait(&mut self) -> io::Result<u64> {
        let mut missed: u64 = 0;
        loop {
            // SAFETY: reading exactly 8 bytes into a u64, the timerfd wire
            // format.
            let rc = unsafe {
                libc::read(
                    self.fd,
                    &mut missed as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break;
        }
        if missed > 1 {
            log::trace!("[periodic] ticker missed {} wakeups", missed);
        }
        self.missed_wakeups += missed;
        Ok(missed)
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this struct and still open.
        unsafe { libc::close(self.fd) };
    }
}
