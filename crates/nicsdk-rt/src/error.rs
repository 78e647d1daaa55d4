// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the runtime substrate.
//!
//! Fatal programming errors (watcher use from a foreign thread, duplicate
//! UP transition, self-subscription) are not represented here; those panic
//! with a diagnostic at the violation site.

use std::fmt;
use std::io;

/// Result type for runtime operations
pub type SdkResult<T> = Result<T, SdkError>;

/// Errors that can occur in the runtime substrate
#[derive(Debug)]
pub enum SdkError {
    /// Allocation failure from a slab or the backing allocator
    Oom,

    /// Event-thread factory called for an id that is already live
    DuplicateId(u8),

    /// Timer or slab operation on a null, stale, or alien handle
    InvalidHandle,

    /// Invalid argument to a constructor or operation
    InvalidArg(&'static str),

    /// Target thread is not running (message send, registry lookup)
    NotRunning(u8),

    /// OS-level failure (timerfd, poll, thread spawn)
    Io(io::Error),
}

impl fmt::Display for SdkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oom => write!(f, "out of memory"),
            Self::DuplicateId(id) => write!(f, "event thread id {} already in use", id),
            Self::InvalidHandle => write!(f, "invalid or stale handle"),
            Self::InvalidArg(what) => write!(f, "invalid argument: {}", what),
            Self::NotRunning(id) => write!(f, "thread {} is not running", id),
            Self::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for SdkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SdkError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
