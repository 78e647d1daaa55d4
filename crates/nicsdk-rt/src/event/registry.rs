// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide event-thread table and its companion updown manager.
//!
//! The table maps thread ids (0..=255) to live event threads. A default
//! registry is lazily created for the process; tests build their own so
//! each scenario starts from a clean table.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

use crate::error::{SdkError, SdkResult};
use crate::event::updown::UpdownMgr;
use crate::event::ThreadShared;

/// Highest usable event-thread id.
pub const MAX_THREAD_ID: u8 = 255;

static GLOBAL_REGISTRY: OnceLock<Arc<Registry>> = OnceLock::new();

/// Registry of live event threads, indexed by id.
pub struct Registry {
    threads: Mutex<Vec<Option<Arc<ThreadShared>>>>,
    pub(crate) updown: UpdownMgr,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            threads: Mutex::new(vec![None; MAX_THREAD_ID as usize + 1]),
            updown: UpdownMgr::default(),
        })
    }

    /// The process-wide default registry, created on first use.
    pub fn global() -> &'static Arc<Registry> {
        GLOBAL_REGISTRY.get_or_init(Registry::new)
    }

    pub(crate) fn register(&self, thread: Arc<ThreadShared>) -> SdkResult<()> {
        let mut table = self.threads.lock();
        let slot = &mut table[thread.id() as usize];
        if slot.is_some() {
            return Err(SdkError::DuplicateId(thread.id()));
        }
        *slot = Some(thread);
        Ok(())
    }

    pub(crate) fn deregister(&self, thread_id: u8) {
        self.threads.lock()[thread_id as usize] = None;
    }

    pub(crate) fn lookup(&self, thread_id: u8) -> Option<Arc<ThreadShared>> {
        self.threads.lock()[thread_id as usize].clone()
    }
}
