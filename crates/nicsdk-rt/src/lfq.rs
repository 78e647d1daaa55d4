// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free MPSC message queue feeding one event thread.
//!
//! Any thread may enqueue; exactly one thread (the owning event thread)
//! dequeues. Message envelopes are allocated from a dedicated thread-safe
//! slab instead of the general heap, keeping the send path off malloc, and
//! are returned to the slab by the consumer after dispatch.

use crossbeam::queue::SegQueue;
use std::any::Any;
use std::ptr::NonNull;

use crate::error::SdkResult;
use crate::slab::Slab;

/// Envelopes per slab block.
const LFQ_SLAB_ELEMS_PER_BLOCK: usize = 64;

/// A message travelling through an event thread's queue.
pub enum LfqMsg {
    /// Application message; the payload's ownership transferred to the
    /// receiving thread on enqueue.
    User(Box<dyn Any + Send>),
    /// Thread-liveness notification: `thread_id` transitioned to UP.
    Updown { thread_id: u8 },
}

/// Raw envelope pointer moved through the queue.
struct MsgPtr(NonNull<LfqMsg>);

// SAFETY: the envelope is exclusively owned by whoever holds the MsgPtr;
// the producer writes it before pushing, the consumer reads it after
// popping, and the queue provides the release/acquire edge.
unsafe impl Send for MsgPtr {}

/// Multi-producer single-consumer message queue.
pub struct Lfq {
    queue: SegQueue<MsgPtr>,
    envelopes: Slab,
}

impl Lfq {
    pub fn new(name: &str) -> SdkResult<Self> {
        let envelopes = Slab::new(
            name,
            std::mem::size_of::<LfqMsg>(),
            LFQ_SLAB_ELEMS_PER_BLOCK,
            true, // shared by all producer threads
            true,
            false,
        )?;
        Ok(Self {
            queue: SegQueue::new(),
            envelopes,
        })
    }

    /// Enqueue a message. Callable from any thread; never blocks.
    pub fn enqueue(&self, msg: LfqMsg) -> SdkResult<()> {
        let raw = self.envelopes.alloc()?;
        let ptr = raw.cast::<LfqMsg>();
        // SAFETY: the slab guarantees an exclusive, 8-aligned allocation of
        // at least size_of::<LfqMsg>() bytes.
        unsafe { ptr.as_ptr().write(msg) };
        self.queue.push(MsgPtr(ptr));
        Ok(())
    }

    /// Dequeue one message. Only the owning event thread calls this.
    pub fn dequeue(&self) -> Option<LfqMsg> {
        let MsgPtr(ptr) = self.queue.pop()?;
        // SAFETY: the producer fully initialized the envelope before the
        // push; we take ownership of the value and recycle the slot.
        let msg = unsafe { ptr.as_ptr().read() };
        if let Err(e) = self.envelopes.free(ptr.cast()) {
            log::error!("[lfq] envelope free failed: {}", e);
        }
        Some(msg)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for Lfq {
    fn drop(&mut self) {
        // drain undelivered messages so payloads get their drop glue
        while self.dequeue().is_some() {}
    }
}
