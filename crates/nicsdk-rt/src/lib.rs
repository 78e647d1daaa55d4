// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # nicsdk-rt - NIC SDK concurrency substrate
//!
//! The runtime core shared by the SDK's long-lived services: event threads
//! with per-thread loops, a process-wide hashed timer wheel driven by one
//! ticker thread, a fixed-size slab allocator for hot-path records, and
//! lock-free cross-thread messaging with thread-liveness notifications.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nicsdk_rt::event::{EventThreadBuilder, message_send};
//!
//! fn main() -> nicsdk_rt::SdkResult<()> {
//!     let worker = EventThreadBuilder::new("worker", 1)
//!         .on_message(|payload, _ctx| {
//!             if let Some(n) = payload.downcast_ref::<u64>() {
//!                 println!("got {}", n);
//!             }
//!         })
//!         .build()?;
//!     worker.start(Box::new(()))?;
//!
//!     message_send(1, Box::new(42u64))?;
//!
//!     worker.stop();
//!     worker.join();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application threads                         |
//! |   message_send(id, payload)  |  timer_schedule / timer_delete      |
//! +--------------------------------------------------------------------+
//! |  event threads (per-thread loops)   |  periodic (ticker) thread    |
//! |  io / timer / prepare watchers      |  timerfd -> twheel.tick()    |
//! |  LFQ drain + updown delivery        |  batched under clock jumps   |
//! +--------------------------------------------------------------------+
//! |  lfq (MPSC queue)  |  twheel (hashed wheel)  |  slab (allocator)   |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`event`] - event-thread runtime, watchers, registry, updown (start here)
//! - [`periodic`] - the ticker thread and process-wide timer API
//! - [`twheel`] - the hashed timer wheel itself
//! - [`slab`] - fixed-size object allocator
//! - [`lfq`] - lock-free MPSC message queue
//! - [`timerfd`] - monotonic periodic timerfd wrapper

pub mod error;
pub mod event;
pub mod lfq;
pub mod periodic;
pub mod slab;
pub mod timerfd;
pub mod twheel;

pub use error::{SdkError, SdkResult};
pub use event::{
    message_send, timestamp_now, updown_up_subscribe, EventThread, EventThreadBuilder, Registry,
    MAX_CALLBACK_DURATION, MAX_THREAD_ID,
};
pub use periodic::{
    periodic_thread_is_ready, periodic_thread_is_running, periodic_thread_start, timer_delete,
    timer_schedule, timer_update, timer_update_ctxt, timeout_remaining, PeriodicThread,
    BATCH_SLICE,
};
pub use slab::{Slab, SlabStats};
pub use twheel::{
    TimerCallback, TimerCtx, TimerHandle, TimerWheel, TWHEEL_DEFAULT_DURATION,
    TWHEEL_DEFAULT_SLICE_DURATION, TWHEEL_DELAY_DELETE,
};
