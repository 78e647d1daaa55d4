// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thread-liveness pub/sub.
//!
//! Event threads publish UP after finishing initialization and DOWN on the
//! way out. Subscribers receive UP notifications as messages queued through
//! their own event loop, never as a synchronous callback on the publisher's
//! thread; that is what makes updown callbacks reentrancy-safe. Only UP is
//! delivered; DOWN just updates status.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

use crate::event::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum UpdownStatus {
    #[default]
    Down,
    Up,
}

#[derive(Default)]
struct UpdownInner {
    status: HashMap<u8, UpdownStatus>,
    subscriptions: HashMap<u8, BTreeSet<u8>>,
}

/// Process-wide (per registry) thread up/down manager. All operations are
/// serialized by one mutex.
#[derive(Default)]
pub(crate) struct UpdownMgr {
    inner: Mutex<UpdownInner>,
}

impl UpdownMgr {
    /// Subscribe `subscriber` to `target`'s UP transitions. If the target
    /// is already UP, exactly one notification is queued immediately.
    ///
    /// Subscribing to oneself is a programming error and panics.
    pub(crate) fn subscribe(&self, registry: &Registry, subscriber: u8, target: u8) {
        assert_ne!(
            subscriber, target,
            "updown subscription to own thread id {}",
            target
        );
        let mut inner = self.inner.lock();
        if inner.status.get(&target).copied() == Some(UpdownStatus::Up) {
            let thread = registry
                .lookup(subscriber)
                .expect("updown subscriber thread not registered");
            thread.handle_thread_up(target);
        }
        inner.subscriptions.entry(target).or_default().insert(subscriber);
    }

    /// Mark `thread_id` UP and notify every subscriber through its queue.
    ///
    /// A duplicate UP is a broken lifecycle invariant and panics.
    pub(crate) fn up(&self, registry: &Registry, thread_id: u8) {
        let mut inner = self.inner.lock();
        assert_ne!(
            inner.status.get(&thread_id).copied(),
            Some(UpdownStatus::Up),
            "thread {} reported UP twice",
            thread_id
        );
        inner.status.insert(thread_id, UpdownStatus::Up);
        log::debug!("[updown] thread {} up", thread_id);
        if let Some(subscribers) = inner.subscriptions.get(&thread_id) {
            for &subscriber in subscribers {
                let thread = registry
                    .lookup(subscriber)
                    .expect("updown subscriber thread not registered");
                thread.handle_thread_up(thread_id);
            }
        }
    }

    /// Mark `thread_id` DOWN. No notification is delivered.
    pub(crate) fn down(&self, thread_id: u8) {
        let mut inner = self.inner.lock();
        inner.status.insert(thread_id, UpdownStatus::Down);
        log::debug!("[updown] thread {} down", thread_id);
    }

    #[cfg(test)]
    pub(crate) fn status(&self, thread_id: u8) -> UpdownStatus {
        self.inner
            .lock()
            .status
            .get(&thread_id)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let registry = Registry::new();
        let mgr = UpdownMgr::default();
        assert_eq!(mgr.status(1), UpdownStatus::Down);
        mgr.up(&registry, 1);
        assert_eq!(mgr.status(1), UpdownStatus::Up);
        mgr.down(1);
        assert_eq!(mgr.status(1), UpdownStatus::Down);
        // a thread may come back up after going down
        mgr.up(&registry, 1);
        assert_eq!(mgr.status(1), UpdownStatus::Up);
    }

    #[test]
    #[should_panic(expected = "reported UP twice")]
    fn test_duplicate_up_panics() {
        let registry = Registry::new();
        let mgr = UpdownMgr::default();
        mgr.up(&registry, 2);
        mgr.up(&registry, 2);
    }

    #[test]
    #[should_panic(expected = "subscription to own thread")]
    fn test_self_subscription_panics() {
        let registry = Registry::new();
        let mgr = UpdownMgr::default();
        mgr.subscribe(&registry, 3, 3);
    }
}
