// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hashed timer wheel shared by all event threads.
//!
//! The wheel is a fixed array of slices, each covering one `slice_interval`
//! window and protected by its own lock. A single ticker thread drives the
//! wheel forward with [`TimerWheel::tick`]; any thread may add, cancel, or
//! update timers concurrently.
//!
//! # Entry storage
//!
//! Entries live in a block-based arena owned by the wheel (blocks of 256,
//! never moved once allocated). Callers hold `{index, generation}` handles;
//! the per-slot generation counter is bumped when a slot is reclaimed, so a
//! stale handle is detected instead of corrupting a recycled entry.
//!
//! # Delay delete
//!
//! A cancelled or expired entry is not reclaimed immediately. It is parked,
//! invalidated, in the slice `TWHEEL_DELAY_DELETE` ms ahead of the current
//! one; the ticker reclaims it when that slice comes around. The grace
//! period keeps the entry readable for concurrent callers that raced with
//! the cancellation.
//!
//! # Locking protocol
//!
//! All list mutations happen under the target slice's lock. `del` and
//! `update` must lock the entry's *current* slice; because a periodic
//! re-placement by `tick` can migrate the entry between the lock probe and
//! the acquisition, both retry in a load-lock-recheck loop. `update` holds
//! two slice locks with a strict order: the entry's current slice first,
//! then the target slice.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{SdkError, SdkResult};

/// Default per-slice interval, in milliseconds.
pub const TWHEEL_DEFAULT_SLICE_DURATION: u64 = 250;

/// Default duration of one full rotation around the wheel: 2 hours.
pub const TWHEEL_DEFAULT_DURATION: u64 = 2 * 60 * 60 * 1000;

/// Grace period between a timer's logical cancellation and the reclamation
/// of its slot, in milliseconds.
pub const TWHEEL_DELAY_DELETE: u64 = 2000;

/// Entries per arena block.
const ARENA_BLOCK_ELEMS: u32 = 256;

/// User context attached to a timer.
pub type TimerCtx = Option<Arc<dyn Any + Send + Sync>>;

/// Callback invoked when a timer fires.
pub type TimerCallback = Arc<dyn Fn(TimerHandle, u32, &TimerCtx) + Send + Sync>;

/// Opaque handle to a scheduled timer.
///
/// Valid between `add` and `TWHEEL_DELAY_DELETE` ms after cancellation;
/// operations on a stale handle are tolerated and logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    idx: u32,
    gen: u32,
}

/// Entry fields mutated only while holding the entry's current slice lock
/// (or before the entry is first linked).
struct EntryState {
    timer_id: u32,
    timeout_ms: u64,
    periodic: bool,
    /// Full-wheel rotations still to wait before this entry fires.
    nspins: u32,
    prev: Option<u32>,
    next: Option<u32>,
    ctxt: TimerCtx,
    cb: Option<TimerCallback>,
}

impl EntryState {
    const fn empty() -> Self {
        Self {
            timer_id: 0,
            timeout_ms: 0,
            periodic: false,
            nspins: 0,
            prev: None,
            next: None,
            ctxt: None,
            cb: None,
        }
    }
}

/// One arena slot.
struct EntrySlot {
    /// Bumped when the slot is reclaimed; detects stale handles.
    gen: AtomicU32,
    /// Slice this entry currently lives in. Read lock-free by the retry
    /// loops, written under the relevant slice locks.
    slice: AtomicU32,
    /// False while the entry sits in its delay-delete slice (or is free).
    valid: AtomicBool,
    state: UnsafeCell<EntryState>,
}

impl EntrySlot {
    fn new() -> Self {
        Self {
            gen: AtomicU32::new(0),
            slice: AtomicU32::new(0),
            valid: AtomicBool::new(false),
            state: UnsafeCell::new(EntryState::empty()),
        }
    }
}

/// One bucket of the wheel.
struct Slice {
    lock: Mutex<()>,
    /// Head of the intrusive entry list. Accessed only while the slice lock
    /// is held somewhere up-stack on the current thread.
    head: UnsafeCell<Option<u32>>,
}

/// Entry arena: blocks are appended but never moved or dropped until the
/// wheel itself is dropped, so raw slot references stay stable.
struct Arena {
    blocks: RwLock<Vec<Box<[EntrySlot]>>>,
    free: Mutex<Vec<u32>>,
}

thread_local! {
    /// Slice lock held by the ticker on this thread, if any. Lets a timer
    /// callback cancel or re-schedule a timer living in the slice the
    /// ticker has locked without self-deadlocking.
    static HELD_SLICE: Cell<Option<(usize, u32)>> = const { Cell::new(None) };
}

/// Hashed timer wheel with per-slice locking and delay-delete reclamation.
pub struct TimerWheel {
    slice_intvl: u64,
    nslices: u32,
    slices: Box<[Slice]>,
    /// Owned by the ticker thread; read racily by placement math.
    curr_slice: AtomicU32,
    /// Entries linked across all slices, delay-deleted ones included.
    num_entries: AtomicU32,
    arena: Arena,
}

// SAFETY: slice list heads and entry states are only accessed under the
// owning slice's lock (see the locking protocol in the module docs); slot
// atomics carry the cross-thread reads. Arena blocks never move.
unsafe impl Send for TimerWheel {}
unsafe impl Sync for TimerWheel {}

impl TimerWheel {
    /// Create a wheel with `wheel_duration / slice_intvl` slices.
    ///
    /// Both arguments are in milliseconds.
    pub fn new(slice_intvl: u64, wheel_duration: u64) -> SdkResult<Self> {
        if slice_intvl == 0 || wheel_duration == 0 || wheel_duration <= slice_intvl {
            return Err(SdkError::InvalidArg(
                "wheel_duration must exceed slice_intvl, both non-zero",
            ));
        }
        let nslices = (wheel_duration / slice_intvl) as u32;
        let slices = (0..nslices)
            .map(|_| Slice {
                lock: Mutex::new(()),
                head: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slice_intvl,
            nslices,
            slices,
            curr_slice: AtomicU32::new(0),
            num_entries: AtomicU32::new(0),
            arena: Arena {
                blocks: RwLock::new(Vec::new()),
                free: Mutex::new(Vec::new()),
            },
        })
    }

    pub fn slice_interval_ms(&self) -> u64 {
        self.slice_intvl
    }

    pub fn num_slices(&self) -> u32 {
        self.nslices
    }

    /// Number of entries linked in the wheel, delay-deleted ones included.
    pub fn num_entries(&self) -> u32 {
        self.num_entries.load(Ordering::Acquire)
    }

    /// True if the handle refers to a live, scheduled timer.
    pub fn timer_valid(&self, handle: TimerHandle) -> bool {
        match self.get_slot(handle.idx) {
            Some(slot) => {
                slot.gen.load(Ordering::Acquire) == handle.gen && slot.valid.load(Ordering::Acquire)
            }
            None => false,
        }
    }

    /// Schedule a timer.
    ///
    /// `timeout` and `initial_delay` are in milliseconds. The callback fires
    /// on the ticker thread; a periodic timer is re-placed with the same
    /// timeout after every expiry.
    pub fn add(
        &self,
        timer_id: u32,
        timeout: u64,
        ctxt: TimerCtx,
        cb: TimerCallback,
        periodic: bool,
        initial_delay: u64,
    ) -> TimerHandle {
        let idx = self.alloc_slot();
        let slot = self.slot(idx);
        let slice = self.next_slice_(initial_delay + timeout, 0, false);

        // SAFETY: the slot was just popped off the free list; no other
        // thread can reference it until it is linked below.
        unsafe {
            self.init_entry_(slot, timer_id, timeout, periodic, ctxt, Some(cb));
        }
        slot.slice.store(slice, Ordering::Release);
        let gen = slot.gen.load(Ordering::Acquire);

        let guard = self.lock_slice(slice);
        // SAFETY: target slice lock held.
        unsafe { self.insert_(idx, slot) };
        drop(guard);

        TimerHandle { idx, gen }
    }

    /// Cancel a timer and return its registered context.
    ///
    /// The entry is moved to its delay-delete slice; the slot is reclaimed
    /// only after the grace period expires. A stale handle returns `None`.
    pub fn del(&self, handle: TimerHandle) -> Option<TimerCtx> {
        let slot = self.get_slot(handle.idx)?;
        loop {
            let slice = slot.slice.load(Ordering::Acquire);
            let guard = self.lock_slice(slice);
            if slot.gen.load(Ordering::Acquire) != handle.gen {
                log::error!("[twheel] del on stale timer handle {:?}", handle);
                return None;
            }
            // slice may have moved under us (periodic re-placement by tick)
            if slot.slice.load(Ordering::Acquire) != slice {
                drop(guard);
                continue;
            }

            // SAFETY: entry's current slice lock held.
            let ctxt = unsafe { (*slot.state.get()).ctxt.clone() };
            if !slot.valid.load(Ordering::Acquire) {
                log::error!("[twheel] del on timer {:?} that is not scheduled", handle);
                return Some(ctxt);
            }
            // SAFETY: current slice lock held.
            unsafe { self.remove_(handle.idx, slot) };
            drop(guard);
            self.delay_delete_(handle.idx, slot);
            return Some(ctxt);
        }
    }

    /// Atomically re-place a timer with a new timeout, periodicity, and
    /// context. Returns the (unchanged) handle, or `None` if it was stale.
    ///
    /// When the newly computed target slice equals the entry's current
    /// slice, the target is advanced by one slice to avoid re-entrant
    /// locking; the effective timeout can therefore run one slice long.
    pub fn update(
        &self,
        handle: TimerHandle,
        timeout: u64,
        periodic: bool,
        ctxt: TimerCtx,
    ) -> Option<TimerHandle> {
        let slot = self.get_slot(handle.idx)?;
        loop {
            let entry_slice = slot.slice.load(Ordering::Acquire);
            let guard = self.lock_slice(entry_slice);
            if slot.gen.load(Ordering::Acquire) != handle.gen {
                log::error!("[twheel] update on stale timer handle {:?}", handle);
                return None;
            }
            if slot.slice.load(Ordering::Acquire) != entry_slice {
                drop(guard);
                continue;
            }

            if !slot.valid.load(Ordering::Acquire) {
                log::error!("[twheel] update on timer {:?} that is not scheduled", handle);
                return Some(handle);
            }
            // SAFETY: current slice lock held.
            unsafe { self.remove_(handle.idx, slot) };

            // re-init with updated params and insert in the right slice;
            // current slice lock stays held until the move completes
            let slice = self.next_slice_(timeout, entry_slice, true);
            let target_guard = self.lock_slice(slice);
            // SAFETY: entry is unlinked and both relevant locks are held.
            unsafe {
                let state = &mut *slot.state.get();
                let cb = state.cb.take();
                let timer_id = state.timer_id;
                self.init_entry_(slot, timer_id, timeout, periodic, ctxt, cb);
                slot.slice.store(slice, Ordering::Release);
                self.insert_(handle.idx, slot);
            }
            drop(target_guard);
            drop(guard);
            return Some(handle);
        }
    }

    /// Update a timer's context without re-placing it.
    pub fn update_ctxt(&self, handle: TimerHandle, ctxt: TimerCtx) -> Option<TimerHandle> {
        let slot = self.get_slot(handle.idx)?;
        loop {
            let slice = slot.slice.load(Ordering::Acquire);
            let guard = self.lock_slice(slice);
            if slot.gen.load(Ordering::Acquire) != handle.gen {
                log::error!("[twheel] update_ctxt on stale timer handle {:?}", handle);
                return None;
            }
            if slot.slice.load(Ordering::Acquire) != slice {
                drop(guard);
                continue;
            }
            // SAFETY: current slice lock held.
            unsafe { (*slot.state.get()).ctxt = ctxt };
            drop(guard);
            return Some(handle);
        }
    }

    /// Approximate milliseconds until the timer fires.
    pub fn remaining(&self, handle: TimerHandle) -> u64 {
        let Some(slot) = self.get_slot(handle.idx) else {
            return 0;
        };
        loop {
            let slice = slot.slice.load(Ordering::Acquire);
            let guard = self.lock_slice(slice);
            if slot.gen.load(Ordering::Acquire) != handle.gen {
                return 0;
            }
            if slot.slice.load(Ordering::Acquire) != slice {
                drop(guard);
                continue;
            }
            // SAFETY: current slice lock held.
            let nspins = unsafe { (*slot.state.get()).nspins };
            drop(guard);

            let curr = self.curr_slice.load(Ordering::Acquire);
            let span = self.nslices as u64 * self.slice_intvl;
            let ahead = (slice + self.nslices - curr) % self.nslices;
            return nspins as u64 * span + ahead as u64 * self.slice_intvl;
        }
    }

    /// Drive the wheel forward by `msecs_elapsed`.
    ///
    /// Called by the ticker thread, ideally once per slice interval.
    /// Returns immediately when less than one full slice has elapsed.
    pub fn tick(&self, msecs_elapsed: u64) {
        if msecs_elapsed < self.slice_intvl {
            return;
        }
        let mut nslices = msecs_elapsed / self.slice_intvl;

        while nslices > 0 {
            let cs = self.curr_slice.load(Ordering::Acquire);
            let guard = self.slices[cs as usize].lock.lock();
            HELD_SLICE.with(|h| h.set(Some((self as *const _ as *const () as usize, cs))));

            self.process_slice_(cs);

            HELD_SLICE.with(|h| h.set(None));
            drop(guard);
            self.curr_slice
                .store((cs + 1) % self.nslices, Ordering::Release);
            nslices -= 1;
        }
    }

    /// Process one slice, tail to head. Runs with the slice lock held.
    fn process_slice_(&self, cs: u32) {
        // SAFETY throughout: the slice lock for `cs` is held by tick();
        // every entry visited currently lives in `cs`, so its state is
        // owned by that lock. Mutable borrows of an entry's state are
        // dropped before the callback runs, because the callback may
        // legally re-enter the wheel.
        let mut cursor = unsafe { self.last_in_slice_(cs) };

        while let Some(idx) = cursor {
            let slot = self.slot(idx);

            // a callback may have moved the cached neighbour to another
            // slice (cancel or re-schedule of a timer we had not visited
            // yet); its links now belong to a list we do not hold, so
            // abandon the pass and pick the rest up next rotation
            if slot.slice.load(Ordering::Acquire) != cs {
                break;
            }

            let nspins = unsafe { (*slot.state.get()).nspins };

            if !slot.valid.load(Ordering::Acquire) {
                // delay-deleted entry; reclaim once its spins run out
                if nspins > 0 {
                    unsafe { (*slot.state.get()).nspins = nspins - 1 };
                    cursor = unsafe { (*slot.state.get()).prev };
                } else {
                    let prev = unsafe { (*slot.state.get()).prev };
                    unsafe { self.unlink_(idx, slot) };
                    self.reclaim_(idx, slot);
                    cursor = prev;
                }
                continue;
            }

            if nspins > 0 {
                // revisit after one more full rotation
                unsafe { (*slot.state.get()).nspins = nspins - 1 };
                cursor = unsafe { (*slot.state.get()).prev };
                continue;
            }

            // cache the neighbour before the callback runs; the callback
            // may cancel or re-schedule this entry
            let (prev, timer_id, periodic, cb, ctxt) = unsafe {
                let state = &*slot.state.get();
                (
                    state.prev,
                    state.timer_id,
                    state.periodic,
                    state.cb.clone(),
                    state.ctxt.clone(),
                )
            };
            let handle = TimerHandle {
                idx,
                gen: slot.gen.load(Ordering::Acquire),
            };

            if let Some(cb) = cb {
                cb(handle, timer_id, &ctxt);
            }

            // the callback may have cancelled or moved this entry; only
            // act if it still sits, valid, in the slice we hold
            let untouched = slot.valid.load(Ordering::Acquire)
                && slot.slice.load(Ordering::Acquire) == cs;
            if untouched {
                if periodic {
                    let timeout = unsafe { (*slot.state.get()).timeout_ms };
                    unsafe { self.upd_in_tick_(idx, slot, timeout) };
                } else {
                    unsafe { self.remove_(idx, slot) };
                    self.delay_delete_(idx, slot);
                }
            }
            cursor = prev;
        }
    }

    // ------------------------------------------------------------------
    // internal helpers
    // ------------------------------------------------------------------

    /// Compute the target slice for a timeout. With `update` set, a target
    /// equal to `entry_slice` is advanced by one slice, because update-style
    /// paths run with `entry_slice` already locked.
    fn next_slice_(&self, timeout: u64, entry_slice: u32, update: bool) -> u32 {
        let span = self.nslices as u64 * self.slice_intvl;
        let rem = timeout % span;
        let mut num_slices = (rem / self.slice_intvl) as u32;
        if num_slices == 0 {
            num_slices = 1;
        }
        let mut slice = (self.curr_slice.load(Ordering::Acquire) + num_slices) % self.nslices;
        if update && slice == entry_slice {
            slice = (slice + 1) % self.nslices;
        }
        slice
    }

    /// Initialize an entry's state ahead of insertion.
    ///
    /// SAFETY: caller must have exclusive access to the slot's state (fresh
    /// allocation, or current slice lock held with the entry unlinked).
    unsafe fn init_entry_(
        &self,
        slot: &EntrySlot,
        timer_id: u32,
        timeout: u64,
        periodic: bool,
        ctxt: TimerCtx,
        cb: Option<TimerCallback>,
    ) {
        let span = self.nslices as u64 * self.slice_intvl;
        let state = &mut *slot.state.get();
        state.timer_id = timer_id;
        state.timeout_ms = timeout;
        state.periodic = periodic;
        state.ctxt = ctxt;
        state.cb = cb;
        state.nspins = (timeout / span) as u32;
        state.prev = None;
        state.next = None;
        slot.valid.store(false, Ordering::Release);
    }

    /// Link an entry at the head of its slice list and mark it valid.
    ///
    /// SAFETY: caller holds the lock of the slice stored in `slot.slice`.
    unsafe fn insert_(&self, idx: u32, slot: &EntrySlot) {
        let slice = slot.slice.load(Ordering::Acquire) as usize;
        let head = &mut *self.slices[slice].head.get();
        let state = &mut *slot.state.get();
        state.next = *head;
        state.prev = None;
        if let Some(old) = *head {
            (*self.slot(old).state.get()).prev = Some(idx);
        }
        *head = Some(idx);
        slot.valid.store(true, Ordering::Release);
        self.num_entries.fetch_add(1, Ordering::AcqRel);
    }

    /// Unlink an entry from its slice list.
    ///
    /// SAFETY: caller holds the lock of the slice stored in `slot.slice`.
    unsafe fn unlink_(&self, idx: u32, slot: &EntrySlot) {
        let slice = slot.slice.load(Ordering::Acquire) as usize;
        let state = &mut *slot.state.get();
        if let Some(next) = state.next {
            (*self.slot(next).state.get()).prev = state.prev;
        }
        match state.prev {
            None => {
                let head = &mut *self.slices[slice].head.get();
                debug_assert_eq!(*head, Some(idx));
                *head = state.next;
            }
            Some(prev) => {
                (*self.slot(prev).state.get()).next = state.next;
            }
        }
        state.prev = None;
        state.next = None;
        self.num_entries.fetch_sub(1, Ordering::AcqRel);
    }

    /// Unlink an entry and mark it invalid.
    ///
    /// SAFETY: caller holds the lock of the slice stored in `slot.slice`.
    unsafe fn remove_(&self, idx: u32, slot: &EntrySlot) {
        if !slot.valid.load(Ordering::Acquire) {
            return;
        }
        self.unlink_(idx, slot);
        slot.valid.store(false, Ordering::Release);
    }

    /// Park an unlinked entry in the slice `TWHEEL_DELAY_DELETE` ms ahead,
    /// invalidated, so concurrent readers can finish with it before the
    /// slot is reclaimed.
    fn delay_delete_(&self, idx: u32, slot: &EntrySlot) {
        let entry_slice = slot.slice.load(Ordering::Acquire);
        let slice = self.next_slice_(TWHEEL_DELAY_DELETE, entry_slice, true);
        let guard = self.lock_slice(slice);
        // SAFETY: the entry is unlinked and invalid, so this thread has
        // exclusive access to its state; the target slice lock is held for
        // the insertion.
        unsafe {
            let timer_id = (*slot.state.get()).timer_id;
            self.init_entry_(slot, timer_id, TWHEEL_DELAY_DELETE, false, None, None);
            slot.slice.store(slice, Ordering::Release);
            self.insert_(idx, slot);
        }
        slot.valid.store(false, Ordering::Release);
        drop(guard);
    }

    /// Re-place a periodic entry from inside tick, same timeout.
    ///
    /// SAFETY: caller is the ticker and holds the current slice's lock;
    /// the entry lives in that slice.
    unsafe fn upd_in_tick_(&self, idx: u32, slot: &EntrySlot, timeout: u64) {
        self.remove_(idx, slot);
        let entry_slice = slot.slice.load(Ordering::Acquire);
        let slice = self.next_slice_(timeout, entry_slice, true);
        let guard = self.lock_slice(slice);
        let state = &mut *slot.state.get();
        let cb = state.cb.take();
        let ctxt = state.ctxt.clone();
        let timer_id = state.timer_id;
        self.init_entry_(slot, timer_id, timeout, true, ctxt, cb);
        slot.slice.store(slice, Ordering::Release);
        self.insert_(idx, slot);
        drop(guard);
    }

    /// Return a slot to the free list and invalidate outstanding handles.
    fn reclaim_(&self, idx: u32, slot: &EntrySlot) {
        // SAFETY: entry is unlinked; the ticker holds its slice lock, so no
        // handle operation can be mid-flight on this slot.
        unsafe {
            let state = &mut *slot.state.get();
            state.cb = None;
            state.ctxt = None;
        }
        slot.gen.fetch_add(1, Ordering::AcqRel);
        self.arena.free.lock().push(idx);
    }

    /// Walk to the last entry of a slice.
    ///
    /// SAFETY: caller holds the slice lock.
    unsafe fn last_in_slice_(&self, slice: u32) -> Option<u32> {
        let mut cursor = *self.slices[slice as usize].head.get();
        let mut last = None;
        while let Some(idx) = cursor {
            last = Some(idx);
            cursor = (*self.slot(idx).state.get()).next;
        }
        last
    }

    /// Acquire a slice lock, unless the calling thread (the ticker, inside
    /// a callback) already holds it.
    fn lock_slice(&self, slice: u32) -> Option<MutexGuard<'_, ()>> {
        let key = (self as *const _ as *const () as usize, slice);
        if HELD_SLICE.with(|h| h.get()) == Some(key) {
            return None;
        }
        Some(self.slices[slice as usize].lock.lock())
    }

    fn alloc_slot(&self) -> u32 {
        let mut free = self.arena.free.lock();
        if let Some(idx) = free.pop() {
            return idx;
        }
        let mut blocks = self.arena.blocks.write();
        let base = blocks.len() as u32 * ARENA_BLOCK_ELEMS;
        let block: Vec<EntrySlot> = (0..ARENA_BLOCK_ELEMS).map(|_| EntrySlot::new()).collect();
        blocks.push(block.into_boxed_slice());
        // keep `base` for the caller, free-list the rest
        free.extend((base + 1..base + ARENA_BLOCK_ELEMS).rev());
        base
    }

    fn get_slot(&self, idx: u32) -> Option<&EntrySlot> {
        let blocks = self.arena.blocks.read();
        let block = blocks.get((idx / ARENA_BLOCK_ELEMS) as usize)?;
        let slot = &block[(idx % ARENA_BLOCK_ELEMS) as usize];
        let ptr = slot as *const EntrySlot;
        drop(blocks);
        // SAFETY: arena blocks are boxed and never moved or dropped until
        // the wheel is dropped, so the reference stays valid for &self.
        Some(unsafe { &*ptr })
    }

    fn slot(&self, idx: u32) -> &EntrySlot {
        self.get_slot(idx).expect("arena index out of range")
    }
}
