// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thread-safe fixed-size object allocator with per-block free lists.
//!
//! A slab hands out fixed-size elements carved from larger blocks, avoiding
//! per-object heap traffic on hot paths (timer records, message envelopes).
//! Free elements of a block form a singly-linked stack threaded through the
//! free elements themselves, so the allocator carries no side tables.
//!
//! # Layout
//!
//! ```text
//! block:  [ BlockHdr | elem 0 | elem 1 | ... | elem N-1 ]
//! elem:   [ meta (1 byte in-use flag, padded to 8) | payload ]
//! ```
//!
//! While an element is free, the first word of its payload stores the
//! pointer to the next free element's meta header.
//!
//! # Concurrency
//!
//! A single lock protects the whole slab across alloc/free/walk. Zeroing of
//! a returned payload happens outside the lock.

use parking_lot::Mutex;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::{self, NonNull};

use crate::error::{SdkError, SdkResult};

/// Per-element meta size. One byte carries the in-use flag; the rest is
/// padding so payloads stay 8-aligned.
const ELEM_META_SIZE: usize = 8;

/// Block header preceding the element array.
#[repr(C)]
struct BlockHdr {
    prev: *mut BlockHdr,
    next: *mut BlockHdr,
    /// Head of the block's free list; points at an element meta header.
    /// Null when the block is fully allocated.
    free_head: *mut u8,
    num_in_use: u32,
    _pad: u32,
}

/// Counter snapshot for a slab instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabStats {
    pub num_allocs: u64,
    pub num_frees: u64,
    pub num_in_use: u64,
    pub num_alloc_fails: u64,
    pub num_blocks: u32,
}

/// Mutable allocator state, guarded by the slab lock.
struct SlabCore {
    block_head: *mut BlockHdr,
    num_allocs: u64,
    num_frees: u64,
    num_in_use: u64,
    num_alloc_fails: u64,
    num_blocks: u32,
}

/// Fixed-size element allocator.
///
/// Elements are `elem_sz` bytes (rounded up to 8) and are carved from blocks
/// of `elems_per_block` elements. With `grow_on_demand` the slab allocates a
/// new block when all blocks are full, and returns a block to the backing
/// allocator when it becomes empty (the last remaining block is retained).
pub struct Slab {
    name: String,
    /// Caller-requested element size.
    elem_sz: usize,
    /// Usable payload bytes per element (elem_sz rounded up to 8).
    payload_sz: usize,
    /// Distance between consecutive element headers.
    stride: usize,
    elems_per_block: usize,
    raw_block_sz: usize,
    grow_on_demand: bool,
    zero_on_alloc: bool,
    core: Mutex<SlabCore>,
}

// SAFETY: all raw pointers in SlabCore reference memory owned by this slab
// and are only dereferenced while holding `core`. Payload pointers returned
// by alloc() are exclusively owned by the caller until passed back to free().
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Create a slab.
    ///
    /// # Arguments
    /// * `name` - used in traces
    /// * `elem_sz` - element payload size in bytes, minimum 8
    /// * `elems_per_block` - elements per block, minimum 2
    /// * `thread_safe` - retained for call-site parity; the slab always
    ///   locks (an uncontended acquire is a single CAS)
    /// * `grow_on_demand` - allocate new blocks when full, release empty ones
    /// * `zero_on_alloc` - zero the payload before returning it
    pub fn new(
        name: &str,
        elem_sz: usize,
        elems_per_block: usize,
        thread_safe: bool,
        grow_on_demand: bool,
        zero_on_alloc: bool,
    ) -> SdkResult<Self> {
        if elems_per_block <= 1 {
            return Err(SdkError::InvalidArg("elems_per_block must be > 1"));
        }
        if elem_sz < 8 {
            return Err(SdkError::InvalidArg("elem_sz must be >= 8"));
        }
        let _ = thread_safe;

        let payload_sz = (elem_sz + 7) & !0x7;
        let stride = ELEM_META_SIZE + payload_sz;

        Ok(Self {
            name: name.to_string(),
            elem_sz,
            payload_sz,
            stride,
            elems_per_block,
            raw_block_sz: std::mem::size_of::<BlockHdr>() + stride * elems_per_block,
            grow_on_demand,
            zero_on_alloc,
            core: Mutex::new(SlabCore {
                block_head: ptr::null_mut(),
                num_allocs: 0,
                num_frees: 0,
                num_in_use: 0,
                num_alloc_fails: 0,
                num_blocks: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elem_size(&self) -> usize {
        self.elem_sz
    }

    pub fn elems_per_block(&self) -> usize {
        self.elems_per_block
    }

    pub fn stats(&self) -> SlabStats {
        let core = self.core.lock();
        SlabStats {
            num_allocs: core.num_allocs,
            num_frees: core.num_frees,
            num_in_use: core.num_in_use,
            num_alloc_fails: core.num_alloc_fails,
            num_blocks: core.num_blocks,
        }
    }

    /// Allocate one element.
    ///
    /// Returns a pointer to the element payload, zeroed if the slab was
    /// configured with `zero_on_alloc`. Fails with [`SdkError::Oom`] when
    /// every block is full and the slab may not grow, or when the backing
    /// allocator fails.
    pub fn alloc(&self) -> SdkResult<NonNull<u8>> {
        let elem;
        {
            let mut core = self.core.lock();

            // first block with a non-empty free list
            let mut block = core.block_head;
            // SAFETY: block pointers originate from alloc_block_ and are
            // owned by this slab; traversal happens under the slab lock.
            unsafe {
                while !block.is_null() && (*block).free_head.is_null() {
                    block = (*block).next;
                }
            }

            if block.is_null() {
                if self.grow_on_demand || core.block_head.is_null() {
                    block = self.alloc_block_(&mut core);
                    if block.is_null() {
                        core.num_alloc_fails += 1;
                        return Err(SdkError::Oom);
                    }
                    // SAFETY: `block` is freshly allocated and exclusively
                    // ours; list head update is under the slab lock.
                    unsafe {
                        (*block).next = core.block_head;
                        if !core.block_head.is_null() {
                            (*core.block_head).prev = block;
                        }
                    }
                    core.block_head = block;
                } else {
                    core.num_alloc_fails += 1;
                    return Err(SdkError::Oom);
                }
            }

            // SAFETY: free_head is non-null (checked above) and points at an
            // element meta header inside `block`. The free-list next pointer
            // lives in the first payload word of a free element.
            unsafe {
                let meta = (*block).free_head;
                *meta = 1;
                let payload = meta.add(ELEM_META_SIZE);
                (*block).free_head = *(payload as *const *mut u8);
                (*block).num_in_use += 1;
                elem = payload;
            }
            core.num_allocs += 1;
            core.num_in_use += 1;
        }

        // zero outside the lock
        if self.zero_on_alloc {
            // SAFETY: `elem` is exclusively owned by this caller and spans
            // payload_sz valid bytes.
            unsafe { ptr::write_bytes(elem, 0, self.payload_sz) };
        }

        // SAFETY: elem is derived from a non-null block allocation.
        Ok(unsafe { NonNull::new_unchecked(elem) })
    }

    /// Return an element to the pool.
    ///
    /// Fails with [`SdkError::InvalidHandle`] if the pointer does not belong
    /// to any live block of this slab, or if the element is already free.
    pub fn free(&self, elem: NonNull<u8>) -> SdkResult<()> {
        let mut core = self.core.lock();
        let payload = elem.as_ptr();

        // locate the owning block by pointer-range containment; O(blocks),
        // acceptable because block counts stay small
        let mut block = core.block_head;
        let meta = unsafe { payload.sub(ELEM_META_SIZE) };
        // SAFETY: traversal under the slab lock; only pointer comparisons
        // are performed until containment is established.
        unsafe {
            while !block.is_null() {
                let elems_start = (block as *mut u8).add(std::mem::size_of::<BlockHdr>());
                let block_end = (block as *mut u8).add(self.raw_block_sz);
                if meta >= elems_start && meta < block_end {
                    break;
                }
                block = (*block).next;
            }
        }

        if block.is_null() {
            log::error!(
                "[slab] {}: free of pointer {:p} not owned by any block",
                self.name,
                payload
            );
            return Err(SdkError::InvalidHandle);
        }

        // SAFETY: containment established above; meta and payload lie inside
        // a live block owned by this slab, and we hold the slab lock.
        unsafe {
            debug_assert_eq!(
                (meta as usize
                    - ((block as *mut u8).add(std::mem::size_of::<BlockHdr>()) as usize))
                    % self.stride,
                0
            );
            if *meta == 0 {
                log::error!("[slab] {}: double free of {:p}", self.name, payload);
                return Err(SdkError::InvalidHandle);
            }
            *(payload as *mut *mut u8) = (*block).free_head;
            (*block).free_head = meta;
            *meta = 0;
            (*block).num_in_use -= 1;
            core.num_frees += 1;
            core.num_in_use -= 1;

            if (*block).num_in_use == 0 && self.grow_on_demand && core.num_blocks > 1 {
                self.free_block_(&mut core, block);
            }
        }
        Ok(())
    }

    /// Visit every in-use element until the callback returns `true`.
    pub fn walk(&self, mut cb: impl FnMut(NonNull<u8>) -> bool) {
        let core = self.core.lock();
        let mut block = core.block_head;
        // SAFETY: traversal under the slab lock; element pointers stay
        // within their block.
        unsafe {
            while !block.is_null() {
                if (*block).num_in_use != 0 {
                    let mut meta = (block as *mut u8).add(std::mem::size_of::<BlockHdr>());
                    for _ in 0..self.elems_per_block {
                        if *meta != 0 {
                            let payload = NonNull::new_unchecked(meta.add(ELEM_META_SIZE));
                            if cb(payload) {
                                return;
                            }
                        }
                        meta = meta.add(self.stride);
                    }
                }
                block = (*block).next;
            }
        }
    }

    fn block_layout(&self) -> Layout {
        // raw_block_sz is a multiple of 8 by construction
        Layout::from_size_align(self.raw_block_sz, 8).expect("slab block layout")
    }

    /// Allocate and initialize a new block. Returns null on OOM.
    fn alloc_block_(&self, core: &mut SlabCore) -> *mut BlockHdr {
        // SAFETY: layout has non-zero size; initialization below touches
        // only memory inside the fresh allocation.
        unsafe {
            let raw = alloc(self.block_layout());
            if raw.is_null() {
                log::error!("[slab] {}: failed to allocate block", self.name);
                return ptr::null_mut();
            }
            let block = raw as *mut BlockHdr;
            (*block).prev = ptr::null_mut();
            (*block).next = ptr::null_mut();
            (*block).num_in_use = 0;
            (*block)._pad = 0;

            // thread every element onto the free list
            let elems = raw.add(std::mem::size_of::<BlockHdr>());
            (*block).free_head = elems;
            let mut meta = elems;
            for i in 0..self.elems_per_block {
                *meta = 0;
                let payload = meta.add(ELEM_META_SIZE);
                let next = if i + 1 < self.elems_per_block {
                    meta.add(self.stride)
                } else {
                    ptr::null_mut()
                };
                *(payload as *mut *mut u8) = next;
                meta = meta.add(self.stride);
            }
            core.num_blocks += 1;
            block
        }
    }

    /// Unlink an empty block and return it to the backing allocator.
    ///
    /// SAFETY: caller holds the slab lock and `block` is a live block of
    /// this slab with no in-use elements.
    unsafe fn free_block_(&self, core: &mut SlabCore, block: *mut BlockHdr) {
        if core.block_head == block {
            core.block_head = (*block).next;
            if !core.block_head.is_null() {
                (*core.block_head).prev = ptr::null_mut();
            }
        } else {
            (*(*block).prev).next = (*block).next;
            if !(*block).next.is_null() {
                (*(*block).next).prev = (*block).prev;
            }
        }
        dealloc(block as *mut u8, self.block_layout());
        core.num_blocks -= 1;
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        let layout = self.block_layout();
        let core = self.core.get_mut();
        let mut block = core.block_head;
        // SAFETY: exclusive access in drop; every block was allocated with
        // block_layout() by alloc_block_.
        unsafe {
            while !block.is_null() {
                let next = (*block).next;
                dealloc(block as *mut u8, layout);
                block = next;
            }
        }
        core.block_head = ptr::null_mut();
    }
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Slab")
            .field("name", &self.name)
            .field("elem_sz", &self.elem_sz)
            .field("elems_per_block", &self.elems_per_block)
            .field("stats", &stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(Slab::new("bad", 16, 1, false, true, false).is_err());
        assert!(Slab::new("bad", 4, 4, false, true, false).is_err());
    }

    #[test]
    fn test_round_trip_grow_and_shrink() {
        let slab = Slab::new("rt", 16, 4, false, true, false).expect("slab");

        let mut ptrs = Vec::new();
        for _ in 0..5 {
            ptrs.push(slab.alloc().expect("alloc"));
        }
        // all distinct
        for i in 0..ptrs.len() {
            for j in i + 1..ptrs.len() {
                assert_ne!(ptrs[i], ptrs[j]);
            }
        }
        assert_eq!(slab.stats().num_blocks, 2);
        assert_eq!(slab.stats().num_in_use, 5);

        for p in ptrs.into_iter().rev() {
            slab.free(p).expect("free");
        }
        let stats = slab.stats();
        assert_eq!(stats.num_in_use, 0);
        // the last remaining block is retained
        assert_eq!(stats.num_blocks, 1);
        assert_eq!(stats.num_allocs, 5);
        assert_eq!(stats.num_frees, 5);
    }

    #[test]
    fn test_no_grow_fails_when_full() {
        let slab = Slab::new("fixed", 16, 4, false, false, false).expect("slab");
        let mut ptrs = Vec::new();
        for _ in 0..4 {
            ptrs.push(slab.alloc().expect("alloc"));
        }
        assert!(matches!(slab.alloc(), Err(SdkError::Oom)));
        assert_eq!(slab.stats().num_alloc_fails, 1);

        // freeing one makes room again
        slab.free(ptrs.pop().expect("ptr")).expect("free");
        assert!(slab.alloc().is_ok());
    }

    #[test]
    fn test_double_free_rejected() {
        let slab = Slab::new("df", 16, 4, false, true, false).expect("slab");
        let p = slab.alloc().expect("alloc");
        slab.free(p).expect("free");
        assert!(matches!(slab.free(p), Err(SdkError::InvalidHandle)));
    }

    #[test]
    fn test_foreign_pointer_rejected() {
        let a = Slab::new("a", 16, 4, false, true, false).expect("slab");
        let b = Slab::new("b", 16, 4, false, true, false).expect("slab");
        let p = a.alloc().expect("alloc");
        assert!(matches!(b.free(p), Err(SdkError::InvalidHandle)));
        a.free(p).expect("free");
    }

    #[test]
    fn test_zero_on_alloc() {
        let slab = Slab::new("z", 16, 4, false, true, true).expect("slab");
        let p = slab.alloc().expect("alloc");
        // dirty the payload, recycle it, check the next alloc comes back clean
        unsafe { ptr::write_bytes(p.as_ptr(), 0xab, 16) };
        slab.free(p).expect("free");
        let p2 = slab.alloc().expect("alloc");
        let bytes = unsafe { std::slice::from_raw_parts(p2.as_ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == 0));
        slab.free(p2).expect("free");
    }

    #[test]
    fn test_walk_visits_in_use_only() {
        let slab = Slab::new("walk", 16, 4, false, true, false).expect("slab");
        let p1 = slab.alloc().expect("alloc");
        let p2 = slab.alloc().expect("alloc");
        let p3 = slab.alloc().expect("alloc");
        slab.free(p2).expect("free");

        let mut seen = Vec::new();
        slab.walk(|p| {
            seen.push(p);
            false
        });
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&p1));
        assert!(seen.contains(&p3));

        // early stop
        let mut count = 0;
        slab.walk(|_| {
            count += 1;
            true
        });
        assert_eq!(count, 1);

        slab.free(p1).expect("free");
        slab.free(p3).expect("free");
    }

    #[test]
    fn test_counters_track_alloc_free_balance() {
        let slab = Slab::new("cnt", 24, 8, true, true, false).expect("slab");
        let mut ptrs = Vec::new();
        for _ in 0..20 {
            ptrs.push(slab.alloc().expect("alloc"));
        }
        for p in ptrs.drain(..10) {
            slab.free(p).expect("free");
        }
        let stats = slab.stats();
        assert_eq!(stats.num_in_use, stats.num_allocs - stats.num_frees);
        assert_eq!(stats.num_in_use, 10);
        assert!(stats.num_blocks >= 1);
        for p in ptrs {
            slab.free(p).expect("free");
        }
    }

    #[test]
    fn test_concurrent_alloc_free() {
        use std::sync::Arc;
        let slab = Arc::new(Slab::new("mt", 32, 16, true, true, true).expect("slab"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let slab = Arc::clone(&slab);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let p = slab.alloc().expect("alloc");
                    slab.free(p).expect("free");
                }
            }));
        }
        for h in handles {
            h.join().expect("join");
        }
        let stats = slab.stats();
        assert_eq!(stats.num_in_use, 0);
        assert_eq!(stats.num_allocs, 2000);
        assert_eq!(stats.num_frees, 2000);
    }
}
