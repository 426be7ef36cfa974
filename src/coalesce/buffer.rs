// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::buffer::Region;
use core::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Top bit of `count_allocated`: set while exactly one thread holds
/// exclusive rights to transmit the current buffer contents.
pub(crate) const SENDER_ACTIVE: u32 = 1 << 31;

/// Low bits of `count_allocated`: the next slot index to hand out.
pub(crate) const COUNT_MASK: u32 = SENDER_ACTIVE - 1;

/// Per-destination coalescing state.
///
/// `count_allocated` fuses the slot cursor and the sender-exclusivity flag
/// into one word so that producers can detect exclusivity and reserve a slot
/// with a single fetch-add, and a sender can claim exclusivity with a single
/// store of [`SENDER_ACTIVE`] (which also zeroes the count field).
/// `count_written` trails `count_allocated & COUNT_MASK` and publishes slot
/// payloads: a reader may touch slot `i` only after observing
/// `count_written >= i + 1`.
pub(crate) struct MessageBuffer<T> {
    count_allocated: AtomicU32,
    count_written: AtomicU32,
    registered_with_td: AtomicBool,
    region: UnsafeCell<Option<Region<T>>>,
    max_count: u32,
}

// The region cell is only touched while the caller holds sender exclusivity
// (or sole ownership before the buffer is shared); slot writes go through
// the region's own cells.
unsafe impl<T: Send> Send for MessageBuffer<T> {}
unsafe impl<T: Send> Sync for MessageBuffer<T> {}

impl<T> MessageBuffer<T> {
    /// A buffer for a rank that is not a possible destination; never used
    pub(crate) fn unused() -> Self {
        Self {
            count_allocated: AtomicU32::new(0),
            count_written: AtomicU32::new(0),
            registered_with_td: AtomicBool::new(false),
            region: UnsafeCell::new(None),
            max_count: 0,
        }
    }

    pub(crate) fn new(max_count: u32) -> Self {
        assert!(max_count > 0);
        assert!(max_count <= COUNT_MASK);
        Self {
            count_allocated: AtomicU32::new(0),
            count_written: AtomicU32::new(0),
            registered_with_td: AtomicBool::new(false),
            region: UnsafeCell::new(None),
            max_count,
        }
    }

    #[inline]
    pub(crate) fn max_count(&self) -> u32 {
        self.max_count
    }

    #[inline]
    pub(crate) fn empty(&self) -> bool {
        self.count_allocated.load(Ordering::SeqCst) == 0
    }

    #[inline]
    pub(crate) fn load_allocated(&self) -> u32 {
        self.count_allocated.load(Ordering::SeqCst)
    }

    /// Hands out the next slot id; the caller must validate the returned
    /// value against [`SENDER_ACTIVE`] and [`COUNT_MASK`] before using it
    #[inline]
    pub(crate) fn reserve(&self) -> u32 {
        self.count_allocated.fetch_add(1, Ordering::SeqCst)
    }

    /// Claims transmit exclusivity after filling the last slot. The absolute
    /// store also discards the overcount left by racing reservations.
    #[inline]
    pub(crate) fn seal(&self) {
        self.count_allocated.store(SENDER_ACTIVE, Ordering::SeqCst);
    }

    /// Attempts to trade an observed quiescent count for transmit
    /// exclusivity. On failure `observed` is updated to the current value.
    #[inline]
    pub(crate) fn try_steal(&self, observed: &mut u32) -> bool {
        match self.count_allocated.compare_exchange_weak(
            *observed,
            SENDER_ACTIVE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(actual) => {
                *observed = actual;
                false
            }
        }
    }

    /// Marks this buffer generation as announced to the termination
    /// detector. Returns whether the caller was first.
    #[inline]
    pub(crate) fn register_with_td(&self) -> bool {
        !self.registered_with_td.swap(true, Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn is_registered_with_td(&self) -> bool {
        self.registered_with_td.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn mark_written(&self) {
        self.count_written.fetch_add(1, Ordering::SeqCst);
    }

    /// Spins until `count` slot payloads are published
    #[inline]
    pub(crate) fn await_written(&self, count: u32) {
        while self.count_written.load(Ordering::SeqCst) != count {
            core::hint::spin_loop();
        }
    }

    /// Writes a reserved slot.
    ///
    /// # Safety
    ///
    /// The caller must own the reservation for `slot` in the current buffer
    /// generation, and a region must be installed.
    #[inline]
    pub(crate) unsafe fn write_slot(&self, slot: u32, value: T) {
        debug_assert!(slot < self.max_count);
        let region = (*self.region.get())
            .as_ref()
            .expect("write to a buffer without a backing region");
        region.slot(slot as usize).write(value);
    }

    /// Swaps in a fresh region and reopens the buffer, returning the
    /// previous region.
    ///
    /// The store to `count_allocated` must come last: it releases producers
    /// spinning on the buffer, and they must observe the new region and the
    /// zeroed `count_written` / `registered_with_td` before taking a slot.
    ///
    /// # Safety
    ///
    /// The caller must hold sender exclusivity (it observed `SENDER_ACTIVE`
    /// set on its own behalf), or be the sole owner of an unshared buffer.
    pub(crate) unsafe fn clear(&self, fresh: Region<T>) -> Option<Region<T>> {
        let previous = (*self.region.get()).replace(fresh);
        self.registered_with_td.store(false, Ordering::SeqCst);
        self.count_written.store(0, Ordering::SeqCst);
        self.count_allocated.store(0, Ordering::SeqCst);
        previous
    }

}

impl<T> Drop for MessageBuffer<T> {
    fn drop(&mut self) {
        // only quiescent buffers may be destroyed
        debug_assert!(self.empty());
        debug_assert_eq!(self.count_written.load(Ordering::SeqCst), 0);
        debug_assert!(!self.registered_with_td.load(Ordering::SeqCst));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn with_region(max_count: u32) -> MessageBuffer<u64> {
        let buf = MessageBuffer::new(max_count);
        unsafe { buf.clear(Region::new(max_count as usize)) };
        buf
    }

    #[test]
    fn reservation_walks_the_count_field() {
        let buf = with_region(4);
        assert!(buf.empty());

        for expected in 0..4 {
            let id = buf.reserve();
            assert_eq!(id, expected);
            assert_eq!(id & SENDER_ACTIVE, 0);
            unsafe { buf.write_slot(id & COUNT_MASK, u64::from(id)) };
            buf.mark_written();
        }

        assert!(!buf.empty());
        assert_eq!(buf.load_allocated(), 4);

        // cleanup for the drop check
        buf.seal();
        unsafe { buf.clear(Region::new(4)) };
    }

    #[test]
    fn seal_discards_overcount() {
        let buf = with_region(2);
        let _ = buf.reserve();
        let _ = buf.reserve();
        // losers that raced past the capacity check
        let loser = buf.reserve();
        assert_eq!(loser & COUNT_MASK, 2);

        buf.seal();
        assert_eq!(buf.load_allocated(), SENDER_ACTIVE);

        // reservations during sender-active carry the flag
        let raced = buf.reserve();
        assert_ne!(raced & SENDER_ACTIVE, 0);

        unsafe { buf.clear(Region::new(2)) };
        assert!(buf.empty());
    }

    #[test]
    fn steal_only_succeeds_on_the_observed_count() {
        let buf = with_region(4);
        let _ = buf.reserve();
        let _ = buf.reserve();

        let mut observed = 1;
        assert!(!buf.try_steal(&mut observed));
        assert_eq!(observed, 2);
        // compare_exchange_weak may fail spuriously; the observed value
        // stays 2 so the retry loop terminates
        while !buf.try_steal(&mut observed) {
            assert_eq!(observed, 2);
        }
        assert_eq!(buf.load_allocated(), SENDER_ACTIVE);

        unsafe { buf.clear(Region::new(4)) };
    }

    #[test]
    fn clear_resets_publication_state() {
        let buf = with_region(2);
        let _ = buf.reserve();
        assert!(buf.register_with_td());
        assert!(!buf.register_with_td());
        buf.mark_written();
        let _ = buf.reserve();
        buf.mark_written();
        buf.seal();

        unsafe { buf.clear(Region::new(2)) };
        assert!(buf.empty());
        assert!(!buf.is_registered_with_td());
        assert!(buf.register_with_td());
        // reset for the drop check
        unsafe { buf.clear(Region::new(2)) };
    }

    #[test]
    fn concurrent_reservations_are_unique() {
        let buf = Arc::new(with_region(1024));
        let mut threads = Vec::new();
        for t in 0..8u64 {
            let buf = buf.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..128u64 {
                    let id = buf.reserve();
                    assert_eq!(id & SENDER_ACTIVE, 0);
                    let slot = id & COUNT_MASK;
                    assert!(slot < 1024);
                    unsafe { buf.write_slot(slot, (t << 32) | i) };
                    buf.mark_written();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        buf.await_written(1024);
        assert_eq!(buf.load_allocated(), 1024);

        buf.seal();
        let region = unsafe { buf.clear(Region::new(1024)) }.unwrap();
        let mut seen = unsafe { region.assume_init(1024) }.to_vec();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 1024);
    }
}
