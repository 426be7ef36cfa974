// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::buffer::region::Region;
use crossbeam_queue::SegQueue;
use std::sync::Arc;

/// A free-list of equally-sized regions.
///
/// Regions travel from the cache into a coalescing buffer, from there into
/// the transport as part of a [`Filled`] batch, and back to the cache when
/// the transmission completes. Allocation grows the list on demand; there is
/// no upper bound beyond the number of batches simultaneously in flight.
pub struct Cache<T> {
    free: SegQueue<Region<T>>,
    capacity: usize,
}

impl<T> Cache<T> {
    /// Creates a cache producing regions of `capacity` elements
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "region capacity must be nonzero");
        Self {
            free: SegQueue::new(),
            capacity,
        }
    }

    /// The element capacity of every region in this cache
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pops a free region, or grows the list with a fresh one
    pub fn allocate(&self) -> Region<T> {
        self.free
            .pop()
            .unwrap_or_else(|| Region::new(self.capacity))
    }

    /// Returns a region to the free-list
    pub fn release(&self, region: Region<T>) {
        debug_assert_eq!(region.capacity(), self.capacity);
        self.free.push(region);
    }

    /// The number of regions currently sitting in the free-list
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// A filled batch in flight to the transport: an owned region whose first
/// `count` slots hold published elements.
///
/// Dropping the batch is the transmit-completion hook; it returns the region
/// to the cache it was allocated from.
pub struct Filled<T> {
    region: Option<Region<T>>,
    count: usize,
    home: Arc<Cache<T>>,
}

impl<T> Filled<T> {
    /// The first `count` slots of `region` must have been written and
    /// published before construction.
    pub(crate) fn new(region: Region<T>, count: usize, home: Arc<Cache<T>>) -> Self {
        debug_assert!(count <= region.capacity());
        Self {
            region: Some(region),
            count,
            home,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        let region = self.region.as_ref().expect("batch region already released");
        unsafe { region.assume_init(self.count) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let count = self.count;
        let region = self.region.as_mut().expect("batch region already released");
        unsafe { region.assume_init_mut(count) }
    }
}

impl<T> Drop for Filled<T> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.home.release(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_grows_and_release_recycles() {
        let cache = Cache::<u32>::new(4);
        assert_eq!(cache.available(), 0);

        let a = cache.allocate();
        let b = cache.allocate();
        assert_eq!(a.capacity(), 4);
        assert_eq!(cache.available(), 0);

        cache.release(a);
        assert_eq!(cache.available(), 1);
        cache.release(b);
        assert_eq!(cache.available(), 2);

        // recycled, not grown
        let _c = cache.allocate();
        assert_eq!(cache.available(), 1);
    }

    #[test]
    fn filled_returns_region_on_drop() {
        let cache = Arc::new(Cache::<u32>::new(2));
        let region = cache.allocate();
        unsafe {
            region.slot(0).write(7);
            region.slot(1).write(8);
        }

        let batch = Filled::new(region, 2, cache.clone());
        assert_eq!(batch.as_slice(), &[7, 8]);
        assert_eq!(cache.available(), 0);

        drop(batch);
        assert_eq!(cache.available(), 1);
    }

    #[test]
    fn concurrent_allocate_release() {
        let cache = Arc::new(Cache::<u64>::new(8));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let region = cache.allocate();
                    cache.release(region);
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        // every region popped was pushed back
        assert!(cache.available() <= 4);
    }
}
