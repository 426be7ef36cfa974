// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport.
//!
//! Every send is delivered back to the local process: the batch is handed to
//! the channel's inbound handler as a scheduler runnable at the channel's
//! priority, with the local rank as the source. An activity counter plays
//! the termination detector, and [`Loopback::end_epoch`] drains the
//! runqueue while driving registered flush objects until the epoch is
//! quiescent.

use crate::{
    buffer::Filled,
    rank::{Rank, RankSet},
    scheduler::{Scheduler, TaskResult},
    transport::{BatchHandler, Channel, Element, FlushObject, Priority, Transport},
};
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport size must be nonzero")]
    ZeroSize,

    #[error("local rank {rank} out of range for size {size}")]
    RankOutOfRange { rank: Rank, size: usize },
}

#[derive(Clone, Copy, Debug)]
pub struct Builder {
    size: usize,
    rank: Rank,
}

impl Builder {
    /// Sets the number of ranks in the simulated group
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Sets the local rank
    pub fn rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    pub fn build(self) -> Result<Loopback, Error> {
        if self.size == 0 {
            return Err(Error::ZeroSize);
        }
        if self.rank >= self.size {
            return Err(Error::RankOutOfRange {
                rank: self.rank,
                size: self.size,
            });
        }
        Ok(Loopback {
            inner: Arc::new(Inner {
                rank: self.rank,
                size: self.size,
                scheduler: Scheduler::new(),
                active: AtomicUsize::new(0),
                flush_objects: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// A rank-addressable transport that delivers to itself.
#[derive(Clone)]
pub struct Loopback {
    inner: Arc<Inner>,
}

struct Inner {
    rank: Rank,
    size: usize,
    scheduler: Scheduler,
    /// Batches announced to the termination detector but not yet handled
    active: AtomicUsize,
    flush_objects: Mutex<Vec<FlushObject>>,
}

impl Loopback {
    pub fn builder() -> Builder {
        Builder { size: 1, rank: 0 }
    }

    pub fn new(size: usize) -> Result<Self, Error> {
        Self::builder().size(size).build()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Invokes every registered flush object, dropping those whose owner
    /// reports destruction. Returns whether any owner is still alive.
    pub fn flush(&self) -> bool {
        self.inner.run_flush_objects()
    }

    /// Closes the current epoch: drains the runqueue and drives flush
    /// cycles until no batch is being built or in flight.
    ///
    /// Hangs if a destination was announced via `message_being_built` but
    /// never receives an element.
    pub fn end_epoch(&self) {
        let done = Arc::new(AtomicBool::new(false));
        {
            let inner = self.inner.clone();
            let done = done.clone();
            self.inner.scheduler.add_idle_task(move |_| {
                if done.load(Ordering::SeqCst) {
                    return TaskResult::RemoveFromQueue;
                }
                let _ = inner.run_flush_objects();
                TaskResult::Idle
            });
        }

        loop {
            let _ = self.inner.scheduler.run_one();
            if self.inner.active.load(Ordering::SeqCst) == 0
                && !self.inner.scheduler.has_runnables()
            {
                break;
            }
        }

        done.store(true, Ordering::SeqCst);
        let _ = self.inner.scheduler.run_one();
    }
}

impl Inner {
    /// One flush cycle over every registered object, serialized by the
    /// registry lock. Objects reporting a destroyed owner are dropped.
    fn run_flush_objects(&self) -> bool {
        let mut flushes = self.flush_objects.lock();
        flushes.retain(|flush| flush());
        !flushes.is_empty()
    }
}

impl Transport for Loopback {
    type Channel<T: Element> = LoopbackChannel<T>;

    fn rank(&self) -> Rank {
        self.inner.rank
    }

    fn size(&self) -> usize {
        self.inner.size
    }

    fn create_channel<T: Element>(&self, priority: Priority) -> LoopbackChannel<T> {
        LoopbackChannel {
            inner: self.inner.clone(),
            state: Arc::new(ChannelState {
                handler: RwLock::new(None),
                max_count: AtomicUsize::new(0),
                sources: RwLock::new(None),
                dests: RwLock::new(None),
            }),
            priority,
        }
    }

    fn add_flush_object(&self, flush: FlushObject) {
        self.inner.flush_objects.lock().push(flush);
    }
}

pub struct LoopbackChannel<T: Element> {
    inner: Arc<Inner>,
    state: Arc<ChannelState<T>>,
    priority: Priority,
}

impl<T: Element> LoopbackChannel<T> {
    pub fn possible_sources(&self) -> Option<RankSet> {
        self.state.sources.read().clone()
    }

    pub fn possible_dests(&self) -> Option<RankSet> {
        self.state.dests.read().clone()
    }
}

struct ChannelState<T> {
    handler: RwLock<Option<BatchHandler<T>>>,
    max_count: AtomicUsize,
    sources: RwLock<Option<RankSet>>,
    dests: RwLock<Option<RankSet>>,
}

impl<T: Element> Channel<T> for LoopbackChannel<T> {
    fn set_max_count(&self, max_count: usize) {
        self.state.max_count.store(max_count, Ordering::SeqCst);
    }

    fn set_handler(&self, handler: BatchHandler<T>) {
        *self.state.handler.write() = Some(handler);
    }

    fn set_possible_sources(&self, sources: RankSet) {
        *self.state.sources.write() = Some(sources);
    }

    fn set_possible_dests(&self, dests: RankSet) {
        *self.state.dests.write() = Some(dests);
    }

    fn message_being_built(&self, dest: Rank) {
        debug_assert!(dest < self.inner.size);
        self.inner.active.fetch_add(1, Ordering::SeqCst);
    }

    fn send(&self, batch: Filled<T>, dest: Rank) {
        debug_assert!(dest < self.inner.size);
        debug_assert!(batch.len() <= self.state.max_count.load(Ordering::SeqCst));
        #[cfg(debug_assertions)]
        if let Some(dests) = self.possible_dests() {
            debug_assert!(dests.is_valid(dest), "send to undeclared destination {dest}");
        }
        trace!(dest, count = batch.len(), "loopback delivery scheduled");

        let state = self.state.clone();
        let inner = self.inner.clone();
        let src = inner.rank;
        self.inner.scheduler.add_runnable(self.priority, move |_| {
            let mut batch = batch;
            let handler = state.handler.read().clone();
            if let Some(handler) = handler {
                handler(src, batch.as_mut_slice());
            }
            // transmit completion: the region goes back to its cache
            drop(batch);
            // handler done
            inner.active.fetch_sub(1, Ordering::SeqCst);
            TaskResult::BusyAndFinished
        });
    }
}
