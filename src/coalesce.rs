// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-destination coalescing of small messages into transport batches.
//!
//! Producers post individual elements with [`CoalescedMessageType::send`];
//! the layer packs them into per-destination buffers and hands a buffer to
//! the transport when it fills, or when a flush completes a partial batch
//! after the destination has gone quiescent. The producer-side protocol is
//! lock-free: a single fetch-add on a fused count-and-state word both
//! reserves a slot and detects sender exclusivity.
//!
//! The store ordering in the send, seal and clear paths is load-bearing;
//! see the notes on each step before reordering anything.

use crate::{
    buffer::{Cache, Filled},
    coalesce::{
        buffer::{MessageBuffer, COUNT_MASK, SENDER_ACTIVE},
        heuristic::{CoalescingHeuristic, HeuristicGen, NeverFlush, SendStats},
    },
    rank::{AllRanks, Rank, RankSet},
    sorter::{BufferSorter, NoopSorter},
    transport::{Channel, Element, Priority, Transport},
};
use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use tracing::trace;

pub(crate) mod buffer;
pub mod heuristic;

/// Per-element user callback: one invocation per received element.
pub type ElementHandler<T> = Arc<dyn Fn(Rank, T) + Send + Sync>;

/// Configuration for a [`CoalescedMessageType`].
#[derive(Clone, Debug)]
pub struct Config<G = NeverFlush> {
    coalescing_size: usize,
    priority: Priority,
    heuristic: G,
}

impl Config {
    /// Coalesce up to `coalescing_size` elements per destination
    pub fn new(coalescing_size: usize) -> Self {
        Self {
            coalescing_size,
            priority: Priority::default(),
            heuristic: NeverFlush,
        }
    }
}

impl<G> Config<G> {
    /// Sets the inbound dispatch priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Replaces the coalescing heuristic generator
    pub fn with_heuristic<G2: HeuristicGen>(self, heuristic: G2) -> Config<G2> {
        Config {
            coalescing_size: self.coalescing_size,
            priority: self.priority,
            heuristic,
        }
    }

    pub fn coalescing_size(&self) -> usize {
        self.coalescing_size
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

/// A coalescing message type: one instance per (element type, handler).
///
/// Thread-safe entry points: [`send`](Self::send) and
/// [`send_with_tid`](Self::send_with_tid) from any number of producer
/// threads, [`flush`](Self::flush) from producers and the scheduler, and
/// inbound dispatch from the transport's runqueue.
pub struct CoalescedMessageType<T, Tr, S = NoopSorter, H = NeverFlush>
where
    T: Element,
    Tr: Transport,
    S: BufferSorter<T>,
    H: CoalescingHeuristic,
{
    transport: Tr,
    channel: Tr::Channel<T>,
    cache: Arc<Cache<T>>,
    handler: RwLock<ElementHandler<T>>,
    outgoing_buffers: Box<[CachePadded<MessageBuffer<T>>]>,
    /// Allocation count each destination showed on the previous flush cycle
    last_active: Box<[AtomicU32]>,
    coalescing_size: usize,
    sorter: S,
    heuristic: H,
    stats: SendStats,
    dests: RankSet,
    /// Flipped on teardown so scheduled flush tasks become no-ops
    alive: Arc<AtomicBool>,
}

impl<T, Tr, H> CoalescedMessageType<T, Tr, NoopSorter, H>
where
    T: Element,
    Tr: Transport,
    H: CoalescingHeuristic,
{
    /// Builds a message type addressing all ranks, with the default sorter
    pub fn new<G>(config: Config<G>, transport: &Tr) -> Arc<Self>
    where
        G: HeuristicGen<Heuristic = H>,
    {
        Self::with_sorter(config, transport, None, None, NoopSorter)
    }
}

impl<T, Tr, S, H> CoalescedMessageType<T, Tr, S, H>
where
    T: Element,
    Tr: Transport,
    S: BufferSorter<T>,
    H: CoalescingHeuristic,
{
    /// Builds a message type with explicit destination/source sets and an
    /// inbound buffer sorter.
    ///
    /// `dests`/`sources` default to all ranks of the transport. Buffers
    /// exist for every rank of the transport, but only possible
    /// destinations get backing regions; sending to any other rank is a
    /// contract violation.
    pub fn with_sorter<G>(
        config: Config<G>,
        transport: &Tr,
        dests: Option<RankSet>,
        sources: Option<RankSet>,
        sorter: S,
    ) -> Arc<Self>
    where
        G: HeuristicGen<Heuristic = H>,
    {
        let size = transport.size();
        let coalescing_size = config.coalescing_size;
        assert!(coalescing_size > 0, "coalescing size must be nonzero");
        assert!(
            coalescing_size <= COUNT_MASK as usize,
            "coalescing size exceeds the count field"
        );

        let dests = dests.unwrap_or_else(|| Arc::new(AllRanks::new(size)));
        let sources = sources.unwrap_or_else(|| Arc::new(AllRanks::new(size)));

        let channel = transport.create_channel::<T>(config.priority);
        channel.set_max_count(coalescing_size);
        channel.set_possible_sources(sources);
        channel.set_possible_dests(dests.clone());

        let cache = Arc::new(Cache::new(coalescing_size));
        let mut buffers = (0..size)
            .map(|_| CachePadded::new(MessageBuffer::unused()))
            .collect::<Vec<_>>();
        for i in 0..dests.count() {
            let r = dests.rank_from_index(i);
            assert!(transport.is_valid_rank(r), "destination rank {r} out of range");
            buffers[r] = CachePadded::new(MessageBuffer::new(coalescing_size as u32));
            // sole owner until the Arc is shared below
            unsafe { buffers[r].clear(cache.allocate()) };
        }
        let last_active = (0..size)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let this = Arc::new(Self {
            transport: transport.clone(),
            channel,
            cache,
            handler: RwLock::new(Arc::new(|_, _| {})),
            outgoing_buffers: buffers.into_boxed_slice(),
            last_active,
            coalescing_size,
            sorter,
            heuristic: config.heuristic.build(),
            stats: SendStats::new(),
            dests,
            alive: Arc::new(AtomicBool::new(true)),
        });

        let inbound = Arc::downgrade(&this);
        this.channel.set_handler(Arc::new(move |src: Rank, batch: &mut [T]| {
            if let Some(this) = inbound.upgrade() {
                this.dispatch(src, batch);
            }
        }));

        // the flush object must not keep the message type alive, but must
        // safely detect its destruction
        let weak = Arc::downgrade(&this);
        let alive = this.alive.clone();
        transport.add_flush_object(Box::new(move || {
            if !alive.load(Ordering::SeqCst) {
                return false;
            }
            match weak.upgrade() {
                Some(this) => this.flush_if_alive(),
                None => false,
            }
        }));

        this
    }

    /// Coalesces `arg` toward `dest`.
    ///
    /// Spins only while the destination buffer is full or a sender is mid
    /// transmission; never takes a lock. Within one destination, transmit
    /// order equals the order of successful slot reservations.
    pub fn send(&self, arg: T, dest: Rank) {
        assert!(self.transport.is_valid_rank(dest), "invalid destination rank {dest}");
        let buf = &*self.outgoing_buffers[dest];
        let max_count = buf.max_count();
        assert!(max_count > 0, "rank {dest} is not a possible destination");

        loop {
            // wait for an open buffer: no active sender, a slot free
            loop {
                let x = buf.load_allocated();
                if (x & COUNT_MASK) < max_count && (x & SENDER_ACTIVE) == 0 {
                    break;
                }
                core::hint::spin_loop();
            }

            let my_id = buf.reserve();
            // lost to a concurrent sender
            if my_id & SENDER_ACTIVE != 0 {
                continue;
            }
            // lost to a producer that just filled the buffer
            if my_id & COUNT_MASK >= max_count {
                continue;
            }

            let slot = my_id & COUNT_MASK;
            unsafe { buf.write_slot(slot, arg) };

            if slot == max_count - 1 {
                // last slot: claim transmit exclusivity before publishing
                buf.seal();
                if buf.register_with_td() {
                    self.channel.message_being_built(dest);
                }
                buf.mark_written();
                trace!(dest, count = max_count, "full buffer send");
                self.send_buffer(buf, max_count, dest);
            } else if slot == 0 {
                if buf.register_with_td() {
                    self.channel.message_being_built(dest);
                }
                buf.mark_written();
            } else {
                buf.mark_written();
            }

            if self.heuristic.execute(&self.stats) {
                self.flush_if_alive();
            }
            return;
        }
    }

    /// Identical to [`send`](Self::send); the thread id is accepted for
    /// source compatibility and unused.
    pub fn send_with_tid(&self, arg: T, dest: Rank, _tid: usize) {
        self.send(arg, dest);
    }

    /// Proactively announces to the termination detector that a message to
    /// `dest` is being built.
    pub fn message_being_built(&self, dest: Rank) {
        assert!(self.transport.is_valid_rank(dest), "invalid destination rank {dest}");
        let buf = &*self.outgoing_buffers[dest];
        if buf.register_with_td() {
            self.channel.message_being_built(dest);
        }
    }

    /// Transmits every quiescent partial buffer.
    ///
    /// A destination is quiescent when its allocation count matches the
    /// value seen on the previous flush cycle, so completing a partial
    /// batch takes two cycles without intervening sends. Re-entrant and
    /// idempotent.
    pub fn flush(&self) -> bool {
        self.flush_if_alive()
    }

    fn flush_if_alive(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }

        for i in 0..self.dests.count() {
            let r = self.dests.rank_from_index(i);
            debug_assert!(self.transport.is_valid_rank(r));
            let buf = &*self.outgoing_buffers[r];
            let max_count = buf.max_count();

            let mut my_id = buf.load_allocated();
            if my_id != self.last_active[r].load(Ordering::SeqCst) {
                // advanced since the previous cycle: not quiescent yet
                self.last_active[r].store(my_id, Ordering::SeqCst);
                continue;
            }

            while my_id > 0 && my_id < max_count {
                if buf.try_steal(&mut my_id) {
                    break;
                }
                // the count advanced under us; give up once it leaves the
                // partial range, the full-path sender owns it then
                core::hint::spin_loop();
            }
            if my_id > 0 && my_id < max_count {
                trace!(rank = r, count = my_id, "partial buffer flushed");
                self.send_buffer(buf, my_id, r);
            }
        }

        true
    }

    /// Transmits the buffer contents described by `my_id`.
    ///
    /// The caller holds sender exclusivity; the count field of `my_id` is
    /// the number of slots to transmit.
    fn send_buffer(&self, buf: &MessageBuffer<T>, my_id: u32, dest: Rank) -> bool {
        debug_assert!(buf.load_allocated() & SENDER_ACTIVE != 0);
        let count = my_id & COUNT_MASK;
        if my_id & SENDER_ACTIVE != 0 {
            return false;
        }
        if count == 0 {
            return false;
        }
        debug_assert!(count as usize <= self.coalescing_size);

        // all slot payloads must be published before the region moves
        buf.await_written(count);
        // cannot hold before the publication wait completes
        debug_assert!(buf.is_registered_with_td());

        let region = unsafe { buf.clear(self.cache.allocate()) }
            .expect("transmitting a buffer without a backing region");
        let batch = Filled::new(region, count as usize, self.cache.clone());
        self.channel.send(batch, dest);
        true
    }

    fn dispatch(&self, src: Rank, batch: &mut [T]) {
        trace!(src, count = batch.len(), "batch received");
        self.sorter.sort(batch);
        let handler = self.get_handler();
        for &arg in batch.iter() {
            handler(src, arg);
        }
    }

    /// Installs the per-element inbound handler
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(Rank, T) + Send + Sync + 'static,
    {
        *self.handler.write() = Arc::new(handler);
    }

    pub fn get_handler(&self) -> ElementHandler<T> {
        self.handler.read().clone()
    }

    pub fn get_buffer_sorter(&self) -> &S {
        &self.sorter
    }

    pub fn get_transport(&self) -> &Tr {
        &self.transport
    }

    #[cfg(test)]
    pub(crate) fn buffer_cache(&self) -> &Arc<Cache<T>> {
        &self.cache
    }
}

impl<T, Tr, S, H> Drop for CoalescedMessageType<T, Tr, S, H>
where
    T: Element,
    Tr: Transport,
    S: BufferSorter<T>,
    H: CoalescingHeuristic,
{
    fn drop(&mut self) {
        // scheduled flush tasks must observe this before the buffers and
        // the cache go away
        self.alive.store(false, Ordering::SeqCst);
    }
}
