//! The point-to-point transport boundary.
//!
//! The coalescing layer does not own a wire format; it consumes a
//! [`Transport`] that can hand out typed per-message-type channels, track
//! epoch termination through `message_being_built`, and invoke registered
//! flush objects during quiescence. [`loopback`] provides an in-process
//! implementation.

use crate::{
    buffer::Filled,
    rank::{Rank, RankSet},
};
use std::sync::Arc;

pub mod loopback;

/// Marker for message element types.
///
/// Elements are written into shared slot arrays by concurrent producers and
/// handed to the transport for zero-copy transmission, so they must be plain
/// copyable values.
pub trait Element: Copy + Send + Sync + 'static {}

impl<T: Copy + Send + Sync + 'static> Element for T {}

/// A callable registered with the transport, invoked during epoch
/// quiescence. Returns `false` once its owner has been destroyed.
pub type FlushObject = Box<dyn Fn() -> bool + Send + Sync>;

/// Inbound callback installed on a [`Channel`]: receives the source rank and
/// the raw batch, which it may reorder in place before consuming.
pub type BatchHandler<T> = Arc<dyn Fn(Rank, &mut [T]) + Send + Sync>;

/// Dispatch priority for inbound handler invocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    Low = 1,
}

impl Default for Priority {
    fn default() -> Self {
        Self::High
    }
}

impl TryFrom<u8> for Priority {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::High),
            1 => Ok(Self::Low),
            _ => Err(()),
        }
    }
}

impl Priority {
    pub(crate) const COUNT: usize = 2;

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// A typed message-type handle created by a [`Transport`].
///
/// One channel carries batches of a single element type. Handler and rank-set
/// configuration happen once, before the first epoch.
pub trait Channel<T: Element>: Send + Sync + 'static {
    /// Sets the maximum number of elements per batch
    fn set_max_count(&self, max_count: usize);

    /// Installs the inbound batch callback
    fn set_handler(&self, handler: BatchHandler<T>);

    /// Declares the ranks this channel may receive from
    fn set_possible_sources(&self, sources: RankSet);

    /// Declares the ranks this channel may send to
    fn set_possible_dests(&self, dests: RankSet);

    /// Notifies the termination detector that a batch destined to `dest` is
    /// being built and will eventually be sent
    fn message_being_built(&self, dest: Rank);

    /// Hands a filled batch to the transport.
    ///
    /// The transport owns `batch` until transmission completes; dropping it
    /// returns the backing region to its free-list.
    fn send(&self, batch: Filled<T>, dest: Rank);
}

/// A rank-addressable point-to-point transport.
pub trait Transport: Clone + Send + Sync + 'static {
    type Channel<T: Element>: Channel<T>;

    /// The local rank
    fn rank(&self) -> Rank;

    /// The number of ranks in the group
    fn size(&self) -> usize;

    #[inline]
    fn is_valid_rank(&self, rank: Rank) -> bool {
        rank < self.size()
    }

    /// Creates a typed message-type channel whose inbound handler runs at
    /// the given priority
    fn create_channel<T: Element>(&self, priority: Priority) -> Self::Channel<T>;

    /// Registers a callable to be invoked during epoch quiescence
    fn add_flush_object(&self, flush: FlushObject);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_round_trip() {
        assert_eq!(Priority::try_from(0), Ok(Priority::High));
        assert_eq!(Priority::try_from(1), Ok(Priority::Low));
        assert_eq!(Priority::try_from(2), Err(()));
        assert_eq!(Priority::default(), Priority::High);
    }
}
