// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;
use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Instant,
};

/// Shared per-message-type counters read by coalescing heuristics.
pub struct SendStats {
    message_count: AtomicU32,
}

impl SendStats {
    pub(crate) fn new() -> Self {
        Self {
            message_count: AtomicU32::new(0),
        }
    }

    /// Counts one sent message; returns the updated count
    #[inline]
    pub fn record(&self) -> u32 {
        self.message_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[inline]
    pub fn message_count(&self) -> u32 {
        self.message_count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn reset(&self) {
        self.message_count.store(0, Ordering::SeqCst);
    }
}

/// Decides, after each send, whether a flush should be triggered now.
///
/// `execute` runs on every producer thread; implementations keep their
/// cross-thread state in [`SendStats`] or behind their own short critical
/// section.
pub trait CoalescingHeuristic: Send + Sync + 'static {
    fn execute(&self, stats: &SendStats) -> bool;
}

/// Builds one heuristic instance per message type.
pub trait HeuristicGen {
    type Heuristic: CoalescingHeuristic;

    fn build(&self) -> Self::Heuristic;
}

/// The default heuristic: full buffers are the only send trigger.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverFlush;

impl CoalescingHeuristic for NeverFlush {
    #[inline]
    fn execute(&self, _stats: &SendStats) -> bool {
        false
    }
}

impl HeuristicGen for NeverFlush {
    type Heuristic = NeverFlush;

    fn build(&self) -> NeverFlush {
        NeverFlush
    }
}

/// Configuration for [`RelativeVelocity`].
#[derive(Clone, Copy, Debug)]
pub struct RelativeVelocityConfig {
    /// Window length in messages
    pub msg_count_thres: u32,
}

impl Default for RelativeVelocityConfig {
    fn default() -> Self {
        Self { msg_count_thres: 20 }
    }
}

impl RelativeVelocityConfig {
    pub fn new(msg_count_thres: u32) -> Self {
        assert!(msg_count_thres > 0, "window length must be nonzero");
        Self { msg_count_thres }
    }
}

impl HeuristicGen for RelativeVelocityConfig {
    type Heuristic = RelativeVelocity;

    fn build(&self) -> RelativeVelocity {
        RelativeVelocity::new(self.msg_count_thres)
    }
}

/// Flushes when the observed send rate drops between sampling windows.
///
/// Every `msg_count_thres`-th message closes a window: the window's velocity
/// (messages per second) is compared against the previous window's, and a
/// strictly lower value requests a flush. The message counter is the shared
/// atomic in [`SendStats`]; the window transition itself is serialized by a
/// mutex that is only contended on the closing message.
pub struct RelativeVelocity {
    threshold: u32,
    window: Mutex<Window>,
}

struct Window {
    start: Instant,
    velocity: f64,
}

impl RelativeVelocity {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            window: Mutex::new(Window {
                start: Instant::now(),
                velocity: 1.0,
            }),
        }
    }
}

impl CoalescingHeuristic for RelativeVelocity {
    fn execute(&self, stats: &SendStats) -> bool {
        if stats.record() < self.threshold {
            return false;
        }

        let mut window = self.window.lock();
        // another crosser may have closed the window while we waited
        if stats.message_count() < self.threshold {
            return false;
        }

        let elapsed = window.start.elapsed().as_secs_f64();
        let velocity = f64::from(self.threshold) / elapsed.max(f64::MIN_POSITIVE);
        let slower = velocity < window.velocity;
        window.velocity = velocity;
        window.start = Instant::now();
        stats.reset();
        slower
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn never_flush_never_fires() {
        let stats = SendStats::new();
        let heuristic = NeverFlush.build();
        for _ in 0..100 {
            assert!(!heuristic.execute(&stats));
        }
    }

    #[test]
    fn window_counter_resets_at_threshold() {
        let stats = SendStats::new();
        let heuristic = RelativeVelocityConfig::new(5).build();
        for _ in 0..5 {
            let _ = heuristic.execute(&stats);
        }
        assert_eq!(stats.message_count(), 0);
    }

    #[test]
    fn fires_when_the_rate_drops() {
        let stats = SendStats::new();
        let heuristic = RelativeVelocityConfig::new(10).build();

        // fast window: far quicker than the initial 1 msg/s reference
        let mut fired = false;
        for _ in 0..10 {
            fired |= heuristic.execute(&stats);
        }
        assert!(!fired);

        // slow window: the drop relative to the fast window requests a flush
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(2));
            fired |= heuristic.execute(&stats);
        }
        assert!(fired);
    }

    #[test]
    fn stays_quiet_between_thresholds() {
        let stats = SendStats::new();
        let heuristic = RelativeVelocityConfig::default().build();
        for _ in 0..19 {
            assert!(!heuristic.execute(&stats));
        }
    }
}
