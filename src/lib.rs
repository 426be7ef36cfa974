// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod buffer;
pub mod coalesce;
pub mod rank;
pub mod scheduler;
pub mod sorter;
pub mod transport;

pub use buffer::{Cache, Filled, Region};
pub use coalesce::{
    heuristic::{
        CoalescingHeuristic, HeuristicGen, NeverFlush, RelativeVelocity, RelativeVelocityConfig,
        SendStats,
    },
    CoalescedMessageType, Config, ElementHandler,
};
pub use rank::{AllRanks, Rank, RankList, RankSet, ValidRankSet};
pub use scheduler::{Scheduler, TaskResult};
pub use sorter::{BufferSorter, NoopSorter};
pub use transport::{BatchHandler, Channel, Element, FlushObject, Priority, Transport};
