// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::transport::Priority;
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, sync::Arc};

/// Outcome of a scheduled task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskResult {
    /// The task is done and should be dropped
    RemoveFromQueue,
    /// The task had nothing to do and should stay queued
    Idle,
    /// The task did work; idle tasks returning this stay queued
    BusyAndFinished,
}

type Runnable = Box<dyn FnOnce(&Scheduler) -> TaskResult + Send>;
type IdleTask = Box<dyn FnMut(&Scheduler) -> TaskResult + Send>;

/// A two-priority runqueue with idle tasks.
///
/// Runnables are one-shot and drain in priority order; idle tasks run in
/// rounds whenever the runqueue is empty and stay queued until they report
/// [`TaskResult::RemoveFromQueue`]. The handle is cheaply cloneable and
/// shared between the transport and its callers.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<State>>,
}

struct State {
    runnables: [VecDeque<Runnable>; Priority::COUNT],
    idle: Vec<IdleTask>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Scheduler")
            .field("high", &state.runnables[0].len())
            .field("low", &state.runnables[1].len())
            .field("idle", &state.idle.len())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                runnables: [VecDeque::new(), VecDeque::new()],
                idle: Vec::new(),
            })),
        }
    }

    /// Enqueues a one-shot task at the given priority
    pub fn add_runnable<F>(&self, priority: Priority, task: F)
    where
        F: FnOnce(&Scheduler) -> TaskResult + Send + 'static,
    {
        self.state.lock().runnables[priority.index()].push_back(Box::new(task));
    }

    /// Enqueues a task that runs whenever the runqueue is empty
    pub fn add_idle_task<F>(&self, task: F)
    where
        F: FnMut(&Scheduler) -> TaskResult + Send + 'static,
    {
        self.state.lock().idle.push(Box::new(task));
    }

    /// Returns whether any one-shot runnable is queued
    pub fn has_runnables(&self) -> bool {
        let state = self.state.lock();
        state.runnables.iter().any(|q| !q.is_empty())
    }

    /// Runs one runnable, or gives every idle task a turn when the runqueue
    /// is empty. Returns whether any task reported doing work.
    ///
    /// Tasks execute outside the queue lock, so they may enqueue further
    /// work from within their own invocation.
    pub fn run_one(&self) -> bool {
        let runnable = {
            let mut state = self.state.lock();
            let [high, low] = &mut state.runnables;
            high.pop_front().or_else(|| low.pop_front())
        };

        if let Some(task) = runnable {
            let _ = task(self);
            return true;
        }

        let mut round = core::mem::take(&mut self.state.lock().idle);
        if round.is_empty() {
            return false;
        }

        let mut busy = false;
        let mut keep = Vec::with_capacity(round.len());
        for mut task in round.drain(..) {
            match task(self) {
                TaskResult::RemoveFromQueue => {}
                TaskResult::Idle => keep.push(task),
                TaskResult::BusyAndFinished => {
                    busy = true;
                    keep.push(task);
                }
            }
        }

        // idle tasks added during the round land behind the survivors
        let mut state = self.state.lock();
        keep.append(&mut state.idle);
        state.idle = keep;

        busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn runnables_drain_in_priority_order() {
        let sched = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (priority, tag) in [(Priority::Low, "low"), (Priority::High, "high")] {
            let order = order.clone();
            sched.add_runnable(priority, move |_| {
                order.lock().push(tag);
                TaskResult::BusyAndFinished
            });
        }

        assert!(sched.has_runnables());
        assert!(sched.run_one());
        assert!(sched.run_one());
        assert!(!sched.has_runnables());
        assert_eq!(*order.lock(), vec!["high", "low"]);
    }

    #[test]
    fn idle_tasks_run_only_when_runqueue_empty() {
        let sched = Scheduler::new();
        let idle_runs = Arc::new(AtomicU32::new(0));

        {
            let idle_runs = idle_runs.clone();
            sched.add_idle_task(move |_| {
                idle_runs.fetch_add(1, Ordering::SeqCst);
                TaskResult::Idle
            });
        }
        sched.add_runnable(Priority::High, |_| TaskResult::BusyAndFinished);

        assert!(sched.run_one());
        assert_eq!(idle_runs.load(Ordering::SeqCst), 0);

        assert!(!sched.run_one());
        assert_eq!(idle_runs.load(Ordering::SeqCst), 1);
        assert!(!sched.run_one());
        assert_eq!(idle_runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn idle_task_removes_itself() {
        let sched = Scheduler::new();
        let runs = Arc::new(AtomicU32::new(0));

        {
            let runs = runs.clone();
            sched.add_idle_task(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                TaskResult::RemoveFromQueue
            });
        }

        let _ = sched.run_one();
        let _ = sched.run_one();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_can_enqueue_from_within() {
        let sched = Scheduler::new();
        let hits = Arc::new(AtomicU32::new(0));

        {
            let hits = hits.clone();
            sched.add_runnable(Priority::High, move |sched| {
                let hits = hits.clone();
                sched.add_runnable(Priority::Low, move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    TaskResult::BusyAndFinished
                });
                TaskResult::BusyAndFinished
            });
        }

        assert!(sched.run_one());
        assert!(sched.run_one());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
