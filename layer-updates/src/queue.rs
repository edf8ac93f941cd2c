//! Strictly ordered, single-concurrency task queue.
//!
//! Every update batch is handled by exactly one [`PendingTask`], and tasks
//! run one at a time in the order they were enqueued.  A task that fails or
//! panics never blocks the tasks behind it.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use futures::future::{BoxFuture, FutureExt};
use tokio::task::JoinHandle;

use crate::stats::Counters;

/// "Handle this one update batch."  Futures are lazy, so nothing runs until
/// the queue polls it.
pub type PendingTask = BoxFuture<'static, ()>;

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<PendingTask>,
    /// A drain loop is running and owns the head task.
    active:  bool,
}

/// FIFO of [`PendingTask`]s with a concurrency bound of 1.  Cheap to clone.
#[derive(Clone, Default)]
pub struct UpdateQueue {
    state:    Arc<Mutex<QueueState>>,
    counters: Arc<Counters>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_counters(counters: Arc<Counters>) -> Self {
        Self { state: Arc::default(), counters }
    }

    /// Append `task` to the tail.
    ///
    /// If the queue was empty the task starts right away and a [`QueueRun`]
    /// is returned; it resolves once the queue has drained.  Otherwise the
    /// task waits for its predecessors and `None` is returned.
    pub fn enqueue(&self, task: PendingTask) -> Option<QueueRun> {
        let mut state = self.state.lock().unwrap();
        if state.active {
            state.waiting.push_back(task);
            return None;
        }
        state.active = true;
        drop(state);

        let handle = tokio::spawn(drain(self.state.clone(), self.counters.clone(), task));
        Some(QueueRun { handle })
    }

    /// Tasks currently queued, including the one executing.
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.waiting.len() + usize::from(state.active)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn drain(state: Arc<Mutex<QueueState>>, counters: Arc<Counters>, first: PendingTask) {
    let mut next = Some(first);
    while let Some(task) = next {
        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            tracing::error!("[layer-updates] queued task panicked, moving on to the next one");
        }
        Counters::bump(&counters.tasks_completed);

        let mut guard = state.lock().unwrap();
        next = guard.waiting.pop_front();
        if next.is_none() {
            guard.active = false;
        }
    }
}

/// Completion handle of a drain started by [`UpdateQueue::enqueue`].
///
/// Dropping it does not stop the queue.
pub struct QueueRun {
    handle: JoinHandle<()>,
}

impl Future for QueueRun {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        Pin::new(&mut self.handle).poll(cx).map(|_| ())
    }
}
