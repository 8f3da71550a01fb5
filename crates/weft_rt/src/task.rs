// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;

/// Identifies a task within a single runtime instance.
///
/// Ids are allocated from a counter shared between the dispatch thread and the
/// public façade, so a spawner on any thread knows the id of its task before
/// the dispatch thread has even heard of it. Ids are never reused within a
/// runtime instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn allocate(counter: &Arc<AtomicU64>) -> Self {
        Self(counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unit of dispatch: a suspended computation plus the bookkeeping the
/// scheduler needs to resume it.
///
/// The body future's output type is `()` - a task is an execution unit, not a
/// value producer. Anything a task wants to communicate it delivers itself,
/// typically through a channel or a shared counter captured by its body.
///
/// # Ownership
///
/// Exactly one structure owns a task at any moment: the ready queue, one of
/// the wait structures, or (transiently, between dequeue and re-file) the
/// dispatch loop itself. Dropping a task drops its body future, which runs
/// any cleanup the body holds at its current suspension point.
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: Option<String>,

    /// The value delivered into the task on its next resume. Set by whichever
    /// wait structure wakes the task; `None` means the resumed suspension
    /// carries no payload.
    pub(crate) sendval: Option<bool>,

    future: LocalBoxFuture<'static, ()>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: Option<String>,
        future: LocalBoxFuture<'static, ()>,
    ) -> Self {
        Self {
            id,
            name,
            sendval: None,
            future,
        }
    }

    pub(crate) fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.future.as_mut().poll(cx)
    }

    pub(crate) fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sendval", &self.sendval)
            .finish_non_exhaustive()
    }
}

/// Which structure currently holds a live task.
///
/// Recorded in the taskmap next to each live task so that a kill request can
/// extract its victim from the right wait structure without searching, and so
/// the debug-build consistency check can verify that every task really is
/// where the taskmap says it is.
///
/// Tasks parked on another task's exit are deliberately absent here: an
/// exit-waiter is removed from the taskmap entirely while it is parked and
/// reinserted on wake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ParkState {
    /// In the ready queue, or currently being polled by the dispatch loop.
    Ready,

    /// Parked in the reactor's read index for this descriptor.
    WaitingRead(RawFd),

    /// Parked in the reactor's write index for this descriptor.
    WaitingWrite(RawFd),

    /// Parked in the timer heap.
    WaitingTimer,
}
