// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::Cell;
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use futures::FutureExt;
use negative_impl::negative_impl;
use tracing::{Level, event};

use crate::dispatch::Shared;
use crate::suspension::{
    KillTask, Suspension, WaitForRead, WaitForTask, WaitForTime, WaitForWrite, YieldNow,
};
use crate::task::{Task, TaskId};

/// Provides a task body access to the scheduler that runs it: the suspension
/// request constructors, same-thread spawning, and cooperative yielding.
///
/// Every task body receives its own `TaskContext` from the future factory it
/// was spawned with. There is no ambient global scheduler - a context always
/// belongs to exactly one runtime instance, and several independent runtimes
/// may coexist in one process.
///
/// # Thread safety
///
/// This type is single-threaded: it is only meaningful on the dispatch thread
/// that polls the task, and it cannot be sent to or shared with other threads.
#[derive(Clone, Debug)]
pub struct TaskContext {
    core: Rc<ContextCore>,
}

#[negative_impl]
impl !Send for TaskContext {}
#[negative_impl]
impl !Sync for TaskContext {}

impl TaskContext {
    pub(crate) fn new(core: Rc<ContextCore>) -> Self {
        Self { core }
    }

    /// Spawns a new task on the same scheduler and returns its id.
    ///
    /// The task is live (visible to [`wait_for_task`][Self::wait_for_task] and
    /// [`kill_task`][Self::kill_task]) before this call returns, so spawning a
    /// child and immediately waiting on it works as expected.
    pub fn spawn<FF, F>(&self, future_factory: FF) -> TaskId
    where
        FF: FnOnce(Self) -> F + 'static,
        F: Future<Output = ()> + 'static,
    {
        self.core.spawn_local(None, future_factory)
    }

    /// Spawns a new task with a diagnostic name attached.
    ///
    /// The name shows up in runtime trace output; it has no semantic meaning.
    pub fn spawn_named<FF, F>(&self, name: impl Into<String>, future_factory: FF) -> TaskId
    where
        FF: FnOnce(Self) -> F + 'static,
        F: Future<Output = ()> + 'static,
    {
        self.core.spawn_local(Some(name.into()), future_factory)
    }

    /// Suspends the task until the descriptor is readable; see [`WaitForRead`].
    ///
    /// The descriptor is borrowed for registration only - the runtime never
    /// closes it, and the caller must keep it open until the future resolves.
    pub fn wait_for_read(&self, fd: &impl AsRawFd) -> WaitForRead {
        WaitForRead::new(Rc::clone(&self.core), fd.as_raw_fd())
    }

    /// Suspends the task until the descriptor is writable; see [`WaitForWrite`].
    pub fn wait_for_write(&self, fd: &impl AsRawFd) -> WaitForWrite {
        WaitForWrite::new(Rc::clone(&self.core), fd.as_raw_fd())
    }

    /// Suspends the task for at least `delay`; see [`WaitForTime`].
    pub fn wait_for_time(&self, delay: Duration) -> WaitForTime {
        WaitForTime::new(Rc::clone(&self.core), delay)
    }

    /// Suspends the task until the target task terminates; see [`WaitForTask`].
    pub fn wait_for_task(&self, target: TaskId) -> WaitForTask {
        WaitForTask::new(Rc::clone(&self.core), target)
    }

    /// Terminates the target task; see [`KillTask`].
    pub fn kill_task(&self, target: TaskId) -> KillTask {
        KillTask::new(Rc::clone(&self.core), target)
    }

    /// Yields the task, re-queueing it behind everything already runnable.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow::new()
    }
}

/// The scheduler side of the task context: the scratch cells the dispatch
/// loop exchanges with leaf suspension futures, plus what same-thread
/// spawning needs.
///
/// # Ownership
///
/// One instance per scheduler, shared via `Rc` between the dispatch loop and
/// every task context it hands out. Holds the scheduler state only weakly -
/// tasks (which capture their context) live inside that state, and a strong
/// reference here would tie the two into a cycle that outlives the runtime.
#[derive(Debug)]
pub(crate) struct ContextCore {
    shared: Weak<Shared>,
    ids: Arc<AtomicU64>,

    /// The suspension request posted by a leaf future during the current
    /// poll, if any. Drained by the dispatch loop right after the poll.
    posted: Cell<Option<Suspension>>,

    /// The send-value for the task currently being polled. Loaded by the
    /// dispatch loop right before the poll, consumed by the resumed leaf.
    delivered: Cell<Option<bool>>,
}

impl ContextCore {
    pub(crate) fn new(shared: Weak<Shared>, ids: Arc<AtomicU64>) -> Self {
        Self {
            shared,
            ids,
            posted: Cell::new(None),
            delivered: Cell::new(None),
        }
    }

    pub(crate) fn ids(&self) -> &Arc<AtomicU64> {
        &self.ids
    }

    pub(crate) fn post(&self, request: Suspension) {
        let previous = self.posted.replace(Some(request));
        assert!(
            previous.is_none(),
            "a task may post at most one suspension request per poll"
        );
    }

    pub(crate) fn take_posted(&self) -> Option<Suspension> {
        self.posted.take()
    }

    pub(crate) fn set_delivered(&self, payload: Option<bool>) {
        self.delivered.set(payload);
    }

    pub(crate) fn take_delivered(&self) -> Option<bool> {
        self.delivered.take()
    }

    /// Same-thread spawn: instantiates the body and files the task directly
    /// into the scheduler state, reentrantly from inside a poll.
    fn spawn_local<FF, F>(self: &Rc<Self>, name: Option<String>, future_factory: FF) -> TaskId
    where
        FF: FnOnce(TaskContext) -> F + 'static,
        F: Future<Output = ()> + 'static,
    {
        let shared = self
            .shared
            .upgrade()
            .expect("spawn from a task that outlived its scheduler");

        let id = TaskId::allocate(&self.ids);
        let body = future_factory(TaskContext::new(Rc::clone(self))).boxed_local();
        let task = Task::new(id, name, body);

        event!(
            Level::TRACE,
            message = "task spawned locally",
            id = %id,
            name = task.label()
        );

        shared.enqueue(task);
        id
    }
}
