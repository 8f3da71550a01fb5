// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::TaskId;
use crate::context::ContextCore;

/// A request a task hands to the scheduler to describe why it is suspending.
///
/// Requests are pure values: the variant tag plus exactly the parameters the
/// matching scheduler handler needs. The leaf futures below post one of these
/// through the task context during a poll; the dispatch loop picks it up once
/// the poll returns `Pending` and files the task into the appropriate wait
/// structure.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Suspension {
    /// Park until the descriptor is readable (or fails).
    WaitForRead(RawFd),

    /// Park until the descriptor is writable (or fails).
    WaitForWrite(RawFd),

    /// Park until the delay has elapsed on the monotonic clock.
    WaitForTime(Duration),

    /// Park until the target task terminates.
    WaitForTask(TaskId),

    /// Terminate the target task.
    KillTask(TaskId),
}

/// The two-phase core shared by every suspension future.
///
/// First poll: post the request to the scheduler through the context scratch
/// cell and return `Pending` - the dispatch loop takes over from there.
/// Second poll: the scheduler has re-queued the task with a send-value; take
/// it and resolve. Wakers play no part in this - wakeup routing is owned by
/// the scheduler's wait structures.
#[derive(Debug)]
struct Park {
    core: Rc<ContextCore>,
    request: Option<Suspension>,
    parked: bool,
}

impl Park {
    fn new(core: Rc<ContextCore>, request: Suspension) -> Self {
        Self {
            core,
            request: Some(request),
            parked: false,
        }
    }
}

impl Future for Park {
    type Output = Option<bool>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.parked {
            Poll::Ready(self.core.take_delivered())
        } else {
            let request = self
                .request
                .take()
                .expect("suspension request was already posted");
            self.core.post(request);
            self.parked = true;
            Poll::Pending
        }
    }
}

fn expect_payload(payload: Option<bool>) -> bool {
    payload.expect("the scheduler delivers a boolean payload to this suspension")
}

/// Suspends the task until the descriptor is readable.
///
/// Resolves to `true` on readiness. Resolves to `false` if the descriptor
/// reported hangup or error, in which case it has already been unregistered
/// from the multiplexer (but not closed - descriptors belong to user code).
///
/// At most one task may be waiting to read a given descriptor at a time;
/// violating this is a programming error and the scheduler asserts on it.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct WaitForRead {
    park: Park,
}

impl WaitForRead {
    pub(crate) fn new(core: Rc<ContextCore>, fd: RawFd) -> Self {
        Self {
            park: Park::new(core, Suspension::WaitForRead(fd)),
        }
    }
}

impl Future for WaitForRead {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.park).poll(cx).map(expect_payload)
    }
}

/// Suspends the task until the descriptor is writable.
///
/// The contract is the mirror image of [`WaitForRead`], including the
/// one-waiter-per-direction rule. A single descriptor may have a read waiter
/// and a write waiter at the same time.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct WaitForWrite {
    park: Park,
}

impl WaitForWrite {
    pub(crate) fn new(core: Rc<ContextCore>, fd: RawFd) -> Self {
        Self {
            park: Park::new(core, Suspension::WaitForWrite(fd)),
        }
    }
}

impl Future for WaitForWrite {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.park).poll(cx).map(expect_payload)
    }
}

/// Suspends the task for at least the given delay, measured on the monotonic
/// clock.
///
/// The task is re-queued once the timer driver observes the expiry; the exact
/// wakeup latency is bounded by the runtime's idle poll interval. Resolves to
/// `()` - the suspension deliberately carries no payload.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct WaitForTime {
    park: Park,
}

impl WaitForTime {
    pub(crate) fn new(core: Rc<ContextCore>, delay: Duration) -> Self {
        Self {
            park: Park::new(core, Suspension::WaitForTime(delay)),
        }
    }
}

impl Future for WaitForTime {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Whatever payload the scheduler did or did not leave behind is
        // dropped here so nothing downstream can come to depend on it.
        Pin::new(&mut self.park).poll(cx).map(|_| ())
    }
}

/// Suspends the task until the target task terminates.
///
/// Resolves to `true` once the target has completed, and to `false` either
/// immediately (the target was already gone - or never existed - at the time
/// of the request; the two are indistinguishable) or when the target
/// terminated abnormally (killed, or its body panicked).
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct WaitForTask {
    park: Park,
}

impl WaitForTask {
    pub(crate) fn new(core: Rc<ContextCore>, target: TaskId) -> Self {
        Self {
            park: Park::new(core, Suspension::WaitForTask(target)),
        }
    }
}

impl Future for WaitForTask {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.park).poll(cx).map(expect_payload)
    }
}

/// Terminates the target task.
///
/// The target's body future is dropped at its current suspension point (which
/// runs its cleanup), it is extracted from whichever wait structure held it,
/// and its exit-waiters are woken with `false`. Resolves to `true` if the
/// target existed and was killed, `false` if it was already gone.
///
/// Aiming this at the requesting task itself terminates the requester; the
/// future then never resolves because its task is gone.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct KillTask {
    park: Park,
}

impl KillTask {
    pub(crate) fn new(core: Rc<ContextCore>, target: TaskId) -> Self {
        Self {
            park: Park::new(core, Suspension::KillTask(target)),
        }
    }
}

impl Future for KillTask {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.park).poll(cx).map(expect_payload)
    }
}

/// When polled, yields the task to allow other ready tasks to execute.
///
/// This is not a suspension: the task posts no request and the dispatch loop
/// re-queues it behind everything already in the ready queue.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    first_poll_completed: bool,
}

impl YieldNow {
    pub(crate) const fn new() -> Self {
        Self {
            first_poll_completed: false,
        }
    }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.first_poll_completed {
            Poll::Ready(())
        } else {
            self.first_poll_completed = true;
            // Our own dispatch loop re-queues bare-yielding tasks without
            // waker involvement; the wake keeps the future well-behaved on
            // executors that do rely on wakers (e.g. in unit tests).
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
