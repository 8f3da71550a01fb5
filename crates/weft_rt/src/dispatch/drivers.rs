// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::rc::Weak;
use std::time::{Duration, Instant};

use crate::dispatch::Shared;
use crate::suspension::YieldNow;

/// The I/O driver: an internal task, permanently resident on the ready
/// queue, that advances the readiness multiplexer once per scheduling round.
///
/// When no user work is queued it lets the multiplexer block, bounded by the
/// configured idle interval and by the next timer expiry so that timer
/// dispatch can never go stale by more than the idle bound. When user work is
/// queued it drains the multiplexer without blocking and immediately yields
/// the thread back.
pub(crate) fn io_driver(shared: Weak<Shared>, idle_poll: Duration) -> impl Future<Output = ()> {
    async move {
        loop {
            {
                let Some(shared) = shared.upgrade() else {
                    return;
                };

                let timeout = if shared.has_user_work() {
                    Duration::ZERO
                } else {
                    // An expired-but-undispatched timer yields a zero
                    // timeout, i.e. a non-blocking drain.
                    let next_expiry = shared.timers.borrow().next_expiry();
                    next_expiry.map_or(idle_poll, |expiry| {
                        expiry
                            .saturating_duration_since(Instant::now())
                            .min(idle_poll)
                    })
                };

                let wakeups = shared.reactor.borrow_mut().poll_ready(Some(timeout));

                for wakeup in wakeups {
                    let mut task = wakeup.task;
                    task.sendval = Some(wakeup.readiness);
                    shared.enqueue(task);
                }
            }

            YieldNow::new().await;
        }
    }
}

/// The timer driver: the I/O driver's sibling, dispatching every expired
/// timer once per scheduling round.
pub(crate) fn timer_driver(shared: Weak<Shared>) -> impl Future<Output = ()> {
    async move {
        loop {
            {
                let Some(shared) = shared.upgrade() else {
                    return;
                };

                let now = Instant::now();

                loop {
                    let due = shared.timers.borrow_mut().pop_due(now);
                    let Some(mut task) = due else {
                        break;
                    };

                    // The payload of a timer wake is deliberately unspecified.
                    task.sendval = None;
                    shared.enqueue(task);
                }
            }

            YieldNow::new().await;
        }
    }
}
