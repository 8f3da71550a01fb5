// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::{OnceCell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::task::noop_waker_ref;
use negative_impl::negative_impl;
use tracing::{Level, event};

use crate::TaskContext;
use crate::context::ContextCore;
use crate::dispatch::{SchedulerCommand, io_driver, timer_driver};
use crate::reactor::Reactor;
use crate::suspension::Suspension;
use crate::task::{ParkState, Task, TaskId};
use crate::timers::TimerHeap;

/// The consistency check walks every scheduler structure, so it is O(live
/// tasks) per loop iteration; past this population it would dominate the
/// debug-build fan-in tests, which is when it stops running.
#[cfg(debug_assertions)]
const CONSISTENCY_CHECK_MAX_TASKS: usize = 256;

/// The scheduler state that the dispatch loop, the driver tasks and
/// same-thread spawning all mutate.
///
/// # Ownership
///
/// Owned by the [`SchedulerCore`]; the drivers and the task contexts hold it
/// weakly (tasks live *inside* this state, so a strong reference from a task
/// back to the state would be a cycle). There cannot be any concurrent
/// borrowing because everything here runs on the dispatch thread, and the
/// loop releases its borrows before polling a task so that reentrant calls
/// (a task spawning, a driver waking waiters) can take their own.
#[derive(Debug)]
pub(crate) struct Shared {
    /// FIFO of tasks eligible for resumption.
    pub(crate) ready: RefCell<VecDeque<Task>>,

    /// Membership and location of every live task. A task is filed here from
    /// spawn until its terminal transition, except while it is parked as an
    /// exit-waiter (the exit-join table owns it completely during that time).
    pub(crate) taskmap: RefCell<HashMap<TaskId, ParkState>>,

    pub(crate) timers: RefCell<TimerHeap>,
    pub(crate) reactor: RefCell<Reactor>,

    /// The ids of the two internal driver tasks, filled in at startup. The
    /// drivers are permanent residents of the ready queue, so "is there any
    /// work" questions must not count them.
    pub(crate) driver_ids: OnceCell<[TaskId; 2]>,
}

impl Shared {
    pub(crate) fn new(reactor: Reactor) -> Self {
        Self {
            ready: RefCell::new(VecDeque::new()),
            taskmap: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerHeap::default()),
            reactor: RefCell::new(reactor),
            driver_ids: OnceCell::new(),
        }
    }

    /// Files a task as runnable: records it live and appends it to the ready
    /// queue. Used both for fresh spawns and for wakeups out of the wait
    /// structures.
    pub(crate) fn enqueue(&self, task: Task) {
        self.taskmap.borrow_mut().insert(task.id, ParkState::Ready);
        self.ready.borrow_mut().push_back(task);
    }

    /// Whether any non-driver task is currently queued. This is the idle
    /// predicate for the I/O driver: the drivers themselves are always
    /// queued, so an emptiness check would never fire.
    pub(crate) fn has_user_work(&self) -> bool {
        match self.driver_ids.get() {
            Some(drivers) => self
                .ready
                .borrow()
                .iter()
                .any(|task| !drivers.contains(&task.id)),
            None => !self.ready.borrow().is_empty(),
        }
    }
}

/// What a finished poll told us about the task.
enum PollOutcome {
    Completed,
    Suspended(Suspension),
    Yielded,
    Panicked(Box<dyn std::any::Any + Send>),
}

/// The single-threaded dispatcher: owns the scheduler state and runs the
/// cooperative dispatch loop until told to shut down.
///
/// Each iteration drains the command channel, dequeues one ready task,
/// resumes it with its pending send-value, and acts on what came back: a
/// suspension request is filed into the matching wait structure, a bare
/// yield goes back on the ready queue, completion fans out to exit-waiters,
/// and a panic is contained, logged, and treated as an abnormal completion.
///
/// The loop itself never polls the multiplexer or the timer heap - that work
/// belongs to two internal driver tasks that live on the ready queue like
/// everyone else and therefore compete fairly with user work.
///
/// # Thread safety
///
/// Single-threaded; it only exists on the dispatch thread.
#[derive(Debug)]
pub(crate) struct SchedulerCore {
    shared: Rc<Shared>,
    ctx_core: Rc<ContextCore>,
    command_rx: mpsc::Receiver<SchedulerCommand>,

    /// target id -> tasks parked until the target terminates. Waiters are
    /// owned here and are absent from the taskmap while parked.
    exit_waiting: HashMap<TaskId, Vec<Task>>,

    idle_poll: Duration,
}

#[negative_impl]
impl !Send for SchedulerCore {}
#[negative_impl]
impl !Sync for SchedulerCore {}

impl SchedulerCore {
    pub(crate) fn new(
        reactor: Reactor,
        command_rx: mpsc::Receiver<SchedulerCommand>,
        ids: Arc<AtomicU64>,
        idle_poll: Duration,
    ) -> Self {
        let shared = Rc::new(Shared::new(reactor));
        let ctx_core = Rc::new(ContextCore::new(Rc::downgrade(&shared), ids));

        Self {
            shared,
            ctx_core,
            command_rx,
            exit_waiting: HashMap::new(),
            idle_poll,
        }
    }

    /// Dispatch thread entrypoint. Returns once a shutdown command has been
    /// processed; any still-parked tasks are dropped with the scheduler
    /// state, which runs their cleanup.
    pub(crate) fn run(mut self) {
        self.spawn_drivers();

        loop {
            if !self.drain_commands() {
                break;
            }

            let Some(task) = self.shared.ready.borrow_mut().pop_front() else {
                // Nothing runnable. This only happens before the drivers are
                // queued or after the state was torn down mid-test; block
                // briefly on the command channel rather than spinning.
                match self.command_rx.recv_timeout(self.idle_poll) {
                    Ok(command) => {
                        if !self.apply_command(command) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            };

            self.dispatch(task);

            #[cfg(debug_assertions)]
            self.assert_consistent();
        }

        event!(Level::DEBUG, "dispatch loop exited");
    }

    fn spawn_drivers(&self) {
        let io = io_driver(Rc::downgrade(&self.shared), self.idle_poll);
        let timer = timer_driver(Rc::downgrade(&self.shared));

        let io_id = self.spawn_internal("io-driver", io.boxed_local());
        let timer_id = self.spawn_internal("timer-driver", timer.boxed_local());

        self.shared
            .driver_ids
            .set([io_id, timer_id])
            .expect("drivers are spawned exactly once");
    }

    fn spawn_internal(
        &self,
        name: &str,
        body: futures::future::LocalBoxFuture<'static, ()>,
    ) -> TaskId {
        let id = TaskId::allocate(self.ctx_core.ids());
        self.shared
            .enqueue(Task::new(id, Some(name.to_string()), body));
        id
    }

    /// Drains all pending commands. Returns false once a shutdown command is
    /// seen; the remaining commands (necessarily spawns) are dropped, as
    /// there is no longer any guarantee anyone waits for those tasks.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.command_rx.try_recv() {
                Ok(command) => {
                    if !self.apply_command(command) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    // Every client handle is gone, so no shutdown command can
                    // ever arrive; treat the disconnect as one.
                    return false;
                }
            }
        }
    }

    fn apply_command(&mut self, command: SchedulerCommand) -> bool {
        match command {
            SchedulerCommand::Spawn {
                id,
                name,
                future_factory,
            } => {
                let ctx = TaskContext::new(Rc::clone(&self.ctx_core));

                // The factory is user code; a panic in it must not take the
                // dispatch thread down. The task is then simply never filed,
                // which waiters observe as "already gone".
                match catch_unwind(AssertUnwindSafe(|| future_factory(ctx))) {
                    Ok(body) => {
                        let task = Task::new(id, name, body);

                        event!(
                            Level::TRACE,
                            message = "task spawned remotely",
                            id = %id,
                            name = task.label()
                        );

                        self.shared.enqueue(task);
                    }
                    Err(_payload) => {
                        event!(
                            Level::ERROR,
                            message = "task body factory panicked, task discarded",
                            id = %id
                        );
                    }
                }

                true
            }
            SchedulerCommand::Shutdown => {
                event!(Level::DEBUG, "shutdown command received");
                false
            }
        }
    }

    /// Resumes one task and files it according to the outcome.
    fn dispatch(&mut self, mut task: Task) {
        self.ctx_core.set_delivered(task.sendval.take());

        let mut cx = Context::from_waker(noop_waker_ref());
        let polled = catch_unwind(AssertUnwindSafe(|| task.poll(&mut cx)));

        // Take both scratch cells unconditionally so that nothing a task left
        // behind (including a half-posted request before a panic) can leak
        // into the next poll.
        let posted = self.ctx_core.take_posted();
        let leftover = self.ctx_core.take_delivered();

        let outcome = match polled {
            Ok(Poll::Ready(())) => PollOutcome::Completed,
            Ok(Poll::Pending) => match posted {
                Some(request) => PollOutcome::Suspended(request),
                None => PollOutcome::Yielded,
            },
            Err(payload) => PollOutcome::Panicked(payload),
        };

        match outcome {
            PollOutcome::Completed => self.complete(task),
            PollOutcome::Suspended(request) => self.park(task, request),
            PollOutcome::Yielded => {
                // The send-value stays untouched across a bare yield.
                task.sendval = leftover;
                self.shared.enqueue(task);
            }
            PollOutcome::Panicked(payload) => self.crash(task, payload.as_ref()),
        }
    }

    fn complete(&mut self, task: Task) {
        event!(Level::TRACE, message = "task completed", id = %task.id);

        self.shared.taskmap.borrow_mut().remove(&task.id);
        self.fan_out(task.id, true);
    }

    fn crash(&mut self, task: Task, payload: &(dyn std::any::Any + Send)) {
        let reason = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic payload>");

        event!(
            Level::ERROR,
            message = "task panicked and was removed",
            id = %task.id,
            name = task.label(),
            reason
        );

        self.shared.taskmap.borrow_mut().remove(&task.id);
        self.fan_out(task.id, false);
    }

    /// Files a suspended task into the wait structure its request names, or
    /// re-queues it with the immediate answer where the request calls for one.
    fn park(&mut self, mut task: Task, request: Suspension) {
        match request {
            Suspension::WaitForTime(delay) => {
                let expiry = Instant::now() + delay;
                self.set_park_state(task.id, ParkState::WaitingTimer);
                self.shared.timers.borrow_mut().push(expiry, task);
            }
            Suspension::WaitForRead(fd) => {
                let id = task.id;
                match self.shared.reactor.borrow_mut().park_read(fd, task) {
                    Ok(()) => self.set_park_state(id, ParkState::WaitingRead(fd)),
                    Err(mut task) => {
                        task.sendval = Some(false);
                        self.shared.enqueue(task);
                    }
                }
            }
            Suspension::WaitForWrite(fd) => {
                let id = task.id;
                match self.shared.reactor.borrow_mut().park_write(fd, task) {
                    Ok(()) => self.set_park_state(id, ParkState::WaitingWrite(fd)),
                    Err(mut task) => {
                        task.sendval = Some(false);
                        self.shared.enqueue(task);
                    }
                }
            }
            Suspension::WaitForTask(target) => {
                let target_is_live = self.shared.taskmap.borrow().contains_key(&target);

                if target_is_live {
                    // The waiter leaves the taskmap while it is parked; the
                    // exit-join table owns it until the target terminates.
                    self.shared.taskmap.borrow_mut().remove(&task.id);
                    self.exit_waiting.entry(target).or_default().push(task);
                } else {
                    task.sendval = Some(false);
                    self.shared.enqueue(task);
                }
            }
            Suspension::KillTask(target) => self.kill(task, target),
        }
    }

    fn kill(&mut self, mut requester: Task, target: TaskId) {
        if target == requester.id {
            // A task killing itself terminates right here; there is nothing
            // left to resume.
            event!(Level::DEBUG, message = "task killed itself", id = %target);
            self.shared.taskmap.borrow_mut().remove(&target);
            self.fan_out(target, false);
            return;
        }

        let Some(park_state) = self.shared.taskmap.borrow_mut().remove(&target) else {
            requester.sendval = Some(false);
            self.shared.enqueue(requester);
            return;
        };

        let victim = self.extract(target, park_state);
        assert!(
            victim.is_some(),
            "live task {target} was not found in the structure the taskmap recorded"
        );

        event!(Level::DEBUG, message = "task killed", id = %target);

        // Dropping the victim here drops its body future, which runs any
        // cleanup pending at its suspension point.
        drop(victim);

        self.fan_out(target, false);

        requester.sendval = Some(true);
        self.shared.enqueue(requester);
    }

    /// Pulls a live task out of the structure its park state names.
    fn extract(&mut self, id: TaskId, park_state: ParkState) -> Option<Task> {
        match park_state {
            ParkState::Ready => {
                let mut ready = self.shared.ready.borrow_mut();
                let position = ready.iter().position(|task| task.id == id)?;
                ready.remove(position)
            }
            ParkState::WaitingRead(fd) => self.shared.reactor.borrow_mut().cancel_read(fd),
            ParkState::WaitingWrite(fd) => self.shared.reactor.borrow_mut().cancel_write(fd),
            ParkState::WaitingTimer => self.shared.timers.borrow_mut().remove(id),
        }
    }

    /// Wakes everything parked on the terminated task, delivering `true` for
    /// a normal completion and `false` for a kill or a panic.
    fn fan_out(&mut self, terminated: TaskId, payload: bool) {
        let Some(waiters) = self.exit_waiting.remove(&terminated) else {
            return;
        };

        for mut waiter in waiters {
            waiter.sendval = Some(payload);
            self.shared.enqueue(waiter);
        }
    }

    fn set_park_state(&self, id: TaskId, state: ParkState) {
        let previous = self.shared.taskmap.borrow_mut().insert(id, state);
        debug_assert!(
            previous.is_some(),
            "park state recorded for a task that is not live"
        );
    }

    /// Verifies, at a loop boundary, that every live task is in exactly the
    /// one structure the taskmap records for it and that exit-waiters are in
    /// none. Runs in debug builds only, and only while the population is
    /// small enough for an O(n) walk per iteration to stay cheap.
    #[cfg(debug_assertions)]
    fn assert_consistent(&self) {
        use std::collections::HashSet;

        let taskmap = self.shared.taskmap.borrow();
        if taskmap.len() > CONSISTENCY_CHECK_MAX_TASKS {
            return;
        }

        let mut seen: HashSet<TaskId> = HashSet::new();

        for task in self.shared.ready.borrow().iter() {
            assert!(
                seen.insert(task.id),
                "task {} is in more than one scheduler structure",
                task.id
            );
            assert_eq!(taskmap.get(&task.id), Some(&ParkState::Ready));
        }

        let reactor = self.shared.reactor.borrow();
        for (fd, id) in reactor.read_waiting_ids() {
            assert!(
                seen.insert(id),
                "task {id} is in more than one scheduler structure"
            );
            assert_eq!(taskmap.get(&id), Some(&ParkState::WaitingRead(fd)));
        }
        for (fd, id) in reactor.write_waiting_ids() {
            assert!(
                seen.insert(id),
                "task {id} is in more than one scheduler structure"
            );
            assert_eq!(taskmap.get(&id), Some(&ParkState::WaitingWrite(fd)));
        }

        for id in self.shared.timers.borrow().task_ids() {
            assert!(
                seen.insert(id),
                "task {id} is in more than one scheduler structure"
            );
            assert_eq!(taskmap.get(&id), Some(&ParkState::WaitingTimer));
        }

        for waiter in self.exit_waiting.values().flatten() {
            assert!(
                seen.insert(waiter.id),
                "task {} is in more than one scheduler structure",
                waiter.id
            );
            assert!(
                !taskmap.contains_key(&waiter.id),
                "exit-waiter {} must not be in the taskmap while parked",
                waiter.id
            );
        }

        for id in taskmap.keys() {
            assert!(
                seen.contains(id),
                "live task {id} is in no scheduler structure"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::future::LocalBoxFuture;

    use super::*;

    fn test_shared() -> (Shared, Arc<AtomicU64>) {
        let poll = mio::Poll::new().expect("creating an epoll instance for tests");
        (Shared::new(Reactor::new(poll)), Arc::new(AtomicU64::new(1)))
    }

    fn noop_body() -> LocalBoxFuture<'static, ()> {
        FutureExt::boxed_local(async {})
    }

    #[test]
    fn enqueue_files_the_task_as_ready() {
        let (shared, ids) = test_shared();
        let id = TaskId::allocate(&ids);

        shared.enqueue(Task::new(id, None, noop_body()));

        assert_eq!(shared.taskmap.borrow().get(&id), Some(&ParkState::Ready));
        assert_eq!(shared.ready.borrow().len(), 1);
    }

    #[test]
    fn user_work_predicate_ignores_the_drivers() {
        // Before the driver ids are known, anything queued counts as work.
        // Afterwards the resident drivers must not keep the I/O driver from
        // blocking on an otherwise idle runtime.

        let (shared, ids) = test_shared();

        assert!(!shared.has_user_work());

        let driver_a = TaskId::allocate(&ids);
        let driver_b = TaskId::allocate(&ids);
        shared.enqueue(Task::new(driver_a, None, noop_body()));
        assert!(shared.has_user_work());

        shared
            .driver_ids
            .set([driver_a, driver_b])
            .expect("driver ids are set once");
        assert!(!shared.has_user_work());

        let user = TaskId::allocate(&ids);
        shared.enqueue(Task::new(user, None, noop_body()));
        assert!(shared.has_user_work());
    }
}
