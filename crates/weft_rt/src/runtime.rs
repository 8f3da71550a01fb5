// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::thread;

use futures::FutureExt;
use tracing::{Level, event};

use crate::dispatch::SchedulerClient;
use crate::task::TaskId;
use crate::{Result, RuntimeBuilder, TaskContext};

/// Provides arbitrary code access to an instance of the Weft Runtime,
/// allowing the caller to schedule tasks on it, wait for them, and shut the
/// runtime down.
///
/// Each instance owns one dispatch thread that cooperatively schedules every
/// task spawned on it. Instances are independent: a process may run several
/// runtimes side by side.
///
/// Dropping the runtime shuts it down, which blocks the current thread until
/// the dispatch loop exits.
///
/// # Thread safety
///
/// This type is thread-safe; spawning and joining may happen from any thread
/// except the runtime's own dispatch thread (which would deadlock on the
/// blocking operations - task code should use [`TaskContext`] instead).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// fn main() -> weft_rt::Result<()> {
///     let mut runtime = weft_rt::Runtime::new()?;
///
///     let id = runtime.spawn(|ctx| async move {
///         ctx.wait_for_time(Duration::from_millis(10)).await;
///     });
///
///     runtime.join_all([id]);
///     runtime.shutdown();
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Runtime {
    client: SchedulerClient,
    thread: Option<thread::JoinHandle<()>>,
}

impl Runtime {
    /// Creates and starts a new runtime with the default configuration.
    ///
    /// This is equivalent to calling [`RuntimeBuilder::new().build()`][RuntimeBuilder].
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel multiplexer or the dispatch thread
    /// could not be created.
    pub fn new() -> Result<Self> {
        RuntimeBuilder::new().build()
    }

    pub(crate) fn new_started(client: SchedulerClient, thread: thread::JoinHandle<()>) -> Self {
        Self {
            client,
            thread: Some(thread),
        }
    }

    /// Starts a new task whose body is the future constructed by the provided
    /// factory, and returns the task's id.
    ///
    /// The factory crosses to the dispatch thread and is invoked there with
    /// the task's [`TaskContext`]; the future it builds never changes
    /// threads, so it does not need to be `Send`.
    ///
    /// The id is returned immediately. The task itself begins running once
    /// the dispatch loop picks the request up; if the runtime is already
    /// shutting down, the task is discarded and never runs.
    pub fn spawn<FF, F>(&self, future_factory: FF) -> TaskId
    where
        FF: FnOnce(TaskContext) -> F + Send + 'static,
        F: Future<Output = ()> + 'static,
    {
        self.client
            .spawn(None, Box::new(|ctx| future_factory(ctx).boxed_local()))
    }

    /// Same as [`spawn`][Self::spawn], with a diagnostic name attached.
    pub fn spawn_named<FF, F>(&self, name: impl Into<String>, future_factory: FF) -> TaskId
    where
        FF: FnOnce(TaskContext) -> F + Send + 'static,
        F: Future<Output = ()> + 'static,
    {
        self.client.spawn(
            Some(name.into()),
            Box::new(|ctx| future_factory(ctx).boxed_local()),
        )
    }

    /// Blocks the calling thread until every given task has terminated.
    ///
    /// Ids whose tasks are already gone - completed, killed, or never spawned
    /// on this runtime - count as terminated. If the runtime shuts down
    /// before the remaining tasks finish, the call returns rather than wait
    /// for tasks that can no longer run.
    pub fn join_all<I>(&self, ids: I)
    where
        I: IntoIterator<Item = TaskId>,
    {
        let ids: Vec<TaskId> = ids.into_iter().collect();
        let (completed_tx, completed_rx) = oneshot::channel();

        self.spawn_named("join-all", move |ctx| async move {
            for id in ids {
                _ = ctx.wait_for_task(id).await;
            }

            _ = completed_tx.send(());
        });

        // A receive error means the sender was dropped without firing: the
        // runtime shut down underneath us. Either way there is nothing left
        // to wait for.
        _ = completed_rx.recv();
    }

    /// Shuts the runtime down: asks the dispatch loop to exit at its next
    /// iteration boundary and blocks until the dispatch thread has ended.
    ///
    /// Tasks still parked at that point never resume; they are dropped with
    /// the scheduler state, which runs whatever cleanup their bodies hold.
    /// Safe to call multiple times.
    pub fn shutdown(&mut self) {
        self.client.stop();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                event!(Level::ERROR, "dispatch thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Runtime: Send, Sync);

    const GENEROUS_DEADLINE: Duration = Duration::from_secs(30);

    fn nonblocking_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().expect("creating a socket pair for tests");
        a.set_nonblocking(true).expect("setting nonblocking mode");
        b.set_nonblocking(true).expect("setting nonblocking mode");
        (a, b)
    }

    /// Sets the flag when dropped; used to observe that a killed or abandoned
    /// task's cleanup really ran.
    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn fan_in_join_of_ten_thousand_sleepers() {
        // 10 000 tasks each sleep for one second and bump a counter. The
        // sleeps overlap, so the whole flock must finish in wall-clock time
        // close to one second - not in ten thousand.

        let runtime = Runtime::new().expect("starting the runtime");
        let counter = Arc::new(AtomicUsize::new(0));

        let start = Instant::now();

        let ids: Vec<TaskId> = (0..10_000)
            .map(|_| {
                let counter = Arc::clone(&counter);
                runtime.spawn(move |ctx| async move {
                    ctx.wait_for_time(Duration::from_secs(1)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        runtime.join_all(ids);
        let elapsed = start.elapsed();

        assert_eq!(counter.load(Ordering::SeqCst), 10_000);
        assert!(elapsed >= Duration::from_secs(1));
        assert!(
            elapsed < GENEROUS_DEADLINE,
            "fan-in took {elapsed:?}, sleeps are not overlapping"
        );
    }

    #[test]
    fn write_and_read_across_a_socket_pair() {
        // A writer task waits for writability and sends a greeting; a reader
        // task waits for readability on the peer and checks what arrived.

        let runtime = Runtime::new().expect("starting the runtime");
        let (writer_end, reader_end) = nonblocking_pair();
        let received = Arc::new(AtomicBool::new(false));

        let writer = runtime.spawn({
            move |ctx| async move {
                let mut stream = writer_end;
                assert!(ctx.wait_for_write(&stream).await);
                stream.write_all(b"ping").expect("writing to the socket");
            }
        });

        let reader = runtime.spawn({
            let received = Arc::clone(&received);
            move |ctx| async move {
                let mut stream = reader_end;
                assert!(ctx.wait_for_read(&stream).await);

                let mut buffer = [0_u8; 4];
                stream
                    .read_exact(&mut buffer)
                    .expect("reading from the socket");

                if &buffer == b"ping" {
                    received.store(true, Ordering::SeqCst);
                }
            }
        });

        runtime.join_all([writer, reader]);

        assert!(received.load(Ordering::SeqCst));
    }

    #[test]
    fn exit_join_chain_waits_for_the_child() {
        // A task spawns a child and waits for it. The parent must resume with
        // a success payload, and only after the child's side effect happened.

        let runtime = Runtime::new().expect("starting the runtime");
        let child_done = Arc::new(AtomicBool::new(false));
        let parent_saw_child_done = Arc::new(AtomicBool::new(false));
        let parent_payload = Arc::new(AtomicBool::new(false));

        let parent = runtime.spawn({
            let child_done = Arc::clone(&child_done);
            let parent_saw_child_done = Arc::clone(&parent_saw_child_done);
            let parent_payload = Arc::clone(&parent_payload);

            move |ctx| async move {
                let child = ctx.spawn({
                    let child_done = Arc::clone(&child_done);
                    move |ctx| async move {
                        ctx.wait_for_time(Duration::from_millis(200)).await;
                        child_done.store(true, Ordering::SeqCst);
                    }
                });

                let waited = ctx.wait_for_task(child).await;

                parent_payload.store(waited, Ordering::SeqCst);
                parent_saw_child_done.store(child_done.load(Ordering::SeqCst), Ordering::SeqCst);
            }
        });

        runtime.join_all([parent]);

        assert!(child_done.load(Ordering::SeqCst));
        assert!(parent_saw_child_done.load(Ordering::SeqCst));
        assert!(parent_payload.load(Ordering::SeqCst));
    }

    #[test]
    fn kill_terminates_a_timer_parked_task() {
        // The victim settles in for a ten-second sleep while holding a drop
        // guard. The killer terminates it: the kill reports success, the
        // victim's cleanup runs immediately, its body never resumes, and
        // joining the dead victim returns promptly.

        let runtime = Runtime::new().expect("starting the runtime");
        let cleanup_ran = Arc::new(AtomicBool::new(false));
        let victim_resumed = Arc::new(AtomicBool::new(false));
        let kill_reported = Arc::new(AtomicBool::new(false));

        let start = Instant::now();

        let victim = runtime.spawn({
            let cleanup_ran = Arc::clone(&cleanup_ran);
            let victim_resumed = Arc::clone(&victim_resumed);
            move |ctx| async move {
                let _guard = SetOnDrop(cleanup_ran);
                ctx.wait_for_time(Duration::from_secs(10)).await;
                victim_resumed.store(true, Ordering::SeqCst);
            }
        });

        let killer = runtime.spawn({
            let kill_reported = Arc::clone(&kill_reported);
            move |ctx| async move {
                // Let the victim reach its suspension point first.
                ctx.wait_for_time(Duration::from_millis(50)).await;
                kill_reported.store(ctx.kill_task(victim).await, Ordering::SeqCst);
            }
        });

        runtime.join_all([killer, victim]);
        let elapsed = start.elapsed();

        assert!(kill_reported.load(Ordering::SeqCst));
        assert!(cleanup_ran.load(Ordering::SeqCst));
        assert!(!victim_resumed.load(Ordering::SeqCst));
        assert!(
            elapsed < Duration::from_secs(5),
            "joining a killed task took {elapsed:?}"
        );
    }

    #[test]
    fn kill_wakes_the_victims_exit_waiters_with_false() {
        // A waiter parks on the victim's exit before the kill lands. The kill
        // must release the waiter with a failure payload instead of leaving
        // it parked forever.

        let runtime = Runtime::new().expect("starting the runtime");
        let waiter_payload = Arc::new(AtomicBool::new(true));

        let victim = runtime.spawn(|ctx| async move {
            ctx.wait_for_time(Duration::from_secs(10)).await;
        });

        let waiter = runtime.spawn({
            let waiter_payload = Arc::clone(&waiter_payload);
            move |ctx| async move {
                waiter_payload.store(ctx.wait_for_task(victim).await, Ordering::SeqCst);
            }
        });

        let killer = runtime.spawn(move |ctx| async move {
            ctx.wait_for_time(Duration::from_millis(50)).await;
            assert!(ctx.kill_task(victim).await);
        });

        runtime.join_all([waiter, killer]);

        assert!(!waiter_payload.load(Ordering::SeqCst));
    }

    #[test]
    fn hangup_wakes_the_reader_with_false() {
        // The peer disappears without writing anything. The parked reader
        // must be woken with a failure payload rather than wait forever.

        let runtime = Runtime::new().expect("starting the runtime");
        let (ours, peer) = nonblocking_pair();
        let payload = Arc::new(AtomicBool::new(true));

        drop(peer);

        let reader = runtime.spawn({
            let payload = Arc::clone(&payload);
            move |ctx| async move {
                let stream = ours;
                payload.store(ctx.wait_for_read(&stream).await, Ordering::SeqCst);
            }
        });

        runtime.join_all([reader]);

        assert!(!payload.load(Ordering::SeqCst));
    }

    #[test]
    fn requests_against_a_gone_task_answer_false_immediately() {
        // Waiting on or killing a task that already completed resolves right
        // away with a failure payload - indistinguishable from a task that
        // never existed.

        let runtime = Runtime::new().expect("starting the runtime");

        let short_lived = runtime.spawn(|_ctx| async {});
        runtime.join_all([short_lived]);

        let wait_payload = Arc::new(AtomicBool::new(true));
        let kill_payload = Arc::new(AtomicBool::new(true));

        let prober = runtime.spawn({
            let wait_payload = Arc::clone(&wait_payload);
            let kill_payload = Arc::clone(&kill_payload);
            move |ctx| async move {
                wait_payload.store(ctx.wait_for_task(short_lived).await, Ordering::SeqCst);
                kill_payload.store(ctx.kill_task(short_lived).await, Ordering::SeqCst);
            }
        });

        runtime.join_all([prober]);

        assert!(!wait_payload.load(Ordering::SeqCst));
        assert!(!kill_payload.load(Ordering::SeqCst));
    }

    #[test]
    fn bare_yields_keep_the_task_runnable() {
        let runtime = Runtime::new().expect("starting the runtime");
        let laps = Arc::new(AtomicUsize::new(0));

        let id = runtime.spawn({
            let laps = Arc::clone(&laps);
            move |ctx| async move {
                for _ in 0..50 {
                    ctx.yield_now().await;
                    laps.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        runtime.join_all([id]);

        assert_eq!(laps.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn panicking_task_is_contained_and_releases_its_waiters() {
        // The child panics. Its parent, parked on the child's exit, must be
        // woken with a failure payload, and the runtime must keep scheduling
        // other work afterwards.

        let runtime = Runtime::new().expect("starting the runtime");
        let parent_payload = Arc::new(AtomicBool::new(true));

        let parent = runtime.spawn({
            let parent_payload = Arc::clone(&parent_payload);
            move |ctx| async move {
                let child = ctx.spawn(|_ctx| async {
                    panic!("the child task fails on purpose");
                });

                parent_payload.store(ctx.wait_for_task(child).await, Ordering::SeqCst);
            }
        });

        runtime.join_all([parent]);
        assert!(!parent_payload.load(Ordering::SeqCst));

        // The scheduler survived the panic: fresh work still completes.
        let after = Arc::new(AtomicBool::new(false));
        let survivor = runtime.spawn({
            let after = Arc::clone(&after);
            move |_ctx| async move {
                after.store(true, Ordering::SeqCst);
            }
        });

        runtime.join_all([survivor]);
        assert!(after.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_is_idempotent_and_spawning_after_it_is_harmless() {
        let mut runtime = Runtime::new().expect("starting the runtime");

        runtime.shutdown();
        runtime.shutdown();

        // The task never runs, but the id is real and joining it must not
        // hang now that the runtime is gone.
        let id = runtime.spawn(|_ctx| async {
            unreachable!("tasks spawned after shutdown are discarded");
        });

        runtime.join_all([id]);
    }

    #[test]
    fn shutdown_runs_cleanup_of_parked_tasks() {
        // A task parked on a long timer holds a drop guard. Shutting the
        // runtime down must drop the task and run the guard, even though the
        // task itself never resumes.

        let mut runtime = Runtime::new().expect("starting the runtime");
        let cleanup_ran = Arc::new(AtomicBool::new(false));
        let parked = Arc::new(AtomicBool::new(false));

        runtime.spawn({
            let cleanup_ran = Arc::clone(&cleanup_ran);
            let parked = Arc::clone(&parked);
            move |ctx| async move {
                let _guard = SetOnDrop(cleanup_ran);
                parked.store(true, Ordering::SeqCst);
                ctx.wait_for_time(Duration::from_secs(600)).await;
            }
        });

        // Make sure the task reached its suspension point before tearing
        // down, otherwise the test would pass vacuously.
        while !parked.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        runtime.shutdown();

        assert!(cleanup_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn independent_runtimes_coexist() {
        // The scheduler is an explicit context, not process-global state: two
        // runtimes run side by side without interfering.

        let first = Runtime::new().expect("starting the first runtime");
        let second = Runtime::new().expect("starting the second runtime");

        let first_done = Arc::new(AtomicBool::new(false));
        let second_done = Arc::new(AtomicBool::new(false));

        let first_id = first.spawn({
            let first_done = Arc::clone(&first_done);
            move |ctx| async move {
                ctx.wait_for_time(Duration::from_millis(20)).await;
                first_done.store(true, Ordering::SeqCst);
            }
        });
        let second_id = second.spawn({
            let second_done = Arc::clone(&second_done);
            move |ctx| async move {
                ctx.wait_for_time(Duration::from_millis(20)).await;
                second_done.store(true, Ordering::SeqCst);
            }
        });

        first.join_all([first_id]);
        second.join_all([second_id]);

        assert!(first_done.load(Ordering::SeqCst));
        assert!(second_done.load(Ordering::SeqCst));
    }

    #[test]
    fn randomized_mix_of_operations_stays_consistent() {
        // A seeded chaos mix of sleeps, yields, child spawns, joins and
        // kills. The debug-build consistency check at every dispatch loop
        // boundary is the sharp assertion here; the counters at the end prove
        // that no task was lost or double-run.

        let runtime = Runtime::new().expect("starting the runtime");
        let mut rng = fastrand::Rng::with_seed(0x5EED_CAFE);

        let chaos_completed = Arc::new(AtomicUsize::new(0));
        let children_completed = Arc::new(AtomicUsize::new(0));

        let victims: Vec<TaskId> = (0..32)
            .map(|_| {
                runtime.spawn(|ctx| async move {
                    ctx.wait_for_time(Duration::from_millis(40)).await;
                })
            })
            .collect();
        let victims = Arc::new(victims);

        let mut expected_children = 0;
        let mut chaos: Vec<TaskId> = Vec::new();

        for index in 0..160 {
            let op = rng.u32(0..4);
            let sleep_ms = u64::from(rng.u32(0..30));

            if op == 2 {
                expected_children += 1;
            }

            let chaos_completed = Arc::clone(&chaos_completed);
            let children_completed = Arc::clone(&children_completed);
            let victims = Arc::clone(&victims);

            chaos.push(runtime.spawn(move |ctx| async move {
                match op {
                    0 => ctx.wait_for_time(Duration::from_millis(sleep_ms)).await,
                    1 => {
                        for _ in 0..4 {
                            ctx.yield_now().await;
                        }
                    }
                    2 => {
                        let child = ctx.spawn({
                            let children_completed = Arc::clone(&children_completed);
                            move |ctx| async move {
                                ctx.yield_now().await;
                                children_completed.fetch_add(1, Ordering::SeqCst);
                            }
                        });
                        assert!(ctx.wait_for_task(child).await);
                    }
                    _ => {
                        // Whether this reports success depends on who got to
                        // the victim first, which is exactly the chaos we are
                        // after.
                        _ = ctx.kill_task(victims[index % victims.len()]).await;
                    }
                }

                chaos_completed.fetch_add(1, Ordering::SeqCst);
            }));
        }

        runtime.join_all(chaos.iter().copied().chain(victims.iter().copied()));

        assert_eq!(chaos_completed.load(Ordering::SeqCst), 160);
        assert_eq!(children_completed.load(Ordering::SeqCst), expected_children);
    }
}
