// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};

use futures::future::LocalBoxFuture;
use tracing::{Level, event};

use crate::TaskContext;
use crate::task::TaskId;

/// A future factory for a task scheduled from a different thread. The factory
/// itself must be `Send` to cross over to the dispatch thread, but the future
/// it builds never leaves that thread and may be single-threaded.
pub(crate) type RemoteFutureFactory =
    Box<dyn (FnOnce(TaskContext) -> LocalBoxFuture<'static, ()>) + Send + 'static>;

/// Commands delivered to the dispatch loop from other threads. The loop
/// drains its command channel at the top of every iteration, which keeps the
/// taskmap single-writer: only the dispatch thread ever touches it.
pub(crate) enum SchedulerCommand {
    /// Enqueues a new task. The id was allocated by the sender so that
    /// `spawn` could return it without waiting for the dispatch thread.
    Spawn {
        id: TaskId,
        name: Option<String>,
        future_factory: RemoteFutureFactory,
    },

    /// Requests the dispatch loop to exit at its next iteration boundary.
    /// Duplicates are harmless.
    Shutdown,
}

impl fmt::Debug for SchedulerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { id, name, .. } => f
                .debug_struct("Spawn")
                .field("id", id)
                .field("name", name)
                .finish_non_exhaustive(),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// The cross-thread handle to a dispatch loop: sends commands and interrupts
/// the loop's idle multiplexer wait so commands are picked up promptly.
///
/// # Thread safety
///
/// Thread-safe; clones share the same underlying channel and waker.
#[derive(Clone, Debug)]
pub(crate) struct SchedulerClient {
    command_tx: mpsc::Sender<SchedulerCommand>,
    waker: Arc<mio::Waker>,
    ids: Arc<AtomicU64>,

    /// Once shutdown has started we stop submitting new tasks - there is no
    /// longer any guarantee that anyone is listening for them.
    shutdown_started: Arc<AtomicBool>,
}

impl SchedulerClient {
    pub(crate) fn new(
        command_tx: mpsc::Sender<SchedulerCommand>,
        waker: Arc<mio::Waker>,
        ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            command_tx,
            waker,
            ids,
            shutdown_started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Submits a new task and returns its id.
    ///
    /// The id is valid even when the runtime is already shutting down; the
    /// task then simply never runs.
    pub(crate) fn spawn(
        &self,
        name: Option<String>,
        future_factory: RemoteFutureFactory,
    ) -> TaskId {
        let id = TaskId::allocate(&self.ids);

        if self.shutdown_started.load(Ordering::Relaxed) {
            event!(
                Level::TRACE,
                message = "task spawned during shutdown is discarded",
                id = %id
            );
            return id;
        }

        // A send failure means the dispatch loop is gone, which is
        // indistinguishable from spawning during shutdown.
        _ = self.command_tx.send(SchedulerCommand::Spawn {
            id,
            name,
            future_factory,
        });
        self.notify();

        id
    }

    /// Requests shutdown. Safe to call multiple times.
    pub(crate) fn stop(&self) {
        if self.shutdown_started.fetch_or(true, Ordering::Relaxed) {
            return;
        }

        _ = self.command_tx.send(SchedulerCommand::Shutdown);
        self.notify();
    }

    fn notify(&self) {
        if let Err(error) = self.waker.wake() {
            event!(
                Level::WARN,
                message = "waking the dispatch loop failed",
                error = %error
            );
        }
    }
}
