// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{Level, event};

use crate::dispatch::{SchedulerClient, SchedulerCore};
use crate::reactor::{Reactor, WAKER_TOKEN};
use crate::{Result, Runtime};

/// The default upper bound on how long the I/O driver blocks the multiplexer
/// when there is nothing else to do. It caps how stale timer dispatch can be
/// while no I/O is active.
const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(100);

/// Collects configuration to build and start an instance of the Weft Runtime.
#[derive(Debug)]
pub struct RuntimeBuilder {
    idle_poll: Duration,
}

impl RuntimeBuilder {
    /// Starts with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }

    /// Sets the upper bound on the multiplexer's idle block.
    ///
    /// Lowering it tightens worst-case timer latency on an otherwise idle
    /// runtime at the cost of more wakeups; raising it does the opposite.
    /// The effective block is always the smaller of this bound and the time
    /// until the next timer expires, and external spawn or shutdown requests
    /// interrupt it immediately.
    #[must_use]
    pub fn idle_poll(mut self, bound: Duration) -> Self {
        self.idle_poll = bound;
        self
    }

    /// Creates the multiplexer, starts the dispatch thread and returns the
    /// running runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel multiplexer or the dispatch thread
    /// could not be created.
    pub fn build(self) -> Result<Runtime> {
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);

        let (command_tx, command_rx) = mpsc::channel();
        let ids = Arc::new(AtomicU64::new(1));

        let client = SchedulerClient::new(command_tx, waker, Arc::clone(&ids));

        let idle_poll = self.idle_poll;
        let thread = thread::Builder::new()
            .name("weft-dispatch".to_string())
            .spawn(move || {
                SchedulerCore::new(Reactor::new(poll), command_rx, ids, idle_poll).run();
            })?;

        event!(Level::DEBUG, "runtime started");

        Ok(Runtime::new_started(client, thread))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
