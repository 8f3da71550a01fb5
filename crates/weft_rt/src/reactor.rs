// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Interest, Token};
use tracing::{Level, event};

use crate::task::Task;

/// The token reserved for the cross-thread waker; everything else maps a
/// token directly to a file descriptor.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// The I/O readiness index: which task is waiting for which descriptor in
/// which direction, kept exactly in sync with the kernel multiplexer.
///
/// For every descriptor the registered event mask equals the union of
/// read-interest and write-interest currently held - one waiter per
/// direction, at most two per descriptor. Tasks parked here are owned by the
/// index until readiness (or failure, or a kill) releases them.
///
/// The runtime registers descriptors but never closes them; descriptors
/// belong to user code.
#[derive(Debug)]
pub(crate) struct Reactor {
    poll: mio::Poll,
    events: mio::Events,
    read_waiting: HashMap<RawFd, Task>,
    write_waiting: HashMap<RawFd, Task>,
}

/// A task released by the reactor together with the payload to deliver:
/// `true` for readiness, `false` for hangup or error.
#[derive(Debug)]
pub(crate) struct Wakeup {
    pub(crate) task: Task,
    pub(crate) readiness: bool,
}

/// How a single multiplexer event is to be acted upon. Failure is checked
/// first, then writability, then readability - an event that carries several
/// conditions resolves to the first match, and a still-relevant remainder
/// shows up again on the next poll (the multiplexer is level-triggered).
#[derive(Clone, Copy, Debug)]
enum EventKind {
    Failed,
    Writable,
    Readable,
}

impl Reactor {
    pub(crate) fn new(poll: mio::Poll) -> Self {
        Self {
            poll,
            events: mio::Events::with_capacity(EVENTS_CAPACITY),
            read_waiting: HashMap::new(),
            write_waiting: HashMap::new(),
        }
    }

    /// Parks a task until `fd` is readable.
    ///
    /// Returns the task to the caller if the kernel refused the registration;
    /// the caller is expected to wake it with a failure payload.
    ///
    /// # Panics
    ///
    /// Panics if another task is already waiting to read `fd` - the
    /// one-waiter-per-direction contract is on the caller.
    pub(crate) fn park_read(&mut self, fd: RawFd, task: Task) -> Result<(), Task> {
        assert!(
            !self.read_waiting.contains_key(&fd),
            "two tasks must not wait for reads on the same file descriptor"
        );

        let result = if self.write_waiting.contains_key(&fd) {
            self.poll.registry().reregister(
                &mut SourceFd(&fd),
                token_for(fd),
                Interest::READABLE | Interest::WRITABLE,
            )
        } else {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token_for(fd), Interest::READABLE)
        };

        match result {
            Ok(()) => {
                self.read_waiting.insert(fd, task);
                Ok(())
            }
            Err(error) => {
                event!(
                    Level::WARN,
                    message = "registering read interest failed",
                    fd = %fd,
                    error = %error
                );
                Err(task)
            }
        }
    }

    /// Parks a task until `fd` is writable. The mirror image of
    /// [`park_read`][Self::park_read].
    ///
    /// # Panics
    ///
    /// Panics if another task is already waiting to write `fd`.
    pub(crate) fn park_write(&mut self, fd: RawFd, task: Task) -> Result<(), Task> {
        assert!(
            !self.write_waiting.contains_key(&fd),
            "two tasks must not wait for writes on the same file descriptor"
        );

        let result = if self.read_waiting.contains_key(&fd) {
            self.poll.registry().reregister(
                &mut SourceFd(&fd),
                token_for(fd),
                Interest::READABLE | Interest::WRITABLE,
            )
        } else {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token_for(fd), Interest::WRITABLE)
        };

        match result {
            Ok(()) => {
                self.write_waiting.insert(fd, task);
                Ok(())
            }
            Err(error) => {
                event!(
                    Level::WARN,
                    message = "registering write interest failed",
                    fd = %fd,
                    error = %error
                );
                Err(task)
            }
        }
    }

    /// Extracts the read waiter for `fd` without waking it (the kill path),
    /// narrowing or dropping the kernel registration accordingly.
    pub(crate) fn cancel_read(&mut self, fd: RawFd) -> Option<Task> {
        let task = self.read_waiting.remove(&fd)?;
        self.narrow_after_read_release(fd);
        Some(task)
    }

    /// Extracts the write waiter for `fd` without waking it (the kill path).
    pub(crate) fn cancel_write(&mut self, fd: RawFd) -> Option<Task> {
        let task = self.write_waiting.remove(&fd)?;
        self.narrow_after_write_release(fd);
        Some(task)
    }

    /// Polls the multiplexer with the given timeout and releases every task
    /// whose descriptor became actionable.
    ///
    /// Hangup and error release the waiters of both directions with a failure
    /// payload and drop the registration entirely. Plain readiness releases
    /// the matching direction with a success payload and narrows the
    /// registration to whatever interest remains.
    pub(crate) fn poll_ready(&mut self, timeout: Option<Duration>) -> Vec<Wakeup> {
        if let Err(error) = self.poll.poll(&mut self.events, timeout) {
            if error.kind() != io::ErrorKind::Interrupted {
                event!(
                    Level::WARN,
                    message = "polling the multiplexer failed",
                    error = %error
                );
            }
            return Vec::new();
        }

        let actionable: Vec<(RawFd, EventKind)> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(|event| {
                let fd = fd_for(event.token());

                let kind = if event.is_error()
                    || (event.is_read_closed() && event.is_write_closed())
                {
                    EventKind::Failed
                } else if event.is_writable() {
                    EventKind::Writable
                } else {
                    EventKind::Readable
                };

                (fd, kind)
            })
            .collect();

        let mut wakeups = Vec::with_capacity(actionable.len());

        for (fd, kind) in actionable {
            match kind {
                EventKind::Failed => {
                    event!(Level::TRACE, message = "descriptor failed", fd = %fd);

                    if let Err(error) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                        event!(
                            Level::WARN,
                            message = "deregistering failed descriptor failed",
                            fd = %fd,
                            error = %error
                        );
                    }

                    if let Some(task) = self.read_waiting.remove(&fd) {
                        wakeups.push(Wakeup {
                            task,
                            readiness: false,
                        });
                    }

                    if let Some(task) = self.write_waiting.remove(&fd) {
                        wakeups.push(Wakeup {
                            task,
                            readiness: false,
                        });
                    }
                }
                EventKind::Writable => {
                    if let Some(task) = self.write_waiting.remove(&fd) {
                        self.narrow_after_write_release(fd);
                        wakeups.push(Wakeup {
                            task,
                            readiness: true,
                        });
                    }
                }
                EventKind::Readable => {
                    if let Some(task) = self.read_waiting.remove(&fd) {
                        self.narrow_after_read_release(fd);
                        wakeups.push(Wakeup {
                            task,
                            readiness: true,
                        });
                    }
                }
            }
        }

        wakeups
    }

    /// After the read waiter of `fd` left: keep a write-only registration if
    /// a write waiter remains, otherwise drop the registration.
    fn narrow_after_read_release(&mut self, fd: RawFd) {
        let result = if self.write_waiting.contains_key(&fd) {
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), token_for(fd), Interest::WRITABLE)
        } else {
            self.poll.registry().deregister(&mut SourceFd(&fd))
        };

        if let Err(error) = result {
            event!(
                Level::WARN,
                message = "narrowing registration after read release failed",
                fd = %fd,
                error = %error
            );
        }
    }

    fn narrow_after_write_release(&mut self, fd: RawFd) {
        let result = if self.read_waiting.contains_key(&fd) {
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), token_for(fd), Interest::READABLE)
        } else {
            self.poll.registry().deregister(&mut SourceFd(&fd))
        };

        if let Err(error) = result {
            event!(
                Level::WARN,
                message = "narrowing registration after write release failed",
                fd = %fd,
                error = %error
            );
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn read_waiting_ids(
        &self,
    ) -> impl Iterator<Item = (RawFd, crate::task::TaskId)> + '_ {
        self.read_waiting.iter().map(|(fd, task)| (*fd, task.id))
    }

    #[cfg(debug_assertions)]
    pub(crate) fn write_waiting_ids(
        &self,
    ) -> impl Iterator<Item = (RawFd, crate::task::TaskId)> + '_ {
        self.write_waiting.iter().map(|(fd, task)| (*fd, task.id))
    }
}

fn token_for(fd: RawFd) -> Token {
    Token(usize::try_from(fd).expect("file descriptors are non-negative"))
}

fn fd_for(token: Token) -> RawFd {
    RawFd::try_from(token.0).expect("tokens other than the waker token are built from descriptors")
}
