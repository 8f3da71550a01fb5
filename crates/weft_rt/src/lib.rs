// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Weft is a single-threaded cooperative task runtime for workloads made of
//! very many (tens of thousands of) concurrent I/O-bound tasks - the kind of
//! fan-out where one OS thread per unit of work stops scaling long before the
//! work itself does.
//!
//! Tasks are plain futures. They suspend only at the five points the runtime
//! understands - waiting for a descriptor to become readable or writable,
//! waiting out a delay, waiting for another task to terminate, or terminating
//! another task - and every suspension constructor lives on the
//! [`TaskContext`] each task body receives. Between suspension points a task
//! runs uninterrupted: the dispatch thread resumes one task at a time, and
//! an epoll-backed readiness reactor wakes tasks when their descriptors
//! become actionable.
//!
//! The [`Runtime`] façade is thread-safe: spawning, joining and shutdown may
//! be driven from any other thread. The readiness machinery is built on Unix
//! descriptor semantics.

// Public API surface.
mod builder;
mod context;
mod error;
mod runtime;
mod suspension;
mod task;

pub use builder::*;
pub use context::TaskContext;
pub use error::*;
pub use runtime::*;
pub use suspension::{KillTask, WaitForRead, WaitForTask, WaitForTime, WaitForWrite, YieldNow};
pub use task::TaskId;

// Internal to the crate.
mod dispatch;
mod reactor;
mod timers;
