// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// A specialized `Result` type for Weft Runtime operations that return a
/// Weft Runtime [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in the Weft Runtime.
///
/// This is an umbrella type for the failures the runtime surfaces to its
/// caller. User-task failures are never reported through this type - they are
/// contained by the dispatch loop and logged.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller of some API made a mistake (e.g. supplied invalid arguments
    /// or called an operation out of sequence).
    #[error("{0}")]
    Programming(String),

    /// We are re-packaging an error from the Rust standard library I/O logic
    /// without adding further details in the Weft Runtime layer.
    ///
    /// In practice this means the kernel readiness multiplexer could not be
    /// created or the dispatch thread could not be started.
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}
