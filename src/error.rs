use core::result;
use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// A helper type for wrapping a [result::Result] such that we can reduce noise in our signatures.
pub type Result<T> = result::Result<T, Error>;

/// An error representing a failure configuring or driving the reactor, or related errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("encountered unexpected IO error: {0}")]
    IO(
        #[from]
        #[source]
        io::Error,
    ),
    #[error("system call failed: {0}")]
    Sys(
        #[from]
        #[source]
        Errno,
    ),
    #[error("an event loop already exists on thread {0}")]
    LoopExists(i32),
    #[error("invalid socket address: {0}")]
    Addr(String),
}
