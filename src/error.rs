use std::io;

use thiserror::Error;

/// Why binding the calling thread to a core (or NUMA node) did not happen.
///
/// OS failures keep the raw error code so the value stays `Clone` and can be
/// handed to every caller of [`PinnedExecutor::affinity_outcome`](crate::PinnedExecutor::affinity_outcome).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AffinityError {
    /// This target has no thread affinity API we know how to call.
    #[error("thread affinity is not supported on this platform")]
    Unsupported,

    /// The core index cannot be represented in the platform's CPU mask.
    #[error("core {core} is out of range (platform maximum is {max})")]
    CoreOutOfRange { core: usize, max: usize },

    /// The OS rejected the CPU affinity request.
    #[error("failed to pin thread to core {core}: {}", os_error(.code))]
    Cpu { core: usize, code: i32 },

    /// The OS rejected the NUMA memory policy request.
    #[error("failed to prefer NUMA node {node}: {}", os_error(.code))]
    Numa { node: u32, code: i32 },
}

/// Submission refused because the target run loop has finished.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("run loop has finished and no longer accepts tasks")]
pub struct Closed;

/// Errors returned while setting up an executor.
#[derive(Error, Debug)]
pub enum Error {
    /// The OS refused to create the executor thread.
    #[error("failed to spawn executor thread: {0}")]
    Spawn(#[from] io::Error),
}

fn os_error(code: &i32) -> io::Error {
    io::Error::from_raw_os_error(*code)
}
