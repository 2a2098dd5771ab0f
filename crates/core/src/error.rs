//! Error types for the shared-memory primitive family.

use thiserror::Error;

/// Result type alias used throughout this crate.
pub type ShmResult<T> = Result<T, ShmError>;

/// Errors surfaced by the mutex, vector, list, and counter-set layers.
///
/// The underlying C-style conventions (non-zero return, `-1` sentinels,
/// "out of range" indices) are preserved internally where useful for
/// scan code, but never cross this boundary as bare integers.
#[derive(Error, Debug)]
pub enum ShmError {
    /// `shm_open` failed, either on exclusive create or on the loser's
    /// non-exclusive open.
    #[error("failed to open shared memory segment {name:?}: {source}")]
    Open {
        name: String,
        #[source]
        source: nix::Error,
    },

    /// `ftruncate` failed while sizing a freshly created segment.
    #[error("failed to size shared memory segment {name:?} to {size} bytes: {source}")]
    Truncate {
        name: String,
        size: usize,
        #[source]
        source: nix::Error,
    },

    /// `mmap`/`munmap` failed.
    #[error("failed to map shared memory segment {name:?}: {source}")]
    Map {
        name: String,
        #[source]
        source: nix::Error,
    },

    /// `shm_unlink` failed during destruction.
    #[error("failed to unlink shared memory segment {name:?}: {source}")]
    Unlink {
        name: String,
        #[source]
        source: nix::Error,
    },

    /// The raw `futex(2)` syscall returned an error other than the benign
    /// `EAGAIN`/`EINTR` retry cases.
    #[error("futex syscall failed: {0}")]
    Futex(#[source] std::io::Error),

    /// `lock` observed the mutex in the `NotReady` (retired) state.
    #[error("mutex is retired and can no longer be locked")]
    MutexRetired,

    /// `unlock`/`destroy_if_locked` was called on a mutex that was not held.
    #[error("mutex is not currently held")]
    MutexNotHeld,

    /// A vector operation found no free slot below `capacity`.
    #[error("vector at capacity ({capacity}); no free slot for insertion")]
    CapacityExhausted { capacity: usize },

    /// `at`/`safe_at` addressed a slot that is out of range or inactive.
    #[error("no live element at index {0}")]
    NotFound(usize),

    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Passthrough for I/O failures that don't fit a more specific variant.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
