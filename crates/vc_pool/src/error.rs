use std::io;

use thiserror::Error;

// -----------------------------------------------------------------------------
// SubmitError

/// Errors surfaced when handing work to the pool.
///
/// Handler failures never reach this type; a task decides its own fate
/// through its `handle_event` return value and `delete_after_error` policy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SubmitError {
    #[error("pool is shutting down, submission rejected")]
    Terminated,

    #[error("task id is stale: the task already fired its last event or was destroyed")]
    Stale,

    #[error("watcher registration failed: {0}")]
    Io(#[from] io::Error),
}
