use core::fmt;
use core::time::Duration;
use std::os::fd::RawFd;
use std::sync::Arc;

use vc_evloop::{Revents, TimerId, Token};

use crate::worker::Worker;

// -----------------------------------------------------------------------------
// IoTask

/// An event source watching a file descriptor.
///
/// The pool owns one reference per live registration. After every delivery
/// the watcher is stopped; `handle_event` returning `true` rearms it with
/// the parameters [`fd`] and [`interest`] report at that moment. Returning
/// `false` marks the handler as failed or done: the task is destroyed when
/// [`delete_after_error`] says so, otherwise it stays registered with its
/// watcher stopped until its owner restarts it via [`Worker::start_watcher`].
///
/// [`fd`]: IoTask::fd
/// [`interest`]: IoTask::interest
/// [`delete_after_error`]: IoTask::delete_after_error
pub trait IoTask: Send + Sync + 'static {
    /// Descriptor to watch. Must stay open while the watcher is started.
    fn fd(&self) -> RawFd;

    /// Readiness bits of interest ([`Revents::READ`] and/or
    /// [`Revents::WRITE`]).
    fn interest(&self) -> Revents;

    /// Handles one readiness delivery on `worker`'s thread.
    fn handle_event(&self, worker: &Worker, revents: Revents) -> bool;

    /// Whether the pool destroys this task after a failed `handle_event`
    /// (`true`), or leaves it unregistered for its external owner (`false`).
    #[inline]
    fn delete_after_error(&self) -> bool {
        false
    }
}

// -----------------------------------------------------------------------------
// TimerTask

/// An event source firing on a monotonic deadline.
///
/// Fires once after [`initial`], then every [`repeat`] while `handle_event`
/// keeps returning `true`. A zero `repeat` makes the task one-shot: it is
/// destroyed after its first successful fire. Failure handling matches
/// [`IoTask`].
///
/// [`initial`]: TimerTask::initial
/// [`repeat`]: TimerTask::repeat
pub trait TimerTask: Send + Sync + 'static {
    /// Delay before the first fire.
    fn initial(&self) -> Duration;

    /// Rearm interval; [`Duration::ZERO`] for one-shot.
    fn repeat(&self) -> Duration;

    /// Handles one fire on `worker`'s thread.
    fn handle_event(&self, worker: &Worker) -> bool;

    /// See [`IoTask::delete_after_error`].
    #[inline]
    fn delete_after_error(&self) -> bool {
        false
    }
}

// -----------------------------------------------------------------------------
// TaskId

/// Stable id of a live registration.
///
/// Doubles as the token the event loop reports for the task's watcher.
/// Invalidated when the task is destroyed; operations on a stale id fail
/// with [`Stale`](crate::SubmitError::Stale).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) Token);

impl TaskId {
    /// Slot index inside the registration arena.
    #[inline]
    pub const fn index(self) -> usize {
        self.0.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskId").field(&self.0.0).finish()
    }
}

// -----------------------------------------------------------------------------
// Registration

/// Arena entry for one submitted task: the pool's strong reference plus the
/// watcher state that survives between deliveries.
pub(crate) enum Registration {
    Io {
        task: Arc<dyn IoTask>,
        /// True while the descriptor is registered with the loop.
        active: bool,
    },
    Timer {
        task: Arc<dyn TimerTask>,
        /// The armed deadline, if any.
        armed: Option<TimerId>,
    },
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::{IoTask, TaskId, TimerTask};
    use vc_evloop::Token;

    #[test]
    fn traits_are_object_safe() {
        fn assert_obj(_io: &dyn IoTask, _timer: &dyn TimerTask) {}
        let _ = assert_obj;
    }

    #[test]
    fn task_id_index() {
        assert_eq!(TaskId(Token(11)).index(), 11);
    }
}
