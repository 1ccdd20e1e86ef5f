use crossbeam_queue::SegQueue;
use log::warn;

use vc_evloop::Wakeup;

use crate::worker::Worker;

/// A deferred closure, executed inside the event loop with the inbox's
/// owning worker as argument.
pub(crate) type Closure = Box<dyn FnOnce(&Worker) + Send + 'static>;

// -----------------------------------------------------------------------------
// Inbox

/// Thread-safe queue of deferred closures, pinned to one worker.
///
/// Enqueue-then-wake is atomic with respect to the drain: the closure is
/// pushed before the wakeup byte is written, so the drain that byte
/// triggers observes it. The wakeup watcher stays registered for the life
/// of the pool; whichever worker currently polls delivers the drain.
pub(crate) struct Inbox {
    queue: SegQueue<Closure>,
    wakeup: Wakeup,
}

impl Inbox {
    pub(crate) fn new(wakeup: Wakeup) -> Inbox {
        Inbox {
            queue: SegQueue::new(),
            wakeup,
        }
    }

    /// Enqueues `f` for the next drain on the owning worker.
    pub(crate) fn push(&self, f: Closure) {
        self.queue.push(f);
        if let Err(err) = self.wakeup.wake() {
            // The closure stays queued; the next successful wakeup or poll
            // pass on this slot delivers it.
            warn!("inbox wakeup failed: {err}");
        }
    }

    /// Pops one deferred closure.
    pub(crate) fn pop(&self) -> Option<Closure> {
        self.queue.pop()
    }
}
