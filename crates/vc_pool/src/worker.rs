//! The worker state machine.
//!
//! Each worker cycles between two roles. As a *follower* it sleeps on its
//! condition variable, waiting for the loop handle to land in its handoff
//! slot. As the *leader* it drives one-shot poll passes; when a pass
//! surfaces events it first stops and queues them (the callback pass), then
//! promotes a free follower to take over polling, and only then runs the
//! queued handlers. If no follower is free the worker keeps the loop and
//! services events serially, which is the pool's back-pressure mode.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use log::{debug, error, trace, warn};

use vc_evloop::{EventLoop, Fired, Revents, Token};

use crate::dispatcher::PoolShared;
use crate::error::SubmitError;
use crate::inbox::Inbox;
use crate::task::{IoTask, TaskId, TimerTask};

// -----------------------------------------------------------------------------
// Config

/// Follower wait tick.
///
/// A liveness guard only: promotion and termination both signal the
/// condition variable; the tick merely bounds the window in which a flag
/// set without a signal goes unobserved.
const WAIT_TICK: Duration = Duration::from_millis(100);

// -----------------------------------------------------------------------------
// WorkerShared

/// Cross-thread state of one worker.
pub(crate) struct WorkerShared {
    pub(crate) id: usize,
    /// True iff this worker holds the event loop, or has it installed in
    /// its handoff slot mid-transfer. At most one worker is leader.
    leader: AtomicBool,
    terminate: AtomicBool,
    /// Handoff slot. The loop handle moves through here, guarded by the
    /// mutex the condition variable pairs with.
    slot: Mutex<Option<EventLoop>>,
    cond: Condvar,
    pub(crate) inbox: Inbox,
}

impl WorkerShared {
    pub(crate) fn new(id: usize, inbox: Inbox) -> WorkerShared {
        WorkerShared {
            id,
            leader: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            slot: Mutex::new(None),
            cond: Condvar::new(),
            inbox,
        }
    }

    /// Installs the loop handle and promotes this worker to leader.
    ///
    /// The handle must have left its previous holder already; the slot is
    /// empty for every worker that is free or mid-wait.
    pub(crate) fn install(&self, event_loop: EventLoop) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(slot.is_none());
        *slot = Some(event_loop);
        self.leader.store(true, Ordering::Release);
        self.cond.notify_one();
    }

    /// Flags the worker for termination and wakes it if it is waiting.
    pub(crate) fn request_terminate(&self) {
        let _slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        self.terminate.store(true, Ordering::Release);
        self.cond.notify_one();
    }

    #[inline]
    fn terminating(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }
}

// -----------------------------------------------------------------------------
// Worker

/// Handle to one pool worker.
///
/// Cheap to clone; this is what task handlers and inbox closures receive.
/// Through it they may register follow-up tasks, defer closures into the
/// worker's inbox, or inspect the worker's identity.
#[derive(Clone)]
pub struct Worker {
    pub(crate) shared: Arc<WorkerShared>,
    pub(crate) pool: Arc<PoolShared>,
}

impl Worker {
    pub(crate) fn new(shared: Arc<WorkerShared>, pool: Arc<PoolShared>) -> Worker {
        Worker { shared, pool }
    }

    /// This worker's id, dense in `0..worker_num`.
    #[inline]
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// True while this worker holds the event loop.
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.shared.leader.load(Ordering::Acquire)
    }

    /// Defers `f` into this worker's inbox.
    ///
    /// The closure runs inside the event loop on the next poll pass, with
    /// this worker as argument, exactly once. Any thread may call this.
    pub fn exec_async(&self, f: impl FnOnce(&Worker) + Send + 'static) {
        self.shared.inbox.push(Box::new(f));
    }

    /// Registers an I/O task and starts its watcher.
    pub fn add_io_task(&self, task: Arc<dyn IoTask>) -> Result<TaskId, SubmitError> {
        self.pool.add_io_task(task)
    }

    /// Registers a timer task and arms its initial deadline.
    pub fn add_timer_task(&self, task: Arc<dyn TimerTask>) -> Result<TaskId, SubmitError> {
        self.pool.add_timer_task(task)
    }

    /// Restarts the watcher of a registered task whose watcher is stopped,
    /// e.g. after a failed delivery that was not destructive. Idempotent
    /// for a task whose watcher is already started.
    pub fn start_watcher(&self, id: TaskId) -> Result<(), SubmitError> {
        self.pool.start_watcher(id)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// Fired event queues

/// Queued I/O delivery; the watcher was stopped when this was enqueued.
struct IoEvent {
    token: Token,
    task: Arc<dyn IoTask>,
    revents: Revents,
}

/// Queued timer delivery.
struct TimerEvent {
    token: Token,
    task: Arc<dyn TimerTask>,
}

// -----------------------------------------------------------------------------
// Worker main routine

/// Thread routine of one worker.
pub(crate) fn run(worker: Worker) {
    worker.pool.wait_ready();

    let shared = Arc::clone(&worker.shared);
    debug!("worker {}: started", shared.id);

    let mut fired: Vec<Fired> = Vec::new();
    let mut io_events: VecDeque<IoEvent> = VecDeque::new();
    let mut timer_events: VecDeque<TimerEvent> = VecDeque::new();

    while !shared.terminating() {
        // Follower: wait until the loop lands in the handoff slot.
        let Some(event_loop) = wait_for_loop(&shared) else {
            continue;
        };

        // Leader: drive poll passes until the loop is handed off or the
        // pool terminates.
        let mut held = Some(event_loop);
        while let Some(event_loop) = held.as_mut() {
            if shared.terminating() {
                break;
            }

            trace!("worker {}: running event loop", shared.id);
            fired.clear();
            if let Err(err) = event_loop.run_once(&mut fired) {
                error!("worker {}: poll failed, shutting pool down: {err}", shared.id);
                worker.pool.request_shutdown();
                break;
            }

            collect(&worker, &mut fired, &mut io_events, &mut timer_events);
            if io_events.is_empty() && timer_events.is_empty() {
                continue;
            }

            // Promote the next leader before running any handler, so
            // handler execution overlaps with its polling.
            if !shared.terminating() {
                let event_loop = held.take().expect("leader without loop");
                held = promote(&worker, event_loop);
            }
            drain(&worker, &mut io_events, &mut timer_events);
        }

        if let Some(event_loop) = held {
            // Terminating while holding the loop: stop and drop every live
            // registration, then release the poll.
            worker.pool.clear_tasks();
            shared.leader.store(false, Ordering::Release);
            drop(event_loop);
            break;
        }

        // Leadership moved on in the handoff; rejoin the free pool.
        if !shared.terminating() {
            worker.pool.add_free_worker(shared.id);
        }
    }

    debug!("worker {}: exit", shared.id);
}

/// Follower wait. Returns the loop handle once promoted, or `None` when
/// the worker should recheck its terminate flag.
fn wait_for_loop(shared: &WorkerShared) -> Option<EventLoop> {
    let mut slot = shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return slot.take();
    }

    debug!("worker {}: waiting", shared.id);
    while slot.is_none() && !shared.terminating() {
        let (guard, _timed_out) = shared
            .cond
            .wait_timeout(slot, WAIT_TICK)
            .unwrap_or_else(PoisonError::into_inner);
        slot = guard;
    }
    slot.take()
}

/// The callback pass: translates everything the poll surfaced into the
/// worker's event queues, stopping each watcher before it is queued so the
/// next poll pass cannot refire it, and running deferred inbox closures.
/// Handlers are never called here.
fn collect(
    worker: &Worker,
    fired: &mut Vec<Fired>,
    io_events: &mut VecDeque<IoEvent>,
    timer_events: &mut VecDeque<TimerEvent>,
) {
    for event in fired.drain(..) {
        match event {
            Fired::Wakeup { slot } => drain_inbox(worker, slot),
            Fired::Io { token, revents } => {
                let Some(task) = worker.pool.take_fired_io(token) else {
                    warn!("worker {}: stale io token {token:?}", worker.shared.id);
                    continue;
                };
                io_events.push_back(IoEvent {
                    token,
                    task,
                    revents,
                });
            }
            Fired::Timer { token } => {
                let Some(task) = worker.pool.take_fired_timer(token) else {
                    warn!("worker {}: stale timer token {token:?}", worker.shared.id);
                    continue;
                };
                timer_events.push_back(TimerEvent { token, task });
            }
        }
    }
}

/// Runs every deferred closure queued on `slot`'s inbox, passing the
/// inbox's owning worker. Executes on the current leader's thread.
fn drain_inbox(worker: &Worker, slot: usize) {
    let owner = Worker::new(
        worker.pool.worker_shared(slot),
        Arc::clone(&worker.pool),
    );
    while let Some(f) = owner.shared.inbox.pop() {
        f(&owner);
    }
}

/// Hands the loop to a free follower, if any.
///
/// Order matters: this worker's leader flag is cleared before the handle
/// is installed, and the follower's flag is set (under its slot mutex)
/// before it is signalled. Returns the handle back when every other worker
/// is busy; the caller then stays leader.
fn promote(worker: &Worker, event_loop: EventLoop) -> Option<EventLoop> {
    match worker.pool.get_free_worker() {
        Some(next) => {
            trace!(
                "worker {}: promoting worker {} to leader",
                worker.shared.id, next.id
            );
            worker.shared.leader.store(false, Ordering::Release);
            next.install(event_loop);
            None
        }
        None => Some(event_loop),
    }
}

/// The handler pass: drains both queues in FIFO order, I/O before timers.
fn drain(
    worker: &Worker,
    io_events: &mut VecDeque<IoEvent>,
    timer_events: &mut VecDeque<TimerEvent>,
) {
    while let Some(IoEvent {
        token,
        task,
        revents,
    }) = io_events.pop_front()
    {
        if task.handle_event(worker, revents) {
            worker.pool.arm_io(token);
        } else if task.delete_after_error() {
            worker.pool.remove_task(token);
        }
    }

    while let Some(TimerEvent { token, task }) = timer_events.pop_front() {
        if task.handle_event(worker) {
            let repeat = task.repeat();
            if repeat.is_zero() {
                // One-shot fired successfully; the pool's reference goes.
                worker.pool.remove_task(token);
            } else {
                worker.pool.arm_timer(token, repeat);
            }
        } else if task.delete_after_error() {
            worker.pool.remove_task(token);
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
