//! The poll driver and its thread-safe registration surface.
//!
//! The split mirrors the sharing rules of the pool above it: exactly one
//! thread drives the poll at a time ([`EventLoop`] is moved, never cloned),
//! while watcher registrations must outlive any particular holder
//! ([`Registrar`] is shared). A descriptor or timer registered through the
//! `Registrar` keeps firing with its token regardless of which thread
//! currently calls [`EventLoop::run_once`].

use core::fmt;
use core::time::Duration;
use std::io::{self, Read};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use log::{trace, warn};
use mio::unix::SourceFd;
use mio::unix::pipe;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::revents::Revents;
use crate::timer::{TimerId, TimerQueue};
use crate::wakeup::Wakeup;

// -----------------------------------------------------------------------------
// Config

/// Capacity of the readiness buffer handed to the OS per poll pass.
const EVENTS_CAPACITY: usize = 1024;

/// Token reserved for the loop's own nudge waker.
const WAKER: Token = Token(usize::MAX - 1);

/// Wakeup slot `i` is registered as `Token(WAKEUP_TOP - i)`, growing
/// downwards. Ordinary watcher tokens are allocated from the bottom of the
/// token space, so the two ranges cannot collide.
const WAKEUP_TOP: usize = usize::MAX - 2;

// -----------------------------------------------------------------------------
// Fired

/// One event surfaced by a poll pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fired {
    /// Readiness on a registered descriptor.
    Io { token: Token, revents: Revents },
    /// A due timer.
    Timer { token: Token },
    /// The wakeup pipe of the given slot carried at least one byte.
    Wakeup { slot: usize },
}

// -----------------------------------------------------------------------------
// Registrar

/// Thread-safe registration surface of an [`EventLoop`].
///
/// Watchers are registered here, not on the loop value, so they survive the
/// loop handle's moves between threads. Any thread may register, deregister,
/// arm timers or [`wake`] the current holder out of a blocking poll.
///
/// [`wake`]: Registrar::wake
pub struct Registrar {
    registry: Registry,
    waker: Waker,
    timers: Mutex<TimerQueue>,
    wakeup_rx: Box<[pipe::Receiver]>,
}

impl Registrar {
    /// Registers `fd` for `interest`, reported as [`Fired::Io`] with `token`.
    ///
    /// `interest` must contain [`Revents::READ`] or [`Revents::WRITE`].
    /// The descriptor must stay open until deregistered.
    pub fn register_io(&self, fd: RawFd, token: Token, interest: Revents) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), token, interest_of(interest)?)
    }

    /// Updates the interest of an already registered descriptor.
    pub fn reregister_io(&self, fd: RawFd, token: Token, interest: Revents) -> io::Result<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), token, interest_of(interest)?)
    }

    /// Removes `fd` from the poll set.
    pub fn deregister_io(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    /// Arms a timer due `after` from now, reported as [`Fired::Timer`] with
    /// `token`. If the new deadline precedes every armed one, the current
    /// holder is woken so its poll timeout shrinks accordingly.
    pub fn set_timer(&self, token: Token, after: Duration) -> TimerId {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let preempts = timers
            .next_deadline()
            .is_none_or(|at| Instant::now() + after < at);
        let id = timers.set(token, after);
        drop(timers);

        if preempts {
            if let Err(err) = self.waker.wake() {
                warn!("timer wake failed: {err}");
            }
        }
        id
    }

    /// Cancels an armed timer. Returns `false` for a stale id (already
    /// fired or cancelled).
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel(id)
    }

    /// Forces the current poll pass to return, possibly with nothing fired.
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Number of wakeup slots this loop was created with.
    #[inline]
    pub fn wakeup_slots(&self) -> usize {
        self.wakeup_rx.len()
    }

    /// Empties the wakeup pipe of `slot`. Returns `true` if any byte was
    /// pending.
    fn drain_wakeup(&self, slot: usize) -> bool {
        let mut rx = &self.wakeup_rx[slot];
        let mut buf = [0_u8; 64];
        let mut any = false;
        loop {
            match rx.read(&mut buf) {
                Ok(0) => return any,
                Ok(_) => any = true,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return any,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("wakeup drain failed on slot {slot}: {err}");
                    return any;
                }
            }
        }
    }
}

impl fmt::Debug for Registrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("wakeup_slots", &self.wakeup_rx.len())
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// EventLoop

/// The pollable half of the event machinery.
///
/// Unique and moveable: at any instant exactly one thread owns the value
/// and may drive a poll pass. All registration state lives in the shared
/// [`Registrar`], so moving the `EventLoop` to another thread transfers
/// nothing but the right to poll.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    registrar: Arc<Registrar>,
}

impl EventLoop {
    /// Creates a loop with `wakeup_slots` wakeup pipes, returning one
    /// [`Wakeup`] sender per slot, in slot order.
    pub fn new(wakeup_slots: usize) -> io::Result<(EventLoop, Vec<Wakeup>)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let mut wakeup_rx = Vec::with_capacity(wakeup_slots);
        let mut wakeup_tx = Vec::with_capacity(wakeup_slots);
        for slot in 0..wakeup_slots {
            let (tx, mut rx) = pipe::new()?;
            poll.registry()
                .register(&mut rx, Token(WAKEUP_TOP - slot), Interest::READABLE)?;
            wakeup_rx.push(rx);
            wakeup_tx.push(Wakeup::new(tx));
        }

        let registrar = Arc::new(Registrar {
            registry: poll.registry().try_clone()?,
            waker,
            timers: Mutex::new(TimerQueue::new()),
            wakeup_rx: wakeup_rx.into_boxed_slice(),
        });

        let event_loop = EventLoop {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            registrar,
        };
        Ok((event_loop, wakeup_tx))
    }

    /// The registration surface shared with this loop.
    #[inline]
    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    /// One poll pass: waits until a descriptor is ready, a timer is due or
    /// [`Registrar::wake`] is called, then appends everything surfaced to
    /// `fired`.
    ///
    /// A pass cut short by a wake or an OS signal may append nothing; the
    /// caller decides whether to poll again.
    pub fn run_once(&mut self, fired: &mut Vec<Fired>) -> io::Result<()> {
        let timeout = self
            .registrar
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()));
        trace!("poll pass, timeout {timeout:?}");

        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        let slots = self.registrar.wakeup_rx.len();
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER {
                // Nudge only; the caller rechecks its own flags.
                continue;
            }
            if let Some(slot) = wakeup_slot(token, slots) {
                if self.registrar.drain_wakeup(slot) {
                    fired.push(Fired::Wakeup { slot });
                }
                continue;
            }
            fired.push(Fired::Io {
                token,
                revents: revents_of(event),
            });
        }

        let now = Instant::now();
        let mut timers = self
            .registrar
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while let Some(token) = timers.pop_due(now) {
            fired.push(Fired::Timer { token });
        }
        Ok(())
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventLoop")
    }
}

// -----------------------------------------------------------------------------
// Conversions

#[inline]
fn wakeup_slot(token: Token, slots: usize) -> Option<usize> {
    let slot = WAKEUP_TOP.wrapping_sub(token.0);
    (slot < slots).then_some(slot)
}

fn interest_of(revents: Revents) -> io::Result<Interest> {
    match (revents.is_readable(), revents.is_writable()) {
        (true, true) => Ok(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Ok(Interest::READABLE),
        (false, true) => Ok(Interest::WRITABLE),
        (false, false) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "io interest must contain READ or WRITE",
        )),
    }
}

fn revents_of(event: &mio::event::Event) -> Revents {
    let mut revents = Revents::NONE;
    if event.is_readable() {
        revents |= Revents::READ;
    }
    if event.is_writable() {
        revents |= Revents::WRITE;
    }
    if event.is_error() {
        revents |= Revents::ERROR;
    }
    if event.is_read_closed() || event.is_write_closed() {
        revents |= Revents::HUP;
    }
    revents
}

// -----------------------------------------------------------------------------
// Tests
