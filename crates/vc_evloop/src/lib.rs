//! Event-notification layer for the task pool.
//!
//! Wraps the OS polling primitive behind two halves with different sharing
//! rules:
//!
//! - [`EventLoop`]: the pollable half. Unique and moveable, owned by exactly
//!   one thread at a time; whoever holds it drives one poll pass at a time
//!   via [`EventLoop::run_once`].
//! - [`Registrar`]: the registration half. Thread-safe and reference
//!   counted; descriptor watchers, timers and wakeup slots are registered
//!   here and stay valid no matter which thread currently holds the
//!   [`EventLoop`].

// -----------------------------------------------------------------------------
// Modules

mod event_loop;
mod revents;
mod timer;
mod wakeup;

// -----------------------------------------------------------------------------
// Top-Level Exports

pub use event_loop::{EventLoop, Fired, Registrar};
pub use revents::Revents;
pub use timer::TimerId;
pub use wakeup::Wakeup;

/// Identifies one registration on the loop. Re-exported from `mio`.
pub use mio::Token;
