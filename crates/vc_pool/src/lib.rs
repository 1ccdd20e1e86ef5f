//! Leader/followers task execution core.
//!
//! A [`Dispatcher`] owns a fixed set of worker threads that collectively
//! drive one [`vc_evloop::EventLoop`]. At any instant exactly one worker is
//! the *leader*, blocked in the loop's poll; the others are *followers*
//! sleeping on their condition variables. When the poll surfaces events,
//! the leader hands the loop to a free follower (promoting it to the next
//! leader) and only then runs the fired handlers, so handler execution
//! overlaps with continued polling.
//!
//! Applications provide event sources as [`IoTask`] / [`TimerTask`]
//! implementations and submit them through the dispatcher; handlers receive
//! the executing [`Worker`] and may register follow-up tasks or defer
//! closures into a worker's inbox with [`Worker::exec_async`].

// -----------------------------------------------------------------------------
// Modules

mod dispatcher;
mod error;
mod inbox;
mod task;
mod worker;

// -----------------------------------------------------------------------------
// Top-Level Exports

pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::SubmitError;
pub use task::{IoTask, TaskId, TimerTask};
pub use worker::Worker;

pub use vc_evloop::Revents;
