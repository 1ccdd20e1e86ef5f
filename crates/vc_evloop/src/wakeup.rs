use core::fmt;
use std::io::{self, Write};

use mio::unix::pipe;

// -----------------------------------------------------------------------------
// Wakeup

/// Cross-thread wakeup sender for one wakeup slot of an [`EventLoop`].
///
/// Writes a single byte into the slot's non-blocking pipe; the next poll
/// pass reports the slot via [`Fired::Wakeup`]. Wakeups coalesce: a full
/// pipe means one is already pending, which is just as good.
///
/// [`EventLoop`]: crate::EventLoop
/// [`Fired::Wakeup`]: crate::Fired::Wakeup
pub struct Wakeup {
    tx: pipe::Sender,
}

impl Wakeup {
    pub(crate) fn new(tx: pipe::Sender) -> Wakeup {
        Wakeup { tx }
    }

    /// Wakes the loop's current holder.
    pub fn wake(&self) -> io::Result<()> {
        loop {
            match (&self.tx).write(&[1]) {
                Ok(_) => return Ok(()),
                // A pending wakeup already fills the pipe.
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

impl fmt::Debug for Wakeup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Wakeup")
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::Wakeup;

    #[test]
    fn is_sync_send() {
        fn is_sync<T: Sync>() {}
        is_sync::<Wakeup>();

        fn is_send<T: Send>() {}
        is_send::<Wakeup>();
    }
}
