use core::fmt;
use core::ops::{BitOr, BitOrAssign};

// -----------------------------------------------------------------------------
// Revents

/// Readiness bits, both as registration interest and as delivery payload.
///
/// [`Revents::READ`] and [`Revents::WRITE`] may be registered as interest;
/// [`Revents::ERROR`] and [`Revents::HUP`] are delivery-only and reported
/// whenever the OS surfaces them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Revents(u8);

impl Revents {
    /// Empty set.
    pub const NONE: Revents = Revents(0);
    /// The descriptor is readable.
    pub const READ: Revents = Revents(1);
    /// The descriptor is writable.
    pub const WRITE: Revents = Revents(1 << 1);
    /// An error condition on the descriptor.
    pub const ERROR: Revents = Revents(1 << 2);
    /// The peer closed its end.
    pub const HUP: Revents = Revents(1 << 3);

    /// Returns `true` if every bit of `other` is set in `self`.
    #[inline(always)]
    pub const fn contains(self, other: Revents) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if any bit of `other` is set in `self`.
    #[inline(always)]
    pub const fn intersects(self, other: Revents) -> bool {
        self.0 & other.0 != 0
    }

    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn is_readable(self) -> bool {
        self.intersects(Revents::READ)
    }

    #[inline(always)]
    pub const fn is_writable(self) -> bool {
        self.intersects(Revents::WRITE)
    }

    #[inline(always)]
    pub const fn is_error(self) -> bool {
        self.intersects(Revents::ERROR)
    }

    #[inline(always)]
    pub const fn is_hup(self) -> bool {
        self.intersects(Revents::HUP)
    }
}

impl BitOr for Revents {
    type Output = Revents;

    #[inline(always)]
    fn bitor(self, rhs: Revents) -> Revents {
        Revents(self.0 | rhs.0)
    }
}

impl BitOrAssign for Revents {
    #[inline(always)]
    fn bitor_assign(&mut self, rhs: Revents) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Revents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.is_readable() {
            set.entry(&"READ");
        }
        if self.is_writable() {
            set.entry(&"WRITE");
        }
        if self.is_error() {
            set.entry(&"ERROR");
        }
        if self.is_hup() {
            set.entry(&"HUP");
        }
        set.finish()
    }
}

// -----------------------------------------------------------------------------
// Tests
