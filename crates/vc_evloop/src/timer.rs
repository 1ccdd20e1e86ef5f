use core::cmp::{Ordering, Reverse};
use core::time::Duration;
use std::collections::BinaryHeap;
use std::time::Instant;

use mio::Token;
use slab::Slab;

// -----------------------------------------------------------------------------
// TimerId

/// Handle to an armed timer.
///
/// Invalidated when the timer fires or is cancelled; a stale id is a no-op
/// to cancel. Ids are generation-tagged, so a slot reused for a later timer
/// never aliases an old handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    key: usize,
    generation: u64,
}

// -----------------------------------------------------------------------------
// TimerQueue

struct TimerSlot {
    generation: u64,
    token: Token,
}

/// Heap entry. Cancellation leaves entries behind; they are skipped on pop
/// when their generation no longer matches the slot.
#[derive(PartialEq, Eq)]
struct Deadline {
    at: Instant,
    key: usize,
    generation: u64,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Deadline) -> Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for Deadline {
    #[inline]
    fn partial_cmp(&self, other: &Deadline) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Monotonic timer set: earliest-deadline heap over generation-tagged slots.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<Deadline>>,
    slots: Slab<TimerSlot>,
    generation: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue {
            heap: BinaryHeap::new(),
            slots: Slab::new(),
            generation: 0,
        }
    }

    /// Arms a timer due `after` from now, reported with `token`.
    pub(crate) fn set(&mut self, token: Token, after: Duration) -> TimerId {
        self.generation += 1;
        let generation = self.generation;
        let key = self.slots.insert(TimerSlot { generation, token });
        self.heap.push(Reverse(Deadline {
            at: Instant::now() + after,
            key,
            generation,
        }));
        TimerId { key, generation }
    }

    /// Cancels an armed timer. Returns `false` for a stale id.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.slots.get(id.key) {
            Some(slot) if slot.generation == id.generation => {
                self.slots.remove(id.key);
                true
            }
            _ => false,
        }
    }

    /// Earliest live deadline, dropping stale heap entries on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(deadline)) = self.heap.peek() {
            if self.is_live(deadline) {
                return Some(deadline.at);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops one timer due at `now`, consuming its slot.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Token> {
        while let Some(Reverse(deadline)) = self.heap.peek() {
            if !self.is_live(deadline) {
                self.heap.pop();
                continue;
            }
            if deadline.at > now {
                return None;
            }
            let Reverse(deadline) = self.heap.pop().expect("peeked entry vanished");
            let slot = self.slots.remove(deadline.key);
            return Some(slot.token);
        }
        None
    }

    #[inline]
    fn is_live(&self, deadline: &Deadline) -> bool {
        self.slots
            .get(deadline.key)
            .is_some_and(|slot| slot.generation == deadline.generation)
    }
}

// -----------------------------------------------------------------------------
// Tests
