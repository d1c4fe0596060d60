//! Deferred-work scheduler.
//!
//! A single time-ordered queue of tagged events. Events carry arena
//! keys, never references; a fired event whose key no longer resolves
//! is dropped by the consumer. Cancellation is idempotent, and every
//! entry point takes `now` explicitly so the queue is deterministic
//! under test.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Handle to one scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    index: u32,
    generation: u32,
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    token: Token,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.token.index.cmp(&other.token.index))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Slot<E> {
    generation: u32,
    pending: Option<(Instant, E)>,
}

/// Time-ordered queue of deferred events.
pub struct Scheduler<E> {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    slots: Vec<Slot<E>>,
    free: Vec<u32>,
    pending: usize,
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Scheduler {
            heap: BinaryHeap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            pending: 0,
        }
    }

    /// Schedule `event` to fire `delay` after `now`.
    pub fn schedule(&mut self, now: Instant, delay: Duration, event: E) -> Token {
        let deadline = now + delay;
        let token = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.pending = Some((deadline, event));
            Token {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                pending: Some((deadline, event)),
            });
            Token {
                index,
                generation: 0,
            }
        };
        self.heap.push(Reverse(HeapEntry { deadline, token }));
        self.pending += 1;
        token
    }

    /// Cancel a scheduled event. Cancelling an already-fired or
    /// already-cancelled token is a no-op.
    pub fn cancel(&mut self, token: Token) {
        if let Some(slot) = self.slots.get_mut(token.index as usize) {
            if slot.generation == token.generation && slot.pending.is_some() {
                slot.pending = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(token.index);
                self.pending -= 1;
            }
        }
        // Stale heap entries are discarded lazily in pop_due.
    }

    pub fn is_pending(&self, token: Token) -> bool {
        self.slots
            .get(token.index as usize)
            .map(|slot| slot.generation == token.generation && slot.pending.is_some())
            .unwrap_or(false)
    }

    /// Time until the event fires, `None` if not pending, zero if due.
    pub fn remaining(&self, now: Instant, token: Token) -> Option<Duration> {
        self.slots.get(token.index as usize).and_then(|slot| {
            if slot.generation != token.generation {
                return None;
            }
            slot.pending
                .as_ref()
                .map(|(deadline, _)| deadline.saturating_duration_since(now))
        })
    }

    /// Earliest pending deadline, for the event loop's poll timeout.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            let live = self
                .slots
                .get(entry.token.index as usize)
                .map(|slot| slot.generation == entry.token.generation && slot.pending.is_some())
                .unwrap_or(false);
            if live {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop the next due event, one at a time; each fired callback runs
    /// to completion before the caller asks for the next.
    pub fn pop_due(&mut self, now: Instant) -> Option<E> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                // Earliest live-or-stale entry is in the future; check
                // whether it is stale before giving up.
                let stale = !self
                    .slots
                    .get(entry.token.index as usize)
                    .map(|slot| slot.generation == entry.token.generation && slot.pending.is_some())
                    .unwrap_or(false);
                if stale {
                    self.heap.pop();
                    continue;
                }
                return None;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked entry exists");
            let slot = match self.slots.get_mut(entry.token.index as usize) {
                Some(s) => s,
                None => continue,
            };
            if slot.generation != entry.token.generation {
                continue;
            }
            if let Some((_, event)) = slot.pending.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(entry.token.index);
                self.pending -= 1;
                return Some(event);
            }
        }
        None
    }

    pub fn pending_count(&self) -> usize {
        self.pending
    }
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}
