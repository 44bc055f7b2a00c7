//! Delayed calls.
//!
//! A binary heap keyed by `(due_at, id)` plus an id map. Ids are strictly
//! increasing, ties on the due time fire in id order and cancellation is
//! O(log n) amortised through lazy heap deletion. An executing call is
//! removed from the due-index while it runs and is re-inserted at
//! `max(now, due + interval)` iff it returns true, so a call that overruns
//! its period fires next at `now` instead of building a backlog.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Identifier of a delayed call; never reused within a worker
pub type DelayedCallId = u64;

/// Why the callback is being invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Execute,
    Cancel,
}

/// The callback: returns true to stay scheduled
pub type DelayedFn = Box<dyn FnMut(Action) -> bool>;

/// A call popped out of the wheel for execution. Reinsert with
/// `Wheel::reinsert` if the callback asked to stay scheduled.
pub struct DueCall {
    pub id: DelayedCallId,
    pub due: Instant,
    pub interval: Duration,
    pub f: DelayedFn,
}

struct Slot {
    due: Instant,
    interval: Duration,
    f: DelayedFn,
}

#[derive(Default)]
pub struct Wheel {
    heap: BinaryHeap<Reverse<(Instant, DelayedCallId)>>,
    slots: HashMap<DelayedCallId, Slot>,
    next_id: DelayedCallId,
}

impl Wheel {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Schedule `f` to fire `delay` from `now`, repeating every `delay`
    /// while it returns true
    pub fn insert(&mut self, now: Instant, delay: Duration, f: DelayedFn) -> DelayedCallId {
        self.next_id += 1;
        let id = self.next_id;
        let due = now + delay;
        self.slots.insert(
            id,
            Slot {
                due,
                interval: delay,
                f,
            },
        );
        self.heap.push(Reverse((due, id)));
        id
    }

    /// Remove a call. The callback is handed back so the caller can invoke
    /// it with `Action::Cancel` outside any wheel borrow.
    pub fn cancel(&mut self, id: DelayedCallId) -> Option<DelayedFn> {
        // The heap entry is left behind and skipped lazily
        self.slots.remove(&id).map(|slot| slot.f)
    }

    /// Earliest due time of any live call
    pub fn next_due(&mut self) -> Option<Instant> {
        loop {
            let Reverse((due, id)) = *self.heap.peek()?;
            match self.slots.get(&id) {
                // A reschedule leaves a stale heap entry with the old time
                Some(slot) if slot.due == due => return Some(due),
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// Pop the next call that is due at `now`, in (due, id) order. The call
    /// is removed from the wheel while it executes.
    pub fn pop_due(&mut self, now: Instant) -> Option<DueCall> {
        // next_due() discards stale heap entries, so the top is live
        let due = self.next_due()?;
        if due > now {
            return None;
        }
        let Reverse((due, id)) = self.heap.pop()?;
        let slot = self.slots.remove(&id)?;
        Some(DueCall {
            id,
            due,
            interval: slot.interval,
            f: slot.f,
        })
    }

    /// Put an executed call back; next fire at `max(now, due + interval)`
    pub fn reinsert(&mut self, call: DueCall, now: Instant) {
        let due = std::cmp::max(now, call.due + call.interval);
        self.slots.insert(
            call.id,
            Slot {
                due,
                interval: call.interval,
                f: call.f,
            },
        );
        self.heap.push(Reverse((due, call.id)));
    }
}
