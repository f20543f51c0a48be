//! Cooperative periodic tasks polled from the interactive loop.

use std::time::{Duration, Instant};

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Maintenance {
    ChangeDrain,
    Autosave,
}

struct Slot<K> {
    key: K,
    interval: Duration,
    next: Instant,
}

/// A handful of named fixed-interval deadlines. Nothing runs by itself; the
/// owner asks which tasks are [`due`](Self::due) and runs them.
pub struct MaintenanceClock<K = Maintenance> {
    slots: Vec<Slot<K>>,
}

impl<K: Copy + PartialEq + std::fmt::Debug> MaintenanceClock<K> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// (Re)arms `key` to first fire at `now + interval`.
    pub fn schedule(&mut self, key: K, interval: Duration, now: Instant) {
        self.cancel(key);
        self.slots.push(Slot {
            key,
            interval,
            next: now + interval,
        });
    }

    pub fn cancel(&mut self, key: K) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.key != key);
        before != self.slots.len()
    }

    pub fn is_scheduled(&self, key: K) -> bool {
        self.slots.iter().any(|slot| slot.key == key)
    }

    /// Tasks whose deadline passed, each at most once. Every returned task is
    /// rescheduled at `now + interval`, so a late poll does not cause bursts.
    pub fn due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        for slot in &mut self.slots {
            if slot.next <= now {
                slot.next = now + slot.interval;
                due.push(slot.key);
            }
        }
        if !due.is_empty() {
            trace!(?due, "maintenance due");
        }
        due
    }

    /// Time until the earliest deadline, or `None` with nothing scheduled.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.slots
            .iter()
            .map(|slot| slot.next.saturating_duration_since(now))
            .min()
    }
}

impl<K: Copy + PartialEq + std::fmt::Debug> Default for MaintenanceClock<K> {
    fn default() -> Self {
        Self::new()
    }
}
