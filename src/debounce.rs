//! Per-key debouncing with leading and trailing edges.
//!
//! The debouncer doesn't own a timer. Every operation takes the current
//! [`Instant`], and whoever owns it is responsible for calling
//! [`Debouncer::advance`] once [`Debouncer::next_deadline`] has passed. This
//! keeps it deterministic under a [`ManualClock`](crate::ManualClock).

use std::borrow::Borrow;
use std::collections::hash_map::{Entry, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Which edges of a burst fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceOptions {
    /// Fire the first call of a quiet period immediately
    pub leading: bool,
    /// Fire the latest value once the window has been quiet for `wait`
    pub trailing: bool,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            leading: true,
            trailing: true,
        }
    }
}

#[derive(Debug)]
struct Slot<Value> {
    // Value waiting for the trailing edge, if anything arrived after the
    // leading fire
    last_value: Option<Value>,
    deadline: Instant,
}

#[derive(Debug)]
pub struct Debouncer<Key, Value> {
    wait: Duration,
    options: DebounceOptions,
    slots: HashMap<Key, Slot<Value>>,
}

impl<Key: Eq + Hash + Clone, Value> Debouncer<Key, Value> {
    pub fn new(wait: Duration, options: DebounceOptions) -> Self {
        Self {
            wait,
            options,
            slots: HashMap::new(),
        }
    }

    /// Record a call. Returns the value if it should fire right now (the
    /// leading edge); otherwise it's held for the trailing edge and the
    /// window for this key restarts.
    ///
    /// A window that has expired but was never advanced counts as over; its
    /// held value is superseded by this call.
    pub fn call(&mut self, key: Key, value: Value, now: Instant) -> Option<Value> {
        let deadline = now + self.wait;

        match self.slots.entry(key) {
            Entry::Occupied(mut entry) if entry.get().deadline > now => {
                let slot = entry.get_mut();
                slot.last_value = Some(value);
                slot.deadline = deadline;
                None
            }
            entry => {
                let (fire, held) = if self.options.leading {
                    (Some(value), None)
                } else {
                    (None, Some(value))
                };

                let slot = Slot {
                    last_value: held,
                    deadline,
                };

                match entry {
                    Entry::Occupied(mut entry) => {
                        entry.insert(slot);
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(slot);
                    }
                }

                fire
            }
        }
    }

    /// Close every window whose deadline is at or before `now`, returning the
    /// trailing values that fire.
    pub fn advance(&mut self, now: Instant) -> Vec<(Key, Value)> {
        let expired: Vec<Key> = self
            .slots
            .iter()
            .filter(|(_key, slot)| slot.deadline <= now)
            .map(|(key, _slot)| key.clone())
            .collect();

        let trailing = self.options.trailing;

        expired
            .into_iter()
            .filter_map(|key| {
                let slot = self.slots.remove(&key)?;
                match slot.last_value {
                    Some(value) if trailing => Some((key, value)),
                    _ => None,
                }
            })
            .collect()
    }

    /// The earliest moment at which `advance` has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.values().map(|slot| slot.deadline).min()
    }

    /// Whether `key` is inside a debounce window.
    pub fn is_pending<Q>(&self, key: &Q) -> bool
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.slots.contains_key(key)
    }

    /// End the window for `key` now, returning the held value if there is
    /// one.
    pub fn flush<Q>(&mut self, key: &Q) -> Option<Value>
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.slots.remove(key)?.last_value
    }

    /// End the window for `key` without firing anything.
    pub fn cancel<Q>(&mut self, key: &Q)
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.slots.remove(key);
    }
}
