//! Deadline-ordered waitable set shared by every time-driven component.
//!
//! A [`DeadlineScheduler`] holds at most one deadline per key. Its single
//! consumer calls [`DeadlineScheduler::next_due`], which sleeps exactly until
//! the earliest deadline and then hands back every entry that has come due.
//! Any other task may schedule or cancel keys concurrently; an insertion that
//! moves the earliest deadline forward wakes the sleeping consumer.
//!
//! Entries are in-memory only. A cancel that races with a firing cannot be
//! retracted, so consumers re-validate their own state for every fired key.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

struct Entries<K> {
    queue: BTreeMap<(Instant, u64), K>,
    index: HashMap<K, (Instant, u64)>,
    next_ticket: u64,
}

impl<K: Clone + Eq + Hash> Entries<K> {
    fn insert(&mut self, key: K, deadline: Instant) -> bool {
        if let Some(slot) = self.index.remove(&key) {
            self.queue.remove(&slot);
        }

        let slot = (deadline, self.next_ticket);
        self.next_ticket += 1;
        let is_earliest = self
            .queue
            .keys()
            .next()
            .map_or(true, |(earliest, _)| deadline < *earliest);

        self.queue.insert(slot, key.clone());
        self.index.insert(key, slot);
        is_earliest
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(slot) => {
                self.queue.remove(&slot);
                true
            }
            None => false,
        }
    }

    fn earliest(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    fn drain_due(&mut self, now: Instant) -> Vec<(K, Instant)> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            let (deadline, _) = *entry.key();
            if deadline > now {
                break;
            }
            let key = entry.remove();
            self.index.remove(&key);
            due.push((key, deadline));
        }
        due
    }
}

pub struct DeadlineScheduler<K> {
    entries: Mutex<Entries<K>>,
    wake: Notify,
}

impl<K: Clone + Eq + Hash> Default for DeadlineScheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> DeadlineScheduler<K> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                queue: BTreeMap::new(),
                index: HashMap::new(),
                next_ticket: 0,
            }),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries<K>> {
        // Entries are left consistent by every critical section, so a panic
        // elsewhere never invalidates them.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets (or replaces) the deadline of `key`.
    pub fn schedule(&self, key: K, deadline: Instant) {
        let is_earliest = self.lock().insert(key, deadline);
        if is_earliest {
            self.wake.notify_one();
        }
    }

    /// Returns false when `key` had no pending deadline.
    pub fn cancel(&self, key: &K) -> bool {
        self.lock().remove(key)
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.lock().index.get(key).map(|(deadline, _)| *deadline)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.queue.clear();
        entries.index.clear();
    }

    /// Waits for the earliest deadline and removes every entry due by then,
    /// ordered by deadline and, within one deadline, by insertion.
    ///
    /// Intended for a single consumer per scheduler.
    pub async fn next_due(&self) -> Vec<(K, Instant)> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let earliest = {
                let mut entries = self.lock();
                let due = entries.drain_due(Instant::now());
                if !due.is_empty() {
                    return due;
                }
                entries.earliest()
            };

            match earliest {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}
