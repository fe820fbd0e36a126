//! Per-key cancelable timers.
//!
//! Each schedule replaces the previous timer for that key and bumps a
//! generation counter. An expiry only counts when its generation is still
//! the current one, so a timer that fired just as it was rescheduled or
//! cancelled is ignored.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry<K> {
    pub key: K,
    generation: u64,
}

#[derive(Debug)]
pub struct TimerRegistry<K> {
    timers: HashMap<K, (u64, AbortHandle)>,
    next_generation: u64,
    tx: mpsc::UnboundedSender<Expiry<K>>,
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Expiry<K>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            timers: HashMap::new(),
            next_generation: 0,
            tx,
        };
        (registry, rx)
    }

    /// Cancel any timer for `key` and start a new one.
    pub fn schedule(&mut self, key: K, after: Duration) {
        self.cancel(&key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let expiry = Expiry {
            key: key.clone(),
            generation,
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(expiry);
        });
        self.timers.insert(key, (generation, task.abort_handle()));
    }

    /// Returns whether a timer was pending. Cancelling twice is a no-op.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.timers.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    /// Accept an expiry from the receiver. Returns the key if it belongs to
    /// the live timer, which is then forgotten.
    pub fn fire(&mut self, expiry: Expiry<K>) -> Option<K> {
        match self.timers.get(&expiry.key) {
            Some((generation, _)) if *generation == expiry.generation => {
                self.timers.remove(&expiry.key);
                Some(expiry.key)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl<K> Drop for TimerRegistry<K> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
    }
}
