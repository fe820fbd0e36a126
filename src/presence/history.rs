use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Append-only history keeping the newest `cap` entries, oldest first.
///
/// Only the entries are serialized; the cap is configuration and is applied
/// again with `set_cap` after loading.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History<T> {
    entries: VecDeque<T>,
    #[serde(skip)]
    cap: usize,
}

impl<T> History<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap,
        }
    }

    pub fn push(&mut self, entry: T) {
        self.entries.push_back(entry);
        self.evict();
    }

    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap;
        self.evict();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}
