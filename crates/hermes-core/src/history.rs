//! Bounded in-memory history of captured entries.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::entry::ProxyEntry;

/// Default number of entries kept.
pub const HISTORY_LIMIT: usize = 500;

#[derive(Debug, Default)]
struct Inner {
    /// Most recent first.
    entries: VecDeque<Arc<ProxyEntry>>,
    by_id: HashMap<String, Arc<ProxyEntry>>,
}

/// Insertion-ordered store of the most recent entries.
///
/// New entries go to the head; once the capacity is reached the oldest entry
/// is evicted from the tail and from the id index.
#[derive(Debug)]
pub struct EntryStore {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl Default for EntryStore {
    fn default() -> Self {
        Self::new(HISTORY_LIMIT)
    }
}

impl EntryStore {
    /// Creates a store holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds an entry at the head, evicting the oldest when full.
    pub fn add(&self, entry: Arc<ProxyEntry>) {
        let mut inner = self.inner.write();
        if let Some(previous) = inner.by_id.insert(entry.id.clone(), Arc::clone(&entry)) {
            inner.entries.retain(|e| !Arc::ptr_eq(e, &previous));
        }
        inner.entries.push_front(entry);
        while inner.entries.len() > self.capacity {
            if let Some(evicted) = inner.entries.pop_back() {
                inner.by_id.remove(&evicted.id);
            }
        }
    }

    /// Looks up an entry by id.
    pub fn get(&self, id: &str) -> Option<Arc<ProxyEntry>> {
        self.inner.read().by_id.get(id).cloned()
    }

    /// All entries, most recent first.
    pub fn list(&self) -> Vec<Arc<ProxyEntry>> {
        self.inner.read().entries.iter().cloned().collect()
    }

    /// All entries, oldest first.
    pub fn list_oldest_first(&self) -> Vec<Arc<ProxyEntry>> {
        self.inner.read().entries.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.by_id.clear();
    }
}
