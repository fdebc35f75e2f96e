//! Bounded set of recently processed webhook update ids.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 1000;

/// Remembers update ids so a redelivered update is handled at most once.
///
/// Once more than `capacity` ids are stored, the oldest half is forgotten.
/// Nothing is persisted: a restart starts with an empty window.
pub struct UpdateDeduplicator {
    capacity: usize,
    inner: Mutex<Window>,
}

#[derive(Default)]
struct Window {
    seen: HashSet<i64>,
    order: VecDeque<i64>,
}

impl Window {
    fn insert(&mut self, update_id: i64, capacity: usize) {
        if !self.seen.insert(update_id) {
            return;
        }
        self.order.push_back(update_id);

        if self.seen.len() > capacity {
            let evict = (capacity / 2).max(1);
            for id in self.order.drain(..evict) {
                self.seen.remove(&id);
            }
            debug!("Dedup window full, evicted {} oldest update ids", evict);
        }
    }
}

impl UpdateDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Window::default()),
        }
    }

    pub fn is_duplicate(&self, update_id: i64) -> bool {
        self.lock().seen.contains(&update_id)
    }

    pub fn mark_processed(&self, update_id: i64) {
        let capacity = self.capacity;
        self.lock().insert(update_id, capacity);
    }

    /// Check and mark in one step. Returns `true` if the id was already seen.
    pub fn check_and_mark(&self, update_id: i64) -> bool {
        let capacity = self.capacity;
        let mut window = self.lock();
        if window.seen.contains(&update_id) {
            return true;
        }
        window.insert(update_id, capacity);
        false
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        // The window holds plain ids; a panic mid-update cannot leave it unusable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for UpdateDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
