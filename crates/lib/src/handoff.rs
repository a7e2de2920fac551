//! Handoff coordinator: at most one in-flight claim per conversation.
//!
//! A claim that arrives while another claim for the same key is still running is dropped,
//! not queued, so a stale retry is never honored late. Keys are independent: claims on
//! different conversations run concurrently.

use crate::address::ConversationId;
use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-key in-flight guard. Cheap to clone; clones share the in-flight set.
pub struct HandoffCoordinator<K = ConversationId> {
    in_flight: Arc<Mutex<HashSet<K>>>,
}

impl<K> Clone for HandoffCoordinator<K> {
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<K: Eq + Hash + Clone> Default for HandoffCoordinator<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> HandoffCoordinator<K> {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run `work` unless `key` is already in flight. Returns `None` without calling `work`
    /// when the key is busy. The key is released when `work` finishes, fails, panics or is
    /// cancelled.
    pub async fn guard<F, Fut, T>(&self, key: &K, work: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _slot = self.acquire(key)?;
        Some(work().await)
    }

    /// True while a claim for `key` is running.
    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.in_flight).contains(key)
    }

    fn acquire(&self, key: &K) -> Option<InFlight<K>> {
        if !lock(&self.in_flight).insert(key.clone()) {
            return None;
        }
        Some(InFlight {
            set: Arc::clone(&self.in_flight),
            key: key.clone(),
        })
    }
}

/// Held for the duration of one claim; removes the key on drop.
struct InFlight<K: Eq + Hash> {
    set: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K: Eq + Hash> Drop for InFlight<K> {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.key);
    }
}

// The set is only touched in short non-panicking sections; recover from poisoning.
fn lock<K>(m: &Mutex<HashSet<K>>) -> MutexGuard<'_, HashSet<K>> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
