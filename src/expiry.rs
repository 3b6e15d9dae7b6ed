//! Bounded map with per-entry expiry.
//!
//! Thread-safe, in-memory, with lazy TTL-based removal and
//! soonest-to-expire eviction when full. Backs the bus duplicate-detection
//! window and the registry's grace window for late redeliveries.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    deadline: Instant,
    value: V,
}

/// Map whose entries vanish after a per-entry TTL.
///
/// Cleanup strategies:
/// - Lazy removal on `get()` when the entry has expired
/// - Opportunistic sweep before eviction
/// - Soonest-to-expire eviction when `max_entries` is reached
pub struct ExpiringMap<K, V> {
    data: Mutex<HashMap<K, Entry<V>>>,
    max_entries: usize,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize) -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Look up a live entry. Expired entries are removed on access.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut data = self.data.lock();
        let now = Instant::now();

        match data.get(key) {
            Some(entry) if now >= entry.deadline => {
                data.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert an entry that lives for `ttl` from now.
    pub fn insert(&self, key: K, ttl: Duration, value: V) {
        let mut data = self.data.lock();
        let now = Instant::now();

        if data.len() >= self.max_entries {
            data.retain(|_, entry| entry.deadline > now);
        }

        // Still over capacity after the sweep: evict the soonest-to-expire entry.
        if data.len() >= self.max_entries {
            if let Some(evict) = data
                .iter()
                .min_by_key(|(_, entry)| entry.deadline)
                .map(|(k, _)| k.clone())
            {
                data.remove(&evict);
            }
        }

        data.insert(
            key,
            Entry {
                deadline: now + ttl,
                value,
            },
        );
    }

    pub fn remove(&self, key: &K) {
        self.data.lock().remove(key);
    }

    /// Count of live entries. Sweeps expired entries as a side effect.
    pub fn len(&self) -> usize {
        let mut data = self.data.lock();
        let now = Instant::now();
        data.retain(|_, entry| entry.deadline > now);
        data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
