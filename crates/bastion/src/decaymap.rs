//! A generic map whose entries expire.
//!
//! Every entry carries an absolute deadline. `get` reports a miss for
//! entries past their deadline and lazily evicts them; `cleanup` sweeps
//! the whole table. A single readers-writer lock protects the table:
//! reads take the read lock, mutations and the sweep take the write lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    deadline: Instant,
}

pub struct DecayMap<K, V> {
    inner: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> Default for DecayMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> DecayMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a value. Expired entries report a miss and are evicted on
    /// the spot (read lock upgraded to a write lock for the removal).
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = {
            let table = self.inner.read();
            match table.get(key) {
                None => return None,
                Some(entry) if Instant::now() < entry.deadline => {
                    return Some(entry.value.clone());
                }
                Some(_) => true,
            }
        };

        if expired {
            let mut table = self.inner.write();
            // Re-check under the write lock; a concurrent set may have
            // refreshed the entry between the two lock acquisitions.
            if let Some(entry) = table.get(key) {
                if Instant::now() >= entry.deadline {
                    table.remove(key);
                }
            }
        }

        None
    }

    /// Insert a value with a time-to-live.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let mut table = self.inner.write();
        table.insert(
            key,
            Entry {
                value,
                deadline: Instant::now() + ttl,
            },
        );
    }

    /// Insert only if no live entry exists for the key. Returns true when
    /// the insert happened. The check and insert run under one write
    /// lock, so concurrent callers for the same key serialize and exactly
    /// one of them observes true.
    pub fn set_if_vacant(&self, key: K, value: V, ttl: Duration) -> bool {
        let mut table = self.inner.write();
        let now = Instant::now();
        if let Some(entry) = table.get(&key) {
            if now < entry.deadline {
                return false;
            }
        }
        table.insert(
            key,
            Entry {
                value,
                deadline: now + ttl,
            },
        );
        true
    }

    /// Remove a key regardless of expiry.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.write().remove(key).map(|e| e.value)
    }

    /// Sweep all expired entries.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut table = self.inner.write();
        table.retain(|_, entry| now < entry.deadline);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Force a key to be expired. Returns true if the key was present.
    #[cfg(test)]
    pub(crate) fn expire(&self, key: &K) -> bool {
        let mut table = self.inner.write();
        match table.get_mut(key) {
            Some(entry) => {
                entry.deadline = Instant::now() - Duration::from_secs(1);
                true
            }
            None => false,
        }
    }
}
