//! Latest-change cache.

use std::hash::Hash;

use dashmap::DashMap;

/// Most recent change payload per key.
///
/// Writes overwrite unconditionally. The owning subscriptions only write
/// while a key is registered and erase its entry when the key is released.
pub(crate) struct ChangeCache<K, C> {
    entries: DashMap<K, C>,
}

impl<K, C> ChangeCache<K, C>
where
    K: Eq + Hash,
    C: Clone,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store `change` as the latest for `key`.
    pub fn put(&self, key: K, change: C) {
        self.entries.insert(key, change);
    }

    /// Latest change for `key`, if any.
    pub fn get(&self, key: &K) -> Option<C> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Drop the cached change for `key`.
    pub fn erase(&self, key: &K) -> Option<C> {
        self.entries.remove(key).map(|(_, change)| change)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K, C> Default for ChangeCache<K, C>
where
    K: Eq + Hash,
    C: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
