//! Sharded table of per-key locks
//!
//! Keys are spread over a fixed number of key maps, each behind its own
//! mutex, so that unrelated keys can be locked and released concurrently.
//! A [`Lock`] can only be reached through the [`KeyMapGuard`] of the key map
//! that holds it.

use ahash::{AHashMap, RandomState};
use parking_lot::{Mutex, MutexGuard};

use crate::common::LockKey;
use crate::lock::Lock;
use crate::sync_check::KeyMapSection;

pub(crate) struct LockTable<K> {
    key_maps: Box<[Mutex<AHashMap<K, Lock<K>>>]>,
    /// Fixed for the lifetime of the table, so a key always maps to the same
    /// key map
    hasher: RandomState,
}

impl<K: LockKey> LockTable<K> {
    pub(crate) fn new(num_key_maps: usize) -> Self {
        let key_maps = (0..num_key_maps.max(1))
            .map(|_| Mutex::new(AHashMap::new()))
            .collect();
        Self {
            key_maps,
            hasher: RandomState::new(),
        }
    }

    pub(crate) fn num_key_maps(&self) -> usize {
        self.key_maps.len()
    }

    fn key_map_index(&self, key: &K) -> usize {
        let hash = self.hasher.hash_one(key) & i64::MAX as u64;
        (hash % self.key_maps.len() as u64) as usize
    }

    /// Locks the key map responsible for `key`.  The caller must not already
    /// hold a key map.
    pub(crate) fn key_map(&self, key: &K) -> KeyMapGuard<'_, K> {
        let section = KeyMapSection::enter();
        KeyMapGuard {
            map: self.key_maps[self.key_map_index(key)].lock(),
            _section: section,
        }
    }

    /// Counts the locks currently in the table
    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.key_maps
            .iter()
            .map(|key_map| {
                let _section = KeyMapSection::enter();
                key_map.lock().len()
            })
            .sum()
    }
}

/// Exclusive access to one key map.
pub(crate) struct KeyMapGuard<'a, K> {
    map: MutexGuard<'a, AHashMap<K, Lock<K>>>,
    _section: KeyMapSection,
}

impl<K: LockKey> KeyMapGuard<'_, K> {
    /// Returns the lock for `key`, creating it if needed
    pub(crate) fn get_or_create(&mut self, key: &K) -> &mut Lock<K> {
        self.map
            .entry(key.clone())
            .or_insert_with(|| Lock::new(key.clone()))
    }

    pub(crate) fn get(&self, key: &K) -> Option<&Lock<K>> {
        self.map.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &K) -> Option<&mut Lock<K>> {
        self.map.get_mut(key)
    }

    /// Drops the lock for `key` once it has no owners or waiters
    pub(crate) fn remove_if_unused(&mut self, key: &K) {
        if self.map.get(key).is_some_and(|lock| !lock.in_use()) {
            self.map.remove(key);
        }
    }
}
