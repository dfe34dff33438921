//! Lock manager for lockers shared between threads
//!
//! A multi locker may make requests from several threads at the same time,
//! so what it is waiting for is tracked separately for each thread.  No
//! deadlock detection is performed.  Write locks can be downgraded to read
//! locks.

use std::ops::Deref;

use crate::common::{LockKey, LockManagerConfig, LockerKind, Result};
use crate::locker::Locker;
use crate::manager::LockManager;

/// A lock manager for lockers created with [`Locker::multi`].
#[derive(Debug)]
pub struct MultiLockManager<K> {
    inner: LockManager<K>,
}

impl<K: LockKey> MultiLockManager<K> {
    pub fn new(lock_timeout_ms: u64, num_key_maps: usize) -> Result<Self> {
        Self::with_config(&LockManagerConfig {
            lock_timeout_ms,
            num_key_maps,
        })
    }

    pub fn with_config(config: &LockManagerConfig) -> Result<Self> {
        Ok(Self {
            inner: LockManager::build(config, LockerKind::Multi, false)?,
        })
    }

    /// Downgrades a write lock held by the locker to a read lock, granting
    /// the lock to any waiting readers.  Does nothing if the locker does not
    /// hold the lock for write.
    pub fn downgrade_lock(&self, locker: &Locker<K>, key: &K) -> Result<()> {
        self.inner.check_locker(locker)?;
        self.inner.release_lock_internal(locker, key, true);
        Ok(())
    }
}

impl<K> Deref for MultiLockManager<K> {
    type Target = LockManager<K>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
