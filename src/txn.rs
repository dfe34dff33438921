//! Lock manager for transactional lockers
//!
//! [`TxnLockManager`] only accepts lockers created with [`Locker::txn`].
//! Whenever a request blocks it checks for deadlocks, so waits caused by
//! cycles end promptly with a DEADLOCK conflict for one of the lockers
//! instead of running until the lock timeout.
//!
//! [`Locker::txn`]: crate::Locker::txn

use std::any::Any;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};

use crate::common::{LockKey, LockManagerConfig, LockerKind, Result};
use crate::deadlock::DeadlockChecker;
use crate::locker::Locker;
use crate::manager::LockManager;
use crate::request::LockConflict;

/// A lock manager that detects deadlocks between transactional lockers.
#[derive(Debug)]
pub struct TxnLockManager<K> {
    inner: LockManager<K>,
}

impl<K: LockKey> TxnLockManager<K> {
    pub fn new(lock_timeout_ms: u64, num_key_maps: usize) -> Result<Self> {
        Self::with_config(&LockManagerConfig {
            lock_timeout_ms,
            num_key_maps,
        })
    }

    pub fn with_config(config: &LockManagerConfig) -> Result<Self> {
        Ok(Self {
            inner: LockManager::build(config, LockerKind::Txn, true)?,
        })
    }
}

#[cfg(test)]
impl<K: LockKey> TxnLockManager<K> {
    /// A manager whose requests never run the deadlock checker
    pub(crate) fn without_detection(lock_timeout_ms: u64, num_key_maps: usize) -> Result<Self> {
        let config = LockManagerConfig {
            lock_timeout_ms,
            num_key_maps,
        };
        Ok(Self {
            inner: LockManager::build(&config, LockerKind::Txn, false)?,
        })
    }
}

impl<K> Deref for TxnLockManager<K> {
    type Target = LockManager<K>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Runs deadlock detection for a locker that has just blocked.  A panic
/// during detection is logged and then propagated unchanged.
pub(crate) fn detect_deadlock<K: LockKey>(
    manager: &LockManager<K>,
    root: &Locker<K>,
    blocked: LockConflict<K>,
) -> LockConflict<K> {
    let check = AssertUnwindSafe(|| DeadlockChecker::new(manager, root).check(blocked));
    match panic::catch_unwind(check) {
        Ok(conflict) => conflict,
        Err(payload) => {
            log::error!(
                "check deadlock {:?} failed: {}",
                root,
                panic_message(payload.as_ref())
            );
            panic::resume_unwind(payload)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LockError;

    #[test]
    fn test_rejects_other_locker_kinds() {
        let manager = TxnLockManager::<u64>::new(100, 4).unwrap();
        let locker = Locker::new(&manager);
        assert_eq!(
            manager.lock(&locker, &1, false),
            Err(LockError::WrongLockerKind {
                expected: LockerKind::Txn,
                found: LockerKind::Basic,
            })
        );
        assert!(manager.release_lock(&locker, &1).is_err());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
