//! Per-key lock state
//!
//! A [`Lock`] records the owners and waiters for a single key and decides
//! which requests may be granted.  It has no synchronization of its own:
//! locks live inside a key map and are only reachable through a
//! [`KeyMapGuard`](crate::table::KeyMapGuard), so every method here runs
//! with that key map held.
//!
//! Owners are either a single writer or any number of readers.  Waiters are
//! served in order, except that upgrade requests, made by readers that want
//! to write, are queued ahead of all other waiters.

use crate::common::LockKey;
use crate::locker::Locker;
use crate::request::{LockAttemptResult, LockConflict, LockConflictType, LockMode, LockRequest};

/// The owners and waiters for one key.
pub(crate) struct Lock<K> {
    key: K,
    owners: Vec<LockRequest<K>>,
    waiters: Vec<LockRequest<K>>,
}

impl<K: LockKey> Lock<K> {
    pub(crate) fn new(key: K) -> Self {
        Self {
            key,
            owners: Vec::with_capacity(2),
            waiters: Vec::with_capacity(2),
        }
    }

    /// Attempts to obtain this lock for `locker`.
    ///
    /// Returns `None` if the locker already owns the lock with sufficient
    /// access.  Otherwise returns the request together with the conflict
    /// that prevented it from being granted, if any.  A granted request is
    /// moved to the owners; a blocked request is queued as a waiter, reusing
    /// the locker's existing waiter entry if it has one.  A locker already
    /// waiting for the other access mode is denied without being queued.
    pub(crate) fn attempt(
        &mut self,
        locker: &Locker<K>,
        for_write: bool,
        known_waiter: bool,
    ) -> Option<LockAttemptResult<K>> {
        let mut upgrade = false;
        let mut conflict: Option<&Locker<K>> = None;
        for owner in &self.owners {
            if owner.locker() == locker {
                if for_write && !owner.is_for_write() {
                    upgrade = true;
                } else {
                    return None;
                }
            } else if (for_write || owner.is_for_write()) && conflict.is_none() {
                conflict = Some(owner.locker());
            }
        }

        let mut reused = None;
        for (index, waiter) in self.waiters.iter().enumerate() {
            if waiter.locker() == locker {
                if waiter.is_for_write() != for_write {
                    // Waiting for read and write at once, from different
                    // threads of a multi locker
                    let request = locker
                        .new_lock_request(self.key.clone(), LockMode::from_flags(for_write, upgrade));
                    let denied = LockConflict::new(LockConflictType::Denied, locker.clone());
                    return Some(LockAttemptResult::conflicted(request, denied));
                }
                reused = Some(index);
                break;
            }
            // Reads wait behind queued writes; upgrades jump the queue
            if conflict.is_none() && !upgrade && (for_write || waiter.is_for_write()) {
                conflict = Some(waiter.locker());
            }
        }
        debug_assert!(
            !known_waiter || reused.is_some(),
            "Waiter was not found: {:?}",
            locker
        );

        let mode = LockMode::from_flags(for_write, upgrade);
        let result = match conflict.cloned() {
            None => {
                if upgrade {
                    self.owners.retain(|owner| owner.locker() != locker);
                }
                let request = match reused {
                    Some(index) if self.waiters[index].mode() == mode => self.waiters.remove(index),
                    Some(index) => {
                        self.waiters.remove(index);
                        locker.new_lock_request(self.key.clone(), mode)
                    }
                    None => locker.new_lock_request(self.key.clone(), mode),
                };
                self.owners.push(request.clone());
                LockAttemptResult::granted(request)
            }
            Some(owner) => {
                let request = match reused {
                    Some(index) => self.waiters[index].clone(),
                    None => {
                        let request = locker.new_lock_request(self.key.clone(), mode);
                        self.add_waiter(request.clone());
                        request
                    }
                };
                LockAttemptResult::conflicted(
                    request,
                    LockConflict::new(LockConflictType::Blocked, owner),
                )
            }
        };
        debug_assert!(self.validate());
        Some(result)
    }

    /// Queues upgrade requests after existing upgrades but ahead of all
    /// other waiters, and other requests at the end.
    fn add_waiter(&mut self, request: LockRequest<K>) {
        if request.is_upgrade() {
            let index = self
                .waiters
                .iter()
                .position(|waiter| !waiter.is_upgrade())
                .unwrap_or(self.waiters.len());
            self.waiters.insert(index, request);
        } else {
            self.waiters.push(request);
        }
    }

    /// Releases the locker's ownership of this lock, or downgrades a write
    /// lock to a read lock, then grants the lock to waiters in order until
    /// one still conflicts.  Returns the lockers whose wait has ended.
    pub(crate) fn release(&mut self, locker: &Locker<K>, downgrade: bool) -> Vec<Locker<K>> {
        log::trace!("release {:?}, downgrade:{}, {:?}", locker, downgrade, self.key);
        let mut notify = Vec::new();
        let Some(index) = self.owners.iter().position(|owner| owner.locker() == locker) else {
            return notify;
        };
        if downgrade && !self.owners[index].is_for_write() {
            return notify;
        }
        let owner = self.owners.remove(index);
        if downgrade {
            self.owners
                .push(locker.new_lock_request(owner.key().clone(), LockMode::Read));
        } else if let Some(index) = self.waiter_index(locker) {
            // Another thread of the same locker was waiting to upgrade
            self.waiters.remove(index);
            notify.push(locker.clone());
        }
        self.grant_waiters(&mut notify);
        debug_assert!(self.validate());
        notify
    }

    /// Removes the locker's waiter entry, if any, granting the lock to the
    /// waiters behind it that no longer conflict.
    pub(crate) fn flush_waiter(&mut self, locker: &Locker<K>) -> Vec<Locker<K>> {
        let mut notify = Vec::new();
        if let Some(index) = self.waiter_index(locker) {
            self.waiters.remove(index);
            self.grant_waiters(&mut notify);
            debug_assert!(self.validate());
        }
        notify
    }

    fn grant_waiters(&mut self, notify: &mut Vec<Locker<K>>) {
        while let Some(head) = self.waiters.first() {
            let waiter = head.locker().clone();
            let for_write = head.is_for_write();
            let result = self.attempt(&waiter, for_write, true);
            log::trace!("attempt to lock waiter {:?} returns {:?}", waiter, result);
            match result {
                // Waiters are served in order, so stop at the first conflict
                Some(result) if !result.is_granted() => break,
                Some(_) => {}
                None => {
                    self.waiters.remove(0);
                }
            }
            if !notify.contains(&waiter) {
                notify.push(waiter);
            }
        }
    }

    fn waiter_index(&self, locker: &Locker<K>) -> Option<usize> {
        self.waiters.iter().position(|waiter| waiter.locker() == locker)
    }

    /// Whether the request's locker owns this lock with at least the
    /// requested access
    pub(crate) fn is_owner(&self, request: &LockRequest<K>) -> bool {
        self.owners
            .iter()
            .find(|owner| owner.locker() == request.locker())
            .is_some_and(|owner| !request.is_for_write() || owner.is_for_write())
    }

    pub(crate) fn has_waiter(&self, locker: &Locker<K>) -> bool {
        self.waiter_index(locker).is_some()
    }

    /// Locks that are not in use can be removed from the table
    pub(crate) fn in_use(&self) -> bool {
        !self.owners.is_empty() || !self.waiters.is_empty()
    }

    pub(crate) fn owners(&self) -> &[LockRequest<K>] {
        &self.owners
    }

    pub(crate) fn waiters(&self) -> &[LockRequest<K>] {
        &self.waiters
    }

    /// Checks the consistency of the owners and waiters, panicking if they
    /// are inconsistent.
    pub(crate) fn validate(&self) -> bool {
        let writers = self.owners.iter().filter(|owner| owner.is_for_write()).count();
        if writers > 1 || (writers == 1 && self.owners.len() > 1) {
            panic!("Mixed or multiple write owners for {:?}: {:?}", self.key, self.owners);
        }
        if !self.waiters.is_empty() && self.owners.is_empty() {
            panic!("Waiters but no owners for {:?}: {:?}", self.key, self.waiters);
        }
        let mut seen_non_upgrade = false;
        for (index, waiter) in self.waiters.iter().enumerate() {
            if !waiter.is_upgrade() {
                seen_non_upgrade = true;
            } else if seen_non_upgrade {
                panic!("Upgrade waiter follows non-upgrade for {:?}: {:?}", self.key, self.waiters);
            }
            if self.waiters[index + 1..]
                .iter()
                .any(|other| other.locker() == waiter.locker())
            {
                panic!("Locker waits twice for {:?}: {:?}", self.key, waiter);
            }
            let owner = self.owners.iter().find(|owner| owner.locker() == waiter.locker());
            match owner {
                Some(owner) if !waiter.is_upgrade() => {
                    panic!("Locker owns and waits, but not for upgrade: {:?}, {:?}", owner, waiter)
                }
                Some(owner) if owner.is_for_write() => {
                    panic!("Locker owns for write but waits for upgrade: {:?}, {:?}", owner, waiter)
                }
                None if waiter.is_upgrade() => {
                    panic!("Waiting for upgrade but not owner: {:?}", waiter)
                }
                _ => {}
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::LockManager;

    fn setup(count: usize) -> (LockManager<String>, Vec<Locker<String>>) {
        let manager = LockManager::new(100, 1).unwrap();
        let lockers = (0..count).map(|_| Locker::new(&manager)).collect();
        (manager, lockers)
    }

    fn lockers_of(requests: &[LockRequest<String>]) -> Vec<u64> {
        requests.iter().map(|request| request.locker().id()).collect()
    }

    fn blocked_by(result: Option<LockAttemptResult<String>>) -> u64 {
        let result = result.expect("expected an attempt result");
        let conflict = result.conflict().expect("expected a conflict");
        assert_eq!(conflict.conflict_type(), LockConflictType::Blocked);
        conflict.conflicting_locker().id()
    }

    #[test]
    fn test_shared_readers_and_reentrant_requests() {
        let (_manager, lockers) = setup(2);
        let mut lock = Lock::new("o1".to_string());
        assert!(lock.attempt(&lockers[0], false, false).unwrap().is_granted());
        assert!(lock.attempt(&lockers[1], false, false).unwrap().is_granted());
        assert_eq!(lock.owners().len(), 2);

        // Owning for read satisfies a second read
        assert!(lock.attempt(&lockers[0], false, false).is_none());
        assert_eq!(lock.owners().len(), 2);
    }

    #[test]
    fn test_write_owner_blocks_and_queues() {
        let (_manager, lockers) = setup(3);
        let mut lock = Lock::new("o1".to_string());
        assert!(lock.attempt(&lockers[0], true, false).unwrap().is_granted());
        assert!(lock.attempt(&lockers[0], false, false).is_none());
        assert!(lock.attempt(&lockers[0], true, false).is_none());

        assert_eq!(blocked_by(lock.attempt(&lockers[1], false, false)), lockers[0].id());
        assert_eq!(blocked_by(lock.attempt(&lockers[2], true, false)), lockers[0].id());
        assert_eq!(lockers_of(lock.waiters()), vec![lockers[1].id(), lockers[2].id()]);

        // Repeating a blocked request reuses the waiter entry
        assert_eq!(blocked_by(lock.attempt(&lockers[1], false, false)), lockers[0].id());
        assert_eq!(lock.waiters().len(), 2);
    }

    #[test]
    fn test_reads_wait_behind_queued_writes() {
        let (_manager, lockers) = setup(3);
        let mut lock = Lock::new("o1".to_string());
        lock.attempt(&lockers[0], false, false);
        assert_eq!(blocked_by(lock.attempt(&lockers[1], true, false)), lockers[0].id());
        assert_eq!(blocked_by(lock.attempt(&lockers[2], false, false)), lockers[1].id());
    }

    #[test]
    fn test_release_grants_in_order() {
        let (_manager, lockers) = setup(4);
        let mut lock = Lock::new("o1".to_string());
        lock.attempt(&lockers[0], true, false);
        lock.attempt(&lockers[1], false, false);
        lock.attempt(&lockers[2], false, false);
        lock.attempt(&lockers[3], true, false);

        let notified = lock.release(&lockers[0], false);
        assert_eq!(notified, vec![lockers[1].clone(), lockers[2].clone()]);
        assert_eq!(lockers_of(lock.owners()), vec![lockers[1].id(), lockers[2].id()]);
        assert_eq!(lockers_of(lock.waiters()), vec![lockers[3].id()]);

        assert!(lock.release(&lockers[1], false).is_empty());
        assert_eq!(lock.release(&lockers[2], false), vec![lockers[3].clone()]);
        assert!(lock.owners()[0].is_for_write());
        assert!(lock.waiters().is_empty());
    }

    #[test]
    fn test_release_without_ownership_is_ignored() {
        let (_manager, lockers) = setup(2);
        let mut lock = Lock::new("o1".to_string());
        lock.attempt(&lockers[0], true, false);
        assert!(lock.release(&lockers[1], false).is_empty());
        assert_eq!(lock.owners().len(), 1);
    }

    #[test]
    fn test_upgrade_without_other_owners() {
        let (_manager, lockers) = setup(2);
        let mut lock = Lock::new("o1".to_string());
        lock.attempt(&lockers[0], false, false);
        lock.attempt(&lockers[1], true, false);

        let result = lock.attempt(&lockers[0], true, false).unwrap();
        assert!(result.is_granted());
        assert!(result.request().is_upgrade());
        assert_eq!(lock.owners().len(), 1);
        assert!(lock.owners()[0].is_for_write());
        assert_eq!(lockers_of(lock.waiters()), vec![lockers[1].id()]);
    }

    #[test]
    fn test_upgrade_waiters_precede_others() {
        let (_manager, lockers) = setup(5);
        let mut lock = Lock::new("o1".to_string());
        lock.attempt(&lockers[0], false, false);
        lock.attempt(&lockers[1], false, false);
        lock.attempt(&lockers[2], false, false);
        lock.attempt(&lockers[3], true, false);

        assert_eq!(blocked_by(lock.attempt(&lockers[1], true, false)), lockers[0].id());
        assert_eq!(blocked_by(lock.attempt(&lockers[2], true, false)), lockers[0].id());
        assert_eq!(
            lockers_of(lock.waiters()),
            vec![lockers[1].id(), lockers[2].id(), lockers[3].id()]
        );
        assert!(lock.waiters()[0].is_upgrade());
        assert!(lock.waiters()[1].is_upgrade());

        // Releasing one reader still leaves two, so nothing is granted
        assert!(lock.release(&lockers[0], false).is_empty());
        // Dropping locker 2's read lock withdraws its upgrade and lets
        // locker 1 upgrade
        let notified = lock.release(&lockers[2], false);
        assert_eq!(notified, vec![lockers[2].clone(), lockers[1].clone()]);
        assert!(lock.owners()[0].is_upgrade());
        assert_eq!(lockers_of(lock.waiters()), vec![lockers[3].id()]);
    }

    #[test]
    fn test_conflicting_modes_denied() {
        let (_manager, lockers) = setup(2);
        let mut lock = Lock::new("o1".to_string());
        lock.attempt(&lockers[0], true, false);
        lock.attempt(&lockers[1], false, false);

        let result = lock.attempt(&lockers[1], true, false).unwrap();
        let conflict = result.conflict().unwrap();
        assert_eq!(conflict.conflict_type(), LockConflictType::Denied);
        assert_eq!(conflict.conflicting_locker(), &lockers[1]);
        assert_eq!(lock.waiters().len(), 1);
        assert!(!lock.waiters()[0].is_for_write());
    }

    #[test]
    fn test_downgrade_admits_readers() {
        let (_manager, lockers) = setup(3);
        let mut lock = Lock::new("o1".to_string());
        lock.attempt(&lockers[0], true, false);
        lock.attempt(&lockers[1], false, false);
        lock.attempt(&lockers[2], true, false);

        let notified = lock.release(&lockers[0], true);
        assert_eq!(notified, vec![lockers[1].clone()]);
        assert_eq!(lockers_of(lock.owners()), vec![lockers[0].id(), lockers[1].id()]);
        assert!(lock.owners().iter().all(|owner| !owner.is_for_write()));
        assert_eq!(lockers_of(lock.waiters()), vec![lockers[2].id()]);

        // Downgrading a read lock changes nothing
        assert!(lock.release(&lockers[0], true).is_empty());
        assert_eq!(lock.owners().len(), 2);
    }

    #[test]
    fn test_flush_waiter_promotes_followers() {
        let (_manager, lockers) = setup(3);
        let mut lock = Lock::new("o1".to_string());
        lock.attempt(&lockers[0], false, false);
        lock.attempt(&lockers[1], true, false);
        lock.attempt(&lockers[2], false, false);
        assert!(lock.has_waiter(&lockers[2]));

        let notified = lock.flush_waiter(&lockers[1]);
        assert_eq!(notified, vec![lockers[2].clone()]);
        assert!(!lock.has_waiter(&lockers[1]));
        assert_eq!(lock.owners().len(), 2);
        assert!(lock.flush_waiter(&lockers[1]).is_empty());
    }

    #[test]
    fn test_is_owner_and_in_use() {
        let (_manager, lockers) = setup(1);
        let mut lock = Lock::new("o1".to_string());
        assert!(!lock.in_use());
        let request = lock.attempt(&lockers[0], false, false).unwrap().request().clone();
        assert!(lock.is_owner(&request));
        let write = lockers[0].new_lock_request("o1".to_string(), LockMode::Write);
        assert!(!lock.is_owner(&write));
        lock.release(&lockers[0], false);
        assert!(!lock.in_use());
    }

    #[test]
    #[should_panic(expected = "Mixed or multiple write owners")]
    fn test_validate_rejects_mixed_owners() {
        let (_manager, lockers) = setup(2);
        let mut lock = Lock::new("o1".to_string());
        lock.owners
            .push(lockers[0].new_lock_request("o1".to_string(), LockMode::Write));
        lock.owners
            .push(lockers[1].new_lock_request("o1".to_string(), LockMode::Read));
        lock.validate();
    }

    #[test]
    #[should_panic(expected = "Upgrade waiter follows non-upgrade")]
    fn test_validate_rejects_misordered_upgrade() {
        let (_manager, lockers) = setup(3);
        let mut lock = Lock::new("o1".to_string());
        lock.attempt(&lockers[0], false, false);
        lock.attempt(&lockers[1], false, false);
        lock.waiters
            .push(lockers[2].new_lock_request("o1".to_string(), LockMode::Write));
        lock.waiters
            .push(lockers[1].new_lock_request("o1".to_string(), LockMode::Upgrade));
        lock.validate();
    }
}
