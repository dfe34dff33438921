//! Deadlock detection for transactional lockers
//!
//! When a request blocks, the requester is the root of a depth-first search
//! over the waits-for graph: each waiting locker points at the owners of the
//! lock it is waiting for.  Reaching a locker that is already on the current
//! search path closes a cycle.  Within the cycle, the locker with the latest
//! requested start time becomes the victim and is given a DEADLOCK conflict.
//!
//! Removing one victim can leave the root blocked by another cycle, so the
//! search is repeated, with a new pass number, until no cycle remains or the
//! root itself is chosen.  Owner lists are read once per check and cached;
//! they may be stale, which can only delay detection until a later check.

use ahash::AHashMap;

use crate::common::LockKey;
use crate::locker::Locker;
use crate::manager::LockManager;
use crate::request::{LockConflict, LockConflictType, LockRequest};

/// What a locker was waiting for when first examined
struct WaiterInfo<K> {
    /// Owners of the lock the locker is waiting for, or `None` if it is not
    /// waiting or already has a conflict
    waiting_for: Option<Vec<LockRequest<K>>>,
    /// The last pass that visited this locker
    pass: u32,
    /// Whether the locker is on the current search path
    on_path: bool,
}

/// A cycle found by the search, built up while the search unwinds
#[derive(Debug)]
struct Cycle<K> {
    /// The locker that closed the cycle, until the unwinding passes it again
    boundary: Option<Locker<K>>,
    victim: Locker<K>,
    /// Another locker in the cycle
    conflict: Option<Locker<K>>,
}

impl<K> Cycle<K> {
    fn new(boundary: Locker<K>) -> Self {
        Self {
            victim: boundary.clone(),
            boundary: Some(boundary),
            conflict: None,
        }
    }

    /// Accounts for the next locker back along the search path
    fn include(&mut self, locker: &Locker<K>) {
        if self.conflict.is_none() {
            self.conflict = Some(locker.clone());
        }
        if self.boundary.as_ref() == Some(locker) {
            // Back around to where the cycle closed: the rest of the path
            // leads into the cycle but is not part of it
            self.boundary = None;
        } else if self.boundary.is_some()
            && locker.requested_start_time() > self.victim.requested_start_time()
        {
            if self.conflict.as_ref() == Some(locker) {
                self.conflict = Some(self.victim.clone());
            }
            self.victim = locker.clone();
        }
    }
}

pub(crate) struct DeadlockChecker<'a, K> {
    manager: &'a LockManager<K>,
    root: &'a Locker<K>,
    waiters: AHashMap<Locker<K>, WaiterInfo<K>>,
    pass: u32,
}

impl<'a, K: LockKey> DeadlockChecker<'a, K> {
    pub(crate) fn new(manager: &'a LockManager<K>, root: &'a Locker<K>) -> Self {
        Self {
            manager,
            root,
            waiters: AHashMap::new(),
            pass: 0,
        }
    }

    /// Checks for deadlocks involving the root, which has just been blocked
    /// with `blocked`.  Returns a DEADLOCK conflict if the root was chosen
    /// as the victim, otherwise `blocked`.  Other victims are marked and
    /// woken.
    pub(crate) fn check(mut self, blocked: LockConflict<K>) -> LockConflict<K> {
        loop {
            self.pass += 1;
            let Some(cycle) = self.search(self.root) else {
                log::trace!("check deadlock {:?}: no deadlock", self.root);
                return blocked;
            };
            let victim = cycle.victim;
            let conflict = cycle.conflict.unwrap_or_else(|| victim.clone());
            log::debug!(
                "check deadlock {:?}: victim {:?}, conflict {:?}",
                self.root,
                victim,
                conflict
            );
            if let Some(info) = self.waiters.get_mut(&victim) {
                info.waiting_for = None;
            }
            let deadlock = LockConflict::new(LockConflictType::Deadlock, conflict);
            if victim == *self.root {
                if self.root.mark_deadlocked(deadlock.clone()) {
                    return deadlock;
                }
                // Another check got here first
                return self.root.conflict().unwrap_or(deadlock);
            }
            if !victim.mark_deadlocked(deadlock) {
                log::trace!(
                    "check deadlock {:?}: victim {:?} is no longer waiting",
                    self.root,
                    victim
                );
            }
        }
    }

    fn search(&mut self, locker: &Locker<K>) -> Option<Cycle<K>> {
        let pass = self.pass;
        let waiting_for = {
            let info = self.waiter_info(locker);
            info.pass = pass;
            info.on_path = true;
            info.waiting_for.clone().unwrap_or_default()
        };

        let mut found = None;
        for request in &waiting_for {
            let owner = request.locker();
            if owner == locker {
                log::trace!(
                    "checking deadlock {:?}, pass {}: locker {:?}, waiting for {:?}: ignore self-reference",
                    self.root,
                    pass,
                    locker,
                    request
                );
                continue;
            }
            let info = self.waiter_info(owner);
            if info.waiting_for.is_none() {
                continue;
            }
            if info.pass == pass {
                if info.on_path {
                    log::trace!(
                        "checking deadlock {:?}, pass {}: locker {:?}, waiting for {:?}: deadlock",
                        self.root,
                        pass,
                        locker,
                        request
                    );
                    found = Some(Cycle::new(owner.clone()));
                    break;
                }
                // Already explored in this pass without finding a cycle
                continue;
            }
            if let Some(mut cycle) = self.search(owner) {
                cycle.include(owner);
                found = Some(cycle);
                break;
            }
        }

        if let Some(info) = self.waiters.get_mut(locker) {
            info.on_path = false;
        }
        found
    }

    fn waiter_info(&mut self, locker: &Locker<K>) -> &mut WaiterInfo<K> {
        let manager = self.manager;
        self.waiters
            .entry(locker.clone())
            .or_insert_with(|| WaiterInfo {
                waiting_for: waiting_for(manager, locker),
                pass: 0,
                on_path: false,
            })
    }
}

/// Snapshots the owners of the lock a locker is waiting for
fn waiting_for<K: LockKey>(
    manager: &LockManager<K>,
    locker: &Locker<K>,
) -> Option<Vec<LockRequest<K>>> {
    let key = {
        let monitor = locker.monitor();
        if monitor.conflict().is_some() {
            return None;
        }
        monitor.waiting_for()?.request().key().clone()
    };
    Some(manager.owners(&key))
}
