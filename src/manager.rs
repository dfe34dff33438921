//! The lock manager
//!
//! [`LockManager`] grants read and write locks on keys to lockers, queues
//! lockers whose requests conflict, and wakes them when the locks they are
//! waiting for are released.  Locks are held until they are explicitly
//! released; there is no lock escalation or time limit on ownership.
//!
//! # Synchronization
//!
//! Two kinds of mutex are used: the key maps in the lock table, which guard
//! the per-key [`Lock`](crate::lock) state, and each locker's monitor, which
//! guards its wait state and is what blocked requests wait on.  A thread
//! holds at most one of each, and takes the locker monitor first when it
//! needs both.  Lockers are only notified once both have been released.
//! Debug builds check these rules at runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::common::{LockError, LockKey, LockManagerConfig, LockerKind, Result};
use crate::locker::Locker;
use crate::metrics::{LockMetrics, LockMetricsSnapshot};
use crate::request::{LockConflict, LockConflictType, LockRequest};
use crate::sync_check;
use crate::table::LockTable;
use crate::txn;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// What a waiting request found when it checked the lock
enum WaitPoll<K> {
    Granted,
    Waiting,
    Denied(LockConflict<K>),
}

/// A lock manager for basic lockers, also the shared implementation behind
/// [`MultiLockManager`](crate::MultiLockManager) and
/// [`TxnLockManager`](crate::TxnLockManager).
pub struct LockManager<K> {
    id: u64,
    /// How long to wait for a lock before timing out
    lock_timeout: Duration,
    table: LockTable<K>,
    /// The kind of locker this manager accepts
    expected_kind: LockerKind,
    detect_deadlocks: bool,
    metrics: LockMetrics,
}

impl<K: LockKey> LockManager<K> {
    /// Creates a lock manager for basic lockers.
    ///
    /// `lock_timeout_ms` is the maximum number of milliseconds to wait for
    /// a lock and `num_key_maps` the number of separate maps used to spread
    /// keys over.  Both must be at least 1.
    pub fn new(lock_timeout_ms: u64, num_key_maps: usize) -> Result<Self> {
        Self::with_config(&LockManagerConfig {
            lock_timeout_ms,
            num_key_maps,
        })
    }

    pub fn with_config(config: &LockManagerConfig) -> Result<Self> {
        Self::build(config, LockerKind::Basic, false)
    }

    pub(crate) fn build(
        config: &LockManagerConfig,
        expected_kind: LockerKind,
        detect_deadlocks: bool,
    ) -> Result<Self> {
        config.validate()?;
        let manager = Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            lock_timeout: config.lock_timeout(),
            table: LockTable::new(config.num_key_maps),
            expected_kind,
            detect_deadlocks,
            metrics: LockMetrics::new(),
        };
        log::debug!(
            "created {} lock manager {}: lock timeout {:?}, {} key maps",
            expected_kind,
            manager.id,
            manager.lock_timeout,
            config.num_key_maps
        );
        Ok(manager)
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn num_key_maps(&self) -> usize {
        self.table.num_key_maps()
    }

    /// Attempts to acquire a lock, waiting if needed.  Returns `None` if the
    /// lock was acquired, otherwise the conflict that prevented it: a
    /// timeout, denial, interruption or deadlock.
    ///
    /// Fails if the locker belongs to a different lock manager, is already
    /// waiting for a lock, or must abort because of an earlier deadlock.
    pub fn lock(
        &self,
        locker: &Locker<K>,
        key: &K,
        for_write: bool,
    ) -> Result<Option<LockConflict<K>>> {
        self.check_locker(locker)?;
        match self.lock_no_wait_internal(locker, key, for_write)? {
            Some(conflict) if conflict.conflict_type() == LockConflictType::Blocked => {
                self.wait_for_lock_internal(locker)
            }
            result => Ok(result),
        }
    }

    /// Attempts to acquire a lock without waiting.  Returns `None` if the
    /// lock was acquired, otherwise the conflict.  A BLOCKED conflict leaves
    /// the locker waiting: call [`wait_for_lock`](Self::wait_for_lock)
    /// before making another request.
    pub fn lock_no_wait(
        &self,
        locker: &Locker<K>,
        key: &K,
        for_write: bool,
    ) -> Result<Option<LockConflict<K>>> {
        self.check_locker(locker)?;
        self.lock_no_wait_internal(locker, key, for_write)
    }

    /// Waits for a lock previously requested with
    /// [`lock_no_wait`](Self::lock_no_wait).  Returns `None` if the lock was
    /// acquired or the locker was not waiting, otherwise the conflict.
    pub fn wait_for_lock(&self, locker: &Locker<K>) -> Result<Option<LockConflict<K>>> {
        self.check_locker(locker)?;
        self.wait_for_lock_internal(locker)
    }

    /// Releases a lock held by a locker.  Releasing a lock that is not held
    /// does nothing.
    pub fn release_lock(&self, locker: &Locker<K>, key: &K) -> Result<()> {
        self.check_locker(locker)?;
        self.release_lock_internal(locker, key, false);
        Ok(())
    }

    /// The current owners of the lock for `key`
    pub fn owners(&self, key: &K) -> Vec<LockRequest<K>> {
        let key_map = self.table.key_map(key);
        key_map
            .get(key)
            .map(|lock| lock.owners().to_vec())
            .unwrap_or_default()
    }

    /// The requests waiting for the lock for `key`, in the order they will
    /// be served
    pub fn waiters(&self, key: &K) -> Vec<LockRequest<K>> {
        let key_map = self.table.key_map(key);
        key_map
            .get(key)
            .map(|lock| lock.waiters().to_vec())
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> LockMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Number of keys with owners or waiters
    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.table.lock_count()
    }

    /// Checks that the locker was created for this lock manager
    pub(crate) fn check_locker(&self, locker: &Locker<K>) -> Result<()> {
        if locker.manager_id() != self.id {
            return Err(rejected(locker, LockError::WrongLockManager));
        }
        if locker.kind() != self.expected_kind {
            let err = LockError::WrongLockerKind {
                expected: self.expected_kind,
                found: locker.kind(),
            };
            return Err(rejected(locker, err));
        }
        Ok(())
    }

    fn lock_no_wait_internal(
        &self,
        locker: &Locker<K>,
        key: &K,
        for_write: bool,
    ) -> Result<Option<LockConflict<K>>> {
        sync_check::assert_unsynchronized();
        self.metrics.record_request();
        let blocked = {
            let mut monitor = locker.monitor();
            if monitor.waiting_for().is_some() {
                return Err(rejected(locker, LockError::WaitInProgress));
            }
            if monitor.conflict().is_some_and(LockConflict::is_deadlock) {
                let err = LockError::MustAbort {
                    locker: locker.id(),
                };
                return Err(rejected(locker, err));
            }
            monitor.clear_conflict()?;

            let result = {
                let mut key_map = self.table.key_map(key);
                key_map.get_or_create(key).attempt(locker, for_write, false)
            };
            let Some(result) = result else {
                log::debug!(
                    "lock {:?}, {:?}, for_write:{} returns None (already granted)",
                    locker,
                    key,
                    for_write
                );
                self.metrics.record_immediate_grant();
                return Ok(None);
            };
            match result.conflict().cloned() {
                None => {
                    log::debug!(
                        "lock {:?}, {:?}, for_write:{} returns None (granted)",
                        locker,
                        key,
                        for_write
                    );
                    self.metrics.record_immediate_grant();
                    return Ok(None);
                }
                Some(conflict) if conflict.conflict_type() == LockConflictType::Denied => {
                    log::debug!(
                        "lock {:?}, {:?}, for_write:{} returns {:?}",
                        locker,
                        key,
                        for_write,
                        conflict
                    );
                    self.metrics.record_conflict(LockConflictType::Denied);
                    return Ok(Some(conflict));
                }
                Some(conflict) => {
                    monitor.set_waiting_for(result);
                    conflict
                }
            }
        };

        let conflict = if self.detect_deadlocks {
            txn::detect_deadlock(self, locker, blocked)
        } else {
            blocked
        };
        if conflict.is_deadlock() {
            // The requester was chosen as the victim, so stop waiting now
            self.abandon_wait(locker, key);
        }
        log::debug!(
            "lock {:?}, {:?}, for_write:{} returns {:?}",
            locker,
            key,
            for_write,
            conflict
        );
        self.metrics.record_conflict(conflict.conflict_type());
        Ok(Some(conflict))
    }

    /// Withdraws the locker's pending request for `key`
    fn abandon_wait(&self, locker: &Locker<K>, key: &K) {
        let notify = {
            let mut monitor = locker.monitor();
            let notify = self.flush_waiter(locker, key);
            monitor.finish_wait();
            notify
        };
        self.notify_lockers(&notify);
    }

    fn flush_waiter(&self, locker: &Locker<K>, key: &K) -> Vec<Locker<K>> {
        let mut key_map = self.table.key_map(key);
        let notify = key_map
            .get_mut(key)
            .map(|lock| lock.flush_waiter(locker))
            .unwrap_or_default();
        key_map.remove_if_unused(key);
        notify
    }

    fn wait_for_lock_internal(&self, locker: &Locker<K>) -> Result<Option<LockConflict<K>>> {
        sync_check::assert_unsynchronized();
        let mut notify = Vec::new();
        let (key, for_write, outcome) = {
            let mut monitor = locker.monitor();
            let Some(result) = monitor.waiting_for().cloned() else {
                if monitor.conflict().is_some_and(LockConflict::is_deadlock) {
                    let err = LockError::MustAbort {
                        locker: locker.id(),
                    };
                    return Err(rejected(locker, err));
                }
                log::debug!("lock {:?} returns None (not waiting)", locker);
                return Ok(None);
            };
            let request = result.request();
            let key = request.key();
            let blocker = result
                .conflict()
                .map_or_else(|| locker.clone(), |conflict| conflict.conflicting_locker().clone());
            let started = Instant::now();
            let deadline = locker.lock_timeout_time(started, self.lock_timeout);

            let conflict = loop {
                match self.poll_wait(locker, request) {
                    WaitPoll::Granted => break None,
                    WaitPoll::Denied(conflict) => break Some(conflict),
                    WaitPoll::Waiting => {}
                }
                if let Some(conflict) = monitor.conflict().cloned() {
                    break Some(conflict);
                }
                let now = Instant::now();
                if now >= deadline {
                    let timeout = LockConflict::new(LockConflictType::Timeout, blocker.clone());
                    monitor.set_conflict(timeout.clone());
                    break Some(timeout);
                }
                if monitor.take_interrupt() {
                    // Check ownership once more before reporting the interrupt
                    monitor.set_conflict(LockConflict::new(
                        LockConflictType::Interrupted,
                        blocker.clone(),
                    ));
                    continue;
                }
                log::trace!(
                    "wait for lock {:?}, {:?}, for_write:{}, wait:{:?}",
                    locker,
                    key,
                    request.is_for_write(),
                    deadline - now
                );
                monitor.wait_until(deadline);
            };

            let outcome = match conflict {
                None => match monitor.conflict().cloned() {
                    // Granted, but chosen as a deadlock victim in the meantime
                    Some(conflict) if conflict.is_deadlock() => Some(conflict),
                    _ => {
                        monitor.clear_conflict()?;
                        None
                    }
                },
                Some(conflict) => {
                    if conflict.conflict_type() != LockConflictType::Denied {
                        notify = self.flush_waiter(locker, key);
                    }
                    Some(conflict)
                }
            };
            monitor.finish_wait();
            self.metrics.record_wait(started.elapsed(), outcome.is_none());
            (key.clone(), request.is_for_write(), outcome)
        };

        self.notify_lockers(&notify);
        match &outcome {
            Some(conflict) => {
                self.metrics.record_conflict(conflict.conflict_type());
                log::debug!(
                    "lock {:?}, {:?}, for_write:{} returns {:?}",
                    locker,
                    key,
                    for_write,
                    conflict
                );
            }
            None => log::debug!(
                "lock {:?}, {:?}, for_write:{} returns None (granted)",
                locker,
                key,
                for_write
            ),
        }
        Ok(outcome)
    }

    /// Checks on a waiting request.  Requests whose waiter entry has gone,
    /// because another thread of the same locker released the lock or
    /// withdrew the shared entry, are attempted again.
    fn poll_wait(&self, locker: &Locker<K>, request: &LockRequest<K>) -> WaitPoll<K> {
        let key = request.key();
        let mut key_map = self.table.key_map(key);
        let lock = key_map.get_or_create(key);
        if lock.is_owner(request) {
            return WaitPoll::Granted;
        }
        if lock.has_waiter(locker) {
            return WaitPoll::Waiting;
        }
        log::trace!("lost waiter entry for {:?}, attempting again", request);
        match lock.attempt(locker, request.is_for_write(), false) {
            None => WaitPoll::Granted,
            Some(result) => match result.conflict() {
                None => WaitPoll::Granted,
                Some(conflict) if conflict.conflict_type() == LockConflictType::Denied => {
                    WaitPoll::Denied(conflict.clone())
                }
                Some(_) => WaitPoll::Waiting,
            },
        }
    }

    pub(crate) fn release_lock_internal(&self, locker: &Locker<K>, key: &K, downgrade: bool) {
        sync_check::assert_unsynchronized();
        log::debug!("release {:?}, {:?}, downgrade:{}", locker, key, downgrade);
        let notify = {
            let mut key_map = self.table.key_map(key);
            let notify = key_map
                .get_mut(key)
                .map(|lock| lock.release(locker, downgrade))
                .unwrap_or_default();
            key_map.remove_if_unused(key);
            notify
        };
        self.metrics.record_release(downgrade);
        self.notify_lockers(&notify);
    }

    fn notify_lockers(&self, lockers: &[Locker<K>]) {
        sync_check::assert_unsynchronized();
        self.metrics.record_notifications(lockers.len());
        for locker in lockers {
            log::trace!("notify {:?}", locker);
            locker.notify();
        }
    }
}

/// Logs a call from `locker` that was refused with `err`
fn rejected<K>(locker: &Locker<K>, err: LockError) -> LockError {
    log::debug!("{:?} rejected, {} error: {}", locker, err.category(), err);
    err
}

impl<K> LockManager<K> {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl<K> std::fmt::Debug for LockManager<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("id", &self.id)
            .field("kind", &self.expected_kind)
            .field("lock_timeout", &self.lock_timeout)
            .field("detect_deadlocks", &self.detect_deadlocks)
            .finish()
    }
}
