//! Helpers for lock manager tests
//!
//! [`AcquireLock`] requests a lock from a separate thread, so tests can
//! check whether the request blocked and collect its result later.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::common::{LockKey, Result};
use crate::locker::Locker;
use crate::manager::LockManager;
use crate::multi::MultiLockManager;
use crate::request::{LockConflict, LockConflictType, LockRequest};
use crate::txn::TxnLockManager;

/// Lock timeout for tests that do not exercise timeouts
pub(crate) const TEST_LOCK_TIMEOUT_MS: u64 = 500;

pub(crate) const TEST_NUM_KEY_MAPS: usize = 8;

/// How long a blocked request must stay blocked to count as blocked
const BLOCK_CHECK: Duration = Duration::from_millis(10);

/// How long to wait for a request to finish
const RESULT_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Gives the harness access to the shared implementation of every manager
/// flavor.
pub(crate) trait ManagerHandle<K>: Send + Sync + 'static {
    fn manager(&self) -> &LockManager<K>;
}

impl<K: LockKey> ManagerHandle<K> for LockManager<K> {
    fn manager(&self) -> &LockManager<K> {
        self
    }
}

impl<K: LockKey> ManagerHandle<K> for TxnLockManager<K> {
    fn manager(&self) -> &LockManager<K> {
        self
    }
}

impl<K: LockKey> ManagerHandle<K> for MultiLockManager<K> {
    fn manager(&self) -> &LockManager<K> {
        self
    }
}

type LockResult<K> = Result<Option<LockConflict<K>>>;

enum Progress<K> {
    /// The result of the initial, non-blocking attempt
    Attempted(LockResult<K>),
    Finished(LockResult<K>),
}

/// A lock request running on its own thread.
pub(crate) struct AcquireLock<K> {
    locker: Locker<K>,
    receiver: Receiver<Progress<K>>,
    attempted: Option<LockResult<K>>,
    finished: Option<LockResult<K>>,
}

impl<K: LockKey> AcquireLock<K> {
    /// Starts a thread that calls `lock_no_wait` and, if that blocks,
    /// `wait_for_lock`
    pub(crate) fn new<M: ManagerHandle<K>>(
        manager: &Arc<M>,
        locker: &Locker<K>,
        key: &str,
        for_write: bool,
    ) -> Self
    where
        K: From<String>,
    {
        let (sender, receiver) = mpsc::channel();
        let manager = Arc::clone(manager);
        let thread_locker = locker.clone();
        let key = K::from(key.to_string());
        thread::spawn(move || {
            let manager = manager.manager();
            let attempted = manager.lock_no_wait(&thread_locker, &key, for_write);
            let blocked = matches!(
                &attempted,
                Ok(Some(conflict)) if conflict.conflict_type() == LockConflictType::Blocked
            );
            let _ = sender.send(Progress::Attempted(attempted.clone()));
            let finished = if blocked {
                manager.wait_for_lock(&thread_locker)
            } else {
                attempted
            };
            let _ = sender.send(Progress::Finished(finished));
        });
        Self {
            locker: locker.clone(),
            receiver,
            attempted: None,
            finished: None,
        }
    }

    fn attempted(&mut self) -> &LockResult<K> {
        let receiver = &self.receiver;
        self.attempted
            .get_or_insert_with(|| match receiver.recv_timeout(RESULT_TIMEOUT) {
                Ok(Progress::Attempted(result)) => result,
                Ok(Progress::Finished(_)) => panic!("Finished before attempting"),
                Err(e) => panic!("Lock attempt did not start: {e}"),
            })
    }

    /// Whether the initial attempt blocked and no result is available yet
    pub(crate) fn blocked(&mut self) -> bool {
        match self.attempted() {
            Ok(Some(conflict)) if conflict.conflict_type() == LockConflictType::Blocked => {}
            Err(e) => panic!("Unexpected lock error: {e}"),
            _ => return false,
        }
        if self.finished.is_some() {
            return false;
        }
        match self.receiver.recv_timeout(BLOCK_CHECK) {
            Err(RecvTimeoutError::Timeout) => true,
            Ok(Progress::Finished(result)) => {
                self.finished = Some(result);
                false
            }
            Ok(Progress::Attempted(_)) => panic!("Attempted twice"),
            Err(RecvTimeoutError::Disconnected) => panic!("Lock thread exited"),
        }
    }

    pub(crate) fn assert_blocked(&mut self) {
        assert!(self.blocked(), "The lock attempt did not block");
    }

    /// The final result of the request, including errors
    pub(crate) fn try_result(&mut self) -> LockResult<K> {
        self.attempted();
        if let Some(result) = self.finished.take() {
            return result;
        }
        match self.receiver.recv_timeout(RESULT_TIMEOUT) {
            Ok(Progress::Finished(result)) => result,
            Ok(Progress::Attempted(_)) => panic!("Attempted twice"),
            Err(e) => panic!("No lock result: {e}"),
        }
    }

    /// The final result of the request, which must not be an error
    pub(crate) fn result(&mut self) -> Option<LockConflict<K>> {
        match self.try_result() {
            Ok(result) => result,
            Err(e) => panic!("Unexpected lock error: {e}"),
        }
    }

    /// Interrupts the request's wait
    pub(crate) fn interrupt(&self) {
        self.locker.interrupt();
    }
}

/// Requests a lock on another thread and returns the result
pub(crate) fn acquire_lock<K, M>(
    manager: &Arc<M>,
    locker: &Locker<K>,
    key: &str,
    for_write: bool,
) -> Option<LockConflict<K>>
where
    K: LockKey + From<String>,
    M: ManagerHandle<K>,
{
    AcquireLock::new(manager, locker, key, for_write).result()
}

pub(crate) fn assert_granted<K: Debug>(result: Option<LockConflict<K>>) {
    if let Some(conflict) = result {
        panic!("Expected no conflict: {conflict:?}");
    }
}

/// Asserts that a request failed with the given type of conflict, caused by
/// one of `lockers`
pub(crate) fn assert_conflict<K>(
    result: Option<LockConflict<K>>,
    conflict_type: LockConflictType,
    lockers: &[&Locker<K>],
) {
    let Some(conflict) = result else {
        panic!("Expected {conflict_type}, but the lock was granted");
    };
    assert_eq!(
        conflict.conflict_type(),
        conflict_type,
        "Expected {conflict_type}: {conflict:?}"
    );
    assert!(
        lockers.contains(&conflict.conflicting_locker()),
        "Expected a conflict with one of {lockers:?}, found {:?}",
        conflict.conflicting_locker()
    );
}

pub(crate) fn assert_blocked_by<K>(result: Option<LockConflict<K>>, lockers: &[&Locker<K>]) {
    assert_conflict(result, LockConflictType::Blocked, lockers);
}

pub(crate) fn assert_timeout<K>(result: Option<LockConflict<K>>, lockers: &[&Locker<K>]) {
    assert_conflict(result, LockConflictType::Timeout, lockers);
}

pub(crate) fn assert_interrupted<K>(result: Option<LockConflict<K>>, lockers: &[&Locker<K>]) {
    assert_conflict(result, LockConflictType::Interrupted, lockers);
}

pub(crate) fn assert_deadlock<K>(result: Option<LockConflict<K>>, lockers: &[&Locker<K>]) {
    assert_conflict(result, LockConflictType::Deadlock, lockers);
}

/// Asserts that the lockers in `requests` are exactly `lockers`, in order
pub(crate) fn assert_lockers<K>(requests: &[LockRequest<K>], lockers: &[&Locker<K>]) {
    let found: Vec<&Locker<K>> = requests.iter().map(|request| request.locker()).collect();
    assert_eq!(found, lockers);
}
