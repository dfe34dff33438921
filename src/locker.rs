//! Lockers: the entities that request and hold locks
//!
//! A [`Locker`] is a cheap, clonable handle compared by identity.  It is
//! bound permanently to the lock manager that created it and carries the
//! wait state for the request it is currently blocked on.  The flavor of
//! the locker decides where that wait state lives:
//!
//! - basic and transactional lockers keep a single wait state per locker,
//!   since they are only used by one thread at a time;
//! - multi lockers keep one wait state per thread, since several threads
//!   may make requests for the same locker simultaneously.
//!
//! The locker's mutex doubles as the monitor that blocked requests wait on.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::{LockError, LockerKind, Result};
use crate::manager::LockManager;
use crate::multi::MultiLockManager;
use crate::request::{LockAttemptResult, LockConflict, LockMode, LockRequest};
use crate::sync_check::LockerSection;
use crate::txn::TxnLockManager;

/// Used instead of deadlines that would overflow `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

static NEXT_LOCKER_ID: AtomicU64 = AtomicU64::new(1);

/// The transaction associated with a transactional locker.
pub trait Transaction: Send + Sync + fmt::Debug {
    /// When the transaction was created
    fn creation_time(&self) -> Instant;

    /// How long the transaction may run before it times out
    fn timeout(&self) -> Duration;
}

/// A transaction described only by its creation time and timeout.
#[derive(Debug, Clone)]
pub struct BasicTransaction {
    creation_time: Instant,
    timeout: Duration,
}

impl BasicTransaction {
    /// Create a transaction that starts now
    pub fn new(timeout: Duration) -> Self {
        Self::with_creation_time(Instant::now(), timeout)
    }

    pub fn with_creation_time(creation_time: Instant, timeout: Duration) -> Self {
        Self {
            creation_time,
            timeout,
        }
    }
}

impl Transaction for BasicTransaction {
    fn creation_time(&self) -> Instant {
        self.creation_time
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

enum Flavor {
    Basic,
    Multi,
    Txn {
        txn: Arc<dyn Transaction>,
        requested_start_time: u64,
    },
}

/// What one waiting entity (a locker, or one thread of a multi locker)
/// is blocked on.
pub(crate) struct WaitState<K> {
    waiting_for: Option<LockAttemptResult<K>>,
    conflict: Option<LockConflict<K>>,
    interrupted: bool,
}

impl<K> Default for WaitState<K> {
    fn default() -> Self {
        Self {
            waiting_for: None,
            conflict: None,
            interrupted: false,
        }
    }
}

impl<K> WaitState<K> {
    fn is_idle(&self) -> bool {
        self.waiting_for.is_none() && self.conflict.is_none() && !self.interrupted
    }
}

/// Storage for wait state, chosen when the locker is created.
pub(crate) enum WaitStateStore<K> {
    Shared(WaitState<K>),
    PerThread(AHashMap<ThreadId, WaitState<K>>),
}

impl<K> WaitStateStore<K> {
    fn current(&self) -> Option<&WaitState<K>> {
        match self {
            WaitStateStore::Shared(state) => Some(state),
            WaitStateStore::PerThread(states) => states.get(&thread::current().id()),
        }
    }

    fn current_mut(&mut self) -> Option<&mut WaitState<K>> {
        match self {
            WaitStateStore::Shared(state) => Some(state),
            WaitStateStore::PerThread(states) => states.get_mut(&thread::current().id()),
        }
    }

    /// Returns the current thread's state, creating it if needed.  The flag
    /// is set when a per-thread entry was created.
    fn current_or_insert(&mut self) -> (&mut WaitState<K>, bool) {
        match self {
            WaitStateStore::Shared(state) => (state, false),
            WaitStateStore::PerThread(states) => {
                let id = thread::current().id();
                let created = !states.contains_key(&id);
                (states.entry(id).or_default(), created)
            }
        }
    }

    /// Drops the current thread's entry once it holds nothing
    fn prune_current(&mut self) {
        if let WaitStateStore::PerThread(states) = self {
            let id = thread::current().id();
            if states.get(&id).is_some_and(WaitState::is_idle) {
                states.remove(&id);
            }
        }
    }

    /// Flags every pending wait as interrupted, returning whether any was
    fn interrupt_waits(&mut self) -> bool {
        let mut found = false;
        let mut mark = |state: &mut WaitState<K>| {
            if state.waiting_for.is_some() {
                state.interrupted = true;
                found = true;
            }
        };
        match self {
            WaitStateStore::Shared(state) => mark(state),
            WaitStateStore::PerThread(states) => states.values_mut().for_each(mark),
        }
        found
    }
}

/// Something holding per-thread state that must be dropped when the thread
/// exits.
trait ThreadExit {
    fn thread_exited(&self, thread: ThreadId);
}

/// The multi lockers the current thread has wait state in.  Dropped with
/// the thread's locals, removing the thread's entries.
struct ThreadExitHooks {
    thread: ThreadId,
    lockers: Vec<Weak<dyn ThreadExit>>,
}

impl Drop for ThreadExitHooks {
    fn drop(&mut self) {
        for locker in self.lockers.drain(..) {
            if let Some(locker) = locker.upgrade() {
                locker.thread_exited(self.thread);
            }
        }
    }
}

thread_local! {
    static THREAD_EXIT_HOOKS: RefCell<ThreadExitHooks> = RefCell::new(ThreadExitHooks {
        thread: thread::current().id(),
        lockers: Vec::new(),
    });
}

/// Arranges for the current thread's entry in `locker` to be removed when
/// the thread exits
fn register_thread_exit(locker: Weak<dyn ThreadExit>) {
    // Nothing to do once the thread's locals are being destroyed
    let _ = THREAD_EXIT_HOOKS.try_with(|hooks| {
        let mut hooks = hooks.borrow_mut();
        hooks.lockers.retain(|known| known.strong_count() > 0);
        if !hooks.lockers.iter().any(|known| Weak::ptr_eq(known, &locker)) {
            hooks.lockers.push(locker);
        }
    });
}

struct LockerInner<K> {
    id: u64,
    manager_id: u64,
    flavor: Flavor,
    state: Mutex<WaitStateStore<K>>,
    wakeup: Condvar,
}

impl<K> ThreadExit for LockerInner<K> {
    fn thread_exited(&self, thread: ThreadId) {
        if let WaitStateStore::PerThread(states) = &mut *self.state.lock() {
            states.remove(&thread);
        }
    }
}

/// An entity, such as a thread or transaction, that requests locks.
pub struct Locker<K> {
    inner: Arc<LockerInner<K>>,
}

impl<K> Locker<K> {
    fn build(manager_id: u64, flavor: Flavor) -> Self {
        let store = match flavor {
            Flavor::Multi => WaitStateStore::PerThread(AHashMap::new()),
            Flavor::Basic | Flavor::Txn { .. } => WaitStateStore::Shared(WaitState::default()),
        };
        Self {
            inner: Arc::new(LockerInner {
                id: NEXT_LOCKER_ID.fetch_add(1, Ordering::Relaxed),
                manager_id,
                flavor,
                state: Mutex::new(store),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Create a basic locker for the lock manager
    pub fn new(manager: &LockManager<K>) -> Self {
        Self::build(manager.id(), Flavor::Basic)
    }

    /// Create a locker that may make requests from several threads at once
    pub fn multi(manager: &MultiLockManager<K>) -> Self {
        Self::build(manager.id(), Flavor::Multi)
    }

    /// Create a transactional locker.  The requested start time is only
    /// used to pick deadlock victims: the locker with the latest time is
    /// aborted.
    pub fn txn(
        manager: &TxnLockManager<K>,
        txn: Arc<dyn Transaction>,
        requested_start_time: u64,
    ) -> Self {
        Self::build(
            manager.id(),
            Flavor::Txn {
                txn,
                requested_start_time,
            },
        )
    }

    /// A process-wide unique identifier, used in logs and errors
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> LockerKind {
        match self.inner.flavor {
            Flavor::Basic => LockerKind::Basic,
            Flavor::Multi => LockerKind::Multi,
            Flavor::Txn { .. } => LockerKind::Txn,
        }
    }

    /// The requested start time of a transactional locker, else zero
    pub fn requested_start_time(&self) -> u64 {
        match self.inner.flavor {
            Flavor::Txn {
                requested_start_time,
                ..
            } => requested_start_time,
            _ => 0,
        }
    }

    pub fn transaction(&self) -> Option<&Arc<dyn Transaction>> {
        match &self.inner.flavor {
            Flavor::Txn { txn, .. } => Some(txn),
            _ => None,
        }
    }

    /// The conflict recorded for this locker (or, for a multi locker, for
    /// the current thread), if any
    pub fn conflict(&self) -> Option<LockConflict<K>>
    where
        K: Clone,
    {
        self.monitor().conflict().cloned()
    }

    /// The blocked attempt this locker (or, for a multi locker, the current
    /// thread) is waiting on, if any
    pub fn waiting_for(&self) -> Option<LockAttemptResult<K>>
    where
        K: Clone,
    {
        self.monitor().waiting_for().cloned()
    }

    /// Clears a recorded conflict.  A deadlock cannot be cleared: the
    /// locker must abort instead.
    pub fn clear_conflict(&self) -> Result<()> {
        self.monitor().clear_conflict()
    }

    /// Interrupts every wait currently pending for this locker.  Each
    /// interrupted wait returns an INTERRUPTED conflict unless the lock
    /// turns out to have been granted.
    pub fn interrupt(&self) {
        let mut monitor = self.monitor();
        if monitor.store.interrupt_waits() {
            log::trace!("interrupt {:?}", self);
            self.inner.wakeup.notify_all();
        }
    }

    pub(crate) fn manager_id(&self) -> u64 {
        self.inner.manager_id
    }

    pub(crate) fn new_lock_request(&self, key: K, mode: LockMode) -> LockRequest<K> {
        LockRequest::new(self.clone(), key, mode)
    }

    /// Computes when a wait starting at `now` should give up
    pub(crate) fn lock_timeout_time(&self, now: Instant, lock_timeout: Duration) -> Instant {
        let stop = saturating_deadline(now, lock_timeout);
        match &self.inner.flavor {
            Flavor::Txn { txn, .. } => {
                stop.min(saturating_deadline(txn.creation_time(), txn.timeout()))
            }
            _ => stop,
        }
    }

    /// Enters this locker's monitor.  The caller must not hold a key map or
    /// another locker.
    pub(crate) fn monitor(&self) -> LockerMonitor<'_, K> {
        let section = LockerSection::enter();
        LockerMonitor {
            store: self.inner.state.lock(),
            locker: self,
            _section: section,
        }
    }

    /// Wakes the threads waiting on this locker
    pub(crate) fn notify(&self) {
        let _monitor = self.monitor();
        self.inner.wakeup.notify_all();
    }
}

impl<K: 'static> Locker<K> {
    /// Records a deadlock for a waiting locker chosen as a victim and wakes
    /// it.  Returns false, leaving the locker alone, if it is no longer
    /// waiting or already has a conflict.
    pub(crate) fn mark_deadlocked(&self, conflict: LockConflict<K>) -> bool {
        let mut monitor = self.monitor();
        if monitor.waiting_for().is_none() || !monitor.set_conflict(conflict) {
            return false;
        }
        self.inner.wakeup.notify_all();
        true
    }

    #[cfg(test)]
    pub(crate) fn wait_state_count(&self) -> usize {
        match &*self.inner.state.lock() {
            WaitStateStore::Shared(_) => 1,
            WaitStateStore::PerThread(states) => states.len(),
        }
    }
}

fn saturating_deadline(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

impl<K> Clone for Locker<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> PartialEq for Locker<K> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<K> Eq for Locker<K> {}

impl<K> Hash for Locker<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<K> fmt::Debug for Locker<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.flavor {
            Flavor::Txn {
                requested_start_time,
                ..
            } => write!(
                f,
                "TxnLocker[{}, start:{}]",
                self.inner.id, requested_start_time
            ),
            Flavor::Multi => write!(f, "MultiLocker[{}]", self.inner.id),
            Flavor::Basic => write!(f, "Locker[{}]", self.inner.id),
        }
    }
}

/// Exclusive access to a locker's wait state, obtained through
/// [`Locker::monitor`].
pub(crate) struct LockerMonitor<'a, K> {
    store: MutexGuard<'a, WaitStateStore<K>>,
    locker: &'a Locker<K>,
    _section: LockerSection,
}

impl<K> LockerMonitor<'_, K> {
    pub(crate) fn waiting_for(&self) -> Option<&LockAttemptResult<K>> {
        self.store.current().and_then(|state| state.waiting_for.as_ref())
    }

    pub(crate) fn conflict(&self) -> Option<&LockConflict<K>> {
        self.store.current().and_then(|state| state.conflict.as_ref())
    }

    pub(crate) fn clear_conflict(&mut self) -> Result<()> {
        if self.conflict().is_some_and(LockConflict::is_deadlock) {
            return Err(LockError::DeadlockNotClearable);
        }
        if let Some(state) = self.store.current_mut() {
            state.conflict = None;
        }
        self.store.prune_current();
        Ok(())
    }

    /// Consumes a pending interrupt for the current wait
    pub(crate) fn take_interrupt(&mut self) -> bool {
        self.store
            .current_mut()
            .is_some_and(|state| std::mem::take(&mut state.interrupted))
    }

    /// Ends the current wait, keeping any recorded conflict
    pub(crate) fn finish_wait(&mut self) {
        if let Some(state) = self.store.current_mut() {
            state.waiting_for = None;
            state.interrupted = false;
        }
        self.store.prune_current();
    }

    /// Releases the monitor until notified or the deadline passes
    pub(crate) fn wait_until(&mut self, deadline: Instant) {
        self.locker.inner.wakeup.wait_until(&mut self.store, deadline);
    }
}

impl<K: 'static> LockerMonitor<'_, K> {
    fn state_mut(&mut self) -> &mut WaitState<K> {
        let (state, created) = self.store.current_or_insert();
        if created {
            let inner: Weak<dyn ThreadExit> = Arc::downgrade(&self.locker.inner) as Weak<LockerInner<K>>;
            register_thread_exit(inner);
        }
        state
    }

    pub(crate) fn set_waiting_for(&mut self, result: LockAttemptResult<K>) {
        self.state_mut().waiting_for = Some(result);
    }

    /// Records a conflict unless one is already present
    pub(crate) fn set_conflict(&mut self, conflict: LockConflict<K>) -> bool {
        let state = self.state_mut();
        if state.conflict.is_some() {
            return false;
        }
        state.conflict = Some(conflict);
        true
    }
}
