//! Lock requests, attempt results and conflicts
//!
//! These are the values exchanged between the lock manager, the per-key
//! [`Lock`](crate::lock) state and callers.  All of them are immutable
//! once created.

use std::fmt;

use crate::locker::Locker;

/// The access requested by a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared access
    Read,
    /// Exclusive access
    Write,
    /// Exclusive access requested by a locker that already owns the lock
    /// for read
    Upgrade,
}

impl LockMode {
    /// Whether this mode requires exclusive access
    #[inline]
    pub fn is_write(self) -> bool {
        !matches!(self, LockMode::Read)
    }

    #[inline]
    pub(crate) fn from_flags(for_write: bool, upgrade: bool) -> Self {
        match (for_write, upgrade) {
            (_, true) => LockMode::Upgrade,
            (true, false) => LockMode::Write,
            (false, false) => LockMode::Read,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
            LockMode::Upgrade => "upgrade",
        };
        f.write_str(name)
    }
}

/// A request for a lock made by a locker.
#[derive(Clone, PartialEq, Eq)]
pub struct LockRequest<K> {
    locker: Locker<K>,
    key: K,
    mode: LockMode,
}

impl<K> LockRequest<K> {
    pub(crate) fn new(locker: Locker<K>, key: K, mode: LockMode) -> Self {
        Self { locker, key, mode }
    }

    /// The locker that made the request
    pub fn locker(&self) -> &Locker<K> {
        &self.locker
    }

    /// The key identifying the requested lock
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Whether the request is for write, including upgrades
    pub fn is_for_write(&self) -> bool {
        self.mode.is_write()
    }

    /// Whether the request upgrades an existing read lock
    pub fn is_upgrade(&self) -> bool {
        self.mode == LockMode::Upgrade
    }
}

impl<K: fmt::Debug> fmt::Debug for LockRequest<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LockRequest[locker:{}, key:{:?}, {}]",
            self.locker.id(),
            self.key,
            self.mode
        )
    }
}

/// The kind of conflict that prevented a lock from being granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockConflictType {
    /// The request is waiting for another locker
    Blocked,
    /// The request did not complete within the lock timeout
    Timeout,
    /// The request was rejected outright
    Denied,
    /// The wait for the request was interrupted
    Interrupted,
    /// The request would deadlock; the locker must abort
    Deadlock,
}

impl fmt::Display for LockConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockConflictType::Blocked => "BLOCKED",
            LockConflictType::Timeout => "TIMEOUT",
            LockConflictType::Denied => "DENIED",
            LockConflictType::Interrupted => "INTERRUPTED",
            LockConflictType::Deadlock => "DEADLOCK",
        };
        f.write_str(name)
    }
}

/// Describes why a lock request was not granted.
#[derive(Clone, PartialEq, Eq)]
pub struct LockConflict<K> {
    conflict_type: LockConflictType,
    conflicting_locker: Locker<K>,
}

impl<K> LockConflict<K> {
    pub fn new(conflict_type: LockConflictType, conflicting_locker: Locker<K>) -> Self {
        Self {
            conflict_type,
            conflicting_locker,
        }
    }

    pub fn conflict_type(&self) -> LockConflictType {
        self.conflict_type
    }

    /// A locker that contributed to the conflict
    pub fn conflicting_locker(&self) -> &Locker<K> {
        &self.conflicting_locker
    }

    pub fn is_deadlock(&self) -> bool {
        self.conflict_type == LockConflictType::Deadlock
    }
}

impl<K> fmt::Debug for LockConflict<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LockConflict[{}, conflict:{}]",
            self.conflict_type,
            self.conflicting_locker.id()
        )
    }
}

impl<K> fmt::Display for LockConflict<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} by locker {}",
            self.conflict_type,
            self.conflicting_locker.id()
        )
    }
}

/// The result of attempting to acquire a lock: the request, and the
/// conflict that prevented it from being granted, if any.
#[derive(Clone, PartialEq, Eq)]
pub struct LockAttemptResult<K> {
    request: LockRequest<K>,
    conflict: Option<LockConflict<K>>,
}

impl<K> LockAttemptResult<K> {
    pub(crate) fn granted(request: LockRequest<K>) -> Self {
        Self {
            request,
            conflict: None,
        }
    }

    pub(crate) fn conflicted(request: LockRequest<K>, conflict: LockConflict<K>) -> Self {
        Self {
            request,
            conflict: Some(conflict),
        }
    }

    pub fn request(&self) -> &LockRequest<K> {
        &self.request
    }

    pub fn conflict(&self) -> Option<&LockConflict<K>> {
        self.conflict.as_ref()
    }

    pub fn is_granted(&self) -> bool {
        self.conflict.is_none()
    }
}

impl<K: fmt::Debug> fmt::Debug for LockAttemptResult<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.conflict {
            None => write!(f, "LockAttemptResult[{:?}, granted]", self.request),
            Some(conflict) => write!(f, "LockAttemptResult[{:?}, {:?}]", self.request, conflict),
        }
    }
}
