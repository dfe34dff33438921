//! Common types and error definitions for keylock
//!
//! This module contains the error type returned for caller bugs and the
//! configuration shared by all lock manager flavors.

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of milliseconds to wait for a lock before timing out.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10;

/// Proportion of the transaction timeout used as the lock timeout when the
/// lock timeout is derived from a transaction timeout.
pub const DEFAULT_LOCK_TIMEOUT_PROPORTION: f64 = 0.1;

/// Default number of independently locked key maps.
pub const DEFAULT_NUM_KEY_MAPS: usize = 8;

/// Bounds required of the keys that identify lockable resources
pub trait LockKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> LockKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// The flavor of a locker, which also identifies the manager flavor it
/// can be used with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockerKind {
    /// A single-threaded locker without transaction metadata
    Basic,
    /// A locker that may issue requests from several threads at once
    Multi,
    /// A transactional locker that participates in deadlock detection
    Txn,
}

impl fmt::Display for LockerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockerKind::Basic => "basic",
            LockerKind::Multi => "multi",
            LockerKind::Txn => "txn",
        };
        f.write_str(name)
    }
}

/// Errors reported for misuse of the lock manager.
///
/// Lock conflicts are not errors: they are returned as
/// [`LockConflict`](crate::LockConflict) values so callers can retry,
/// wait, or abort.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The locker was created for a different lock manager
    #[error("The locker has a different lock manager")]
    WrongLockManager,

    #[error("The locker is a {found} locker, but the lock manager requires a {expected} locker")]
    WrongLockerKind {
        expected: LockerKind,
        found: LockerKind,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The locker (on this thread) is still waiting for an earlier request
    #[error("Attempt to obtain a new lock while waiting")]
    WaitInProgress,

    /// An earlier request by the locker ended in deadlock
    #[error("Locker {locker} must abort: an earlier lock attempt produced a deadlock")]
    MustAbort { locker: u64 },

    #[error("Cannot clear a deadlock conflict")]
    DeadlockNotClearable,
}

impl LockError {
    /// Check if this error reports a bad argument
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            LockError::WrongLockManager
                | LockError::WrongLockerKind { .. }
                | LockError::InvalidConfig { .. }
        )
    }

    /// Check if this error reports a call made in the wrong locker state
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            LockError::WaitInProgress
                | LockError::MustAbort { .. }
                | LockError::DeadlockNotClearable
        )
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            LockError::WrongLockManager | LockError::WrongLockerKind { .. } => "locker",
            LockError::InvalidConfig { .. } => "configuration",
            LockError::WaitInProgress => "wait",
            LockError::MustAbort { .. } | LockError::DeadlockNotClearable => "deadlock",
        }
    }
}

/// Result type alias for keylock operations
pub type Result<T> = std::result::Result<T, LockError>;

/// Configuration for a lock manager instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Maximum number of milliseconds to spend waiting for a lock
    pub lock_timeout_ms: u64,
    /// Number of separate key maps used to allow concurrent access
    pub num_key_maps: usize,
}

impl LockManagerConfig {
    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms < 1 {
            return Err(LockError::InvalidConfig {
                message: "The lock timeout must not be less than 1".to_string(),
            });
        }

        if self.num_key_maps < 1 {
            return Err(LockError::InvalidConfig {
                message: "The number of key maps must not be less than 1".to_string(),
            });
        }

        if self.num_key_maps > 1024 {
            log::warn!(
                "{} key maps configured, more than 1024 rarely improves concurrency",
                self.num_key_maps
            );
        }

        Ok(())
    }

    /// Create a configuration whose lock timeout is a fixed proportion of
    /// the transaction timeout
    pub fn for_txn_timeout(txn_timeout_ms: u64) -> Result<Self> {
        let derived = (txn_timeout_ms as f64 * DEFAULT_LOCK_TIMEOUT_PROPORTION) as u64;
        let config = Self {
            lock_timeout_ms: derived.max(1),
            ..Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Create a configuration with a specific lock timeout
    pub fn with_lock_timeout(lock_timeout_ms: u64) -> Result<Self> {
        let config = Self {
            lock_timeout_ms,
            ..Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// The lock timeout as a duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            num_key_maps: DEFAULT_NUM_KEY_MAPS,
        }
    }
}
