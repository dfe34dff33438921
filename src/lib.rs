//! # keylock: a two-phase, deadlock-detecting lock manager
//!
//! `keylock` serializes access to shared resources identified by keys on
//! behalf of lockers: threads, transactions, or anything else that acquires
//! locks and later releases them.  Locks are read or write locks, held until
//! released, and granted to waiting lockers in order.
//!
//! ## Lock managers
//!
//! - [`LockManager`]: basic lockers, one thread per locker.
//! - [`MultiLockManager`]: lockers that may make requests from several
//!   threads at once; adds lock downgrading.
//! - [`TxnLockManager`]: transactional lockers, with deadlock detection
//!   whenever a request blocks.
//!
//! Conflicts are returned as [`LockConflict`] values rather than errors, so
//! callers decide whether to retry, wait, or abort.  [`LockError`] reports
//! misuse, such as passing a locker to the wrong manager.
//!
//! ## Example
//!
//! ```rust
//! use keylock::{LockConflictType, Locker, LockManager};
//!
//! let manager = LockManager::new(100, 8)?;
//! let a = Locker::new(&manager);
//! let b = Locker::new(&manager);
//!
//! let key = "x".to_string();
//! assert!(manager.lock(&a, &key, true)?.is_none());
//!
//! let conflict = manager.lock_no_wait(&b, &key, true)?.unwrap();
//! assert_eq!(conflict.conflict_type(), LockConflictType::Blocked);
//!
//! manager.release_lock(&a, &key)?;
//! assert!(manager.wait_for_lock(&b)?.is_none());
//! # Ok::<(), keylock::LockError>(())
//! ```

pub mod common;
mod deadlock;
mod lock;
pub mod locker;
pub mod manager;
pub mod metrics;
pub mod multi;
pub mod request;
mod sync_check;
mod table;
pub mod txn;

#[cfg(test)]
mod test_util;

// Re-export commonly used types
pub use common::{LockError, LockKey, LockManagerConfig, LockerKind, Result};
pub use locker::{BasicTransaction, Locker, Transaction};
pub use manager::LockManager;
pub use metrics::{LockMetrics, LockMetricsSnapshot};
pub use multi::MultiLockManager;
pub use request::{LockAttemptResult, LockConflict, LockConflictType, LockMode, LockRequest};
pub use txn::TxnLockManager;
