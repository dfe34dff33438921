#![no_main]

use keylock::{LockConflictType, LockError, Locker, MultiLockManager};
use libfuzzer_sys::fuzz_target;

const LOCKERS: usize = 4;
const KEYS: u8 = 4;

// Each input byte is one operation: locker in bits 0-1, key in bits 2-3,
// action in bits 4-6.
fuzz_target!(|data: &[u8]| {
    let Ok(manager) = MultiLockManager::<u8>::new(1, 2) else {
        return;
    };
    let lockers: Vec<Locker<u8>> = (0..LOCKERS).map(|_| Locker::multi(&manager)).collect();
    let mut waiting = [false; LOCKERS];

    for &byte in data {
        let index = (byte & 0b11) as usize;
        let locker = &lockers[index];
        let key = (byte >> 2) & 0b11;
        match (byte >> 4) & 0b111 {
            action @ (0 | 1) => match manager.lock_no_wait(locker, &key, action == 1) {
                Ok(None) => assert!(!waiting[index]),
                Ok(Some(conflict)) => {
                    assert!(!waiting[index]);
                    assert_eq!(conflict.conflict_type(), LockConflictType::Blocked);
                    assert_ne!(conflict.conflicting_locker(), locker);
                    waiting[index] = true;
                }
                Err(LockError::WaitInProgress) => assert!(waiting[index]),
                Err(e) => panic!("unexpected error: {e}"),
            },
            2 => manager.release_lock(locker, &key).unwrap(),
            3 => manager.downgrade_lock(locker, &key).unwrap(),
            _ => {
                // Times out after a millisecond unless already granted
                if let Some(conflict) = manager.wait_for_lock(locker).unwrap() {
                    assert_eq!(conflict.conflict_type(), LockConflictType::Timeout);
                }
                waiting[index] = false;
            }
        }

        for key in 0..KEYS {
            let owners = manager.owners(&key);
            let writers = owners.iter().filter(|owner| owner.is_for_write()).count();
            assert!(writers == 0 || owners.len() == 1, "bad owners: {owners:?}");
            let waiters = manager.waiters(&key);
            assert!(waiters.is_empty() || !owners.is_empty(), "waiters without owners");
        }
    }
});
