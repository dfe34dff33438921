//! Debug-build checks for the lock manager's internal synchronization
//! scheme.
//!
//! A thread may hold at most one locker monitor and one key map at a time,
//! and must take the locker monitor first when it needs both.  Each guard
//! that enters one of those sections carries a token from this module; in
//! debug builds the tokens track what the current thread holds and panic
//! on a violation.

use std::cell::Cell;

thread_local! {
    static HOLDS_LOCKER: Cell<bool> = const { Cell::new(false) };
    static HOLDS_KEY_MAP: Cell<bool> = const { Cell::new(false) };
}

/// Held while the current thread holds a key map.
#[derive(Debug)]
pub(crate) struct KeyMapSection(());

impl KeyMapSection {
    pub(crate) fn enter() -> Self {
        HOLDS_KEY_MAP.with(|held| {
            debug_assert!(
                !held.get(),
                "Attempt to lock a key map while already holding one"
            );
            held.set(true);
        });
        KeyMapSection(())
    }
}

impl Drop for KeyMapSection {
    fn drop(&mut self) {
        HOLDS_KEY_MAP.with(|held| held.set(false));
    }
}

/// Held while the current thread holds a locker's monitor.
#[derive(Debug)]
pub(crate) struct LockerSection(());

impl LockerSection {
    pub(crate) fn enter() -> Self {
        HOLDS_KEY_MAP.with(|held| {
            debug_assert!(
                !held.get(),
                "Attempt to lock a locker while holding a key map"
            );
        });
        HOLDS_LOCKER.with(|held| {
            debug_assert!(
                !held.get(),
                "Attempt to lock a locker while already holding one"
            );
            held.set(true);
        });
        LockerSection(())
    }
}

impl Drop for LockerSection {
    fn drop(&mut self) {
        HOLDS_LOCKER.with(|held| held.set(false));
    }
}

/// Checks that the current thread holds neither a locker nor a key map.
pub(crate) fn assert_unsynchronized() {
    debug_assert!(
        !HOLDS_LOCKER.with(Cell::get),
        "Unexpectedly holding a locker monitor"
    );
    debug_assert!(
        !HOLDS_KEY_MAP.with(Cell::get),
        "Unexpectedly holding a key map"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locker_then_key_map() {
        let locker = LockerSection::enter();
        let key_map = KeyMapSection::enter();
        drop(key_map);
        drop(locker);
        assert_unsynchronized();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already holding one")]
    fn test_nested_key_maps_rejected() {
        let _first = KeyMapSection::enter();
        let _second = KeyMapSection::enter();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "while holding a key map")]
    fn test_key_map_then_locker_rejected() {
        let _key_map = KeyMapSection::enter();
        let _locker = LockerSection::enter();
    }
}
