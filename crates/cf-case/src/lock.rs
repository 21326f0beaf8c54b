//! One-operation-at-a-time lock for a case.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
pub struct EasyBoolLock {
    held: Arc<AtomicBool>,
}

impl EasyBoolLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if it is free. The lock is released when the returned
    /// guard is dropped.
    pub fn try_acquire(&self) -> Option<OpGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| OpGuard {
                held: Arc::clone(&self.held),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct OpGuard {
    held: Arc<AtomicBool>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let lock = EasyBoolLock::new();
        let guard = lock.try_acquire().unwrap();
        assert!(lock.is_held());
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn clones_share_the_flag() {
        let lock = EasyBoolLock::new();
        let other = lock.clone();
        let _guard = lock.try_acquire().unwrap();
        assert!(other.is_held());
        assert!(other.try_acquire().is_none());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn lock_is_held_exactly_while_a_guard_lives(steps in proptest::collection::vec(any::<bool>(), 0..40)) {
            let lock = EasyBoolLock::new();
            let mut guard = None;
            for acquire in steps {
                if acquire {
                    let got = lock.try_acquire();
                    prop_assert_eq!(got.is_some(), guard.is_none());
                    if got.is_some() {
                        guard = got;
                    }
                } else {
                    guard = None;
                }
                prop_assert_eq!(lock.is_held(), guard.is_some());
            }
        }
    }
}
