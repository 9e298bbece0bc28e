use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Agent-wide flag allowing at most one sampling activity at a time.
///
/// A holder that never releases its guard starves every other profiler.
#[derive(Debug, Default)]
pub struct ProfilerLock {
    locked: AtomicBool,
}

impl ProfilerLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Takes the lock if it is free.
    pub fn try_acquire(self: &Arc<Self>) -> Option<LockGuard> {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LockGuard {
                grant: Arc::new(Grant {
                    lock: Arc::clone(self),
                    released: AtomicBool::new(false),
                }),
            })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct Grant {
    lock: Arc<ProfilerLock>,
    released: AtomicBool,
}

impl Grant {
    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.lock.locked.store(false, Ordering::Release);
        }
    }
}

/// Ownership of the [`ProfilerLock`]. Released exactly once, either through
/// [`LockGuard::release`] or on drop.
#[derive(Debug)]
pub struct LockGuard {
    grant: Arc<Grant>,
}

impl LockGuard {
    pub fn release(&self) {
        self.grant.release();
    }

    pub fn is_released(&self) -> bool {
        self.grant.released.load(Ordering::Acquire)
    }

    /// A second handle to the same grant that does not release on drop.
    pub(crate) fn release_handle(&self) -> ReleaseHandle {
        ReleaseHandle {
            grant: Arc::clone(&self.grant),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Releases a grant whose guard has been handed off elsewhere.
#[derive(Debug)]
pub(crate) struct ReleaseHandle {
    grant: Arc<Grant>,
}

impl ReleaseHandle {
    pub(crate) fn release(&self) {
        self.grant.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_holder() {
        let lock = ProfilerLock::new();

        let guard = lock.try_acquire().expect("first acquire");
        assert!(lock.is_locked());
        assert!(lock.try_acquire().is_none());

        guard.release();
        assert!(!lock.is_locked());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn test_release_is_idempotent() {
        let lock = ProfilerLock::new();

        let first = lock.try_acquire().expect("acquire");
        first.release();
        let second = lock.try_acquire().expect("reacquire");

        // A stale guard must not free the lock held by someone else.
        first.release();
        drop(first);
        assert!(lock.is_locked());

        drop(second);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_release_handle_outlives_moved_guard() {
        let lock = ProfilerLock::new();

        let guard = lock.try_acquire().expect("acquire");
        let handle = guard.release_handle();
        let stashed = vec![guard];

        handle.release();
        assert!(!lock.is_locked());

        let next = lock.try_acquire().expect("reacquire");
        drop(stashed);
        assert!(lock.is_locked());
        drop(next);
    }
}
