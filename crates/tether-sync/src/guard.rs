//! Scoped acquisition of a borrowed [`Lock`].

use std::marker::PhantomData;
use std::time::Duration;

use crate::lock::Lock;

/// Holds a borrowed [`Lock`] for the lifetime of the guard.
///
/// The lock is released when the guard is dropped, whichever way control
/// leaves the scope. The guard is `!Send`: the release must happen on the
/// thread that acquired.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ScopedLock<'a> {
    lock: &'a dyn Lock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ScopedLock<'a> {
    /// Block until `lock` is held.
    pub fn new(lock: &'a dyn Lock) -> Self {
        lock.lock();
        Self::held(lock)
    }

    /// Acquire without blocking, or return `None`.
    pub fn try_new(lock: &'a dyn Lock) -> Option<Self> {
        lock.try_lock().then(|| Self::held(lock))
    }

    /// Acquire within `timeout`, or return `None`.
    pub fn try_new_for(lock: &'a dyn Lock, timeout: Duration) -> Option<Self> {
        lock.try_lock_for(timeout).then(|| Self::held(lock))
    }

    fn held(lock: &'a dyn Lock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        // SAFETY: a guard only exists after a successful acquisition on this thread.
        unsafe { self.lock.unlock() }
    }
}
