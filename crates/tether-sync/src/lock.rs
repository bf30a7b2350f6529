//! The [`Lock`] capability and its three strategies.
//!
//! Every strategy exposes the same four operations so a connection can be
//! built against `Box<dyn Lock>` and never branch on the policy again:
//!
//! | strategy          | blocking `lock` | `try_lock_for`           | re-entrant |
//! |-------------------|-----------------|--------------------------|------------|
//! | [`ExclusiveLock`] | yes             | degrades to `try_lock`   | no         |
//! | [`TimedLock`]     | yes             | bounded wait             | no         |
//! | [`NoLock`]        | no-op           | always succeeds          | trivially  |
//!
//! Debug builds of the two exclusive strategies remember the holder thread
//! and panic on recursive blocking acquisition or on release from a thread
//! that does not hold the lock.

use std::time::Duration;

use parking_lot::RawMutex;
use parking_lot::lock_api::{RawMutex as _, RawMutexTimed as _};

use crate::policy::LockPolicy;

/// A mutual-exclusion capability that is acquired and released explicitly.
///
/// Prefer [`ScopedLock`](crate::ScopedLock) over calling [`Lock::unlock`]
/// directly; the guard pairs every acquisition with exactly one release.
pub trait Lock: Send + Sync {
    /// Block the calling thread until the lock is held.
    fn lock(&self);

    /// Attempt to acquire without blocking. Returns `true` on success.
    fn try_lock(&self) -> bool;

    /// Attempt to acquire, waiting at most `timeout`. Returns `true` on success.
    fn try_lock_for(&self, timeout: Duration) -> bool;

    /// Release a lock previously acquired by the calling thread.
    ///
    /// # Safety
    ///
    /// The calling thread must currently hold the lock through one of the
    /// acquire operations above.
    unsafe fn unlock(&self);

    /// The policy this lock was built from.
    fn policy(&self) -> LockPolicy;
}

/// Fast exclusive lock without timed waiting.
///
/// [`Lock::try_lock_for`] behaves exactly like [`Lock::try_lock`].
pub struct ExclusiveLock {
    raw: RawMutex,
    #[cfg(debug_assertions)]
    holder: holder::Holder,
}

impl ExclusiveLock {
    /// Create an unlocked instance.
    pub const fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            #[cfg(debug_assertions)]
            holder: holder::Holder::new(),
        }
    }
}

impl Default for ExclusiveLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock for ExclusiveLock {
    fn lock(&self) {
        #[cfg(debug_assertions)]
        self.holder.check_not_recursive("exclusive");
        self.raw.lock();
        #[cfg(debug_assertions)]
        self.holder.acquired();
    }

    fn try_lock(&self) -> bool {
        let locked = self.raw.try_lock();
        #[cfg(debug_assertions)]
        if locked {
            self.holder.acquired();
        }
        locked
    }

    fn try_lock_for(&self, _timeout: Duration) -> bool {
        self.try_lock()
    }

    unsafe fn unlock(&self) {
        #[cfg(debug_assertions)]
        self.holder.released("exclusive");
        // SAFETY: the caller holds the lock per the trait contract.
        unsafe { self.raw.unlock() }
    }

    fn policy(&self) -> LockPolicy {
        LockPolicy::Exclusive
    }
}

/// Exclusive lock that supports bounded waiting.
pub struct TimedLock {
    raw: RawMutex,
    #[cfg(debug_assertions)]
    holder: holder::Holder,
}

impl TimedLock {
    /// Create an unlocked instance.
    pub const fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            #[cfg(debug_assertions)]
            holder: holder::Holder::new(),
        }
    }
}

impl Default for TimedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock for TimedLock {
    fn lock(&self) {
        #[cfg(debug_assertions)]
        self.holder.check_not_recursive("timed");
        self.raw.lock();
        #[cfg(debug_assertions)]
        self.holder.acquired();
    }

    fn try_lock(&self) -> bool {
        let locked = self.raw.try_lock();
        #[cfg(debug_assertions)]
        if locked {
            self.holder.acquired();
        }
        locked
    }

    fn try_lock_for(&self, timeout: Duration) -> bool {
        let locked = self.raw.try_lock_for(timeout);
        #[cfg(debug_assertions)]
        if locked {
            self.holder.acquired();
        }
        locked
    }

    unsafe fn unlock(&self) {
        #[cfg(debug_assertions)]
        self.holder.released("timed");
        // SAFETY: the caller holds the lock per the trait contract.
        unsafe { self.raw.unlock() }
    }

    fn policy(&self) -> LockPolicy {
        LockPolicy::Timed
    }
}

/// Lock that never blocks and never excludes.
///
/// Only sound as a *logical* lock when the embedding guarantees that a
/// single thread touches the protected object.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

impl Lock for NoLock {
    fn lock(&self) {}

    fn try_lock(&self) -> bool {
        true
    }

    fn try_lock_for(&self, _timeout: Duration) -> bool {
        true
    }

    unsafe fn unlock(&self) {}

    fn policy(&self) -> LockPolicy {
        LockPolicy::None
    }
}

#[cfg(debug_assertions)]
mod holder {
    use std::thread::{self, ThreadId};

    use parking_lot::Mutex;

    /// Holder bookkeeping for debug builds.
    pub(super) struct Holder {
        thread: Mutex<Option<ThreadId>>,
    }

    impl Holder {
        pub(super) const fn new() -> Self {
            Self {
                thread: Mutex::new(None),
            }
        }

        pub(super) fn check_not_recursive(&self, kind: &str) {
            let current = thread::current().id();
            if *self.thread.lock() == Some(current) {
                panic!("recursive acquisition of {kind} lock by its holder thread");
            }
        }

        pub(super) fn acquired(&self) {
            *self.thread.lock() = Some(thread::current().id());
        }

        pub(super) fn released(&self, kind: &str) {
            let current = thread::current().id();
            let mut holder = self.thread.lock();
            assert_eq!(
                *holder,
                Some(current),
                "{kind} lock released by a thread that does not hold it"
            );
            *holder = None;
        }
    }
}
