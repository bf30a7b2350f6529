//! Interchangeable locking strategies for tether connections.
//!
//! A [`LockPolicy`] is chosen once and turned into a `Box<dyn Lock>` with
//! [`LockPolicy::create`]. Call sites then acquire through [`ScopedLock`],
//! which releases on every exit path.

mod guard;
mod lock;
mod policy;

pub use guard::ScopedLock;
pub use lock::{ExclusiveLock, Lock, NoLock, TimedLock};
pub use policy::{LockPolicy, ParseLockPolicyError};
