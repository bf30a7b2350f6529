//! Lock policy selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::lock::{ExclusiveLock, Lock, NoLock, TimedLock};

/// Which [`Lock`] strategy a connection is built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockPolicy {
    /// [`ExclusiveLock`]: fast mutual exclusion, no timed waits.
    #[default]
    Exclusive,
    /// [`TimedLock`]: mutual exclusion with bounded waiting.
    Timed,
    /// [`NoLock`]: every operation is a no-op (single-threaded embedding).
    None,
}

impl LockPolicy {
    /// Build a fresh, unlocked lock for this policy.
    pub fn create(self) -> Box<dyn Lock> {
        match self {
            LockPolicy::Exclusive => Box::new(ExclusiveLock::new()),
            LockPolicy::Timed => Box::new(TimedLock::new()),
            LockPolicy::None => Box::new(NoLock),
        }
    }

    /// Lower-case name, as accepted by [`FromStr`].
    pub fn as_str(self) -> &'static str {
        match self {
            LockPolicy::Exclusive => "exclusive",
            LockPolicy::Timed => "timed",
            LockPolicy::None => "none",
        }
    }
}

impl fmt::Display for LockPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known [`LockPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown lock policy `{0}` (expected exclusive, timed or none)")]
pub struct ParseLockPolicyError(pub String);

impl FromStr for LockPolicy {
    type Err = ParseLockPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclusive" => Ok(LockPolicy::Exclusive),
            "timed" => Ok(LockPolicy::Timed),
            "none" => Ok(LockPolicy::None),
            _ => Err(ParseLockPolicyError(s.to_string())),
        }
    }
}
