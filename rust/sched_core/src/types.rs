// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtype wrappers and type aliases for scheduler identifiers.
//!
//! Identifiers (PIDs, CPU ids, task-group ids) are newtypes so that a CPU
//! index can never be passed where a PID is expected. Plain quantities such
//! as nanosecond timestamps are aliases.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub i32);

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CpuId(pub u32);

/// Task-group identifier. Group 0 is the root group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl GroupId {
    pub const ROOT: GroupId = GroupId(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }

    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl CpuId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Time in nanoseconds.
pub type TimeNs = u64;

pub const NSEC_PER_USEC: u64 = 1_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Wrapping "a is before b" comparison, `time_before64` style.
pub fn time_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

pub fn time_after(a: u64, b: u64) -> bool {
    time_before(b, a)
}

/// Virtual time for fair scheduling (opaque u64, not nanoseconds).
///
/// Ordering uses wrapping comparison, so `Vtime(u64::MAX)` compares as less
/// than `Vtime(0)` when the two are within half the u64 range of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Vtime(pub u64);

impl PartialOrd for Vtime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vtime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.wrapping_sub(other.0) as i64).cmp(&0)
    }
}

impl Vtime {
    pub fn max(self, other: Vtime) -> Vtime {
        if self < other {
            other
        } else {
            self
        }
    }

    pub fn min(self, other: Vtime) -> Vtime {
        if self < other {
            self
        } else {
            other
        }
    }

    /// Signed distance `self - other`.
    pub fn diff(self, other: Vtime) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }
}

/// Reference to a fair scheduling entity.
///
/// Task entities live in the task; group entities live in the runqueue of
/// the CPU they represent the group on, indexed by group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityRef {
    Task(Pid),
    Group(GroupId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vtime_wraps() {
        assert!(Vtime(u64::MAX) < Vtime(0));
        assert!(Vtime(5) > Vtime(3));
        assert_eq!(Vtime(3).diff(Vtime(5)), -2);
        assert_eq!(Vtime(u64::MAX).max(Vtime(1)), Vtime(1));
    }

    #[test]
    fn time_before_wraps() {
        assert!(time_before(u64::MAX - 1, 2));
        assert!(time_after(10, 9));
        assert!(!time_before(7, 7));
    }
}
