// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::types::CpuId;
use crate::types::GroupId;
use crate::types::Pid;

/// Failures surfaced by configuration-path operations.
///
/// Every operation returning a `SchedError` validates before it mutates, so
/// an error leaves the scheduler state exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedError {
    #[error("deadline bandwidth admission refused")]
    AdmissionRefused,
    #[error("invalid scheduling parameters: {0}")]
    InvalidParams(&'static str),
    #[error("affinity mask contains no active cpu")]
    AffinityEmpty,
    #[error("invalid task group configuration: {0}")]
    GroupConfigInvalid(&'static str),
    #[error("scheduling domain build failed: {0}")]
    TopologyBuild(String),
    #[error("no such task {0}")]
    NoSuchTask(Pid),
    #[error("no such task group {0}")]
    NoSuchGroup(GroupId),
    #[error("cpu {0} cannot be taken offline")]
    CpuBusy(CpuId),
    #[error("resource busy")]
    Busy,
}

pub const EPERM: i32 = 1;
pub const ESRCH: i32 = 3;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;

impl SchedError {
    /// Errno value the syscall-equivalent surface reports.
    pub fn errno(&self) -> i32 {
        match self {
            SchedError::AdmissionRefused => EBUSY,
            SchedError::InvalidParams(_) => EINVAL,
            SchedError::AffinityEmpty => EINVAL,
            SchedError::GroupConfigInvalid(_) => EINVAL,
            SchedError::TopologyBuild(_) => EINVAL,
            SchedError::NoSuchTask(_) => ESRCH,
            SchedError::NoSuchGroup(_) => ESRCH,
            SchedError::CpuBusy(_) => EBUSY,
            SchedError::Busy => EBUSY,
        }
    }
}

pub type SchedResult<T> = std::result::Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(SchedError::AdmissionRefused.errno(), EBUSY);
        assert_eq!(SchedError::NoSuchTask(Pid(4)).errno(), ESRCH);
        assert_eq!(
            SchedError::InvalidParams("x").to_string(),
            "invalid scheduling parameters: x"
        );
    }
}
