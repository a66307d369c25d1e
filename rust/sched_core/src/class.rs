// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Scheduling classes
//!
//! The class stack is closed and strictly ordered:
//!
//! ```text
//!   stop > deadline > realtime > fair > idle
//! ```
//!
//! Every class implements `SchedClass`. The dispatch layer never inspects
//! class internals; it walks `ClassId::ALL` in order and calls through
//! `class()`.

use crate::core::Sched;
use crate::deadline::DL_CLASS;
use crate::fair::FAIR_CLASS;
use crate::idle::IDLE_CLASS;
use crate::prio::dl_prio;
use crate::prio::rt_prio;
use crate::rt::RT_CLASS;
use crate::stop::STOP_CLASS;
use crate::task::DequeueFlags;
use crate::task::EnqueueFlags;
use crate::task::TaskKind;
use crate::task::WakeFlags;
use crate::types::CpuId;
use crate::types::Pid;

/// Class identifiers in priority order: `a < b` means `a` runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClassId {
    Stop,
    Dl,
    Rt,
    Fair,
    Idle,
}

impl ClassId {
    pub const ALL: [ClassId; 5] = [ClassId::Stop, ClassId::Dl, ClassId::Rt, ClassId::Fair, ClassId::Idle];

    pub fn name(self) -> &'static str {
        match self {
            ClassId::Stop => "stop",
            ClassId::Dl => "dl",
            ClassId::Rt => "rt",
            ClassId::Fair => "fair",
            ClassId::Idle => "idle",
        }
    }

    /// Class a task belongs to given its kind and effective priority.
    pub fn for_task(kind: TaskKind, prio: i32) -> ClassId {
        match kind {
            TaskKind::Stop => ClassId::Stop,
            TaskKind::Idle => ClassId::Idle,
            TaskKind::Normal if dl_prio(prio) => ClassId::Dl,
            TaskKind::Normal if rt_prio(prio) => ClassId::Rt,
            TaskKind::Normal => ClassId::Fair,
        }
    }

    pub fn above(self, other: ClassId) -> bool {
        self < other
    }

    /// Participates in utilization clamping.
    pub fn uclamp_enabled(self) -> bool {
        matches!(self, ClassId::Rt | ClassId::Fair)
    }
}

/// Operations every class provides. Methods take the whole scheduler so
/// a class can reach the runqueue, the task table and shared state; the
/// class itself is stateless.
pub trait SchedClass: Sync {
    fn id(&self) -> ClassId;

    fn enqueue_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, flags: EnqueueFlags);
    fn dequeue_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, flags: DequeueFlags);
    fn yield_task(&self, _s: &mut Sched, _cpu: CpuId) {}

    /// A task of this class became runnable on `cpu`; decide whether the
    /// current task should be preempted.
    fn check_preempt_curr(&self, s: &mut Sched, cpu: CpuId, p: Pid, wf: WakeFlags);

    fn pick_next_task(&self, s: &mut Sched, cpu: CpuId) -> Option<Pid>;
    fn put_prev_task(&self, s: &mut Sched, cpu: CpuId, p: Pid);
    fn set_next_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, first: bool);

    /// Pull work before picking. Returns true if this class or a higher
    /// one has something runnable afterwards.
    fn balance(&self, _s: &mut Sched, _cpu: CpuId, _prev: Pid) -> bool {
        false
    }

    fn select_task_rq(&self, s: &mut Sched, p: Pid, prev_cpu: CpuId, wf: WakeFlags) -> CpuId;
    fn migrate_task_rq(&self, _s: &mut Sched, _p: Pid, _new_cpu: CpuId) {}
    fn task_woken(&self, _s: &mut Sched, _cpu: CpuId, _p: Pid) {}

    fn task_tick(&self, s: &mut Sched, cpu: CpuId, p: Pid, queued: bool);
    fn task_fork(&self, _s: &mut Sched, _p: Pid) {}
    fn task_dead(&self, _s: &mut Sched, _p: Pid) {}

    fn switched_from(&self, _s: &mut Sched, _cpu: CpuId, _p: Pid) {}
    fn switched_to(&self, _s: &mut Sched, _cpu: CpuId, _p: Pid) {}
    fn prio_changed(&self, _s: &mut Sched, _cpu: CpuId, _p: Pid, _oldprio: i32) {}

    fn update_curr(&self, _s: &mut Sched, _cpu: CpuId) {}
    fn set_cpus_allowed(&self, _s: &mut Sched, _p: Pid) {}
    fn rq_online(&self, _s: &mut Sched, _cpu: CpuId) {}
    fn rq_offline(&self, _s: &mut Sched, _cpu: CpuId) {}
    fn task_change_group(&self, _s: &mut Sched, _p: Pid) {}

    fn get_rr_interval(&self, _s: &Sched, _p: Pid) -> u64 {
        0
    }
}

pub fn class(id: ClassId) -> &'static dyn SchedClass {
    match id {
        ClassId::Stop => &STOP_CLASS,
        ClassId::Dl => &DL_CLASS,
        ClassId::Rt => &RT_CLASS,
        ClassId::Fair => &FAIR_CLASS,
        ClassId::Idle => &IDLE_CLASS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_order_and_mapping() {
        assert!(ClassId::Stop.above(ClassId::Dl));
        assert!(ClassId::Dl.above(ClassId::Rt));
        assert!(ClassId::Rt.above(ClassId::Fair));
        assert!(ClassId::Fair.above(ClassId::Idle));
        assert_eq!(ClassId::for_task(TaskKind::Normal, -1), ClassId::Dl);
        assert_eq!(ClassId::for_task(TaskKind::Normal, 49), ClassId::Rt);
        assert_eq!(ClassId::for_task(TaskKind::Normal, 120), ClassId::Fair);
        assert_eq!(ClassId::for_task(TaskKind::Stop, 120), ClassId::Stop);
        for id in ClassId::ALL {
            assert_eq!(class(id).id(), id);
        }
    }
}
