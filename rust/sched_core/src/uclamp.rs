// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Utilization clamping.
//!
//! A task asks for a minimum and maximum utilization. The effective value
//! is the request restricted by the task's group and then by the system
//! default. Runqueues aggregate the effective values of their runnable
//! tasks into buckets and report the max of each clamp.

use crate::core::Sched;
use crate::prio::SCHED_CAPACITY_SCALE;
use crate::types::CpuId;
use crate::types::GroupId;
use crate::types::Pid;

pub const UCLAMP_CNT: usize = 2;
pub const UCLAMP_BUCKETS: usize = 5;
pub const UCLAMP_BUCKET_DELTA: u32 = (SCHED_CAPACITY_SCALE as u32 + UCLAMP_BUCKETS as u32 / 2) / UCLAMP_BUCKETS as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UclampId {
    Min = 0,
    Max = 1,
}

impl UclampId {
    pub const ALL: [UclampId; UCLAMP_CNT] = [UclampId::Min, UclampId::Max];

    pub fn idx(self) -> usize {
        self as usize
    }
}

/// Value a clamp takes when nothing is requested.
pub fn uclamp_none(id: UclampId) -> u32 {
    match id {
        UclampId::Min => 0,
        UclampId::Max => SCHED_CAPACITY_SCALE as u32,
    }
}

pub fn bucket_id(value: u32) -> usize {
    ((value / UCLAMP_BUCKET_DELTA) as usize).min(UCLAMP_BUCKETS - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UclampSe {
    pub value: u32,
    pub bucket_id: usize,
    /// Counted in a runqueue bucket.
    pub active: bool,
    pub user_defined: bool,
}

impl UclampSe {
    pub fn new(value: u32, user_defined: bool) -> Self {
        Self {
            value,
            bucket_id: bucket_id(value),
            active: false,
            user_defined,
        }
    }

    pub fn none(id: UclampId) -> Self {
        Self::new(uclamp_none(id), false)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UclampBucket {
    /// Max clamp value of the tasks in the bucket.
    pub value: u32,
    pub tasks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UclampRq {
    pub value: u32,
    pub bucket: [UclampBucket; UCLAMP_BUCKETS],
}

impl UclampRq {
    fn new(id: UclampId) -> Self {
        Self {
            value: uclamp_none(id),
            bucket: [UclampBucket::default(); UCLAMP_BUCKETS],
        }
    }

    fn inc(&mut self, se: &UclampSe) {
        let b = &mut self.bucket[se.bucket_id];
        b.tasks += 1;
        if b.tasks == 1 || se.value > b.value {
            b.value = se.value;
        }
        if b.value > self.value {
            self.value = b.value;
        }
    }

    fn dec(&mut self, id: UclampId, se: &UclampSe) {
        let b = &mut self.bucket[se.bucket_id];
        if b.tasks == 0 {
            return;
        }
        b.tasks -= 1;
        if b.tasks > 0 || se.value < b.value {
            return;
        }
        b.value = 0;
        let max = self.bucket.iter().rev().find(|b| b.tasks > 0).map(|b| b.value);
        self.value = match (max, id) {
            (Some(v), _) => v,
            // An idle rq keeps its last max clamp so a blocked task does
            // not see a frequency spike on wakeup.
            (None, UclampId::Max) => self.value,
            (None, UclampId::Min) => uclamp_none(UclampId::Min),
        };
    }

    pub fn tasks(&self) -> u32 {
        self.bucket.iter().map(|b| b.tasks).sum()
    }
}

/// Per-runqueue clamp aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UclampRqs {
    pub clamp: [UclampRq; UCLAMP_CNT],
    /// No clamped task is runnable; max clamp is being held.
    pub idle: bool,
}

impl Default for UclampRqs {
    fn default() -> Self {
        Self {
            clamp: [UclampRq::new(UclampId::Min), UclampRq::new(UclampId::Max)],
            idle: true,
        }
    }
}

impl UclampRqs {
    pub fn value(&self, id: UclampId) -> u32 {
        self.clamp[id.idx()].value
    }

    /// Clamp `util` by the rq's aggregate and, if given, a task's effective
    /// `(min, max)` that is about to join the rq.
    pub fn util_with(&self, util: u64, task: Option<(u32, u32)>) -> u64 {
        let mut min_util = self.value(UclampId::Min);
        let mut max_util = self.value(UclampId::Max);
        if let Some((tmin, tmax)) = task {
            min_util = min_util.max(tmin);
            max_util = max_util.max(tmax);
        }
        if min_util >= max_util {
            return min_util as u64;
        }
        util.clamp(min_util as u64, max_util as u64)
    }
}

impl Sched {
    fn uclamp_default(&self, id: UclampId) -> UclampSe {
        match id {
            UclampId::Min => UclampSe::new(self.tunables.sched_util_clamp_min, false),
            UclampId::Max => UclampSe::new(self.tunables.sched_util_clamp_max, false),
        }
    }

    fn uclamp_tg_restrict(&self, pid: Pid, id: UclampId) -> UclampSe {
        let p = &self.tasks[pid];
        let req = p.uclamp_req[id.idx()];
        if p.group == GroupId::ROOT {
            return req;
        }
        let Some(tg) = self.groups.get(p.group) else {
            return req;
        };
        let tg_min = tg.uclamp[UclampId::Min.idx()].value;
        let tg_max = tg.uclamp[UclampId::Max.idx()].value;
        UclampSe::new(req.value.clamp(tg_min, tg_max.max(tg_min)), false)
    }

    /// Effective clamp of a task, ignoring whether it is currently counted.
    pub(crate) fn uclamp_eff_get(&self, pid: Pid, id: UclampId) -> UclampSe {
        let req = self.uclamp_tg_restrict(pid, id);
        let max = self.uclamp_default(id);
        if req.value > max.value {
            return max;
        }
        req
    }

    pub fn uclamp_eff_value(&self, pid: Pid, id: UclampId) -> u32 {
        let se = self.tasks[pid].uclamp[id.idx()];
        if se.active {
            return se.value;
        }
        self.uclamp_eff_get(pid, id).value
    }

    /// `(min, max)` effective clamps of a task.
    pub fn uclamp_task(&self, pid: Pid) -> (u32, u32) {
        (
            self.uclamp_eff_value(pid, UclampId::Min),
            self.uclamp_eff_value(pid, UclampId::Max),
        )
    }

    pub(crate) fn uclamp_rq_inc(&mut self, cpu: CpuId, pid: Pid) {
        if !self.tasks[pid].class.uclamp_enabled() {
            return;
        }
        for id in UclampId::ALL {
            let mut se = self.uclamp_eff_get(pid, id);
            se.active = true;
            self.tasks[pid].uclamp[id.idx()] = se;
            let uc = &mut self.rqs[cpu.idx()].uclamp;
            if uc.idle && id == UclampId::Max {
                // Drop the held idle value; the bucket max takes over.
                uc.clamp[id.idx()].value = se.value;
            }
            uc.clamp[id.idx()].inc(&se);
        }
        self.rqs[cpu.idx()].uclamp.idle = false;
    }

    pub(crate) fn uclamp_rq_dec(&mut self, cpu: CpuId, pid: Pid) {
        if !self.tasks[pid].class.uclamp_enabled() {
            return;
        }
        for id in UclampId::ALL {
            let mut se = self.tasks[pid].uclamp[id.idx()];
            if !se.active {
                continue;
            }
            self.rqs[cpu.idx()].uclamp.clamp[id.idx()].dec(id, &se);
            se.active = false;
            self.tasks[pid].uclamp[id.idx()] = se;
        }
        let uc = &mut self.rqs[cpu.idx()].uclamp;
        if uc.clamp[UclampId::Max.idx()].tasks() == 0 {
            uc.idle = true;
        }
    }

    /// Re-bucket a queued task after its requests or group limits changed.
    pub(crate) fn uclamp_update_active(&mut self, pid: Pid) {
        let p = &self.tasks[pid];
        if !p.is_queued() {
            return;
        }
        let cpu = p.cpu;
        if p.uclamp.iter().any(|se| se.active) {
            self.uclamp_rq_dec(cpu, pid);
            self.uclamp_rq_inc(cpu, pid);
        }
    }

    /// Reset requests on fork when asked to and apply the RT boost default.
    pub(crate) fn uclamp_fork(&mut self, pid: Pid) {
        let rt_default = self.tunables.sched_util_clamp_min_rt_default;
        let p = &mut self.tasks[pid];
        for se in p.uclamp.iter_mut() {
            se.active = false;
        }
        if p.reset_on_fork {
            p.uclamp_req = [UclampSe::none(UclampId::Min), UclampSe::none(UclampId::Max)];
        }
        if p.policy.is_rt() && !p.uclamp_req[UclampId::Min.idx()].user_defined {
            p.uclamp_req[UclampId::Min.idx()] = UclampSe::new(rt_default, false);
        }
    }

    /// Clamped utilization estimate used for capacity fitting.
    pub fn uclamp_task_util(&self, pid: Pid) -> u64 {
        let util = self.task_util_est(pid);
        let (min, max) = self.uclamp_task(pid);
        util.clamp(min as u64, (max as u64).max(min as u64))
    }

    pub fn uclamp_rq_util_with(&self, cpu: CpuId, util: u64, pid: Option<Pid>) -> u64 {
        let task = pid.map(|p| self.uclamp_task(p));
        self.rqs[cpu.idx()].uclamp.util_with(util, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets() {
        assert_eq!(UCLAMP_BUCKET_DELTA, 205);
        assert_eq!(bucket_id(0), 0);
        assert_eq!(bucket_id(204), 0);
        assert_eq!(bucket_id(205), 1);
        assert_eq!(bucket_id(1024), 4);
    }

    #[test]
    fn rq_aggregation_tracks_max() {
        let mut rq = UclampRqs::default();
        let a = UclampSe::new(300, true);
        let b = UclampSe::new(700, true);
        rq.clamp[0].inc(&a);
        rq.clamp[0].inc(&b);
        assert_eq!(rq.value(UclampId::Min), 700);
        rq.clamp[0].dec(UclampId::Min, &b);
        assert_eq!(rq.value(UclampId::Min), 300);
        rq.clamp[0].dec(UclampId::Min, &a);
        assert_eq!(rq.value(UclampId::Min), 0);
    }

    #[test]
    fn idle_rq_holds_max() {
        let mut rq = UclampRqs::default();
        let a = UclampSe::new(400, true);
        rq.clamp[1].value = 400;
        rq.clamp[1].inc(&a);
        rq.clamp[1].dec(UclampId::Max, &a);
        assert_eq!(rq.value(UclampId::Max), 400);
    }

    #[test]
    fn util_with_clamps() {
        let mut rq = UclampRqs::default();
        rq.clamp[0].value = 200;
        rq.clamp[1].value = 600;
        assert_eq!(rq.util_with(100, None), 200);
        assert_eq!(rq.util_with(900, None), 600);
        assert_eq!(rq.util_with(900, Some((0, 800))), 800);
        rq.clamp[0].value = 700;
        assert_eq!(rq.util_with(100, None), 700);
    }
}
