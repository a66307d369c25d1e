// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Policy and priority changes.
//!
//! Every change follows the same protocol: validate, admit deadline
//! bandwidth, then take the task off its runqueue (and off the CPU if it
//! is running), apply the new parameters, put it back and let the old and
//! new classes react. Validation and admission happen before anything is
//! touched, so a refused change leaves the task exactly as it was.

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::class::class;
use crate::class::ClassId;
use crate::core::Sched;
use crate::error::SchedError;
use crate::error::SchedResult;
use crate::prio::nice_to_prio;
use crate::prio::normal_prio;
use crate::prio::LoadWeight;
use crate::prio::Policy;
use crate::prio::MAX_NICE;
use crate::prio::MAX_USER_RT_PRIO;
use crate::prio::MIN_NICE;
use crate::root_domain::to_ratio;
use crate::task::DequeueFlags;
use crate::task::DlParams;
use crate::task::EnqueueFlags;
use crate::task::TaskKind;
use crate::types::CpuId;
use crate::types::EntityRef;
use crate::types::Pid;
use crate::types::NSEC_PER_USEC;
use crate::uclamp::UclampId;
use crate::uclamp::UclampSe;

/// Smallest deadline runtime accepted, ns.
pub const DL_MIN_RUNTIME: u64 = 1 << 10;
/// Period bounds for deadline tasks.
pub const DL_PERIOD_MIN: u64 = 100 * NSEC_PER_USEC;
pub const DL_PERIOD_MAX: u64 = (1 << 22) * NSEC_PER_USEC;

/// Requested scheduling attributes for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedAttr {
    pub policy: Policy,
    pub nice: i32,
    pub rt_priority: u32,
    pub dl_runtime: u64,
    pub dl_deadline: u64,
    /// 0 means equal to the deadline.
    pub dl_period: u64,
    pub reset_on_fork: bool,
    /// Ask to be notified on runtime overrun.
    pub dl_overrun: bool,
    /// Leave policy and priority alone; only apply the clamps.
    pub keep_params: bool,
    pub util_min: Option<u32>,
    pub util_max: Option<u32>,
}

impl SchedAttr {
    pub fn normal(nice: i32) -> Self {
        Self {
            nice,
            ..Default::default()
        }
    }

    pub fn batch(nice: i32) -> Self {
        Self {
            policy: Policy::Batch,
            nice,
            ..Default::default()
        }
    }

    pub fn idle() -> Self {
        Self {
            policy: Policy::Idle,
            ..Default::default()
        }
    }

    pub fn fifo(rt_priority: u32) -> Self {
        Self {
            policy: Policy::Fifo,
            rt_priority,
            ..Default::default()
        }
    }

    pub fn rr(rt_priority: u32) -> Self {
        Self {
            policy: Policy::Rr,
            rt_priority,
            ..Default::default()
        }
    }

    pub fn deadline(runtime: u64, deadline: u64, period: u64) -> Self {
        Self {
            policy: Policy::Deadline,
            dl_runtime: runtime,
            dl_deadline: deadline,
            dl_period: period,
            ..Default::default()
        }
    }

    fn dl_params(&self) -> DlParams {
        DlParams {
            runtime: self.dl_runtime,
            deadline: self.dl_deadline,
            period: if self.dl_period == 0 { self.dl_deadline } else { self.dl_period },
        }
    }
}

/// Deadline parameters must satisfy `1024ns <= runtime <= deadline <= period`.
pub fn check_dl_params(a: &SchedAttr) -> SchedResult<()> {
    let p = a.dl_params();
    if p.deadline == 0 {
        return Err(SchedError::InvalidParams("deadline must be non-zero"));
    }
    if p.runtime < DL_MIN_RUNTIME {
        return Err(SchedError::InvalidParams("runtime below 1024ns"));
    }
    if p.deadline & (1 << 63) != 0 || p.period & (1 << 63) != 0 {
        return Err(SchedError::InvalidParams("deadline parameters overflow"));
    }
    if p.runtime > p.deadline || p.deadline > p.period {
        return Err(SchedError::InvalidParams("need runtime <= deadline <= period"));
    }
    if p.period < DL_PERIOD_MIN || p.period > DL_PERIOD_MAX {
        return Err(SchedError::InvalidParams("period out of range"));
    }
    Ok(())
}

fn check_attr(a: &SchedAttr) -> SchedResult<()> {
    if a.policy == Policy::Stop {
        return Err(SchedError::InvalidParams("policy not settable"));
    }
    if a.policy.is_rt() {
        if a.rt_priority < 1 || a.rt_priority > MAX_USER_RT_PRIO {
            return Err(SchedError::InvalidParams("rt priority must be 1..=99"));
        }
    } else if a.rt_priority != 0 {
        return Err(SchedError::InvalidParams("rt priority only valid for rt policies"));
    }
    if a.policy.is_fair() && !(MIN_NICE..=MAX_NICE).contains(&a.nice) {
        return Err(SchedError::InvalidParams("nice out of range"));
    }
    if a.policy.is_dl() {
        check_dl_params(a)?;
    }
    let min = a.util_min.unwrap_or(0);
    let max = a.util_max.unwrap_or(1024);
    if min > 1024 || max > 1024 {
        return Err(SchedError::InvalidParams("util clamp above 1024"));
    }
    if a.util_min.is_some() && a.util_max.is_some() && min > max {
        return Err(SchedError::InvalidParams("util_min above util_max"));
    }
    Ok(())
}

impl Sched {
    /// Take `p` off its CPU, let `f` change its parameters, then requeue it
    /// and notify the classes involved.
    pub(crate) fn sched_change<F>(&mut self, p: Pid, f: F)
    where
        F: FnOnce(&mut Sched),
    {
        let cpu = self.tasks[p].cpu;
        self.update_rq_clock(cpu);
        let queued = self.tasks[p].is_queued();
        let running = self.rqs[cpu.idx()].curr == p;
        let old_class = self.tasks[p].class;
        let old_prio = self.tasks[p].prio;

        if queued {
            self.dequeue_task(cpu, p, DequeueFlags::SAVE | DequeueFlags::MOVE | DequeueFlags::NOCLOCK);
        }
        if running {
            self.put_prev_task(cpu, p);
        }

        f(self);
        let t = &mut self.tasks[p];
        t.class = ClassId::for_task(t.kind, t.prio);
        let new_class = t.class;

        if queued {
            let mut flags = EnqueueFlags::RESTORE | EnqueueFlags::NOCLOCK;
            if old_prio < self.tasks[p].prio {
                flags |= EnqueueFlags::HEAD;
            }
            self.enqueue_task(cpu, p, flags);
        }
        if running {
            self.set_next_task(cpu, p);
        }

        if old_class != new_class {
            class(old_class).switched_from(self, cpu, p);
            class(new_class).switched_to(self, cpu, p);
        } else if old_prio != self.tasks[p].prio {
            class(new_class).prio_changed(self, cpu, p, old_prio);
        }
        self.run_balance_callbacks(cpu);
    }

    /// Effective priority once a PI donor is taken into account.
    fn effective_prio(&self, p: Pid) -> i32 {
        let t = &self.tasks[p];
        match t.pi_top_task.and_then(|d| self.tasks.get(d)) {
            Some(d) if d.prio < t.normal_prio => d.prio,
            _ => t.normal_prio,
        }
    }

    pub fn sched_setscheduler(&mut self, p: Pid, policy: Policy, rt_priority: u32) -> SchedResult<()> {
        let nice = self.tasks.get(p).map(|t| t.nice()).ok_or(SchedError::NoSuchTask(p))?;
        let attr = SchedAttr {
            policy,
            rt_priority,
            nice,
            ..Default::default()
        };
        self.sched_setattr(p, &attr)
    }

    pub fn sched_setattr(&mut self, p: Pid, attr: &SchedAttr) -> SchedResult<()> {
        let Some(t) = self.tasks.get(p) else {
            return Err(SchedError::NoSuchTask(p));
        };
        if t.kind != TaskKind::Normal {
            return Err(SchedError::InvalidParams("per-cpu helper tasks are immutable"));
        }
        if t.is_dead() {
            return Err(SchedError::NoSuchTask(p));
        }
        check_attr(attr)?;

        let uclamp_only = attr.keep_params;
        if !uclamp_only && attr.policy.is_dl() && !self.dl_affinity_covers_rd(p) {
            return Err(SchedError::InvalidParams("deadline task affinity must span its root domain"));
        }
        if !uclamp_only {
            self.sched_dl_overflow(p, attr)?;
        }

        let attr = *attr;
        self.sched_change(p, move |s| {
            if !uclamp_only {
                s.setscheduler_params(p, &attr);
                let prio = s.effective_prio(p);
                s.tasks[p].prio = prio;
            }
            s.setscheduler_uclamp(p, &attr);
        });
        let t = &self.tasks[p];
        debug!(pid = p.0, policy = ?t.policy, prio = t.prio, "policy changed");
        Ok(())
    }

    fn setscheduler_params(&mut self, p: Pid, attr: &SchedAttr) {
        let t = &mut self.tasks[p];
        t.policy = attr.policy;
        t.reset_on_fork = attr.reset_on_fork;
        if attr.policy.is_fair() {
            t.static_prio = nice_to_prio(attr.nice);
        }
        t.rt_priority = attr.rt_priority;
        t.normal_prio = normal_prio(t.policy, t.static_prio, t.rt_priority);
        t.se.load = LoadWeight::for_prio(t.policy, t.static_prio);
        if attr.policy.is_dl() {
            let params = attr.dl_params();
            let overrun = attr.dl_overrun;
            self.setparam_dl(p, params);
            self.tasks[p].dl.dl_overrun_signal = overrun;
        }
    }

    fn setscheduler_uclamp(&mut self, p: Pid, attr: &SchedAttr) {
        let rt_default = self.tunables.sched_util_clamp_min_rt_default;
        let t = &mut self.tasks[p];
        // Non user-defined min clamps follow the class default.
        if !t.uclamp_req[UclampId::Min.idx()].user_defined {
            let v = if t.policy.is_rt() { rt_default } else { 0 };
            t.uclamp_req[UclampId::Min.idx()] = UclampSe::new(v, false);
        }
        if let Some(v) = attr.util_min {
            t.uclamp_req[UclampId::Min.idx()] = UclampSe::new(v, true);
        }
        if let Some(v) = attr.util_max {
            t.uclamp_req[UclampId::Max.idx()] = UclampSe::new(v, true);
        }
    }

    /// Admit, resize or release deadline bandwidth for a policy change.
    fn sched_dl_overflow(&mut self, p: Pid, attr: &SchedAttr) -> SchedResult<()> {
        let t = &self.tasks[p];
        let was_dl = t.policy.is_dl();
        let old_bw = if was_dl { t.dl.dl_bw } else { 0 };
        let new_bw = if attr.policy.is_dl() {
            let d = attr.dl_params();
            to_ratio(d.period, d.runtime)
        } else {
            0
        };
        if was_dl && attr.policy.is_dl() && new_bw == old_bw {
            return Ok(());
        }
        let rd = self.rd(t.cpu);
        if attr.policy.is_dl() {
            if let Err(e) = rd.dl_admit(old_bw, new_bw) {
                debug!(pid = p.0, new_bw, "deadline admission refused");
                return Err(e);
            }
            if was_dl {
                self.dl_change_utilization(p, new_bw);
            }
        } else if was_dl {
            rd.dl_release(old_bw);
            self.dl_change_utilization(p, 0);
        }
        Ok(())
    }

    fn dl_affinity_covers_rd(&self, p: Pid) -> bool {
        let t = &self.tasks[p];
        let rd = self.rd(t.cpu);
        rd.span.is_subset(&t.cpus_allowed)
    }

    pub fn sched_getattr(&self, p: Pid) -> SchedResult<SchedAttr> {
        let t = self.tasks.get(p).ok_or(SchedError::NoSuchTask(p))?;
        let mut a = SchedAttr {
            policy: t.policy,
            reset_on_fork: t.reset_on_fork,
            util_min: Some(t.uclamp_req[UclampId::Min.idx()].value),
            util_max: Some(t.uclamp_req[UclampId::Max.idx()].value),
            ..Default::default()
        };
        match t.policy {
            Policy::Fifo | Policy::Rr => a.rt_priority = t.rt_priority,
            Policy::Deadline => {
                a.dl_runtime = t.dl.dl_runtime;
                a.dl_deadline = t.dl.dl_deadline;
                a.dl_period = t.dl.dl_period;
                a.dl_overrun = t.dl.dl_overrun_signal;
            }
            _ => a.nice = t.nice(),
        }
        Ok(a)
    }

    /// Change the nice value of a fair task. A queued entity is reweighted
    /// in place.
    pub fn set_user_nice(&mut self, p: Pid, nice: i32) -> SchedResult<()> {
        let t = self.tasks.get(p).ok_or(SchedError::NoSuchTask(p))?;
        if !(MIN_NICE..=MAX_NICE).contains(&nice) {
            return Err(SchedError::InvalidParams("nice out of range"));
        }
        if t.nice() == nice || t.kind != TaskKind::Normal {
            return Ok(());
        }
        let cpu = t.cpu;
        // RT and DL tasks only remember the value.
        if t.policy.is_rt() || t.policy.is_dl() {
            self.tasks[p].static_prio = nice_to_prio(nice);
            return Ok(());
        }
        self.update_rq_clock(cpu);
        let old_prio = self.tasks[p].prio;
        let static_prio = nice_to_prio(nice);
        let weight = LoadWeight::for_prio(self.tasks[p].policy, static_prio);
        {
            let t = &mut self.tasks[p];
            t.static_prio = static_prio;
            t.normal_prio = normal_prio(t.policy, static_prio, t.rt_priority);
        }
        let prio = self.effective_prio(p);
        self.tasks[p].prio = prio;
        if self.tasks[p].is_queued() {
            self.reweight_entity(cpu, EntityRef::Task(p), weight);
            let chain = self.entity_chain(cpu, EntityRef::Task(p));
            for e in chain.into_iter().skip(1) {
                self.update_cfs_group(cpu, e);
            }
        } else {
            self.tasks[p].se.load = weight;
        }
        let id = self.tasks[p].class;
        class(id).prio_changed(self, cpu, p, old_prio);
        Ok(())
    }

    /// Give up the CPU to another task of the same class, if any.
    pub fn sched_yield(&mut self, cpu: CpuId) -> Pid {
        self.this_cpu = cpu;
        self.update_rq_clock(cpu);
        self.rqs[cpu.idx()].stats.yld_count += 1;
        let curr = self.rqs[cpu.idx()].curr;
        let id = self.tasks[curr].class;
        class(id).yield_task(self, cpu);
        self.rqs[cpu.idx()].need_resched = true;
        self.preempt_check(cpu)
    }

    pub fn sched_rr_get_interval(&self, p: Pid) -> SchedResult<u64> {
        let t = self.tasks.get(p).ok_or(SchedError::NoSuchTask(p))?;
        Ok(class(t.class).get_rr_interval(self, p))
    }

    /// Priority inheritance: run `p` at `donor`'s priority while the donor
    /// waits on it. `None` drops the boost.
    pub fn set_pi_donor(&mut self, p: Pid, donor: Option<Pid>) -> SchedResult<()> {
        if !self.tasks.contains(p) {
            return Err(SchedError::NoSuchTask(p));
        }
        if let Some(d) = donor {
            if !self.tasks.contains(d) || d == p {
                return Err(SchedError::NoSuchTask(d));
            }
        }
        self.sched_change(p, move |s| {
            s.tasks[p].pi_top_task = donor;
            let prio = s.effective_prio(p);
            let dl_donor = donor.filter(|&d| s.tasks[d].class == ClassId::Dl && s.tasks[d].prio <= prio);
            let t = &mut s.tasks[p];
            t.prio = prio;
            t.dl.pi_donor = dl_donor;
            t.dl.dl_boosted = dl_donor.is_some();
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dl_param_validation() {
        let ms = 1_000_000;
        assert!(check_dl_params(&SchedAttr::deadline(10 * ms, 30 * ms, 100 * ms)).is_ok());
        assert!(check_dl_params(&SchedAttr::deadline(10 * ms, 30 * ms, 0)).is_ok());
        assert!(check_dl_params(&SchedAttr::deadline(512, 30 * ms, 100 * ms)).is_err());
        assert!(check_dl_params(&SchedAttr::deadline(40 * ms, 30 * ms, 100 * ms)).is_err());
        assert!(check_dl_params(&SchedAttr::deadline(10 * ms, 300 * ms, 100 * ms)).is_err());
        assert!(check_dl_params(&SchedAttr::deadline(10 * ms, 0, 100 * ms)).is_err());
    }

    #[test]
    fn attr_validation() {
        assert!(check_attr(&SchedAttr::fifo(50)).is_ok());
        assert!(check_attr(&SchedAttr::fifo(0)).is_err());
        assert!(check_attr(&SchedAttr::rr(100)).is_err());
        assert!(check_attr(&SchedAttr::normal(20)).is_err());
        let mut a = SchedAttr::normal(0);
        a.rt_priority = 3;
        assert!(check_attr(&a).is_err());
        let mut a = SchedAttr::normal(0);
        a.util_min = Some(800);
        a.util_max = Some(200);
        assert!(check_attr(&a).is_err());
    }
}
