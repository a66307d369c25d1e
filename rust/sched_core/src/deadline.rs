// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Deadline class
//!
//! Earliest-deadline-first over constant bandwidth servers. Each task owns
//! `runtime` every `period`, due `deadline` after the period starts.
//! Running consumes `runtime` (scaled to the CPU's capacity and frequency);
//! when it is gone the task is throttled until a replenishment timer fires
//! at the start of its next period.
//!
//! Bandwidth is tracked at three levels:
//!
//! - the root domain's admitted total (`dl_admit`/`dl_release`),
//! - the runqueue's `this_bw`: every deadline task assigned to the CPU,
//! - the runqueue's `running_bw`: tasks that are runnable or have not yet
//!   reached their 0-lag time since blocking ("non-contending").
//!
//! A blocking task keeps contributing to `running_bw` until its 0-lag time,
//! enforced with the per-task inactive timer.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::debug;
use tracing::warn;

use crate::class::ClassId;
use crate::class::SchedClass;
use crate::clock::cap_scale;
use crate::core::SchedEvent;
use crate::core::Sched;
use crate::pelt;
use crate::root_domain::to_ratio;
use crate::root_domain::BW_SHIFT;
use crate::rq::BalanceCallback;
use crate::sched_domain::SdFlags;
use crate::task::DequeueFlags;
use crate::task::DlParams;
use crate::task::EnqueueFlags;
use crate::task::OnRq;
use crate::task::TaskState;
use crate::task::WakeFlags;
use crate::timer::TimerEvent;
use crate::tunables::SchedFeatures;
use crate::types::time_before;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::TimeNs;

/// Shift keeping the overflow check's products in range.
const DL_SCALE: u32 = 10;

/// Entities ordered by absolute deadline, FIFO among equal deadlines.
#[derive(Debug, Default)]
pub struct DlTree {
    nodes: BTreeSet<(u64, u64, Pid)>,
    keys: BTreeMap<Pid, (u64, u64)>,
    seq: u64,
}

impl DlTree {
    fn insert(&mut self, p: Pid, deadline: u64) {
        self.remove(p);
        self.seq += 1;
        self.nodes.insert((deadline, self.seq, p));
        self.keys.insert(p, (deadline, self.seq));
    }

    fn remove(&mut self, p: Pid) -> bool {
        match self.keys.remove(&p) {
            Some((dl, seq)) => self.nodes.remove(&(dl, seq, p)),
            None => false,
        }
    }

    pub fn first(&self) -> Option<(u64, Pid)> {
        self.nodes.first().map(|&(dl, _, p)| (dl, p))
    }

    pub fn contains(&self, p: Pid) -> bool {
        self.keys.contains_key(&p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, Pid)> + '_ {
        self.nodes.iter().map(|&(dl, _, p)| (dl, p))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Earliest queued and earliest pushable deadlines, 0 when none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EarliestDl {
    pub curr: u64,
    pub next: u64,
}

#[derive(Debug, Default)]
pub struct DlRq {
    pub tree: DlTree,
    pub pushable: DlTree,
    pub dl_nr_running: u32,
    pub dl_nr_migratory: u32,
    pub earliest_dl: EarliestDl,
    pub overloaded: bool,
    /// Bandwidth of the active (contending) tasks.
    pub running_bw: u64,
    /// Bandwidth of every deadline task assigned to this CPU.
    pub this_bw: u64,
}

impl DlRq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_pushable_tasks(&self) -> bool {
        !self.pushable.is_empty()
    }
}

fn dl_time_before(a: u64, b: u64) -> bool {
    time_before(a, b)
}

/// Would running `runtime` before `deadline` exceed the density
/// `dl_runtime / dl_deadline`? Both sides are scaled down first so the
/// products fit.
fn dl_entity_overflow(runtime: i64, deadline: u64, now: TimeNs, params: &DlParams) -> bool {
    let left = (params.deadline >> DL_SCALE) as u128 * ((runtime.max(0) as u64) >> DL_SCALE) as u128;
    let right = (deadline.saturating_sub(now) >> DL_SCALE) as u128 * (params.runtime >> DL_SCALE) as u128;
    right < left
}

impl Sched {
    /// Parameters the entity runs with: its own, or its PI donor's.
    fn pi_params(&self, p: Pid) -> DlParams {
        let dl = &self.tasks[p].dl;
        match dl.pi_donor {
            Some(d) if dl.dl_boosted && self.tasks.contains(d) => self.tasks[d].dl.params(),
            _ => dl.params(),
        }
    }

    pub(crate) fn setparam_dl(&mut self, p: Pid, params: DlParams) {
        let dl = &mut self.tasks[p].dl;
        dl.dl_runtime = params.runtime;
        dl.dl_deadline = params.deadline;
        dl.dl_period = params.period;
        dl.dl_bw = to_ratio(params.period, params.runtime);
        dl.dl_density = to_ratio(params.deadline, params.runtime);
    }

    // ---- bandwidth accounting ----

    fn add_running_bw(&mut self, cpu: CpuId, bw: u64) {
        let dl = &mut self.rqs[cpu.idx()].dl;
        dl.running_bw += bw;
        debug_assert!(dl.running_bw <= dl.this_bw, "running_bw above this_bw");
    }

    fn sub_running_bw(&mut self, cpu: CpuId, bw: u64) {
        let dl = &mut self.rqs[cpu.idx()].dl;
        if dl.running_bw < bw {
            debug!(cpu = cpu.0, running_bw = dl.running_bw, bw, "running_bw underflow");
        }
        dl.running_bw = dl.running_bw.saturating_sub(bw);
    }

    fn add_rq_bw(&mut self, cpu: CpuId, bw: u64) {
        self.rqs[cpu.idx()].dl.this_bw += bw;
    }

    fn sub_rq_bw(&mut self, cpu: CpuId, bw: u64) {
        let dl = &mut self.rqs[cpu.idx()].dl;
        dl.this_bw = dl.this_bw.saturating_sub(bw);
        dl.running_bw = dl.running_bw.min(dl.this_bw);
    }

    fn cancel_inactive_timer(&mut self, p: Pid) {
        if let Some(h) = self.tasks[p].dl.inactive_timer.take() {
            self.timers.cancel(h);
        }
    }

    /// Move a sleeping task's bandwidth to `new_bw` on its runqueue.
    pub(crate) fn dl_change_utilization(&mut self, p: Pid, new_bw: u64) {
        if self.tasks[p].is_queued() {
            return;
        }
        let cpu = self.tasks[p].cpu;
        let bw = self.tasks[p].dl.dl_bw;
        if self.tasks[p].dl.dl_non_contending {
            self.sub_running_bw(cpu, bw);
            self.tasks[p].dl.dl_non_contending = false;
            self.cancel_inactive_timer(p);
        }
        self.sub_rq_bw(cpu, bw);
        self.add_rq_bw(cpu, new_bw);
    }

    /// A waking task contends for bandwidth again.
    fn task_contending(&mut self, cpu: CpuId, p: Pid, flags: EnqueueFlags) {
        let dl = &self.tasks[p].dl;
        if dl.dl_runtime == 0 {
            return;
        }
        let bw = dl.dl_bw;
        if dl.dl_non_contending {
            self.tasks[p].dl.dl_non_contending = false;
            self.cancel_inactive_timer(p);
        } else {
            if flags.contains(EnqueueFlags::MIGRATED) {
                self.add_rq_bw(cpu, bw);
            }
            self.add_running_bw(cpu, bw);
        }
    }

    /// A blocking task stops contending at its 0-lag time: now if that
    /// has passed, otherwise when the inactive timer fires.
    fn task_non_contending(&mut self, cpu: CpuId, p: Pid) {
        let t = &self.tasks[p];
        let dl = &t.dl;
        if dl.inactive_timer.is_some_and(|h| self.timers.is_armed(h)) || dl.dl_runtime == 0 {
            return;
        }
        let now = self.rqs[cpu.idx()].clock.clock;
        let lag = (dl.runtime as i128 * dl.dl_period as i128) / dl.dl_runtime as i128;
        let zerolag = dl.deadline as i128 - lag;
        if zerolag <= now as i128 {
            let bw = dl.dl_bw;
            if t.policy.is_dl() {
                self.sub_running_bw(cpu, bw);
            }
            return;
        }
        self.tasks[p].dl.dl_non_contending = true;
        let h = self.timers.arm(TimerEvent::DlInactive(p), zerolag as TimeNs, None);
        self.tasks[p].dl.inactive_timer = Some(h);
    }

    /// 0-lag reached for a blocked task.
    pub(crate) fn inactive_task_timer(&mut self, p: Pid) {
        let Some(t) = self.tasks.get_mut(p) else {
            return;
        };
        t.dl.inactive_timer = None;
        if !t.dl.dl_non_contending {
            return;
        }
        t.dl.dl_non_contending = false;
        let (cpu, bw, is_dl) = (t.cpu, t.dl.dl_bw, t.policy.is_dl());
        if is_dl {
            self.sub_running_bw(cpu, bw);
        }
    }

    // ---- CBS ----

    fn setup_new_dl_entity(&mut self, cpu: CpuId, p: Pid) {
        let now = self.rqs[cpu.idx()].clock.clock;
        let pi = self.pi_params(p);
        let dl = &mut self.tasks[p].dl;
        dl.deadline = now + pi.deadline;
        dl.runtime = pi.runtime as i64;
    }

    /// Refill runtime after exhaustion, postponing the deadline a period
    /// at a time until the runtime is positive again.
    fn replenish_dl_entity(&mut self, cpu: CpuId, p: Pid) {
        let now = self.rqs[cpu.idx()].clock.clock;
        let pi = self.pi_params(p);
        let dl = &mut self.tasks[p].dl;
        if dl.dl_deadline == 0 || dl.deadline == 0 {
            dl.deadline = now + pi.deadline;
            dl.runtime = pi.runtime as i64;
        }
        if dl.dl_yielded && dl.runtime > 0 {
            dl.runtime = 0;
        }
        if pi.period > 0 && pi.runtime > 0 {
            while dl.runtime <= 0 {
                dl.deadline += pi.period;
                dl.runtime += pi.runtime as i64;
            }
        }
        // Too far behind to catch up: restart from now.
        if dl_time_before(dl.deadline, now) {
            warn!(pid = p.0, "deadline replenish lagged too much");
            dl.deadline = now + pi.deadline;
            dl.runtime = pi.runtime as i64;
        }
        dl.dl_yielded = false;
        dl.dl_throttled = false;
    }

    /// Wakeup rule: keep the current deadline unless it has passed or the
    /// remaining runtime would overrun the reserved density.
    fn update_dl_entity(&mut self, cpu: CpuId, p: Pid) {
        let now = self.rqs[cpu.idx()].clock.clock;
        let pi = self.pi_params(p);
        let dl = &mut self.tasks[p].dl;
        if !dl_time_before(dl.deadline, now) && !dl_entity_overflow(dl.runtime, dl.deadline, now, &pi) {
            return;
        }
        let implicit = dl.dl_deadline == dl.dl_period;
        if !implicit && !dl_time_before(dl.deadline, now) && !dl.dl_boosted {
            // Constrained task: trim runtime to what the density allows in
            // the time left.
            let laxity = dl.deadline - now;
            dl.runtime = ((dl.dl_density as u128 * laxity as u128) >> BW_SHIFT) as i64;
            return;
        }
        dl.deadline = now + pi.deadline;
        dl.runtime = pi.runtime as i64;
    }

    /// Start of the next period.
    fn dl_next_period(&self, p: Pid) -> TimeNs {
        let dl = &self.tasks[p].dl;
        (dl.deadline + dl.dl_period).saturating_sub(dl.dl_deadline)
    }

    /// Arm the replenishment timer for the next period. False if that
    /// moment has already passed.
    fn start_dl_timer(&mut self, p: Pid) -> bool {
        let act = self.dl_next_period(p);
        if act < self.now {
            return false;
        }
        if let Some(h) = self.tasks[p].dl.timer {
            if self.timers.is_armed(h) {
                return true;
            }
        }
        let h = self.timers.arm(TimerEvent::DlReplenish(p), act, None);
        self.tasks[p].dl.timer = Some(h);
        true
    }

    /// A constrained task woken after its deadline but before its next
    /// period waits for that period.
    fn dl_check_constrained_dl(&mut self, cpu: CpuId, p: Pid) {
        let now = self.rqs[cpu.idx()].clock.clock;
        let dl = &self.tasks[p].dl;
        if !(dl_time_before(dl.deadline, now) && dl_time_before(now, self.dl_next_period(p))) {
            return;
        }
        if dl.dl_boosted || !self.start_dl_timer(p) {
            return;
        }
        let dl = &mut self.tasks[p].dl;
        dl.dl_throttled = true;
        if dl.runtime > 0 {
            dl.runtime = 0;
        }
    }

    /// Replenishment timer.
    pub(crate) fn dl_task_timer(&mut self, p: Pid) {
        let Some(t) = self.tasks.get_mut(p) else {
            return;
        };
        t.dl.timer = None;
        if t.class != ClassId::Dl {
            t.dl.dl_throttled = false;
            return;
        }
        if !t.dl.dl_throttled || t.dl.dl_boosted {
            return;
        }
        let mut cpu = t.cpu;
        self.update_rq_clock(cpu);
        if !self.tasks[p].is_queued() {
            self.replenish_dl_entity(cpu, p);
            return;
        }
        if !self.active.has(cpu) {
            cpu = self.dl_task_offline_migration(cpu, p);
        }
        self.enqueue_task_dl(cpu, p, EnqueueFlags::REPLENISH);
        self.emit(SchedEvent::DlReplenished { pid: p });
        let curr = self.rqs[cpu.idx()].curr;
        if self.tasks[curr].class == ClassId::Dl {
            DL_CLASS.check_preempt_curr(self, cpu, p, WakeFlags::empty());
        } else {
            self.resched_curr(cpu);
        }
        if self.rqs[cpu.idx()].dl.has_pushable_tasks() {
            self.push_dl_task(cpu);
        }
    }

    /// A throttled task whose CPU went away is moved before it refills.
    fn dl_task_offline_migration(&mut self, cpu: CpuId, p: Pid) -> CpuId {
        let dest = self.select_fallback_rq(cpu, p);
        let bw = self.tasks[p].dl.dl_bw;
        self.sub_running_bw(cpu, bw);
        self.sub_rq_bw(cpu, bw);
        let (src_rd, dst_rd) = (self.rd(cpu), self.rd(dest));
        if !std::sync::Arc::ptr_eq(&src_rd, &dst_rd) {
            src_rd.dl_release(bw);
            dst_rd.dl_add_unchecked(bw);
        }
        debug!(pid = p.0, cpu = cpu.0, dest = dest.0, "throttled deadline task leaves offline cpu");
        self.tasks[p].on_rq = OnRq::Migrating;
        self.set_task_cpu(p, dest);
        self.tasks[p].on_rq = OnRq::Queued;
        self.update_rq_clock(dest);
        self.add_rq_bw(dest, bw);
        self.add_running_bw(dest, bw);
        dest
    }

    pub(crate) fn update_curr_dl(&mut self, cpu: CpuId) {
        let rq = &self.rqs[cpu.idx()];
        let (curr, now) = (rq.curr, rq.clock.task());
        let t = &self.tasks[curr];
        if t.class != ClassId::Dl || !t.dl.on_rq {
            return;
        }
        let delta = now.saturating_sub(t.se.exec_start);
        if delta == 0 {
            return;
        }
        let (cap, fs) = (rq.cpu_capacity_orig, rq.freq_scale());
        let t = &mut self.tasks[curr];
        t.se.sum_exec_runtime += delta;
        t.se.exec_start = now;
        t.stats.exec_max = t.stats.exec_max.max(delta);

        let scaled = cap_scale(cap_scale(delta, fs), cap);
        t.dl.runtime -= scaled as i64;

        let rt = &mut self.rqs[cpu.idx()].rt;
        if rt.bandwidth_enabled() {
            rt.rt_time += delta;
        }

        let dl = &self.tasks[curr].dl;
        let exceeded = dl.runtime <= 0;
        if !exceeded && !dl.dl_yielded {
            return;
        }
        let dl = &mut self.tasks[curr].dl;
        dl.dl_throttled = true;
        if exceeded && dl.dl_overrun_signal {
            dl.dl_overrun = true;
        }
        self.dequeue_dl_entity(cpu, curr);
        self.dequeue_pushable_dl_task(cpu, curr);
        let boosted = self.tasks[curr].dl.dl_boosted;
        if boosted || !self.start_dl_timer(curr) {
            self.enqueue_task_dl(cpu, curr, EnqueueFlags::REPLENISH);
        } else {
            debug!(cpu = cpu.0, pid = curr.0, "deadline task throttled");
            self.emit(SchedEvent::DlThrottled { pid: curr });
        }
        let leftmost = self.rqs[cpu.idx()].dl.tree.first().map(|(_, p)| p);
        if leftmost != Some(curr) {
            self.resched_curr(cpu);
        }
    }

    fn update_dl_rq_load_avg(&mut self, cpu: CpuId, running: bool) {
        let rq = &mut self.rqs[cpu.idx()];
        let now = rq.clock.pelt();
        pelt::update_class_signal(now, &mut rq.avg_dl, running);
    }

    fn start_hrtick_dl(&mut self, cpu: CpuId, p: Pid) {
        let runtime = self.tasks[p].dl.runtime;
        if runtime > 0 {
            self.hrtick_start(cpu, runtime as u64);
        }
    }

    // ---- the queue ----

    fn inc_dl_deadline(&mut self, cpu: CpuId, deadline: u64) {
        let rq = &mut self.rqs[cpu.idx()];
        let online = rq.online;
        let e = &mut rq.dl.earliest_dl;
        if e.curr != 0 && !dl_time_before(deadline, e.curr) {
            return;
        }
        e.curr = deadline;
        if online {
            self.rd(cpu).cpudl.set(cpu, deadline);
        }
    }

    fn dec_dl_deadline(&mut self, cpu: CpuId) {
        let rq = &mut self.rqs[cpu.idx()];
        let online = rq.online;
        let first = rq.dl.tree.first();
        match first {
            None => rq.dl.earliest_dl = EarliestDl::default(),
            Some((dl, _)) => rq.dl.earliest_dl.curr = dl,
        }
        if !online {
            return;
        }
        let rd = self.rd(cpu);
        match first {
            None => rd.cpudl.clear(cpu),
            Some((dl, _)) => rd.cpudl.set(cpu, dl),
        }
    }

    fn update_dl_migration(&mut self, cpu: CpuId) {
        let dl = &mut self.rqs[cpu.idx()].dl;
        let overload = dl.dl_nr_migratory > 0 && dl.dl_nr_running > 1;
        if overload == dl.overloaded {
            return;
        }
        dl.overloaded = overload;
        let rd = self.rd(cpu);
        if overload {
            rd.dl_set_overload(cpu);
        } else {
            rd.dl_clear_overload(cpu);
        }
    }

    fn enqueue_dl_entity(&mut self, cpu: CpuId, p: Pid, flags: EnqueueFlags) {
        if flags.contains(EnqueueFlags::WAKEUP) {
            self.task_contending(cpu, p, flags);
            self.update_dl_entity(cpu, p);
        } else if flags.contains(EnqueueFlags::REPLENISH) {
            self.replenish_dl_entity(cpu, p);
        } else if flags.contains(EnqueueFlags::RESTORE)
            && dl_time_before(self.tasks[p].dl.deadline, self.rqs[cpu.idx()].clock.clock)
        {
            self.setup_new_dl_entity(cpu, p);
        }

        let t = &mut self.tasks[p];
        let (deadline, migratory) = (t.dl.deadline, t.nr_cpus_allowed() > 1);
        t.dl.on_rq = true;
        let dl = &mut self.rqs[cpu.idx()].dl;
        dl.tree.insert(p, deadline);
        dl.dl_nr_running += 1;
        if migratory {
            dl.dl_nr_migratory += 1;
        }
        self.add_nr_running(cpu, 1);
        self.inc_dl_deadline(cpu, deadline);
        self.update_dl_migration(cpu);
    }

    fn dequeue_dl_entity(&mut self, cpu: CpuId, p: Pid) {
        let t = &mut self.tasks[p];
        if !t.dl.on_rq {
            return;
        }
        t.dl.on_rq = false;
        let migratory = t.nr_cpus_allowed() > 1;
        let dl = &mut self.rqs[cpu.idx()].dl;
        dl.tree.remove(p);
        dl.dl_nr_running -= 1;
        if migratory {
            dl.dl_nr_migratory -= 1;
        }
        self.sub_nr_running(cpu, 1);
        self.dec_dl_deadline(cpu);
        self.update_dl_migration(cpu);
    }

    fn enqueue_pushable_dl_task(&mut self, cpu: CpuId, p: Pid) {
        let deadline = self.tasks[p].dl.deadline;
        let dl = &mut self.rqs[cpu.idx()].dl;
        dl.pushable.insert(p, deadline);
        if dl.earliest_dl.next == 0 || dl_time_before(deadline, dl.earliest_dl.next) {
            dl.earliest_dl.next = deadline;
        }
    }

    fn dequeue_pushable_dl_task(&mut self, cpu: CpuId, p: Pid) {
        let dl = &mut self.rqs[cpu.idx()].dl;
        dl.pushable.remove(p);
        dl.earliest_dl.next = dl.pushable.first().map_or(0, |(d, _)| d);
    }

    fn enqueue_task_dl(&mut self, cpu: CpuId, p: Pid, flags: EnqueueFlags) {
        let t = &self.tasks[p];
        // A task boosted into the class but no longer inheriting runs out
        // its current instance unthrottled.
        if !t.dl.dl_boosted && !t.policy.is_dl() {
            self.tasks[p].dl.dl_throttled = false;
        }
        let t = &self.tasks[p];
        if !t.dl.dl_throttled && t.dl.dl_deadline != t.dl.dl_period && t.policy.is_dl() {
            self.dl_check_constrained_dl(cpu, p);
        }
        let t = &self.tasks[p];
        let bw = t.dl.dl_bw;
        if t.on_rq == OnRq::Migrating || flags.contains(EnqueueFlags::RESTORE) {
            self.add_rq_bw(cpu, bw);
            self.add_running_bw(cpu, bw);
        }
        if self.tasks[p].dl.dl_throttled && !flags.contains(EnqueueFlags::REPLENISH) {
            if flags.contains(EnqueueFlags::WAKEUP) {
                self.task_contending(cpu, p, flags);
            }
            return;
        }
        self.enqueue_dl_entity(cpu, p, flags);
        if self.rqs[cpu.idx()].curr != p && self.tasks[p].nr_cpus_allowed() > 1 {
            self.enqueue_pushable_dl_task(cpu, p);
        }
    }

    // ---- placement ----

    fn dl_task_fits_capacity(&self, p: Pid, cpu: CpuId) -> bool {
        if !self.rd(cpu).asym_capacity() {
            return true;
        }
        let dl = &self.tasks[p].dl;
        cap_scale(dl.dl_deadline, self.rqs[cpu.idx()].cpu_capacity_orig) >= dl.dl_runtime
    }

    /// A CPU whose earliest deadline is later than `p`'s, preferring
    /// free CPUs and then ones close to the task's.
    fn find_later_rq(&self, p: Pid) -> Option<CpuId> {
        let t = &self.tasks[p];
        if t.nr_cpus_allowed() == 1 {
            return None;
        }
        let this_cpu = t.cpu;
        let rd = self.rd(this_cpu);
        let allowed = t.cpus_allowed.and(&self.active);
        let later = rd.cpudl.find(&allowed, t.dl.deadline, |c| self.dl_task_fits_capacity(p, c))?;
        if later.has(this_cpu) {
            return Some(this_cpu);
        }
        for sd in self.domains.domains(this_cpu) {
            if !sd.flags.contains(SdFlags::WAKE_AFFINE) {
                continue;
            }
            if sd.span.has(self.this_cpu) && later.has(self.this_cpu) {
                return Some(self.this_cpu);
            }
            if let Some(c) = later.and(&sd.span).first() {
                return Some(CpuId(c as u32));
            }
        }
        later.first().map(|c| CpuId(c as u32))
    }

    fn later_rq_accepts(&self, p: Pid, cpu: CpuId) -> bool {
        let dl = &self.rqs[cpu.idx()].dl;
        dl.dl_nr_running == 0 || dl_time_before(self.tasks[p].dl.deadline, dl.earliest_dl.curr)
    }

    fn select_task_rq_dl(&mut self, p: Pid, cpu: CpuId, wf: WakeFlags) -> CpuId {
        if !wf.intersects(WakeFlags::TTWU | WakeFlags::FORK) {
            return cpu;
        }
        let curr = self.rqs[cpu.idx()].curr;
        let (c, t) = (&self.tasks[curr], &self.tasks[p]);
        // Don't displace a deadline task that can't move or is more urgent.
        let mut select = c.class == ClassId::Dl
            && (c.nr_cpus_allowed() < 2 || !dl_time_before(t.dl.deadline, c.dl.deadline))
            && t.nr_cpus_allowed() > 1;
        if !self.dl_task_fits_capacity(p, cpu) {
            select = true;
        }
        if !select {
            return cpu;
        }
        match self.find_later_rq(p) {
            Some(target) if self.later_rq_accepts(p, target) => target,
            _ => cpu,
        }
    }

    // ---- push / pull ----

    fn push_dl_task(&mut self, cpu: CpuId) -> bool {
        let Some((_, next)) = self.rqs[cpu.idx()].dl.pushable.first() else {
            return false;
        };
        let curr = self.rqs[cpu.idx()].curr;
        if next == curr {
            return false;
        }
        let c = &self.tasks[curr];
        if c.class == ClassId::Dl
            && dl_time_before(self.tasks[next].dl.deadline, c.dl.deadline)
            && c.nr_cpus_allowed() > 1
        {
            self.resched_curr(cpu);
            return false;
        }
        if !self.tasks[next].can_migrate() {
            return false;
        }
        let Some(later) = self.find_later_rq(next) else {
            return false;
        };
        if later == cpu || !self.later_rq_accepts(next, later) {
            return false;
        }
        debug!(pid = next.0, src = cpu.0, dst = later.0, "dl push");
        self.rqs[cpu.idx()].stats.nr_dl_push += 1;
        self.move_queued_task(cpu, next, later);
        self.resched_curr(later);
        true
    }

    pub(crate) fn push_dl_tasks(&mut self, cpu: CpuId) {
        while self.push_dl_task(cpu) {}
    }

    fn pick_earliest_pushable_dl_task(&self, src: CpuId, dst: CpuId) -> Option<Pid> {
        let curr = self.rqs[src.idx()].curr;
        self.rqs[src.idx()]
            .dl
            .pushable
            .iter()
            .map(|(_, p)| p)
            .find(|&p| p != curr && self.tasks[p].cpus_allowed.has(dst) && self.tasks[p].can_migrate())
    }

    pub(crate) fn pull_dl_task(&mut self, this_cpu: CpuId) {
        let rd = self.rd(this_cpu);
        if rd.dl_overloaded() == 0 {
            return;
        }
        let mut dmin = 0u64;
        let mut resched = false;
        for src in rd.dlo_mask().cpus() {
            if src == this_cpu || !self.online.has(src) {
                continue;
            }
            let this = &self.rqs[this_cpu.idx()].dl;
            let (this_nr, this_curr) = (this.dl_nr_running, this.earliest_dl.curr);
            if this_nr > 0 && dl_time_before(this_curr, self.rqs[src.idx()].dl.earliest_dl.next) {
                continue;
            }
            let Some(p) = self.pick_earliest_pushable_dl_task(src, this_cpu) else {
                continue;
            };
            let deadline = self.tasks[p].dl.deadline;
            if dmin != 0 && !dl_time_before(deadline, dmin) {
                continue;
            }
            if this_nr > 0 && !dl_time_before(deadline, this_curr) {
                continue;
            }
            // It would preempt src's current task; let it run there.
            let src_curr = self.rqs[src.idx()].curr;
            if self.tasks[src_curr].class == ClassId::Dl && dl_time_before(deadline, self.tasks[src_curr].dl.deadline) {
                continue;
            }
            debug!(pid = p.0, src = src.0, dst = this_cpu.0, "dl pull");
            self.rqs[this_cpu.idx()].stats.nr_dl_pull += 1;
            self.update_rq_clock(src);
            self.deactivate_task(src, p, DequeueFlags::NOCLOCK);
            self.notify_migrating(p);
            self.set_task_cpu(p, this_cpu);
            self.update_rq_clock(this_cpu);
            self.activate_task(this_cpu, p, EnqueueFlags::NOCLOCK);
            dmin = deadline;
            resched = true;
        }
        if resched {
            self.resched_curr(this_cpu);
        }
    }

    fn check_preempt_equal_dl(&mut self, cpu: CpuId, p: Pid) {
        let curr = self.rqs[cpu.idx()].curr;
        let rd = self.rd(cpu);
        let always = |_: CpuId| true;
        let c = &self.tasks[curr];
        if c.nr_cpus_allowed() == 1 || rd.cpudl.find(&c.cpus_allowed.and(&self.active), c.dl.deadline, always).is_none() {
            return;
        }
        let t = &self.tasks[p];
        if t.nr_cpus_allowed() != 1
            && rd.cpudl.find(&t.cpus_allowed.and(&self.active), t.dl.deadline, always).is_some()
        {
            return;
        }
        self.resched_curr(cpu);
    }
}

pub struct DlClass;

pub static DL_CLASS: DlClass = DlClass;

impl SchedClass for DlClass {
    fn id(&self) -> ClassId {
        ClassId::Dl
    }

    fn enqueue_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, flags: EnqueueFlags) {
        s.enqueue_task_dl(cpu, p, flags);
    }

    fn dequeue_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, flags: DequeueFlags) {
        s.update_curr_dl(cpu);
        s.dequeue_dl_entity(cpu, p);
        s.dequeue_pushable_dl_task(cpu, p);
        let bw = s.tasks[p].dl.dl_bw;
        if s.tasks[p].on_rq == OnRq::Migrating || flags.contains(DequeueFlags::SAVE) {
            s.sub_running_bw(cpu, bw);
            s.sub_rq_bw(cpu, bw);
        }
        if flags.contains(DequeueFlags::SLEEP) {
            s.task_non_contending(cpu, p);
        }
    }

    /// Give up the rest of this instance's runtime.
    fn yield_task(&self, s: &mut Sched, cpu: CpuId) {
        let curr = s.rqs[cpu.idx()].curr;
        s.tasks[curr].dl.dl_yielded = true;
        s.update_curr_dl(cpu);
        s.rqs[cpu.idx()].clock.skip_update();
    }

    fn check_preempt_curr(&self, s: &mut Sched, cpu: CpuId, p: Pid, _wf: WakeFlags) {
        let curr = s.rqs[cpu.idx()].curr;
        let (pd, cd) = (s.tasks[p].dl.deadline, s.tasks[curr].dl.deadline);
        if dl_time_before(pd, cd) {
            s.resched_curr(cpu);
            return;
        }
        if pd == cd && !s.rqs[cpu.idx()].need_resched {
            s.check_preempt_equal_dl(cpu, p);
        }
    }

    fn pick_next_task(&self, s: &mut Sched, cpu: CpuId) -> Option<Pid> {
        let (_, p) = s.rqs[cpu.idx()].dl.tree.first()?;
        self.set_next_task(s, cpu, p, true);
        Some(p)
    }

    fn put_prev_task(&self, s: &mut Sched, cpu: CpuId, p: Pid) {
        s.update_curr_dl(cpu);
        s.update_dl_rq_load_avg(cpu, true);
        if s.tasks[p].dl.on_rq && s.tasks[p].nr_cpus_allowed() > 1 {
            s.enqueue_pushable_dl_task(cpu, p);
        }
    }

    fn set_next_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, first: bool) {
        s.tasks[p].se.exec_start = s.rqs[cpu.idx()].clock.task();
        s.dequeue_pushable_dl_task(cpu, p);
        if !first {
            return;
        }
        if s.hrtick_enabled(cpu, SchedFeatures::HRTICK_DL) {
            s.start_hrtick_dl(cpu, p);
        }
        s.update_dl_rq_load_avg(cpu, false);
        if s.rqs[cpu.idx()].dl.has_pushable_tasks() {
            s.rqs[cpu.idx()].queue_balance_callback(BalanceCallback::PushDl);
        }
    }

    fn balance(&self, s: &mut Sched, cpu: CpuId, prev: Pid) -> bool {
        let t = &s.tasks[prev];
        if !t.dl.on_rq && t.class == ClassId::Dl && s.rqs[cpu.idx()].online {
            s.pull_dl_task(cpu);
        }
        let rq = &s.rqs[cpu.idx()];
        s.tasks[rq.stop].is_queued() || rq.dl.dl_nr_running > 0
    }

    fn select_task_rq(&self, s: &mut Sched, p: Pid, prev_cpu: CpuId, wf: WakeFlags) -> CpuId {
        s.select_task_rq_dl(p, prev_cpu, wf)
    }

    /// A waking task leaving its CPU takes its bandwidth along.
    fn migrate_task_rq(&self, s: &mut Sched, p: Pid, _new_cpu: CpuId) {
        if !s.tasks[p].state.contains(TaskState::WAKING) {
            return;
        }
        let cpu = s.tasks[p].cpu;
        let bw = s.tasks[p].dl.dl_bw;
        if s.tasks[p].dl.dl_non_contending {
            s.sub_running_bw(cpu, bw);
            s.tasks[p].dl.dl_non_contending = false;
            s.cancel_inactive_timer(p);
        }
        s.sub_rq_bw(cpu, bw);
    }

    fn task_woken(&self, s: &mut Sched, cpu: CpuId, p: Pid) {
        let curr = s.rqs[cpu.idx()].curr;
        let (c, t) = (&s.tasks[curr], &s.tasks[p]);
        let push = curr != p
            && !s.rqs[cpu.idx()].need_resched
            && t.nr_cpus_allowed() > 1
            && c.class == ClassId::Dl
            && (c.nr_cpus_allowed() < 2 || !dl_time_before(t.dl.deadline, c.dl.deadline));
        if push {
            s.push_dl_tasks(cpu);
        }
    }

    fn task_tick(&self, s: &mut Sched, cpu: CpuId, p: Pid, queued: bool) {
        s.update_curr_dl(cpu);
        s.update_dl_rq_load_avg(cpu, true);
        let leftmost = s.rqs[cpu.idx()].dl.tree.first().map(|(_, q)| q) == Some(p);
        if queued && leftmost && s.hrtick_enabled(cpu, SchedFeatures::HRTICK_DL) {
            s.start_hrtick_dl(cpu, p);
        }
    }

    fn task_dead(&self, s: &mut Sched, p: Pid) {
        let t = &s.tasks[p];
        if !t.policy.is_dl() {
            return;
        }
        let (cpu, bw) = (t.cpu, t.dl.dl_bw);
        if t.dl.dl_non_contending {
            s.sub_running_bw(cpu, bw);
            s.tasks[p].dl.dl_non_contending = false;
        }
        s.sub_rq_bw(cpu, bw);
        s.rd(cpu).dl_release(bw);
        debug!(pid = p.0, bw, "released deadline bandwidth");
    }

    fn switched_from(&self, s: &mut Sched, cpu: CpuId, p: Pid) {
        if let Some(h) = s.tasks[p].dl.timer.take() {
            s.timers.cancel(h);
        }
        let dl = &mut s.tasks[p].dl;
        dl.dl_throttled = false;
        dl.dl_yielded = false;
        if dl.dl_non_contending {
            dl.dl_non_contending = false;
            s.cancel_inactive_timer(p);
        }
        if !s.tasks[p].is_queued() || s.rqs[cpu.idx()].dl.dl_nr_running > 0 {
            return;
        }
        s.rqs[cpu.idx()].queue_balance_callback(BalanceCallback::PullDl);
    }

    fn switched_to(&self, s: &mut Sched, cpu: CpuId, p: Pid) {
        s.cancel_inactive_timer(p);
        s.tasks[p].dl.dl_non_contending = false;
        if !s.tasks[p].is_queued() {
            let bw = s.tasks[p].dl.dl_bw;
            s.add_rq_bw(cpu, bw);
            return;
        }
        if s.rqs[cpu.idx()].curr == p {
            s.update_dl_rq_load_avg(cpu, false);
            return;
        }
        if s.tasks[p].nr_cpus_allowed() > 1 && s.rqs[cpu.idx()].dl.overloaded {
            s.rqs[cpu.idx()].queue_balance_callback(BalanceCallback::PushDl);
        }
        let curr = s.rqs[cpu.idx()].curr;
        if s.tasks[curr].class == ClassId::Dl {
            self.check_preempt_curr(s, cpu, p, WakeFlags::empty());
        } else {
            s.resched_curr(cpu);
        }
    }

    fn prio_changed(&self, s: &mut Sched, cpu: CpuId, p: Pid, _oldprio: i32) {
        if !s.tasks[p].is_queued() {
            return;
        }
        let deadline = s.tasks[p].dl.deadline;
        if s.rqs[cpu.idx()].curr == p {
            if !s.rqs[cpu.idx()].dl.overloaded {
                s.rqs[cpu.idx()].queue_balance_callback(BalanceCallback::PullDl);
            }
            let earliest = s.rqs[cpu.idx()].dl.earliest_dl.curr;
            if earliest != 0 && dl_time_before(earliest, deadline) {
                s.resched_curr(cpu);
            }
        } else {
            let curr = s.rqs[cpu.idx()].curr;
            if s.tasks[curr].class != ClassId::Dl || dl_time_before(deadline, s.tasks[curr].dl.deadline) {
                s.resched_curr(cpu);
            }
        }
    }

    fn update_curr(&self, s: &mut Sched, cpu: CpuId) {
        s.update_curr_dl(cpu);
    }

    fn rq_online(&self, s: &mut Sched, cpu: CpuId) {
        let rd = s.rd(cpu);
        let dl = &s.rqs[cpu.idx()].dl;
        if dl.overloaded {
            rd.dl_set_overload(cpu);
        }
        if dl.dl_nr_running > 0 {
            rd.cpudl.set(cpu, dl.earliest_dl.curr);
        }
    }

    fn rq_offline(&self, s: &mut Sched, cpu: CpuId) {
        let rd = s.rd(cpu);
        if s.rqs[cpu.idx()].dl.overloaded {
            rd.dl_clear_overload(cpu);
        }
        rd.cpudl.clear(cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NSEC_PER_MSEC;

    #[test]
    fn tree_orders_by_deadline_then_arrival() {
        let mut t = DlTree::default();
        t.insert(Pid(1), 300);
        t.insert(Pid(2), 100);
        t.insert(Pid(3), 100);
        assert_eq!(t.first(), Some((100, Pid(2))));
        t.insert(Pid(2), 400);
        assert_eq!(t.first(), Some((100, Pid(3))));
        assert!(t.remove(Pid(3)));
        assert!(!t.remove(Pid(3)));
        let order: Vec<_> = t.iter().map(|(_, p)| p).collect();
        assert_eq!(order, vec![Pid(1), Pid(2)]);
    }

    #[test]
    fn overflow_check_uses_density() {
        let ms = NSEC_PER_MSEC;
        let params = DlParams {
            runtime: 10 * ms,
            deadline: 100 * ms,
            period: 100 * ms,
        };
        // 10ms left with 100ms to go: exactly the reserved density.
        assert!(!dl_entity_overflow((10 * ms) as i64, 100 * ms, 0, &params));
        // 10ms left but only 50ms to go: twice the density.
        assert!(dl_entity_overflow((10 * ms) as i64, 100 * ms, 50 * ms, &params));
        // Exhausted runtime never overflows.
        assert!(!dl_entity_overflow(-5, 100 * ms, 90 * ms, &params));
    }
}
