// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Realtime class
//!
//! FIFO and round-robin tasks live in a 100-level priority array per CPU:
//! a bitmap of non-empty levels plus a FIFO queue per level, so the pick
//! is a find-first-set followed by a queue head.
//!
//! Across CPUs the class keeps the highest priority runnable tasks of a
//! root domain running. A CPU with more than one RT task and at least one
//! that could run elsewhere is "overloaded"; after a switch its waiting
//! tasks are pushed to CPUs running something of lower priority (found
//! through `cpupri`), and a CPU dropping to lower priority pulls from the
//! overloaded ones. With `RT_PUSH_IPI` the pull instead starts an IPI chain
//! through the overloaded CPUs asking each to push.
//!
//! Runtime is throttled per CPU: at most `rt_runtime` of every `rt_period`
//! goes to RT tasks. A throttled runqueue keeps its tasks queued but stops
//! counting them in `nr_running` until the period timer refills it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

use bitvec::prelude::*;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::class::ClassId;
use crate::class::SchedClass;
use crate::core::Ipi;
use crate::core::SchedEvent;
use crate::core::Sched;
use crate::pelt;
use crate::prio::Policy;
use crate::prio::MAX_RT_PRIO;
use crate::rq::BalanceCallback;
use crate::task::DequeueFlags;
use crate::task::EnqueueFlags;
use crate::task::WakeFlags;
use crate::timer::TimerEvent;
use crate::timer::TimerHandle;
use crate::tunables::SchedFeatures;
use crate::types::CpuId;
use crate::types::Pid;
use crate::uclamp::UclampId;

/// Highest and next-highest queued RT priority, task numbering.
/// `MAX_RT_PRIO - 1` when there is none, the same level as fair work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighestPrio {
    pub curr: i32,
    /// Highest priority among the pushable tasks.
    pub next: i32,
}

#[derive(Debug)]
pub struct RtPrioArray {
    bitmap: BitVec<u64, Lsb0>,
    queue: Vec<VecDeque<Pid>>,
}

impl RtPrioArray {
    fn new() -> Self {
        Self {
            bitmap: bitvec![u64, Lsb0; 0; MAX_RT_PRIO as usize],
            queue: (0..MAX_RT_PRIO).map(|_| VecDeque::new()).collect(),
        }
    }

    fn push(&mut self, prio: i32, p: Pid, head: bool) {
        let q = &mut self.queue[prio as usize];
        if head {
            q.push_front(p);
        } else {
            q.push_back(p);
        }
        self.bitmap.set(prio as usize, true);
    }

    fn remove(&mut self, prio: i32, p: Pid) {
        let q = &mut self.queue[prio as usize];
        q.retain(|&x| x != p);
        if q.is_empty() {
            self.bitmap.set(prio as usize, false);
        }
    }

    fn requeue(&mut self, prio: i32, p: Pid, head: bool) {
        let q = &mut self.queue[prio as usize];
        if q.len() < 2 {
            return;
        }
        q.retain(|&x| x != p);
        if head {
            q.push_front(p);
        } else {
            q.push_back(p);
        }
    }

    pub fn first_prio(&self) -> Option<i32> {
        self.bitmap.first_one().map(|i| i as i32)
    }

    pub fn first(&self) -> Option<Pid> {
        let prio = self.first_prio()?;
        self.queue[prio as usize].front().copied()
    }

    pub fn queue(&self, prio: i32) -> &VecDeque<Pid> {
        &self.queue[prio as usize]
    }

    pub fn contains(&self, prio: i32, p: Pid) -> bool {
        self.queue[prio as usize].contains(&p)
    }
}

#[derive(Debug)]
pub struct RtRq {
    pub active: RtPrioArray,
    pub rt_nr_running: u32,
    pub rr_nr_running: u32,
    /// Queued tasks allowed on more than one CPU.
    pub rt_nr_migratory: u32,
    pub rt_nr_total: u32,
    pub highest_prio: HighestPrio,
    pub overloaded: bool,
    /// Queued, not running, migratory tasks by priority then arrival.
    pushable: BTreeSet<(i32, u64, Pid)>,
    pushable_key: BTreeMap<Pid, (i32, u64)>,
    pushable_seq: u64,

    /// RT tasks are counted in the rq's `nr_running`.
    pub rt_queued: bool,
    pub rt_time: u64,
    /// Runtime per period, `None` for unlimited.
    pub rt_runtime: Option<u64>,
    pub rt_period: u64,
    pub rt_throttled: bool,
    pub period_timer: Option<TimerHandle>,
    throttle_warned: bool,
}

impl Default for RtRq {
    fn default() -> Self {
        Self::new()
    }
}

impl RtRq {
    pub fn new() -> Self {
        Self {
            active: RtPrioArray::new(),
            rt_nr_running: 0,
            rr_nr_running: 0,
            rt_nr_migratory: 0,
            rt_nr_total: 0,
            highest_prio: HighestPrio {
                curr: MAX_RT_PRIO - 1,
                next: MAX_RT_PRIO - 1,
            },
            overloaded: false,
            pushable: BTreeSet::new(),
            pushable_key: BTreeMap::new(),
            pushable_seq: 0,
            rt_queued: false,
            rt_time: 0,
            rt_runtime: None,
            rt_period: 0,
            rt_throttled: false,
            period_timer: None,
            throttle_warned: false,
        }
    }

    pub fn has_pushable_tasks(&self) -> bool {
        !self.pushable.is_empty()
    }

    /// Pushable tasks, highest priority first.
    pub fn pushable_tasks(&self) -> impl Iterator<Item = Pid> + '_ {
        self.pushable.iter().map(|&(_, _, p)| p)
    }

    fn add_pushable(&mut self, p: Pid, prio: i32) {
        if self.pushable_key.contains_key(&p) {
            self.remove_pushable(p);
        }
        self.pushable_seq += 1;
        let seq = self.pushable_seq;
        self.pushable.insert((prio, seq, p));
        self.pushable_key.insert(p, (prio, seq));
    }

    fn remove_pushable(&mut self, p: Pid) -> bool {
        match self.pushable_key.remove(&p) {
            Some((prio, seq)) => self.pushable.remove(&(prio, seq, p)),
            None => false,
        }
    }

    pub fn bandwidth_enabled(&self) -> bool {
        matches!(self.rt_runtime, Some(r) if r < self.rt_period)
    }
}

impl Sched {
    // ---- accounting ----

    fn update_rt_rq_load_avg(&mut self, cpu: CpuId, running: bool) {
        let rq = &mut self.rqs[cpu.idx()];
        let now = rq.clock.pelt();
        pelt::update_class_signal(now, &mut rq.avg_rt, running);
    }

    pub(crate) fn update_curr_rt(&mut self, cpu: CpuId) {
        let rq = &self.rqs[cpu.idx()];
        let (curr, now) = (rq.curr, rq.clock.task());
        if self.tasks[curr].class != ClassId::Rt {
            return;
        }
        let se = &mut self.tasks[curr].se;
        let delta = now.saturating_sub(se.exec_start);
        if delta == 0 {
            return;
        }
        se.sum_exec_runtime += delta;
        se.exec_start = now;
        self.tasks[curr].stats.exec_max = self.tasks[curr].stats.exec_max.max(delta);

        if !self.rqs[cpu.idx()].rt.bandwidth_enabled() {
            return;
        }
        self.rqs[cpu.idx()].rt.rt_time += delta;
        if self.sched_rt_runtime_exceeded(cpu) {
            self.resched_curr(cpu);
        }
    }

    /// Borrow unused runtime from the other CPUs of the root domain.
    fn balance_runtime(&mut self, cpu: CpuId) {
        let rd = self.rd(cpu);
        let weight = rd.span.weight().max(1) as u64;
        let period = self.rqs[cpu.idx()].rt.rt_period;
        let Some(mut runtime) = self.rqs[cpu.idx()].rt.rt_runtime else {
            return;
        };
        for other in rd.span.cpus() {
            if other == cpu || runtime >= period {
                continue;
            }
            let rt = &self.rqs[other.idx()].rt;
            let Some(theirs) = rt.rt_runtime else {
                continue;
            };
            let spare = theirs.saturating_sub(rt.rt_time);
            if spare == 0 {
                continue;
            }
            let diff = (spare / weight).min(period - runtime);
            self.rqs[other.idx()].rt.rt_runtime = Some(theirs - diff);
            runtime += diff;
        }
        self.rqs[cpu.idx()].rt.rt_runtime = Some(runtime);
    }

    fn sched_rt_runtime_exceeded(&mut self, cpu: CpuId) -> bool {
        if self.rqs[cpu.idx()].rt.rt_throttled {
            return true;
        }
        if self.tunables.feat(SchedFeatures::RT_RUNTIME_SHARE) {
            self.balance_runtime(cpu);
        }
        let rt = &mut self.rqs[cpu.idx()].rt;
        let Some(runtime) = rt.rt_runtime else {
            return false;
        };
        if runtime >= rt.rt_period {
            return false;
        }
        if rt.rt_time <= runtime {
            return false;
        }
        if runtime == 0 {
            rt.rt_time = 0;
            return false;
        }
        rt.rt_throttled = true;
        if !rt.throttle_warned {
            rt.throttle_warned = true;
            warn!(cpu = cpu.0, "RT throttling activated");
        }
        self.dequeue_top_rt_rq(cpu);
        self.emit(SchedEvent::RtThrottled { cpu });
        true
    }

    fn dequeue_top_rt_rq(&mut self, cpu: CpuId) {
        let rt = &mut self.rqs[cpu.idx()].rt;
        if !rt.rt_queued {
            return;
        }
        rt.rt_queued = false;
        let n = rt.rt_nr_running;
        self.sub_nr_running(cpu, n);
    }

    fn enqueue_top_rt_rq(&mut self, cpu: CpuId) {
        let rt = &mut self.rqs[cpu.idx()].rt;
        if rt.rt_queued || rt.rt_throttled {
            return;
        }
        if rt.rt_nr_running > 0 {
            rt.rt_queued = true;
            let n = rt.rt_nr_running;
            self.add_nr_running(cpu, n);
        }
        self.cpufreq_update_util(cpu, 0);
    }

    fn start_rt_bandwidth(&mut self, cpu: CpuId) {
        let rt = &self.rqs[cpu.idx()].rt;
        if !rt.bandwidth_enabled() {
            return;
        }
        if let Some(h) = rt.period_timer {
            if self.timers.is_armed(h) {
                return;
            }
        }
        let expires = self.now + rt.rt_period;
        let h = self.timers.arm(TimerEvent::RtPeriod(cpu), expires, Some(cpu));
        self.rqs[cpu.idx()].rt.period_timer = Some(h);
    }

    /// Load the runtime and period from the tunables.
    pub(crate) fn init_rt_bandwidth(&mut self, cpu: CpuId) {
        let period = self.tunables.rt_period_ns();
        let runtime = self.tunables.rt_runtime_ns();
        let rt = &mut self.rqs[cpu.idx()].rt;
        rt.rt_period = period;
        rt.rt_runtime = runtime;
        if rt.rt_throttled && !matches!(runtime, Some(r) if rt.rt_time > r) {
            rt.rt_throttled = false;
            self.enqueue_top_rt_rq(cpu);
            self.emit(SchedEvent::RtUnthrottled { cpu });
        }
    }

    /// Period timer: refill runtime and unthrottle.
    pub(crate) fn rt_period_timer(&mut self, cpu: CpuId) {
        self.rqs[cpu.idx()].rt.period_timer = None;
        let rt = &mut self.rqs[cpu.idx()].rt;
        let runtime = match rt.rt_runtime {
            Some(r) if rt.bandwidth_enabled() => r,
            _ => {
                rt.rt_time = 0;
                if rt.rt_throttled {
                    rt.rt_throttled = false;
                    self.rt_unthrottle(cpu);
                }
                return;
            }
        };
        let mut unthrottle = false;
        let mut idle = true;
        if rt.rt_time > 0 {
            rt.rt_time = rt.rt_time.saturating_sub(runtime);
            if rt.rt_throttled && rt.rt_time < runtime {
                rt.rt_throttled = false;
                unthrottle = true;
            }
            idle = false;
        } else if rt.rt_nr_running > 0 {
            idle = false;
            if !rt.rt_throttled {
                unthrottle = true;
            }
        }
        if rt.rt_throttled {
            idle = false;
        }
        trace!(cpu = cpu.0, rt_time = rt.rt_time, idle, "rt period");
        if unthrottle {
            self.rt_unthrottle(cpu);
        }
        if !idle {
            self.start_rt_bandwidth(cpu);
        }
    }

    fn rt_unthrottle(&mut self, cpu: CpuId) {
        let was_queued = self.rqs[cpu.idx()].rt.rt_queued;
        self.enqueue_top_rt_rq(cpu);
        if !was_queued && self.rqs[cpu.idx()].rt.rt_queued {
            self.emit(SchedEvent::RtUnthrottled { cpu });
            self.resched_curr(cpu);
        }
    }

    // ---- the priority array ----

    fn inc_rt_prio(&mut self, cpu: CpuId, prio: i32) {
        let rq = &mut self.rqs[cpu.idx()];
        if prio < rq.rt.highest_prio.curr {
            rq.rt.highest_prio.curr = prio;
            if rq.online {
                self.rd(cpu).cpupri.set(cpu, prio);
            }
        }
    }

    fn dec_rt_prio(&mut self, cpu: CpuId, prio: i32) {
        let rq = &mut self.rqs[cpu.idx()];
        let prev = rq.rt.highest_prio.curr;
        if rq.rt.rt_nr_running > 0 {
            if prio == prev {
                rq.rt.highest_prio.curr = rq.rt.active.first_prio().unwrap_or(MAX_RT_PRIO - 1);
            }
        } else {
            rq.rt.highest_prio.curr = MAX_RT_PRIO - 1;
        }
        let curr = rq.rt.highest_prio.curr;
        if curr != prev && rq.online {
            self.rd(cpu).cpupri.set(cpu, curr);
        }
    }

    fn update_rt_migration(&mut self, cpu: CpuId) {
        let rt = &mut self.rqs[cpu.idx()].rt;
        let overload = rt.rt_nr_migratory > 0 && rt.rt_nr_total > 1;
        if overload == rt.overloaded {
            return;
        }
        rt.overloaded = overload;
        let rd = self.rd(cpu);
        if overload {
            rd.rt_set_overload(cpu);
        } else {
            rd.rt_clear_overload(cpu);
        }
    }

    fn enqueue_rt_entity(&mut self, cpu: CpuId, p: Pid, head: bool) {
        let t = &mut self.tasks[p];
        let (prio, rr, migratory) = (t.prio, t.policy == Policy::Rr, t.nr_cpus_allowed() > 1);
        t.rt.on_rq = true;
        t.rt.on_list = true;
        let rt = &mut self.rqs[cpu.idx()].rt;
        rt.active.push(prio, p, head);
        rt.rt_nr_running += 1;
        rt.rt_nr_total += 1;
        if rr {
            rt.rr_nr_running += 1;
        }
        if migratory {
            rt.rt_nr_migratory += 1;
        }
        self.inc_rt_prio(cpu, prio);
        self.update_rt_migration(cpu);

        let rt = &mut self.rqs[cpu.idx()].rt;
        if rt.rt_queued {
            self.add_nr_running(cpu, 1);
        } else {
            self.enqueue_top_rt_rq(cpu);
        }
        self.start_rt_bandwidth(cpu);
    }

    fn dequeue_rt_entity(&mut self, cpu: CpuId, p: Pid) {
        let t = &mut self.tasks[p];
        if !t.rt.on_rq {
            return;
        }
        let (prio, rr, migratory) = (t.prio, t.policy == Policy::Rr, t.nr_cpus_allowed() > 1);
        t.rt.on_rq = false;
        t.rt.on_list = false;
        let rt = &mut self.rqs[cpu.idx()].rt;
        rt.active.remove(prio, p);
        rt.rt_nr_running -= 1;
        rt.rt_nr_total -= 1;
        if rr {
            rt.rr_nr_running -= 1;
        }
        if migratory {
            rt.rt_nr_migratory -= 1;
        }
        let queued = rt.rt_queued;
        if queued {
            self.sub_nr_running(cpu, 1);
            if self.rqs[cpu.idx()].rt.rt_nr_running == 0 {
                self.rqs[cpu.idx()].rt.rt_queued = false;
            }
        }
        self.dec_rt_prio(cpu, prio);
        self.update_rt_migration(cpu);
    }

    fn enqueue_pushable_task(&mut self, cpu: CpuId, p: Pid) {
        let prio = self.tasks[p].prio;
        let rt = &mut self.rqs[cpu.idx()].rt;
        rt.add_pushable(p, prio);
        if prio < rt.highest_prio.next {
            rt.highest_prio.next = prio;
        }
    }

    fn dequeue_pushable_task(&mut self, cpu: CpuId, p: Pid) {
        let rt = &mut self.rqs[cpu.idx()].rt;
        rt.remove_pushable(p);
        rt.highest_prio.next = rt.pushable.first().map_or(MAX_RT_PRIO - 1, |&(prio, _, _)| prio);
    }

    fn requeue_task_rt(&mut self, cpu: CpuId, p: Pid, head: bool) {
        let prio = self.tasks[p].prio;
        if !self.tasks[p].rt.on_rq {
            return;
        }
        self.rqs[cpu.idx()].rt.active.requeue(prio, p, head);
    }

    // ---- placement ----

    /// With asymmetric capacities, does `cpu` satisfy the task's clamped
    /// utilization.
    fn rt_task_fits_capacity(&self, p: Pid, cpu: CpuId) -> bool {
        if !self.rd(cpu).asym_capacity() {
            return true;
        }
        let min = self.uclamp_eff_value(p, UclampId::Min) as u64;
        let max = self.uclamp_eff_value(p, UclampId::Max) as u64;
        self.rqs[cpu.idx()].cpu_capacity_orig >= min.min(max)
    }

    /// Best CPU running something of lower priority than `p`: its own CPU
    /// if that qualifies, then the closest one through the domains.
    pub(crate) fn find_lowest_rq(&self, p: Pid) -> Option<CpuId> {
        let t = &self.tasks[p];
        if t.nr_cpus_allowed() == 1 {
            return None;
        }
        let this_cpu = t.cpu;
        let rd = self.rd(this_cpu);
        let allowed = t.cpus_allowed.and(&self.active);
        let found = if rd.asym_capacity() {
            rd.cpupri
                .find_fitness(t.prio, &allowed, Some(|c: CpuId| self.rt_task_fits_capacity(p, c)))
        } else {
            rd.cpupri.find(t.prio, &allowed)
        };
        let lowest = found?;

        if lowest.has(this_cpu) {
            return Some(this_cpu);
        }
        for sd in self.domains.domains(this_cpu) {
            if !sd.flags.contains(crate::sched_domain::SdFlags::WAKE_AFFINE) {
                continue;
            }
            if sd.span.has(self.this_cpu) && lowest.has(self.this_cpu) {
                return Some(self.this_cpu);
            }
            if let Some(c) = lowest.and(&sd.span).first() {
                return Some(CpuId(c as u32));
            }
        }
        if lowest.has(self.this_cpu) {
            return Some(self.this_cpu);
        }
        lowest.first().map(|c| CpuId(c as u32))
    }

    fn select_task_rq_rt(&mut self, p: Pid, cpu: CpuId, wf: WakeFlags) -> CpuId {
        if !wf.intersects(WakeFlags::TTWU | WakeFlags::FORK) {
            return cpu;
        }
        let curr = self.rqs[cpu.idx()].curr;
        let (c, t) = (&self.tasks[curr], &self.tasks[p]);
        // Don't bounce a waking RT task off a CPU whose current RT task
        // can't move or outranks it.
        let test = c.class == ClassId::Rt && (c.nr_cpus_allowed() < 2 || c.prio <= t.prio);
        let fits = self.rt_task_fits_capacity(p, cpu);
        if !test && fits {
            return cpu;
        }
        let Some(target) = self.find_lowest_rq(p) else {
            return cpu;
        };
        if !test && !self.rt_task_fits_capacity(p, target) {
            return cpu;
        }
        if self.tasks[p].prio < self.rqs[target.idx()].rt.highest_prio.curr {
            return target;
        }
        cpu
    }

    // ---- push / pull ----

    fn task_is_running(&self, p: Pid) -> bool {
        let cpu = self.tasks[p].cpu;
        self.rqs[cpu.idx()].curr == p
    }

    /// Move one waiting task to a CPU running something lower. Returns
    /// false when nothing could be pushed.
    fn push_rt_task(&mut self, cpu: CpuId) -> bool {
        if !self.rqs[cpu.idx()].rt.overloaded {
            return false;
        }
        let Some(next) = self.rqs[cpu.idx()].rt.pushable_tasks().next() else {
            return false;
        };
        let curr = self.rqs[cpu.idx()].curr;
        // It slipped in above curr: just reschedule locally.
        if self.tasks[next].prio < self.tasks[curr].prio {
            self.resched_curr(cpu);
            return false;
        }
        if !self.tasks[next].can_migrate() {
            return false;
        }
        let Some(lowest) = self.find_lowest_rq(next) else {
            return false;
        };
        if lowest == cpu || self.rqs[lowest.idx()].rt.highest_prio.curr <= self.tasks[next].prio {
            return false;
        }
        debug!(pid = next.0, src = cpu.0, dst = lowest.0, "rt push");
        self.rqs[cpu.idx()].stats.nr_rt_push += 1;
        self.move_queued_task(cpu, next, lowest);
        self.resched_curr(lowest);
        true
    }

    pub(crate) fn push_rt_tasks(&mut self, cpu: CpuId) {
        while self.push_rt_task(cpu) {}
    }

    /// Highest priority pushable task on `src` that may run on `dst`.
    fn pick_highest_pushable_task(&self, src: CpuId, dst: CpuId) -> Option<Pid> {
        self.rqs[src.idx()]
            .rt
            .pushable_tasks()
            .find(|&p| !self.task_is_running(p) && self.tasks[p].cpus_allowed.has(dst) && self.tasks[p].can_migrate())
    }

    pub(crate) fn pull_rt_task(&mut self, this_cpu: CpuId) {
        let rd = self.rd(this_cpu);
        if rd.rt_overloaded() == 0 {
            return;
        }
        if self.tunables.feat(SchedFeatures::RT_PUSH_IPI) {
            self.tell_cpu_to_push(this_cpu);
            return;
        }
        let mut resched = false;
        for src in rd.rto_mask().cpus() {
            if src == this_cpu || !self.online.has(src) {
                continue;
            }
            let this_prio = self.rqs[this_cpu.idx()].rt.highest_prio.curr;
            if self.rqs[src.idx()].rt.highest_prio.next >= this_prio {
                continue;
            }
            let Some(p) = self.pick_highest_pushable_task(src, this_cpu) else {
                continue;
            };
            if self.tasks[p].prio >= this_prio {
                continue;
            }
            // About to run on src anyway.
            let src_curr = self.rqs[src.idx()].curr;
            if self.tasks[p].prio < self.tasks[src_curr].prio {
                continue;
            }
            debug!(pid = p.0, src = src.0, dst = this_cpu.0, "rt pull");
            self.rqs[this_cpu.idx()].stats.nr_rt_pull += 1;
            self.update_rq_clock(src);
            self.deactivate_task(src, p, DequeueFlags::NOCLOCK);
            self.notify_migrating(p);
            self.set_task_cpu(p, this_cpu);
            self.update_rq_clock(this_cpu);
            self.activate_task(this_cpu, p, EnqueueFlags::NOCLOCK);
            resched = true;
        }
        if resched {
            self.resched_curr(this_cpu);
        }
    }

    /// Start (or extend) the IPI chain asking overloaded CPUs to push.
    fn tell_cpu_to_push(&mut self, this_cpu: CpuId) {
        use std::sync::atomic::Ordering;

        let rd = self.rd(this_cpu);
        rd.rto_loop_next.fetch_add(1, Ordering::AcqRel);
        if rd.rto_cpu.load(Ordering::Acquire) >= 0 {
            return;
        }
        if let Some(cpu) = rd.rto_next_cpu() {
            self.send_ipi(cpu, Ipi::RtPush);
        }
    }

    /// One hop of the push chain.
    pub(crate) fn rto_push_irq_work(&mut self, cpu: CpuId) {
        if self.rqs[cpu.idx()].rt.has_pushable_tasks() {
            self.update_rq_clock(cpu);
            self.push_rt_tasks(cpu);
        }
        if let Some(next) = self.rd(cpu).rto_next_cpu() {
            self.send_ipi(next, Ipi::RtPush);
        }
    }

    fn rt_queue_push_tasks(&mut self, cpu: CpuId) {
        if self.rqs[cpu.idx()].rt.has_pushable_tasks() {
            self.rqs[cpu.idx()].queue_balance_callback(BalanceCallback::PushRt);
        }
    }

    fn rt_queue_pull_task(&mut self, cpu: CpuId) {
        self.rqs[cpu.idx()].queue_balance_callback(BalanceCallback::PullRt);
    }

    fn check_preempt_equal_prio(&mut self, cpu: CpuId, p: Pid) {
        let curr = self.rqs[cpu.idx()].curr;
        // curr can't move, or there is nowhere for it to go.
        if self.tasks[curr].nr_cpus_allowed() == 1 {
            return;
        }
        let rd = self.rd(cpu);
        let curr_allowed = self.tasks[curr].cpus_allowed.and(&self.active);
        if rd.cpupri.find(self.tasks[curr].prio, &curr_allowed).is_none() {
            return;
        }
        // p could go elsewhere itself.
        let p_allowed = self.tasks[p].cpus_allowed.and(&self.active);
        if self.tasks[p].nr_cpus_allowed() != 1 && rd.cpupri.find(self.tasks[p].prio, &p_allowed).is_some() {
            return;
        }
        self.requeue_task_rt(cpu, p, true);
        self.resched_curr(cpu);
    }
}

pub struct RtClass;

pub static RT_CLASS: RtClass = RtClass;

impl SchedClass for RtClass {
    fn id(&self) -> ClassId {
        ClassId::Rt
    }

    fn enqueue_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, flags: EnqueueFlags) {
        if flags.contains(EnqueueFlags::WAKEUP) {
            s.tasks[p].rt.timeout = 0;
        }
        s.enqueue_rt_entity(cpu, p, flags.contains(EnqueueFlags::HEAD));
        if s.rqs[cpu.idx()].curr != p && s.tasks[p].nr_cpus_allowed() > 1 {
            s.enqueue_pushable_task(cpu, p);
        }
    }

    fn dequeue_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, _flags: DequeueFlags) {
        s.update_curr_rt(cpu);
        s.dequeue_rt_entity(cpu, p);
        s.dequeue_pushable_task(cpu, p);
    }

    fn yield_task(&self, s: &mut Sched, cpu: CpuId) {
        let curr = s.rqs[cpu.idx()].curr;
        s.requeue_task_rt(cpu, curr, false);
    }

    fn check_preempt_curr(&self, s: &mut Sched, cpu: CpuId, p: Pid, _wf: WakeFlags) {
        let curr = s.rqs[cpu.idx()].curr;
        if s.tasks[p].prio < s.tasks[curr].prio {
            s.resched_curr(cpu);
            return;
        }
        if s.tasks[p].prio == s.tasks[curr].prio && !s.rqs[cpu.idx()].need_resched {
            s.check_preempt_equal_prio(cpu, p);
        }
    }

    fn pick_next_task(&self, s: &mut Sched, cpu: CpuId) -> Option<Pid> {
        let rt = &s.rqs[cpu.idx()].rt;
        if !rt.rt_queued {
            return None;
        }
        let p = rt.active.first()?;
        self.set_next_task(s, cpu, p, true);
        Some(p)
    }

    fn put_prev_task(&self, s: &mut Sched, cpu: CpuId, p: Pid) {
        s.update_curr_rt(cpu);
        s.update_rt_rq_load_avg(cpu, true);
        // Preempted but still queued: others may take it.
        if s.tasks[p].rt.on_rq && s.tasks[p].nr_cpus_allowed() > 1 {
            s.enqueue_pushable_task(cpu, p);
        }
    }

    fn set_next_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, first: bool) {
        let now = s.rqs[cpu.idx()].clock.task();
        s.tasks[p].se.exec_start = now;
        s.dequeue_pushable_task(cpu, p);
        if !first {
            return;
        }
        // The previous task was of another class; the RT signal only
        // decays from here.
        s.update_rt_rq_load_avg(cpu, false);
        s.rt_queue_push_tasks(cpu);
    }

    fn balance(&self, s: &mut Sched, cpu: CpuId, prev: Pid) -> bool {
        let t = &s.tasks[prev];
        if !t.rt.on_rq && s.rqs[cpu.idx()].rt.highest_prio.curr > t.prio {
            s.pull_rt_task(cpu);
        }
        let rq = &s.rqs[cpu.idx()];
        s.tasks[rq.stop].is_queued() || rq.dl.dl_nr_running > 0 || rq.rt.rt_queued
    }

    fn select_task_rq(&self, s: &mut Sched, p: Pid, prev_cpu: CpuId, wf: WakeFlags) -> CpuId {
        s.select_task_rq_rt(p, prev_cpu, wf)
    }

    fn task_woken(&self, s: &mut Sched, cpu: CpuId, p: Pid) {
        let curr = s.rqs[cpu.idx()].curr;
        let c = &s.tasks[curr];
        let t = &s.tasks[p];
        let push = curr != p
            && !s.rqs[cpu.idx()].need_resched
            && t.nr_cpus_allowed() > 1
            && matches!(c.class, ClassId::Dl | ClassId::Rt)
            && (c.nr_cpus_allowed() < 2 || c.prio <= t.prio);
        if push {
            s.push_rt_tasks(cpu);
        }
    }

    fn task_tick(&self, s: &mut Sched, cpu: CpuId, p: Pid, _queued: bool) {
        s.update_curr_rt(cpu);
        s.update_rt_rq_load_avg(cpu, true);
        s.tasks[p].rt.timeout += 1;

        if s.tasks[p].policy != Policy::Rr {
            return;
        }
        let tick = s.tunables.tick_ns();
        let t = &mut s.tasks[p];
        if t.rt.time_slice > tick {
            t.rt.time_slice -= tick;
            return;
        }
        t.rt.time_slice = s.tunables.rr_timeslice_ns();
        let prio = t.prio;
        // Requeue only if it is not alone at its level.
        if s.rqs[cpu.idx()].rt.active.queue(prio).len() > 1 {
            s.requeue_task_rt(cpu, p, false);
            s.resched_curr(cpu);
        }
    }

    fn switched_from(&self, s: &mut Sched, cpu: CpuId, p: Pid) {
        // Falling out of RT may leave room for waiting RT work elsewhere.
        if !s.tasks[p].is_queued() || s.rqs[cpu.idx()].rt.rt_nr_running > 0 {
            return;
        }
        s.rt_queue_pull_task(cpu);
    }

    fn switched_to(&self, s: &mut Sched, cpu: CpuId, p: Pid) {
        if s.rqs[cpu.idx()].curr == p {
            s.update_rt_rq_load_avg(cpu, false);
            return;
        }
        if !s.tasks[p].is_queued() {
            return;
        }
        if s.tasks[p].nr_cpus_allowed() > 1 && s.rqs[cpu.idx()].rt.overloaded {
            s.rt_queue_push_tasks(cpu);
        }
        let curr = s.rqs[cpu.idx()].curr;
        if s.tasks[p].prio < s.tasks[curr].prio && s.online.has(cpu) {
            s.resched_curr(cpu);
        }
    }

    fn prio_changed(&self, s: &mut Sched, cpu: CpuId, p: Pid, oldprio: i32) {
        if !s.tasks[p].is_queued() {
            return;
        }
        let prio = s.tasks[p].prio;
        if s.rqs[cpu.idx()].curr == p {
            // Lowered our own priority: something queued elsewhere may
            // now deserve this CPU.
            if oldprio < prio {
                s.rt_queue_pull_task(cpu);
            }
            if s.rqs[cpu.idx()].rt.highest_prio.curr < prio {
                s.resched_curr(cpu);
            }
        } else {
            let curr = s.rqs[cpu.idx()].curr;
            if prio < s.tasks[curr].prio {
                s.resched_curr(cpu);
            }
        }
    }

    fn update_curr(&self, s: &mut Sched, cpu: CpuId) {
        s.update_curr_rt(cpu);
    }

    fn rq_online(&self, s: &mut Sched, cpu: CpuId) {
        let rt = &mut s.rqs[cpu.idx()].rt;
        let (overloaded, prio) = (rt.overloaded, rt.highest_prio.curr);
        rt.rt_runtime = s.tunables.rt_runtime_ns();
        rt.rt_time = 0;
        let rd = s.rd(cpu);
        if overloaded {
            rd.rt_set_overload(cpu);
        }
        rd.cpupri.set(cpu, prio);
        if s.rqs[cpu.idx()].rt.rt_throttled {
            s.rqs[cpu.idx()].rt.rt_throttled = false;
            s.rt_unthrottle(cpu);
        }
    }

    fn rq_offline(&self, s: &mut Sched, cpu: CpuId) {
        let rd = s.rd(cpu);
        if s.rqs[cpu.idx()].rt.overloaded {
            rd.rt_clear_overload(cpu);
        }
        // Return everything lent or borrowed within the old domain.
        let runtime = s.tunables.rt_runtime_ns();
        for c in rd.span.cpus() {
            s.rqs[c.idx()].rt.rt_runtime = runtime;
        }
        rd.cpupri.set(cpu, crate::cpupri::CPUPRI_INVALID);
    }

    fn get_rr_interval(&self, s: &Sched, p: Pid) -> u64 {
        if s.tasks[p].policy == Policy::Rr {
            s.tunables.rr_timeslice_ns()
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpupri::convert_prio;
    use crate::cpupri::CPUPRI_NORMAL;
    use crate::core::SchedConfig;
    use crate::topology::TopologySpec;

    #[test]
    fn prio_array_picks_lowest_number_first() {
        let mut a = RtPrioArray::new();
        a.push(50, Pid(1), false);
        a.push(10, Pid(2), false);
        a.push(10, Pid(3), false);
        assert_eq!(a.first_prio(), Some(10));
        assert_eq!(a.first(), Some(Pid(2)));
        a.requeue(10, Pid(2), false);
        assert_eq!(a.first(), Some(Pid(3)));
        a.remove(10, Pid(2));
        a.remove(10, Pid(3));
        assert_eq!(a.first(), Some(Pid(1)));
        a.remove(50, Pid(1));
        assert_eq!(a.first_prio(), None);
    }

    #[test]
    fn head_enqueue_goes_first() {
        let mut a = RtPrioArray::new();
        a.push(5, Pid(1), false);
        a.push(5, Pid(2), true);
        assert_eq!(a.first(), Some(Pid(2)));
    }

    #[test]
    fn pushable_ordered_by_prio_then_arrival() {
        let mut rt = RtRq::new();
        rt.add_pushable(Pid(1), 20);
        rt.add_pushable(Pid(2), 10);
        rt.add_pushable(Pid(3), 20);
        let order: Vec<_> = rt.pushable_tasks().collect();
        assert_eq!(order, vec![Pid(2), Pid(1), Pid(3)]);
        assert!(rt.remove_pushable(Pid(2)));
        assert!(!rt.remove_pushable(Pid(2)));
        assert_eq!(rt.pushable_tasks().next(), Some(Pid(1)));
    }

    #[test]
    fn bandwidth_disabled_when_runtime_covers_period() {
        let mut rt = RtRq::new();
        rt.rt_period = 1_000;
        rt.rt_runtime = Some(950);
        assert!(rt.bandwidth_enabled());
        rt.rt_runtime = Some(1_000);
        assert!(!rt.bandwidth_enabled());
        rt.rt_runtime = None;
        assert!(!rt.bandwidth_enabled());
    }

    #[test]
    fn empty_rq_advertises_normal_level() {
        let rt = RtRq::new();
        assert_eq!(convert_prio(rt.highest_prio.curr), CPUPRI_NORMAL);

        let config = SchedConfig { topology: TopologySpec::flat(2), ..Default::default() };
        let s = Sched::new(config).unwrap();
        let rd = s.rd(CpuId(1));
        assert_eq!(rd.cpupri.get(CpuId(0)), CPUPRI_NORMAL);
        assert_eq!(rd.cpupri.get(CpuId(1)), CPUPRI_NORMAL);

        // Any RT task finds both idle CPUs, even the weakest one.
        let lowest = rd.cpupri.find(MAX_RT_PRIO - 2, &s.online).unwrap();
        assert!(lowest.has(CpuId(0)));
        assert!(lowest.has(CpuId(1)));
    }
}
