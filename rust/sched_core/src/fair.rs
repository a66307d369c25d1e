// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Fair class
//!
//! Entities are ordered by vruntime on a per-group timeline. A runnable
//! task sits on the timeline of its group's runqueue on its CPU; each
//! non-root group is represented one level up by a group entity, down to
//! the root runqueue. Picking descends from the root, taking the best
//! entity at each level until it reaches a task.
//!
//! vruntime is kept relative (min_vruntime subtracted) while an entity is
//! off a runqueue for anything other than sleep, so it can be re-based on
//! whichever runqueue it is enqueued on next.

use std::collections::BTreeMap;
use std::collections::HashMap;

use tracing::trace;

use crate::class::ClassId;
use crate::class::SchedClass;
use crate::core::Sched;
use crate::fair_load::UpdateFlags;
use crate::pelt::SchedAvg;
use crate::prio::calc_delta;
use crate::prio::calc_delta_fair;
use crate::prio::LoadWeight;
use crate::prio::Policy;
use crate::prio::NICE_0_LOAD;
use crate::task::DequeueFlags;
use crate::task::EnqueueFlags;
use crate::task::OnRq;
use crate::task::SchedEntity;
use crate::task::TaskState;
use crate::task::WakeFlags;
use crate::timer::TimerEvent;
use crate::tunables::SchedFeatures;
use crate::types::CpuId;
use crate::types::EntityRef;
use crate::types::GroupId;
use crate::types::Pid;
use crate::types::TimeNs;
use crate::types::Vtime;
use crate::types::NSEC_PER_USEC;

/// Load removed from a runqueue by entities that migrated away while
/// sleeping; folded in at the next update of the runqueue.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemovedLoad {
    pub nr: u32,
    pub load_avg: u64,
    pub util_avg: u64,
    pub runnable_avg: u64,
}

#[derive(Debug, Clone)]
pub struct CfsRq {
    pub group: GroupId,
    pub load: LoadWeight,
    /// Entities queued directly on this runqueue.
    pub nr_running: u32,
    /// Tasks queued anywhere below, throttled subtrees excluded.
    pub h_nr_running: u32,
    pub idle_nr_running: u32,
    pub idle_h_nr_running: u32,
    pub exec_clock: u64,
    pub min_vruntime: Vtime,
    timeline: BTreeMap<(Vtime, EntityRef), ()>,
    nodes: HashMap<EntityRef, Vtime>,
    pub curr: Option<EntityRef>,
    pub next: Option<EntityRef>,
    pub last: Option<EntityRef>,
    pub skip: Option<EntityRef>,

    pub avg: SchedAvg,
    pub removed: RemovedLoad,
    /// Load last published into the group's aggregate.
    pub tg_load_avg_contrib: u64,
    pub propagate: bool,
    pub prop_runnable_sum: i64,
    pub h_load: u64,
    pub on_list: bool,

    pub runtime_enabled: bool,
    pub runtime_remaining: i64,
    pub throttled: bool,
    /// Throttled ancestors including this runqueue.
    pub throttle_count: u32,
    pub throttled_clock: TimeNs,
    pub throttled_clock_pelt: TimeNs,
    pub throttled_clock_pelt_time: TimeNs,
    pub throttled_clock_self: TimeNs,
    pub throttled_clock_self_time: TimeNs,
}

impl CfsRq {
    pub fn new(group: GroupId) -> Self {
        Self {
            group,
            load: LoadWeight::default(),
            nr_running: 0,
            h_nr_running: 0,
            idle_nr_running: 0,
            idle_h_nr_running: 0,
            exec_clock: 0,
            // Start close to wrap so wrapping comparisons get exercised.
            min_vruntime: Vtime((-(1i64 << 20)) as u64),
            timeline: BTreeMap::new(),
            nodes: HashMap::new(),
            curr: None,
            next: None,
            last: None,
            skip: None,
            avg: SchedAvg::default(),
            removed: RemovedLoad::default(),
            tg_load_avg_contrib: 0,
            propagate: false,
            prop_runnable_sum: 0,
            h_load: 0,
            on_list: false,
            runtime_enabled: false,
            runtime_remaining: 0,
            throttled: false,
            throttle_count: 0,
            throttled_clock: 0,
            throttled_clock_pelt: 0,
            throttled_clock_pelt_time: 0,
            throttled_clock_self: 0,
            throttled_clock_self_time: 0,
        }
    }

    fn insert(&mut self, e: EntityRef, vruntime: Vtime) {
        debug_assert!(!self.nodes.contains_key(&e), "{e:?} already on timeline");
        self.timeline.insert((vruntime, e), ());
        self.nodes.insert(e, vruntime);
    }

    fn erase(&mut self, e: EntityRef) -> bool {
        match self.nodes.remove(&e) {
            Some(v) => {
                self.timeline.remove(&(v, e));
                true
            }
            None => false,
        }
    }

    /// Leftmost entity on the timeline; `curr` is not on it.
    pub fn first(&self) -> Option<EntityRef> {
        self.timeline.keys().next().map(|(_, e)| *e)
    }

    pub fn last_entity(&self) -> Option<EntityRef> {
        self.timeline.keys().next_back().map(|(_, e)| *e)
    }

    pub fn next_after(&self, e: EntityRef) -> Option<EntityRef> {
        let v = *self.nodes.get(&e)?;
        self.timeline
            .range((std::ops::Bound::Excluded((v, e)), std::ops::Bound::Unbounded))
            .next()
            .map(|((_, e), _)| *e)
    }

    pub fn in_tree(&self, e: EntityRef) -> bool {
        self.nodes.contains_key(&e)
    }

    /// Timeline entities with the vruntime they were keyed with, leftmost
    /// first.
    pub fn queued(&self) -> impl Iterator<Item = (Vtime, EntityRef)> + '_ {
        self.timeline.keys().copied()
    }

    pub fn is_throttled_hierarchy(&self) -> bool {
        self.throttle_count > 0
    }
}

/// Distance in vruntime beyond which `curr` yields to `se`: -1 if `curr`
/// is not ahead, 1 if it is ahead by more than `gran`, else 0.
pub fn wakeup_preempt_entity(curr_vr: Vtime, se_vr: Vtime, gran: u64) -> i32 {
    let vdiff = curr_vr.diff(se_vr);
    if vdiff <= 0 {
        return -1;
    }
    if vdiff as u64 > gran {
        return 1;
    }
    0
}

fn policy_rank(policy: Policy) -> u8 {
    match policy {
        Policy::Idle => 0,
        Policy::Batch => 1,
        _ => 2,
    }
}

impl Sched {
    pub(crate) fn se(&self, cpu: CpuId, e: EntityRef) -> &SchedEntity {
        match e {
            EntityRef::Task(p) => &self.tasks[p].se,
            EntityRef::Group(g) => &self.rqs[cpu.idx()].group_se[&g],
        }
    }

    pub(crate) fn se_mut(&mut self, cpu: CpuId, e: EntityRef) -> &mut SchedEntity {
        match e {
            EntityRef::Task(p) => &mut self.tasks[p].se,
            EntityRef::Group(g) => match self.rqs[cpu.idx()].group_se.get_mut(&g) {
                Some(se) => se,
                None => panic!("no entity for group {g} on cpu {cpu}"),
            },
        }
    }

    pub fn cfs_rq(&self, cpu: CpuId, g: GroupId) -> &CfsRq {
        &self.rqs[cpu.idx()].cfs_rqs[&g]
    }

    pub(crate) fn cfs_mut(&mut self, cpu: CpuId, g: GroupId) -> &mut CfsRq {
        match self.rqs[cpu.idx()].cfs_rqs.get_mut(&g) {
            Some(c) => c,
            None => panic!("no runqueue for group {g} on cpu {cpu}"),
        }
    }

    /// `e` followed by each ancestor group entity up to the root level.
    pub(crate) fn entity_chain(&self, cpu: CpuId, e: EntityRef) -> Vec<EntityRef> {
        let mut chain = vec![e];
        let mut cur = e;
        while let Some(parent) = self.se(cpu, cur).parent() {
            chain.push(parent);
            cur = parent;
        }
        chain
    }

    fn se_is_idle(&self, e: EntityRef) -> bool {
        match e {
            EntityRef::Task(p) => self.tasks[p].policy == Policy::Idle,
            EntityRef::Group(g) => self.groups.get(g).map(|tg| tg.idle).unwrap_or(false),
        }
    }

    pub(crate) fn cfs_rq_is_idle(&self, g: GroupId) -> bool {
        !g.is_root() && self.groups.get(g).map(|tg| tg.idle).unwrap_or(false)
    }

    /// Charge runtime to the running entity of one runqueue level.
    pub(crate) fn update_curr_fair(&mut self, cpu: CpuId, g: GroupId) {
        let now = self.rqs[cpu.idx()].clock.task();
        let Some(curr) = self.cfs_rq(cpu, g).curr else {
            return;
        };
        let se = self.se_mut(cpu, curr);
        let delta = now.wrapping_sub(se.exec_start) as i64;
        if delta <= 0 {
            return;
        }
        let delta = delta as u64;
        se.exec_start = now;
        se.sum_exec_runtime += delta;
        let vdelta = calc_delta_fair(delta, &se.load);
        se.vruntime = Vtime(se.vruntime.0.wrapping_add(vdelta));
        self.cfs_mut(cpu, g).exec_clock += delta;
        self.update_min_vruntime(cpu, g);

        if let EntityRef::Task(pid) = curr {
            let st = &mut self.tasks[pid].stats;
            st.exec_max = st.exec_max.max(delta);
        }
        self.account_cfs_rq_runtime(cpu, g, delta);
    }

    pub(crate) fn update_min_vruntime(&mut self, cpu: CpuId, g: GroupId) {
        let cfs = self.cfs_rq(cpu, g);
        let (curr, left, old) = (cfs.curr, cfs.first(), cfs.min_vruntime);
        let mut vruntime = old;
        let mut have_curr = false;
        if let Some(c) = curr {
            let se = self.se(cpu, c);
            if se.on_rq {
                vruntime = se.vruntime;
                have_curr = true;
            }
        }
        if let Some(l) = left {
            let lv = self.se(cpu, l).vruntime;
            vruntime = if have_curr { vruntime.min(lv) } else { lv };
        }
        self.cfs_mut(cpu, g).min_vruntime = old.max(vruntime);
    }

    fn sched_period(&self, nr_running: u64) -> u64 {
        if nr_running > self.tunables.nr_latency() {
            nr_running * self.tunables.min_granularity()
        } else {
            self.tunables.latency()
        }
    }

    /// Wall-time slice of `e`: its weighted share of the latency period at
    /// each level of the hierarchy.
    pub(crate) fn sched_slice(&self, cpu: CpuId, e: EntityRef) -> u64 {
        let nr = self.rqs[cpu.idx()].cfs().h_nr_running as u64;
        let on_rq = self.se(cpu, e).on_rq;
        let mut slice = self.sched_period(nr + !on_rq as u64);
        for x in self.entity_chain(cpu, e) {
            let se = self.se(cpu, x);
            let mut load = self.cfs_rq(cpu, se.cfs_rq).load;
            if !se.on_rq {
                load.add(se.load.weight);
            }
            slice = calc_delta(slice, se.load.weight, &mut load);
        }
        slice.max(self.tunables.min_granularity())
    }

    fn sched_vslice(&self, cpu: CpuId, e: EntityRef) -> u64 {
        calc_delta_fair(self.sched_slice(cpu, e), &self.se(cpu, e).load)
    }

    fn entity_is_long_sleeper(&self, cpu: CpuId, e: EntityRef) -> bool {
        let se = self.se(cpu, e);
        if se.exec_start == 0 {
            return false;
        }
        let now = self.rqs[cpu.idx()].clock.task();
        if now <= se.exec_start {
            return false;
        }
        now - se.exec_start > (1u64 << 63) / NICE_0_LOAD
    }

    pub(crate) fn place_entity(&mut self, cpu: CpuId, g: GroupId, e: EntityRef, initial: bool) {
        let mut vruntime = self.cfs_rq(cpu, g).min_vruntime;
        if initial && self.tunables.feat(SchedFeatures::START_DEBIT) {
            vruntime = Vtime(vruntime.0.wrapping_add(self.sched_vslice(cpu, e)));
        }
        if !initial {
            let mut thresh = self.tunables.latency();
            if self.tunables.feat(SchedFeatures::GENTLE_FAIR_SLEEPERS) {
                thresh >>= 1;
            }
            vruntime = Vtime(vruntime.0.wrapping_sub(thresh));
        }
        let long_sleeper = self.entity_is_long_sleeper(cpu, e);
        let se = self.se_mut(cpu, e);
        se.vruntime = if long_sleeper { vruntime } else { se.vruntime.max(vruntime) };
    }

    /// Wakeup granularity in vruntime units for entity `e`.
    fn wakeup_gran(&self, cpu: CpuId, e: EntityRef) -> u64 {
        let w = self.se(cpu, e).load.weight;
        let scaled = self.tunables.wakeup_granularity() * w / NICE_0_LOAD;
        scaled.max(self.tunables.min_granularity())
    }

    fn preempt_entity(&self, cpu: CpuId, curr: EntityRef, se: EntityRef) -> i32 {
        wakeup_preempt_entity(
            self.se(cpu, curr).vruntime,
            self.se(cpu, se).vruntime,
            self.wakeup_gran(cpu, se),
        )
    }

    fn account_entity_enqueue(&mut self, cpu: CpuId, g: GroupId, e: EntityRef) {
        let w = self.se(cpu, e).load.weight;
        let idle = self.se_is_idle(e);
        let cfs = self.cfs_mut(cpu, g);
        cfs.load.add(w);
        cfs.nr_running += 1;
        if idle {
            cfs.idle_nr_running += 1;
        }
        if let EntityRef::Task(p) = e {
            self.rqs[cpu.idx()].cfs_tasks.push_front(p);
        }
    }

    fn account_entity_dequeue(&mut self, cpu: CpuId, g: GroupId, e: EntityRef) {
        let w = self.se(cpu, e).load.weight;
        let idle = self.se_is_idle(e);
        let cfs = self.cfs_mut(cpu, g);
        cfs.load.sub(w);
        cfs.nr_running -= 1;
        if idle {
            cfs.idle_nr_running -= 1;
        }
        if let EntityRef::Task(p) = e {
            self.rqs[cpu.idx()].cfs_tasks.retain(|&t| t != p);
        }
    }

    pub(crate) fn se_update_runnable(&mut self, cpu: CpuId, e: EntityRef) {
        if let EntityRef::Group(g) = e {
            let h = self.cfs_rq(cpu, g).h_nr_running as u64;
            self.se_mut(cpu, e).runnable_weight = h;
        }
    }

    pub(crate) fn enqueue_entity(&mut self, cpu: CpuId, g: GroupId, e: EntityRef, flags: EnqueueFlags) {
        let renorm = !flags.contains(EnqueueFlags::WAKEUP) || flags.contains(EnqueueFlags::MIGRATED);
        let is_curr = self.cfs_rq(cpu, g).curr == Some(e);

        // Re-base before update_curr so the running entity's vruntime is
        // comparable with min_vruntime when it is updated.
        if renorm && is_curr {
            let min = self.cfs_rq(cpu, g).min_vruntime;
            let se = self.se_mut(cpu, e);
            se.vruntime = Vtime(se.vruntime.0.wrapping_add(min.0));
        }
        self.update_curr_fair(cpu, g);
        if renorm && !is_curr {
            let min = self.cfs_rq(cpu, g).min_vruntime;
            let se = self.se_mut(cpu, e);
            se.vruntime = Vtime(se.vruntime.0.wrapping_add(min.0));
        }

        self.update_load_avg(cpu, g, e, UpdateFlags::UPDATE_TG | UpdateFlags::DO_ATTACH);
        self.se_update_runnable(cpu, e);
        self.update_cfs_group(cpu, e);
        self.account_entity_enqueue(cpu, g, e);

        if flags.contains(EnqueueFlags::WAKEUP) {
            self.place_entity(cpu, g, e, false);
        }
        if let EntityRef::Task(p) = e {
            if !is_curr {
                let now = self.rqs[cpu.idx()].clock.wall();
                self.tasks[p].stats.wait_begin(now);
            }
        }
        if !is_curr {
            let vr = self.se(cpu, e).vruntime;
            self.cfs_mut(cpu, g).insert(e, vr);
        }
        self.se_mut(cpu, e).on_rq = true;

        if self.cfs_rq(cpu, g).nr_running == 1 {
            self.cfs_mut(cpu, g).on_list = true;
            self.check_enqueue_throttle(cpu, g);
        }
    }

    fn clear_buddies(&mut self, cpu: CpuId, e: EntityRef) {
        for x in self.entity_chain(cpu, e) {
            let g = self.se(cpu, x).cfs_rq;
            let cfs = self.cfs_mut(cpu, g);
            let mut hit = false;
            for slot in [&mut cfs.next, &mut cfs.last, &mut cfs.skip] {
                if *slot == Some(x) {
                    *slot = None;
                    hit = true;
                }
            }
            if !hit {
                break;
            }
        }
    }

    pub(crate) fn dequeue_entity(&mut self, cpu: CpuId, g: GroupId, e: EntityRef, flags: DequeueFlags) {
        self.update_curr_fair(cpu, g);
        self.update_load_avg(cpu, g, e, UpdateFlags::UPDATE_TG);
        self.se_update_runnable(cpu, e);

        if let EntityRef::Task(p) = e {
            let now = self.rqs[cpu.idx()].clock.wall();
            let sleep = flags.contains(DequeueFlags::SLEEP);
            let st = &mut self.tasks[p].stats;
            if st.wait_start != 0 {
                st.wait_end(now);
            }
            if sleep {
                st.sleep_start = now;
            }
        }

        self.clear_buddies(cpu, e);
        if self.cfs_rq(cpu, g).curr != Some(e) {
            self.cfs_mut(cpu, g).erase(e);
        }
        self.se_mut(cpu, e).on_rq = false;
        self.account_entity_dequeue(cpu, g, e);

        if !flags.contains(DequeueFlags::SLEEP) {
            let min = self.cfs_rq(cpu, g).min_vruntime;
            let se = self.se_mut(cpu, e);
            se.vruntime = Vtime(se.vruntime.0.wrapping_sub(min.0));
        }

        self.return_cfs_rq_runtime(cpu, g);
        self.update_cfs_group(cpu, e);

        // A save-only dequeue is followed by a re-enqueue on this runqueue
        // and must not move min_vruntime past the entity.
        if flags & (DequeueFlags::SAVE | DequeueFlags::MOVE) != DequeueFlags::SAVE {
            self.update_min_vruntime(cpu, g);
        }
    }

    pub(crate) fn enqueue_task_fair(&mut self, cpu: CpuId, p: Pid, mut flags: EnqueueFlags) {
        let idle_policy = self.tasks[p].policy == Policy::Idle;
        let mut idle_h = idle_policy as u32;
        let task_new = flags.contains(EnqueueFlags::INITIAL);

        self.util_est_enqueue(cpu, p);
        if self.tasks[p].in_iowait {
            self.cpufreq_update_util(cpu, crate::cpufreq::SCHED_CPUFREQ_IOWAIT);
        }

        let mut enqueuing = true;
        let mut throttled = false;
        for e in self.entity_chain(cpu, EntityRef::Task(p)) {
            let g = self.se(cpu, e).cfs_rq;
            if enqueuing && self.se(cpu, e).on_rq {
                enqueuing = false;
            }
            if enqueuing {
                self.enqueue_entity(cpu, g, e, flags);
                flags = EnqueueFlags::WAKEUP;
            } else {
                self.update_load_avg(cpu, g, e, UpdateFlags::UPDATE_TG);
                self.se_update_runnable(cpu, e);
                self.update_cfs_group(cpu, e);
            }
            let cfs = self.cfs_mut(cpu, g);
            cfs.h_nr_running += 1;
            cfs.idle_h_nr_running += idle_h;
            if self.cfs_rq_is_idle(g) {
                idle_h = 1;
            }
            if self.cfs_rq(cpu, g).throttled {
                throttled = true;
                break;
            }
        }

        if !throttled {
            self.add_nr_running(cpu, 1);
            if !task_new {
                self.update_overutilized_status(cpu);
            }
        }
        self.hrtick_update(cpu);
    }

    pub(crate) fn dequeue_task_fair(&mut self, cpu: CpuId, p: Pid, mut flags: DequeueFlags) {
        let task_sleep = flags.contains(DequeueFlags::SLEEP);
        let idle_policy = self.tasks[p].policy == Policy::Idle;
        let mut idle_h = idle_policy as u32;
        let was_sched_idle = self.sched_idle_rq(cpu);

        self.util_est_dequeue(cpu, p);

        let mut dequeuing = true;
        let mut throttled = false;
        let chain = self.entity_chain(cpu, EntityRef::Task(p));
        for (i, &e) in chain.iter().enumerate() {
            let g = self.se(cpu, e).cfs_rq;
            if dequeuing {
                self.dequeue_entity(cpu, g, e, flags);
            } else {
                self.update_load_avg(cpu, g, e, UpdateFlags::UPDATE_TG);
                self.se_update_runnable(cpu, e);
                self.update_cfs_group(cpu, e);
            }
            let cfs = self.cfs_mut(cpu, g);
            cfs.h_nr_running -= 1;
            cfs.idle_h_nr_running = cfs.idle_h_nr_running.saturating_sub(idle_h);
            if self.cfs_rq_is_idle(g) {
                idle_h = 1;
            }
            if self.cfs_rq(cpu, g).throttled {
                throttled = true;
                break;
            }
            // Stop dequeueing once a level still has other entities.
            if dequeuing && self.cfs_rq(cpu, g).load.weight != 0 {
                dequeuing = false;
                if let Some(&parent) = chain.get(i + 1) {
                    if task_sleep && !self.cfs_rq(cpu, g).is_throttled_hierarchy() {
                        self.set_next_buddy(cpu, parent);
                    }
                }
            }
            flags |= DequeueFlags::SLEEP;
        }

        if !throttled {
            self.sub_nr_running(cpu, 1);
            if !was_sched_idle && self.sched_idle_rq(cpu) {
                self.rqs[cpu.idx()].next_balance = self.jiffies;
            }
        }
        self.util_est_update(cpu, p, task_sleep);
        self.hrtick_update(cpu);
    }

    /// Only idle-policy fair tasks are runnable here.
    pub(crate) fn sched_idle_rq(&self, cpu: CpuId) -> bool {
        let rq = &self.rqs[cpu.idx()];
        rq.nr_running > 0 && rq.nr_running == rq.cfs().idle_h_nr_running
    }

    fn set_buddy(&mut self, cpu: CpuId, e: EntityRef, which: fn(&mut CfsRq) -> &mut Option<EntityRef>) {
        for x in self.entity_chain(cpu, e) {
            if self.se_is_idle(x) {
                return;
            }
            let g = self.se(cpu, x).cfs_rq;
            *which(self.cfs_mut(cpu, g)) = Some(x);
        }
    }

    pub(crate) fn set_next_buddy(&mut self, cpu: CpuId, e: EntityRef) {
        self.set_buddy(cpu, e, |c| &mut c.next)
    }

    fn set_last_buddy(&mut self, cpu: CpuId, e: EntityRef) {
        self.set_buddy(cpu, e, |c| &mut c.last)
    }

    fn set_skip_buddy(&mut self, cpu: CpuId, e: EntityRef) {
        for x in self.entity_chain(cpu, e) {
            let g = self.se(cpu, x).cfs_rq;
            self.cfs_mut(cpu, g).skip = Some(x);
        }
    }

    fn entity_before(&self, cpu: CpuId, a: EntityRef, b: EntityRef) -> bool {
        self.se(cpu, a).vruntime < self.se(cpu, b).vruntime
    }

    /// Best entity of one runqueue level. `curr` is the level's running
    /// entity if it is still queued.
    fn pick_next_entity(&self, cpu: CpuId, g: GroupId, curr: Option<EntityRef>) -> Option<EntityRef> {
        let cfs = self.cfs_rq(cpu, g);
        let mut left = cfs.first();
        if let Some(c) = curr {
            if left.map_or(true, |l| self.entity_before(cpu, c, l)) {
                left = Some(c);
            }
        }
        let left = left?;
        let mut se = left;

        if cfs.skip == Some(se) {
            let mut second = if Some(se) == curr { cfs.first() } else { cfs.next_after(se) };
            if let Some(c) = curr {
                if Some(se) != curr && second.map_or(true, |s| self.entity_before(cpu, c, s)) {
                    second = Some(c);
                }
            }
            if let Some(s) = second {
                if self.preempt_entity(cpu, s, left) < 1 {
                    se = s;
                }
            }
        }

        if let Some(n) = cfs.next.filter(|&n| self.preempt_entity(cpu, n, left) < 1) {
            se = n;
        } else if let Some(l) = cfs.last.filter(|&l| self.preempt_entity(cpu, l, left) < 1) {
            se = l;
        }
        Some(se)
    }

    fn set_next_entity(&mut self, cpu: CpuId, g: GroupId, e: EntityRef) {
        if self.se(cpu, e).on_rq {
            if let EntityRef::Task(p) = e {
                let now = self.rqs[cpu.idx()].clock.wall();
                let st = &mut self.tasks[p].stats;
                if st.wait_start != 0 {
                    st.wait_end(now);
                }
            }
            self.cfs_mut(cpu, g).erase(e);
            self.update_load_avg(cpu, g, e, UpdateFlags::UPDATE_TG);
        }
        let now = self.rqs[cpu.idx()].clock.task();
        let se = self.se_mut(cpu, e);
        se.exec_start = now;
        se.prev_sum_exec_runtime = se.sum_exec_runtime;
        self.cfs_mut(cpu, g).curr = Some(e);
    }

    fn put_prev_entity(&mut self, cpu: CpuId, g: GroupId, e: EntityRef) {
        let on_rq = self.se(cpu, e).on_rq;
        if on_rq {
            self.update_curr_fair(cpu, g);
        }
        self.check_cfs_rq_runtime(cpu, g);
        // check_cfs_rq_runtime may have throttled and dequeued `e`.
        if self.se(cpu, e).on_rq {
            if let EntityRef::Task(p) = e {
                let now = self.rqs[cpu.idx()].clock.wall();
                self.tasks[p].stats.wait_begin(now);
            }
            let vr = self.se(cpu, e).vruntime;
            self.cfs_mut(cpu, g).insert(e, vr);
            self.update_load_avg(cpu, g, e, UpdateFlags::empty());
        }
        self.cfs_mut(cpu, g).curr = None;
    }

    pub(crate) fn pick_next_task_fair(&mut self, cpu: CpuId) -> Option<Pid> {
        if self.rqs[cpu.idx()].cfs().nr_running == 0 {
            return None;
        }
        let mut g = GroupId::ROOT;
        let pid = loop {
            let Some(e) = self.pick_next_entity(cpu, g, None) else {
                debug_assert!(g.is_root(), "empty group runqueue {g} queued on cpu {cpu}");
                return None;
            };
            self.set_next_entity(cpu, g, e);
            match e {
                EntityRef::Task(p) => break p,
                EntityRef::Group(child) => g = child,
            }
        };
        self.finish_set_next_fair(cpu, pid);
        Some(pid)
    }

    fn finish_set_next_fair(&mut self, cpu: CpuId, p: Pid) {
        let rq = &mut self.rqs[cpu.idx()];
        if let Some(pos) = rq.cfs_tasks.iter().position(|&t| t == p) {
            rq.cfs_tasks.remove(pos);
            rq.cfs_tasks.push_front(p);
        }
        if self.hrtick_enabled(cpu, SchedFeatures::HRTICK) {
            self.hrtick_start_fair(cpu, p);
        }
        self.update_misfit_status(cpu, Some(p));
    }

    pub(crate) fn put_prev_task_fair(&mut self, cpu: CpuId, p: Pid) {
        for e in self.entity_chain(cpu, EntityRef::Task(p)) {
            let g = self.se(cpu, e).cfs_rq;
            self.put_prev_entity(cpu, g, e);
        }
    }

    pub(crate) fn set_next_task_fair(&mut self, cpu: CpuId, p: Pid, _first: bool) {
        for e in self.entity_chain(cpu, EntityRef::Task(p)) {
            let g = self.se(cpu, e).cfs_rq;
            self.set_next_entity(cpu, g, e);
            self.account_cfs_rq_runtime(cpu, g, 0);
        }
        self.finish_set_next_fair(cpu, p);
    }

    /// Bring two entities to a common runqueue by walking the deeper one up.
    fn find_matching_se(&self, cpu: CpuId, mut a: EntityRef, mut b: EntityRef) -> (EntityRef, EntityRef) {
        let mut da = self.se(cpu, a).depth;
        let mut db = self.se(cpu, b).depth;
        while da > db {
            a = self.se(cpu, a).parent().unwrap_or(a);
            da -= 1;
        }
        while db > da {
            b = self.se(cpu, b).parent().unwrap_or(b);
            db -= 1;
        }
        while self.se(cpu, a).cfs_rq != self.se(cpu, b).cfs_rq {
            match (self.se(cpu, a).parent(), self.se(cpu, b).parent()) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                _ => break,
            }
        }
        (a, b)
    }

    pub(crate) fn check_preempt_wakeup(&mut self, cpu: CpuId, p: Pid, wf: WakeFlags) {
        let curr = self.rqs[cpu.idx()].curr;
        if curr == p {
            return;
        }
        let pse = EntityRef::Task(p);
        let pgroup = self.tasks[p].se.cfs_rq;
        if self.cfs_rq(cpu, pgroup).is_throttled_hierarchy() {
            return;
        }
        let mut next_buddy_marked = false;
        if self.tunables.feat(SchedFeatures::NEXT_BUDDY) && !wf.contains(WakeFlags::FORK) {
            self.set_next_buddy(cpu, pse);
            next_buddy_marked = true;
        }
        if self.rqs[cpu.idx()].need_resched {
            return;
        }
        let curr_policy = self.tasks[curr].policy;
        let p_policy = self.tasks[p].policy;
        let preempt = if policy_rank(p_policy) > policy_rank(curr_policy) {
            true
        } else if p_policy != Policy::Normal || !self.tunables.feat(SchedFeatures::WAKEUP_PREEMPTION) {
            return;
        } else {
            let (se, pse) = self.find_matching_se(cpu, EntityRef::Task(curr), pse);
            let g = self.se(cpu, se).cfs_rq;
            self.update_curr_fair(cpu, g);
            if self.preempt_entity(cpu, se, pse) == 1 {
                if !next_buddy_marked {
                    self.set_next_buddy(cpu, pse);
                }
                true
            } else {
                false
            }
        };
        if !preempt {
            return;
        }
        trace!(cpu = cpu.0, pid = p.0, curr = curr.0, "wakeup preempt");
        self.resched_curr(cpu);
        let cse = EntityRef::Task(curr);
        if self.tunables.feat(SchedFeatures::LAST_BUDDY) && self.se(cpu, cse).on_rq {
            self.set_last_buddy(cpu, cse);
        }
    }

    fn check_preempt_tick(&mut self, cpu: CpuId, g: GroupId, curr: EntityRef) {
        let ideal = self.sched_slice(cpu, curr);
        let se = self.se(cpu, curr);
        let delta_exec = se.sum_exec_runtime - se.prev_sum_exec_runtime;
        if delta_exec > ideal {
            self.resched_curr(cpu);
            self.clear_buddies(cpu, curr);
            return;
        }
        if delta_exec < self.tunables.min_granularity() {
            return;
        }
        let Some(first) = self.cfs_rq(cpu, g).first() else {
            return;
        };
        let delta = self.se(cpu, curr).vruntime.diff(self.se(cpu, first).vruntime);
        if delta > 0 && delta as u64 > ideal {
            self.resched_curr(cpu);
        }
    }

    fn entity_tick(&mut self, cpu: CpuId, g: GroupId, e: EntityRef, queued: bool) {
        self.update_curr_fair(cpu, g);
        self.update_load_avg(cpu, g, e, UpdateFlags::UPDATE_TG);
        self.update_cfs_group(cpu, e);
        if queued {
            self.resched_curr(cpu);
            return;
        }
        if self.cfs_rq(cpu, g).nr_running > 1 {
            self.check_preempt_tick(cpu, g, e);
        }
    }

    pub(crate) fn task_tick_fair(&mut self, cpu: CpuId, p: Pid, queued: bool) {
        for e in self.entity_chain(cpu, EntityRef::Task(p)) {
            let g = self.se(cpu, e).cfs_rq;
            self.entity_tick(cpu, g, e, queued);
        }
        self.update_misfit_status(cpu, Some(p));
        self.update_overutilized_status(cpu);
    }

    pub(crate) fn yield_task_fair(&mut self, cpu: CpuId) {
        let curr = self.rqs[cpu.idx()].curr;
        if self.rqs[cpu.idx()].nr_running == 1 {
            return;
        }
        let e = EntityRef::Task(curr);
        self.clear_buddies(cpu, e);
        if self.tasks[curr].policy != Policy::Batch {
            let g = self.tasks[curr].se.cfs_rq;
            self.update_curr_fair(cpu, g);
            self.rqs[cpu.idx()].clock.skip_update();
        }
        self.set_skip_buddy(cpu, e);
    }

    /// Place a forked task relative to the runqueue it starts on.
    pub(crate) fn task_fork_fair(&mut self, p: Pid) {
        let cpu = self.tasks[p].cpu;
        let g = self.tasks[p].se.cfs_rq;
        self.update_rq_clock(cpu);
        let curr = self.cfs_rq(cpu, g).curr;
        if let Some(c) = curr {
            self.update_curr_fair(cpu, g);
            let vr = self.se(cpu, c).vruntime;
            self.tasks[p].se.vruntime = vr;
        }
        let e = EntityRef::Task(p);
        self.place_entity(cpu, g, e, true);

        if let Some(c) = curr {
            if self.tunables.sched_child_runs_first && self.entity_before(cpu, c, e) {
                let cv = self.se(cpu, c).vruntime;
                let pv = self.se(cpu, e).vruntime;
                self.se_mut(cpu, c).vruntime = pv;
                self.se_mut(cpu, e).vruntime = cv;
                self.resched_curr(cpu);
            }
        }
        let min = self.cfs_rq(cpu, g).min_vruntime;
        let se = &mut self.tasks[p].se;
        se.vruntime = Vtime(se.vruntime.0.wrapping_sub(min.0));
    }

    /// Leave the source runqueue ahead of `set_task_cpu`.
    pub(crate) fn migrate_task_rq_fair(&mut self, p: Pid, _new_cpu: CpuId) {
        let cpu = self.tasks[p].cpu;
        let g = self.tasks[p].se.cfs_rq;
        if self.tasks[p].state.contains(TaskState::WAKING) {
            // Woken remotely without a dequeue; vruntime is still absolute.
            let min = self.cfs_rq(cpu, g).min_vruntime;
            let se = &mut self.tasks[p].se;
            se.vruntime = Vtime(se.vruntime.0.wrapping_sub(min.0));
        }
        if self.tasks[p].on_rq == OnRq::Migrating {
            self.detach_entity_cfs_rq(cpu, EntityRef::Task(p));
        } else {
            self.remove_entity_load_avg(cpu, p);
        }
        let se = &mut self.tasks[p].se;
        se.attached = false;
        se.exec_start = 0;
    }

    /// The entity's vruntime is already relative to its runqueue.
    fn vruntime_normalized(&self, p: Pid) -> bool {
        let t = &self.tasks[p];
        if t.on_rq != OnRq::NotQueued {
            return true;
        }
        t.se.sum_exec_runtime == 0 || (t.state.contains(TaskState::WAKING) && t.sched_remote_wakeup)
    }

    fn detach_task_cfs_rq(&mut self, p: Pid) {
        let cpu = self.tasks[p].cpu;
        let g = self.tasks[p].se.cfs_rq;
        let e = EntityRef::Task(p);
        if !self.vruntime_normalized(p) {
            self.place_entity(cpu, g, e, false);
            let min = self.cfs_rq(cpu, g).min_vruntime;
            let se = &mut self.tasks[p].se;
            se.vruntime = Vtime(se.vruntime.0.wrapping_sub(min.0));
        }
        self.detach_entity_cfs_rq(cpu, e);
    }

    fn attach_task_cfs_rq(&mut self, p: Pid) {
        let cpu = self.tasks[p].cpu;
        let g = self.tasks[p].se.cfs_rq;
        self.attach_entity_cfs_rq(cpu, EntityRef::Task(p));
        if !self.vruntime_normalized(p) {
            let min = self.cfs_rq(cpu, g).min_vruntime;
            let se = &mut self.tasks[p].se;
            se.vruntime = Vtime(se.vruntime.0.wrapping_add(min.0));
        }
    }

    pub(crate) fn switched_from_fair(&mut self, p: Pid) {
        self.detach_task_cfs_rq(p);
    }

    pub(crate) fn switched_to_fair(&mut self, cpu: CpuId, p: Pid) {
        self.attach_task_cfs_rq(p);
        if self.tasks[p].is_queued() {
            if self.rqs[cpu.idx()].curr == p {
                self.resched_curr(cpu);
            } else {
                self.check_preempt_curr(cpu, p, WakeFlags::empty());
            }
        }
    }

    pub(crate) fn prio_changed_fair(&mut self, cpu: CpuId, p: Pid, oldprio: i32) {
        if !self.tasks[p].is_queued() {
            return;
        }
        if self.rqs[cpu.idx()].cfs().nr_running == 1 {
            return;
        }
        if self.rqs[cpu.idx()].curr == p {
            if self.tasks[p].prio > oldprio {
                self.resched_curr(cpu);
            }
        } else {
            self.check_preempt_curr(cpu, p, WakeFlags::empty());
        }
    }

    /// Move `p` onto the runqueue of its (already updated) `group`.
    pub(crate) fn task_change_group_fair(&mut self, p: Pid) {
        self.detach_task_cfs_rq(p);
        let group = self.tasks[p].group;
        let depth = self.entity_depth_for(group);
        let se = &mut self.tasks[p].se;
        se.cfs_rq = group;
        se.depth = depth;
        se.attached = false;
        self.attach_task_cfs_rq(p);
    }

    /// Depth a task entity queued on `group` has.
    pub(crate) fn entity_depth_for(&self, group: GroupId) -> u32 {
        if group.is_root() {
            0
        } else {
            self.groups.get(group).map(|tg| tg.se_depth + 1).unwrap_or(0)
        }
    }

    /// Change the weight of an entity, keeping its runqueue's sums
    /// consistent whether or not it is queued.
    pub(crate) fn reweight_entity(&mut self, cpu: CpuId, e: EntityRef, weight: LoadWeight) {
        let g = self.se(cpu, e).cfs_rq;
        let on_rq = self.se(cpu, e).on_rq;
        if on_rq {
            if self.cfs_rq(cpu, g).curr == Some(e) {
                self.update_curr_fair(cpu, g);
            }
            let w = self.se(cpu, e).load.weight;
            self.cfs_mut(cpu, g).load.sub(w);
        }
        self.dequeue_load_avg(cpu, g, e);
        let se = self.se_mut(cpu, e);
        se.load = weight;
        let divider = crate::pelt::pelt_divider(&se.avg);
        se.avg.load_avg = (se.load.weight as u128 * se.avg.load_sum as u128 / divider as u128) as u64;
        self.enqueue_load_avg(cpu, g, e);
        if on_rq {
            self.cfs_mut(cpu, g).load.add(weight.weight);
        }
    }

    pub(crate) fn hrtick_enabled(&self, cpu: CpuId, feat: SchedFeatures) -> bool {
        self.tunables.feat(feat) && self.rqs[cpu.idx()].online
    }

    fn hrtick_start_fair(&mut self, cpu: CpuId, p: Pid) {
        if self.rqs[cpu.idx()].cfs().h_nr_running <= 1 {
            return;
        }
        let e = EntityRef::Task(p);
        let slice = self.sched_slice(cpu, e);
        let se = self.se(cpu, e);
        let ran = se.sum_exec_runtime - se.prev_sum_exec_runtime;
        if ran >= slice {
            if self.rqs[cpu.idx()].curr == p {
                self.resched_curr(cpu);
            }
            return;
        }
        self.hrtick_start(cpu, slice - ran);
    }

    /// Arm the per-CPU precise tick `delay` from now.
    pub(crate) fn hrtick_start(&mut self, cpu: CpuId, delay: u64) {
        let delay = delay.max(10 * NSEC_PER_USEC);
        if let Some(h) = self.rqs[cpu.idx()].hrtick_timer.take() {
            self.timers.cancel(h);
        }
        let h = self.timers.arm(TimerEvent::HrTick(cpu), self.now + delay, Some(cpu));
        self.rqs[cpu.idx()].hrtick_timer = Some(h);
    }

    fn hrtick_update(&mut self, cpu: CpuId) {
        let curr = self.rqs[cpu.idx()].curr;
        if !self.hrtick_enabled(cpu, SchedFeatures::HRTICK) || self.tasks[curr].class != ClassId::Fair {
            return;
        }
        let g = self.tasks[curr].se.cfs_rq;
        if (self.cfs_rq(cpu, g).nr_running as u64) < self.tunables.nr_latency() {
            self.hrtick_start_fair(cpu, curr);
        }
    }

    /// Runnable fair tasks beyond the running one, for the round-robin
    /// interval report.
    pub(crate) fn get_rr_interval_fair(&self, p: Pid) -> u64 {
        let t = &self.tasks[p];
        if t.on_rq == OnRq::NotQueued || self.rqs[t.cpu.idx()].cfs().load.weight == 0 {
            return 0;
        }
        self.sched_slice(t.cpu, EntityRef::Task(p))
    }
}

pub struct FairClass;

pub static FAIR_CLASS: FairClass = FairClass;

impl SchedClass for FairClass {
    fn id(&self) -> ClassId {
        ClassId::Fair
    }

    fn enqueue_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, flags: EnqueueFlags) {
        s.enqueue_task_fair(cpu, p, flags)
    }

    fn dequeue_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, flags: DequeueFlags) {
        s.dequeue_task_fair(cpu, p, flags)
    }

    fn yield_task(&self, s: &mut Sched, cpu: CpuId) {
        s.yield_task_fair(cpu)
    }

    fn check_preempt_curr(&self, s: &mut Sched, cpu: CpuId, p: Pid, wf: WakeFlags) {
        s.check_preempt_wakeup(cpu, p, wf)
    }

    fn pick_next_task(&self, s: &mut Sched, cpu: CpuId) -> Option<Pid> {
        s.pick_next_task_fair(cpu)
    }

    fn put_prev_task(&self, s: &mut Sched, cpu: CpuId, p: Pid) {
        s.put_prev_task_fair(cpu, p)
    }

    fn set_next_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, first: bool) {
        s.set_next_task_fair(cpu, p, first)
    }

    fn balance(&self, s: &mut Sched, cpu: CpuId, _prev: Pid) -> bool {
        if s.rqs[cpu.idx()].nr_running > 0 {
            return true;
        }
        s.newidle_balance(cpu) != 0
    }

    fn select_task_rq(&self, s: &mut Sched, p: Pid, prev_cpu: CpuId, wf: WakeFlags) -> CpuId {
        s.select_task_rq_fair(p, prev_cpu, wf)
    }

    fn migrate_task_rq(&self, s: &mut Sched, p: Pid, new_cpu: CpuId) {
        s.migrate_task_rq_fair(p, new_cpu)
    }

    fn task_tick(&self, s: &mut Sched, cpu: CpuId, p: Pid, queued: bool) {
        s.task_tick_fair(cpu, p, queued)
    }

    fn task_fork(&self, s: &mut Sched, p: Pid) {
        s.task_fork_fair(p)
    }

    fn task_dead(&self, s: &mut Sched, p: Pid) {
        let cpu = s.tasks[p].cpu;
        s.remove_entity_load_avg(cpu, p);
    }

    fn switched_from(&self, s: &mut Sched, _cpu: CpuId, p: Pid) {
        s.switched_from_fair(p)
    }

    fn switched_to(&self, s: &mut Sched, cpu: CpuId, p: Pid) {
        s.switched_to_fair(cpu, p)
    }

    fn prio_changed(&self, s: &mut Sched, cpu: CpuId, p: Pid, oldprio: i32) {
        s.prio_changed_fair(cpu, p, oldprio)
    }

    fn update_curr(&self, s: &mut Sched, cpu: CpuId) {
        let curr = s.rqs[cpu.idx()].curr;
        let g = s.tasks[curr].se.cfs_rq;
        s.update_curr_fair(cpu, g)
    }

    fn rq_online(&self, s: &mut Sched, cpu: CpuId) {
        s.update_sysctl_scaling();
        s.update_runtime_enabled(cpu);
    }

    fn rq_offline(&self, s: &mut Sched, cpu: CpuId) {
        s.update_sysctl_scaling();
        s.unthrottle_offline_cfs_rqs(cpu);
    }

    fn task_change_group(&self, s: &mut Sched, p: Pid) {
        s.task_change_group_fair(p)
    }

    fn get_rr_interval(&self, s: &Sched, p: Pid) -> u64 {
        s.get_rr_interval_fair(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_orders_by_vruntime_with_wrap() {
        let mut cfs = CfsRq::new(GroupId::ROOT);
        let a = EntityRef::Task(Pid(1));
        let b = EntityRef::Task(Pid(2));
        let c = EntityRef::Task(Pid(3));
        cfs.insert(a, Vtime(u64::MAX - 10));
        cfs.insert(b, Vtime(5));
        cfs.insert(c, Vtime(u64::MAX - 20));
        assert_eq!(cfs.first(), Some(c));
        assert_eq!(cfs.next_after(c), Some(a));
        assert_eq!(cfs.next_after(a), Some(b));
        assert_eq!(cfs.next_after(b), None);
        assert!(cfs.erase(a));
        assert!(!cfs.erase(a));
        assert_eq!(cfs.next_after(c), Some(b));
        assert_eq!(cfs.last_entity(), Some(b));
    }

    #[test]
    fn equal_vruntimes_do_not_collide() {
        let mut cfs = CfsRq::new(GroupId::ROOT);
        cfs.insert(EntityRef::Task(Pid(7)), Vtime(100));
        cfs.insert(EntityRef::Group(GroupId(2)), Vtime(100));
        assert_eq!(cfs.queued().count(), 2);
        assert!(cfs.in_tree(EntityRef::Group(GroupId(2))));
    }

    #[test]
    fn preempt_entity_thresholds() {
        assert_eq!(wakeup_preempt_entity(Vtime(10), Vtime(20), 5), -1);
        assert_eq!(wakeup_preempt_entity(Vtime(24), Vtime(20), 5), 0);
        assert_eq!(wakeup_preempt_entity(Vtime(26), Vtime(20), 5), 1);
    }

    #[test]
    fn policy_outranks() {
        assert!(policy_rank(Policy::Normal) > policy_rank(Policy::Batch));
        assert!(policy_rank(Policy::Batch) > policy_rank(Policy::Idle));
    }
}
