// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Load tracking glue for the fair class: keeping entity and runqueue PELT
//! signals in step, propagating changes up the group hierarchy and
//! publishing per-CPU group load into the group aggregate used for shares.

use std::cmp::Reverse;
use std::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::core::Sched;
use crate::pelt;
use crate::pelt::add_positive;
use crate::pelt::pelt_divider;
use crate::pelt::sub_positive;
use crate::pelt::PELT_MIN_DIVIDER;
use crate::prio::LoadWeight;
use crate::prio::MIN_SHARES;
use crate::prio::SCHED_CAPACITY_SHIFT;
use crate::tunables::SchedFeatures;
use crate::types::CpuId;
use crate::types::EntityRef;
use crate::types::GroupId;
use crate::types::Pid;
use crate::types::TimeNs;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateFlags: u32 {
        /// Publish the runqueue's load into its group aggregate.
        const UPDATE_TG = 0x1;
        /// Do not decay the entity before folding it in.
        const SKIP_AGE_LOAD = 0x2;
        /// Attach the entity if it is not attached yet.
        const DO_ATTACH = 0x4;
        const DO_DETACH = 0x8;
    }
}

impl Sched {
    /// PELT clock of a fair runqueue: the rq's PELT clock with throttled
    /// time removed, frozen while the runqueue is throttled.
    pub(crate) fn cfs_rq_clock_pelt(&self, cpu: CpuId, g: GroupId) -> TimeNs {
        let cfs = self.cfs_rq(cpu, g);
        if cfs.throttle_count > 0 {
            return cfs.throttled_clock_pelt - cfs.throttled_clock_pelt_time;
        }
        self.rqs[cpu.idx()].clock.pelt() - cfs.throttled_clock_pelt_time
    }

    fn add_tg_cfs_propagate(&mut self, cpu: CpuId, g: GroupId, runnable_sum: i64) {
        let cfs = self.cfs_mut(cpu, g);
        cfs.propagate = true;
        cfs.prop_runnable_sum += runnable_sum;
    }

    fn cfs_rq_util_change(&mut self, cpu: CpuId, g: GroupId) {
        if g.is_root() {
            self.cpufreq_update_util(cpu, 0);
        }
    }

    /// Fold removed load and decay the runqueue's signals to `now`.
    fn update_cfs_rq_load_avg(&mut self, now: TimeNs, cpu: CpuId, g: GroupId) -> bool {
        let cfs = self.cfs_mut(cpu, g);
        let mut decayed = false;
        if cfs.removed.nr > 0 {
            let r = std::mem::take(&mut cfs.removed);
            let divider = pelt_divider(&cfs.avg);
            let sa = &mut cfs.avg;

            sub_positive(&mut sa.util_avg, r.util_avg);
            sub_positive(&mut sa.util_sum, r.util_avg * divider);
            sa.util_sum = sa.util_sum.max(sa.util_avg * PELT_MIN_DIVIDER);

            sub_positive(&mut sa.load_avg, r.load_avg);
            sub_positive(&mut sa.load_sum, r.load_avg * divider);
            sa.load_sum = sa.load_sum.max(sa.load_avg * PELT_MIN_DIVIDER);

            sub_positive(&mut sa.runnable_avg, r.runnable_avg);
            sub_positive(&mut sa.runnable_sum, r.runnable_avg * divider);
            sa.runnable_sum = sa.runnable_sum.max(sa.runnable_avg * PELT_MIN_DIVIDER);

            cfs.propagate = true;
            cfs.prop_runnable_sum -= ((r.runnable_avg * divider) >> SCHED_CAPACITY_SHIFT) as i64;
            decayed = true;
        }
        let (weight, h_nr, running) = (cfs.load.weight, cfs.h_nr_running as u64, cfs.curr.is_some());
        decayed |= pelt::update_aggregate(now, &mut cfs.avg, weight, h_nr, running);
        decayed
    }

    fn update_tg_cfs_util(&mut self, cpu: CpuId, g: GroupId, e: EntityRef, gq: GroupId) {
        let gavg = self.cfs_rq(cpu, gq).avg.util_avg;
        let delta_avg = gavg as i64 - self.se(cpu, e).avg.util_avg as i64;
        if delta_avg == 0 {
            return;
        }
        let divider = pelt_divider(&self.cfs_rq(cpu, g).avg);
        let se = self.se_mut(cpu, e);
        se.avg.util_avg = gavg;
        let new_sum = gavg * divider;
        let delta_sum = new_sum as i64 - se.avg.util_sum as i64;
        se.avg.util_sum = new_sum;

        let sa = &mut self.cfs_mut(cpu, g).avg;
        add_positive(&mut sa.util_avg, delta_avg);
        add_positive(&mut sa.util_sum, delta_sum);
        sa.util_sum = sa.util_sum.max(sa.util_avg * PELT_MIN_DIVIDER);
    }

    fn update_tg_cfs_runnable(&mut self, cpu: CpuId, g: GroupId, e: EntityRef, gq: GroupId) {
        let gavg = self.cfs_rq(cpu, gq).avg.runnable_avg;
        let delta_avg = gavg as i64 - self.se(cpu, e).avg.runnable_avg as i64;
        if delta_avg == 0 {
            return;
        }
        let divider = pelt_divider(&self.cfs_rq(cpu, g).avg);
        let se = self.se_mut(cpu, e);
        se.avg.runnable_avg = gavg;
        let new_sum = gavg * divider;
        let delta_sum = new_sum as i64 - se.avg.runnable_sum as i64;
        se.avg.runnable_sum = new_sum;

        let sa = &mut self.cfs_mut(cpu, g).avg;
        add_positive(&mut sa.runnable_avg, delta_avg);
        add_positive(&mut sa.runnable_sum, delta_sum);
        sa.runnable_sum = sa.runnable_sum.max(sa.runnable_avg * PELT_MIN_DIVIDER);
    }

    fn update_tg_cfs_load(&mut self, cpu: CpuId, g: GroupId, e: EntityRef, gq: GroupId) {
        let mut runnable_sum = self.cfs_rq(cpu, gq).prop_runnable_sum;
        if runnable_sum == 0 {
            return;
        }
        self.cfs_mut(cpu, gq).prop_runnable_sum = 0;
        let divider = pelt_divider(&self.cfs_rq(cpu, g).avg) as i64;
        let se = self.se(cpu, e);

        if runnable_sum >= 0 {
            runnable_sum = (runnable_sum + se.avg.load_sum as i64).min(divider);
        } else {
            // Estimate the new unweighted runnable sum from the child's
            // weighted one; the child never tracked its own.
            let gq_rq = self.cfs_rq(cpu, gq);
            let load_sum = if gq_rq.load.weight > 0 {
                gq_rq.avg.load_sum / gq_rq.load.weight
            } else {
                0
            };
            runnable_sum = se.avg.load_sum.min(load_sum) as i64;
        }
        let running_sum = (se.avg.util_sum >> SCHED_CAPACITY_SHIFT) as i64;
        runnable_sum = runnable_sum.max(running_sum);

        let w = se.load.weight as i64;
        let load_sum = w * runnable_sum;
        let load_avg = load_sum / divider;
        let delta_avg = load_avg - se.avg.load_avg as i64;
        if delta_avg == 0 {
            return;
        }
        let delta_sum = load_sum - w * se.avg.load_sum as i64;

        let se = self.se_mut(cpu, e);
        se.avg.load_sum = runnable_sum as u64;
        se.avg.load_avg = load_avg as u64;

        let sa = &mut self.cfs_mut(cpu, g).avg;
        add_positive(&mut sa.load_avg, delta_avg);
        add_positive(&mut sa.load_sum, delta_sum);
        sa.load_sum = sa.load_sum.max(sa.load_avg * PELT_MIN_DIVIDER);
    }

    /// Pull a pending change of a group's runqueue into its group entity.
    fn propagate_entity_load_avg(&mut self, cpu: CpuId, e: EntityRef) -> bool {
        let EntityRef::Group(gq) = e else {
            return false;
        };
        if !self.cfs_rq(cpu, gq).propagate {
            return false;
        }
        self.cfs_mut(cpu, gq).propagate = false;
        let g = self.se(cpu, e).cfs_rq;
        let prop = self.cfs_rq(cpu, gq).prop_runnable_sum;
        self.add_tg_cfs_propagate(cpu, g, prop);
        self.update_tg_cfs_util(cpu, g, e, gq);
        self.update_tg_cfs_runnable(cpu, g, e, gq);
        self.update_tg_cfs_load(cpu, g, e, gq);
        true
    }

    /// Age entity `e` and its runqueue `g` to the runqueue's PELT clock.
    pub(crate) fn update_load_avg(&mut self, cpu: CpuId, g: GroupId, e: EntityRef, flags: UpdateFlags) {
        let now = self.cfs_rq_clock_pelt(cpu, g);
        let attached = self.se(cpu, e).attached;
        if attached && !flags.contains(UpdateFlags::SKIP_AGE_LOAD) {
            let running = self.cfs_rq(cpu, g).curr == Some(e);
            let se = self.se_mut(cpu, e);
            let runnable = match e {
                EntityRef::Task(_) => se.on_rq as u64,
                EntityRef::Group(_) => se.runnable_weight,
            };
            let (on_rq, w) = (se.on_rq, se.load.weight);
            pelt::update_entity(now, &mut se.avg, on_rq, runnable, running, w);
        }

        let mut decayed = self.update_cfs_rq_load_avg(now, cpu, g);
        decayed |= self.propagate_entity_load_avg(cpu, e);

        if !attached && flags.contains(UpdateFlags::DO_ATTACH) {
            self.attach_entity_load_avg(cpu, g, e);
            self.update_tg_load_avg(cpu, g);
        } else if attached && flags.contains(UpdateFlags::DO_DETACH) {
            self.detach_entity_load_avg(cpu, g, e);
            self.update_tg_load_avg(cpu, g);
        } else if decayed {
            self.cfs_rq_util_change(cpu, g);
            if flags.contains(UpdateFlags::UPDATE_TG) {
                self.update_tg_load_avg(cpu, g);
            }
        }
    }

    fn attach_entity_load_avg(&mut self, cpu: CpuId, g: GroupId, e: EntityRef) {
        let w = self.se(cpu, e).load.weight;
        let mut sa = self.se(cpu, e).avg.clone();
        pelt::attach_avg(&mut self.cfs_mut(cpu, g).avg, &mut sa, w);
        let load_sum = sa.load_sum;
        let se = self.se_mut(cpu, e);
        se.avg = sa;
        se.attached = true;
        self.add_tg_cfs_propagate(cpu, g, load_sum as i64);
        self.cfs_rq_util_change(cpu, g);
    }

    fn detach_entity_load_avg(&mut self, cpu: CpuId, g: GroupId, e: EntityRef) {
        let se = self.se(cpu, e);
        let (sa, w) = (se.avg.clone(), se.load.weight);
        pelt::detach_avg(&mut self.cfs_mut(cpu, g).avg, &sa, w);
        self.se_mut(cpu, e).attached = false;
        self.add_tg_cfs_propagate(cpu, g, -(sa.load_sum as i64));
        self.cfs_rq_util_change(cpu, g);
    }

    pub(crate) fn enqueue_load_avg(&mut self, cpu: CpuId, g: GroupId, e: EntityRef) {
        let se = self.se(cpu, e);
        if !se.attached {
            return;
        }
        let (la, ls) = (se.avg.load_avg, se.avg.load_sum * se.load.weight);
        let sa = &mut self.cfs_mut(cpu, g).avg;
        sa.load_avg += la;
        sa.load_sum += ls;
    }

    pub(crate) fn dequeue_load_avg(&mut self, cpu: CpuId, g: GroupId, e: EntityRef) {
        let se = self.se(cpu, e);
        if !se.attached {
            return;
        }
        let (la, ls) = (se.avg.load_avg, se.avg.load_sum * se.load.weight);
        let sa = &mut self.cfs_mut(cpu, g).avg;
        sub_positive(&mut sa.load_avg, la);
        sub_positive(&mut sa.load_sum, ls);
        sa.load_sum = sa.load_sum.max(sa.load_avg * PELT_MIN_DIVIDER);
    }

    /// Publish this CPU's group load into the group aggregate once it has
    /// drifted by more than 1/64 of the last published value.
    pub(crate) fn update_tg_load_avg(&mut self, cpu: CpuId, g: GroupId) {
        if g.is_root() {
            return;
        }
        let cfs = self.cfs_rq(cpu, g);
        let delta = cfs.avg.load_avg as i64 - cfs.tg_load_avg_contrib as i64;
        if delta.unsigned_abs() > cfs.tg_load_avg_contrib / 64 {
            if let Some(tg) = self.groups.get(g) {
                tg.load_avg.fetch_add(delta, Ordering::Relaxed);
            }
            let cfs = self.cfs_mut(cpu, g);
            cfs.tg_load_avg_contrib = cfs.avg.load_avg;
        }
    }

    /// Share of the group's weight this CPU's group entity gets.
    pub(crate) fn calc_group_shares(&self, cpu: CpuId, g: GroupId) -> u64 {
        let Some(tg) = self.groups.get(g) else {
            return MIN_SHARES;
        };
        let tg_shares = tg.shares;
        let cfs = self.cfs_rq(cpu, g);
        let load = cfs.load.weight.max(cfs.avg.load_avg);
        let tg_weight = tg.load_avg.load(Ordering::Relaxed) - cfs.tg_load_avg_contrib as i64 + load as i64;
        let mut shares = tg_shares * load;
        if tg_weight > 0 {
            shares /= tg_weight as u64;
        }
        shares.clamp(MIN_SHARES, tg_shares.max(MIN_SHARES))
    }

    /// Recompute a group entity's weight from its group's shares.
    pub(crate) fn update_cfs_group(&mut self, cpu: CpuId, e: EntityRef) {
        let EntityRef::Group(gq) = e else {
            return;
        };
        if self.cfs_rq(cpu, gq).is_throttled_hierarchy() {
            return;
        }
        let shares = self.calc_group_shares(cpu, gq);
        if self.se(cpu, e).load.weight != shares {
            self.reweight_entity(cpu, e, LoadWeight::new(shares));
        }
    }

    fn propagate_entity_cfs_rq(&mut self, cpu: CpuId, e: EntityRef) {
        let g = self.se(cpu, e).cfs_rq;
        if self.cfs_rq(cpu, g).throttled {
            return;
        }
        let mut cur = self.se(cpu, e).parent();
        while let Some(x) = cur {
            let pg = self.se(cpu, x).cfs_rq;
            self.update_load_avg(cpu, pg, x, UpdateFlags::UPDATE_TG);
            if self.cfs_rq(cpu, pg).throttled {
                break;
            }
            cur = self.se(cpu, x).parent();
        }
    }

    /// Catch `e` up with its runqueue and take its load off it.
    pub(crate) fn detach_entity_cfs_rq(&mut self, cpu: CpuId, e: EntityRef) {
        if !self.se(cpu, e).attached {
            return;
        }
        let g = self.se(cpu, e).cfs_rq;
        self.update_load_avg(cpu, g, e, UpdateFlags::empty());
        self.detach_entity_load_avg(cpu, g, e);
        self.update_tg_load_avg(cpu, g);
        self.propagate_entity_cfs_rq(cpu, e);
    }

    pub(crate) fn attach_entity_cfs_rq(&mut self, cpu: CpuId, e: EntityRef) {
        let g = self.se(cpu, e).cfs_rq;
        let flags = if self.tunables.feat(SchedFeatures::ATTACH_AGE_LOAD) {
            UpdateFlags::empty()
        } else {
            UpdateFlags::SKIP_AGE_LOAD
        };
        self.update_load_avg(cpu, g, e, flags);
        if !self.se(cpu, e).attached {
            self.attach_entity_load_avg(cpu, g, e);
        }
        self.update_tg_load_avg(cpu, g);
        self.propagate_entity_cfs_rq(cpu, e);
    }

    /// Decay a sleeping task to its runqueue's last update and queue its
    /// contribution for removal. Used when the runqueue is not locked by
    /// the caller: migration of a blocked task and task death.
    pub(crate) fn remove_entity_load_avg(&mut self, cpu: CpuId, p: Pid) {
        if !self.tasks[p].se.attached {
            return;
        }
        let g = self.tasks[p].se.cfs_rq;
        let last = self.cfs_rq(cpu, g).avg.last_update_time;
        let se = &mut self.tasks[p].se;
        let w = se.load.weight;
        pelt::update_entity(last, &mut se.avg, false, 0, false, w);
        se.attached = false;
        let (l, u, r) = (se.avg.load_avg, se.avg.util_avg, se.avg.runnable_avg);
        let removed = &mut self.cfs_mut(cpu, g).removed;
        removed.nr += 1;
        removed.load_avg += l;
        removed.util_avg += u;
        removed.runnable_avg += r;
    }

    pub(crate) fn util_est_enqueue(&mut self, cpu: CpuId, p: Pid) {
        if !self.tunables.feat(SchedFeatures::UTIL_EST) {
            return;
        }
        let v = pelt::task_util_est(&self.tasks[p].se.avg) as u32;
        let ue = &mut self.cfs_mut(cpu, GroupId::ROOT).avg.util_est;
        ue.enqueued += v;
    }

    pub(crate) fn util_est_dequeue(&mut self, cpu: CpuId, p: Pid) {
        if !self.tunables.feat(SchedFeatures::UTIL_EST) {
            return;
        }
        let v = pelt::task_util_est(&self.tasks[p].se.avg) as u32;
        let ue = &mut self.cfs_mut(cpu, GroupId::ROOT).avg.util_est;
        ue.enqueued = ue.enqueued.saturating_sub(v);
    }

    /// Fold the activation that just ended into the task's estimate.
    pub(crate) fn util_est_update(&mut self, cpu: CpuId, p: Pid, task_sleep: bool) {
        if !self.tunables.feat(SchedFeatures::UTIL_EST) || !task_sleep {
            return;
        }
        // An overutilized CPU under-reports; do not learn from it.
        if pelt::task_util(&self.tasks[p].se.avg) > self.rqs[cpu.idx()].cpu_capacity_orig {
            return;
        }
        pelt::util_est_update(&mut self.tasks[p].se.avg);
    }

    fn group_level(&self, g: GroupId) -> u32 {
        if g.is_root() {
            0
        } else {
            self.groups.get(g).map(|tg| tg.se_depth + 1).unwrap_or(0)
        }
    }

    /// Decay every runqueue signal on `cpu`, deepest groups first so each
    /// level sees its children's propagated changes. Returns true if some
    /// blocked load is still left to decay.
    pub(crate) fn update_blocked_averages(&mut self, cpu: CpuId) -> bool {
        self.update_rq_clock(cpu);
        let mut decayed = self.update_other_load_avgs(cpu);

        let mut gids: Vec<GroupId> = self.rqs[cpu.idx()].cfs_rqs.keys().copied().collect();
        gids.sort_by_key(|&g| Reverse(self.group_level(g)));

        let mut has_blocked = false;
        for g in gids {
            let now = self.cfs_rq_clock_pelt(cpu, g);
            if self.update_cfs_rq_load_avg(now, cpu, g) {
                self.update_tg_load_avg(cpu, g);
                if g.is_root() {
                    decayed = true;
                }
            }
            if !g.is_root() && self.rqs[cpu.idx()].group_se.contains_key(&g) {
                let e = EntityRef::Group(g);
                let pg = self.se(cpu, e).cfs_rq;
                self.update_load_avg(cpu, pg, e, UpdateFlags::UPDATE_TG);
            }
            let avg = &self.cfs_rq(cpu, g).avg;
            if avg.load_avg != 0 || avg.util_avg != 0 || avg.runnable_avg != 0 {
                has_blocked = true;
            }
        }

        let rq = &self.rqs[cpu.idx()];
        let others = rq.avg_rt.util_avg != 0
            || rq.avg_dl.util_avg != 0
            || rq.avg_irq.util_avg != 0
            || rq.thermal_pressure != 0;
        if decayed {
            self.cpufreq_update_util(cpu, 0);
        }
        let jiffies = self.jiffies;
        let rq = &mut self.rqs[cpu.idx()];
        rq.has_blocked_load = has_blocked || others;
        rq.last_blocked_load_update_tick = jiffies;
        rq.has_blocked_load
    }

    fn cfs_h_load(&self, cpu: CpuId, g: GroupId) -> u64 {
        if g.is_root() {
            return self.cfs_rq(cpu, g).avg.load_avg;
        }
        let se = &self.rqs[cpu.idx()].group_se[&g];
        let parent = se.cfs_rq;
        let h = self.cfs_h_load(cpu, parent);
        h * se.avg.load_avg / (self.cfs_rq(cpu, parent).avg.load_avg + 1)
    }

    /// A task's load as seen at the root runqueue.
    pub fn task_h_load(&self, p: Pid) -> u64 {
        let t = &self.tasks[p];
        let g = t.se.cfs_rq;
        if g.is_root() {
            return t.se.avg.load_avg;
        }
        let h = self.cfs_h_load(t.cpu, g);
        t.se.avg.load_avg * h / (self.cfs_rq(t.cpu, g).avg.load_avg + 1)
    }

    /// Seed a new task's signals before it is first enqueued.
    pub(crate) fn init_task_load_avg(&mut self, p: Pid) {
        let se = &mut self.tasks[p].se;
        let w = se.load.weight;
        pelt::init_entity_runnable_average(&mut se.avg, w);
        se.attached = false;
    }

    pub(crate) fn post_init_task_util_avg(&mut self, p: Pid) {
        let t = &self.tasks[p];
        if t.class != crate::class::ClassId::Fair {
            return;
        }
        let (cpu, g, w) = (t.cpu, t.se.cfs_rq, t.se.load.weight);
        let cfs = self.cfs_rq(cpu, g);
        let (util, load) = (cfs.avg.util_avg, cfs.avg.load_avg);
        let cap = self.rqs[cpu.idx()].cpu_capacity_orig;
        pelt::post_init_entity_util_avg(&mut self.tasks[p].se.avg, w, util, load, cap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_flags_compose() {
        let f = UpdateFlags::UPDATE_TG | UpdateFlags::DO_ATTACH;
        assert!(f.contains(UpdateFlags::DO_ATTACH));
        assert!(!f.contains(UpdateFlags::SKIP_AGE_LOAD));
    }
}
