// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Fair load balancing
//!
//! Each CPU walks its domains innermost first. At every level the local
//! group is compared against the other groups, the busiest one is picked,
//! and tasks are pulled from its busiest CPU until the imbalance is gone:
//!
//! ```text
//!   update_sd_lb_stats      per-group load, util, idle CPUs, type
//!   find_busiest_group      is there an imbalance worth fixing?
//!   calculate_imbalance     how much, and in what unit
//!   find_busiest_queue      which CPU of that group
//!   detach_tasks/attach     move queued fair tasks
//! ```
//!
//! When nothing can be detached because the only candidate is running,
//! the source CPU's stop task pushes it (active balance).
//!
//! Newly idle CPUs run a cheaper pass bounded by the measured cost of
//! previous passes. Tickless idle CPUs get theirs from the idle load
//! balancer in `nohz`.

use std::sync::atomic::Ordering;

use bitflags::bitflags;
use ordered_float::OrderedFloat;
use tracing::debug;
use tracing::trace;

use crate::capacity::capacity_greater;
use crate::capacity::fits_capacity;
use crate::class::ClassId;
use crate::core::SchedEvent;
use crate::core::Sched;
use crate::cpumask::Cpumask;
use crate::prio::Policy;
use crate::prio::SCHED_CAPACITY_SCALE;
use crate::rq::StopWork;
use crate::sched_domain::SchedDomain;
use crate::sched_domain::SchedGroup;
use crate::sched_domain::SdFlags;
use crate::stats::CpuIdleType;
use crate::task::DequeueFlags;
use crate::task::EnqueueFlags;
use crate::task::WakeFlags;
use crate::timer::TimerEvent;
use crate::tunables::SchedFeatures;
use crate::types::CpuId;
use crate::types::EntityRef;
use crate::types::Pid;
use crate::types::NSEC_PER_SEC;
use crate::types::NSEC_PER_USEC;

/// Cap on the back-off interval, ms, while every task is pinned.
pub const MAX_PINNED_INTERVAL: u64 = 512;

/// Modelled cost of a newidle pass over one CPU of a domain, ns.
pub const NEWIDLE_COST_PER_CPU_NS: u64 = NSEC_PER_USEC;

/// NUMA imbalances up to this many tasks are left alone while the
/// destination node is lightly used.
const NUMA_IMBALANCE_MIN: u64 = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LbfFlags: u32 {
        const ALL_PINNED = 0x01;
        const NEED_BREAK = 0x02;
        const DST_PINNED = 0x04;
        const SOME_PINNED = 0x08;
        const ACTIVE_LB = 0x10;
    }
}

/// Unit the imbalance is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationType {
    #[default]
    Load,
    Util,
    Task,
    Misfit,
}

/// Group state, least to most in need of relief.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum GroupType {
    #[default]
    HasSpare,
    FullyBusy,
    Misfit,
    Asym,
    Imbalanced,
    Overloaded,
}

#[derive(Debug, Clone, Default)]
pub struct SgLbStats {
    pub avg_load: u64,
    pub group_load: u64,
    pub group_capacity: u64,
    pub group_util: u64,
    pub group_runnable: u64,
    pub sum_nr_running: u32,
    pub sum_h_nr_running: u32,
    pub idle_cpus: u32,
    pub group_weight: u32,
    pub group_type: GroupType,
    pub group_asym_packing: bool,
    pub group_misfit_task_load: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SdLbStats {
    pub busiest: Option<usize>,
    pub busiest_stat: SgLbStats,
    pub local_stat: SgLbStats,
    pub total_load: u64,
    pub total_capacity: u64,
    pub avg_load: u64,
    pub prefer_sibling: bool,
    overloaded: bool,
    overutilized: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct LbEnv {
    pub level: usize,
    pub src_cpu: CpuId,
    pub dst_cpu: CpuId,
    /// Span of the destination's group at this level.
    pub dst_grpmask: Cpumask,
    pub new_dst_cpu: Option<CpuId>,
    pub idle: CpuIdleType,
    pub imbalance: u64,
    /// CPUs still eligible as source.
    pub cpus: Cpumask,
    pub flags: LbfFlags,
    pub loop_: u32,
    pub loop_break: u32,
    pub loop_max: u32,
    pub migration_type: MigrationType,
}

pub fn group_has_capacity(imbalance_pct: u64, sgs: &SgLbStats) -> bool {
    if sgs.sum_nr_running < sgs.group_weight {
        return true;
    }
    if sgs.group_capacity * imbalance_pct < sgs.group_runnable * 100 {
        return false;
    }
    sgs.group_capacity * 100 > sgs.group_util * imbalance_pct
}

pub fn group_is_overloaded(imbalance_pct: u64, sgs: &SgLbStats) -> bool {
    if sgs.sum_nr_running <= sgs.group_weight {
        return false;
    }
    if sgs.group_capacity * 100 < sgs.group_util * imbalance_pct {
        return true;
    }
    sgs.group_capacity * imbalance_pct < sgs.group_runnable * 100
}

/// Classify a group. Packing preference is checked before misfit so a
/// domain with both flags moves work to preferred CPUs first.
pub fn group_classify(imbalance_pct: u64, group_imbalanced: bool, sgs: &SgLbStats) -> GroupType {
    if group_is_overloaded(imbalance_pct, sgs) {
        return GroupType::Overloaded;
    }
    if group_imbalanced {
        return GroupType::Imbalanced;
    }
    if sgs.group_asym_packing {
        return GroupType::Asym;
    }
    if sgs.group_misfit_task_load > 0 {
        return GroupType::Misfit;
    }
    if !group_has_capacity(imbalance_pct, sgs) {
        return GroupType::FullyBusy;
    }
    GroupType::HasSpare
}

/// Leave a small NUMA imbalance while the destination is lightly used so
/// communicating tasks stay together.
pub fn adjust_numa_imbalance(imbalance: u64, dst_running: u32, dst_weight: u32) -> u64 {
    if dst_running >= dst_weight / 4 {
        return imbalance;
    }
    if imbalance <= NUMA_IMBALANCE_MIN {
        return 0;
    }
    imbalance
}

fn shr_bound(v: u64, shift: u32) -> u64 {
    v >> shift.min(63)
}

impl Sched {
    pub(crate) fn sched_asym_prefer(&self, a: CpuId, b: CpuId) -> bool {
        self.topo.cpu(a.idx()).asym_prio() > self.topo.cpu(b.idx()).asym_prio()
    }

    /// `cpu` lost a noticeable part of its capacity to other classes.
    fn check_cpu_capacity(&self, cpu: CpuId, sd: &SchedDomain) -> bool {
        self.capacity_of(cpu) * sd.imbalance_pct < self.capacity_orig_of(cpu) * 100
    }

    // ---- statistics ----

    fn update_sg_lb_stats(&self, env: &LbEnv, sd: &SchedDomain, sg: &SchedGroup, local: bool, sds: &mut SdLbStats) -> SgLbStats {
        let mut sgs = SgLbStats::default();
        for cpu in sg.span.and(&env.cpus).cpus() {
            let rq = &self.rqs[cpu.idx()];
            let nr_running = rq.nr_running;
            let misfit = rq.misfit_task_load;
            sgs.group_load += self.cpu_load(cpu);
            sgs.group_util += self.cpu_util_cfs(cpu);
            sgs.group_runnable += self.cpu_runnable(cpu);
            sgs.sum_h_nr_running += rq.cfs_h_nr_running();
            sgs.sum_nr_running += nr_running;
            if nr_running > 1 {
                sds.overloaded = true;
            }
            if self.cpu_overutilized(cpu) {
                sds.overutilized = true;
            }
            if nr_running == 0 && self.is_idle_cpu(cpu) {
                sgs.idle_cpus += 1;
                continue;
            }
            if local {
                continue;
            }
            if sd.has(SdFlags::ASYM_CPUCAPACITY) && sgs.group_misfit_task_load < misfit {
                sgs.group_misfit_task_load = misfit;
                sds.overloaded = true;
            }
        }
        let cap = sg.capacity();
        sgs.group_capacity = cap.capacity.max(1);
        sgs.group_weight = sg.weight() as u32;

        if sd.has(SdFlags::ASYM_PACKING)
            && env.idle != CpuIdleType::NotIdle
            && sgs.sum_h_nr_running > 0
            && !local
            && self.sched_asym_prefer(env.dst_cpu, CpuId(sg.asym_prefer_cpu as u32))
        {
            sgs.group_asym_packing = true;
        }
        sgs.group_type = group_classify(sd.imbalance_pct, cap.imbalance, &sgs);
        sgs.avg_load = sgs.group_load * SCHED_CAPACITY_SCALE / sgs.group_capacity;
        sgs
    }

    fn update_sd_pick_busiest(&self, env: &LbEnv, sd: &SchedDomain, sds: &SdLbStats, sg: &SchedGroup, sgs: &SgLbStats) -> bool {
        let busiest = &sds.busiest_stat;
        if sgs.sum_h_nr_running == 0 {
            return false;
        }
        let cap = sg.capacity();
        if sgs.group_type == GroupType::Misfit
            && (!capacity_greater(self.capacity_of(env.dst_cpu), cap.max_capacity)
                || sds.local_stat.group_type != GroupType::HasSpare)
        {
            return false;
        }
        if sds.busiest.is_none() {
            return true;
        }
        if sgs.group_type != busiest.group_type {
            return sgs.group_type > busiest.group_type;
        }
        match sgs.group_type {
            GroupType::Overloaded | GroupType::FullyBusy => {
                if sgs.avg_load <= busiest.avg_load {
                    return false;
                }
            }
            // The first imbalanced group wins.
            GroupType::Imbalanced => return false,
            GroupType::Asym => {
                let Some(b) = sds.busiest else {
                    return true;
                };
                let prev = CpuId(sd.groups[b].asym_prefer_cpu as u32);
                if self.sched_asym_prefer(CpuId(sg.asym_prefer_cpu as u32), prev) {
                    return false;
                }
            }
            GroupType::Misfit => {
                if sgs.group_misfit_task_load < busiest.group_misfit_task_load {
                    return false;
                }
            }
            GroupType::HasSpare => {
                if sgs.idle_cpus > busiest.idle_cpus {
                    return false;
                }
                if sgs.idle_cpus == busiest.idle_cpus && sgs.sum_nr_running <= busiest.sum_nr_running {
                    return false;
                }
            }
        }
        // Do not move tasks that already run alone on bigger CPUs.
        if sd.has(SdFlags::ASYM_CPUCAPACITY)
            && sgs.group_type <= GroupType::FullyBusy
            && capacity_greater(cap.min_capacity, self.capacity_of(env.dst_cpu))
        {
            return false;
        }
        true
    }

    /// Recompute how many LLC CPUs a wakeup should scan for an idle one:
    /// fewer as the LLC fills up.
    fn update_idle_cpu_scan(&self, sd: &SchedDomain, sum_util: u64) {
        if !self.tunables.feat(SchedFeatures::SIS_UTIL) {
            return;
        }
        let Some(shared) = sd.shared.as_ref() else {
            return;
        };
        let llc_weight = sd.weight().max(1) as u64;
        let x = sum_util / llc_weight;
        let pct = sd.imbalance_pct;
        let tmp = (x * x * pct * pct / (10_000 * SCHED_CAPACITY_SCALE)).min(SCHED_CAPACITY_SCALE);
        let y = (SCHED_CAPACITY_SCALE - tmp) * llc_weight / SCHED_CAPACITY_SCALE;
        shared.nr_idle_scan.store(y as usize, Ordering::Release);
    }

    fn update_sd_lb_stats(&mut self, env: &LbEnv, chain: &[SchedDomain]) -> SdLbStats {
        let sd = &chain[env.level];
        let mut sds = SdLbStats::default();
        let mut sum_util = 0;
        for (i, sg) in sd.groups.iter().enumerate() {
            let local = i == 0;
            if local && (env.idle != CpuIdleType::NewlyIdle || self.jiffies >= sg.capacity().next_update) {
                self.update_group_capacity(env.dst_cpu, env.level);
            }
            let sgs = self.update_sg_lb_stats(env, sd, sg, local, &mut sds);
            sum_util += sgs.group_util;
            sds.total_load += sgs.group_load;
            sds.total_capacity += sgs.group_capacity;
            if local {
                sds.local_stat = sgs;
            } else if self.update_sd_pick_busiest(env, sd, &sds, sg, &sgs) {
                sds.busiest = Some(i);
                sds.busiest_stat = sgs;
            }
        }
        sds.prefer_sibling = env
            .level
            .checked_sub(1)
            .and_then(|l| chain.get(l))
            .is_some_and(|child| child.has(SdFlags::PREFER_SIBLING));

        if self.domains.caches(env.dst_cpu).llc == Some(env.level) {
            self.update_idle_cpu_scan(sd, sum_util);
        }
        let rd = self.rd(env.dst_cpu);
        if env.level + 1 == chain.len() {
            rd.set_overload(sds.overloaded);
            rd.set_overutilized(sds.overutilized);
        } else if sds.overutilized {
            rd.set_overutilized(true);
        }
        sds
    }

    // ---- imbalance ----

    fn calculate_imbalance(&self, env: &mut LbEnv, sd: &SchedDomain, sds: &mut SdLbStats) {
        let busiest = sds.busiest_stat.clone();
        match busiest.group_type {
            GroupType::Misfit => {
                env.migration_type = MigrationType::Misfit;
                env.imbalance = 1;
                return;
            }
            GroupType::Asym => {
                env.migration_type = MigrationType::Task;
                env.imbalance = busiest.sum_h_nr_running as u64;
                return;
            }
            GroupType::Imbalanced => {
                env.migration_type = MigrationType::Task;
                env.imbalance = 1;
                return;
            }
            _ => {}
        }

        let local = &mut sds.local_stat;
        if local.group_type == GroupType::HasSpare {
            if busiest.group_type > GroupType::FullyBusy {
                // Fill the local group's spare capacity.
                env.migration_type = MigrationType::Util;
                env.imbalance = local.group_capacity.max(local.group_util) - local.group_util;
                if env.idle != CpuIdleType::NotIdle && env.imbalance == 0 {
                    env.migration_type = MigrationType::Task;
                    env.imbalance = 1;
                }
                return;
            }
            env.migration_type = MigrationType::Task;
            if busiest.group_weight == 1 || sds.prefer_sibling {
                let diff = busiest.sum_nr_running.saturating_sub(local.sum_nr_running);
                env.imbalance = (diff >> 1) as u64;
            } else {
                env.imbalance = (local.idle_cpus.saturating_sub(busiest.idle_cpus) >> 1) as u64;
            }
            if sd.has(SdFlags::NUMA) {
                env.imbalance = adjust_numa_imbalance(env.imbalance, local.sum_nr_running + 1, local.group_weight);
            }
            return;
        }

        if local.group_type < GroupType::Overloaded {
            local.avg_load = local.group_load * SCHED_CAPACITY_SCALE / local.group_capacity.max(1);
            if local.avg_load >= busiest.avg_load {
                env.imbalance = 0;
                return;
            }
        }
        sds.avg_load = SCHED_CAPACITY_SCALE * sds.total_load / sds.total_capacity.max(1);
        let local = &sds.local_stat;
        if local.avg_load >= sds.avg_load {
            env.imbalance = 0;
            return;
        }
        env.migration_type = MigrationType::Load;
        let pull = (busiest.avg_load.saturating_sub(sds.avg_load)) * busiest.group_capacity;
        let push = (sds.avg_load - local.avg_load) * local.group_capacity;
        env.imbalance = pull.min(push) / SCHED_CAPACITY_SCALE;
    }

    /// Index of the group to pull from, with `env.imbalance` set, or `None`
    /// when the domain is balanced.
    fn find_busiest_group(&mut self, env: &mut LbEnv, chain: &[SchedDomain]) -> Option<usize> {
        let sd = &chain[env.level];
        let mut sds = self.update_sd_lb_stats(env, chain);

        let rd = self.rd(env.dst_cpu);
        if !rd.pd.is_empty() && !rd.overutilized() {
            return None;
        }
        let idx = sds.busiest?;
        let busiest = sds.busiest_stat.clone();
        let local = sds.local_stat.clone();
        if busiest.sum_h_nr_running == 0 {
            return None;
        }

        let forced = matches!(
            busiest.group_type,
            GroupType::Misfit | GroupType::Asym | GroupType::Imbalanced
        );
        if !forced {
            if local.group_type > busiest.group_type {
                return None;
            }
            if local.group_type == GroupType::Overloaded {
                if local.avg_load >= busiest.avg_load {
                    return None;
                }
                sds.avg_load = SCHED_CAPACITY_SCALE * sds.total_load / sds.total_capacity.max(1);
                if local.avg_load >= sds.avg_load {
                    return None;
                }
                if 100 * busiest.avg_load <= sd.imbalance_pct * local.avg_load {
                    return None;
                }
            }
            let spread = sds.prefer_sibling
                && local.group_type == GroupType::HasSpare
                && busiest.sum_nr_running > local.sum_nr_running + 1;
            if !spread && busiest.group_type != GroupType::Overloaded {
                if env.idle == CpuIdleType::NotIdle {
                    return None;
                }
                if busiest.group_weight > 1 && local.idle_cpus <= busiest.idle_cpus + 1 {
                    return None;
                }
                if busiest.sum_h_nr_running == 1 {
                    return None;
                }
            }
        }
        self.calculate_imbalance(env, sd, &mut sds);
        if env.imbalance == 0 {
            return None;
        }
        Some(idx)
    }

    fn find_busiest_queue(&self, env: &LbEnv, sd: &SchedDomain, sg: &SchedGroup) -> Option<CpuId> {
        let dst_cap = self.capacity_of(env.dst_cpu);
        let span = sg.span.and(&env.cpus);
        let candidates = span.cpus().filter(|&cpu| {
            let nr = self.rqs[cpu.idx()].cfs_h_nr_running();
            if nr == 0 {
                return false;
            }
            let cap = self.capacity_of(cpu);
            if sd.has(SdFlags::ASYM_CPUCAPACITY) && !capacity_greater(dst_cap, cap) && nr == 1 {
                return false;
            }
            if sd.has(SdFlags::ASYM_PACKING) && self.sched_asym_prefer(cpu, env.dst_cpu) && nr == 1 {
                return false;
            }
            true
        });
        match env.migration_type {
            MigrationType::Load => candidates
                .filter(|&cpu| {
                    let nr = self.rqs[cpu.idx()].cfs_h_nr_running();
                    nr > 1 || self.cpu_load(cpu) <= env.imbalance || self.check_cpu_capacity(cpu, sd)
                })
                .max_by_key(|&cpu| OrderedFloat(self.cpu_load(cpu) as f64 / self.capacity_of(cpu) as f64)),
            MigrationType::Util => candidates
                .filter(|&cpu| self.rqs[cpu.idx()].nr_running > 1)
                .max_by_key(|&cpu| self.cpu_util_cfs(cpu)),
            MigrationType::Task => candidates.max_by_key(|&cpu| self.rqs[cpu.idx()].cfs_h_nr_running()),
            MigrationType::Misfit => candidates
                .filter(|&cpu| self.rqs[cpu.idx()].misfit_task_load > 0)
                .max_by_key(|&cpu| self.rqs[cpu.idx()].misfit_task_load),
        }
    }

    // ---- moving tasks ----

    fn task_hot(&self, env: &LbEnv, sd: &SchedDomain, p: Pid) -> bool {
        let t = &self.tasks[p];
        if t.class != ClassId::Fair || t.policy == Policy::Idle {
            return false;
        }
        // SMT siblings share every cache level.
        if sd.has(SdFlags::SHARE_CPUCAPACITY) {
            return false;
        }
        if self.tunables.feat(SchedFeatures::CACHE_HOT_BUDDY) && self.rqs[env.dst_cpu.idx()].nr_running > 0 {
            let cfs = self.cfs_rq(env.src_cpu, t.se.cfs_rq);
            let me = Some(EntityRef::Task(p));
            if cfs.next == me || cfs.last == me {
                return true;
            }
        }
        let cost = self.tunables.sched_migration_cost_ns;
        if cost == 0 {
            return false;
        }
        let delta = self.rqs[env.src_cpu.idx()].clock.task().saturating_sub(t.se.exec_start);
        delta < cost
    }

    fn throttled_lb_pair(&self, p: Pid, src: CpuId, dst: CpuId) -> bool {
        let g = self.tasks[p].se.cfs_rq;
        let src_throttled = self.cfs_rq(src, g).is_throttled_hierarchy();
        let dst_throttled = self.rqs[dst.idx()].cfs_rq(g).is_some_and(|c| c.is_throttled_hierarchy());
        src_throttled || dst_throttled
    }

    fn can_migrate_task(&mut self, env: &mut LbEnv, sd: &SchedDomain, p: Pid) -> bool {
        if self.throttled_lb_pair(p, env.src_cpu, env.dst_cpu) {
            return false;
        }
        let t = &self.tasks[p];
        if !t.cpus_allowed.has(env.dst_cpu) || t.migration_disabled > 0 {
            self.tasks[p].stats.nr_failed_migrations_affine += 1;
            env.flags |= LbfFlags::SOME_PINNED;
            if env.idle == CpuIdleType::NewlyIdle || env.flags.intersects(LbfFlags::DST_PINNED | LbfFlags::ACTIVE_LB) {
                return false;
            }
            // Maybe another CPU of our group can take it.
            let allowed = &self.tasks[p].cpus_allowed;
            if let Some(cpu) = env.dst_grpmask.and(&env.cpus).cpus().find(|&c| allowed.has(c)) {
                env.flags |= LbfFlags::DST_PINNED;
                env.new_dst_cpu = Some(cpu);
            }
            return false;
        }
        env.flags.remove(LbfFlags::ALL_PINNED);

        if self.rqs[env.src_cpu.idx()].curr == p {
            self.tasks[p].stats.nr_failed_migrations_running += 1;
            return false;
        }
        if env.flags.contains(LbfFlags::ACTIVE_LB) {
            return true;
        }
        let hot = self.task_hot(env, sd, p);
        let failed = sd.balance.lock().nr_balance_failed;
        if !hot || failed > sd.cache_nice_tries {
            if hot {
                self.tasks[p].stats.nr_forced_migrations += 1;
                sd.balance.lock().stats.lb_mut(env.idle).lb_hot_gained += 1;
            }
            return true;
        }
        self.tasks[p].stats.nr_failed_migrations_hot += 1;
        false
    }

    fn detach_task(&mut self, env: &LbEnv, p: Pid) {
        self.deactivate_task(env.src_cpu, p, DequeueFlags::NOCLOCK);
        self.notify_migrating(p);
        self.set_task_cpu(p, env.dst_cpu);
    }

    /// Detach tasks from the source, least recently run first, until the
    /// imbalance is covered.
    fn detach_tasks(&mut self, env: &mut LbEnv, sd: &SchedDomain) -> Vec<Pid> {
        let mut detached = vec![];
        if env.imbalance == 0 {
            return detached;
        }
        let snapshot: Vec<Pid> = self.rqs[env.src_cpu.idx()].cfs_tasks.iter().rev().copied().collect();
        let nr_migrate = self.tunables.sched_nr_migrate;
        let failed = sd.balance.lock().nr_balance_failed;
        let lb_min = self.tunables.feat(SchedFeatures::LB_MIN);
        for p in snapshot {
            if env.idle != CpuIdleType::NotIdle && self.rqs[env.src_cpu.idx()].nr_running <= 1 {
                break;
            }
            if self.tasks[p].cpu != env.src_cpu || !self.tasks[p].is_queued() {
                continue;
            }
            env.loop_ += 1;
            if env.loop_ > env.loop_max {
                break;
            }
            if env.loop_ > env.loop_break {
                env.loop_break += nr_migrate;
                env.flags |= LbfFlags::NEED_BREAK;
                break;
            }
            if !self.can_migrate_task(env, sd, p) {
                continue;
            }
            match env.migration_type {
                MigrationType::Load => {
                    let load = self.task_h_load(p).max(1);
                    if lb_min && load < 16 && failed == 0 {
                        continue;
                    }
                    if shr_bound(load, failed) > env.imbalance {
                        continue;
                    }
                    env.imbalance = env.imbalance.saturating_sub(load);
                }
                MigrationType::Util => {
                    let util = self.task_util_est(p);
                    if util > env.imbalance {
                        continue;
                    }
                    env.imbalance -= util;
                }
                MigrationType::Task => env.imbalance = env.imbalance.saturating_sub(1),
                MigrationType::Misfit => {
                    if self.task_fits_cpu(p, env.src_cpu) {
                        continue;
                    }
                    env.imbalance = 0;
                }
            }
            self.detach_task(env, p);
            detached.push(p);
            // Newidle balancing adds latency; one task is enough.
            if env.idle == CpuIdleType::NewlyIdle || env.imbalance == 0 {
                break;
            }
        }
        sd.balance.lock().stats.lb_mut(env.idle).lb_gained += detached.len() as u64;
        detached
    }

    fn attach_tasks(&mut self, dst: CpuId, tasks: &[Pid]) {
        self.update_rq_clock(dst);
        for &p in tasks {
            self.activate_task(dst, p, EnqueueFlags::NOCLOCK);
            self.check_preempt_curr(dst, p, WakeFlags::empty());
        }
    }

    /// Only one CPU of the local group balances at a given level: the
    /// first idle one, else the group's designated balance CPU.
    fn should_we_balance(&self, env: &LbEnv, sd: &SchedDomain) -> bool {
        if !env.cpus.has(env.dst_cpu) {
            return false;
        }
        if env.idle == CpuIdleType::NewlyIdle {
            let rq = &self.rqs[env.dst_cpu.idx()];
            return rq.nr_running == 0 && rq.wake_list.is_empty();
        }
        let Some(sg) = sd.local_group() else {
            return false;
        };
        let mask = sg.balance_mask.and(&env.cpus);
        if let Some(cpu) = mask.cpus().find(|&c| self.is_idle_cpu(c)) {
            return cpu == env.dst_cpu;
        }
        sg.balance_cpu() == Some(env.dst_cpu.idx())
    }

    fn need_active_balance(&self, env: &LbEnv, sd: &SchedDomain) -> bool {
        let failed = sd.balance.lock().nr_balance_failed;
        if env.idle != CpuIdleType::NotIdle && sd.has(SdFlags::ASYM_PACKING) && self.sched_asym_prefer(env.dst_cpu, env.src_cpu) {
            return true;
        }
        if env.migration_type == MigrationType::Task && failed > sd.cache_nice_tries + 2 {
            return true;
        }
        let src = &self.rqs[env.src_cpu.idx()];
        if env.idle != CpuIdleType::NotIdle
            && src.cfs_h_nr_running() == 1
            && self.check_cpu_capacity(env.src_cpu, sd)
            && self.capacity_of(env.src_cpu) * sd.imbalance_pct < self.capacity_of(env.dst_cpu) * 100
        {
            return true;
        }
        if env.migration_type == MigrationType::Misfit {
            return true;
        }
        failed > sd.cache_nice_tries + 2
    }

    /// Balance `cpu` against the rest of its domain at `level`. Returns the
    /// number of tasks pulled and whether higher levels should still be
    /// balanced.
    pub(crate) fn load_balance(&mut self, cpu: CpuId, level: usize, idle: CpuIdleType) -> (u32, bool) {
        let tree = self.domains.clone();
        let chain = tree.domains(cpu);
        let Some(sd) = chain.get(level) else {
            return (0, false);
        };
        let parent = chain.get(level + 1);
        let nr_migrate = self.tunables.sched_nr_migrate;
        let mut env = LbEnv {
            level,
            src_cpu: cpu,
            dst_cpu: cpu,
            dst_grpmask: sd.local_group().map(|g| g.span.clone()).unwrap_or_else(|| sd.span.clone()),
            new_dst_cpu: None,
            idle,
            imbalance: 0,
            cpus: sd.span.and(&self.active),
            flags: LbfFlags::empty(),
            loop_: 0,
            loop_break: nr_migrate,
            loop_max: 0,
            migration_type: MigrationType::Load,
        };
        sd.balance.lock().stats.lb_mut(idle).lb_count += 1;

        let mut moved = 0u32;
        let mut continue_balancing = true;
        let mut active_started = false;

        #[derive(PartialEq)]
        enum Outcome {
            Done,
            Balanced,
            OnePinned,
        }

        let outcome = 'lb: loop {
            if !self.should_we_balance(&env, sd) {
                continue_balancing = false;
                break 'lb Outcome::Balanced;
            }
            let Some(gidx) = self.find_busiest_group(&mut env, chain) else {
                sd.balance.lock().stats.lb_mut(idle).lb_nobusyg += 1;
                break 'lb Outcome::Balanced;
            };
            let Some(busiest) = self.find_busiest_queue(&env, sd, &sd.groups[gidx]) else {
                sd.balance.lock().stats.lb_mut(idle).lb_nobusyq += 1;
                break 'lb Outcome::Balanced;
            };
            debug_assert_ne!(busiest, env.dst_cpu);
            sd.balance.lock().stats.lb_mut(idle).lb_imbalance += env.imbalance;

            env.src_cpu = busiest;
            env.flags |= LbfFlags::ALL_PINNED;
            if self.rqs[busiest.idx()].nr_running > 1 {
                env.loop_max = nr_migrate.min(self.rqs[busiest.idx()].nr_running);
                loop {
                    self.update_rq_clock(busiest);
                    let pulled = self.detach_tasks(&mut env, sd);
                    if !pulled.is_empty() {
                        self.attach_tasks(env.dst_cpu, &pulled);
                        moved += pulled.len() as u32;
                    }
                    if env.flags.contains(LbfFlags::NEED_BREAK) {
                        env.flags.remove(LbfFlags::NEED_BREAK);
                        if env.loop_ < env.loop_max {
                            continue;
                        }
                    }
                    // Some tasks only fit another CPU of our group.
                    if env.flags.contains(LbfFlags::DST_PINNED) && env.imbalance > 0 {
                        if let Some(new_dst) = env.new_dst_cpu.take() {
                            env.cpus.clear_cpu(env.dst_cpu.idx());
                            env.dst_cpu = new_dst;
                            env.flags.remove(LbfFlags::DST_PINNED);
                            env.loop_ = 0;
                            env.loop_break = nr_migrate;
                            continue;
                        }
                    }
                    break;
                }
                if let Some(parent) = parent {
                    if env.flags.contains(LbfFlags::SOME_PINNED) && env.imbalance > 0 {
                        if let Some(g) = parent.local_group() {
                            g.sgc.lock().imbalance = true;
                        }
                    }
                }
                if env.flags.contains(LbfFlags::ALL_PINNED) {
                    env.cpus.clear_cpu(busiest.idx());
                    if !env.cpus.is_subset(&env.dst_grpmask) {
                        env.loop_ = 0;
                        env.loop_break = nr_migrate;
                        continue 'lb;
                    }
                    break 'lb Outcome::OnePinned;
                }
            }

            if moved == 0 {
                sd.balance.lock().stats.lb_mut(idle).lb_failed += 1;
                if idle != CpuIdleType::NewlyIdle {
                    sd.balance.lock().nr_balance_failed += 1;
                }
                if self.need_active_balance(&env, sd) {
                    let curr = self.rqs[busiest.idx()].curr;
                    if !self.tasks[curr].cpus_allowed.has(env.dst_cpu) {
                        env.flags |= LbfFlags::ALL_PINNED;
                        break 'lb Outcome::OnePinned;
                    }
                    env.flags.remove(LbfFlags::SOME_PINNED);
                    if !self.rqs[busiest.idx()].active_balance {
                        self.start_active_balance(busiest, env.dst_cpu);
                        active_started = true;
                    }
                    let mut b = sd.balance.lock();
                    b.nr_balance_failed = sd.cache_nice_tries + 1;
                }
            } else {
                sd.balance.lock().nr_balance_failed = 0;
            }
            if !active_started || self.need_active_balance(&env, sd) {
                sd.balance.lock().balance_interval = sd.min_interval;
            }
            break 'lb Outcome::Done;
        };

        if outcome == Outcome::Balanced {
            if let Some(parent) = parent {
                if !env.flags.contains(LbfFlags::ALL_PINNED) {
                    if let Some(g) = parent.local_group() {
                        g.sgc.lock().imbalance = false;
                    }
                }
            }
            let mut b = sd.balance.lock();
            b.stats.lb_mut(idle).lb_balanced += 1;
            b.nr_balance_failed = 0;
        }
        if outcome != Outcome::Done && idle != CpuIdleType::NewlyIdle {
            let mut b = sd.balance.lock();
            let pinned = env.flags.contains(LbfFlags::ALL_PINNED) && b.balance_interval < MAX_PINNED_INTERVAL;
            if pinned || b.balance_interval < sd.max_interval {
                b.balance_interval = (b.balance_interval * 2).max(1);
            }
        }
        if moved > 0 {
            debug!(cpu = cpu.0, src = env.src_cpu.0, moved, idle = idle.name(), level, "load balance");
            self.emit(SchedEvent::Balanced {
                cpu,
                src: env.src_cpu,
                moved,
                idle,
            });
        }
        self.notify_after_balance(cpu);
        (moved, continue_balancing)
    }

    // ---- active balance ----

    fn start_active_balance(&mut self, src: CpuId, dst: CpuId) {
        let expires = self.now + 2 * self.tunables.tick_ns();
        let handle = self.timers.arm(TimerEvent::ActiveBalanceTimeout(src), expires, Some(src));
        let rq = &mut self.rqs[src.idx()];
        rq.active_balance = true;
        rq.push_cpu = Some(dst);
        rq.active_balance_timer = Some(handle);
        trace!(src = src.0, dst = dst.0, "active balance queued");
        self.stop_one_cpu_nowait(src, StopWork::ActiveBalance { dst });
    }

    /// Stop work on `src`: push one fair task to the idle `dst`.
    pub(crate) fn active_load_balance_cpu_stop(&mut self, src: CpuId, dst: CpuId) {
        if let Some(h) = self.rqs[src.idx()].active_balance_timer.take() {
            self.timers.cancel(h);
        }
        let mut pushed = None;
        let rq = &self.rqs[src.idx()];
        let runnable = rq.online && rq.active_balance && self.active.has(dst) && rq.cfs_h_nr_running() > 0;
        if runnable {
            let tree = self.domains.clone();
            let chain = tree.domains(dst);
            if let Some(level) = chain.iter().position(|sd| sd.span.has(src)) {
                let sd = &chain[level];
                sd.balance.lock().stats.alb_count += 1;
                let mut env = LbEnv {
                    level,
                    src_cpu: src,
                    dst_cpu: dst,
                    dst_grpmask: Cpumask::new(self.nr_cpus()),
                    new_dst_cpu: None,
                    idle: CpuIdleType::Idle,
                    imbalance: 0,
                    cpus: sd.span.clone(),
                    flags: LbfFlags::ACTIVE_LB,
                    loop_: 0,
                    loop_break: 0,
                    loop_max: 0,
                    migration_type: MigrationType::Task,
                };
                self.update_rq_clock(src);
                let snapshot: Vec<Pid> = self.rqs[src.idx()].cfs_tasks.iter().rev().copied().collect();
                for p in snapshot {
                    if self.tasks[p].is_queued() && self.can_migrate_task(&mut env, sd, p) {
                        self.detach_task(&env, p);
                        self.attach_tasks(dst, &[p]);
                        pushed = Some(p);
                        break;
                    }
                }
                let mut b = sd.balance.lock();
                if pushed.is_some() {
                    b.stats.alb_pushed += 1;
                } else {
                    b.stats.alb_failed += 1;
                }
            }
        }
        let rq = &mut self.rqs[src.idx()];
        rq.active_balance = false;
        rq.push_cpu = None;
        debug!(src = src.0, dst = dst.0, pid = ?pushed.map(|p| p.0), "active balance");
        self.emit(SchedEvent::ActiveBalance { src, dst, pid: pushed });
    }

    /// The stop task did not get to the queued push in time.
    pub(crate) fn active_balance_timeout(&mut self, cpu: CpuId) {
        let rq = &mut self.rqs[cpu.idx()];
        rq.active_balance_timer = None;
        if !rq.active_balance {
            return;
        }
        rq.active_balance = false;
        let dst = rq.push_cpu.take();
        rq.stop_work.retain(|w| !matches!(w, StopWork::ActiveBalance { .. }));
        debug!(cpu = cpu.0, dst = ?dst.map(|c| c.0), "active balance abandoned");
    }

    // ---- periodic balance ----

    /// Balance interval of `sd` in jiffies.
    fn get_sd_balance_interval(&self, sd: &SchedDomain, cpu_busy: bool) -> u64 {
        let mut interval = sd.balance.lock().balance_interval.max(1);
        if cpu_busy {
            interval *= sd.busy_factor.max(1);
        }
        let jiffies = interval * self.tunables.hz / 1000;
        let max = (self.tunables.hz * self.online.weight() as u64 / 10).max(1);
        jiffies.clamp(1, max)
    }

    fn update_next_balance(&self, sd: &SchedDomain, next_balance: &mut u64) {
        let interval = self.get_sd_balance_interval(sd, false);
        let next = sd.balance.lock().last_balance + interval;
        if next < *next_balance {
            *next_balance = next;
        }
    }

    /// Walk `cpu`'s domains and balance every level that is due.
    pub(crate) fn rebalance_domains(&mut self, cpu: CpuId, mut idle: CpuIdleType) {
        let tree = self.domains.clone();
        let chain = tree.domains(cpu);
        let mut busy = idle == CpuIdleType::NotIdle;
        let mut continue_balancing = true;
        let mut next_balance = self.jiffies + 60 * self.tunables.hz;
        let mut update_next = false;
        let mut need_decay = false;
        let mut max_cost = 0;

        for (level, sd) in chain.iter().enumerate() {
            {
                let mut b = sd.balance.lock();
                if self.now > b.last_decay_max_lb_cost + NSEC_PER_SEC {
                    b.max_newidle_lb_cost = b.max_newidle_lb_cost * 253 / 256;
                    b.last_decay_max_lb_cost = self.now;
                    need_decay = true;
                }
                max_cost += b.max_newidle_lb_cost;
            }
            if !continue_balancing {
                if need_decay {
                    continue;
                }
                break;
            }
            let mut interval = self.get_sd_balance_interval(sd, busy);
            let last = sd.balance.lock().last_balance;
            if self.jiffies >= last + interval {
                let (moved, cont) = self.load_balance(cpu, level, idle);
                continue_balancing = cont;
                if moved > 0 {
                    idle = if self.is_idle_cpu(cpu) {
                        CpuIdleType::Idle
                    } else {
                        CpuIdleType::NotIdle
                    };
                    busy = idle == CpuIdleType::NotIdle && !self.sched_idle_rq(cpu);
                }
                sd.balance.lock().last_balance = self.jiffies;
                interval = self.get_sd_balance_interval(sd, busy);
            }
            let next = sd.balance.lock().last_balance + interval;
            if next < next_balance {
                next_balance = next;
                update_next = true;
            }
        }
        let migration_cost = self.tunables.sched_migration_cost_ns;
        let rq = &mut self.rqs[cpu.idx()];
        if need_decay {
            rq.max_idle_balance_cost = max_cost.max(migration_cost);
        }
        if update_next {
            rq.next_balance = next_balance;
        }
    }

    /// Tick hook: run the periodic balance when due, then see whether the
    /// idle load balancer needs a kick.
    pub(crate) fn trigger_load_balance(&mut self, cpu: CpuId) {
        if !self.active.has(cpu) || self.domains.domains(cpu).is_empty() {
            return;
        }
        let rq = &self.rqs[cpu.idx()];
        // A higher class is about to take the CPU; balance next tick.
        let preempting = rq.need_resched && rq.nr_running > rq.cfs_h_nr_running();
        if self.jiffies >= rq.next_balance && !preempting {
            let idle = if rq.nohz.idle_balance {
                CpuIdleType::Idle
            } else {
                CpuIdleType::NotIdle
            };
            self.update_blocked_averages(cpu);
            self.rebalance_domains(cpu, idle);
        }
        self.nohz_balancer_kick(cpu);
    }

    // ---- newidle balance ----

    /// Try to pull work before `cpu` goes idle. Returns the number of tasks
    /// pulled, or -1 if a task of a higher class showed up meanwhile.
    pub(crate) fn newidle_balance(&mut self, cpu: CpuId) -> i32 {
        if !self.active.has(cpu) || !self.rqs[cpu.idx()].online {
            return 0;
        }
        self.update_misfit_status(cpu, None);
        let rq = &mut self.rqs[cpu.idx()];
        rq.idle_stamp = rq.clock.wall().max(1);

        let tree = self.domains.clone();
        let chain = tree.domains(cpu);
        let mut next_balance = self.jiffies + self.tunables.hz;
        let mut pulled: i32 = 0;

        let avg_idle = self.rqs[cpu.idx()].avg_idle;
        if avg_idle < self.tunables.sched_migration_cost_ns || !self.rd(cpu).overloaded() {
            if let Some(sd) = chain.first() {
                self.update_next_balance(sd, &mut next_balance);
            }
            self.nohz_newidle_balance(cpu);
        } else {
            self.update_blocked_averages(cpu);
            let mut curr_cost = 0;
            for (level, sd) in chain.iter().enumerate() {
                self.update_next_balance(sd, &mut next_balance);
                let max_cost = sd.balance.lock().max_newidle_lb_cost;
                if self.rqs[cpu.idx()].avg_idle < curr_cost + max_cost {
                    break;
                }
                if sd.has(SdFlags::BALANCE_NEWIDLE) {
                    let (moved, _) = self.load_balance(cpu, level, CpuIdleType::NewlyIdle);
                    pulled += moved as i32;
                    let cost = sd.weight() as u64 * NEWIDLE_COST_PER_CPU_NS;
                    let mut b = sd.balance.lock();
                    b.max_newidle_lb_cost = b.max_newidle_lb_cost.max(cost);
                    curr_cost += cost;
                }
                let rq = &self.rqs[cpu.idx()];
                if pulled > 0 || rq.nr_running > 0 || !rq.wake_list.is_empty() {
                    break;
                }
            }
            let rq = &mut self.rqs[cpu.idx()];
            rq.max_idle_balance_cost = rq.max_idle_balance_cost.max(curr_cost);
        }

        let rq = &mut self.rqs[cpu.idx()];
        if next_balance < rq.next_balance {
            rq.next_balance = next_balance;
        }
        if rq.nr_running != rq.cfs_h_nr_running() {
            pulled = -1;
        }
        if pulled != 0 {
            rq.idle_stamp = 0;
        }
        trace!(cpu = cpu.0, pulled, "newidle balance");
        pulled
    }

    /// Whether the fair load fits `cpu` with the usual headroom.
    pub fn cpu_has_spare_capacity(&self, cpu: CpuId) -> bool {
        fits_capacity(self.cpu_util_cfs(cpu), self.capacity_of(cpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sgs(nr: u32, weight: u32, cap: u64, util: u64, runnable: u64) -> SgLbStats {
        SgLbStats {
            sum_nr_running: nr,
            sum_h_nr_running: nr,
            group_weight: weight,
            group_capacity: cap,
            group_util: util,
            group_runnable: runnable,
            ..Default::default()
        }
    }

    #[test]
    fn classify_by_pressure() {
        assert_eq!(group_classify(117, false, &sgs(1, 2, 2048, 500, 500)), GroupType::HasSpare);
        assert_eq!(group_classify(117, false, &sgs(2, 2, 2048, 1900, 1900)), GroupType::FullyBusy);
        assert_eq!(group_classify(117, false, &sgs(4, 2, 2048, 2000, 4000)), GroupType::Overloaded);
        assert_eq!(group_classify(117, true, &sgs(2, 2, 2048, 500, 500)), GroupType::Imbalanced);
    }

    #[test]
    fn packing_outranks_misfit() {
        let mut s = sgs(1, 2, 2048, 500, 500);
        s.group_misfit_task_load = 100;
        assert_eq!(group_classify(117, false, &s), GroupType::Misfit);
        s.group_asym_packing = true;
        assert_eq!(group_classify(117, false, &s), GroupType::Asym);
        assert!(GroupType::Asym > GroupType::Misfit);
    }

    #[test]
    fn small_numa_imbalance_tolerated() {
        assert_eq!(adjust_numa_imbalance(2, 1, 16), 0);
        assert_eq!(adjust_numa_imbalance(3, 1, 16), 3);
        assert_eq!(adjust_numa_imbalance(2, 8, 16), 2);
    }

    #[test]
    fn shift_is_bounded() {
        assert_eq!(shr_bound(1024, 2), 256);
        assert_eq!(shr_bound(1024, 100), 0);
    }
}
