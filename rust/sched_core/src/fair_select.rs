// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU selection for waking, forking and exec'ing fair tasks.
//!
//! Wakeups take the fast path: stay near the waker or the previous CPU
//! and look for an idle CPU that shares the cache. Fork and exec take the
//! slow path and walk down the domains picking the idlest group at each
//! level. With a performance-domain list and no overutilized CPU, wakeups
//! first try the most energy-efficient CPU instead.

use std::sync::atomic::Ordering;

use tracing::trace;

use crate::capacity::fits_capacity;
use crate::core::Sched;
use crate::cpumask::Cpumask;
use crate::energy::PerfDomain;
use crate::load_balance::group_classify;
use crate::load_balance::GroupType;
use crate::load_balance::SgLbStats;
use crate::prio::NICE_0_LOAD;
use crate::prio::SCHED_CAPACITY_SCALE;
use crate::sched_domain::SchedDomain;
use crate::sched_domain::SchedGroup;
use crate::sched_domain::SdFlags;
use crate::task::WakeFlags;
use crate::types::CpuId;
use crate::types::Pid;

fn wake_sd_flag(wf: WakeFlags) -> SdFlags {
    if wf.contains(WakeFlags::FORK) {
        SdFlags::BALANCE_FORK
    } else if wf.contains(WakeFlags::EXEC) {
        SdFlags::BALANCE_EXEC
    } else {
        SdFlags::BALANCE_WAKE
    }
}

impl Sched {
    pub(crate) fn select_task_rq_fair(&mut self, p: Pid, prev_cpu: CpuId, wf: WakeFlags) -> CpuId {
        let sync = wf.contains(WakeFlags::SYNC);
        let cpu = self.this_cpu;
        let sd_flag = wake_sd_flag(wf);
        let mut new_cpu = prev_cpu;
        let mut want_affine = false;

        if wf.contains(WakeFlags::TTWU) {
            self.record_wakee(p);
            if let Some(target) = self.find_energy_efficient_cpu(p, prev_cpu) {
                return target;
            }
            want_affine = !self.wake_wide(p) && self.tasks[p].cpus_allowed.has(cpu);
        }

        let tree = self.domains.clone();
        let chain = tree.domains(cpu);
        let mut slow = None;
        for (level, sd) in chain.iter().enumerate() {
            if want_affine && sd.has(SdFlags::WAKE_AFFINE) && sd.span.has(prev_cpu) {
                if cpu != prev_cpu {
                    new_cpu = self.wake_affine(sd, p, cpu, prev_cpu, sync);
                }
                slow = None;
                break;
            }
            if sd.has(sd_flag) {
                slow = Some(level);
            } else if !want_affine {
                break;
            }
        }

        if let Some(level) = slow {
            new_cpu = self.find_idlest_cpu(p, cpu, prev_cpu, level, sd_flag);
        } else if wf.contains(WakeFlags::TTWU) {
            new_cpu = self.select_idle_sibling(p, prev_cpu, new_cpu);
        }
        trace!(pid = p.0, prev = prev_cpu.0, cpu = new_cpu.0, ?wf, "select_task_rq_fair");
        new_cpu
    }

    // ---- wakee tracking ----

    /// Count how often the waker switches between wakees.
    fn record_wakee(&mut self, p: Pid) {
        let curr = self.rqs[self.this_cpu.idx()].curr;
        if curr == p {
            return;
        }
        let jiffies = self.jiffies;
        let hz = self.tunables.hz;
        let w = &mut self.tasks[curr];
        if jiffies > w.wakee_flip_decay_ts + hz {
            w.wakee_flips >>= 1;
            w.wakee_flip_decay_ts = jiffies;
        }
        if w.last_wakee != Some(p) {
            w.last_wakee = Some(p);
            w.wakee_flips += 1;
        }
    }

    /// A waker fanning out to many wakees should not pull them all onto
    /// its own LLC.
    fn wake_wide(&self, p: Pid) -> bool {
        let curr = self.rqs[self.this_cpu.idx()].curr;
        let mut master = self.tasks[curr].wakee_flips;
        let mut slave = self.tasks[p].wakee_flips;
        let factor = self.domains.caches(self.this_cpu).llc_size as u32;
        if master < slave {
            std::mem::swap(&mut master, &mut slave);
        }
        !(slave < factor || master < slave * factor)
    }

    // ---- affine wakeup ----

    fn available_idle_cpu(&self, cpu: CpuId) -> bool {
        self.active.has(cpu) && self.is_idle_cpu(cpu)
    }

    fn idle_or_sched_idle(&self, cpu: CpuId) -> bool {
        self.available_idle_cpu(cpu) || (self.active.has(cpu) && self.sched_idle_rq(cpu))
    }

    fn wake_affine_idle(&self, this_cpu: CpuId, prev_cpu: CpuId, sync: bool) -> Option<CpuId> {
        if self.available_idle_cpu(this_cpu) && self.domains.share_llc(this_cpu, prev_cpu) {
            return Some(if self.available_idle_cpu(prev_cpu) { prev_cpu } else { this_cpu });
        }
        if sync && self.rqs[this_cpu.idx()].nr_running == 1 {
            return Some(this_cpu);
        }
        if self.available_idle_cpu(prev_cpu) {
            return Some(prev_cpu);
        }
        None
    }

    fn wake_affine_weight(&self, sd: &SchedDomain, p: Pid, this_cpu: CpuId, prev_cpu: CpuId, sync: bool) -> Option<CpuId> {
        let mut this_eff_load = self.cpu_load(this_cpu) as i64;
        if sync {
            let curr = self.rqs[this_cpu.idx()].curr;
            let current_load = self.task_h_load(curr) as i64;
            if current_load > this_eff_load {
                return Some(this_cpu);
            }
            this_eff_load -= current_load;
        }
        let task_load = self.task_h_load(p) as i64;
        this_eff_load += task_load;
        this_eff_load *= 100;
        this_eff_load *= self.capacity_of(prev_cpu) as i64;

        let mut prev_eff_load = self.cpu_load(prev_cpu) as i64 - task_load;
        prev_eff_load *= 100 + (sd.imbalance_pct as i64 - 100) / 2;
        prev_eff_load *= self.capacity_of(this_cpu) as i64;
        // Tie goes to the waker when it is about to sleep.
        if sync {
            prev_eff_load += 1;
        }
        (this_eff_load < prev_eff_load).then_some(this_cpu)
    }

    fn wake_affine(&mut self, sd: &SchedDomain, p: Pid, this_cpu: CpuId, prev_cpu: CpuId, sync: bool) -> CpuId {
        let target = self
            .wake_affine_idle(this_cpu, prev_cpu, sync)
            .or_else(|| self.wake_affine_weight(sd, p, this_cpu, prev_cpu, sync));
        self.tasks[p].stats.nr_wakeups_affine_attempts += 1;
        let Some(target) = target else {
            return prev_cpu;
        };
        sd.balance.lock().stats.ttwu_move_affine += 1;
        self.tasks[p].stats.nr_wakeups_affine += 1;
        target
    }

    // ---- fast path ----

    fn asym_fits_cpu(&self, task_util: u64, cpu: CpuId) -> bool {
        if !self.rd(cpu).asym_capacity() {
            return true;
        }
        fits_capacity(task_util, self.capacity_of(cpu))
    }

    fn allowed_active(&self, p: Pid) -> Cpumask {
        self.tasks[p].cpus_allowed.and(&self.active)
    }

    /// Look for an idle CPU sharing the cache with `target`, preferring
    /// `target` itself, then `prev`, then the task's recently used CPU.
    pub(crate) fn select_idle_sibling(&mut self, p: Pid, prev: CpuId, target: CpuId) -> CpuId {
        let task_util = self.uclamp_task_util(p);
        if self.idle_or_sched_idle(target) && self.asym_fits_cpu(task_util, target) {
            return target;
        }
        if prev != target
            && self.domains.share_llc(prev, target)
            && self.idle_or_sched_idle(prev)
            && self.asym_fits_cpu(task_util, prev)
        {
            return prev;
        }
        let recent = self.tasks[p].recent_used_cpu;
        self.tasks[p].recent_used_cpu = prev;
        if recent != prev
            && recent != target
            && self.domains.share_llc(recent, target)
            && self.idle_or_sched_idle(recent)
            && self.tasks[p].cpus_allowed.has(recent)
            && self.asym_fits_cpu(task_util, recent)
        {
            return recent;
        }

        let tree = self.domains.clone();
        let caches = tree.caches(target);
        if self.rd(target).asym_capacity() {
            if let Some(sd) = caches.asym_cpucapacity.and_then(|l| tree.domains(target).get(l)) {
                return self.select_idle_capacity(p, sd, target).unwrap_or(target);
            }
        }
        let Some(sd) = tree.llc_domain(target) else {
            return target;
        };
        let mut has_idle_core = false;
        if self.topo.smt_mask(target.idx()).weight() > 1 {
            has_idle_core = sd
                .shared
                .as_ref()
                .is_some_and(|s| s.has_idle_cores.load(Ordering::Acquire));
            if !has_idle_core && self.domains.share_llc(prev, target) {
                if let Some(cpu) = self.select_idle_smt(p, sd, prev) {
                    return cpu;
                }
            }
        }
        self.select_idle_cpu(p, sd, has_idle_core, target).unwrap_or(target)
    }

    /// Whole idle SMT core starting at `core`, or remember the first idle
    /// sibling seen in `idle_cpu`.
    fn select_idle_core(&self, p: Pid, core: CpuId, cpus: &mut Cpumask, idle_cpu: &mut Option<CpuId>) -> Option<CpuId> {
        let smt = self.topo.smt_mask(core.idx());
        let allowed = &self.tasks[p].cpus_allowed;
        let mut idle = true;
        for cpu in smt.cpus() {
            if !self.available_idle_cpu(cpu) {
                idle = false;
                if idle_cpu.is_none() {
                    if self.sched_idle_rq(cpu) && allowed.has(cpu) {
                        *idle_cpu = Some(cpu);
                        break;
                    }
                    continue;
                }
                break;
            }
            if idle_cpu.is_none() && allowed.has(cpu) {
                *idle_cpu = Some(cpu);
            }
        }
        if idle {
            return Some(core);
        }
        *cpus = cpus.andnot(&smt);
        None
    }

    fn select_idle_cpu(&mut self, p: Pid, sd: &SchedDomain, has_idle_core: bool, target: CpuId) -> Option<CpuId> {
        let mut cpus = sd.span.and(&self.allowed_active(p));
        let mut nr = usize::MAX;
        if !has_idle_core && self.tunables.feat(crate::tunables::SchedFeatures::SIS_UTIL) {
            if let Some(shared) = sd.shared.as_ref() {
                nr = shared.nr_idle_scan.load(Ordering::Acquire) + 1;
                if nr == 1 {
                    return None;
                }
            }
        }
        let nr_cpus = self.nr_cpus();
        let mut idle_cpu = None;
        for off in 1..=nr_cpus {
            let cpu = CpuId(((target.idx() + off) % nr_cpus) as u32);
            if !cpus.has(cpu) {
                continue;
            }
            if has_idle_core {
                if let Some(core) = self.select_idle_core(p, cpu, &mut cpus, &mut idle_cpu) {
                    return Some(core);
                }
            } else {
                nr -= 1;
                if nr == 0 {
                    return None;
                }
                if self.idle_or_sched_idle(cpu) {
                    idle_cpu = Some(cpu);
                    break;
                }
            }
        }
        if has_idle_core {
            if let Some(shared) = sd.shared.as_ref() {
                shared.has_idle_cores.store(false, Ordering::Release);
            }
        }
        idle_cpu
    }

    fn select_idle_smt(&self, p: Pid, sd: &SchedDomain, target: CpuId) -> Option<CpuId> {
        let allowed = &self.tasks[p].cpus_allowed;
        self.topo
            .smt_mask(target.idx())
            .cpus()
            .filter(|&c| c != target && allowed.has(c) && sd.span.has(c))
            .find(|&c| self.idle_or_sched_idle(c))
    }

    /// First idle CPU big enough for `p`, else the biggest idle one.
    fn select_idle_capacity(&self, p: Pid, sd: &SchedDomain, target: CpuId) -> Option<CpuId> {
        let cpus = sd.span.and(&self.allowed_active(p));
        let task_util = self.uclamp_task_util(p);
        let nr_cpus = self.nr_cpus();
        let mut best: Option<(u64, CpuId)> = None;
        for off in 0..nr_cpus {
            let cpu = CpuId(((target.idx() + off) % nr_cpus) as u32);
            if !cpus.has(cpu) || !self.idle_or_sched_idle(cpu) {
                continue;
            }
            let cap = self.capacity_of(cpu);
            if fits_capacity(task_util, cap) {
                return Some(cpu);
            }
            if best.is_none_or(|(c, _)| cap > c) {
                best = Some((cap, cpu));
            }
        }
        best.map(|(_, cpu)| cpu)
    }

    /// A CPU whose SMT siblings all went idle may offer a whole idle core.
    pub(crate) fn update_idle_core(&mut self, cpu: CpuId) {
        let smt = self.topo.smt_mask(cpu.idx());
        if smt.weight() <= 1 {
            return;
        }
        if smt.cpus().any(|c| c != cpu && !self.available_idle_cpu(c)) {
            return;
        }
        if let Some(shared) = self.domains.llc_domain(cpu).and_then(|sd| sd.shared.as_ref()) {
            shared.has_idle_cores.store(true, Ordering::Release);
        }
    }

    // ---- slow path ----

    fn task_on_rq_of(&self, cpu: CpuId, p: Pid) -> bool {
        self.task_on_cpu_avg(cpu, p) && self.tasks[p].is_queued()
    }

    fn cpu_runnable_without(&self, cpu: CpuId, p: Pid) -> u64 {
        let runnable = self.cpu_runnable(cpu);
        if !self.task_on_cpu_avg(cpu, p) {
            return runnable;
        }
        runnable.saturating_sub(self.tasks[p].se.avg.runnable_avg)
    }

    fn idle_cpu_without(&self, cpu: CpuId, p: Pid) -> bool {
        let rq = &self.rqs[cpu.idx()];
        if rq.curr != rq.idle && rq.curr != p {
            return false;
        }
        let local = self.task_on_rq_of(cpu, p) as u32;
        rq.nr_running.saturating_sub(local) == 0 && rq.wake_list.is_empty()
    }

    fn update_sg_wakeup_stats(&self, sd: &SchedDomain, sg: &SchedGroup, p: Pid) -> SgLbStats {
        let mut sgs = SgLbStats::default();
        for cpu in sg.span.and(&self.allowed_active(p)).cpus() {
            let rq = &self.rqs[cpu.idx()];
            sgs.group_load += self.cpu_load_without(cpu, p);
            sgs.group_util += self.cpu_util_without(cpu, p);
            sgs.group_runnable += self.cpu_runnable_without(cpu, p);
            let local = self.task_on_rq_of(cpu, p) as u32;
            sgs.sum_h_nr_running += rq.cfs_h_nr_running().saturating_sub(local);
            let nr_running = rq.nr_running.saturating_sub(local);
            sgs.sum_nr_running += nr_running;
            if nr_running == 0 && self.idle_cpu_without(cpu, p) {
                sgs.idle_cpus += 1;
            }
        }
        let cap = sg.capacity();
        if sd.has(SdFlags::ASYM_CPUCAPACITY) && !fits_capacity(self.uclamp_task_util(p), cap.max_capacity) {
            sgs.group_misfit_task_load = 1;
        }
        sgs.group_capacity = cap.capacity.max(1);
        sgs.group_weight = sg.weight() as u32;
        sgs.group_type = group_classify(sd.imbalance_pct, false, &sgs);
        if matches!(sgs.group_type, GroupType::FullyBusy | GroupType::Overloaded) {
            sgs.avg_load = sgs.group_load * SCHED_CAPACITY_SCALE / sgs.group_capacity;
        }
        sgs
    }

    fn update_pick_idlest(idlest: &SgLbStats, idlest_max_cap: u64, sgs: &SgLbStats, max_cap: u64) -> bool {
        if sgs.group_type != idlest.group_type {
            return sgs.group_type < idlest.group_type;
        }
        match sgs.group_type {
            GroupType::Overloaded | GroupType::FullyBusy => idlest.avg_load > sgs.avg_load,
            GroupType::Imbalanced | GroupType::Asym => false,
            GroupType::Misfit => idlest_max_cap < max_cap,
            GroupType::HasSpare => {
                if idlest.idle_cpus > sgs.idle_cpus {
                    return false;
                }
                !(idlest.idle_cpus == sgs.idle_cpus && idlest.group_util <= sgs.group_util)
            }
        }
    }

    /// Group of `sd` to place `p` in, or `None` to stay in the local one.
    fn find_idlest_group(&self, sd: &SchedDomain, p: Pid, this_cpu: CpuId) -> Option<usize> {
        let allowed = &self.tasks[p].cpus_allowed;
        let mut idlest: Option<(usize, SgLbStats)> = None;
        let mut local: Option<(usize, SgLbStats)> = None;
        for (i, sg) in sd.groups.iter().enumerate() {
            if !sg.span.intersects(allowed) || !sg.span.intersects(&self.active) {
                continue;
            }
            let sgs = self.update_sg_wakeup_stats(sd, sg, p);
            if sg.span.has(this_cpu) {
                local = Some((i, sgs));
                continue;
            }
            let better = match &idlest {
                None => true,
                Some((j, best)) => Self::update_pick_idlest(
                    best,
                    sd.groups[*j].capacity().max_capacity,
                    &sgs,
                    sg.capacity().max_capacity,
                ),
            };
            if better {
                idlest = Some((i, sgs));
            }
        }
        let (idx, idlest_sgs) = idlest?;
        let Some((lidx, local_sgs)) = local else {
            return Some(idx);
        };
        if local_sgs.group_type < idlest_sgs.group_type {
            return None;
        }
        if local_sgs.group_type > idlest_sgs.group_type {
            return Some(idx);
        }
        match local_sgs.group_type {
            GroupType::Overloaded | GroupType::FullyBusy => {
                let imbalance = NICE_0_LOAD * (sd.imbalance_pct - 100) / 100;
                if idlest_sgs.avg_load >= local_sgs.avg_load + imbalance {
                    return None;
                }
                if 100 * local_sgs.avg_load <= sd.imbalance_pct * idlest_sgs.avg_load {
                    return None;
                }
            }
            GroupType::Imbalanced | GroupType::Asym => return None,
            GroupType::Misfit => {
                if sd.groups[idx].capacity().max_capacity <= sd.groups[lidx].capacity().max_capacity {
                    return None;
                }
            }
            GroupType::HasSpare => {
                if sd.has(SdFlags::NUMA) && local_sgs.sum_nr_running + 1 < local_sgs.group_weight / 4 {
                    return None;
                }
                if local_sgs.idle_cpus >= idlest_sgs.idle_cpus {
                    return None;
                }
            }
        }
        Some(idx)
    }

    /// Shallowest idle CPU of the group (most recently idled on ties),
    /// else the least loaded one.
    fn find_idlest_group_cpu(&self, sg: &SchedGroup, p: Pid, this_cpu: CpuId) -> CpuId {
        let cpus = sg.span.and(&self.allowed_active(p));
        if sg.weight() == 1 {
            if let Some(c) = cpus.first() {
                return CpuId(c as u32);
            }
        }
        let mut min_exit_latency = u64::MAX;
        let mut latest_idle_timestamp = 0;
        let mut shallowest: Option<CpuId> = None;
        let mut least_loaded = this_cpu;
        let mut min_load = u64::MAX;
        for cpu in cpus.cpus() {
            if self.sched_idle_rq(cpu) {
                return cpu;
            }
            if self.available_idle_cpu(cpu) {
                let stamp = self.rqs[cpu.idx()].idle_stamp;
                match self.idle_state(cpu) {
                    Some(state) if state.exit_latency_ns < min_exit_latency => {
                        min_exit_latency = state.exit_latency_ns;
                        latest_idle_timestamp = stamp;
                        shallowest = Some(cpu);
                    }
                    state => {
                        let same_depth = state.is_none_or(|s| s.exit_latency_ns == min_exit_latency);
                        if same_depth && (shallowest.is_none() || stamp > latest_idle_timestamp) {
                            latest_idle_timestamp = stamp;
                            shallowest = Some(cpu);
                        }
                    }
                }
            } else if shallowest.is_none() {
                let load = self.cpu_load(cpu);
                if load < min_load {
                    min_load = load;
                    least_loaded = cpu;
                }
            }
        }
        shallowest.unwrap_or(least_loaded)
    }

    fn find_idlest_cpu(&mut self, p: Pid, cpu: CpuId, prev_cpu: CpuId, level: usize, sd_flag: SdFlags) -> CpuId {
        let tree = self.domains.clone();
        let Some(top) = tree.domains(cpu).get(level) else {
            return prev_cpu;
        };
        if !top.span.intersects(&self.tasks[p].cpus_allowed) {
            return prev_cpu;
        }
        let mut cpu = cpu;
        let mut level = Some(level);
        while let Some(l) = level {
            let chain = tree.domains(cpu);
            let Some(sd) = chain.get(l) else {
                break;
            };
            let child = l.checked_sub(1);
            if !sd.has(sd_flag) {
                level = child;
                continue;
            }
            let Some(g) = self.find_idlest_group(sd, p, cpu) else {
                level = child;
                continue;
            };
            let new_cpu = self.find_idlest_group_cpu(&sd.groups[g], p, cpu);
            if new_cpu == cpu {
                level = child;
                continue;
            }
            // Restart below the level we just balanced, from the new CPU.
            let weight = sd.weight();
            cpu = new_cpu;
            level = None;
            for (i, tmp) in tree.domains(cpu).iter().enumerate() {
                if weight <= tmp.weight() {
                    break;
                }
                if tmp.has(sd_flag) {
                    level = Some(i);
                }
            }
        }
        cpu
    }

    // ---- energy aware ----

    fn util_with_placement(&self, cpu: CpuId, p: Pid, dst: Option<CpuId>) -> u64 {
        match dst {
            Some(d) => self.cpu_util_next(cpu, p, d),
            None => self.cpu_util_without(cpu, p),
        }
    }

    /// Energy of `pd` with `p` placed on `dst`, or removed when `None`.
    fn compute_energy(&self, p: Pid, dst: Option<CpuId>, pd: &PerfDomain) -> u64 {
        let Some(first) = pd.cpus.first() else {
            return 0;
        };
        let scale_cpu = self.capacity_orig_of(CpuId(first as u32));
        let (mut max_util, mut sum_util) = (0, 0);
        for cpu in pd.cpus.and(&self.online).cpus() {
            let rq = &self.rqs[cpu.idx()];
            let util_cfs = self.util_with_placement(cpu, p, dst);
            let other = rq.avg_rt.util_avg + rq.avg_dl.util_avg;
            sum_util += (util_cfs + other).min(scale_cpu);
            let tsk = (dst == Some(cpu)).then_some(p);
            let freq_util = self.uclamp_rq_util_with(cpu, util_cfs + rq.avg_rt.util_avg, tsk) + rq.avg_dl.util_avg;
            max_util = max_util.max(freq_util.min(scale_cpu));
        }
        pd.compute_energy(max_util, sum_util, scale_cpu)
    }

    /// Most energy-efficient CPU for `p`, or `None` when energy-aware
    /// placement does not apply and the regular path should run.
    fn find_energy_efficient_cpu(&self, p: Pid, prev_cpu: CpuId) -> Option<CpuId> {
        let rd = self.rd(prev_cpu);
        if rd.pd.is_empty() || rd.overutilized() {
            return None;
        }
        let caches = self.domains.caches(self.this_cpu);
        let chain = self.domains.domains(self.this_cpu);
        let start = caches.asym_cpucapacity?;
        let sd = chain.iter().skip(start).find(|sd| sd.span.has(prev_cpu))?;
        if self.task_util_est(p) == 0 {
            return Some(prev_cpu);
        }
        let allowed = &self.tasks[p].cpus_allowed;
        let mut prev_delta = u64::MAX;
        let mut best_delta = u64::MAX;
        let mut best_cpu = prev_cpu;
        let mut base_energy = 0;
        for pd in &rd.pd {
            let base_pd = self.compute_energy(p, None, pd);
            base_energy += base_pd;
            let mut max_spare: Option<(u64, CpuId)> = None;
            for cpu in pd.cpus.and(&sd.span).and(&self.active).cpus() {
                if !allowed.has(cpu) {
                    continue;
                }
                let util = self.cpu_util_next(cpu, p, cpu);
                let cap = self.capacity_of(cpu);
                let spare = cap.saturating_sub(util);
                let util = self.uclamp_rq_util_with(cpu, util, Some(p));
                if !fits_capacity(util, cap) {
                    continue;
                }
                if cpu == prev_cpu {
                    prev_delta = self.compute_energy(p, Some(prev_cpu), pd).saturating_sub(base_pd);
                } else if max_spare.is_none_or(|(s, _)| spare > s) {
                    max_spare = Some((spare, cpu));
                }
            }
            if let Some((_, cpu)) = max_spare {
                let delta = self.compute_energy(p, Some(cpu), pd).saturating_sub(base_pd);
                if delta < best_delta {
                    best_delta = delta;
                    best_cpu = cpu;
                }
            }
        }
        // Only move for savings of at least 1/16th of the energy.
        if prev_delta == u64::MAX || prev_delta.saturating_sub(best_delta) > (prev_delta + base_energy) >> 4 {
            return Some(best_cpu);
        }
        Some(prev_cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_flag_by_wake_type() {
        assert_eq!(wake_sd_flag(WakeFlags::FORK), SdFlags::BALANCE_FORK);
        assert_eq!(wake_sd_flag(WakeFlags::EXEC), SdFlags::BALANCE_EXEC);
        assert_eq!(wake_sd_flag(WakeFlags::TTWU | WakeFlags::SYNC), SdFlags::BALANCE_WAKE);
    }

    #[test]
    fn idlest_prefers_more_idle_cpus() {
        let a = SgLbStats {
            idle_cpus: 1,
            group_util: 100,
            ..Default::default()
        };
        let b = SgLbStats {
            idle_cpus: 2,
            group_util: 300,
            ..Default::default()
        };
        assert!(Sched::update_pick_idlest(&a, 1024, &b, 1024));
        assert!(!Sched::update_pick_idlest(&b, 1024, &a, 1024));
        let busy = SgLbStats {
            group_type: GroupType::Overloaded,
            ..Default::default()
        };
        assert!(!Sched::update_pick_idlest(&a, 1024, &busy, 1024));
    }
}
