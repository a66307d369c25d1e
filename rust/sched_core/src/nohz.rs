// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Idle load balancing for tickless CPUs.
//!
//! A CPU that stops its tick while idle registers in `NohzState`. Busy
//! CPUs notice work piling up at their own tick and kick one of the
//! registered CPUs (the ILB); that CPU then balances and refreshes
//! blocked load on behalf of all of them.

use std::sync::atomic::Ordering;

use tracing::trace;

use crate::core::Ipi;
use crate::core::Sched;
use crate::cpumask::Cpumask;
use crate::rq::NohzFlags;
use crate::stats::CpuIdleType;
use crate::types::CpuId;

/// Blocked load is refreshed at most every this many ms.
const LOAD_AVG_PERIOD_MS: u64 = 32;

#[derive(Debug, Clone)]
pub struct NohzState {
    pub idle_cpus: Cpumask,
    pub nr_cpus: usize,
    /// Some tickless CPU still has blocked load to decay.
    pub has_blocked: bool,
    /// Earliest `next_balance` among tickless CPUs, in jiffies.
    pub next_balance: u64,
    /// Next blocked-load refresh, in jiffies.
    pub next_blocked: u64,
}

impl NohzState {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            idle_cpus: Cpumask::new(nr_cpus),
            nr_cpus: 0,
            has_blocked: false,
            next_balance: 0,
            next_blocked: 0,
        }
    }
}

impl Sched {
    /// Whether `cpu` can run without the periodic tick.
    pub fn sched_can_stop_tick(&self, cpu: CpuId) -> bool {
        let rq = &self.rqs[cpu.idx()];
        if rq.dl.dl_nr_running > 0 {
            return false;
        }
        // Round robin needs the tick to rotate, FIFO does not.
        if rq.rt.rr_nr_running > 0 {
            return rq.rt.rr_nr_running == 1;
        }
        if rq.rt.rt_nr_running > 0 {
            return true;
        }
        if rq.nr_running > 1 {
            return false;
        }
        // Bandwidth-limited groups are charged from the tick.
        !rq.cfs_rqs.values().any(|c| c.runtime_enabled && c.h_nr_running > 0)
    }

    pub(crate) fn sched_update_tick_dependency(&mut self, cpu: CpuId) {
        let dep = !self.sched_can_stop_tick(cpu);
        self.rqs[cpu.idx()].nohz.tick_dep = dep;
    }

    fn llc_shared_busy(&self, cpu: CpuId, busy: bool) {
        let Some(shared) = self.domains.llc_domain(cpu).and_then(|sd| sd.shared.as_ref()) else {
            return;
        };
        if busy {
            shared.nr_busy_cpus.fetch_add(1, Ordering::AcqRel);
        } else {
            let _ = shared
                .nr_busy_cpus
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        }
    }

    /// Recount busy CPUs on fresh domains: new ones start fully busy.
    pub(crate) fn nohz_sync_busy_cpus(&mut self) {
        for cpu in self.nohz.idle_cpus.clone().cpus() {
            self.llc_shared_busy(cpu, false);
        }
    }

    /// `cpu` stopped its tick while idle.
    pub(crate) fn nohz_balance_enter_idle(&mut self, cpu: CpuId) {
        if !self.active.has(cpu) || self.domains.domains(cpu).is_empty() {
            return;
        }
        self.rqs[cpu.idx()].has_blocked_load = true;
        if !self.rqs[cpu.idx()].nohz.tick_stopped {
            self.rqs[cpu.idx()].nohz.tick_stopped = true;
            self.nohz.idle_cpus.set_cpu(cpu.idx());
            self.nohz.nr_cpus += 1;
            self.llc_shared_busy(cpu, false);
        }
        self.nohz.has_blocked = true;
    }

    pub(crate) fn nohz_balance_exit_idle(&mut self, cpu: CpuId) {
        if !self.rqs[cpu.idx()].nohz.tick_stopped {
            return;
        }
        self.rqs[cpu.idx()].nohz.tick_stopped = false;
        self.nohz.idle_cpus.clear_cpu(cpu.idx());
        self.nohz.nr_cpus = self.nohz.nr_cpus.saturating_sub(1);
        self.llc_shared_busy(cpu, true);
    }

    fn find_new_ilb(&self, this_cpu: CpuId) -> Option<CpuId> {
        self.nohz
            .idle_cpus
            .and(&self.active)
            .cpus()
            .find(|&c| c != this_cpu && self.is_idle_cpu(c))
    }

    fn kick_ilb(&mut self, this_cpu: CpuId, flags: NohzFlags) {
        if flags.contains(NohzFlags::BALANCE_KICK) {
            self.nohz.next_balance = self.jiffies + 1;
        }
        let Some(ilb) = self.find_new_ilb(this_cpu) else {
            return;
        };
        let rq = &mut self.rqs[ilb.idx()];
        let pending = rq.nohz.flags.intersects(NohzFlags::KICK_MASK);
        rq.nohz.flags |= flags;
        if pending {
            return;
        }
        trace!(cpu = this_cpu.0, ilb = ilb.0, ?flags, "kick ilb");
        self.send_ipi(ilb, Ipi::NohzKick);
    }

    /// Tick hook on a busy CPU: decide whether tickless CPUs should help.
    pub(crate) fn nohz_balancer_kick(&mut self, cpu: CpuId) {
        if self.rqs[cpu.idx()].nohz.idle_balance {
            return;
        }
        self.nohz_balance_exit_idle(cpu);
        if self.nohz.nr_cpus == 0 {
            return;
        }
        let jiffies = self.jiffies;
        let mut flags = NohzFlags::empty();
        if self.nohz.has_blocked && jiffies >= self.nohz.next_blocked {
            flags = NohzFlags::STATS_KICK;
        }
        if jiffies >= self.nohz.next_balance && self.balance_kick_needed(cpu) {
            flags = NohzFlags::KICK_MASK;
        }
        if !flags.is_empty() {
            self.kick_ilb(cpu, flags);
        }
    }

    fn balance_kick_needed(&self, cpu: CpuId) -> bool {
        let rq = &self.rqs[cpu.idx()];
        if rq.nr_running >= 2 {
            return true;
        }
        let caches = self.domains.caches(cpu);
        let chain = self.domains.domains(cpu);
        if let Some(sd) = caches.asym_packing.and_then(|l| chain.get(l)) {
            let idle = self.nohz.idle_cpus.and(&sd.span);
            if idle.cpus().any(|c| self.sched_asym_prefer(c, cpu)) {
                return true;
            }
        }
        if caches.asym_cpucapacity.is_some() && rq.misfit_task_load > 0 {
            return true;
        }
        if let Some(shared) = self.domains.llc_domain(cpu).and_then(|sd| sd.shared.as_ref()) {
            if shared.busy_cpus() > 1 {
                return true;
            }
        }
        false
    }

    /// IPI handler on the kicked CPU.
    pub(crate) fn nohz_csd_func(&mut self, cpu: CpuId) {
        let rq = &mut self.rqs[cpu.idx()];
        let flags = rq.nohz.flags & (NohzFlags::KICK_MASK | NohzFlags::NEWILB_KICK);
        rq.nohz.flags.remove(flags);
        if flags.is_empty() || rq.need_resched || !rq.is_idle() {
            return;
        }
        rq.nohz.idle_balance = true;
        self.nohz_idle_balance(cpu, flags);
        if flags.contains(NohzFlags::BALANCE_KICK) {
            self.rebalance_domains(cpu, CpuIdleType::Idle);
        }
        self.rqs[cpu.idx()].nohz.idle_balance = false;
    }

    fn update_nohz_stats(&mut self, cpu: CpuId) -> bool {
        let rq = &self.rqs[cpu.idx()];
        if !rq.has_blocked_load {
            return false;
        }
        if self.jiffies <= rq.last_blocked_load_update_tick {
            return true;
        }
        self.update_blocked_averages(cpu)
    }

    /// Walk the tickless CPUs after `this_cpu`, refreshing blocked load and
    /// running their due balance passes.
    fn nohz_idle_balance(&mut self, this_cpu: CpuId, mut flags: NohzFlags) {
        if flags.contains(NohzFlags::NEWILB_KICK) {
            flags |= NohzFlags::STATS_KICK;
        }
        let jiffies = self.jiffies;
        let mut next_balance = jiffies + 60 * self.tunables.hz;
        let mut update_next_balance = false;
        let mut has_blocked_load = false;
        if flags.contains(NohzFlags::STATS_KICK) {
            self.nohz.has_blocked = false;
        }

        let mask = self.nohz.idle_cpus.clone();
        let nr = self.nr_cpus();
        let mut aborted = false;
        for off in 1..=nr {
            let cpu = CpuId(((this_cpu.idx() + off) % nr) as u32);
            if cpu == this_cpu || !mask.has(cpu) || !self.is_idle_cpu(cpu) {
                continue;
            }
            if self.rqs[this_cpu.idx()].need_resched {
                has_blocked_load = true;
                aborted = true;
                break;
            }
            if flags.contains(NohzFlags::STATS_KICK) {
                has_blocked_load |= self.update_nohz_stats(cpu);
            }
            if flags.contains(NohzFlags::BALANCE_KICK) && jiffies >= self.rqs[cpu.idx()].next_balance {
                self.update_rq_clock(cpu);
                self.rebalance_domains(cpu, CpuIdleType::Idle);
            }
            let nb = self.rqs[cpu.idx()].next_balance;
            if nb < next_balance {
                next_balance = nb;
                update_next_balance = true;
            }
        }
        if !aborted {
            if flags.contains(NohzFlags::BALANCE_KICK) && update_next_balance {
                self.nohz.next_balance = next_balance;
            }
            if flags.contains(NohzFlags::STATS_KICK) {
                self.nohz.next_blocked = jiffies + (LOAD_AVG_PERIOD_MS * self.tunables.hz / 1000).max(1);
            }
        }
        if has_blocked_load {
            self.nohz.has_blocked = true;
        }
        trace!(cpu = this_cpu.0, ?flags, aborted, "nohz idle balance");
    }

    /// Newidle balance was skipped: refresh tickless blocked load from the
    /// idle loop instead.
    pub(crate) fn nohz_newidle_balance(&mut self, cpu: CpuId) {
        if !self.nohz.has_blocked || self.jiffies < self.nohz.next_blocked {
            return;
        }
        if self.rqs[cpu.idx()].avg_idle < self.tunables.sched_migration_cost_ns {
            return;
        }
        self.rqs[cpu.idx()].nohz.flags |= NohzFlags::NEWILB_KICK;
    }

    pub(crate) fn nohz_run_idle_balance(&mut self, cpu: CpuId) {
        let rq = &mut self.rqs[cpu.idx()];
        if !rq.nohz.flags.contains(NohzFlags::NEWILB_KICK) {
            return;
        }
        rq.nohz.flags.remove(NohzFlags::NEWILB_KICK);
        if rq.need_resched {
            return;
        }
        self.nohz_idle_balance(cpu, NohzFlags::STATS_KICK);
    }
}
