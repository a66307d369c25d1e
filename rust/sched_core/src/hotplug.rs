// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU hotplug, cpuset partitioning and domain rebuilds.
//!
//! Going down, a CPU is first removed from the active set and the domains
//! are rebuilt without it, so nothing new is placed there. Its stop task
//! then drains every queued task to a fallback CPU before the CPU is
//! marked offline. Tasks asleep on it pick another CPU when they wake.

use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::class::class;
use crate::class::ClassId;
use crate::core::SchedEvent;
use crate::core::Sched;
use crate::cpumask::Cpumask;
use crate::error::SchedError;
use crate::error::SchedResult;
use crate::prio::SCHED_CAPACITY_SCALE;
use crate::rcu::Retired;
use crate::rq::StopWork;
use crate::sched_domain::build_sched_domains;
use crate::sched_domain::BuildParams;
use crate::sched_domain::DomainTree;
use crate::task::TaskKind;
use crate::types::CpuId;

impl Sched {
    fn check_cpu(&self, cpu: CpuId) -> SchedResult<()> {
        if cpu.idx() >= self.nr_cpus() {
            return Err(SchedError::InvalidParams("no such cpu"));
        }
        Ok(())
    }

    /// Partitions the next rebuild uses: the configured ones restricted to
    /// usable CPUs, or a single one of everything usable.
    fn effective_partitions(&self) -> Vec<Cpumask> {
        let usable = self.active.andnot(&self.isolated);
        match (&self.partitions, self.frozen) {
            (Some(list), false) => list.iter().map(|m| m.and(&usable)).filter(|m| !m.is_empty()).collect(),
            _ if usable.is_empty() => vec![],
            _ => vec![usable],
        }
    }

    /// Carry the admitted deadline bandwidth of every task into the root
    /// domains of `tree`. Fails if some partition cannot hold it.
    fn dl_rebuild_rd_accounting(&self, tree: &DomainTree) -> SchedResult<()> {
        for t in self.tasks.iter() {
            if t.kind != TaskKind::Normal || !t.policy.is_dl() || t.is_dead() {
                continue;
            }
            let rd = tree.rd(t.cpu);
            if Arc::ptr_eq(rd, tree.def_root_domain()) {
                rd.dl_add_unchecked(t.dl.dl_bw);
            } else {
                rd.dl_admit(0, t.dl.dl_bw)?;
            }
        }
        Ok(())
    }

    /// Rebuild the domain tree from the active set and the partitions.
    /// On failure the previous tree stays in place.
    pub fn rebuild_sched_domains(&mut self) -> SchedResult<()> {
        let parts = self.effective_partitions();
        let generation = self.generation + 1;
        let params = BuildParams {
            topo: &self.topo,
            partitions: &parts,
            dl_bw_limit: self.dl_bw_limit,
            energy: self.energy.as_ref(),
            generation,
            now: self.now,
            jiffies: self.jiffies,
        };
        let tree = match build_sched_domains(&params) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(generation, error = %e, "sched domain build failed, keeping previous domains");
                return Err(e);
            }
        };
        if self.generation > 0 && tree.same_structure(&self.domains) {
            debug!(generation = self.generation, "sched domains unchanged");
            return Ok(());
        }
        if let Err(e) = self.dl_rebuild_rd_accounting(&tree) {
            warn!(generation, "deadline bandwidth does not fit the new partitions");
            return Err(e);
        }
        for problem in tree.validate() {
            warn!(generation, problem = %problem, "sched domain invariant violated");
        }

        for i in 0..self.nr_cpus() {
            self.set_rq_offline(CpuId(i as u32));
        }
        self.generation = generation;
        let old = std::mem::replace(&mut self.domains, Arc::new(tree));
        self.rcu.retire(Retired::Domains(old));
        for cpu in self.active.clone().cpus() {
            self.set_rq_online(cpu);
        }
        for cpu in self.active.clone().cpus() {
            self.update_cpu_capacity(cpu);
        }
        self.nohz_sync_busy_cpus();
        info!(
            generation,
            partitions = parts.len(),
            active = %self.active.to_cpulist(),
            "rebuilt sched domains"
        );
        self.emit(SchedEvent::DomainsRebuilt { generation });
        Ok(())
    }

    pub(crate) fn set_rq_online(&mut self, cpu: CpuId) {
        if self.rqs[cpu.idx()].online {
            return;
        }
        self.rqs[cpu.idx()].online = true;
        let rd = self.rd(cpu);
        rd.set_online(cpu, true);
        if self.rqs[cpu.idx()].nr_running >= 2 {
            rd.set_overload(true);
        }
        for id in ClassId::ALL {
            class(id).rq_online(self, cpu);
        }
    }

    pub(crate) fn set_rq_offline(&mut self, cpu: CpuId) {
        if !self.rqs[cpu.idx()].online {
            return;
        }
        self.update_rq_clock(cpu);
        for id in ClassId::ALL {
            class(id).rq_offline(self, cpu);
        }
        self.rd(cpu).set_online(cpu, false);
        self.rqs[cpu.idx()].online = false;
    }

    /// Take `cpu` down. Refused for the last active CPU, for a CPU some
    /// task can run nowhere else, and when the remaining CPUs cannot hold
    /// the admitted deadline bandwidth.
    pub fn cpu_offline(&mut self, cpu: CpuId) -> SchedResult<()> {
        self.check_cpu(cpu)?;
        if !self.online.has(cpu) {
            return Ok(());
        }
        let mut remaining = self.active.clone();
        remaining.clear_cpu(cpu.idx());
        if remaining.is_empty() {
            return Err(SchedError::CpuBusy(cpu));
        }
        if let Some(t) = self
            .tasks
            .iter()
            .find(|t| t.kind == TaskKind::Normal && !t.is_dead() && !t.cpus_allowed.intersects(&remaining))
        {
            debug!(cpu = cpu.0, pid = t.pid.0, "offline refused: task has no other cpu");
            return Err(SchedError::CpuBusy(cpu));
        }
        let rd = self.rd(cpu);
        if rd.span.has(cpu) {
            let lost = if rd.asym_capacity() {
                self.rqs[cpu.idx()].cpu_capacity_orig
            } else {
                SCHED_CAPACITY_SCALE
            };
            if !rd.dl_can_shrink_to(rd.dl_bw_capacity().saturating_sub(lost)) {
                debug!(cpu = cpu.0, "offline refused: deadline bandwidth");
                return Err(SchedError::CpuBusy(cpu));
            }
        }

        self.active.clear_cpu(cpu.idx());
        self.nohz_balance_exit_idle(cpu);
        if let Err(e) = self.rebuild_sched_domains() {
            warn!(cpu = cpu.0, error = %e, "going offline with stale domains");
        }
        self.set_rq_offline(cpu);

        // Finish wakeups already routed here, then drain.
        self.sched_ttwu_pending(cpu);
        self.stop_one_cpu(cpu, StopWork::Drain);

        self.online.clear_cpu(cpu.idx());
        self.timers.cancel_pinned(cpu);
        let rq = &mut self.rqs[cpu.idx()];
        rq.hrtick_timer = None;
        rq.active_balance_timer = None;
        rq.active_balance = false;
        rq.push_cpu = None;
        rq.rt.period_timer = None;
        self.calc_load_migrate(cpu);
        self.update_sysctl_scaling();
        info!(cpu = cpu.0, "cpu offline");
        self.emit(SchedEvent::CpuOffline { cpu });
        Ok(())
    }

    /// Move every queued task off a dying CPU. Runs as stop work.
    pub(crate) fn migrate_tasks(&mut self, cpu: CpuId) {
        let stop = self.rqs[cpu.idx()].stop;
        let mut victims: Vec<_> = self
            .tasks
            .iter()
            .filter(|t| t.cpu == cpu && t.is_queued() && t.kind == TaskKind::Normal && t.pid != stop)
            .map(|t| t.pid)
            .collect();
        victims.sort();
        for p in victims {
            let dest = self.select_fallback_rq(cpu, p);
            debug!(cpu = cpu.0, pid = p.0, dest = dest.0, "hotplug migrate");
            self.move_queued_task(cpu, p, dest);
        }
    }

    pub fn cpu_online(&mut self, cpu: CpuId) -> SchedResult<()> {
        self.check_cpu(cpu)?;
        if self.online.has(cpu) {
            return Ok(());
        }
        self.online.set_cpu(cpu.idx());
        self.active.set_cpu(cpu.idx());
        self.update_rq_clock(cpu);
        let rq = &mut self.rqs[cpu.idx()];
        rq.next_balance = self.jiffies;
        rq.calc_load_update = self.loadavg.next_update();
        self.init_rt_bandwidth(cpu);
        self.update_sysctl_scaling();
        if let Err(e) = self.rebuild_sched_domains() {
            warn!(cpu = cpu.0, error = %e, "cpu online with stale domains");
        }
        // A rebuild that kept the old tree leaves this rq detached.
        self.set_rq_online(cpu);
        info!(cpu = cpu.0, "cpu online");
        self.emit(SchedEvent::CpuOnline { cpu });
        Ok(())
    }

    /// Reconfigure exclusive cpuset partitions and isolated CPUs. Either
    /// the whole change applies or none of it does.
    pub fn set_partitions(&mut self, partitions: Option<Vec<Cpumask>>, isolated: Cpumask) -> SchedResult<()> {
        let nr = self.nr_cpus();
        if isolated.len() != nr || partitions.iter().flatten().any(|m| m.len() != nr) {
            return Err(SchedError::InvalidParams("mask size does not match the cpu count"));
        }
        let old_parts = std::mem::replace(&mut self.partitions, partitions);
        let old_isolated = std::mem::replace(&mut self.isolated, isolated);
        if let Err(e) = self.rebuild_sched_domains() {
            self.partitions = old_parts;
            self.isolated = old_isolated;
            return Err(e);
        }
        Ok(())
    }

    /// Domain rebuilds during suspend collapse to one partition; the
    /// configured partitions come back on resume.
    pub fn suspend(&mut self) {
        self.frozen = true;
    }

    pub fn resume(&mut self) -> SchedResult<()> {
        self.frozen = false;
        self.rebuild_sched_domains()
    }
}
