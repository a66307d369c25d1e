// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU capacity and utilisation as the fair class sees them.
//!
//! `cpu_capacity_orig` is what the hardware offers at maximum frequency.
//! `cpu_capacity` is what is left for fair tasks once RT, deadline, IRQ
//! and thermal pressure have taken their share. Group capacities are
//! refreshed from it on the balance path.

use crate::class::ClassId;
use crate::core::Sched;
use crate::pelt;
use crate::prio::SCHED_CAPACITY_SCALE;
use crate::sched_domain::SdFlags;
use crate::tunables::SchedFeatures;
use crate::types::CpuId;
use crate::types::Pid;

/// `util` fits in `capacity` with 20% headroom.
pub fn fits_capacity(util: u64, capacity: u64) -> bool {
    util * 1280 < capacity * 1024
}

/// `a` is noticeably (about 5%) larger than `b`.
pub fn capacity_greater(a: u64, b: u64) -> bool {
    a * 1024 > b * 1078
}

impl Sched {
    pub fn capacity_of(&self, cpu: CpuId) -> u64 {
        self.rqs[cpu.idx()].cpu_capacity
    }

    pub fn capacity_orig_of(&self, cpu: CpuId) -> u64 {
        self.rqs[cpu.idx()].cpu_capacity_orig
    }

    pub fn cpu_load(&self, cpu: CpuId) -> u64 {
        self.rqs[cpu.idx()].cfs().avg.load_avg
    }

    pub fn cpu_runnable(&self, cpu: CpuId) -> u64 {
        self.rqs[cpu.idx()].cfs().avg.runnable_avg
    }

    /// Fair utilisation of `cpu`, never above its original capacity.
    pub fn cpu_util_cfs(&self, cpu: CpuId) -> u64 {
        let cfs = self.rqs[cpu.idx()].cfs();
        let mut util = cfs.avg.util_avg;
        if self.tunables.feat(SchedFeatures::UTIL_EST) {
            util = util.max(cfs.avg.util_est.enqueued as u64);
        }
        util.min(self.capacity_orig_of(cpu))
    }

    pub(crate) fn task_on_cpu_avg(&self, cpu: CpuId, p: Pid) -> bool {
        let t = &self.tasks[p];
        t.cpu == cpu && t.se.attached
    }

    /// Fair utilisation of `cpu` if `p` were not there.
    pub fn cpu_util_without(&self, cpu: CpuId, p: Pid) -> u64 {
        let util = self.cpu_util_cfs(cpu);
        if !self.task_on_cpu_avg(cpu, p) {
            return util;
        }
        util.saturating_sub(pelt::task_util(&self.tasks[p].se.avg))
    }

    pub fn cpu_load_without(&self, cpu: CpuId, p: Pid) -> u64 {
        let load = self.cpu_load(cpu);
        if !self.task_on_cpu_avg(cpu, p) {
            return load;
        }
        load.saturating_sub(self.tasks[p].se.avg.load_avg)
    }

    /// Fair utilisation of `cpu` if `p` ran on `dst`.
    pub fn cpu_util_next(&self, cpu: CpuId, p: Pid, dst: CpuId) -> u64 {
        let mut util = self.cpu_util_cfs(cpu);
        let task = pelt::task_util(&self.tasks[p].se.avg);
        let on_cpu = self.task_on_cpu_avg(cpu, p);
        if on_cpu && dst != cpu {
            util = util.saturating_sub(task);
        } else if !on_cpu && dst == cpu {
            util += task;
        }
        util.min(self.capacity_orig_of(cpu))
    }

    pub fn task_util_est(&self, p: Pid) -> u64 {
        pelt::task_util_estimated(&self.tasks[p].se.avg, self.tunables.feat(SchedFeatures::UTIL_EST))
    }

    /// The clamped utilisation of `p` fits the fair capacity of `cpu`.
    pub fn task_fits_cpu(&self, p: Pid, cpu: CpuId) -> bool {
        fits_capacity(self.uclamp_task_util(p), self.capacity_of(cpu))
    }

    pub(crate) fn cpu_overutilized(&self, cpu: CpuId) -> bool {
        let util = self.uclamp_rq_util_with(cpu, self.cpu_util_cfs(cpu), None);
        !fits_capacity(util, self.capacity_of(cpu))
    }

    pub(crate) fn update_overutilized_status(&mut self, cpu: CpuId) {
        let rd = self.rd(cpu);
        if !rd.overutilized() && self.cpu_overutilized(cpu) {
            rd.set_overutilized(true);
        }
    }

    /// Record whether the running fair task is too big for this CPU.
    pub(crate) fn update_misfit_status(&mut self, cpu: CpuId, p: Option<Pid>) {
        if !self.rd(cpu).asym_capacity() {
            return;
        }
        let load = match p {
            Some(p) if self.tasks[p].nr_cpus_allowed() > 1 && !self.task_fits_cpu(p, cpu) => {
                self.task_h_load(p).max(1)
            }
            _ => 0,
        };
        self.rqs[cpu.idx()].misfit_task_load = load;
    }

    /// Capacity left for fair tasks once RT, deadline, IRQ and thermal
    /// pressure are accounted for. Never zero.
    pub fn scale_rt_capacity(&self, cpu: CpuId) -> u64 {
        let rq = &self.rqs[cpu.idx()];
        let max = rq.cpu_capacity_orig;
        let irq = rq.avg_irq.util_avg;
        if irq >= max {
            return 1;
        }
        let used = rq.avg_rt.util_avg + rq.avg_dl.util_avg + rq.avg_thermal.load_avg;
        if used >= max {
            return 1;
        }
        let free = max - used;
        (free * (max - irq) / max).max(1)
    }

    pub(crate) fn update_cpu_capacity(&mut self, cpu: CpuId) {
        let cap = if self.tunables.feat(SchedFeatures::NONTASK_CAPACITY) {
            self.scale_rt_capacity(cpu)
        } else {
            self.rqs[cpu.idx()].cpu_capacity_orig
        };
        self.rqs[cpu.idx()].cpu_capacity = cap;
        if let Some(sd) = self.domains.domains(cpu).first() {
            if let Some(g) = sd.local_group() {
                if g.weight() == 1 {
                    let mut sgc = g.sgc.lock();
                    sgc.capacity = cap;
                    sgc.min_capacity = cap;
                    sgc.max_capacity = cap;
                }
            }
        }
    }

    /// Refresh the capacity of `cpu`'s local group at domain `level` from
    /// the groups one level down.
    pub(crate) fn update_group_capacity(&mut self, cpu: CpuId, level: usize) {
        if level == 0 {
            self.update_cpu_capacity(cpu);
        }
        let tree = self.domains.clone();
        let chain = tree.domains(cpu);
        let Some(sd) = chain.get(level) else {
            return;
        };
        let Some(local) = sd.local_group() else {
            return;
        };
        let (mut capacity, mut min, mut max) = (0u64, u64::MAX, 0u64);
        let child = level.checked_sub(1).and_then(|l| chain.get(l));
        match child {
            Some(child) if !child.has(SdFlags::OVERLAP) => {
                for g in &child.groups {
                    let c = g.capacity();
                    capacity += c.capacity;
                    min = min.min(c.min_capacity);
                    max = max.max(c.max_capacity);
                }
            }
            _ => {
                for c in local.span.cpus() {
                    let cap = self.capacity_of(c);
                    capacity += cap;
                    min = min.min(cap);
                    max = max.max(cap);
                }
            }
        }
        if capacity == 0 {
            return;
        }
        let interval = sd.min_interval.max(1) * self.tunables.hz / 1000;
        let mut sgc = local.sgc.lock();
        sgc.capacity = capacity;
        sgc.min_capacity = min;
        sgc.max_capacity = max;
        sgc.next_update = self.jiffies + interval.max(1);
    }

    /// Report a thermal cap on `cpu`'s capacity.
    pub fn set_thermal_pressure(&mut self, cpu: CpuId, capped_capacity: u64) {
        let rq = &mut self.rqs[cpu.idx()];
        rq.thermal_pressure = rq.cpu_capacity_orig.saturating_sub(capped_capacity);
    }

    pub(crate) fn update_thermal_load_avg(&mut self, cpu: CpuId) -> bool {
        let rq = &mut self.rqs[cpu.idx()];
        let now = rq.clock.task();
        let pressure = rq.thermal_pressure;
        if pelt::update_load_sum(now, &mut rq.avg_thermal, pressure, pressure, pressure > 0) {
            pelt::update_load_avg(&mut rq.avg_thermal, 1);
            return true;
        }
        false
    }

    /// Decay the RT, deadline, IRQ and thermal signals. True if any moved.
    pub(crate) fn update_other_load_avgs(&mut self, cpu: CpuId) -> bool {
        let curr = self.rqs[cpu.idx()].curr;
        let curr_class = self.tasks[curr].class;
        let rq = &mut self.rqs[cpu.idx()];
        let now = rq.clock.pelt();
        let mut decayed = pelt::update_class_signal(now, &mut rq.avg_rt, curr_class == ClassId::Rt);
        decayed |= pelt::update_class_signal(now, &mut rq.avg_dl, curr_class == ClassId::Dl);
        decayed |= pelt::update_class_signal(now, &mut rq.avg_irq, false);
        decayed |= self.update_thermal_load_avg(cpu);
        decayed
    }

    /// Fraction of `cpu`'s original capacity the fair class can use, out
    /// of `SCHED_CAPACITY_SCALE`.
    pub fn fair_capacity_ratio(&self, cpu: CpuId) -> u64 {
        self.capacity_of(cpu) * SCHED_CAPACITY_SCALE / self.capacity_orig_of(cpu).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_with_headroom() {
        assert!(fits_capacity(800, 1024));
        assert!(!fits_capacity(820, 1024));
        assert!(!fits_capacity(400, 446));
        assert!(fits_capacity(300, 446));
    }

    #[test]
    fn capacity_margin() {
        assert!(capacity_greater(1024, 512));
        assert!(!capacity_greater(1024, 1000));
    }
}
