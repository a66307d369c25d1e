// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU affinity and migrate-disable.

use tracing::debug;

use crate::class::class;
use crate::core::Sched;
use crate::cpumask::Cpumask;
use crate::error::SchedError;
use crate::error::SchedResult;
use crate::rq::StopWork;
use crate::task::DequeueFlags;
use crate::task::EnqueueFlags;
use crate::task::TaskKind;
use crate::types::CpuId;
use crate::types::Pid;

impl Sched {
    /// Restrict `p` to `mask`. A task that is queued or running on a CPU
    /// outside the new mask is moved right away.
    pub fn set_cpus_allowed(&mut self, p: Pid, mask: &Cpumask) -> SchedResult<()> {
        let t = self.tasks.get(p).ok_or(SchedError::NoSuchTask(p))?;
        if t.kind != TaskKind::Normal {
            return Err(SchedError::InvalidParams("per-cpu helper tasks are pinned"));
        }
        if mask.len() != self.nr_cpus() {
            return Err(SchedError::InvalidParams("mask size does not match the cpu count"));
        }
        let usable = mask.and(&self.active);
        let Some(dest) = usable.first().map(|c| CpuId(c as u32)) else {
            return Err(SchedError::AffinityEmpty);
        };
        if t.policy.is_dl() {
            let rd = self.rd(t.cpu);
            if !rd.span.is_subset(mask) {
                return Err(SchedError::Busy);
            }
        }
        if t.cpus_allowed == *mask {
            return Ok(());
        }

        self.do_set_cpus_allowed(p, mask.clone());
        self.tasks[p].user_cpus = Some(mask.clone());

        let t = &self.tasks[p];
        let cpu = t.cpu;
        if mask.has(cpu) {
            return Ok(());
        }
        if t.migration_disabled > 0 {
            self.tasks[p].migration_pending = true;
            return Ok(());
        }
        self.affine_move_task(p, cpu, dest);
        Ok(())
    }

    /// Install a new mask with the task off its runqueue.
    pub(crate) fn do_set_cpus_allowed(&mut self, p: Pid, mask: Cpumask) {
        let cpu = self.tasks[p].cpu;
        let queued = self.tasks[p].is_queued();
        let running = self.rqs[cpu.idx()].curr == p;
        if queued {
            self.update_rq_clock(cpu);
            self.dequeue_task(cpu, p, DequeueFlags::SAVE | DequeueFlags::NOCLOCK);
        }
        if running {
            self.put_prev_task(cpu, p);
        }
        self.tasks[p].cpus_allowed = mask;
        let id = self.tasks[p].class;
        class(id).set_cpus_allowed(self, p);
        if queued {
            self.enqueue_task(cpu, p, EnqueueFlags::RESTORE | EnqueueFlags::NOCLOCK);
        }
        if running {
            self.set_next_task(cpu, p);
        }
    }

    fn affine_move_task(&mut self, p: Pid, cpu: CpuId, dest: CpuId) {
        let dest = self.pick_affine_dest(p, dest);
        if self.rqs[cpu.idx()].curr == p {
            debug!(pid = p.0, cpu = cpu.0, dest = dest.0, "moving running task off a disallowed cpu");
            self.stop_one_cpu(cpu, StopWork::Migrate { pid: p, dest: Some(dest) });
        } else if self.tasks[p].is_queued() {
            self.move_queued_task(cpu, p, dest);
        }
        // A sleeping task picks an allowed CPU at its next wakeup.
    }

    /// Prefer an allowed CPU sharing the LLC with the current one.
    fn pick_affine_dest(&self, p: Pid, fallback: CpuId) -> CpuId {
        let t = &self.tasks[p];
        t.cpus_allowed
            .and(&self.active)
            .cpus()
            .find(|&c| self.domains.share_llc(c, t.cpu))
            .unwrap_or(fallback)
    }

    /// Pin the running task of `cpu` to it until the matching enable.
    pub fn migrate_disable(&mut self, cpu: CpuId) {
        let p = self.rqs[cpu.idx()].curr;
        let t = &mut self.tasks[p];
        if t.kind != TaskKind::Normal {
            return;
        }
        t.migration_disabled += 1;
    }

    pub fn migrate_enable(&mut self, cpu: CpuId) {
        let p = self.rqs[cpu.idx()].curr;
        let t = &mut self.tasks[p];
        if t.kind != TaskKind::Normal || t.migration_disabled == 0 {
            return;
        }
        t.migration_disabled -= 1;
        if t.migration_disabled > 0 || !t.migration_pending {
            return;
        }
        t.migration_pending = false;
        if t.cpus_allowed.has(cpu) {
            return;
        }
        let dest = t.cpus_allowed.and(&self.active).first().map(|c| CpuId(c as u32));
        match dest {
            Some(d) => self.affine_move_task(p, cpu, d),
            None => {
                let d = self.select_fallback_rq(cpu, p);
                self.affine_move_task(p, cpu, d);
            }
        }
    }
}
