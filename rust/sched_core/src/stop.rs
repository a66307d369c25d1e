// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The stop class: one per-CPU task that preempts everything and runs
//! queued work items (forced migrations, active balance, hotplug drain).

use tracing::debug;

use crate::class::ClassId;
use crate::class::SchedClass;
use crate::core::Sched;
use crate::rq::StopWork;
use crate::task::DequeueFlags;
use crate::task::EnqueueFlags;
use crate::task::TaskState;
use crate::task::WakeFlags;
use crate::types::CpuId;
use crate::types::Pid;

impl Sched {
    /// Queue `work` for the stop task of `cpu` and wait for it to run.
    pub(crate) fn stop_one_cpu(&mut self, cpu: CpuId, work: StopWork) {
        self.stop_one_cpu_nowait(cpu, work);
        let this = self.this_cpu;
        self.preempt_check(cpu);
        self.this_cpu = this;
    }

    /// Queue `work` and kick the stop task; it runs at the target's next
    /// preemption point.
    pub(crate) fn stop_one_cpu_nowait(&mut self, cpu: CpuId, work: StopWork) {
        self.rqs[cpu.idx()].stop_work.push_back(work);
        let stop = self.rqs[cpu.idx()].stop;
        if !self.tasks[stop].is_queued() {
            self.tasks[stop].state = TaskState::RUNNING;
            self.update_rq_clock(cpu);
            self.activate_task(cpu, stop, EnqueueFlags::NOCLOCK);
        }
        self.resched_curr(cpu);
    }

    /// Body of the stop task. Runs until the queue is empty, then parks.
    pub(crate) fn run_stop_work(&mut self, cpu: CpuId) {
        while let Some(work) = self.rqs[cpu.idx()].stop_work.pop_front() {
            debug!(cpu = cpu.0, ?work, "stop work");
            match work {
                StopWork::Migrate { pid, dest } => self.migration_cpu_stop(cpu, pid, dest),
                StopWork::ActiveBalance { dst } => self.active_load_balance_cpu_stop(cpu, dst),
                StopWork::Drain => self.migrate_tasks(cpu),
            }
        }
        let stop = self.rqs[cpu.idx()].stop;
        self.tasks[stop].state = TaskState::INTERRUPTIBLE;
    }

    fn migration_cpu_stop(&mut self, cpu: CpuId, p: Pid, dest: Option<CpuId>) {
        let Some(t) = self.tasks.get(p) else {
            return;
        };
        // Moved or went to sleep in the meantime.
        if t.cpu != cpu || !t.is_queued() {
            return;
        }
        let dest = match dest {
            Some(d) if self.is_cpu_allowed(p, d) => d,
            _ => self.select_fallback_rq(cpu, p),
        };
        if dest != cpu {
            self.move_queued_task(cpu, p, dest);
        }
    }

    fn update_curr_stop(&mut self, cpu: CpuId) {
        let rq = &self.rqs[cpu.idx()];
        let (curr, now) = (rq.curr, rq.clock.task());
        let se = &mut self.tasks[curr].se;
        let delta = now.saturating_sub(se.exec_start);
        se.sum_exec_runtime += delta;
        se.exec_start = now;
    }
}

pub struct StopClass;

pub static STOP_CLASS: StopClass = StopClass;

impl SchedClass for StopClass {
    fn id(&self) -> ClassId {
        ClassId::Stop
    }

    fn enqueue_task(&self, s: &mut Sched, cpu: CpuId, _p: Pid, _flags: EnqueueFlags) {
        s.add_nr_running(cpu, 1);
    }

    fn dequeue_task(&self, s: &mut Sched, cpu: CpuId, _p: Pid, _flags: DequeueFlags) {
        s.sub_nr_running(cpu, 1);
    }

    fn yield_task(&self, _s: &mut Sched, _cpu: CpuId) {
        unreachable!("the stop task never yields");
    }

    // Nothing preempts the stop task.
    fn check_preempt_curr(&self, _s: &mut Sched, _cpu: CpuId, _p: Pid, _wf: WakeFlags) {}

    fn pick_next_task(&self, s: &mut Sched, cpu: CpuId) -> Option<Pid> {
        let stop = s.rqs[cpu.idx()].stop;
        if !s.tasks[stop].is_queued() {
            return None;
        }
        self.set_next_task(s, cpu, stop, true);
        Some(stop)
    }

    fn put_prev_task(&self, s: &mut Sched, cpu: CpuId, _p: Pid) {
        s.update_curr_stop(cpu);
    }

    fn set_next_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, _first: bool) {
        s.tasks[p].se.exec_start = s.rqs[cpu.idx()].clock.task();
    }

    fn balance(&self, s: &mut Sched, cpu: CpuId, _prev: Pid) -> bool {
        let stop = s.rqs[cpu.idx()].stop;
        s.tasks[stop].is_queued()
    }

    fn select_task_rq(&self, s: &mut Sched, p: Pid, _prev_cpu: CpuId, _wf: WakeFlags) -> CpuId {
        s.tasks[p].cpu
    }

    fn task_tick(&self, _s: &mut Sched, _cpu: CpuId, _p: Pid, _queued: bool) {}

    fn update_curr(&self, s: &mut Sched, cpu: CpuId) {
        s.update_curr_stop(cpu);
    }
}
