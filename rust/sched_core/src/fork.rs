// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task creation and exit.

use tracing::debug;

use crate::class::class;
use crate::class::ClassId;
use crate::core::Sched;
use crate::cpumask::Cpumask;
use crate::error::SchedError;
use crate::error::SchedResult;
use crate::prio::normal_prio;
use crate::prio::LoadWeight;
use crate::prio::Policy;
use crate::prio::DEFAULT_PRIO;
use crate::setsched::SchedAttr;
use crate::task::DequeueFlags;
use crate::task::EnqueueFlags;
use crate::task::OnRq;
use crate::task::SchedEntity;
use crate::task::Task;
use crate::task::TaskKind;
use crate::task::TaskState;
use crate::task::WakeFlags;
use crate::types::CpuId;
use crate::types::GroupId;
use crate::types::Pid;

impl Sched {
    /// Create a task as a child of `parent`, or of nobody. The child
    /// inherits policy, priority, affinity and group; with
    /// `reset_on_fork` it falls back to the default policy. The task is
    /// left in `NEW` state until `wake_up_new_task`.
    pub fn sched_fork(&mut self, parent: Option<Pid>, comm: &str) -> SchedResult<Pid> {
        self.fork_task(parent, comm, None)
    }

    fn fork_task(&mut self, parent: Option<Pid>, comm: &str, group: Option<GroupId>) -> SchedResult<Pid> {
        let nr = self.nr_cpus();
        let pid = self.tasks.alloc_pid();
        let mut t = Task::new(pid, comm, nr);
        if let Some(pp) = parent {
            let par = self.tasks.get(pp).ok_or(SchedError::NoSuchTask(pp))?;
            if par.policy.is_dl() && !par.reset_on_fork {
                return Err(SchedError::InvalidParams("deadline tasks cannot fork"));
            }
            t.policy = par.policy;
            t.static_prio = par.static_prio;
            t.rt_priority = par.rt_priority;
            t.reset_on_fork = par.reset_on_fork;
            t.cpus_allowed = par.cpus_allowed.clone();
            t.user_cpus = par.user_cpus.clone();
            t.group = par.group;
            t.uclamp_req = par.uclamp_req;
            // Do not inherit a PI boost.
            t.normal_prio = par.normal_prio;
        }
        if let Some(g) = group {
            t.group = g;
        }
        if t.reset_on_fork {
            if t.policy.is_rt() || t.policy.is_dl() {
                t.policy = Policy::Normal;
                t.rt_priority = 0;
            }
            if t.static_prio < DEFAULT_PRIO {
                t.static_prio = DEFAULT_PRIO;
            }
            t.reset_on_fork = false;
        }
        t.normal_prio = normal_prio(t.policy, t.static_prio, t.rt_priority);
        t.prio = t.normal_prio;
        t.class = ClassId::for_task(TaskKind::Normal, t.prio);
        t.state = TaskState::NEW;

        let cpu = self.this_cpu;
        let cpu = if t.cpus_allowed.has(cpu) {
            cpu
        } else {
            t.cpus_allowed.first().map_or(cpu, |c| CpuId(c as u32))
        };
        t.cpu = cpu;
        t.wake_cpu = cpu;
        t.recent_used_cpu = cpu;
        let depth = self.entity_depth_for(t.group);
        t.se = SchedEntity::new_task(LoadWeight::for_prio(t.policy, t.static_prio), t.group, depth);
        if t.policy.is_rt() {
            t.rt.time_slice = self.tunables.rr_timeslice_ns();
        }
        self.tasks.insert(t);

        self.uclamp_fork(pid);
        self.init_task_load_avg(pid);
        let id = self.tasks[pid].class;
        class(id).task_fork(self, pid);
        debug!(pid = pid.0, comm, cpu = cpu.0, "forked");
        Ok(pid)
    }

    /// Make a forked task runnable for the first time, placing it with
    /// fork balancing.
    pub fn wake_up_new_task(&mut self, p: Pid) -> SchedResult<()> {
        let t = self.tasks.get(p).ok_or(SchedError::NoSuchTask(p))?;
        if !t.state.contains(TaskState::NEW) {
            return Err(SchedError::InvalidParams("task already started"));
        }
        let prev = t.cpu;
        self.tasks[p].state = TaskState::RUNNING;
        let cpu = self.select_task_rq(p, prev, WakeFlags::FORK);
        // Not attached anywhere yet: move without the migration hooks.
        let t = &mut self.tasks[p];
        t.cpu = cpu;
        t.wake_cpu = cpu;
        self.post_init_task_util_avg(p);
        self.update_rq_clock(cpu);
        self.activate_task(cpu, p, EnqueueFlags::NOCLOCK | EnqueueFlags::INITIAL);
        self.check_preempt_curr(cpu, p, WakeFlags::FORK);
        let id = self.tasks[p].class;
        class(id).task_woken(self, cpu, p);
        self.run_balance_callbacks(cpu);
        Ok(())
    }

    /// Convenience for drivers: fork with attributes, an optional affinity
    /// and start the task.
    pub fn spawn(&mut self, comm: &str, attr: &SchedAttr, group: GroupId, cpus: Option<&Cpumask>) -> SchedResult<Pid> {
        if !self.groups.contains(group) {
            return Err(SchedError::NoSuchGroup(group));
        }
        let p = self.fork_task(None, comm, Some(group))?;
        // Set up before the first wakeup so nothing is queued yet.
        let setup = cpus.map_or(Ok(()), |m| self.set_cpus_allowed(p, m)).and_then(|()| {
            if *attr != SchedAttr::default() {
                self.sched_setattr(p, attr)
            } else {
                Ok(())
            }
        });
        if let Err(e) = setup {
            self.tasks.remove(p);
            return Err(e);
        }
        self.wake_up_new_task(p)?;
        Ok(p)
    }

    /// The task on `cpu` exits. It is switched out at once and released
    /// after its last switch.
    pub fn sched_exit(&mut self, p: Pid) -> SchedResult<()> {
        let t = self.tasks.get(p).ok_or(SchedError::NoSuchTask(p))?;
        if t.kind != TaskKind::Normal {
            return Err(SchedError::InvalidParams("per-cpu helper tasks cannot exit"));
        }
        let cpu = t.cpu;
        let running = self.rqs[cpu.idx()].curr == p;
        self.tasks[p].state = TaskState::DEAD;
        if running {
            self.schedule(cpu);
            return Ok(());
        }
        // Not running: drop it from wherever it waits.
        self.remove_pending_wakeup(p);
        if self.tasks[p].is_queued() {
            self.deactivate_task(cpu, p, DequeueFlags::SLEEP);
        }
        let id = self.tasks[p].class;
        class(id).task_dead(self, p);
        self.release_dead_task(p);
        Ok(())
    }

    fn remove_pending_wakeup(&mut self, p: Pid) {
        for rq in self.rqs.iter_mut() {
            rq.wake_list.retain(|&(q, _)| q != p);
        }
    }

    /// Drop the dead task's timers and its table entry. Class state was
    /// released by the class's `task_dead`.
    pub(crate) fn release_dead_task(&mut self, p: Pid) {
        if let Some(h) = self.tasks[p].dl.timer.take() {
            self.timers.cancel(h);
        }
        if let Some(h) = self.tasks[p].dl.inactive_timer.take() {
            self.timers.cancel(h);
        }
        self.tasks[p].on_rq = OnRq::NotQueued;
        if let Some(t) = self.tasks.remove(p) {
            debug!(pid = p.0, comm = %t.comm, runtime = t.se.sum_exec_runtime, "exited");
            if let Some(m) = self.monitor.as_mut() {
                m.task_exited(&t);
            }
        }
    }
}
