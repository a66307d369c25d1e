// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task wakeup.
//!
//! A wakeup is decided by the task's state word: only a waker whose mask
//! matches the current state wins, and it moves the task to `WAKING` before
//! choosing a CPU, so concurrent wakers of the same task coalesce. Wakeups
//! across LLCs are queued on the target's wake list and finished by the
//! target in IPI context.

use tracing::trace;

use crate::class::class;
use crate::core::Ipi;
use crate::core::SchedEvent;
use crate::core::Sched;
use crate::error::SchedError;
use crate::error::SchedResult;
use crate::task::EnqueueFlags;
use crate::task::OnRq;
use crate::task::TaskState;
use crate::task::WakeFlags;
use crate::tunables::SchedFeatures;
use crate::types::CpuId;
use crate::types::Pid;

impl Sched {
    /// Wake `p` if its state intersects `state`. Returns whether this call
    /// performed the wakeup.
    pub fn try_to_wake_up(&mut self, p: Pid, state: TaskState, wf: WakeFlags) -> bool {
        let this_cpu = self.this_cpu;
        let mut wf = wf | WakeFlags::TTWU;
        let t = &self.tasks[p];

        // Waking the running task only needs its state reset.
        if t.on_cpu && self.rqs[t.cpu.idx()].curr == p {
            if !t.state.intersects(state) {
                return false;
            }
            self.tasks[p].state = TaskState::RUNNING;
            self.ttwu_stat(p, this_cpu, wf);
            return true;
        }
        if !t.state.intersects(state) {
            return false;
        }
        if let Some(waker) = self.tasks.get(self.rqs[this_cpu.idx()].curr).map(|w| w.pid) {
            self.tasks[p].last_waker = Some(waker);
        }

        // Still queued: it never finished blocking.
        if self.tasks[p].is_queued() {
            let cpu = self.tasks[p].cpu;
            self.update_rq_clock(cpu);
            self.check_preempt_curr(cpu, p, wf);
            self.tasks[p].state = TaskState::RUNNING;
            self.ttwu_stat(p, cpu, wf);
            return true;
        }

        if self.tasks[p].sched_contributes_to_load {
            let prev = self.tasks[p].cpu;
            self.rqs[prev.idx()].nr_uninterruptible -= 1;
            self.tasks[p].sched_contributes_to_load = false;
        }
        if self.tasks[p].in_iowait {
            let prev = self.tasks[p].cpu;
            let rq = &mut self.rqs[prev.idx()];
            rq.nr_iowait = rq.nr_iowait.saturating_sub(1);
        }
        self.tasks[p].state = TaskState::WAKING;

        let wake_cpu = self.tasks[p].wake_cpu;
        let cpu = self.select_task_rq(p, wake_cpu, wf);
        if self.tasks[p].cpu != cpu {
            wf |= WakeFlags::MIGRATED;
            self.set_task_cpu(p, cpu);
        }
        self.ttwu_stat(p, cpu, wf);
        self.ttwu_queue(p, cpu, wf);
        true
    }

    pub fn wake_up_process(&mut self, p: Pid) -> bool {
        self.try_to_wake_up(p, TaskState::NORMAL, WakeFlags::empty())
    }

    /// Checked wakeup for external callers.
    pub fn wake_up(&mut self, p: Pid, sync: bool) -> SchedResult<bool> {
        if !self.tasks.contains(p) {
            return Err(SchedError::NoSuchTask(p));
        }
        let wf = if sync { WakeFlags::SYNC } else { WakeFlags::empty() };
        Ok(self.try_to_wake_up(p, TaskState::NORMAL, wf))
    }

    /// Mark the running task of `cpu` as going to sleep in `state`. The
    /// task stays queued until the next `schedule()`, so a wakeup racing
    /// with the sleep finds it still on the runqueue.
    pub fn set_current_state(&mut self, cpu: CpuId, state: TaskState, iowait: bool) {
        let curr = self.rqs[cpu.idx()].curr;
        let t = &mut self.tasks[curr];
        if t.is_idle_task() {
            return;
        }
        t.state = state;
        t.in_iowait = iowait;
    }

    fn ttwu_queue_cond(&self, cpu: CpuId) -> bool {
        if !self.active.has(cpu) {
            return false;
        }
        if !self.domains.share_llc(self.this_cpu, cpu) {
            return true;
        }
        false
    }

    fn ttwu_queue(&mut self, p: Pid, cpu: CpuId, wf: WakeFlags) {
        if self.tunables.feat(SchedFeatures::TTWU_QUEUE) && cpu != self.this_cpu && self.ttwu_queue_cond(cpu) {
            self.tasks[p].sched_remote_wakeup = wf.contains(WakeFlags::MIGRATED);
            self.rqs[cpu.idx()].wake_list.push((p, wf));
            trace!(pid = p.0, cpu = cpu.0, "queued remote wakeup");
            self.send_ipi(cpu, Ipi::WakeList);
            return;
        }
        self.update_rq_clock(cpu);
        self.ttwu_do_activate(cpu, p, wf);
    }

    /// Finish wakeups other CPUs queued here.
    pub(crate) fn sched_ttwu_pending(&mut self, cpu: CpuId) {
        let pending = std::mem::take(&mut self.rqs[cpu.idx()].wake_list);
        if pending.is_empty() {
            return;
        }
        self.update_rq_clock(cpu);
        for (p, mut wf) in pending {
            if !self.tasks.contains(p) {
                continue;
            }
            // The mask changed while the wakeup was in flight.
            let mut target = cpu;
            if !self.is_cpu_allowed(p, cpu) {
                target = self.select_fallback_rq(cpu, p);
                wf |= WakeFlags::MIGRATED;
                self.update_rq_clock(target);
                trace!(pid = p.0, cpu = cpu.0, target = target.0, "redirected queued wakeup");
            }
            if self.tasks[p].cpu != target {
                self.set_task_cpu(p, target);
            }
            self.ttwu_do_activate(target, p, wf);
        }
    }

    fn ttwu_do_activate(&mut self, cpu: CpuId, p: Pid, wf: WakeFlags) {
        let mut flags = EnqueueFlags::WAKEUP | EnqueueFlags::NOCLOCK;
        if wf.contains(WakeFlags::MIGRATED) {
            flags |= EnqueueFlags::MIGRATED;
        }
        self.activate_task(cpu, p, flags);
        self.check_preempt_curr(cpu, p, wf);
        self.tasks[p].state = TaskState::RUNNING;
        self.tasks[p].sched_remote_wakeup = false;
        let id = self.tasks[p].class;
        class(id).task_woken(self, cpu, p);

        let rq = &mut self.rqs[cpu.idx()];
        if rq.idle_stamp > 0 {
            let delta = rq.clock.wall().saturating_sub(rq.idle_stamp);
            let max = 2 * rq.max_idle_balance_cost;
            update_avg(&mut rq.avg_idle, delta);
            if rq.avg_idle > max {
                rq.avg_idle = max;
            }
            rq.wake_stamp = self.jiffies;
            rq.wake_avg_idle = rq.avg_idle / 2;
            rq.idle_stamp = 0;
        }
        self.emit(SchedEvent::Woken { pid: p, cpu });
    }

    fn ttwu_stat(&mut self, p: Pid, cpu: CpuId, wf: WakeFlags) {
        let this_cpu = self.this_cpu;
        self.rqs[cpu.idx()].stats.ttwu_count += 1;
        let st = &mut self.tasks[p].stats;
        st.nr_wakeups += 1;
        if wf.contains(WakeFlags::SYNC) {
            st.nr_wakeups_sync += 1;
        }
        if wf.contains(WakeFlags::MIGRATED) {
            st.nr_wakeups_migrate += 1;
        }
        if cpu == this_cpu {
            st.nr_wakeups_local += 1;
            self.rqs[this_cpu.idx()].stats.ttwu_local += 1;
            return;
        }
        st.nr_wakeups_remote += 1;
        let domains = self.domains.clone();
        if let Some(sd) = domains.domains(this_cpu).iter().find(|sd| sd.span.has(cpu)) {
            sd.balance.lock().stats.ttwu_wake_remote += 1;
        }
    }

    /// Task is waking and not yet on a runqueue.
    pub fn task_is_waking(&self, p: Pid) -> bool {
        self.tasks.get(p).is_some_and(|t| t.state.contains(TaskState::WAKING) || t.on_rq == OnRq::Migrating)
    }
}

/// Exponential average with a 1/8 weight for the new sample.
pub(crate) fn update_avg(avg: &mut u64, sample: u64) {
    let diff = sample as i64 - *avg as i64;
    *avg = (*avg as i64 + diff / 8) as u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SchedConfig;
    use crate::cpumask::Cpumask;
    use crate::monitor::check_invariants;
    use crate::setsched::SchedAttr;
    use crate::topology::TopologySpec;
    use crate::types::GroupId;

    fn deliver(s: &mut Sched, now: u64) -> Vec<(CpuId, Ipi)> {
        let ipis = s.take_ipis();
        for &(cpu, ipi) in &ipis {
            s.enter(cpu, now);
            s.handle_ipi(cpu, ipi);
        }
        ipis
    }

    #[test]
    fn queued_remote_wakeup_follows_new_affinity() {
        let topology = TopologySpec {
            llcs_per_node: 2,
            cores_per_llc: 1,
            ..Default::default()
        };
        let mut s = Sched::new(SchedConfig { topology, ..Default::default() }).unwrap();
        let cpu0 = Cpumask::from_cpulist("0", 2).unwrap();
        let cpu1 = Cpumask::from_cpulist("1", 2).unwrap();

        s.enter(CpuId(1), 1_000);
        let p = s.spawn("t", &SchedAttr::normal(0), GroupId::ROOT, Some(&cpu1)).unwrap();
        assert_eq!(s.schedule(CpuId(1)), p);
        s.enter(CpuId(1), 2_000);
        s.set_current_state(CpuId(1), TaskState::INTERRUPTIBLE, false);
        assert_ne!(s.schedule(CpuId(1)), p);
        deliver(&mut s, 2_000);

        // Woken across LLCs: parked on cpu1's wake list until the IPI.
        s.enter(CpuId(0), 3_000);
        assert!(s.wake_up(p, false).unwrap());
        assert!(!s.task(p).unwrap().is_queued());
        s.set_cpus_allowed(p, &cpu0).unwrap();
        let ipis = deliver(&mut s, 3_000);
        assert!(ipis.contains(&(CpuId(1), Ipi::WakeList)));

        let t = s.task(p).unwrap();
        assert_eq!(t.cpu, CpuId(0));
        assert!(t.is_queued());
        assert_eq!(s.rq(CpuId(1)).nr_running, 0);
        assert_eq!(s.rq(CpuId(0)).nr_running, 1);
        assert!(check_invariants(&s).is_empty(), "{:?}", check_invariants(&s));

        deliver(&mut s, 3_000);
        s.enter(CpuId(0), 3_000);
        assert_eq!(s.preempt_check(CpuId(0)), p);
    }

    #[test]
    fn update_avg_moves_an_eighth() {
        let mut a = 800;
        update_avg(&mut a, 1600);
        assert_eq!(a, 900);
        update_avg(&mut a, 100);
        assert_eq!(a, 800);
    }
}
