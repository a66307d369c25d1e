// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The idle class and the idle-entry/exit hooks.
//!
//! The idle task is never enqueued; the class hands it out whenever no
//! other class has work. Entering idle stops the tick, registers the CPU
//! for nohz balancing and asks the `IdleGovernor` for a C-state.

use serde::Deserialize;
use serde::Serialize;
use tracing::trace;

use crate::class::ClassId;
use crate::class::SchedClass;
use crate::core::Sched;
use crate::task::DequeueFlags;
use crate::task::EnqueueFlags;
use crate::task::WakeFlags;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::NSEC_PER_USEC;

/// One C-state as the idle governor sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleState {
    pub name: String,
    pub exit_latency_ns: u64,
    /// Minimum stay for the state to save energy.
    pub target_residency_ns: u64,
}

impl IdleState {
    pub fn defaults() -> Vec<IdleState> {
        vec![
            IdleState {
                name: "POLL".into(),
                exit_latency_ns: 0,
                target_residency_ns: 0,
            },
            IdleState {
                name: "C1".into(),
                exit_latency_ns: 2 * NSEC_PER_USEC,
                target_residency_ns: 2 * NSEC_PER_USEC,
            },
            IdleState {
                name: "C6".into(),
                exit_latency_ns: 133 * NSEC_PER_USEC,
                target_residency_ns: 600 * NSEC_PER_USEC,
            },
        ]
    }
}

/// Picks a C-state for a CPU about to idle.
pub trait IdleGovernor: Send {
    /// Index into `states` given the predicted idle length.
    fn select(&mut self, cpu: CpuId, states: &[IdleState], predicted_ns: u64) -> usize;

    /// Feedback with the residency actually achieved.
    fn reflect(&mut self, _cpu: CpuId, _state: usize, _residency_ns: u64) {}
}

/// Deepest state whose target residency and exit latency fit the
/// predicted idle period.
#[derive(Debug, Default)]
pub struct ResidencyGovernor;

impl IdleGovernor for ResidencyGovernor {
    fn select(&mut self, _cpu: CpuId, states: &[IdleState], predicted_ns: u64) -> usize {
        states
            .iter()
            .rposition(|s| s.target_residency_ns <= predicted_ns && s.exit_latency_ns <= predicted_ns / 2)
            .unwrap_or(0)
    }
}

impl Sched {
    pub(crate) fn idle_enter(&mut self, cpu: CpuId) {
        let rq = &mut self.rqs[cpu.idx()];
        let now = rq.clock.wall();
        if rq.idle_stamp == 0 {
            rq.idle_stamp = now.max(1);
        }
        let predicted = rq.avg_idle;
        let state = if self.idle_states.is_empty() {
            None
        } else {
            Some(self.idle_gov.select(cpu, &self.idle_states, predicted))
        };
        self.rqs[cpu.idx()].idle_state = state;
        trace!(cpu = cpu.0, ?state, predicted, "enter idle");

        self.calc_load_nohz_start(cpu);
        self.nohz_balance_enter_idle(cpu);
        self.update_idle_core(cpu);
        self.nohz_run_idle_balance(cpu);
    }

    pub(crate) fn idle_exit(&mut self, cpu: CpuId) {
        let rq = &mut self.rqs[cpu.idx()];
        let residency = rq.clock.wall().saturating_sub(rq.idle_stamp);
        if let Some(state) = rq.idle_state.take() {
            self.idle_gov.reflect(cpu, state, residency);
        }
        self.nohz_balance_exit_idle(cpu);
        self.calc_load_nohz_stop(cpu);
    }

    /// C-state `cpu` currently sits in, if idle.
    pub fn idle_state(&self, cpu: CpuId) -> Option<&IdleState> {
        self.rqs[cpu.idx()].idle_state.and_then(|i| self.idle_states.get(i))
    }
}

pub struct IdleClass;

pub static IDLE_CLASS: IdleClass = IdleClass;

impl SchedClass for IdleClass {
    fn id(&self) -> ClassId {
        ClassId::Idle
    }

    fn enqueue_task(&self, _s: &mut Sched, _cpu: CpuId, p: Pid, _flags: EnqueueFlags) {
        unreachable!("idle task {p} enqueued");
    }

    fn dequeue_task(&self, _s: &mut Sched, _cpu: CpuId, p: Pid, _flags: DequeueFlags) {
        unreachable!("idle task {p} dequeued");
    }

    // Everything preempts idle.
    fn check_preempt_curr(&self, s: &mut Sched, cpu: CpuId, _p: Pid, _wf: WakeFlags) {
        s.resched_curr(cpu);
    }

    fn pick_next_task(&self, s: &mut Sched, cpu: CpuId) -> Option<Pid> {
        let idle = s.rqs[cpu.idx()].idle;
        self.set_next_task(s, cpu, idle, true);
        Some(idle)
    }

    fn put_prev_task(&self, _s: &mut Sched, _cpu: CpuId, _p: Pid) {}

    fn set_next_task(&self, s: &mut Sched, cpu: CpuId, p: Pid, _first: bool) {
        let now = s.rqs[cpu.idx()].clock.task();
        s.tasks[p].se.exec_start = now;
    }

    fn select_task_rq(&self, s: &mut Sched, p: Pid, _prev_cpu: CpuId, _wf: WakeFlags) -> CpuId {
        s.tasks[p].cpu
    }

    fn task_tick(&self, _s: &mut Sched, _cpu: CpuId, _p: Pid, _queued: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residency_governor_picks_deepest_fitting_state() {
        let states = IdleState::defaults();
        let mut gov = ResidencyGovernor;
        assert_eq!(gov.select(CpuId(0), &states, 0), 0);
        assert_eq!(gov.select(CpuId(0), &states, 10 * NSEC_PER_USEC), 1);
        assert_eq!(gov.select(CpuId(0), &states, 2_000 * NSEC_PER_USEC), 2);
    }
}
