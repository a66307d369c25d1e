// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The per-CPU runqueue.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use bitflags::bitflags;

use crate::clock::RqClock;
use crate::deadline::DlRq;
use crate::fair::CfsRq;
use crate::pelt::SchedAvg;
use crate::rt::RtRq;
use crate::stats::RqStats;
use crate::task::SchedEntity;
use crate::task::WakeFlags;
use crate::timer::TimerHandle;
use crate::types::CpuId;
use crate::types::GroupId;
use crate::types::Pid;
use crate::types::TimeNs;
use crate::uclamp::UclampRqs;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NohzFlags: u32 {
        /// Run a full balance pass for the idle CPUs.
        const BALANCE_KICK = 0x1;
        /// Only refresh blocked load.
        const STATS_KICK = 0x2;
        /// Update blocked load on behalf of a CPU going newly idle.
        const NEWILB_KICK = 0x4;
        /// Only refresh nohz.next_balance.
        const NEXT_KICK = 0x8;
        const KICK_MASK = Self::BALANCE_KICK.bits() | Self::STATS_KICK.bits() | Self::NEXT_KICK.bits();
    }
}

#[derive(Debug, Clone, Default)]
pub struct RqNohz {
    pub tick_stopped: bool,
    /// Currently balancing on behalf of nohz-idle CPUs.
    pub idle_balance: bool,
    pub flags: NohzFlags,
    pub next_balance: u64,
    /// Something on this runqueue still needs the periodic tick.
    pub tick_dep: bool,
}

/// Deferred work run after a context switch with the rq still held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BalanceCallback {
    PushRt,
    PullRt,
    PushDl,
    PullDl,
}

/// Work queued for the per-CPU stop task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopWork {
    /// Move a task off this CPU to `dest`, or to any allowed CPU.
    Migrate { pid: Pid, dest: Option<CpuId> },
    /// Push the running fair task to an idle `dst`.
    ActiveBalance { dst: CpuId },
    /// Drain every queued task off a dying CPU.
    Drain,
}

#[derive(Debug)]
pub struct Rq {
    pub cpu: CpuId,
    pub nr_running: u32,
    pub nr_uninterruptible: i64,
    pub nr_iowait: u32,
    pub nr_switches: u64,
    pub curr: Pid,
    pub idle: Pid,
    pub stop: Pid,
    pub need_resched: bool,
    pub online: bool,

    pub clock: RqClock,

    /// Fair runqueues, the root one under `GroupId::ROOT`.
    pub cfs_rqs: BTreeMap<GroupId, CfsRq>,
    /// Group entities representing each non-root group on this CPU.
    pub group_se: BTreeMap<GroupId, SchedEntity>,
    /// Fair tasks queued here, most recently run first.
    pub cfs_tasks: VecDeque<Pid>,
    pub rt: RtRq,
    pub dl: DlRq,

    pub avg_rt: SchedAvg,
    pub avg_dl: SchedAvg,
    pub avg_irq: SchedAvg,
    pub avg_thermal: SchedAvg,
    pub thermal_pressure: u64,

    pub cpu_capacity_orig: u64,
    /// Capacity left for fair tasks after RT/DL/IRQ/thermal pressure.
    pub cpu_capacity: u64,
    pub cur_freq_khz: u64,
    pub max_freq_khz: u64,
    pub misfit_task_load: u64,

    pub idle_stamp: TimeNs,
    pub avg_idle: u64,
    pub max_idle_balance_cost: u64,
    pub wake_stamp: u64,
    pub wake_avg_idle: u64,
    pub idle_state: Option<usize>,

    /// Jiffies at which the next periodic balance is due.
    pub next_balance: u64,
    pub active_balance: bool,
    pub push_cpu: Option<CpuId>,
    pub active_balance_timer: Option<TimerHandle>,
    pub balance_callbacks: Vec<BalanceCallback>,
    pub stop_work: VecDeque<StopWork>,

    /// Remote wakeups queued for this CPU to finish.
    pub wake_list: Vec<(Pid, WakeFlags)>,
    pub nohz: RqNohz,
    pub last_blocked_load_update_tick: u64,
    pub has_blocked_load: bool,

    pub uclamp: UclampRqs,
    pub calc_load_active: i64,
    pub calc_load_update: TimeNs,
    pub hrtick_timer: Option<TimerHandle>,

    pub stats: RqStats,
}

impl Rq {
    pub fn new(cpu: CpuId, capacity_orig: u64, max_freq_khz: u64, idle: Pid, stop: Pid) -> Self {
        let mut cfs_rqs = BTreeMap::new();
        cfs_rqs.insert(GroupId::ROOT, CfsRq::new(GroupId::ROOT));
        Self {
            cpu,
            nr_running: 0,
            nr_uninterruptible: 0,
            nr_iowait: 0,
            nr_switches: 0,
            curr: idle,
            idle,
            stop,
            need_resched: false,
            online: false,
            clock: RqClock::default(),
            cfs_rqs,
            group_se: BTreeMap::new(),
            cfs_tasks: VecDeque::new(),
            rt: RtRq::new(),
            dl: DlRq::new(),
            avg_rt: SchedAvg::default(),
            avg_dl: SchedAvg::default(),
            avg_irq: SchedAvg::default(),
            avg_thermal: SchedAvg::default(),
            thermal_pressure: 0,
            cpu_capacity_orig: capacity_orig,
            cpu_capacity: capacity_orig,
            cur_freq_khz: max_freq_khz,
            max_freq_khz,
            misfit_task_load: 0,
            idle_stamp: 0,
            avg_idle: 2 * crate::types::NSEC_PER_MSEC,
            max_idle_balance_cost: crate::types::NSEC_PER_MSEC / 2,
            wake_stamp: 0,
            wake_avg_idle: crate::types::NSEC_PER_MSEC,
            idle_state: None,
            next_balance: 0,
            active_balance: false,
            push_cpu: None,
            active_balance_timer: None,
            balance_callbacks: vec![],
            stop_work: VecDeque::new(),
            wake_list: vec![],
            nohz: RqNohz::default(),
            last_blocked_load_update_tick: 0,
            has_blocked_load: false,
            uclamp: UclampRqs::default(),
            calc_load_active: 0,
            calc_load_update: 0,
            hrtick_timer: None,
            stats: RqStats::default(),
        }
    }

    pub fn cfs(&self) -> &CfsRq {
        &self.cfs_rqs[&GroupId::ROOT]
    }

    pub fn cfs_rq(&self, g: GroupId) -> Option<&CfsRq> {
        self.cfs_rqs.get(&g)
    }

    pub fn is_idle(&self) -> bool {
        self.curr == self.idle && self.nr_running == 0 && self.wake_list.is_empty()
    }

    /// Fair tasks counted in `nr_running`, throttled ones excluded.
    pub fn cfs_h_nr_running(&self) -> u32 {
        self.cfs().h_nr_running
    }

    pub fn queue_balance_callback(&mut self, cb: BalanceCallback) {
        if !self.balance_callbacks.contains(&cb) {
            self.balance_callbacks.push(cb);
        }
    }

    /// Frequency invariance factor, 0..=1024.
    pub fn freq_scale(&self) -> u64 {
        crate::clock::freq_scale(self.cur_freq_khz, self.max_freq_khz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rq_is_idle() {
        let rq = Rq::new(CpuId(2), 1024, 2_000_000, Pid(3), Pid(4));
        assert!(rq.is_idle());
        assert_eq!(rq.cfs().nr_running, 0);
        assert_eq!(rq.freq_scale(), 1024);
    }

    #[test]
    fn balance_callbacks_are_deduplicated() {
        let mut rq = Rq::new(CpuId(0), 1024, 2_000_000, Pid(1), Pid(2));
        rq.queue_balance_callback(BalanceCallback::PushRt);
        rq.queue_balance_callback(BalanceCallback::PushRt);
        rq.queue_balance_callback(BalanceCallback::PullDl);
        assert_eq!(rq.balance_callbacks.len(), 2);
    }
}
