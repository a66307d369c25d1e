// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Schedstats counters kept per task, per runqueue and per domain.

use crate::types::TimeNs;

/// Which balance path is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuIdleType {
    /// Periodic balance from an idle CPU (tick or nohz).
    Idle,
    /// Periodic balance from a busy CPU.
    NotIdle,
    /// Balance on entry to idle.
    NewlyIdle,
}

impl CpuIdleType {
    pub const ALL: [CpuIdleType; 3] = [CpuIdleType::Idle, CpuIdleType::NotIdle, CpuIdleType::NewlyIdle];

    pub fn idx(self) -> usize {
        match self {
            CpuIdleType::Idle => 0,
            CpuIdleType::NotIdle => 1,
            CpuIdleType::NewlyIdle => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CpuIdleType::Idle => "idle",
            CpuIdleType::NotIdle => "busy",
            CpuIdleType::NewlyIdle => "newidle",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub wait_start: TimeNs,
    pub wait_max: TimeNs,
    pub wait_count: u64,
    pub wait_sum: TimeNs,
    pub iowait_count: u64,
    pub iowait_sum: TimeNs,
    pub sleep_start: TimeNs,
    pub block_start: TimeNs,
    pub exec_max: TimeNs,
    pub nr_migrations: u64,
    pub nr_forced_migrations: u64,
    pub nr_failed_migrations_affine: u64,
    pub nr_failed_migrations_running: u64,
    pub nr_failed_migrations_hot: u64,
    pub nr_wakeups: u64,
    pub nr_wakeups_sync: u64,
    pub nr_wakeups_migrate: u64,
    pub nr_wakeups_local: u64,
    pub nr_wakeups_remote: u64,
    pub nr_wakeups_affine: u64,
    pub nr_wakeups_affine_attempts: u64,
    pub nr_wakeups_passive: u64,
    pub nr_wakeups_idle: u64,
    pub nr_voluntary_switches: u64,
    pub nr_involuntary_switches: u64,
}

impl TaskStats {
    pub fn wait_begin(&mut self, now: TimeNs) {
        self.wait_start = now;
    }

    pub fn wait_end(&mut self, now: TimeNs) {
        if self.wait_start == 0 && now == 0 {
            return;
        }
        let delta = now.saturating_sub(self.wait_start);
        self.wait_max = self.wait_max.max(delta);
        self.wait_count += 1;
        self.wait_sum += delta;
        self.wait_start = 0;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RqStats {
    pub yld_count: u64,
    pub sched_count: u64,
    pub sched_goidle: u64,
    pub ttwu_count: u64,
    pub ttwu_local: u64,
    pub rq_cpu_time: TimeNs,
    pub run_delay: TimeNs,
    pub pcount: u64,
    pub nr_switches: u64,
    pub nr_ipi: u64,
    pub nr_throttled: u64,
    pub nr_hrtick: u64,
    pub nr_rt_push: u64,
    pub nr_rt_pull: u64,
    pub nr_dl_push: u64,
    pub nr_dl_pull: u64,
}

/// Load balance counters for one idle type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LbStats {
    pub lb_count: u64,
    pub lb_failed: u64,
    pub lb_balanced: u64,
    pub lb_imbalance: u64,
    pub lb_gained: u64,
    pub lb_hot_gained: u64,
    pub lb_nobusyq: u64,
    pub lb_nobusyg: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainStats {
    pub lb: [LbStats; 3],
    pub alb_count: u64,
    pub alb_failed: u64,
    pub alb_pushed: u64,
    pub sbe_count: u64,
    pub sbf_count: u64,
    pub ttwu_wake_remote: u64,
    pub ttwu_move_affine: u64,
    pub ttwu_move_balance: u64,
}

impl DomainStats {
    pub fn lb_mut(&mut self, idle: CpuIdleType) -> &mut LbStats {
        &mut self.lb[idle.idx()]
    }

    pub fn lb(&self, idle: CpuIdleType) -> &LbStats {
        &self.lb[idle.idx()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_accounting() {
        let mut s = TaskStats::default();
        s.wait_begin(100);
        s.wait_end(350);
        s.wait_begin(400);
        s.wait_end(450);
        assert_eq!(s.wait_count, 2);
        assert_eq!(s.wait_sum, 300);
        assert_eq!(s.wait_max, 250);
    }
}
