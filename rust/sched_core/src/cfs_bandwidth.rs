// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CFS bandwidth control
//!
//! A group with a quota gets `quota` ns of runtime per `period` in a
//! global pool. Per-CPU runqueues draw slices from the pool as they run.
//! When a runqueue's local runtime runs out and the pool is empty the
//! runqueue is throttled: its group entity is dequeued and its subtree's
//! PELT clock frozen until the period timer refills the pool and hands
//! runtime back to throttled runqueues.

use tracing::debug;
use tracing::trace;

use crate::core::Sched;
use crate::core::SchedEvent;
use crate::error::SchedError;
use crate::error::SchedResult;
use crate::fair_load::UpdateFlags;
use crate::root_domain::to_ratio;
use crate::task::DequeueFlags;
use crate::task::EnqueueFlags;
use crate::timer::TimerEvent;
use crate::timer::TimerHandle;
use crate::types::CpuId;
use crate::types::EntityRef;
use crate::types::GroupId;
use crate::types::TimeNs;
use crate::types::NSEC_PER_MSEC;
use crate::types::NSEC_PER_SEC;
use crate::types::NSEC_PER_USEC;

pub const MIN_CFS_QUOTA_PERIOD: u64 = NSEC_PER_MSEC;
pub const MAX_CFS_QUOTA_PERIOD: u64 = NSEC_PER_SEC;
/// Largest quota or quota+burst accepted.
pub const MAX_CFS_RUNTIME: u64 = (1 << 44) * NSEC_PER_USEC;
/// Local runtime a runqueue keeps when returning slack to the pool.
const MIN_CFS_RQ_RUNTIME: i64 = NSEC_PER_MSEC as i64;
/// Skip slack distribution when the period timer is this close.
const MIN_BANDWIDTH_EXPIRATION: u64 = 2 * NSEC_PER_MSEC;
const CFS_BANDWIDTH_SLACK_PERIOD: u64 = 5 * NSEC_PER_MSEC;
const DEFAULT_CFS_PERIOD: u64 = 100 * NSEC_PER_MSEC;

#[derive(Debug, Clone)]
pub struct CfsBandwidth {
    pub period: u64,
    /// None means unlimited.
    pub quota: Option<u64>,
    pub burst: u64,
    /// Runtime left in the pool this period.
    pub runtime: u64,
    pub runtime_snap: u64,
    /// Effective ratio after ancestors' limits, None if unlimited.
    pub hierarchical_quota: Option<u64>,
    /// No runtime was drawn since the last refill.
    pub idle: bool,
    pub period_active: bool,
    pub period_expires: TimeNs,
    pub period_timer: Option<TimerHandle>,
    pub slack_started: bool,
    pub slack_timer: Option<TimerHandle>,
    /// CPUs whose runqueue of this group is throttled, oldest first.
    pub throttled_cfs_rq: Vec<CpuId>,

    pub nr_periods: u64,
    pub nr_throttled: u64,
    pub throttled_time: TimeNs,
    pub nr_burst: u64,
    pub burst_time: TimeNs,
}

impl Default for CfsBandwidth {
    fn default() -> Self {
        Self {
            period: DEFAULT_CFS_PERIOD,
            quota: None,
            burst: 0,
            runtime: 0,
            runtime_snap: 0,
            hierarchical_quota: None,
            idle: false,
            period_active: false,
            period_expires: 0,
            period_timer: None,
            slack_started: false,
            slack_timer: None,
            throttled_cfs_rq: vec![],
            nr_periods: 0,
            nr_throttled: 0,
            throttled_time: 0,
            nr_burst: 0,
            burst_time: 0,
        }
    }
}

impl CfsBandwidth {
    /// Refill the pool for a new period, keeping at most `quota + burst`.
    pub fn refill(&mut self) {
        let Some(quota) = self.quota else {
            return;
        };
        self.runtime += quota;
        if self.runtime_snap > self.runtime {
            self.burst_time += self.runtime_snap - self.runtime;
            self.nr_burst += 1;
        }
        self.runtime = self.runtime.min(quota + self.burst);
        self.runtime_snap = self.runtime;
    }

    /// Whether the period timer fires within `near` of `now`.
    fn refresh_within(&self, now: TimeNs, near: u64) -> bool {
        self.period_active && self.period_expires.saturating_sub(now) < near
    }
}

/// Statistics reported for a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CfsBandwidthStats {
    pub nr_periods: u64,
    pub nr_throttled: u64,
    pub throttled_time: TimeNs,
    pub nr_burst: u64,
    pub burst_time: TimeNs,
}

impl Sched {
    fn cfs_b(&self, g: GroupId) -> Option<&CfsBandwidth> {
        self.groups.get(g).map(|tg| &tg.cfs_b)
    }

    fn cfs_b_mut(&mut self, g: GroupId) -> Option<&mut CfsBandwidth> {
        self.groups.get_mut(g).map(|tg| &mut tg.cfs_b)
    }

    pub fn group_bandwidth_stats(&self, g: GroupId) -> SchedResult<CfsBandwidthStats> {
        let b = self.cfs_b(g).ok_or(SchedError::NoSuchGroup(g))?;
        Ok(CfsBandwidthStats {
            nr_periods: b.nr_periods,
            nr_throttled: b.nr_throttled,
            throttled_time: b.throttled_time,
            nr_burst: b.nr_burst,
            burst_time: b.burst_time,
        })
    }

    /// Configure a group's bandwidth. `quota` of None removes the limit.
    pub fn set_group_bandwidth(&mut self, g: GroupId, period: u64, quota: Option<u64>, burst: u64) -> SchedResult<()> {
        if g.is_root() {
            return Err(SchedError::GroupConfigInvalid("the root group is unlimited"));
        }
        if !self.groups.contains(g) {
            return Err(SchedError::NoSuchGroup(g));
        }
        if !(MIN_CFS_QUOTA_PERIOD..=MAX_CFS_QUOTA_PERIOD).contains(&period) {
            return Err(SchedError::GroupConfigInvalid("period out of range"));
        }
        if let Some(q) = quota {
            if q < MIN_CFS_QUOTA_PERIOD || q > MAX_CFS_RUNTIME {
                return Err(SchedError::GroupConfigInvalid("quota out of range"));
            }
            if burst > q || burst + q > MAX_CFS_RUNTIME {
                return Err(SchedError::GroupConfigInvalid("burst exceeds quota"));
            }
        } else if burst > 0 {
            return Err(SchedError::GroupConfigInvalid("burst without quota"));
        }
        let hq = self.cfs_schedulable(g, period, quota)?;

        for (x, q) in hq {
            if let Some(b) = self.cfs_b_mut(x) {
                b.hierarchical_quota = q;
            }
        }
        let now = self.now;
        let enabled = quota.is_some();
        let Some(b) = self.cfs_b_mut(g) else {
            return Err(SchedError::NoSuchGroup(g));
        };
        let was_enabled = b.quota.is_some();
        b.period = period;
        b.quota = quota;
        b.burst = burst;
        b.refill();
        if enabled {
            self.start_cfs_bandwidth(g, now);
        } else if was_enabled {
            self.cancel_cfs_bandwidth(g);
        }

        for i in 0..self.rqs.len() {
            let cpu = CpuId(i as u32);
            self.update_rq_clock(cpu);
            let cfs = self.cfs_mut(cpu, g);
            cfs.runtime_enabled = enabled;
            cfs.runtime_remaining = 0;
            if cfs.throttled {
                self.unthrottle_cfs_rq(cpu, g);
            }
        }
        debug!(group = g.0, period, ?quota, burst, "bandwidth set");
        Ok(())
    }

    /// Check that no group in `g`'s subtree would exceed its parent's
    /// effective limit, returning the new effective ratios.
    fn cfs_schedulable(&self, g: GroupId, period: u64, quota: Option<u64>) -> SchedResult<Vec<(GroupId, Option<u64>)>> {
        let mut out: Vec<(GroupId, Option<u64>)> = vec![];
        for x in self.groups.subtree(g) {
            let tg = &self.groups[x];
            let own = if x == g {
                quota.map(|q| to_ratio(period, q))
            } else {
                tg.cfs_b.quota.map(|q| to_ratio(tg.cfs_b.period, q))
            };
            let parent = tg.parent.unwrap_or(GroupId::ROOT);
            let parent_quota = match out.iter().find(|(y, _)| *y == parent) {
                Some((_, q)) => *q,
                None if parent.is_root() => None,
                None => self.groups[parent].cfs_b.hierarchical_quota,
            };
            let eff = match (own, parent_quota) {
                (None, pq) => pq,
                (Some(q), Some(pq)) if q > pq => {
                    return Err(SchedError::GroupConfigInvalid("quota exceeds parent"));
                }
                (Some(q), _) => Some(q),
            };
            out.push((x, eff));
        }
        Ok(out)
    }

    pub(crate) fn start_cfs_bandwidth(&mut self, g: GroupId, now: TimeNs) {
        let Some(b) = self.cfs_b_mut(g) else {
            return;
        };
        if b.period_active {
            return;
        }
        b.period_active = true;
        let mut expires = if b.period_expires == 0 { now + b.period } else { b.period_expires };
        while expires <= now {
            expires += b.period;
        }
        b.period_expires = expires;
        let handle = self.timers.arm(TimerEvent::CfsPeriod(g), expires, None);
        if let Some(b) = self.cfs_b_mut(g) {
            b.period_timer = Some(handle);
        }
        trace!(group = g.0, expires, "bandwidth period timer started");
    }

    pub(crate) fn cancel_cfs_bandwidth(&mut self, g: GroupId) {
        let Some(b) = self.cfs_b_mut(g) else {
            return;
        };
        let period = b.period_timer.take();
        let slack = b.slack_timer.take();
        b.period_active = false;
        b.slack_started = false;
        for h in [period, slack].into_iter().flatten() {
            self.timers.cancel(h);
        }
    }

    /// Draw runtime from the pool until local runtime reaches `target`.
    fn assign_cfs_rq_runtime_target(&mut self, cpu: CpuId, g: GroupId, target: i64) -> bool {
        let now = self.now;
        let remaining = self.cfs_rq(cpu, g).runtime_remaining;
        let min_amount = (target - remaining).max(0) as u64;
        let quota = self.cfs_b(g).and_then(|b| b.quota);
        let amount = match quota {
            None => min_amount,
            Some(_) => {
                self.start_cfs_bandwidth(g, now);
                match self.cfs_b_mut(g) {
                    Some(b) if b.runtime > 0 => {
                        let amount = b.runtime.min(min_amount);
                        b.runtime -= amount;
                        b.idle = false;
                        amount
                    }
                    _ => 0,
                }
            }
        };
        let cfs = self.cfs_mut(cpu, g);
        cfs.runtime_remaining += amount as i64;
        cfs.runtime_remaining > 0
    }

    fn assign_cfs_rq_runtime(&mut self, cpu: CpuId, g: GroupId) -> bool {
        let slice = self.tunables.cfs_bandwidth_slice_ns() as i64;
        self.assign_cfs_rq_runtime_target(cpu, g, slice)
    }

    /// Charge `delta` ns to the runqueue's local runtime.
    pub(crate) fn account_cfs_rq_runtime(&mut self, cpu: CpuId, g: GroupId, delta: u64) {
        let cfs = self.cfs_mut(cpu, g);
        if !cfs.runtime_enabled {
            return;
        }
        cfs.runtime_remaining -= delta as i64;
        if cfs.runtime_remaining > 0 || cfs.throttled {
            return;
        }
        let has_curr = cfs.curr.is_some();
        if !self.assign_cfs_rq_runtime(cpu, g) && has_curr {
            self.resched_curr(cpu);
        }
    }

    /// Throttle the runqueue if it ran out of runtime. Returns true if it
    /// is throttled afterwards.
    pub(crate) fn check_cfs_rq_runtime(&mut self, cpu: CpuId, g: GroupId) -> bool {
        let cfs = self.cfs_rq(cpu, g);
        if !cfs.runtime_enabled || cfs.runtime_remaining > 0 {
            return false;
        }
        if cfs.throttled {
            return true;
        }
        self.throttle_cfs_rq(cpu, g)
    }

    /// A runqueue got its first entity: throttle it right away if it has
    /// no runtime to run with.
    pub(crate) fn check_enqueue_throttle(&mut self, cpu: CpuId, g: GroupId) {
        let cfs = self.cfs_rq(cpu, g);
        if !cfs.runtime_enabled || cfs.curr.is_some() || cfs.throttled {
            return;
        }
        self.account_cfs_rq_runtime(cpu, g, 0);
        if self.cfs_rq(cpu, g).runtime_remaining <= 0 {
            self.throttle_cfs_rq(cpu, g);
        }
    }

    /// Hand unused local runtime back to the pool when a runqueue empties.
    pub(crate) fn return_cfs_rq_runtime(&mut self, cpu: CpuId, g: GroupId) {
        let cfs = self.cfs_rq(cpu, g);
        if !cfs.runtime_enabled || cfs.nr_running > 0 {
            return;
        }
        let slack = cfs.runtime_remaining - MIN_CFS_RQ_RUNTIME;
        if slack <= 0 {
            return;
        }
        let slice = self.tunables.cfs_bandwidth_slice_ns();
        let now = self.now;
        let mut start_slack = false;
        if let Some(b) = self.cfs_b_mut(g) {
            if b.quota.is_some() {
                b.runtime += slack as u64;
                start_slack = b.runtime > slice && !b.throttled_cfs_rq.is_empty();
            }
        }
        self.cfs_mut(cpu, g).runtime_remaining -= slack;
        if start_slack {
            self.start_cfs_slack_bandwidth(g, now);
        }
    }

    fn start_cfs_slack_bandwidth(&mut self, g: GroupId, now: TimeNs) {
        let Some(b) = self.cfs_b_mut(g) else {
            return;
        };
        if b.refresh_within(now, MIN_BANDWIDTH_EXPIRATION) || b.slack_started {
            return;
        }
        b.slack_started = true;
        let handle = self.timers.arm(TimerEvent::CfsSlack(g), now + CFS_BANDWIDTH_SLACK_PERIOD, None);
        if let Some(b) = self.cfs_b_mut(g) {
            b.slack_timer = Some(handle);
        }
    }

    fn tg_throttle_down(&mut self, cpu: CpuId, g: GroupId) {
        let pelt = self.rqs[cpu.idx()].clock.pelt();
        let now = self.rqs[cpu.idx()].clock.task();
        let cfs = self.cfs_mut(cpu, g);
        if cfs.throttle_count == 0 {
            cfs.throttled_clock_pelt = pelt;
            cfs.on_list = false;
            if cfs.throttled_clock_self == 0 {
                cfs.throttled_clock_self = now;
            }
        }
        cfs.throttle_count += 1;
    }

    fn tg_unthrottle_up(&mut self, cpu: CpuId, g: GroupId) {
        let pelt = self.rqs[cpu.idx()].clock.pelt();
        let now = self.rqs[cpu.idx()].clock.task();
        let cfs = self.cfs_mut(cpu, g);
        cfs.throttle_count = cfs.throttle_count.saturating_sub(1);
        if cfs.throttle_count == 0 {
            cfs.throttled_clock_pelt_time += pelt - cfs.throttled_clock_pelt;
            if cfs.throttled_clock_self > 0 {
                cfs.throttled_clock_self_time += now - cfs.throttled_clock_self;
                cfs.throttled_clock_self = 0;
            }
            cfs.on_list = cfs.load.weight > 0 || cfs.avg.load_avg > 0 || cfs.avg.util_avg > 0;
        }
    }

    /// Dequeue a runqueue's group entity and freeze its subtree. Returns
    /// false if enough runtime turned up to keep running.
    pub(crate) fn throttle_cfs_rq(&mut self, cpu: CpuId, g: GroupId) -> bool {
        if self.assign_cfs_rq_runtime_target(cpu, g, 1) {
            return false;
        }
        if let Some(b) = self.cfs_b_mut(g) {
            if !b.throttled_cfs_rq.contains(&cpu) {
                b.throttled_cfs_rq.push(cpu);
            }
        }
        for x in self.groups.subtree(g) {
            self.tg_throttle_down(cpu, x);
        }

        let task_delta = self.cfs_rq(cpu, g).h_nr_running;
        let mut idle_delta = self.cfs_rq(cpu, g).idle_h_nr_running;
        let mut cur = Some(EntityRef::Group(g));
        let mut dequeue = true;
        let mut reached_root = true;
        while let Some(e) = cur {
            if !self.se(cpu, e).on_rq {
                reached_root = false;
                break;
            }
            let pg = self.se(cpu, e).cfs_rq;
            if dequeue {
                self.dequeue_entity(cpu, pg, e, DequeueFlags::SLEEP);
            } else {
                self.update_load_avg(cpu, pg, e, UpdateFlags::empty());
                self.se_update_runnable(cpu, e);
            }
            if let EntityRef::Group(gq) = e {
                if self.cfs_rq_is_idle(gq) {
                    idle_delta = task_delta;
                }
            }
            let pcfs = self.cfs_mut(cpu, pg);
            pcfs.h_nr_running -= task_delta;
            pcfs.idle_h_nr_running = pcfs.idle_h_nr_running.saturating_sub(idle_delta);
            if dequeue && pcfs.load.weight > 0 {
                dequeue = false;
            }
            cur = self.se(cpu, e).parent();
        }
        if reached_root {
            self.sub_nr_running(cpu, task_delta);
        }

        let now = self.rqs[cpu.idx()].clock.task();
        let cfs = self.cfs_mut(cpu, g);
        cfs.throttled = true;
        cfs.throttled_clock = now;
        self.rqs[cpu.idx()].stats.nr_throttled += 1;
        self.emit(SchedEvent::Throttled { cpu, group: g });
        debug!(cpu = cpu.0, group = g.0, "cfs_rq throttled");
        true
    }

    pub(crate) fn unthrottle_cfs_rq(&mut self, cpu: CpuId, g: GroupId) {
        self.update_rq_clock(cpu);
        let now = self.rqs[cpu.idx()].clock.task();
        let throttled_clock = self.cfs_rq(cpu, g).throttled_clock;
        self.cfs_mut(cpu, g).throttled = false;
        if let Some(b) = self.cfs_b_mut(g) {
            b.throttled_time += now.saturating_sub(throttled_clock);
            b.throttled_cfs_rq.retain(|&c| c != cpu);
        }
        for x in self.groups.subtree(g) {
            self.tg_unthrottle_up(cpu, x);
        }
        self.emit(SchedEvent::Unthrottled { cpu, group: g });
        debug!(cpu = cpu.0, group = g.0, "cfs_rq unthrottled");

        if self.cfs_rq(cpu, g).load.weight > 0 {
            let task_delta = self.cfs_rq(cpu, g).h_nr_running;
            let mut idle_delta = self.cfs_rq(cpu, g).idle_h_nr_running;
            let mut cur = Some(EntityRef::Group(g));
            let mut reached_root = true;
            while let Some(e) = cur {
                let pg = self.se(cpu, e).cfs_rq;
                if self.se(cpu, e).on_rq {
                    self.update_load_avg(cpu, pg, e, UpdateFlags::UPDATE_TG);
                    self.se_update_runnable(cpu, e);
                } else {
                    self.enqueue_entity(cpu, pg, e, EnqueueFlags::WAKEUP);
                }
                if let EntityRef::Group(gq) = e {
                    if self.cfs_rq_is_idle(gq) {
                        idle_delta = task_delta;
                    }
                }
                let pcfs = self.cfs_mut(cpu, pg);
                pcfs.h_nr_running += task_delta;
                pcfs.idle_h_nr_running += idle_delta;
                // Stop at a throttled ancestor; its own unthrottle adds us.
                if pcfs.throttled {
                    reached_root = false;
                    break;
                }
                cur = self.se(cpu, e).parent();
            }
            if reached_root {
                self.add_nr_running(cpu, task_delta);
            }
        }

        let rq = &self.rqs[cpu.idx()];
        if rq.curr == rq.idle && rq.cfs().nr_running > 0 {
            self.resched_curr(cpu);
        }
    }

    /// Hand pool runtime to throttled runqueues in throttle order.
    fn distribute_cfs_runtime(&mut self, g: GroupId) {
        let cpus = match self.cfs_b(g) {
            Some(b) => b.throttled_cfs_rq.clone(),
            None => return,
        };
        for cpu in cpus {
            self.update_rq_clock(cpu);
            if !self.cfs_rq(cpu, g).throttled {
                continue;
            }
            let need = (-self.cfs_rq(cpu, g).runtime_remaining + 1).max(0) as u64;
            let Some(b) = self.cfs_b_mut(g) else {
                return;
            };
            let runtime = need.min(b.runtime);
            b.runtime -= runtime;
            let left = b.runtime;
            let cfs = self.cfs_mut(cpu, g);
            cfs.runtime_remaining += runtime as i64;
            if cfs.runtime_remaining > 0 {
                self.unthrottle_cfs_rq(cpu, g);
            }
            if left == 0 {
                break;
            }
        }
    }

    /// Returns true when the period timer should stop.
    fn do_cfs_period(&mut self, g: GroupId, overrun: u64) -> bool {
        let Some(b) = self.cfs_b_mut(g) else {
            return true;
        };
        if b.quota.is_none() {
            return true;
        }
        let mut throttled = !b.throttled_cfs_rq.is_empty();
        b.nr_periods += overrun;
        b.refill();
        if b.idle && !throttled {
            return true;
        }
        if !throttled {
            b.idle = true;
            return false;
        }
        b.nr_throttled += overrun;
        loop {
            let runtime = self.cfs_b(g).map_or(0, |b| b.runtime);
            if !throttled || runtime == 0 {
                break;
            }
            let before = self.cfs_b(g).map_or(0, |b| b.throttled_cfs_rq.len());
            self.distribute_cfs_runtime(g);
            let after = self.cfs_b(g).map_or(0, |b| b.throttled_cfs_rq.len());
            throttled = after > 0;
            if after == before {
                break;
            }
        }
        if let Some(b) = self.cfs_b_mut(g) {
            b.idle = false;
        }
        false
    }

    /// Period timer handler: refill, unthrottle and re-arm.
    pub(crate) fn cfs_period_timer(&mut self, g: GroupId, expired: TimeNs) {
        let now = self.now;
        let Some(b) = self.cfs_b_mut(g) else {
            return;
        };
        b.period_timer = None;
        let mut next = expired;
        let mut overrun = 0;
        while next <= now {
            next += b.period;
            overrun += 1;
        }
        let idle = self.do_cfs_period(g, overrun.max(1));
        let Some(b) = self.cfs_b_mut(g) else {
            return;
        };
        b.period_expires = next;
        if idle {
            b.period_active = false;
            trace!(group = g.0, "bandwidth period timer idle");
            return;
        }
        let handle = self.timers.arm(TimerEvent::CfsPeriod(g), next, None);
        if let Some(b) = self.cfs_b_mut(g) {
            b.period_timer = Some(handle);
        }
    }

    pub(crate) fn cfs_slack_timer(&mut self, g: GroupId) {
        let now = self.now;
        let slice = self.tunables.cfs_bandwidth_slice_ns();
        let Some(b) = self.cfs_b_mut(g) else {
            return;
        };
        b.slack_started = false;
        b.slack_timer = None;
        if b.refresh_within(now, MIN_BANDWIDTH_EXPIRATION) {
            return;
        }
        if b.quota.is_none() || b.runtime <= slice {
            return;
        }
        self.distribute_cfs_runtime(g);
    }

    /// Re-enable runtime accounting on a CPU coming online.
    pub(crate) fn update_runtime_enabled(&mut self, cpu: CpuId) {
        for g in self.groups.ids() {
            if g.is_root() {
                continue;
            }
            let enabled = self.groups[g].cfs_b.quota.is_some();
            if let Some(cfs) = self.rqs[cpu.idx()].cfs_rqs.get_mut(&g) {
                cfs.runtime_enabled = enabled;
            }
        }
    }

    /// A CPU going offline must not keep tasks throttled: give every
    /// limited runqueue a token of runtime and unthrottle it.
    pub(crate) fn unthrottle_offline_cfs_rqs(&mut self, cpu: CpuId) {
        // Domain rebuilds also detach active runqueues; leave those alone.
        if self.active.has(cpu) {
            return;
        }
        for g in self.groups.ids() {
            let Some(cfs) = self.rqs[cpu.idx()].cfs_rqs.get_mut(&g) else {
                continue;
            };
            if !cfs.runtime_enabled {
                continue;
            }
            cfs.runtime_remaining = 1;
            cfs.runtime_enabled = false;
            if cfs.throttled {
                self.unthrottle_cfs_rq(cpu, g);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_caps_at_quota_plus_burst() {
        let mut b = CfsBandwidth {
            quota: Some(10 * NSEC_PER_MSEC),
            burst: 5 * NSEC_PER_MSEC,
            ..Default::default()
        };
        b.refill();
        assert_eq!(b.runtime, 10 * NSEC_PER_MSEC);
        b.refill();
        assert_eq!(b.runtime, 15 * NSEC_PER_MSEC);
        b.refill();
        assert_eq!(b.runtime, 15 * NSEC_PER_MSEC);
        assert_eq!(b.nr_burst, 0);

        // Drawing into the burst shows up on the next refill.
        b.runtime = 0;
        b.refill();
        assert_eq!(b.runtime, 10 * NSEC_PER_MSEC);
        assert_eq!(b.nr_burst, 1);
        assert_eq!(b.burst_time, 5 * NSEC_PER_MSEC);
    }

    #[test]
    fn unlimited_never_refills() {
        let mut b = CfsBandwidth::default();
        b.refill();
        assert_eq!(b.runtime, 0);
    }
}
