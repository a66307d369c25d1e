// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-runqueue clocks.
//!
//! `clock` follows the monotonic source. `clock_task` excludes time spent in
//! irq context and steal. `clock_pelt` is `clock_task` scaled by the CPU's
//! capacity and current frequency so that signals on a slow CPU age less;
//! when the CPU goes idle it is synced forward to `clock_task`.

use crate::prio::SCHED_CAPACITY_SCALE;
use crate::prio::SCHED_CAPACITY_SHIFT;
use crate::types::TimeNs;

/// A caller asked that the next update be skipped.
pub const RQCF_REQ_SKIP: u8 = 0x01;
/// The skip is in effect for the current critical section.
pub const RQCF_ACT_SKIP: u8 = 0x02;
/// The clock was updated inside the current critical section.
pub const RQCF_UPDATED: u8 = 0x04;

#[derive(Debug, Clone, Default)]
pub struct RqClock {
    pub clock: TimeNs,
    pub clock_task: TimeNs,
    pub clock_pelt: TimeNs,
    pub clock_idle: TimeNs,
    /// Irq + steal time not yet subtracted from `clock_task`.
    pub pending_irq: TimeNs,
    pub total_irq: TimeNs,
    pub update_flags: u8,
}

pub fn cap_scale(v: u64, scale: u64) -> u64 {
    (v * scale) >> SCHED_CAPACITY_SHIFT
}

impl RqClock {
    /// Advance all three clocks to `now`.
    ///
    /// Returns the task-clock delta, which is what irq-time PELT tracking
    /// and the idle path need.
    pub fn update(&mut self, now: TimeNs, capacity_orig: u64, freq_scale: u64, idle: bool) -> u64 {
        if self.update_flags & RQCF_ACT_SKIP != 0 {
            return 0;
        }
        let delta = now.saturating_sub(self.clock);
        if delta == 0 {
            self.update_flags |= RQCF_UPDATED;
            return 0;
        }
        self.clock += delta;

        let irq = self.pending_irq.min(delta);
        self.pending_irq -= irq;
        self.total_irq += irq;
        let task_delta = delta - irq;
        self.clock_task += task_delta;
        self.update_pelt(task_delta, capacity_orig, freq_scale, idle);
        self.update_flags |= RQCF_UPDATED;
        task_delta
    }

    fn update_pelt(&mut self, delta: u64, capacity_orig: u64, freq_scale: u64, idle: bool) {
        if idle {
            // An idle CPU has nothing to age; re-sync so the next busy
            // period starts from the task clock.
            self.sync_pelt_idle();
            return;
        }
        let scaled = cap_scale(cap_scale(delta, capacity_orig), freq_scale);
        self.clock_pelt += scaled;
    }

    fn sync_pelt_idle(&mut self) {
        self.clock_pelt = self.clock_task;
        self.clock_idle = self.clock_task;
    }

    /// Charge irq or steal time; subtracted from the task clock at the next
    /// update.
    pub fn account_irq(&mut self, ns: u64) {
        self.pending_irq += ns;
    }

    pub fn pelt(&self) -> TimeNs {
        self.clock_pelt
    }

    pub fn task(&self) -> TimeNs {
        self.clock_task
    }

    pub fn wall(&self) -> TimeNs {
        self.clock
    }

    /// Ask that the next update be skipped; used when a cross-rq operation
    /// has already updated this clock.
    pub fn skip_update(&mut self) {
        self.update_flags |= RQCF_REQ_SKIP;
    }

    pub fn clear_skip(&mut self) {
        self.update_flags &= !(RQCF_REQ_SKIP | RQCF_ACT_SKIP);
    }

    /// Start of a locked section: promote a requested skip to an active one.
    pub fn pin(&mut self) {
        self.update_flags &= RQCF_REQ_SKIP;
        if self.update_flags & RQCF_REQ_SKIP != 0 {
            self.update_flags |= RQCF_ACT_SKIP;
        }
    }

    pub fn unpin(&mut self) {
        self.update_flags = 0;
    }
}

/// Frequency scale for a CPU running at `cur_khz` out of `max_khz`.
pub fn freq_scale(cur_khz: u64, max_khz: u64) -> u64 {
    if max_khz == 0 {
        return SCHED_CAPACITY_SCALE;
    }
    ((cur_khz << SCHED_CAPACITY_SHIFT) / max_khz).min(SCHED_CAPACITY_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irq_time_excluded_from_task_clock() {
        let mut c = RqClock::default();
        c.account_irq(300);
        let d = c.update(1_000, 1024, 1024, false);
        assert_eq!(d, 700);
        assert_eq!(c.wall(), 1_000);
        assert_eq!(c.task(), 700);
        assert_eq!(c.pelt(), 700);
    }

    #[test]
    fn pelt_scaled_by_capacity_and_freq() {
        let mut c = RqClock::default();
        c.update(1_000_000, 512, 1024, false);
        assert_eq!(c.pelt(), 500_000);
        c.update(2_000_000, 1024, freq_scale(1_000, 2_000), false);
        assert_eq!(c.pelt(), 1_000_000);
    }

    #[test]
    fn idle_resyncs_pelt() {
        let mut c = RqClock::default();
        c.update(1_000_000, 512, 1024, false);
        c.update(2_000_000, 512, 1024, true);
        assert_eq!(c.pelt(), c.task());
    }

    #[test]
    fn skip_honoured_while_pinned() {
        let mut c = RqClock::default();
        c.skip_update();
        c.pin();
        assert_eq!(c.update(5_000, 1024, 1024, false), 0);
        c.unpin();
        assert_eq!(c.update(5_000, 1024, 1024, false), 5_000);
    }
}
