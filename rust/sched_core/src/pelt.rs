// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Per-entity load tracking
//!
//! Each signal is a geometric series over 1024us periods with a decay
//! factor `y` chosen so that `y^32 == 0.5`:
//!
//! ```text
//!   sum = u_0 + u_1*y + u_2*y^2 + ...
//! ```
//!
//! where `u_i` is the fraction of period `i` (counting back from now) during
//! which the entity was runnable/running. The running sums saturate at
//! `LOAD_AVG_MAX` and the averages are the sums divided by the current
//! divider, so a fully busy entity converges on its weight (load) or on
//! `SCHED_CAPACITY_SCALE` (util).

use crate::prio::SCHED_CAPACITY_SCALE;
use crate::prio::SCHED_CAPACITY_SHIFT;
use crate::types::TimeNs;

pub const LOAD_AVG_PERIOD: u64 = 32;
pub const LOAD_AVG_MAX: u64 = 47742;
pub const PELT_MIN_DIVIDER: u64 = LOAD_AVG_MAX - 1024;
const UTIL_EST_WEIGHT_SHIFT: u32 = 2;
const UTIL_AVG_UNCHANGED: u32 = 1 << 31;

/// `2^32 * y^n` for n in 0..32.
const RUNNABLE_AVG_YN_INV: [u32; 32] = [
    0xffffffff, 0xfa83b2da, 0xf5257d14, 0xefe4b99a, 0xeac0c6e6, 0xe5b906e6, 0xe0ccdeeb,
    0xdbfbb796, 0xd744fcc9, 0xd2a81d91, 0xce248c14, 0xc9b9bd85, 0xc5672a10, 0xc12c4cc9,
    0xbd08a39e, 0xb8fbaf46, 0xb504f333, 0xb123f581, 0xad583ee9, 0xa9a15ab4, 0xa5fed6a9,
    0xa2704302, 0x9ef5325f, 0x9b8d39b9, 0x9837f050, 0x94f4efa8, 0x91c3d373, 0x8ea4398a,
    0x8b95c1e3, 0x88980e80, 0x85aac367, 0x82cd8698,
];

/// Running sums and averages of one PELT-tracked entity or runqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedAvg {
    pub last_update_time: TimeNs,
    pub load_sum: u64,
    pub runnable_sum: u64,
    pub util_sum: u64,
    pub period_contrib: u64,
    pub load_avg: u64,
    pub runnable_avg: u64,
    pub util_avg: u64,
    pub util_est: UtilEst,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UtilEst {
    pub enqueued: u32,
    pub ewma: u32,
}

/// `val * y^n`.
pub fn decay_load(mut val: u64, n: u64) -> u64 {
    if n > LOAD_AVG_PERIOD * 63 {
        return 0;
    }
    let mut local_n = n;
    if local_n >= LOAD_AVG_PERIOD {
        val >>= local_n / LOAD_AVG_PERIOD;
        local_n %= LOAD_AVG_PERIOD;
    }
    ((val as u128 * RUNNABLE_AVG_YN_INV[local_n as usize] as u128) >> 32) as u64
}

/// Contribution of `periods` whole periods: the tail `d1` of the first,
/// the full periods in between and the head `d3` of the current one.
fn accumulate_pelt_segments(periods: u64, d1: u64, d3: u64) -> u64 {
    let c1 = decay_load(d1, periods);
    let c2 = LOAD_AVG_MAX - decay_load(LOAD_AVG_MAX, periods) - 1024;
    c1 + c2 + d3
}

fn accumulate_sum(mut delta: u64, sa: &mut SchedAvg, load: u64, runnable: u64, running: bool) -> u64 {
    let mut contrib = delta;
    delta += sa.period_contrib;
    let periods = delta / 1024;

    if periods != 0 {
        sa.load_sum = decay_load(sa.load_sum, periods);
        sa.runnable_sum = decay_load(sa.runnable_sum, periods);
        sa.util_sum = decay_load(sa.util_sum, periods);
        delta %= 1024;
        if load != 0 {
            contrib = accumulate_pelt_segments(periods, 1024 - sa.period_contrib, delta);
        }
    }
    sa.period_contrib = delta;

    if load != 0 {
        sa.load_sum += load * contrib;
    }
    if runnable != 0 {
        sa.runnable_sum += (runnable * contrib) << SCHED_CAPACITY_SHIFT;
    }
    if running {
        sa.util_sum += contrib << SCHED_CAPACITY_SHIFT;
    }
    periods
}

/// Advance the sums to `now`. Returns true when at least one period
/// boundary was crossed and the averages need recomputing.
pub fn update_load_sum(now: TimeNs, sa: &mut SchedAvg, load: u64, runnable: u64, running: bool) -> bool {
    let delta = now.wrapping_sub(sa.last_update_time);
    if (delta as i64) < 0 {
        sa.last_update_time = now;
        return false;
    }
    let delta = delta >> 10;
    if delta == 0 {
        return false;
    }
    sa.last_update_time += delta << 10;

    let (runnable, running) = if load == 0 { (0, false) } else { (runnable, running) };
    accumulate_sum(delta, sa, load, runnable, running) != 0
}

pub fn pelt_divider(sa: &SchedAvg) -> u64 {
    PELT_MIN_DIVIDER + sa.period_contrib
}

pub fn update_load_avg(sa: &mut SchedAvg, load: u64) {
    let divider = pelt_divider(sa);
    sa.load_avg = (load as u128 * sa.load_sum as u128 / divider as u128) as u64;
    sa.runnable_avg = sa.runnable_sum / divider;
    sa.util_avg = sa.util_sum / divider;
}

/// Update a task or group entity. `weight` is the entity's load weight;
/// `runnable` is 1 for a task or the hierarchical runnable count for a
/// group.
pub fn update_entity(now: TimeNs, sa: &mut SchedAvg, on_rq: bool, runnable: u64, running: bool, weight: u64) -> bool {
    if update_load_sum(now, sa, on_rq as u64, runnable, running) {
        update_load_avg(sa, weight);
        sa.util_est.enqueued &= !UTIL_AVG_UNCHANGED;
        return true;
    }
    false
}

/// Update an aggregate (fair runqueue) whose load is already weighted.
pub fn update_aggregate(now: TimeNs, sa: &mut SchedAvg, weight: u64, nr_running: u64, running: bool) -> bool {
    if update_load_sum(now, sa, weight, nr_running, running) {
        update_load_avg(sa, 1);
        return true;
    }
    false
}

/// Update a per-rq class signal (rt, dl, irq) where load, runnable and
/// running collapse to one boolean.
pub fn update_class_signal(now: TimeNs, sa: &mut SchedAvg, running: bool) -> bool {
    let r = running as u64;
    if update_load_sum(now, sa, r, r, running) {
        update_load_avg(sa, 1);
        return true;
    }
    false
}

/// Seed a new task entity so it does not start cold.
pub fn init_entity_runnable_average(sa: &mut SchedAvg, weight: u64) {
    *sa = SchedAvg::default();
    sa.load_avg = weight;
    sa.load_sum = pelt_divider(sa);
}

/// Give a forked task a util estimate of half the spare capacity share
/// of its runqueue.
pub fn post_init_entity_util_avg(sa: &mut SchedAvg, weight: u64, cfs_util_avg: u64, cfs_load_avg: u64, cpu_capacity: u64) {
    let cap = cpu_capacity.saturating_sub(cfs_util_avg) / 2;
    if cap > 0 {
        if cfs_util_avg != 0 {
            sa.util_avg = cfs_util_avg * weight / (cfs_load_avg + 1);
            if sa.util_avg > cap {
                sa.util_avg = cap;
            }
        } else {
            sa.util_avg = cap;
        }
    }
    sa.runnable_avg = sa.util_avg;
    let divider = pelt_divider(sa);
    sa.util_sum = sa.util_avg * divider;
    sa.runnable_sum = sa.runnable_avg * divider;
}

/// Decayed average of this task's util at dequeue time; the larger of the
/// ewma and the last enqueued value.
pub fn task_util_est(sa: &SchedAvg) -> u64 {
    let ue = sa.util_est;
    (ue.ewma.max(ue.enqueued & !UTIL_AVG_UNCHANGED)) as u64
}

pub fn task_util(sa: &SchedAvg) -> u64 {
    sa.util_avg
}

/// Estimate used for placement and frequency selection.
pub fn task_util_estimated(sa: &SchedAvg, use_est: bool) -> u64 {
    if use_est {
        task_util(sa).max(task_util_est(sa))
    } else {
        task_util(sa)
    }
}

/// Fold a completed activation into the util estimate.
pub fn util_est_update(sa: &mut SchedAvg) {
    let mut ue = sa.util_est;
    if ue.enqueued & UTIL_AVG_UNCHANGED != 0 {
        return;
    }
    let util = sa.util_avg.min(SCHED_CAPACITY_SCALE) as u32;
    ue.enqueued = util;
    if ue.ewma < util {
        ue.ewma = util;
    } else {
        let last_ewma_diff = ue.ewma as i64 - util as i64;
        // skip updates within 1% of capacity
        if last_ewma_diff < (SCHED_CAPACITY_SCALE / 100) as i64 {
            sa.util_est = UtilEst {
                enqueued: ue.enqueued | UTIL_AVG_UNCHANGED,
                ewma: ue.ewma,
            };
            return;
        }
        let ewma = (ue.ewma as i64) << UTIL_EST_WEIGHT_SHIFT;
        let ewma = ewma - last_ewma_diff;
        ue.ewma = (ewma >> UTIL_EST_WEIGHT_SHIFT) as u32;
    }
    ue.enqueued |= UTIL_AVG_UNCHANGED;
    sa.util_est = ue;
}

/// Subtract with clamp at zero.
pub fn sub_positive(v: &mut u64, dec: u64) {
    *v = v.saturating_sub(dec);
}

/// Add a signed delta with clamp at zero.
pub fn add_positive(v: &mut u64, delta: i64) {
    if delta < 0 {
        sub_positive(v, delta.unsigned_abs());
    } else {
        *v += delta as u64;
    }
}

/// Remove an entity of load weight `weight` from an aggregate avg.
pub fn detach_avg(agg: &mut SchedAvg, se: &SchedAvg, weight: u64) {
    sub_positive(&mut agg.load_avg, se.load_avg);
    sub_positive(&mut agg.util_avg, se.util_avg);
    sub_positive(&mut agg.runnable_avg, se.runnable_avg);
    sub_positive(&mut agg.load_sum, se.load_sum * weight.max(1));
    sub_positive(&mut agg.util_sum, se.util_sum);
    sub_positive(&mut agg.runnable_sum, se.runnable_sum);
    // Keep sums consistent with the averages after rounding losses.
    agg.load_sum = agg.load_sum.max(agg.load_avg * PELT_MIN_DIVIDER);
    agg.util_sum = agg.util_sum.max(agg.util_avg * PELT_MIN_DIVIDER);
    agg.runnable_sum = agg.runnable_sum.max(agg.runnable_avg * PELT_MIN_DIVIDER);
}

/// Add an entity to an aggregate avg, aligning its period to the
/// aggregate's so both decay in lockstep.
pub fn attach_avg(agg: &mut SchedAvg, se: &mut SchedAvg, weight: u64) {
    let divider = pelt_divider(agg);
    se.last_update_time = agg.last_update_time;
    se.period_contrib = agg.period_contrib;
    se.util_sum = se.util_avg * divider;
    se.runnable_sum = se.runnable_avg * divider;
    se.load_sum = if weight == 0 {
        0
    } else {
        se.load_avg * divider / weight
    };
    agg.load_avg += se.load_avg;
    agg.load_sum += se.load_sum * weight.max(1);
    agg.util_avg += se.util_avg;
    agg.util_sum += se.util_sum;
    agg.runnable_avg += se.runnable_avg;
    agg.runnable_sum += se.runnable_sum;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_life_is_32_periods() {
        let v = decay_load(1 << 20, 32);
        assert!((v as i64 - (1 << 19)).abs() <= 1, "{v}");
        assert_eq!(decay_load(1000, 0), 999);
        assert_eq!(decay_load(u64::MAX, 32 * 64), 0);
    }

    #[test]
    fn busy_entity_converges_to_weight() {
        let mut sa = SchedAvg::default();
        let mut now = 0;
        for _ in 0..1000 {
            now += 1_000_000;
            update_entity(now, &mut sa, true, 1, true, 1024);
        }
        assert!(sa.load_avg > 1000 && sa.load_avg <= 1024, "{}", sa.load_avg);
        assert!(sa.util_avg > 1000 && sa.util_avg <= SCHED_CAPACITY_SCALE, "{}", sa.util_avg);
    }

    #[test]
    fn idle_entity_decays() {
        let mut sa = SchedAvg::default();
        let mut now = 0;
        for _ in 0..500 {
            now += 1_000_000;
            update_entity(now, &mut sa, true, 1, true, 1024);
        }
        let busy = sa.util_avg;
        now += 32 * 1024 * 1024;
        update_entity(now, &mut sa, false, 0, false, 1024);
        assert!(sa.util_avg <= busy / 2 + 8, "{} vs {}", sa.util_avg, busy);
    }

    #[test]
    fn sub_period_updates_are_deferred() {
        let mut sa = SchedAvg::default();
        assert!(!update_entity(500, &mut sa, true, 1, true, 1024));
        assert_eq!(sa.last_update_time, 0);
    }

    #[test]
    fn half_busy_util() {
        let mut sa = SchedAvg::default();
        let mut now = 0;
        for i in 0..2000 {
            now += 1024 * 1024;
            let running = i % 2 == 0;
            update_entity(now, &mut sa, running, running as u64, running, 1024);
        }
        assert!((400..=624).contains(&sa.util_avg), "{}", sa.util_avg);
    }

    #[test]
    fn util_est_tracks_peak() {
        let mut sa = SchedAvg::default();
        sa.util_avg = 600;
        util_est_update(&mut sa);
        assert_eq!(task_util_est(&sa), 600);
        sa.util_avg = 100;
        assert_eq!(task_util_estimated(&sa, true), 600);
    }
}
