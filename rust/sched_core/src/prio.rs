// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Priorities, policies and load weights.
//!
//! Internal priorities run 0..140: 0..100 are realtime (lower is higher),
//! 100..140 map nice -20..19. Deadline tasks sit at -1.

use serde::Deserialize;
use serde::Serialize;

pub const MAX_NICE: i32 = 19;
pub const MIN_NICE: i32 = -20;
pub const NICE_WIDTH: i32 = MAX_NICE - MIN_NICE + 1;
pub const MAX_RT_PRIO: i32 = 100;
pub const MAX_PRIO: i32 = MAX_RT_PRIO + NICE_WIDTH;
pub const DEFAULT_PRIO: i32 = MAX_RT_PRIO + NICE_WIDTH / 2;
pub const MAX_USER_RT_PRIO: u32 = 99;
pub const MAX_DL_PRIO: i32 = 0;

pub const SCHED_FIXEDPOINT_SHIFT: u32 = 10;
pub const SCHED_CAPACITY_SHIFT: u32 = 10;
pub const SCHED_CAPACITY_SCALE: u64 = 1 << SCHED_CAPACITY_SHIFT;
pub const NICE_0_LOAD: u64 = 1 << SCHED_FIXEDPOINT_SHIFT;
pub const WEIGHT_IDLEPRIO: u64 = 3;
pub const WMULT_IDLEPRIO: u32 = 1_431_655_765;
const WMULT_CONST: u64 = !0u32 as u64;
const WMULT_SHIFT: u32 = 32;

pub const MIN_SHARES: u64 = 2;
pub const MAX_SHARES: u64 = 1 << 18;

/// Nice level to weight, roughly 1.25x per step.
pub const SCHED_PRIO_TO_WEIGHT: [u64; 40] = [
    88761, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916, 9548, 7620, 6100,
    4904, 3906, 3121, 2501, 1991, 1586, 1277, 1024, 820, 655, 526, 423, 335, 272, 215, 172,
    137, 110, 87, 70, 56, 45, 36, 29, 23, 18, 15,
];

/// 2^32 / weight, precomputed so the hot path multiplies instead of divides.
pub const SCHED_PRIO_TO_WMULT: [u32; 40] = [
    48388, 59856, 76040, 92818, 118348, 147320, 184698, 229616, 287308, 360437, 449829,
    563644, 704093, 875809, 1099582, 1376151, 1717300, 2157191, 2708050, 3363326, 4194304,
    5237765, 6557202, 8165337, 10153587, 12820798, 15790321, 19976592, 24970740, 31350126,
    39045157, 49367440, 61356676, 76695844, 95443717, 119304647, 148102320, 186737708,
    238609294, 286331153,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    Normal,
    Batch,
    Idle,
    Fifo,
    Rr,
    Deadline,
    /// Internal only; never accepted from a policy change.
    Stop,
}

impl Policy {
    pub fn is_fair(self) -> bool {
        matches!(self, Policy::Normal | Policy::Batch | Policy::Idle)
    }

    pub fn is_rt(self) -> bool {
        matches!(self, Policy::Fifo | Policy::Rr)
    }

    pub fn is_dl(self) -> bool {
        self == Policy::Deadline
    }
}

pub fn nice_to_prio(nice: i32) -> i32 {
    nice + DEFAULT_PRIO
}

pub fn prio_to_nice(prio: i32) -> i32 {
    prio - DEFAULT_PRIO
}

pub fn rt_prio(prio: i32) -> bool {
    prio < MAX_RT_PRIO
}

pub fn dl_prio(prio: i32) -> bool {
    prio < MAX_DL_PRIO
}

/// Priority without PI boosting.
pub fn normal_prio(policy: Policy, static_prio: i32, rt_priority: u32) -> i32 {
    match policy {
        Policy::Deadline => MAX_DL_PRIO - 1,
        Policy::Fifo | Policy::Rr => MAX_RT_PRIO - 1 - rt_priority as i32,
        Policy::Stop => 0,
        _ => static_prio,
    }
}

/// A load weight with its cached reciprocal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadWeight {
    pub weight: u64,
    pub inv_weight: u32,
}

impl LoadWeight {
    pub fn new(weight: u64) -> Self {
        let mut lw = LoadWeight {
            weight,
            inv_weight: 0,
        };
        lw.update_inv();
        lw
    }

    pub fn for_prio(policy: Policy, static_prio: i32) -> Self {
        if policy == Policy::Idle {
            return LoadWeight {
                weight: WEIGHT_IDLEPRIO,
                inv_weight: WMULT_IDLEPRIO,
            };
        }
        let idx = (static_prio - MAX_RT_PRIO).clamp(0, NICE_WIDTH - 1) as usize;
        LoadWeight {
            weight: SCHED_PRIO_TO_WEIGHT[idx],
            inv_weight: SCHED_PRIO_TO_WMULT[idx],
        }
    }

    fn update_inv(&mut self) {
        let w = self.weight;
        self.inv_weight = if w >= WMULT_CONST {
            1
        } else if w == 0 {
            WMULT_CONST as u32
        } else {
            (WMULT_CONST / w) as u32
        };
    }

    pub fn add(&mut self, inc: u64) {
        self.weight += inc;
        self.inv_weight = 0;
    }

    pub fn sub(&mut self, dec: u64) {
        self.weight = self.weight.saturating_sub(dec);
        self.inv_weight = 0;
    }

    pub fn set(&mut self, weight: u64) {
        self.weight = weight;
        self.inv_weight = 0;
    }

    fn inv(&mut self) -> u32 {
        if self.inv_weight == 0 {
            self.update_inv();
        }
        self.inv_weight
    }
}

/// `delta_exec * weight / lw.weight`, computed with the reciprocal and a
/// shift so that it never overflows 64 bits.
pub fn calc_delta(delta_exec: u64, weight: u64, lw: &mut LoadWeight) -> u64 {
    let mut shift = WMULT_SHIFT;
    let mut fact = weight as u128 * lw.inv() as u128;
    while fact >> 64 != 0 {
        fact >>= 1;
        shift -= 1;
    }
    ((delta_exec as u128 * fact) >> shift) as u64
}

/// Wall time to virtual time for an entity of the given weight.
pub fn calc_delta_fair(delta: u64, lw: &LoadWeight) -> u64 {
    if lw.weight == NICE_0_LOAD {
        return delta;
    }
    let mut lw = *lw;
    calc_delta(delta, NICE_0_LOAD, &mut lw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nice_weights() {
        assert_eq!(LoadWeight::for_prio(Policy::Normal, DEFAULT_PRIO).weight, 1024);
        assert_eq!(LoadWeight::for_prio(Policy::Normal, nice_to_prio(-20)).weight, 88761);
        assert_eq!(LoadWeight::for_prio(Policy::Idle, DEFAULT_PRIO).weight, WEIGHT_IDLEPRIO);
    }

    #[test]
    fn delta_fair_scales_inversely() {
        let nice0 = LoadWeight::for_prio(Policy::Normal, DEFAULT_PRIO);
        assert_eq!(calc_delta_fair(1_000_000, &nice0), 1_000_000);
        let heavy = LoadWeight::new(2048);
        let d = calc_delta_fair(1_000_000, &heavy);
        assert!((499_000..=501_000).contains(&d), "{d}");
        let idle = LoadWeight::for_prio(Policy::Idle, DEFAULT_PRIO);
        let d = calc_delta_fair(3_000, &idle);
        assert!((1_020_000..=1_030_000).contains(&d), "{d}");
    }

    #[test]
    fn rt_normal_prio() {
        assert_eq!(normal_prio(Policy::Fifo, DEFAULT_PRIO, 50), 49);
        assert_eq!(normal_prio(Policy::Deadline, DEFAULT_PRIO, 0), -1);
        assert_eq!(normal_prio(Policy::Batch, 125, 0), 125);
    }
}
