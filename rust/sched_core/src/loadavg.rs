// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Global load average.
//!
//! Every CPU folds the change in its active count (running plus
//! uninterruptible tasks) into a global counter once per sample window.
//! Tickless CPUs fold when they go idle instead. Shortly after the window
//! closes the timekeeping CPU updates the three exponential averages in
//! 11-bit fixed point.

use std::fmt::Write;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::core::Sched;
use crate::types::CpuId;
use crate::types::TimeNs;
use crate::types::NSEC_PER_SEC;

pub const FSHIFT: u32 = 11;
pub const FIXED_1: u64 = 1 << FSHIFT;
/// 1/exp(5s/1min) in fixed point.
pub const EXP_1: u64 = 1884;
/// 1/exp(5s/5min)
pub const EXP_5: u64 = 2014;
/// 1/exp(5s/15min)
pub const EXP_15: u64 = 2037;

/// Ticks to wait after the window closes so every CPU has folded.
const SAMPLE_LAG_TICKS: u64 = 10;

/// One step of `load = load * exp + active * (1 - exp)`, rounding up
/// while the load is growing.
pub fn calc_load(load: u64, exp: u64, active: u64) -> u64 {
    let mut newload = load * exp + active * (FIXED_1 - exp);
    if active >= load {
        newload += FIXED_1 - 1;
    }
    newload / FIXED_1
}

/// `x^n` in fixed point with `frac_bits` fractional bits.
pub fn fixed_power_int(mut x: u64, frac_bits: u32, mut n: u64) -> u64 {
    let half = 1u64 << (frac_bits - 1);
    let mut result = 1u64 << frac_bits;
    while n > 0 {
        if n & 1 == 1 {
            result = (result * x + half) >> frac_bits;
        }
        n >>= 1;
        if n == 0 {
            break;
        }
        x = (x * x + half) >> frac_bits;
    }
    result
}

/// `n` steps of `calc_load` at once, for windows missed while tickless.
pub fn calc_load_n(load: u64, exp: u64, active: u64, n: u64) -> u64 {
    calc_load(load, fixed_power_int(exp, FSHIFT, n), active)
}

fn load_int(x: u64) -> u64 {
    x >> FSHIFT
}

fn load_frac(x: u64) -> u64 {
    load_int((x & (FIXED_1 - 1)) * 100)
}

#[derive(Debug, Default)]
pub struct LoadAvg {
    pub avenrun: [u64; 3],
    calc_load_tasks: AtomicI64,
    calc_load_nohz: AtomicI64,
    calc_load_update: TimeNs,
    load_freq: TimeNs,
    tick_ns: u64,
}

impl LoadAvg {
    pub fn init(&mut self, hz: u64) {
        self.tick_ns = NSEC_PER_SEC / hz.max(1);
        self.load_freq = 5 * NSEC_PER_SEC + self.tick_ns;
        self.calc_load_update = self.load_freq;
    }

    /// End of the current sample window.
    pub fn next_update(&self) -> TimeNs {
        self.calc_load_update
    }

    pub fn load_freq(&self) -> TimeNs {
        self.load_freq
    }

    /// Active task count as last folded.
    pub fn nr_active(&self) -> i64 {
        self.calc_load_tasks.load(Ordering::Acquire)
    }

    fn add_tasks(&self, delta: i64) {
        if delta != 0 {
            self.calc_load_tasks.fetch_add(delta, Ordering::AcqRel);
        }
    }
}

impl Sched {
    fn calc_load_fold_active(&mut self, cpu: CpuId, adjust: i64) -> i64 {
        let rq = &mut self.rqs[cpu.idx()];
        let nr_active = rq.nr_running as i64 - adjust + rq.nr_uninterruptible;
        let delta = nr_active - rq.calc_load_active;
        rq.calc_load_active = nr_active;
        delta
    }

    pub(crate) fn calc_global_load_tick(&mut self, cpu: CpuId) {
        if self.now < self.rqs[cpu.idx()].calc_load_update {
            return;
        }
        let delta = self.calc_load_fold_active(cpu, 0);
        self.loadavg.add_tasks(delta);
        let freq = self.loadavg.load_freq;
        self.rqs[cpu.idx()].calc_load_update += freq;
    }

    /// Update the averages once a window has closed and every CPU had a
    /// chance to fold.
    pub(crate) fn calc_global_load(&mut self) {
        let la = &mut self.loadavg;
        let sample_window = la.calc_load_update;
        let lag = SAMPLE_LAG_TICKS * la.tick_ns;
        if la.load_freq == 0 || self.now < sample_window + lag {
            return;
        }
        let delta = la.calc_load_nohz.swap(0, Ordering::AcqRel);
        la.add_tasks(delta);
        let active = la.calc_load_tasks.load(Ordering::Acquire);
        let active = if active > 0 { active as u64 * FIXED_1 } else { 0 };

        // Windows slept through entirely decay in one go.
        let n = 1 + (self.now - sample_window - lag) / la.load_freq;
        let exps = [EXP_1, EXP_5, EXP_15];
        for (avg, exp) in la.avenrun.iter_mut().zip(exps) {
            *avg = calc_load_n(*avg, exp, active, n);
        }
        la.calc_load_update += n * la.load_freq;
        trace!(avenrun = ?la.avenrun, windows = n, "loadavg");
    }

    /// `cpu` is going tickless: fold its count now.
    pub(crate) fn calc_load_nohz_start(&mut self, cpu: CpuId) {
        let delta = self.calc_load_fold_active(cpu, 0);
        if delta != 0 {
            self.loadavg.calc_load_nohz.fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// `cpu` resumes ticking: realign its window with the global one.
    pub(crate) fn calc_load_nohz_stop(&mut self, cpu: CpuId) {
        let now = self.now;
        let global = self.loadavg.calc_load_update;
        let freq = self.loadavg.load_freq;
        let rq = &mut self.rqs[cpu.idx()];
        if now < rq.calc_load_update {
            return;
        }
        rq.calc_load_update = global;
        if now < rq.calc_load_update {
            return;
        }
        rq.calc_load_update += freq;
    }

    /// A dying CPU hands its remaining count to the global counter.
    pub(crate) fn calc_load_migrate(&mut self, cpu: CpuId) {
        let delta = self.calc_load_fold_active(cpu, 0);
        self.loadavg.add_tasks(delta);
    }

    /// Averages rounded to two decimals, as `(int, frac)` pairs.
    pub fn get_avenrun(&self) -> [(u64, u64); 3] {
        self.loadavg.avenrun.map(|a| {
            let a = a + FIXED_1 / 200;
            (load_int(a), load_frac(a))
        })
    }

    /// Formatted like `/proc/loadavg`.
    pub fn loadavg_string(&self) -> String {
        let mut s = String::new();
        for (i, (int, frac)) in self.get_avenrun().iter().enumerate() {
            if i > 0 {
                s.push(' ');
            }
            let _ = write!(s, "{int}.{frac:02}");
        }
        let nr_running: u32 = self.rqs.iter().map(|rq| rq.nr_running).sum();
        let last_pid = self.tasks.iter().map(|t| t.pid.0).max().unwrap_or(0);
        let _ = write!(s, " {}/{} {}", nr_running, self.tasks.len(), last_pid);
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_step_from_zero() {
        assert_eq!(calc_load(0, EXP_1, FIXED_1), 164);
        assert_eq!(calc_load(FIXED_1, EXP_1, FIXED_1), FIXED_1);
    }

    #[test]
    fn converges_on_active_count() {
        let mut load = 0;
        for _ in 0..200 {
            load = calc_load(load, EXP_1, 3 * FIXED_1);
        }
        assert_eq!(load, 3 * FIXED_1);
        for _ in 0..200 {
            load = calc_load(load, EXP_1, 0);
        }
        assert!(load < FIXED_1 / 100);
    }

    #[test]
    fn missed_windows_match_stepping() {
        assert_eq!(fixed_power_int(EXP_5, FSHIFT, 0), FIXED_1);
        assert_eq!(fixed_power_int(EXP_5, FSHIFT, 1), EXP_5);
        assert_eq!(calc_load_n(5000, EXP_15, 0, 1), calc_load(5000, EXP_15, 0));
        let stepped = (0..4).fold(8192, |l, _| calc_load(l, EXP_1, 0));
        let jumped = calc_load_n(8192, EXP_1, 0, 4);
        assert!(stepped.abs_diff(jumped) <= 4, "{stepped} vs {jumped}");
    }

    #[test]
    fn format_fraction() {
        assert_eq!(load_int(3 * FIXED_1 + FIXED_1 / 2), 3);
        assert_eq!(load_frac(3 * FIXED_1 + FIXED_1 / 2), 50);
    }
}
