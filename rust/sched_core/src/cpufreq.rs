// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Frequency governor interface.
//!
//! The core calls the hook whenever a class changes the utilisation of a
//! CPU. A hook may answer with a new frequency, which the core applies to
//! the runqueue's frequency-invariance factor right away.

use tracing::trace;

use crate::core::Sched;
use crate::types::CpuId;
use crate::types::TimeNs;
use crate::types::NSEC_PER_MSEC;

/// A task blocked on I/O was just enqueued.
pub const SCHED_CPUFREQ_IOWAIT: u32 = 1 << 0;

pub trait CpufreqHook: Send {
    /// `util` out of `max` is what the CPU needs now. Returns the frequency
    /// to switch to, if any.
    fn update_util(&mut self, cpu: CpuId, now: TimeNs, util: u64, max: u64, flags: u32) -> Option<u64>;
}

/// Frequency proportional to utilisation with 25% headroom, rate limited
/// per CPU. IO-wait wakeups boost straight to the maximum.
#[derive(Debug, Clone)]
pub struct SchedutilGovernor {
    max_freq_khz: Vec<u64>,
    last_update: Vec<Option<TimeNs>>,
    pub rate_limit_ns: u64,
}

impl SchedutilGovernor {
    pub fn new(max_freq_khz: Vec<u64>) -> Self {
        let n = max_freq_khz.len();
        Self {
            max_freq_khz,
            last_update: vec![None; n],
            rate_limit_ns: NSEC_PER_MSEC,
        }
    }

    pub fn next_freq(max_freq: u64, util: u64, max: u64) -> u64 {
        let freq = max_freq + (max_freq >> 2);
        (freq * util / max.max(1)).min(max_freq)
    }
}

impl CpufreqHook for SchedutilGovernor {
    fn update_util(&mut self, cpu: CpuId, now: TimeNs, util: u64, max: u64, flags: u32) -> Option<u64> {
        let max_freq = *self.max_freq_khz.get(cpu.idx())?;
        if flags & SCHED_CPUFREQ_IOWAIT != 0 {
            self.last_update[cpu.idx()] = Some(now);
            return Some(max_freq);
        }
        if let Some(last) = self.last_update[cpu.idx()] {
            if now.saturating_sub(last) < self.rate_limit_ns {
                return None;
            }
        }
        self.last_update[cpu.idx()] = Some(now);
        Some(Self::next_freq(max_freq, util, max).max(1))
    }
}

impl Sched {
    /// Utilisation the governor should provide for: fair and RT PELT plus
    /// the deadline bandwidth, clamped by the runqueue's uclamp.
    pub fn effective_cpu_util(&self, cpu: CpuId) -> u64 {
        let rq = &self.rqs[cpu.idx()];
        let max = rq.cpu_capacity_orig;
        let irq = rq.avg_irq.util_avg;
        if irq >= max {
            return max;
        }
        let cfs_rt = self.cpu_util_cfs(cpu) + rq.avg_rt.util_avg;
        let util = self.uclamp_rq_util_with(cpu, cfs_rt, None);
        // Deadline tasks need their reserved bandwidth whatever PELT says.
        let dl = (rq.dl.running_bw * max) >> crate::root_domain::BW_SHIFT;
        (util + dl).min(max)
    }

    pub(crate) fn cpufreq_update_util(&mut self, cpu: CpuId, flags: u32) {
        if self.cpufreq.is_none() {
            return;
        }
        let util = self.effective_cpu_util(cpu);
        let max = self.rqs[cpu.idx()].cpu_capacity_orig;
        let now = self.rqs[cpu.idx()].clock.clock;
        let Some(hook) = self.cpufreq.as_mut() else {
            return;
        };
        if let Some(freq) = hook.update_util(cpu, now, util, max, flags) {
            let rq = &mut self.rqs[cpu.idx()];
            let freq = freq.min(rq.max_freq_khz);
            if freq != rq.cur_freq_khz {
                trace!(cpu = cpu.0, freq, util, "cpufreq");
                rq.cur_freq_khz = freq;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_freq_has_headroom() {
        assert_eq!(SchedutilGovernor::next_freq(2_000_000, 512, 1024), 1_250_000);
        assert_eq!(SchedutilGovernor::next_freq(2_000_000, 1024, 1024), 2_000_000);
        assert_eq!(SchedutilGovernor::next_freq(2_000_000, 0, 1024), 0);
    }

    #[test]
    fn rate_limited_except_iowait() {
        let mut g = SchedutilGovernor::new(vec![1_000_000]);
        assert!(g.update_util(CpuId(0), 0, 512, 1024, 0).is_some());
        assert!(g.update_util(CpuId(0), 10, 100, 1024, 0).is_none());
        assert_eq!(g.update_util(CpuId(0), 20, 100, 1024, SCHED_CPUFREQ_IOWAIT), Some(1_000_000));
        assert!(g.update_util(CpuId(0), 2 * NSEC_PER_MSEC + 20, 100, 1024, 0).is_some());
    }
}
