// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduler tunables and feature toggles.
//!
//! Tunables are plain serde structs; every field has a default so a partial
//! JSON document only overrides what it names. They can be given inline or
//! loaded from a file with an `f:` or `file:` prefix:
//!
//!```
//!     use sched_core::SchedTunables;
//!     let t = SchedTunables::parse(r#"{"sched_nr_migrate": 8}"#).unwrap();
//!     assert_eq!(t.sched_nr_migrate, 8);
//!     assert_eq!(t.sched_latency_ns, 6_000_000);
//!```

use std::fs;
use std::io::Read;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;

use crate::types::NSEC_PER_MSEC;
use crate::types::NSEC_PER_USEC;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SchedFeatures: u32 {
        const WAKEUP_PREEMPTION = 1 << 0;
        const NEXT_BUDDY = 1 << 1;
        const LAST_BUDDY = 1 << 2;
        const CACHE_HOT_BUDDY = 1 << 3;
        const TTWU_QUEUE = 1 << 4;
        const HRTICK = 1 << 5;
        const HRTICK_DL = 1 << 6;
        const RT_PUSH_IPI = 1 << 7;
        const RT_RUNTIME_SHARE = 1 << 8;
        const LB_MIN = 1 << 9;
        const ATTACH_AGE_LOAD = 1 << 10;
        const UTIL_EST = 1 << 11;
        const NONTASK_CAPACITY = 1 << 12;
        const SIS_UTIL = 1 << 13;
        const START_DEBIT = 1 << 14;
        const GENTLE_FAIR_SLEEPERS = 1 << 15;
    }
}

impl Default for SchedFeatures {
    fn default() -> Self {
        SchedFeatures::WAKEUP_PREEMPTION
            | SchedFeatures::LAST_BUDDY
            | SchedFeatures::CACHE_HOT_BUDDY
            | SchedFeatures::TTWU_QUEUE
            | SchedFeatures::RT_PUSH_IPI
            | SchedFeatures::ATTACH_AGE_LOAD
            | SchedFeatures::UTIL_EST
            | SchedFeatures::NONTASK_CAPACITY
            | SchedFeatures::SIS_UTIL
            | SchedFeatures::START_DEBIT
            | SchedFeatures::GENTLE_FAIR_SLEEPERS
    }
}

/// How the latency and granularity knobs scale with the CPU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunableScaling {
    None,
    #[default]
    Log,
    Linear,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedTunables {
    pub sched_latency_ns: u64,
    pub sched_min_granularity_ns: u64,
    pub sched_wakeup_granularity_ns: u64,
    pub tunable_scaling: TunableScaling,
    pub sched_nr_migrate: u32,
    pub sched_migration_cost_ns: u64,
    pub sched_rt_period_us: u64,
    /// -1 disables RT throttling.
    pub sched_rt_runtime_us: i64,
    pub sched_rr_timeslice_ms: u64,
    pub cfs_bandwidth_slice_us: u64,
    pub sched_child_runs_first: bool,
    pub sched_util_clamp_min: u32,
    pub sched_util_clamp_max: u32,
    /// Default boost requested by RT tasks.
    pub sched_util_clamp_min_rt_default: u32,
    pub hz: u64,
    pub features: SchedFeatures,
    #[serde(skip)]
    scale_factor: u64,
}

impl Default for SchedTunables {
    fn default() -> Self {
        Self {
            sched_latency_ns: 6 * NSEC_PER_MSEC,
            sched_min_granularity_ns: 750 * NSEC_PER_USEC,
            sched_wakeup_granularity_ns: NSEC_PER_MSEC,
            tunable_scaling: TunableScaling::Log,
            sched_nr_migrate: 32,
            sched_migration_cost_ns: 500 * NSEC_PER_USEC,
            sched_rt_period_us: 1_000_000,
            sched_rt_runtime_us: 950_000,
            sched_rr_timeslice_ms: 100,
            cfs_bandwidth_slice_us: 5_000,
            sched_child_runs_first: false,
            sched_util_clamp_min: 1024,
            sched_util_clamp_max: 1024,
            sched_util_clamp_min_rt_default: 1024,
            hz: 250,
            features: SchedFeatures::default(),
            scale_factor: 1,
        }
    }
}

impl SchedTunables {
    /// Parse tunables from inline JSON or, with an `f:`/`file:` prefix, from
    /// a JSON file.
    pub fn parse(input: &str) -> Result<Self> {
        let tunables: SchedTunables = if input.starts_with("f:") || input.starts_with("file:") {
            let path = match input.split_once(':') {
                Some((_, path)) => path,
                None => bail!("malformed tunables path {:?}", input),
            };
            let mut f = fs::OpenOptions::new()
                .read(true)
                .open(path)
                .with_context(|| format!("Failed to open tunables file {path}"))?;
            let mut content = String::new();
            f.read_to_string(&mut content)?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse tunables file {path}"))?
        } else {
            serde_json::from_str(input).context("Failed to parse tunables")?
        };
        tunables.validate()?;
        Ok(tunables)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sched_rt_period_us == 0 {
            bail!("sched_rt_period_us must be positive");
        }
        if self.sched_rt_runtime_us < -1 {
            bail!("sched_rt_runtime_us must be -1 or non-negative");
        }
        if self.sched_rt_runtime_us > self.sched_rt_period_us as i64 {
            bail!(
                "sched_rt_runtime_us ({}) exceeds sched_rt_period_us ({})",
                self.sched_rt_runtime_us,
                self.sched_rt_period_us
            );
        }
        if self.sched_min_granularity_ns == 0 || self.sched_latency_ns == 0 {
            bail!("latency and granularity must be positive");
        }
        if self.sched_min_granularity_ns > self.sched_latency_ns {
            bail!("sched_min_granularity_ns exceeds sched_latency_ns");
        }
        if self.hz == 0 || self.hz > 10_000 {
            bail!("hz {} out of range", self.hz);
        }
        if self.sched_rr_timeslice_ms == 0 {
            bail!("sched_rr_timeslice_ms must be positive");
        }
        if self.cfs_bandwidth_slice_us == 0 {
            bail!("cfs_bandwidth_slice_us must be positive");
        }
        if self.sched_util_clamp_min > 1024
            || self.sched_util_clamp_max > 1024
            || self.sched_util_clamp_min_rt_default > 1024
        {
            bail!("util clamp values are capped at 1024");
        }
        if self.sched_util_clamp_min > self.sched_util_clamp_max {
            bail!("sched_util_clamp_min exceeds sched_util_clamp_max");
        }
        Ok(())
    }

    /// Fix the scaling factor for a machine with `ncpus` CPUs.
    pub fn scale_for(mut self, ncpus: usize) -> Self {
        let cpus = ncpus.clamp(1, 8) as u64;
        self.scale_factor = match self.tunable_scaling {
            TunableScaling::None => 1,
            TunableScaling::Log => 1 + cpus.ilog2() as u64,
            TunableScaling::Linear => cpus,
        };
        self
    }

    pub fn scale_factor(&self) -> u64 {
        self.scale_factor.max(1)
    }

    pub fn latency(&self) -> u64 {
        self.sched_latency_ns * self.scale_factor()
    }

    pub fn min_granularity(&self) -> u64 {
        self.sched_min_granularity_ns * self.scale_factor()
    }

    pub fn wakeup_granularity(&self) -> u64 {
        self.sched_wakeup_granularity_ns * self.scale_factor()
    }

    /// Number of tasks that fit in one latency window at min granularity.
    pub fn nr_latency(&self) -> u64 {
        (self.sched_latency_ns / self.sched_min_granularity_ns).max(1)
    }

    pub fn tick_ns(&self) -> u64 {
        crate::types::NSEC_PER_SEC / self.hz
    }

    pub fn rr_timeslice_ns(&self) -> u64 {
        self.sched_rr_timeslice_ms * NSEC_PER_MSEC
    }

    pub fn rt_period_ns(&self) -> u64 {
        self.sched_rt_period_us * NSEC_PER_USEC
    }

    /// RT runtime per period, `None` when throttling is disabled.
    pub fn rt_runtime_ns(&self) -> Option<u64> {
        if self.sched_rt_runtime_us < 0 {
            None
        } else {
            Some(self.sched_rt_runtime_us as u64 * NSEC_PER_USEC)
        }
    }

    pub fn cfs_bandwidth_slice_ns(&self) -> u64 {
        self.cfs_bandwidth_slice_us * NSEC_PER_USEC
    }

    pub fn feat(&self, f: SchedFeatures) -> bool {
        self.features.contains(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn log_scaling() {
        let t = SchedTunables::default().scale_for(4);
        assert_eq!(t.scale_factor(), 3);
        assert_eq!(t.latency(), 18 * NSEC_PER_MSEC);
        let t = SchedTunables::default().scale_for(64);
        assert_eq!(t.scale_factor(), 4);
        let mut t = SchedTunables::default();
        t.tunable_scaling = TunableScaling::None;
        assert_eq!(t.scale_for(64).latency(), 6 * NSEC_PER_MSEC);
    }

    #[test]
    fn rejects_rt_runtime_over_period() {
        let err = SchedTunables::parse(r#"{"sched_rt_runtime_us": 2000000}"#);
        assert!(err.is_err());
        let ok = SchedTunables::parse(r#"{"sched_rt_runtime_us": -1}"#).unwrap();
        assert_eq!(ok.rt_runtime_ns(), None);
    }

    #[test]
    fn loads_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"hz": 1000, "features": "HRTICK | WAKEUP_PREEMPTION"}}"#).unwrap();
        let t = SchedTunables::parse(&format!("f:{}", f.path().display())).unwrap();
        assert_eq!(t.tick_ns(), 1_000_000);
        assert!(t.feat(SchedFeatures::HRTICK));
        assert!(!t.feat(SchedFeatures::LAST_BUDDY));
    }
}
