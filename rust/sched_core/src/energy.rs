// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Energy model description and the performance-domain list built from it.
//!
//! Only the parts energy-aware placement needs from the scheduler side are
//! here: which CPUs share a frequency domain, the power curve of that domain
//! and the energy estimate for a given utilisation.

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::cpumask::Cpumask;

pub const EM_MAX_COMPLEXITY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfState {
    pub frequency_khz: u64,
    pub power_mw: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfDomainDesc {
    pub cpus: Vec<usize>,
    /// Sorted by ascending frequency.
    pub states: Vec<PerfState>,
}

/// Platform energy model: one entry per frequency domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergyModel {
    pub domains: Vec<PerfDomainDesc>,
    /// Every CPU uses a utilisation-driven frequency governor.
    #[serde(default)]
    pub schedutil: bool,
}

/// A performance domain attached to a root domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfDomain {
    pub cpus: Cpumask,
    pub states: Vec<PerfState>,
    /// `power * max_freq / freq` per state, precomputed.
    pub cost: Vec<u64>,
}

impl PerfDomain {
    fn new(cpus: Cpumask, states: Vec<PerfState>) -> Self {
        let max_freq = states.last().map(|s| s.frequency_khz).unwrap_or(1).max(1);
        let cost = states
            .iter()
            .map(|s| s.power_mw * max_freq / s.frequency_khz.max(1))
            .collect();
        Self { cpus, states, cost }
    }

    /// Index of the lowest state whose frequency can serve `max_util` out of
    /// `scale_cpu`, with the governor's 25% headroom.
    fn state_for(&self, max_util: u64, scale_cpu: u64) -> usize {
        let max_freq = self.states.last().map(|s| s.frequency_khz).unwrap_or(0);
        let util = max_util + (max_util >> 2);
        let freq = util.min(scale_cpu) * max_freq / scale_cpu.max(1);
        self.states
            .iter()
            .position(|s| s.frequency_khz >= freq)
            .unwrap_or(self.states.len().saturating_sub(1))
    }

    /// Estimated energy of running `sum_util` on this domain with the
    /// busiest CPU at `max_util`.
    pub fn compute_energy(&self, max_util: u64, sum_util: u64, scale_cpu: u64) -> u64 {
        if self.states.is_empty() {
            return 0;
        }
        let i = self.state_for(max_util, scale_cpu);
        self.cost[i] * sum_util / scale_cpu.max(1)
    }
}

/// Build the perf-domain list for a partition.
///
/// Returns an empty list when energy-aware placement cannot be used: the
/// partition is symmetric, some CPU lacks the utilisation governor, or the
/// model is too complex to evaluate on the wake-up path.
pub fn build_perf_domains(span: &Cpumask, model: &EnergyModel, asym_capacity: bool) -> Vec<PerfDomain> {
    if model.domains.is_empty() || !asym_capacity {
        return vec![];
    }
    if !model.schedutil {
        debug!("perf domains disabled: no schedutil governor");
        return vec![];
    }
    let mut pds = vec![];
    let mut nr_ps = 0;
    for desc in &model.domains {
        let cpus = Cpumask::from_cpus(span.len(), desc.cpus.iter().copied()).and(span);
        if cpus.is_empty() {
            continue;
        }
        nr_ps += desc.states.len();
        pds.push(PerfDomain::new(cpus, desc.states.clone()));
    }
    let complexity = pds.len() * (span.weight() + nr_ps);
    if complexity > EM_MAX_COMPLEXITY {
        warn!(complexity, "energy model too complex, disabling perf domains");
        return vec![];
    }
    pds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> EnergyModel {
        EnergyModel {
            domains: vec![
                PerfDomainDesc {
                    cpus: vec![0, 1],
                    states: vec![
                        PerfState { frequency_khz: 500_000, power_mw: 50 },
                        PerfState { frequency_khz: 1_000_000, power_mw: 150 },
                    ],
                },
                PerfDomainDesc {
                    cpus: vec![2, 3],
                    states: vec![
                        PerfState { frequency_khz: 1_000_000, power_mw: 300 },
                        PerfState { frequency_khz: 2_000_000, power_mw: 900 },
                    ],
                },
            ],
            schedutil: true,
        }
    }

    #[test]
    fn builds_only_for_asym_schedutil() {
        let span = Cpumask::full(4);
        assert_eq!(build_perf_domains(&span, &model(), true).len(), 2);
        assert!(build_perf_domains(&span, &model(), false).is_empty());
        let mut m = model();
        m.schedutil = false;
        assert!(build_perf_domains(&span, &m, true).is_empty());
    }

    #[test]
    fn higher_util_costs_more() {
        let pds = build_perf_domains(&Cpumask::full(4), &model(), true);
        let little = &pds[0];
        let low = little.compute_energy(100, 100, 1024);
        let high = little.compute_energy(900, 900, 1024);
        assert!(high > low);
    }
}
