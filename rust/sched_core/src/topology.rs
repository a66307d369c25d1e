// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Machine topology
//!
//! The hardware description scheduling domains are built from. A Topology
//! is comprised of one or more Node objects, each holding Cache (LLC) ->
//! Core -> Cpu objects:
//!
//! ```text
//!                Topology
//!                   |
//!        o----------o----------o
//!        |                     |
//!      Node 0   distance     Node 1
//!        |                     |
//!   Cache (LLC) ...       Cache (LLC) ...
//!        |
//!      Core ...
//!        |
//!      Cpu (capacity, asym prio) ...
//! ```
//!
//! Every object carries a Cpumask spanning all CPUs below it. A node is also
//! a package. Topologies are read-only; hotplug changes the active set the
//! domain builder intersects with, never the Topology itself.
//!
//! Creating Topology
//! -----------------
//!
//!```
//!     use sched_core::topology::{Topology, TopologySpec};
//!     let spec = TopologySpec { nodes: 2, llcs_per_node: 1, cores_per_llc: 2, threads_per_core: 2, ..Default::default() };
//!     let top = Topology::from_spec(&spec).unwrap();
//!     assert_eq!(top.nr_cpus(), 8);
//!     assert_eq!(top.smt_mask(0).to_cpulist(), "0-1");
//!```

use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::cpumask::Cpumask;
use crate::prio::SCHED_CAPACITY_SCALE;

pub const LOCAL_DISTANCE: u32 = 10;
pub const REMOTE_DISTANCE: u32 = 20;

/// Shape of a machine. CPUs are numbered node-major, then LLC, core and
/// hardware thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologySpec {
    pub nodes: usize,
    pub llcs_per_node: usize,
    pub cores_per_llc: usize,
    pub threads_per_core: usize,
    /// Node distance matrix; defaults to LOCAL/REMOTE.
    pub distances: Option<Vec<Vec<u32>>>,
    /// Per-CPU original capacity (big.LITTLE); defaults to full scale.
    pub capacities: Option<Vec<u64>>,
    /// Per-CPU packing priority; higher is preferred.
    pub asym_prios: Option<Vec<i32>>,
    pub max_freq_khz: u64,
}

impl Default for TopologySpec {
    fn default() -> Self {
        Self {
            nodes: 1,
            llcs_per_node: 1,
            cores_per_llc: 1,
            threads_per_core: 1,
            distances: None,
            capacities: None,
            asym_prios: None,
            max_freq_khz: 2_000_000,
        }
    }
}

impl TopologySpec {
    /// `n` independent single-thread cores sharing one LLC.
    pub fn flat(n: usize) -> Self {
        Self {
            cores_per_llc: n,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cpu {
    id: usize,
    core_id: usize,
    llc_id: usize,
    node_id: usize,
    capacity_orig: u64,
    asym_prio: i32,
    max_freq_khz: u64,
}

impl Cpu {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn core_id(&self) -> usize {
        self.core_id
    }

    pub fn llc_id(&self) -> usize {
        self.llc_id
    }

    pub fn node_id(&self) -> usize {
        self.node_id
    }

    pub fn capacity_orig(&self) -> u64 {
        self.capacity_orig
    }

    pub fn asym_prio(&self) -> i32 {
        self.asym_prio
    }

    pub fn max_freq_khz(&self) -> u64 {
        self.max_freq_khz
    }
}

#[derive(Debug, Clone)]
pub struct Core {
    id: usize,
    cpus: BTreeMap<usize, Cpu>,
    span: Cpumask,
}

impl Core {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn cpus(&self) -> &BTreeMap<usize, Cpu> {
        &self.cpus
    }

    /// SMT siblings of this core.
    pub fn span(&self) -> Cpumask {
        self.span.clone()
    }
}

#[derive(Debug, Clone)]
pub struct Cache {
    id: usize,
    cores: BTreeMap<usize, Core>,
    span: Cpumask,
}

impl Cache {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn cores(&self) -> &BTreeMap<usize, Core> {
        &self.cores
    }

    pub fn span(&self) -> Cpumask {
        self.span.clone()
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    id: usize,
    llcs: BTreeMap<usize, Cache>,
    span: Cpumask,
}

impl Node {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn llcs(&self) -> &BTreeMap<usize, Cache> {
        &self.llcs
    }

    pub fn span(&self) -> Cpumask {
        self.span.clone()
    }
}

/// How remote nodes are reached, derived from the distance table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumaTopologyType {
    /// Every remote node is one hop away.
    Direct,
    /// The farthest nodes are reached through an intermediate node.
    GluelessMesh,
    /// The farthest nodes hang off a backplane no node sits on.
    Backplane,
}

#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<Node>,
    cpus: Vec<Cpu>,
    distances: Vec<Vec<u32>>,
    numa_levels: Vec<u32>,
    span: Cpumask,
}

impl Topology {
    pub fn from_spec(spec: &TopologySpec) -> Result<Topology> {
        if spec.nodes == 0 || spec.llcs_per_node == 0 || spec.cores_per_llc == 0 || spec.threads_per_core == 0 {
            bail!("topology dimensions must all be positive: {:?}", spec);
        }
        let nr_cpus = spec.nodes * spec.llcs_per_node * spec.cores_per_llc * spec.threads_per_core;

        let distances = match &spec.distances {
            Some(d) => d.clone(),
            None => (0..spec.nodes)
                .map(|a| {
                    (0..spec.nodes)
                        .map(|b| if a == b { LOCAL_DISTANCE } else { REMOTE_DISTANCE })
                        .collect()
                })
                .collect(),
        };
        validate_distances(&distances, spec.nodes)?;

        if let Some(caps) = &spec.capacities {
            if caps.len() != nr_cpus {
                bail!("{} capacities given for {} cpus", caps.len(), nr_cpus);
            }
            if caps.iter().any(|&c| c == 0 || c > SCHED_CAPACITY_SCALE) {
                bail!("cpu capacities must be in 1..={}", SCHED_CAPACITY_SCALE);
            }
        }
        if let Some(prios) = &spec.asym_prios {
            if prios.len() != nr_cpus {
                bail!("{} asym priorities given for {} cpus", prios.len(), nr_cpus);
            }
        }

        let mut cpus = Vec::with_capacity(nr_cpus);
        let mut nodes = Vec::with_capacity(spec.nodes);
        let mut cpu_id = 0;
        let mut core_id = 0;
        let mut llc_id = 0;
        for node_id in 0..spec.nodes {
            let mut node = Node {
                id: node_id,
                llcs: BTreeMap::new(),
                span: Cpumask::new(nr_cpus),
            };
            for _ in 0..spec.llcs_per_node {
                let mut llc = Cache {
                    id: llc_id,
                    cores: BTreeMap::new(),
                    span: Cpumask::new(nr_cpus),
                };
                for _ in 0..spec.cores_per_llc {
                    let mut core = Core {
                        id: core_id,
                        cpus: BTreeMap::new(),
                        span: Cpumask::new(nr_cpus),
                    };
                    for _ in 0..spec.threads_per_core {
                        let cpu = Cpu {
                            id: cpu_id,
                            core_id,
                            llc_id,
                            node_id,
                            capacity_orig: spec
                                .capacities
                                .as_ref()
                                .map(|c| c[cpu_id])
                                .unwrap_or(SCHED_CAPACITY_SCALE),
                            asym_prio: spec.asym_prios.as_ref().map(|p| p[cpu_id]).unwrap_or(0),
                            max_freq_khz: spec.max_freq_khz,
                        };
                        core.span.set_cpu(cpu_id);
                        core.cpus.insert(cpu_id, cpu.clone());
                        cpus.push(cpu);
                        cpu_id += 1;
                    }
                    llc.span |= &core.span;
                    llc.cores.insert(core.id, core);
                    core_id += 1;
                }
                node.span |= &llc.span;
                node.llcs.insert(llc.id, llc);
                llc_id += 1;
            }
            nodes.push(node);
        }

        let mut numa_levels: Vec<u32> = distances.iter().flatten().copied().collect();
        numa_levels.sort_unstable();
        numa_levels.dedup();

        Ok(Topology {
            nodes,
            cpus,
            distances,
            numa_levels,
            span: Cpumask::full(nr_cpus),
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    pub fn cpu(&self, cpu: usize) -> &Cpu {
        &self.cpus[cpu]
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn span(&self) -> Cpumask {
        self.span.clone()
    }

    fn core(&self, cpu: usize) -> Option<&Core> {
        let c = &self.cpus[cpu];
        self.nodes[c.node_id].llcs.get(&c.llc_id)?.cores.get(&c.core_id)
    }

    pub fn smt_mask(&self, cpu: usize) -> Cpumask {
        self.core(cpu)
            .map(|c| c.span())
            .unwrap_or_else(|| Cpumask::from_cpus(self.nr_cpus(), [cpu]))
    }

    pub fn llc_mask(&self, cpu: usize) -> Cpumask {
        let c = &self.cpus[cpu];
        self.nodes[c.node_id]
            .llcs
            .get(&c.llc_id)
            .map(|l| l.span())
            .unwrap_or_else(|| self.smt_mask(cpu))
    }

    pub fn pkg_mask(&self, cpu: usize) -> Cpumask {
        self.nodes[self.cpus[cpu].node_id].span()
    }

    pub fn node_of(&self, cpu: usize) -> usize {
        self.cpus[cpu].node_id
    }

    pub fn nr_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn distance(&self, a: usize, b: usize) -> u32 {
        self.distances[a][b]
    }

    /// Unique node distances, ascending. Index 0 is the local distance.
    pub fn numa_levels(&self) -> &[u32] {
        &self.numa_levels
    }

    /// CPUs on nodes within `numa_levels()[level]` of `cpu`'s node.
    pub fn numa_mask(&self, level: usize, cpu: usize) -> Cpumask {
        let node = self.node_of(cpu);
        let max = self.numa_levels[level.min(self.numa_levels.len() - 1)];
        let mut mask = Cpumask::new(self.nr_cpus());
        for n in &self.nodes {
            if self.distances[node][n.id] <= max {
                mask |= &n.span;
            }
        }
        mask
    }

    pub fn numa_topology_type(&self) -> NumaTopologyType {
        if self.numa_levels.len() <= 2 {
            return NumaTopologyType::Direct;
        }
        let max = self.numa_levels[self.numa_levels.len() - 1];
        let n = self.nodes.len();
        for a in 0..n {
            for b in 0..n {
                if self.distances[a][b] != max {
                    continue;
                }
                let via = (0..n).any(|v| self.distances[a][v] < max && self.distances[b][v] < max);
                return if via {
                    NumaTopologyType::GluelessMesh
                } else {
                    NumaTopologyType::Backplane
                };
            }
        }
        NumaTopologyType::Direct
    }

    /// Distinct original capacities present, descending.
    pub fn capacity_classes(&self) -> Vec<u64> {
        let mut caps: Vec<u64> = self.cpus.iter().map(|c| c.capacity_orig).collect();
        caps.sort_unstable_by(|a, b| b.cmp(a));
        caps.dedup();
        caps
    }

    pub fn capacity_orig(&self) -> Vec<u64> {
        self.cpus.iter().map(|c| c.capacity_orig).collect()
    }

    pub fn has_asym_prio(&self) -> bool {
        let first = self.cpus.first().map(|c| c.asym_prio).unwrap_or(0);
        self.cpus.iter().any(|c| c.asym_prio != first)
    }
}

fn validate_distances(d: &[Vec<u32>], nodes: usize) -> Result<()> {
    if d.len() != nodes || d.iter().any(|row| row.len() != nodes) {
        bail!("distance table must be {}x{}", nodes, nodes);
    }
    for a in 0..nodes {
        for b in 0..nodes {
            if d[a][b] != d[b][a] {
                bail!("distance table is not symmetric at ({}, {})", a, b);
            }
            if a != b && d[a][b] <= d[a][a] {
                bail!("remote distance ({}, {}) not larger than local", a, b);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_follow_hierarchy() {
        let spec = TopologySpec {
            nodes: 2,
            llcs_per_node: 2,
            cores_per_llc: 2,
            threads_per_core: 2,
            ..Default::default()
        };
        let top = Topology::from_spec(&spec).unwrap();
        assert_eq!(top.nr_cpus(), 16);
        assert_eq!(top.smt_mask(5).to_cpulist(), "4-5");
        assert_eq!(top.llc_mask(5).to_cpulist(), "4-7");
        assert_eq!(top.pkg_mask(5).to_cpulist(), "0-7");
        assert_eq!(top.numa_levels(), &[10, 20]);
        assert_eq!(top.numa_mask(1, 5).to_cpulist(), "0-15");
        assert_eq!(top.numa_topology_type(), NumaTopologyType::Direct);
    }

    #[test]
    fn numa_types() {
        // ring of four: 0-1-2-3-0, diagonal pairs two hops apart
        let ring = vec![
            vec![10, 20, 30, 20],
            vec![20, 10, 20, 30],
            vec![30, 20, 10, 20],
            vec![20, 30, 20, 10],
        ];
        let spec = TopologySpec {
            nodes: 4,
            distances: Some(ring),
            ..Default::default()
        };
        let top = Topology::from_spec(&spec).unwrap();
        assert_eq!(top.numa_topology_type(), NumaTopologyType::GluelessMesh);
        assert_eq!(top.numa_mask(1, 0).to_cpulist(), "0-1,3");
    }

    #[test]
    fn rejects_bad_tables() {
        let spec = TopologySpec {
            nodes: 2,
            distances: Some(vec![vec![10, 20], vec![30, 10]]),
            ..Default::default()
        };
        assert!(Topology::from_spec(&spec).is_err());
        let spec = TopologySpec {
            capacities: Some(vec![2048]),
            ..Default::default()
        };
        assert!(Topology::from_spec(&spec).is_err());
    }

    #[test]
    fn capacity_classes() {
        let spec = TopologySpec {
            cores_per_llc: 4,
            capacities: Some(vec![1024, 1024, 512, 512]),
            ..Default::default()
        };
        let top = Topology::from_spec(&spec).unwrap();
        assert_eq!(top.capacity_classes(), vec![1024, 512]);
        assert!(!top.has_asym_prio());
    }
}
