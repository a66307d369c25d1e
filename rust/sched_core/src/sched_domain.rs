// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Scheduling domains
//!
//! Every active CPU gets a chain of domains, innermost first:
//!
//! ```text
//!   SMT  (hardware threads of a core)
//!   MC   (CPUs sharing the last-level cache)
//!   PKG  (CPUs of a package / NUMA node)
//!   NUMA (CPUs within each larger node distance)  ...
//! ```
//!
//! Each domain holds the groups the balancer compares. For non-NUMA levels a
//! group is the span of one child domain and the groups partition the
//! domain. NUMA levels overlap: a group is built from a sibling CPU's child
//! domain and its balance mask names the CPUs that aggregate upward through
//! it.
//!
//! A `DomainTree` is immutable once published except for the per-domain
//! balance state and the shared group capacities, which sit behind their
//! own locks. Rebuilds produce a new tree; the old one is retired through
//! the RCU queue.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::debug;
use tracing::warn;

use crate::cpumask::Cpumask;
use crate::energy::build_perf_domains;
use crate::energy::EnergyModel;
use crate::error::SchedError;
use crate::error::SchedResult;
use crate::root_domain::RootDomain;
use crate::stats::DomainStats;
use crate::topology::Topology;
use crate::types::CpuId;
use crate::types::TimeNs;

/// Distance beyond which fork/exec/wake balancing stops crossing nodes.
pub const RECLAIM_DISTANCE: u32 = 30;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SdFlags: u32 {
        const BALANCE_NEWIDLE = 1 << 0;
        const BALANCE_EXEC = 1 << 1;
        const BALANCE_FORK = 1 << 2;
        const BALANCE_WAKE = 1 << 3;
        const WAKE_AFFINE = 1 << 4;
        const ASYM_CPUCAPACITY = 1 << 5;
        const ASYM_CPUCAPACITY_FULL = 1 << 6;
        const SHARE_CPUCAPACITY = 1 << 7;
        const SHARE_PKG_RESOURCES = 1 << 8;
        const SERIALIZE = 1 << 9;
        const ASYM_PACKING = 1 << 10;
        const PREFER_SIBLING = 1 << 11;
        const OVERLAP = 1 << 12;
        const NUMA = 1 << 13;
    }
}

/// Flags that only mean something when the domain has more than one group.
const DEGENERATE_GROUPS_MASK: SdFlags = SdFlags::BALANCE_NEWIDLE
    .union(SdFlags::BALANCE_FORK)
    .union(SdFlags::BALANCE_EXEC)
    .union(SdFlags::SHARE_CPUCAPACITY)
    .union(SdFlags::ASYM_CPUCAPACITY)
    .union(SdFlags::ASYM_CPUCAPACITY_FULL)
    .union(SdFlags::SHARE_PKG_RESOURCES)
    .union(SdFlags::ASYM_PACKING)
    .union(SdFlags::PREFER_SIBLING);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainLevel {
    Smt,
    Mc,
    Pkg,
    /// Index into the topology's distance levels.
    Numa(usize),
}

impl DomainLevel {
    pub fn name(self) -> String {
        match self {
            DomainLevel::Smt => "SMT".into(),
            DomainLevel::Mc => "MC".into(),
            DomainLevel::Pkg => "PKG".into(),
            DomainLevel::Numa(n) => format!("NUMA{n}"),
        }
    }
}

/// Capacity shared by every group spanning the same CPUs at one level.
#[derive(Debug, Clone, Default)]
pub struct GroupCapacity {
    pub capacity: u64,
    pub min_capacity: u64,
    pub max_capacity: u64,
    /// Affinity kept the last balance from fixing an imbalance here.
    pub imbalance: bool,
    pub next_update: TimeNs,
}

#[derive(Debug)]
pub struct SchedGroup {
    pub span: Cpumask,
    pub balance_mask: Cpumask,
    pub sgc: Arc<Mutex<GroupCapacity>>,
    /// Highest packing priority CPU of the group.
    pub asym_prefer_cpu: usize,
    /// Flags of the child domain this group was built from.
    pub flags: SdFlags,
}

impl SchedGroup {
    pub fn weight(&self) -> usize {
        self.span.weight()
    }

    /// The one CPU that balances on the group's behalf.
    pub fn balance_cpu(&self) -> Option<usize> {
        self.balance_mask.first()
    }

    pub fn capacity(&self) -> GroupCapacity {
        self.sgc.lock().clone()
    }
}

/// State shared by all CPUs of one LLC.
#[derive(Debug, Default)]
pub struct SdShared {
    pub nr_busy_cpus: AtomicUsize,
    pub has_idle_cores: AtomicBool,
    pub nr_idle_scan: AtomicUsize,
}

impl SdShared {
    pub fn busy_cpus(&self) -> usize {
        self.nr_busy_cpus.load(Ordering::Acquire)
    }
}

/// Mutable balance cadence state of one domain.
#[derive(Debug, Clone, Default)]
pub struct SdBalance {
    /// Jiffies of the last balance.
    pub last_balance: u64,
    /// Current interval in ms, backed off on failure.
    pub balance_interval: u64,
    pub nr_balance_failed: u32,
    pub max_newidle_lb_cost: u64,
    pub last_decay_max_lb_cost: TimeNs,
    pub stats: DomainStats,
}

#[derive(Debug)]
pub struct SchedDomain {
    pub level: DomainLevel,
    pub span: Cpumask,
    pub flags: SdFlags,
    pub min_interval: u64,
    pub max_interval: u64,
    pub busy_factor: u64,
    pub imbalance_pct: u64,
    pub cache_nice_tries: u32,
    pub groups: Vec<SchedGroup>,
    pub shared: Option<Arc<SdShared>>,
    pub balance: Mutex<SdBalance>,
}

impl SchedDomain {
    pub fn weight(&self) -> usize {
        self.span.weight()
    }

    /// The group containing the owning CPU.
    pub fn local_group(&self) -> Option<&SchedGroup> {
        self.groups.first()
    }

    pub fn has(&self, f: SdFlags) -> bool {
        self.flags.contains(f)
    }

    fn degenerate(&self) -> bool {
        if self.weight() == 1 {
            return true;
        }
        if self.flags.intersects(DEGENERATE_GROUPS_MASK) && self.groups.len() > 1 {
            return false;
        }
        !self.has(SdFlags::WAKE_AFFINE)
    }

    fn parent_degenerate(&self, parent: &SchedDomain) -> bool {
        if parent.degenerate() {
            return true;
        }
        if self.span != parent.span {
            return false;
        }
        let mut pflags = parent.flags;
        if parent.groups.len() == 1 {
            pflags.remove(DEGENERATE_GROUPS_MASK);
        }
        (pflags & !self.flags).is_empty()
    }
}

/// Per-CPU shortcuts into the domain chain, as level indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainCaches {
    pub llc: Option<usize>,
    pub llc_size: usize,
    pub llc_id: usize,
    pub numa: Option<usize>,
    pub asym_packing: Option<usize>,
    pub asym_cpucapacity: Option<usize>,
}

#[derive(Debug)]
pub struct DomainTree {
    pub generation: u64,
    domains: Vec<Vec<SchedDomain>>,
    rd_of: Vec<Option<usize>>,
    root_domains: Vec<Arc<RootDomain>>,
    /// Root domain of CPUs outside every partition (offline or isolated).
    def_root_domain: Arc<RootDomain>,
    caches: Vec<DomainCaches>,
    partitions: Vec<Cpumask>,
}

impl DomainTree {
    /// A tree with no domains; every CPU sits in the default root domain.
    pub fn empty(nr_cpus: usize) -> Self {
        Self {
            generation: 0,
            domains: (0..nr_cpus).map(|_| vec![]).collect(),
            rd_of: vec![None; nr_cpus],
            root_domains: vec![],
            def_root_domain: Arc::new(RootDomain::new(0, Cpumask::new(nr_cpus), vec![0; nr_cpus], -1, vec![])),
            caches: (0..nr_cpus)
                .map(|cpu| DomainCaches {
                    llc_size: 1,
                    llc_id: cpu,
                    ..Default::default()
                })
                .collect(),
            partitions: vec![],
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.domains.len()
    }

    /// Domains of `cpu`, innermost first.
    pub fn domains(&self, cpu: CpuId) -> &[SchedDomain] {
        &self.domains[cpu.idx()]
    }

    pub fn rd(&self, cpu: CpuId) -> &Arc<RootDomain> {
        match self.rd_of[cpu.idx()] {
            Some(i) => &self.root_domains[i],
            None => &self.def_root_domain,
        }
    }

    pub fn root_domains(&self) -> &[Arc<RootDomain>] {
        &self.root_domains
    }

    pub fn def_root_domain(&self) -> &Arc<RootDomain> {
        &self.def_root_domain
    }

    pub fn partitions(&self) -> &[Cpumask] {
        &self.partitions
    }

    pub fn caches(&self, cpu: CpuId) -> &DomainCaches {
        &self.caches[cpu.idx()]
    }

    pub fn llc_domain(&self, cpu: CpuId) -> Option<&SchedDomain> {
        self.caches[cpu.idx()].llc.map(|i| &self.domains[cpu.idx()][i])
    }

    pub fn share_llc(&self, a: CpuId, b: CpuId) -> bool {
        self.caches[a.idx()].llc_id == self.caches[b.idx()].llc_id
    }

    /// Same partitioning, spans, flags and groups as `other`.
    pub fn same_structure(&self, other: &DomainTree) -> bool {
        if self.domains.len() != other.domains.len() || self.partitions != other.partitions {
            return false;
        }
        self.domains.iter().zip(other.domains.iter()).all(|(a, b)| {
            a.len() == b.len()
                && a.iter().zip(b.iter()).all(|(x, y)| {
                    x.level == y.level
                        && x.span == y.span
                        && x.flags == y.flags
                        && x.groups.len() == y.groups.len()
                        && x.groups
                            .iter()
                            .zip(y.groups.iter())
                            .all(|(g, h)| g.span == h.span && g.balance_mask == h.balance_mask)
                })
        })
    }

    /// Check the structural invariants; returns a description of each
    /// violation.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = vec![];
        for (cpu, chain) in self.domains.iter().enumerate() {
            for (i, sd) in chain.iter().enumerate() {
                if !sd.span.test_cpu(cpu) {
                    errs.push(format!("cpu{cpu} {}: span {} misses cpu", sd.level.name(), sd.span));
                }
                if i > 0 {
                    let child = &chain[i - 1];
                    let ok = if sd.has(SdFlags::OVERLAP) {
                        child.span.is_subset(&sd.span)
                    } else {
                        child.span.is_proper_subset(&sd.span)
                    };
                    if !ok {
                        errs.push(format!(
                            "cpu{cpu} {}: child span {} not within {}",
                            sd.level.name(),
                            child.span,
                            sd.span
                        ));
                    }
                }
                let mut covered = Cpumask::new(sd.span.len());
                for g in &sd.groups {
                    covered |= &g.span;
                    if g.balance_mask.is_empty() || !g.balance_mask.is_subset(&g.span) {
                        errs.push(format!("cpu{cpu} {}: bad balance mask {}", sd.level.name(), g.span));
                    }
                }
                if !sd.span.is_subset(&covered) {
                    errs.push(format!("cpu{cpu} {}: groups do not cover span", sd.level.name()));
                }
                if sd.local_group().map(|g| g.span.test_cpu(cpu)) != Some(true) {
                    errs.push(format!("cpu{cpu} {}: first group is not local", sd.level.name()));
                }
            }
        }
        errs
    }

    /// Human readable dump, one line per domain and group.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (cpu, chain) in self.domains.iter().enumerate() {
            if chain.is_empty() {
                let _ = writeln!(out, "cpu{cpu}: attaching NULL sched-domain");
                continue;
            }
            let _ = writeln!(out, "cpu{cpu}: root domain {}", self.rd(CpuId(cpu as u32)).id);
            for (depth, sd) in chain.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{:indent$}domain-{depth}: span={} level={} flags={:?}",
                    "",
                    sd.span.to_cpulist(),
                    sd.level.name(),
                    sd.flags,
                    indent = 1 + depth * 2
                );
                let groups: Vec<String> = sd
                    .groups
                    .iter()
                    .map(|g| {
                        let cap = g.capacity();
                        if g.balance_mask != g.span {
                            format!("{{{} mask={} cap={}}}", g.span.to_cpulist(), g.balance_mask.to_cpulist(), cap.capacity)
                        } else {
                            format!("{{{} cap={}}}", g.span.to_cpulist(), cap.capacity)
                        }
                    })
                    .collect();
                let _ = writeln!(out, "{:indent$}groups: {}", "", groups.join(" "), indent = 3 + depth * 2);
            }
        }
        out
    }
}

/// Inputs to a domain rebuild.
pub struct BuildParams<'a> {
    pub topo: &'a Topology,
    /// Disjoint sets of active CPUs; one root domain each.
    pub partitions: &'a [Cpumask],
    /// Per-CPU deadline bandwidth cap (20-bit ratio), -1 for unlimited.
    pub dl_bw_limit: i64,
    pub energy: Option<&'a EnergyModel>,
    pub generation: u64,
    pub now: TimeNs,
    pub jiffies: u64,
}

struct LevelDesc {
    level: DomainLevel,
    flags: SdFlags,
    numa_distance: u32,
}

fn levels(topo: &Topology) -> Vec<LevelDesc> {
    let mut v = vec![
        LevelDesc {
            level: DomainLevel::Smt,
            flags: SdFlags::SHARE_CPUCAPACITY | SdFlags::SHARE_PKG_RESOURCES,
            numa_distance: 0,
        },
        LevelDesc {
            level: DomainLevel::Mc,
            flags: SdFlags::SHARE_PKG_RESOURCES,
            numa_distance: 0,
        },
        LevelDesc {
            level: DomainLevel::Pkg,
            flags: SdFlags::empty(),
            numa_distance: 0,
        },
    ];
    for (i, &d) in topo.numa_levels().iter().enumerate().skip(1) {
        v.push(LevelDesc {
            level: DomainLevel::Numa(i),
            flags: SdFlags::NUMA | SdFlags::OVERLAP,
            numa_distance: d,
        });
    }
    v
}

fn level_mask(topo: &Topology, level: DomainLevel, cpu: usize) -> Cpumask {
    match level {
        DomainLevel::Smt => topo.smt_mask(cpu),
        DomainLevel::Mc => topo.llc_mask(cpu),
        DomainLevel::Pkg => topo.pkg_mask(cpu),
        DomainLevel::Numa(i) => topo.numa_mask(i, cpu),
    }
}

/// Domain without groups: span and flags for one level of one CPU.
fn sd_init(
    topo: &Topology,
    desc: &LevelDesc,
    cpu: usize,
    cpu_map: &Cpumask,
    child_span: Option<&Cpumask>,
    classes: usize,
    p: &BuildParams,
) -> SchedDomain {
    let mut span = level_mask(topo, desc.level, cpu).and(cpu_map);
    if let Some(child) = child_span {
        if !child.is_subset(&span) {
            warn!(cpu, level = %desc.level.name(), "child domain not a subset of parent; extending span");
            span |= child;
        }
    }

    let mut flags = SdFlags::BALANCE_NEWIDLE
        | SdFlags::BALANCE_EXEC
        | SdFlags::BALANCE_FORK
        | SdFlags::WAKE_AFFINE
        | SdFlags::PREFER_SIBLING
        | desc.flags;

    let span_classes = {
        let mut caps: Vec<u64> = span.iter().map(|c| topo.cpu(c).capacity_orig()).collect();
        caps.sort_unstable();
        caps.dedup();
        caps.len()
    };
    if span_classes > 1 {
        flags |= SdFlags::ASYM_CPUCAPACITY;
        if span_classes == classes {
            flags |= SdFlags::ASYM_CPUCAPACITY_FULL;
        }
    }
    if matches!(desc.level, DomainLevel::Smt | DomainLevel::Mc) {
        let first = span.first().map(|c| topo.cpu(c).asym_prio());
        if span.iter().any(|c| Some(topo.cpu(c).asym_prio()) != first) {
            flags |= SdFlags::ASYM_PACKING;
        }
    }

    let weight = span.weight() as u64;
    let mut imbalance_pct = 117;
    let mut cache_nice_tries = 1;
    if flags.contains(SdFlags::SHARE_CPUCAPACITY) {
        imbalance_pct = 110;
        cache_nice_tries = 0;
    } else if flags.contains(SdFlags::NUMA) {
        cache_nice_tries = 2;
        flags.remove(SdFlags::PREFER_SIBLING);
        flags |= SdFlags::SERIALIZE;
        if desc.numa_distance > RECLAIM_DISTANCE {
            flags.remove(SdFlags::BALANCE_EXEC | SdFlags::BALANCE_FORK | SdFlags::WAKE_AFFINE);
        }
    }

    SchedDomain {
        level: desc.level,
        span,
        flags,
        min_interval: weight,
        max_interval: 2 * weight,
        busy_factor: 16,
        imbalance_pct,
        cache_nice_tries,
        groups: vec![],
        shared: None,
        balance: Mutex::new(SdBalance {
            last_balance: p.jiffies,
            balance_interval: weight,
            nr_balance_failed: 0,
            max_newidle_lb_cost: 0,
            last_decay_max_lb_cost: p.now,
            stats: DomainStats::default(),
        }),
    }
}

type SgcKey = (usize, Cpumask);

fn new_group(
    topo: &Topology,
    li: usize,
    span: Cpumask,
    balance_mask: Cpumask,
    flags: SdFlags,
    sgcs: &mut BTreeMap<SgcKey, Arc<Mutex<GroupCapacity>>>,
) -> SchedGroup {
    let sgc = sgcs
        .entry((li, span.clone()))
        .or_insert_with(|| {
            let caps: Vec<u64> = span.iter().map(|c| topo.cpu(c).capacity_orig()).collect();
            Arc::new(Mutex::new(GroupCapacity {
                capacity: caps.iter().sum(),
                min_capacity: caps.iter().copied().min().unwrap_or(0),
                max_capacity: caps.iter().copied().max().unwrap_or(0),
                imbalance: false,
                next_update: 0,
            }))
        })
        .clone();
    let asym_prefer_cpu = span
        .iter()
        .max_by_key(|&c| (topo.cpu(c).asym_prio(), std::cmp::Reverse(c)))
        .unwrap_or(0);
    SchedGroup {
        span,
        balance_mask,
        sgc,
        asym_prefer_cpu,
        flags,
    }
}

/// CPUs of `span` in order starting at `cpu` and wrapping.
fn wrap_order(span: &Cpumask, cpu: usize) -> Vec<usize> {
    let mut v: Vec<usize> = span.iter().filter(|&c| c >= cpu).collect();
    v.extend(span.iter().filter(|&c| c < cpu));
    v
}

fn build_groups(
    topo: &Topology,
    raw: &[Vec<SchedDomain>],
    cpu: usize,
    li: usize,
    sgcs: &mut BTreeMap<SgcKey, Arc<Mutex<GroupCapacity>>>,
) -> Vec<SchedGroup> {
    let nr = topo.nr_cpus();
    let sd = &raw[cpu][li];
    let mut covered = Cpumask::new(nr);
    let mut groups = vec![];
    let child_of = |i: usize| -> (Cpumask, SdFlags) {
        if li == 0 {
            (Cpumask::from_cpus(nr, [i]), SdFlags::empty())
        } else {
            (raw[i][li - 1].span.clone(), raw[i][li - 1].flags)
        }
    };

    for i in wrap_order(&sd.span, cpu) {
        if covered.test_cpu(i) {
            continue;
        }
        if !sd.has(SdFlags::OVERLAP) {
            let (span, flags) = child_of(i);
            covered |= &span;
            groups.push(new_group(topo, li, span.clone(), span, flags, sgcs));
            continue;
        }

        let sibling = &raw[i][li];
        if !sibling.span.test_cpu(i) {
            continue;
        }
        let (span, flags) = child_of(i);
        let mut balance_mask = Cpumask::new(nr);
        if li > 0 {
            for j in span.iter() {
                if raw[j][li - 1].span == span {
                    balance_mask.set_cpu(j);
                }
            }
        }
        if balance_mask.is_empty() {
            balance_mask = span.clone();
        }
        covered |= &span;
        groups.push(new_group(topo, li, span, balance_mask, flags, sgcs));
    }
    groups
}

/// Drop domains that add nothing over their neighbours.
fn prune(cpu: usize, mut chain: Vec<SchedDomain>) -> Vec<SchedDomain> {
    let mut i = 0;
    while i + 1 < chain.len() {
        if chain[i].parent_degenerate(&chain[i + 1]) {
            let parent = chain.remove(i + 1);
            debug!(cpu, level = %parent.level.name(), "pruning degenerate parent domain");
            if parent.has(SdFlags::PREFER_SIBLING) && i + 1 < chain.len() {
                chain[i].flags |= SdFlags::PREFER_SIBLING;
            }
        } else {
            i += 1;
        }
    }
    while chain.first().map(|sd| sd.degenerate()) == Some(true) {
        let sd = chain.remove(0);
        debug!(cpu, level = %sd.level.name(), "pruning degenerate leaf domain");
        if let Some(next) = chain.first_mut() {
            for g in next.groups.iter_mut() {
                g.flags = SdFlags::empty();
            }
        }
    }
    chain
}

fn validate_partitions(nr: usize, partitions: &[Cpumask]) -> SchedResult<()> {
    let mut seen = Cpumask::new(nr);
    for p in partitions {
        if p.len() != nr {
            return Err(SchedError::TopologyBuild(format!("partition {} has wrong width", p)));
        }
        if p.is_empty() {
            return Err(SchedError::TopologyBuild("empty partition".into()));
        }
        if p.intersects(&seen) {
            return Err(SchedError::TopologyBuild(format!("partition {} overlaps another", p.to_cpulist())));
        }
        seen |= p;
    }
    Ok(())
}

/// Build the full domain tree for the given partitions.
pub fn build_sched_domains(p: &BuildParams) -> SchedResult<DomainTree> {
    let topo = p.topo;
    let nr = topo.nr_cpus();
    validate_partitions(nr, p.partitions)?;
    let descs = levels(topo);

    let mut domains: Vec<Vec<SchedDomain>> = (0..nr).map(|_| vec![]).collect();
    let mut rd_of = vec![None; nr];
    let mut root_domains = vec![];
    let mut covered_all = Cpumask::new(nr);

    for (pi, cpu_map) in p.partitions.iter().enumerate() {
        covered_all |= cpu_map;
        let classes = {
            let mut caps: Vec<u64> = cpu_map.iter().map(|c| topo.cpu(c).capacity_orig()).collect();
            caps.sort_unstable();
            caps.dedup();
            caps.len()
        };

        // Spans and flags for every level of every CPU.
        let mut raw: Vec<Vec<SchedDomain>> = (0..nr).map(|_| vec![]).collect();
        for cpu in cpu_map.iter() {
            for desc in &descs {
                let child_span = raw[cpu].last().map(|sd: &SchedDomain| sd.span.clone());
                let sd = sd_init(topo, desc, cpu, cpu_map, child_span.as_ref(), classes, p);
                raw[cpu].push(sd);
            }
            // Asymmetric capacity above disables sibling preference below.
            for li in 1..raw[cpu].len() {
                if raw[cpu][li].has(SdFlags::ASYM_CPUCAPACITY) {
                    raw[cpu][li - 1].flags.remove(SdFlags::PREFER_SIBLING);
                }
            }
        }

        // Groups, with capacity shared across CPUs by (level, span).
        let mut sgcs = BTreeMap::new();
        let mut all_groups: Vec<Vec<Vec<SchedGroup>>> = (0..nr).map(|_| vec![]).collect();
        for cpu in cpu_map.iter() {
            for li in 0..descs.len() {
                let g = build_groups(topo, &raw, cpu, li, &mut sgcs);
                all_groups[cpu].push(g);
            }
        }
        let mut shared_by_llc: BTreeMap<Cpumask, Arc<SdShared>> = BTreeMap::new();
        for cpu in cpu_map.iter() {
            let groups = std::mem::take(&mut all_groups[cpu]);
            for (sd, g) in raw[cpu].iter_mut().zip(groups) {
                sd.groups = g;
            }
            let chain = prune(cpu, std::mem::take(&mut raw[cpu]));
            domains[cpu] = chain;
            rd_of[cpu] = Some(pi);
        }
        for cpu in cpu_map.iter() {
            let llc_idx = domains[cpu]
                .iter()
                .rposition(|sd| sd.has(SdFlags::SHARE_PKG_RESOURCES));
            if let Some(li) = llc_idx {
                let span = domains[cpu][li].span.clone();
                let llc_size = span.weight();
                let shared = shared_by_llc
                    .entry(span)
                    .or_insert_with(|| {
                        Arc::new(SdShared {
                            nr_busy_cpus: AtomicUsize::new(llc_size),
                            nr_idle_scan: AtomicUsize::new(llc_size),
                            ..Default::default()
                        })
                    })
                    .clone();
                domains[cpu][li].shared = Some(shared);
            }
        }

        let caps = topo.capacity_orig();
        let asym = classes > 1;
        let pds = match p.energy {
            Some(model) => build_perf_domains(cpu_map, model, asym),
            None => vec![],
        };
        let rd = RootDomain::new(p.generation * 1000 + pi as u64 + 1, cpu_map.clone(), caps, p.dl_bw_limit, pds);
        for cpu in cpu_map.cpus() {
            rd.set_online(cpu, true);
        }
        root_domains.push(Arc::new(rd));
    }

    let caches = (0..nr)
        .map(|cpu| {
            let chain = &domains[cpu];
            let llc = chain.iter().rposition(|sd| sd.has(SdFlags::SHARE_PKG_RESOURCES));
            let (llc_size, llc_id) = match llc {
                Some(i) => (chain[i].weight(), chain[i].span.first().unwrap_or(cpu)),
                None => (1, cpu),
            };
            DomainCaches {
                llc,
                llc_size,
                llc_id,
                numa: chain.iter().position(|sd| sd.has(SdFlags::NUMA)),
                asym_packing: chain.iter().rposition(|sd| sd.has(SdFlags::ASYM_PACKING)),
                asym_cpucapacity: chain.iter().position(|sd| sd.has(SdFlags::ASYM_CPUCAPACITY)),
            }
        })
        .collect();

    let leftover = covered_all.not();
    let def_root_domain = Arc::new(RootDomain::new(
        p.generation * 1000,
        leftover,
        topo.capacity_orig(),
        p.dl_bw_limit,
        vec![],
    ));

    debug!(
        generation = p.generation,
        partitions = p.partitions.len(),
        "built sched domains"
    );

    Ok(DomainTree {
        generation: p.generation,
        domains,
        rd_of,
        root_domains,
        def_root_domain,
        caches,
        partitions: p.partitions.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologySpec;

    fn build(spec: TopologySpec) -> (Topology, DomainTree) {
        let topo = Topology::from_spec(&spec).unwrap();
        let parts = vec![topo.span()];
        let tree = build_sched_domains(&BuildParams {
            topo: &topo,
            partitions: &parts,
            dl_bw_limit: -1,
            energy: None,
            generation: 1,
            now: 0,
            jiffies: 0,
        })
        .unwrap();
        (topo, tree)
    }

    #[test]
    fn smt_mc_chain() {
        let (_, tree) = build(TopologySpec {
            llcs_per_node: 2,
            cores_per_llc: 2,
            threads_per_core: 2,
            ..Default::default()
        });
        let chain = tree.domains(CpuId(0));
        let levels: Vec<_> = chain.iter().map(|sd| sd.level).collect();
        // PKG spans both LLCs; nothing above it survives.
        assert_eq!(levels, vec![DomainLevel::Smt, DomainLevel::Mc, DomainLevel::Pkg]);
        assert_eq!(chain[0].groups.len(), 2);
        assert_eq!(chain[1].groups.len(), 2);
        assert_eq!(chain[1].groups[1].span.to_cpulist(), "2-3");
        assert_eq!(chain[2].groups.len(), 2);
        assert!(chain[0].has(SdFlags::SHARE_CPUCAPACITY));
        assert_eq!(chain[0].imbalance_pct, 110);
        assert_eq!(tree.caches(CpuId(0)).llc, Some(1));
        assert_eq!(tree.caches(CpuId(0)).llc_size, 4);
        assert!(tree.share_llc(CpuId(0), CpuId(3)));
        assert!(!tree.share_llc(CpuId(0), CpuId(4)));
        assert!(tree.validate().is_empty(), "{:?}", tree.validate());
    }

    #[test]
    fn flat_machine_prunes_to_one_level() {
        let (_, tree) = build(TopologySpec::flat(4));
        let chain = tree.domains(CpuId(2));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].level, DomainLevel::Mc);
        assert_eq!(chain[0].groups.len(), 4);
        assert!(chain[0].groups[0].span.test_cpu(2));
    }

    #[test]
    fn single_cpu_has_no_domains() {
        let (_, tree) = build(TopologySpec::flat(1));
        assert!(tree.domains(CpuId(0)).is_empty());
    }

    #[test]
    fn numa_levels_overlap() {
        let ring = vec![
            vec![10, 20, 30, 20],
            vec![20, 10, 20, 30],
            vec![30, 20, 10, 20],
            vec![20, 30, 20, 10],
        ];
        let (_, tree) = build(TopologySpec {
            nodes: 4,
            cores_per_llc: 2,
            distances: Some(ring),
            ..Default::default()
        });
        assert!(tree.validate().is_empty(), "{:?}", tree.validate());
        let chain = tree.domains(CpuId(0));
        let numa: Vec<_> = chain.iter().filter(|sd| sd.has(SdFlags::NUMA)).collect();
        assert_eq!(numa.len(), 2);
        assert!(numa.iter().all(|sd| sd.has(SdFlags::OVERLAP)));
        assert_eq!(numa[0].span.to_cpulist(), "0-3,6-7");
        assert_eq!(numa[1].span.weight(), 8);
        // distance 30 is not beyond the reclaim distance
        assert!(numa[1].has(SdFlags::WAKE_AFFINE));
        assert_eq!(tree.caches(CpuId(0)).numa, Some(chain.len() - 2));
        for g in &numa[1].groups {
            assert!(!g.balance_mask.is_empty());
        }
    }

    #[test]
    fn asym_capacity_flags() {
        let (_, tree) = build(TopologySpec {
            cores_per_llc: 4,
            capacities: Some(vec![1024, 1024, 512, 512]),
            ..Default::default()
        });
        let chain = tree.domains(CpuId(0));
        assert_eq!(chain.len(), 1);
        assert!(chain[0].has(SdFlags::ASYM_CPUCAPACITY));
        assert!(chain[0].has(SdFlags::ASYM_CPUCAPACITY_FULL));
        assert_eq!(tree.caches(CpuId(0)).asym_cpucapacity, Some(0));
        assert!(tree.rd(CpuId(0)).asym_capacity());
        let g = &chain[0].groups[2];
        assert_eq!(g.capacity().capacity, 512);
    }

    #[test]
    fn rebuild_is_structurally_identical() {
        let spec = TopologySpec {
            nodes: 2,
            cores_per_llc: 2,
            threads_per_core: 2,
            ..Default::default()
        };
        let (_, a) = build(spec.clone());
        let (_, b) = build(spec);
        assert!(a.same_structure(&b));
    }

    #[test]
    fn partitions_get_separate_root_domains() {
        let topo = Topology::from_spec(&TopologySpec::flat(4)).unwrap();
        let parts = vec![
            Cpumask::from_cpulist("0-1", 4).unwrap(),
            Cpumask::from_cpulist("2", 4).unwrap(),
        ];
        let tree = build_sched_domains(&BuildParams {
            topo: &topo,
            partitions: &parts,
            dl_bw_limit: -1,
            energy: None,
            generation: 2,
            now: 0,
            jiffies: 0,
        })
        .unwrap();
        assert!(!Arc::ptr_eq(tree.rd(CpuId(0)), tree.rd(CpuId(2))));
        assert!(Arc::ptr_eq(tree.rd(CpuId(3)), tree.def_root_domain()));
        assert_eq!(tree.domains(CpuId(0))[0].span.to_cpulist(), "0-1");
        assert!(tree.domains(CpuId(2)).is_empty());

        let bad = vec![Cpumask::from_cpulist("0-2", 4).unwrap(), Cpumask::from_cpulist("2-3", 4).unwrap()];
        assert!(build_sched_domains(&BuildParams {
            topo: &topo,
            partitions: &bad,
            dl_bw_limit: -1,
            energy: None,
            generation: 3,
            now: 0,
            jiffies: 0,
        })
        .is_err());
    }
}
