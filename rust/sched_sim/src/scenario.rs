// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scenario definition, builder API and JSON loading.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use sched_core::{Cpumask, SchedAttr, SchedTunables, TimeNs, TopologySpec};

pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_DURATION_NS: TimeNs = 100_000_000;

/// One step of a task's script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "RawPhase")]
pub enum Phase {
    /// Consume CPU for the given number of nanoseconds.
    Run(TimeNs),
    /// Block for the given number of nanoseconds.
    Sleep(TimeNs),
    /// Wake the named task (instantaneous).
    Wake(String),
    /// Wake the named task with the sync hint: the waker is about to sleep.
    WakeSync(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawPhase {
    Run(DurationValue),
    Sleep(DurationValue),
    Wake(String),
    WakeSync(String),
}

impl TryFrom<RawPhase> for Phase {
    type Error = anyhow::Error;

    fn try_from(raw: RawPhase) -> Result<Self> {
        Ok(match raw {
            RawPhase::Run(d) => Phase::Run(d.ns()?),
            RawPhase::Sleep(d) => Phase::Sleep(d.ns()?),
            RawPhase::Wake(name) => Phase::Wake(name),
            RawPhase::WakeSync(name) => Phase::WakeSync(name),
        })
    }
}

/// How often the phase list runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Once,
    Count(u32),
    Forever,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskBehavior {
    pub phases: Vec<Phase>,
    pub repeat: RepeatMode,
}

impl TaskBehavior {
    pub fn once(phases: Vec<Phase>) -> Self {
        Self {
            phases,
            repeat: RepeatMode::Once,
        }
    }

    pub fn forever(phases: Vec<Phase>) -> Self {
        Self {
            phases,
            repeat: RepeatMode::Forever,
        }
    }

    /// Runs until killed by the end of the simulation.
    pub fn spin() -> Self {
        Self::forever(vec![Phase::Run(100_000_000)])
    }
}

/// A task to create. Tasks are referred to by name: the core hands out
/// pids at spawn time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDef {
    pub name: String,
    pub attr: SchedAttr,
    /// Initial affinity as a cpulist; all CPUs if unset.
    pub cpus: Option<String>,
    /// Group name; the root group if unset.
    pub group: Option<String>,
    #[serde(deserialize_with = "de_duration")]
    pub start_time_ns: TimeNs,
    pub behavior: TaskBehavior,
}

impl TaskDef {
    pub fn new(name: &str, behavior: TaskBehavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            ..Default::default()
        }
    }

    pub fn attr(mut self, attr: SchedAttr) -> Self {
        self.attr = attr;
        self
    }

    pub fn nice(mut self, nice: i32) -> Self {
        self.attr.nice = nice;
        self
    }

    pub fn cpus(mut self, cpulist: &str) -> Self {
        self.cpus = Some(cpulist.to_string());
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn start_at(mut self, ns: TimeNs) -> Self {
        self.start_time_ns = ns;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthDef {
    #[serde(deserialize_with = "de_duration")]
    pub period_ns: TimeNs,
    /// None for unlimited.
    pub quota_ns: Option<TimeNs>,
    #[serde(deserialize_with = "de_duration")]
    pub burst_ns: TimeNs,
}

/// A task group. Parents must be listed before their children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupDef {
    pub name: String,
    pub parent: Option<String>,
    pub shares: Option<u64>,
    pub idle: bool,
    pub bandwidth: Option<BandwidthDef>,
    /// `(min, max)` utilization clamp.
    pub uclamp: Option<(u32, u32)>,
}

impl GroupDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn shares(mut self, shares: u64) -> Self {
        self.shares = Some(shares);
        self
    }

    pub fn bandwidth(mut self, period_ns: TimeNs, quota_ns: TimeNs) -> Self {
        self.bandwidth = Some(BandwidthDef {
            period_ns,
            quota_ns: Some(quota_ns),
            burst_ns: 0,
        });
        self
    }
}

/// Something the scenario does to the machine at a fixed time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CpuOffline(u32),
    CpuOnline(u32),
    SetAffinity { task: String, cpus: String },
    SetAttr { task: String, attr: SchedAttr },
    SetNice { task: String, nice: i32 },
    MoveToGroup { task: String, group: String },
    SetBandwidth { group: String, bandwidth: BandwidthDef },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedAction {
    #[serde(deserialize_with = "de_duration")]
    pub at_ns: TimeNs,
    pub action: Action,
}

/// A complete simulation: machine, tunables, groups, tasks, timed actions
/// and duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub topology: TopologySpec,
    pub tunables: SchedTunables,
    pub groups: Vec<GroupDef>,
    pub tasks: Vec<TaskDef>,
    pub actions: Vec<TimedAction>,
    #[serde(deserialize_with = "de_duration")]
    pub duration_ns: TimeNs,
    pub seed: u64,
    /// Upper bound of the random delay added to each tick.
    #[serde(deserialize_with = "de_duration")]
    pub tick_jitter_ns: TimeNs,
    /// Run the structural invariant checks at every hook point.
    pub check_invariants: bool,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            topology: TopologySpec::flat(1),
            tunables: SchedTunables::default(),
            groups: vec![],
            tasks: vec![],
            actions: vec![],
            duration_ns: DEFAULT_DURATION_NS,
            seed: DEFAULT_SEED,
            tick_jitter_ns: 0,
            check_invariants: false,
        }
    }
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        ScenarioBuilder {
            scenario: Scenario {
                seed: seed_from_env(),
                ..Default::default()
            },
            packages_per_node: 1,
        }
    }

    pub fn from_json(json: &str) -> Result<Scenario> {
        let scenario: Scenario = serde_json::from_str(json).context("Failed to parse scenario")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Scenario> {
        let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Scenario::from_json(&json).with_context(|| format!("Invalid scenario {}", path.display()))
    }

    pub fn nr_cpus(&self) -> usize {
        let t = &self.topology;
        t.nodes * t.llcs_per_node * t.cores_per_llc * t.threads_per_core
    }

    /// Check names and references. Scheduler-level validity (affinity
    /// against the topology, policy parameters) is left to the core.
    pub fn validate(&self) -> Result<()> {
        if self.nr_cpus() == 0 {
            bail!("scenario has no CPUs");
        }
        let mut groups = HashSet::new();
        for g in &self.groups {
            if g.name.is_empty() {
                bail!("group without a name");
            }
            if let Some(parent) = &g.parent {
                if !groups.contains(parent.as_str()) {
                    bail!("group {:?}: parent {parent:?} not defined before it", g.name);
                }
            }
            if !groups.insert(g.name.as_str()) {
                bail!("duplicate group {:?}", g.name);
            }
        }
        let mut tasks = HashSet::new();
        for t in &self.tasks {
            if t.name.is_empty() {
                bail!("task without a name");
            }
            if !tasks.insert(t.name.as_str()) {
                bail!("duplicate task {:?}", t.name);
            }
            if let Some(g) = &t.group {
                if !groups.contains(g.as_str()) {
                    bail!("task {:?}: unknown group {g:?}", t.name);
                }
            }
        }
        for t in &self.tasks {
            for phase in &t.behavior.phases {
                if let Phase::Wake(target) | Phase::WakeSync(target) = phase {
                    if !tasks.contains(target.as_str()) {
                        bail!("task {:?}: wakes unknown task {target:?}", t.name);
                    }
                }
            }
            let takes_time = t.behavior.phases.iter().any(|p| matches!(p, Phase::Run(d) | Phase::Sleep(d) if *d > 0));
            if t.behavior.repeat != RepeatMode::Once && !takes_time {
                bail!("task {:?}: repeating script never takes time", t.name);
            }
            if let Some(cpus) = &t.cpus {
                Cpumask::from_cpulist(cpus, self.nr_cpus()).with_context(|| format!("task {:?}", t.name))?;
            }
        }
        for a in &self.actions {
            let (task, group) = match &a.action {
                Action::CpuOffline(cpu) | Action::CpuOnline(cpu) => {
                    if *cpu as usize >= self.nr_cpus() {
                        bail!("action at {}: cpu {cpu} out of range", a.at_ns);
                    }
                    (None, None)
                }
                Action::SetAffinity { task, cpus } => {
                    Cpumask::from_cpulist(cpus, self.nr_cpus()).with_context(|| format!("action at {}", a.at_ns))?;
                    (Some(task), None)
                }
                Action::SetAttr { task, .. } | Action::SetNice { task, .. } => (Some(task), None),
                Action::MoveToGroup { task, group } => (Some(task), Some(group)),
                Action::SetBandwidth { group, .. } => (None, Some(group)),
            };
            if let Some(task) = task {
                if !tasks.contains(task.as_str()) {
                    bail!("action at {}: unknown task {task:?}", a.at_ns);
                }
            }
            if let Some(group) = group {
                if !groups.contains(group.as_str()) {
                    bail!("action at {}: unknown group {group:?}", a.at_ns);
                }
            }
        }
        Ok(())
    }
}

pub struct ScenarioBuilder {
    scenario: Scenario,
    packages_per_node: usize,
}

impl ScenarioBuilder {
    /// `n` single-thread cores on one LLC. Resets the machine shape, so
    /// call it before the finer shape setters.
    pub fn cpus(mut self, n: usize) -> Self {
        let max_freq_khz = self.scenario.topology.max_freq_khz;
        self.scenario.topology = TopologySpec {
            max_freq_khz,
            ..TopologySpec::flat(n)
        };
        self
    }

    pub fn topology(mut self, topology: TopologySpec) -> Self {
        self.scenario.topology = topology;
        self
    }

    /// Hardware threads per core.
    pub fn smt(mut self, threads: usize) -> Self {
        self.scenario.topology.threads_per_core = threads;
        self
    }

    pub fn cores_per_llc(mut self, n: usize) -> Self {
        self.scenario.topology.cores_per_llc = n;
        self
    }

    /// LLCs per package.
    pub fn llcs(mut self, n: usize) -> Self {
        self.scenario.topology.llcs_per_node = n;
        self
    }

    /// Packages per NUMA node. Packages of one node share its memory, so
    /// they become more LLCs under the node.
    pub fn packages_per_node(mut self, n: usize) -> Self {
        self.packages_per_node = n.max(1);
        self
    }

    pub fn nodes(mut self, n: usize) -> Self {
        self.scenario.topology.nodes = n;
        self
    }

    pub fn numa_distances(mut self, distances: Vec<Vec<u32>>) -> Self {
        self.scenario.topology.distances = Some(distances);
        self
    }

    /// Per-CPU original capacity.
    pub fn capacities(mut self, capacities: Vec<u64>) -> Self {
        self.scenario.topology.capacities = Some(capacities);
        self
    }

    /// Per-CPU packing priority for asymmetric SMT.
    pub fn asym_prios(mut self, prios: Vec<i32>) -> Self {
        self.scenario.topology.asym_prios = Some(prios);
        self
    }

    pub fn tunables(mut self, tunables: SchedTunables) -> Self {
        self.scenario.tunables = tunables;
        self
    }

    pub fn hz(mut self, hz: u64) -> Self {
        self.scenario.tunables.hz = hz;
        self
    }

    pub fn group(mut self, def: GroupDef) -> Self {
        self.scenario.groups.push(def);
        self
    }

    pub fn task(mut self, def: TaskDef) -> Self {
        self.scenario.tasks.push(def);
        self
    }

    /// Convenience: a task with default attributes starting at time 0.
    pub fn add_task(self, name: &str, attr: SchedAttr, behavior: TaskBehavior) -> Self {
        self.task(TaskDef::new(name, behavior).attr(attr))
    }

    pub fn at(mut self, at_ns: TimeNs, action: Action) -> Self {
        self.scenario.actions.push(TimedAction { at_ns, action });
        self
    }

    pub fn cpu_offline_at(self, at_ns: TimeNs, cpu: u32) -> Self {
        self.at(at_ns, Action::CpuOffline(cpu))
    }

    pub fn cpu_online_at(self, at_ns: TimeNs, cpu: u32) -> Self {
        self.at(at_ns, Action::CpuOnline(cpu))
    }

    pub fn set_affinity_at(self, at_ns: TimeNs, task: &str, cpus: &str) -> Self {
        self.at(
            at_ns,
            Action::SetAffinity {
                task: task.to_string(),
                cpus: cpus.to_string(),
            },
        )
    }

    pub fn set_attr_at(self, at_ns: TimeNs, task: &str, attr: SchedAttr) -> Self {
        self.at(
            at_ns,
            Action::SetAttr {
                task: task.to_string(),
                attr,
            },
        )
    }

    pub fn duration_ns(mut self, ns: TimeNs) -> Self {
        self.scenario.duration_ns = ns;
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.scenario.duration_ns = ms * 1_000_000;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.scenario.seed = seed;
        self
    }

    pub fn tick_jitter_ns(mut self, ns: TimeNs) -> Self {
        self.scenario.tick_jitter_ns = ns;
        self
    }

    pub fn check_invariants(mut self, on: bool) -> Self {
        self.scenario.check_invariants = on;
        self
    }

    pub fn build(mut self) -> Scenario {
        self.scenario.topology.llcs_per_node *= self.packages_per_node;
        self.scenario
    }
}

/// Parse a seed value: a number, `entropy` for a random one, or nothing
/// for the default.
pub fn parse_seed(s: Option<&str>) -> u64 {
    match s.map(str::trim) {
        None | Some("") => DEFAULT_SEED,
        Some(s) if s.eq_ignore_ascii_case("entropy") => {
            let seed: u64 = rand::random();
            warn!(seed, "seed=entropy: set this seed to reproduce the run");
            seed
        }
        Some(s) => match s.parse() {
            Ok(seed) => seed,
            Err(_) => {
                warn!(value = s, default = DEFAULT_SEED, "invalid seed, using the default");
                DEFAULT_SEED
            }
        },
    }
}

/// Seed from `SCHEDSIM_SEED`, or the default.
pub fn seed_from_env() -> u64 {
    parse_seed(std::env::var("SCHEDSIM_SEED").ok().as_deref())
}

/// Parse a duration with an optional unit suffix into nanoseconds:
/// `"1s"`, `"0.5s"`, `"500ms"`, `"100us"`, `"1000ns"`. A bare number is
/// nanoseconds.
pub fn parse_duration_ns(s: &str) -> Result<TimeNs> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    // Longest suffix first so "ms" is not read as "s".
    let (num, mult) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1e6)
    } else if let Some(n) = s.strip_suffix("us") {
        (n, 1e3)
    } else if let Some(n) = s.strip_suffix("ns") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1e9)
    } else {
        (s, 1.0)
    };
    let num = num.trim();
    if let Ok(v) = num.parse::<u64>() {
        return v.checked_mul(mult as u64).with_context(|| format!("duration {s:?} overflows"));
    }
    let v: f64 = num.parse().with_context(|| format!("invalid duration {s:?}"))?;
    if !v.is_finite() || v < 0.0 {
        bail!("invalid duration {s:?}");
    }
    Ok((v * mult).round() as TimeNs)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Ns(u64),
    Text(String),
}

impl DurationValue {
    fn ns(self) -> Result<TimeNs> {
        match self {
            DurationValue::Ns(v) => Ok(v),
            DurationValue::Text(s) => parse_duration_ns(&s),
        }
    }
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<TimeNs, D::Error> {
    DurationValue::deserialize(d)?.ns().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_ns("1s").unwrap(), 1_000_000_000);
        assert_eq!(parse_duration_ns("0.5s").unwrap(), 500_000_000);
        assert_eq!(parse_duration_ns("500ms").unwrap(), 500_000_000);
        assert_eq!(parse_duration_ns("100us").unwrap(), 100_000);
        assert_eq!(parse_duration_ns("1000ns").unwrap(), 1000);
        assert_eq!(parse_duration_ns(" 42 ").unwrap(), 42);
        assert!(parse_duration_ns("").is_err());
        assert!(parse_duration_ns("fast").is_err());
        assert!(parse_duration_ns("-1ms").is_err());
    }

    #[test]
    fn test_parse_seed() {
        assert_eq!(parse_seed(None), DEFAULT_SEED);
        assert_eq!(parse_seed(Some("")), DEFAULT_SEED);
        assert_eq!(parse_seed(Some("7")), 7);
        assert_eq!(parse_seed(Some("bogus")), DEFAULT_SEED);
    }

    #[test]
    fn test_builder_shape() {
        let s = Scenario::builder().cpus(4).smt(2).cores_per_llc(2).packages_per_node(2).llcs(1).build();
        assert_eq!(s.topology.llcs_per_node, 2);
        assert_eq!(s.nr_cpus(), 8);
    }

    #[test]
    fn test_json_scenario() {
        let json = r#"{
            "topology": { "cores_per_llc": 2 },
            "duration_ns": "250ms",
            "groups": [ { "name": "batch", "bandwidth": { "period_ns": "100ms", "quota_ns": 10000000 } } ],
            "tasks": [
                { "name": "a", "group": "batch",
                  "behavior": { "phases": [ { "run": "5ms" }, { "sleep": 1000 } ], "repeat": "forever" } },
                { "name": "b", "attr": { "policy": "fifo", "rt_priority": 10 },
                  "behavior": { "phases": [ { "wake_sync": "a" } ] } }
            ],
            "actions": [ { "at_ns": "10ms", "action": { "cpu_offline": 1 } } ]
        }"#;
        let s = Scenario::from_json(json).unwrap();
        assert_eq!(s.nr_cpus(), 2);
        assert_eq!(s.duration_ns, 250_000_000);
        assert_eq!(s.tasks[0].behavior.phases, vec![Phase::Run(5_000_000), Phase::Sleep(1000)]);
        assert_eq!(s.tasks[0].behavior.repeat, RepeatMode::Forever);
        assert_eq!(s.tasks[1].behavior.phases, vec![Phase::WakeSync("a".into())]);
        assert_eq!(s.groups[0].bandwidth.as_ref().unwrap().period_ns, 100_000_000);
        assert_eq!(s.actions[0].at_ns, 10_000_000);
        assert_eq!(s.seed, DEFAULT_SEED);
    }

    #[test]
    fn test_validate_references() {
        let s = Scenario::builder().task(TaskDef::new("a", TaskBehavior::once(vec![Phase::Wake("ghost".into())]))).build();
        assert!(s.validate().is_err());

        let s = Scenario::builder().task(TaskDef::new("a", TaskBehavior::spin()).group("nope")).build();
        assert!(s.validate().is_err());

        let s = Scenario::builder()
            .task(TaskDef::new("a", TaskBehavior::spin()))
            .task(TaskDef::new("a", TaskBehavior::spin()))
            .build();
        assert!(s.validate().is_err());

        let s = Scenario::builder().cpus(2).cpu_offline_at(0, 2).task(TaskDef::new("a", TaskBehavior::spin())).build();
        assert!(s.validate().is_err());

        let s = Scenario::builder().cpus(2).task(TaskDef::new("a", TaskBehavior::spin()).cpus("0-3")).build();
        assert!(s.validate().is_err());

        let s = Scenario::builder().task(TaskDef::new("a", TaskBehavior::forever(vec![Phase::Run(0)]))).build();
        assert!(s.validate().is_err());

        let s = Scenario::builder()
            .group(GroupDef::new("child").parent("parent"))
            .group(GroupDef::new("parent"))
            .build();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, r#"{ "tasks": [ { "name": "w", "behavior": { "phases": [ { "run": 1 } ] } } ] }"#).unwrap();
        let s = Scenario::load(&path).unwrap();
        assert_eq!(s.tasks.len(), 1);
        assert!(Scenario::load(&dir.path().join("missing.json")).is_err());
    }
}
