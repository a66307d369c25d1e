// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Trace event recording for the simulator.
//!
//! Scheduling transitions reported by the core, plus the ticks and
//! failures the engine itself sees, are recorded as `TraceEvent`s with a
//! simulated timestamp and CPU.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;

use sched_core::stats::CpuIdleType;
use sched_core::{CpuId, GroupId, Ipi, Pid, SchedError, TimeNs};

use crate::fmt::FmtTs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub time_ns: TimeNs,
    pub cpu: CpuId,
    pub kind: TraceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
    Spawned { pid: Pid },
    /// `pid` starts running on the CPU.
    Scheduled { pid: Pid },
    /// Switched out while still runnable.
    Preempted { pid: Pid },
    /// Switched out to sleep.
    Blocked { pid: Pid },
    /// Switched out for the last time.
    Exited { pid: Pid },
    /// `pid` was made runnable on the CPU.
    Woken { pid: Pid },
    /// `pid` moved to the CPU from `from`.
    Migrated { pid: Pid, from: CpuId },
    Throttled { group: GroupId },
    Unthrottled { group: GroupId },
    RtThrottled,
    RtUnthrottled,
    /// Periodic tick with `curr` running.
    Tick { curr: Pid },
    CpuOffline,
    CpuOnline,
    /// The CPU took an IPI.
    Ipi { ipi: Ipi },
    /// A balance pass on the CPU pulled `moved` tasks from `src`.
    Balanced { src: CpuId, moved: u32, idle: CpuIdleType },
    /// The core refused a scenario request.
    Rejected { what: String, error: SchedError },
    /// Still running when the simulation stopped.
    SimulationEnd { pid: Pid },
}

/// A complete simulation trace, in chronological order.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
    names: BTreeMap<Pid, String>,
    pids: HashMap<String, Pid>,
    exec_runtime: HashMap<Pid, TimeNs>,
    violations: Vec<String>,
    end_ns: TimeNs,
}

impl Trace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, time_ns: TimeNs, cpu: CpuId, kind: TraceKind) {
        self.events.push(TraceEvent { time_ns, cpu, kind });
    }

    pub(crate) fn register(&mut self, name: &str, pid: Pid) {
        self.names.insert(pid, name.to_string());
        self.pids.insert(name.to_string(), pid);
    }

    pub(crate) fn set_exec_runtime(&mut self, pid: Pid, ns: TimeNs) {
        self.exec_runtime.insert(pid, ns);
    }

    pub(crate) fn add_violations(&mut self, v: impl IntoIterator<Item = String>) {
        self.violations.extend(v);
    }

    pub(crate) fn set_end(&mut self, end_ns: TimeNs) {
        self.end_ns = end_ns;
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Pid the core assigned to the scenario task `name`.
    pub fn pid(&self, name: &str) -> Option<Pid> {
        self.pids.get(name).copied()
    }

    pub fn name(&self, pid: Pid) -> Option<&str> {
        self.names.get(&pid).map(String::as_str)
    }

    /// Scenario tasks that were spawned, by pid.
    pub fn tasks(&self) -> impl Iterator<Item = (Pid, &str)> + '_ {
        self.names.iter().map(|(p, n)| (*p, n.as_str()))
    }

    pub fn end_ns(&self) -> TimeNs {
        self.end_ns
    }

    /// Invariant violations collected during the run, when checking was on.
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// CPU time the core accounted to `pid`, as of its exit or the end of
    /// the run.
    pub fn exec_runtime(&self, pid: Pid) -> Option<TimeNs> {
        self.exec_runtime.get(&pid).copied()
    }

    /// Run intervals of `pid` as `(cpu, start, end)`.
    pub fn intervals(&self, pid: Pid) -> Vec<(CpuId, TimeNs, TimeNs)> {
        let mut out = vec![];
        let mut running: Option<(CpuId, TimeNs)> = None;
        for e in &self.events {
            match e.kind {
                TraceKind::Scheduled { pid: p } if p == pid => running = Some((e.cpu, e.time_ns)),
                TraceKind::Preempted { pid: p }
                | TraceKind::Blocked { pid: p }
                | TraceKind::Exited { pid: p }
                | TraceKind::SimulationEnd { pid: p }
                    if p == pid =>
                {
                    if let Some((cpu, start)) = running.take() {
                        out.push((cpu, start, e.time_ns));
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Total time `pid` spent running, from Scheduled to the matching
    /// switch-out.
    pub fn total_runtime(&self, pid: Pid) -> TimeNs {
        self.intervals(pid).iter().map(|(_, s, e)| e - s).sum()
    }

    /// Running time of `pid` inside `[t0, t1)`.
    pub fn runtime_between(&self, pid: Pid, t0: TimeNs, t1: TimeNs) -> TimeNs {
        self.intervals(pid)
            .iter()
            .map(|&(_, s, e)| e.min(t1).saturating_sub(s.max(t0)))
            .sum()
    }

    /// Maximal stretches of back-to-back running, as `(start, end)`.
    pub fn bursts(&self, pid: Pid) -> Vec<(TimeNs, TimeNs)> {
        let mut out: Vec<(TimeNs, TimeNs)> = vec![];
        for (_, s, e) in self.intervals(pid) {
            match out.last_mut() {
                Some(last) if last.1 == s => last.1 = e,
                _ => out.push((s, e)),
            }
        }
        out
    }

    pub fn schedule_count(&self, pid: Pid) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::Scheduled { pid: p } if p == pid))
            .count()
    }

    pub fn migrations(&self, pid: Pid) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::Migrated { pid: p, .. } if p == pid))
            .count()
    }

    /// CPUs `pid` ran on.
    pub fn cpus_used(&self, pid: Pid) -> HashSet<CpuId> {
        self.intervals(pid).into_iter().map(|(cpu, _, _)| cpu).collect()
    }

    /// Time scenario tasks kept `cpu` busy.
    pub fn busy_time(&self, cpu: CpuId) -> TimeNs {
        self.names
            .keys()
            .flat_map(|&p| self.intervals(p))
            .filter(|(c, _, _)| *c == cpu)
            .map(|(_, s, e)| e - s)
            .sum()
    }

    /// IPIs delivered inside `[t0, t1)`, as `(time, cpu, ipi)`.
    pub fn ipis_between(&self, t0: TimeNs, t1: TimeNs) -> Vec<(TimeNs, CpuId, Ipi)> {
        self.events
            .iter()
            .filter(|e| (t0..t1).contains(&e.time_ns))
            .filter_map(|e| match e.kind {
                TraceKind::Ipi { ipi } => Some((e.time_ns, e.cpu, ipi)),
                _ => None,
            })
            .collect()
    }

    pub fn rejections(&self) -> impl Iterator<Item = (&str, &SchedError)> + '_ {
        self.events.iter().filter_map(|e| match &e.kind {
            TraceKind::Rejected { what, error } => Some((what.as_str(), error)),
            _ => None,
        })
    }

    fn who(&self, pid: Pid) -> String {
        match self.names.get(&pid) {
            Some(n) => format!("{}({n})", pid.0),
            None => pid.0.to_string(),
        }
    }

    pub fn format(&self, ticks: bool) -> String {
        let mut out = String::new();
        for e in &self.events {
            let desc = match &e.kind {
                TraceKind::Spawned { pid } => format!("SPAWN    pid={}", self.who(*pid)),
                TraceKind::Scheduled { pid } => format!("SCHED    pid={}", self.who(*pid)),
                TraceKind::Preempted { pid } => format!("PREEMPT  pid={}", self.who(*pid)),
                TraceKind::Blocked { pid } => format!("BLOCK    pid={}", self.who(*pid)),
                TraceKind::Exited { pid } => format!("EXIT     pid={}", self.who(*pid)),
                TraceKind::Woken { pid } => format!("WAKE     pid={}", self.who(*pid)),
                TraceKind::Migrated { pid, from } => format!("MIGRATE  pid={} from={}", self.who(*pid), from.0),
                TraceKind::Throttled { group } => format!("THROTTLE {group}"),
                TraceKind::Unthrottled { group } => format!("UNTHROTL {group}"),
                TraceKind::RtThrottled => "RT_THROTTLE".to_string(),
                TraceKind::RtUnthrottled => "RT_UNTHROTTLE".to_string(),
                TraceKind::Tick { curr } => {
                    if !ticks {
                        continue;
                    }
                    format!("TICK     curr={}", self.who(*curr))
                }
                TraceKind::CpuOffline => "OFFLINE".to_string(),
                TraceKind::CpuOnline => "ONLINE".to_string(),
                TraceKind::Ipi { ipi } => format!("IPI      {ipi:?}"),
                TraceKind::Balanced { src, moved, idle } => format!("BALANCE  src={} moved={moved} {idle:?}", src.0),
                TraceKind::Rejected { what, error } => format!("REJECT   {what}: {error}"),
                TraceKind::SimulationEnd { pid } => format!("END      pid={}", self.who(*pid)),
            };
            let _ = writeln!(out, "[{}] {desc}", FmtTs::new(e.time_ns, Some(e.cpu)));
        }
        out
    }

    /// Pretty-print the trace to stderr, without ticks.
    pub fn dump(&self) {
        eprint!("{}", self.format(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Trace {
        let mut t = Trace::new();
        let p = Pid(10);
        t.register("w", p);
        t.record(0, CpuId(0), TraceKind::Scheduled { pid: p });
        t.record(4, CpuId(0), TraceKind::Preempted { pid: p });
        t.record(4, CpuId(1), TraceKind::Migrated { pid: p, from: CpuId(0) });
        t.record(4, CpuId(1), TraceKind::Scheduled { pid: p });
        t.record(10, CpuId(1), TraceKind::Blocked { pid: p });
        t.record(20, CpuId(1), TraceKind::Woken { pid: p });
        t.record(25, CpuId(1), TraceKind::Scheduled { pid: p });
        t.record(30, CpuId(1), TraceKind::SimulationEnd { pid: p });
        t
    }

    #[test]
    fn test_runtime_queries() {
        let t = sample();
        let p = t.pid("w").unwrap();
        assert_eq!(t.total_runtime(p), 15);
        assert_eq!(t.runtime_between(p, 2, 26), 9);
        assert_eq!(t.schedule_count(p), 3);
        assert_eq!(t.migrations(p), 1);
        assert_eq!(t.bursts(p), vec![(0, 10), (25, 30)]);
        assert_eq!(t.busy_time(CpuId(1)), 11);
        assert_eq!(t.cpus_used(p).len(), 2);
    }

    #[test]
    fn test_format_names_tasks() {
        let t = sample();
        let s = t.format(false);
        assert!(s.contains("SCHED    pid=10(w)"));
        assert!(s.contains("MIGRATE  pid=10(w) from=0"));
        assert_eq!(s.lines().count(), t.events().len());
    }
}
