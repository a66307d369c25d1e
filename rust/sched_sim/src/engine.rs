// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Event-driven simulation engine.
//!
//! The engine owns a `Sched` and plays the machine around it: it keeps
//! the event queue and the simulated clock, ticks every online CPU, runs
//! each task's script while the core has it on a CPU, and delivers the
//! IPIs and timers the core asks for.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use sched_core::{
    CpuId, Cpumask, GroupId, InvariantMonitor, Monitor, Pid, Sched, SchedConfig, SchedError, SchedEvent, Task,
    TaskState, TimeNs,
};

use crate::fmt::set_sim_clock;
use crate::scenario::{Action, Phase, RepeatMode, Scenario, TaskBehavior};
use crate::trace::{Trace, TraceKind};

/// Rounds of IPI delivery and preemption allowed at one instant before
/// the engine gives up on the machine settling.
const MAX_SETTLE_ROUNDS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Event {
    time_ns: TimeNs,
    /// Tiebreaker for events at the same time, in insertion order.
    seq: u64,
    kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time_ns.cmp(&other.time_ns).then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventKind {
    Spawn(usize),
    Tick(CpuId),
    /// The current phase of whatever runs on `cpu` is done, unless `token`
    /// went stale because the CPU switched since.
    PhaseDone { cpu: CpuId, token: u64 },
    /// A timed sleep ends, unless the task was woken early.
    WakeTimer { task: usize, token: u64 },
    CoreTimer,
    Action(usize),
}

impl EventKind {
    fn cpu(&self) -> Option<CpuId> {
        match self {
            EventKind::Tick(cpu) | EventKind::PhaseDone { cpu, .. } => Some(*cpu),
            _ => None,
        }
    }
}

struct SimTask {
    pid: Option<Pid>,
    /// Index of the next phase to start.
    phase_idx: usize,
    /// Passes over the phase list completed.
    passes: u32,
    /// Run time left in the current phase.
    remaining: TimeNs,
    sleep_token: u64,
    exited: bool,
}

impl SimTask {
    fn next_phase(&mut self, behavior: &TaskBehavior) -> Option<Phase> {
        if self.phase_idx >= behavior.phases.len() {
            self.passes += 1;
            let again = match behavior.repeat {
                RepeatMode::Once => false,
                RepeatMode::Count(n) => self.passes < n,
                RepeatMode::Forever => true,
            };
            if !again || behavior.phases.is_empty() {
                return None;
            }
            self.phase_idx = 0;
        }
        let phase = behavior.phases[self.phase_idx].clone();
        self.phase_idx += 1;
        Some(phase)
    }
}

#[derive(Default)]
struct SimCpu {
    running: Option<usize>,
    since: TimeNs,
    token: u64,
    tick_base: TimeNs,
}

/// Forwards hook calls to the invariant checker and keeps the final runtime of
/// tasks the core releases.
struct SimMonitor {
    exits: Arc<Mutex<Vec<(Pid, TimeNs)>>>,
    invariants: Option<InvariantMonitor>,
}

impl Monitor for SimMonitor {
    fn after_tick(&mut self, s: &Sched, cpu: CpuId) {
        if let Some(m) = &mut self.invariants {
            m.after_tick(s, cpu);
        }
    }

    fn after_pick(&mut self, s: &Sched, cpu: CpuId) {
        if let Some(m) = &mut self.invariants {
            m.after_pick(s, cpu);
        }
    }

    fn migrating(&mut self, s: &Sched, pid: Pid) {
        if let Some(m) = &mut self.invariants {
            m.migrating(s, pid);
        }
    }

    fn after_balance(&mut self, s: &Sched, cpu: CpuId) {
        if let Some(m) = &mut self.invariants {
            m.after_balance(s, cpu);
        }
    }

    fn task_exited(&mut self, task: &Task) {
        self.exits.lock().push((task.pid, task.se.sum_exec_runtime));
    }
}

pub struct Simulator {
    scenario: Scenario,
    sched: Sched,
    now: TimeNs,
    seq: u64,
    queue: BinaryHeap<Reverse<Event>>,
    tasks: Vec<SimTask>,
    masks: Vec<Option<Cpumask>>,
    by_pid: HashMap<Pid, usize>,
    by_name: HashMap<String, usize>,
    groups: HashMap<String, GroupId>,
    cpus: Vec<SimCpu>,
    armed_timer: Option<TimeNs>,
    tick_ns: TimeNs,
    rng: SmallRng,
    trace: Trace,
    exits: Arc<Mutex<Vec<(Pid, TimeNs)>>>,
    violations: Option<Arc<Mutex<Vec<String>>>>,
    started: bool,
}

impl Simulator {
    /// Bring up the scheduler for `scenario` and create its groups.
    pub fn new(scenario: Scenario) -> Result<Self> {
        scenario.validate()?;
        let config = SchedConfig {
            topology: scenario.topology.clone(),
            tunables: scenario.tunables.clone(),
            ..Default::default()
        };
        let mut sched = Sched::new(config).context("Failed to create the scheduler")?;
        let nr_cpus = sched.nr_cpus();

        let mut groups = HashMap::new();
        for g in &scenario.groups {
            let parent = g.parent.as_ref().and_then(|p| groups.get(p).copied()).unwrap_or(GroupId::ROOT);
            let id = sched.create_group(parent, &g.name).with_context(|| format!("group {:?}", g.name))?;
            if let Some(shares) = g.shares {
                sched.set_group_shares(id, shares).with_context(|| format!("group {:?} shares", g.name))?;
            }
            if g.idle {
                sched.set_group_idle(id, true).with_context(|| format!("group {:?} idle", g.name))?;
            }
            if let Some((min, max)) = g.uclamp {
                sched.set_group_uclamp(id, min, max).with_context(|| format!("group {:?} uclamp", g.name))?;
            }
            if let Some(bw) = &g.bandwidth {
                sched
                    .set_group_bandwidth(id, bw.period_ns, bw.quota_ns, bw.burst_ns)
                    .with_context(|| format!("group {:?} bandwidth", g.name))?;
            }
            groups.insert(g.name.clone(), id);
        }

        let mut masks = vec![];
        for t in &scenario.tasks {
            let mask = match &t.cpus {
                Some(list) => Some(Cpumask::from_cpulist(list, nr_cpus)?),
                None => None,
            };
            masks.push(mask);
        }

        let exits = Arc::new(Mutex::new(vec![]));
        let invariants = scenario.check_invariants.then(InvariantMonitor::new);
        let violations = invariants.as_ref().map(|m| m.violations.clone());
        sched.set_monitor(Some(Box::new(SimMonitor {
            exits: exits.clone(),
            invariants,
        })));

        let tasks = scenario
            .tasks
            .iter()
            .map(|_| SimTask {
                pid: None,
                phase_idx: 0,
                passes: 0,
                remaining: 0,
                sleep_token: 0,
                exited: false,
            })
            .collect();
        let by_name = scenario.tasks.iter().enumerate().map(|(i, t)| (t.name.clone(), i)).collect();
        let tick_ns = sched.tunables.tick_ns();

        Ok(Self {
            rng: SmallRng::seed_from_u64(scenario.seed),
            scenario,
            sched,
            now: 0,
            seq: 0,
            queue: BinaryHeap::new(),
            tasks,
            masks,
            by_pid: HashMap::new(),
            by_name,
            groups,
            cpus: (0..nr_cpus).map(|_| SimCpu::default()).collect(),
            armed_timer: None,
            tick_ns,
            trace: Trace::new(),
            exits,
            violations,
            started: false,
        })
    }

    pub fn sched(&self) -> &Sched {
        &self.sched
    }

    pub fn sched_mut(&mut self) -> &mut Sched {
        &mut self.sched
    }

    /// Trace recorded so far.
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn now(&self) -> TimeNs {
        self.now
    }

    /// Pid of the scenario task `name`, once spawned.
    pub fn pid(&self, name: &str) -> Option<Pid> {
        self.by_name.get(name).and_then(|&i| self.tasks[i].pid)
    }

    /// Run the whole scenario and return the trace.
    pub fn run(&mut self) -> Trace {
        self.run_until(self.scenario.duration_ns);
        self.finish()
    }

    /// Process every event up to and including `until`, capped at the
    /// scenario duration.
    pub fn run_until(&mut self, until: TimeNs) {
        if !self.started {
            self.start();
        }
        let until = until.min(self.scenario.duration_ns);
        while let Some(Reverse(ev)) = self.queue.peek() {
            if ev.time_ns > until {
                break;
            }
            let Some(Reverse(ev)) = self.queue.pop() else {
                break;
            };
            self.now = self.now.max(ev.time_ns);
            set_sim_clock(self.now, ev.kind.cpu());
            self.handle(ev.kind);
            self.settle();
        }
        self.now = self.now.max(until);
        set_sim_clock(self.now, None);
    }

    fn start(&mut self) {
        self.started = true;
        info!(
            nr_cpus = self.sched.nr_cpus(),
            tasks = self.scenario.tasks.len(),
            duration_ns = self.scenario.duration_ns,
            seed = self.scenario.seed,
            "simulation starting"
        );
        for i in 0..self.scenario.tasks.len() {
            let at = self.scenario.tasks[i].start_time_ns;
            self.push(at, EventKind::Spawn(i));
        }
        for i in 0..self.scenario.actions.len() {
            let at = self.scenario.actions[i].at_ns;
            self.push(at, EventKind::Action(i));
        }
        for c in 0..self.cpus.len() {
            self.schedule_tick(CpuId(c as u32));
        }
        self.arm_core_timer();
    }

    /// Close open run intervals and collect per-task accounting.
    pub fn finish(&mut self) -> Trace {
        let end = self.scenario.duration_ns.max(self.now);
        for c in 0..self.cpus.len() {
            if let Some(i) = self.cpus[c].running.take() {
                if let Some(pid) = self.tasks[i].pid {
                    self.trace.record(end, CpuId(c as u32), TraceKind::SimulationEnd { pid });
                }
            }
        }
        for (pid, ns) in self.exits.lock().drain(..) {
            self.trace.set_exec_runtime(pid, ns);
        }
        for t in &self.tasks {
            if let Some(pid) = t.pid {
                if let Some(task) = self.sched.task(pid) {
                    self.trace.set_exec_runtime(pid, task.se.sum_exec_runtime);
                }
            }
        }
        if let Some(v) = &self.violations {
            self.trace.add_violations(v.lock().drain(..));
        }
        self.trace.set_end(end);
        info!(events = self.trace.events().len(), "simulation finished");
        std::mem::take(&mut self.trace)
    }

    fn push(&mut self, time_ns: TimeNs, kind: EventKind) {
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(Reverse(Event { time_ns, seq, kind }));
    }

    fn schedule_tick(&mut self, cpu: CpuId) {
        let jitter = self.scenario.tick_jitter_ns;
        let c = &mut self.cpus[cpu.idx()];
        c.tick_base += self.tick_ns;
        let mut at = c.tick_base;
        if jitter > 0 {
            at += self.rng.gen_range(0..=jitter);
        }
        self.push(at, EventKind::Tick(cpu));
    }

    fn arm_core_timer(&mut self) {
        let Some(t) = self.sched.next_timer() else {
            return;
        };
        if self.armed_timer.is_some_and(|armed| armed <= t) {
            return;
        }
        self.armed_timer = Some(t);
        let at = t.max(self.now);
        self.push(at, EventKind::CoreTimer);
    }

    /// CPU that issues requests not tied to a CPU: the timekeeper, or any
    /// other online CPU when the timekeeper is the one being acted on.
    fn control_cpu(&self, avoid: Option<CpuId>) -> CpuId {
        let tick_cpu = self.sched.tick_cpu();
        if avoid != Some(tick_cpu) {
            return tick_cpu;
        }
        self.sched.online.cpus().find(|&c| Some(c) != avoid).unwrap_or(tick_cpu)
    }

    fn handle(&mut self, kind: EventKind) {
        match kind {
            EventKind::Spawn(i) => self.spawn(i),
            EventKind::Tick(cpu) => self.tick(cpu),
            EventKind::PhaseDone { cpu, token } => self.phase_done(cpu, token),
            EventKind::WakeTimer { task, token } => self.wake_timer(task, token),
            EventKind::CoreTimer => {
                self.armed_timer = None;
                let cpu = self.control_cpu(None);
                self.sched.enter(cpu, self.now);
                self.sched.run_timers();
            }
            EventKind::Action(i) => self.action(i),
        }
    }

    fn reject(&mut self, cpu: CpuId, what: String, error: SchedError) {
        debug!(%what, %error, "request rejected");
        self.trace.record(self.now, cpu, TraceKind::Rejected { what, error });
    }

    fn spawn(&mut self, i: usize) {
        let def = &self.scenario.tasks[i];
        let name = def.name.clone();
        let attr = def.attr;
        let group = def.group.as_ref().and_then(|g| self.groups.get(g).copied()).unwrap_or(GroupId::ROOT);
        let mask = self.masks[i].clone();
        let cpu = mask
            .as_ref()
            .and_then(|m| m.cpus().find(|&c| self.sched.online.has(c)))
            .unwrap_or_else(|| self.control_cpu(None));

        self.sched.enter(cpu, self.now);
        match self.sched.spawn(&name, &attr, group, mask.as_ref()) {
            Ok(pid) => {
                debug!(%pid, name = %name, "spawned");
                self.tasks[i].pid = Some(pid);
                self.by_pid.insert(pid, i);
                self.trace.register(&name, pid);
                let on = self.sched.task(pid).map_or(cpu, |t| t.cpu);
                self.trace.record(self.now, on, TraceKind::Spawned { pid });
            }
            Err(e) => {
                self.tasks[i].exited = true;
                self.reject(cpu, format!("spawn {name}"), e);
            }
        }
    }

    fn tick(&mut self, cpu: CpuId) {
        self.schedule_tick(cpu);
        if !self.sched.online.has(cpu) {
            return;
        }
        let nohz = &self.sched.rq(cpu).nohz;
        if nohz.tick_stopped && !nohz.tick_dep && cpu != self.sched.tick_cpu() {
            return;
        }
        self.sched.enter(cpu, self.now);
        self.sched.scheduler_tick(cpu);
        let curr = self.sched.curr(cpu);
        self.trace.record(self.now, cpu, TraceKind::Tick { curr });
    }

    fn phase_done(&mut self, cpu: CpuId, token: u64) {
        let c = &mut self.cpus[cpu.idx()];
        if c.token != token {
            return;
        }
        let Some(i) = c.running else {
            return;
        };
        c.since = self.now;
        self.tasks[i].remaining = 0;
        self.advance(i, cpu);
    }

    /// Start the next phases of task `i`, running on `cpu`, until one takes
    /// time or the script ends.
    fn advance(&mut self, i: usize, cpu: CpuId) {
        let Some(pid) = self.tasks[i].pid else {
            return;
        };
        loop {
            let phase = self.tasks[i].next_phase(&self.scenario.tasks[i].behavior);
            match phase {
                None => {
                    self.tasks[i].exited = true;
                    self.sched.enter(cpu, self.now);
                    if let Err(e) = self.sched.sched_exit(pid) {
                        self.reject(cpu, format!("exit {pid}"), e);
                    }
                    return;
                }
                Some(Phase::Run(ns)) => {
                    self.tasks[i].remaining = ns;
                    self.arm_phase(cpu);
                    return;
                }
                Some(Phase::Sleep(ns)) => {
                    let t = &mut self.tasks[i];
                    t.sleep_token += 1;
                    let token = t.sleep_token;
                    self.push(self.now + ns, EventKind::WakeTimer { task: i, token });
                    self.sched.enter(cpu, self.now);
                    self.sched.set_current_state(cpu, TaskState::INTERRUPTIBLE, false);
                    self.sched.schedule(cpu);
                    return;
                }
                Some(Phase::Wake(target)) => self.wake_by_name(cpu, &target, false),
                Some(Phase::WakeSync(target)) => self.wake_by_name(cpu, &target, true),
            }
        }
    }

    fn arm_phase(&mut self, cpu: CpuId) {
        let c = &mut self.cpus[cpu.idx()];
        let Some(i) = c.running else {
            return;
        };
        c.token += 1;
        let token = c.token;
        let at = c.since + self.tasks[i].remaining;
        self.push(at, EventKind::PhaseDone { cpu, token });
    }

    fn wake_by_name(&mut self, cpu: CpuId, name: &str, sync: bool) {
        let Some(&i) = self.by_name.get(name) else {
            return;
        };
        let t = &mut self.tasks[i];
        let Some(pid) = t.pid.filter(|_| !t.exited) else {
            debug!(target_task = name, "wake target not alive");
            return;
        };
        // Whatever timed sleep it was in is cut short.
        t.sleep_token += 1;
        self.sched.enter(cpu, self.now);
        if let Err(e) = self.sched.wake_up(pid, sync) {
            self.reject(cpu, format!("wake {name}"), e);
        }
    }

    fn wake_timer(&mut self, i: usize, token: u64) {
        let t = &self.tasks[i];
        if t.sleep_token != token || t.exited {
            return;
        }
        let Some(pid) = t.pid else {
            return;
        };
        let cpu = self
            .sched
            .task(pid)
            .map(|t| t.cpu)
            .filter(|&c| self.sched.online.has(c))
            .unwrap_or_else(|| self.control_cpu(None));
        set_sim_clock(self.now, Some(cpu));
        self.sched.enter(cpu, self.now);
        let _ = self.sched.wake_up(pid, false);
    }

    fn action(&mut self, idx: usize) {
        let action = self.scenario.actions[idx].action.clone();
        debug!(?action, "scenario action");
        let target_cpu = match &action {
            Action::CpuOffline(c) | Action::CpuOnline(c) => Some(CpuId(*c)),
            _ => None,
        };
        let cpu = self.control_cpu(target_cpu);
        self.sched.enter(cpu, self.now);
        let nr_cpus = self.sched.nr_cpus();

        let result = match &action {
            Action::CpuOffline(c) => self.sched.cpu_offline(CpuId(*c)),
            Action::CpuOnline(c) => self.sched.cpu_online(CpuId(*c)),
            Action::SetAffinity { task, cpus } => match (self.pid(task), Cpumask::from_cpulist(cpus, nr_cpus)) {
                (Some(pid), Ok(mask)) => self.sched.set_cpus_allowed(pid, &mask),
                (None, _) => Err(SchedError::InvalidParams("task not running")),
                (_, Err(_)) => Err(SchedError::AffinityEmpty),
            },
            Action::SetAttr { task, attr } => match self.pid(task) {
                Some(pid) => self.sched.sched_setattr(pid, attr),
                None => Err(SchedError::InvalidParams("task not running")),
            },
            Action::SetNice { task, nice } => match self.pid(task) {
                Some(pid) => self.sched.set_user_nice(pid, *nice),
                None => Err(SchedError::InvalidParams("task not running")),
            },
            Action::MoveToGroup { task, group } => match (self.pid(task), self.groups.get(group).copied()) {
                (Some(pid), Some(g)) => self.sched.move_task_to_group(pid, g),
                _ => Err(SchedError::InvalidParams("task not running")),
            },
            Action::SetBandwidth { group, bandwidth } => match self.groups.get(group).copied() {
                Some(g) => self.sched.set_group_bandwidth(g, bandwidth.period_ns, bandwidth.quota_ns, bandwidth.burst_ns),
                None => Err(SchedError::GroupConfigInvalid("unknown group")),
            },
        };
        if let Err(e) = result {
            self.reject(cpu, format!("{action:?}"), e);
        }
    }

    /// Let the machine react at the current instant: deliver IPIs and take
    /// pending preemptions until nothing is left to do.
    fn settle(&mut self) {
        let mut settled = false;
        for _ in 0..MAX_SETTLE_ROUNDS {
            self.absorb_events();
            let ipis = self.sched.take_ipis();
            let mut acted = !ipis.is_empty();
            for (cpu, ipi) in ipis {
                if !self.sched.online.has(cpu) {
                    continue;
                }
                set_sim_clock(self.now, Some(cpu));
                self.trace.record(self.now, cpu, TraceKind::Ipi { ipi });
                self.sched.enter(cpu, self.now);
                self.sched.handle_ipi(cpu, ipi);
            }
            self.absorb_events();
            for c in 0..self.cpus.len() {
                let cpu = CpuId(c as u32);
                if self.sched.online.has(cpu) && self.sched.need_resched(cpu) {
                    set_sim_clock(self.now, Some(cpu));
                    self.sched.enter(cpu, self.now);
                    self.sched.preempt_check(cpu);
                    acted = true;
                }
            }
            self.absorb_events();
            if !acted {
                settled = true;
                break;
            }
        }
        if !settled {
            warn!(now = self.now, "machine did not settle");
        }
        self.arm_core_timer();
    }

    fn absorb_events(&mut self) {
        for ev in self.sched.drain_events() {
            match ev {
                SchedEvent::Switch { cpu, prev, next, prev_state } => self.switch(cpu, prev, next, prev_state),
                SchedEvent::Woken { pid, cpu } => {
                    if self.by_pid.contains_key(&pid) {
                        self.trace.record(self.now, cpu, TraceKind::Woken { pid });
                    }
                }
                SchedEvent::Migrated { pid, from, to } => {
                    if self.by_pid.contains_key(&pid) {
                        self.trace.record(self.now, to, TraceKind::Migrated { pid, from });
                    }
                }
                SchedEvent::Throttled { cpu, group } => self.trace.record(self.now, cpu, TraceKind::Throttled { group }),
                SchedEvent::Unthrottled { cpu, group } => {
                    self.trace.record(self.now, cpu, TraceKind::Unthrottled { group })
                }
                SchedEvent::RtThrottled { cpu } => self.trace.record(self.now, cpu, TraceKind::RtThrottled),
                SchedEvent::RtUnthrottled { cpu } => self.trace.record(self.now, cpu, TraceKind::RtUnthrottled),
                SchedEvent::Balanced { cpu, src, moved, idle } => {
                    self.trace.record(self.now, cpu, TraceKind::Balanced { src, moved, idle })
                }
                SchedEvent::CpuOnline { cpu } => self.trace.record(self.now, cpu, TraceKind::CpuOnline),
                SchedEvent::CpuOffline { cpu } => self.trace.record(self.now, cpu, TraceKind::CpuOffline),
                _ => {}
            }
        }
    }

    fn switch(&mut self, cpu: CpuId, prev: Pid, next: Pid, prev_state: TaskState) {
        let now = self.now;
        if let Some(&i) = self.by_pid.get(&prev) {
            let c = &mut self.cpus[cpu.idx()];
            if c.running == Some(i) {
                let ran = now - c.since;
                c.running = None;
                c.token += 1;
                let t = &mut self.tasks[i];
                t.remaining = t.remaining.saturating_sub(ran);
            }
            let kind = if prev_state.contains(TaskState::DEAD) {
                TraceKind::Exited { pid: prev }
            } else if prev_state.is_running() {
                TraceKind::Preempted { pid: prev }
            } else {
                TraceKind::Blocked { pid: prev }
            };
            self.trace.record(now, cpu, kind);
        }
        if let Some(&i) = self.by_pid.get(&next) {
            let c = &mut self.cpus[cpu.idx()];
            c.running = Some(i);
            c.since = now;
            self.trace.record(now, cpu, TraceKind::Scheduled { pid: next });
            self.arm_phase(cpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::TaskDef;

    fn behavior(repeat: RepeatMode) -> TaskBehavior {
        TaskBehavior {
            phases: vec![Phase::Run(1), Phase::Sleep(2)],
            repeat,
        }
    }

    fn script(b: &TaskBehavior) -> Vec<Phase> {
        let mut t = SimTask {
            pid: None,
            phase_idx: 0,
            passes: 0,
            remaining: 0,
            sleep_token: 0,
            exited: false,
        };
        std::iter::from_fn(|| t.next_phase(b)).take(10).collect()
    }

    #[test]
    fn test_repeat_modes() {
        assert_eq!(script(&behavior(RepeatMode::Once)).len(), 2);
        assert_eq!(script(&behavior(RepeatMode::Count(3))).len(), 6);
        assert_eq!(script(&behavior(RepeatMode::Forever)).len(), 10);
        assert!(script(&TaskBehavior::default()).is_empty());
    }

    #[test]
    fn test_event_order() {
        let a = Event { time_ns: 5, seq: 1, kind: EventKind::CoreTimer };
        let b = Event { time_ns: 5, seq: 0, kind: EventKind::Spawn(0) };
        let c = Event { time_ns: 4, seq: 9, kind: EventKind::CoreTimer };
        let mut q: BinaryHeap<Reverse<Event>> = [a, b, c].into_iter().map(Reverse).collect();
        let order: Vec<_> = std::iter::from_fn(|| q.pop().map(|Reverse(e)| (e.time_ns, e.seq))).collect();
        assert_eq!(order, vec![(4, 9), (5, 0), (5, 1)]);
    }

    #[test]
    fn test_single_task_runs_its_script() {
        let scenario = Scenario::builder()
            .cpus(1)
            .task(TaskDef::new("w", TaskBehavior::once(vec![Phase::Run(5_000_000)])))
            .duration_ms(50)
            .build();
        let mut sim = Simulator::new(scenario).unwrap();
        let trace = sim.run();
        let pid = trace.pid("w").unwrap();
        assert_eq!(trace.total_runtime(pid), 5_000_000);
        assert!(trace.events().iter().any(|e| e.kind == TraceKind::Exited { pid }));
        assert!(sim.sched().task(pid).is_none());
        let exec = trace.exec_runtime(pid).unwrap();
        assert!(exec.abs_diff(5_000_000) <= 1_000_000, "exec_runtime {exec}");
    }

    #[test]
    fn test_invalid_scenario_is_refused() {
        let scenario = Scenario::builder()
            .cpus(1)
            .task(TaskDef::new("w", TaskBehavior::spin()).group("missing"))
            .build();
        assert!(Simulator::new(scenario).is_err());
    }
}
