// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Scheduler core
//!
//! `Sched` owns every runqueue, task and group plus the shared topology
//! state. All entry points take `&mut self`; the caller (a driver or the
//! simulator) decides which CPU an operation happens on by calling
//! `enter()` first, which also moves the global clock forward.
//!
//! Side effects the core cannot perform itself are queued for the caller:
//! IPIs are delivered through `take_ipis()`/`handle_ipi()`, timers live in
//! `timers` and fire through `run_timers()`, and observable transitions are
//! collected as `SchedEvent`s for `drain_events()`.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::class::class;
use crate::class::ClassId;
use crate::cpufreq::CpufreqHook;
use crate::cpumask::Cpumask;
use crate::energy::EnergyModel;
use crate::idle::IdleGovernor;
use crate::idle::IdleState;
use crate::idle::ResidencyGovernor;
use crate::loadavg::LoadAvg;
use crate::monitor::Monitor;
use crate::nohz::NohzState;
use crate::rcu::RcuQueue;
use crate::root_domain::to_ratio;
use crate::root_domain::RootDomain;
use crate::rq::BalanceCallback;
use crate::rq::Rq;
use crate::sched_domain::DomainTree;
use crate::stats::CpuIdleType;
use crate::task::DequeueFlags;
use crate::task::EnqueueFlags;
use crate::task::OnRq;
use crate::task::Task;
use crate::task::TaskKind;
use crate::task::TaskState;
use crate::task::TaskTable;
use crate::task::WakeFlags;
use crate::task_group::GroupTable;
use crate::timer::TimerEvent;
use crate::timer::TimerWheel;
use crate::topology::Topology;
use crate::topology::TopologySpec;
use crate::tunables::SchedTunables;
use crate::types::CpuId;
use crate::types::GroupId;
use crate::types::Pid;
use crate::types::TimeNs;

/// Everything needed to bring up a scheduler instance.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    pub topology: TopologySpec,
    pub tunables: SchedTunables,
    pub energy: Option<EnergyModel>,
    /// Exclusive cpuset partitions, as cpulists. Defaults to one partition
    /// of all active CPUs.
    pub partitions: Option<Vec<String>>,
    /// CPUs kept out of every scheduling domain.
    pub isolated: Option<String>,
    /// C-states offered to the idle governor, shallowest first.
    pub idle_states: Option<Vec<IdleState>>,
}

/// Observable transitions, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedEvent {
    Switch { cpu: CpuId, prev: Pid, next: Pid, prev_state: TaskState },
    Woken { pid: Pid, cpu: CpuId },
    Migrated { pid: Pid, from: CpuId, to: CpuId },
    Throttled { cpu: CpuId, group: GroupId },
    Unthrottled { cpu: CpuId, group: GroupId },
    RtThrottled { cpu: CpuId },
    RtUnthrottled { cpu: CpuId },
    DlThrottled { pid: Pid },
    DlReplenished { pid: Pid },
    Balanced { cpu: CpuId, src: CpuId, moved: u32, idle: CpuIdleType },
    ActiveBalance { src: CpuId, dst: CpuId, pid: Option<Pid> },
    CpuOnline { cpu: CpuId },
    CpuOffline { cpu: CpuId },
    DomainsRebuilt { generation: u64 },
}

/// Inter-processor interrupts the core asks the driver to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ipi {
    /// Re-evaluate the running task.
    Resched,
    /// Finish remote wakeups queued on the target's wake list.
    WakeList,
    /// Continue the RT push chain.
    RtPush,
    /// Run idle balance on behalf of tickless CPUs.
    NohzKick,
}

pub struct Sched {
    /// Global monotonic time, ns.
    pub now: TimeNs,
    pub jiffies: u64,
    /// CPU the current operation runs on.
    pub this_cpu: CpuId,

    /// Tunables as configured, before CPU-count scaling.
    pub base_tunables: SchedTunables,
    pub tunables: SchedTunables,
    pub topo: Topology,
    pub energy: Option<EnergyModel>,
    pub partitions: Option<Vec<Cpumask>>,
    pub isolated: Cpumask,

    pub tasks: TaskTable,
    pub groups: GroupTable,
    pub rqs: Vec<Rq>,
    pub domains: Arc<DomainTree>,
    pub active: Cpumask,
    pub online: Cpumask,

    pub timers: TimerWheel,
    pub rcu: RcuQueue,
    pub nohz: NohzState,
    pub loadavg: LoadAvg,

    pub cpufreq: Option<Box<dyn CpufreqHook>>,
    pub idle_gov: Box<dyn IdleGovernor>,
    pub idle_states: Vec<IdleState>,
    pub monitor: Option<Box<dyn Monitor>>,

    /// Per-CPU RT runtime share as a deadline bandwidth cap, -1 unlimited.
    pub dl_bw_limit: i64,
    pub(crate) generation: u64,
    /// Suspended: rebuilds ignore the configured partitions.
    pub(crate) frozen: bool,
    events: Vec<SchedEvent>,
    ipis: VecDeque<(CpuId, Ipi)>,
}

impl std::fmt::Debug for Sched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sched")
            .field("now", &self.now)
            .field("nr_cpus", &self.rqs.len())
            .field("nr_tasks", &self.tasks.len())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Sched {
    pub fn new(config: SchedConfig) -> Result<Sched> {
        let topo = Topology::from_spec(&config.topology).context("Failed to build topology")?;
        let nr = topo.nr_cpus();
        config.tunables.validate().context("Invalid tunables")?;

        let partitions = match &config.partitions {
            Some(list) => {
                let mut v = vec![];
                for s in list {
                    v.push(Cpumask::from_cpulist(s, nr).with_context(|| format!("Invalid partition {s:?}"))?);
                }
                Some(v)
            }
            None => None,
        };
        let isolated = match &config.isolated {
            Some(s) => Cpumask::from_cpulist(s, nr).context("Invalid isolated cpulist")?,
            None => Cpumask::new(nr),
        };

        let mut tasks = TaskTable::new();
        let mut rqs = Vec::with_capacity(nr);
        for i in 0..nr {
            let cpu = CpuId(i as u32);
            let idle = new_helper(&mut tasks, cpu, nr, TaskKind::Idle);
            let stop = new_helper(&mut tasks, cpu, nr, TaskKind::Stop);
            let c = topo.cpu(i);
            rqs.push(Rq::new(cpu, c.capacity_orig(), c.max_freq_khz(), idle, stop));
        }

        let dl_bw_limit = match config.tunables.rt_runtime_ns() {
            Some(rt) => to_ratio(config.tunables.rt_period_ns(), rt) as i64,
            None => -1,
        };
        let tunables = config.tunables.clone().scale_for(nr);
        let mut idle_states = config.idle_states.clone().unwrap_or_else(IdleState::defaults);
        idle_states.sort_by_key(|s| s.target_residency_ns);

        let mut s = Sched {
            now: 0,
            jiffies: 0,
            this_cpu: CpuId(0),
            base_tunables: config.tunables,
            tunables,
            energy: config.energy,
            partitions,
            isolated,
            tasks,
            groups: GroupTable::new(),
            rqs,
            domains: Arc::new(DomainTree::empty(nr)),
            active: Cpumask::new(nr),
            online: Cpumask::new(nr),
            timers: TimerWheel::new(),
            rcu: RcuQueue::new(),
            nohz: NohzState::new(nr),
            loadavg: LoadAvg::default(),
            cpufreq: None,
            idle_gov: Box::new(ResidencyGovernor),
            idle_states,
            monitor: None,
            dl_bw_limit,
            generation: 0,
            frozen: false,
            events: vec![],
            ipis: VecDeque::new(),
            topo,
        };
        for i in 0..nr {
            let cpu = CpuId(i as u32);
            s.online.set_cpu(i);
            s.active.set_cpu(i);
            s.rqs[i].online = true;
            s.init_rt_bandwidth(cpu);
        }
        s.loadavg.init(s.tunables.hz);
        let window = s.loadavg.next_update();
        for rq in &mut s.rqs {
            rq.calc_load_update = window;
        }
        s.rebuild_sched_domains().context("Failed to build scheduling domains")?;
        s.update_sysctl_scaling();
        info!(nr_cpus = nr, "scheduler core initialized");
        Ok(s)
    }

    pub fn nr_cpus(&self) -> usize {
        self.rqs.len()
    }

    /// Make `cpu` the current CPU and advance the global clock to `now`.
    /// Time never moves backwards.
    pub fn enter(&mut self, cpu: CpuId, now: TimeNs) {
        self.this_cpu = cpu;
        if now > self.now {
            self.now = now;
        }
        let tick = self.tunables.tick_ns().max(1);
        self.jiffies = self.now / tick;
    }

    pub fn rq(&self, cpu: CpuId) -> &Rq {
        &self.rqs[cpu.idx()]
    }

    pub fn task(&self, p: Pid) -> Option<&Task> {
        self.tasks.get(p)
    }

    pub fn curr(&self, cpu: CpuId) -> Pid {
        self.rqs[cpu.idx()].curr
    }

    pub fn is_idle_cpu(&self, cpu: CpuId) -> bool {
        self.rqs[cpu.idx()].is_idle()
    }

    pub fn need_resched(&self, cpu: CpuId) -> bool {
        self.rqs[cpu.idx()].need_resched
    }

    /// Root domain of `cpu` in the current tree.
    pub fn rd(&self, cpu: CpuId) -> Arc<RootDomain> {
        self.domains.rd(cpu).clone()
    }

    pub(crate) fn emit(&mut self, ev: SchedEvent) {
        trace!(?ev, "event");
        self.events.push(ev);
    }

    pub fn drain_events(&mut self) -> Vec<SchedEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn send_ipi(&mut self, cpu: CpuId, ipi: Ipi) {
        if self.ipis.contains(&(cpu, ipi)) {
            return;
        }
        self.rqs[cpu.idx()].stats.nr_ipi += 1;
        self.ipis.push_back((cpu, ipi));
    }

    pub fn take_ipis(&mut self) -> Vec<(CpuId, Ipi)> {
        self.ipis.drain(..).collect()
    }

    /// Deliver an IPI on its target CPU.
    pub fn handle_ipi(&mut self, cpu: CpuId, ipi: Ipi) {
        self.this_cpu = cpu;
        match ipi {
            Ipi::Resched => {}
            Ipi::WakeList => self.sched_ttwu_pending(cpu),
            Ipi::RtPush => self.rto_push_irq_work(cpu),
            Ipi::NohzKick => self.nohz_csd_func(cpu),
        }
    }

    /// Re-derive the scaled granularity tunables for the online CPU count.
    pub(crate) fn update_sysctl_scaling(&mut self) {
        let n = self.online.weight().max(1);
        let hz = self.tunables.hz;
        let mut t = self.base_tunables.clone().scale_for(n);
        t.hz = hz;
        self.tunables = t;
    }

    /// Change tunables at runtime. Validated before anything changes.
    pub fn set_tunables(&mut self, tunables: SchedTunables) -> Result<()> {
        tunables.validate()?;
        let dl_bw_limit = match tunables.rt_runtime_ns() {
            Some(rt) => to_ratio(tunables.rt_period_ns(), rt) as i64,
            None => -1,
        };
        for rd in self.domains.root_domains() {
            rd.set_dl_bw_limit(dl_bw_limit).context("Deadline tasks would exceed the new RT runtime")?;
        }
        self.dl_bw_limit = dl_bw_limit;
        self.base_tunables = tunables;
        self.update_sysctl_scaling();
        for i in 0..self.rqs.len() {
            self.init_rt_bandwidth(CpuId(i as u32));
        }
        Ok(())
    }

    // ---- clocks ----

    pub fn update_rq_clock(&mut self, cpu: CpuId) {
        let now = self.now;
        let rq = &mut self.rqs[cpu.idx()];
        let idle = rq.curr == rq.idle;
        let (cap, fs) = (rq.cpu_capacity_orig, rq.freq_scale());
        rq.clock.update(now, cap, fs, idle);
    }

    // ---- accounting ----

    pub(crate) fn add_nr_running(&mut self, cpu: CpuId, n: u32) {
        let rq = &mut self.rqs[cpu.idx()];
        let prev = rq.nr_running;
        rq.nr_running += n;
        if prev < 2 && rq.nr_running >= 2 {
            self.rd(cpu).set_overload(true);
        }
        self.sched_update_tick_dependency(cpu);
    }

    pub(crate) fn sub_nr_running(&mut self, cpu: CpuId, n: u32) {
        let rq = &mut self.rqs[cpu.idx()];
        rq.nr_running = rq.nr_running.saturating_sub(n);
        self.sched_update_tick_dependency(cpu);
    }

    // ---- enqueue / dequeue ----

    pub(crate) fn enqueue_task(&mut self, cpu: CpuId, p: Pid, flags: EnqueueFlags) {
        if !flags.contains(EnqueueFlags::NOCLOCK) {
            self.update_rq_clock(cpu);
        }
        if !flags.contains(EnqueueFlags::RESTORE) {
            let now = self.rqs[cpu.idx()].clock.clock;
            let t = &mut self.tasks[p];
            if t.stats.sleep_start > 0 || t.stats.block_start > 0 {
                let start = t.stats.sleep_start.max(t.stats.block_start);
                if t.in_iowait {
                    t.stats.iowait_count += 1;
                    t.stats.iowait_sum += now.saturating_sub(start);
                }
                t.stats.sleep_start = 0;
                t.stats.block_start = 0;
            }
        }
        self.uclamp_rq_inc(cpu, p);
        let id = self.tasks[p].class;
        class(id).enqueue_task(self, cpu, p, flags);
    }

    pub(crate) fn dequeue_task(&mut self, cpu: CpuId, p: Pid, flags: DequeueFlags) {
        if !flags.contains(DequeueFlags::NOCLOCK) {
            self.update_rq_clock(cpu);
        }
        if !flags.contains(DequeueFlags::SAVE) {
            let now = self.rqs[cpu.idx()].clock.clock;
            let t = &mut self.tasks[p];
            if flags.contains(DequeueFlags::SLEEP) {
                if t.state.contains(TaskState::INTERRUPTIBLE) {
                    t.stats.sleep_start = now;
                } else if t.state.contains(TaskState::UNINTERRUPTIBLE) {
                    t.stats.block_start = now;
                }
            }
        }
        self.uclamp_rq_dec(cpu, p);
        let id = self.tasks[p].class;
        class(id).dequeue_task(self, cpu, p, flags);
    }

    pub fn activate_task(&mut self, cpu: CpuId, p: Pid, flags: EnqueueFlags) {
        self.enqueue_task(cpu, p, flags);
        self.tasks[p].on_rq = OnRq::Queued;
    }

    pub fn deactivate_task(&mut self, cpu: CpuId, p: Pid, flags: DequeueFlags) {
        self.tasks[p].on_rq = if flags.contains(DequeueFlags::SLEEP) {
            OnRq::NotQueued
        } else {
            OnRq::Migrating
        };
        self.dequeue_task(cpu, p, flags);
    }

    pub(crate) fn put_prev_task(&mut self, cpu: CpuId, p: Pid) {
        let id = self.tasks[p].class;
        class(id).put_prev_task(self, cpu, p);
    }

    pub(crate) fn set_next_task(&mut self, cpu: CpuId, p: Pid) {
        let id = self.tasks[p].class;
        class(id).set_next_task(self, cpu, p, false);
    }

    // ---- preemption ----

    /// Mark the running task of `cpu` for rescheduling, sending an IPI if
    /// the CPU is remote.
    pub fn resched_curr(&mut self, cpu: CpuId) {
        let rq = &mut self.rqs[cpu.idx()];
        if rq.need_resched {
            return;
        }
        rq.need_resched = true;
        if cpu != self.this_cpu {
            self.send_ipi(cpu, Ipi::Resched);
        }
    }

    pub(crate) fn check_preempt_curr(&mut self, cpu: CpuId, p: Pid, wf: WakeFlags) {
        let curr = self.rqs[cpu.idx()].curr;
        let (pc, cc) = (self.tasks[p].class, self.tasks[curr].class);
        if pc == cc {
            class(pc).check_preempt_curr(self, cpu, p, wf);
        } else if pc.above(cc) {
            self.resched_curr(cpu);
        }
        // A queued curr about to be preempted will be picked over; skip the
        // clock update until then.
        let rq = &mut self.rqs[cpu.idx()];
        if rq.need_resched && self.tasks[curr].is_queued() {
            rq.clock.skip_update();
        }
    }

    // ---- migration ----

    /// Move a task's accounting to `new_cpu`. The task must not be queued.
    pub(crate) fn set_task_cpu(&mut self, p: Pid, new_cpu: CpuId) {
        let old = self.tasks[p].cpu;
        if old == new_cpu {
            return;
        }
        let id = self.tasks[p].class;
        class(id).migrate_task_rq(self, p, new_cpu);
        let t = &mut self.tasks[p];
        t.se.nr_migrations += 1;
        t.stats.nr_migrations += 1;
        t.cpu = new_cpu;
        t.wake_cpu = new_cpu;
        self.emit(SchedEvent::Migrated { pid: p, from: old, to: new_cpu });
    }

    /// Move a queued, not running task between runqueues.
    pub(crate) fn move_queued_task(&mut self, src: CpuId, p: Pid, dst: CpuId) {
        self.update_rq_clock(src);
        self.deactivate_task(src, p, DequeueFlags::NOCLOCK);
        self.notify_migrating(p);
        self.set_task_cpu(p, dst);
        self.update_rq_clock(dst);
        self.activate_task(dst, p, EnqueueFlags::NOCLOCK);
        self.check_preempt_curr(dst, p, WakeFlags::empty());
    }

    pub(crate) fn is_cpu_allowed(&self, p: Pid, cpu: CpuId) -> bool {
        let t = &self.tasks[p];
        if !t.cpus_allowed.has(cpu) {
            return false;
        }
        if t.migration_disabled > 0 || t.kind != TaskKind::Normal {
            return self.online.has(cpu);
        }
        self.active.has(cpu)
    }

    /// Pick an allowed CPU for `p` when `cpu` cannot take it: same node
    /// first, then anywhere in its mask.
    pub(crate) fn select_fallback_rq(&mut self, cpu: CpuId, p: Pid) -> CpuId {
        let node = self.topo.node_of(cpu.idx());
        let candidates: Vec<usize> = self.tasks[p].cpus_allowed.and(&self.active).iter().collect();
        if let Some(&c) = candidates.iter().find(|&&c| self.topo.node_of(c) == node && c != cpu.idx()) {
            return CpuId(c as u32);
        }
        if let Some(&c) = candidates.iter().find(|&&c| c != cpu.idx()) {
            return CpuId(c as u32);
        }
        if let Some(&c) = candidates.first() {
            return CpuId(c as u32);
        }
        // Nothing left in the mask: widen it to every active CPU.
        let full = self.active.clone();
        tracing::warn!(pid = self.tasks[p].pid.0, cpu = cpu.0, "task no longer affine to its CPUs");
        self.tasks[p].cpus_allowed = full.clone();
        self.tasks[p].user_cpus = None;
        full.first().map_or(cpu, |c| CpuId(c as u32))
    }

    /// Class pick for a task being woken or forked, kept within affinity.
    pub(crate) fn select_task_rq(&mut self, p: Pid, cpu: CpuId, wf: WakeFlags) -> CpuId {
        let t = &self.tasks[p];
        let mut cpu = cpu;
        if t.nr_cpus_allowed() > 1 && t.migration_disabled == 0 {
            let id = t.class;
            cpu = class(id).select_task_rq(self, p, cpu, wf);
        } else if let Some(c) = t.cpus_allowed.first() {
            if !t.cpus_allowed.has(cpu) {
                cpu = CpuId(c as u32);
            }
        }
        if !self.is_cpu_allowed(p, cpu) {
            cpu = self.select_fallback_rq(cpu, p);
        }
        cpu
    }

    // ---- picking ----

    /// Choose the next task for `cpu`. `prev` is still current and has
    /// not been put yet.
    pub(crate) fn pick_next_task(&mut self, cpu: CpuId, prev: Pid) -> Pid {
        let prev_class = self.tasks[prev].class;
        self.put_prev_task_balance(cpu, prev);

        // Fast path: only fair tasks are runnable.
        let rq = &self.rqs[cpu.idx()];
        if !prev_class.above(ClassId::Fair) && rq.nr_running == rq.cfs_h_nr_running() {
            if let Some(p) = class(ClassId::Fair).pick_next_task(self, cpu) {
                return p;
            }
        }
        self.pick_next_task_slow(cpu)
    }

    /// Let classes from `prev`'s down pull work before `prev` is put.
    fn put_prev_task_balance(&mut self, cpu: CpuId, prev: Pid) {
        let prev_class = self.tasks[prev].class;
        for id in ClassId::ALL {
            if id.above(prev_class) || id == ClassId::Idle {
                continue;
            }
            if class(id).balance(self, cpu, prev) {
                break;
            }
        }
        self.put_prev_task(cpu, prev);
    }

    fn pick_next_task_slow(&mut self, cpu: CpuId) -> Pid {
        for id in ClassId::ALL {
            if let Some(p) = class(id).pick_next_task(self, cpu) {
                return p;
            }
        }
        // The idle class always returns its task.
        self.rqs[cpu.idx()].idle
    }

    // ---- schedule ----

    /// Switch `cpu` away from its current task if it is blocking or a
    /// reschedule is pending. Returns the task now running.
    pub fn schedule(&mut self, cpu: CpuId) -> Pid {
        self.this_cpu = cpu;
        self.__schedule(cpu, false)
    }

    /// Preemption point: reschedule only if one is pending.
    pub fn preempt_check(&mut self, cpu: CpuId) -> Pid {
        self.this_cpu = cpu;
        if self.rqs[cpu.idx()].need_resched {
            return self.__schedule(cpu, true);
        }
        self.rqs[cpu.idx()].curr
    }

    fn __schedule(&mut self, cpu: CpuId, preempt: bool) -> Pid {
        let prev = self.rqs[cpu.idx()].curr;
        self.rqs[cpu.idx()].clock.pin();
        self.update_rq_clock(cpu);
        self.rqs[cpu.idx()].stats.sched_count += 1;

        let prev_state = self.tasks[prev].state;
        let blocking = !preempt && !prev_state.is_running() && self.tasks[prev].kind != TaskKind::Idle;
        if blocking && self.tasks[prev].is_queued() {
            let contributes = prev_state.contributes_to_load();
            self.tasks[prev].sched_contributes_to_load = contributes;
            if contributes {
                self.rqs[cpu.idx()].nr_uninterruptible += 1;
            }
            if self.tasks[prev].in_iowait {
                self.rqs[cpu.idx()].nr_iowait += 1;
            }
            self.deactivate_task(cpu, prev, DequeueFlags::SLEEP | DequeueFlags::NOCLOCK);
        }

        let next = self.pick_next_task(cpu, prev);
        self.rqs[cpu.idx()].need_resched = false;
        self.rqs[cpu.idx()].clock.unpin();

        if next != prev {
            let rq = &mut self.rqs[cpu.idx()];
            rq.nr_switches += 1;
            rq.stats.nr_switches += 1;
            rq.stats.pcount += 1;
            if next == rq.idle {
                rq.stats.sched_goidle += 1;
            }
            rq.curr = next;
            if blocking {
                self.tasks[prev].stats.nr_voluntary_switches += 1;
            } else {
                self.tasks[prev].stats.nr_involuntary_switches += 1;
            }
            self.tasks[prev].on_cpu = false;
            self.tasks[next].on_cpu = true;
            self.emit(SchedEvent::Switch { cpu, prev, next, prev_state });
            debug!(cpu = cpu.0, prev = prev.0, next = next.0, "switch");
            self.finish_task_switch(cpu, prev, next);
        }
        self.run_balance_callbacks(cpu);
        self.notify_after_pick(cpu);

        // The stop task runs its queued work to completion right away.
        if self.rqs[cpu.idx()].curr == self.rqs[cpu.idx()].stop {
            self.run_stop_work(cpu);
            return self.__schedule(cpu, false);
        }
        self.rqs[cpu.idx()].curr
    }

    fn finish_task_switch(&mut self, cpu: CpuId, prev: Pid, next: Pid) {
        let idle = self.rqs[cpu.idx()].idle;
        if next == idle {
            self.idle_enter(cpu);
        } else if prev == idle {
            self.idle_exit(cpu);
        }
        if self.tasks[prev].is_dead() {
            let id = self.tasks[prev].class;
            class(id).task_dead(self, prev);
            self.release_dead_task(prev);
        }
    }

    pub(crate) fn run_balance_callbacks(&mut self, cpu: CpuId) {
        let cbs = std::mem::take(&mut self.rqs[cpu.idx()].balance_callbacks);
        for cb in cbs {
            self.run_balance_callback(cpu, cb);
        }
    }

    fn run_balance_callback(&mut self, cpu: CpuId, cb: BalanceCallback) {
        if !self.rqs[cpu.idx()].online {
            return;
        }
        self.update_rq_clock(cpu);
        match cb {
            BalanceCallback::PushRt => self.push_rt_tasks(cpu),
            BalanceCallback::PullRt => self.pull_rt_task(cpu),
            BalanceCallback::PushDl => self.push_dl_tasks(cpu),
            BalanceCallback::PullDl => self.pull_dl_task(cpu),
        }
    }

    // ---- tick ----

    /// Periodic scheduler tick on `cpu`.
    pub fn scheduler_tick(&mut self, cpu: CpuId) {
        self.this_cpu = cpu;
        self.update_rq_clock(cpu);
        self.update_thermal_load_avg(cpu);
        let curr = self.rqs[cpu.idx()].curr;
        let id = self.tasks[curr].class;
        class(id).task_tick(self, cpu, curr, false);
        self.calc_global_load_tick(cpu);
        if cpu == self.tick_cpu() {
            self.calc_global_load();
        }
        let idle = self.is_idle_cpu(cpu);
        self.rqs[cpu.idx()].nohz.idle_balance = idle;
        self.trigger_load_balance(cpu);
        self.notify_after_tick(cpu);
    }

    /// CPU that owns global timekeeping duties.
    pub fn tick_cpu(&self) -> CpuId {
        self.online.first().map_or(CpuId(0), |c| CpuId(c as u32))
    }

    // ---- timers ----

    /// Fire every timer due at or before the current time. Returns how many
    /// ran.
    pub fn run_timers(&mut self) -> usize {
        let mut n = 0;
        while let Some((expires, pin, event)) = self.timers.pop_expired(self.now) {
            if let Some(cpu) = pin {
                self.this_cpu = cpu;
            }
            trace!(?event, expires, "timer");
            self.fire_timer(event, expires);
            n += 1;
        }
        n
    }

    fn fire_timer(&mut self, event: TimerEvent, expires: TimeNs) {
        match event {
            TimerEvent::CfsPeriod(g) => self.cfs_period_timer(g, expires),
            TimerEvent::CfsSlack(g) => self.cfs_slack_timer(g),
            TimerEvent::RtPeriod(cpu) => self.rt_period_timer(cpu),
            TimerEvent::DlReplenish(p) => self.dl_task_timer(p),
            TimerEvent::DlInactive(p) => self.inactive_task_timer(p),
            TimerEvent::HrTick(cpu) => self.hrtick(cpu),
            TimerEvent::ActiveBalanceTimeout(cpu) => self.active_balance_timeout(cpu),
        }
    }

    /// High-resolution preemption tick.
    fn hrtick(&mut self, cpu: CpuId) {
        self.rqs[cpu.idx()].hrtick_timer = None;
        self.rqs[cpu.idx()].stats.nr_hrtick += 1;
        self.update_rq_clock(cpu);
        let curr = self.rqs[cpu.idx()].curr;
        let id = self.tasks[curr].class;
        class(id).task_tick(self, cpu, curr, true);
    }

    /// Earliest time the core needs the driver to call back.
    pub fn next_timer(&self) -> Option<TimeNs> {
        self.timers.next_expiry()
    }
}

fn new_helper(tasks: &mut TaskTable, cpu: CpuId, nr: usize, kind: TaskKind) -> Pid {
    let pid = tasks.alloc_pid();
    let name = match kind {
        TaskKind::Idle => format!("swapper/{}", cpu.0),
        _ => format!("migration/{}", cpu.0),
    };
    let mut t = Task::new(pid, &name, nr);
    t.kind = kind;
    t.cpu = cpu;
    t.wake_cpu = cpu;
    t.cpus_allowed = Cpumask::from_cpus(nr, [cpu.idx()]);
    t.class = ClassId::for_task(kind, t.prio);
    match kind {
        TaskKind::Idle => {
            t.state = TaskState::RUNNING;
            t.on_cpu = true;
            t.on_rq = OnRq::Queued;
        }
        _ => {
            t.state = TaskState::INTERRUPTIBLE;
            t.prio = 0;
            t.policy = crate::prio::Policy::Stop;
        }
    }
    tasks.insert(t);
    pid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setsched::SchedAttr;
    use crate::types::Vtime;

    fn fair_aggregates(s: &Sched, cpu: CpuId) -> (u32, u32, u32, u64, Vtime, u64, u64, usize) {
        let rq = s.rq(cpu);
        let cfs = rq.cfs();
        (
            rq.nr_running,
            cfs.nr_running,
            cfs.h_nr_running,
            cfs.load.weight,
            cfs.min_vruntime,
            cfs.avg.load_avg,
            cfs.avg.util_avg,
            rq.cfs_tasks.len(),
        )
    }

    /// Two fair tasks on cpu0, the first one running.
    fn two_tasks(nr_cpus: usize) -> (Sched, Pid, Pid) {
        let config = SchedConfig { topology: TopologySpec::flat(nr_cpus), ..Default::default() };
        let mut s = Sched::new(config).unwrap();
        let cpu0 = Cpumask::from_cpulist("0", nr_cpus).unwrap();
        s.enter(CpuId(0), 1_000);
        let a = s.spawn("a", &SchedAttr::normal(0), GroupId::ROOT, Some(&cpu0)).unwrap();
        let b = s.spawn("b", &SchedAttr::normal(0), GroupId::ROOT, Some(&cpu0)).unwrap();
        s.schedule(CpuId(0));
        s.enter(CpuId(0), 2_000_000);
        s.scheduler_tick(CpuId(0));
        (s, a, b)
    }

    #[test]
    fn save_restore_leaves_aggregates_alone() {
        let (mut s, a, b) = two_tasks(1);
        let curr = s.curr(CpuId(0));
        let queued = if curr == a { b } else { a };
        let before = fair_aggregates(&s, CpuId(0));
        let vruntime = s.tasks[queued].se.vruntime;

        s.dequeue_task(CpuId(0), queued, DequeueFlags::SAVE | DequeueFlags::NOCLOCK);
        assert_eq!(s.rq(CpuId(0)).nr_running, before.0 - 1);
        s.enqueue_task(CpuId(0), queued, EnqueueFlags::RESTORE | EnqueueFlags::NOCLOCK);

        assert_eq!(fair_aggregates(&s, CpuId(0)), before);
        assert_eq!(s.tasks[queued].se.vruntime, vruntime);
        assert!(crate::monitor::check_invariants(&s).is_empty());
    }

    #[test]
    fn migrate_there_and_back_keeps_relative_vruntime() {
        let (mut s, a, b) = two_tasks(2);
        s.set_cpus_allowed(a, &Cpumask::from_cpulist("0-1", 2).unwrap()).unwrap();
        s.set_cpus_allowed(b, &Cpumask::from_cpulist("0-1", 2).unwrap()).unwrap();
        let curr = s.curr(CpuId(0));
        let queued = if curr == a { b } else { a };
        assert_eq!(s.tasks[queued].cpu, CpuId(0));
        let lag = |s: &Sched, cpu: CpuId| {
            let min = s.rq(cpu).cfs().min_vruntime;
            s.tasks[queued].se.vruntime.0.wrapping_sub(min.0) as i64
        };
        let before = lag(&s, CpuId(0));

        s.move_queued_task(CpuId(0), queued, CpuId(1));
        assert_eq!(s.tasks[queued].cpu, CpuId(1));
        assert_eq!(lag(&s, CpuId(1)), before);
        s.move_queued_task(CpuId(1), queued, CpuId(0));

        assert_eq!(s.tasks[queued].cpu, CpuId(0));
        assert_eq!(lag(&s, CpuId(0)), before);
        assert_eq!(s.rq(CpuId(1)).nr_running, 0);
        assert_eq!(s.rq(CpuId(0)).cfs().h_nr_running, 2);
    }
}
