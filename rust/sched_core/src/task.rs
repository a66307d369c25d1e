// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Tasks and their per-class scheduling entities.

use std::collections::BTreeMap;
use std::ops::Index;
use std::ops::IndexMut;

use bitflags::bitflags;

use crate::class::ClassId;
use crate::cpumask::Cpumask;
use crate::pelt::SchedAvg;
use crate::prio::LoadWeight;
use crate::prio::Policy;
use crate::prio::DEFAULT_PRIO;
use crate::stats::TaskStats;
use crate::timer::TimerHandle;
use crate::types::CpuId;
use crate::types::EntityRef;
use crate::types::GroupId;
use crate::types::Pid;
use crate::types::TimeNs;
use crate::types::Vtime;
use crate::uclamp::UclampId;
use crate::uclamp::UclampSe;
use crate::uclamp::UCLAMP_CNT;

bitflags! {
    /// Task run state. The empty set is "running or runnable".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TaskState: u32 {
        const INTERRUPTIBLE = 0x0001;
        const UNINTERRUPTIBLE = 0x0002;
        const STOPPED = 0x0004;
        const TRACED = 0x0008;
        const PARKED = 0x0040;
        const DEAD = 0x0080;
        const WAKEKILL = 0x0100;
        /// Transient: selected for wakeup, not yet queued.
        const WAKING = 0x0200;
        const NOLOAD = 0x0400;
        const NEW = 0x0800;

        const IDLE = Self::UNINTERRUPTIBLE.bits() | Self::NOLOAD.bits();
        const NORMAL = Self::INTERRUPTIBLE.bits() | Self::UNINTERRUPTIBLE.bits();
    }
}

impl TaskState {
    pub const RUNNING: TaskState = TaskState::empty();

    pub fn is_running(self) -> bool {
        self.is_empty()
    }

    /// Sleeping in a state that counts towards the load average.
    pub fn contributes_to_load(self) -> bool {
        self.contains(TaskState::UNINTERRUPTIBLE) && !self.contains(TaskState::NOLOAD)
    }

    pub fn name(self) -> &'static str {
        if self.is_running() {
            "R"
        } else if self.contains(TaskState::DEAD) {
            "X"
        } else if self.contains(TaskState::NEW) {
            "N"
        } else if self.contains(TaskState::PARKED) {
            "P"
        } else if self.contains(TaskState::TRACED) {
            "t"
        } else if self.contains(TaskState::STOPPED) {
            "T"
        } else if self.contains(TaskState::IDLE) {
            "I"
        } else if self.contains(TaskState::UNINTERRUPTIBLE) {
            "D"
        } else {
            "S"
        }
    }
}

/// Where a task sits with respect to runqueues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OnRq {
    #[default]
    NotQueued,
    Queued,
    /// Between the source dequeue and the destination enqueue.
    Migrating,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnqueueFlags: u32 {
        const WAKEUP = 0x01;
        const RESTORE = 0x02;
        const MOVE = 0x04;
        const NOCLOCK = 0x08;
        const HEAD = 0x10;
        const REPLENISH = 0x20;
        const MIGRATED = 0x40;
        const INITIAL = 0x80;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DequeueFlags: u32 {
        const SLEEP = 0x01;
        const SAVE = 0x02;
        const MOVE = 0x04;
        const NOCLOCK = 0x08;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WakeFlags: u32 {
        const EXEC = 0x02;
        const FORK = 0x04;
        const TTWU = 0x08;
        const SYNC = 0x10;
        const MIGRATED = 0x20;
        const ON_CPU = 0x40;
    }
}

/// What a task is to the core: an ordinary task or one of the per-CPU
/// helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskKind {
    #[default]
    Normal,
    Idle,
    Stop,
}

/// Fair scheduling entity. Tasks embed one; group entities live per CPU in
/// the runqueue.
#[derive(Debug, Clone, Default)]
pub struct SchedEntity {
    pub load: LoadWeight,
    /// Runnable children of a group entity; 1 for tasks.
    pub runnable_weight: u64,
    pub on_rq: bool,
    pub exec_start: TimeNs,
    pub sum_exec_runtime: u64,
    pub prev_sum_exec_runtime: u64,
    pub vruntime: Vtime,
    pub nr_migrations: u64,
    /// PELT averages are folded into the runqueue it is queued on.
    pub attached: bool,
    pub depth: u32,
    /// Group whose fair runqueue this entity is queued on.
    pub cfs_rq: GroupId,
    /// Group this entity stands for; `None` for tasks.
    pub my_q: Option<GroupId>,
    pub avg: SchedAvg,
}

impl SchedEntity {
    pub fn new_task(weight: LoadWeight, group: GroupId, depth: u32) -> Self {
        Self {
            load: weight,
            runnable_weight: 1,
            cfs_rq: group,
            depth,
            ..Default::default()
        }
    }

    /// Entity one level up, if the entity is not queued on the root.
    pub fn parent(&self) -> Option<EntityRef> {
        if self.cfs_rq.is_root() {
            None
        } else {
            Some(EntityRef::Group(self.cfs_rq))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RtEntity {
    pub on_rq: bool,
    pub on_list: bool,
    /// Remaining round-robin slice, ns.
    pub time_slice: u64,
    /// Ticks spent running since last sleep.
    pub timeout: u64,
    pub watchdog_stamp: u64,
}

/// Configured deadline parameters, nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct DlParams {
    pub runtime: u64,
    pub deadline: u64,
    pub period: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DlEntity {
    pub dl_runtime: u64,
    pub dl_deadline: u64,
    pub dl_period: u64,
    /// runtime / period, 20-bit fixed point.
    pub dl_bw: u64,
    /// runtime / deadline, 20-bit fixed point.
    pub dl_density: u64,
    pub runtime: i64,
    pub deadline: u64,
    pub dl_throttled: bool,
    pub dl_yielded: bool,
    pub dl_non_contending: bool,
    pub dl_overrun: bool,
    /// Notify on overrun instead of only throttling.
    pub dl_overrun_signal: bool,
    pub dl_boosted: bool,
    pub on_rq: bool,
    pub timer: Option<TimerHandle>,
    pub inactive_timer: Option<TimerHandle>,
    /// Task whose deadline parameters this one runs with while boosted.
    pub pi_donor: Option<Pid>,
}

impl DlEntity {
    pub fn params(&self) -> DlParams {
        DlParams {
            runtime: self.dl_runtime,
            deadline: self.dl_deadline,
            period: self.dl_period,
        }
    }
}

/// NUMA balancing counters; the placement heuristics themselves live
/// outside the core.
#[derive(Debug, Clone, Default)]
pub struct NumaCounters {
    pub preferred_nid: Option<usize>,
    pub numa_scan_seq: u32,
    pub total_numa_faults: u64,
    pub numa_pages_migrated: u64,
    pub numa_migrate_retry: TimeNs,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub pid: Pid,
    pub comm: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub on_rq: OnRq,
    pub on_cpu: bool,
    pub cpu: CpuId,
    pub wake_cpu: CpuId,
    pub recent_used_cpu: CpuId,

    pub policy: Policy,
    pub static_prio: i32,
    pub normal_prio: i32,
    pub prio: i32,
    pub rt_priority: u32,
    pub reset_on_fork: bool,
    pub class: ClassId,

    pub cpus_allowed: Cpumask,
    /// Mask requested by the user, kept across temporary restrictions.
    pub user_cpus: Option<Cpumask>,
    pub migration_disabled: u32,
    /// A migration was requested while migration was disabled.
    pub migration_pending: bool,

    pub group: GroupId,
    pub se: SchedEntity,
    pub rt: RtEntity,
    pub dl: DlEntity,

    pub uclamp_req: [UclampSe; UCLAMP_CNT],
    pub uclamp: [UclampSe; UCLAMP_CNT],

    pub last_wakee: Option<Pid>,
    pub wakee_flips: u32,
    pub wakee_flip_decay_ts: u64,
    pub last_waker: Option<Pid>,

    pub sched_contributes_to_load: bool,
    pub in_iowait: bool,
    pub sched_remote_wakeup: bool,
    /// Top waiter donating priority through a PI chain.
    pub pi_top_task: Option<Pid>,

    pub stats: TaskStats,
    pub numa: NumaCounters,
}

impl Task {
    pub fn new(pid: Pid, comm: &str, nr_cpus: usize) -> Self {
        Self {
            pid,
            comm: comm.to_string(),
            kind: TaskKind::Normal,
            state: TaskState::NEW,
            on_rq: OnRq::NotQueued,
            on_cpu: false,
            cpu: CpuId(0),
            wake_cpu: CpuId(0),
            recent_used_cpu: CpuId(0),
            policy: Policy::Normal,
            static_prio: DEFAULT_PRIO,
            normal_prio: DEFAULT_PRIO,
            prio: DEFAULT_PRIO,
            rt_priority: 0,
            reset_on_fork: false,
            class: ClassId::Fair,
            cpus_allowed: Cpumask::full(nr_cpus),
            user_cpus: None,
            migration_disabled: 0,
            migration_pending: false,
            group: GroupId::ROOT,
            se: SchedEntity::new_task(LoadWeight::for_prio(Policy::Normal, DEFAULT_PRIO), GroupId::ROOT, 0),
            rt: RtEntity::default(),
            dl: DlEntity::default(),
            uclamp_req: [UclampSe::none(UclampId::Min), UclampSe::none(UclampId::Max)],
            uclamp: [UclampSe::none(UclampId::Min), UclampSe::none(UclampId::Max)],
            last_wakee: None,
            wakee_flips: 0,
            wakee_flip_decay_ts: 0,
            last_waker: None,
            sched_contributes_to_load: false,
            in_iowait: false,
            sched_remote_wakeup: false,
            pi_top_task: None,
            stats: TaskStats::default(),
            numa: NumaCounters::default(),
        }
    }

    pub fn nr_cpus_allowed(&self) -> usize {
        self.cpus_allowed.weight()
    }

    pub fn is_queued(&self) -> bool {
        self.on_rq == OnRq::Queued
    }

    pub fn is_migrating(&self) -> bool {
        self.on_rq == OnRq::Migrating
    }

    pub fn is_idle_task(&self) -> bool {
        self.kind == TaskKind::Idle
    }

    pub fn is_dead(&self) -> bool {
        self.state.contains(TaskState::DEAD)
    }

    pub fn nice(&self) -> i32 {
        crate::prio::prio_to_nice(self.static_prio)
    }

    /// Allowed to change CPU right now.
    pub fn can_migrate(&self) -> bool {
        self.migration_disabled == 0 && self.kind == TaskKind::Normal
    }

    /// Pinned to a single CPU, by mask or by migrate-disable.
    pub fn is_per_cpu(&self) -> bool {
        self.nr_cpus_allowed() == 1 || self.migration_disabled > 0
    }
}

/// Every task known to the core, by pid.
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: BTreeMap<Pid, Task>,
    next_pid: i32,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            next_pid: 1,
        }
    }

    pub fn alloc_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    pub fn insert(&mut self, task: Task) {
        self.tasks.insert(task.pid, task);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Task> {
        self.tasks.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Task> {
        self.tasks.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.tasks.contains_key(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.tasks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Index<Pid> for TaskTable {
    type Output = Task;

    fn index(&self, pid: Pid) -> &Task {
        match self.tasks.get(&pid) {
            Some(t) => t,
            None => panic!("no task {pid}"),
        }
    }
}

impl IndexMut<Pid> for TaskTable {
    fn index_mut(&mut self, pid: Pid) -> &mut Task {
        match self.tasks.get_mut(&pid) {
            Some(t) => t,
            None => panic!("no task {pid}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(TaskState::RUNNING.name(), "R");
        assert_eq!(TaskState::INTERRUPTIBLE.name(), "S");
        assert_eq!(TaskState::UNINTERRUPTIBLE.name(), "D");
        assert_eq!(TaskState::IDLE.name(), "I");
        assert!(TaskState::UNINTERRUPTIBLE.contributes_to_load());
        assert!(!TaskState::IDLE.contributes_to_load());
    }

    #[test]
    fn table_allocates_increasing_pids() {
        let mut t = TaskTable::new();
        let a = t.alloc_pid();
        let b = t.alloc_pid();
        assert!(b > a);
        t.insert(Task::new(a, "a", 4));
        assert_eq!(t[a].comm, "a");
        t[a].rt_priority = 5;
        assert_eq!(t.get(a).map(|t| t.rt_priority), Some(5));
        assert!(t.get(b).is_none());
    }

    #[test]
    fn entity_parent() {
        let se = SchedEntity::new_task(LoadWeight::new(1024), GroupId(3), 1);
        assert_eq!(se.parent(), Some(EntityRef::Group(GroupId(3))));
        let se = SchedEntity::new_task(LoadWeight::new(1024), GroupId::ROOT, 0);
        assert_eq!(se.parent(), None);
    }
}
