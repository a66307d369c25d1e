// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Task groups
//!
//! Groups form a tree under the root group. Each non-root group owns, on
//! every CPU, a fair runqueue for its members and a group entity queued on
//! its parent's runqueue. Group entities are weighted by the group's
//! shares split across CPUs in proportion to per-CPU load.

use std::collections::BTreeMap;
use std::ops::Index;
use std::sync::atomic::AtomicI64;

use tracing::debug;
use tracing::info;

use crate::cfs_bandwidth::CfsBandwidth;
use crate::core::Sched;
use crate::error::SchedError;
use crate::error::SchedResult;
use crate::fair::CfsRq;
use crate::fair_load::UpdateFlags;
use crate::prio::LoadWeight;
use crate::prio::MAX_SHARES;
use crate::prio::MIN_SHARES;
use crate::prio::NICE_0_LOAD;
use crate::prio::WEIGHT_IDLEPRIO;
use crate::rcu::Retired;
use crate::task::DequeueFlags;
use crate::task::EnqueueFlags;
use crate::task::SchedEntity;
use crate::types::CpuId;
use crate::types::EntityRef;
use crate::types::GroupId;
use crate::types::Pid;
use crate::uclamp::UclampId;
use crate::uclamp::UclampSe;
use crate::uclamp::UCLAMP_CNT;

#[derive(Debug)]
pub struct TaskGroup {
    pub id: GroupId,
    pub name: String,
    pub parent: Option<GroupId>,
    pub children: Vec<GroupId>,
    pub shares: u64,
    /// Sum of the per-CPU contributions published by
    /// `update_tg_load_avg`.
    pub load_avg: AtomicI64,
    /// Depth of this group's entities; 0 directly under the root.
    pub se_depth: u32,
    /// Members are treated as idle-policy by the fair class.
    pub idle: bool,
    pub uclamp_req: [UclampSe; UCLAMP_CNT],
    /// Requests restricted by the ancestors' effective values.
    pub uclamp: [UclampSe; UCLAMP_CNT],
    pub cfs_b: CfsBandwidth,
}

impl TaskGroup {
    fn new(id: GroupId, name: &str, parent: Option<GroupId>, se_depth: u32) -> Self {
        let none = [UclampSe::none(UclampId::Min), UclampSe::none(UclampId::Max)];
        Self {
            id,
            name: name.to_string(),
            parent,
            children: vec![],
            shares: NICE_0_LOAD,
            load_avg: AtomicI64::new(0),
            se_depth,
            idle: false,
            uclamp_req: none,
            uclamp: none,
            cfs_b: CfsBandwidth::default(),
        }
    }
}

/// Every group, the root included, by id.
#[derive(Debug)]
pub struct GroupTable {
    groups: BTreeMap<GroupId, TaskGroup>,
    next_id: u32,
}

impl Default for GroupTable {
    fn default() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(GroupId::ROOT, TaskGroup::new(GroupId::ROOT, "/", None, 0));
        Self { groups, next_id: 1 }
    }
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, g: GroupId) -> Option<&TaskGroup> {
        self.groups.get(&g)
    }

    pub fn get_mut(&mut self, g: GroupId) -> Option<&mut TaskGroup> {
        self.groups.get_mut(&g)
    }

    pub fn contains(&self, g: GroupId) -> bool {
        self.groups.contains_key(&g)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskGroup> {
        self.groups.values()
    }

    pub fn ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    pub fn by_name(&self, name: &str) -> Option<GroupId> {
        self.groups.values().find(|tg| tg.name == name).map(|tg| tg.id)
    }

    /// `g` and all its descendants, parents before children.
    pub fn subtree(&self, g: GroupId) -> Vec<GroupId> {
        let mut out = vec![];
        let mut stack = vec![g];
        while let Some(x) = stack.pop() {
            if let Some(tg) = self.groups.get(&x) {
                out.push(x);
                stack.extend(tg.children.iter().rev().copied());
            }
        }
        out
    }

    fn alloc_id(&mut self) -> GroupId {
        let id = GroupId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl Index<GroupId> for GroupTable {
    type Output = TaskGroup;

    fn index(&self, g: GroupId) -> &TaskGroup {
        match self.groups.get(&g) {
            Some(tg) => tg,
            None => panic!("no task group {g}"),
        }
    }
}

impl Sched {
    /// Create a group under `parent` with per-CPU runqueues and entities.
    pub fn create_group(&mut self, parent: GroupId, name: &str) -> SchedResult<GroupId> {
        let Some(ptg) = self.groups.get(parent) else {
            return Err(SchedError::NoSuchGroup(parent));
        };
        if name.is_empty() || self.groups.by_name(name).is_some() {
            return Err(SchedError::GroupConfigInvalid("group name empty or taken"));
        }
        let se_depth = if parent.is_root() { 0 } else { ptg.se_depth + 1 };
        let hierarchical_quota = ptg.cfs_b.hierarchical_quota;
        let g = self.groups.alloc_id();
        let mut tg = TaskGroup::new(g, name, Some(parent), se_depth);
        tg.cfs_b.hierarchical_quota = hierarchical_quota;
        self.groups.groups.insert(g, tg);
        if let Some(ptg) = self.groups.get_mut(parent) {
            ptg.children.push(g);
        }

        for i in 0..self.rqs.len() {
            let cpu = CpuId(i as u32);
            let mut cfs = CfsRq::new(g);
            // Inherit the throttle state of the parent on this CPU.
            let (pcount, pelt) = (self.cfs_rq(cpu, parent).throttle_count, self.rqs[i].clock.pelt());
            cfs.throttle_count = pcount;
            cfs.throttled_clock_pelt = pelt;
            let se = SchedEntity {
                load: LoadWeight::new(NICE_0_LOAD),
                runnable_weight: 0,
                cfs_rq: parent,
                my_q: Some(g),
                depth: se_depth,
                ..Default::default()
            };
            let rq = &mut self.rqs[i];
            rq.cfs_rqs.insert(g, cfs);
            rq.group_se.insert(g, se);
        }
        self.update_group_uclamp_eff(g);
        info!(group = g.0, parent = parent.0, name, "task group created");
        Ok(g)
    }

    fn group_has_tasks(&self, g: GroupId) -> bool {
        self.tasks.iter().any(|t| t.group == g && !t.is_dead())
    }

    pub fn destroy_group(&mut self, g: GroupId) -> SchedResult<()> {
        if g.is_root() {
            return Err(SchedError::GroupConfigInvalid("the root group cannot be destroyed"));
        }
        let Some(tg) = self.groups.get(g) else {
            return Err(SchedError::NoSuchGroup(g));
        };
        if !tg.children.is_empty() || self.group_has_tasks(g) {
            return Err(SchedError::Busy);
        }
        let parent = tg.parent.unwrap_or(GroupId::ROOT);

        self.cancel_cfs_bandwidth(g);
        for i in 0..self.rqs.len() {
            let cpu = CpuId(i as u32);
            self.remove_group_entity_load(cpu, g);
            let rq = &mut self.rqs[i];
            rq.cfs_rqs.remove(&g);
            rq.group_se.remove(&g);
        }
        if let Some(ptg) = self.groups.get_mut(parent) {
            ptg.children.retain(|&c| c != g);
        }
        if let Some(tg) = self.groups.groups.remove(&g) {
            self.rcu.retire(Retired::Group(Box::new(tg)));
        }
        info!(group = g.0, "task group destroyed");
        Ok(())
    }

    /// Queue a dying group entity's load for removal from its parent.
    fn remove_group_entity_load(&mut self, cpu: CpuId, g: GroupId) {
        let e = EntityRef::Group(g);
        let Some(se) = self.rqs[cpu.idx()].group_se.get(&g) else {
            return;
        };
        if !se.attached {
            return;
        }
        let pg = se.cfs_rq;
        let last = self.cfs_rq(cpu, pg).avg.last_update_time;
        let se = self.se_mut(cpu, e);
        let w = se.load.weight;
        crate::pelt::update_entity(last, &mut se.avg, false, 0, false, w);
        se.attached = false;
        let (l, u, r) = (se.avg.load_avg, se.avg.util_avg, se.avg.runnable_avg);
        let removed = &mut self.cfs_mut(cpu, pg).removed;
        removed.nr += 1;
        removed.load_avg += l;
        removed.util_avg += u;
        removed.runnable_avg += r;
    }

    /// Set a group's shares, clamped to the supported range, and reweight
    /// its entities on every CPU.
    pub fn set_group_shares(&mut self, g: GroupId, shares: u64) -> SchedResult<()> {
        if g.is_root() {
            return Err(SchedError::GroupConfigInvalid("root group shares are fixed"));
        }
        match self.groups.get(g) {
            None => return Err(SchedError::NoSuchGroup(g)),
            Some(tg) if tg.idle => return Err(SchedError::GroupConfigInvalid("idle group shares are fixed")),
            Some(_) => {}
        }
        self.apply_group_shares(g, shares);
        Ok(())
    }

    fn apply_group_shares(&mut self, g: GroupId, shares: u64) {
        let Some(tg) = self.groups.get_mut(g) else {
            return;
        };
        let shares = shares.clamp(MIN_SHARES, MAX_SHARES);
        if tg.shares == shares {
            return;
        }
        tg.shares = shares;
        for i in 0..self.rqs.len() {
            let cpu = CpuId(i as u32);
            self.update_rq_clock(cpu);
            for e in self.entity_chain(cpu, EntityRef::Group(g)) {
                let pg = self.se(cpu, e).cfs_rq;
                self.update_load_avg(cpu, pg, e, UpdateFlags::UPDATE_TG);
                self.update_cfs_group(cpu, e);
            }
        }
        debug!(group = g.0, shares, "group shares set");
    }

    /// Mark a group idle: its members count as idle-policy tasks and the
    /// group entity drops to the idle weight.
    pub fn set_group_idle(&mut self, g: GroupId, idle: bool) -> SchedResult<()> {
        if g.is_root() {
            return Err(SchedError::GroupConfigInvalid("root group cannot be idle"));
        }
        let Some(tg) = self.groups.get_mut(g) else {
            return Err(SchedError::NoSuchGroup(g));
        };
        if tg.idle == idle {
            return Ok(());
        }
        tg.idle = idle;
        for i in 0..self.rqs.len() {
            let cpu = CpuId(i as u32);
            let gq = self.cfs_rq(cpu, g);
            let delta = (gq.h_nr_running - gq.idle_h_nr_running) as i64;
            let delta = if idle { delta } else { -delta };
            for e in self.entity_chain(cpu, EntityRef::Group(g)) {
                if !self.se(cpu, e).on_rq {
                    break;
                }
                let pg = self.se(cpu, e).cfs_rq;
                let pcfs = self.cfs_mut(cpu, pg);
                pcfs.idle_h_nr_running = (pcfs.idle_h_nr_running as i64 + delta).max(0) as u32;
                if self.cfs_rq_is_idle(pg) {
                    break;
                }
            }
        }
        let shares = if idle { WEIGHT_IDLEPRIO } else { NICE_0_LOAD };
        self.apply_group_shares(g, shares);
        Ok(())
    }

    pub fn set_group_uclamp(&mut self, g: GroupId, min: u32, max: u32) -> SchedResult<()> {
        if min > max || max > crate::prio::SCHED_CAPACITY_SCALE as u32 {
            return Err(SchedError::GroupConfigInvalid("uclamp min must not exceed max"));
        }
        let Some(tg) = self.groups.get_mut(g) else {
            return Err(SchedError::NoSuchGroup(g));
        };
        tg.uclamp_req = [UclampSe::new(min, true), UclampSe::new(max, true)];
        let subtree = self.groups.subtree(g);
        for &x in &subtree {
            self.update_group_uclamp_eff(x);
        }
        let members: Vec<Pid> = self
            .tasks
            .iter()
            .filter(|t| subtree.contains(&t.group))
            .map(|t| t.pid)
            .collect();
        for p in members {
            self.uclamp_update_active(p);
        }
        Ok(())
    }

    fn update_group_uclamp_eff(&mut self, g: GroupId) {
        let Some(tg) = self.groups.get(g) else {
            return;
        };
        let req = tg.uclamp_req;
        let eff = match tg.parent.and_then(|p| self.groups.get(p)) {
            Some(ptg) if !ptg.id.is_root() => [
                UclampSe::new(req[0].value.min(ptg.uclamp[0].value), false),
                UclampSe::new(req[1].value.min(ptg.uclamp[1].value), false),
            ],
            _ => req,
        };
        let eff = [UclampSe::new(eff[0].value.min(eff[1].value), false), eff[1]];
        if let Some(tg) = self.groups.get_mut(g) {
            tg.uclamp = eff;
        }
    }

    /// Move a task into group `g`, re-queueing it on the new group's
    /// runqueue if it is runnable.
    pub fn move_task_to_group(&mut self, p: Pid, g: GroupId) -> SchedResult<()> {
        if !self.tasks.contains(p) {
            return Err(SchedError::NoSuchTask(p));
        }
        if !self.groups.contains(g) {
            return Err(SchedError::NoSuchGroup(g));
        }
        if self.tasks[p].group == g {
            return Ok(());
        }
        let cpu = self.tasks[p].cpu;
        self.update_rq_clock(cpu);
        let queued = self.tasks[p].is_queued();
        let running = self.rqs[cpu.idx()].curr == p;
        if queued {
            self.dequeue_task(cpu, p, DequeueFlags::SAVE | DequeueFlags::MOVE | DequeueFlags::NOCLOCK);
        }
        if running {
            self.put_prev_task(cpu, p);
        }

        self.tasks[p].group = g;
        if self.tasks[p].class == crate::class::ClassId::Fair {
            let class = crate::class::class(self.tasks[p].class);
            class.task_change_group(self, p);
        } else {
            let depth = self.entity_depth_for(g);
            let se = &mut self.tasks[p].se;
            se.cfs_rq = g;
            se.depth = depth;
        }

        if queued {
            self.enqueue_task(cpu, p, EnqueueFlags::RESTORE | EnqueueFlags::MOVE | EnqueueFlags::NOCLOCK);
        }
        if running {
            self.set_next_task(cpu, p);
            self.resched_curr(cpu);
        }
        self.uclamp_update_active(p);
        debug!(pid = p.0, group = g.0, "task moved to group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtree_is_parent_first() {
        let mut t = GroupTable::new();
        let a = t.alloc_id();
        let b = t.alloc_id();
        let c = t.alloc_id();
        t.groups.insert(a, TaskGroup::new(a, "a", Some(GroupId::ROOT), 0));
        t.groups.insert(b, TaskGroup::new(b, "b", Some(a), 1));
        t.groups.insert(c, TaskGroup::new(c, "c", Some(GroupId::ROOT), 0));
        t.groups.get_mut(&GroupId::ROOT).unwrap().children = vec![a, c];
        t.groups.get_mut(&a).unwrap().children = vec![b];
        assert_eq!(t.subtree(GroupId::ROOT), vec![GroupId::ROOT, a, b, c]);
        assert_eq!(t.subtree(a), vec![a, b]);
        assert_eq!(t.by_name("c"), Some(c));
    }
}
