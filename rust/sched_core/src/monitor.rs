// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Observer hooks.
//!
//! A `Monitor` installed on `Sched` is called at the points where a reader
//! on another CPU could look at scheduler state: after a tick, after a
//! pick, while a task is between runqueues and after a balance pass.
//! `check_invariants()` is what tests usually run from those hooks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::class::ClassId;
use crate::core::Sched;
use crate::prio::MAX_RT_PRIO;
use crate::prio::SCHED_CAPACITY_SCALE;
use crate::task::OnRq;
use crate::task::Task;
use crate::task::TaskKind;
use crate::types::CpuId;
use crate::types::GroupId;
use crate::types::Pid;
use crate::types::Vtime;

#[allow(unused_variables)]
pub trait Monitor: Send {
    fn after_tick(&mut self, s: &Sched, cpu: CpuId) {}
    fn after_pick(&mut self, s: &Sched, cpu: CpuId) {}
    /// `pid` has left its old runqueue and is not on the new one yet.
    fn migrating(&mut self, s: &Sched, pid: Pid) {}
    fn after_balance(&mut self, s: &Sched, cpu: CpuId) {}
    fn task_exited(&mut self, task: &Task) {}
}

impl Sched {
    pub fn set_monitor(&mut self, monitor: Option<Box<dyn Monitor>>) -> Option<Box<dyn Monitor>> {
        std::mem::replace(&mut self.monitor, monitor)
    }

    fn with_monitor(&mut self, f: impl FnOnce(&mut dyn Monitor, &Sched)) {
        if let Some(mut m) = self.monitor.take() {
            f(m.as_mut(), self);
            self.monitor = Some(m);
        }
    }

    pub(crate) fn notify_after_tick(&mut self, cpu: CpuId) {
        self.with_monitor(|m, s| m.after_tick(s, cpu));
    }

    pub(crate) fn notify_after_pick(&mut self, cpu: CpuId) {
        self.with_monitor(|m, s| m.after_pick(s, cpu));
    }

    pub(crate) fn notify_migrating(&mut self, pid: Pid) {
        self.with_monitor(|m, s| m.migrating(s, pid));
    }

    pub(crate) fn notify_after_balance(&mut self, cpu: CpuId) {
        self.with_monitor(|m, s| m.after_balance(s, cpu));
    }
}

/// Check the structural invariants of `s`. Returns one line per violation.
pub fn check_invariants(s: &Sched) -> Vec<String> {
    let mut errs = vec![];
    let nr = s.nr_cpus();
    let mut fair = vec![0u32; nr];
    let mut rt = vec![0u32; nr];
    let mut dl = vec![0u32; nr];
    let mut dl_throttled = vec![0u32; nr];

    for t in s.tasks.iter() {
        if t.kind == TaskKind::Normal && t.migration_disabled == 0 && !t.cpus_allowed.has(t.cpu) {
            errs.push(format!("pid {}: cpu {} outside {}", t.pid, t.cpu.0, t.cpus_allowed.to_cpulist()));
        }
        if t.se.avg.util_avg > SCHED_CAPACITY_SCALE {
            errs.push(format!("pid {}: util_avg {} above scale", t.pid, t.se.avg.util_avg));
        }
        if t.on_rq != OnRq::Queued || t.kind != TaskKind::Normal {
            continue;
        }
        let c = t.cpu.idx();
        match t.class {
            ClassId::Fair => fair[c] += 1,
            ClassId::Rt => rt[c] += 1,
            // A throttled deadline task stays queued but leaves the tree
            // until its replenishment timer fires.
            ClassId::Dl if t.dl.dl_throttled => {
                if t.dl.on_rq {
                    errs.push(format!("pid {}: throttled but still on the dl tree", t.pid));
                }
                dl_throttled[c] += 1;
            }
            ClassId::Dl => dl[c] += 1,
            _ => {}
        }
    }

    for (i, rq) in s.rqs.iter().enumerate() {
        if !rq.online {
            continue;
        }
        if rq.cfs_tasks.len() as u32 != fair[i] {
            errs.push(format!("cpu{i}: {} fair tasks queued, cfs_tasks has {}", fair[i], rq.cfs_tasks.len()));
        }
        if rq.rt.rt_nr_running != rt[i] {
            errs.push(format!("cpu{i}: {} rt tasks queued, rt_nr_running {}", rt[i], rq.rt.rt_nr_running));
        }
        if rq.dl.dl_nr_running != dl[i] {
            errs.push(format!(
                "cpu{i}: {} dl tasks queued ({} throttled), dl_nr_running {}",
                dl[i] + dl_throttled[i],
                dl_throttled[i],
                rq.dl.dl_nr_running
            ));
        }
        let cpu = CpuId(i as u32);
        if s.cpu_util_cfs(cpu) > rq.cpu_capacity_orig {
            errs.push(format!("cpu{i}: fair util {} above capacity {}", s.cpu_util_cfs(cpu), rq.cpu_capacity_orig));
        }

        // Woken sleepers may sit up to one latency period behind.
        let credit = s.tunables.latency();
        for cfs in rq.cfs_rqs.values() {
            if let Some((vr, e)) = cfs.queued().next() {
                if Vtime(vr.0.wrapping_add(credit)) < cfs.min_vruntime {
                    errs.push(format!("cpu{i} {}: {e:?} vruntime far below min_vruntime", cfs.group));
                }
            }
        }
        let highest = rq.rt.active.first_prio().unwrap_or(MAX_RT_PRIO - 1);
        if rq.rt.highest_prio.curr != highest {
            errs.push(format!(
                "cpu{i}: rt highest_prio {} but highest queued {highest}",
                rq.rt.highest_prio.curr
            ));
        }
        if let Some((deadline, _)) = rq.dl.tree.first() {
            if rq.dl.earliest_dl.curr != deadline {
                errs.push(format!("cpu{i}: earliest_dl {} but leftmost {deadline}", rq.dl.earliest_dl.curr));
            }
        }
    }

    for rd in s.domains.root_domains() {
        if rd.dl_bw().overflow(rd.dl_bw_capacity(), 0, 0) {
            errs.push(format!("rd {}: deadline bandwidth {} over the pool", rd.id, rd.dl_bw().total_bw));
        }
    }
    errs.extend(s.domains.validate());
    errs
}

/// Runs `check_invariants` at every hook and collects what it finds.
/// Also checks that no runqueue's `min_vruntime` ever moves backwards.
#[derive(Debug, Clone, Default)]
pub struct InvariantMonitor {
    pub violations: Arc<Mutex<Vec<String>>>,
    min_vruntime: HashMap<(CpuId, GroupId), Vtime>,
}

impl InvariantMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&mut self, s: &Sched, at: &str) {
        let mut errs = check_invariants(s);
        let mut seen = HashMap::new();
        for (i, rq) in s.rqs.iter().enumerate() {
            let cpu = CpuId(i as u32);
            for (&g, cfs) in &rq.cfs_rqs {
                if let Some(&last) = self.min_vruntime.get(&(cpu, g)) {
                    if cfs.min_vruntime < last {
                        errs.push(format!("cpu{i} {g}: min_vruntime went backwards"));
                    }
                }
                seen.insert((cpu, g), cfs.min_vruntime);
            }
        }
        self.min_vruntime = seen;
        if errs.is_empty() {
            return;
        }
        let mut v = self.violations.lock();
        v.extend(errs.into_iter().map(|e| format!("t={} {at}: {e}", s.now)));
    }
}

impl Monitor for InvariantMonitor {
    fn after_tick(&mut self, s: &Sched, cpu: CpuId) {
        self.check(s, &format!("tick cpu{}", cpu.0));
    }

    fn after_pick(&mut self, s: &Sched, cpu: CpuId) {
        self.check(s, &format!("pick cpu{}", cpu.0));
    }

    fn migrating(&mut self, s: &Sched, pid: Pid) {
        if let Some(t) = s.task(pid) {
            if t.on_rq != OnRq::Migrating {
                self.violations
                    .lock()
                    .push(format!("t={} pid {pid}: migrating with on_rq {:?}", s.now, t.on_rq));
            }
        }
    }

    fn after_balance(&mut self, s: &Sched, cpu: CpuId) {
        self.check(s, &format!("balance cpu{}", cpu.0));
    }
}
