// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU priority index
//!
//! Tracks, for every priority level, which CPUs are currently running at
//! that level so RT push and wake-up placement can find the lowest
//! priority CPU in O(levels) without scanning runqueues.
//!
//! Levels are inverted relative to task priorities:
//!
//! ```text
//!   -1        invalid (cpu offline)
//!    0        idle / fair / lowest RT
//!    1..=99   RT priority 1..99
//!    100      higher than any RT (deadline, stop)
//! ```
//!
//! Readers (`find`) run without the per-CPU lock. The count of each level
//! is read before its mask; a mask bit seen set for a level whose count
//! was zero is ignored and a stale bit is re-checked against the caller's
//! affinity, so a racing `set` at worst costs a missed candidate.

use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::cpumask::Cpumask;
use crate::prio::MAX_RT_PRIO;
use crate::types::CpuId;

pub const CPUPRI_NR_PRIORITIES: usize = (MAX_RT_PRIO + 1) as usize;
pub const CPUPRI_INVALID: i32 = -1;
pub const CPUPRI_NORMAL: i32 = 0;
pub const CPUPRI_HIGHER: i32 = MAX_RT_PRIO;

#[derive(Debug)]
struct CpupriVec {
    count: AtomicUsize,
    mask: Mutex<Cpumask>,
}

#[derive(Debug)]
pub struct Cpupri {
    pri_to_cpu: Vec<CpupriVec>,
    cpu_to_pri: Vec<AtomicI32>,
}

/// Map a runqueue's highest RT priority (task numbering) to a level.
///
/// `MAX_RT_PRIO - 1` is what an rq with no RT task reports and shares the
/// normal level; `MAX_RT_PRIO` marks a CPU running deadline or stop work.
pub fn convert_prio(prio: i32) -> i32 {
    match prio {
        CPUPRI_INVALID => CPUPRI_INVALID,
        p if (0..MAX_RT_PRIO - 1).contains(&p) => MAX_RT_PRIO - 1 - p,
        p if p == MAX_RT_PRIO - 1 => CPUPRI_NORMAL,
        _ => CPUPRI_HIGHER,
    }
}

impl Cpupri {
    pub fn new(nr_cpus: usize) -> Self {
        let pri_to_cpu = (0..CPUPRI_NR_PRIORITIES)
            .map(|_| CpupriVec {
                count: AtomicUsize::new(0),
                mask: Mutex::new(Cpumask::new(nr_cpus)),
            })
            .collect();
        let cpu_to_pri = (0..nr_cpus).map(|_| AtomicI32::new(CPUPRI_INVALID)).collect();
        Self {
            pri_to_cpu,
            cpu_to_pri,
        }
    }

    pub fn get(&self, cpu: CpuId) -> i32 {
        self.cpu_to_pri[cpu.idx()].load(Ordering::Acquire)
    }

    /// Record that `cpu` now runs at task priority `newpri`.
    pub fn set(&self, cpu: CpuId, newpri: i32) {
        let newpri = convert_prio(newpri);
        let slot = &self.cpu_to_pri[cpu.idx()];
        let oldpri = slot.load(Ordering::Acquire);
        if newpri == oldpri {
            return;
        }

        // Publish the new level before retracting the old one so a
        // concurrent reader sees the CPU in at least one level.
        if newpri != CPUPRI_INVALID {
            let vec = &self.pri_to_cpu[newpri as usize];
            vec.mask.lock().set_cpu(cpu.idx());
            vec.count.fetch_add(1, Ordering::Release);
        }
        if oldpri != CPUPRI_INVALID {
            let vec = &self.pri_to_cpu[oldpri as usize];
            vec.count.fetch_sub(1, Ordering::Release);
            vec.mask.lock().clear_cpu(cpu.idx());
        }
        slot.store(newpri, Ordering::Release);
    }

    fn find_at(&self, idx: usize, cpus_allowed: &Cpumask) -> Option<Cpumask> {
        let vec = &self.pri_to_cpu[idx];
        if vec.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let hits = vec.mask.lock().and(cpus_allowed);
        if hits.is_empty() {
            None
        } else {
            Some(hits)
        }
    }

    /// Find CPUs running at a level strictly below `task_prio` (task
    /// numbering) that the task may run on.
    pub fn find(&self, task_prio: i32, cpus_allowed: &Cpumask) -> Option<Cpumask> {
        self.find_fitness(task_prio, cpus_allowed, None::<&dyn Fn(CpuId) -> bool>)
    }

    /// As `find`, restricted to CPUs accepted by `fitness`. If no level has
    /// a fitting CPU the first non-empty unfiltered result is returned, so a
    /// task is never left without a candidate just because of capacity.
    pub fn find_fitness<F>(&self, task_prio: i32, cpus_allowed: &Cpumask, fitness: Option<F>) -> Option<Cpumask>
    where
        F: Fn(CpuId) -> bool,
    {
        let task_pri = convert_prio(task_prio);
        if task_pri <= 0 {
            return None;
        }
        let mut fallback = None;
        for idx in 0..task_pri as usize {
            let Some(mut hits) = self.find_at(idx, cpus_allowed) else {
                continue;
            };
            let Some(fits) = fitness.as_ref() else {
                return Some(hits);
            };
            if fallback.is_none() {
                fallback = Some(hits.clone());
            }
            for cpu in hits.clone().cpus() {
                if !fits(cpu) {
                    hits.clear_cpu(cpu.idx());
                }
            }
            if !hits.is_empty() {
                return Some(hits);
            }
        }
        fallback
    }

    /// CPUs currently at the normal (or idle) level.
    pub fn normal_mask(&self) -> Cpumask {
        self.pri_to_cpu[CPUPRI_NORMAL as usize].mask.lock().clone()
    }

    pub fn count(&self, level: i32) -> usize {
        if level < 0 {
            return 0;
        }
        self.pri_to_cpu[level as usize].count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert() {
        assert_eq!(convert_prio(MAX_RT_PRIO - 1), CPUPRI_NORMAL);
        // user RT prio 50 is task prio 49
        assert_eq!(convert_prio(49), 50);
        assert_eq!(convert_prio(0), 99);
        assert_eq!(convert_prio(MAX_RT_PRIO), CPUPRI_HIGHER);
        assert_eq!(convert_prio(CPUPRI_INVALID), CPUPRI_INVALID);
    }

    #[test]
    fn find_lowest() {
        let cp = Cpupri::new(4);
        cp.set(CpuId(0), 49);
        cp.set(CpuId(1), MAX_RT_PRIO - 1);
        cp.set(CpuId(2), 10);
        cp.set(CpuId(3), MAX_RT_PRIO);
        let all = Cpumask::full(4);
        // task at RT prio 30 (task prio 69): only CPU1 (normal) is lower
        let m = cp.find(69, &all).unwrap();
        assert_eq!(m.to_cpulist(), "1");
        // task prio 5 outranks 49 and normal
        let m = cp.find(5, &Cpumask::from_cpus(4, [0])).unwrap();
        assert_eq!(m.to_cpulist(), "0");
        assert!(cp.find(MAX_RT_PRIO - 1, &all).is_none());
    }

    #[test]
    fn set_moves_between_levels() {
        let cp = Cpupri::new(2);
        cp.set(CpuId(0), MAX_RT_PRIO - 1);
        assert_eq!(cp.count(CPUPRI_NORMAL), 1);
        cp.set(CpuId(0), 49);
        assert_eq!(cp.count(CPUPRI_NORMAL), 0);
        assert_eq!(cp.count(50), 1);
        assert_eq!(cp.get(CpuId(0)), 50);
        cp.set(CpuId(0), CPUPRI_INVALID);
        assert_eq!(cp.count(50), 0);
    }

    #[test]
    fn fitness_filters_then_falls_back() {
        let cp = Cpupri::new(2);
        cp.set(CpuId(0), MAX_RT_PRIO - 1);
        cp.set(CpuId(1), MAX_RT_PRIO - 1);
        let all = Cpumask::full(2);
        let m = cp.find_fitness(10, &all, Some(|c: CpuId| c.0 == 1)).unwrap();
        assert_eq!(m.to_cpulist(), "1");
        let m = cp.find_fitness(10, &all, Some(|_c: CpuId| false)).unwrap();
        assert_eq!(m.to_cpulist(), "0-1");
    }
}
