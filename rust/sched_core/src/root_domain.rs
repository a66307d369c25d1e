// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Root domains: the partition within which RT push/pull and deadline
//! admission coordinate.
//!
//! A root domain is shared by every runqueue in its span through an `Arc`
//! and is replaced wholesale on reconfiguration, so all mutable state lives
//! behind atomics or locks of its own.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::clock::cap_scale;
use crate::cpudl::Cpudl;
use crate::cpumask::Cpumask;
use crate::cpupri::Cpupri;
use crate::energy::PerfDomain;
use crate::error::SchedError;
use crate::error::SchedResult;
use crate::prio::SCHED_CAPACITY_SHIFT;
use crate::types::CpuId;

pub const BW_SHIFT: u32 = 20;
pub const BW_UNIT: u64 = 1 << BW_SHIFT;
pub const RATIO_SHIFT: u32 = 8;

/// Bandwidth ratio `runtime / period` in 20-bit fixed point.
pub fn to_ratio(period: u64, runtime: u64) -> u64 {
    if period == 0 {
        return 0;
    }
    ((runtime as u128) << BW_SHIFT) as u64 / period
}

/// Deadline bandwidth pool of a root domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlBw {
    /// Per-CPU cap, -1 for unlimited.
    pub bw: i64,
    /// Sum of admitted bandwidths.
    pub total_bw: u64,
}

impl DlBw {
    /// Would replacing `old_bw` with `new_bw` exceed the pool on a partition
    /// of capacity `cap`?
    pub fn overflow(&self, cap: u64, old_bw: u64, new_bw: u64) -> bool {
        self.bw != -1 && cap_scale(self.bw as u64, cap) < (self.total_bw + new_bw).saturating_sub(old_bw)
    }
}

#[derive(Debug)]
pub struct RootDomain {
    pub id: u64,
    pub span: Cpumask,
    online: Mutex<Cpumask>,
    capacity_orig: Vec<u64>,
    asym_capacity: bool,
    overload: AtomicBool,
    overutilized: AtomicBool,
    dl_bw: Mutex<DlBw>,
    dlo_count: AtomicUsize,
    dlo_mask: Mutex<Cpumask>,
    rto_count: AtomicUsize,
    rto_mask: Mutex<Cpumask>,
    /// Generation bumped by every CPU that lowers its RT priority; an IPI
    /// chain already in flight picks it up instead of a new one starting.
    pub rto_loop_next: AtomicI32,
    pub rto_loop: AtomicI32,
    /// CPU the push IPI chain is currently at, -1 when idle.
    pub rto_cpu: AtomicI32,
    pub visit_gen: AtomicU64,
    pub max_cpu_capacity: AtomicU64,
    pub cpupri: Cpupri,
    pub cpudl: Cpudl,
    pub pd: Vec<PerfDomain>,
}

impl RootDomain {
    pub fn new(id: u64, span: Cpumask, capacity_orig: Vec<u64>, dl_bw: i64, pd: Vec<PerfDomain>) -> Self {
        let nr = span.len();
        let caps: Vec<u64> = span.iter().map(|c| capacity_orig[c]).collect();
        let asym_capacity = caps.windows(2).any(|w| w[0] != w[1]);
        let max_cap = caps.iter().copied().max().unwrap_or(0);
        Self {
            id,
            online: Mutex::new(Cpumask::new(nr)),
            span,
            capacity_orig,
            asym_capacity,
            overload: AtomicBool::new(false),
            overutilized: AtomicBool::new(false),
            dl_bw: Mutex::new(DlBw {
                bw: dl_bw,
                total_bw: 0,
            }),
            dlo_count: AtomicUsize::new(0),
            dlo_mask: Mutex::new(Cpumask::new(nr)),
            rto_count: AtomicUsize::new(0),
            rto_mask: Mutex::new(Cpumask::new(nr)),
            rto_loop_next: AtomicI32::new(0),
            rto_loop: AtomicI32::new(0),
            rto_cpu: AtomicI32::new(-1),
            visit_gen: AtomicU64::new(0),
            max_cpu_capacity: AtomicU64::new(max_cap),
            cpupri: Cpupri::new(nr),
            cpudl: Cpudl::new(nr),
            pd,
        }
    }

    pub fn online(&self) -> Cpumask {
        self.online.lock().clone()
    }

    pub fn set_online(&self, cpu: CpuId, online: bool) {
        let mut mask = self.online.lock();
        if online {
            mask.set_cpu(cpu.idx());
            self.cpudl.set_freecpu(cpu);
        } else {
            mask.clear_cpu(cpu.idx());
            self.cpudl.clear_freecpu(cpu);
        }
    }

    pub fn overloaded(&self) -> bool {
        self.overload.load(Ordering::Acquire)
    }

    pub fn set_overload(&self, v: bool) {
        if self.overload.load(Ordering::Relaxed) != v {
            self.overload.store(v, Ordering::Release);
        }
    }

    pub fn overutilized(&self) -> bool {
        self.overutilized.load(Ordering::Acquire)
    }

    pub fn set_overutilized(&self, v: bool) {
        self.overutilized.store(v, Ordering::Release);
    }

    pub fn asym_capacity(&self) -> bool {
        self.asym_capacity
    }

    // ---- deadline bandwidth ----

    pub fn dl_bw(&self) -> DlBw {
        *self.dl_bw.lock()
    }

    /// Number of active CPUs the pool is spread over.
    pub fn dl_bw_cpus(&self) -> usize {
        self.online().and(&self.span).weight()
    }

    /// Capacity the pool scales with: the CPU count on symmetric systems, the
    /// summed original capacities on asymmetric ones.
    pub fn dl_bw_capacity(&self) -> u64 {
        let online = self.online().and(&self.span);
        if !self.asym_capacity {
            return (online.weight() as u64) << SCHED_CAPACITY_SHIFT;
        }
        online.iter().map(|c| self.capacity_orig[c]).sum()
    }

    /// Replace `old_bw` with `new_bw` in the pool if it fits. Atomic: on
    /// refusal nothing changes.
    pub fn dl_admit(&self, old_bw: u64, new_bw: u64) -> SchedResult<()> {
        let cap = self.dl_bw_capacity();
        let mut b = self.dl_bw.lock();
        if new_bw > old_bw && b.overflow(cap, old_bw, new_bw) {
            return Err(SchedError::AdmissionRefused);
        }
        b.total_bw = (b.total_bw + new_bw).saturating_sub(old_bw);
        Ok(())
    }

    pub fn dl_release(&self, bw: u64) {
        let mut b = self.dl_bw.lock();
        b.total_bw = b.total_bw.saturating_sub(bw);
    }

    /// Add bandwidth without an admission check, used when tasks are
    /// carried over into a freshly built root domain.
    pub fn dl_add_unchecked(&self, bw: u64) {
        self.dl_bw.lock().total_bw += bw;
    }

    /// Can the partition lose capacity down to `cap` and still hold its
    /// admitted bandwidth?
    pub fn dl_can_shrink_to(&self, cap: u64) -> bool {
        let b = self.dl_bw.lock();
        !b.overflow(cap, 0, 0)
    }

    pub fn set_dl_bw_limit(&self, bw: i64) -> SchedResult<()> {
        let cap = self.dl_bw_capacity();
        let mut b = self.dl_bw.lock();
        if bw != -1 && cap_scale(bw as u64, cap) < b.total_bw {
            return Err(SchedError::Busy);
        }
        b.bw = bw;
        Ok(())
    }

    // ---- RT / DL overload masks ----

    pub fn rt_set_overload(&self, cpu: CpuId) {
        let mut m = self.rto_mask.lock();
        if !m.has(cpu) {
            m.set_cpu(cpu.idx());
            self.rto_count.fetch_add(1, Ordering::Release);
        }
    }

    pub fn rt_clear_overload(&self, cpu: CpuId) {
        let mut m = self.rto_mask.lock();
        if m.has(cpu) {
            m.clear_cpu(cpu.idx());
            self.rto_count.fetch_sub(1, Ordering::Release);
        }
    }

    pub fn rt_overloaded(&self) -> usize {
        self.rto_count.load(Ordering::Acquire)
    }

    pub fn rto_mask(&self) -> Cpumask {
        self.rto_mask.lock().clone()
    }

    pub fn dl_set_overload(&self, cpu: CpuId) {
        let mut m = self.dlo_mask.lock();
        if !m.has(cpu) {
            m.set_cpu(cpu.idx());
            self.dlo_count.fetch_add(1, Ordering::Release);
        }
    }

    pub fn dl_clear_overload(&self, cpu: CpuId) {
        let mut m = self.dlo_mask.lock();
        if m.has(cpu) {
            m.clear_cpu(cpu.idx());
            self.dlo_count.fetch_sub(1, Ordering::Release);
        }
    }

    pub fn dl_overloaded(&self) -> usize {
        self.dlo_count.load(Ordering::Acquire)
    }

    pub fn dlo_mask(&self) -> Cpumask {
        self.dlo_mask.lock().clone()
    }

    /// Next CPU of the RT push IPI chain after `cpu`, or `None` when the
    /// chain has visited every overloaded CPU for the latest generation.
    pub fn rto_next_cpu(&self) -> Option<CpuId> {
        let mask = self.rto_mask();
        loop {
            let cur = self.rto_cpu.load(Ordering::Acquire);
            let next = if cur < 0 {
                mask.first()
            } else {
                mask.iter().find(|&c| c > cur as usize)
            };
            if let Some(c) = next {
                self.rto_cpu.store(c as i32, Ordering::Release);
                return Some(CpuId(c as u32));
            }
            self.rto_cpu.store(-1, Ordering::Release);
            let next_gen = self.rto_loop_next.load(Ordering::Acquire);
            if self.rto_loop.load(Ordering::Acquire) == next_gen {
                return None;
            }
            // Someone lowered their priority while the chain ran; go again.
            self.rto_loop.store(next_gen, Ordering::Release);
            if mask.is_empty() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rd(nr: usize, caps: Vec<u64>, bw: i64) -> RootDomain {
        let rd = RootDomain::new(1, Cpumask::full(nr), caps, bw, vec![]);
        for c in 0..nr {
            rd.set_online(CpuId(c as u32), true);
        }
        rd
    }

    #[test]
    fn ratio() {
        assert_eq!(to_ratio(100, 100), BW_UNIT);
        assert_eq!(to_ratio(100, 50), BW_UNIT / 2);
        assert_eq!(to_ratio(0, 50), 0);
    }

    #[test]
    fn admission_refuses_overflow_atomically() {
        let limit = to_ratio(1_000_000, 950_000) as i64;
        let rd = rd(1, vec![1024], limit);
        assert_eq!(rd.dl_admit(0, to_ratio(100, 100)), Err(SchedError::AdmissionRefused));
        assert_eq!(rd.dl_bw().total_bw, 0);
        rd.dl_admit(0, to_ratio(100, 50)).unwrap();
        assert_eq!(rd.dl_admit(0, to_ratio(100, 50)), Err(SchedError::AdmissionRefused));
        assert_eq!(rd.dl_bw().total_bw, to_ratio(100, 50));
        // shrinking an existing reservation always succeeds
        rd.dl_admit(to_ratio(100, 50), to_ratio(100, 10)).unwrap();
        assert_eq!(rd.dl_bw().total_bw, to_ratio(100, 10));
    }

    #[test]
    fn unlimited_pool_admits_full_cpu() {
        let rd = rd(1, vec![1024], -1);
        rd.dl_admit(0, to_ratio(100, 100)).unwrap();
    }

    #[test]
    fn asym_capacity_scales_pool() {
        let rd = rd(2, vec![1024, 512], BW_UNIT as i64);
        assert!(rd.asym_capacity());
        assert_eq!(rd.dl_bw_capacity(), 1536);
        rd.dl_admit(0, BW_UNIT).unwrap();
        assert!(rd.dl_admit(0, BW_UNIT / 2 + 1).is_err());
        assert!(rd.dl_can_shrink_to(1024));
        assert!(!rd.dl_can_shrink_to(512));
    }

    #[test]
    fn rto_chain_reruns_on_new_generation() {
        let rd = rd(4, vec![1024; 4], -1);
        rd.rt_set_overload(CpuId(1));
        rd.rt_set_overload(CpuId(3));
        assert_eq!(rd.rt_overloaded(), 2);
        assert_eq!(rd.rto_next_cpu(), Some(CpuId(1)));
        rd.rto_loop_next.fetch_add(1, Ordering::AcqRel);
        assert_eq!(rd.rto_next_cpu(), Some(CpuId(3)));
        // generation changed: wrap around once more
        assert_eq!(rd.rto_next_cpu(), Some(CpuId(1)));
        assert_eq!(rd.rto_next_cpu(), Some(CpuId(3)));
        assert_eq!(rd.rto_next_cpu(), None);
    }
}
