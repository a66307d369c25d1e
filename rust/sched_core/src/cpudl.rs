// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU deadline index: a max-heap of the earliest deadline each CPU is
//! running, so the root is the CPU whose current work is due last and is
//! the best one to displace. CPUs with no deadline work are in `free_cpus`.

use parking_lot::Mutex;

use crate::cpumask::Cpumask;
use crate::types::time_before;
use crate::types::CpuId;

#[derive(Debug, Clone, Copy)]
struct HeapNode {
    dl: u64,
    cpu: CpuId,
}

#[derive(Debug)]
struct Inner {
    heap: Vec<HeapNode>,
    /// Heap position per CPU.
    idx: Vec<Option<usize>>,
    free_cpus: Cpumask,
}

#[derive(Debug)]
pub struct Cpudl {
    inner: Mutex<Inner>,
}

impl Inner {
    fn later(&self, a: usize, b: usize) -> bool {
        time_before(self.heap[b].dl, self.heap[a].dl)
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let ca = self.heap[a].cpu.idx();
        let cb = self.heap[b].cpu.idx();
        self.idx[ca] = Some(a);
        self.idx[cb] = Some(b);
    }

    fn heapify_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.later(i, parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn heapify_down(&mut self, mut i: usize) {
        loop {
            let l = 2 * i + 1;
            let r = l + 1;
            let mut largest = i;
            if l < self.heap.len() && self.later(l, largest) {
                largest = l;
            }
            if r < self.heap.len() && self.later(r, largest) {
                largest = r;
            }
            if largest == i {
                break;
            }
            self.swap(i, largest);
            i = largest;
        }
    }

    fn heapify(&mut self, i: usize) {
        if i > 0 && self.later(i, (i - 1) / 2) {
            self.heapify_up(i);
        } else {
            self.heapify_down(i);
        }
    }
}

impl Cpudl {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: Vec::with_capacity(nr_cpus),
                idx: vec![None; nr_cpus],
                free_cpus: Cpumask::new(nr_cpus),
            }),
        }
    }

    /// Record that `cpu`'s earliest deadline is now `dl`.
    pub fn set(&self, cpu: CpuId, dl: u64) {
        let mut inner = self.inner.lock();
        match inner.idx[cpu.idx()] {
            None => {
                let pos = inner.heap.len();
                inner.heap.push(HeapNode { dl, cpu });
                inner.idx[cpu.idx()] = Some(pos);
                inner.free_cpus.clear_cpu(cpu.idx());
                inner.heapify_up(pos);
            }
            Some(pos) => {
                inner.heap[pos].dl = dl;
                inner.heapify(pos);
            }
        }
    }

    /// `cpu` no longer runs deadline work.
    pub fn clear(&self, cpu: CpuId) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.idx[cpu.idx()] else {
            inner.free_cpus.set_cpu(cpu.idx());
            return;
        };
        let last = inner.heap.len() - 1;
        if pos != last {
            inner.swap(pos, last);
        }
        inner.heap.pop();
        inner.idx[cpu.idx()] = None;
        if pos < inner.heap.len() {
            inner.heapify(pos);
        }
        inner.free_cpus.set_cpu(cpu.idx());
    }

    /// Mark an online CPU with no deadline work free.
    pub fn set_freecpu(&self, cpu: CpuId) {
        self.inner.lock().free_cpus.set_cpu(cpu.idx());
    }

    /// Remove an offline CPU from consideration.
    pub fn clear_freecpu(&self, cpu: CpuId) {
        self.inner.lock().free_cpus.clear_cpu(cpu.idx());
    }

    pub fn maximum(&self) -> Option<(CpuId, u64)> {
        let inner = self.inner.lock();
        inner.heap.first().map(|n| (n.cpu, n.dl))
    }

    /// Find CPUs where a task with deadline `dl` would be the earliest.
    ///
    /// Free CPUs in the affinity are preferred (optionally filtered by
    /// `fits`); otherwise the heap root is returned if its deadline is later
    /// than the task's.
    pub fn find<F>(&self, cpus_allowed: &Cpumask, dl: u64, fits: F) -> Option<Cpumask>
    where
        F: Fn(CpuId) -> bool,
    {
        let inner = self.inner.lock();
        let free = inner.free_cpus.and(cpus_allowed);
        if !free.is_empty() {
            let fitting = Cpumask::from_cpus(free.len(), free.cpus().filter(|c| fits(*c)).map(|c| c.idx()));
            if !fitting.is_empty() {
                return Some(fitting);
            }
            return Some(free);
        }
        let root = inner.heap.first()?;
        if cpus_allowed.has(root.cpu) && time_before(dl, root.dl) {
            return Some(Cpumask::from_cpus(cpus_allowed.len(), [root.cpu.idx()]));
        }
        None
    }

    /// Check the heap invariant; used by tests and monitors.
    pub fn is_valid(&self) -> bool {
        let inner = self.inner.lock();
        (1..inner.heap.len()).all(|i| !inner.later(i, (i - 1) / 2))
            && inner
                .heap
                .iter()
                .enumerate()
                .all(|(pos, n)| inner.idx[n.cpu.idx()] == Some(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_latest_deadline() {
        let dl = Cpudl::new(4);
        dl.set(CpuId(0), 100);
        dl.set(CpuId(1), 300);
        dl.set(CpuId(2), 200);
        assert_eq!(dl.maximum(), Some((CpuId(1), 300)));
        dl.set(CpuId(1), 50);
        assert_eq!(dl.maximum(), Some((CpuId(2), 200)));
        dl.clear(CpuId(2));
        assert_eq!(dl.maximum(), Some((CpuId(0), 100)));
        assert!(dl.is_valid());
    }

    #[test]
    fn find_prefers_free_then_latest() {
        let dl = Cpudl::new(3);
        dl.set(CpuId(0), 100);
        dl.set(CpuId(1), 500);
        dl.set_freecpu(CpuId(2));
        let all = Cpumask::full(3);
        assert_eq!(dl.find(&all, 200, |_| true).unwrap().to_cpulist(), "2");
        let busy = Cpumask::from_cpus(3, [0, 1]);
        assert_eq!(dl.find(&busy, 200, |_| true).unwrap().to_cpulist(), "1");
        assert!(dl.find(&busy, 600, |_| true).is_none());
    }
}
