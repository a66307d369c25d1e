// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A fixed-width set of CPU ids backed by a `BitVec<u64, Lsb0>`.
//!
//! The width is chosen by the owner of the machine model (the number of
//! possible CPUs) rather than read from the host, so masks for simulated
//! topologies of any size can coexist in one process.
//!
//!```
//!     use sched_core::Cpumask;
//!     let mut mask = Cpumask::new(8);
//!     mask.set_cpu(3);
//!     assert!(mask.test_cpu(3));
//!     let other = Cpumask::from_cpulist("0-3", 8).unwrap();
//!     assert_eq!(mask.and(&other).weight(), 1);
//!     assert_eq!(format!("{other}"), "0f");
//!```

use crate::types::CpuId;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use sscanf::sscanf;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    /// Build an empty mask able to hold `nr_cpus` CPUs.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a mask with every one of `nr_cpus` CPUs set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    pub fn from_cpus(nr_cpus: usize, cpus: impl IntoIterator<Item = usize>) -> Cpumask {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in cpus {
            mask.set_cpu(cpu);
        }
        mask
    }

    /// Build a Cpumask from a hexadecimal string, or "none"/"all".
    pub fn from_str(cpumask: &str, nr_cpus: usize) -> Result<Cpumask> {
        match cpumask {
            "none" => return Ok(Cpumask::new(nr_cpus)),
            "all" => return Ok(Cpumask::full(nr_cpus)),
            _ => {}
        }
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace([',', '_'], "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Cpumask::new(nr_cpus);
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                if cpu >= nr_cpus {
                    bail!(
                        "Found cpu ({}) in cpumask ({}) beyond the {} possible cpus",
                        cpu,
                        cpumask,
                        nr_cpus
                    );
                }
                mask.mask.set(cpu, true);
            }
        }

        Ok(mask)
    }

    /// Build a Cpumask from a cpulist such as "0-3,8,10-11".
    pub fn from_cpulist(cpulist: &str, nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in read_cpulist(cpulist)? {
            if cpu >= nr_cpus {
                bail!("cpu {} in cpulist {:?} exceeds {} cpus", cpu, cpulist, nr_cpus);
            }
            mask.set_cpu(cpu);
        }
        Ok(mask)
    }

    /// Number of CPUs the mask can hold.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Set a CPU. Out of range CPUs are ignored.
    pub fn set_cpu(&mut self, cpu: usize) {
        if cpu < self.mask.len() {
            self.mask.set(cpu, true);
        }
    }

    pub fn clear_cpu(&mut self, cpu: usize) {
        if cpu < self.mask.len() {
            self.mask.set(cpu, false);
        }
    }

    /// Test whether a CPU is set. Out of range CPUs test false.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    pub fn has(&self, cpu: CpuId) -> bool {
        self.test_cpu(cpu.idx())
    }

    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    pub fn is_full(&self) -> bool {
        self.mask.all()
    }

    /// First set CPU, if any.
    pub fn first(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// First set CPU strictly after `cpu`, wrapping around to the start.
    pub fn next_wrap(&self, cpu: usize) -> Option<usize> {
        let n = self.mask.len();
        (1..=n)
            .map(|off| (cpu + off) % n)
            .find(|&c| self.test_cpu(c))
    }

    pub fn not(&self) -> Cpumask {
        let mut new = self.clone();
        new.mask = !new.mask;
        new
    }

    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new &= other;
        new
    }

    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new |= other;
        new
    }

    /// Bits of `self` that are not in `other`.
    pub fn andnot(&self, other: &Cpumask) -> Cpumask {
        self.and(&other.not())
    }

    pub fn intersects(&self, other: &Cpumask) -> bool {
        self.iter().any(|cpu| other.test_cpu(cpu))
    }

    pub fn is_subset(&self, other: &Cpumask) -> bool {
        self.iter().all(|cpu| other.test_cpu(cpu))
    }

    /// Strict subset.
    pub fn is_proper_subset(&self, other: &Cpumask) -> bool {
        self.is_subset(other) && self.weight() < other.weight()
    }

    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    pub fn cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.iter().map(|c| CpuId(c as u32))
    }

    /// Render as a cpulist, e.g. "0-3,6".
    pub fn to_cpulist(&self) -> String {
        let mut out: Vec<String> = vec![];
        let mut iter = self.iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if start == end {
                out.push(format!("{start}"));
            } else {
                out.push(format!("{start}-{end}"));
            }
        }
        out.join(",")
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let nr = self.mask.len().max(1);
        let mut masks: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();
        masks.truncate(nr.div_ceil(32));

        let width = match nr.div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        let top = masks.pop().unwrap_or(0);
        // Bits beyond the mask width may be set by not(); hide them.
        let top = if nr % 32 == 0 {
            top
        } else {
            top & ((1u32 << (nr % 32)) - 1)
        };
        match case {
            'X' => write!(f, "{:0width$X}", top, width = width)?,
            _ => write!(f, "{:0width$x}", top, width = width)?,
        }
        for submask in masks.iter().rev() {
            match case {
                'X' => write!(f, ",{submask:08X}")?,
                _ => write!(f, ",{submask:08x}")?,
            }
        }
        Ok(())
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    if cpulist.is_empty() {
        return Ok(vec![]);
    }
    let mut cpu_ids = vec![];
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        if min > max {
            bail!("Inverted cpulist range {}", group.trim());
        }
        cpu_ids.extend(min..=max);
    }

    Ok(cpu_ids)
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.mask.len() {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }

        None
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        self.mask &= &rhs.mask;
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        self.mask |= &rhs.mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_and_list() {
        let m = Cpumask::from_str("0xf0", 8).unwrap();
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
        let l = Cpumask::from_cpulist("0-1,5", 8).unwrap();
        assert_eq!(l.weight(), 3);
        assert_eq!(l.to_cpulist(), "0-1,5");
        assert!(Cpumask::from_str("0x100", 8).is_err());
        assert!(Cpumask::from_cpulist("9", 8).is_err());
        assert!(Cpumask::from_cpulist("3-1", 8).is_err());
    }

    #[test]
    fn set_ops() {
        let a = Cpumask::from_cpulist("0-3", 8).unwrap();
        let b = Cpumask::from_cpulist("2-5", 8).unwrap();
        assert_eq!(a.and(&b).to_cpulist(), "2-3");
        assert_eq!(a.or(&b).to_cpulist(), "0-5");
        assert_eq!(a.andnot(&b).to_cpulist(), "0-1");
        assert!(a.and(&b).is_proper_subset(&a));
        assert!(!a.is_proper_subset(&a));
        assert_eq!(a.not().to_cpulist(), "4-7");
        assert_eq!(b.next_wrap(5), Some(2));
    }

    #[test]
    fn display_hides_stray_bits() {
        let m = Cpumask::new(6).not();
        assert_eq!(format!("{m}"), "3f");
        let wide = Cpumask::from_cpulist("0,40", 48).unwrap();
        assert_eq!(format!("{wide}"), "0100,00000001");
    }
}
