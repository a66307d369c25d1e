// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Deferred reclamation of structures readers may still traverse.
//!
//! Replaced domain trees, root domains and destroyed task groups are
//! retired here instead of being dropped. They are freed once two grace
//! periods have been reported after the retire: one to end the current
//! reader section and one to cover readers that started during it.

use std::sync::Arc;

use crate::root_domain::RootDomain;
use crate::sched_domain::DomainTree;
use crate::task_group::TaskGroup;

/// Something whose free has been deferred.
#[derive(Debug)]
pub enum Retired {
    Domains(Arc<DomainTree>),
    RootDomain(Arc<RootDomain>),
    Group(Box<TaskGroup>),
}

#[derive(Debug, Default)]
pub struct RcuQueue {
    gp_seq: u64,
    pending: Vec<(u64, Retired)>,
    freed: u64,
}

impl RcuQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retire(&mut self, item: Retired) {
        self.pending.push((self.gp_seq, item));
    }

    /// Report a completed grace period and free what became safe.
    /// Returns the number of items freed.
    pub fn grace_period(&mut self) -> usize {
        self.gp_seq += 1;
        let gp = self.gp_seq;
        let before = self.pending.len();
        self.pending.retain(|(retired_at, _)| gp < retired_at + 2);
        let n = before - self.pending.len();
        self.freed += n as u64;
        n
    }

    /// Block until everything retired so far is freed, the way an
    /// `rcu_barrier` would.
    pub fn barrier(&mut self) -> usize {
        let mut n = 0;
        while !self.pending.is_empty() {
            n += self.grace_period();
        }
        n
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn freed(&self) -> u64 {
        self.freed
    }

    pub fn gp_seq(&self) -> u64 {
        self.gp_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frees_after_two_grace_periods() {
        let mut q = RcuQueue::new();
        q.retire(Retired::Domains(Arc::new(DomainTree::empty(2))));
        assert_eq!(q.grace_period(), 0);
        assert_eq!(q.pending(), 1);
        assert_eq!(q.grace_period(), 1);
        assert_eq!(q.pending(), 0);
        assert_eq!(q.freed(), 1);
    }

    #[test]
    fn barrier_drains() {
        let mut q = RcuQueue::new();
        q.retire(Retired::Domains(Arc::new(DomainTree::empty(1))));
        q.grace_period();
        q.retire(Retired::Domains(Arc::new(DomainTree::empty(1))));
        assert_eq!(q.barrier(), 2);
    }
}
