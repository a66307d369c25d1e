// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Scheduler core
//!
//! A model of a multi-class CPU scheduler: per-CPU runqueues dispatching
//! through a fixed class order (stop, deadline, realtime, fair, idle),
//! PELT load tracking, hierarchical task groups with bandwidth control,
//! topology-derived scheduling domains and the load balancer that works
//! across them.
//!
//! The core performs no I/O and owns no threads. A driver creates a
//! `Sched` from a `SchedConfig`, then calls into it on behalf of a CPU:
//! ticks, wakeups, blocking, policy and affinity changes and hotplug. What
//! the core needs back from the machine (IPIs, timers) is queued for the
//! driver to deliver. The `sched_sim` crate is such a driver.
//!
//! ```
//!     use sched_core::{Sched, SchedConfig, SchedAttr, GroupId, TopologySpec};
//!     let config = SchedConfig { topology: TopologySpec::flat(2), ..Default::default() };
//!     let mut s = Sched::new(config).unwrap();
//!     let p = s.spawn("worker", &SchedAttr::normal(0), GroupId::ROOT, None).unwrap();
//!     assert!(s.task(p).is_some());
//! ```

pub mod affinity;
pub mod capacity;
pub mod cfs_bandwidth;
pub mod class;
pub mod clock;
pub mod core;
pub mod cpudl;
pub mod cpufreq;
pub mod cpumask;
pub mod cpupri;
pub mod deadline;
pub mod debug;
pub mod energy;
pub mod error;
pub mod fair;
pub mod fair_load;
pub mod fair_select;
pub mod fork;
pub mod hotplug;
pub mod idle;
pub mod load_balance;
pub mod loadavg;
pub mod monitor;
pub mod nohz;
pub mod pelt;
pub mod prio;
pub mod rcu;
pub mod root_domain;
pub mod rq;
pub mod rt;
pub mod sched_domain;
pub mod setsched;
pub mod stats;
pub mod stop;
pub mod task;
pub mod task_group;
pub mod timer;
pub mod topology;
pub mod tunables;
pub mod types;
pub mod uclamp;
pub mod wake;

pub use crate::core::Ipi;
pub use crate::core::Sched;
pub use crate::core::SchedConfig;
pub use crate::core::SchedEvent;
pub use cfs_bandwidth::CfsBandwidthStats;
pub use class::ClassId;
pub use cpumask::Cpumask;
pub use energy::EnergyModel;
pub use error::SchedError;
pub use error::SchedResult;
pub use monitor::check_invariants;
pub use monitor::InvariantMonitor;
pub use monitor::Monitor;
pub use prio::Policy;
pub use setsched::SchedAttr;
pub use stats::CpuIdleType;
pub use task::Task;
pub use task::TaskState;
pub use topology::Topology;
pub use topology::TopologySpec;
pub use tunables::SchedFeatures;
pub use tunables::SchedTunables;
pub use types::CpuId;
pub use types::GroupId;
pub use types::Pid;
pub use types::TimeNs;
