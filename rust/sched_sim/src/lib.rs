// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! sched_sim - Deterministic event-driven driver for `sched_core`.
//!
//! A scenario describes a machine, task groups, tasks with scripted
//! behavior (run/sleep/wake phases) and timed actions such as hotplug or
//! affinity changes. The simulator plays it against the scheduler core
//! and records what happened in a `Trace`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use sched_sim::*;
//!
//! let scenario = Scenario::builder()
//!     .cpus(2)
//!     .add_task("worker", SchedAttr::normal(0), TaskBehavior::forever(vec![
//!         Phase::Run(10_000_000),
//!         Phase::Sleep(5_000_000),
//!     ]))
//!     .duration_ms(100)
//!     .build();
//!
//! let mut sim = Simulator::new(scenario).unwrap();
//! let trace = sim.run();
//! trace.dump();
//! ```

pub mod engine;
pub mod fmt;
pub mod scenario;
pub mod trace;

pub use engine::Simulator;
pub use fmt::{set_sim_clock, sim_clock, FmtTs, SimFormat};
pub use scenario::{Action, BandwidthDef, GroupDef, Phase, RepeatMode, Scenario, TaskBehavior, TaskDef};
pub use trace::{Trace, TraceEvent, TraceKind};

pub use sched_core::{CpuId, GroupId, Ipi, Pid, SchedAttr, SchedTunables, TimeNs, TopologySpec};

use std::sync::Mutex;

/// Global lock for serializing simulations in one process.
///
/// The simulated clock the log formatter reads is per thread, so
/// concurrent runs would not corrupt each other; holding the lock keeps
/// their log output from interleaving.
pub static SIM_LOCK: Mutex<()> = Mutex::new(());
