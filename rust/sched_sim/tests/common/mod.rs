// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::MutexGuard;

use sched_sim::{SimFormat, SIM_LOCK};

/// Take the simulator lock and initialize tracing from `RUST_LOG`.
///
/// Hold the returned guard for the whole test. Only the first
/// `try_init()` in the process installs a subscriber.
pub fn setup_test() -> MutexGuard<'static, ()> {
    let guard = SIM_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(SimFormat)
        .try_init();
    guard
}

pub const MS: u64 = 1_000_000;
pub const US: u64 = 1_000;
