// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::HashSet;

use sched_core::CpuIdleType;
use sched_sim::*;

mod common;
use common::{MS, US};

/// One short pinned task per CPU, so every CPU has run something and
/// goes tickless once it exits.
fn settle_all(mut b: scenario::ScenarioBuilder, nr_cpus: usize) -> scenario::ScenarioBuilder {
    for c in 0..nr_cpus {
        b = b.task(TaskDef::new(&format!("s{c}"), TaskBehavior::once(vec![Phase::Run(500 * US)])).cpus(&c.to_string()));
    }
    b
}

#[test]
fn test_idle_cpus_stop_their_tick() {
    let _lock = common::setup_test();
    let scenario = settle_all(Scenario::builder().cpus(4).hz(1000), 4)
        .check_invariants(true)
        .duration_ms(20)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    sim.run_until(5 * MS);

    let s = sim.sched();
    for c in 0..4 {
        assert!(s.rq(CpuId(c)).nohz.tick_stopped, "cpu{c} still ticking");
    }
    assert_eq!(s.nohz.nr_cpus, 4);
    assert_eq!(s.nohz.idle_cpus.weight(), 4);
    let tick_cpu = s.tick_cpu();

    let trace = sim.run();
    assert!(trace.violations().is_empty(), "{:#?}", trace.violations());
    let ticking: HashSet<CpuId> = trace
        .events()
        .iter()
        .filter(|e| e.time_ns > 5 * MS && matches!(e.kind, TraceKind::Tick { .. }))
        .map(|e| e.cpu)
        .collect();
    // The timekeeper keeps its tick even when idle.
    assert_eq!(ticking, HashSet::from([tick_cpu]));
}

/// With every CPU tickless, a single wakeup interrupts only the CPU it
/// lands on and does not drag an idle balancer along.
#[test]
fn test_first_wakeup_on_tickless_machine() {
    let _lock = common::setup_test();
    let scenario = settle_all(Scenario::builder().cpus(4).hz(1000), 4)
        .task(TaskDef::new(
            "w",
            TaskBehavior::once(vec![Phase::Run(200 * US), Phase::Sleep(10 * MS), Phase::Run(2 * MS)]),
        ))
        .check_invariants(true)
        .duration_ms(30)
        .build();
    let tick_ns = scenario.tunables.tick_ns();
    let mut sim = Simulator::new(scenario).unwrap();
    sim.run_until(5 * MS);
    assert_eq!(sim.sched().nohz.nr_cpus, 4);
    let w = sim.pid("w").unwrap();

    let trace = sim.run();
    assert!(trace.violations().is_empty(), "{:#?}", trace.violations());
    let wakes: Vec<_> = trace
        .events()
        .iter()
        .filter(|e| e.time_ns > 5 * MS && matches!(e.kind, TraceKind::Woken { pid } if pid == w))
        .collect();
    assert_eq!(wakes.len(), 1);
    let (t_w, target) = (wakes[0].time_ns, wakes[0].cpu);

    for (_, cpu, ipi) in trace.ipis_between(t_w, t_w + 1) {
        assert_eq!(cpu, target, "wakeup interrupted cpu{} with {ipi:?}", cpu.0);
        assert_ne!(ipi, Ipi::NohzKick);
    }
    // A lone runner may only ask for a blocked-load refresh.
    let kicks = trace
        .ipis_between(t_w, t_w + 2 * MS + tick_ns)
        .into_iter()
        .filter(|(_, _, ipi)| *ipi == Ipi::NohzKick)
        .count();
    assert!(kicks <= 1, "{kicks} idle balancer kicks for one runner");
    assert!(trace.runtime_between(w, t_w, t_w + 3 * MS) >= 2 * MS - tick_ns);
}

/// A busy CPU with queued work kicks a tickless CPU, which balances on
/// behalf of the others and spreads the hogs.
#[test]
fn test_idle_balancer_spreads_work() {
    let _lock = common::setup_test();
    let mut b = settle_all(Scenario::builder().cpus(4).hz(1000), 4);
    for i in 0..4 {
        let name = format!("h{i}");
        b = b
            .task(TaskDef::new(&name, TaskBehavior::spin()).cpus("0").start_at(5 * MS))
            .set_affinity_at(5 * MS + 500 * US, &name, "0-3");
    }
    let scenario = b.check_invariants(true).duration_ms(60).build();
    let mut sim = Simulator::new(scenario).unwrap();
    sim.run_until(5 * MS + 1);
    assert_eq!(sim.sched().rq(CpuId(0)).nr_running, 4);
    let hogs: Vec<Pid> = (0..4).map(|i| sim.pid(&format!("h{i}")).unwrap()).collect();

    let trace = sim.run();
    assert!(trace.violations().is_empty(), "{:#?}", trace.violations());
    assert!(trace
        .ipis_between(6 * MS, 60 * MS)
        .iter()
        .any(|(_, cpu, ipi)| *ipi == Ipi::NohzKick && *cpu != CpuId(0)));
    assert!(trace.events().iter().any(|e| e.time_ns >= 6 * MS
        && e.cpu != CpuId(0)
        && matches!(e.kind, TraceKind::Balanced { src, moved, idle: CpuIdleType::Idle } if src == CpuId(0) && moved > 0)));

    let used: HashSet<CpuId> = hogs
        .iter()
        .flat_map(|&p| trace.intervals(p))
        .filter(|&(_, _, end)| end > 6 * MS)
        .map(|(cpu, _, _)| cpu)
        .collect();
    assert!(used.len() >= 3, "hogs only ran on {used:?}");
}
