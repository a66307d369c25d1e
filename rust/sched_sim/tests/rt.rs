// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use sched_core::cpupri::{convert_prio, CPUPRI_NORMAL};
use sched_sim::*;

mod common;
use common::MS;

fn migrations_of(trace: &Trace, pid: Pid) -> Vec<(TimeNs, CpuId, CpuId)> {
    trace
        .events()
        .iter()
        .filter_map(|e| match e.kind {
            TraceKind::Migrated { pid: p, from } if p == pid => Some((e.time_ns, from, e.cpu)),
            _ => None,
        })
        .collect()
}

/// A waking FIFO task skips the CPU held by a higher RT task and lands
/// on the one running nothing more important.
#[test]
fn test_rt_wakeup_avoids_higher_rt_cpu() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(2)
        .add_task("hi", SchedAttr::fifo(60), TaskBehavior::spin())
        .add_task(
            "lo",
            SchedAttr::fifo(50),
            TaskBehavior::forever(vec![Phase::Run(2 * MS), Phase::Sleep(3 * MS)]),
        )
        .check_invariants(true)
        .duration_ms(100)
        .build();
    let tick_ns = scenario.tunables.tick_ns();
    let mut sim = Simulator::new(scenario).unwrap();
    sim.run_until(MS);
    let (hi, lo) = (sim.pid("hi").unwrap(), sim.pid("lo").unwrap());
    let hi_cpu = sim.sched().task(hi).unwrap().cpu;
    for c in 0..2 {
        let cpu = CpuId(c);
        let curr = sim.sched().curr(cpu);
        let level = sim.sched().rd(cpu).cpupri.get(cpu);
        assert_eq!(level, convert_prio(sim.sched().rq(cpu).rt.highest_prio.curr));
        if curr == hi {
            assert_eq!(level, convert_prio(sim.sched().task(hi).unwrap().prio));
        }
    }

    let trace = sim.run();
    assert!(trace.violations().is_empty(), "{:#?}", trace.violations());
    assert_eq!(trace.cpus_used(hi), [hi_cpu].into());
    assert!(!trace.cpus_used(lo).contains(&hi_cpu));
    let run = trace.total_runtime(lo);
    assert!(run >= 30 * MS, "lo ran {run}ns");

    for woken in trace
        .events()
        .iter()
        .filter(|e| matches!(e.kind, TraceKind::Woken { pid } if pid == lo))
    {
        let sched = trace
            .events()
            .iter()
            .find(|e| e.time_ns >= woken.time_ns && matches!(e.kind, TraceKind::Scheduled { pid } if pid == lo))
            .unwrap();
        assert_ne!(woken.cpu, hi_cpu);
        assert!(sched.time_ns - woken.time_ns <= tick_ns);
    }
}

/// A FIFO task preempted by a pinned higher one is pushed to the CPU
/// running fair work.
#[test]
fn test_preempted_rt_task_is_pushed() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(2)
        .task(TaskDef::new("fair", TaskBehavior::spin()).cpus("1"))
        .add_task("lo", SchedAttr::fifo(50), TaskBehavior::spin())
        .task(
            TaskDef::new("hi", TaskBehavior::once(vec![Phase::Run(10 * MS)]))
                .attr(SchedAttr::fifo(60))
                .cpus("0")
                .start_at(20 * MS),
        )
        .check_invariants(true)
        .duration_ms(50)
        .build();
    let tick_ns = scenario.tunables.tick_ns();
    let mut sim = Simulator::new(scenario).unwrap();
    sim.run_until(19 * MS);
    let (lo, fair) = (sim.pid("lo").unwrap(), sim.pid("fair").unwrap());
    assert_eq!(sim.sched().curr(CpuId(0)), lo);
    assert_eq!(sim.sched().curr(CpuId(1)), fair);

    sim.run_until(21 * MS);
    let hi = sim.pid("hi").unwrap();
    assert_eq!(sim.sched().curr(CpuId(0)), hi);
    assert_eq!(sim.sched().curr(CpuId(1)), lo);
    assert!(sim.sched().rq(CpuId(0)).stats.nr_rt_push >= 1);

    let trace = sim.run();
    assert!(trace.violations().is_empty(), "{:#?}", trace.violations());
    let moves = migrations_of(&trace, lo);
    assert_eq!(moves.len(), 1, "{moves:?}");
    let (at, from, to) = moves[0];
    assert_eq!((from, to), (CpuId(0), CpuId(1)));
    assert_eq!(at, 20 * MS);

    let run = trace.runtime_between(lo, 20 * MS, 30 * MS);
    assert!(run >= 10 * MS - tick_ns, "lo ran {run}ns while pushed");
    assert!(trace.runtime_between(fair, 20 * MS + tick_ns, 50 * MS) == 0);
}

/// When the CPU's FIFO task exits, it pulls a waiting RT task off an
/// overloaded neighbour instead of going idle.
#[test]
fn test_idle_rt_cpu_pulls_waiting_task() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(2)
        .task(
            TaskDef::new("blocker", TaskBehavior::once(vec![Phase::Run(10 * MS)]))
                .attr(SchedAttr::fifo(70))
                .cpus("0"),
        )
        .task(TaskDef::new("hi", TaskBehavior::spin()).attr(SchedAttr::fifo(60)).cpus("1"))
        .task(TaskDef::new("lo", TaskBehavior::spin()).attr(SchedAttr::fifo(50)).cpus("1"))
        .set_affinity_at(5 * MS, "lo", "0-1")
        .check_invariants(true)
        .duration_ms(40)
        .build();
    let tick_ns = scenario.tunables.tick_ns();
    let mut sim = Simulator::new(scenario).unwrap();
    sim.run_until(6 * MS);
    let lo = sim.pid("lo").unwrap();
    let rq1 = sim.sched().rq(CpuId(1));
    assert!(rq1.rt.overloaded);
    assert!(sim.sched().task(lo).unwrap().is_queued());
    assert_eq!(sim.sched().task(lo).unwrap().cpu, CpuId(1));

    let trace = sim.run();
    assert!(trace.violations().is_empty(), "{:#?}", trace.violations());
    assert_eq!(trace.runtime_between(lo, 0, 10 * MS), 0);
    let moves = migrations_of(&trace, lo);
    assert_eq!(moves.len(), 1, "{moves:?}");
    let (at, from, to) = moves[0];
    assert_eq!((from, to), (CpuId(1), CpuId(0)));
    assert!((10 * MS..=10 * MS + tick_ns).contains(&at));
    assert!(trace.runtime_between(lo, 10 * MS, 40 * MS) >= 30 * MS - 2 * tick_ns);

    let s = sim.sched();
    assert!(!s.rq(CpuId(1)).rt.overloaded);
    assert_eq!(s.rd(CpuId(0)).cpupri.get(CpuId(1)), convert_prio(s.task(sim.pid("hi").unwrap()).unwrap().prio));
}

/// Once the RT work is gone every CPU advertises the fair level again.
#[test]
fn test_cpupri_returns_to_normal() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(2)
        .add_task("a", SchedAttr::fifo(40), TaskBehavior::once(vec![Phase::Run(3 * MS)]))
        .add_task("b", SchedAttr::rr(20), TaskBehavior::once(vec![Phase::Run(3 * MS)]))
        .check_invariants(true)
        .duration_ms(20)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    let trace = sim.run();
    assert!(trace.violations().is_empty(), "{:#?}", trace.violations());
    let s = sim.sched();
    for c in 0..2 {
        let cpu = CpuId(c);
        assert_eq!(s.rd(cpu).cpupri.get(cpu), CPUPRI_NORMAL);
        assert_eq!(convert_prio(s.rq(cpu).rt.highest_prio.curr), CPUPRI_NORMAL);
    }
}
