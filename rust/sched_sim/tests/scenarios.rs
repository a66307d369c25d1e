// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use sched_core::cpupri::{convert_prio, CPUPRI_NORMAL};
use sched_core::SchedError;
use sched_sim::*;

mod common;
use common::{MS, US};

/// A sync wakeup from a waker about to sleep pulls the wakee onto the
/// waker's CPU, even though the wakee last ran elsewhere.
#[test]
fn test_sync_wakeup_is_affine() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(2)
        .llcs(2)
        .cores_per_llc(1)
        .task(
            TaskDef::new(
                "waker",
                TaskBehavior::forever(vec![Phase::Run(2 * MS), Phase::WakeSync("child".into()), Phase::Sleep(3 * MS)]),
            )
            .cpus("0"),
        )
        .task(
            TaskDef::new("child", TaskBehavior::forever(vec![Phase::Run(500 * US), Phase::Sleep(1_000 * MS)])).cpus("1"),
        )
        .set_affinity_at(MS, "child", "0-1")
        .duration_ms(100)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    trace.dump();

    let child = trace.pid("child").unwrap();
    let wakes: Vec<_> = trace
        .events()
        .iter()
        .filter(|e| e.time_ns > MS && matches!(e.kind, TraceKind::Woken { pid } if pid == child))
        .collect();
    assert!(wakes.len() >= 10, "only {} wakeups", wakes.len());
    for e in &wakes {
        assert_eq!(e.cpu, CpuId(0), "child woken on cpu{} at {}", e.cpu.0, e.time_ns);
    }
}

/// Ten equal CPU hogs on one CPU split it evenly.
#[test]
fn test_equal_hogs_share_cpu() {
    let _lock = common::setup_test();
    let mut b = Scenario::builder().cpus(1).hz(250).duration_ms(1_000);
    for i in 0..10 {
        b = b.add_task(&format!("hog{i}"), SchedAttr::normal(0), TaskBehavior::spin());
    }
    let trace = Simulator::new(b.build()).unwrap().run();

    for (pid, name) in trace.tasks() {
        let rt = trace.total_runtime(pid);
        eprintln!("{name}: {rt}ns");
        assert!((90 * MS..=110 * MS).contains(&rt), "{name} got {rt}ns");
    }
}

/// A nice -5 task gets about three times the CPU of a nice 0 one.
#[test]
fn test_nice_weights() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .task(TaskDef::new("heavy", TaskBehavior::spin()).nice(-5))
        .task(TaskDef::new("light", TaskBehavior::spin()))
        .duration_ms(1_000)
        .build();
    let trace = Simulator::new(scenario).unwrap().run();

    let heavy = trace.total_runtime(trace.pid("heavy").unwrap());
    let light = trace.total_runtime(trace.pid("light").unwrap());
    let ratio = heavy as f64 / light as f64;
    // 3121 / 1024
    assert!((2.7..=3.4).contains(&ratio), "ratio {ratio:.3}");
}

/// A FIFO task waking on a CPU busy with a fair hog runs at once and
/// publishes its priority to cpupri while it runs.
#[test]
fn test_rt_wakeup_preempts_fair() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .add_task("hog", SchedAttr::normal(0), TaskBehavior::spin())
        .add_task(
            "rt",
            SchedAttr::fifo(50),
            TaskBehavior::once(vec![Phase::Sleep(10 * MS), Phase::Run(5 * MS)]),
        )
        .duration_ms(40)
        .build();
    let tick_ns = scenario.tunables.tick_ns();

    let mut sim = Simulator::new(scenario).unwrap();
    sim.run_until(12 * MS);
    let rt = sim.pid("rt").unwrap();
    assert_eq!(sim.sched().curr(CpuId(0)), rt);
    let prio = sim.sched().task(rt).unwrap().prio;
    assert_eq!(sim.sched().rd(CpuId(0)).cpupri.get(CpuId(0)), convert_prio(prio));

    let trace = sim.run();
    trace.dump();

    let woken = trace
        .events()
        .iter()
        .find(|e| e.time_ns >= 10 * MS && matches!(e.kind, TraceKind::Woken { pid } if pid == rt))
        .unwrap();
    let sched = trace
        .events()
        .iter()
        .find(|e| e.time_ns >= woken.time_ns && matches!(e.kind, TraceKind::Scheduled { pid } if pid == rt))
        .unwrap();
    assert!((10 * MS..=10 * MS + tick_ns).contains(&woken.time_ns));
    assert!(sched.time_ns - woken.time_ns <= tick_ns);

    let run = trace.runtime_between(rt, 10 * MS, 20 * MS);
    assert!(run >= 5 * MS - tick_ns, "rt ran {run}ns");
    assert!(trace.events().iter().any(|e| matches!(e.kind, TraceKind::Exited { pid } if pid == rt)));
    assert_eq!(sim.sched().rd(CpuId(0)).cpupri.get(CpuId(0)), CPUPRI_NORMAL);
}

/// Deadline admission against the root domain's bandwidth pool.
#[test]
fn test_deadline_admission_control() {
    let _lock = common::setup_test();
    let dl = SchedAttr::deadline(50 * MS, 100 * MS, 100 * MS);
    let scenario = Scenario::builder()
        .cpus(1)
        .add_task("hog", SchedAttr::normal(0), TaskBehavior::spin())
        .add_task("a", dl, TaskBehavior::spin())
        .add_task("b", dl, TaskBehavior::spin())
        .duration_ms(1_000)
        .build();
    let trace = Simulator::new(scenario).unwrap().run();

    assert!(trace.pid("a").is_some());
    assert!(trace.pid("b").is_none());
    let rejected: Vec<_> = trace.rejections().collect();
    assert_eq!(rejected, vec![("spawn b", &SchedError::AdmissionRefused)]);

    // Throttled to its reservation; the hog gets the rest.
    let a = trace.total_runtime(trace.pid("a").unwrap());
    assert!((400 * MS..=600 * MS).contains(&a), "a ran {a}ns");
    assert!(trace.total_runtime(trace.pid("hog").unwrap()) >= 350 * MS);
}

#[test]
fn test_full_reservation_needs_two_cpus() {
    let _lock = common::setup_test();
    let full = SchedAttr::deadline(100 * MS, 100 * MS, 100 * MS);
    for (cpus, admitted) in [(1, false), (2, true)] {
        let scenario = Scenario::builder()
            .cpus(cpus)
            .add_task("full", full, TaskBehavior::spin())
            .duration_ms(20)
            .build();
        let trace = Simulator::new(scenario).unwrap().run();
        assert_eq!(trace.pid("full").is_some(), admitted, "{cpus} cpus");
        if !admitted {
            assert!(matches!(trace.rejections().next(), Some((_, SchedError::AdmissionRefused))));
        }
    }
}

/// A group capped at 10ms per 100ms runs in one burst per period.
#[test]
fn test_cfs_bandwidth_caps_group() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .hz(1000)
        .group(GroupDef::new("capped").bandwidth(100 * MS, 10 * MS))
        .task(TaskDef::new("capped_hog", TaskBehavior::spin()).group("capped"))
        .duration_ms(1_000)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    let trace = sim.run();

    let pid = trace.pid("capped_hog").unwrap();
    let rt = trace.total_runtime(pid);
    assert!((80 * MS..=130 * MS).contains(&rt), "ran {rt}ns");
    let bursts = trace.bursts(pid);
    assert!((8..=12).contains(&bursts.len()), "{} bursts", bursts.len());

    let g = sim.sched().groups.by_name("capped").unwrap();
    let stats = sim.sched().group_bandwidth_stats(g).unwrap();
    assert!(stats.nr_throttled >= 8, "{stats:?}");
    assert!(stats.throttled_time > 0);
    assert!(trace.events().iter().any(|e| matches!(e.kind, TraceKind::Throttled { group } if group == g)));
}

/// Offlining a CPU moves its tasks to a CPU they are allowed on.
#[test]
fn test_cpu_offline_migrates_tasks() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(4)
        .task(TaskDef::new("a", TaskBehavior::spin()).cpus("0"))
        .task(TaskDef::new("b", TaskBehavior::spin()).cpus("1"))
        .task(TaskDef::new("c", TaskBehavior::spin()).cpus("2"))
        .task(TaskDef::new("d", TaskBehavior::spin()).cpus("3"))
        .set_affinity_at(10 * MS, "d", "2-3")
        .cpu_offline_at(50 * MS, 3)
        .duration_ms(100)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    let trace = sim.run();

    let d = trace.pid("d").unwrap();
    assert_eq!(sim.sched().task(d).unwrap().cpu, CpuId(2));
    assert_eq!(sim.sched().rq(CpuId(3)).nr_running, 0);
    assert!(!sim.sched().online.has(CpuId(3)));
    assert!(trace.rejections().next().is_none());
    assert!(trace
        .events()
        .iter()
        .any(|e| e.cpu == CpuId(3) && e.kind == TraceKind::CpuOffline));

    assert!(trace.runtime_between(d, 60 * MS, 100 * MS) > 0);
    for (cpu, _, end) in trace.intervals(d) {
        if end > 50 * MS {
            assert!(cpu == CpuId(2) || end == 50 * MS, "d ran on cpu{} until {end}", cpu.0);
        }
    }
}

#[test]
fn test_cpu_offline_refused_for_pinned_task() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(4)
        .task(TaskDef::new("pinned", TaskBehavior::spin()).cpus("3"))
        .cpu_offline_at(10 * MS, 3)
        .duration_ms(30)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    let trace = sim.run();

    assert!(sim.sched().online.has(CpuId(3)));
    let rejected: Vec<_> = trace.rejections().map(|(_, e)| e.clone()).collect();
    assert_eq!(rejected, vec![SchedError::CpuBusy(CpuId(3))]);
    let pid = trace.pid("pinned").unwrap();
    assert_eq!(trace.cpus_used(pid).into_iter().collect::<Vec<_>>(), vec![CpuId(3)]);
}

/// A CPU brought back online picks up work again.
#[test]
fn test_cpu_online_rejoins_balancing() {
    let _lock = common::setup_test();
    let mut b = Scenario::builder()
        .cpus(4)
        .cpu_offline_at(5 * MS, 3)
        .cpu_online_at(50 * MS, 3)
        .duration_ms(400);
    for i in 0..8 {
        b = b.add_task(&format!("w{i}"), SchedAttr::normal(0), TaskBehavior::spin());
    }
    let mut sim = Simulator::new(b.build()).unwrap();
    let trace = sim.run();

    assert!(sim.sched().online.has(CpuId(3)));
    assert!(trace.events().iter().any(|e| e.cpu == CpuId(3) && e.kind == TraceKind::CpuOnline));
    let busy: TimeNs = trace
        .tasks()
        .map(|(pid, _)| {
            trace
                .intervals(pid)
                .into_iter()
                .filter(|&(cpu, _, _)| cpu == CpuId(3))
                .map(|(_, s, e)| e.min(400 * MS).saturating_sub(s.max(50 * MS)))
                .sum::<TimeNs>()
        })
        .sum();
    assert!(busy > 0, "cpu3 stayed idle after coming back");
}

/// Load balancing spreads hogs started on one CPU across the machine.
#[test]
fn test_load_balance_spreads_hogs() {
    let _lock = common::setup_test();
    let mut b = Scenario::builder().cpus(2).smt(2).duration_ms(500);
    for i in 0..4 {
        b = b.task(TaskDef::new(&format!("h{i}"), TaskBehavior::spin()).cpus("0"));
    }
    for i in 0..4 {
        b = b.set_affinity_at(MS, &format!("h{i}"), "0-3");
    }
    let trace = Simulator::new(b.build()).unwrap().run();

    for c in 0..4 {
        let busy = trace.busy_time(CpuId(c));
        assert!(busy > 200 * MS, "cpu{c} busy only {busy}ns");
    }
}

#[test]
fn test_mixed_workload_keeps_invariants() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(2)
        .smt(2)
        .check_invariants(true)
        .group(GroupDef::new("batch").shares(512))
        .group(GroupDef::new("inner").parent("batch").bandwidth(50 * MS, 20 * MS))
        .task(TaskDef::new("fg0", TaskBehavior::forever(vec![Phase::Run(3 * MS), Phase::Sleep(2 * MS)])))
        .task(
            TaskDef::new(
                "fg1",
                TaskBehavior::forever(vec![Phase::Run(MS), Phase::Wake("fg2".into()), Phase::Sleep(4 * MS)]),
            )
            .nice(-3),
        )
        .task(TaskDef::new("fg2", TaskBehavior::forever(vec![Phase::Run(700 * US), Phase::Sleep(100 * MS)])))
        .task(TaskDef::new("bg0", TaskBehavior::spin()).group("batch"))
        .task(TaskDef::new("bg1", TaskBehavior::spin()).group("inner"))
        .task(TaskDef::new("bg2", TaskBehavior::spin()).group("inner").start_at(20 * MS))
        .add_task(
            "rt",
            SchedAttr::rr(10),
            TaskBehavior::forever(vec![Phase::Run(2 * MS), Phase::Sleep(8 * MS)]),
        )
        .add_task("dl", SchedAttr::deadline(2 * MS, 10 * MS, 10 * MS), TaskBehavior::spin())
        .set_attr_at(100 * MS, "fg0", SchedAttr::batch(0))
        .cpu_offline_at(150 * MS, 2)
        .cpu_online_at(200 * MS, 2)
        .duration_ms(300)
        .build();
    let trace = Simulator::new(scenario).unwrap().run();

    assert!(trace.violations().is_empty(), "{:#?}", trace.violations());
    assert!(trace.rejections().next().is_none());
    for (pid, name) in trace.tasks() {
        assert!(trace.total_runtime(pid) > 0, "{name} never ran");
    }
}

#[test]
fn test_same_seed_same_trace() {
    let _lock = common::setup_test();
    let scenario = || {
        let mut b = Scenario::builder().cpus(4).seed(7).tick_jitter_ns(200 * US).duration_ms(200);
        for i in 0..6 {
            b = b.add_task(
                &format!("t{i}"),
                SchedAttr::normal(i - 3),
                TaskBehavior::forever(vec![Phase::Run((i as u64 + 1) * MS), Phase::Sleep(3 * MS)]),
            );
        }
        b.build()
    };
    let first = Simulator::new(scenario()).unwrap().run();
    let second = Simulator::new(scenario()).unwrap().run();
    assert_eq!(first.events(), second.events());
    assert!(!first.events().is_empty());
}

#[test]
fn test_scenario_from_json() {
    let _lock = common::setup_test();
    let json = r#"{
        "topology": { "nodes": 1, "llcs_per_node": 1, "cores_per_llc": 2, "threads_per_core": 1 },
        "tasks": [
            { "name": "sleeper", "behavior": { "phases": [{ "run": "1ms" }, { "sleep": "4ms" }], "repeat": "forever" } },
            { "name": "hog", "behavior": { "phases": [{ "run": "100ms" }], "repeat": "forever" } }
        ],
        "duration_ns": "50ms"
    }"#;
    let scenario = Scenario::from_json(json).unwrap();
    assert_eq!(scenario.nr_cpus(), 2);
    let trace = Simulator::new(scenario).unwrap().run();

    let sleeper = trace.pid("sleeper").unwrap();
    let runtime = trace.total_runtime(sleeper);
    // 1ms out of every 5ms with a free CPU available.
    assert!((6 * MS..=11 * MS).contains(&runtime), "sleeper ran {runtime}ns");
    assert_eq!(trace.end_ns(), 50 * MS);
}

#[test]
fn test_bundled_mixed_scenario() {
    let _lock = common::setup_test();
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../tools/schedsim/scenarios/mixed.json");
    let mut scenario = Scenario::load(&path).unwrap();
    scenario.check_invariants = true;
    assert_eq!(scenario.nr_cpus(), 8);
    let trace = Simulator::new(scenario).unwrap().run();

    assert!(trace.violations().is_empty(), "{:#?}", trace.violations());
    assert!(trace.rejections().next().is_none());
    for (pid, name) in trace.tasks() {
        assert!(trace.total_runtime(pid) > 0, "{name} never ran");
    }
}

/// A deadline task out of runtime stays queued but off its tree until
/// the replenishment timer, and the structural checks agree.
#[test]
fn test_deadline_throttle_keeps_invariants() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .add_task("hog", SchedAttr::normal(0), TaskBehavior::spin())
        .add_task("dl", SchedAttr::deadline(2 * MS, 10 * MS, 10 * MS), TaskBehavior::spin())
        .check_invariants(true)
        .duration_ms(100)
        .build();
    let tick_ns = scenario.tunables.tick_ns();
    let mut sim = Simulator::new(scenario).unwrap();
    sim.run_until(5 * MS);
    let dl = sim.pid("dl").unwrap();
    let t = sim.sched().task(dl).unwrap();
    assert!(t.dl.dl_throttled);
    assert!(t.is_queued());
    assert!(!t.dl.on_rq);
    assert_eq!(sim.sched().rq(CpuId(0)).dl.dl_nr_running, 0);
    assert!(sched_core::check_invariants(sim.sched()).is_empty());

    let trace = sim.run();
    assert!(trace.violations().is_empty(), "{:#?}", trace.violations());
    let run = trace.total_runtime(dl);
    // 2ms of every 10ms; overruns are paid back from later periods.
    assert!((14 * MS..=20 * MS + 10 * tick_ns).contains(&run), "dl ran {run}ns");
    assert!(trace.total_runtime(trace.pid("hog").unwrap()) >= 70 * MS);
}

/// On a half-capacity CPU a hog's raw utilization still climbs towards
/// full scale, while the capacity-facing view stays at the CPU's size.
#[test]
fn test_little_cpu_util_is_clamped() {
    let _lock = common::setup_test();
    let scenario = Scenario::builder()
        .cpus(2)
        .capacities(vec![1024, 512])
        .task(TaskDef::new("hog", TaskBehavior::spin()).cpus("1"))
        .check_invariants(true)
        .duration_ms(500)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    let trace = sim.run();
    assert!(trace.violations().is_empty(), "{:#?}", trace.violations());

    let s = sim.sched();
    let little = CpuId(1);
    assert_eq!(s.capacity_orig_of(little), 512);
    let util = s.task(sim.pid("hog").unwrap()).unwrap().se.avg.util_avg;
    assert!(util > 512 && util <= 1024, "hog util_avg {util}");
    assert!(s.rq(little).cfs().avg.util_avg > 512);
    assert_eq!(s.cpu_util_cfs(little), 512);
}
