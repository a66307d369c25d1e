// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! schedsim - Play a JSON scenario against the scheduler core.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sched_core::SchedTunables;
use sched_sim::scenario::{parse_duration_ns, parse_seed};
use sched_sim::{CpuId, Scenario, SimFormat, Simulator, Trace, SIM_LOCK};

/// Play a scheduling scenario and summarize where the CPU time went.
#[derive(Parser, Debug)]
#[command(name = "schedsim", author, version, about, long_about = None)]
struct Cli {
    /// Path to a JSON scenario file.
    scenario: PathBuf,

    /// Tunables as inline JSON, or `f:PATH` to read them from a file.
    /// Replaces the scenario's own tunables.
    #[arg(long)]
    tunables: Option<String>,

    /// PRNG seed (u64 or "entropy"). Drives tick jitter.
    #[arg(long, env = "SCHEDSIM_SEED")]
    seed: Option<String>,

    /// Simulation end time, e.g. "1s", "500ms". A bare number is ns.
    #[arg(long, value_name = "DURATION")]
    duration: Option<String>,

    /// Run the structural invariant checks throughout.
    #[arg(long)]
    check: bool,

    /// Print the scheduling domain tree after the run.
    #[arg(long)]
    dump_domains: bool,

    /// Print trace events to stderr.
    #[arg(long)]
    dump_trace: bool,

    /// Include ticks in the trace dump.
    #[arg(long, requires = "dump_trace")]
    ticks: bool,

    /// Print the summary as JSON instead of a table.
    #[arg(long)]
    json: bool,

    /// Log verbosity when RUST_LOG is unset. Repeat for more.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(s) if !s.is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::new(match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(SimFormat)
        .try_init();
}

fn load_scenario(cli: &Cli) -> Result<Scenario> {
    let mut scenario = Scenario::load(&cli.scenario)?;
    if let Some(t) = &cli.tunables {
        scenario.tunables = SchedTunables::parse(t)?;
    }
    if let Some(seed) = &cli.seed {
        scenario.seed = parse_seed(Some(seed));
    }
    if let Some(d) = &cli.duration {
        scenario.duration_ns = parse_duration_ns(d).context("--duration")?;
    }
    if cli.check {
        scenario.check_invariants = true;
    }
    Ok(scenario)
}

fn pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn print_table(sim: &Simulator, trace: &Trace) {
    let end = trace.end_ns();
    println!("{:<16} {:>8} {:>14} {:>7} {:>8} {:>6}", "TASK", "PID", "RUNTIME_NS", "CPU%", "SWITCHES", "MIGR");
    for (pid, name) in trace.tasks() {
        let rt = trace.total_runtime(pid);
        println!(
            "{:<16} {:>8} {:>14} {:>6.1}% {:>8} {:>6}",
            name,
            pid.0,
            rt,
            pct(rt, end),
            trace.schedule_count(pid),
            trace.migrations(pid)
        );
    }
    println!();
    println!("{:<6} {:>14} {:>7} {:>7}", "CPU", "BUSY_NS", "UTIL%", "ONLINE");
    for c in 0..sim.sched().nr_cpus() {
        let cpu = CpuId(c as u32);
        let busy = trace.busy_time(cpu);
        let online = if sim.sched().online.has(cpu) { "yes" } else { "no" };
        println!("{:<6} {:>14} {:>6.1}% {:>7}", c, busy, pct(busy, end), online);
    }

    let rejected: Vec<_> = trace.rejections().collect();
    if !rejected.is_empty() {
        println!();
        for (what, err) in rejected {
            println!("rejected: {what}: {err}");
        }
    }
    for v in trace.violations() {
        println!("violation: {v}");
    }
    println!();
    println!("loadavg: {}", sim.sched().loadavg_string());
}

fn summary_json(sim: &Simulator, trace: &Trace) -> serde_json::Value {
    let tasks: Vec<_> = trace
        .tasks()
        .map(|(pid, name)| {
            serde_json::json!({
                "name": name,
                "pid": pid.0,
                "runtime_ns": trace.total_runtime(pid),
                "exec_runtime_ns": trace.exec_runtime(pid),
                "switches": trace.schedule_count(pid),
                "migrations": trace.migrations(pid),
            })
        })
        .collect();
    let cpus: Vec<_> = (0..sim.sched().nr_cpus())
        .map(|c| {
            let cpu = CpuId(c as u32);
            serde_json::json!({
                "cpu": c,
                "busy_ns": trace.busy_time(cpu),
                "online": sim.sched().online.has(cpu),
            })
        })
        .collect();
    let rejected: Vec<_> = trace
        .rejections()
        .map(|(what, err)| serde_json::json!({ "what": what, "error": err.to_string() }))
        .collect();
    serde_json::json!({
        "end_ns": trace.end_ns(),
        "tasks": tasks,
        "cpus": cpus,
        "rejected": rejected,
        "violations": trace.violations(),
        "loadavg": sim.sched().loadavg_string(),
    })
}

fn run(cli: &Cli) -> Result<()> {
    let scenario = load_scenario(cli)?;
    info!(path = %cli.scenario.display(), cpus = scenario.nr_cpus(), "loaded scenario");

    let _lock = SIM_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut sim = Simulator::new(scenario)?;
    let trace = sim.run();

    if cli.dump_trace {
        eprint!("{}", trace.format(cli.ticks));
    }
    if cli.dump_domains {
        println!("{}", sim.sched().dump_domains());
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary_json(&sim, &trace))?);
    } else {
        print_table(&sim, &trace);
    }
    if !trace.violations().is_empty() {
        anyhow::bail!("{} invariant violations", trace.violations().len());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(&cli)
}
