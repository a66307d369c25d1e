// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Log formatting against simulated time.

use std::cell::Cell;
use std::fmt;
use std::fmt::Write as _;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use sched_core::types::{NSEC_PER_SEC, NSEC_PER_USEC};
use sched_core::{CpuId, TimeNs};

thread_local! {
    static SIM_CLOCK: Cell<TimeNs> = const { Cell::new(0) };
    static SIM_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

/// Simulated time of the event being processed on this thread.
pub fn sim_clock() -> TimeNs {
    SIM_CLOCK.with(|c| c.get())
}

/// CPU the engine is currently acting on, if any.
pub fn sim_cpu() -> Option<CpuId> {
    SIM_CPU.with(|c| c.get())
}

/// Publish the engine's position so log lines carry it.
pub fn set_sim_clock(now: TimeNs, cpu: Option<CpuId>) {
    SIM_CLOCK.with(|c| c.set(now));
    SIM_CPU.with(|c| c.set(cpu));
}

/// Simulated timestamp in the kernel log's `seconds.micros` layout,
/// followed by the CPU (`--` outside any CPU context):
/// `    0.020000 C1`.
pub struct FmtTs {
    pub ns: TimeNs,
    pub cpu: Option<CpuId>,
}

impl FmtTs {
    pub fn new(ns: TimeNs, cpu: Option<CpuId>) -> Self {
        Self { ns, cpu }
    }
}

impl fmt::Display for FmtTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.ns / NSEC_PER_SEC;
        let usecs = (self.ns % NSEC_PER_SEC) / NSEC_PER_USEC;
        write!(f, "{secs:>5}.{usecs:06} ")?;
        match self.cpu {
            Some(cpu) => write!(f, "C{:<3}", cpu.0),
            None => f.write_str("--  "),
        }
    }
}

/// Event formatter that stamps each line with simulated time instead of
/// wall-clock time.
pub struct SimFormat;

fn level_color(level: Level) -> &'static str {
    match level {
        Level::ERROR => "\x1b[31m",
        Level::WARN => "\x1b[33m",
        Level::INFO => "\x1b[32m",
        Level::DEBUG => "\x1b[34m",
        Level::TRACE => "\x1b[35m",
    }
}

impl<S, N> FormatEvent<S, N> for SimFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let meta = event.metadata();
        let level = *meta.level();
        write!(writer, "[{}] ", FmtTs::new(sim_clock(), sim_cpu()))?;
        if writer.has_ansi_escapes() {
            write!(writer, "{}{level:>5}\x1b[0m ", level_color(level))?;
        } else {
            write!(writer, "{level:>5} ")?;
        }

        let mut line = EventLine::default();
        event.record(&mut line);
        writeln!(writer, "{}: {}{}", meta.target(), line.message, line.kv)
    }
}

/// The message of an event and its remaining fields as ` key=value` text.
#[derive(Default)]
struct EventLine {
    message: String,
    kv: String,
}

impl Visit for EventLine {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            name => {
                let _ = write!(self.kv, " {name}={value}");
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{value:?}");
            }
            name => {
                let _ = write!(self.kv, " {name}={value:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_layout() {
        assert_eq!(FmtTs::new(0, None).to_string(), "    0.000000 --  ");
        assert_eq!(FmtTs::new(20 * 1_000_000 + 999, Some(CpuId(3))).to_string(), "    0.020000 C3  ");
        assert_eq!(FmtTs::new(65 * NSEC_PER_SEC + 1_500, Some(CpuId(12))).to_string(), "   65.000001 C12 ");
    }

    #[test]
    fn test_timestamps_line_up() {
        let a = FmtTs::new(1, Some(CpuId(0))).to_string();
        let b = FmtTs::new(3 * NSEC_PER_SEC, None).to_string();
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn test_engine_position_stays_on_its_thread() {
        set_sim_clock(42, Some(CpuId(1)));
        assert_eq!((sim_clock(), sim_cpu()), (42, Some(CpuId(1))));
        let other = std::thread::spawn(|| (sim_clock(), sim_cpu())).join().unwrap();
        assert_eq!(other, (0, None));
    }
}
