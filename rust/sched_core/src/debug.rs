// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Text dumps of live scheduler state, in the spirit of
//! `/proc/<pid>/sched`, `/proc/sched_debug` and `/proc/schedstat`.

use std::fmt::Write;

use crate::core::Sched;
use crate::error::SchedError;
use crate::error::SchedResult;
use crate::stats::CpuIdleType;
use crate::types::CpuId;
use crate::types::Pid;

impl Sched {
    pub fn dump_task(&self, p: Pid) -> SchedResult<String> {
        let t = self.tasks.get(p).ok_or(SchedError::NoSuchTask(p))?;
        let mut out = String::new();
        let _ = writeln!(out, "{} ({}, #threads: 1)", t.comm, t.pid);
        let _ = writeln!(out, "{}", "-".repeat(60));
        let mut field = |name: &str, val: String| {
            let _ = writeln!(out, "{name:<40}: {val:>18}");
        };
        field("state", t.state.name().to_string());
        field("cpu", t.cpu.to_string());
        field("class", t.class.name().to_string());
        field("policy", format!("{:?}", t.policy));
        field("prio", t.prio.to_string());
        field("group", t.group.to_string());
        field("cpus_allowed", t.cpus_allowed.to_cpulist());
        field("se.exec_start", t.se.exec_start.to_string());
        field("se.vruntime", t.se.vruntime.0.to_string());
        field("se.sum_exec_runtime", t.se.sum_exec_runtime.to_string());
        field("se.nr_migrations", t.se.nr_migrations.to_string());
        field("se.load.weight", t.se.load.weight.to_string());
        field("se.avg.load_avg", t.se.avg.load_avg.to_string());
        field("se.avg.runnable_avg", t.se.avg.runnable_avg.to_string());
        field("se.avg.util_avg", t.se.avg.util_avg.to_string());
        field("se.avg.util_est.ewma", t.se.avg.util_est.ewma.to_string());
        field("se.avg.util_est.enqueued", t.se.avg.util_est.enqueued.to_string());
        if t.policy.is_dl() {
            field("dl.runtime", t.dl.runtime.to_string());
            field("dl.deadline", t.dl.deadline.to_string());
            field("dl.dl_throttled", t.dl.dl_throttled.to_string());
        }
        let st = &t.stats;
        field("iowait_sum", st.iowait_sum.to_string());
        field("wait_max", st.wait_max.to_string());
        field("wait_sum", st.wait_sum.to_string());
        field("wait_count", st.wait_count.to_string());
        field("iowait_count", st.iowait_count.to_string());
        field("nr_forced_migrations", st.nr_forced_migrations.to_string());
        field("nr_failed_migrations_affine", st.nr_failed_migrations_affine.to_string());
        field("nr_failed_migrations_running", st.nr_failed_migrations_running.to_string());
        field("nr_failed_migrations_hot", st.nr_failed_migrations_hot.to_string());
        field("nr_wakeups", st.nr_wakeups.to_string());
        field("nr_wakeups_sync", st.nr_wakeups_sync.to_string());
        field("nr_wakeups_migrate", st.nr_wakeups_migrate.to_string());
        field("nr_wakeups_local", st.nr_wakeups_local.to_string());
        field("nr_wakeups_remote", st.nr_wakeups_remote.to_string());
        field("nr_wakeups_affine", st.nr_wakeups_affine.to_string());
        field("nr_wakeups_affine_attempts", st.nr_wakeups_affine_attempts.to_string());
        field("nr_voluntary_switches", st.nr_voluntary_switches.to_string());
        field("nr_involuntary_switches", st.nr_involuntary_switches.to_string());
        Ok(out)
    }

    pub fn dump_rq(&self, cpu: CpuId) -> String {
        let rq = &self.rqs[cpu.idx()];
        let mut out = String::new();
        let _ = writeln!(out, "cpu#{}{}", cpu.0, if rq.online { "" } else { " (offline)" });
        let _ = writeln!(out, "  .nr_running                    : {}", rq.nr_running);
        let _ = writeln!(out, "  .nr_switches                   : {}", rq.nr_switches);
        let _ = writeln!(out, "  .nr_uninterruptible            : {}", rq.nr_uninterruptible);
        let _ = writeln!(out, "  .curr->pid                     : {}", rq.curr);
        let _ = writeln!(out, "  .clock                         : {}", rq.clock.clock);
        let _ = writeln!(out, "  .clock_task                    : {}", rq.clock.task());
        let _ = writeln!(out, "  .cpu_capacity                  : {}/{}", rq.cpu_capacity, rq.cpu_capacity_orig);
        let _ = writeln!(out, "  .avg_idle                      : {}", rq.avg_idle);
        let _ = writeln!(out, "  .max_idle_balance_cost         : {}", rq.max_idle_balance_cost);

        for (g, cfs) in &rq.cfs_rqs {
            if cfs.nr_running == 0 && !g.is_root() {
                continue;
            }
            let _ = writeln!(out, "cfs_rq[{}]:{}", cpu.0, g);
            let _ = writeln!(out, "  .min_vruntime                  : {}", cfs.min_vruntime.0);
            let _ = writeln!(out, "  .nr_running                    : {}", cfs.nr_running);
            let _ = writeln!(out, "  .h_nr_running                  : {}", cfs.h_nr_running);
            let _ = writeln!(out, "  .idle_h_nr_running             : {}", cfs.idle_h_nr_running);
            let _ = writeln!(out, "  .load_avg                      : {}", cfs.avg.load_avg);
            let _ = writeln!(out, "  .util_avg                      : {}", cfs.avg.util_avg);
            if cfs.runtime_enabled {
                let _ = writeln!(out, "  .throttled                     : {}", cfs.throttled);
                let _ = writeln!(out, "  .throttle_count                : {}", cfs.throttle_count);
            }
            for (vr, e) in cfs.queued() {
                let _ = writeln!(out, "    {e:?} vruntime={}", vr.0);
            }
        }

        let _ = writeln!(out, "rt_rq[{}]:", cpu.0);
        let _ = writeln!(out, "  .rt_nr_running                 : {}", rq.rt.rt_nr_running);
        let _ = writeln!(out, "  .rr_nr_running                 : {}", rq.rt.rr_nr_running);
        let _ = writeln!(out, "  .highest_prio                  : {}", rq.rt.highest_prio.curr);
        let _ = writeln!(out, "dl_rq[{}]:", cpu.0);
        let _ = writeln!(out, "  .dl_nr_running                 : {}", rq.dl.dl_nr_running);
        let _ = writeln!(out, "  .running_bw                    : {}", rq.dl.running_bw);
        if let Some((deadline, p)) = rq.dl.tree.first() {
            let _ = writeln!(out, "  .earliest                      : {deadline} ({p})");
        }

        let st = &rq.stats;
        let _ = writeln!(out, "  .sched_count                   : {}", st.sched_count);
        let _ = writeln!(out, "  .sched_goidle                  : {}", st.sched_goidle);
        let _ = writeln!(out, "  .ttwu_count                    : {}", st.ttwu_count);
        let _ = writeln!(out, "  .ttwu_local                    : {}", st.ttwu_local);
        let _ = writeln!(out, "  .yld_count                     : {}", st.yld_count);
        out
    }

    /// Domain tree plus the per-domain balance counters, one line per
    /// domain in `/proc/schedstat` order.
    pub fn dump_domains(&self) -> String {
        let mut out = self.domains.dump();
        for cpu in self.online.cpus() {
            let rq = &self.rqs[cpu.idx()];
            let st = &rq.stats;
            let _ = writeln!(
                out,
                "cpu{} {} 0 {} {} {} {} {} {}",
                cpu.0,
                st.yld_count,
                st.sched_count,
                st.sched_goidle,
                st.ttwu_count,
                st.ttwu_local,
                st.rq_cpu_time,
                st.run_delay
            );
            for (level, sd) in self.domains.domains(cpu).iter().enumerate() {
                let b = sd.balance.lock();
                let mut line = format!("domain{level} {}", sd.span.to_cpulist());
                for idle in CpuIdleType::ALL {
                    let lb = b.stats.lb(idle);
                    let _ = write!(
                        line,
                        " {} {} {} {} {} {} {} {}",
                        lb.lb_count,
                        lb.lb_balanced,
                        lb.lb_failed,
                        lb.lb_imbalance,
                        lb.lb_gained,
                        lb.lb_hot_gained,
                        lb.lb_nobusyq,
                        lb.lb_nobusyg
                    );
                }
                let s = &b.stats;
                let _ = write!(
                    line,
                    " {} {} {} {} {} {} {} {}",
                    s.alb_count,
                    s.alb_failed,
                    s.alb_pushed,
                    s.sbe_count,
                    s.sbf_count,
                    s.ttwu_wake_remote,
                    s.ttwu_move_affine,
                    s.ttwu_move_balance
                );
                let _ = writeln!(out, "{line}");
            }
        }
        out
    }

    /// Balance counters of one domain level for one idle type, or `None`
    /// past the top of the chain.
    pub fn lb_stats(&self, cpu: CpuId, level: usize, idle: CpuIdleType) -> Option<crate::stats::LbStats> {
        let sd = self.domains.domains(cpu).get(level)?;
        let b = sd.balance.lock();
        Some(b.stats.lb(idle).clone())
    }
}
