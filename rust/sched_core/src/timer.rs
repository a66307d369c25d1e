// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! High-resolution timers consumed by the core.
//!
//! Timers are single-shot; interval behaviour (bandwidth periods) is done
//! by the handler re-arming. Expiry order is `(expires, seq)` so two timers
//! for the same instant fire in arming order. A cancelled handle never
//! fires afterwards, including when it was already due but not yet popped.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::types::CpuId;
use crate::types::GroupId;
use crate::types::Pid;
use crate::types::TimeNs;

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerEvent {
    /// CFS bandwidth period refill for a group.
    CfsPeriod(GroupId),
    /// Return unused slack runtime to a group's pool.
    CfsSlack(GroupId),
    /// RT bandwidth period replenish for a CPU.
    RtPeriod(CpuId),
    /// Deadline runtime replenishment at the current deadline.
    DlReplenish(Pid),
    /// Deadline 0-lag point of a non-contending task.
    DlInactive(Pid),
    /// Precise preemption at slice end.
    HrTick(CpuId),
    /// Give up on a pending active balance.
    ActiveBalanceTimeout(CpuId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone)]
struct Armed {
    expires: TimeNs,
    pin: Option<CpuId>,
    event: TimerEvent,
}

#[derive(Debug, Default)]
pub struct TimerWheel {
    queue: BTreeMap<(TimeNs, u64), TimerHandle>,
    armed: HashMap<TimerHandle, Armed>,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, event: TimerEvent, expires: TimeNs, pin: Option<CpuId>) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let handle = TimerHandle(seq);
        self.queue.insert((expires, seq), handle);
        self.armed.insert(
            handle,
            Armed {
                expires,
                pin,
                event,
            },
        );
        handle
    }

    /// Cancel a timer. Returns true if it was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.armed.remove(&handle) {
            Some(armed) => {
                self.queue.remove(&(armed.expires, handle.0));
                true
            }
            None => false,
        }
    }

    /// Cancel any pending timer that would deliver `event`.
    pub fn cancel_event(&mut self, event: TimerEvent) -> usize {
        let handles: Vec<TimerHandle> = self
            .armed
            .iter()
            .filter(|(_, a)| a.event == event)
            .map(|(h, _)| *h)
            .collect();
        handles.iter().filter(|h| self.cancel(**h)).count()
    }

    /// Cancel every timer pinned to `cpu`.
    pub fn cancel_pinned(&mut self, cpu: CpuId) -> usize {
        let handles: Vec<TimerHandle> = self
            .armed
            .iter()
            .filter(|(_, a)| a.pin == Some(cpu))
            .map(|(h, _)| *h)
            .collect();
        handles.iter().filter(|h| self.cancel(**h)).count()
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.armed.contains_key(&handle)
    }

    pub fn expires(&self, handle: TimerHandle) -> Option<TimeNs> {
        self.armed.get(&handle).map(|a| a.expires)
    }

    /// Earliest pending expiry.
    pub fn next_expiry(&self) -> Option<TimeNs> {
        self.queue.keys().next().map(|(t, _)| *t)
    }

    /// Pop one timer due at or before `now`.
    pub fn pop_expired(&mut self, now: TimeNs) -> Option<(TimeNs, Option<CpuId>, TimerEvent)> {
        let (&(expires, seq), &handle) = self.queue.iter().next()?;
        if expires > now {
            return None;
        }
        self.queue.remove(&(expires, seq));
        let armed = self.armed.remove(&handle)?;
        Some((armed.expires, armed.pin, armed.event))
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_expiry_then_arm_order() {
        let mut w = TimerWheel::new();
        w.arm(TimerEvent::HrTick(CpuId(1)), 20, None);
        w.arm(TimerEvent::HrTick(CpuId(2)), 10, None);
        w.arm(TimerEvent::HrTick(CpuId(3)), 10, None);
        assert_eq!(w.next_expiry(), Some(10));
        let order: Vec<_> = std::iter::from_fn(|| w.pop_expired(100)).map(|e| e.2).collect();
        assert_eq!(
            order,
            vec![
                TimerEvent::HrTick(CpuId(2)),
                TimerEvent::HrTick(CpuId(3)),
                TimerEvent::HrTick(CpuId(1)),
            ]
        );
    }

    #[test]
    fn cancelled_never_fires() {
        let mut w = TimerWheel::new();
        let h = w.arm(TimerEvent::CfsPeriod(GroupId(1)), 5, None);
        w.arm(TimerEvent::RtPeriod(CpuId(0)), 6, Some(CpuId(0)));
        assert!(w.cancel(h));
        assert!(!w.cancel(h));
        assert_eq!(w.cancel_pinned(CpuId(0)), 1);
        assert!(w.pop_expired(100).is_none());
        assert!(w.is_empty());
    }

    #[test]
    fn not_due_yet() {
        let mut w = TimerWheel::new();
        w.arm(TimerEvent::DlReplenish(Pid(3)), 50, None);
        assert!(w.pop_expired(49).is_none());
        assert_eq!(w.cancel_event(TimerEvent::DlReplenish(Pid(3))), 1);
    }
}
