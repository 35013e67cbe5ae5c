//! [`WaitCondition`]: the value a task yields to declare why, and until when,
//! it is suspended, and [`Priority`], the wake-reason triple the scheduler
//! uses to order ready tasks.

use alloc::boxed::Box;
use core::fmt;

use crate::error::SchedulerError;
use crate::gpio::ExternalInterrupt;
use crate::timer;

/// `(interruptCount, pollValue, overrunMicros)`, ordered lexicographically.
///
/// A larger triple is higher priority. `Priority::ZERO` — the all-zero
/// triple — is reserved to mean "round robin" and is never produced by a
/// timeout or interrupt wake; see the invariant on [`TimeoutWait::triggered`]
/// and [`PinEdgeWait::triggered`].
///
/// Field declaration order is significant: the derived [`Ord`] compares
/// `interrupt_count` first, then `poll_value`, then `overrun_micros`,
/// matching the tuple ordering the rest of this crate's documentation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority {
    pub interrupt_count: u32,
    pub poll_value: u32,
    pub overrun_micros: u32,
}

impl Priority {
    /// The round-robin marker. Also the value a task is resumed with the
    /// very first time its body runs (see [`crate::Scheduler::add_thread`]).
    pub const ZERO: Priority = Priority {
        interrupt_count: 0,
        poll_value: 0,
        overrun_micros: 0,
    };

    fn timeout(overrun_micros: u32) -> Self {
        Priority { interrupt_count: 0, poll_value: 0, overrun_micros }
    }

    fn interrupt(interrupt_count: u32) -> Self {
        Priority { interrupt_count, poll_value: 0, overrun_micros: 0 }
    }

    fn poll(poll_value: u32) -> Self {
        Priority { interrupt_count: 0, poll_value, overrun_micros: 0 }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.interrupt_count, self.poll_value, self.overrun_micros)
    }
}

/// A timeout arm shared by [`WaitCondition::Timeout`] and as the optional
/// fallback on [`WaitCondition::PinEdge`]/[`WaitCondition::Poller`].
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    delay_micros: u32,
    target: u32,
}

impl Deadline {
    fn new(now: u32, delay_micros: u32) -> Result<Self, SchedulerError> {
        Ok(Deadline { delay_micros, target: timer::future(now, delay_micros)? })
    }

    /// Recompute the deadline from `now`, optionally updating the stored
    /// delay first. Mirrors the source's `_ussetdelay`.
    fn rearm(&mut self, now: u32, delay_micros: Option<u32>) -> Result<(), SchedulerError> {
        if let Some(d) = delay_micros {
            self.delay_micros = d;
        }
        self.target = timer::future(now, self.delay_micros)?;
        Ok(())
    }

    fn overrun(&self, now: u32) -> u32 {
        timer::after(now, self.target)
    }
}

/// Fires once `now` is at or past `start + delay`. Can never yield
/// `Priority::ZERO` — an elapsed timeout always carries a nonzero overrun,
/// even if that overrun is vanishingly small, because `triggered` only
/// returns `Some` once at least one microsecond has passed.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutWait {
    deadline: Deadline,
}

impl TimeoutWait {
    pub fn new(now: u32, delay_micros: u32) -> Result<Self, SchedulerError> {
        Ok(TimeoutWait { deadline: Deadline::new(now, delay_micros)? })
    }

    pub fn rearm(&mut self, now: u32, delay_micros: Option<u32>) -> Result<&mut Self, SchedulerError> {
        self.deadline.rearm(now, delay_micros)?;
        Ok(self)
    }

    fn triggered(&self, now: u32) -> Option<Priority> {
        let overrun = self.deadline.overrun(now);
        (overrun != 0).then(|| Priority::timeout(overrun))
    }
}

/// Fires on an edge-triggered interrupt on a GPIO. The interrupt handler
/// (running in hardware context, registered by the caller at construction
/// time via the platform's own vector table) increments `counter`; this
/// wait condition only ever reads and clears it.
///
/// The fetch-and-clear is a single `AtomicU32::swap`, the "equivalent atomic
/// exchange" the design notes call out as preferable to a disable/enable
/// bracket on platforms that support it. `irq` is only used to make sure the
/// interrupt source starts enabled; see DESIGN.md for why the bracket
/// itself isn't exercised in the hot path.
pub struct PinEdgeWait {
    counter: alloc::sync::Arc<core::sync::atomic::AtomicU32>,
    irq: Box<dyn ExternalInterrupt>,
    timeout: Option<Deadline>,
}

impl PinEdgeWait {
    pub fn new(
        now: u32,
        counter: alloc::sync::Arc<core::sync::atomic::AtomicU32>,
        mut irq: Box<dyn ExternalInterrupt>,
        timeout_micros: Option<u32>,
    ) -> Result<Self, SchedulerError> {
        irq.enable();
        Ok(PinEdgeWait {
            counter,
            irq,
            timeout: timeout_micros.map(|d| Deadline::new(now, d)).transpose()?,
        })
    }

    fn triggered(&self, now: u32) -> Option<Priority> {
        let missed = self.counter.swap(0, core::sync::atomic::Ordering::AcqRel);
        if missed > 0 {
            return Some(Priority::interrupt(missed));
        }
        self.timeout.as_ref().and_then(|d| {
            let overrun = d.overrun(now);
            (overrun != 0).then(|| Priority::timeout(overrun))
        })
    }
}

impl fmt::Debug for PinEdgeWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinEdgeWait").field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

impl Drop for PinEdgeWait {
    fn drop(&mut self) {
        self.irq.disable();
    }
}

/// Invoked by the scheduler on every classification pass; fires when `poll`
/// returns `Some`.
pub struct PollerWait {
    poll: Box<dyn FnMut() -> Option<u32>>,
    timeout: Option<Deadline>,
}

impl PollerWait {
    pub fn new(poll: Box<dyn FnMut() -> Option<u32>>, timeout: Option<Deadline>) -> Self {
        PollerWait { poll, timeout }
    }

    pub fn with_timeout(
        now: u32,
        poll: Box<dyn FnMut() -> Option<u32>>,
        timeout_micros: Option<u32>,
    ) -> Result<Self, SchedulerError> {
        Ok(Self::new(poll, timeout_micros.map(|d| Deadline::new(now, d)).transpose()?))
    }

    fn triggered(&mut self, now: u32) -> Option<Priority> {
        if let Some(value) = (self.poll)() {
            return Some(Priority::poll(value));
        }
        self.timeout.as_ref().and_then(|d| {
            let overrun = d.overrun(now);
            (overrun != 0).then(|| Priority::timeout(overrun))
        })
    }
}

impl fmt::Debug for PollerWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerWait").field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

/// The reason a task is currently suspended.
///
/// The source's `Waitfor` class hierarchy (`Roundrobin`, `Timeout`,
/// `Pinblock`, `Poller` all inheriting from a common base with one
/// `triggered()` method) becomes this sum type; `triggered` below is the
/// match that used to be virtual dispatch. No dynamic dispatch is needed
/// for the dispatch itself, only for the heterogeneous payloads a couple of
/// variants carry (an arbitrary interrupt source, an arbitrary predicate).
#[derive(Debug)]
pub enum WaitCondition {
    Timeout(TimeoutWait),
    PinEdge(PinEdgeWait),
    Poller(PollerWait),
    /// Always ready; deliberately the lowest priority class. A task that
    /// yields this is rescheduled as soon as every priority task has run.
    RoundRobin,
}

impl WaitCondition {
    /// `Timeout(delay_micros)`, armed from `now`. Fails with
    /// [`SchedulerError::TimerRange`] under the same condition
    /// [`timer::future`] does: `delay_micros >= TIMERPERIOD / 2`.
    pub fn timeout(now: u32, delay_micros: u32) -> Result<Self, SchedulerError> {
        Ok(WaitCondition::Timeout(TimeoutWait::new(now, delay_micros)?))
    }

    /// Shorthand for the source's "yield a number of seconds": `Timeout`
    /// armed `secs` seconds out from `now`. Fractional seconds are
    /// truncated to whole microseconds.
    pub fn from_secs(now: u32, secs: f32) -> Result<Self, SchedulerError> {
        Self::timeout(now, (secs * 1_000_000.0) as u32)
    }

    /// Polled by the scheduler once per classification pass. Returns
    /// `None` if the task should remain suspended.
    pub fn triggered(&mut self, now: u32) -> Option<Priority> {
        match self {
            WaitCondition::Timeout(t) => t.triggered(now),
            WaitCondition::PinEdge(p) => p.triggered(now),
            WaitCondition::Poller(p) => p.triggered(now),
            WaitCondition::RoundRobin => Some(Priority::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct NullIrq;
    impl ExternalInterrupt for NullIrq {
        fn enable(&mut self) {}
        fn disable(&mut self) {}
    }

    #[test]
    fn round_robin_always_triggers_as_the_zero_triple() {
        let mut rr = WaitCondition::RoundRobin;
        assert_eq!(rr.triggered(12345), Some(Priority::ZERO));
    }

    #[test]
    fn timeout_never_yields_the_zero_triple() {
        let mut t = WaitCondition::timeout(0, 10).unwrap();
        assert_eq!(t.triggered(5), None);
        let p = t.triggered(11).unwrap();
        assert_ne!(p, Priority::ZERO);
        assert!(p.overrun_micros >= 1);
    }

    #[test]
    fn pin_edge_clears_counter_on_read() {
        let counter = alloc::sync::Arc::new(AtomicU32::new(3));
        let wait = PinEdgeWait::new(0, counter.clone(), Box::new(NullIrq), None).unwrap();
        let mut wc = WaitCondition::PinEdge(wait);
        assert_eq!(wc.triggered(0), Some(Priority::interrupt(3)));
        assert_eq!(counter.load(Ordering::Acquire), 0);
        assert_eq!(wc.triggered(0), None);
    }

    #[test]
    fn priority_ordering_is_lexicographic() {
        let a = Priority { interrupt_count: 1, poll_value: 0, overrun_micros: 0 };
        let b = Priority { interrupt_count: 0, poll_value: 999, overrun_micros: 999 };
        assert!(a > b, "interrupt_count dominates poll_value and overrun");
    }
}
