//! Wrap-safe microsecond timer arithmetic.
//!
//! The counter this module reasons about is a 31-bit value (`TIMERPERIOD`);
//! every operation here is pure modular arithmetic and takes `now` as an
//! explicit argument rather than reading a global clock, so it is trivial to
//! unit test and never itself needs a hardware dependency.
//!
//! The one piece of state an embedding application *does* own is the actual
//! time source, abstracted as [`Clock`]. The scheduler reads it once per
//! pass and threads the `now` value through to every [`crate::WaitCondition`].

use crate::error::SchedulerError;

/// Width of the wrapping microsecond counter: `2^31 - 1`.
pub const TIMERPERIOD: u32 = 0x7fff_ffff;

/// Largest delay, in microseconds, that can be represented as a single
/// [`future`] call without ambiguity (half the period).
pub const MAX_DELAY: u32 = TIMERPERIOD / 2;

/// Largest delay expressible as whole seconds, used by callers that need to
/// fragment a longer sleep into repeated maximal segments.
pub const MAX_DELAY_SECS: u32 = MAX_DELAY / 1_000_000;

/// Source of the microsecond counter the rest of this crate treats as `now`.
///
/// Implemented once per target by the embedding application (typically a
/// thin wrapper around a free-running hardware timer) and handed to
/// [`crate::Scheduler::new`].
pub trait Clock {
    /// Current value of the counter, already masked to `TIMERPERIOD`.
    fn now_micros(&self) -> u32;
}

/// Lets a shared, type-erased clock (`Rc<dyn Clock>`) stand in anywhere a
/// `Clock` is expected. Applications typically construct one concrete clock
/// and hand a clone of the same `Rc<dyn Clock>` to both [`crate::Scheduler::new`]
/// and to a [`crate::syncom::SynCom`] link, which needs to arm its own
/// timeouts outside of the scheduler's classification pass.
impl<T: Clock + ?Sized> Clock for alloc::rc::Rc<T> {
    fn now_micros(&self) -> u32 {
        (**self).now_micros()
    }
}

/// The microsecond counter value `delta` microseconds after `now`.
///
/// Fails with [`SchedulerError::TimerRange`] if `delta` is at or beyond
/// `MAX_DELAY`: a single `Timeout` can't unambiguously represent a wait that
/// long, since half the period is the most we can tell apart from "already
/// elapsed" after wraparound.
pub fn future(now: u32, delta: u32) -> Result<u32, SchedulerError> {
    if delta >= MAX_DELAY {
        return Err(SchedulerError::TimerRange);
    }
    Ok(now.wrapping_add(delta) & TIMERPERIOD)
}

/// Microseconds elapsed since the counter held `since`, wrap-safe.
pub fn elapsed(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since) & TIMERPERIOD
}

/// Microseconds past `deadline`, or `0` if `deadline` is still in the future.
///
/// Because `elapsed` is unsigned modular subtraction, a deadline that
/// hasn't arrived yet produces a huge `elapsed` value (it wrapped around);
/// anything at or past `MAX_DELAY` is therefore reinterpreted as "not yet".
pub fn after(now: u32, deadline: u32) -> u32 {
    let delta = elapsed(now, deadline);
    if delta >= MAX_DELAY { 0 } else { delta }
}

/// Microseconds from `now` until `deadline` (wrap-safe; `0` if `deadline`
/// has already passed).
pub fn until(now: u32, deadline: u32) -> u32 {
    deadline.wrapping_sub(now) & TIMERPERIOD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_then_after_is_zero_immediately() {
        let now = 1_000_000u32;
        let deadline = future(now, 50_000).unwrap();
        assert_eq!(after(now, deadline), 0);
    }

    #[test]
    fn after_becomes_positive_once_deadline_passes() {
        let now = 1_000_000u32;
        let deadline = future(now, 50_000).unwrap();
        let later = now + 60_000;
        assert!(after(later, deadline) >= 10_000);
    }

    #[test]
    fn future_rejects_delay_at_or_beyond_half_period() {
        assert_eq!(future(0, MAX_DELAY), Err(SchedulerError::TimerRange));
        assert!(future(0, MAX_DELAY - 1).is_ok());
    }

    #[test]
    fn elapsed_wraps_correctly_around_the_period() {
        // `now` has wrapped past zero relative to `since`.
        let since = TIMERPERIOD - 10;
        let now = 5; // wrapped
        assert_eq!(elapsed(now, since), 16);
    }

    #[test]
    fn until_is_zero_for_a_past_deadline() {
        let now = 1_000_000u32;
        let deadline = future(now, 10_000).unwrap();
        // Once elapsed, "until" viewed from far in the future collapses to
        // a tiny wrapped value rather than a huge one - callers use `after`
        // to detect expiry, not `until`.
        assert_eq!(until(deadline, deadline), 0);
    }
}
