//! Hardware GPIO abstraction.
//!
//! The spec describes pin objects informally: `value()`/`value(v)` to read
//! or write a line, an open-drain mode for reset pins, and an external
//! interrupt source with `enable()`/`disable()` plus handler registration
//! at construction. This module formalises that as three small traits,
//! following the same "mechanism behind a trait, driver on top" split the
//! teacher applies to `Scheduler`/`KernelSchedCtx` - the crate only ever
//! depends on the trait; a concrete backend is supplied by the embedding
//! application.
//!
//! No concrete hardware backend ships here. A `mock` module is available
//! under `#[cfg(test)]` for the test suite.

/// A digital input line.
pub trait InputPin {
    fn is_high(&self) -> bool;
}

/// A digital output line.
pub trait OutputPin {
    fn set(&mut self, high: bool);
}

/// A pin capable of open-drain drive, used for the optional peer-reset line.
pub trait ResetPin: OutputPin {
    fn set_open_drain(&mut self, open_drain: bool);
}

/// The mask/unmask half of an external interrupt source.
///
/// The handler itself is registered once, at construction time, by the
/// embedding application (typically a `Fn() + Send + 'static` closure
/// wired into the platform's vector table); this trait only exposes the
/// runtime operations the scheduler's fetch-and-clear race-avoidance
/// bracket needs, and the enable/disable calls [`crate::wait::PinEdgeWait`]
/// issues around construction and drop.
pub trait ExternalInterrupt {
    fn enable(&mut self);
    fn disable(&mut self);
}
