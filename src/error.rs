//! Crate-wide error types.
//!
//! `no_std` has no `std::error::Error`, so these enums carry a hand-written
//! `Display` impl and only pick up the `Error` trait on host/test builds.

use core::fmt;

use crate::task::Pid;

/// Errors raised by [`crate::Scheduler`] control operations.
///
/// `DuplicatePid` is a scheduler-internal bug: pids are assigned from a
/// monotonically increasing counter, so two tasks can never legitimately
/// share one. It exists so the invariant has a name, not because callers
/// are expected to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchedulerError {
    /// A single requested delay was at or beyond `TIMERPERIOD / 2` microseconds.
    TimerRange,
    /// `pause`/`resume`/`stop` referenced a pid not present in the task table.
    UnknownPid(Pid),
    /// Two task-table entries shared a pid. Indicates a scheduler bug.
    DuplicatePid(Pid),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::TimerRange => {
                write!(f, "requested delay exceeds TIMERPERIOD/2 microseconds")
            }
            SchedulerError::UnknownPid(pid) => write!(f, "unknown task id {pid}"),
            SchedulerError::DuplicatePid(pid) => write!(f, "duplicate task id {pid}"),
        }
    }
}

/// Errors raised by the SynCom link task and its public handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LinkError {
    /// A per-bit deadline elapsed while waiting for the peer's clock edge.
    Timeout,
    /// `send`/`send_str` was given a message longer than `MAX_MSG_LEN`.
    MessageTooLong { len: usize, max: usize },
    /// The outbound or inbound queue is at `MAX_QUEUED` capacity.
    QueueFull,
    /// A message byte was zero; zero is reserved as the wire terminator.
    NullByteInMessage,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Timeout => write!(f, "syncom: per-bit timeout elapsed"),
            LinkError::MessageTooLong { len, max } => {
                write!(f, "syncom: message of {len} bytes exceeds limit of {max}")
            }
            LinkError::QueueFull => write!(f, "syncom: queue is full"),
            LinkError::NullByteInMessage => {
                write!(f, "syncom: message contains a null byte, which is reserved as the terminator")
            }
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for SchedulerError {}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for LinkError {}
