//! uSched: a cooperative, priority-aware task scheduler for resource-constrained
//! embedded targets, plus SynCom, a bit-banged full-duplex synchronous serial
//! link built as a pair of scheduler tasks.
//!
//! The crate is `no_std` in production. Tests run on the host with `std`
//! available, which is the usual shape for a no_std library that still wants
//! an ordinary `cargo test` experience.
#![cfg_attr(not(test), no_std)]
#![allow(clippy::type_complexity)]

extern crate alloc;

pub mod error;
pub mod gpio;
pub mod serializer;
pub mod syncom;
pub mod task;
pub mod timer;
pub mod wait;

mod scheduler;

pub use error::{LinkError, SchedulerError};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use syncom::{Role, SynCom};
pub use task::{Pid, Poll, TaskBody};
pub use timer::Clock;
pub use wait::{Priority, WaitCondition};
