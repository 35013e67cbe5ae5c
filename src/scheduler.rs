//! The scheduler: task table, run loop, and the two-phase (priority /
//! round-robin) dispatch order the rest of the crate is built around.
//!
//! Mirrors the `SchedulerCore`/`PerCpuSchedState` split the teacher uses for
//! its preemptive scheduler - a stable mechanism (the task table, the run
//! loop) driving whatever order the classification step produces - except
//! here there is exactly one "policy" (strict priority, round-robin
//! fallback) and it is not swappable, because the spec defines no other one.

use alloc::vec::Vec;

use crate::error::SchedulerError;
use crate::task::{Pid, Poll, TaskBody, TaskEntry, TaskState};
use crate::timer::{self, Clock};
use crate::wait::Priority;

/// Constructor-time knobs. Both fields are optional overrides with a
/// sensible default, matching §6's "optional heartbeat LED ordinal ...
/// and optional GC interval override."
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerConfig {
    /// Ordinal of a board LED to blink at idle-hook boundaries, for visual
    /// liveness confirmation. The LED itself is a demo-harness concern (see
    /// §1's "board LED toggling" under Out of scope); this crate only
    /// tracks the ordinal and logs when a blink would occur.
    pub heartbeat_led: Option<u32>,
    /// Minimum microseconds between idle-hook maintenance runs. Defaults to
    /// [`DEFAULT_GC_INTERVAL_MICROS`] (~50 ms) per §4.3.
    pub gc_interval_micros: Option<u32>,
}

/// Default idle-hook maintenance interval: 50 ms.
pub const DEFAULT_GC_INTERVAL_MICROS: u32 = 50_000;

/// Read-only diagnostic counters. Updated by the run loop, never consulted
/// by it - the numeric sibling of the spec's "logging is a passive sink."
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub passes: u64,
    pub priority_dispatches: u64,
    pub round_robin_dispatches: u64,
    pub idle_hook_runs: u64,
}

/// Owns the task table and drives the run loop.
///
/// Generic over [`Clock`] so the crate stays hardware-agnostic; the
/// embedding application supplies a thin wrapper around its free-running
/// timer peripheral.
pub struct Scheduler<C: Clock> {
    clock: C,
    tasks: Vec<TaskEntry>,
    next_pid: u32,
    stop_requested: bool,
    config: SchedulerConfig,
    last_gc: u32,
    stats: SchedulerStats,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(clock: C, config: SchedulerConfig) -> Self {
        let now = clock.now_micros();
        Scheduler {
            clock,
            tasks: Vec::new(),
            next_pid: 1,
            stop_requested: false,
            config,
            last_gc: now,
            stats: SchedulerStats::default(),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn now(&self) -> u32 {
        self.clock.now_micros()
    }

    fn index_of(&self, pid: Pid) -> Option<usize> {
        self.tasks.iter().position(|t| t.pid == pid)
    }

    /// Register a task. The body is driven once, synchronously, with the
    /// all-zero wake value to obtain its first Wait Condition - the same
    /// "drive once to get the first yield" step a Python generator gets
    /// for free just by being constructed, made explicit here.
    ///
    /// Returns `None` (and logs a diagnostic) if the body completes on its
    /// very first resumption without yielding a wait condition, matching
    /// §7's "StopIteration-on-register": the task is not added.
    pub fn add_thread<B: TaskBody + 'static>(&mut self, mut body: B) -> Option<Pid> {
        match body.resume(Priority::ZERO) {
            Poll::Done => {
                log::warn!("task body returned without yielding on registration; not added");
                None
            }
            Poll::Wait(wait) => {
                let pid = Pid(self.next_pid);
                self.next_pid += 1;
                self.tasks.push(TaskEntry {
                    pid,
                    body: alloc::boxed::Box::new(body),
                    wait,
                    state: TaskState::Running,
                });
                log::debug!("{pid} registered");
                Some(pid)
            }
        }
    }

    /// Request termination at the next pass boundary.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Mark a task Dead. Takes effect lazily: it is removed from the table
    /// at the next pass boundary, and a task already selected to run in the
    /// current phase may still run once before that happens.
    pub fn stop_task(&mut self, pid: Pid) -> Result<(), SchedulerError> {
        let idx = self.index_of(pid).ok_or(SchedulerError::UnknownPid(pid))?;
        self.tasks[idx].state = TaskState::Dead;
        log::debug!("{pid} killed");
        Ok(())
    }

    /// Transition Running -> Paused. No effect if already Paused.
    pub fn pause(&mut self, pid: Pid) -> Result<(), SchedulerError> {
        let idx = self.index_of(pid).ok_or(SchedulerError::UnknownPid(pid))?;
        if self.tasks[idx].state == TaskState::Running {
            self.tasks[idx].state = TaskState::Paused;
            log::debug!("{pid} paused");
        }
        Ok(())
    }

    /// Transition Paused -> Running. No effect if already Running.
    ///
    /// Any interrupt counts accrued while paused are delivered on the next
    /// classification, because a Paused task's Wait Condition was never
    /// polled (so never cleared) while it was Paused.
    pub fn resume(&mut self, pid: Pid) -> Result<(), SchedulerError> {
        let idx = self.index_of(pid).ok_or(SchedulerError::UnknownPid(pid))?;
        if self.tasks[idx].state == TaskState::Paused {
            self.tasks[idx].state = TaskState::Running;
            log::debug!("{pid} resumed");
        }
        Ok(())
    }

    /// Drop Dead tasks. Called at each pass boundary (§4.3 step 1).
    fn sweep_dead(&mut self) {
        self.tasks.retain(|t| t.state != TaskState::Dead);
    }

    /// Build the priority queue (sorted descending: highest triple first,
    /// ties broken by table order, i.e. a stable sort) and the round-robin
    /// queue, from only the currently Running tasks. Paused tasks are never
    /// polled here, which is what keeps their accrued interrupt counts
    /// intact across a pause/resume cycle.
    fn classify(&mut self) -> (Vec<(Priority, usize)>, Vec<usize>) {
        let now = self.now();
        let mut priority_queue = Vec::new();
        let mut round_robin_queue = Vec::new();
        for (idx, task) in self.tasks.iter_mut().enumerate() {
            if task.state != TaskState::Running {
                continue;
            }
            match task.wait.triggered(now) {
                None => {}
                Some(p) if p == Priority::ZERO => round_robin_queue.push(idx),
                Some(p) => priority_queue.push((p, idx)),
            }
        }
        priority_queue.sort_by(|a, b| b.0.cmp(&a.0));
        (priority_queue, round_robin_queue)
    }

    /// Resume task `idx` with wake value `wake`, storing its next Wait
    /// Condition or marking it Dead if it finished.
    fn dispatch(&mut self, idx: usize, wake: Priority) {
        let task = &mut self.tasks[idx];
        match task.body.resume(wake) {
            Poll::Wait(wait) => task.wait = wait,
            Poll::Done => {
                task.state = TaskState::Dead;
                log::debug!("{} finished", task.pid);
            }
        }
    }

    /// Maintenance gate. Fires at most once per [`SchedulerConfig::gc_interval_micros`]
    /// (default 50 ms). Actual reclamation work is an external concern (see
    /// §1's "garbage-collection hooks" under Out of scope); this crate only
    /// tracks whether enough time has elapsed and records the event.
    fn run_idle_hook(&mut self) {
        let now = self.now();
        let threshold = self.config.gc_interval_micros.unwrap_or(DEFAULT_GC_INTERVAL_MICROS);
        if timer::elapsed(now, self.last_gc) < threshold {
            return;
        }
        self.last_gc = now;
        self.stats.idle_hook_runs += 1;
        if let Some(led) = self.config.heartbeat_led {
            log::trace!("heartbeat: blink led {led}");
        }
        log::trace!("idle hook: maintenance pass at t={now}");
    }

    /// Run one full pass: drain the priority queue, run one round-robin
    /// task if none remain, reclassify, repeat until a round-robin drain
    /// finds nothing runnable (§4.3 steps 4-6).
    pub(crate) fn run_pass(&mut self) {
        self.stats.passes += 1;
        loop {
            let (priority_queue, round_robin_queue) = self.classify();

            for (priority, idx) in priority_queue {
                if self.tasks[idx].state != TaskState::Running {
                    // Paused between classification and execution: skip
                    // without losing its turn: the next reclassification
                    // (after this loop or the next pass) will pick it up.
                    continue;
                }
                self.stats.priority_dispatches += 1;
                self.dispatch(idx, priority);
            }

            let mut ran_round_robin = false;
            for idx in round_robin_queue {
                if self.tasks[idx].state == TaskState::Running {
                    self.stats.round_robin_dispatches += 1;
                    self.dispatch(idx, Priority::ZERO);
                    ran_round_robin = true;
                    break;
                }
            }

            if !ran_round_robin {
                self.run_idle_hook();
                break;
            }
        }
    }

    /// Run the scheduling loop until `stop()` is called or the task table
    /// becomes empty.
    pub fn run(&mut self) {
        loop {
            self.sweep_dead();
            if self.stop_requested || self.tasks.is_empty() {
                break;
            }
            self.run_pass();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::WaitCondition;
    use core::cell::Cell;
    use alloc::rc::Rc;
    use proptest::prelude::*;

    struct FakeClock(Rc<Cell<u32>>);
    impl Clock for FakeClock {
        fn now_micros(&self) -> u32 {
            self.0.get()
        }
    }

    fn advance(clock: &Rc<Cell<u32>>, delta: u32) {
        clock.set(clock.get().wrapping_add(delta) & timer::TIMERPERIOD);
    }

    struct Counter {
        log: Rc<core::cell::RefCell<Vec<&'static str>>>,
        label: &'static str,
        runs_left: u32,
    }

    impl TaskBody for Counter {
        fn resume(&mut self, _wake: Priority) -> Poll {
            if self.runs_left == 0 {
                return Poll::Done;
            }
            self.runs_left -= 1;
            self.log.borrow_mut().push(self.label);
            Poll::Wait(WaitCondition::RoundRobin)
        }
    }

    struct StopAfter {
        clock: Rc<Cell<u32>>,
        deadline_micros: u32,
        armed: bool,
    }

    impl TaskBody for StopAfter {
        fn resume(&mut self, _wake: Priority) -> Poll {
            if !self.armed {
                self.armed = true;
                let now = self.clock.get();
                return Poll::Wait(WaitCondition::timeout(now, self.deadline_micros).unwrap());
            }
            Poll::Done
        }
    }

    #[test]
    fn round_robin_tasks_alternate_and_priority_tasks_run_first() {
        let raw = Rc::new(Cell::new(0u32));
        let clock = FakeClock(raw.clone());
        let mut sched = Scheduler::new(clock, SchedulerConfig::default());

        let log = Rc::new(core::cell::RefCell::new(Vec::new()));
        sched.add_thread(Counter { log: log.clone(), label: "A", runs_left: 3 });
        sched.add_thread(Counter { log: log.clone(), label: "B", runs_left: 3 });

        struct Ticker {
            clock: Rc<Cell<u32>>,
            passes_left: u32,
        }
        impl TaskBody for Ticker {
            fn resume(&mut self, _wake: Priority) -> Poll {
                if self.passes_left == 0 {
                    return Poll::Done;
                }
                self.passes_left -= 1;
                advance(&self.clock, 1);
                Poll::Wait(WaitCondition::RoundRobin)
            }
        }
        sched.add_thread(Ticker { clock: raw.clone(), passes_left: 6 });

        sched.run();

        let seen = log.borrow();
        assert!(seen.iter().filter(|&&s| s == "A").count() >= 3);
        assert!(seen.iter().filter(|&&s| s == "B").count() >= 3);
    }

    #[test]
    fn larger_priority_triple_resumes_before_a_smaller_one_in_the_same_pass() {
        let raw = Rc::new(Cell::new(0u32));
        let clock = FakeClock(raw.clone());
        let mut sched = Scheduler::new(clock, SchedulerConfig::default());
        let log = Rc::new(core::cell::RefCell::new(Vec::new()));

        // Logs only on its *scheduled* resumption, not the synchronous
        // first drive performed by `add_thread`, so the log reflects
        // actual dispatch order within a pass.
        struct LogOnSecondCall {
            log: Rc<core::cell::RefCell<Vec<&'static str>>>,
            label: &'static str,
            first_call: bool,
        }
        impl TaskBody for LogOnSecondCall {
            fn resume(&mut self, _wake: Priority) -> Poll {
                if self.first_call {
                    self.first_call = false;
                    // A deadline far enough out that it never elapses
                    // before the test overwrites it directly below.
                    return Poll::Wait(WaitCondition::timeout(0, crate::timer::MAX_DELAY - 1).unwrap());
                }
                self.log.borrow_mut().push(self.label);
                Poll::Done
            }
        }

        sched.add_thread(LogOnSecondCall { log: log.clone(), label: "small", first_call: true });
        sched.add_thread(LogOnSecondCall { log: log.clone(), label: "large", first_call: true });

        // Directly install distinct Timeout waits, already elapsed by
        // different amounts, bypassing the task bodies (they have no way
        // to request a specific overrun deterministically).
        let now = raw.get();
        sched.tasks[0].wait = WaitCondition::timeout(now.wrapping_sub(5), 1).unwrap();
        sched.tasks[1].wait = WaitCondition::timeout(now.wrapping_sub(50), 1).unwrap();

        sched.run_pass();

        let seen = log.borrow();
        assert_eq!(seen.as_slice(), &["large", "small"]);
    }

    #[test]
    fn pause_then_resume_skips_execution_while_paused() {
        let raw = Rc::new(Cell::new(0u32));
        let clock = FakeClock(raw.clone());
        let mut sched = Scheduler::new(clock, SchedulerConfig::default());
        let log = Rc::new(core::cell::RefCell::new(Vec::new()));
        let pid = sched
            .add_thread(Counter { log: log.clone(), label: "T2", runs_left: 10 })
            .unwrap();

        sched.pause(pid).unwrap();
        assert_eq!(sched.pause(pid), Ok(())); // idempotent, already paused
        sched.resume(pid).unwrap();
        sched.stop_task(pid).unwrap();
        assert_eq!(sched.resume(Pid(999)), Err(SchedulerError::UnknownPid(Pid(999))));
    }

    #[test]
    fn stop_request_halts_the_run_loop() {
        let raw = Rc::new(Cell::new(0u32));
        let clock = FakeClock(raw.clone());
        let mut sched = Scheduler::new(clock, SchedulerConfig::default());
        let log = Rc::new(core::cell::RefCell::new(Vec::new()));

        struct Forever {
            log: Rc<core::cell::RefCell<Vec<&'static str>>>,
        }
        impl TaskBody for Forever {
            fn resume(&mut self, _wake: Priority) -> Poll {
                self.log.borrow_mut().push("tick");
                Poll::Wait(WaitCondition::RoundRobin)
            }
        }
        sched.add_thread(Forever { log: log.clone() });

        // A round-robin task that requests shutdown after a few ticks.
        struct Stopper {
            remaining: u32,
        }
        impl TaskBody for Stopper {
            fn resume(&mut self, _wake: Priority) -> Poll {
                if self.remaining == 0 {
                    return Poll::Done;
                }
                self.remaining -= 1;
                Poll::Wait(WaitCondition::RoundRobin)
            }
        }
        sched.add_thread(Stopper { remaining: 2 });

        // Can't call sched.stop() from inside a task body in this simple
        // harness, so drive a bounded number of passes manually instead.
        for _ in 0..3 {
            sched.run_pass();
        }
        assert_eq!(sched.stats().passes, 3);

        // `stop()` is observed at the *next* pass boundary, which is the
        // very next thing `run()`'s loop checks on entry - so once it has
        // been requested, `run()` must not execute another pass at all.
        sched.stop();
        sched.run();
        assert!(log.borrow().len() >= 3);
        assert_eq!(sched.stats().passes, 3, "run() must not start a new pass once stop() was requested");
    }

    proptest! {
        /// §8: "every priority task runs at least once before any
        /// round-robin task in the same pass," for any mix of already-due
        /// timeout tasks and round-robin tasks.
        #[test]
        fn priority_tasks_run_before_round_robin_in_one_pass(
            priority_overruns in prop::collection::vec(1u32..10_000, 1usize..6),
            round_robin_count in 0usize..6,
        ) {
            struct LogOnResume {
                log: Rc<core::cell::RefCell<Vec<&'static str>>>,
                label: &'static str,
            }
            impl TaskBody for LogOnResume {
                fn resume(&mut self, _wake: Priority) -> Poll {
                    self.log.borrow_mut().push(self.label);
                    Poll::Done
                }
            }

            let raw = Rc::new(Cell::new(0u32));
            let clock = FakeClock(raw.clone());
            let mut sched = Scheduler::new(clock, SchedulerConfig::default());
            let log = Rc::new(core::cell::RefCell::new(Vec::new()));

            for _ in &priority_overruns {
                sched.add_thread(LogOnResume { log: log.clone(), label: "priority" });
            }
            for _ in 0..round_robin_count {
                sched.add_thread(LogOnResume { log: log.clone(), label: "roundrobin" });
            }

            // Install already-elapsed Timeout waits with distinct overruns
            // on the priority tasks (the task bodies above have no way to
            // request a specific overrun deterministically); leave the
            // trailing round-robin tasks' WaitCondition::RoundRobin as-is.
            let now = raw.get();
            for (idx, &overrun) in priority_overruns.iter().enumerate() {
                sched.tasks[idx].wait = WaitCondition::timeout(now.wrapping_sub(overrun), 1).unwrap();
            }

            sched.run_pass();

            let seen = log.borrow();
            let last_priority = seen.iter().rposition(|&s| s == "priority");
            let first_round_robin = seen.iter().position(|&s| s == "roundrobin");
            if let (Some(last_p), Some(first_r)) = (last_priority, first_round_robin) {
                prop_assert!(last_p < first_r, "a round-robin task ran before some priority task");
            }
            prop_assert_eq!(
                seen.iter().filter(|&&s| s == "priority").count(),
                priority_overruns.len(),
            );
        }

        /// §8: "for all pairs of priority tasks with distinct triples, the
        /// one with the larger triple resumes first within a pass."
        #[test]
        fn larger_overrun_always_resumes_first(overruns in prop::collection::vec(1u32..100_000, 2usize..8)) {
            struct LogOnResume {
                log: Rc<core::cell::RefCell<Vec<usize>>>,
                id: usize,
            }
            impl TaskBody for LogOnResume {
                fn resume(&mut self, _wake: Priority) -> Poll {
                    self.log.borrow_mut().push(self.id);
                    Poll::Done
                }
            }

            let raw = Rc::new(Cell::new(0u32));
            let clock = FakeClock(raw.clone());
            let mut sched = Scheduler::new(clock, SchedulerConfig::default());
            let log = Rc::new(core::cell::RefCell::new(Vec::new()));

            for id in 0..overruns.len() {
                sched.add_thread(LogOnResume { log: log.clone(), id });
            }

            let now = raw.get();
            for (idx, &overrun) in overruns.iter().enumerate() {
                sched.tasks[idx].wait = WaitCondition::timeout(now.wrapping_sub(overrun), 1).unwrap();
            }

            sched.run_pass();

            // Expected dispatch order: task ids sorted by descending overrun.
            let mut expected: Vec<usize> = (0..overruns.len()).collect();
            expected.sort_by_key(|&id| core::cmp::Reverse(overruns[id]));
            prop_assert_eq!(log.borrow().clone(), expected);
        }
    }
}
