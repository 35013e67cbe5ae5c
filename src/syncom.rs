//! SynCom: a full-duplex, bit-banged synchronous serial link implemented as
//! a single long-lived scheduler task per endpoint.
//!
//! The public [`SynCom`] handle and the task it spawns are deliberately
//! split the same way the teacher splits `SchedulerCore` (stable API) from
//! `RoundRobinPolicy` (the thing that actually runs): [`SynCom`] is what the
//! rest of the application calls (`send`, `get`, `any`, ...); [`LinkTask`]
//! is the `TaskBody` the scheduler actually drives, and the two share
//! state through an `Rc<RefCell<_>>` - safe here only because the
//! scheduling model is single-threaded cooperative multitasking with no
//! preemption, so there is never a concurrent borrow.
//!
//! Sync acquisition yields to the scheduler on every bit (there is no
//! hard timing requirement on finding the preamble). Steady-state
//! character exchange does not: each bit-wait is a tight spin on the
//! clock line, and the task only yields back to the scheduler every
//! `latency` characters. That is deliberate - on the bare-metal target
//! this crate is written for, the peer's clock edge is a real,
//! independent electrical event, so spinning for it costs nothing but
//! time; yielding to the scheduler mid-character would not make the
//! edge arrive any sooner.

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::{Cell, RefCell};
use core::marker::PhantomData;

use crate::error::LinkError;
use crate::gpio::{InputPin, OutputPin, ResetPin};
use crate::scheduler::Scheduler;
use crate::serializer::Serializer;
use crate::task::{Pid, Poll, TaskBody};
use crate::timer::{self, Clock};
use crate::wait::{Priority, WaitCondition};

/// Handshake preamble both endpoints must observe before entering
/// steady-state exchange.
pub const SYNC_BYTE: u8 = 0x9D;

/// Data bits per steady-state character. Payload bytes must be 7-bit clean.
const CHAR_BITS: u8 = 7;

/// Longest message this link can carry. Chosen to keep the FIFOs usable on
/// a memory-constrained target without a heap-backed unbounded queue.
pub const MAX_MSG_LEN: usize = 64;

/// Depth of the inbound/outbound message FIFOs.
pub const MAX_QUEUED: usize = 8;

/// Characters exchanged before the link task voluntarily yields to the
/// scheduler, absent an application override.
pub const DEFAULT_LATENCY: u32 = 8;

/// One already-serialised application message, 7-bit clean by construction
/// (`SynCom::send_bytes` rejects anything else).
pub type Message = heapless::Vec<u8, MAX_MSG_LEN>;

/// Which end of the link this endpoint plays. The Initiator drives the
/// first clock edge; the Passive side mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Passive,
}

/// `Unstarted -> Syncing -> Running -> Dead`. Only `Running -> Dead` is
/// recoverable, via [`SynCom::start`] again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unstarted,
    Syncing,
    Running,
    Dead,
}

/// The four GPIOs the protocol bit-bangs over. Owned jointly by the
/// [`SynCom`] handle and whichever [`LinkTask`] is currently running,
/// through a shared `Rc<RefCell<_>>`, so a relaunch after a timeout can
/// reuse the same lines without the application re-acquiring them.
pub struct Pins {
    pub clock_out: Box<dyn OutputPin>,
    pub clock_in: Box<dyn InputPin>,
    pub data_out: Box<dyn OutputPin>,
    pub data_in: Box<dyn InputPin>,
}

struct Shared<Ser, T> {
    lsttx: heapless::Deque<Message, MAX_QUEUED>,
    lstrx: heapless::Deque<Message, MAX_QUEUED>,
    state: LinkState,
    serializer: Ser,
    _value: PhantomData<T>,
}

/// A full-duplex synchronous serial endpoint, running as a single
/// long-lived scheduler task once [`start`](SynCom::start) is called.
pub struct SynCom<Ser, T> {
    shared: Rc<RefCell<Shared<Ser, T>>>,
    pins: Rc<RefCell<Pins>>,
    timeout_micros: Rc<Cell<u32>>,
    clock: Rc<dyn Clock>,
    role: Role,
    latency: u32,
    task_pid: Option<Pid>,
}

impl<Ser: Serializer<T>, T> SynCom<Ser, T> {
    pub fn new(role: Role, pins: Pins, serializer: Ser, clock: Rc<dyn Clock>, latency: Option<u32>) -> Self {
        SynCom {
            shared: Rc::new(RefCell::new(Shared {
                lsttx: heapless::Deque::new(),
                lstrx: heapless::Deque::new(),
                state: LinkState::Unstarted,
                serializer,
                _value: PhantomData,
            })),
            pins: Rc::new(RefCell::new(pins)),
            timeout_micros: Rc::new(Cell::new(0)),
            clock,
            role,
            latency: latency.unwrap_or(DEFAULT_LATENCY).max(1),
            task_pid: None,
        }
    }

    /// Launch (or relaunch) the link task. If a task from a previous call
    /// is still in the scheduler's table, it is marked Dead first.
    pub fn start<C: Clock>(
        &mut self,
        scheduler: &mut Scheduler<C>,
        reset: Option<(Box<dyn ResetPin>, bool)>,
    ) -> Pid {
        if let Some(old) = self.task_pid.take() {
            let _ = scheduler.stop_task(old);
        }
        self.shared.borrow_mut().state = LinkState::Syncing;
        let task = LinkTask {
            role: self.role,
            pins: self.pins.clone(),
            reset,
            shared: self.shared.clone() as Rc<RefCell<dyn SharedOps>>,
            timeout_micros: self.timeout_micros.clone(),
            clock: self.clock.clone(),
            latency_config: self.latency,
            latency_budget: self.latency,
            phase: false,
            odata: 0,
            inbits: 0,
            cursor: 0,
            current_out: None,
            current_in: Message::new(),
            step: Step::Init,
        };
        let pid = scheduler
            .add_thread(task)
            .expect("syncom link task must yield on its first resumption");
        self.task_pid = Some(pid);
        pid
    }

    /// Serialise `value` now (snapshot semantics) and enqueue it.
    pub fn send(&mut self, value: &T) -> Result<(), LinkError> {
        let bytes = self.shared.borrow().serializer.encode(value);
        self.send_bytes(&bytes)
    }

    /// Enqueue an already-serialised message.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if bytes.is_empty() {
            return Err(LinkError::NullByteInMessage);
        }
        if bytes.len() > MAX_MSG_LEN {
            return Err(LinkError::MessageTooLong { len: bytes.len(), max: MAX_MSG_LEN });
        }
        if bytes.iter().any(|&b| b == 0) {
            return Err(LinkError::NullByteInMessage);
        }
        let mut msg = Message::new();
        msg.extend_from_slice(bytes).map_err(|()| LinkError::MessageTooLong {
            len: bytes.len(),
            max: MAX_MSG_LEN,
        })?;
        self.shared
            .borrow_mut()
            .lsttx
            .push_back(msg)
            .map_err(|_| LinkError::QueueFull)
    }

    /// Number of fully received messages waiting to be read.
    pub fn any(&self) -> usize {
        self.shared.borrow().lstrx.len()
    }

    /// Pop the oldest received message as raw bytes.
    pub fn get_bytes(&mut self) -> Option<Message> {
        self.shared.borrow_mut().lstrx.pop_front()
    }

    /// Pop the oldest received message and deserialise it.
    pub fn get(&mut self) -> Option<Result<T, Ser::Error>> {
        let bytes = self.get_bytes()?;
        Some(self.shared.borrow().serializer.decode(&bytes))
    }

    /// A Poller Wait Condition a task can suspend on: fires with `1` once a
    /// message is available, or `2` if the link has died (so a waiting
    /// task unblocks instead of hanging forever on a dead peer).
    pub fn await_obj(&self) -> WaitCondition {
        let shared = self.shared.clone();
        WaitCondition::Poller(crate::wait::PollerWait::new(
            Box::new(move || {
                let s = shared.borrow();
                if !s.lstrx.is_empty() {
                    Some(1)
                } else if s.state == LinkState::Dead {
                    Some(2)
                } else {
                    None
                }
            }),
            None,
        ))
    }

    /// Configure the per-bit timeout; `0` disables it.
    pub fn set_timeout(&self, micros: u32) {
        self.timeout_micros.set(micros);
    }

    /// True while the link is syncing or exchanging; false once Dead.
    pub fn running(&self) -> bool {
        !matches!(self.shared.borrow().state, LinkState::Dead | LinkState::Unstarted)
    }

    pub fn state(&self) -> LinkState {
        self.shared.borrow().state
    }
}

/// Object-safe surface of [`Shared`] the link task needs, independent of
/// the application's value type `T` or serialiser `Ser` - lets [`LinkTask`]
/// avoid being generic over either.
trait SharedOps {
    fn clear_rx(&mut self);
    fn set_state(&mut self, state: LinkState);
    fn pop_outbound(&mut self) -> Option<Message>;
    fn push_inbound(&mut self, msg: Message) -> Result<(), Message>;
}

impl<Ser, T> SharedOps for Shared<Ser, T> {
    fn clear_rx(&mut self) {
        self.lstrx.clear();
    }

    fn set_state(&mut self, state: LinkState) {
        self.state = state;
    }

    fn pop_outbound(&mut self) -> Option<Message> {
        self.lsttx.pop_front()
    }

    fn push_inbound(&mut self, msg: Message) -> Result<(), Message> {
        self.lstrx.push_back(msg)
    }
}

#[derive(Clone, Copy)]
enum Step {
    Init,
    PulseReset,
    DeassertReset { deadline: u32 },
    AwaitPeerUp { deadline: u32 },
    /// Rolling 8-bit shift register, checked against `SYNC_BYTE` after
    /// every bit - matches the source's `_synchronise`, which keeps
    /// shifting until the window lines up rather than counting a fixed
    /// 8 bits.
    Syncing { indata: u16 },
    ClearRx,
    NextByte,
    AfterByte { received: u8 },
    Dead,
}

/// The `TaskBody` the scheduler actually drives. See the module doc for why
/// this is split from the public [`SynCom`] handle.
struct LinkTask {
    role: Role,
    pins: Rc<RefCell<Pins>>,
    reset: Option<(Box<dyn ResetPin>, bool)>,
    shared: Rc<RefCell<dyn SharedOps>>,
    timeout_micros: Rc<Cell<u32>>,
    clock: Rc<dyn Clock>,
    latency_config: u32,
    latency_budget: u32,
    /// Current polarity of this endpoint's own clock line.
    phase: bool,
    /// Outbound shift register for the character currently being sent.
    odata: u8,
    /// One-bit staging register: only the Passive side touches this. It
    /// holds a bit captured during the PREVIOUS character's exchange that
    /// belongs to the NEXT character - preserving the "Passive stages one
    /// inbound bit ahead" asymmetry verbatim from the source. See
    /// DESIGN.md for the reasoning; [`LinkTask::exchange_byte`] is the
    /// only place that reads or writes it.
    inbits: u8,
    cursor: usize,
    current_out: Option<Message>,
    current_in: Message,
    step: Step,
}

impl LinkTask {
    fn is_passive(&self) -> bool {
        matches!(self.role, Role::Passive)
    }

    fn now(&self) -> u32 {
        self.clock.now_micros()
    }

    fn cleanup(&mut self) {
        let mut pins = self.pins.borrow_mut();
        pins.data_out.set(false);
        pins.clock_out.set(false);
        drop(pins);
        self.shared.borrow_mut().set_state(LinkState::Dead);
    }

    /// Load the next character to transmit (a queued application byte, or
    /// `0` as a keepalive/terminator when nothing is queued) into `odata`.
    fn load_next_outbound_byte(&mut self) {
        if self.current_out.is_none() {
            self.current_out = self.shared.borrow_mut().pop_outbound();
            self.cursor = 0;
        }
        self.odata = match &mut self.current_out {
            Some(msg) if self.cursor < msg.len() => {
                let b = msg[self.cursor];
                self.cursor += 1;
                if self.cursor == msg.len() {
                    self.current_out = None;
                }
                b
            }
            _ => 0,
        };
    }

    /// One half-cycle of the steady-state exchange: busy-wait for the
    /// peer's clock to reach the expected phase, sample one inbound bit
    /// into `dest`, present the next outbound bit, and toggle this
    /// endpoint's own clock. Always shifts with a `CHAR_BITS`-wide window
    /// regardless of how many times it is called in a row, matching the
    /// source's `_get_bit`.
    fn get_bit(&mut self, dest: u16) -> Result<u16, LinkError> {
        let wait_value = self.phase ^ self.is_passive() ^ true;
        let start = self.now();
        loop {
            let clock_high = self.pins.borrow().clock_in.is_high();
            if clock_high != wait_value {
                break;
            }
            let configured = self.timeout_micros.get();
            if configured != 0 && timer::elapsed(self.now(), start) > configured {
                return Err(LinkError::Timeout);
            }
        }
        let bit = self.pins.borrow().data_in.is_high() as u16;
        let dest = (dest | (bit << CHAR_BITS)) >> 1;

        let mut pins = self.pins.borrow_mut();
        pins.data_out.set(self.odata & 1 != 0);
        self.odata >>= 1;
        self.phase = !self.phase;
        pins.clock_out.set(self.phase);
        Ok(dest)
    }

    /// Exchange one full character: 7 mutual bit edges. On the Passive
    /// side, the first bit of `indata` comes from `self.inbits` (staged
    /// during the previous character) and the loop instead spends its
    /// last iteration staging the NEXT character's leading bit - the
    /// source's `_get_byte_passive`. The Initiator has no such staging:
    /// all 7 bits of the current character are captured fresh.
    fn exchange_byte(&mut self) -> Result<u8, LinkError> {
        let received = if self.is_passive() {
            let mut indata = self.get_bit(self.inbits as u16)?;
            let mut next_inbits: u16 = 0;
            for _ in 0..(CHAR_BITS - 1) {
                next_inbits = self.get_bit(next_inbits)?;
            }
            indata &= (1u16 << CHAR_BITS) - 1;
            self.inbits = next_inbits as u8;
            indata
        } else {
            let mut indata: u16 = 0;
            for _ in 0..CHAR_BITS {
                indata = self.get_bit(indata)?;
            }
            indata & ((1u16 << CHAR_BITS) - 1)
        };
        Ok(received as u8)
    }
}

impl TaskBody for LinkTask {
    fn resume(&mut self, _wake: Priority) -> Poll {
        loop {
            let now = self.now();
            match self.step {
                Step::Init => {
                    self.odata = SYNC_BYTE;
                    self.inbits = 0;
                    let mut pins = self.pins.borrow_mut();
                    match self.role {
                        Role::Passive => {
                            pins.data_out.set(false);
                            pins.clock_out.set(false);
                            self.phase = false;
                        }
                        Role::Initiator => {
                            pins.data_out.set(self.odata & 1 != 0);
                            pins.clock_out.set(true);
                            self.odata >>= 1;
                            self.phase = true;
                        }
                    }
                    drop(pins);
                    self.step = Step::PulseReset;
                }
                Step::PulseReset => {
                    if let Some((reset_pin, asserted)) = &mut self.reset {
                        reset_pin.set_open_drain(true);
                        reset_pin.set(*asserted);
                        let deadline = timer::future(now, 100_000).unwrap_or(now);
                        self.step = Step::DeassertReset { deadline };
                        return Poll::Wait(WaitCondition::RoundRobin);
                    }
                    self.step = Step::Syncing { indata: 0 };
                }
                Step::DeassertReset { deadline } => {
                    if timer::after(now, deadline) == 0 {
                        return Poll::Wait(WaitCondition::RoundRobin);
                    }
                    if let Some((reset_pin, asserted)) = &mut self.reset {
                        reset_pin.set(!*asserted);
                    }
                    let settle = timer::future(now, 1_000_000).unwrap_or(now);
                    self.step = Step::AwaitPeerUp { deadline: settle };
                    return Poll::Wait(WaitCondition::RoundRobin);
                }
                Step::AwaitPeerUp { deadline } => {
                    if timer::after(now, deadline) == 0 {
                        return Poll::Wait(WaitCondition::RoundRobin);
                    }
                    self.step = Step::Syncing { indata: 0 };
                }
                Step::Syncing { indata } => {
                    let wait_value = self.phase ^ self.is_passive() ^ true;
                    let clock_high = self.pins.borrow().clock_in.is_high();
                    if clock_high == wait_value {
                        return Poll::Wait(WaitCondition::RoundRobin);
                    }
                    let bit = self.pins.borrow().data_in.is_high() as u16;
                    let indata = (indata | (bit << 8)) >> 1;

                    let mut pins = self.pins.borrow_mut();
                    pins.data_out.set(self.odata & 1 != 0);
                    self.odata >>= 1;
                    self.phase = !self.phase;
                    pins.clock_out.set(self.phase);
                    drop(pins);

                    if (indata & 0xFF) as u8 == SYNC_BYTE {
                        self.step = Step::ClearRx;
                    } else {
                        self.step = Step::Syncing { indata };
                        return Poll::Wait(WaitCondition::RoundRobin);
                    }
                }
                Step::ClearRx => {
                    self.shared.borrow_mut().clear_rx();
                    self.shared.borrow_mut().set_state(LinkState::Running);
                    self.step = Step::NextByte;
                    // Yield once at the sync/steady-state boundary rather
                    // than falling straight into the first character's
                    // busy-wait bit loop - keeps this transition a clean
                    // scheduler-visible event instead of disappearing
                    // inside whatever resumption happened to complete sync.
                    return Poll::Wait(WaitCondition::RoundRobin);
                }
                Step::NextByte => {
                    self.load_next_outbound_byte();
                    match self.exchange_byte() {
                        Ok(received) => self.step = Step::AfterByte { received },
                        Err(_) => {
                            log::warn!("syncom: per-bit timeout elapsed");
                            self.cleanup();
                            self.step = Step::Dead;
                            return Poll::Done;
                        }
                    }
                }
                Step::AfterByte { received } => {
                    if received != 0 {
                        if self.current_in.push(received).is_err() {
                            log::warn!("syncom: inbound message exceeded {MAX_MSG_LEN} bytes, dropping overflow byte");
                        }
                    } else if !self.current_in.is_empty() {
                        let msg = core::mem::replace(&mut self.current_in, Message::new());
                        if self.shared.borrow_mut().push_inbound(msg).is_err() {
                            log::warn!("syncom: inbound queue full, dropping completed message");
                        }
                    }
                    self.latency_budget = self.latency_budget.saturating_sub(1);
                    self.step = Step::NextByte;
                    if self.latency_budget == 0 {
                        self.latency_budget = self.latency_config;
                        return Poll::Wait(WaitCondition::RoundRobin);
                    }
                }
                Step::Dead => return Poll::Done,
            }
        }
    }
}
