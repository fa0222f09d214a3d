use bit_field::BitField;
use std::{
    convert::TryFrom,
    fmt::{self, Display, Formatter},
};

/// Events serve two purposes: tracking Task state during recording, and
/// being stored in traces to guide replay. The numeric values are stored
/// in traces so they must never be reordered.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EventType {
    EvUnassigned = 0,
    EvSentinel = 1,
    EvNoop = 2,
    EvDesched = 3,
    EvSeccompTrap = 4,
    EvSyscallInterruption = 5,
    /// Marks a recording that ended abnormally early, e.g. because rd was
    /// interrupted by a fatal signal.
    EvTraceTermination = 6,

    /// Events present in traces:

    /// No associated data.
    EvExit = 7,
    /// Scheduling signal interrupted the trace.
    EvSched = 8,
    /// A disabled RDTSC or CPUID instruction.
    EvInstructionTrap = 9,
    /// Recorded syscallbuf data for one or more buffered syscalls.
    EvSyscallbufFlush = 10,
    EvSyscallbufAbortCommit = 11,
    EvSyscallbufReset = 12,
    /// Syscall was entered, the syscall instruction was patched, and the
    /// syscall was aborted. Resume execution at the patch.
    EvPatchSyscall = 13,
    /// Map memory pages due to a (future) memory access. This is associated
    /// with a mmap entry for the new pages.
    EvGrowMap = 14,
    /// Data is the signal number.
    EvSignal = 15,
    EvSignalDelivery = 16,
    EvSignalHandler = 17,
    /// Data is the syscall number.
    EvSyscall = 18,

    EvLast = 19,
}

const EVENT_TYPES: [EventType; 20] = [
    EventType::EvUnassigned,
    EventType::EvSentinel,
    EventType::EvNoop,
    EventType::EvDesched,
    EventType::EvSeccompTrap,
    EventType::EvSyscallInterruption,
    EventType::EvTraceTermination,
    EventType::EvExit,
    EventType::EvSched,
    EventType::EvInstructionTrap,
    EventType::EvSyscallbufFlush,
    EventType::EvSyscallbufAbortCommit,
    EventType::EvSyscallbufReset,
    EventType::EvPatchSyscall,
    EventType::EvGrowMap,
    EventType::EvSignal,
    EventType::EvSignalDelivery,
    EventType::EvSignalHandler,
    EventType::EvSyscall,
    EventType::EvLast,
];

// The event type must fit in the 5 type bits of an EncodedEvent.
const_assert!((EventType::EvLast as u32) < 32);

impl TryFrom<u32> for EventType {
    type Error = u32;

    fn try_from(val: u32) -> Result<Self, Self::Error> {
        match EVENT_TYPES.get(val as usize) {
            Some(&t) if t != EventType::EvLast => Ok(t),
            _ => Err(val),
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::EvUnassigned => "(unassigned)",
            EventType::EvSentinel => "(sentinel)",
            EventType::EvNoop => "NOOP",
            EventType::EvDesched => "DESCHED",
            EventType::EvSeccompTrap => "SECCOMP_TRAP",
            EventType::EvSyscallInterruption => "SYSCALL_INTERRUPTION",
            EventType::EvTraceTermination => "TRACE_TERMINATION",
            EventType::EvExit => "EXIT",
            EventType::EvSched => "SCHED",
            EventType::EvInstructionTrap => "INSTRUCTION_TRAP",
            EventType::EvSyscallbufFlush => "SYSCALLBUF_FLUSH",
            EventType::EvSyscallbufAbortCommit => "SYSCALLBUF_ABORT_COMMIT",
            EventType::EvSyscallbufReset => "SYSCALLBUF_RESET",
            EventType::EvPatchSyscall => "PATCH_SYSCALL",
            EventType::EvGrowMap => "GROW_MAP",
            EventType::EvSignal => "SIGNAL",
            EventType::EvSignalDelivery => "SIGNAL_DELIVERY",
            EventType::EvSignalHandler => "SIGNAL_HANDLER",
            EventType::EvSyscall => "SYSCALL",
            EventType::EvLast => "(last)",
        };
        write!(f, "{}", name)
    }
}

const TYPE_BITS: std::ops::Range<usize> = 0..5;
const IS_SYSCALL_ENTRY_BIT: usize = 5;
const DATA_BITS: std::ops::Range<usize> = 6..32;
/// Largest value that fits the event data bits.
pub const MAX_EVENT_DATA: u32 = (1 << 26) - 1;

/// The packed 32-bit form of an Event that is stored in trace frames.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct EncodedEvent(u32);

impl EncodedEvent {
    pub fn from_raw(encoded: u32) -> EncodedEvent {
        EncodedEvent(encoded)
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }

    pub fn event_type(&self) -> Result<EventType, u32> {
        EventType::try_from(self.0.get_bits(TYPE_BITS))
    }

    pub fn is_syscall_entry(&self) -> bool {
        self.0.get_bit(IS_SYSCALL_ENTRY_BIT)
    }

    pub fn data(&self) -> u32 {
        self.0.get_bits(DATA_BITS)
    }

    pub fn is_trace_termination(&self) -> bool {
        self.event_type() == Ok(EventType::EvTraceTermination)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallState {
    EnteringSyscall,
    ExitingSyscall,
}

/// An event the tracer wants in the trace. This core only needs to be able
/// to pack and unpack it; the meaning of `data` depends on the event type.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Event {
    event_type: EventType,
    is_syscall_entry: bool,
    data: u32,
}

impl Default for Event {
    fn default() -> Self {
        Event::new(EventType::EvUnassigned, 0)
    }
}

impl Event {
    /// `data` is masked to the 26 bits an EncodedEvent can carry.
    pub fn new(event_type: EventType, data: u32) -> Event {
        Event {
            event_type,
            is_syscall_entry: false,
            data: data & MAX_EVENT_DATA,
        }
    }

    pub fn sched() -> Event {
        Event::new(EventType::EvSched, 0)
    }

    pub fn exit() -> Event {
        Event::new(EventType::EvExit, 0)
    }

    pub fn grow_map() -> Event {
        Event::new(EventType::EvGrowMap, 0)
    }

    pub fn trace_termination() -> Event {
        Event::new(EventType::EvTraceTermination, 0)
    }

    pub fn syscall(number: u32, state: SyscallState) -> Event {
        let mut ev = Event::new(EventType::EvSyscall, number);
        ev.is_syscall_entry = state == SyscallState::EnteringSyscall;
        ev
    }

    /// `event_type` should be one of the signal event types.
    pub fn signal(event_type: EventType, sig: u32) -> Event {
        debug_assert!(matches!(
            event_type,
            EventType::EvSignal | EventType::EvSignalDelivery | EventType::EvSignalHandler
        ));
        Event::new(event_type, sig)
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn data(&self) -> u32 {
        self.data
    }

    pub fn is_syscall_event(&self) -> bool {
        self.event_type == EventType::EvSyscall
    }

    pub fn is_signal_event(&self) -> bool {
        matches!(
            self.event_type,
            EventType::EvSignal | EventType::EvSignalDelivery | EventType::EvSignalHandler
        )
    }

    pub fn syscall_state(&self) -> Option<SyscallState> {
        if !self.is_syscall_event() {
            return None;
        }
        if self.is_syscall_entry {
            Some(SyscallState::EnteringSyscall)
        } else {
            Some(SyscallState::ExitingSyscall)
        }
    }

    /// Does the frame for this event carry a meaningful register snapshot?
    pub fn record_regs(&self) -> bool {
        !matches!(
            self.event_type,
            EventType::EvTraceTermination | EventType::EvExit | EventType::EvUnassigned
        )
    }

    pub fn encode(&self) -> EncodedEvent {
        let mut encoded: u32 = 0;
        encoded.set_bits(TYPE_BITS, self.event_type as u32);
        encoded.set_bit(IS_SYSCALL_ENTRY_BIT, self.is_syscall_entry);
        encoded.set_bits(DATA_BITS, self.data);
        EncodedEvent(encoded)
    }

    /// Returns the unknown type number if `encoded` doesn't name an event type.
    pub fn decode(encoded: EncodedEvent) -> Result<Event, u32> {
        let event_type = encoded.event_type()?;
        Ok(Event {
            event_type,
            is_syscall_entry: encoded.is_syscall_entry(),
            data: encoded.data(),
        })
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.event_type {
            EventType::EvSyscall => {
                let state = if self.is_syscall_entry {
                    "entering"
                } else {
                    "exiting"
                };
                write!(f, "{}: {} {}", self.event_type, state, self.data)
            }
            EventType::EvSignal | EventType::EvSignalDelivery | EventType::EvSignalHandler => {
                write!(f, "{}: sig {}", self.event_type, self.data)
            }
            _ => write!(f, "{}", self.event_type),
        }
    }
}
