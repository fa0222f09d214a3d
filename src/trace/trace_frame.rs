use crate::{
    event::{EncodedEvent, Event, SyscallState},
    perf_counters::{CounterSet, ExtraPerfCounters, PerfCounterValues, Ticks},
    registers::{Registers, REGISTERS_ENCODED_SIZE},
    trace::codec::{invalid_data, Decoder, Encoder},
};
use libc::pid_t;
use std::{
    io,
    io::{stdout, Write},
};

pub type FrameTime = u64;

/// On-disk size of the event-info block: global_time, thread_time, tid, ev.
pub const EVENT_INFO_SIZE: usize = 8 + 8 + 4 + 4;

assert_eq_size!(EncodedEvent, u32);
assert_eq_size!(pid_t, i32);

/// Identity and timing of a frame. This is the leading block of every frame
/// record and can be decoded without touching the execution state after it.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct EventInfo {
    pub global_time: FrameTime,
    pub thread_time: u64,
    pub tid: pid_t,
    pub ev: EncodedEvent,
}

impl EventInfo {
    fn encode_into(&self, e: &mut Encoder) {
        e.put_u64(self.global_time)
            .put_u64(self.thread_time)
            .put_i32(self.tid)
            .put_u32(self.ev.as_raw());
    }

    fn decode_from(d: &mut Decoder) -> io::Result<EventInfo> {
        Ok(EventInfo {
            global_time: d.get_u64()?,
            thread_time: d.get_u64()?,
            tid: d.get_i32()?,
            ev: EncodedEvent::from_raw(d.get_u32()?),
        })
    }

    /// Decode only the event-info block at the start of a frame record.
    pub fn decode(frame_record: &[u8]) -> io::Result<EventInfo> {
        if frame_record.len() < EVENT_INFO_SIZE {
            return Err(invalid_data(format!(
                "frame record of {} bytes has no room for event info",
                frame_record.len()
            )));
        }
        EventInfo::decode_from(&mut Decoder::new(&frame_record[..EVENT_INFO_SIZE]))
    }
}

/// Execution state captured with a frame: hardware counters and registers.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct ExecInfo {
    pub counters: PerfCounterValues,
    pub recorded_regs: Registers,
}

impl ExecInfo {
    pub fn encoded_size(counter_set: CounterSet) -> usize {
        counter_set.encoded_size() + REGISTERS_ENCODED_SIZE
    }

    fn encode_into(&self, counter_set: CounterSet, e: &mut Encoder) {
        let counters = self.counters.conform_to(counter_set);
        e.put_i64(counters.ticks);
        if let Some(extra) = counters.extra {
            e.put_i64(extra.hw_interrupts)
                .put_i64(extra.page_faults)
                .put_i64(extra.instructions);
        }
        self.recorded_regs.encode_into(e.buf_mut());
    }

    fn decode_from(d: &mut Decoder, counter_set: CounterSet) -> io::Result<ExecInfo> {
        let ticks = d.get_i64()?;
        let extra = match counter_set {
            CounterSet::Basic => None,
            CounterSet::Extended => Some(ExtraPerfCounters {
                hw_interrupts: d.get_i64()?,
                page_faults: d.get_i64()?,
                instructions: d.get_i64()?,
            }),
        };
        let recorded_regs = Registers::decode(d.get_raw(REGISTERS_ENCODED_SIZE)?)?;
        Ok(ExecInfo {
            counters: PerfCounterValues { ticks, extra },
            recorded_regs,
        })
    }
}

/// One recorded transition of the traced program.
///
/// We DONT want Copy
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct TraceFrame {
    pub(super) event_info: EventInfo,
    pub(super) exec_info: ExecInfo,
}

impl TraceFrame {
    pub fn new_with(event_info: EventInfo, exec_info: ExecInfo) -> TraceFrame {
        TraceFrame {
            event_info,
            exec_info,
        }
    }

    pub fn new() -> TraceFrame {
        Default::default()
    }

    /// Size of a frame record for a trace using `counter_set`.
    pub fn encoded_size(counter_set: CounterSet) -> usize {
        EVENT_INFO_SIZE + ExecInfo::encoded_size(counter_set)
    }

    pub fn encode(&self, counter_set: CounterSet) -> Vec<u8> {
        let mut e = Encoder::with_capacity(TraceFrame::encoded_size(counter_set));
        self.event_info.encode_into(&mut e);
        self.exec_info.encode_into(counter_set, &mut e);
        debug_assert_eq!(TraceFrame::encoded_size(counter_set), e.len());
        e.into_inner()
    }

    pub fn decode(record: &[u8], counter_set: CounterSet) -> io::Result<TraceFrame> {
        let expected = TraceFrame::encoded_size(counter_set);
        if record.len() != expected {
            return Err(invalid_data(format!(
                "frame record is {} bytes, expected {}",
                record.len(),
                expected
            )));
        }
        let mut d = Decoder::new(record);
        let event_info = EventInfo::decode_from(&mut d)?;
        if let Err(t) = event_info.ev.event_type() {
            return Err(invalid_data(format!(
                "unknown event type {} in frame at time {}",
                t, event_info.global_time
            )));
        }
        let exec_info = ExecInfo::decode_from(&mut d, counter_set)?;
        d.finish()?;
        Ok(TraceFrame {
            event_info,
            exec_info,
        })
    }

    pub fn event_info(&self) -> &EventInfo {
        &self.event_info
    }
    pub fn exec_info(&self) -> &ExecInfo {
        &self.exec_info
    }

    pub fn time(&self) -> FrameTime {
        self.event_info.global_time
    }
    pub fn thread_time(&self) -> u64 {
        self.event_info.thread_time
    }
    pub fn tid(&self) -> pid_t {
        self.event_info.tid
    }
    pub fn encoded_event(&self) -> EncodedEvent {
        self.event_info.ev
    }
    /// Decoded frames always carry a known event type; anything else shows
    /// up as `EvUnassigned`.
    pub fn event(&self) -> Event {
        Event::decode(self.event_info.ev).unwrap_or_default()
    }
    pub fn ticks(&self) -> Ticks {
        self.exec_info.counters.ticks
    }
    pub fn counters(&self) -> &PerfCounterValues {
        &self.exec_info.counters
    }
    pub fn regs_ref(&self) -> &Registers {
        &self.exec_info.recorded_regs
    }

    /// Log a human-readable representation of this to `out`
    /// (defaulting to stdout), as a single newline terminated line.
    pub fn dump(&self, maybe_out: Option<&mut dyn Write>) -> io::Result<()> {
        let sout = &mut stdout();
        let out = maybe_out.unwrap_or(sout);
        let ev = self.event();
        write!(
            out,
            "{{ global_time:{}, thread_time:{}, event:`{}' ",
            self.time(),
            self.thread_time(),
            ev
        )?;
        if let Some(state) = ev.syscall_state() {
            let state = match state {
                SyscallState::EnteringSyscall => "ENTERING_SYSCALL",
                SyscallState::ExitingSyscall => "EXITING_SYSCALL",
            };
            write!(out, "(state:{}) ", state)?;
        }
        write!(out, "tid:{}, {} }}", self.tid(), self.counters())?;
        if ev.record_regs() {
            write!(out, " ")?;
            self.regs_ref().write_register_file_compact(out)?;
        }
        writeln!(out)
    }

    /// Log a human-readable representation of this to `out`
    /// (defaulting to stdout), including a newline character.  An
    /// easily machine-parseable format is dumped.
    pub fn dump_raw(&self, maybe_out: Option<&mut dyn Write>) -> io::Result<()> {
        let sout = &mut stdout();
        let out = maybe_out.unwrap_or(sout);
        write!(
            out,
            " {} {} {} {}",
            self.time(),
            self.tid(),
            self.event().event_type() as i32,
            self.ticks()
        )?;
        if self.event().record_regs() {
            self.regs_ref().write_register_file_for_trace_raw(out)?;
        }
        writeln!(out)
    }
}
