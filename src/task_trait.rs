use crate::{perf_counters::PerfCounterValues, registers::Registers};
use libc::pid_t;

/// What the trace writer needs to know about the thread an event belongs to.
///
/// Implemented by the tracer. Everything is sampled at the moment a
/// `record_*` call is made.
pub trait RecordTask {
    fn tid(&self) -> pid_t;
    /// Per-thread logical event count.
    fn thread_time(&self) -> u64;
    fn regs(&self) -> &Registers;
    /// Counter values accumulated since this thread's previous frame.
    fn counters(&self) -> PerfCounterValues;
}

/// A plain snapshot of a thread's state. Tracers that already hold the values
/// can fill one in instead of implementing `RecordTask` themselves.
#[derive(Clone, Default, Debug)]
pub struct TaskSnapshot {
    pub tid: pid_t,
    pub thread_time: u64,
    pub regs: Registers,
    pub counters: PerfCounterValues,
}

impl TaskSnapshot {
    pub fn new(tid: pid_t) -> TaskSnapshot {
        TaskSnapshot {
            tid,
            ..Default::default()
        }
    }
}

impl RecordTask for TaskSnapshot {
    fn tid(&self) -> pid_t {
        self.tid
    }
    fn thread_time(&self) -> u64 {
        self.thread_time
    }
    fn regs(&self) -> &Registers {
        &self.regs
    }
    fn counters(&self) -> PerfCounterValues {
        self.counters
    }
}
