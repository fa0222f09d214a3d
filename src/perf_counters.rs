use std::fmt::{self, Display, Formatter};

/// Retired conditional branches since the previous frame of the same thread.
/// Replay uses this to re-synchronize with the recording.
pub type Ticks = i64;

/// Which hardware counters a trace carries in every frame.
///
/// Chosen once per trace (see `TraceOptions::extended_counters`) and stored in the
/// trace header so the reader knows the frame layout.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CounterSet {
    /// Ticks only.
    Basic,
    /// Ticks plus interrupts, page faults and instructions.
    Extended,
}

impl CounterSet {
    pub fn from_extended(extended: bool) -> CounterSet {
        if extended {
            CounterSet::Extended
        } else {
            CounterSet::Basic
        }
    }

    pub fn is_extended(self) -> bool {
        self == CounterSet::Extended
    }

    /// On-disk size of the counters part of a frame.
    pub fn encoded_size(self) -> usize {
        match self {
            CounterSet::Basic => 8,
            CounterSet::Extended => 8 + 3 * 8,
        }
    }
}

#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct ExtraPerfCounters {
    pub hw_interrupts: i64,
    pub page_faults: i64,
    pub instructions: i64,
}

/// Counter values sampled at an event boundary.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct PerfCounterValues {
    pub ticks: Ticks,
    /// Present only in traces recorded with `CounterSet::Extended`.
    pub extra: Option<ExtraPerfCounters>,
}

impl PerfCounterValues {
    pub fn ticks_only(ticks: Ticks) -> PerfCounterValues {
        PerfCounterValues { ticks, extra: None }
    }

    /// Shape these values to `set`: extras are dropped for `Basic` and
    /// zero-filled when missing for `Extended`.
    pub fn conform_to(&self, set: CounterSet) -> PerfCounterValues {
        match set {
            CounterSet::Basic => PerfCounterValues::ticks_only(self.ticks),
            CounterSet::Extended => PerfCounterValues {
                ticks: self.ticks,
                extra: Some(self.extra.unwrap_or_default()),
            },
        }
    }

    pub fn counter_set(&self) -> CounterSet {
        CounterSet::from_extended(self.extra.is_some())
    }
}

impl Display for PerfCounterValues {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ticks:{}", self.ticks)?;
        if let Some(extra) = &self.extra {
            write!(
                f,
                " hw_interrupts:{} page_faults:{} instructions:{}",
                extra.hw_interrupts, extra.page_faults, extra.instructions
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conform_drops_extras_for_basic() {
        let v = PerfCounterValues {
            ticks: 10,
            extra: Some(ExtraPerfCounters {
                hw_interrupts: 1,
                page_faults: 2,
                instructions: 3,
            }),
        };
        assert_eq!(PerfCounterValues::ticks_only(10), v.conform_to(CounterSet::Basic));
        assert_eq!(v, v.conform_to(CounterSet::Extended));
    }

    #[test]
    fn conform_zero_fills_for_extended() {
        let v = PerfCounterValues::ticks_only(5).conform_to(CounterSet::Extended);
        assert_eq!(Some(ExtraPerfCounters::default()), v.extra);
        assert_eq!(CounterSet::Extended, v.counter_set());
        assert_eq!(32, CounterSet::Extended.encoded_size());
    }
}
