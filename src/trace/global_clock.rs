use crate::trace::trace_frame::FrameTime;
use std::fmt::{self, Display, Formatter};

/// Default number of frames in each `trace_<n>` file.
pub const DEFAULT_FRAMES_PER_FILE: u64 = 1 << 20;

/// Where a frame lives in a trace directory: which frame file and which
/// frame of that file (1-based). Unlike a bare global time this names the
/// physical record, so it stays unambiguous when a trace spans many files.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FrameCoord {
    pub file_index: u32,
    pub file_time: u64,
}

impl Display for FrameCoord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "trace_{}:{}", self.file_index, self.file_time)
    }
}

/// Arbitrary notion of trace time, ticked on the recording of each event
/// (trace frame). The recorder ticks it once per frame written; the replayer
/// ticks it once per frame read, so both sides see the same sequence without
/// sharing anything but the trace itself.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct GlobalClock {
    global_time: FrameTime,
    frames_per_file: u64,
}

impl GlobalClock {
    /// A clock at time 0: nothing recorded yet. The first frame gets time 1.
    pub fn new(frames_per_file: u64) -> GlobalClock {
        debug_assert!(frames_per_file > 0);
        GlobalClock {
            global_time: 0,
            frames_per_file,
        }
    }

    pub fn time(&self) -> FrameTime {
        self.global_time
    }

    pub fn frames_per_file(&self) -> u64 {
        self.frames_per_file
    }

    /// Increment the global time and return the incremented value.
    pub fn tick(&mut self) -> FrameTime {
        self.global_time += 1;
        self.global_time
    }

    pub fn reset(&mut self) {
        self.global_time = 0;
    }

    /// Coordinate of the frame at the current time. `file_time` is 0 before
    /// the first tick.
    pub fn coord(&self) -> FrameCoord {
        self.coord_of(self.global_time)
    }

    /// Coordinate the next tick will produce.
    pub fn next_coord(&self) -> FrameCoord {
        self.coord_of(self.global_time + 1)
    }

    pub fn coord_of(&self, time: FrameTime) -> FrameCoord {
        if time == 0 {
            return FrameCoord::default();
        }
        FrameCoord {
            file_index: ((time - 1) / self.frames_per_file) as u32,
            file_time: (time - 1) % self.frames_per_file + 1,
        }
    }
}
