use crate::{
    perf_counters::CounterSet,
    remote_ptr::{RemotePtr, Void},
    trace::{
        codec::{invalid_data, Decoder, Encoder},
        global_clock::{FrameCoord, GlobalClock},
        substream_reader::decode_framed,
        substream_writer::encode_framed,
        trace_frame::FrameTime,
    },
    util::{base_name, dir_exists, trace_save_dir},
};
use libc::pid_t;
use std::{
    convert::TryInto,
    ffi::OsStr,
    fmt::{self, Display, Formatter},
    fs::DirBuilder,
    io,
    os::unix::{ffi::OsStrExt, fs::DirBuilderExt},
    path::{Path, PathBuf},
};

/// Bump this whenever the layout of any record changes.
pub const TRACE_VERSION: u32 = 1;

/// Append-only files in a trace directory besides the frame files.
/// Update `SUBSTREAMS` when you update this list.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Substream {
    /// Where, when and for whom each raw data record was captured.
    RawDataHeader,
    /// The bytes of each raw data record.
    RawData,
    /// Substream that stores metadata about files mmap'd during
    /// recording.
    Mmaps,
}

pub const SUBSTREAMS: [Substream; 3] = [Substream::RawDataHeader, Substream::RawData, Substream::Mmaps];

impl Substream {
    pub fn iter() -> impl Iterator<Item = &'static Substream> {
        SUBSTREAMS.iter()
    }

    pub fn name(self) -> &'static str {
        match self {
            Substream::RawDataHeader => "data_header",
            Substream::RawData => "data",
            Substream::Mmaps => "mmaps",
        }
    }
}

const EVENTS_FILE_PREFIX: &str = "trace_";
const ARGS_ENV_FILE: &str = "args_env";
const VERSION_FILE: &str = "version";
const INCOMPLETE_VERSION_FILE: &str = "incomplete";
const LATEST_TRACE_SYMLINK: &str = "latest-trace";

bitflags! {
    pub struct TraceHeaderFlags: u32 {
        /// Frames carry interrupt, page fault and instruction counts
        /// in addition to ticks.
        const EXTENDED_COUNTERS = 0x1;
    }
}

/// Random identifier of a recording. Lets tools tell traces apart even
/// after directories are renamed or copied.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Debug)]
pub struct TraceUuid {
    pub bytes: [u8; 16],
}

impl TraceUuid {
    pub fn generate() -> TraceUuid {
        TraceUuid {
            bytes: rand::random(),
        }
    }
}

impl Display for TraceUuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for b in self.bytes.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Per-trace settings written after the version line. The reader needs them
/// before it can decode a single frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TraceHeader {
    pub uuid: TraceUuid,
    pub flags: TraceHeaderFlags,
    pub frames_per_file: u64,
}

impl TraceHeader {
    pub fn counter_set(&self) -> CounterSet {
        CounterSet::from_extended(self.flags.contains(TraceHeaderFlags::EXTENDED_COUNTERS))
    }

    fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::with_capacity(16 + 4 + 8);
        e.put_raw(&self.uuid.bytes)
            .put_u32(self.flags.bits())
            .put_u64(self.frames_per_file);
        e.into_inner()
    }

    fn decode(data: &[u8]) -> io::Result<TraceHeader> {
        let mut d = Decoder::new(data);
        let uuid = TraceUuid {
            // get_raw() returned exactly 16 bytes.
            bytes: d.get_raw(16)?.try_into().unwrap(),
        };
        let raw_flags = d.get_u32()?;
        let flags = TraceHeaderFlags::from_bits(raw_flags)
            .ok_or_else(|| invalid_data(format!("unknown trace header flags {:#x}", raw_flags)))?;
        let frames_per_file = d.get_u64()?;
        if frames_per_file == 0 {
            return Err(invalid_data("trace header has zero frames per file"));
        }
        d.finish()?;
        Ok(TraceHeader {
            uuid,
            flags,
            frames_per_file,
        })
    }

    /// Contents of the `incomplete`/`version` file: the version number on a
    /// line of its own followed by the framed header.
    pub fn to_version_file(&self) -> Vec<u8> {
        let mut buf = format!("{}\n", TRACE_VERSION).into_bytes();
        buf.extend_from_slice(&encode_framed(&self.encode()));
        buf
    }

    pub fn from_version_file(path: &Path, contents: &[u8]) -> io::Result<TraceHeader> {
        let newline = memchr::memchr(b'\n', contents)
            .ok_or_else(|| invalid_data(format!("no version line in {:?}", path)))?;
        let version = std::str::from_utf8(&contents[..newline])
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .ok_or_else(|| invalid_data(format!("could not parse version file {:?}", path)))?;
        if version != TRACE_VERSION {
            return Err(invalid_data(format!(
                "recorded trace {:?} has an incompatible version {}; expected {}. \
                 Did you record it with an older version of rd? If so, you'll need to \
                 replay it with that older version. Otherwise, your trace is likely corrupted.",
                path, version, TRACE_VERSION
            )));
        }
        TraceHeader::decode(decode_framed(&contents[newline + 1..])?)
    }
}

/// Metadata of one raw data record. The bytes themselves are in the
/// `RawData` substream at the same record index.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RawDataMetadata {
    /// Global time of the frame the data belongs to.
    pub global_time: FrameTime,
    pub addr: RemotePtr<Void>,
    pub size: usize,
    pub rec_tid: pid_t,
}

impl RawDataMetadata {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::with_capacity(8 + 4 + 8 + 8);
        e.put_u64(self.global_time)
            .put_i32(self.rec_tid)
            .put_u64(self.addr.as_usize() as u64)
            .put_u64(self.size as u64);
        e.into_inner()
    }

    pub fn decode(data: &[u8]) -> io::Result<RawDataMetadata> {
        let mut d = Decoder::new(data);
        let global_time = d.get_u64()?;
        let rec_tid = d.get_i32()?;
        let addr = RemotePtr::from(d.get_u64()?);
        let size = d.get_u64()? as usize;
        d.finish()?;
        Ok(RawDataMetadata {
            global_time,
            addr,
            size,
            rec_tid,
        })
    }
}

/// TraceStream stores all the data common to both recording and
/// replay.  TraceWriter deals with recording-specific logic, and
/// TraceReader handles replay-specific details.
pub struct TraceStream {
    /// Directory into which we're saving the trace files.
    trace_dir: PathBuf,
    /// Ticked on the recording (or replay) of each event (trace frame).
    clock: GlobalClock,
}

impl TraceStream {
    pub(super) fn new(trace_dir: &Path, frames_per_file: u64) -> TraceStream {
        TraceStream {
            trace_dir: trace_dir.to_owned(),
            clock: GlobalClock::new(frames_per_file),
        }
    }

    /// Return the directory storing this trace's files.
    pub fn dir(&self) -> &Path {
        &self.trace_dir
    }

    /// Return the current "global time" (event count) for this
    /// trace.
    pub fn time(&self) -> FrameTime {
        self.clock.time()
    }

    /// File and position of the frame at the current global time.
    pub fn coord(&self) -> FrameCoord {
        self.clock.coord()
    }

    pub fn frames_per_file(&self) -> u64 {
        self.clock.frames_per_file()
    }

    /// File and position of the frame recorded at `time`.
    pub fn coord_of(&self, time: FrameTime) -> FrameCoord {
        self.clock.coord_of(time)
    }

    pub(super) fn clock(&self) -> &GlobalClock {
        &self.clock
    }

    pub(super) fn clock_mut(&mut self) -> &mut GlobalClock {
        &mut self.clock
    }

    /// Increment the global time and return the incremented value.
    pub(super) fn tick_time(&mut self) -> FrameTime {
        self.clock.tick()
    }

    /// Return the path of the file for the given substream.
    pub(super) fn path(&self, s: Substream) -> PathBuf {
        self.trace_dir.join(s.name())
    }

    /// Path of the `file_index`th frame file.
    pub(super) fn events_path(&self, file_index: u32) -> PathBuf {
        self.trace_dir
            .join(format!("{}{}", EVENTS_FILE_PREFIX, file_index))
    }

    pub(super) fn args_env_path(&self) -> PathBuf {
        self.trace_dir.join(ARGS_ENV_FILE)
    }

    /// Return the path of "version" file, into which the current
    /// trace format version of rd is stored upon creation of the
    /// trace.
    pub(super) fn version_path(&self) -> PathBuf {
        self.trace_dir.join(VERSION_FILE)
    }

    /// While the trace is being built, the version file is stored under this name.
    /// When the trace is closed we rename it to the correct name. This lets us
    /// detect incomplete traces.
    pub(super) fn incomplete_version_path(&self) -> PathBuf {
        self.trace_dir.join(INCOMPLETE_VERSION_FILE)
    }
}

pub fn latest_trace_symlink() -> PathBuf {
    trace_save_dir().join(LATEST_TRACE_SYMLINK)
}

/// Create the directory a new trace is recorded into: `output_trace_dir` if
/// given (it must not exist yet), else the first free `<exe>-<n>` in the
/// trace save dir.
pub fn make_trace_dir(exe_path: &OsStr, maybe_output_trace_dir: Option<&Path>) -> io::Result<PathBuf> {
    let mut builder = DirBuilder::new();
    builder.mode(0o770);

    if let Some(output_trace_dir) = maybe_output_trace_dir {
        // An explicitly requested directory is never reused.
        builder.create(output_trace_dir).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Unable to create trace directory {:?}: {}", output_trace_dir, e),
            )
        })?;
        return Ok(output_trace_dir.to_owned());
    }

    let save_dir = trace_save_dir();
    DirBuilder::new().recursive(true).mode(0o700).create(&save_dir)?;

    let exe_name = base_name(exe_path);
    let mut nonce: u32 = 0;
    loop {
        let mut name = exe_name.to_os_string();
        name.push(format!("-{}", nonce));
        let dir = save_dir.join(&name);
        match builder.create(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => nonce += 1,
            Err(e) => {
                return Err(io::Error::new(
                    e.kind(),
                    format!("Unable to create trace directory {:?}: {}", dir, e),
                ))
            }
        }
    }
}

/// No name means the latest trace. Single-component names are looked up
/// first in the current directory, next in the default trace dir.
pub fn resolve_trace_name(maybe_trace_name: Option<&Path>) -> PathBuf {
    let trace_name = match maybe_trace_name {
        None => return latest_trace_symlink(),
        Some(name) => name,
    };

    if !trace_name.as_os_str().as_bytes().contains(&b'/') {
        if dir_exists(trace_name) {
            return trace_name.to_owned();
        }
        let resolved = trace_save_dir().join(trace_name);
        if dir_exists(&resolved) {
            return resolved;
        }
    }

    trace_name.to_owned()
}
