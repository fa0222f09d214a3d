use crate::{
    log::LogLevel::{LogDebug, LogWarn},
    perf_counters::CounterSet,
    remote_ptr::{RemotePtr, Void},
    trace::{
        codec::invalid_data,
        mmapped_file::MmappedFile,
        recorded_env::RecordedEnv,
        substream_reader::{SubstreamReader, SubstreamReaderState},
        trace_frame::{EventInfo, TraceFrame},
        trace_stream::{
            resolve_trace_name, RawDataMetadata, Substream, TraceHeader, TraceStream, TraceUuid,
        },
    },
};
use libc::pid_t;
use nix::fcntl::{flock, FlockArg::LockSharedNonblock};
use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Display, Formatter},
    fs::{self, File},
    io::{self, Read},
    ops::{Deref, DerefMut},
    os::unix::io::AsRawFd,
    path::Path,
};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimeConstraint {
    /// Only a record belonging to the frame just read.
    CurrentTimeOnly,
    AnyTime,
}

/// Where the reader is in the trace.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReaderState {
    /// Opened, no frame consumed yet.
    Initialized,
    Streaming,
    /// Every frame has been consumed and the recording ended normally.
    EndOfTrace,
    /// Every frame has been consumed and the recording ended with a
    /// termination event. See `TraceReader::termination_frame()`.
    Truncated,
}

impl ReaderState {
    pub fn is_terminal(self) -> bool {
        self == ReaderState::EndOfTrace || self == ReaderState::Truncated
    }
}

/// A parcel of recorded tracee data.  `data` contains the data read
/// from `addr` in the tracee.
///
/// We DONT want Copy
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RawData {
    pub data: Vec<u8>,
    pub addr: RemotePtr<Void>,
    pub rec_tid: pid_t,
}

/// What `read_raw_data_direct()` put into the caller's buffer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RawDataDirect {
    /// Number of bytes written at the start of the buffer.
    pub size: usize,
    pub addr: RemotePtr<Void>,
    pub rec_tid: pid_t,
}

#[derive(Debug)]
pub enum ReadRawDataError {
    /// The current frame has no (more) raw data.
    NoRawData,
    /// The record did not fit. Nothing was written or consumed.
    BufferTooSmall { required: usize, available: usize },
    Io(io::Error),
}

impl Display for ReadRawDataError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReadRawDataError::NoRawData => write!(f, "no raw data for the current frame"),
            ReadRawDataError::BufferTooSmall {
                required,
                available,
            } => write!(
                f,
                "raw data record needs {} bytes but the buffer has {}",
                required, available
            ),
            ReadRawDataError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl Error for ReadRawDataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReadRawDataError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ReadRawDataError {
    fn from(e: io::Error) -> Self {
        ReadRawDataError::Io(e)
    }
}

/// The record after the last consumed frame.
#[derive(Clone)]
enum NextFrame {
    Frame(TraceFrame),
    Termination(TraceFrame),
    End,
}

/// Reads a trace directory written by TraceWriter, strictly in recording
/// order.
pub struct TraceReader {
    trace_stream: TraceStream,
    header: TraceHeader,
    /// The `trace_<n>` file we are reading frames from.
    events: SubstreamReader,
    events_file_index: u32,
    readers: HashMap<Substream, SubstreamReader>,
    state: ReaderState,
    /// Read ahead by `peek_next_trace()` but not consumed yet.
    lookahead: Option<NextFrame>,
    termination_frame: Option<TraceFrame>,
    recorded_main_thread: Option<pid_t>,
    /// The trace was never closed by its recorder.
    salvaged: bool,
}

impl Deref for TraceReader {
    type Target = TraceStream;

    fn deref(&self) -> &Self::Target {
        &self.trace_stream
    }
}

impl DerefMut for TraceReader {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.trace_stream
    }
}

impl TraceReader {
    /// Open the trace in `maybe_dir`. When `maybe_dir` is `None`, open the
    /// latest trace.
    ///
    /// Fails if there is no trace there, if it was recorded with another
    /// trace version, or if it is still being recorded. A trace whose
    /// recorder died is opened with a warning and replays up to the last
    /// data that reached the disk.
    pub fn new(maybe_dir: Option<&Path>) -> io::Result<TraceReader> {
        let dir = resolve_trace_name(maybe_dir);
        let stream = TraceStream::new(&dir, 1);
        let (header, salvaged) = read_header(&stream)?;
        let trace_stream = TraceStream::new(&dir, header.frames_per_file);

        let mut readers = HashMap::new();
        for &s in Substream::iter() {
            readers.insert(s, open_substream(&trace_stream.path(s))?);
        }
        let mut events = open_substream(&trace_stream.events_path(0))?;
        let recorded_main_thread = find_main_thread(&mut events, salvaged)?;

        log!(
            LogDebug,
            "Opened trace {} in {:?} ({:?} counters, {} frames per file)",
            header.uuid,
            dir,
            header.counter_set(),
            header.frames_per_file
        );
        Ok(TraceReader {
            trace_stream,
            header,
            events,
            events_file_index: 0,
            readers,
            state: ReaderState::Initialized,
            lookahead: None,
            termination_frame: None,
            recorded_main_thread,
            salvaged,
        })
    }

    pub fn uuid(&self) -> &TraceUuid {
        &self.header.uuid
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    pub fn counter_set(&self) -> CounterSet {
        self.header.counter_set()
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// True if the recorder never closed this trace.
    pub fn is_salvaged(&self) -> bool {
        self.salvaged
    }

    /// True once the termination event has been reached.
    pub fn is_truncated(&self) -> bool {
        self.state == ReaderState::Truncated
    }

    /// The frame recorded by `record_trace_termination_event()`, once the
    /// reader has got to it.
    pub fn termination_frame(&self) -> Option<&TraceFrame> {
        self.termination_frame.as_ref()
    }

    /// Tid of the thread that recorded the first frame, or `None` for a
    /// trace without frames.
    pub fn get_recorded_main_thread(&self) -> Option<pid_t> {
        self.recorded_main_thread
    }

    /// The exe image, arguments and environment given to
    /// `record_argv_envp()`.
    pub fn load_recorded_env(&self) -> io::Result<RecordedEnv> {
        let path = self.args_env_path();
        let mut r = SubstreamReader::open(&path)?;
        match r.read_record()? {
            Some(rec) => RecordedEnv::decode(&rec),
            None => Err(invalid_data(format!("{:?} is empty", path))),
        }
    }

    /// Read the next frame. The trace must have one: running out of frames
    /// or failing to read is fatal.
    ///
    /// NB: reading a trace frame has the side effect of ticking
    /// the global time to match the time recorded in the trace
    /// frame.
    pub fn read_next_trace(&mut self) -> TraceFrame {
        match self.try_read_next_trace() {
            Some(frame) => frame,
            None if self.is_truncated() => fatal!(
                "Trace {:?} was terminated early after time {}",
                self.dir(),
                self.time()
            ),
            None => fatal!("Trace {:?} ended after time {}", self.dir(), self.time()),
        }
    }

    /// Read the next frame, or `None` once the frames are exhausted. After
    /// the first `None` every later call returns `None` too. Check
    /// `is_truncated()` to see whether recording ended early.
    pub fn try_read_next_trace(&mut self) -> Option<TraceFrame> {
        if self.state.is_terminal() {
            return None;
        }
        let next = match self.lookahead.take() {
            Some(next) => next,
            None => self.fetch_next_or_die(),
        };
        match next {
            NextFrame::Frame(frame) => {
                self.tick_time();
                debug_assert_eq!(frame.time(), self.time());
                if is_logging!(LogDebug) {
                    let mut line: Vec<u8> = Vec::new();
                    frame.dump(Some(&mut line as &mut dyn io::Write)).unwrap_or(());
                    log!(
                        LogDebug,
                        "Read {}: {}",
                        self.coord(),
                        String::from_utf8_lossy(&line).trim_end()
                    );
                }
                self.state = ReaderState::Streaming;
                Some(frame)
            }
            NextFrame::Termination(frame) => {
                log!(
                    LogWarn,
                    "Trace {:?} was terminated early after time {}",
                    self.dir(),
                    self.time()
                );
                self.termination_frame = Some(frame);
                self.state = ReaderState::Truncated;
                None
            }
            NextFrame::End => {
                self.state = ReaderState::EndOfTrace;
                None
            }
        }
    }

    /// Return the frame `try_read_next_trace()` would return, without
    /// consuming it.
    pub fn peek_next_trace(&mut self) -> Option<TraceFrame> {
        if self.state.is_terminal() {
            return None;
        }
        if self.lookahead.is_none() {
            self.lookahead = Some(self.fetch_next_or_die());
        }
        match &self.lookahead {
            Some(NextFrame::Frame(frame)) => Some(frame.clone()),
            _ => None,
        }
    }

    /// True if there are no more frames to read.
    pub fn at_end(&mut self) -> bool {
        self.peek_next_trace().is_none()
    }

    fn fetch_next_or_die(&mut self) -> NextFrame {
        match self.fetch_next() {
            Ok(next) => next,
            Err(e) => fatal!(
                "Unable to read frame after {} ({}) in {:?}: {}",
                self.time(),
                self.coord(),
                self.dir(),
                e
            ),
        }
    }

    /// Read the frame after the last consumed one, moving on to the next
    /// `trace_<n>` file when the current one is exhausted.
    fn fetch_next(&mut self) -> io::Result<NextFrame> {
        while self.events.at_end() {
            let next_path = self.events_path(self.events_file_index + 1);
            if !next_path.exists() {
                return Ok(NextFrame::End);
            }
            self.events = SubstreamReader::open(&next_path)?;
            self.events_file_index += 1;
            log!(LogDebug, "Reading frames from {:?}", next_path);
        }

        let rec = match self.events.read_record() {
            Ok(Some(rec)) => rec,
            Ok(None) => return Ok(NextFrame::End),
            Err(e) if self.salvaged && e.kind() == io::ErrorKind::UnexpectedEof => {
                log!(
                    LogWarn,
                    "Ignoring torn frame at the end of unfinished trace {:?}",
                    self.events.path()
                );
                return Ok(NextFrame::End);
            }
            Err(e) => return Err(e),
        };
        let frame = TraceFrame::decode(&rec, self.counter_set())?;

        let expected_time = self.time() + 1;
        if frame.time() != expected_time {
            return Err(invalid_data(format!(
                "found frame with time {} where {} was expected",
                frame.time(),
                expected_time
            )));
        }
        let expected_coord = self.coord_of(expected_time);
        if expected_coord.file_index != self.events_file_index {
            return Err(invalid_data(format!(
                "frame {} found in trace_{} but belongs at {}",
                frame.time(),
                self.events_file_index,
                expected_coord
            )));
        }

        if frame.encoded_event().is_trace_termination() {
            Ok(NextFrame::Termination(frame))
        } else {
            Ok(NextFrame::Frame(frame))
        }
    }

    /// Read the next mapping record. With `TimeConstraint::CurrentTimeOnly`
    /// the record must belong to the frame just read; otherwise it's left in
    /// place and `None` is returned.
    pub fn read_mapped_region(&mut self, constraint: TimeConstraint) -> Option<MmappedFile> {
        match self.read_mapped_region_impl(constraint) {
            Ok(maybe_file) => maybe_file,
            Err(e) => fatal!("Unable to read mmaps in {:?}: {}", self.dir(), e),
        }
    }

    fn read_mapped_region_impl(
        &mut self,
        constraint: TimeConstraint,
    ) -> io::Result<Option<MmappedFile>> {
        let time = self.time();
        let mmaps = self.reader_mut(Substream::Mmaps);
        let state = mmaps.get_state();
        let file = match mmaps.read_record()? {
            Some(rec) => MmappedFile::decode(&rec)?,
            None => return Ok(None),
        };
        if constraint == TimeConstraint::CurrentTimeOnly && file.time != time {
            mmaps.restore_state(state)?;
            return Ok(None);
        }
        Ok(Some(file))
    }

    /// Read the next mapping record, which must exist.
    pub fn read_next_mmapped_file_stats(&mut self) -> MmappedFile {
        match self.read_mapped_region(TimeConstraint::AnyTime) {
            Some(file) => file,
            None => fatal!("Expected a mapping record after time {}, found none", self.time()),
        }
    }

    /// Read the next raw data record for this frame and return it. Aborts if
    /// there are no more raw data records for this frame.
    pub fn read_raw_data(&mut self) -> RawData {
        match self.read_raw_data_for_frame() {
            Some(raw_data) => raw_data,
            None => fatal!("Expected raw data for time {}, found none", self.time()),
        }
    }

    /// Return the next raw data record for last-read frame. If there are no more
    /// raw data records for this frame, return `None`.
    pub fn read_raw_data_for_frame(&mut self) -> Option<RawData> {
        match self.read_raw_data_impl() {
            Ok(maybe_data) => maybe_data,
            Err(e) => fatal!("Unable to read raw data in {:?}: {}", self.dir(), e),
        }
    }

    fn read_raw_data_impl(&mut self) -> io::Result<Option<RawData>> {
        let rec = match self.next_raw_metadata_for_frame()? {
            Some((rec, _)) => rec,
            None => return Ok(None),
        };
        let data = match self.reader_mut(Substream::RawData).read_record()? {
            Some(data) => data,
            None => return Err(invalid_data("raw data header without raw data")),
        };
        if data.len() != rec.size {
            return Err(invalid_data(format!(
                "raw data record is {} bytes but its header says {}",
                data.len(),
                rec.size
            )));
        }
        Ok(Some(RawData {
            data,
            addr: rec.addr,
            rec_tid: rec.rec_tid,
        }))
    }

    /// Like read_raw_data_for_frame, but doesn't actually read the data bytes.
    /// Simply return the raw metadata or `None` if there are no records left.
    pub fn read_raw_data_metadata_for_frame(&mut self) -> Option<RawDataMetadata> {
        let res = self.next_raw_metadata_for_frame().and_then(|maybe_found| {
            match maybe_found {
                Some((rec, _)) => {
                    self.reader_mut(Substream::RawData).skip_record()?;
                    Ok(Some(rec))
                }
                None => Ok(None),
            }
        });
        match res {
            Ok(maybe_rec) => maybe_rec,
            Err(e) => fatal!("Unable to read raw data in {:?}: {}", self.dir(), e),
        }
    }

    /// Read the next raw data record for this frame straight into `buf`.
    /// A record larger than `buf` is left unconsumed and nothing is written.
    pub fn read_raw_data_direct(
        &mut self,
        buf: &mut [u8],
    ) -> Result<RawDataDirect, ReadRawDataError> {
        let (rec, header_state) = match self.next_raw_metadata_for_frame()? {
            Some(found) => found,
            None => return Err(ReadRawDataError::NoRawData),
        };
        if rec.size > buf.len() {
            // Stale records skipped on the way stay skipped in both streams.
            self.reader_mut(Substream::RawDataHeader)
                .restore_state(header_state)?;
            return Err(ReadRawDataError::BufferTooSmall {
                required: rec.size,
                available: buf.len(),
            });
        }
        self.reader_mut(Substream::RawData)
            .read_record_into(&mut buf[..rec.size])?;
        Ok(RawDataDirect {
            size: rec.size,
            addr: rec.addr,
            rec_tid: rec.rec_tid,
        })
    }

    /// Consume the next raw data header if it belongs to the current frame,
    /// returning it with the header stream position just before it.
    /// Data left over from earlier frames is skipped; data for later frames
    /// stays put.
    fn next_raw_metadata_for_frame(
        &mut self,
    ) -> io::Result<Option<(RawDataMetadata, SubstreamReaderState)>> {
        let time = self.time();
        loop {
            let headers = self.reader_mut(Substream::RawDataHeader);
            let state = headers.get_state();
            let rec = match headers.read_record()? {
                Some(bytes) => RawDataMetadata::decode(&bytes)?,
                None => return Ok(None),
            };
            if rec.global_time < time {
                log!(
                    LogDebug,
                    "Skipping {} bytes of raw data for {} recorded at time {}",
                    rec.size,
                    rec.addr,
                    rec.global_time
                );
                self.reader_mut(Substream::RawData).skip_record()?;
                continue;
            }
            if rec.global_time > time {
                self.reader_mut(Substream::RawDataHeader)
                    .restore_state(state)?;
                return Ok(None);
            }
            return Ok(Some((rec, state)));
        }
    }

    /// Restore the state of this to what it was just after
    /// `new()`.
    pub fn rewind(&mut self) -> io::Result<()> {
        for r in self.readers.values_mut() {
            r.rewind()?;
        }
        self.events = SubstreamReader::open(&self.events_path(0))?;
        self.events_file_index = 0;
        self.clock_mut().reset();
        self.state = ReaderState::Initialized;
        self.lookahead = None;
        self.termination_frame = None;
        Ok(())
    }

    /// Bytes on disk in this trace's frame, raw data and mapping files.
    pub fn total_bytes(&self) -> u64 {
        let mut total: u64 = self.readers.values().map(|r| r.file_size()).sum();
        let mut index = 0;
        while let Ok(metadata) = fs::metadata(self.events_path(index)) {
            total += metadata.len();
            index += 1;
        }
        total
    }

    fn reader(&self, s: Substream) -> &SubstreamReader {
        // Every substream gets a reader in new().
        self.readers.get(&s).unwrap()
    }

    fn reader_mut(&mut self, s: Substream) -> &mut SubstreamReader {
        self.readers.get_mut(&s).unwrap()
    }
}

fn open_substream(path: &Path) -> io::Result<SubstreamReader> {
    SubstreamReader::open(path)
        .map_err(|e| io::Error::new(e.kind(), format!("Unable to open {:?}: {}", path, e)))
}

/// Read the trace header from `version`, or from `incomplete` if the
/// recorder died. The bool is true in the latter case.
fn read_header(stream: &TraceStream) -> io::Result<(TraceHeader, bool)> {
    let path = stream.version_path();
    match fs::read(&path) {
        Ok(contents) => return Ok((TraceHeader::from_version_file(&path, &contents)?, false)),
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            return Err(io::Error::new(
                e.kind(),
                format!("Trace file {:?} not readable: {}", path, e),
            ))
        }
        Err(_) => (),
    }

    let incomplete_path = stream.incomplete_version_path();
    let mut f = match File::open(&incomplete_path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Trace file {:?} not found. There is no trace there.", path),
            ))
        }
        Err(e) => return Err(e),
    };
    // The recorder holds an exclusive lock until it has finished.
    if let Err(e) = flock(f.as_raw_fd(), LockSharedNonblock) {
        return Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            format!(
                "Trace {:?} is still being recorded (can't lock {:?}: {})",
                stream.dir(),
                incomplete_path,
                e
            ),
        ));
    }
    let mut contents = Vec::new();
    f.read_to_end(&mut contents)?;
    let header = TraceHeader::from_version_file(&incomplete_path, &contents)?;
    log!(
        LogWarn,
        "Trace file {:?} found. rd recording terminated abnormally and the trace is \
         incomplete; replaying what was saved.",
        incomplete_path
    );
    Ok((header, true))
}

/// Tid of the first frame in `trace_0`, which is left rewound.
fn find_main_thread(events: &mut SubstreamReader, salvaged: bool) -> io::Result<Option<pid_t>> {
    let first = match events.read_record() {
        Ok(first) => first,
        Err(_) if salvaged => None,
        Err(e) => return Err(e),
    };
    events.rewind()?;
    match first {
        Some(rec) => {
            let info = EventInfo::decode(&rec)?;
            if info.ev.is_trace_termination() && info.tid == 0 {
                Ok(None)
            } else {
                Ok(Some(info.tid))
            }
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{Event, EventType, SyscallState},
        perf_counters::{ExtraPerfCounters, PerfCounterValues},
        task_trait::{RecordTask, TaskSnapshot},
        trace::{
            mmapped_file::{BoundedPath, FileStat},
            substream_writer::encode_framed,
            trace_frame::{ExecInfo, FrameTime},
            trace_options::TraceOptions,
            trace_writer::TraceWriter,
        },
    };
    use std::{ffi::OsStr, path::PathBuf};
    use tempfile::TempDir;

    fn writer_with(tmp: &TempDir, mut options: TraceOptions) -> TraceWriter {
        options.output_trace_dir = Some(tmp.path().join("trace"));
        let mut w = TraceWriter::new(OsStr::new("/usr/bin/prog"), &options).unwrap();
        w.record_argv_envp(&["prog", "--flag"], &["HOME=/root", "LANG=C"]);
        w
    }

    fn writer(tmp: &TempDir) -> TraceWriter {
        writer_with(tmp, TraceOptions::default())
    }

    fn trace_dir(tmp: &TempDir) -> PathBuf {
        tmp.path().join("trace")
    }

    fn task(tid: pid_t, n: u64) -> TaskSnapshot {
        let mut t = TaskSnapshot::new(tid);
        t.thread_time = n;
        t.regs.user_regs_mut().rip = 0x400000 + n;
        t.regs.user_regs_mut().rax = n * 3;
        t.counters = PerfCounterValues::ticks_only(n as i64 * 1000);
        t
    }

    fn open(tmp: &TempDir) -> TraceReader {
        TraceReader::new(Some(&trace_dir(tmp))).unwrap()
    }

    #[test]
    fn frames_replay_in_order_with_raw_data_at_frame_2() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        let addr = RemotePtr::from(0x7ffd_1000u64);
        w.record_event(&task(100, 1), &Event::sched());
        w.record_event(&task(100, 2), &Event::syscall(0, SyscallState::ExitingSyscall));
        w.record_data(&task(100, 2), addr, b"8 bytes!");
        w.record_event(&task(100, 3), &Event::sched());
        w.record_data(&task(100, 3), RemotePtr::from(0x1000u64), b"unrelated");
        w.close().unwrap();

        let mut r = open(&tmp);
        assert_eq!(ReaderState::Initialized, r.state());
        assert_eq!(Some(100), r.get_recorded_main_thread());

        let f1 = r.read_next_trace();
        assert_eq!(1, f1.time());
        assert_eq!(ReaderState::Streaming, r.state());
        assert!(r.read_raw_data_for_frame().is_none());

        let f2 = r.read_next_trace();
        assert_eq!(2, f2.time());
        assert_eq!(100, f2.tid());
        assert_eq!(2, f2.thread_time());
        assert_eq!(task(100, 2).regs, *f2.regs_ref());
        assert_eq!(2000, f2.ticks());
        assert_eq!(Event::syscall(0, SyscallState::ExitingSyscall), f2.event());
        let raw = r.read_raw_data();
        assert_eq!(b"8 bytes!".to_vec(), raw.data);
        assert_eq!(addr, raw.addr);
        assert_eq!(100, raw.rec_tid);
        assert!(r.read_raw_data_for_frame().is_none());

        assert_eq!(3, r.read_next_trace().time());
        assert_eq!(3, r.time());
        assert_eq!(None, r.try_read_next_trace());
        assert_eq!(ReaderState::EndOfTrace, r.state());
        assert!(!r.is_truncated());
    }

    #[test]
    fn termination_event_ends_the_trace() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        for n in 1..=5 {
            w.record_event(&task(100, n), &Event::sched());
        }
        let last = task(100, 5);
        w.record_trace_termination_event(Some(&last as &dyn RecordTask));
        w.close().unwrap();

        let mut r = open(&tmp);
        for n in 1..=5 {
            assert_eq!(n, r.read_next_trace().time());
        }
        assert!(r.peek_next_trace().is_none());
        assert_eq!(ReaderState::Streaming, r.state());
        assert!(r.try_read_next_trace().is_none());
        assert!(r.is_truncated());
        assert_eq!(5, r.time());
        let term = r.termination_frame().unwrap();
        assert_eq!(6, term.time());
        assert_eq!(EventType::EvTraceTermination, term.event().event_type());
        assert!(r.try_read_next_trace().is_none());
        assert!(r.try_read_next_trace().is_none());
    }

    #[test]
    fn termination_without_a_task() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        w.record_trace_termination_event(None);
        drop(w);

        let mut r = open(&tmp);
        assert_eq!(None, r.get_recorded_main_thread());
        assert!(r.try_read_next_trace().is_none());
        assert_eq!(0, r.termination_frame().unwrap().tid());
    }

    #[test]
    fn end_of_trace_is_terminal() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        w.record_event(&task(1, 1), &Event::exit());
        drop(w);

        let mut r = open(&tmp);
        assert!(r.try_read_next_trace().is_some());
        assert!(r.at_end());
        for _ in 0..3 {
            assert!(r.try_read_next_trace().is_none());
        }
        assert!(r.peek_next_trace().is_none());
        assert_eq!(ReaderState::EndOfTrace, r.state());
    }

    #[test]
    fn peek_does_not_consume() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        w.record_event(&task(5, 1), &Event::sched());
        w.record_event(&task(6, 1), &Event::sched());
        drop(w);

        let mut r = open(&tmp);
        let peeked = r.peek_next_trace().unwrap();
        assert_eq!(0, r.time());
        assert_eq!(ReaderState::Initialized, r.state());
        assert_eq!(peeked, r.peek_next_trace().unwrap());
        assert_eq!(peeked, r.read_next_trace());
        assert_eq!(6, r.peek_next_trace().unwrap().tid());
        assert_eq!(1, r.time());
    }

    #[test]
    fn direct_read_never_overruns_the_buffer() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        w.record_event(&task(9, 1), &Event::sched());
        w.record_data(&task(9, 1), RemotePtr::from(0x2000u64), &[0xaa; 16]);
        drop(w);

        let mut r = open(&tmp);
        r.read_next_trace();
        let mut small = [0u8; 8];
        match r.read_raw_data_direct(&mut small) {
            Err(ReadRawDataError::BufferTooSmall {
                required,
                available,
            }) => {
                assert_eq!(16, required);
                assert_eq!(8, available);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!([0u8; 8], small);

        let mut big = [0u8; 32];
        let got = r.read_raw_data_direct(&mut big).unwrap();
        assert_eq!(16, got.size);
        assert_eq!(RemotePtr::from(0x2000u64), got.addr);
        assert_eq!(&[0xaa; 16], &big[..16]);
        assert_eq!(&[0u8; 16], &big[16..]);
        assert!(matches!(
            r.read_raw_data_direct(&mut big),
            Err(ReadRawDataError::NoRawData)
        ));
    }

    #[test]
    fn zero_length_raw_data() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        w.record_event(&task(9, 1), &Event::sched());
        w.record_data(&task(9, 1), RemotePtr::from(0x3000u64), &[]);
        drop(w);

        let mut r = open(&tmp);
        r.read_next_trace();
        let raw = r.read_raw_data();
        assert!(raw.data.is_empty());
        assert_eq!(RemotePtr::from(0x3000u64), raw.addr);
    }

    #[test]
    fn stale_raw_data_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        w.record_event(&task(2, 1), &Event::sched());
        w.record_data(&task(2, 1), RemotePtr::from(0x10u64), b"never read");
        w.record_event(&task(2, 2), &Event::sched());
        w.record_data(&task(2, 2), RemotePtr::from(0x20u64), b"wanted");
        w.record_data(&task(2, 2), RemotePtr::from(0x30u64), b"also");
        drop(w);

        let mut r = open(&tmp);
        r.read_next_trace();
        r.read_next_trace();
        assert_eq!(b"wanted".to_vec(), r.read_raw_data().data);
        let meta = r.read_raw_data_metadata_for_frame().unwrap();
        assert_eq!(4, meta.size);
        assert_eq!(RemotePtr::from(0x30u64), meta.addr);
        assert!(r.read_raw_data_metadata_for_frame().is_none());
    }

    #[test]
    fn too_small_buffer_after_stale_data_loses_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        w.record_event(&task(3, 1), &Event::sched());
        w.record_data(&task(3, 1), RemotePtr::from(0x10u64), &[0x11; 10]);
        w.record_event(&task(3, 2), &Event::sched());
        w.record_data(&task(3, 2), RemotePtr::from(0x20u64), &[0x22; 16]);
        drop(w);

        let mut r = open(&tmp);
        r.read_next_trace();
        r.read_next_trace();
        let mut small = [0u8; 4];
        assert!(matches!(
            r.read_raw_data_direct(&mut small),
            Err(ReadRawDataError::BufferTooSmall {
                required: 16,
                available: 4
            })
        ));
        let mut big = [0u8; 32];
        let got = r.read_raw_data_direct(&mut big).unwrap();
        assert_eq!(16, got.size);
        assert_eq!(RemotePtr::from(0x20u64), got.addr);
        assert_eq!(&[0x22; 16], &big[..16]);
        assert!(matches!(
            r.read_raw_data_direct(&mut big),
            Err(ReadRawDataError::NoRawData)
        ));
    }

    #[test]
    fn copied_mapping_has_matching_raw_data() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        let t = task(100, 1);
        w.record_event(&t, &Event::sched());
        let start = RemotePtr::from(0x7f00_0000_0000u64);
        let contents = vec![0x5a; 0x1000];
        w.record_mmapped_file_stats(&MmappedFile {
            time: 0,
            tid: 100,
            copied: true,
            filename: BoundedPath::new("/dev/shm/segment").unwrap(),
            stat: FileStat::from_path(Path::new("/")).unwrap(),
            start,
            end: start + contents.len(),
        });
        w.record_data(&t, start, &contents);
        w.record_event(&task(100, 2), &Event::sched());
        w.close().unwrap();

        let mut r = open(&tmp);
        assert!(r.read_mapped_region(TimeConstraint::CurrentTimeOnly).is_none());
        r.read_next_trace();
        let m = r.read_next_mmapped_file_stats();
        assert_eq!(1, m.time);
        assert!(m.copied);
        assert_eq!(OsStr::new("/dev/shm/segment"), m.filename.as_os_str());
        let raw = r.read_raw_data();
        assert_eq!(m.start, raw.addr);
        assert_eq!(m.end - m.start, raw.data.len());
        assert!(r.read_mapped_region(TimeConstraint::AnyTime).is_none());
    }

    #[test]
    fn mapping_for_later_frame_stays_put() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        w.record_event(&task(1, 1), &Event::sched());
        w.record_event(&task(1, 2), &Event::grow_map());
        let start = RemotePtr::from(0x10000u64);
        w.record_mmapped_file_stats(&MmappedFile {
            filename: BoundedPath::new("[heap]").unwrap(),
            start,
            end: start + 0x1000usize,
            ..Default::default()
        });
        drop(w);

        let mut r = open(&tmp);
        r.read_next_trace();
        assert!(r.read_mapped_region(TimeConstraint::CurrentTimeOnly).is_none());
        r.read_next_trace();
        let m = r.read_mapped_region(TimeConstraint::CurrentTimeOnly).unwrap();
        assert_eq!(2, m.time);
        assert!(!m.copied);
    }

    #[test]
    fn frames_span_several_files() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer_with(
            &tmp,
            TraceOptions {
                frames_per_file: 3,
                ..Default::default()
            },
        );
        for n in 1..=8 {
            w.record_event(&task(10, n), &Event::sched());
        }
        drop(w);

        let mut r = open(&tmp);
        assert_eq!(3, r.frames_per_file());
        let mut coords = Vec::new();
        while let Some(frame) = r.try_read_next_trace() {
            assert_eq!(frame.time(), r.time());
            coords.push(r.coord().to_string());
        }
        assert_eq!(
            vec![
                "trace_0:1",
                "trace_0:2",
                "trace_0:3",
                "trace_1:1",
                "trace_1:2",
                "trace_1:3",
                "trace_2:1",
                "trace_2:2"
            ],
            coords
        );
        assert!(r.total_bytes() > 0);

        r.rewind().unwrap();
        assert_eq!(ReaderState::Initialized, r.state());
        assert_eq!(1, r.read_next_trace().time());
    }

    #[test]
    fn extended_counters_survive() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer_with(
            &tmp,
            TraceOptions {
                extended_counters: true,
                ..Default::default()
            },
        );
        let mut t = task(4, 1);
        t.counters.extra = Some(ExtraPerfCounters {
            hw_interrupts: 11,
            page_faults: 22,
            instructions: 33,
        });
        w.record_event(&t, &Event::sched());
        drop(w);

        let mut r = open(&tmp);
        assert_eq!(CounterSet::Extended, r.counter_set());
        assert_eq!(t.counters, *r.read_next_trace().counters());
    }

    #[test]
    fn recorded_env_is_returned_exactly() {
        let tmp = TempDir::new().unwrap();
        drop(writer(&tmp));

        let r = open(&tmp);
        let env = r.load_recorded_env().unwrap();
        assert_eq!(OsStr::new("/usr/bin/prog"), env.exe_image);
        let argv: Vec<&str> = env.argv.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(vec!["prog", "--flag"], argv);
        assert_eq!(Some(OsStr::new("C")), env.getenv("LANG"));
        assert_eq!(2, env.envp.len());
        assert!(!env.cwd.is_empty());
    }

    #[test]
    fn trace_being_recorded_is_refused() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        w.record_event(&task(1, 1), &Event::sched());
        w.flush_trace_files();
        let err = TraceReader::new(Some(&trace_dir(&tmp))).err().unwrap();
        assert_eq!(io::ErrorKind::WouldBlock, err.kind());
        assert!(err.to_string().contains("still being recorded"));

        w.close().unwrap();
        assert!(TraceReader::new(Some(&trace_dir(&tmp))).is_ok());
    }

    #[test]
    fn unfinished_trace_is_salvaged() {
        let tmp = TempDir::new().unwrap();
        let mut w = writer(&tmp);
        w.record_event(&task(1, 1), &Event::sched());
        w.record_event(&task(1, 2), &Event::sched());
        drop(w);
        // What a recorder that died after flushing leaves behind.
        let dir = trace_dir(&tmp);
        fs::rename(dir.join("version"), dir.join("incomplete")).unwrap();

        let mut r = open(&tmp);
        assert!(r.is_salvaged());
        assert_eq!(1, r.read_next_trace().time());
        assert_eq!(2, r.read_next_trace().time());
        assert!(r.try_read_next_trace().is_none());
    }

    #[test]
    fn missing_trace_and_bad_version_are_errors() {
        let tmp = TempDir::new().unwrap();
        let err = TraceReader::new(Some(&tmp.path().join("nothing"))).err().unwrap();
        assert_eq!(io::ErrorKind::NotFound, err.kind());

        drop(writer(&tmp));
        fs::write(trace_dir(&tmp).join("version"), b"999\n").unwrap();
        let err = TraceReader::new(Some(&trace_dir(&tmp))).err().unwrap();
        assert_eq!(io::ErrorKind::InvalidData, err.kind());
    }

    /// Replace `trace_0` with frames at the given global times.
    fn rewrite_frames(tmp: &TempDir, times: &[FrameTime]) {
        let path = trace_dir(tmp).join("trace_0");
        let mut contents = Vec::new();
        for &global_time in times {
            let frame = TraceFrame::new_with(
                EventInfo {
                    global_time,
                    thread_time: global_time,
                    tid: 5,
                    ev: Event::sched().encode(),
                },
                ExecInfo::default(),
            );
            contents.extend_from_slice(&encode_framed(&frame.encode(CounterSet::Basic)));
        }
        fs::remove_file(&path).unwrap();
        fs::write(&path, contents).unwrap();
    }

    /// Kind of the error reported for the frame after `good_frames` valid ones.
    fn bad_frame_error(tmp: &TempDir, good_frames: usize) -> io::ErrorKind {
        let mut r = open(tmp);
        for _ in 0..good_frames {
            r.read_next_trace();
        }
        match r.fetch_next() {
            Err(e) => e.kind(),
            Ok(_) => panic!("frame after time {} was accepted", r.time()),
        }
    }

    #[test]
    fn gap_in_global_time_is_corruption() {
        let tmp = TempDir::new().unwrap();
        drop(writer(&tmp));
        rewrite_frames(&tmp, &[1, 3]);
        assert_eq!(io::ErrorKind::InvalidData, bad_frame_error(&tmp, 1));
    }

    #[test]
    fn repeated_global_time_is_corruption() {
        let tmp = TempDir::new().unwrap();
        drop(writer(&tmp));
        rewrite_frames(&tmp, &[1, 1]);
        assert_eq!(io::ErrorKind::InvalidData, bad_frame_error(&tmp, 1));
    }

    #[test]
    fn frame_in_wrong_file_is_corruption() {
        let tmp = TempDir::new().unwrap();
        drop(writer_with(
            &tmp,
            TraceOptions {
                frames_per_file: 2,
                ..Default::default()
            },
        ));
        // Frame 3 belongs in trace_1.
        rewrite_frames(&tmp, &[1, 2, 3]);
        assert_eq!(io::ErrorKind::InvalidData, bad_frame_error(&tmp, 2));
    }
}
