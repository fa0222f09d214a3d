use crate::{
    event::Event,
    log::LogLevel::{LogDebug, LogError, LogWarn},
    perf_counters::PerfCounterValues,
    registers::Registers,
    remote_ptr::{RemotePtr, Void},
    task_trait::RecordTask,
    trace::{
        mmapped_file::MmappedFile,
        recorded_env::RecordedEnv,
        substream_writer::{nix_to_io, SubstreamWriter, Sync},
        trace_frame::{EventInfo, ExecInfo, TraceFrame},
        trace_options::TraceOptions,
        trace_stream::{
            latest_trace_symlink, make_trace_dir, RawDataMetadata, Substream, TraceHeader,
            TraceHeaderFlags, TraceStream, TraceUuid,
        },
    },
    util::probably_not_interactive,
};
use libc::{pid_t, STDOUT_FILENO};
use nix::{
    fcntl::{flock, FlockArg::LockExclusiveNonblock},
    unistd::fsync,
};
use std::{
    collections::HashMap,
    env,
    ffi::{OsStr, OsString},
    fs::{remove_file, rename, File, OpenOptions},
    io::{self, Write},
    ops::{Deref, DerefMut},
    os::unix::{
        fs::{symlink, OpenOptionsExt},
        io::AsRawFd,
    },
};

/// Trace writing takes the trace directory through a defined set of states.
/// These states can be usefully observed by external programs.
///
/// -- Initially the trace directory does not exist.
/// -- The trace directory is created. It is empty.
/// -- A file `incomplete` is created in the trace directory and rd takes an
/// exclusive flock() lock on it.
/// -- rd writes the version line and the trace header to `incomplete`.
/// -- At the end of trace recording, rd renames `incomplete` to `version`.
/// At this point the trace is complete and ready to replay.
/// -- rd releases its flock() lock on `version`.
///
/// Thus:
/// -- If the trace directory contains the file `version` the trace is valid
/// and ready for replay.
/// -- If the trace directory contains the file `incomplete`, and there is an
/// exclusive flock() lock on that file, rd is still recording (or something
/// is messing with us).
/// -- If the trace directory contains the file `incomplete` and that file
/// does not have an exclusive flock() lock on it, rd must have died before
/// the recording was complete. Everything up to the last
/// `flush_trace_files()` can still be replayed.
pub struct TraceWriter {
    trace_stream: TraceStream,
    header: TraceHeader,
    exe_path: OsString,
    /// The `trace_<n>` file frames are currently appended to.
    events: SubstreamWriter,
    events_file_index: u32,
    writers: HashMap<Substream, SubstreamWriter>,
    /// Keep the 'incomplete' (later renamed to 'version') file open until we
    /// rename it, so our flock() lock stays held on it. `None` once closed.
    version_file: Option<File>,
    /// Raw data recorded at the current global time.
    raw_recs: Vec<RawDataMetadata>,
    /// Copied mappings recorded at the current global time. Each must be
    /// matched by a raw data record before the clock moves on.
    pending_copied_mmaps: Vec<MmappedFile>,
    has_recorded_env: bool,
    terminated: bool,
    mmap_count: u32,
}

impl Deref for TraceWriter {
    type Target = TraceStream;

    fn deref(&self) -> &Self::Target {
        &self.trace_stream
    }
}

impl DerefMut for TraceWriter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.trace_stream
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log!(LogError, "Unable to close trace {:?}: {}", self.dir(), e);
        }
    }
}

impl TraceWriter {
    /// Create a trace for the program at `exe_path`.
    /// The trace directory is `options.output_trace_dir` if set, otherwise
    /// a new `<exe name>-<n>` directory under the trace save dir (see
    /// `RD_TRACE_DIR`).
    pub fn new(exe_path: &OsStr, options: &TraceOptions) -> io::Result<TraceWriter> {
        if options.frames_per_file == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frames_per_file must be at least 1",
            ));
        }
        let dir = make_trace_dir(exe_path, options.output_trace_dir.as_deref())?;
        let trace_stream = TraceStream::new(&dir, options.frames_per_file);

        let mut flags = TraceHeaderFlags::empty();
        flags.set(TraceHeaderFlags::EXTENDED_COUNTERS, options.extended_counters);
        let header = TraceHeader {
            uuid: TraceUuid::generate(),
            flags,
            frames_per_file: options.frames_per_file,
        };

        let ver_path = trace_stream.incomplete_version_path();
        let mut version_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .custom_flags(libc::O_CLOEXEC)
            .open(&ver_path)?;
        // Take an exclusive lock and hold it until we rename the file at
        // the end of recording and then close our file descriptor.
        flock(version_file.as_raw_fd(), LockExclusiveNonblock).map_err(nix_to_io)?;
        version_file.write_all(&header.to_version_file())?;

        let mut writers = HashMap::new();
        for &s in Substream::iter() {
            writers.insert(s, SubstreamWriter::new(&trace_stream.path(s))?);
        }
        let events = SubstreamWriter::new(&trace_stream.events_path(0))?;

        let tw = TraceWriter {
            trace_stream,
            header,
            exe_path: exe_path.to_owned(),
            events,
            events_file_index: 0,
            writers,
            version_file: Some(version_file),
            raw_recs: Vec::new(),
            pending_copied_mmaps: Vec::new(),
            has_recorded_env: false,
            terminated: false,
            mmap_count: 0,
        };

        if options.output_trace_dir.is_none() {
            tw.make_latest_trace();
        }

        if !probably_not_interactive(Some(STDOUT_FILENO)) {
            println!("rd: Saving execution to trace directory `{:?}'.", tw.dir());
        }
        log!(LogDebug, "Recording trace {} into {:?}", header.uuid, tw.dir());
        Ok(tw)
    }

    pub fn uuid(&self) -> &TraceUuid {
        &self.header.uuid
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    pub fn mmap_count(&self) -> u32 {
        self.mmap_count
    }

    /// Return true iff all trace files are "good".
    pub fn good(&self) -> bool {
        self.events.good() && self.writers.values().all(|w| w.good())
    }

    /// Record the recorded program's arguments and environment, together with
    /// the exe path the trace was created for and our working directory.
    /// Must be called exactly once, before the first `record_event()`.
    pub fn record_argv_envp<S: AsRef<OsStr>>(&mut self, argv: &[S], envp: &[S]) {
        if self.has_recorded_env {
            fatal!("argv/envp already recorded for {:?}", self.dir());
        }
        if self.time() > 0 {
            fatal!("argv/envp must be recorded before the first frame");
        }
        if let Err(e) = self.write_recorded_env(argv, envp) {
            fatal!("Unable to write {:?}: {}", self.args_env_path(), e);
        }
        self.has_recorded_env = true;
    }

    fn write_recorded_env<S: AsRef<OsStr>>(&self, argv: &[S], envp: &[S]) -> io::Result<()> {
        let cwd = env::current_dir()?;
        let env = RecordedEnv::new(&self.exe_path, cwd.as_os_str(), argv, envp)?;
        let mut w = SubstreamWriter::new(&self.args_env_path())?;
        w.write_record(&env.encode())?;
        w.close(Sync::Sync)
    }

    /// Append a frame for `ev` happening on `t`.
    ///
    /// Recording a trace frame has the side effect of ticking
    /// the global time.
    pub fn record_event(&mut self, t: &dyn RecordTask, ev: &Event) {
        if !self.has_recorded_env {
            fatal!("record_argv_envp() must be called before the first event");
        }
        if self.terminated {
            fatal!("Event {} recorded after the trace termination event", ev);
        }
        let regs = *t.regs();
        if let Err(e) = self.write_frame(t.tid(), t.thread_time(), ev, t.counters(), regs) {
            fatal!("Unable to write frame to {:?}: {}", self.dir(), e);
        }
    }

    /// Append a frame marking that recording ended early, e.g. because of a
    /// fatal signal. `maybe_t` is the last task known to have run, if any.
    /// The trace is flushed afterwards.
    pub fn record_trace_termination_event(&mut self, maybe_t: Option<&dyn RecordTask>) {
        if self.terminated {
            return;
        }
        let ev = Event::trace_termination();
        let res = match maybe_t {
            Some(t) => self.write_frame(t.tid(), t.thread_time(), &ev, t.counters(), *t.regs()),
            None => self.write_frame(0, 0, &ev, PerfCounterValues::default(), Default::default()),
        };
        if let Err(e) = res {
            fatal!("Unable to write termination frame to {:?}: {}", self.dir(), e);
        }
        self.terminated = true;
        log!(LogWarn, "Trace {:?} terminated early at time {}", self.dir(), self.time());
        self.flush_trace_files();
    }

    fn write_frame(
        &mut self,
        tid: pid_t,
        thread_time: u64,
        ev: &Event,
        counters: PerfCounterValues,
        recorded_regs: Registers,
    ) -> io::Result<()> {
        self.finish_current_time();

        let coord = self.clock().next_coord();
        if coord.file_index != self.events_file_index {
            self.events.close(Sync::DontSync)?;
            self.events = SubstreamWriter::new(&self.events_path(coord.file_index))?;
            self.events_file_index = coord.file_index;
            log!(LogDebug, "Frames now go to {:?}", self.events.path());
        }

        let global_time = self.tick_time();
        let frame = TraceFrame::new_with(
            EventInfo {
                global_time,
                thread_time,
                tid,
                ev: ev.encode(),
            },
            ExecInfo {
                counters,
                recorded_regs,
            },
        );
        self.events
            .write_record(&frame.encode(self.header.counter_set()))
    }

    /// Write a raw-data record to the trace, tagged with the current global
    /// time. `addr` is the address in the tracee where the data came from and
    /// will be restored to. Empty records are allowed.
    pub fn record_data(&mut self, t: &dyn RecordTask, addr: RemotePtr<Void>, d: &[u8]) {
        let metadata = RawDataMetadata {
            global_time: self.time(),
            addr,
            size: d.len(),
            rec_tid: t.tid(),
        };
        if let Err(e) = self.write_raw(&metadata, d) {
            fatal!("Unable to write raw data to {:?}: {}", self.dir(), e);
        }
        self.raw_recs.push(metadata);
    }

    fn write_raw(&mut self, metadata: &RawDataMetadata, d: &[u8]) -> io::Result<()> {
        self.writer_mut(Substream::RawData).write_record(d)?;
        self.writer_mut(Substream::RawDataHeader)
            .write_record(&metadata.encode())
    }

    /// Write a mapping record at the current global time. The `time` field
    /// of `file` is ignored. If `file.copied` the caller must also
    /// `record_data()` the whole region before the next frame.
    pub fn record_mmapped_file_stats(&mut self, file: &MmappedFile) {
        if file.start >= file.end {
            fatal!("Invalid mapping {}: start must be below end", file);
        }
        let mut file = file.clone();
        file.time = self.time();
        if let Err(e) = self.writer_mut(Substream::Mmaps).write_record(&file.encode()) {
            fatal!("Unable to write mmaps to {:?}: {}", self.dir(), e);
        }
        self.mmap_count += 1;
        if file.copied {
            self.pending_copied_mmaps.push(file);
        }
    }

    /// Make everything recorded so far durable, without closing anything.
    pub fn flush_trace_files(&mut self) {
        if let Err(e) = self.flush(Sync::Sync) {
            fatal!("Unable to flush trace {:?}: {}", self.dir(), e);
        }
    }

    fn flush(&mut self, sync: Sync) -> io::Result<()> {
        self.events.flush(sync)?;
        for w in self.writers.values_mut() {
            w.flush(sync)?;
        }
        if let Some(f) = &self.version_file {
            fsync(f.as_raw_fd()).map_err(nix_to_io)?;
        }
        Ok(())
    }

    /// Close all trace files and mark the trace complete.
    /// Normally this will be called by the destructor. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        let version_file = match self.version_file.take() {
            Some(f) => f,
            None => return Ok(()),
        };
        self.finish_current_time();
        self.events.close(Sync::Sync)?;
        for w in self.writers.values_mut() {
            w.close(Sync::Sync)?;
        }
        fsync(version_file.as_raw_fd()).map_err(nix_to_io)?;
        rename(self.incomplete_version_path(), self.version_path())?;
        // Dropping the file releases the lock.
        drop(version_file);
        log!(
            LogDebug,
            "Closed trace {:?} at time {} with {} mappings",
            self.dir(),
            self.time(),
            self.mmap_count
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.version_file.is_none()
    }

    /// Data for the current global time is complete. Check that every copied
    /// mapping got exactly one raw data record covering it.
    fn finish_current_time(&mut self) {
        for m in self.pending_copied_mmaps.drain(..) {
            let matches = self
                .raw_recs
                .iter()
                .filter(|r| r.global_time == m.time && r.addr == m.start && r.size == m.size())
                .count();
            if matches != 1 {
                fatal!(
                    "Copied mapping {} has {} matching raw data records; expected exactly 1",
                    m,
                    matches
                );
            }
        }
        self.raw_recs.clear();
    }

    /// We got far enough into recording that we should set this as the latest
    /// trace.
    fn make_latest_trace(&self) {
        let link_name = latest_trace_symlink();
        // Try to update the symlink to `self`. If the link is re-created after
        // we unlink it, then another rd process is racing with us and it
        // "won". The link is then valid and points at some very-recent
        // trace, so that's good enough.
        match remove_file(&link_name) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                log!(LogWarn, "Unable to unlink {:?}: {}", link_name, e);
                return;
            }
            _ => (),
        }
        // Link only the trace name, not the full path, so moving a directory full
        // of traces around doesn't break the latest-trace link.
        let trace_name = match self.dir().file_name() {
            Some(name) => name,
            None => return,
        };
        if let Err(e) = symlink(trace_name, &link_name) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                log!(
                    LogWarn,
                    "Failed to update symlink `{:?}' to `{:?}': {}",
                    link_name,
                    trace_name,
                    e
                );
            }
        }
    }

    fn writer_mut(&mut self, s: Substream) -> &mut SubstreamWriter {
        // Every substream gets a writer in new().
        self.writers.get_mut(&s).unwrap()
    }
}
