use crate::{
    commands::{
        rd_options::{RdOptions, RdSubCommand},
        RdCommand,
    },
    trace::{
        trace_frame::FrameTime,
        trace_reader::{TimeConstraint, TraceReader},
    },
};
use libc::pid_t;
use std::{
    io::{self, stdout, Write},
    path::PathBuf,
};

pub struct DumpCommand {
    dump_recorded_data_metadata: bool,
    dump_mmaps: bool,
    raw_dump: bool,
    statistics: bool,
    only_tid: Option<pid_t>,
    trace_dir: Option<PathBuf>,
    event_spec: Option<(FrameTime, Option<FrameTime>)>,
}

impl DumpCommand {
    pub fn new(options: &RdOptions) -> DumpCommand {
        match options.cmd.clone() {
            RdSubCommand::Dump {
                recorded_metadata,
                mmaps,
                raw_dump,
                statistics,
                only_tid,
                trace_dir,
                event_spec,
            } => DumpCommand {
                dump_recorded_data_metadata: recorded_metadata,
                dump_mmaps: mmaps,
                raw_dump,
                statistics,
                only_tid,
                trace_dir,
                event_spec,
            },
            _ => panic!("Unexpected RdSubCommand variant. Not a Dump variant!"),
        }
    }

    fn dump(&self, f: &mut dyn Write) -> io::Result<()> {
        let mut trace = TraceReader::new(self.trace_dir.as_deref())?;

        if self.raw_dump {
            writeln!(f, "global_time tid reason ticks [registers]")?;
        }

        self.dump_events_matching(&mut trace, f)?;

        if self.statistics {
            return self.dump_statistics(&mut trace, f);
        }

        Ok(())
    }

    fn dump_statistics(&self, trace: &mut TraceReader, f: &mut dyn Write) -> io::Result<()> {
        writeln!(
            f,
            "// Trace bytes {}, frames {}{}",
            trace.total_bytes(),
            trace.time(),
            if trace.is_truncated() {
                " (terminated early)"
            } else {
                ""
            }
        )
    }

    /// Dump all events from the current to trace that match `self.event_spec` to `f`.
    ///
    /// Mapping and raw data records of frames that are not dumped are
    /// consumed too, so the substreams stay in step with the frames.
    fn dump_events_matching(&self, trace: &mut TraceReader, f: &mut dyn Write) -> io::Result<()> {
        let (start, end): (FrameTime, FrameTime) = match self.event_spec {
            None => (0, FrameTime::MAX),
            Some((s, None)) => (s, s),
            Some((s, Some(e))) => (s, e),
        };

        while let Some(frame) = trace.try_read_next_trace() {
            if end < frame.time() {
                return Ok(());
            }
            let wanted = start <= frame.time()
                && self.only_tid.map_or(true, |tid| tid == frame.tid());
            if wanted {
                if self.raw_dump {
                    frame.dump_raw(Some(&mut *f))?;
                } else {
                    frame.dump(Some(&mut *f))?;
                }
            }

            while let Some(file) = trace.read_mapped_region(TimeConstraint::CurrentTimeOnly) {
                if wanted && self.dump_mmaps {
                    writeln!(f, "  {}", file)?;
                }
            }

            while let Some(data) = trace.read_raw_data_metadata_for_frame() {
                if wanted && self.dump_recorded_data_metadata {
                    writeln!(
                        f,
                        "  {{ tid:{}, addr:{}, length:{:#x} }}",
                        data.rec_tid, data.addr, data.size
                    )?;
                }
            }
        }
        Ok(())
    }
}

impl RdCommand for DumpCommand {
    fn run(&mut self) -> io::Result<()> {
        self.dump(&mut stdout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::Event,
        remote_ptr::RemotePtr,
        task_trait::TaskSnapshot,
        trace::{
            mmapped_file::{BoundedPath, MmappedFile},
            trace_options::TraceOptions,
            trace_writer::TraceWriter,
        },
    };
    use std::ffi::OsStr;
    use structopt::StructOpt;
    use tempfile::TempDir;

    fn record_sample(tmp: &TempDir) -> PathBuf {
        let dir = tmp.path().join("trace");
        let options = TraceOptions {
            output_trace_dir: Some(dir.clone()),
            ..Default::default()
        };
        let mut w = TraceWriter::new(OsStr::new("/bin/sample"), &options).unwrap();
        w.record_argv_envp(&["sample"], &["A=1"]);
        for (n, tid) in [(1, 10), (2, 11), (3, 10)].iter() {
            let mut t = TaskSnapshot::new(*tid);
            t.thread_time = *n;
            w.record_event(&t, &Event::sched());
            w.record_data(&t, RemotePtr::from(0x1000 * *n), b"abcd");
        }
        let start = RemotePtr::from(0x20000u64);
        w.record_mmapped_file_stats(&MmappedFile {
            tid: 10,
            filename: BoundedPath::new("/lib/libc.so.6").unwrap(),
            start,
            end: start + 0x2000usize,
            ..Default::default()
        });
        w.close().unwrap();
        dir
    }

    fn dump_to_string(args: &[&str]) -> String {
        let options = RdOptions::from_iter(args);
        let mut out: Vec<u8> = Vec::new();
        DumpCommand::new(&options).dump(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn dumps_every_frame() {
        let tmp = TempDir::new().unwrap();
        let dir = record_sample(&tmp);
        let out = dump_to_string(&["rd-trace", "dump", dir.to_str().unwrap()]);
        assert_eq!(3, out.lines().count());
        assert!(out.lines().next().unwrap().starts_with("{ global_time:1,"));
    }

    #[test]
    fn filters_by_tid_and_range() {
        let tmp = TempDir::new().unwrap();
        let dir = record_sample(&tmp);
        let out = dump_to_string(&["rd-trace", "dump", "-t", "10", "-m", dir.to_str().unwrap()]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(4, lines.len());
        assert!(lines[0].contains("tid:10"));
        assert_eq!("  { tid:10, addr:0x1000, length:0x4 }", lines[1]);
        assert!(lines[2].starts_with("{ global_time:3,"));

        let out = dump_to_string(&["rd-trace", "dump", dir.to_str().unwrap(), "2"]);
        assert_eq!(1, out.lines().count());
        assert!(out.contains("global_time:2,"));
    }

    #[test]
    fn dumps_mappings_and_statistics() {
        let tmp = TempDir::new().unwrap();
        let dir = record_sample(&tmp);
        let out = dump_to_string(&["rd-trace", "dump", "-p", "-s", dir.to_str().unwrap()]);
        assert!(out.contains("filename:`/lib/libc.so.6'"));
        assert!(out.trim_end().ends_with("frames 3"));
    }
}
