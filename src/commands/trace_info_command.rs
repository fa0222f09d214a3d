use crate::{
    commands::{
        rd_options::{RdOptions, RdSubCommand},
        RdCommand,
    },
    perf_counters::CounterSet,
    trace::{trace_reader::TraceReader, trace_stream::TRACE_VERSION},
};
use serde::Serialize;
use std::{
    ffi::OsString,
    io::{self, stdout, Write},
    path::PathBuf,
};

pub struct TraceInfoCommand {
    trace_dir: Option<PathBuf>,
}

impl TraceInfoCommand {
    pub fn new(options: &RdOptions) -> TraceInfoCommand {
        match options.cmd.clone() {
            RdSubCommand::TraceInfo { trace_dir } => TraceInfoCommand { trace_dir },
            _ => panic!("Unexpected RdSubCommand variant. Not a `TraceInfo` variant!"),
        }
    }

    fn trace_info(&self) -> io::Result<TraceInfo> {
        let mut trace = TraceReader::new(self.trace_dir.as_deref())?;
        let env = trace.load_recorded_env()?;

        let mut frames: u64 = 0;
        while trace.try_read_next_trace().is_some() {
            frames += 1;
        }

        Ok(TraceInfo {
            uuid: trace.uuid().to_string(),
            version: TRACE_VERSION,
            counters: match trace.counter_set() {
                CounterSet::Basic => "basic",
                CounterSet::Extended => "extended",
            },
            frames_per_file: trace.frames_per_file(),
            frames,
            terminated_early: trace.is_truncated(),
            incomplete: trace.is_salvaged(),
            main_thread: trace.get_recorded_main_thread(),
            exe_image: lossy(&env.exe_image),
            cwd: lossy(&env.cwd),
            argv: env.argv.iter().map(lossy).collect(),
            environ: env.envp.iter().map(lossy).collect(),
            total_bytes: trace.total_bytes(),
        })
    }
}

fn lossy(s: &OsString) -> String {
    s.to_string_lossy().into_owned()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceInfo {
    uuid: String,
    version: u32,
    counters: &'static str,
    frames_per_file: u64,
    frames: u64,
    terminated_early: bool,
    incomplete: bool,
    main_thread: Option<libc::pid_t>,
    exe_image: String,
    cwd: String,
    argv: Vec<String>,
    environ: Vec<String>,
    total_bytes: u64,
}

impl RdCommand for TraceInfoCommand {
    fn run(&mut self) -> io::Result<()> {
        let info = self.trace_info()?;
        let serialized = serde_json::to_string(&info)?;
        writeln!(stdout(), "{}", serialized)
    }
}
