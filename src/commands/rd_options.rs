use crate::trace::trace_frame::FrameTime;
use libc::pid_t;
use std::{error::Error, path::PathBuf};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rd-trace",
    about = "Inspect traces recorded by rd",
    after_help = "Use RD_LOG to control logging; e.g. RD_LOG=all:warn,trace_reader:debug"
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage])]
pub struct RdOptions {
    #[structopt(subcommand)]
    pub cmd: RdSubCommand,
}

#[derive(StructOpt, Debug, Clone)]
pub enum RdSubCommand {
    /// Dump data from the recorded trace
    #[structopt(name = "dump")]
    Dump {
        /// Dump recorded data metadata
        #[structopt(short = "m", long)]
        recorded_metadata: bool,

        /// Dump mmap data
        #[structopt(short = "p", long)]
        mmaps: bool,

        /// Dump trace frames in a more easily machine-parseable
        /// format instead of the default human-readable format
        #[structopt(short = "r", long = "raw")]
        raw_dump: bool,

        /// Dump statistics about the trace
        #[structopt(short = "s")]
        statistics: bool,

        /// Dump events only for the specified tid
        #[structopt(short = "t", long = "tid", parse(try_from_str = parse_pid))]
        only_tid: Option<pid_t>,

        /// Which directory is the trace data in? If omitted the latest trace dir is used
        trace_dir: Option<PathBuf>,

        /// Event specs can be either an event number like `127`, or a range
        /// like `1000-5000`. By default, all events are dumped
        #[structopt(parse(try_from_str = parse_range))]
        event_spec: Option<(FrameTime, Option<FrameTime>)>,
    },

    /// Dump trace header and recorded environment in JSON format.
    #[structopt(name = "traceinfo")]
    TraceInfo {
        /// Which directory is the trace data in? If omitted the latest trace dir is used
        trace_dir: Option<PathBuf>,
    },
}

fn parse_range(range_or_single: &str) -> Result<(FrameTime, Option<FrameTime>), Box<dyn Error>> {
    let args: Vec<&str> = range_or_single.splitn(2, '-').collect();
    let low = args[0].trim().parse::<FrameTime>()?;
    let mut high: Option<FrameTime> = None;
    if args.len() == 2 {
        let h = args[1].trim().parse::<FrameTime>()?;
        if h < low {
            return Err(Box::new(clap::Error::with_description(
                "The end of an event range cannot come before its start",
                clap::ErrorKind::InvalidValue,
            )));
        }
        high = Some(h);
    }
    Ok((low, high))
}

fn parse_pid(maybe_pid: &str) -> Result<pid_t, Box<dyn Error>> {
    let pid = maybe_pid.trim().parse::<pid_t>()?;
    if pid < 1 {
        Err(Box::new(clap::Error::with_description(
            "pid cannot be 0 or negative",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_arguments() {
        let options = RdOptions::from_iter(&[
            "rd-trace", "dump", "-m", "-p", "-t", "42", "/tmp/trace", "10-20",
        ]);
        match options.cmd {
            RdSubCommand::Dump {
                recorded_metadata,
                mmaps,
                raw_dump,
                statistics,
                only_tid,
                trace_dir,
                event_spec,
            } => {
                assert!(recorded_metadata);
                assert!(mmaps);
                assert!(!raw_dump);
                assert!(!statistics);
                assert_eq!(Some(42), only_tid);
                assert_eq!(Some(PathBuf::from("/tmp/trace")), trace_dir);
                assert_eq!(Some((10, Some(20))), event_spec);
            }
            _ => panic!("expected dump"),
        }
    }

    #[test]
    fn event_specs() {
        assert_eq!((127, None), parse_range("127").unwrap());
        assert_eq!((1000, Some(5000)), parse_range("1000-5000").unwrap());
        assert!(parse_range("5000-1000").is_err());
        assert!(parse_range("x").is_err());
        assert!(parse_pid("0").is_err());
    }

    #[test]
    fn traceinfo_defaults_to_latest_trace() {
        let options = RdOptions::from_iter(&["rd-trace", "traceinfo"]);
        match options.cmd {
            RdSubCommand::TraceInfo { trace_dir } => assert_eq!(None, trace_dir),
            _ => panic!("expected traceinfo"),
        }
    }
}
