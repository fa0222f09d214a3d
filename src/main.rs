use rd_trace::commands::{
    dump_command::DumpCommand,
    rd_options::{RdOptions, RdSubCommand},
    trace_info_command::TraceInfoCommand,
    RdCommand,
};
use std::io;
use structopt::StructOpt;

fn main() -> io::Result<()> {
    let options = RdOptions::from_args();

    match &options.cmd {
        RdSubCommand::Dump { .. } => DumpCommand::new(&options).run(),
        RdSubCommand::TraceInfo { .. } => TraceInfoCommand::new(&options).run(),
    }
}
