use crate::{log::LogLevel::LogWarn, trace::global_clock::DEFAULT_FRAMES_PER_FILE};
use std::{env, path::PathBuf};

/// How a new trace should be recorded.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TraceOptions {
    /// Record into exactly this directory (which must not exist yet)
    /// instead of a fresh `<exe>-<n>` in the trace save dir.
    pub output_trace_dir: Option<PathBuf>,
    /// Store interrupt, page fault and instruction counts in every frame,
    /// not just ticks.
    pub extended_counters: bool,
    /// Start a new `trace_<n>` file after this many frames.
    pub frames_per_file: u64,
}

impl Default for TraceOptions {
    fn default() -> Self {
        TraceOptions {
            output_trace_dir: None,
            extended_counters: false,
            frames_per_file: DEFAULT_FRAMES_PER_FILE,
        }
    }
}

impl TraceOptions {
    /// Defaults overridden by `RD_EXTENDED_COUNTERS` and `RD_FRAMES_PER_FILE`.
    pub fn from_env() -> TraceOptions {
        TraceOptions::default().with_overrides(|name| env::var(name).ok())
    }

    fn with_overrides<F: Fn(&str) -> Option<String>>(mut self, lookup: F) -> TraceOptions {
        if let Some(val) = lookup("RD_EXTENDED_COUNTERS") {
            match parse_switch(&val) {
                Some(on) => self.extended_counters = on,
                None => log!(LogWarn, "Ignoring RD_EXTENDED_COUNTERS={:?}", val),
            }
        }
        if let Some(val) = lookup("RD_FRAMES_PER_FILE") {
            match val.trim().parse::<u64>() {
                Ok(n) if n > 0 => self.frames_per_file = n,
                _ => log!(LogWarn, "Ignoring RD_FRAMES_PER_FILE={:?}", val),
            }
        }
        self
    }
}

fn parse_switch(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" | "" => Some(false),
        _ => None,
    }
}
