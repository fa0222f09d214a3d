mod codec;
pub mod global_clock;
pub mod mmapped_file;
pub mod recorded_env;
mod substream_reader;
mod substream_writer;
pub mod trace_frame;
pub mod trace_options;
pub mod trace_reader;
pub mod trace_stream;
pub mod trace_writer;
