//! On-disk store for deterministic execution traces.
//!
//! A recorder feeds a `TraceWriter` one frame per non-deterministic event,
//! along with the raw memory and file mappings those events produced. A
//! `TraceReader` later streams the same frames back, strictly in recording
//! order, so a replayer can reproduce the run.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;
pub mod commands;
pub mod event;
pub mod perf_counters;
pub mod registers;
pub mod remote_ptr;
pub mod task_trait;
pub mod trace;
pub mod util;
