//! Consumers of live process output
//!
//! Raw bytes from the stream pumps go through a [`MultiSink`] which hands
//! them, in registration order, to the console [`RollingBuffer`], the
//! `tracing` log sink, an optional [`LiteralWatcher`] and any sinks the
//! caller registered.

pub mod lines;
pub mod log_sink;
pub mod multiplexer;
pub mod rolling;
pub mod sink;
pub mod watcher;

pub use lines::LineSplitter;
pub use log_sink::{LevelDispatcher, LogDispatcher, TracingLogSink};
pub use multiplexer::{MultiSink, MultiSinkError, SinkFailure, SinkId};
pub use rolling::{RollingBuffer, RollingLogSink};
pub use sink::{OutputSink, StreamType, WriteSink};
pub use watcher::{LiteralWatcher, NextLiteral};
