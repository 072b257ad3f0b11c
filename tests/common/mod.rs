//! Common test utilities and helpers

#![allow(dead_code)]

use procwarden::output::WriteSink;
use procwarden::process::{ManagedProcessBuilder, ProcessListener};
use std::sync::{Arc, Mutex};

/// Builder for `sh -c <script>`
pub fn sh(script: &str) -> ManagedProcessBuilder {
    ManagedProcessBuilder::new("sh").args(["-c", script])
}

/// Exit code of a process killed with SIGKILL
pub const SIGKILL_EXIT: i32 = 128 + 9;

/// Sink collecting raw bytes for assertions
pub type CollectingSink = WriteSink<Vec<u8>>;

pub fn collecting_sink(name: &str) -> Arc<CollectingSink> {
    Arc::new(WriteSink::new(name, Vec::new()))
}

pub fn collected(sink: &CollectingSink) -> String {
    sink.with_inner(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

/// Listener recording every notification
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Complete(i32),
    Failed(i32, String),
}

impl RecordingListener {
    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProcessListener for RecordingListener {
    fn on_complete(&self, exit_code: i32) {
        self.events
            .lock()
            .unwrap()
            .push(ListenerEvent::Complete(exit_code));
    }

    fn on_failed(&self, exit_code: i32, cause: &str) {
        self.events
            .lock()
            .unwrap()
            .push(ListenerEvent::Failed(exit_code, cause.to_string()));
    }
}
