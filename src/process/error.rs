use crate::output::MultiSinkError;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to start {process}: {source}")]
    StartFailed {
        process: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{process} was already started")]
    AlreadyStarted { process: String },

    #[error("Cannot {operation}: {process} is not running (already halted or never started)")]
    NotAlive {
        operation: &'static str,
        process: String,
    },

    #[error("Exit value not available, {process} is still running")]
    ExitValueUnavailable { process: String },

    #[error("Interrupted at \"{phase}\": {process}")]
    Interrupted { phase: &'static str, process: String },

    #[error("{process} halted before {literal:?} appeared in its console; {console}")]
    HaltedBeforeLiteral {
        process: String,
        literal: String,
        console: String,
    },

    #[error("Output sink failure: {0}")]
    Sink(#[from] MultiSinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub(crate) fn interrupted(phase: &'static str, process: &str) -> Self {
        ProcessError::Interrupted {
            phase,
            process: process.to_string(),
        }
    }

    pub(crate) fn not_alive(operation: &'static str, process: &str) -> Self {
        ProcessError::NotAlive {
            operation,
            process: process.to_string(),
        }
    }
}

/// Result type for managed process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
