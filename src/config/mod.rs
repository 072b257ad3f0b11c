//! Supervisor configuration
//!
//! Defaults for a [`ManagedProcessBuilder`], usually read from a TOML file:
//!
//! ```toml
//! console_buffer_lines = 200
//! timeout = "5m"
//! start_timeout = "10s"
//! charset = "utf-8"
//! destroy_on_shutdown = true
//! stdout_level = "info"
//! stderr_level = "off"
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

use crate::output::LevelDispatcher;
use crate::process::{
    ManagedProcessBuilder, ProcessError, Result, DEFAULT_CONSOLE_BUFFER_LINES,
    DEFAULT_START_TIMEOUT,
};

pub mod loader;

pub use loader::{load_config, parse_config};

/// Settings applied to every process the binary supervises
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Lines of stdout/stderr kept for diagnostics
    pub console_buffer_lines: usize,

    /// Watchdog timeout; unset means the process may run forever
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// How long start waits for output capture to begin
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,

    /// WHATWG label of the output encoding
    pub charset: String,

    pub destroy_on_shutdown: bool,

    /// Level for stdout lines (`trace` .. `error`, or `off`); unset keeps
    /// the level the caller chose
    pub stdout_level: Option<String>,

    /// Level for stderr lines (`trace` .. `error`, or `off`)
    pub stderr_level: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            console_buffer_lines: DEFAULT_CONSOLE_BUFFER_LINES,
            timeout: None,
            start_timeout: DEFAULT_START_TIMEOUT,
            charset: "utf-8".to_string(),
            destroy_on_shutdown: true,
            stdout_level: None,
            stderr_level: None,
        }
    }
}

impl SupervisorConfig {
    /// Check every field, reporting all problems at once
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if encoding_rs::Encoding::for_label(self.charset.trim().as_bytes()).is_none() {
            problems.push(format!("unknown charset {:?}", self.charset));
        }
        if self.start_timeout.is_zero() {
            problems.push("start_timeout must be greater than zero".to_string());
        }
        for (field, value) in [
            ("stdout_level", &self.stdout_level),
            ("stderr_level", &self.stderr_level),
        ] {
            let Some(value) = value else { continue };
            if let Err(e) = parse_level(value) {
                problems.push(format!("{}: {}", field, e));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ProcessError::Config(problems.join("; ")))
        }
    }

    /// Levels from this config, falling back to `base` for unset streams
    pub fn dispatcher_over(&self, base: LevelDispatcher) -> Result<LevelDispatcher> {
        let level = |value: &Option<String>, fallback| match value {
            Some(value) => parse_level(value).map_err(ProcessError::Config),
            None => Ok(fallback),
        };
        Ok(LevelDispatcher {
            stdout: level(&self.stdout_level, base.stdout)?,
            stderr: level(&self.stderr_level, base.stderr)?,
        })
    }

    pub fn dispatcher(&self) -> Result<LevelDispatcher> {
        self.dispatcher_over(LevelDispatcher::default())
    }

    /// Configure `builder` with these settings
    pub fn apply(&self, builder: ManagedProcessBuilder) -> Result<ManagedProcessBuilder> {
        self.validate()?;
        let mut builder = builder
            .console_buffer_lines(self.console_buffer_lines)
            .start_timeout(self.start_timeout)
            .destroy_on_shutdown(self.destroy_on_shutdown)
            .charset(&self.charset)?;
        if self.stdout_level.is_some() || self.stderr_level.is_some() {
            builder = builder.log_dispatcher(Arc::new(self.dispatcher()?));
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder)
    }
}

/// `off` / `none` silence a stream
fn parse_level(value: &str) -> std::result::Result<Option<Level>, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" | "none" => Ok(None),
        other => other
            .parse::<Level>()
            .map(Some)
            .map_err(|_| format!("invalid log level {:?}", value)),
    }
}
