//! Configuration of a managed process before it starts

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use encoding_rs::{Encoding, UTF_8};

use super::completion::ProcessListener;
use super::error::{ProcessError, Result};
use super::lifecycle::{ExitCodeCheck, LaunchConfig, ManagedProcess};
use super::registry::ProcessRegistry;
use super::spawner::{BoxedReader, ProcessCommand, Spawner, TokioSpawner};
use crate::output::{LevelDispatcher, LogDispatcher, OutputSink};

pub const DEFAULT_CONSOLE_BUFFER_LINES: usize = 100;
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Configures and creates a [`ManagedProcess`].
///
/// The environment starts as a snapshot of the current process environment.
pub struct ManagedProcessBuilder {
    command: ProcessCommand,
    stdin: Option<BoxedReader>,
    destroy_on_shutdown: bool,
    registry: Option<ProcessRegistry>,
    console_buffer_lines: usize,
    dispatcher: Arc<dyn LogDispatcher>,
    listener: Option<Arc<dyn ProcessListener>>,
    success: ExitCodeCheck,
    stdout_sinks: Vec<Arc<dyn OutputSink>>,
    stderr_sinks: Vec<Arc<dyn OutputSink>>,
    timeout: Option<Duration>,
    start_timeout: Duration,
    encoding: &'static Encoding,
    spawner: Arc<dyn Spawner>,
}

impl ManagedProcessBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        tracing::trace!("Captured environment with {} variables", env.len());
        Self {
            command: ProcessCommand {
                program: program.into(),
                args: Vec::new(),
                env,
                working_dir: None,
                pipe_stdin: false,
            },
            stdin: None,
            destroy_on_shutdown: true,
            registry: None,
            console_buffer_lines: DEFAULT_CONSOLE_BUFFER_LINES,
            dispatcher: Arc::new(LevelDispatcher::default()),
            listener: None,
            success: Arc::new(|code| code == 0),
            stdout_sinks: Vec::new(),
            stderr_sinks: Vec::new(),
            timeout: None,
            start_timeout: DEFAULT_START_TIMEOUT,
            encoding: UTF_8,
            spawner: Arc::new(TokioSpawner),
        }
    }

    /// Executable given as a filesystem path
    pub fn from_path(program: impl AsRef<Path>) -> Self {
        Self::new(program.as_ref().to_string_lossy().into_owned())
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.command.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.command
            .args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Add an existing file or directory as an absolute path argument
    pub fn arg_path(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let resolved = std::fs::canonicalize(path)?;
        self.command
            .args
            .push(resolved.to_string_lossy().into_owned());
        Ok(self)
    }

    /// Add `<arg>=<absolute path>`, e.g. `--config=/etc/app.toml`
    pub fn file_arg(mut self, arg: &str, path: impl AsRef<Path>) -> Result<Self> {
        let resolved = std::fs::canonicalize(path)?;
        self.command
            .args
            .push(format!("{}={}", arg, resolved.display()));
        Ok(self)
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.command.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            self.command
                .env
                .insert(key.as_ref().to_string(), value.as_ref().to_string());
        }
        self
    }

    pub fn env_remove(mut self, key: &str) -> Self {
        self.command.env.remove(key);
        self
    }

    pub fn env_clear(mut self) -> Self {
        self.command.env.clear();
        self
    }

    pub fn environment(&self) -> &HashMap<String, String> {
        &self.command.env
    }

    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.command.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Bytes to feed to the process stdin; stdin is closed once the source is exhausted
    pub fn stdin(mut self, source: impl tokio::io::AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(source));
        self
    }

    pub fn destroy_on_shutdown(mut self, enabled: bool) -> Self {
        self.destroy_on_shutdown = enabled;
        self
    }

    /// Registry that kills remaining destroy-on-shutdown processes
    pub fn registry(mut self, registry: ProcessRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn console_buffer_lines(mut self, lines: usize) -> Self {
        self.console_buffer_lines = lines;
        self
    }

    pub fn log_dispatcher(mut self, dispatcher: Arc<dyn LogDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ProcessListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn add_stdout(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.stdout_sinks.push(sink);
        self
    }

    pub fn add_stderr(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.stderr_sinks.push(sink);
        self
    }

    /// Which natural exit codes count as success (default: only 0)
    pub fn success_exit_code(mut self, check: impl Fn(i32) -> bool + Send + Sync + 'static) -> Self {
        self.success = Arc::new(check);
        self
    }

    /// Watchdog timeout; the process is killed when it runs longer
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Output charset by WHATWG label, e.g. `"utf-8"` or `"latin1"`
    pub fn charset(self, label: &str) -> Result<Self> {
        let encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| ProcessError::Config(format!("Unknown charset: {}", label)))?;
        Ok(self.encoding(encoding))
    }

    pub fn encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn build(mut self) -> Result<ManagedProcess> {
        if self.command.program.trim().is_empty() {
            return Err(ProcessError::Config(
                "Executable must not be empty".to_string(),
            ));
        }
        if self.command.working_dir.is_none() {
            self.command.working_dir = infer_working_dir(&self.command.program)?;
        }

        let long_name = long_name(&self.command);
        let registry = if self.destroy_on_shutdown {
            self.registry
        } else {
            None
        };

        Ok(ManagedProcess::new(LaunchConfig {
            command: self.command,
            long_name,
            stdin: self.stdin,
            listener: self.listener,
            success: self.success,
            dispatcher: self.dispatcher,
            encoding: self.encoding,
            timeout: self.timeout,
            start_timeout: self.start_timeout,
            registry,
            spawner: self.spawner,
            console_lines: self.console_buffer_lines,
            stdout_sinks: self.stdout_sinks,
            stderr_sinks: self.stderr_sinks,
        }))
    }
}

/// A path-like executable runs in its own directory unless told otherwise
fn infer_working_dir(program: &str) -> Result<Option<PathBuf>> {
    if !program.contains(std::path::MAIN_SEPARATOR) && !program.contains('/') {
        return Ok(None);
    }
    match Path::new(program).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(Some(parent.to_path_buf())),
        _ => Err(ProcessError::Config(format!(
            "Cannot infer a working directory for {}, set one explicitly",
            program
        ))),
    }
}

fn long_name(command: &ProcessCommand) -> String {
    let mut name = format!("Program {}", command.program);
    for arg in &command.args {
        name.push(' ');
        name.push_str(arg);
    }
    if let Some(dir) = &command.working_dir {
        name.push_str(&format!(" (in working directory {})", dir.display()));
    }
    name
}
