//! Lifecycle controller of one managed process
//!
//! ```text
//! NotStarted -> Starting -> Running -> Halted(Completed | Failed
//!                                             | DestroyedByWatchdog
//!                                             | DestroyedByCaller)
//! ```
//!
//! A waiter task owns the OS handle. It races the natural exit against kill
//! requests, drains the stream pumps, closes the sinks and then publishes
//! the outcome exactly once. Watchdog and caller kills compete through one
//! compare-and-set on the kill reason; whoever wins names the outcome.

use super::completion::{completion_signal, CompletionPublisher, CompletionWatch, ExitOutcome};
use super::completion::ProcessListener;
use super::error::{ProcessError, Result};
use super::registry::{ProcessRegistry, RegistrationId};
use super::spawner::{
    BoxedReader, BoxedWriter, ProcessCommand, ProcessHandle, SpawnedProcess, Spawner,
};
use super::watchdog::Watchdog;
use crate::output::{
    LiteralWatcher, LogDispatcher, MultiSink, OutputSink, RollingBuffer, RollingLogSink, SinkId,
    StreamType, TracingLogSink,
};
use encoding_rs::Encoding;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

const PUMP_BUFFER_SIZE: usize = 8192;
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const KILL_NONE: u8 = 0;
const KILL_WATCHDOG: u8 = 1;
const KILL_CALLER: u8 = 2;
/// The waiter observed the exit; later kill requests lose
const KILL_REAPED: u8 = 3;

/// Decides whether a natural exit code counts as success
pub type ExitCodeCheck = Arc<dyn Fn(i32) -> bool + Send + Sync>;

/// Observable state of a [`ManagedProcess`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    /// Spawned, stream pumps not yet confirmed
    Starting,
    Running,
    Halted(ExitOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Starting,
    Running,
}

/// Everything the builder resolved for one process
pub(crate) struct LaunchConfig {
    pub command: ProcessCommand,
    pub long_name: String,
    pub stdin: Option<BoxedReader>,
    pub listener: Option<Arc<dyn ProcessListener>>,
    pub success: ExitCodeCheck,
    pub dispatcher: Arc<dyn LogDispatcher>,
    pub encoding: &'static Encoding,
    pub timeout: Option<Duration>,
    pub start_timeout: Duration,
    pub registry: Option<ProcessRegistry>,
    pub spawner: Arc<dyn Spawner>,
    pub console_lines: usize,
    pub stdout_sinks: Vec<Arc<dyn OutputSink>>,
    pub stderr_sinks: Vec<Arc<dyn OutputSink>>,
}

/// State shared with the waiter, the watchdog and the shutdown registry
struct Shared {
    long_name: String,
    alive: AtomicBool,
    kill_reason: AtomicU8,
    kill_signal: Notify,
}

impl Shared {
    /// Ask the waiter to kill the process. Only the first request while the
    /// process is alive succeeds.
    fn request_kill(&self, reason: u8) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        if self
            .kill_reason
            .compare_exchange(KILL_NONE, reason, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.kill_signal.notify_one();
        true
    }
}

/// A supervised OS process.
///
/// Created by [`ManagedProcessBuilder`](super::ManagedProcessBuilder).
/// All waiting operations are async and must run inside a tokio runtime.
pub struct ManagedProcess {
    shared: Arc<Shared>,
    phase: Mutex<Phase>,
    command: ProcessCommand,
    stdin: Mutex<Option<BoxedReader>>,
    listener: Option<Arc<dyn ProcessListener>>,
    success: ExitCodeCheck,
    dispatcher: Arc<dyn LogDispatcher>,
    encoding: &'static Encoding,
    timeout: Option<Duration>,
    start_timeout: Duration,
    registry: Option<ProcessRegistry>,
    spawner: Arc<dyn Spawner>,
    console: Arc<RollingBuffer>,
    stdout: Arc<MultiSink>,
    stderr: Arc<MultiSink>,
    completion: OnceLock<CompletionWatch>,
    watchdog: OnceLock<Arc<Watchdog>>,
    pid: OnceLock<u32>,
}

impl ManagedProcess {
    pub(crate) fn new(config: LaunchConfig) -> Self {
        let console = Arc::new(RollingBuffer::new(config.console_lines));
        let stdout = Arc::new(MultiSink::new("stdout"));
        let stderr = Arc::new(MultiSink::new("stderr"));

        stdout.add(Arc::new(RollingLogSink::new(
            "console-stdout",
            Arc::clone(&console),
            config.encoding,
        )));
        stderr.add(Arc::new(RollingLogSink::new(
            "console-stderr",
            Arc::clone(&console),
            config.encoding,
        )));
        for sink in config.stdout_sinks {
            stdout.add(sink);
        }
        for sink in config.stderr_sinks {
            stderr.add(sink);
        }

        Self {
            shared: Arc::new(Shared {
                long_name: config.long_name,
                alive: AtomicBool::new(false),
                kill_reason: AtomicU8::new(KILL_NONE),
                kill_signal: Notify::new(),
            }),
            phase: Mutex::new(Phase::NotStarted),
            command: config.command,
            stdin: Mutex::new(config.stdin),
            listener: config.listener,
            success: config.success,
            dispatcher: config.dispatcher,
            encoding: config.encoding,
            timeout: config.timeout,
            start_timeout: config.start_timeout,
            registry: config.registry,
            spawner: config.spawner,
            console,
            stdout,
            stderr,
            completion: OnceLock::new(),
            watchdog: OnceLock::new(),
            pid: OnceLock::new(),
        }
    }

    /// Spawn the process and return once its output is being captured
    pub async fn start(&self) -> Result<()> {
        {
            let mut phase = self.lock_phase();
            if *phase != Phase::NotStarted {
                return Err(ProcessError::AlreadyStarted {
                    process: self.proc_long_name().to_string(),
                });
            }
            *phase = Phase::Starting;
        }

        tracing::info!("Starting {}", self.proc_long_name());
        self.launch().await?;
        *self.lock_phase() = Phase::Running;
        tracing::debug!(
            "{} is running (pid {:?}, timeout {:?})",
            self.proc_long_name(),
            self.pid(),
            self.timeout
        );
        Ok(())
    }

    async fn launch(&self) -> Result<()> {
        let stdin_source = self.lock_stdin().take();
        let mut command = self.command.clone();
        command.pipe_stdin = stdin_source.is_some();

        let spawned = match self.spawner.spawn(&command) {
            Ok(spawned) => spawned,
            Err(source) => {
                *self.lock_phase() = Phase::NotStarted;
                tracing::error!("Failed to start {}: {}", self.proc_long_name(), source);
                return Err(ProcessError::StartFailed {
                    process: self.proc_long_name().to_string(),
                    source,
                });
            }
        };
        let SpawnedProcess {
            pid,
            stdout,
            stderr,
            stdin,
            handle,
        } = spawned;

        if let Some(pid) = pid {
            let _ = self.pid.set(pid);
        }
        let pid_label = pid.map_or_else(|| "?".to_string(), |pid| pid.to_string());
        self.stdout.add(Arc::new(TracingLogSink::new(
            StreamType::Stdout,
            pid_label.clone(),
            Arc::clone(&self.dispatcher),
            self.encoding,
        )));
        self.stderr.add(Arc::new(TracingLogSink::new(
            StreamType::Stderr,
            pid_label,
            Arc::clone(&self.dispatcher),
            self.encoding,
        )));
        self.shared.alive.store(true, Ordering::Release);

        let (stdout_started, stdout_confirmed) = oneshot::channel();
        let (stderr_started, stderr_confirmed) = oneshot::channel();
        let pumps = vec![
            tokio::spawn(pump(
                stdout,
                Arc::clone(&self.stdout),
                stdout_started,
                StreamType::Stdout,
            )),
            tokio::spawn(pump(
                stderr,
                Arc::clone(&self.stderr),
                stderr_started,
                StreamType::Stderr,
            )),
        ];
        if let (Some(source), Some(sink)) = (stdin_source, stdin) {
            tokio::spawn(forward_stdin(source, sink, self.proc_long_name().to_string()));
        }

        let (publisher, watch) = completion_signal();
        let _ = self.completion.set(watch);
        let watchdog = Watchdog::new(self.timeout);
        let _ = self.watchdog.set(Arc::clone(&watchdog));

        let registration = self.registry.as_ref().map(|registry| {
            let shared = Arc::clone(&self.shared);
            registry.register(self.proc_long_name(), move || {
                shared.request_kill(KILL_CALLER)
            })
        });

        tokio::spawn(supervise(Supervision {
            shared: Arc::clone(&self.shared),
            handle,
            pumps,
            publisher,
            watchdog: Arc::clone(&watchdog),
            listener: self.listener.clone(),
            success: Arc::clone(&self.success),
            stdout: Arc::clone(&self.stdout),
            stderr: Arc::clone(&self.stderr),
            registry: self.registry.clone().zip(registration),
        }));

        let confirmed = tokio::time::timeout(self.start_timeout, async {
            let stdout = stdout_confirmed.await;
            let stderr = stderr_confirmed.await;
            stdout.and(stderr)
        })
        .await;

        match confirmed {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.shared.request_kill(KILL_CALLER);
                return Err(ProcessError::interrupted(
                    "awaiting stream pumps",
                    self.proc_long_name(),
                ));
            }
            Err(_) => {
                self.shared.request_kill(KILL_CALLER);
                return Err(ProcessError::StartFailed {
                    process: self.proc_long_name().to_string(),
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!(
                            "output streams were not captured within {:?}",
                            self.start_timeout
                        ),
                    ),
                });
            }
        }

        let shared = Arc::clone(&self.shared);
        watchdog.arm(move || {
            shared.request_kill(KILL_WATCHDOG);
        });
        Ok(())
    }

    /// Start (unless already started) and wait until `literal` shows up on
    /// stdout or stderr.
    ///
    /// Returns `Ok(false)` if `max_wait` elapsed first; the process keeps
    /// running in that case.
    pub async fn start_and_wait_for_literal(&self, literal: &str, max_wait: Duration) -> Result<bool> {
        let watcher = Arc::new(LiteralWatcher::once(literal, self.encoding)?);
        let stdout_id = self.stdout.add(Arc::clone(&watcher) as Arc<dyn OutputSink>);
        let stderr_id = self.stderr.add(Arc::clone(&watcher) as Arc<dyn OutputSink>);

        let result = self.wait_for_literal(&watcher, literal, max_wait).await;

        self.stdout.remove(stdout_id);
        self.stderr.remove(stderr_id);
        result
    }

    async fn wait_for_literal(
        &self,
        watcher: &LiteralWatcher,
        literal: &str,
        max_wait: Duration,
    ) -> Result<bool> {
        match self.start().await {
            Ok(()) | Err(ProcessError::AlreadyStarted { .. }) => {}
            Err(e) => return Err(e),
        }
        let completion = self.completion_watch("wait for console literal")?.clone();
        let waiting_since = Instant::now();

        tokio::select! {
            biased;
            _ = watcher.seen() => {
                tracing::info!(
                    "Found {:?} in console of {} after {:?}",
                    literal,
                    self.proc_long_name(),
                    waiting_since.elapsed()
                );
                Ok(true)
            }
            halted = completion.wait() => {
                if watcher.has_seen() {
                    return Ok(true);
                }
                match halted {
                    Ok(_) => Err(ProcessError::HaltedBeforeLiteral {
                        process: self.proc_long_name().to_string(),
                        literal: literal.to_string(),
                        console: self.last_console_lines(),
                    }),
                    Err(_) => Err(ProcessError::interrupted(
                        "wait for console literal",
                        self.proc_long_name(),
                    )),
                }
            }
            _ = tokio::time::sleep(max_wait) => {
                tracing::warn!(
                    "{:?} not seen in console of {} within {:?}",
                    literal,
                    self.proc_long_name(),
                    max_wait
                );
                Ok(watcher.has_seen())
            }
        }
    }

    /// Kill the running process and wait until it has halted
    pub async fn destroy(&self) -> Result<()> {
        let Some(watchdog) = self.watchdog.get() else {
            return Err(ProcessError::not_alive("destroy", self.proc_long_name()));
        };
        watchdog.stop();

        if !self.is_alive() || !self.shared.request_kill(KILL_CALLER) {
            return Err(ProcessError::not_alive("destroy", self.proc_long_name()));
        }
        // The exit may already have been observed when the request landed
        match self.await_outcome("destroy").await? {
            ExitOutcome::DestroyedByCaller { .. } => {
                tracing::info!("Successfully destroyed {}", self.proc_long_name());
                Ok(())
            }
            _ => Err(ProcessError::not_alive("destroy", self.proc_long_name())),
        }
    }

    /// Whether the OS process is still running, regardless of the recorded state
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Exit code of the halted process
    pub fn exit_value(&self) -> Result<i32> {
        let watch = self.completion_watch("read exit value")?;
        watch
            .outcome()
            .map(|outcome| outcome.exit_code())
            .ok_or_else(|| ProcessError::ExitValueUnavailable {
                process: self.proc_long_name().to_string(),
            })
    }

    pub async fn wait_for_exit(&self) -> Result<i32> {
        Ok(self.await_outcome("wait for exit").await?.exit_code())
    }

    /// Wait at most `max_wait`; `None` means the process is still running
    pub async fn wait_for_exit_max(&self, max_wait: Duration) -> Result<Option<i32>> {
        let watch = self.completion_watch("wait for exit")?.clone();
        match tokio::time::timeout(max_wait, watch.wait()).await {
            Ok(Ok(outcome)) => Ok(Some(outcome.exit_code())),
            Ok(Err(_)) => Err(ProcessError::interrupted(
                "wait for exit",
                self.proc_long_name(),
            )),
            Err(_) => {
                tracing::debug!(
                    "{} still running after {:?}",
                    self.proc_long_name(),
                    max_wait
                );
                Ok(None)
            }
        }
    }

    /// Wait at most `max_wait`, then destroy the process if it is still running
    pub async fn wait_for_exit_max_or_destroy(&self, max_wait: Duration) -> Result<&Self> {
        if self.wait_for_exit_max(max_wait).await?.is_some() {
            return Ok(self);
        }
        match self.destroy().await {
            Ok(()) => {}
            // Halted on its own between the timeout and the kill
            Err(ProcessError::NotAlive { .. }) => {
                self.await_outcome("wait for exit or destroy").await?;
            }
            Err(e) => return Err(e),
        }
        Ok(self)
    }

    pub fn state(&self) -> LifecycleState {
        if let Some(outcome) = self.completion.get().and_then(CompletionWatch::outcome) {
            return LifecycleState::Halted(outcome);
        }
        match *self.lock_phase() {
            Phase::NotStarted => LifecycleState::NotStarted,
            Phase::Starting => LifecycleState::Starting,
            Phase::Running => LifecycleState::Running,
        }
    }

    /// True if the watchdog timeout killed the process
    pub fn watchdog_killed_process(&self) -> bool {
        self.shared.kill_reason.load(Ordering::Acquire) == KILL_WATCHDOG
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Most recent console lines (stdout and stderr), oldest first
    pub fn console(&self) -> String {
        self.console.snapshot()
    }

    /// Console snapshot prefixed with the process name, for diagnostics
    pub fn last_console_lines(&self) -> String {
        format!(
            "{}, last {} lines of console:\n{}",
            self.proc_long_name(),
            self.console.capacity(),
            self.console.snapshot()
        )
    }

    /// Executable, arguments and working directory in human readable form
    pub fn proc_long_name(&self) -> &str {
        &self.shared.long_name
    }

    /// Register another sink for one stream; takes effect from the next write
    pub fn add_sink(&self, stream: StreamType, sink: Arc<dyn OutputSink>) -> SinkId {
        self.sinks(stream).add(sink)
    }

    pub fn remove_sink(&self, stream: StreamType, id: SinkId) -> Option<Arc<dyn OutputSink>> {
        self.sinks(stream).remove(id)
    }

    fn sinks(&self, stream: StreamType) -> &MultiSink {
        match stream {
            StreamType::Stdout => &self.stdout,
            StreamType::Stderr => &self.stderr,
        }
    }

    fn completion_watch(&self, operation: &'static str) -> Result<&CompletionWatch> {
        self.completion
            .get()
            .ok_or_else(|| ProcessError::not_alive(operation, self.proc_long_name()))
    }

    async fn await_outcome(&self, phase: &'static str) -> Result<ExitOutcome> {
        let watch = self.completion_watch(phase)?;
        watch
            .wait()
            .await
            .map_err(|_| ProcessError::interrupted(phase, self.proc_long_name()))
    }

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, Phase> {
        match self.phase.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_stdin(&self) -> std::sync::MutexGuard<'_, Option<BoxedReader>> {
        match self.stdin.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.proc_long_name())
            .field("pid", &self.pid())
            .field("state", &self.state())
            .finish()
    }
}

/// Copy one output stream into its sinks until EOF.
///
/// `started` is signalled once the first read has been attempted.
async fn pump(
    mut reader: BoxedReader,
    sinks: Arc<MultiSink>,
    started: oneshot::Sender<()>,
    stream: StreamType,
) {
    let mut started = Some(started);
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        let read = std::future::poll_fn(|cx| {
            let mut read_buf = ReadBuf::new(&mut buf);
            let polled = Pin::new(&mut reader)
                .poll_read(cx, &mut read_buf)
                .map_ok(|()| read_buf.filled().len());
            if let Some(started) = started.take() {
                let _ = started.send(());
            }
            polled
        })
        .await;
        match read {
            Ok(0) => break,
            Ok(n) => {
                // Failures are already logged per sink; keep pumping
                let _ = sinks.forward_write(&buf[..n]);
            }
            Err(e) => {
                tracing::warn!("Reading process {} failed: {}", stream, e);
                break;
            }
        }
    }
    let _ = sinks.forward_flush();
}

async fn forward_stdin(mut source: BoxedReader, mut sink: BoxedWriter, process: String) {
    if let Err(e) = tokio::io::copy(&mut source, &mut sink).await {
        tracing::debug!("Forwarding stdin to {} stopped: {}", process, e);
    }
    let _ = sink.shutdown().await;
}

struct Supervision {
    shared: Arc<Shared>,
    handle: Box<dyn ProcessHandle>,
    pumps: Vec<JoinHandle<()>>,
    publisher: CompletionPublisher,
    watchdog: Arc<Watchdog>,
    listener: Option<Arc<dyn ProcessListener>>,
    success: ExitCodeCheck,
    stdout: Arc<MultiSink>,
    stderr: Arc<MultiSink>,
    registry: Option<(ProcessRegistry, RegistrationId)>,
}

/// Waiter task: observes termination and publishes the single outcome
async fn supervise(mut run: Supervision) {
    let name = run.shared.long_name.clone();

    let (waited, exited_on_its_own) = tokio::select! {
        biased;
        result = run.handle.wait() => (result, true),
        _ = run.shared.kill_signal.notified() => {
            if let Err(e) = run.handle.kill() {
                tracing::warn!("Failed to kill {}: {}", name, e);
            }
            (run.handle.wait().await, false)
        }
    };
    let kill_reason = if exited_on_its_own {
        run.shared.kill_reason.swap(KILL_REAPED, Ordering::AcqRel);
        KILL_NONE
    } else {
        run.shared.kill_reason.load(Ordering::Acquire)
    };
    run.shared.alive.store(false, Ordering::Release);
    run.watchdog.stop();
    if let Some((registry, id)) = run.registry.take() {
        registry.deregister(id);
    }

    let mut pumps = std::mem::take(&mut run.pumps);
    let drained =
        tokio::time::timeout(PUMP_DRAIN_TIMEOUT, futures::future::join_all(pumps.iter_mut())).await;
    match drained {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    tracing::warn!("Stream pump of {} ended abnormally: {}", name, e);
                }
            }
        }
        Err(_) => {
            // A grandchild may hold the pipes open; stop reading into closed sinks
            tracing::warn!(
                "Output of {} still open {:?} after exit, closing sinks anyway",
                name,
                PUMP_DRAIN_TIMEOUT
            );
            for pump in &pumps {
                pump.abort();
            }
        }
    }
    for sinks in [&run.stdout, &run.stderr] {
        if let Err(e) = sinks.forward_close() {
            tracing::debug!("Closing {} sinks of {}: {}", sinks.name(), name, e);
        }
    }

    let outcome = resolve_outcome(kill_reason, waited, run.success.as_ref());
    notify_process_halted(&name, &outcome, run.listener.as_deref());
    run.publisher.publish(outcome);
}

fn resolve_outcome(kill_reason: u8, waited: io::Result<i32>, success: &dyn Fn(i32) -> bool) -> ExitOutcome {
    match (kill_reason, waited) {
        (KILL_WATCHDOG, waited) => ExitOutcome::DestroyedByWatchdog {
            exit_code: waited.unwrap_or(-1),
        },
        (KILL_CALLER, waited) => ExitOutcome::DestroyedByCaller {
            exit_code: waited.unwrap_or(-1),
        },
        (_, Ok(exit_code)) if success(exit_code) => ExitOutcome::Completed { exit_code },
        (_, Ok(exit_code)) => ExitOutcome::Failed {
            exit_code,
            cause: format!("Process exited with code {}", exit_code),
        },
        (_, Err(e)) => ExitOutcome::Failed {
            exit_code: -1,
            cause: format!("Waiting for process failed: {}", e),
        },
    }
}

fn notify_process_halted(
    name: &str,
    outcome: &ExitOutcome,
    listener: Option<&dyn ProcessListener>,
) {
    let cause = match outcome {
        ExitOutcome::Completed { exit_code } => {
            tracing::info!("{} completed with exit code {}", name, exit_code);
            if let Some(listener) = listener {
                listener.on_complete(*exit_code);
            }
            return;
        }
        ExitOutcome::Failed { cause, .. } => {
            tracing::error!("{} failed: {}", name, cause);
            cause.clone()
        }
        ExitOutcome::DestroyedByWatchdog { .. } => {
            tracing::info!("{} was destroyed by its watchdog", name);
            "destroyed by watchdog timeout".to_string()
        }
        ExitOutcome::DestroyedByCaller { .. } => {
            tracing::info!("{} was destroyed", name);
            "destroyed on request".to_string()
        }
    };
    if let Some(listener) = listener {
        listener.on_failed(outcome.exit_code(), &cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_is_success(code: i32) -> bool {
        code == 0
    }

    #[test]
    fn test_kill_reason_is_authoritative() {
        let outcome = resolve_outcome(KILL_WATCHDOG, Ok(0), &zero_is_success);
        assert_eq!(outcome, ExitOutcome::DestroyedByWatchdog { exit_code: 0 });

        let outcome = resolve_outcome(KILL_CALLER, Ok(137), &zero_is_success);
        assert_eq!(outcome, ExitOutcome::DestroyedByCaller { exit_code: 137 });
    }

    #[test]
    fn test_natural_exit_uses_success_check() {
        assert_eq!(
            resolve_outcome(KILL_NONE, Ok(0), &zero_is_success),
            ExitOutcome::Completed { exit_code: 0 }
        );
        assert!(matches!(
            resolve_outcome(KILL_NONE, Ok(3), &zero_is_success),
            ExitOutcome::Failed { exit_code: 3, .. }
        ));
        assert_eq!(
            resolve_outcome(KILL_NONE, Ok(3), &|code| code == 3),
            ExitOutcome::Completed { exit_code: 3 }
        );
    }

    #[test]
    fn test_wait_error_is_failure() {
        let outcome = resolve_outcome(
            KILL_NONE,
            Err(io::Error::other("lost child")),
            &zero_is_success,
        );
        assert!(matches!(outcome, ExitOutcome::Failed { exit_code: -1, ref cause } if cause.contains("lost child")));
    }

    #[test]
    fn test_request_kill_only_once_and_only_when_alive() {
        let shared = Shared {
            long_name: "Program test".to_string(),
            alive: AtomicBool::new(false),
            kill_reason: AtomicU8::new(KILL_NONE),
            kill_signal: Notify::new(),
        };
        assert!(!shared.request_kill(KILL_CALLER));

        shared.alive.store(true, Ordering::Release);
        assert!(shared.request_kill(KILL_WATCHDOG));
        assert!(!shared.request_kill(KILL_CALLER));
        assert_eq!(shared.kill_reason.load(Ordering::Acquire), KILL_WATCHDOG);
    }

    #[test]
    fn test_kill_after_reap_is_refused() {
        let shared = Shared {
            long_name: "Program test".to_string(),
            alive: AtomicBool::new(true),
            kill_reason: AtomicU8::new(KILL_REAPED),
            kill_signal: Notify::new(),
        };
        assert!(!shared.request_kill(KILL_CALLER));
        assert!(!shared.request_kill(KILL_WATCHDOG));
    }

    mod scripted {
        use super::*;
        use crate::process::ManagedProcessBuilder;
        use std::task::{Context, Poll};
        use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

        const SIGKILL_EXIT: i32 = 137;

        #[derive(Clone, Copy)]
        enum ReadBehavior {
            Eof,
            Panic,
            Stall(Duration),
        }

        struct ScriptedReader(ReadBehavior);

        impl AsyncRead for ScriptedReader {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                match self.0 {
                    ReadBehavior::Eof => {}
                    ReadBehavior::Panic => panic!("stdout pipe broke"),
                    ReadBehavior::Stall(pause) => std::thread::sleep(pause),
                }
                Poll::Ready(Ok(()))
            }
        }

        /// Child that exits with whatever code arrives on `exits`
        struct ScriptedHandle {
            exits: UnboundedReceiver<i32>,
            killer: UnboundedSender<i32>,
            panic_on_wait: bool,
        }

        #[async_trait::async_trait]
        impl ProcessHandle for ScriptedHandle {
            async fn wait(&mut self) -> io::Result<i32> {
                if self.panic_on_wait {
                    panic!("lost track of the child");
                }
                self.exits
                    .recv()
                    .await
                    .ok_or_else(|| io::Error::other("exit channel closed"))
            }

            fn kill(&mut self) -> io::Result<()> {
                let _ = self.killer.send(SIGKILL_EXIT);
                Ok(())
            }
        }

        struct ScriptedSpawner {
            stdout: ReadBehavior,
            handle: Mutex<Option<ScriptedHandle>>,
        }

        impl Spawner for ScriptedSpawner {
            fn spawn(&self, _command: &ProcessCommand) -> io::Result<SpawnedProcess> {
                let handle = self
                    .handle
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| io::Error::other("spawned twice"))?;
                Ok(SpawnedProcess {
                    pid: Some(4242),
                    stdout: Box::new(ScriptedReader(self.stdout)),
                    stderr: Box::new(ScriptedReader(ReadBehavior::Eof)),
                    stdin: None,
                    handle: Box::new(handle),
                })
            }
        }

        /// A process on a fake spawner plus the sender that makes it exit
        fn fake_process(
            stdout: ReadBehavior,
            panic_on_wait: bool,
            start_timeout: Duration,
        ) -> (ManagedProcess, UnboundedSender<i32>) {
            let (exit, exits) = unbounded_channel();
            let spawner = ScriptedSpawner {
                stdout,
                handle: Mutex::new(Some(ScriptedHandle {
                    exits,
                    killer: exit.clone(),
                    panic_on_wait,
                })),
            };
            let process = ManagedProcessBuilder::new("fake-server")
                .spawner(Arc::new(spawner))
                .start_timeout(start_timeout)
                .build()
                .unwrap();
            (process, exit)
        }

        #[tokio::test]
        async fn test_start_returns_once_pumps_read() {
            let (process, exit) = fake_process(ReadBehavior::Eof, false, Duration::from_secs(5));

            process.start().await.unwrap();
            assert_eq!(process.state(), LifecycleState::Running);
            assert_eq!(process.pid(), Some(4242));

            exit.send(0).unwrap();
            assert_eq!(process.wait_for_exit().await.unwrap(), 0);
            assert_eq!(
                process.state(),
                LifecycleState::Halted(ExitOutcome::Completed { exit_code: 0 })
            );
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_stalled_pump_fails_start_and_destroys() {
            let (process, _exit) = fake_process(
                ReadBehavior::Stall(Duration::from_millis(300)),
                false,
                Duration::from_millis(50),
            );

            match process.start().await {
                Err(ProcessError::StartFailed {
                    process: name,
                    source,
                }) => {
                    assert_eq!(name, "Program fake-server");
                    assert_eq!(source.kind(), io::ErrorKind::TimedOut);
                }
                other => panic!("expected StartFailed, got {:?}", other),
            }

            assert_eq!(process.wait_for_exit().await.unwrap(), SIGKILL_EXIT);
            assert_eq!(
                process.state(),
                LifecycleState::Halted(ExitOutcome::DestroyedByCaller {
                    exit_code: SIGKILL_EXIT
                })
            );
        }

        #[tokio::test]
        async fn test_pump_failure_interrupts_start() {
            let (process, _exit) = fake_process(ReadBehavior::Panic, false, Duration::from_secs(5));

            match process.start().await {
                Err(ProcessError::Interrupted {
                    phase,
                    process: name,
                }) => {
                    assert_eq!(phase, "awaiting stream pumps");
                    assert_eq!(name, "Program fake-server");
                }
                other => panic!("expected Interrupted, got {:?}", other),
            }

            assert_eq!(process.wait_for_exit().await.unwrap(), SIGKILL_EXIT);
            assert!(matches!(
                process.state(),
                LifecycleState::Halted(ExitOutcome::DestroyedByCaller { .. })
            ));
        }

        #[tokio::test]
        async fn test_lost_waiter_interrupts_wait() {
            let (process, _exit) = fake_process(ReadBehavior::Eof, true, Duration::from_secs(5));
            process.start().await.unwrap();

            match process.wait_for_exit().await {
                Err(ProcessError::Interrupted {
                    phase,
                    process: name,
                }) => {
                    assert_eq!(phase, "wait for exit");
                    assert_eq!(name, "Program fake-server");
                }
                other => panic!("expected Interrupted, got {:?}", other),
            }
            assert!(matches!(
                process.exit_value(),
                Err(ProcessError::ExitValueUnavailable { .. })
            ));
        }

        #[tokio::test]
        async fn test_observed_exit_wins_over_late_destroy() {
            let (process, exit) = fake_process(ReadBehavior::Eof, false, Duration::from_secs(5));
            process.start().await.unwrap();

            // Exit is queued but the waiter has not run yet
            exit.send(0).unwrap();
            assert!(process.is_alive());

            assert!(matches!(
                process.destroy().await,
                Err(ProcessError::NotAlive { .. })
            ));
            assert_eq!(
                process.state(),
                LifecycleState::Halted(ExitOutcome::Completed { exit_code: 0 })
            );
            assert!(!process.watchdog_killed_process());
        }
    }
}
