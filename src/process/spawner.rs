//! The OS process-spawn capability the controller is built on

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};

/// Everything needed to launch a process. No shell is involved: `program`
/// is executed directly with `args`.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Complete environment of the child; the parent's is not inherited
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub pipe_stdin: bool,
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A freshly spawned process with its live streams
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub stdin: Option<BoxedWriter>,
    pub handle: Box<dyn ProcessHandle>,
}

/// Owner-side handle of a running process
#[async_trait]
pub trait ProcessHandle: Send {
    /// Wait for the process to exit and return its exit code.
    ///
    /// Must be cancel safe: the controller races it against kill requests.
    async fn wait(&mut self) -> io::Result<i32>;

    /// Forcefully terminate the process
    fn kill(&mut self) -> io::Result<()>;
}

pub trait Spawner: Send + Sync {
    fn spawn(&self, command: &ProcessCommand) -> io::Result<SpawnedProcess>;
}

/// Spawns real processes through `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl TokioSpawner {
    fn configure_command(command: &ProcessCommand) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&command.program);

        // Own process group so a forced kill reaches grandchildren too
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.args(&command.args);
        cmd.env_clear();
        cmd.envs(&command.env);

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        if command.pipe_stdin {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    fn log_command_start(command: &ProcessCommand) {
        tracing::debug!(
            "Executing subprocess: {} {}",
            command.program,
            command.args.join(" ")
        );
        tracing::trace!(
            "Environment variables count: {}, total size: {} bytes",
            command.env.len(),
            command
                .env
                .iter()
                .map(|(k, v)| k.len() + v.len() + 2)
                .sum::<usize>()
        );
        if let Some(ref dir) = command.working_dir {
            tracing::trace!("Working directory: {:?}", dir);
        }
    }
}

impl Spawner for TokioSpawner {
    fn spawn(&self, command: &ProcessCommand) -> io::Result<SpawnedProcess> {
        Self::log_command_start(command);

        let mut child = Self::configure_command(command).spawn()?;
        let missing = |what: &str| io::Error::other(format!("child {what} was not captured"));

        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let stdin = child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as BoxedWriter);
        let pid = child.id();

        Ok(SpawnedProcess {
            pid,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            stdin,
            handle: Box::new(TokioProcessHandle { child, pid }),
        })
    }
}

struct TokioProcessHandle {
    child: tokio::process::Child,
    pid: Option<u32>,
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }

    fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;

                match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) => return Ok(()),
                    Err(e) => tracing::debug!("killpg({}) failed: {}, killing child only", pid, e),
                }
            }
        }
        self.child.start_kill()
    }
}

/// Exit code of a finished process; `128 + signal` when killed by a signal
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
