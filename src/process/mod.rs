//! Managed process lifecycle
//!
//! [`ManagedProcessBuilder`] describes a process, [`ManagedProcess`] runs
//! and supervises it. Spawning goes through the [`Spawner`] trait so that
//! tests can substitute the OS.

pub mod builder;
pub mod completion;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod spawner;
pub mod watchdog;

pub use builder::{ManagedProcessBuilder, DEFAULT_CONSOLE_BUFFER_LINES, DEFAULT_START_TIMEOUT};
pub use completion::{ExitOutcome, ProcessListener};
pub use error::{ProcessError, Result};
pub use lifecycle::{ExitCodeCheck, LifecycleState, ManagedProcess};
pub use registry::ProcessRegistry;
pub use spawner::{
    exit_code, BoxedReader, BoxedWriter, ProcessCommand, ProcessHandle, SpawnedProcess, Spawner,
    TokioSpawner,
};
pub use watchdog::Watchdog;
