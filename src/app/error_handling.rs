//! Error handling utilities

use crate::process::ProcessError;
use tracing::error;

pub const GENERAL_ERROR: i32 = 1;

/// Report a fatal error and exit with [`GENERAL_ERROR`].
///
/// With `verbose >= 1` the whole error chain is printed. A process that
/// halted before its literal appeared already carries its console tail.
pub fn handle_fatal_error(error: anyhow::Error, verbose: u8) -> ! {
    error!("Fatal error: {}", error);
    eprintln!("Error: {error}");

    if verbose >= 1 {
        eprintln!("\nError chain:");
        for (i, cause) in error.chain().enumerate() {
            eprintln!("  {}: {}", i, cause);
        }
        if let Some(ProcessError::Sink(failures)) = error.downcast_ref::<ProcessError>() {
            for failure in failures.causes() {
                eprintln!("  sink {}: {}", failure.label, failure.source);
            }
        }
    }

    std::process::exit(GENERAL_ERROR)
}
