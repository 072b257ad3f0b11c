//! # procwarden
//!
//! Supervise external processes: start them with captured output, wait
//! for a readiness literal to appear in their console, enforce a watchdog
//! timeout, destroy them on demand and observe how they halted.
//!
//! ```no_run
//! use procwarden::process::ManagedProcessBuilder;
//! use std::time::Duration;
//!
//! # async fn demo() -> procwarden::process::Result<()> {
//! let server = ManagedProcessBuilder::new("./bin/server")
//!     .arg("--port=8080")
//!     .timeout(Duration::from_secs(600))
//!     .build()?;
//! if server
//!     .start_and_wait_for_literal("Listening", Duration::from_secs(30))
//!     .await?
//! {
//!     // ... talk to the server ...
//!     server.destroy().await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - `output` - Sinks for live process output: multiplexer, rolling console buffer, literal watcher
//! - `process` - Builder, lifecycle controller, watchdog and shutdown registry
//! - `config` - Supervisor settings loaded from TOML
//! - `app` - Logging and error reporting for the binary
pub mod app;
pub mod config;
pub mod output;
pub mod process;
