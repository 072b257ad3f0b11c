use clap::{Args, Parser, Subcommand};
use procwarden::app::{handle_fatal_error, init_logging, AppConfig};
use procwarden::config::load_config;
use procwarden::output::{LevelDispatcher, WriteSink};
use procwarden::process::{ManagedProcess, ManagedProcessBuilder, ProcessRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Exit status when the awaited literal did not show up in time
const WAIT_TIMEOUT_EXIT: i32 = 124;

/// Run and supervise external processes
#[derive(Parser)]
#[command(name = "procwarden", version)]
#[command(about = "Run a program under supervision: watchdog, console capture and readiness detection", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a program and wait for it to halt
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Supervisor config file (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Working directory of the program
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Extra environment variable, KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = parse_env_var)]
    env: Vec<(String, String)>,

    /// Wait until this literal appears on stdout or stderr
    #[arg(long)]
    wait_for: Option<String>,

    /// How long to wait for the literal
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    wait_timeout: Duration,

    /// Kill the program when it runs longer than this
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Wait at most this long for the program to halt, then destroy it
    #[arg(long, value_parser = parse_duration)]
    exit_after: Option<Duration>,

    /// Program followed by its arguments
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

fn parse_env_var(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", value)),
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Commands::Run(args) = cli.command;

    let config = AppConfig::new(cli.verbose).with_config_file(args.config.clone());
    init_logging(&config);

    match run(args, &config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => handle_fatal_error(e, config.verbose),
    }
}

async fn run(args: RunArgs, app: &AppConfig) -> anyhow::Result<i32> {
    let supervisor = load_config(app.config_file.as_deref()).await?;
    let registry = ProcessRegistry::new();

    let process = build_process(&args, &supervisor, registry.clone())?;

    let shutdown = registry.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, destroying supervised processes");
            shutdown.destroy_all();
        }
    });

    if let Some(literal) = &args.wait_for {
        if !process
            .start_and_wait_for_literal(literal, args.wait_timeout)
            .await?
        {
            eprintln!(
                "{:?} did not appear within {:?}\n{}",
                literal,
                args.wait_timeout,
                process.last_console_lines()
            );
            if process.is_alive() {
                let _ = process.destroy().await;
            }
            return Ok(WAIT_TIMEOUT_EXIT);
        }
    } else {
        process.start().await?;
    }

    let code = match args.exit_after {
        Some(max_wait) => process
            .wait_for_exit_max_or_destroy(max_wait)
            .await?
            .exit_value()?,
        None => process.wait_for_exit().await?,
    };
    debug!("{} halted: {:?}", process.proc_long_name(), process.state());
    Ok(code)
}

fn build_process(
    args: &RunArgs,
    supervisor: &procwarden::config::SupervisorConfig,
    registry: ProcessRegistry,
) -> anyhow::Result<ManagedProcess> {
    let (program, program_args) = args
        .command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("No program given"))?;

    let mut builder = ManagedProcessBuilder::new(program.as_str())
        .args(program_args)
        .envs(args.env.iter().map(|(k, v)| (k, v)))
        .registry(registry)
        .add_stdout(Arc::new(WriteSink::new("stdout", std::io::stdout())))
        .add_stderr(Arc::new(WriteSink::new("stderr", std::io::stderr())));
    if let Some(cwd) = &args.cwd {
        builder = builder.working_dir(cwd);
    }
    builder = supervisor.apply(builder)?;
    // The passthrough sinks already echo the output; log lines only for
    // streams the config names a level for
    let levels = supervisor.dispatcher_over(LevelDispatcher {
        stdout: None,
        stderr: None,
    })?;
    builder = builder.log_dispatcher(Arc::new(levels));
    if let Some(timeout) = args.timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}
