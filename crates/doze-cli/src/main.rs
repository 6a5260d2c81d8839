//! doze - operator and diagnostic commands for suspend orchestration.
//!
//! Thin subcommands over `doze-core`: request a suspend, hold the
//! inhibitor around a child command, abort an in-flight attempt, and the
//! diagnostic `watch`/`wake`/`guard` participants.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use doze_core::ControlPaths;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_codes;

/// doze - cooperative suspend/resume orchestration client
#[derive(Parser, Debug)]
#[command(name = "doze")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Run directory of the control surface
    #[arg(long)]
    run_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Request a suspend and wait for the attempt to conclude
    Request {
        /// Also hold an immediate marker: suspend as soon as possible,
        /// retrying past inhibitors
        #[arg(long)]
        immediate: bool,
    },

    /// Hold the inhibitor lock while a command runs
    Inhibit {
        /// The command to run
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Abort any in-flight suspend attempt
    Abort,

    /// Print suspend/resume events as they happen
    Watch,

    /// Schedule a wake-up and wait for it
    Wake {
        /// Seconds since the epoch, or +N for N seconds from now
        when: String,
    },

    /// Register an inherited descriptor with the veto service
    Guard {
        /// The descriptor number to guard
        #[arg(long)]
        fd: i32,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let paths = cli
        .run_dir
        .map_or_else(ControlPaths::default, ControlPaths::new);

    let result = match cli.command {
        Commands::Request { immediate } => commands::request::run(&paths, immediate),
        Commands::Inhibit { command } => commands::inhibit::run(&paths, &command),
        Commands::Abort => commands::abort::run(&paths),
        Commands::Watch => commands::watch::run(&paths),
        Commands::Wake { when } => commands::wake::run(&paths, &when),
        Commands::Guard { fd } => commands::guard::run(&paths, fd),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("doze: {e:#}");
            ExitCode::from(exit_codes::GENERIC_ERROR)
        }
    }
}
