//! dozed - the doze suspend orchestration daemons.
//!
//! One binary hosts three services, each meant to run as its own process:
//! `dozed coordinator`, `dozed events` and `dozed alarm`. Whoever
//! supervises them (an init system, usually) starts the coordinator first
//! so the control files exist before the socket services attach their
//! watchers.
//!
//! The socket services run on a manually constructed current-thread
//! runtime inside a `LocalSet`: every daemon is single-threaded and
//! cooperative by design, so connection tasks never contend with the
//! service state.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use doze_daemon::config::DozeConfig;
use doze_daemon::coordinator::Coordinator;
use doze_daemon::power::{PowerInterface, SysfsSleep};
use doze_daemon::{alarm, events};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// dozed - cooperative suspend/resume orchestration daemons
#[derive(Parser, Debug)]
#[command(name = "dozed")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (defaults apply when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    service: Service,
}

#[derive(Subcommand, Debug)]
enum Service {
    /// Run the suspend coordinator
    Coordinator,
    /// Run the fd-readiness veto service
    Events,
    /// Run the wake-alarm service
    Alarm,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => DozeConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DozeConfig::default(),
    };

    match args.service {
        Service::Coordinator => run_coordinator(config),
        Service::Events => run_local(events::run(config.paths)),
        Service::Alarm => run_local(alarm::run(config.paths, config.alarm)),
    }
}

/// The coordinator is a synchronous loop; no runtime is constructed.
fn run_coordinator(config: DozeConfig) -> Result<()> {
    let power = PowerInterface::new(config.power.wakeup_count.clone());
    let sleep = SysfsSleep::new(config.power.state.clone());
    let mut coordinator = Coordinator::new(config.paths, power, sleep)
        .context("coordinator startup failed")?;
    coordinator.run().context("coordinator loop failed")?;
    Ok(())
}

/// Run a socket service on a single-threaded runtime.
fn run_local<E>(service: impl std::future::Future<Output = Result<(), E>>) -> Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, service)?;
    Ok(())
}
