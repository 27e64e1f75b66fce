//! rube-goldberg - deferred chain ordering demonstrations
//!
//! Each command builds a small set of deferred chains, drives the scheduler
//! until nothing is left to run, and prints every stage to stdout in the
//! order it fired. Logs go to stderr.

use std::io::Write;
use std::time::Duration;

use clap::{Parser, Subcommand};
use deferred_chain::Scheduler;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod demo;
mod error;

use config::CliConfig;
use error::CliResult;

/// rube-goldberg CLI
#[derive(Parser)]
#[command(name = "rube-goldberg")]
#[command(about = "Deferred chain ordering demonstrations", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "RUBE_CONFIG", global = true)]
    config: Option<String>,

    /// Log level (overrides the configured level)
    #[arg(long, env = "RUBE_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Drop a ball through three chained steps after a timer fires
    Run {
        /// Value passed down the chain
        #[arg(short, long)]
        ball: Option<String>,

        /// Milliseconds before the timer resolves the chain
        #[arg(short, long)]
        delay_ms: Option<u64>,
    },

    /// Combine two deferred steps through continuation return values
    Compose,

    /// Combine two deferred steps with sequential awaits
    Async {
        /// Milliseconds to sleep between the steps
        #[arg(short, long, default_value_t = 0)]
        delay_ms: u64,
    },

    /// Resolve two chains back to back and show how their links alternate
    Interleave,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let config = CliConfig::load(cli.config.as_deref())?;

    // Initialize tracing
    let level = cli.log_level.clone().unwrap_or(config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let scheduler = Scheduler::with_config(config.scheduler.clone())?;

    let stats = match cli.command {
        Commands::Run { ball, delay_ms } => {
            let ball = ball.unwrap_or(config.demo.ball);
            let delay = Duration::from_millis(delay_ms.unwrap_or(config.demo.delay_ms));
            demo::rube_goldberg(&scheduler, ball, delay).await?
        }
        Commands::Compose => demo::compose(&scheduler).await?,
        Commands::Async { delay_ms } => {
            demo::sequential(&scheduler, Duration::from_millis(delay_ms)).await?
        }
        Commands::Interleave => demo::interleave(&scheduler).await?,
    };

    std::io::stdout().flush()?;
    info!(
        callbacks = stats.callbacks_run,
        polls = stats.task_polls,
        timers = stats.timers_fired,
        "Done"
    );
    Ok(())
}
