//! streamgate CLI
//!
//! Consume from a consumer group or produce records from the command line.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use streamgate_config::{LoggingConfig, StreamgateConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{ConsumeArgs, ProduceArgs};

#[derive(Parser)]
#[command(
    name = "streamgate",
    version,
    about = "Consumer-group coordination and producer gateway for Kafka"
)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        value_name = "FILE",
        env = "STREAMGATE_CONFIG",
        help = "Path to configuration file"
    )]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    /// JSON log lines
    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a consumer group and print claimed messages
    #[command(name = "consume", about = "Join a consumer group and print claimed messages")]
    Consume(ConsumeArgs),

    /// Send payloads through a producer gateway
    #[command(name = "produce", about = "Send JSON payloads through a producer gateway")]
    Produce(ProduceArgs),

    /// List supported protocol versions
    #[command(name = "versions", about = "List supported broker protocol versions")]
    Versions,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = StreamgateConfig::load(cli.config.clone()).context("loading configuration")?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    config.logging.validate()?;

    init_tracing(&config.logging);

    match cli.command {
        Commands::Consume(args) => commands::consume::execute(args, config.consumer).await,
        Commands::Produce(args) => commands::produce::execute(args, config.producer).await,
        Commands::Versions => {
            commands::versions::execute();
            Ok(())
        }
    }
}

/// Initialize tracing/logging
///
/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
