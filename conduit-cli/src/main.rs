//! Conduit CLI - Command-line interface
//!
//! Runs one or more Psiphon Conduit relay instances.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use conduit_core::ConduitConfig;
use conduit_core::tracing_setup::{LogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Runs Psiphon Conduit relay instances")]
struct Cli {
    /// Base data directory [default: ./data, or $CONDUIT_DATA_DIR]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Console log level
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    /// Directory for the full debug log of this run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ConduitConfig::from_env();

    let logs_dir = cli
        .logs_dir
        .unwrap_or_else(|| config.paths.logs_dir.clone());
    init_tracing(cli.log_level, Some(&logs_dir))
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    let context = commands::CommandContext {
        data_dir: cli
            .data_dir
            .unwrap_or_else(|| config.paths.data_dir.clone()),
        log_level: cli.log_level,
        config,
    };
    commands::handle_command(cli.command, context).await
}
