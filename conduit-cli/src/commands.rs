//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::{Args, Subcommand};
use conduit_core::config::prepare_base_dir;
use conduit_core::tracing_setup::LogLevel;
use conduit_core::{
    BandwidthLimit, ConduitConfig, InstanceConfig, MaxClients, MetricsRegistry,
    NetworkConfigSource, Orchestrator, RelayService, SharedInstanceSettings, ShutdownBridge,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run multiple relay instances in parallel
    RunMulti(RunMultiArgs),
}

/// Options of `run-multi`
#[derive(Args, Debug)]
pub struct RunMultiArgs {
    /// Number of instances to run (1-32)
    #[arg(short = 'n', long, default_value_t = 2)]
    pub instances: usize,
    /// Maximum concurrent clients per instance (1-1000) [default: 50]
    #[arg(short = 'm', long)]
    pub max_clients: Option<u32>,
    /// Bandwidth limit per instance in Mbps, -1 for unlimited [default: 40]
    #[arg(short = 'b', long, allow_negative_numbers = true)]
    pub bandwidth: Option<f64>,
    /// Write per-instance stats files; a bare flag uses stats.json
    #[arg(short = 's', long, num_args = 0..=1, default_missing_value = "stats.json")]
    pub stats_file: Option<String>,
    /// Path to the Psiphon network config file
    #[arg(short = 'c', long)]
    pub psiphon_config: Option<PathBuf>,
}

/// Settings resolved from global flags and the environment
pub struct CommandContext {
    pub config: ConduitConfig,
    pub data_dir: PathBuf,
    pub log_level: LogLevel,
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands, context: CommandContext) -> anyhow::Result<()> {
    match command {
        Commands::RunMulti(args) => run_multi(args, context).await,
    }
}

/// Run several relay instances until interrupted or until one fails
///
/// # Errors
/// - `ConduitError::Configuration` - Invalid limits, instance count or network
///   config, or a directory could not be created; nothing was started
/// - An instance failed before shutdown was requested
pub async fn run_multi(args: RunMultiArgs, context: CommandContext) -> anyhow::Result<()> {
    let (orchestrator, settings) = prepare_orchestrator(&args, &context)?;
    prepare_base_dir(&context.data_dir).await?;

    let cancel = CancellationToken::new();
    let bridge = ShutdownBridge::new(cancel.clone());
    let listener = bridge.listen()?;

    println!(
        "Starting {} Psiphon Conduit instances (Max Clients/instance: {}, Bandwidth/instance: {})",
        orchestrator.instance_count(),
        settings.max_clients,
        settings.bandwidth
    );
    info!(
        "Data directory {}, network config {}",
        context.data_dir.display(),
        settings.network_config
    );

    let metrics = Arc::new(MetricsRegistry::new());
    let service = Arc::new(RelayService::new(
        metrics,
        context.config.stats.write_interval,
    ));

    let result = orchestrator.run(Arc::clone(&service), cancel).await;
    listener.abort();

    match service.metrics().gather_text() {
        Ok(text) => debug!("Final metrics:\n{text}"),
        Err(e) => warn!("Failed to gather final metrics: {e}"),
    }

    match result {
        Ok(summary) => {
            info!("Run finished: {summary:?}");
            println!("All instances stopped.");
            Ok(())
        }
        Err(e) => Err(anyhow!(e.user_message())),
    }
}

/// Validates every input and builds the orchestrator without touching disk.
fn prepare_orchestrator(
    args: &RunMultiArgs,
    context: &CommandContext,
) -> conduit_core::Result<(Orchestrator, SharedInstanceSettings)> {
    let max_clients = match args.max_clients {
        Some(value) => MaxClients::new(value)?,
        None => context.config.limits.max_clients,
    };
    let bandwidth = match args.bandwidth {
        Some(mbps) => BandwidthLimit::from_mbps(mbps)?,
        None => context.config.limits.bandwidth,
    };

    let settings = SharedInstanceSettings {
        network_config: NetworkConfigSource::resolve(args.psiphon_config.clone())?,
        max_clients,
        bandwidth,
        stats_pattern: args.stats_file.clone(),
        verbosity: context.log_level,
    };

    let configs = InstanceConfig::build_all(&context.data_dir, args.instances, &settings);
    let orchestrator = Orchestrator::new(configs)?;
    Ok((orchestrator, settings))
}
