//! Multi-instance orchestration
//!
//! Starts one relay service per instance configuration, waits for all of
//! them, and reduces their outcomes into a single result that tells an
//! operator-requested shutdown apart from an instance failure.

mod aggregator;

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

use aggregator::{OutcomeAggregator, Termination};

use crate::config::create_private_dir;
use crate::instance::InstanceConfig;
use crate::{ConduitError, InstanceError, Result};

/// Fewest instances an orchestrator accepts
pub const MIN_INSTANCES: usize = 1;
/// Most instances an orchestrator accepts
pub const MAX_INSTANCES: usize = 32;

/// A single relay instance that runs until cancelled or until a fatal error.
///
/// Implementations must return promptly once `cancel` fires and must not
/// share mutable state with other instances.
#[async_trait]
pub trait InstanceService: Send + Sync + 'static {
    /// Runs one instance with exclusive ownership of `config`.
    async fn run(
        &self,
        config: InstanceConfig,
        cancel: CancellationToken,
    ) -> std::result::Result<(), InstanceError>;
}

/// Lifecycle of one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Created,
    Running,
    CleanShutdown,
    Completed,
    Failed,
}

impl OrchestratorState {
    /// Terminal state reached by a finished run.
    pub fn from_result(result: &Result<RunSummary>) -> Self {
        match result {
            Ok(summary) => summary.state(),
            Err(_) => OrchestratorState::Failed,
        }
    }
}

/// Successful outcome of a run. Failures are reported as
/// `ConduitError::InstanceRuntime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSummary {
    /// Shutdown was requested and no instance failed before it
    CleanShutdown,
    /// Every instance stopped on its own without a shutdown request
    Completed,
}

impl RunSummary {
    pub fn state(self) -> OrchestratorState {
        match self {
            RunSummary::CleanShutdown => OrchestratorState::CleanShutdown,
            RunSummary::Completed => OrchestratorState::Completed,
        }
    }
}

/// Owns a fixed set of instance configurations for one run.
///
/// `run` consumes the orchestrator, so a second run is impossible.
#[derive(Debug)]
pub struct Orchestrator {
    configs: Vec<InstanceConfig>,
}

impl Orchestrator {
    /// Validates the instance set.
    ///
    /// # Errors
    ///
    /// - `ConduitError::Configuration` - If the count is outside `1..=32`, or two
    ///   configs share an index, data directory or stats file
    pub fn new(configs: Vec<InstanceConfig>) -> Result<Self> {
        if !(MIN_INSTANCES..=MAX_INSTANCES).contains(&configs.len()) {
            return Err(ConduitError::configuration(format!(
                "instances must be between {MIN_INSTANCES} and {MAX_INSTANCES}"
            )));
        }

        let mut indices = HashSet::new();
        let mut data_dirs = HashSet::new();
        let mut stats_files = HashSet::new();
        for config in &configs {
            if !indices.insert(config.index()) {
                return Err(ConduitError::configuration(format!(
                    "duplicate instance index {}",
                    config.index()
                )));
            }
            if !data_dirs.insert(&config.data_dir) {
                return Err(ConduitError::configuration(format!(
                    "instance {} shares data directory {}",
                    config.index(),
                    config.data_dir.display()
                )));
            }
            if let Some(stats_file) = &config.stats_file {
                if !stats_files.insert(stats_file) {
                    return Err(ConduitError::configuration(format!(
                        "instance {} shares stats file {}",
                        config.index(),
                        stats_file.display()
                    )));
                }
            }
        }

        Ok(Self { configs })
    }

    pub fn instance_count(&self) -> usize {
        self.configs.len()
    }

    pub fn configs(&self) -> &[InstanceConfig] {
        &self.configs
    }

    /// State of an orchestrator that has not run yet. A run consumes the
    /// orchestrator and reports its terminal state through its result.
    pub fn state(&self) -> OrchestratorState {
        OrchestratorState::Created
    }

    /// Runs every instance concurrently and waits for all of them.
    ///
    /// Each instance receives a child of `cancel`, so cancelling the parent
    /// reaches every instance while no instance can stop its siblings.
    ///
    /// # Errors
    ///
    /// - `ConduitError::Configuration` - If a data directory cannot be created;
    ///   no instance has been started in that case
    /// - `ConduitError::InstanceRuntime` - First instance, in termination order,
    ///   that failed before cancellation was requested
    pub async fn run<S: InstanceService>(
        self,
        service: Arc<S>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        self.prepare_data_dirs().await?;

        let count = self.configs.len();
        debug!(
            "Orchestrator state: {:?} -> {:?}",
            self.state(),
            OrchestratorState::Running
        );
        info!("Starting {count} instances");

        let mut running: FuturesUnordered<_> = self
            .configs
            .into_iter()
            .map(|config| {
                let index = config.index();
                let handle = tokio::spawn(
                    run_instance(Arc::clone(&service), config, cancel.clone())
                        .instrument(info_span!("instance", index)),
                );
                async move { (index, handle.await) }
            })
            .collect();

        let mut aggregator = OutcomeAggregator::new(count);
        while let Some((index, joined)) = running.next().await {
            let termination = match joined {
                Ok(termination) => termination,
                // Panics are caught inside the task; only an aborted task
                // reaches this arm.
                Err(join_error) => Termination {
                    index,
                    result: Err(InstanceError::Panicked {
                        reason: join_error.to_string(),
                    }),
                    cancel_requested: cancel.is_cancelled(),
                },
            };
            aggregator.record(termination);
        }

        let result = aggregator.finish(cancel.is_cancelled());
        debug!(
            "Orchestrator state: {:?} -> {:?}",
            OrchestratorState::Running,
            OrchestratorState::from_result(&result)
        );
        result
    }

    /// Creates every data directory before any instance starts.
    async fn prepare_data_dirs(&self) -> Result<()> {
        let mut pending: FuturesUnordered<_> = self
            .configs
            .iter()
            .map(|config| async move {
                create_private_dir(&config.data_dir)
                    .await
                    .map_err(|e| (config.index(), e))
            })
            .collect();

        while let Some(created) = pending.next().await {
            if let Err((index, e)) = created {
                return Err(ConduitError::configuration(format!(
                    "failed to create config for instance {index}: data directory: {e}"
                )));
            }
        }

        Ok(())
    }
}

async fn run_instance<S: InstanceService>(
    service: Arc<S>,
    config: InstanceConfig,
    cancel: CancellationToken,
) -> Termination {
    let index = config.index();
    debug!("Instance starting with data dir {}", config.data_dir.display());

    let result = match AssertUnwindSafe(service.run(config, cancel.child_token()))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => Err(InstanceError::Panicked {
            reason: panic_reason(payload.as_ref()),
        }),
    };

    // Sampled as soon as the instance returns or panics; this decides
    // whether an error counts as a failure or as part of the shutdown.
    let cancel_requested = cancel.is_cancelled();

    Termination {
        index,
        result,
        cancel_requested,
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
