//! Conduit Core - Multi-instance orchestration for relay services
//!
//! This crate derives isolated per-instance configurations from a shared
//! template, runs one relay service per configuration concurrently, bridges
//! process signals into a single cancellation token, and reduces the
//! per-instance outcomes into one result.

pub mod config;
pub mod identity;
pub mod instance;
pub mod metrics;
pub mod orchestrator;
pub mod service;
pub mod shutdown;
pub mod stats;
pub mod test_mocks;
pub mod tracing_setup;

use std::path::PathBuf;

// Re-export main types for convenient access
pub use config::{BandwidthLimit, ConduitConfig, MaxClients, NetworkConfigSource};
pub use instance::{InstanceConfig, SharedInstanceSettings};
pub use metrics::MetricsRegistry;
pub use orchestrator::{
    InstanceService, MAX_INSTANCES, MIN_INSTANCES, Orchestrator, OrchestratorState, RunSummary,
};
pub use service::RelayService;
pub use shutdown::ShutdownBridge;

/// Errors reported by the orchestrator and its configuration layer.
///
/// Configuration errors are raised before any instance starts. Runtime
/// errors carry the index of the instance that failed.
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Instance {index} failed: {source}")]
    InstanceRuntime {
        index: usize,
        #[source]
        source: InstanceError,
    },
}

impl ConduitError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            ConduitError::Configuration { reason } => reason.clone(),
            ConduitError::InstanceRuntime { index, source } => {
                format!("multi-instance service error: instance {index}: {source}")
            }
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(self, ConduitError::Configuration { .. })
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        ConduitError::Configuration {
            reason: reason.into(),
        }
    }
}

/// Errors a single instance can terminate with.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("Failed to prepare data directory {path}: {source}")]
    DataDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Identity key error: {reason}")]
    Identity { reason: String },

    #[error("Network config error: {reason}")]
    NetworkConfig { reason: String },

    #[error("Failed to write stats file {path}: {source}")]
    Stats {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Instance task panicked: {reason}")]
    Panicked { reason: String },

    #[error("Fatal instance error: {reason}")]
    Fatal { reason: String },
}

pub type Result<T> = std::result::Result<T, ConduitError>;
