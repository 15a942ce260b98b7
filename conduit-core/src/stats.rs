//! Per-instance stats file
//!
//! Instances with a stats file periodically replace it with a JSON snapshot
//! of their state, for external monitoring.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::InstanceError;
use crate::instance::InstanceConfig;

/// Snapshot written to an instance's stats file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStats {
    pub instance: usize,
    pub is_live: bool,
    pub connecting_clients: u32,
    pub connected_clients: u32,
    pub max_clients: u32,
    /// `None` when bandwidth is unlimited
    pub bandwidth_limit_bytes_per_second: Option<u64>,
    pub total_bytes_up: u64,
    pub total_bytes_down: u64,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

impl InstanceStats {
    /// Idle snapshot for `config`.
    pub fn for_instance(config: &InstanceConfig, is_live: bool, uptime_seconds: u64) -> Self {
        Self {
            instance: config.index(),
            is_live,
            connecting_clients: 0,
            connected_clients: 0,
            max_clients: config.max_clients.get(),
            bandwidth_limit_bytes_per_second: config.bandwidth.bytes_per_second(),
            total_bytes_up: 0,
            total_bytes_down: 0,
            uptime_seconds,
            timestamp: Utc::now(),
        }
    }
}

/// Replaces the stats file at `path` with `stats`.
///
/// Writes to a sibling temporary file first so readers never observe a
/// partially written snapshot.
///
/// # Errors
///
/// - `InstanceError::Serialization` - If the snapshot cannot be encoded
/// - `InstanceError::Stats` - If the file cannot be written or renamed
pub async fn write_stats_file(path: &Path, stats: &InstanceStats) -> Result<(), InstanceError> {
    let json = serde_json::to_vec_pretty(stats)?;
    let temp_path = temp_path_for(path);

    let stats_error = |source| InstanceError::Stats {
        path: path.to_path_buf(),
        source,
    };

    tokio::fs::write(&temp_path, &json).await.map_err(stats_error)?;
    tokio::fs::rename(&temp_path, path).await.map_err(stats_error)?;

    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stats".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}
