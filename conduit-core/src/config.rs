//! Centralized configuration for Conduit.
//!
//! Default limits, directory locations and the validated value types that
//! every instance configuration is assembled from.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ConduitError, InstanceError, Result};

/// Default per-instance client bound
pub const DEFAULT_MAX_CLIENTS: u32 = 50;
/// Upper bound accepted for the per-instance client limit
pub const MAX_CLIENTS_LIMIT: u32 = 1000;
/// Default per-instance bandwidth in Mbps
pub const DEFAULT_BANDWIDTH_MBPS: f64 = 40.0;
/// Sentinel Mbps value selecting unlimited bandwidth
pub const UNLIMITED_BANDWIDTH_MBPS: f64 = -1.0;

/// Network config compiled into the binary, if any.
const EMBEDDED_NETWORK_CONFIG: Option<&str> = option_env!("CONDUIT_EMBEDDED_NETWORK_CONFIG");

/// Central configuration for the Conduit CLI and its instances.
///
/// Groups related settings into sections. Supports environment variable
/// overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct ConduitConfig {
    pub paths: PathsConfig,
    pub limits: LimitsConfig,
    pub stats: StatsConfig,
}

/// Filesystem locations.
#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Base directory holding one subdirectory per instance
    pub data_dir: PathBuf,
    /// Directory receiving the full debug log of the last run
    pub logs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

/// Per-instance resource limits.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_clients: MaxClients,
    pub bandwidth: BandwidthLimit,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: MaxClients(DEFAULT_MAX_CLIENTS),
            bandwidth: BandwidthLimit::Limited {
                bytes_per_second: mbps_to_bytes_per_second(DEFAULT_BANDWIDTH_MBPS),
            },
        }
    }
}

/// Stats file settings.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// How often each instance rewrites its stats file
    pub write_interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            write_interval: Duration::from_secs(10),
        }
    }
}

impl ConduitConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Invalid override values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("CONDUIT_DATA_DIR") {
            if !dir.is_empty() {
                config.paths.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(value) = std::env::var("CONDUIT_MAX_CLIENTS") {
            if let Some(max_clients) = value.parse().ok().and_then(|v| MaxClients::new(v).ok()) {
                config.limits.max_clients = max_clients;
            }
        }

        if let Ok(value) = std::env::var("CONDUIT_BANDWIDTH_MBPS") {
            if let Some(bandwidth) = value
                .parse()
                .ok()
                .and_then(|v| BandwidthLimit::from_mbps(v).ok())
            {
                config.limits.bandwidth = bandwidth;
            }
        }

        if let Ok(value) = std::env::var("CONDUIT_STATS_INTERVAL_SECS") {
            if let Ok(seconds) = value.parse::<u64>() {
                if seconds > 0 {
                    config.stats.write_interval = Duration::from_secs(seconds);
                }
            }
        }

        config
    }
}

/// Positive bound on concurrent clients for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxClients(u32);

impl MaxClients {
    /// Validates a client limit in `1..=1000`.
    ///
    /// # Errors
    ///
    /// - `ConduitError::Configuration` - If the value is outside the accepted range
    pub fn new(value: u32) -> Result<Self> {
        if value == 0 || value > MAX_CLIENTS_LIMIT {
            return Err(ConduitError::configuration(format!(
                "max-clients must be between 1 and {MAX_CLIENTS_LIMIT}"
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MaxClients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bandwidth ceiling for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthLimit {
    Unlimited,
    Limited { bytes_per_second: u64 },
}

impl BandwidthLimit {
    /// Converts a Mbps value into a limit. `-1` selects unlimited.
    ///
    /// # Errors
    ///
    /// - `ConduitError::Configuration` - If the value is neither `-1` nor positive
    pub fn from_mbps(mbps: f64) -> Result<Self> {
        if mbps == UNLIMITED_BANDWIDTH_MBPS {
            return Ok(BandwidthLimit::Unlimited);
        }
        if !mbps.is_finite() || mbps <= 0.0 {
            return Err(ConduitError::configuration(
                "bandwidth must be a positive number of Mbps, or -1 for unlimited",
            ));
        }
        let bytes_per_second = mbps_to_bytes_per_second(mbps);
        if bytes_per_second == 0 {
            return Err(ConduitError::configuration(
                "bandwidth is too small to be represented",
            ));
        }
        Ok(BandwidthLimit::Limited { bytes_per_second })
    }

    pub fn is_unlimited(self) -> bool {
        matches!(self, BandwidthLimit::Unlimited)
    }

    /// Bytes per second, or `None` when unlimited.
    pub fn bytes_per_second(self) -> Option<u64> {
        match self {
            BandwidthLimit::Unlimited => None,
            BandwidthLimit::Limited { bytes_per_second } => Some(bytes_per_second),
        }
    }
}

impl fmt::Display for BandwidthLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandwidthLimit::Unlimited => write!(f, "unlimited"),
            BandwidthLimit::Limited { bytes_per_second } => {
                write!(f, "{:.0} Mbps", *bytes_per_second as f64 * 8.0 / 1_000_000.0)
            }
        }
    }
}

fn mbps_to_bytes_per_second(mbps: f64) -> u64 {
    (mbps * 1_000_000.0 / 8.0) as u64
}

/// Where an instance reads its network config from.
///
/// Resolved once by the caller and copied into every instance unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkConfigSource {
    /// Shared read-only file on disk
    File(PathBuf),
    /// Config compiled into the binary
    Embedded,
}

impl NetworkConfigSource {
    /// Picks the network config source from an optional user-supplied path.
    ///
    /// # Errors
    ///
    /// - `ConduitError::Configuration` - If the path does not exist, or no path
    ///   was given and no config is embedded
    pub fn resolve(path: Option<PathBuf>) -> Result<Self> {
        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConduitError::configuration(format!(
                        "psiphon config file not found: {}",
                        path.display()
                    )));
                }
                Ok(NetworkConfigSource::File(path))
            }
            None if has_embedded_network_config() => Ok(NetworkConfigSource::Embedded),
            None => Err(ConduitError::configuration(
                "psiphon config required: use --psiphon-config flag or build with embedded config",
            )),
        }
    }

    /// Reads the raw config text.
    ///
    /// # Errors
    ///
    /// - `InstanceError::NetworkConfig` - If the file cannot be read or nothing is embedded
    pub async fn load(&self) -> std::result::Result<String, InstanceError> {
        match self {
            NetworkConfigSource::File(path) => {
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| InstanceError::NetworkConfig {
                        reason: format!("failed to read {}: {e}", path.display()),
                    })
            }
            NetworkConfigSource::Embedded => EMBEDDED_NETWORK_CONFIG
                .map(str::to_string)
                .ok_or_else(|| InstanceError::NetworkConfig {
                    reason: "no network config embedded in this build".to_string(),
                }),
        }
    }
}

impl fmt::Display for NetworkConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkConfigSource::File(path) => write!(f, "{}", path.display()),
            NetworkConfigSource::Embedded => write!(f, "<embedded>"),
        }
    }
}

/// Whether this build carries an embedded network config.
pub fn has_embedded_network_config() -> bool {
    EMBEDDED_NETWORK_CONFIG.is_some_and(|config| !config.is_empty())
}

/// Creates `path` and any missing parents with owner-only permissions.
///
/// # Errors
///
/// - `std::io::Error` - If a directory component cannot be created
pub async fn create_private_dir(path: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(path).await
}

/// Creates the base data directory shared by all instances.
///
/// # Errors
///
/// - `ConduitError::Configuration` - If the directory cannot be created
pub async fn prepare_base_dir(path: &Path) -> Result<()> {
    create_private_dir(path).await.map_err(|e| {
        ConduitError::configuration(format!("failed to create base data directory: {e}"))
    })
}
