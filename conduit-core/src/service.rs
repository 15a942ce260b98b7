//! Relay instance service
//!
//! The per-instance unit started by the orchestrator. It prepares the
//! instance's private state (data directory, identity, network config),
//! publishes its limits as metrics, keeps its stats file current, and
//! returns once cancellation is requested.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::{Gauge, GaugeVec};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::InstanceError;
use crate::config::create_private_dir;
use crate::identity::InstanceIdentity;
use crate::instance::InstanceConfig;
use crate::metrics::MetricsRegistry;
use crate::orchestrator::InstanceService;
use crate::stats::{InstanceStats, write_stats_file};

/// Relay service shared by all instances of one run.
///
/// Holds no per-instance state; every call to `run` owns its own config.
pub struct RelayService {
    metrics: Arc<MetricsRegistry>,
    stats_interval: Duration,
    started_at: Instant,
}

impl RelayService {
    pub fn new(metrics: Arc<MetricsRegistry>, stats_interval: Duration) -> Self {
        Self {
            metrics,
            stats_interval,
            started_at: Instant::now(),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }
}

#[async_trait]
impl InstanceService for RelayService {
    async fn run(
        &self,
        config: InstanceConfig,
        cancel: CancellationToken,
    ) -> Result<(), InstanceError> {
        create_private_dir(&config.data_dir)
            .await
            .map_err(|source| InstanceError::DataDirectory {
                path: config.data_dir.clone(),
                source,
            })?;

        let identity = InstanceIdentity::load_or_create(&config.data_dir).await?;
        validate_network_config(&config).await?;

        let gauges = InstanceGauges::register(&self.metrics, self.started_at);
        gauges.publish_limits(&config);

        info!(
            "Instance ready (identity {}, max clients {}, bandwidth {})",
            identity.fingerprint(),
            config.max_clients,
            config.bandwidth
        );

        let instance_started = Instant::now();
        let mut ticker = tokio::time::interval(self.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    let uptime = instance_started.elapsed().as_secs();
                    if config.verbosity.is_verbose() {
                        debug!("Instance alive for {uptime}s");
                    }
                    if let Some(path) = &config.stats_file {
                        let stats = InstanceStats::for_instance(&config, true, uptime);
                        if let Err(e) = write_stats_file(path, &stats).await {
                            break Err(e);
                        }
                    }
                }
            }
        };

        gauges.retire(&config);

        if let Some(path) = &config.stats_file {
            let stats =
                InstanceStats::for_instance(&config, false, instance_started.elapsed().as_secs());
            write_stats_file(path, &stats).await?;
        }

        result
    }
}

/// Reads the network config and checks it is a JSON object.
async fn validate_network_config(config: &InstanceConfig) -> Result<(), InstanceError> {
    let text = config.network_config.load().await?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| InstanceError::NetworkConfig {
            reason: format!("{} is not valid JSON: {e}", config.network_config),
        })?;

    if !value.is_object() {
        return Err(InstanceError::NetworkConfig {
            reason: format!("{} must contain a JSON object", config.network_config),
        });
    }

    Ok(())
}

/// Metrics every instance registers; repeated registration is shared.
struct InstanceGauges {
    running: Gauge,
    max_clients: GaugeVec,
    connected_clients: GaugeVec,
    bandwidth_limit: GaugeVec,
}

impl InstanceGauges {
    fn register(metrics: &MetricsRegistry, process_started: Instant) -> Self {
        metrics.gauge_fn(
            "conduit_uptime_seconds",
            "Seconds since the relay service was created",
            move || process_started.elapsed().as_secs_f64(),
        );

        Self {
            running: metrics.gauge("conduit_instances_running", "Instances currently running"),
            max_clients: metrics.gauge_vec(
                "conduit_max_clients",
                "Maximum concurrent clients per instance",
                &["instance"],
            ),
            connected_clients: metrics.gauge_vec(
                "conduit_connected_clients",
                "Currently connected clients per instance",
                &["instance"],
            ),
            bandwidth_limit: metrics.gauge_vec(
                "conduit_bandwidth_limit_bytes",
                "Bandwidth limit per instance in bytes per second, 0 when unlimited",
                &["instance"],
            ),
        }
    }

    fn publish_limits(&self, config: &InstanceConfig) {
        let label = config.index().to_string();
        self.running.inc();
        self.max_clients
            .with_label_values(&[label.as_str()])
            .set(f64::from(config.max_clients.get()));
        self.connected_clients.with_label_values(&[label.as_str()]).set(0.0);
        self.bandwidth_limit
            .with_label_values(&[label.as_str()])
            .set(config.bandwidth.bytes_per_second().unwrap_or(0) as f64);
    }

    fn retire(&self, config: &InstanceConfig) {
        let label = config.index().to_string();
        self.running.dec();
        self.connected_clients.with_label_values(&[label.as_str()]).set(0.0);
    }
}
