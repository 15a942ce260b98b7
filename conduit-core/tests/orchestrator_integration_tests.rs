//! Integration tests for multi-instance orchestration.
//!
//! These tests drive the public Orchestrator API with scripted mock services
//! and with the real relay service, covering outcome aggregation, shutdown
//! propagation and per-instance isolation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use conduit_core::stats::InstanceStats;
use conduit_core::test_mocks::{MockBehavior, MockInstanceService};
use conduit_core::tracing_setup::LogLevel;
use conduit_core::{
    BandwidthLimit, ConduitError, InstanceConfig, InstanceError, InstanceService, MaxClients,
    MetricsRegistry, NetworkConfigSource, Orchestrator, RelayService, RunSummary,
    SharedInstanceSettings, ShutdownBridge,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const RUN_TIMEOUT: Duration = Duration::from_secs(5);

/// Test fixture owning a temporary base directory and a shared cancel token.
struct OrchestratorTestFixture {
    _dir: TempDir,
    base: PathBuf,
    cancel: CancellationToken,
}

impl OrchestratorTestFixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data");
        Self {
            _dir: dir,
            base,
            cancel: CancellationToken::new(),
        }
    }

    fn settings(&self, network_config: NetworkConfigSource) -> SharedInstanceSettings {
        SharedInstanceSettings {
            network_config,
            max_clients: MaxClients::new(20).unwrap(),
            bandwidth: BandwidthLimit::from_mbps(16.0).unwrap(),
            stats_pattern: Some("stats.json".to_string()),
            verbosity: LogLevel::Info,
        }
    }

    fn configs(&self, count: usize) -> Vec<InstanceConfig> {
        InstanceConfig::build_all(
            &self.base,
            count,
            &self.settings(NetworkConfigSource::Embedded),
        )
    }

    /// Writes a network config file next to the base directory.
    fn network_config(&self, contents: &str) -> NetworkConfigSource {
        let path = self.base.with_file_name("network.json");
        std::fs::write(&path, contents).unwrap();
        NetworkConfigSource::File(path)
    }

    fn spawn_run<S: InstanceService>(
        &self,
        configs: Vec<InstanceConfig>,
        service: Arc<S>,
    ) -> JoinHandle<conduit_core::Result<RunSummary>> {
        let orchestrator = Orchestrator::new(configs).unwrap();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { orchestrator.run(service, cancel).await })
    }

    async fn wait_for(
        &self,
        handle: JoinHandle<conduit_core::Result<RunSummary>>,
    ) -> conduit_core::Result<RunSummary> {
        timeout(RUN_TIMEOUT, handle)
            .await
            .expect("orchestrator did not finish in time")
            .expect("orchestrator task panicked")
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    timeout(RUN_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn instance_dir(base: &Path, index: usize) -> PathBuf {
    base.join(format!("instance-{index}"))
}

#[test]
fn test_invalid_counts_are_rejected_before_touching_disk() {
    let fixture = OrchestratorTestFixture::new();

    for count in [0, 33] {
        let err = Orchestrator::new(fixture.configs(count)).unwrap_err();
        assert!(matches!(err, ConduitError::Configuration { .. }));
        assert!(err.user_message().contains("between 1 and 32"));
    }

    assert!(!fixture.base.exists());
}

#[tokio::test]
async fn test_all_instances_completing_reports_completed() {
    let fixture = OrchestratorTestFixture::new();
    let service = Arc::new(MockInstanceService::stopping_immediately());

    let handle = fixture.spawn_run(fixture.configs(5), Arc::clone(&service));
    let summary = fixture.wait_for(handle).await.unwrap();

    assert_eq!(summary, RunSummary::Completed);
    assert_eq!(service.finished(), 5);
}

#[tokio::test]
async fn test_cancel_yields_clean_shutdown() {
    let fixture = OrchestratorTestFixture::new();
    let service = Arc::new(MockInstanceService::until_cancelled());

    let handle = fixture.spawn_run(fixture.configs(4), Arc::clone(&service));
    wait_until(|| service.running() == 4).await;
    fixture.cancel.cancel();

    let summary = fixture.wait_for(handle).await.unwrap();
    assert_eq!(summary, RunSummary::CleanShutdown);
    assert_eq!(service.started(), 4);
    assert_eq!(service.running(), 0);
}

#[tokio::test]
async fn test_errors_after_cancel_are_part_of_shutdown() {
    let fixture = OrchestratorTestFixture::new();
    let service = Arc::new(MockInstanceService::new(MockBehavior::FailOnCancel {
        reason: "connection reset during shutdown".to_string(),
    }));

    let handle = fixture.spawn_run(fixture.configs(3), Arc::clone(&service));
    wait_until(|| service.running() == 3).await;
    fixture.cancel.cancel();

    let summary = fixture.wait_for(handle).await.unwrap();
    assert_eq!(summary, RunSummary::CleanShutdown);
}

#[tokio::test]
async fn test_failure_is_reported_and_does_not_stop_siblings() {
    let fixture = OrchestratorTestFixture::new();
    let service = Arc::new(MockInstanceService::until_cancelled().with_behavior(
        2,
        MockBehavior::FailAfter {
            after: Duration::from_millis(10),
            reason: "tunnel core exited".to_string(),
        },
    ));

    let handle = fixture.spawn_run(fixture.configs(4), Arc::clone(&service));
    wait_until(|| service.finished() == 1).await;

    // Siblings keep running until someone cancels them
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(service.running(), 3);
    assert!(!handle.is_finished());

    fixture.cancel.cancel();
    let err = fixture.wait_for(handle).await.unwrap_err();

    match err {
        ConduitError::InstanceRuntime { index, source } => {
            assert_eq!(index, 2);
            assert!(matches!(source, InstanceError::Fatal { .. }));
            assert!(source.to_string().contains("tunnel core exited"));
        }
        other => panic!("expected instance failure, got {other:?}"),
    }
    assert_eq!(service.finished(), 4);
}

#[tokio::test]
async fn test_first_failure_in_termination_order_wins() {
    let fixture = OrchestratorTestFixture::new();
    let service = Arc::new(
        MockInstanceService::stopping_immediately()
            .with_behavior(
                0,
                MockBehavior::FailAfter {
                    after: Duration::from_millis(80),
                    reason: "late".to_string(),
                },
            )
            .with_behavior(
                1,
                MockBehavior::FailAfter {
                    after: Duration::from_millis(5),
                    reason: "early".to_string(),
                },
            ),
    );

    let handle = fixture.spawn_run(fixture.configs(3), Arc::clone(&service));
    let err = fixture.wait_for(handle).await.unwrap_err();

    assert!(matches!(err, ConduitError::InstanceRuntime { index: 1, .. }));
    assert!(err.user_message().contains("early"));
}

#[tokio::test]
async fn test_run_returns_only_after_slow_instances_stop() {
    let fixture = OrchestratorTestFixture::new();
    let service = Arc::new(MockInstanceService::new(MockBehavior::UntilCancelled {
        shutdown_delay: Duration::from_millis(50),
    }));

    let handle = fixture.spawn_run(fixture.configs(6), Arc::clone(&service));
    wait_until(|| service.running() == 6).await;
    fixture.cancel.cancel();

    fixture.wait_for(handle).await.unwrap();
    assert_eq!(service.finished(), 6);
    assert_eq!(service.running(), 0);
}

#[tokio::test]
async fn test_panicking_instance_is_reported_as_failure() {
    let fixture = OrchestratorTestFixture::new();
    let service = Arc::new(
        MockInstanceService::new(MockBehavior::StopAfter {
            after: Duration::from_millis(30),
        })
        .with_behavior(
            0,
            MockBehavior::PanicAfter {
                after: Duration::from_millis(5),
            },
        ),
    );

    let handle = fixture.spawn_run(fixture.configs(3), Arc::clone(&service));
    let err = fixture.wait_for(handle).await.unwrap_err();

    match err {
        ConduitError::InstanceRuntime {
            index: 0,
            source: InstanceError::Panicked { reason },
        } => assert!(reason.contains("mock instance 0 panicked")),
        other => panic!("expected panic failure, got {other:?}"),
    }
    assert_eq!(service.finished(), 3);
}

#[tokio::test]
async fn test_instances_get_isolated_directories() {
    let fixture = OrchestratorTestFixture::new();
    let service = Arc::new(MockInstanceService::stopping_immediately());

    let handle = fixture.spawn_run(fixture.configs(32), Arc::clone(&service));
    fixture.wait_for(handle).await.unwrap();

    for index in 0..32 {
        assert!(instance_dir(&fixture.base, index).is_dir());
    }
    assert!(!instance_dir(&fixture.base, 32).exists());
}

#[tokio::test]
async fn test_relay_service_with_shutdown_bridge() {
    let fixture = OrchestratorTestFixture::new();
    std::fs::create_dir_all(&fixture.base).unwrap();
    let source = fixture.network_config("{\"SponsorId\":\"0000\"}");
    let configs = InstanceConfig::build_all(&fixture.base, 3, &fixture.settings(source));
    let stats_files: Vec<PathBuf> = configs
        .iter()
        .map(|config| config.stats_file.clone().unwrap())
        .collect();

    let metrics = Arc::new(MetricsRegistry::new());
    let service = Arc::new(RelayService::new(
        Arc::clone(&metrics),
        Duration::from_millis(10),
    ));

    let notices = Arc::new(AtomicUsize::new(0));
    let bridge = {
        let notices = Arc::clone(&notices);
        ShutdownBridge::with_notice(fixture.cancel.clone(), move || {
            notices.fetch_add(1, Ordering::SeqCst);
        })
    };

    let handle = fixture.spawn_run(configs, service);
    wait_until(|| stats_files.iter().all(|path| path.exists())).await;

    assert!(bridge.trigger());
    assert!(!bridge.trigger());
    let summary = fixture.wait_for(handle).await.unwrap();

    assert_eq!(summary, RunSummary::CleanShutdown);
    assert_eq!(notices.load(Ordering::SeqCst), 1);

    let mut keys = Vec::new();
    for (index, path) in stats_files.iter().enumerate() {
        let stats: InstanceStats =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(stats.instance, index);
        assert!(!stats.is_live);
        assert_eq!(stats.max_clients, 20);
        assert_eq!(stats.bandwidth_limit_bytes_per_second, Some(2_000_000));

        let key = std::fs::read_to_string(instance_dir(&fixture.base, index).join("identity.key"))
            .unwrap();
        keys.push(key);
    }
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 3);

    // Every instance registered the same five metric names
    assert_eq!(metrics.len(), 5);
    let text = metrics.gather_text().unwrap();
    assert!(text.contains("conduit_instances_running 0"));
    assert!(text.contains("conduit_max_clients{instance=\"2\"} 20"));
}

#[tokio::test]
async fn test_relay_service_missing_network_config_fails_without_cancel() {
    let fixture = OrchestratorTestFixture::new();
    let source = NetworkConfigSource::File(fixture.base.with_file_name("missing.json"));
    let configs = InstanceConfig::build_all(&fixture.base, 2, &fixture.settings(source));
    let service = Arc::new(RelayService::new(
        Arc::new(MetricsRegistry::new()),
        Duration::from_secs(60),
    ));

    let handle = fixture.spawn_run(configs, service);
    let err = fixture.wait_for(handle).await.unwrap_err();

    match err {
        ConduitError::InstanceRuntime { source, .. } => {
            assert!(matches!(source, InstanceError::NetworkConfig { .. }));
        }
        other => panic!("expected network config failure, got {other:?}"),
    }
}
