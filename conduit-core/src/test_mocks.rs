//! Mock instance services for testing the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::InstanceError;
use crate::instance::InstanceConfig;
use crate::orchestrator::InstanceService;

/// Scripted behavior of one mock instance.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Run until cancelled, then take `shutdown_delay` to stop
    UntilCancelled { shutdown_delay: Duration },
    /// Return `Ok` after `after` without waiting for cancellation
    StopAfter { after: Duration },
    /// Return an error after `after`, unless cancelled first
    FailAfter { after: Duration, reason: String },
    /// Return an error once cancelled
    FailOnCancel { reason: String },
    /// Panic after `after`
    PanicAfter { after: Duration },
}

/// Instance service that follows a script per instance index.
///
/// Counts how many instances started, are currently running, and finished.
#[derive(Debug, Clone)]
pub struct MockInstanceService {
    default_behavior: MockBehavior,
    overrides: HashMap<usize, MockBehavior>,
    started: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl MockInstanceService {
    /// Creates a mock where every instance follows `behavior`.
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            default_behavior: behavior,
            overrides: HashMap::new(),
            started: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every instance runs until cancelled and stops immediately.
    pub fn until_cancelled() -> Self {
        Self::new(MockBehavior::UntilCancelled {
            shutdown_delay: Duration::ZERO,
        })
    }

    /// Every instance returns `Ok` right away.
    pub fn stopping_immediately() -> Self {
        Self::new(MockBehavior::StopAfter {
            after: Duration::ZERO,
        })
    }

    /// Overrides the behavior of instance `index`.
    pub fn with_behavior(mut self, index: usize, behavior: MockBehavior) -> Self {
        self.overrides.insert(index, behavior);
        self
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, index: usize) -> MockBehavior {
        self.overrides
            .get(&index)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone())
    }
}

/// Decrements `running` and counts the instance as finished on drop, so a
/// panicking instance is still accounted for.
struct RunningGuard {
    running: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InstanceService for MockInstanceService {
    async fn run(
        &self,
        config: InstanceConfig,
        cancel: CancellationToken,
    ) -> Result<(), InstanceError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.running.fetch_add(1, Ordering::SeqCst);
        let _guard = RunningGuard {
            running: Arc::clone(&self.running),
            finished: Arc::clone(&self.finished),
        };

        match self.behavior_for(config.index()) {
            MockBehavior::UntilCancelled { shutdown_delay } => {
                cancel.cancelled().await;
                tokio::time::sleep(shutdown_delay).await;
                Ok(())
            }
            MockBehavior::StopAfter { after } => {
                tokio::time::sleep(after).await;
                Ok(())
            }
            MockBehavior::FailAfter { after, reason } => {
                tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    _ = tokio::time::sleep(after) => Err(InstanceError::Fatal { reason }),
                }
            }
            MockBehavior::FailOnCancel { reason } => {
                cancel.cancelled().await;
                Err(InstanceError::Fatal { reason })
            }
            MockBehavior::PanicAfter { after } => {
                tokio::time::sleep(after).await;
                panic!("mock instance {} panicked", config.index());
            }
        }
    }
}
