//! Process signal to cancellation bridge
//!
//! Turns SIGINT/SIGTERM into a single cancellation of the token shared by
//! all instances. Shutdown is cooperative: instances observe the token and
//! release their own resources.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Notice = Box<dyn Fn() + Send + Sync>;

/// Delivers the first termination request to the shared token, exactly once.
pub struct ShutdownBridge {
    cancel: CancellationToken,
    triggered: AtomicBool,
    notice: Notice,
}

impl ShutdownBridge {
    /// Creates a bridge that prints the standard shutdown notice.
    pub fn new(cancel: CancellationToken) -> Arc<Self> {
        Self::with_notice(cancel, || println!("\nShutting down all instances..."))
    }

    /// Creates a bridge with a custom shutdown notice.
    pub fn with_notice(
        cancel: CancellationToken,
        notice: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            cancel,
            triggered: AtomicBool::new(false),
            notice: Box::new(notice),
        })
    }

    /// Requests shutdown of every instance.
    ///
    /// Returns `true` for the call that triggered cancellation and `false`
    /// for every later call, which has no effect.
    pub fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already in progress, ignoring repeated request");
            return false;
        }

        (self.notice)();
        info!("Shutdown requested, cancelling all instances");
        self.cancel.cancel();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribes to interrupt and terminate signals.
    ///
    /// The returned task ends once the token is cancelled, whether by a
    /// signal or by any other holder of the token.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - If the terminate signal handler cannot be registered
    pub fn listen(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let mut terminate = TerminateSignal::register()?;
        let bridge = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = bridge.cancel.cancelled() => break,
                    received = tokio::signal::ctrl_c() => {
                        if let Err(e) = received {
                            warn!("Failed to listen for interrupt signal: {e}");
                            bridge.cancel.cancelled().await;
                            break;
                        }
                        debug!("Received interrupt signal");
                        bridge.trigger();
                    }
                    _ = terminate.recv() => {
                        debug!("Received terminate signal");
                        bridge.trigger();
                    }
                }
            }
        }))
    }
}

#[cfg(unix)]
struct TerminateSignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl TerminateSignal {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self(signal(SignalKind::terminate())?))
    }

    async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct TerminateSignal;

#[cfg(not(unix))]
impl TerminateSignal {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}
