//! Reduction of per-instance terminations into one run result

use tracing::{debug, error, info, warn};

use super::RunSummary;
use crate::{ConduitError, InstanceError, Result};

/// How one instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InstanceOutcome {
    /// Returned after cancellation was requested
    Cancelled,
    /// Returned on its own without a cancellation request
    Stopped,
    /// Returned an error
    Failed { reason: String },
}

/// Raw result of one instance task.
pub(crate) struct Termination {
    pub(crate) index: usize,
    pub(crate) result: std::result::Result<(), InstanceError>,
    /// Whether cancellation had been requested when the instance returned
    pub(crate) cancel_requested: bool,
}

/// Collects terminations in the order instances finish.
///
/// An error counts as a failure only when the instance returned it before
/// cancellation was requested. The first such failure becomes the run
/// result; every later one is logged.
pub(crate) struct OutcomeAggregator {
    outcomes: Vec<(usize, InstanceOutcome)>,
    first_failure: Option<(usize, InstanceError)>,
}

impl OutcomeAggregator {
    pub(crate) fn new(expected: usize) -> Self {
        Self {
            outcomes: Vec::with_capacity(expected),
            first_failure: None,
        }
    }

    pub(crate) fn record(&mut self, termination: Termination) {
        let Termination {
            index,
            result,
            cancel_requested,
        } = termination;

        let outcome = match result {
            Ok(()) if cancel_requested => {
                info!(instance = index, "Instance stopped after shutdown request");
                InstanceOutcome::Cancelled
            }
            Ok(()) => {
                info!(instance = index, "Instance stopped");
                InstanceOutcome::Stopped
            }
            Err(e) if cancel_requested => {
                warn!(instance = index, "Instance reported an error during shutdown: {e}");
                InstanceOutcome::Failed {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                error!(instance = index, "Instance failed: {e}");
                let outcome = InstanceOutcome::Failed {
                    reason: e.to_string(),
                };
                if self.first_failure.is_none() {
                    self.first_failure = Some((index, e));
                }
                outcome
            }
        };

        self.outcomes.push((index, outcome));
    }

    /// Outcomes in termination order.
    pub(crate) fn outcomes(&self) -> &[(usize, InstanceOutcome)] {
        &self.outcomes
    }

    pub(crate) fn finish(self, cancel_requested: bool) -> Result<RunSummary> {
        let mut failed = 0;
        for (index, outcome) in self.outcomes() {
            if let InstanceOutcome::Failed { reason } = outcome {
                failed += 1;
                debug!(instance = index, "Recorded failure: {reason}");
            }
        }
        info!(
            "All {} instances terminated ({} with errors)",
            self.outcomes.len(),
            failed
        );

        if let Some((index, source)) = self.first_failure {
            return Err(ConduitError::InstanceRuntime { index, source });
        }

        if cancel_requested {
            Ok(RunSummary::CleanShutdown)
        } else {
            Ok(RunSummary::Completed)
        }
    }
}
