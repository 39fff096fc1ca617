//! Applies planned actions with retry and backoff.
//!
//! The executor never touches the state store. It reports what was applied
//! and, if the cycle stopped early, which action stopped it and why.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::controller::Controller;
use crate::events::{EngineEvent, EventSink};
use crate::retry::RetryPolicy;
use crate::types::{Action, Outcome, ResourceKey};

/// Why an action did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retries exhausted; the key should be requeued with backoff.
    Retryable,
    /// Permanent; the key stays failed until something external changes.
    Fatal,
}

/// The action that stopped a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionFailure {
    pub action: Action,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

/// What happened to a planned action list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    /// Actions that succeeded, in the order applied. They stay applied even
    /// when a later action fails.
    pub applied: Vec<Action>,
    pub failure: Option<ActionFailure>,
}

impl ExecutionReport {
    /// Whether every planned action succeeded.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Retrying action executor.
pub struct Executor {
    policy: RetryPolicy,
    sink: Arc<dyn EventSink>,
}

impl Executor {
    /// Create an executor with the given per-action retry policy.
    pub fn new(policy: RetryPolicy, sink: Arc<dyn EventSink>) -> Self {
        Self { policy, sink }
    }

    /// The per-action retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Apply one action, retrying retryable outcomes with backoff.
    ///
    /// Returns the final outcome and the number of attempts made. A
    /// `Retryable` outcome here means the attempt cap was hit.
    pub async fn apply(
        &self,
        controller: &dyn Controller,
        key: &ResourceKey,
        action: &Action,
    ) -> (Outcome, u32) {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            match controller.apply(key, action).await {
                Outcome::Retryable(reason) if self.policy.allows_retry(attempt) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        key = %key,
                        action = %action.description(),
                        attempt,
                        delay_ms = delay.as_millis(),
                        reason = %reason,
                        "Retrying action"
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => return (outcome, attempt),
            }
        }
    }

    /// Apply `actions` in order, sequentially, stopping at the first action
    /// that does not succeed.
    pub async fn execute(
        &self,
        controller: &dyn Controller,
        key: &ResourceKey,
        actions: &[Action],
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();

        for action in actions {
            debug!(key = %key, action = %action.description(), "Applying action");

            let (outcome, attempts) = self.apply(controller, key, action).await;
            self.sink.emit(&EngineEvent::ActionApplied {
                key: key.clone(),
                child: action.child.clone(),
                op: action.op.tag().to_string(),
                outcome: outcome.clone(),
                attempts,
            });

            let (kind, message) = match outcome {
                Outcome::Success => {
                    report.applied.push(action.clone());
                    continue;
                }
                Outcome::Retryable(message) => (FailureKind::Retryable, message),
                Outcome::Fatal(message) => (FailureKind::Fatal, message),
            };

            report.failure = Some(ActionFailure {
                action: action.clone(),
                kind,
                message,
                attempts,
            });
            break;
        }

        report
    }
}
