//! Reconciler implementation.
//!
//! One call to [`Reconciler::reconcile`] runs one cycle for one key:
//! read, observe, diff, plan, execute, record. The loop guarantees no two
//! cycles for the same key overlap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::ReconcilerConfig;
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventSink, TracingSink};
use crate::executor::{ActionFailure, Executor, FailureKind};
use crate::queue::WorkQueue;
use crate::store::{InMemoryStateStore, StateStore, VersionToken};
use crate::types::{ErrorKind, Phase, ReconcileResult, ResourceKey, WorkItem};

/// How a cycle ended, before mapping onto a [`ReconcileResult`].
#[derive(Debug)]
enum CycleOutcome {
    /// Observed matches desired.
    Converged { generation: u64 },
    /// A tombstoned key finished tearing down and was removed.
    Removed,
    /// Every action succeeded but observed state has not caught up.
    Pending { unconfirmed: usize },
    /// An action stopped the cycle.
    ActionFailed(ActionFailure),
}

/// Status change to record after a cycle.
#[derive(Debug)]
enum StatusUpdate {
    Converged { generation: u64 },
    Progress,
    Failure {
        kind: ErrorKind,
        message: String,
        fatal: bool,
    },
}

/// Runs reconcile cycles against registered controllers.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    controllers: HashMap<String, Arc<dyn Controller>>,
    executor: Executor,
    queue: Arc<WorkQueue>,
    sink: Arc<dyn EventSink>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Start building a reconciler.
    #[must_use]
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    /// Run one cycle for `item.key`.
    ///
    /// Never returns an error: every failure is folded into the result and
    /// into the key's visible status.
    pub async fn reconcile(&self, item: &WorkItem) -> ReconcileResult {
        let key = &item.key;
        let started = Instant::now();
        let attempt_at = Utc::now();
        self.sink.emit(&EngineEvent::CycleStarted {
            key: key.clone(),
            reasons: item.reasons.clone(),
        });

        let (result, update) = match self.run_cycle(key).await {
            Ok(outcome) => self.classify_outcome(key, outcome),
            Err(error) => self.classify_error(key, &error),
        };

        if let Some(update) = update {
            self.record_status(key, update, attempt_at).await;
        }

        self.sink.emit(&EngineEvent::CycleFinished {
            key: key.clone(),
            result: result.clone(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });
        result
    }

    async fn run_cycle(&self, key: &ResourceKey) -> Result<CycleOutcome> {
        let controller = self.controller_for(key)?;

        let mut conflicts = 0u32;
        loop {
            match self.run_once(controller.as_ref(), key).await {
                Err(Error::Conflict {
                    expected, actual, ..
                }) if conflicts < self.config.conflict_retries => {
                    conflicts = conflicts.saturating_add(1);
                    debug!(
                        key = %key,
                        attempt = conflicts,
                        expected,
                        actual,
                        "Version conflict, recomputing with fresh reads"
                    );
                }
                other => return other,
            }
        }
    }

    async fn run_once(&self, controller: &dyn Controller, key: &ResourceKey) -> Result<CycleOutcome> {
        let snapshot = self.store.get(key).await?;
        let observed = controller.fetch_observed(key).await?;
        let token = self
            .store
            .compare_and_set_observed(key, observed.clone(), snapshot.token)
            .await?;

        let desired = snapshot.desired.as_ref();
        let delta = controller.diff(desired, observed.as_ref());
        if delta.is_empty() {
            return self
                .finish_converged(key, desired.map(|d| d.generation()), token)
                .await;
        }

        let actions = controller.plan(&delta);
        debug!(key = %key, delta = delta.len(), actions = actions.len(), "Planned actions");
        let report = self.executor.execute(controller, key, &actions).await;

        // Record whatever progress was made, even when an action failed.
        let refreshed = controller.fetch_observed(key).await?;
        let token = self
            .store
            .compare_and_set_observed(key, refreshed.clone(), token)
            .await?;

        if let Some(failure) = report.failure {
            return Ok(CycleOutcome::ActionFailed(failure));
        }

        if controller.diff(desired, refreshed.as_ref()).is_empty() {
            return self
                .finish_converged(key, desired.map(|d| d.generation()), token)
                .await;
        }

        let unconfirmed = report
            .applied
            .iter()
            .filter(|action| !action.is_satisfied_by(refreshed.as_ref()))
            .count();
        Ok(CycleOutcome::Pending { unconfirmed })
    }

    /// `token` is the one returned by the cycle's last write; a tombstone is
    /// only removed if nothing was written since, so a spec declared during
    /// teardown surfaces as a conflict and the cycle recomputes.
    async fn finish_converged(
        &self,
        key: &ResourceKey,
        generation: Option<u64>,
        token: VersionToken,
    ) -> Result<CycleOutcome> {
        match generation {
            Some(generation) => Ok(CycleOutcome::Converged { generation }),
            None => {
                match self.store.delete(key, token).await {
                    Ok(()) | Err(Error::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
                info!(key = %key, "Teardown complete, key removed");
                Ok(CycleOutcome::Removed)
            }
        }
    }

    fn classify_outcome(
        &self,
        key: &ResourceKey,
        outcome: CycleOutcome,
    ) -> (ReconcileResult, Option<StatusUpdate>) {
        match outcome {
            CycleOutcome::Converged { generation } => {
                self.queue.forget(key);
                (
                    ReconcileResult::Converged,
                    Some(StatusUpdate::Converged { generation }),
                )
            }
            CycleOutcome::Removed => {
                self.queue.forget(key);
                (ReconcileResult::Converged, None)
            }
            CycleOutcome::Pending { unconfirmed } => {
                debug!(key = %key, unconfirmed, "Actions applied, waiting for observed state");
                (
                    ReconcileResult::requeue(self.config.requeue_unconverged),
                    Some(StatusUpdate::Progress),
                )
            }
            CycleOutcome::ActionFailed(failure) => {
                let message = format!(
                    "{} failed after {} attempt(s): {}",
                    failure.action.description(),
                    failure.attempts,
                    failure.message
                );
                match failure.kind {
                    FailureKind::Retryable => self.backoff(key, ErrorKind::Retryable, message),
                    FailureKind::Fatal => Self::halt(message),
                }
            }
        }
    }

    fn classify_error(&self, key: &ResourceKey, error: &Error) -> (ReconcileResult, Option<StatusUpdate>) {
        match error.kind() {
            // The key vanished; there is no status left to update.
            Some(ErrorKind::NotFound) => (
                ReconcileResult::error(ErrorKind::NotFound, error.to_string()),
                None,
            ),
            // Conflicts left after the immediate recomputes back off as
            // ordinary transient failures.
            Some(ErrorKind::Conflict | ErrorKind::Retryable) => {
                self.backoff(key, ErrorKind::Retryable, error.to_string())
            }
            Some(ErrorKind::Fatal) | None => Self::halt(error.to_string()),
        }
    }

    fn backoff(
        &self,
        key: &ResourceKey,
        kind: ErrorKind,
        message: String,
    ) -> (ReconcileResult, Option<StatusUpdate>) {
        let delay = self.queue.rate_limited_delay(key);
        warn!(key = %key, kind = %kind, delay_ms = delay.as_millis(), error = %message, "Cycle failed, backing off");
        (
            ReconcileResult::requeue(delay),
            Some(StatusUpdate::Failure {
                kind,
                message,
                fatal: false,
            }),
        )
    }

    fn halt(message: String) -> (ReconcileResult, Option<StatusUpdate>) {
        (
            ReconcileResult::error(ErrorKind::Fatal, message.clone()),
            Some(StatusUpdate::Failure {
                kind: ErrorKind::Fatal,
                message,
                fatal: true,
            }),
        )
    }

    async fn record_status(&self, key: &ResourceKey, update: StatusUpdate, attempt_at: DateTime<Utc>) {
        let Ok(mut status) = self.store.status(key).await else {
            return;
        };
        status.last_attempt_at = Some(attempt_at);

        match update {
            StatusUpdate::Converged { generation } => {
                status.phase = Phase::Idle;
                status.observed_generation = Some(generation);
                status.last_error = None;
                status.last_error_kind = None;
                status.last_reconciled_at = Some(Utc::now());
                status.consecutive_failures = 0;
            }
            StatusUpdate::Progress => {
                status.phase = Phase::Idle;
            }
            StatusUpdate::Failure {
                kind,
                message,
                fatal,
            } => {
                status.phase = if fatal { Phase::Failed } else { Phase::Idle };
                status.last_error = Some(message);
                status.last_error_kind = Some(kind);
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            }
        }

        let event = EngineEvent::StatusChanged {
            key: key.clone(),
            phase: status.phase,
            last_error_kind: status.last_error_kind,
        };
        if let Err(e) = self.store.set_status(key, status).await {
            warn!(key = %key, error = %e, "Failed to record status");
            return;
        }
        self.sink.emit(&event);
    }

    fn controller_for(&self, key: &ResourceKey) -> Result<Arc<dyn Controller>> {
        self.controllers
            .get(key.kind())
            .cloned()
            .ok_or_else(|| Error::unknown_kind(key.kind()))
    }

    /// Whether a controller is registered for `kind`.
    #[must_use]
    pub fn handles(&self, kind: &str) -> bool {
        self.controllers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.controllers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Get the state store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Get the work queue.
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Get the event sink.
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Get the configuration.
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }
}

/// Builder for creating a reconciler.
pub struct ReconcilerBuilder {
    store: Option<Arc<dyn StateStore>>,
    controllers: Vec<Arc<dyn Controller>>,
    sink: Option<Arc<dyn EventSink>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            store: None,
            controllers: Vec::new(),
            sink: None,
            config: ReconcilerConfig::default(),
        }
    }

    /// Set the state store. Defaults to an in-memory store.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a controller for its kind.
    pub fn with_controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controllers.push(controller);
        self
    }

    /// Set the event sink. Defaults to [`TracingSink`].
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is invalid or
    /// two controllers claim the same kind.
    pub fn build(self) -> Result<Reconciler> {
        self.config.validate()?;

        let mut controllers = HashMap::with_capacity(self.controllers.len());
        for controller in self.controllers {
            let kind = controller.kind().to_string();
            if controllers.insert(kind.clone(), controller).is_some() {
                return Err(Error::invalid_config(format!(
                    "duplicate controller for kind '{kind}'"
                )));
            }
        }

        let store = self
            .store
            .unwrap_or_else(|| InMemoryStateStore::new_arc() as Arc<dyn StateStore>);
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let executor = Executor::new(self.config.action_retry.clone(), Arc::clone(&sink));
        let queue = Arc::new(WorkQueue::new(self.config.requeue_backoff.clone()));

        Ok(Reconciler {
            store,
            controllers,
            executor,
            queue,
            sink,
            config: self.config,
        })
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
