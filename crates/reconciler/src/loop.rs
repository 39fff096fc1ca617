//! Continuous reconciliation loop.
//!
//! Owns the worker pool and the periodic resync, and is the API boundary
//! for declaring, deleting and inspecting resources. Specs are validated
//! here; nothing malformed reaches the core.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::reconciler::Reconciler;
use crate::store::VersionToken;
use crate::types::{
    ChangeHint, DesiredSpec, ErrorKind, Phase, Reason, ReconcileResult, ResourceKey,
    ResourceStatus, WorkItem,
};

/// Point-in-time counters for the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopMetrics {
    /// Keys waiting in the queue, ready or delayed.
    pub queue_depth: usize,
    /// Keys currently being reconciled.
    pub in_flight: usize,
    pub cycles: u64,
    pub converged: u64,
    pub requeued: u64,
    pub failed: u64,
}

/// What shutdown left behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers still mid-cycle when the grace period ran out. They are
    /// detached, not cancelled: each finishes its current cycle and exits.
    pub abandoned_workers: usize,
    /// Queued items that were never started.
    pub pending_items: usize,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    converged: AtomicU64,
    requeued: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, result: &ReconcileResult) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            ReconcileResult::Converged => &self.converged,
            ReconcileResult::Requeue { .. } => &self.requeued,
            ReconcileResult::Error { .. } => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Continuous reconciliation loop.
///
/// Runs `workers` tasks pulling from the reconciler's work queue, plus a
/// ticker that re-enqueues every non-failed key each resync interval.
pub struct ReconciliationLoop {
    /// The reconciler.
    reconciler: Arc<Reconciler>,
    counters: Counters,
    /// Stop signal receiver.
    stop_rx: watch::Receiver<bool>,
    /// Stop signal sender (for external control).
    stop_tx: watch::Sender<bool>,
}

impl ReconciliationLoop {
    /// Create a new reconciliation loop.
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            reconciler,
            counters: Counters::default(),
            stop_rx,
            stop_tx,
        }
    }

    /// Create a new loop wrapped in an Arc.
    pub fn new_arc(reconciler: Arc<Reconciler>) -> Arc<Self> {
        Arc::new(Self::new(reconciler))
    }

    /// Get the reconciler.
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Declare (or replace) the desired spec for `key` and enqueue it.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSpec`] if the spec is malformed.
    /// - [`Error::UnknownKind`] if no controller handles the key's kind.
    /// - [`Error::ShuttingDown`] once the loop has stopped.
    pub async fn declare(&self, key: &ResourceKey, spec: DesiredSpec) -> Result<VersionToken> {
        self.ensure_running()?;
        spec.validate()
            .map_err(|violation| Error::invalid_spec(key, violation.to_string()))?;
        if !self.reconciler.handles(key.kind()) {
            return Err(Error::unknown_kind(key.kind()));
        }

        let generation = spec.generation();
        let token = self.reconciler.store().set_desired(key, spec).await?;
        self.enqueue_reason(key, Reason::WatchEvent)?;
        info!(key = %key, generation, "Declared desired spec");
        Ok(token)
    }

    /// Request deletion: children are torn down, then the key is removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown key.
    pub async fn delete(&self, key: &ResourceKey) -> Result<()> {
        self.ensure_running()?;
        self.reconciler.store().mark_deleted(key).await?;
        self.enqueue_reason(key, Reason::WatchEvent)?;
        info!(key = %key, "Deletion requested");
        Ok(())
    }

    /// Manually trigger a cycle, e.g. to retry a failed key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown key.
    pub async fn enqueue(&self, key: &ResourceKey) -> Result<()> {
        self.reconciler.store().get(key).await?;
        self.enqueue_reason(key, Reason::Manual)
    }

    /// Feed an external change notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown key.
    pub async fn notify(&self, key: &ResourceKey, hint: ChangeHint) -> Result<()> {
        debug!(key = %key, hint = ?hint, "Change notification");
        match hint {
            ChangeHint::Deleted => self.delete(key).await,
            ChangeHint::SpecChanged | ChangeHint::ObservedChanged => {
                self.reconciler.store().get(key).await?;
                self.enqueue_reason(key, Reason::WatchEvent)
            }
        }
    }

    /// Consume a stream of change notifications until it ends or the loop
    /// stops.
    pub fn watch<S>(self: &Arc<Self>, stream: S) -> JoinHandle<()>
    where
        S: Stream<Item = (ResourceKey, ChangeHint)> + Send + 'static,
    {
        let this = Arc::clone(self);
        let mut stop_rx = self.stop_rx.clone();
        tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            loop {
                tokio::select! {
                    event = stream.next() => {
                        let Some((key, hint)) = event else {
                            debug!("Watch stream ended");
                            break;
                        };
                        if let Err(e) = this.notify(&key, hint).await {
                            warn!(key = %key, error = %e, "Dropping change notification");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        })
    }

    /// Enqueue every known key that is not failed.
    ///
    /// Returns the number of keys enqueued.
    pub async fn resync_all(&self) -> usize {
        let store = self.reconciler.store();
        let mut enqueued = 0usize;
        for key in store.keys().await {
            match store.status(&key).await {
                Ok(status) if status.is_failed() => {}
                Ok(_) => {
                    if self.reconciler.queue().add(key, Reason::PeriodicResync) {
                        enqueued = enqueued.saturating_add(1);
                    }
                }
                // Removed since listing.
                Err(_) => {}
            }
        }
        enqueued
    }

    /// Visible status of `key`, with the live scheduling phase.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown key.
    pub async fn status(&self, key: &ResourceKey) -> Result<ResourceStatus> {
        let mut status = self.reconciler.store().status(key).await?;
        let queue = self.reconciler.queue();
        if queue.is_processing(key) {
            status.phase = Phase::Running;
        } else if queue.is_pending(key) {
            status.phase = Phase::Queued;
        }
        Ok(status)
    }

    /// Status of every known key, in key order.
    pub async fn statuses(&self) -> Vec<(ResourceKey, ResourceStatus)> {
        let mut statuses = Vec::new();
        for key in self.reconciler.store().keys().await {
            if let Ok(status) = self.status(&key).await {
                statuses.push((key, status));
            }
        }
        statuses
    }

    /// Current counters.
    pub fn metrics(&self) -> LoopMetrics {
        let queue = self.reconciler.queue();
        LoopMetrics {
            queue_depth: queue.len(),
            in_flight: queue.in_flight(),
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            converged: self.counters.converged.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Whether nothing is queued or running.
    pub fn is_idle(&self) -> bool {
        let queue = self.reconciler.queue();
        queue.is_empty() && queue.in_flight() == 0
    }

    /// Run the loop until stopped.
    ///
    /// On stop, no new work is accepted and in-flight cycles get the
    /// configured grace period to finish. Workers still busy after that are
    /// detached and left to complete their cycle; an action is never cut off
    /// halfway through.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] if the loop was already shut down.
    pub async fn run(self: Arc<Self>) -> Result<ShutdownReport> {
        let config = self.reconciler.config().clone();
        if self.reconciler.queue().is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        info!(
            workers = config.workers,
            resync_interval_ms = config.resync_interval.as_millis(),
            "Starting reconciliation loop"
        );

        let mut workers = JoinSet::new();
        for id in 0..config.workers {
            workers.spawn(Arc::clone(&self).worker(id));
        }

        let mut stop_rx = self.stop_rx.clone();
        let mut resync = tokio::time::interval(config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; keys start out enqueued.
        resync.tick().await;

        loop {
            let stopped = *stop_rx.borrow_and_update();
            if stopped {
                break;
            }
            tokio::select! {
                _ = resync.tick() => {
                    let enqueued = self.resync_all().await;
                    debug!(enqueued, "Periodic resync");
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        Ok(self.shut_down(workers, config.shutdown_grace).await)
    }

    async fn worker(self: Arc<Self>, id: usize) {
        let queue = Arc::clone(self.reconciler.queue());
        debug!(worker = id, "Worker started");

        while let Some(item) = queue.next().await {
            let result = self.reconciler.reconcile(&item).await;
            self.finish(&item, &result);
        }

        debug!(worker = id, "Worker exiting");
    }

    /// Release `item`'s key after a cycle and schedule whatever follows.
    fn finish(&self, item: &WorkItem, result: &ReconcileResult) {
        let queue = self.reconciler.queue();
        self.counters.record(result);

        match result {
            ReconcileResult::Requeue { after } => {
                queue.add_after(item.key.clone(), Reason::RetryAfterFailure, *after);
            }
            ReconcileResult::Error {
                kind: ErrorKind::Fatal,
                ..
            } => {
                // The status read by resync may have predated this failure.
                if queue.discard_automatic(&item.key) {
                    debug!(key = %item.key, "Dropped resync queued during fatal cycle");
                }
            }
            ReconcileResult::Converged | ReconcileResult::Error { .. } => {}
        }
        queue.done(&item.key);
    }

    async fn shut_down(&self, mut workers: JoinSet<()>, grace: Duration) -> ShutdownReport {
        let queue = self.reconciler.queue();
        queue.shut_down();
        let pending_items = queue.len();
        info!(
            in_flight = queue.in_flight(),
            pending_items,
            grace_ms = grace.as_millis(),
            "Shutting down reconciliation loop"
        );

        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        let abandoned_workers = if drained.is_err() {
            let abandoned = workers.len();
            warn!(abandoned, "Grace period elapsed, leaving in-flight cycles to finish");
            // Dropping a JoinSet aborts its tasks; detach them instead.
            workers.detach_all();
            abandoned
        } else {
            0
        };

        info!("Reconciliation loop stopped");
        ShutdownReport {
            abandoned_workers,
            pending_items,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.reconciler.queue().is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn enqueue_reason(&self, key: &ResourceKey, reason: Reason) -> Result<()> {
        if self.reconciler.queue().add(key.clone(), reason) {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }
}

/// Handle to stop a reconciliation loop.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}
