//! Structured observability records.
//!
//! The engine emits one record per cycle start, per applied action, per
//! cycle end and per status change. Sinks decide where they go.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::types::{ChildId, ErrorKind, Outcome, Phase, Reason, ReconcileResult, ResourceKey};

/// A key-value record describing engine activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    CycleStarted {
        key: ResourceKey,
        reasons: BTreeSet<Reason>,
    },
    ActionApplied {
        key: ResourceKey,
        child: ChildId,
        op: String,
        outcome: Outcome,
        attempts: u32,
    },
    CycleFinished {
        key: ResourceKey,
        result: ReconcileResult,
        elapsed_ms: u64,
    },
    StatusChanged {
        key: ResourceKey,
        phase: Phase,
        last_error_kind: Option<ErrorKind>,
    },
}

impl EngineEvent {
    /// The key this record is about.
    #[must_use]
    pub const fn key(&self) -> &ResourceKey {
        match self {
            Self::CycleStarted { key, .. }
            | Self::ActionApplied { key, .. }
            | Self::CycleFinished { key, .. }
            | Self::StatusChanged { key, .. } => key,
        }
    }
}

/// Destination for engine records.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EngineEvent);
}

/// Writes records as `tracing` events with structured fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &EngineEvent) {
        match event {
            EngineEvent::CycleStarted { key, reasons } => {
                debug!(key = %key, reasons = ?reasons, "Cycle started");
            }
            EngineEvent::ActionApplied {
                key,
                child,
                op,
                outcome,
                attempts,
            } => match outcome {
                Outcome::Success => {
                    debug!(key = %key, child = %child, op = %op, attempts, "Action applied");
                }
                Outcome::Retryable(reason) => {
                    warn!(key = %key, child = %child, op = %op, attempts, reason = %reason, "Action retries exhausted");
                }
                Outcome::Fatal(reason) => {
                    error!(key = %key, child = %child, op = %op, attempts, reason = %reason, "Action failed fatally");
                }
            },
            EngineEvent::CycleFinished {
                key,
                result,
                elapsed_ms,
            } => match result {
                ReconcileResult::Converged => {
                    info!(key = %key, elapsed_ms, "Converged");
                }
                ReconcileResult::Requeue { after } => {
                    info!(key = %key, elapsed_ms, after_ms = after.as_millis(), "Requeued");
                }
                ReconcileResult::Error { kind, message } => {
                    error!(key = %key, elapsed_ms, kind = %kind, message = %message, "Cycle failed");
                }
            },
            EngineEvent::StatusChanged {
                key,
                phase,
                last_error_kind,
            } => {
                debug!(key = %key, phase = %phase, last_error_kind = ?last_error_kind, "Status changed");
            }
        }
    }
}

/// Publishes records on a broadcast channel, and to `tracing`.
pub struct BroadcastSink {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` records per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to records emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &EngineEvent) {
        TracingSink.emit(event);
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
    }
}
