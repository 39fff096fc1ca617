//! K8s-style reconciliation engine.
//!
//! Drives declared resources toward their desired state:
//!
//! - **Desired state**: a versioned spec of the children a resource should own
//! - **Observed state**: what the external system actually has
//! - **Diff**: structural delta between the two
//! - **Plan**: dependency-ordered, idempotent actions that close the gap
//! - **Execute**: apply actions with bounded retries and backoff
//!
//! # Key Concepts
//!
//! ## Level-triggered
//!
//! Every cycle recomputes the delta from fresh reads. Missed notifications
//! are harmless; the periodic resync catches any drift.
//!
//! ## Per-key serialization
//!
//! The work queue holds at most one entry per key and never hands the same
//! key to two workers. Distinct keys run in parallel up to the worker count.
//!
//! ## Failure handling
//!
//! Transient failures back off and requeue. Fatal failures park the key in
//! `Failed` with its last error until a new spec or a manual enqueue.
//!
//! # Example
//!
//! ```ignore
//! use converge_reconciler::{
//!     DesiredSpec, InMemoryCluster, Reconciler, ReconcilerConfig, ReconciliationLoop, ResourceKey,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> converge_reconciler::Result<()> {
//!     let cluster = Arc::new(InMemoryCluster::new("replicaset"));
//!     let reconciler = Reconciler::builder()
//!         .with_controller(cluster)
//!         .with_config(ReconcilerConfig::default())
//!         .build()?;
//!     let control = ReconciliationLoop::new_arc(Arc::new(reconciler));
//!
//!     let key = ResourceKey::new("replicaset", "default", "web");
//!     control.declare(&key, DesiredSpec::replicated(1, "web-", 3, &Default::default())).await?;
//!
//!     let stopper = control.stopper();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         stopper.stop();
//!     });
//!     control.run().await?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod controller;
pub mod differ;
pub mod error;
pub mod events;
pub mod executor;
pub mod r#loop;
pub mod planner;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod sim;
pub mod store;
pub mod types;

// Re-export main types
pub use config::ReconcilerConfig;
pub use controller::Controller;
pub use error::{Error, Result};
pub use events::{BroadcastSink, EngineEvent, EventSink, TracingSink};
pub use executor::{ActionFailure, ExecutionReport, Executor, FailureKind};
pub use r#loop::{LoopMetrics, LoopStopper, ReconciliationLoop, ShutdownReport};
pub use queue::WorkQueue;
pub use reconciler::{Reconciler, ReconcilerBuilder};
pub use retry::{Backoff, RetryPolicy};
pub use sim::{Fault, FaultMode, InMemoryCluster};
pub use store::{InMemoryStateStore, Snapshot, StateStore, VersionToken};
pub use types::{
    Action, ActionOp, ChangeHint, ChildId, ChildSpec, Delta, DeltaOp, DesiredSpec, ErrorKind,
    FieldChange, FieldMap, ObservedChild, ObservedState, Outcome, Phase, Reason, ReconcileResult,
    ResourceKey, ResourceStatus, SpecViolation, WorkItem,
};
