//! End-to-end convergence scenarios against the in-memory cluster.
//!
//! Each test runs the real loop with fast timings and waits for it to go
//! idle (nothing queued, nothing running).

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::arithmetic_side_effects
)]

use std::sync::Arc;
use std::time::Duration;

use converge_reconciler::{
    Backoff, BroadcastSink, ChildId, ChildSpec, Controller, DesiredSpec, EngineEvent, Error, ErrorKind,
    EventSink, Fault, FieldMap, InMemoryCluster, Phase, Reconciler, ReconcilerConfig,
    ReconciliationLoop, ResourceKey, RetryPolicy,
};
use serde_json::json;

fn key() -> ResourceKey {
    ResourceKey::new("replicaset", "default", "web")
}

fn template(image: &str) -> FieldMap {
    FieldMap::from([
        ("image".to_string(), json!(image)),
        ("port".to_string(), json!(8080)),
    ])
}

fn replicas(generation: u64, count: usize) -> DesiredSpec {
    DesiredSpec::replicated(generation, "web-", count, &template("nginx:1.25"))
}

fn fast_config() -> ReconcilerConfig {
    let action = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5)).without_jitter();
    let requeue = Backoff::new(Duration::from_millis(5), Duration::from_millis(20)).without_jitter();
    ReconcilerConfig::default()
        .with_workers(2)
        .with_action_retry(action)
        .with_requeue_backoff(requeue)
        .with_requeue_unconverged(Duration::from_millis(5))
}

struct Harness {
    control: Arc<ReconciliationLoop>,
    cluster: Arc<InMemoryCluster>,
    run: tokio::task::JoinHandle<converge_reconciler::Result<converge_reconciler::ShutdownReport>>,
}

impl Harness {
    fn start(config: ReconcilerConfig) -> Self {
        Self::start_with_sink(config, None)
    }

    fn start_with_sink(config: ReconcilerConfig, sink: Option<Arc<dyn EventSink>>) -> Self {
        let cluster = Arc::new(InMemoryCluster::new("replicaset"));
        let mut builder = Reconciler::builder()
            .with_controller(Arc::clone(&cluster) as Arc<dyn Controller>)
            .with_config(config);
        if let Some(sink) = sink {
            builder = builder.with_sink(sink);
        }
        let control = ReconciliationLoop::new_arc(Arc::new(builder.build().unwrap()));
        let run = tokio::spawn(Arc::clone(&control).run());
        Self {
            control,
            cluster,
            run,
        }
    }

    async fn settle(&self) {
        for _ in 0..1000 {
            if self.control.is_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("loop did not settle: {:?}", self.control.metrics());
    }

    async fn ids(&self) -> Vec<String> {
        self.cluster.child_ids(&key()).await
    }

    async fn stop(self) {
        self.control.stop();
        self.run.await.unwrap().unwrap();
    }
}

/// Given replicas=1 converged
/// When the spec changes to replicas=3
/// Then exactly two children are created
#[tokio::test]
async fn scale_up_creates_missing_children() {
    let h = Harness::start(fast_config());
    h.control.declare(&key(), replicas(1, 1)).await.unwrap();
    h.settle().await;
    assert_eq!(h.ids().await, vec!["web-1"]);
    let before = h.cluster.apply_count();

    h.control.declare(&key(), replicas(2, 3)).await.unwrap();
    h.settle().await;

    assert_eq!(h.ids().await, vec!["web-1", "web-2", "web-3"]);
    assert_eq!(h.cluster.apply_count() - before, 2);
    let status = h.control.status(&key()).await.unwrap();
    assert_eq!(status.phase, Phase::Idle);
    assert_eq!(status.observed_generation, Some(2));
    h.stop().await;
}

/// Given replicas=3 converged
/// When the spec changes to replicas=1
/// Then the extra children are deleted
#[tokio::test]
async fn scale_down_removes_extra_children() {
    let h = Harness::start(fast_config());
    h.control.declare(&key(), replicas(1, 3)).await.unwrap();
    h.settle().await;

    h.control.declare(&key(), replicas(2, 1)).await.unwrap();
    h.settle().await;

    assert_eq!(h.ids().await, vec!["web-1"]);
    h.stop().await;
}

/// Given converged children
/// When a template field changes
/// Then children are updated in place, keeping system-managed fields
#[tokio::test]
async fn field_change_updates_in_place() {
    let h = Harness::start(fast_config());
    h.control.declare(&key(), replicas(1, 2)).await.unwrap();
    h.settle().await;
    let uids: Vec<_> = h
        .cluster
        .children(&key())
        .await
        .into_iter()
        .map(|c| c.fields.get("uid").cloned())
        .collect();

    let upgraded = DesiredSpec::replicated(2, "web-", 2, &template("nginx:1.27"));
    h.control.declare(&key(), upgraded).await.unwrap();
    h.settle().await;

    let children = h.cluster.children(&key()).await;
    assert!(children.iter().all(|c| c.fields.get("image") == Some(&json!("nginx:1.27"))));
    let after: Vec<_> = children.into_iter().map(|c| c.fields.get("uid").cloned()).collect();
    assert_eq!(uids, after);
    h.stop().await;
}

/// Given a converged resource
/// When it is deleted
/// Then its children are torn down and the key disappears
#[tokio::test]
async fn delete_tears_down_and_removes_key() {
    let h = Harness::start(fast_config());
    h.control.declare(&key(), replicas(1, 3)).await.unwrap();
    h.settle().await;

    h.control.delete(&key()).await.unwrap();
    h.settle().await;

    assert!(h.ids().await.is_empty());
    assert!(matches!(
        h.control.status(&key()).await,
        Err(Error::NotFound { .. })
    ));
    h.stop().await;
}

/// Given a parent with dependent children
/// When the resource is created and then deleted
/// Then parents are created first and deleted last
#[tokio::test]
async fn parent_child_ordering_is_respected() {
    let h = Harness::start(fast_config());
    let spec = DesiredSpec::new(1)
        .with_child(ChildSpec::new("pod-b").with_parent("svc"))
        .with_child(ChildSpec::new("pod-a").with_parent("svc"))
        .with_child(ChildSpec::new("svc").with_field("port", json!(80)));

    h.control.declare(&key(), spec).await.unwrap();
    h.settle().await;
    let created: Vec<_> = h
        .cluster
        .children(&key())
        .await
        .into_iter()
        .map(|c| c.id.to_string())
        .collect();
    assert_eq!(created, vec!["svc", "pod-a", "pod-b"]);

    h.control.delete(&key()).await.unwrap();
    h.settle().await;

    assert!(h.ids().await.is_empty());
    assert!(h.control.statuses().await.is_empty());
    h.stop().await;
}

/// Given a child whose create fails transiently more often than the
/// per-action retry cap
/// When the resource is declared
/// Then the key backs off, retries, and eventually converges
#[tokio::test]
async fn transient_failure_self_heals() {
    let h = Harness::start(fast_config());
    h.cluster.inject(Fault::retryable(5).on_child("web-2")).await;

    h.control.declare(&key(), replicas(1, 3)).await.unwrap();
    h.settle().await;

    assert_eq!(h.ids().await, vec!["web-1", "web-2", "web-3"]);
    let status = h.control.status(&key()).await.unwrap();
    assert_eq!(status.phase, Phase::Idle);
    assert!(status.last_error.is_none());
    assert_eq!(status.consecutive_failures, 0);
    assert!(h.control.metrics().requeued >= 1);
    h.stop().await;
}

/// Given a child whose create fails fatally
/// When the resource is declared
/// Then earlier children stay, later ones are not attempted, the key is
/// Failed until a new spec arrives, and the next cycle applies only what is
/// still missing
#[tokio::test]
async fn fatal_failure_parks_key_until_spec_update() {
    let h = Harness::start(fast_config());
    h.cluster.inject(Fault::fatal(1).on_child("web-2")).await;

    h.control.declare(&key(), replicas(1, 3)).await.unwrap();
    h.settle().await;

    assert_eq!(h.ids().await, vec!["web-1"]);
    let status = h.control.status(&key()).await.unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert_eq!(status.last_error_kind, Some(ErrorKind::Fatal));
    assert!(status.last_error.unwrap().contains("web-2"));
    assert!(status.last_reconciled_at.is_none());

    // Periodic resync leaves it alone.
    assert_eq!(h.control.resync_all().await, 0);
    let applied_before_fix = h.cluster.apply_count();

    h.control.declare(&key(), replicas(2, 3)).await.unwrap();
    h.settle().await;

    assert_eq!(h.ids().await, vec!["web-1", "web-2", "web-3"]);
    // Only the two missing children are created; web-1 is not touched again.
    assert_eq!(h.cluster.apply_count() - applied_before_fix, 2);
    let status = h.control.status(&key()).await.unwrap();
    assert_eq!(status.phase, Phase::Idle);
    assert_eq!(status.observed_generation, Some(2));
    assert!(status.last_error.is_none());
    h.stop().await;
}

/// Given a Failed key
/// When it is manually enqueued after the fault clears
/// Then it converges
#[tokio::test]
async fn manual_enqueue_retries_failed_key() {
    let h = Harness::start(fast_config());
    h.cluster.inject(Fault::fatal(1).on_op("create")).await;
    h.control.declare(&key(), replicas(1, 1)).await.unwrap();
    h.settle().await;
    assert_eq!(h.control.status(&key()).await.unwrap().phase, Phase::Failed);

    h.control.enqueue(&key()).await.unwrap();
    h.settle().await;

    assert_eq!(h.ids().await, vec!["web-1"]);
    assert_eq!(h.control.status(&key()).await.unwrap().phase, Phase::Idle);
    h.stop().await;
}

/// Given a converged resource
/// When a child drifts out of band
/// Then the periodic resync restores it
#[tokio::test]
async fn periodic_resync_corrects_drift() {
    let h = Harness::start(fast_config().with_resync_interval(Duration::from_millis(20)));
    h.control.declare(&key(), replicas(1, 2)).await.unwrap();
    h.settle().await;

    let changed = h
        .cluster
        .mutate_out_of_band(&key(), &ChildId::from("web-1"), "image", json!("evil:latest"))
        .await;
    h.cluster
        .remove_out_of_band(&key(), &ChildId::from("web-2"))
        .await;
    assert!(changed);

    let mut healed = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let children = h.cluster.children(&key()).await;
        healed = children.len() == 2
            && children
                .iter()
                .all(|c| c.fields.get("image") == Some(&json!("nginx:1.25")));
        if healed {
            break;
        }
    }
    assert!(healed, "drift was not corrected");
    h.stop().await;
}

/// Given a converged resource
/// When it is reconciled again with no changes
/// Then no actions are applied
#[tokio::test]
async fn converged_resource_is_left_alone() {
    let h = Harness::start(fast_config());
    h.control.declare(&key(), replicas(1, 3)).await.unwrap();
    h.settle().await;
    let applied = h.cluster.apply_count();

    for _ in 0..3 {
        h.control.resync_all().await;
        h.settle().await;
    }

    assert_eq!(h.cluster.apply_count(), applied);
    h.stop().await;
}

/// Given a broadcast sink
/// When a resource converges
/// Then cycle and action records are published
#[tokio::test]
async fn events_are_published() {
    let sink = Arc::new(BroadcastSink::new(256));
    let mut rx = sink.subscribe();
    let h = Harness::start_with_sink(fast_config(), Some(sink as Arc<dyn EventSink>));

    h.control.declare(&key(), replicas(1, 2)).await.unwrap();
    h.settle().await;
    h.stop().await;

    let mut actions = 0;
    let mut finished = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            EngineEvent::ActionApplied { op, .. } => {
                assert_eq!(op, "create");
                actions += 1;
            }
            EngineEvent::CycleFinished { .. } => finished = true,
            _ => {}
        }
    }
    assert_eq!(actions, 2);
    assert!(finished);
}
