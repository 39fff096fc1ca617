//! In-memory external system.
//!
//! [`InMemoryCluster`] is a [`Controller`] backed by a map of children per
//! key. It assigns system-managed fields on create, bumps a global resource
//! version on every change, and supports fault injection and out-of-band
//! edits for exercising failure and drift handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use ulid::Ulid;

use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::types::{Action, ActionOp, ChildId, ObservedChild, ObservedState, Outcome, ResourceKey};

/// How an injected fault fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultMode {
    Retryable,
    Fatal,
}

/// A scripted failure for matching actions.
///
/// Unset filters match everything. Each match consumes one of `times`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Resource name to match.
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub child: Option<ChildId>,
    /// Action tag to match: `create`, `update` or `delete`.
    #[serde(default)]
    pub op: Option<String>,
    pub mode: FaultMode,
    #[serde(default = "default_times")]
    pub times: u32,
}

const fn default_times() -> u32 {
    1
}

impl Fault {
    /// Fail matching actions transiently `times` times.
    #[must_use]
    pub const fn retryable(times: u32) -> Self {
        Self::new(FaultMode::Retryable, times)
    }

    /// Fail matching actions permanently `times` times.
    #[must_use]
    pub const fn fatal(times: u32) -> Self {
        Self::new(FaultMode::Fatal, times)
    }

    const fn new(mode: FaultMode, times: u32) -> Self {
        Self {
            resource: None,
            child: None,
            op: None,
            mode,
            times,
        }
    }

    #[must_use]
    pub fn on_resource(mut self, name: impl Into<String>) -> Self {
        self.resource = Some(name.into());
        self
    }

    #[must_use]
    pub fn on_child(mut self, child: impl Into<ChildId>) -> Self {
        self.child = Some(child.into());
        self
    }

    #[must_use]
    pub fn on_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    fn matches(&self, key: &ResourceKey, action: &Action) -> bool {
        self.times > 0
            && self.resource.as_deref().is_none_or(|r| r == key.name())
            && self.child.as_ref().is_none_or(|c| c == &action.child)
            && self.op.as_deref().is_none_or(|op| op == action.op.tag())
    }

    fn outcome(&self, action: &Action) -> Outcome {
        let reason = format!("injected fault on {}", action.description());
        match self.mode {
            FaultMode::Retryable => Outcome::Retryable(reason),
            FaultMode::Fatal => Outcome::Fatal(reason),
        }
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    /// Children per key, in creation order.
    objects: HashMap<ResourceKey, Vec<ObservedChild>>,
    resource_version: u64,
    faults: Vec<Fault>,
    fetch_failures: u32,
    /// Applies currently running, per key.
    active: HashMap<ResourceKey, u32>,
    peak_active: u32,
}

impl ClusterState {
    fn bump(&mut self) {
        self.resource_version = self.resource_version.wrapping_add(1);
    }

    fn children(&self, key: &ResourceKey) -> &[ObservedChild] {
        self.objects.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    fn take_fault(&mut self, key: &ResourceKey, action: &Action) -> Option<Outcome> {
        let fault = self.faults.iter_mut().find(|f| f.matches(key, action))?;
        fault.times = fault.times.saturating_sub(1);
        Some(fault.outcome(action))
    }

    fn apply(&mut self, key: &ResourceKey, action: &Action) -> Outcome {
        match &action.op {
            ActionOp::Create { fields } => {
                if let Some(parent) = &action.parent {
                    if !self.children(key).iter().any(|c| &c.id == parent) {
                        return Outcome::Fatal(format!(
                            "cannot create '{}': parent '{parent}' does not exist",
                            action.child
                        ));
                    }
                }

                let children = self.objects.entry(key.clone()).or_default();
                if let Some(existing) = children.iter_mut().find(|c| c.id == action.child) {
                    if fields.iter().all(|(k, v)| existing.fields.get(k) == Some(v)) {
                        return Outcome::Success;
                    }
                    existing.fields.extend(fields.clone());
                } else {
                    let mut all = fields.clone();
                    all.insert("uid".to_string(), Ulid::new().to_string().into());
                    all.insert("createdAt".to_string(), Utc::now().to_rfc3339().into());
                    children.push(ObservedChild {
                        id: action.child.clone(),
                        parent: action.parent.clone(),
                        fields: all,
                    });
                }
                self.bump();
                Outcome::Success
            }
            ActionOp::Update { fields, .. } => {
                let Some(existing) = self
                    .objects
                    .get_mut(key)
                    .and_then(|children| children.iter_mut().find(|c| c.id == action.child))
                else {
                    return Outcome::Retryable(format!("child '{}' not found", action.child));
                };
                if fields.iter().all(|(k, v)| existing.fields.get(k) == Some(v)) {
                    return Outcome::Success;
                }
                existing.fields.extend(fields.clone());
                self.bump();
                Outcome::Success
            }
            ActionOp::Delete => {
                let dependents = self
                    .children(key)
                    .iter()
                    .filter(|c| c.parent.as_ref() == Some(&action.child))
                    .count();
                if dependents > 0 {
                    return Outcome::Fatal(format!(
                        "cannot delete '{}': {dependents} dependent(s) still exist",
                        action.child
                    ));
                }

                let Some(children) = self.objects.get_mut(key) else {
                    return Outcome::Success;
                };
                let before = children.len();
                children.retain(|c| c.id != action.child);
                let removed = children.len() != before;
                if children.is_empty() {
                    self.objects.remove(key);
                }
                if removed {
                    self.bump();
                }
                Outcome::Success
            }
        }
    }
}

/// A [`Controller`] over an in-memory cluster for one kind.
#[derive(Debug)]
pub struct InMemoryCluster {
    kind: String,
    state: Mutex<ClusterState>,
    latency: Duration,
    applies: AtomicU64,
}

impl InMemoryCluster {
    /// Create an empty cluster serving `kind`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            state: Mutex::new(ClusterState::default()),
            latency: Duration::ZERO,
            applies: AtomicU64::new(0),
        }
    }

    /// Delay every apply by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Register a fault.
    pub async fn inject(&self, fault: Fault) {
        self.state.lock().await.faults.push(fault);
    }

    /// Fail the next `count` fetches with a retryable error.
    pub async fn fail_fetches(&self, count: u32) {
        self.state.lock().await.fetch_failures = count;
    }

    /// Change a child's field behind the engine's back.
    ///
    /// Returns `false` if the child does not exist.
    pub async fn mutate_out_of_band(
        &self,
        key: &ResourceKey,
        child: &ChildId,
        field: &str,
        value: serde_json::Value,
    ) -> bool {
        let mut state = self.state.lock().await;
        let Some(existing) = state
            .objects
            .get_mut(key)
            .and_then(|children| children.iter_mut().find(|c| &c.id == child))
        else {
            return false;
        };
        existing.fields.insert(field.to_string(), value);
        state.bump();
        true
    }

    /// Remove a child behind the engine's back.
    pub async fn remove_out_of_band(&self, key: &ResourceKey, child: &ChildId) -> bool {
        let mut state = self.state.lock().await;
        let Some(children) = state.objects.get_mut(key) else {
            return false;
        };
        let before = children.len();
        children.retain(|c| &c.id != child);
        let removed = children.len() != before;
        if removed {
            state.bump();
        }
        removed
    }

    /// Current children of `key`, in creation order.
    pub async fn children(&self, key: &ResourceKey) -> Vec<ObservedChild> {
        self.state.lock().await.children(key).to_vec()
    }

    /// Current child IDs of `key`, sorted.
    pub async fn child_ids(&self, key: &ResourceKey) -> Vec<String> {
        let mut ids: Vec<_> = self
            .state
            .lock()
            .await
            .children(key)
            .iter()
            .map(|c| c.id.to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Current resource version.
    pub async fn resource_version(&self) -> u64 {
        self.state.lock().await.resource_version
    }

    /// Total apply calls, including failed ones.
    #[must_use]
    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }

    /// Most applies ever seen running at once for a single key.
    pub async fn peak_concurrency_per_key(&self) -> u32 {
        self.state.lock().await.peak_active
    }
}

#[async_trait]
impl Controller for InMemoryCluster {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn fetch_observed(&self, key: &ResourceKey) -> Result<Option<ObservedState>> {
        let mut state = self.state.lock().await;
        if state.fetch_failures > 0 {
            state.fetch_failures = state.fetch_failures.saturating_sub(1);
            return Err(Error::retryable("injected fetch failure"));
        }
        Ok(state
            .objects
            .get(key)
            .map(|children| ObservedState::new(state.resource_version, children.clone())))
    }

    async fn apply(&self, key: &ResourceKey, action: &Action) -> Outcome {
        self.applies.fetch_add(1, Ordering::SeqCst);

        {
            let mut state = self.state.lock().await;
            let active = state.active.entry(key.clone()).or_default();
            *active = active.saturating_add(1);
            let active = *active;
            state.peak_active = state.peak_active.max(active);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.lock().await;
        if let Some(active) = state.active.get_mut(key) {
            *active = active.saturating_sub(1);
        }

        let outcome = match state.take_fault(key, action) {
            Some(outcome) => outcome,
            None => state.apply(key, action),
        };
        debug!(key = %key, action = %action.description(), outcome = ?outcome, "Cluster applied action");
        outcome
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use super::*;
    use crate::types::{ChildSpec, DesiredSpec};
    use serde_json::json;

    fn key() -> ResourceKey {
        ResourceKey::new("replicaset", "default", "web")
    }

    fn create(id: &str) -> Action {
        Action::create(&ChildSpec::new(id).with_field("image", json!("nginx")))
    }

    #[tokio::test]
    async fn test_create_adds_system_fields_and_bumps_version() -> Result<()> {
        let cluster = InMemoryCluster::new("replicaset");

        let outcome = cluster.apply(&key(), &create("r1")).await;

        assert_eq!(outcome, Outcome::Success);
        let observed = cluster.fetch_observed(&key()).await?.unwrap();
        assert_eq!(observed.resource_version, 1);
        let fields = &observed.children[0].fields;
        assert!(fields.contains_key("uid"));
        assert!(fields.contains_key("createdAt"));
        assert_eq!(fields.get("image"), Some(&json!("nginx")));
        Ok(())
    }

    #[tokio::test]
    async fn test_repeated_create_is_noop() {
        let cluster = InMemoryCluster::new("replicaset");
        cluster.apply(&key(), &create("r1")).await;
        let version = cluster.resource_version().await;

        let outcome = cluster.apply(&key(), &create("r1")).await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(cluster.resource_version().await, version);
        assert_eq!(cluster.child_ids(&key()).await, vec!["r1"]);
    }

    #[tokio::test]
    async fn test_replaying_a_plan_leaves_observed_state_unchanged() -> Result<()> {
        let cluster = InMemoryCluster::new("replicaset");
        cluster.apply(&key(), &create("r1")).await;
        cluster.apply(&key(), &create("r9")).await;
        let desired = DesiredSpec::new(1)
            .with_child(ChildSpec::new("r1").with_field("image", json!("nginx:2")))
            .with_child(ChildSpec::new("r2").with_field("image", json!("nginx:2")))
            .with_child(
                ChildSpec::new("r3")
                    .with_parent("r2")
                    .with_field("image", json!("nginx:2")),
            );
        let observed = cluster.fetch_observed(&key()).await?;
        let actions = crate::planner::plan(&crate::differ::diff(Some(&desired), observed.as_ref()));
        assert_eq!(actions.len(), 4);

        for action in &actions {
            assert_eq!(cluster.apply(&key(), action).await, Outcome::Success);
        }
        let once = cluster.fetch_observed(&key()).await?;
        for action in &actions {
            assert_eq!(cluster.apply(&key(), action).await, Outcome::Success);
        }
        let twice = cluster.fetch_observed(&key()).await?;

        assert_eq!(twice, once);
        assert_eq!(cluster.child_ids(&key()).await, vec!["r1", "r2", "r3"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_is_success() {
        let cluster = InMemoryCluster::new("replicaset");
        let observed = ObservedChild {
            id: ChildId::from("ghost"),
            parent: None,
            fields: crate::types::FieldMap::new(),
        };

        assert_eq!(cluster.apply(&key(), &Action::delete(&observed)).await, Outcome::Success);
    }

    #[tokio::test]
    async fn test_create_without_parent_is_fatal() {
        let cluster = InMemoryCluster::new("replicaset");
        let orphan = Action::create(&ChildSpec::new("pod").with_parent("svc"));

        let outcome = cluster.apply(&key(), &orphan).await;

        assert!(matches!(outcome, Outcome::Fatal(_)));
    }

    #[tokio::test]
    async fn test_fault_consumed_then_success() {
        let cluster = InMemoryCluster::new("replicaset");
        cluster.inject(Fault::retryable(2).on_child("r1").on_op("create")).await;

        let first = cluster.apply(&key(), &create("r1")).await;
        let second = cluster.apply(&key(), &create("r1")).await;
        let third = cluster.apply(&key(), &create("r1")).await;

        assert!(matches!(first, Outcome::Retryable(_)));
        assert!(matches!(second, Outcome::Retryable(_)));
        assert_eq!(third, Outcome::Success);
        assert_eq!(cluster.apply_count(), 3);
    }

    #[tokio::test]
    async fn test_fetch_failure_injection() {
        let cluster = InMemoryCluster::new("replicaset");
        cluster.fail_fetches(1).await;

        assert!(cluster.fetch_observed(&key()).await.is_err());
        assert!(cluster.fetch_observed(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_out_of_band_mutation() {
        let cluster = InMemoryCluster::new("replicaset");
        cluster.apply(&key(), &create("r1")).await;

        let changed = cluster
            .mutate_out_of_band(&key(), &ChildId::from("r1"), "image", json!("evil"))
            .await;

        assert!(changed);
        let children = cluster.children(&key()).await;
        assert_eq!(children[0].fields.get("image"), Some(&json!("evil")));
        assert!(cluster.remove_out_of_band(&key(), &ChildId::from("r1")).await);
        assert!(cluster.child_ids(&key()).await.is_empty());
    }

    #[test]
    fn test_fault_deserializes_with_defaults() {
        let fault: Fault = toml::from_str("mode = \"fatal\"\nchild = \"r2\"").unwrap();
        assert_eq!(fault, Fault::fatal(1).on_child("r2"));
    }
}
