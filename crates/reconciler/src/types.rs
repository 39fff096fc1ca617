//! Core types for the reconciler.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Declared or observed field values of a child, keyed by field name.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// Identifies one reconcilable entity: kind + namespace + name.
///
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    kind: String,
    namespace: String,
    name: String,
}

impl ResourceKey {
    /// Create a new resource key.
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Resource kind; selects the controller.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Stable identity of a child within one resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildId(String);

impl ChildId {
    /// Create a child ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChildId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for ChildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declaration of one child the resource should own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub id: ChildId,
    /// Child that must exist before this one is created.
    pub parent: Option<ChildId>,
    /// Declared fields. Only these are compared against observed state.
    pub fields: FieldMap,
}

impl ChildSpec {
    /// Create a child spec with no parent and no fields.
    pub fn new(id: impl Into<ChildId>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            fields: FieldMap::new(),
        }
    }

    /// Set the parent child.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<ChildId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declare a field value.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

impl From<String> for ChildId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Reasons a desired spec is rejected at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecViolation {
    #[error("duplicate child '{0}'")]
    DuplicateChild(ChildId),
    #[error("child '{0}' is its own parent")]
    SelfParent(ChildId),
    #[error("child '{child}' references undeclared parent '{parent}'")]
    MissingParent { child: ChildId, parent: ChildId },
    #[error("parent cycle through child '{0}'")]
    ParentCycle(ChildId),
}

/// Versioned declaration of the target state of one resource.
///
/// Replaced whole on every change; never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredSpec {
    generation: u64,
    children: Vec<ChildSpec>,
}

impl DesiredSpec {
    /// Create an empty spec at the given generation.
    #[must_use]
    pub const fn new(generation: u64) -> Self {
        Self {
            generation,
            children: Vec::new(),
        }
    }

    /// A spec of `count` identical children named `{prefix}1..{prefix}count`.
    #[must_use]
    pub fn replicated(generation: u64, prefix: &str, count: usize, template: &FieldMap) -> Self {
        (1..=count).fold(Self::new(generation), |spec, n| {
            let child = ChildSpec {
                id: ChildId::new(format!("{prefix}{n}")),
                parent: None,
                fields: template.clone(),
            };
            spec.with_child(child)
        })
    }

    /// Append a child, preserving declaration order.
    #[must_use]
    pub fn with_child(mut self, child: ChildSpec) -> Self {
        self.children.push(child);
        self
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Children in declaration order.
    #[must_use]
    pub fn children(&self) -> &[ChildSpec] {
        &self.children
    }

    /// Look up a child by ID.
    #[must_use]
    pub fn child(&self, id: &ChildId) -> Option<&ChildSpec> {
        self.children.iter().find(|c| &c.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Check structural well-formedness.
    ///
    /// # Errors
    ///
    /// Returns the first [`SpecViolation`] found, in declaration order.
    pub fn validate(&self) -> std::result::Result<(), SpecViolation> {
        let mut seen = HashSet::with_capacity(self.children.len());
        for child in &self.children {
            if !seen.insert(&child.id) {
                return Err(SpecViolation::DuplicateChild(child.id.clone()));
            }
        }

        let parents: HashMap<&ChildId, Option<&ChildId>> = self
            .children
            .iter()
            .map(|c| (&c.id, c.parent.as_ref()))
            .collect();

        for child in &self.children {
            match &child.parent {
                Some(parent) if parent == &child.id => {
                    return Err(SpecViolation::SelfParent(child.id.clone()));
                }
                Some(parent) if !parents.contains_key(parent) => {
                    return Err(SpecViolation::MissingParent {
                        child: child.id.clone(),
                        parent: parent.clone(),
                    });
                }
                _ => {}
            }
        }

        // Every parent exists, so a chain longer than the child count loops.
        for child in &self.children {
            let mut cursor = child.parent.as_ref();
            let mut steps = 0usize;
            while let Some(parent) = cursor {
                steps = steps.saturating_add(1);
                if steps > self.children.len() {
                    return Err(SpecViolation::ParentCycle(child.id.clone()));
                }
                cursor = parents.get(parent).copied().flatten();
            }
        }

        Ok(())
    }
}

/// A child as seen in the external system.
///
/// May carry system-managed fields (generated IDs, timestamps) that no
/// spec declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedChild {
    pub id: ChildId,
    pub parent: Option<ChildId>,
    pub fields: FieldMap,
}

/// Last snapshot of actual state fetched for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    /// Version reported by the external system; grows with every change.
    pub resource_version: u64,
    pub observed_at: DateTime<Utc>,
    pub children: Vec<ObservedChild>,
}

impl ObservedState {
    /// Create an observation stamped now.
    #[must_use]
    pub fn new(resource_version: u64, children: Vec<ObservedChild>) -> Self {
        Self {
            resource_version,
            observed_at: Utc::now(),
            children,
        }
    }

    /// Look up a child by ID.
    #[must_use]
    pub fn child(&self, id: &ChildId) -> Option<&ObservedChild> {
        self.children.iter().find(|c| &c.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// One declared field whose observed value differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    /// Observed value, `None` when the field is missing.
    pub from: Option<serde_json::Value>,
    pub to: serde_json::Value,
}

/// A typed operation in a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaOp {
    Add(ChildSpec),
    Remove(ObservedChild),
    Modify {
        child: ChildSpec,
        changes: Vec<FieldChange>,
    },
}

impl DeltaOp {
    /// The child this operation targets.
    #[must_use]
    pub fn child_id(&self) -> &ChildId {
        match self {
            Self::Add(child) | Self::Modify { child, .. } => &child.id,
            Self::Remove(child) => &child.id,
        }
    }
}

/// Structural difference between desired and observed state.
///
/// Recomputed every cycle and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    ops: Vec<DeltaOp>,
}

impl Delta {
    #[must_use]
    pub const fn new(ops: Vec<DeltaOp>) -> Self {
        Self { ops }
    }

    #[must_use]
    pub fn ops(&self) -> &[DeltaOp] {
        &self.ops
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Children to add, in declaration order.
    pub fn adds(&self) -> impl Iterator<Item = &ChildSpec> {
        self.ops.iter().filter_map(|op| match op {
            DeltaOp::Add(child) => Some(child),
            _ => None,
        })
    }

    /// Children to remove.
    pub fn removes(&self) -> impl Iterator<Item = &ObservedChild> {
        self.ops.iter().filter_map(|op| match op {
            DeltaOp::Remove(child) => Some(child),
            _ => None,
        })
    }

    /// Children to modify, with their field changes.
    pub fn modifies(&self) -> impl Iterator<Item = (&ChildSpec, &[FieldChange])> {
        self.ops.iter().filter_map(|op| match op {
            DeltaOp::Modify { child, changes } => Some((child, changes.as_slice())),
            _ => None,
        })
    }
}

/// What an action does to its child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionOp {
    Create { fields: FieldMap },
    Update {
        changes: Vec<FieldChange>,
        /// Full declared field set, so a retry can apply it blindly.
        fields: FieldMap,
    },
    Delete,
}

impl ActionOp {
    /// Short lowercase tag, used in logs and idempotency keys.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete => "delete",
        }
    }
}

/// An idempotent step against the external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub child: ChildId,
    pub parent: Option<ChildId>,
    pub op: ActionOp,
    idempotency_key: String,
}

impl Action {
    /// Create an action, deriving its idempotency key.
    #[must_use]
    pub fn new(child: ChildId, parent: Option<ChildId>, op: ActionOp) -> Self {
        let idempotency_key = idempotency_key(&child, &op);
        Self {
            child,
            parent,
            op,
            idempotency_key,
        }
    }

    /// Create a child with its declared fields.
    #[must_use]
    pub fn create(spec: &ChildSpec) -> Self {
        Self::new(
            spec.id.clone(),
            spec.parent.clone(),
            ActionOp::Create {
                fields: spec.fields.clone(),
            },
        )
    }

    /// Bring a child's declared fields in line.
    #[must_use]
    pub fn update(spec: &ChildSpec, changes: &[FieldChange]) -> Self {
        Self::new(
            spec.id.clone(),
            spec.parent.clone(),
            ActionOp::Update {
                changes: changes.to_vec(),
                fields: spec.fields.clone(),
            },
        )
    }

    /// Delete an observed child.
    #[must_use]
    pub fn delete(child: &ObservedChild) -> Self {
        Self::new(child.id.clone(), child.parent.clone(), ActionOp::Delete)
    }

    /// Hex SHA-256 of target identity, op and desired field values.
    #[must_use]
    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    /// Whether `observed` already reflects this action.
    #[must_use]
    pub fn is_satisfied_by(&self, observed: Option<&ObservedState>) -> bool {
        let existing = observed.and_then(|o| o.child(&self.child));
        match (&self.op, existing) {
            (ActionOp::Delete, existing) => existing.is_none(),
            (ActionOp::Create { fields } | ActionOp::Update { fields, .. }, Some(child)) => fields
                .iter()
                .all(|(name, value)| child.fields.get(name) == Some(value)),
            (_, None) => false,
        }
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> String {
        match &self.op {
            ActionOp::Create { fields } => {
                format!("create {} ({} fields)", self.child, fields.len())
            }
            ActionOp::Update { changes, .. } => {
                let names = changes.iter().map(|c| c.field.as_str()).join(", ");
                format!("update {} [{names}]", self.child)
            }
            ActionOp::Delete => format!("delete {}", self.child),
        }
    }
}

fn idempotency_key(child: &ChildId, op: &ActionOp) -> String {
    let mut hasher = Sha256::new();
    hasher.update(child.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(op.tag().as_bytes());
    if let ActionOp::Create { fields } | ActionOp::Update { fields, .. } = op {
        // BTreeMap serializes in key order, so this is canonical.
        let canonical = serde_json::to_vec(fields).unwrap_or_default();
        hasher.update([0u8]);
        hasher.update(&canonical);
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Result of applying one action against the external system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    /// Transient failure; worth retrying.
    Retryable(String),
    /// Permanent failure; stops the cycle.
    Fatal(String),
}

impl Outcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Why a key was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    PeriodicResync,
    WatchEvent,
    RetryAfterFailure,
    Manual,
}

impl Reason {
    /// Whether the engine raised this reason on its own, as opposed to a
    /// spec change, a watch event or an operator.
    #[must_use]
    pub const fn is_automatic(self) -> bool {
        matches!(self, Self::PeriodicResync | Self::RetryAfterFailure)
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PeriodicResync => "periodic-resync",
            Self::WatchEvent => "watch-event",
            Self::RetryAfterFailure => "retry-after-failure",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// A key dequeued for reconciliation with every reason that coalesced into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: ResourceKey,
    pub reasons: BTreeSet<Reason>,
}

impl WorkItem {
    /// Create a work item with a single reason.
    #[must_use]
    pub fn new(key: ResourceKey, reason: Reason) -> Self {
        Self {
            key,
            reasons: BTreeSet::from([reason]),
        }
    }
}

/// Hint carried by a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeHint {
    SpecChanged,
    ObservedChanged,
    Deleted,
}

/// The engine's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Retryable,
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Outcome of one reconcile cycle for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileResult {
    Converged,
    Requeue { after: Duration },
    Error { kind: ErrorKind, message: String },
}

impl ReconcileResult {
    /// Create a requeue result.
    #[must_use]
    pub const fn requeue(after: Duration) -> Self {
        Self::Requeue { after }
    }

    /// Create an error result.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// Scheduling state of a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Queued,
    Running,
    /// Fatal error; leaves only through a new work item.
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Visible status of a resource; the only durable error surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub phase: Phase,
    /// Generation of the spec the last successful cycle converged to.
    pub observed_generation: Option<u64>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    /// Last time a cycle converged.
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ResourceStatus {
    /// Whether the last cycle left the resource failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self.phase, Phase::Failed)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::indexing_slicing)]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_key_display() {
        let key = ResourceKey::new("replicaset", "default", "web");
        assert_eq!(key.to_string(), "replicaset/default/web");
        assert_eq!(key.kind(), "replicaset");
    }

    #[test]
    fn test_replicated_spec() {
        let template = FieldMap::from([("image".to_string(), json!("nginx"))]);
        let spec = DesiredSpec::replicated(1, "r", 3, &template);

        let ids: Vec<_> = spec.children().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let spec = DesiredSpec::new(1)
            .with_child(ChildSpec::new("a"))
            .with_child(ChildSpec::new("a"));
        assert_eq!(
            spec.validate(),
            Err(SpecViolation::DuplicateChild(ChildId::from("a")))
        );
    }

    #[test]
    fn test_validate_rejects_missing_parent() {
        let spec = DesiredSpec::new(1).with_child(ChildSpec::new("a").with_parent("ghost"));
        assert!(matches!(
            spec.validate(),
            Err(SpecViolation::MissingParent { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_cycles() {
        let spec = DesiredSpec::new(1)
            .with_child(ChildSpec::new("a").with_parent("b"))
            .with_child(ChildSpec::new("b").with_parent("a"));
        assert!(matches!(spec.validate(), Err(SpecViolation::ParentCycle(_))));

        let selfish = DesiredSpec::new(1).with_child(ChildSpec::new("a").with_parent("a"));
        assert!(matches!(selfish.validate(), Err(SpecViolation::SelfParent(_))));
    }

    #[test]
    fn test_idempotency_key_depends_on_fields() {
        let a = ChildSpec::new("r1").with_field("image", json!("nginx:1"));
        let b = ChildSpec::new("r1").with_field("image", json!("nginx:2"));

        assert_eq!(
            Action::create(&a).idempotency_key(),
            Action::create(&a.clone()).idempotency_key()
        );
        assert_ne!(
            Action::create(&a).idempotency_key(),
            Action::create(&b).idempotency_key()
        );
        assert_eq!(Action::create(&a).idempotency_key().len(), 64);
    }

    #[test]
    fn test_action_satisfaction() {
        let spec = ChildSpec::new("r1").with_field("image", json!("nginx"));
        let observed = ObservedState::new(
            1,
            vec![ObservedChild {
                id: ChildId::from("r1"),
                parent: None,
                fields: FieldMap::from([
                    ("image".to_string(), json!("nginx")),
                    ("uid".to_string(), json!("01H")),
                ]),
            }],
        );

        assert!(Action::create(&spec).is_satisfied_by(Some(&observed)));
        assert!(!Action::create(&spec).is_satisfied_by(None));
        assert!(!Action::delete(&observed.children[0]).is_satisfied_by(Some(&observed)));
        assert!(Action::delete(&observed.children[0]).is_satisfied_by(None));
    }

    #[test]
    fn test_action_description() {
        let spec = ChildSpec::new("r1");
        assert!(Action::create(&spec).description().contains("create r1"));
    }
}
