//! Structural diff between desired and observed state.
//!
//! Pure: no I/O, no hidden state. Children are matched by [`ChildId`], never
//! by position, and only fields the desired spec declares are compared, so
//! system-managed fields on observed children never produce changes.

use std::collections::HashMap;

use itertools::Itertools;

use crate::types::{
    ChildId, ChildSpec, Delta, DeltaOp, DesiredSpec, FieldChange, ObservedChild, ObservedState,
};

/// Compute the delta that moves `observed` toward `desired`.
///
/// - `observed` absent: add every desired child.
/// - `desired` absent (deletion requested): remove every observed child.
///
/// Emitted order is adds (declaration order), then modifies (declaration
/// order), then removes (ascending child ID).
#[must_use]
pub fn diff(desired: Option<&DesiredSpec>, observed: Option<&ObservedState>) -> Delta {
    let observed_children: &[ObservedChild] = observed
        .map(|o| o.children.as_slice())
        .unwrap_or_default();
    let desired_children: &[ChildSpec] = desired.map(DesiredSpec::children).unwrap_or_default();

    let by_id: HashMap<&ChildId, &ObservedChild> =
        observed_children.iter().map(|c| (&c.id, c)).collect();

    let mut adds = Vec::new();
    let mut modifies = Vec::new();

    for child in desired_children {
        match by_id.get(&child.id) {
            None => adds.push(DeltaOp::Add(child.clone())),
            Some(current) => {
                let changes = field_changes(child, current);
                if !changes.is_empty() {
                    modifies.push(DeltaOp::Modify {
                        child: child.clone(),
                        changes,
                    });
                }
            }
        }
    }

    let removes = observed_children
        .iter()
        .filter(|c| !desired_children.iter().any(|d| d.id == c.id))
        .sorted_by(|a, b| a.id.cmp(&b.id))
        .map(|c| DeltaOp::Remove(c.clone()));

    Delta::new(adds.into_iter().chain(modifies).chain(removes).collect())
}

/// Declared fields whose observed value differs or is missing.
fn field_changes(desired: &ChildSpec, observed: &ObservedChild) -> Vec<FieldChange> {
    desired
        .fields
        .iter()
        .filter(|(name, value)| observed.fields.get(*name) != Some(*value))
        .map(|(name, value)| FieldChange {
            field: name.clone(),
            from: observed.fields.get(name).cloned(),
            to: value.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::indexing_slicing)]

    use super::*;
    use crate::types::FieldMap;
    use serde_json::json;

    fn observed_child(id: &str, fields: &[(&str, serde_json::Value)]) -> ObservedChild {
        ObservedChild {
            id: ChildId::from(id),
            parent: None,
            fields: fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        }
    }

    fn template() -> FieldMap {
        FieldMap::from([("image".to_string(), json!("nginx"))])
    }

    #[test]
    fn given_absent_observed_when_diff_then_add_everything() {
        let desired = DesiredSpec::replicated(1, "r", 2, &template());

        let delta = diff(Some(&desired), None);

        let added: Vec<_> = delta.adds().map(|c| c.id.as_str()).collect();
        assert_eq!(added, vec!["r1", "r2"]);
        assert_eq!(delta.len(), 2);
    }

    #[test]
    fn given_absent_desired_when_diff_then_remove_everything() {
        let observed = ObservedState::new(
            7,
            vec![observed_child("r2", &[]), observed_child("r1", &[])],
        );

        let delta = diff(None, Some(&observed));

        let removed: Vec<_> = delta.removes().map(|c| c.id.as_str()).collect();
        assert_eq!(removed, vec!["r1", "r2"]);
    }

    #[test]
    fn given_both_absent_when_diff_then_empty() {
        assert!(diff(None, None).is_empty());
    }

    #[test]
    fn given_replicas_three_and_one_observed_when_diff_then_add_two() {
        let desired = DesiredSpec::replicated(1, "r", 3, &template());
        let observed = ObservedState::new(1, vec![observed_child("r1", &[("image", json!("nginx"))])]);

        let delta = diff(Some(&desired), Some(&observed));

        let added: Vec<_> = delta.adds().map(|c| c.id.as_str()).collect();
        assert_eq!(added, vec!["r2", "r3"]);
        assert_eq!(delta.modifies().count(), 0);
        assert_eq!(delta.removes().count(), 0);
    }

    #[test]
    fn given_system_managed_fields_when_diff_then_ignored() {
        let desired = DesiredSpec::replicated(1, "r", 1, &template());
        let observed = ObservedState::new(
            1,
            vec![observed_child(
                "r1",
                &[("image", json!("nginx")), ("uid", json!("01HXYZ"))],
            )],
        );

        assert!(diff(Some(&desired), Some(&observed)).is_empty());
    }

    #[test]
    fn given_changed_field_when_diff_then_modify_with_field_change() {
        let desired = DesiredSpec::replicated(2, "r", 1, &template());
        let observed = ObservedState::new(1, vec![observed_child("r1", &[("image", json!("httpd"))])]);

        let delta = diff(Some(&desired), Some(&observed));

        let modifies: Vec<_> = delta.modifies().collect();
        assert_eq!(modifies.len(), 1);
        let (child, changes) = modifies[0];
        assert_eq!(child.id.as_str(), "r1");
        assert_eq!(
            changes,
            &[FieldChange {
                field: "image".to_string(),
                from: Some(json!("httpd")),
                to: json!("nginx"),
            }]
        );
    }

    #[test]
    fn given_reordered_children_when_diff_then_no_changes() {
        let desired = DesiredSpec::new(1)
            .with_child(ChildSpec::new("b"))
            .with_child(ChildSpec::new("a"));
        let observed = ObservedState::new(1, vec![observed_child("a", &[]), observed_child("b", &[])]);

        assert!(diff(Some(&desired), Some(&observed)).is_empty());
    }

    #[test]
    fn given_same_inputs_when_diff_twice_then_identical() {
        let desired = DesiredSpec::replicated(1, "r", 4, &template());
        let observed = ObservedState::new(
            3,
            vec![observed_child("r9", &[]), observed_child("r2", &[("image", json!("x"))])],
        );

        assert_eq!(
            diff(Some(&desired), Some(&observed)),
            diff(Some(&desired), Some(&observed))
        );
    }
}
