//! Turns a delta into an ordered list of idempotent actions.
//!
//! Order within a plan:
//!
//! 1. Creates, parents before children.
//! 2. Updates.
//! 3. Deletes, children before parents.
//!
//! Where no dependency relates two actions, ascending child ID breaks the tie.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use itertools::Itertools;

use crate::types::{Action, ChildId, Delta};

/// Which end of a parent/child edge goes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ParentsFirst,
    ChildrenFirst,
}

/// Build the ordered action list for `delta`.
///
/// Never fails: a parent cycle (rejected earlier by validation) degrades to
/// ascending ID order for the nodes involved.
#[must_use]
pub fn plan(delta: &Delta) -> Vec<Action> {
    let creates: HashMap<ChildId, Action> = delta
        .adds()
        .map(|spec| (spec.id.clone(), Action::create(spec)))
        .collect();
    let create_edges = delta
        .adds()
        .map(|spec| (spec.id.clone(), spec.parent.clone()))
        .collect_vec();

    let updates = delta
        .modifies()
        .map(|(spec, changes)| Action::update(spec, changes))
        .sorted_by(|a, b| a.child.cmp(&b.child));

    let deletes: HashMap<ChildId, Action> = delta
        .removes()
        .map(|child| (child.id.clone(), Action::delete(child)))
        .collect();
    let delete_edges = delta
        .removes()
        .map(|child| (child.id.clone(), child.parent.clone()))
        .collect_vec();

    let mut plan = Vec::with_capacity(delta.len());
    plan.extend(take_in_order(
        creates,
        dependency_order(&create_edges, Direction::ParentsFirst),
    ));
    plan.extend(updates);
    plan.extend(take_in_order(
        deletes,
        dependency_order(&delete_edges, Direction::ChildrenFirst),
    ));
    plan
}

fn take_in_order(mut actions: HashMap<ChildId, Action>, order: Vec<ChildId>) -> Vec<Action> {
    order
        .into_iter()
        .filter_map(|id| actions.remove(&id))
        .collect()
}

/// Kahn's algorithm with a min-heap on child ID.
///
/// Only edges whose both ends are in `nodes` constrain the order; a parent
/// that already exists (or is not being removed) imposes nothing.
fn dependency_order(nodes: &[(ChildId, Option<ChildId>)], direction: Direction) -> Vec<ChildId> {
    let members: BTreeSet<&ChildId> = nodes.iter().map(|(id, _)| id).collect();

    let mut blockers: HashMap<&ChildId, usize> = members.iter().map(|id| (*id, 0)).collect();
    let mut unblocks: HashMap<&ChildId, Vec<&ChildId>> = HashMap::new();

    for (id, parent) in nodes {
        let Some(parent) = parent.as_ref().filter(|p| members.contains(p) && *p != id) else {
            continue;
        };
        let (before, after) = match direction {
            Direction::ParentsFirst => (parent, id),
            Direction::ChildrenFirst => (id, parent),
        };
        unblocks.entry(before).or_default().push(after);
        if let Some(count) = blockers.get_mut(after) {
            *count = count.saturating_add(1);
        }
    }

    let mut ready: BinaryHeap<Reverse<&ChildId>> = blockers
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();

    let mut order = Vec::with_capacity(members.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id.clone());
        for next in unblocks.get(id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(count) = blockers.get_mut(next) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push(Reverse(*next));
                }
            }
        }
    }

    if order.len() < members.len() {
        let leftovers = members
            .into_iter()
            .filter(|id| !order.contains(*id))
            .cloned()
            .collect_vec();
        order.extend(leftovers);
    }

    order
}
