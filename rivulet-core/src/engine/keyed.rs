//! Keyed Subgraphs
//!
//! Per-key node families driven by a key list. A group occupies one
//! position in the topology; its instances are value-store slots addressed
//! by `(group, key)`, created and destroyed as keys come and go.
//!
//! # How a Group Is Visited
//!
//! 1. The group's key list settled earlier in the walk (it is a dependency
//!    of the group). Its new membership is diffed against the committed
//!    membership: removed keys mark their instance slots for destruction,
//!    and the new key order is buffered as the group's membership update.
//!
//! 2. Instances are visited in new key order. An instance recomputes only
//!    if it has never computed (just added, or blocked on a dependency) or
//!    one of its resolved direct dependencies changed this pass. Membership
//!    churn alone recomputes nothing: adding an unrelated key or reordering
//!    the list leaves surviving instances untouched.
//!
//! 3. The group's full output is rebuilt whenever the key list changed
//!    (membership, order, or recovery from a failed computed list) or any
//!    instance value changed: the per-key values in new key order. It is
//!    failed (with every instance failure merged) while any instance is
//!    failed, and withheld while any instance is still unset.
//!
//! Same-key dependencies resolve to the instance of the upstream group for
//! exactly this key; the upstream group is always earlier in the topology
//! and driven by the same key list, so the slot is settled and lives and
//! dies with the same key.

use smallvec::SmallVec;
use tracing::trace;

use crate::engine::pass::RunState;
use crate::graph::{GroupDep, GroupId, GroupRecord, Target};
use crate::value::{Key, KeyList, KeyedValues, NodeFailure, Payload, ValueSlot};

/// Visit one keyed group during a pass: diff membership, evaluate
/// instances, and rebuild the full output.
pub(crate) fn visit_group(run: &mut RunState<'_>, group: GroupId) {
    let topology = run.topology;
    let record = topology.group(group);
    let full_target = Target::FullOutput(group);

    let list_slot = run.lookup(&Target::Node(record.key_list));
    let new_keys = match &list_slot {
        // The key list has not computed yet; there is nothing to key over.
        ValueSlot::Unset => return,
        // A failed computed key list makes the membership unknowable. The
        // failure surfaces on the full output; existing instances keep
        // their last values. Re-recorded only when the failure is fresh,
        // so a visit triggered by an unrelated dependency does not emit a
        // duplicate event.
        ValueSlot::Failed { failure, .. } => {
            if run.changed.contains(&Target::Node(record.key_list))
                || !run.lookup(&full_target).is_failed()
            {
                let stamp = run.stamp();
                run.record(
                    full_target,
                    ValueSlot::Failed {
                        failure: failure.clone(),
                        timestamp: stamp,
                    },
                );
            }
            return;
        }
        ValueSlot::Ok { value, .. } => value
            .downcast_ref::<KeyList>()
            .cloned()
            .expect("key-list node holds a KeyList payload"),
    };

    let old_keys = run.membership(group);
    let membership_changed = old_keys != new_keys;
    if membership_changed {
        for key in old_keys.iter() {
            if !new_keys.contains(key) {
                trace!(group = %record.name, key = ?key, "destroying keyed instance");
                run.delta.removals.push(Target::Instance(group, key.clone()));
            }
        }
        run.delta.memberships.insert(group, new_keys.clone());
    }

    let mut any_instance_changed = false;
    for key in new_keys.iter() {
        let target = Target::Instance(group, key.clone());
        let deps = resolve_deps(record, key);
        let current = run.lookup(&target);
        let stale = current.is_unset() || deps.iter().any(|dep| run.changed.contains(dep));
        if !stale {
            continue;
        }
        if let Some(slot) = run.evaluate(
            &target,
            &deps,
            &record.compute,
            record.catch.as_ref(),
            &record.equals,
            Some(key),
        ) {
            run.record(target, slot);
            any_instance_changed = true;
        }
    }

    // The list node changing covers recovery of a failed computed list,
    // where the membership itself may be identical.
    let rebuild = membership_changed
        || any_instance_changed
        || run.changed.contains(&Target::Node(record.key_list))
        || run.lookup(&full_target).is_unset();
    if !rebuild {
        return;
    }

    let mut entries = Vec::with_capacity(new_keys.len());
    let mut failures: Vec<NodeFailure> = Vec::new();
    for key in new_keys.iter() {
        match run.lookup(&Target::Instance(group, key.clone())) {
            // Some instance is still blocked on an unset dependency; the
            // aggregate is not representable yet.
            ValueSlot::Unset => return,
            ValueSlot::Failed { failure, .. } => failures.push(failure),
            ValueSlot::Ok { value, .. } => entries.push((key.clone(), value)),
        }
    }

    let stamp = run.stamp();
    let slot = if failures.is_empty() {
        ValueSlot::Ok {
            value: Payload::new(KeyedValues::new(entries)),
            timestamp: stamp,
        }
    } else {
        ValueSlot::Failed {
            failure: NodeFailure::merged(failures.iter()),
            timestamp: stamp,
        }
    };
    run.record(full_target, slot);
}

/// Resolve a group's declared dependencies for one key.
fn resolve_deps(record: &GroupRecord, key: &Key) -> SmallVec<[Target; 4]> {
    record
        .deps
        .iter()
        .map(|dep| match dep {
            GroupDep::Static(target) => target.clone(),
            GroupDep::SameKey(other) => Target::Instance(*other, key.clone()),
        })
        .collect()
}
