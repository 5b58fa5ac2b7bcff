//! Recompute Pass
//!
//! One synchronous pass: validate a transaction, walk the dirty region of
//! the topology, and buffer every resulting write for an atomic commit.
//!
//! # How a Pass Works
//!
//! 1. [`resolve_batch`] validates the whole transaction against the
//!    topology and the committed store. Unknown nodes, non-input targets,
//!    and type mismatches reject the batch with nothing mutated. Key edits
//!    (add/remove) resolve to whole key-list payloads here, against the
//!    current state, so the rest of the pass only sees plain values.
//!
//! 2. [`execute`] filters the resolved inputs through each input's declared
//!    equality (setting an input to an equal value is a no-op), seeds the
//!    dirty set with the survivors plus any nodes declared since the last
//!    pass, and takes its transitive dependent closure.
//!
//! 3. The walk visits closure members in declaration order, which is a
//!    topological order. A visited node recomputes only if it has never
//!    computed or one of its direct dependencies changed value this pass;
//!    otherwise it is skipped and its dependents see no change. Equal
//!    recomputed values are discarded (the slot keeps its old timestamp),
//!    so change waves die out as early as possible.
//!
//! 4. Failures travel as values: a failed dependency short-circuits the
//!    dependent into the merged upstream failure (or through its catch
//!    function), and a compute error becomes a failure originating at the
//!    node itself. Failure transitions always count as changes.
//!
//! 5. Every write lands in a [`StoreDelta`]; nothing is visible to readers
//!    until the caller commits it. A panicking compute function unwinds
//!    through `execute`, the delta is dropped, and the store is untouched.

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace, warn};

use crate::engine::keyed;
use crate::engine::store::{Store, StoreDelta};
use crate::error::EngineError;
use crate::graph::{
    CatchFn, ComputeFn, EngineId, EqualityFn, NodeId, NodeRef, Target, TopoEntry, Topology,
};
use crate::value::{Inputs, Key, KeyList, NodeFailure, Payload, Timestamp, ValueSlot};

/// One entry of a transaction before resolution.
pub(crate) enum InputChange {
    /// Replace the input's value (for key lists: the whole list).
    Set(Payload),
    /// Append one key to a key-list input; a no-op if already present.
    AddKey(Key),
    /// Remove one key from a key-list input; a no-op if absent.
    RemoveKey(Key),
}

/// A validated, resolved input write.
pub(crate) struct PassInput {
    pub(crate) node: NodeId,
    pub(crate) payload: Payload,
}

/// Everything one pass wants to commit.
pub(crate) struct PassOutcome {
    /// Buffered slot writes, removals, and membership updates.
    pub(crate) delta: StoreDelta,
    /// Targets whose value changed, in walk order. Every entry has a slot
    /// in `delta.writes`.
    pub(crate) changed: IndexSet<Target>,
    /// The clock after this pass: bumped when anything changed, otherwise
    /// the pre-pass clock.
    pub(crate) clock: Timestamp,
}

/// Validate a transaction and resolve key edits to whole-list payloads.
///
/// The batch applies in order: a later entry for the same node sees the
/// effect of an earlier one, so add-then-remove nets out to a removal.
/// Any invalid entry rejects the entire batch.
pub(crate) fn resolve_batch(
    topology: &Topology,
    store: &Store,
    engine: EngineId,
    batch: Vec<(NodeRef, InputChange)>,
) -> Result<Vec<PassInput>, EngineError> {
    let mut resolved: IndexMap<NodeId, Payload> = IndexMap::new();

    for (node_ref, change) in batch {
        if node_ref.engine != engine {
            return Err(EngineError::UnknownNode {
                name: format!("{node_ref:?} (declared by a different engine)"),
            });
        }
        let id = match node_ref.target {
            Target::Node(id) => id,
            ref other => {
                return Err(EngineError::NotAnInput {
                    name: topology.label(other),
                })
            }
        };
        let record = topology.get_node(id).ok_or_else(|| EngineError::UnknownNode {
            name: format!("{node_ref:?}"),
        })?;
        if !record.kind.is_input() {
            return Err(EngineError::NotAnInput {
                name: record.name.clone(),
            });
        }

        match change {
            InputChange::Set(payload) => {
                if !record.payload_type.matches(&payload) {
                    return Err(EngineError::PayloadType {
                        node: record.name.clone(),
                        expected: record.payload_type.name,
                        found: payload.type_name(),
                    });
                }
                if let Some(keys) = payload.downcast_ref::<KeyList>() {
                    check_key_types(record, keys)?;
                }
                resolved.insert(id, payload);
            }
            InputChange::AddKey(_) | InputChange::RemoveKey(_)
                if !record.kind.is_key_list() =>
            {
                return Err(EngineError::NotAKeyList {
                    name: record.name.clone(),
                });
            }
            InputChange::AddKey(key) => {
                check_key_type(record, &key)?;
                let keys = current_keys(store, &resolved, id).with_added(key);
                resolved.insert(id, Payload::new(keys));
            }
            InputChange::RemoveKey(key) => {
                check_key_type(record, &key)?;
                let keys = current_keys(store, &resolved, id).with_removed(&key);
                resolved.insert(id, Payload::new(keys));
            }
        }
    }

    Ok(resolved
        .into_iter()
        .map(|(node, payload)| PassInput { node, payload })
        .collect())
}

fn check_key_types(
    record: &crate::graph::NodeRecord,
    keys: &KeyList,
) -> Result<(), EngineError> {
    for key in keys.iter() {
        check_key_type(record, key)?;
    }
    Ok(())
}

fn check_key_type(record: &crate::graph::NodeRecord, key: &Key) -> Result<(), EngineError> {
    let declared = match &record.key_type {
        Some(declared) => declared,
        None => return Ok(()),
    };
    if declared.matches_key(key) {
        Ok(())
    } else {
        Err(EngineError::KeyType {
            node: record.name.clone(),
            key: format!("{key:?}"),
            expected: declared.name,
            found: key.type_name_of(),
        })
    }
}

/// The key list an edit applies to: earlier in this batch, else committed,
/// else empty.
fn current_keys(store: &Store, resolved: &IndexMap<NodeId, Payload>, id: NodeId) -> KeyList {
    let payload = resolved
        .get(&id)
        .cloned()
        .or_else(|| store.lookup(&Target::Node(id)).value().cloned());
    payload
        .and_then(|p| p.downcast_ref::<KeyList>().cloned())
        .unwrap_or_default()
}

/// Mutable state threaded through one walk.
pub(crate) struct RunState<'a> {
    pub(crate) topology: &'a Topology,
    store: &'a Store,
    pub(crate) delta: StoreDelta,
    pub(crate) changed: IndexSet<Target>,
    stamp: Timestamp,
}

impl<'a> RunState<'a> {
    /// The slot a dependent sees mid-pass: this pass's write if there is
    /// one, the committed slot otherwise.
    pub(crate) fn lookup(&self, target: &Target) -> ValueSlot {
        match self.delta.writes.get(target) {
            Some(slot) => slot.clone(),
            None => self.store.lookup(target),
        }
    }

    /// Group membership a dependent sees mid-pass.
    pub(crate) fn membership(&self, group: crate::graph::GroupId) -> KeyList {
        match self.delta.memberships.get(&group) {
            Some(keys) => keys.clone(),
            None => self.store.membership(group),
        }
    }

    pub(crate) fn stamp(&self) -> Timestamp {
        self.stamp
    }

    /// Record one changed slot.
    pub(crate) fn record(&mut self, target: Target, slot: ValueSlot) {
        self.changed.insert(target.clone());
        self.delta.writes.insert(target, slot);
    }

    /// Run one node-or-instance evaluation. Returns the new slot when the
    /// value actually changed, `None` when the evaluation is skipped (a
    /// dependency has no value yet) or cut off (equal result).
    pub(crate) fn evaluate(
        &self,
        target: &Target,
        deps: &[Target],
        compute: &ComputeFn,
        catch: Option<&CatchFn>,
        equals: &EqualityFn,
        key: Option<&Key>,
    ) -> Option<ValueSlot> {
        let current = self.lookup(target);

        let mut dep_slots = Vec::with_capacity(deps.len());
        for dep in deps {
            let slot = self.lookup(dep);
            if slot.is_unset() {
                return None;
            }
            dep_slots.push(slot);
        }

        let failed: Vec<&NodeFailure> = dep_slots.iter().filter_map(|s| s.failure()).collect();
        let produced = if failed.is_empty() {
            trace!(node = %self.topology.label(target), "recomputing");
            let payloads: Vec<Payload> = dep_slots
                .iter()
                .filter_map(|s| s.value().cloned())
                .collect();
            compute(&Inputs::new(&payloads, key))
        } else {
            let merged = NodeFailure::merged(failed);
            match catch {
                Some(catch_fn) => catch_fn(&merged),
                None => {
                    return Some(ValueSlot::Failed {
                        failure: merged,
                        timestamp: self.stamp,
                    })
                }
            }
        };

        match produced {
            Ok(value) => {
                if let ValueSlot::Ok { value: old, .. } = &current {
                    if (equals)(old, &value) {
                        return None;
                    }
                }
                Some(ValueSlot::Ok {
                    value,
                    timestamp: self.stamp,
                })
            }
            Err(error) => {
                let label = self.topology.label(target);
                warn!(node = %label, error = %error, "compute function failed");
                Some(ValueSlot::Failed {
                    failure: NodeFailure::from_error(label, error),
                    timestamp: self.stamp,
                })
            }
        }
    }
}

/// Walk the dirty region and buffer every write.
pub(crate) fn execute(
    topology: &Topology,
    store: &Store,
    inputs: Vec<PassInput>,
    pending: &IndexSet<TopoEntry>,
) -> PassOutcome {
    // Input-level cutoff: writes equal to the committed value change nothing.
    let mut changed_inputs: IndexMap<NodeId, Payload> = IndexMap::new();
    for input in inputs {
        let record = topology.node(input.node);
        let keep = match store.slot(&Target::Node(input.node)) {
            Some(ValueSlot::Ok { value, .. }) => !(record.equals)(value, &input.payload),
            _ => true,
        };
        if keep {
            changed_inputs.insert(input.node, input.payload);
        }
    }

    let roots: IndexSet<TopoEntry> = changed_inputs
        .keys()
        .map(|&id| TopoEntry::Node(id))
        .chain(pending.iter().copied())
        .collect();
    if roots.is_empty() {
        return PassOutcome {
            delta: StoreDelta::default(),
            changed: IndexSet::new(),
            clock: store.now(),
        };
    }

    let closure = topology.dirty_closure(roots.iter().copied());
    debug!(
        inputs = changed_inputs.len(),
        pending = pending.len(),
        dirty = closure.len(),
        "starting recompute pass"
    );

    let mut run = RunState {
        topology,
        store,
        delta: StoreDelta::default(),
        changed: IndexSet::new(),
        stamp: store.now().next(),
    };

    for entry in topology.entries() {
        if !closure.contains(entry) {
            continue;
        }
        match *entry {
            TopoEntry::Node(id) => {
                let record = topology.node(id);
                if record.kind.is_input() {
                    if let Some(payload) = changed_inputs.get(&id) {
                        let stamp = run.stamp();
                        run.record(
                            Target::Node(id),
                            ValueSlot::Ok {
                                value: payload.clone(),
                                timestamp: stamp,
                            },
                        );
                    }
                    continue;
                }
                let target = Target::Node(id);
                let current = run.lookup(&target);
                let stale = current.is_unset()
                    || record.deps.iter().any(|dep| run.changed.contains(dep));
                if !stale {
                    continue;
                }
                let compute = record
                    .compute
                    .as_ref()
                    .expect("computed node carries a compute function");
                if let Some(slot) = run.evaluate(
                    &target,
                    &record.deps,
                    compute,
                    record.catch.as_ref(),
                    &record.equals,
                    None,
                ) {
                    run.record(target, slot);
                }
            }
            TopoEntry::Group(id) => keyed::visit_group(&mut run, id),
        }
    }

    let clock = if run.changed.is_empty() {
        store.now()
    } else {
        run.stamp
    };
    debug!(
        changed = run.changed.len(),
        clock = clock.raw(),
        "recompute pass finished"
    );
    PassOutcome {
        delta: run.delta,
        changed: run.changed,
        clock,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DeclaredType, GroupRecord, NodeKind, NodeRecord};
    use smallvec::SmallVec;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    fn eq_i64() -> EqualityFn {
        Arc::new(|a: &Payload, b: &Payload| a.downcast_ref::<i64>() == b.downcast_ref::<i64>())
    }

    fn input(name: &str) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            kind: NodeKind::Input,
            deps: SmallVec::new(),
            compute: None,
            catch: None,
            equals: eq_i64(),
            payload_type: DeclaredType::of::<i64>(),
            key_type: None,
        }
    }

    fn doubler(name: &str, dep: NodeId, counter: Arc<AtomicI32>) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            kind: NodeKind::Computed,
            deps: [Target::Node(dep)].into_iter().collect(),
            compute: Some(Arc::new(move |inputs: &Inputs<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::new(inputs.get::<i64>(0)? * 2))
            })),
            catch: None,
            equals: eq_i64(),
            payload_type: DeclaredType::of::<i64>(),
            key_type: None,
        }
    }

    fn set(engine: EngineId, node: NodeId, value: i64) -> (NodeRef, InputChange) {
        (
            NodeRef {
                engine,
                target: Target::Node(node),
            },
            InputChange::Set(Payload::new(value)),
        )
    }

    fn commit(store: &mut Store, outcome: PassOutcome) {
        store.apply(outcome.delta, outcome.clock);
    }

    #[test]
    fn batch_validation_rejects_everything_or_nothing() {
        let engine = EngineId::new();
        let mut topo = Topology::new();
        let a = topo.declare_node(input("a")).unwrap();
        let counter = Arc::new(AtomicI32::new(0));
        let b = topo.declare_node(doubler("b", a, counter)).unwrap();
        let store = Store::new();

        // Wrong payload type.
        let batch = vec![(
            NodeRef {
                engine,
                target: Target::Node(a),
            },
            InputChange::Set(Payload::new("nope".to_string())),
        )];
        assert!(matches!(
            resolve_batch(&topo, &store, engine, batch),
            Err(EngineError::PayloadType { .. })
        ));

        // Computed target.
        let batch = vec![set(engine, b, 1)];
        assert!(matches!(
            resolve_batch(&topo, &store, engine, batch),
            Err(EngineError::NotAnInput { .. })
        ));

        // Foreign engine.
        let batch = vec![set(EngineId::new(), a, 1)];
        assert!(matches!(
            resolve_batch(&topo, &store, engine, batch),
            Err(EngineError::UnknownNode { .. })
        ));

        // A valid entry followed by an invalid one resolves to nothing.
        let batch = vec![set(engine, a, 1), set(engine, b, 2)];
        assert!(resolve_batch(&topo, &store, engine, batch).is_err());
    }

    #[test]
    fn key_edits_resolve_in_batch_order() {
        let engine = EngineId::new();
        let mut topo = Topology::new();
        let keys = topo
            .declare_node(NodeRecord {
                name: "keys".to_string(),
                kind: NodeKind::KeyListInput,
                deps: SmallVec::new(),
                compute: None,
                catch: None,
                equals: Arc::new(|a: &Payload, b: &Payload| {
                    a.downcast_ref::<KeyList>() == b.downcast_ref::<KeyList>()
                }),
                payload_type: DeclaredType::of::<KeyList>(),
                key_type: Some(DeclaredType::of::<String>()),
            })
            .unwrap();
        let mut store = Store::new();
        store.seed_key_list(keys);

        let node_ref = NodeRef {
            engine,
            target: Target::Node(keys),
        };
        let batch = vec![
            (
                node_ref.clone(),
                InputChange::AddKey(Key::new("a".to_string())),
            ),
            (
                node_ref.clone(),
                InputChange::AddKey(Key::new("b".to_string())),
            ),
            (node_ref, InputChange::RemoveKey(Key::new("a".to_string()))),
        ];
        let resolved = resolve_batch(&topo, &store, engine, batch).unwrap();
        assert_eq!(resolved.len(), 1);
        let list = resolved[0]
            .payload
            .downcast_ref::<KeyList>()
            .unwrap()
            .clone();
        assert_eq!(list.keys::<String>().unwrap(), vec!["b".to_string()]);

        // Key of the wrong type is rejected.
        let node_ref = NodeRef {
            engine,
            target: Target::Node(keys),
        };
        let batch = vec![(node_ref, InputChange::AddKey(Key::new(7i64)))];
        assert!(matches!(
            resolve_batch(&topo, &store, engine, batch),
            Err(EngineError::KeyType { .. })
        ));
    }

    #[test]
    fn equal_input_writes_cut_off_before_the_walk() {
        let mut topo = Topology::new();
        let a = topo.declare_node(input("a")).unwrap();
        let counter = Arc::new(AtomicI32::new(0));
        let b = topo.declare_node(doubler("b", a, counter.clone())).unwrap();
        let mut store = Store::new();

        let pending: IndexSet<TopoEntry> = [TopoEntry::Node(b)].into_iter().collect();
        let outcome = execute(
            &topo,
            &store,
            vec![PassInput {
                node: a,
                payload: Payload::new(5i64),
            }],
            &pending,
        );
        assert_eq!(outcome.clock, Timestamp(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        commit(&mut store, outcome);

        // Same value again: no roots, no walk, clock untouched.
        let outcome = execute(
            &topo,
            &store,
            vec![PassInput {
                node: a,
                payload: Payload::new(5i64),
            }],
            &IndexSet::new(),
        );
        assert!(outcome.changed.is_empty());
        assert_eq!(outcome.clock, Timestamp(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn computed_cutoff_stops_the_wave_and_keeps_old_timestamps() {
        let mut topo = Topology::new();
        let a = topo.declare_node(input("a")).unwrap();
        // b = |a|, c = b * 2: flipping a's sign changes nothing downstream.
        let b = topo
            .declare_node(NodeRecord {
                name: "b".to_string(),
                kind: NodeKind::Computed,
                deps: [Target::Node(a)].into_iter().collect(),
                compute: Some(Arc::new(|inputs: &Inputs<'_>| {
                    Ok(Payload::new(inputs.get::<i64>(0)?.abs()))
                })),
                catch: None,
                equals: eq_i64(),
                payload_type: DeclaredType::of::<i64>(),
                key_type: None,
            })
            .unwrap();
        let c_counter = Arc::new(AtomicI32::new(0));
        let c = topo
            .declare_node(doubler("c", b, c_counter.clone()))
            .unwrap();
        let mut store = Store::new();

        let pending: IndexSet<TopoEntry> =
            [TopoEntry::Node(b), TopoEntry::Node(c)].into_iter().collect();
        let outcome = execute(
            &topo,
            &store,
            vec![PassInput {
                node: a,
                payload: Payload::new(4i64),
            }],
            &pending,
        );
        commit(&mut store, outcome);
        assert_eq!(c_counter.load(Ordering::SeqCst), 1);

        let outcome = execute(
            &topo,
            &store,
            vec![PassInput {
                node: a,
                payload: Payload::new(-4i64),
            }],
            &IndexSet::new(),
        );
        // a changed, b recomputed to an equal value, c never ran.
        assert!(outcome.changed.contains(&Target::Node(a)));
        assert!(!outcome.changed.contains(&Target::Node(b)));
        assert_eq!(c_counter.load(Ordering::SeqCst), 1);
        let clock = outcome.clock;
        commit(&mut store, outcome);

        // b and c keep the timestamp of the pass that last changed them.
        let slot_b = store.lookup(&Target::Node(b));
        assert_eq!(slot_b.timestamp(), Some(Timestamp(1)));
        let slot_a = store.lookup(&Target::Node(a));
        assert_eq!(slot_a.timestamp(), Some(clock));
    }

    #[test]
    fn failures_propagate_merged_and_catch_functions_intercept() {
        let mut topo = Topology::new();
        let a = topo.declare_node(input("a")).unwrap();
        let fail_a = topo
            .declare_node(NodeRecord {
                name: "fail_a".to_string(),
                kind: NodeKind::Computed,
                deps: [Target::Node(a)].into_iter().collect(),
                compute: Some(Arc::new(|_| anyhow::bail!("a is cursed"))),
                catch: None,
                equals: eq_i64(),
                payload_type: DeclaredType::of::<i64>(),
                key_type: None,
            })
            .unwrap();
        let fail_b = topo
            .declare_node(NodeRecord {
                name: "fail_b".to_string(),
                kind: NodeKind::Computed,
                deps: [Target::Node(a)].into_iter().collect(),
                compute: Some(Arc::new(|_| anyhow::bail!("b is cursed"))),
                catch: None,
                equals: eq_i64(),
                payload_type: DeclaredType::of::<i64>(),
                key_type: None,
            })
            .unwrap();
        let merge = topo
            .declare_node(NodeRecord {
                name: "merge".to_string(),
                kind: NodeKind::Computed,
                deps: [Target::Node(fail_a), Target::Node(fail_b)]
                    .into_iter()
                    .collect(),
                compute: Some(Arc::new(|_| Ok(Payload::new(0i64)))),
                catch: None,
                equals: eq_i64(),
                payload_type: DeclaredType::of::<i64>(),
                key_type: None,
            })
            .unwrap();
        let caught = topo
            .declare_node(NodeRecord {
                name: "caught".to_string(),
                kind: NodeKind::Computed,
                deps: [Target::Node(merge)].into_iter().collect(),
                compute: Some(Arc::new(|inputs: &Inputs<'_>| {
                    Ok(Payload::new(*inputs.get::<i64>(0)?))
                })),
                catch: Some(Arc::new(|failure: &NodeFailure| {
                    Ok(Payload::new(-(failure.sources().len() as i64)))
                })),
                equals: eq_i64(),
                payload_type: DeclaredType::of::<i64>(),
                key_type: None,
            })
            .unwrap();
        let mut store = Store::new();

        let pending: IndexSet<TopoEntry> = [
            TopoEntry::Node(fail_a),
            TopoEntry::Node(fail_b),
            TopoEntry::Node(merge),
            TopoEntry::Node(caught),
        ]
        .into_iter()
        .collect();
        let outcome = execute(
            &topo,
            &store,
            vec![PassInput {
                node: a,
                payload: Payload::new(1i64),
            }],
            &pending,
        );
        commit(&mut store, outcome);

        // merge is failed with both origins, deduplicated.
        let slot = store.lookup(&Target::Node(merge));
        let failure = slot.failure().unwrap();
        let origins: Vec<&str> = failure.sources().iter().map(|s| s.node.as_str()).collect();
        assert_eq!(origins, vec!["fail_a", "fail_b"]);

        // caught turned the merged failure into a value.
        let slot = store.lookup(&Target::Node(caught));
        assert_eq!(slot.value().unwrap().downcast_ref::<i64>(), Some(&-2i64));
    }

    #[test]
    fn unset_dependencies_defer_computation_without_error() {
        let mut topo = Topology::new();
        let a = topo.declare_node(input("a")).unwrap();
        let b = topo.declare_node(input("b")).unwrap();
        let counter = Arc::new(AtomicI32::new(0));
        let counter_in_sum = counter.clone();
        let sum = topo
            .declare_node(NodeRecord {
                name: "sum".to_string(),
                kind: NodeKind::Computed,
                deps: [Target::Node(a), Target::Node(b)].into_iter().collect(),
                compute: Some(Arc::new(move |inputs: &Inputs<'_>| {
                    counter_in_sum.fetch_add(1, Ordering::SeqCst);
                    Ok(Payload::new(inputs.get::<i64>(0)? + inputs.get::<i64>(1)?))
                })),
                catch: None,
                equals: eq_i64(),
                payload_type: DeclaredType::of::<i64>(),
                key_type: None,
            })
            .unwrap();
        let mut store = Store::new();

        let pending: IndexSet<TopoEntry> = [TopoEntry::Node(sum)].into_iter().collect();
        let outcome = execute(
            &topo,
            &store,
            vec![PassInput {
                node: a,
                payload: Payload::new(1i64),
            }],
            &pending,
        );
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(store.lookup(&Target::Node(sum)).is_unset());
        commit(&mut store, outcome);

        let outcome = execute(
            &topo,
            &store,
            vec![PassInput {
                node: b,
                payload: Payload::new(2i64),
            }],
            &IndexSet::new(),
        );
        commit(&mut store, outcome);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let slot = store.lookup(&Target::Node(sum));
        assert_eq!(slot.value().unwrap().downcast_ref::<i64>(), Some(&3i64));
    }

    #[test]
    fn empty_transaction_computes_only_newly_declared_nodes() {
        let mut topo = Topology::new();
        let a = topo.declare_node(input("a")).unwrap();
        let mut store = Store::new();

        let outcome = execute(
            &topo,
            &store,
            vec![PassInput {
                node: a,
                payload: Payload::new(10i64),
            }],
            &IndexSet::new(),
        );
        commit(&mut store, outcome);

        // Declared after data already flowed.
        let counter = Arc::new(AtomicI32::new(0));
        let late = topo.declare_node(doubler("late", a, counter.clone())).unwrap();
        let pending: IndexSet<TopoEntry> = [TopoEntry::Node(late)].into_iter().collect();
        let outcome = execute(&topo, &store, Vec::new(), &pending);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        commit(&mut store, outcome);
        let slot = store.lookup(&Target::Node(late));
        assert_eq!(slot.value().unwrap().downcast_ref::<i64>(), Some(&20i64));
    }

    #[test]
    fn keyed_groups_compute_per_key_and_aggregate_in_order() {
        let mut topo = Topology::new();
        let keys = topo
            .declare_node(NodeRecord {
                name: "files".to_string(),
                kind: NodeKind::KeyListInput,
                deps: SmallVec::new(),
                compute: None,
                catch: None,
                equals: Arc::new(|a: &Payload, b: &Payload| {
                    a.downcast_ref::<KeyList>() == b.downcast_ref::<KeyList>()
                }),
                payload_type: DeclaredType::of::<KeyList>(),
                key_type: Some(DeclaredType::of::<String>()),
            })
            .unwrap();
        let counter = Arc::new(AtomicI32::new(0));
        let counter_in_len = counter.clone();
        let lengths = topo
            .declare_group(GroupRecord {
                name: "lengths".to_string(),
                key_list: keys,
                deps: SmallVec::new(),
                compute: Arc::new(move |inputs: &Inputs<'_>| {
                    counter_in_len.fetch_add(1, Ordering::SeqCst);
                    Ok(Payload::new(inputs.key::<String>()?.len() as i64))
                }),
                catch: None,
                equals: eq_i64(),
            })
            .unwrap();
        let mut store = Store::new();
        store.seed_key_list(keys);

        let pending: IndexSet<TopoEntry> = [TopoEntry::Group(lengths)].into_iter().collect();
        let outcome = execute(
            &topo,
            &store,
            vec![PassInput {
                node: keys,
                payload: Payload::new(KeyList::from_keys(["ab".to_string(), "c".to_string()])),
            }],
            &pending,
        );
        commit(&mut store, outcome);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let full = store.lookup(&Target::FullOutput(lengths));
        let values = full
            .value()
            .unwrap()
            .downcast_ref::<crate::value::KeyedValues>()
            .unwrap()
            .values::<i64>()
            .unwrap();
        assert_eq!(values, vec![2, 1]);

        // Reordering the list recomputes nothing but rebuilds the aggregate.
        let outcome = execute(
            &topo,
            &store,
            vec![PassInput {
                node: keys,
                payload: Payload::new(KeyList::from_keys(["c".to_string(), "ab".to_string()])),
            }],
            &IndexSet::new(),
        );
        assert!(outcome.changed.contains(&Target::FullOutput(lengths)));
        commit(&mut store, outcome);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        let full = store.lookup(&Target::FullOutput(lengths));
        let values = full
            .value()
            .unwrap()
            .downcast_ref::<crate::value::KeyedValues>()
            .unwrap()
            .values::<i64>()
            .unwrap();
        assert_eq!(values, vec![1, 2]);

        // Removing a key destroys its instance slot.
        let instance = Target::Instance(lengths, Key::new("ab".to_string()));
        assert!(store.slot(&instance).is_some());
        let outcome = execute(
            &topo,
            &store,
            vec![PassInput {
                node: keys,
                payload: Payload::new(KeyList::from_keys(["c".to_string()])),
            }],
            &IndexSet::new(),
        );
        commit(&mut store, outcome);
        assert!(store.slot(&instance).is_none());
        assert!(!store.instance_exists(&instance));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
