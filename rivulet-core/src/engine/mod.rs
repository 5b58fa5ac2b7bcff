//! Engine
//!
//! The live instance: committed state, the single-writer recompute pass,
//! and the notification pipeline, behind one public facade.
//!
//! # How a Transaction Flows
//!
//! 1. `set_inputs` (or a key-edit convenience) takes the writer lock, so
//!    passes are strictly serial per engine.
//!
//! 2. The batch is validated and resolved against the committed store;
//!    any invalid entry rejects the whole batch before anything changes.
//!
//! 3. The pass walks the dirty region and buffers writes (see
//!    [`pass`](self) internals), then commits them and the clock bump in
//!    one exclusive store acquisition. Readers never observe a half-applied
//!    pass.
//!
//! 4. Changed-node events are enqueued to the dispatcher thread under the
//!    registration fence and delivered to listeners off the writer's
//!    critical path.
//!
//! # Locking
//!
//! Lock order is topology, writer, pending, fence, store. Every path
//! acquires along that order (skipping is fine) and no collaborator
//! callback ever runs under an engine lock: compute functions run during
//! the walk but only receive borrowed payloads, and listener callbacks run
//! on the dispatcher thread with no lock held.

mod dispatch;
mod keyed;
mod listener;
mod pass;
mod store;

pub use dispatch::NodeEvent;
pub use listener::ListenerHandle;

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::thread;

use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::debug;

use crate::engine::dispatch::{DispatchMessage, EventDispatcher};
use crate::engine::listener::ListenerRegistry;
use crate::engine::pass::InputChange;
use crate::engine::store::Store;
use crate::error::EngineError;
use crate::graph::{
    CatchFn, ComputeFn, DeclaredType, EngineId, EqualityFn, GroupDep, GroupRecord, KeyedDep,
    KeyedGroupRef, NodeKind, NodeRecord, NodeRef, Target, TopoEntry, Topology,
};
use crate::value::{Inputs, Key, KeyList, NodeFailure, Payload, Timestamp, ValueSlot};

/// An incremental, dependency-tracked computation engine.
///
/// Engines are self-contained: any number can coexist, and node references
/// from one are rejected by the others. An `Engine` is `Send + Sync`;
/// share it behind an `Arc` to declare, read, and write from multiple
/// threads.
pub struct Engine {
    id: EngineId,
    topology: RwLock<Topology>,
    store: RwLock<Store>,
    /// Serializes recompute passes.
    writer: Mutex<()>,
    /// Nodes and groups declared since the last pass; they compute on the
    /// next pass regardless of input changes.
    pending: Mutex<IndexSet<TopoEntry>>,
    /// Next batch sequence number. Held while committing and enqueueing,
    /// and while registering a listener, so a listener's catch-up event
    /// and the batches it will receive never overlap or leave a gap.
    fence: Mutex<u64>,
    registry: Arc<ListenerRegistry>,
    dispatcher: EventDispatcher,
}

impl Engine {
    /// A fresh engine with an empty topology, clock at zero, and its own
    /// dispatcher thread.
    pub fn new() -> Self {
        let registry = Arc::new(ListenerRegistry::new());
        Engine {
            id: EngineId::new(),
            topology: RwLock::new(Topology::new()),
            store: RwLock::new(Store::new()),
            writer: Mutex::new(()),
            pending: Mutex::new(IndexSet::new()),
            fence: Mutex::new(0),
            dispatcher: EventDispatcher::spawn(registry.clone()),
            registry,
        }
    }

    // ---- declarations ----

    /// Declare a raw input holding values of type `T`.
    ///
    /// The input starts with no value; `T`'s `PartialEq` decides whether a
    /// later write actually changes it.
    pub fn declare_input<T>(&self, name: &str) -> Result<NodeRef, EngineError>
    where
        T: Any + PartialEq + Send + Sync,
    {
        let record = NodeRecord {
            name: name.to_string(),
            kind: NodeKind::Input,
            deps: SmallVec::new(),
            compute: None,
            catch: None,
            equals: equality_of::<T>(),
            payload_type: DeclaredType::of::<T>(),
            key_type: None,
        };
        let id = self.topology.write().declare_node(record)?;
        Ok(self.node_ref(Target::Node(id)))
    }

    /// Declare a computed node over already-declared dependencies.
    ///
    /// `compute` receives the dependency values in `deps` order and runs
    /// whenever one of them changes value. Equal results (by `T`'s
    /// `PartialEq`) are discarded, cutting the change wave.
    ///
    /// Any readable address works as a dependency: named nodes, key lists,
    /// a group's full output, or a pinned keyed instance (see
    /// [`KeyedGroupRef::instance`] for the latter's absence semantics).
    pub fn declare_computed<T, F>(
        &self,
        name: &str,
        deps: &[NodeRef],
        compute: F,
    ) -> Result<NodeRef, EngineError>
    where
        T: Any + PartialEq + Send + Sync,
        F: Fn(&Inputs<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.declare_computed_inner(
            name,
            deps,
            NodeKind::Computed,
            wrap_compute(compute),
            None,
            equality_of::<T>(),
            DeclaredType::of::<T>(),
            None,
        )
    }

    /// Declare an error-tolerant computed node.
    ///
    /// When a direct dependency is failed, `catch` receives the merged
    /// upstream failure instead of the node failing through; it may
    /// produce a replacement value or fail itself.
    pub fn declare_computed_catching<T, F, C>(
        &self,
        name: &str,
        deps: &[NodeRef],
        compute: F,
        catch: C,
    ) -> Result<NodeRef, EngineError>
    where
        T: Any + PartialEq + Send + Sync,
        F: Fn(&Inputs<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
        C: Fn(&NodeFailure) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.declare_computed_inner(
            name,
            deps,
            NodeKind::Computed,
            wrap_compute(compute),
            Some(wrap_catch(catch)),
            equality_of::<T>(),
            DeclaredType::of::<T>(),
            None,
        )
    }

    /// Declare a computed node with an explicit equality, for payloads
    /// whose semantic equality differs from `PartialEq` (or that have
    /// none).
    pub fn declare_computed_with_equality<T, F, E>(
        &self,
        name: &str,
        deps: &[NodeRef],
        compute: F,
        equals: E,
    ) -> Result<NodeRef, EngineError>
    where
        T: Any + Send + Sync,
        F: Fn(&Inputs<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.declare_computed_inner(
            name,
            deps,
            NodeKind::Computed,
            wrap_compute(compute),
            None,
            equality_from(equals),
            DeclaredType::of::<T>(),
            None,
        )
    }

    /// Declare a key-list input with keys of type `K`.
    ///
    /// The list starts committed as the empty list at timestamp zero, so
    /// it (and anything keyed over it) is readable before any transaction.
    pub fn declare_key_list<K>(&self, name: &str) -> Result<NodeRef, EngineError>
    where
        K: Any + Eq + Hash + fmt::Debug + Send + Sync,
    {
        let record = NodeRecord {
            name: name.to_string(),
            kind: NodeKind::KeyListInput,
            deps: SmallVec::new(),
            compute: None,
            catch: None,
            equals: equality_of::<KeyList>(),
            payload_type: DeclaredType::of::<KeyList>(),
            key_type: Some(DeclaredType::of::<K>()),
        };
        let mut topology = self.topology.write();
        let id = topology.declare_node(record)?;
        self.store.write().seed_key_list(id);
        Ok(self.node_ref(Target::Node(id)))
    }

    /// Declare a computed key list: a node whose compute function derives
    /// the keys of type `K` from its dependencies, driving keyed groups
    /// exactly as an input key list does.
    pub fn declare_key_list_computed<K, F>(
        &self,
        name: &str,
        deps: &[NodeRef],
        compute: F,
    ) -> Result<NodeRef, EngineError>
    where
        K: Any + Eq + Hash + fmt::Debug + Send + Sync,
        F: Fn(&Inputs<'_>) -> anyhow::Result<Vec<K>> + Send + Sync + 'static,
    {
        self.declare_computed_inner(
            name,
            deps,
            NodeKind::KeyListComputed,
            Arc::new(move |inputs: &Inputs<'_>| {
                compute(inputs).map(|keys| Payload::new(KeyList::from_keys(keys)))
            }),
            None,
            equality_of::<KeyList>(),
            DeclaredType::of::<KeyList>(),
            Some(DeclaredType::of::<K>()),
        )
    }

    /// Declare a keyed group: one computed instance per key of `key_list`.
    ///
    /// `deps` may mix static nodes (shared by every instance) and same-key
    /// outputs of earlier groups driven by the same key list. `compute`
    /// receives the dependency values plus the instance's key via
    /// [`Inputs::key`].
    pub fn declare_keyed_group<T, F>(
        &self,
        name: &str,
        key_list: &NodeRef,
        deps: &[KeyedDep],
        compute: F,
    ) -> Result<KeyedGroupRef, EngineError>
    where
        T: Any + PartialEq + Send + Sync,
        F: Fn(&Inputs<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.declare_group_inner(
            name,
            key_list,
            deps,
            wrap_compute(compute),
            None,
            equality_of::<T>(),
        )
    }

    /// Error-tolerant variant of [`declare_keyed_group`](Self::declare_keyed_group).
    pub fn declare_keyed_group_catching<T, F, C>(
        &self,
        name: &str,
        key_list: &NodeRef,
        deps: &[KeyedDep],
        compute: F,
        catch: C,
    ) -> Result<KeyedGroupRef, EngineError>
    where
        T: Any + PartialEq + Send + Sync,
        F: Fn(&Inputs<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
        C: Fn(&NodeFailure) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.declare_group_inner(
            name,
            key_list,
            deps,
            wrap_compute(compute),
            Some(wrap_catch(catch)),
            equality_of::<T>(),
        )
    }

    // ---- transactions ----

    /// Apply a batch of input writes as one transaction and run one
    /// recompute pass.
    ///
    /// The batch applies in order (a later entry for the same node sees
    /// the earlier one's effect) and is validated as a whole: any invalid
    /// entry rejects the entire batch with no visible change. An empty
    /// batch is valid and computes exactly the nodes declared since the
    /// last pass.
    pub fn set_inputs(&self, batch: Vec<(NodeRef, Payload)>) -> Result<(), EngineError> {
        self.run_pass(
            batch
                .into_iter()
                .map(|(node, payload)| (node, InputChange::Set(payload)))
                .collect(),
        )
    }

    /// Set one input. Equivalent to a single-entry [`set_inputs`](Self::set_inputs).
    pub fn set_input(&self, node: &NodeRef, payload: Payload) -> Result<(), EngineError> {
        self.run_pass(vec![(node.clone(), InputChange::Set(payload))])
    }

    /// Append one key to a key-list input; a no-op pass if already present.
    pub fn add_key<K>(&self, node: &NodeRef, key: K) -> Result<(), EngineError>
    where
        K: Any + Eq + Hash + fmt::Debug + Send + Sync,
    {
        self.run_pass(vec![(node.clone(), InputChange::AddKey(Key::new(key)))])
    }

    /// Remove one key from a key-list input; a no-op pass if absent. The
    /// key forfeits its position: re-adding it appends at the end.
    pub fn remove_key<K>(&self, node: &NodeRef, key: K) -> Result<(), EngineError>
    where
        K: Any + Eq + Hash + fmt::Debug + Send + Sync,
    {
        self.run_pass(vec![(node.clone(), InputChange::RemoveKey(Key::new(key)))])
    }

    // ---- reads ----

    /// The committed slot of a node: unset, a value, or a failure, with
    /// the timestamp of the pass that produced it.
    ///
    /// Never computes anything and never waits on a pass beyond the
    /// commit's own critical section.
    pub fn read(&self, node: &NodeRef) -> Result<ValueSlot, EngineError> {
        self.check_engine(node)?;
        let topology = self.topology.read();
        let store = self.store.read();
        match &node.target {
            Target::Instance(..) => {
                if let Some(slot) = store.slot(&node.target) {
                    Ok(slot.clone())
                } else if store.instance_exists(&node.target) {
                    Ok(ValueSlot::Unset)
                } else {
                    Err(EngineError::UnknownNode {
                        name: topology.label(&node.target),
                    })
                }
            }
            _ => Ok(store.lookup(&node.target)),
        }
    }

    /// The committed value as a concrete `T`.
    ///
    /// Surfaces the slot states as errors: `NotReady` for unset,
    /// `ComputeFailure` when the node's own compute (or catch) function
    /// failed, `PropagatedFailure` when it was skipped by upstream
    /// failures.
    pub fn get_value<T>(&self, node: &NodeRef) -> Result<T, EngineError>
    where
        T: Any + Clone,
    {
        let slot = self.read(node)?;
        match slot {
            ValueSlot::Unset => Err(EngineError::NotReady {
                name: self.label_of(node),
            }),
            ValueSlot::Failed { failure, .. } => {
                let name = self.label_of(node);
                if failure.primary().node == name {
                    Err(EngineError::ComputeFailure { name, failure })
                } else {
                    Err(EngineError::PropagatedFailure { name, failure })
                }
            }
            ValueSlot::Ok { value, .. } => {
                value
                    .extract::<T>()
                    .ok_or_else(|| EngineError::PayloadType {
                        node: self.label_of(node),
                        expected: std::any::type_name::<T>(),
                        found: value.type_name(),
                    })
            }
        }
    }

    /// The timestamp of the last pass that changed anything; zero before
    /// the first change.
    pub fn current_timestamp(&self) -> Timestamp {
        self.store.read().now()
    }

    /// Human-readable rendering of the declared graph, for debugging.
    pub fn describe_topology(&self) -> String {
        self.topology.read().describe()
    }

    // ---- listeners ----

    /// Register a callback for every change of one node.
    ///
    /// If the node currently holds a value or failure, the callback first
    /// receives one catch-up event carrying it with
    /// [`Timestamp::CATCH_UP`]; after that it sees exactly the events of
    /// passes that change the node, in pass order. Callbacks run on the
    /// engine's dispatcher thread with no engine lock held, so they may
    /// freely read, write, subscribe, and unsubscribe.
    ///
    /// Subscribing to a keyed instance whose key does not exist yet is
    /// valid: events start arriving if and when the key does.
    pub fn subscribe<F>(&self, node: &NodeRef, callback: F) -> Result<ListenerHandle, EngineError>
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        self.check_engine(node)?;
        let fence = self.fence.lock();
        let min_seq = *fence;
        let store = self.store.read();
        let snapshot = store.lookup(&node.target);
        let id = self
            .registry
            .register(node.target.clone(), Box::new(callback), min_seq);
        let value = match snapshot {
            ValueSlot::Ok { value, .. } => Some(Ok(value)),
            ValueSlot::Failed { failure, .. } => Some(Err(failure)),
            ValueSlot::Unset => None,
        };
        if let Some(value) = value {
            self.dispatcher.send(DispatchMessage::CatchUp {
                listener: id,
                event: NodeEvent {
                    node: node.clone(),
                    value,
                    timestamp: Timestamp::CATCH_UP,
                },
            });
        }
        drop(store);
        drop(fence);
        Ok(ListenerHandle {
            engine: self.id,
            id,
        })
    }

    /// Stop deliveries to one listener. Idempotent.
    ///
    /// When called from outside the dispatcher thread, waits out a
    /// delivery already in flight, so no callback invocation survives the
    /// return. From inside a callback it returns immediately; the current
    /// delivery is by definition the last.
    pub fn unsubscribe(&self, handle: ListenerHandle) {
        if handle.engine != self.id {
            return;
        }
        if let Some(entry) = self.registry.remove(handle.id) {
            if thread::current().id() != self.dispatcher.thread_id() {
                entry.wait_out_delivery();
            }
        }
    }

    // ---- internals ----

    fn run_pass(&self, batch: Vec<(NodeRef, InputChange)>) -> Result<(), EngineError> {
        let topology = self.topology.read();
        let _writer = self.writer.lock();
        let pending_snapshot: IndexSet<TopoEntry> = self.pending.lock().clone();

        let outcome = {
            let store = self.store.read();
            let inputs = pass::resolve_batch(&topology, &store, self.id, batch)?;
            pass::execute(&topology, &store, inputs, &pending_snapshot)
        };

        if !pending_snapshot.is_empty() {
            self.pending
                .lock()
                .retain(|entry| !pending_snapshot.contains(entry));
        }
        if outcome.delta.is_empty() {
            return Ok(());
        }

        let mut events = Vec::with_capacity(outcome.changed.len());
        for target in &outcome.changed {
            let node = NodeRef {
                engine: self.id,
                target: target.clone(),
            };
            match outcome.delta.writes.get(target) {
                Some(ValueSlot::Ok { value, timestamp }) => events.push(NodeEvent {
                    node,
                    value: Ok(value.clone()),
                    timestamp: *timestamp,
                }),
                Some(ValueSlot::Failed { failure, timestamp }) => events.push(NodeEvent {
                    node,
                    value: Err(failure.clone()),
                    timestamp: *timestamp,
                }),
                _ => {}
            }
        }
        let removed = outcome.delta.removals.clone();

        {
            let mut fence = self.fence.lock();
            let seq = *fence;
            if !events.is_empty() {
                *fence += 1;
            }
            self.store.write().apply(outcome.delta, outcome.clock);
            if !events.is_empty() {
                debug!(seq, events = events.len(), "pass committed, enqueueing events");
                self.dispatcher.send(DispatchMessage::Batch { seq, events });
            }
            // Listeners bound to destroyed instances go with them. Under
            // the fence, so a subscription made after this commit is a
            // fresh ahead-of-key registration and survives.
            for target in &removed {
                self.registry.remove_target(target);
            }
        }
        Ok(())
    }

    fn declare_computed_inner(
        &self,
        name: &str,
        deps: &[NodeRef],
        kind: NodeKind,
        compute: ComputeFn,
        catch: Option<CatchFn>,
        equals: EqualityFn,
        payload_type: DeclaredType,
        key_type: Option<DeclaredType>,
    ) -> Result<NodeRef, EngineError> {
        let targets = self.dep_targets(deps)?;
        let record = NodeRecord {
            name: name.to_string(),
            kind,
            deps: targets,
            compute: Some(compute),
            catch,
            equals,
            payload_type,
            key_type,
        };
        let id = self.topology.write().declare_node(record)?;
        self.pending.lock().insert(TopoEntry::Node(id));
        Ok(self.node_ref(Target::Node(id)))
    }

    fn declare_group_inner(
        &self,
        name: &str,
        key_list: &NodeRef,
        deps: &[KeyedDep],
        compute: ComputeFn,
        catch: Option<CatchFn>,
        equals: EqualityFn,
    ) -> Result<KeyedGroupRef, EngineError> {
        self.check_engine(key_list)?;
        let key_list_id = match key_list.target {
            Target::Node(id) => id,
            ref other => {
                return Err(EngineError::NotAKeyList {
                    name: self.topology.read().label(other),
                })
            }
        };
        let mut group_deps: SmallVec<[GroupDep; 4]> = SmallVec::with_capacity(deps.len());
        for dep in deps {
            group_deps.push(match dep {
                KeyedDep::Node(node) => {
                    self.check_engine(node)?;
                    GroupDep::Static(node.target.clone())
                }
                KeyedDep::SameKey(group) => {
                    if group.engine != self.id {
                        return Err(EngineError::UnknownNode {
                            name: format!("{group:?} (declared by a different engine)"),
                        });
                    }
                    GroupDep::SameKey(group.group)
                }
            });
        }
        let record = GroupRecord {
            name: name.to_string(),
            key_list: key_list_id,
            deps: group_deps,
            compute,
            catch,
            equals,
        };
        let id = self.topology.write().declare_group(record)?;
        self.pending.lock().insert(TopoEntry::Group(id));
        Ok(KeyedGroupRef {
            engine: self.id,
            group: id,
        })
    }

    fn check_engine(&self, node: &NodeRef) -> Result<(), EngineError> {
        if node.engine == self.id {
            Ok(())
        } else {
            Err(EngineError::UnknownNode {
                name: format!("{node:?} (declared by a different engine)"),
            })
        }
    }

    fn dep_targets(&self, deps: &[NodeRef]) -> Result<SmallVec<[Target; 4]>, EngineError> {
        let mut targets = SmallVec::with_capacity(deps.len());
        for dep in deps {
            self.check_engine(dep)?;
            targets.push(dep.target.clone());
        }
        Ok(targets)
    }

    fn node_ref(&self, target: Target) -> NodeRef {
        NodeRef {
            engine: self.id,
            target,
        }
    }

    fn label_of(&self, node: &NodeRef) -> String {
        self.topology.read().label(&node.target)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn equality_of<T: Any + PartialEq>() -> EqualityFn {
    Arc::new(|a: &Payload, b: &Payload| a.downcast_ref::<T>() == b.downcast_ref::<T>())
}

fn equality_from<T, E>(equals: E) -> EqualityFn
where
    T: Any,
    E: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    Arc::new(
        move |a: &Payload, b: &Payload| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => equals(a, b),
            _ => false,
        },
    )
}

fn wrap_compute<T, F>(compute: F) -> ComputeFn
where
    T: Any + Send + Sync,
    F: Fn(&Inputs<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
{
    Arc::new(move |inputs: &Inputs<'_>| compute(inputs).map(Payload::new))
}

fn wrap_catch<T, C>(catch: C) -> CatchFn
where
    T: Any + Send + Sync,
    C: Fn(&NodeFailure) -> anyhow::Result<T> + Send + Sync + 'static,
{
    Arc::new(move |failure: &NodeFailure| catch(failure).map(Payload::new))
}
