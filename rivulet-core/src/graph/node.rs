//! Graph Nodes
//!
//! Identifiers, addresses, and declaration records for nodes in the
//! dependency graph.
//!
//! Named nodes (inputs, computed nodes, key lists) get a [`NodeId`], an
//! index into the engine's declaration table. Keyed instances have no table
//! entry of their own: they are addressed logically as `(group, key)` pairs,
//! which is what lets a listener subscribe to an instance before its key
//! exists and lets the address outlive the instance. [`Target`] is that
//! logical address; [`NodeRef`] is a target stamped with the minting
//! engine's id, so refs cannot cross engines.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::value::{Inputs, Key, NodeFailure, Payload};

/// Counter for generating unique engine IDs.
static ENGINE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifies one engine instance. Refs minted by one engine are rejected
/// by every other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId(u64);

impl EngineId {
    /// Generate a new unique engine ID.
    pub(crate) fn new() -> Self {
        EngineId(ENGINE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Index of a named node in its engine's declaration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

/// Index of a keyed group in its engine's declaration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) u32);

/// What a named node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Mutated from outside via transactions; no dependencies.
    Input,

    /// An input whose payload is a [`crate::value::KeyList`]. Starts
    /// committed as the empty list rather than unset.
    KeyListInput,

    /// A pure function of its dependencies.
    Computed,

    /// A computed node whose payload is a [`crate::value::KeyList`]; may
    /// drive keyed groups exactly like a key-list input.
    KeyListComputed,
}

impl NodeKind {
    /// Whether transactions may target this node.
    pub fn is_input(self) -> bool {
        matches!(self, NodeKind::Input | NodeKind::KeyListInput)
    }

    /// Whether the node's payload is a key list.
    pub fn is_key_list(self) -> bool {
        matches!(self, NodeKind::KeyListInput | NodeKind::KeyListComputed)
    }
}

/// A logical address inside one engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Target {
    /// A named node.
    Node(NodeId),
    /// One instance of a keyed group. Exists only while its key is in the
    /// group's key list.
    Instance(GroupId, Key),
    /// A group's full output: all instance values in key order.
    FullOutput(GroupId),
}

/// A reference to a readable, subscribable value in a specific engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub(crate) engine: EngineId,
    pub(crate) target: Target,
}

/// A reference to a keyed group in a specific engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyedGroupRef {
    pub(crate) engine: EngineId,
    pub(crate) group: GroupId,
}

impl KeyedGroupRef {
    /// Address of this group's instance for `key`.
    ///
    /// The address is valid for subscription even before the key exists
    /// and stays stable across the key disappearing and reappearing; reads
    /// require the key to currently be in the driving key list.
    ///
    /// It may also be declared as a dependency of a computed node, pinning
    /// that node to this one key. While the key is absent the instance has
    /// no value, so the dependent skips recomputes and keeps its last
    /// committed value; it catches up when the key returns.
    pub fn instance<K>(&self, key: K) -> NodeRef
    where
        K: Any + Eq + Hash + fmt::Debug + Send + Sync,
    {
        NodeRef {
            engine: self.engine,
            target: Target::Instance(self.group, Key::new(key)),
        }
    }

    /// Address of this group's full output.
    pub fn full_output(&self) -> NodeRef {
        NodeRef {
            engine: self.engine,
            target: Target::FullOutput(self.group),
        }
    }
}

/// One declared dependency of a keyed group.
#[derive(Debug, Clone)]
pub enum KeyedDep {
    /// A static node, shared by every instance.
    Node(NodeRef),
    /// The same-key instance of another group. Both groups must be driven
    /// by the same key-list node.
    SameKey(KeyedGroupRef),
}

/// Compute function stored on a node: declared dependency values in, one
/// payload out.
pub(crate) type ComputeFn = Arc<dyn Fn(&Inputs<'_>) -> anyhow::Result<Payload> + Send + Sync>;

/// Equality capability captured at declaration time, used for value-based
/// cutoff.
pub(crate) type EqualityFn = Arc<dyn Fn(&Payload, &Payload) -> bool + Send + Sync>;

/// Catch function of an error-tolerant node: merged upstream failure in,
/// replacement payload out.
pub(crate) type CatchFn = Arc<dyn Fn(&NodeFailure) -> anyhow::Result<Payload> + Send + Sync>;

/// Declared payload or key type, kept for transaction validation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeclaredType {
    pub(crate) id: TypeId,
    pub(crate) name: &'static str,
}

impl DeclaredType {
    pub(crate) fn of<T: 'static>() -> Self {
        DeclaredType {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub(crate) fn matches(&self, payload: &Payload) -> bool {
        self.id == payload.inner_type_id()
    }

    pub(crate) fn matches_key(&self, key: &crate::value::Key) -> bool {
        self.id == key.inner_type_id()
    }
}

/// Declaration record for a named node.
pub(crate) struct NodeRecord {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    /// Dependencies in declared order; empty for inputs.
    pub(crate) deps: SmallVec<[Target; 4]>,
    /// Absent for inputs.
    pub(crate) compute: Option<ComputeFn>,
    /// Present only for error-tolerant nodes.
    pub(crate) catch: Option<CatchFn>,
    pub(crate) equals: EqualityFn,
    /// Declared payload type; `KeyList` for key-list nodes.
    pub(crate) payload_type: DeclaredType,
    /// Declared key type, for key-list nodes only.
    pub(crate) key_type: Option<DeclaredType>,
}

/// One dependency of a keyed group, resolved to table indices.
#[derive(Debug, Clone)]
pub(crate) enum GroupDep {
    /// A fixed target shared by every instance.
    Static(Target),
    /// The same-key instance of an earlier group.
    SameKey(GroupId),
}

/// Declaration record for a keyed group.
pub(crate) struct GroupRecord {
    pub(crate) name: String,
    /// The key-list node whose membership drives the instances.
    pub(crate) key_list: NodeId,
    /// Per-instance dependencies in declared order; the key itself is
    /// passed to the compute function separately.
    pub(crate) deps: SmallVec<[GroupDep; 4]>,
    pub(crate) compute: ComputeFn,
    pub(crate) catch: Option<CatchFn>,
    pub(crate) equals: EqualityFn,
}
