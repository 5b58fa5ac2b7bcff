//! Dependency Graph
//!
//! This module holds the static shape of an engine: node and group
//! declarations, their typed records, and the topology that orders them.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are raw inputs, key lists, or computed values
//! - Keyed groups are node families stamped out per key of a key list
//! - Edges run from a dependency to its dependents
//!
//! The graph never changes during a recompute pass. Keyed instances come
//! and go as keys do, but they are value-store slots addressed through
//! their group; the group itself is a single topology entry.
//!
//! # Design Decisions
//!
//! 1. Declarations are append-only and dependency-first. There is no way
//!    to reference a node that does not exist yet, so cycles are ruled
//!    out structurally and Kahn's algorithm acts as an invariant check.
//!
//! 2. Declaration order is reused as the topological order: a pass walks
//!    the entry list front to back and every dependency is settled before
//!    any dependent looks at it.
//!
//! 3. Records carry their compute, equality, and catch closures directly,
//!    so the walk needs no secondary registry.

mod node;
mod topology;

pub use node::{EngineId, GroupId, KeyedDep, KeyedGroupRef, NodeId, NodeKind, NodeRef};

pub(crate) use node::{
    CatchFn, ComputeFn, DeclaredType, EqualityFn, GroupDep, GroupRecord, NodeRecord, Target,
};
pub(crate) use topology::{TopoEntry, Topology};
