//! Engine Errors
//!
//! Every failure the public API can report. Compute-function errors are a
//! different animal: collaborators return `anyhow::Result` from their
//! compute functions, and those errors live inside `Failed` value slots
//! (see [`crate::value::NodeFailure`]), surfacing here only through the
//! typed getters.

use thiserror::Error;

use crate::value::NodeFailure;

/// Errors surfaced by the engine's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A declaration would create a dependency cycle. Declaration order is
    /// dependency-first, so this indicates a broken internal invariant more
    /// than a plausible caller mistake; the graph is left unchanged.
    #[error("declaring `{name}` would create a dependency cycle")]
    CyclicDependency { name: String },

    /// The target does not exist in this engine: never declared, declared
    /// by a different engine, or a keyed instance whose key was removed.
    #[error("unknown node `{name}`")]
    UnknownNode { name: String },

    /// A node with this name was already declared.
    #[error("a node named `{name}` already exists")]
    DuplicateName { name: String },

    /// A transaction targeted a node that is not an input.
    #[error("node `{name}` is not an input")]
    NotAnInput { name: String },

    /// A keyed operation targeted a node that is not a key list.
    #[error("node `{name}` is not a key list")]
    NotAKeyList { name: String },

    /// The supplied payload's type does not match the node's declared
    /// payload type.
    #[error("payload for `{node}` must be `{expected}`, got `{found}`")]
    PayloadType {
        node: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A key list entry's type does not match the list's declared key type.
    #[error("key {key} for `{node}` must be `{expected}`, got `{found}`")]
    KeyType {
        node: String,
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A same-key dependency is driven by a different key list than the
    /// group declaring it.
    #[error("keyed dependency `{dep}` is driven by a different key list than `{group}`")]
    KeyListMismatch { group: String, dep: String },

    /// The node has no value yet.
    #[error("node `{name}` has not been computed yet")]
    NotReady { name: String },

    /// The node's own compute function failed.
    #[error("node `{name}` failed: {failure}")]
    ComputeFailure { name: String, failure: NodeFailure },

    /// The node was skipped because an upstream node failed.
    #[error("node `{name}` skipped by upstream failure: {failure}")]
    PropagatedFailure { name: String, failure: NodeFailure },
}
