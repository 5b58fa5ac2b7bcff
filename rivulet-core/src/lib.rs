//! Rivulet Core
//!
//! An incremental, dependency-tracked computation engine: the substrate for
//! compilers, language servers, and other tooling that recomputes derived
//! state from slowly-changing inputs.
//!
//! Collaborators declare a graph of raw inputs and computed nodes, write
//! inputs in atomic transactions, and read or subscribe to any node. The
//! engine recomputes only what a change can actually reach, cutting the wave
//! wherever a recomputed value equals the old one.
//!
//! - **Minimal recomputation**: per-node value equality stops change
//!   propagation as early as possible, and unchanged nodes keep the
//!   timestamp of the pass that last changed them.
//! - **Keyed groups**: one computed instance per key of a dynamic key list,
//!   for per-file pipelines whose file set changes at runtime.
//! - **Failures as values**: a compute error parks in the node's slot and
//!   flows to dependents with its origin attached, instead of unwinding the
//!   pass.
//! - **Single writer, concurrent readers**: transactions serialize, reads
//!   never block behind a recompute, and listener callbacks run on a
//!   dedicated dispatcher thread.
//!
//! # Architecture
//!
//! - [`value`]: timestamps, type-erased payloads and keys, value slots.
//! - [`graph`]: node and group declaration records and the static topology.
//! - [`engine`]: the committed store, the recompute pass, and notification
//!   dispatch behind the [`Engine`] facade.
//! - [`error`]: everything the public API can report.
//!
//! # Example
//!
//! ```rust
//! use rivulet_core::{Engine, Payload};
//!
//! let engine = Engine::new();
//! let source = engine.declare_input::<String>("source")?;
//! let length = engine.declare_computed::<usize, _>("length", &[source.clone()], |inputs| {
//!     Ok(inputs.get::<String>(0)?.chars().count())
//! })?;
//!
//! engine.set_input(&source, Payload::new("fn main() {}".to_string()))?;
//! assert_eq!(engine.get_value::<usize>(&length)?, 12);
//! # Ok::<(), rivulet_core::EngineError>(())
//! ```

pub mod engine;
pub mod error;
pub mod graph;
pub mod value;

pub use engine::{Engine, ListenerHandle, NodeEvent};
pub use error::EngineError;
pub use graph::{KeyedDep, KeyedGroupRef, NodeRef};
pub use value::{
    FailureSource, Inputs, Key, KeyList, KeyedValues, NodeFailure, Payload, Timestamp, ValueSlot,
};
